// Copyright 2025 Assistance Micro Design
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Task classification and model routing.
//!
//! Classification is keyword-based over a closed category set; the routing
//! table maps each category to a provider/model pair with fallbacks.

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Closed set of task categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskCategory {
    SimpleQuery,
    CodeGeneration,
    CodeReview,
    Research,
    Creative,
    Analysis,
    General,
}

impl std::fmt::Display for TaskCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            TaskCategory::SimpleQuery => "simple_query",
            TaskCategory::CodeGeneration => "code_generation",
            TaskCategory::CodeReview => "code_review",
            TaskCategory::Research => "research",
            TaskCategory::Creative => "creative",
            TaskCategory::Analysis => "analysis",
            TaskCategory::General => "general",
        };
        write!(f, "{}", name)
    }
}

/// A provider/model pair with ordered fallbacks.
#[derive(Debug, Clone)]
pub struct ModelRoute {
    pub provider: &'static str,
    pub model: &'static str,
    pub fallbacks: &'static [(&'static str, &'static str)],
}

static ROUTING_TABLE: Lazy<HashMap<TaskCategory, ModelRoute>> = Lazy::new(|| {
    const SMALL_FALLBACKS: &[(&str, &str)] = &[("ollama", "llama3"), ("demo", "demo")];
    const LARGE_FALLBACKS: &[(&str, &str)] = &[
        ("mistral", "mistral-small-latest"),
        ("ollama", "llama3"),
        ("demo", "demo"),
    ];

    HashMap::from([
        (
            TaskCategory::SimpleQuery,
            ModelRoute {
                provider: "mistral",
                model: "mistral-small-latest",
                fallbacks: SMALL_FALLBACKS,
            },
        ),
        (
            TaskCategory::CodeGeneration,
            ModelRoute {
                provider: "mistral",
                model: "codestral-latest",
                fallbacks: LARGE_FALLBACKS,
            },
        ),
        (
            TaskCategory::CodeReview,
            ModelRoute {
                provider: "mistral",
                model: "codestral-latest",
                fallbacks: LARGE_FALLBACKS,
            },
        ),
        (
            TaskCategory::Research,
            ModelRoute {
                provider: "mistral",
                model: "mistral-large-latest",
                fallbacks: LARGE_FALLBACKS,
            },
        ),
        (
            TaskCategory::Creative,
            ModelRoute {
                provider: "mistral",
                model: "mistral-large-latest",
                fallbacks: LARGE_FALLBACKS,
            },
        ),
        (
            TaskCategory::Analysis,
            ModelRoute {
                provider: "mistral",
                model: "mistral-large-latest",
                fallbacks: LARGE_FALLBACKS,
            },
        ),
        (
            TaskCategory::General,
            ModelRoute {
                provider: "mistral",
                model: "mistral-small-latest",
                fallbacks: SMALL_FALLBACKS,
            },
        ),
    ])
});

/// Classifies a task by keyword; `general` when nothing matches.
pub fn classify(task: &str) -> TaskCategory {
    let lower = task.to_lowercase();
    let has = |words: &[&str]| words.iter().any(|w| lower.contains(w));

    if has(&["review", "critique", "audit the code", "check this code"]) {
        TaskCategory::CodeReview
    } else if has(&["write code", "implement", "refactor", "function", "script", "program", "fix the bug", "code"]) {
        TaskCategory::CodeGeneration
    } else if has(&["research", "investigate", "find out", "look up", "sources"]) {
        TaskCategory::Research
    } else if has(&["poem", "story", "creative", "brainstorm", "imagine"]) {
        TaskCategory::Creative
    } else if has(&["analyze", "analyse", "compare", "summarize", "summarise", "evaluate"]) {
        TaskCategory::Analysis
    } else if has(&["what is", "what's", "who is", "when", "where", "how many", "define"]) {
        TaskCategory::SimpleQuery
    } else {
        TaskCategory::General
    }
}

/// The route for a category.
pub fn route_for(category: TaskCategory) -> &'static ModelRoute {
    ROUTING_TABLE
        .get(&category)
        .unwrap_or_else(|| &ROUTING_TABLE[&TaskCategory::General])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_code_generation() {
        assert_eq!(
            classify("Implement a parser for CSV files"),
            TaskCategory::CodeGeneration
        );
        assert_eq!(
            classify("Refactor the session module"),
            TaskCategory::CodeGeneration
        );
    }

    #[test]
    fn test_classify_code_review() {
        assert_eq!(
            classify("Review this pull request for bugs"),
            TaskCategory::CodeReview
        );
    }

    #[test]
    fn test_classify_simple_query() {
        assert_eq!(classify("What is the capital of France?"), TaskCategory::SimpleQuery);
    }

    #[test]
    fn test_classify_research() {
        assert_eq!(
            classify("Research recent papers on retrieval"),
            TaskCategory::Research
        );
    }

    #[test]
    fn test_classify_creative() {
        assert_eq!(classify("Write a poem about autumn"), TaskCategory::Creative);
    }

    #[test]
    fn test_classify_analysis() {
        assert_eq!(
            classify("Compare these two benchmark runs"),
            TaskCategory::Analysis
        );
    }

    #[test]
    fn test_classify_default_general() {
        assert_eq!(classify("Echo hello"), TaskCategory::General);
    }

    #[test]
    fn test_every_category_has_a_route() {
        for category in [
            TaskCategory::SimpleQuery,
            TaskCategory::CodeGeneration,
            TaskCategory::CodeReview,
            TaskCategory::Research,
            TaskCategory::Creative,
            TaskCategory::Analysis,
            TaskCategory::General,
        ] {
            let route = route_for(category);
            assert!(!route.model.is_empty());
            assert!(!route.fallbacks.is_empty(), "route needs fallbacks");
            // Demo is always the last resort
            assert_eq!(route.fallbacks.last().unwrap().0, "demo");
        }
    }
}
