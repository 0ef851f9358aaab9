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

//! Plan and step models.
//!
//! A plan is produced once by the planner and is immutable afterwards except
//! for per-step status transitions driven by the executor.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use uuid::Uuid;

/// Tool name used by the single-step fallback plan.
pub const FALLBACK_TOOL: &str = "chat";

/// Risk tier of a step or tool action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RiskTier {
    /// No side effects; auto-approved
    Safe,
    /// Side effects possible; prompt (batchable / similarity-cacheable)
    #[default]
    Moderate,
    /// Irreversible side effects; always prompts individually
    Destructive,
}

impl std::fmt::Display for RiskTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RiskTier::Safe => write!(f, "safe"),
            RiskTier::Moderate => write!(f, "moderate"),
            RiskTier::Destructive => write!(f, "destructive"),
        }
    }
}

/// Lifecycle status of a step.
///
/// Evolves strictly pending -> running -> (completed | failed | skipped).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    #[default]
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
}

impl StepStatus {
    /// True for completed, failed and skipped.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            StepStatus::Completed | StepStatus::Failed | StepStatus::Skipped
        )
    }
}

impl std::fmt::Display for StepStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StepStatus::Pending => write!(f, "pending"),
            StepStatus::Running => write!(f, "running"),
            StepStatus::Completed => write!(f, "completed"),
            StepStatus::Failed => write!(f, "failed"),
            StepStatus::Skipped => write!(f, "skipped"),
        }
    }
}

/// Plan-level policy applied when a step fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ErrorPolicy {
    /// Fail the session on the first persistent step failure
    #[default]
    Stop,
    /// Record the failure and move on
    Continue,
    /// Retry per step policy, then behave like `continue`
    Retry,
}

/// One unit of work inside a plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    /// Stable step identifier (unique within the plan)
    pub id: String,
    /// Human-readable description
    pub description: String,
    /// Tool to invoke, if any
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool: Option<String>,
    /// Tool arguments
    #[serde(skip_serializing_if = "Option::is_none")]
    pub args: Option<Value>,
    /// Current status
    #[serde(default)]
    pub status: StepStatus,
    /// Ids of steps that must be terminal before this one runs
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// Risk tier for approval gating
    #[serde(default)]
    pub risk: RiskTier,
}

impl Step {
    /// Creates a pending step.
    pub fn new(id: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            description: description.into(),
            tool: None,
            args: None,
            status: StepStatus::Pending,
            depends_on: Vec::new(),
            risk: RiskTier::default(),
        }
    }

    /// Sets the tool and arguments.
    pub fn with_tool(mut self, tool: impl Into<String>, args: Value) -> Self {
        self.tool = Some(tool.into());
        self.args = Some(args);
        self
    }

    /// Sets the risk tier.
    pub fn with_risk(mut self, risk: RiskTier) -> Self {
        self.risk = risk;
        self
    }

    /// Sets the dependency list.
    pub fn with_depends_on(mut self, depends_on: Vec<String>) -> Self {
        self.depends_on = depends_on;
        self
    }
}

/// An ordered sequence of steps sharing one goal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    /// Stable plan identifier
    pub id: String,
    /// The user's original goal text
    pub goal: String,
    /// Steps in original planner order
    pub steps: Vec<Step>,
    /// Policy applied when a step fails
    #[serde(default)]
    pub error_policy: ErrorPolicy,
}

impl Plan {
    /// Creates a plan from steps.
    pub fn new(goal: impl Into<String>, steps: Vec<Step>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            goal: goal.into(),
            steps,
            error_policy: ErrorPolicy::default(),
        }
    }

    /// The single-step fallback plan used when planning fails.
    ///
    /// One `chat` step carrying the user's request verbatim, at moderate risk.
    pub fn fallback(goal: impl Into<String>) -> Self {
        let goal = goal.into();
        let step = Step::new("step_0", goal.clone())
            .with_tool(FALLBACK_TOOL, serde_json::json!({ "prompt": goal }))
            .with_risk(RiskTier::Moderate);
        Self::new(goal, vec![step])
    }

    /// Looks up a step by id.
    pub fn step(&self, id: &str) -> Option<&Step> {
        self.steps.iter().find(|s| s.id == id)
    }

    /// Validates plan shape: at least one step, unique ids, dependencies
    /// referring to existing steps, and no dependency cycles.
    pub fn validate(&self) -> Result<(), String> {
        if self.steps.is_empty() {
            return Err("plan has no steps".to_string());
        }

        let mut ids = HashSet::new();
        for step in &self.steps {
            if !ids.insert(step.id.as_str()) {
                return Err(format!("duplicate step id '{}'", step.id));
            }
        }

        for step in &self.steps {
            for dep in &step.depends_on {
                if dep == &step.id {
                    return Err(format!("step '{}' depends on itself", step.id));
                }
                if !ids.contains(dep.as_str()) {
                    return Err(format!(
                        "step '{}' depends on unknown step '{}'",
                        step.id, dep
                    ));
                }
            }
        }

        // Kahn's algorithm: every step must be reachable without a cycle
        let mut indegree: HashMap<&str, usize> = self
            .steps
            .iter()
            .map(|s| (s.id.as_str(), s.depends_on.len()))
            .collect();
        let mut resolved = 0;
        let mut ready: Vec<&str> = indegree
            .iter()
            .filter(|(_, d)| **d == 0)
            .map(|(id, _)| *id)
            .collect();

        while let Some(current) = ready.pop() {
            resolved += 1;
            for step in &self.steps {
                if step.depends_on.iter().any(|d| d == current) {
                    let entry = indegree.get_mut(step.id.as_str()).ok_or_else(|| {
                        format!("internal: missing indegree for '{}'", step.id)
                    })?;
                    *entry -= 1;
                    if *entry == 0 {
                        ready.push(step.id.as_str());
                    }
                }
            }
        }

        if resolved != self.steps.len() {
            return Err("plan contains a dependency cycle".to_string());
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn three_step_plan() -> Plan {
        Plan::new(
            "build a report",
            vec![
                Step::new("step_0", "gather data").with_tool("fetch", json!({"url": "x"})),
                Step::new("step_1", "analyze")
                    .with_depends_on(vec!["step_0".to_string()])
                    .with_risk(RiskTier::Safe),
                Step::new("step_2", "write report")
                    .with_depends_on(vec!["step_1".to_string()]),
            ],
        )
    }

    #[test]
    fn test_plan_serde_round_trip() {
        let plan = three_step_plan();
        let json = serde_json::to_string(&plan).unwrap();
        let restored: Plan = serde_json::from_str(&json).unwrap();
        assert_eq!(restored, plan);
    }

    #[test]
    fn test_fallback_plan_shape() {
        let plan = Plan::fallback("Echo hello");
        assert_eq!(plan.steps.len(), 1);
        let step = &plan.steps[0];
        assert_eq!(step.tool.as_deref(), Some(FALLBACK_TOOL));
        assert_eq!(step.risk, RiskTier::Moderate);
        assert_eq!(step.description, "Echo hello");
        assert!(plan.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_empty_plan() {
        let plan = Plan::new("nothing", vec![]);
        assert!(plan.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_duplicate_ids() {
        let plan = Plan::new(
            "dup",
            vec![Step::new("a", "one"), Step::new("a", "two")],
        );
        assert!(plan.validate().unwrap_err().contains("duplicate"));
    }

    #[test]
    fn test_validate_rejects_unknown_dependency() {
        let plan = Plan::new(
            "bad dep",
            vec![Step::new("a", "one").with_depends_on(vec!["ghost".to_string()])],
        );
        assert!(plan.validate().unwrap_err().contains("unknown step"));
    }

    #[test]
    fn test_validate_rejects_cycle() {
        let plan = Plan::new(
            "cycle",
            vec![
                Step::new("a", "one").with_depends_on(vec!["b".to_string()]),
                Step::new("b", "two").with_depends_on(vec!["a".to_string()]),
            ],
        );
        assert!(plan.validate().unwrap_err().contains("cycle"));
    }

    #[test]
    fn test_step_status_terminal() {
        assert!(!StepStatus::Pending.is_terminal());
        assert!(!StepStatus::Running.is_terminal());
        assert!(StepStatus::Completed.is_terminal());
        assert!(StepStatus::Failed.is_terminal());
        assert!(StepStatus::Skipped.is_terminal());
    }

    #[test]
    fn test_risk_tier_serialization() {
        assert_eq!(
            serde_json::to_string(&RiskTier::Destructive).unwrap(),
            "\"destructive\""
        );
        let parsed: RiskTier = serde_json::from_str("\"safe\"").unwrap();
        assert_eq!(parsed, RiskTier::Safe);
    }
}
