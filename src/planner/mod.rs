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

//! Planner: turns a user request into a typed [`Plan`].
//!
//! The planner asks the gateway for a JSON step list, validates it, and
//! falls back to a single-step `chat` plan on any failure - planning never
//! aborts a session on its own.

pub mod prompt;
pub mod routing;

use crate::events::{AgentEvent, EventEmitter, EventType};
use crate::llm::{with_retry, ChatConfig, ChatMessage, Gateway, RetryConfig};
use crate::models::plan::{Plan, RiskTier, Step};
use crate::tools::ToolRegistry;
use prompt::PromptTemplate;
use routing::{classify, route_for};
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;
use tracing::{info, instrument, warn};

/// One step as the model is asked to produce it.
#[derive(Debug, Deserialize)]
struct PlannedStep {
    description: String,
    #[serde(default)]
    tool: Option<String>,
    #[serde(default)]
    args: Option<Value>,
    #[serde(default)]
    depends_on: Vec<String>,
    #[serde(default)]
    risk: RiskTier,
}

/// Result of one planning pass.
pub struct PlanOutcome {
    /// The plan to execute (possibly the fallback)
    pub plan: Plan,
    /// Prompt tokens spent planning
    pub tokens_input: u64,
    /// Completion tokens spent planning
    pub tokens_output: u64,
    /// Model that produced the plan (absent for the no-call fallback path)
    pub model: Option<String>,
    /// Provider that produced the plan
    pub provider: Option<String>,
    /// True when planning failed and the fallback plan is returned
    pub used_fallback: bool,
}

/// Plan generator.
pub struct Planner {
    gateway: Arc<dyn Gateway>,
    registry: Arc<ToolRegistry>,
    emitter: Arc<EventEmitter>,
}

impl Planner {
    /// Creates a planner over the shared gateway, registry and emitter.
    pub fn new(
        gateway: Arc<dyn Gateway>,
        registry: Arc<ToolRegistry>,
        emitter: Arc<EventEmitter>,
    ) -> Self {
        Self {
            gateway,
            registry,
            emitter,
        }
    }

    /// Produces a plan for `task`.
    ///
    /// Emits `model_selected` (and `model_switched` when routing falls back),
    /// then `plan_created`; on planner failure emits `error` first and
    /// returns the single-step fallback plan.
    #[instrument(name = "planner_plan", skip(self, task), fields(session_id = %session_id, task_len = task.len()))]
    pub async fn plan(&self, session_id: &str, task: &str) -> PlanOutcome {
        let category = classify(task);
        let route = route_for(category);

        let (provider, model) = if self.gateway.is_configured() {
            (route.provider.to_string(), route.model.to_string())
        } else {
            // Primary provider unusable; take the last-resort fallback
            let (fb_provider, fb_model) = *route
                .fallbacks
                .last()
                .unwrap_or(&(route.provider, route.model));
            warn!(
                primary = route.provider,
                fallback = fb_provider,
                "Primary provider not configured, switching"
            );
            self.emitter.publish(AgentEvent::new(
                EventType::ModelSwitched,
                session_id,
                serde_json::json!({
                    "from": { "provider": route.provider, "model": route.model },
                    "to": { "provider": fb_provider, "model": fb_model },
                }),
            ));
            (fb_provider.to_string(), fb_model.to_string())
        };

        self.emitter.publish(AgentEvent::new(
            EventType::ModelSelected,
            session_id,
            serde_json::json!({
                "category": category.to_string(),
                "provider": provider,
                "model": model,
            }),
        ));

        let tools = self.registry.list_tools().await;
        let template = PromptTemplate::planning(task, &tools);
        let messages = vec![
            ChatMessage::system(template.system_message()),
            ChatMessage::user(template.user_message()),
        ];
        let config = ChatConfig::default()
            .with_model(model.clone())
            .with_provider(provider.clone());

        let retry = RetryConfig::new(1, 500, 2_000);
        let response = with_retry(
            || self.gateway.chat(&messages, &config),
            &retry,
            |e| e.is_retryable(),
        )
        .await;

        let (content, tokens_input, tokens_output, used_model, used_provider) = match response {
            Ok(r) => (
                r.content,
                r.tokens_input,
                r.tokens_output,
                Some(r.model),
                Some(r.provider),
            ),
            Err(e) => {
                warn!(error = %e, "Planning call failed, using fallback plan");
                return self.fallback(session_id, task, 0, 0, format!("planning failed: {}", e));
            }
        };

        match Self::parse_plan(task, &content) {
            Ok(plan) => {
                info!(
                    plan_id = %plan.id,
                    steps = plan.steps.len(),
                    "Plan created"
                );
                self.emitter.publish(AgentEvent::new(
                    EventType::PlanCreated,
                    session_id,
                    serde_json::json!({
                        "plan": plan,
                        "error_policy": plan.error_policy,
                        "fallback": false,
                    }),
                ));
                PlanOutcome {
                    plan,
                    tokens_input,
                    tokens_output,
                    model: used_model,
                    provider: used_provider,
                    used_fallback: false,
                }
            }
            Err(reason) => {
                warn!(reason = %reason, "Plan validation failed, using fallback plan");
                self.fallback(
                    session_id,
                    task,
                    tokens_input,
                    tokens_output,
                    format!("plan validation failed: {}", reason),
                )
            }
        }
    }

    fn fallback(
        &self,
        session_id: &str,
        task: &str,
        tokens_input: u64,
        tokens_output: u64,
        reason: String,
    ) -> PlanOutcome {
        self.emitter
            .publish(AgentEvent::error(session_id, reason));

        let plan = Plan::fallback(task);
        self.emitter.publish(AgentEvent::new(
            EventType::PlanCreated,
            session_id,
            serde_json::json!({
                "plan": plan,
                "error_policy": plan.error_policy,
                "fallback": true,
            }),
        ));

        PlanOutcome {
            plan,
            tokens_input,
            tokens_output,
            model: None,
            provider: None,
            used_fallback: true,
        }
    }

    /// Parses and validates the model's step list into a plan.
    fn parse_plan(goal: &str, content: &str) -> Result<Plan, String> {
        let json_slice = Self::extract_json_array(content)
            .ok_or_else(|| "no JSON array in planner reply".to_string())?;

        let planned: Vec<PlannedStep> = serde_json::from_str(json_slice)
            .map_err(|e| format!("steps did not match the schema: {}", e))?;

        if planned.is_empty() {
            return Err("planner returned an empty step list".to_string());
        }

        let steps: Vec<Step> = planned
            .into_iter()
            .enumerate()
            .map(|(i, p)| {
                let mut step = Step::new(format!("step_{}", i), p.description)
                    .with_depends_on(p.depends_on)
                    .with_risk(p.risk);
                if let Some(tool) = p.tool {
                    step = step.with_tool(tool, p.args.unwrap_or(Value::Null));
                }
                step
            })
            .collect();

        let plan = Plan::new(goal, steps);
        plan.validate()?;
        Ok(plan)
    }

    /// Extracts the outermost JSON array, tolerating ```json fences and prose.
    fn extract_json_array(content: &str) -> Option<&str> {
        let start = content.find('[')?;
        let end = content.rfind(']')?;
        if end <= start {
            return None;
        }
        Some(&content[start..=end])
    }
}
