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

//! Session state machine types, cancellation preferences and the terminal
//! summary reported to the user.

use crate::models::plan::Plan;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Session lifecycle state.
///
/// ```text
/// idle -> planning -> executing -> completed | failed | cancelled
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    #[default]
    Idle,
    Planning,
    Executing,
    Completed,
    Failed,
    Cancelled,
}

impl SessionState {
    /// True for completed, failed and cancelled.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SessionState::Completed | SessionState::Failed | SessionState::Cancelled
        )
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionState::Idle => write!(f, "idle"),
            SessionState::Planning => write!(f, "planning"),
            SessionState::Executing => write!(f, "executing"),
            SessionState::Completed => write!(f, "completed"),
            SessionState::Failed => write!(f, "failed"),
            SessionState::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// How promptly a cancellation takes effect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum CancelMode {
    /// Interrupt at the next suspension point; the running step fails
    Immediate,
    /// Let the current step finish naturally; no new steps start
    #[default]
    AfterCurrent,
}

/// What happens to completed work after cancellation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ResultMode {
    /// Preserve completed step outputs; report partial progress
    #[default]
    Keep,
    /// Record reversal intent on the terminal event (compensations are
    /// tool-specific and out of scope here)
    Rollback,
}

/// A cancellation request submitted by the UI.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CancelRequest {
    /// Session to cancel
    pub session_id: String,
    /// Promptness preference
    #[serde(default)]
    pub cancel_mode: CancelMode,
    /// Result preference
    #[serde(default)]
    pub result_mode: ResultMode,
}

impl CancelRequest {
    /// Creates a request with the safe defaults (`after_current`, `keep`).
    pub fn new(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            cancel_mode: CancelMode::default(),
            result_mode: ResultMode::default(),
        }
    }

    /// Sets the cancel mode.
    pub fn with_cancel_mode(mut self, mode: CancelMode) -> Self {
        self.cancel_mode = mode;
        self
    }

    /// Sets the result mode.
    pub fn with_result_mode(mut self, mode: ResultMode) -> Self {
        self.result_mode = mode;
        self
    }
}

/// One user task run, owned exclusively by the executor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    /// Stable opaque handle
    pub id: String,
    /// Creation timestamp
    pub created_at: DateTime<Utc>,
    /// The task text as submitted
    pub task: String,
    /// Current state
    pub state: SessionState,
    /// Accumulated token usage
    pub tokens_used: u64,
    /// The active plan, present once planning succeeded
    #[serde(skip_serializing_if = "Option::is_none")]
    pub plan: Option<Plan>,
    /// Ids of steps that reached `completed`
    pub completed_steps: Vec<String>,
}

impl Session {
    /// Creates an idle session for a task.
    pub fn new(id: impl Into<String>, task: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            created_at: Utc::now(),
            task: task.into(),
            state: SessionState::Idle,
            tokens_used: 0,
            plan: None,
            completed_steps: Vec::new(),
        }
    }
}

/// Structured summary attached to every terminal event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSummary {
    /// Session this summary describes
    pub session_id: String,
    /// The original goal
    pub goal: String,
    /// Terminal state reached
    pub state: SessionState,
    /// Step ids per outcome
    pub steps_completed: Vec<String>,
    pub steps_skipped: Vec<String>,
    pub steps_failed: Vec<String>,
    /// Steps that never started because of cancellation
    pub steps_cancelled: Vec<String>,
    /// Tokens consumed over the whole session
    pub tokens_used: u64,
    /// Budget still available at the end
    pub tokens_remaining: u64,
    /// Estimated cost in USD
    pub total_cost: f64,
    /// True when the cancellation asked for rollback
    pub rollback_intended: bool,
    /// Optional short natural-language wrap-up
    #[serde(skip_serializing_if = "Option::is_none")]
    pub explanation: Option<String>,
}
