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

//! Human-in-the-loop approval request models.

use crate::models::plan::RiskTier;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Status of an approval request. Transitions out of `pending` exactly once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalStatus {
    #[default]
    Pending,
    Approved,
    Rejected,
    Timeout,
}

/// A resolved decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalDecision {
    Approved,
    Rejected,
    Timeout,
}

impl ApprovalDecision {
    /// Parses the wire form used by `resolve`. Unknown values yield `None`.
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "approved" => Some(ApprovalDecision::Approved),
            "rejected" => Some(ApprovalDecision::Rejected),
            "timeout" => Some(ApprovalDecision::Timeout),
            _ => None,
        }
    }

    /// True only for `approved`; rejections and timeouts both deny.
    pub fn is_approved(&self) -> bool {
        matches!(self, ApprovalDecision::Approved)
    }
}

impl std::fmt::Display for ApprovalDecision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ApprovalDecision::Approved => write!(f, "approved"),
            ApprovalDecision::Rejected => write!(f, "rejected"),
            ApprovalDecision::Timeout => write!(f, "timeout"),
        }
    }
}

/// The action a request asks the user to approve.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalAction {
    /// Human-readable description shown to the user
    pub description: String,
    /// Tool about to be invoked, if any
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool: Option<String>,
    /// Arguments the tool would receive
    #[serde(skip_serializing_if = "Option::is_none")]
    pub args: Option<serde_json::Value>,
}

impl ApprovalAction {
    /// Creates an action description.
    pub fn new(description: impl Into<String>) -> Self {
        Self {
            description: description.into(),
            tool: None,
            args: None,
        }
    }

    /// Attaches the tool call being gated.
    pub fn with_tool(mut self, tool: impl Into<String>, args: serde_json::Value) -> Self {
        self.tool = Some(tool.into());
        self.args = Some(args);
        self
    }
}

/// A pending gate on a potentially risky step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalRequest {
    /// Stable request id
    pub id: String,
    /// Session the gated step belongs to
    pub session_id: String,
    /// The gated step
    pub step_id: String,
    /// What the user is asked to approve
    pub action: ApprovalAction,
    /// Risk tier driving the prompt policy
    pub risk: RiskTier,
    /// Creation timestamp
    pub created_at: DateTime<Utc>,
    /// Optional timeout in seconds; elapsing resolves as `timeout`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<f64>,
    /// Current status
    #[serde(default)]
    pub status: ApprovalStatus,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decision_parse_known_values() {
        assert_eq!(
            ApprovalDecision::parse("approved"),
            Some(ApprovalDecision::Approved)
        );
        assert_eq!(
            ApprovalDecision::parse("rejected"),
            Some(ApprovalDecision::Rejected)
        );
        assert_eq!(
            ApprovalDecision::parse("timeout"),
            Some(ApprovalDecision::Timeout)
        );
    }

    #[test]
    fn test_decision_parse_unknown_value() {
        assert_eq!(ApprovalDecision::parse("maybe"), None);
        assert_eq!(ApprovalDecision::parse(""), None);
        assert_eq!(ApprovalDecision::parse("APPROVED"), None);
    }

    #[test]
    fn test_only_approved_approves() {
        assert!(ApprovalDecision::Approved.is_approved());
        assert!(!ApprovalDecision::Rejected.is_approved());
        assert!(!ApprovalDecision::Timeout.is_approved());
    }

    #[test]
    fn test_approval_request_serialization() {
        let request = ApprovalRequest {
            id: "req_1".to_string(),
            session_id: "s1".to_string(),
            step_id: "step_0".to_string(),
            action: ApprovalAction::new("Delete file /tmp/x")
                .with_tool("fs_delete", serde_json::json!({"path": "/tmp/x"})),
            risk: RiskTier::Destructive,
            created_at: Utc::now(),
            timeout_secs: Some(30.0),
            status: ApprovalStatus::Pending,
        };

        let json = serde_json::to_string(&request).unwrap();
        assert!(json.contains("\"risk\":\"destructive\""));
        assert!(json.contains("\"status\":\"pending\""));
        assert!(json.contains("fs_delete"));
    }
}
