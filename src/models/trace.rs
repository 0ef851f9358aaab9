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

//! Trace persistence models.

use crate::events::EventType;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Aggregate record of one traced session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRecord {
    /// Session id
    pub id: String,
    /// Task text as submitted
    pub task: String,
    /// When the session started
    pub started_at: DateTime<Utc>,
    /// When the session reached a terminal state, if it has
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    /// Number of trace entries written for this session
    pub total_events: u64,
    /// Tokens consumed
    pub total_tokens: u64,
    /// Estimated cost in USD
    pub total_cost: f64,
}

/// One durable entry in the append-only trace log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraceEntry {
    /// Stable entry id
    pub id: String,
    /// Parent entry (e.g. the step a tool call belongs to)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    /// Owning session
    pub session_id: String,
    /// Event type this entry records
    pub entry_type: EventType,
    /// Wall-clock time of the event
    pub timestamp: DateTime<Utc>,
    /// Duration in milliseconds, present only on terminal events
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    /// Input tokens consumed by the traced call
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tokens_input: Option<u64>,
    /// Output tokens produced by the traced call
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tokens_output: Option<u64>,
    /// Model identifier, when an LLM was involved
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    /// Provider identifier, when an LLM was involved
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    /// Estimated cost in USD
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cost: Option<f64>,
    /// Structured payload
    pub data: serde_json::Value,
    /// Raw input text, truncated to the configured cap before storage
    #[serde(skip_serializing_if = "Option::is_none")]
    pub raw_input: Option<String>,
    /// Raw output text, truncated to the configured cap before storage
    #[serde(skip_serializing_if = "Option::is_none")]
    pub raw_output: Option<String>,
}

impl TraceEntry {
    /// Creates an entry stamped with the current time.
    pub fn new(
        session_id: impl Into<String>,
        entry_type: EventType,
        data: serde_json::Value,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            parent_id: None,
            session_id: session_id.into(),
            entry_type,
            timestamp: Utc::now(),
            duration_ms: None,
            tokens_input: None,
            tokens_output: None,
            model: None,
            provider: None,
            cost: None,
            data,
            raw_input: None,
            raw_output: None,
        }
    }

    /// Links this entry to a parent entry.
    pub fn with_parent(mut self, parent_id: impl Into<String>) -> Self {
        self.parent_id = Some(parent_id.into());
        self
    }

    /// Records the duration of a terminal event.
    pub fn with_duration_ms(mut self, duration_ms: u64) -> Self {
        self.duration_ms = Some(duration_ms);
        self
    }

    /// Records token usage.
    pub fn with_tokens(mut self, input: u64, output: u64) -> Self {
        self.tokens_input = Some(input);
        self.tokens_output = Some(output);
        self
    }

    /// Records the model/provider pair.
    pub fn with_model(mut self, model: impl Into<String>, provider: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self.provider = Some(provider.into());
        self
    }

    /// Records the estimated cost.
    pub fn with_cost(mut self, cost: f64) -> Self {
        self.cost = Some(cost);
        self
    }

    /// Attaches raw I/O strings (truncated by the store before writing).
    pub fn with_raw_io(
        mut self,
        raw_input: Option<String>,
        raw_output: Option<String>,
    ) -> Self {
        self.raw_input = raw_input;
        self.raw_output = raw_output;
        self
    }
}

/// Filter for `get_traces`. All populated fields must match.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TraceQuery {
    /// Restrict to one session
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    /// Restrict to one event type
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entry_type: Option<EventType>,
    /// Entries at or after this instant
    #[serde(skip_serializing_if = "Option::is_none")]
    pub since: Option<DateTime<Utc>>,
    /// Entries strictly before this instant
    #[serde(skip_serializing_if = "Option::is_none")]
    pub until: Option<DateTime<Utc>>,
    /// Substring matched against data, raw_input and raw_output
    #[serde(skip_serializing_if = "Option::is_none")]
    pub contains: Option<String>,
}

impl TraceQuery {
    /// Query for everything in one session.
    pub fn for_session(session_id: impl Into<String>) -> Self {
        Self {
            session_id: Some(session_id.into()),
            ..Self::default()
        }
    }

    /// Restricts to one event type.
    pub fn with_type(mut self, entry_type: EventType) -> Self {
        self.entry_type = Some(entry_type);
        self
    }

    /// Restricts to a time window.
    pub fn with_range(
        mut self,
        since: Option<DateTime<Utc>>,
        until: Option<DateTime<Utc>>,
    ) -> Self {
        self.since = since;
        self.until = until;
        self
    }

    /// Adds a free-text substring filter.
    pub fn with_contains(mut self, needle: impl Into<String>) -> Self {
        self.contains = Some(needle.into());
        self
    }
}
