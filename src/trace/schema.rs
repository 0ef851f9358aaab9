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

pub const SCHEMA_SQL: &str = r#"
-- Namespace et Database
DEFINE NAMESPACE soline;
USE NS soline;
DEFINE DATABASE agent;
USE DB agent;

-- Table: trace_session
-- One row per agent session, updated with totals at session end
DEFINE TABLE OVERWRITE trace_session SCHEMAFULL;
DEFINE FIELD OVERWRITE task ON trace_session TYPE string;
-- Timestamps are fixed-width RFC 3339 UTC strings so range filters and
-- ordering stay correct under plain string comparison
DEFINE FIELD OVERWRITE started_at ON trace_session TYPE string;
DEFINE FIELD OVERWRITE ended_at ON trace_session TYPE option<string>;
DEFINE FIELD OVERWRITE total_events ON trace_session TYPE int DEFAULT 0;
DEFINE FIELD OVERWRITE total_tokens ON trace_session TYPE int DEFAULT 0;
DEFINE FIELD OVERWRITE total_cost ON trace_session TYPE float DEFAULT 0.0;

-- Table: trace_entry
-- Append-only event log; write-heavy (every state transition lands here)
-- Index trade-off: keep only the three indexes the query surface needs
DEFINE TABLE OVERWRITE trace_entry SCHEMAFULL;
DEFINE FIELD OVERWRITE parent_id ON trace_entry TYPE option<string>;
DEFINE FIELD OVERWRITE session_id ON trace_entry TYPE string;
DEFINE FIELD OVERWRITE entry_type ON trace_entry TYPE string;
DEFINE FIELD OVERWRITE timestamp ON trace_entry TYPE string;
DEFINE FIELD OVERWRITE duration_ms ON trace_entry TYPE option<int>;
DEFINE FIELD OVERWRITE tokens_input ON trace_entry TYPE option<int>;
DEFINE FIELD OVERWRITE tokens_output ON trace_entry TYPE option<int>;
DEFINE FIELD OVERWRITE model ON trace_entry TYPE option<string>;
DEFINE FIELD OVERWRITE provider ON trace_entry TYPE option<string>;
DEFINE FIELD OVERWRITE cost ON trace_entry TYPE option<float>;
-- Store payloads as JSON strings to bypass SurrealDB SCHEMAFULL nested
-- object filtering (arbitrary keys would be silently dropped otherwise)
DEFINE FIELD OVERWRITE data ON trace_entry TYPE string;
DEFINE FIELD OVERWRITE raw_input ON trace_entry TYPE option<string>;
DEFINE FIELD OVERWRITE raw_output ON trace_entry TYPE option<string>;

DEFINE INDEX OVERWRITE trace_entry_session_idx ON trace_entry FIELDS session_id;
DEFINE INDEX OVERWRITE trace_entry_timestamp_idx ON trace_entry FIELDS timestamp;
DEFINE INDEX OVERWRITE trace_entry_type_idx ON trace_entry FIELDS entry_type;

-- Table: core_config
-- Embedded key-value table for runtime settings (retention, etc.)
DEFINE TABLE OVERWRITE core_config SCHEMAFULL;
DEFINE FIELD OVERWRITE key ON core_config TYPE string;
DEFINE FIELD OVERWRITE value ON core_config TYPE string;
"#;
