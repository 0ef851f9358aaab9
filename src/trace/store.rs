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

//! Durable trace store on embedded SurrealDB.
//!
//! Append-only entries with a session index; raw I/O strings are truncated
//! before storage so the log stays bounded. Writes complete before the
//! caller proceeds, and readers may stream a session's traces while the
//! executor is still producing them.

use crate::events::EventType;
use crate::models::trace::{SessionRecord, TraceEntry, TraceQuery};
use anyhow::Result;
use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::Value;
use std::path::Path;
use surrealdb::{
    engine::local::{Db, RocksDb},
    Surreal,
};
use tracing::{debug, error, info, instrument, warn};

/// Formats a timestamp as a fixed-width RFC 3339 UTC string.
///
/// Fixed microsecond precision keeps lexicographic order equal to temporal
/// order, which the range filters rely on.
fn format_ts(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(raw: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

/// Truncates to a byte cap without splitting a UTF-8 character.
fn truncate_to_bytes(text: &str, max_bytes: usize) -> String {
    if text.len() <= max_bytes {
        return text.to_string();
    }
    let mut end = max_bytes;
    while end > 0 && !text.is_char_boundary(end) {
        end -= 1;
    }
    text[..end].to_string()
}

/// Process-wide trace persistence handle.
pub struct TraceStore {
    db: Surreal<Db>,
    truncate_bytes: usize,
}

impl TraceStore {
    /// Opens (or creates) the store at the given path and applies the schema.
    #[instrument(name = "trace_store_new", skip_all, fields(db_path = %path.display()))]
    pub async fn new(path: &Path, truncate_bytes: usize) -> Result<Self> {
        info!("Opening trace store");

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let db = Surreal::new::<RocksDb>(path.to_string_lossy().as_ref())
            .await
            .map_err(|e| {
                error!(error = %e, "Failed to open trace store");
                e
            })?;

        db.use_ns("soline").use_db("agent").await.map_err(|e| {
            error!(error = %e, "Failed to select namespace/database");
            e
        })?;

        let store = Self {
            db,
            truncate_bytes: truncate_bytes.max(1),
        };
        store.initialize_schema().await?;

        info!("Trace store ready");
        Ok(store)
    }

    /// Applies the schema. Idempotent.
    #[instrument(name = "trace_initialize_schema", skip(self))]
    pub async fn initialize_schema(&self) -> Result<()> {
        use super::schema::SCHEMA_SQL;

        self.db.query(SCHEMA_SQL).await.map_err(|e| {
            error!(error = %e, "Failed to initialize trace schema");
            e
        })?;
        debug!("Trace schema initialized");
        Ok(())
    }

    /// Records the start of a session.
    #[instrument(name = "trace_start_session", skip(self, task), fields(session_id = %session_id))]
    pub async fn start_session(&self, session_id: &str, task: &str) -> Result<()> {
        let data = serde_json::json!({
            "task": task,
            "started_at": format_ts(&Utc::now()),
            "total_events": 0,
            "total_tokens": 0,
            "total_cost": 0.0,
        });

        let query = format!("CREATE trace_session:`{}` CONTENT $data", session_id);
        self.db
            .query(query)
            .bind(("data", data))
            .await
            .map_err(|e| {
                error!(error = %e, "Failed to record session start");
                e
            })?;

        debug!("Session start recorded");
        Ok(())
    }

    /// Records the end of a session together with its totals.
    #[instrument(name = "trace_end_session", skip(self), fields(session_id = %session_id))]
    pub async fn end_session(
        &self,
        session_id: &str,
        total_tokens: u64,
        total_cost: f64,
    ) -> Result<()> {
        let query = format!(
            "UPDATE trace_session:`{}` SET ended_at = $ended_at, total_tokens = $tokens, total_cost = $cost",
            session_id
        );
        self.db
            .query(query)
            .bind(("ended_at", format_ts(&Utc::now())))
            .bind(("tokens", total_tokens as i64))
            .bind(("cost", total_cost))
            .await
            .map_err(|e| {
                error!(error = %e, "Failed to record session end");
                e
            })?;

        debug!("Session end recorded");
        Ok(())
    }

    /// Appends one trace entry durably.
    ///
    /// Raw input/output strings are truncated to the configured cap before
    /// storage. When this returns, the entry is queryable.
    #[instrument(
        name = "trace_save",
        skip(self, entry),
        fields(session_id = %entry.session_id, entry_type = %entry.entry_type)
    )]
    pub async fn save_trace(&self, entry: TraceEntry) -> Result<()> {
        let data = serde_json::json!({
            "parent_id": entry.parent_id,
            "session_id": entry.session_id,
            "entry_type": entry.entry_type.to_string(),
            "timestamp": format_ts(&entry.timestamp),
            "duration_ms": entry.duration_ms.map(|v| v as i64),
            "tokens_input": entry.tokens_input.map(|v| v as i64),
            "tokens_output": entry.tokens_output.map(|v| v as i64),
            "model": entry.model,
            "provider": entry.provider,
            "cost": entry.cost,
            "data": entry.data.to_string(),
            "raw_input": entry
                .raw_input
                .as_deref()
                .map(|s| truncate_to_bytes(s, self.truncate_bytes)),
            "raw_output": entry
                .raw_output
                .as_deref()
                .map(|s| truncate_to_bytes(s, self.truncate_bytes)),
        });

        let entry_query = format!("CREATE trace_entry:`{}` CONTENT $data", entry.id);
        let session_query = format!(
            "UPDATE trace_session:`{}` SET total_events += 1",
            entry.session_id
        );

        self.db
            .query(entry_query)
            .bind(("data", data))
            .await
            .map_err(|e| {
                error!(error = %e, "Failed to save trace entry");
                e
            })?;

        if let Err(e) = self.db.query(session_query).await {
            // The entry itself is durable; a missed counter is tolerable
            warn!(error = %e, "Failed to bump session event counter");
        }

        Ok(())
    }

    /// Queries trace entries; all populated filters must match.
    ///
    /// Results come back in timestamp order.
    #[instrument(name = "trace_get", skip(self, query))]
    pub async fn get_traces(&self, query: &TraceQuery) -> Result<Vec<TraceEntry>> {
        let mut clauses: Vec<String> = Vec::new();

        if query.session_id.is_some() {
            clauses.push("session_id = $session_id".to_string());
        }
        if query.entry_type.is_some() {
            clauses.push("entry_type = $entry_type".to_string());
        }
        if query.since.is_some() {
            clauses.push("timestamp >= $since".to_string());
        }
        if query.until.is_some() {
            clauses.push("timestamp < $until".to_string());
        }
        if query.contains.is_some() {
            clauses.push(
                "(string::contains(data, $needle) \
                 OR (raw_input != NONE AND string::contains(raw_input, $needle)) \
                 OR (raw_output != NONE AND string::contains(raw_output, $needle)))"
                    .to_string(),
            );
        }

        let where_clause = if clauses.is_empty() {
            String::new()
        } else {
            format!(" WHERE {}", clauses.join(" AND "))
        };
        // meta::id keeps record ids as plain strings (SDK 2.x Thing values
        // do not round-trip through serde_json)
        let sql = format!(
            "SELECT meta::id(id) AS id, parent_id, session_id, entry_type, timestamp, \
             duration_ms, tokens_input, tokens_output, model, provider, cost, data, \
             raw_input, raw_output FROM trace_entry{} ORDER BY timestamp ASC",
            where_clause
        );

        let mut db_query = self.db.query(sql);
        if let Some(session_id) = &query.session_id {
            db_query = db_query.bind(("session_id", session_id.clone()));
        }
        if let Some(entry_type) = &query.entry_type {
            db_query = db_query.bind(("entry_type", entry_type.to_string()));
        }
        if let Some(since) = &query.since {
            db_query = db_query.bind(("since", format_ts(since)));
        }
        if let Some(until) = &query.until {
            db_query = db_query.bind(("until", format_ts(until)));
        }
        if let Some(needle) = &query.contains {
            db_query = db_query.bind(("needle", needle.clone()));
        }

        let mut result = db_query.await.map_err(|e| {
            error!(error = %e, "Trace query failed");
            e
        })?;
        let rows: Vec<Value> = result.take(0).map_err(|e| {
            error!(error = %e, "Failed to extract trace query results");
            e
        })?;

        let entries = rows.iter().filter_map(row_to_entry).collect::<Vec<_>>();
        debug!(result_count = entries.len(), "Trace query completed");
        Ok(entries)
    }

    /// Fetches one session's aggregate record.
    #[instrument(name = "trace_get_session", skip(self), fields(session_id = %session_id))]
    pub async fn get_session(&self, session_id: &str) -> Result<Option<SessionRecord>> {
        let mut result = self
            .db
            .query(
                "SELECT meta::id(id) AS id, task, started_at, ended_at, total_events, \
                 total_tokens, total_cost FROM trace_session WHERE meta::id(id) = $id",
            )
            .bind(("id", session_id.to_string()))
            .await?;
        let rows: Vec<Value> = result.take(0)?;

        Ok(rows.first().map(|row| SessionRecord {
            id: row["id"].as_str().unwrap_or_default().to_string(),
            task: row["task"].as_str().unwrap_or_default().to_string(),
            started_at: parse_ts(row["started_at"].as_str().unwrap_or_default()),
            ended_at: row["ended_at"].as_str().map(parse_ts),
            total_events: row["total_events"].as_u64().unwrap_or(0),
            total_tokens: row["total_tokens"].as_u64().unwrap_or(0),
            total_cost: row["total_cost"].as_f64().unwrap_or(0.0),
        }))
    }

    /// Deletes entries strictly older than `now - retention_days`.
    ///
    /// Returns the number of entries removed.
    #[instrument(name = "trace_cleanup", skip(self))]
    pub async fn cleanup_old_traces(&self, retention_days: u32) -> Result<usize> {
        let cutoff = Utc::now() - chrono::Duration::days(retention_days as i64);
        let cutoff_str = format_ts(&cutoff);

        let mut count_result = self
            .db
            .query("SELECT VALUE count() FROM trace_entry WHERE timestamp < $cutoff GROUP ALL")
            .bind(("cutoff", cutoff_str.clone()))
            .await?;
        let counts: Vec<i64> = count_result.take(0).unwrap_or_default();
        let to_delete = counts.first().copied().unwrap_or(0) as usize;

        self.db
            .query("DELETE trace_entry WHERE timestamp < $cutoff")
            .bind(("cutoff", cutoff_str))
            .await
            .map_err(|e| {
                error!(error = %e, "Trace cleanup failed");
                e
            })?;

        info!(
            retention_days = retention_days,
            deleted = to_delete,
            "Old trace entries cleaned up"
        );
        Ok(to_delete)
    }

    /// Stores a configuration value in the embedded KV table.
    pub async fn set_config_value(&self, key: &str, value: &str) -> Result<()> {
        self.db
            .query(format!(
                "UPSERT core_config:`{}` SET key = $key, value = $value",
                key
            ))
            .bind(("key", key.to_string()))
            .bind(("value", value.to_string()))
            .await?;
        Ok(())
    }

    /// Reads a configuration value from the embedded KV table.
    pub async fn get_config_value(&self, key: &str) -> Result<Option<String>> {
        let mut result = self
            .db
            .query("SELECT VALUE value FROM core_config WHERE key = $key")
            .bind(("key", key.to_string()))
            .await?;
        let values: Vec<String> = result.take(0)?;
        Ok(values.into_iter().next())
    }

    /// The configured raw I/O truncation cap in bytes.
    pub fn truncate_bytes(&self) -> usize {
        self.truncate_bytes
    }
}

fn row_to_entry(row: &Value) -> Option<TraceEntry> {
    let entry_type: EventType =
        serde_json::from_value(Value::String(row["entry_type"].as_str()?.to_string())).ok()?;

    let data = row["data"]
        .as_str()
        .and_then(|raw| serde_json::from_str(raw).ok())
        .unwrap_or(Value::Null);

    Some(TraceEntry {
        id: row["id"].as_str()?.to_string(),
        parent_id: row["parent_id"].as_str().map(String::from),
        session_id: row["session_id"].as_str()?.to_string(),
        entry_type,
        timestamp: parse_ts(row["timestamp"].as_str()?),
        duration_ms: row["duration_ms"].as_u64(),
        tokens_input: row["tokens_input"].as_u64(),
        tokens_output: row["tokens_output"].as_u64(),
        model: row["model"].as_str().map(String::from),
        provider: row["provider"].as_str().map(String::from),
        cost: row["cost"].as_f64(),
        data,
        raw_input: row["raw_input"].as_str().map(String::from),
        raw_output: row["raw_output"].as_str().map(String::from),
    })
}
