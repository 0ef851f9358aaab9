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

//! Risk-tiered human-in-the-loop approval gate.
//!
//! The executor asks for approval before risky steps; the UI answers through
//! [`ApprovalManager::resolve`]. Requests are values with a single-shot
//! completion handle - once a request leaves `pending` no further transition
//! can touch it.
//!
//! # Policy
//!
//! | Tier | Default |
//! |------|---------|
//! | safe | auto-approve, no prompt |
//! | moderate | prompt; may be similarity-cached |
//! | destructive | prompt individually, never auto-approved |
//!
//! The session-scoped YOLO flag skips safe/moderate prompts; destructive
//! prompts remain.

use crate::events::{AgentEvent, EventEmitter, EventType};
use crate::models::approval::{ApprovalAction, ApprovalDecision, ApprovalRequest, ApprovalStatus};
use crate::models::plan::RiskTier;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

struct PendingApproval {
    request: ApprovalRequest,
    decide: oneshot::Sender<ApprovalDecision>,
    timeout_task: Option<JoinHandle<()>>,
    fingerprint: Option<u64>,
}

/// Outcome handle returned by `request_approval`.
///
/// Either the request was auto-approved (safe tier, YOLO, similarity cache)
/// or the caller must await the user's decision.
pub enum ApprovalTicket {
    /// No prompt was necessary
    AutoApproved,
    /// Awaiting a decision routed through `resolve`
    Pending {
        request_id: String,
        receiver: oneshot::Receiver<ApprovalDecision>,
    },
}

impl ApprovalTicket {
    /// The pending request id, if a prompt was published.
    pub fn request_id(&self) -> Option<&str> {
        match self {
            ApprovalTicket::AutoApproved => None,
            ApprovalTicket::Pending { request_id, .. } => Some(request_id),
        }
    }

    /// Awaits the decision. Auto-approved tickets resolve immediately.
    pub async fn decision(self) -> ApprovalDecision {
        match self {
            ApprovalTicket::AutoApproved => ApprovalDecision::Approved,
            ApprovalTicket::Pending { receiver, .. } => {
                // A dropped sender means the manager was torn down mid-wait;
                // denying is the only safe reading.
                receiver.await.unwrap_or(ApprovalDecision::Rejected)
            }
        }
    }
}

/// Process-wide approval gate.
///
/// Holds the pending-request table and the per-session similarity cache.
/// Safe to share via `Arc<ApprovalManager>`.
pub struct ApprovalManager {
    emitter: Arc<EventEmitter>,
    pending: Mutex<HashMap<String, PendingApproval>>,
    /// session_id -> fingerprints of approved "apply to similar" actions
    similar: Mutex<HashMap<String, HashSet<u64>>>,
}

impl ApprovalManager {
    /// Creates a manager publishing through the given emitter.
    pub fn new(emitter: Arc<EventEmitter>) -> Self {
        Self {
            emitter,
            pending: Mutex::new(HashMap::new()),
            similar: Mutex::new(HashMap::new()),
        }
    }

    /// Requests approval for an action.
    ///
    /// Safe-tier actions, YOLO sessions (non-destructive only) and
    /// similarity-cache hits are auto-approved without a prompt. Everything
    /// else publishes `approval_requested` and returns a pending ticket.
    pub async fn request_approval(
        self: &Arc<Self>,
        session_id: &str,
        step_id: &str,
        action: ApprovalAction,
        risk: RiskTier,
        timeout_secs: Option<f64>,
        yolo: bool,
    ) -> ApprovalTicket {
        if risk == RiskTier::Safe {
            debug!(session_id = %session_id, step_id = %step_id, "Safe action auto-approved");
            return ApprovalTicket::AutoApproved;
        }

        if yolo && risk != RiskTier::Destructive {
            debug!(session_id = %session_id, step_id = %step_id, "YOLO session, prompt skipped");
            return ApprovalTicket::AutoApproved;
        }

        let fingerprint = match (&action.tool, &action.args) {
            (Some(tool), Some(args)) if risk != RiskTier::Destructive => {
                Some(action_fingerprint(tool, args))
            }
            _ => None,
        };

        if let Some(fp) = fingerprint {
            let similar = self.similar.lock().await;
            if similar
                .get(session_id)
                .map(|set| set.contains(&fp))
                .unwrap_or(false)
            {
                info!(
                    session_id = %session_id,
                    step_id = %step_id,
                    "Similar action previously approved, auto-approving"
                );
                return ApprovalTicket::AutoApproved;
            }
        }

        let request = ApprovalRequest {
            id: Uuid::new_v4().to_string(),
            session_id: session_id.to_string(),
            step_id: step_id.to_string(),
            action,
            risk,
            created_at: chrono::Utc::now(),
            timeout_secs,
            status: ApprovalStatus::Pending,
        };
        let request_id = request.id.clone();

        let (tx, rx) = oneshot::channel();

        let timeout_task = timeout_secs.map(|secs| {
            let manager = Arc::clone(self);
            let id = request_id.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_secs_f64(secs.max(0.0))).await;
                if manager
                    .resolve_internal(&id, ApprovalDecision::Timeout)
                    .await
                {
                    warn!(request_id = %id, "Approval request timed out");
                }
            })
        });

        let request_payload = serde_json::to_value(&request).unwrap_or(Value::Null);

        // Insert before publishing so a fast UI can resolve immediately
        let mut pending = self.pending.lock().await;
        pending.insert(
            request_id.clone(),
            PendingApproval {
                request,
                decide: tx,
                timeout_task,
                fingerprint,
            },
        );
        drop(pending);

        self.emitter.publish(AgentEvent::new(
            EventType::ApprovalRequested,
            session_id,
            request_payload,
        ));

        info!(request_id = %request_id, session_id = %session_id, risk = %risk, "Approval requested");

        ApprovalTicket::Pending {
            request_id,
            receiver: rx,
        }
    }

    /// Approves a pending request.
    ///
    /// With `approve_similar`, structurally identical non-destructive actions
    /// in the same session are auto-approved for the rest of the session.
    /// A second call for the same id is a no-op.
    pub async fn approve(&self, request_id: &str, approve_similar: bool) -> bool {
        let Some(entry) = self.take_pending(request_id).await else {
            warn!(request_id = %request_id, "Approve for unknown or already resolved request");
            return false;
        };

        if approve_similar && entry.request.risk != RiskTier::Destructive {
            if let Some(fp) = entry.fingerprint {
                let mut similar = self.similar.lock().await;
                similar
                    .entry(entry.request.session_id.clone())
                    .or_default()
                    .insert(fp);
            }
        }

        self.finish(entry, ApprovalDecision::Approved).await;
        true
    }

    /// Rejects a pending request. A second call for the same id is a no-op.
    pub async fn reject(&self, request_id: &str) -> bool {
        let Some(entry) = self.take_pending(request_id).await else {
            warn!(request_id = %request_id, "Reject for unknown or already resolved request");
            return false;
        };
        self.finish(entry, ApprovalDecision::Rejected).await;
        true
    }

    /// Routing facade for the UI: `"approved"` approves, `"rejected"` and
    /// `"timeout"` deny. Unknown decisions are logged and ignored - the
    /// request stays pending.
    pub async fn resolve(&self, request_id: &str, decision: &str, approve_similar: bool) -> bool {
        match ApprovalDecision::parse(decision) {
            Some(ApprovalDecision::Approved) => self.approve(request_id, approve_similar).await,
            Some(ApprovalDecision::Rejected) => self.reject(request_id).await,
            Some(ApprovalDecision::Timeout) => {
                self.resolve_internal(request_id, ApprovalDecision::Timeout)
                    .await
            }
            None => {
                warn!(
                    request_id = %request_id,
                    decision = %decision,
                    "Unknown approval decision, ignoring"
                );
                false
            }
        }
    }

    /// Snapshot of currently pending requests (for the UI).
    pub async fn pending_requests(&self) -> Vec<ApprovalRequest> {
        let pending = self.pending.lock().await;
        pending.values().map(|p| p.request.clone()).collect()
    }

    /// Drops session state: pending requests resolve as rejected, the
    /// similarity cache for the session is cleared.
    pub async fn clear_session(&self, session_id: &str) {
        let ids: Vec<String> = {
            let pending = self.pending.lock().await;
            pending
                .values()
                .filter(|p| p.request.session_id == session_id)
                .map(|p| p.request.id.clone())
                .collect()
        };
        for id in ids {
            self.reject(&id).await;
        }

        let mut similar = self.similar.lock().await;
        similar.remove(session_id);
    }

    async fn resolve_internal(&self, request_id: &str, decision: ApprovalDecision) -> bool {
        let Some(entry) = self.take_pending(request_id).await else {
            return false;
        };
        self.finish(entry, decision).await;
        true
    }

    async fn take_pending(&self, request_id: &str) -> Option<PendingApproval> {
        let mut pending = self.pending.lock().await;
        pending.remove(request_id)
    }

    async fn finish(&self, entry: PendingApproval, decision: ApprovalDecision) {
        if let Some(task) = entry.timeout_task {
            task.abort();
        }

        self.emitter.publish(AgentEvent::new(
            EventType::ApprovalResolved,
            &entry.request.session_id,
            serde_json::json!({
                "request_id": entry.request.id,
                "step_id": entry.request.step_id,
                "decision": decision.to_string(),
            }),
        ));

        info!(
            request_id = %entry.request.id,
            decision = %decision,
            "Approval resolved"
        );

        // The waiter may have given up (cancellation); that is fine.
        let _ = entry.decide.send(decision);
    }
}

/// Stable fingerprint of (tool, normalized arguments).
///
/// Arguments are canonicalized with sorted object keys so key order does not
/// defeat the similarity cache.
fn action_fingerprint(tool: &str, args: &Value) -> u64 {
    let mut canonical = String::new();
    write_canonical(args, &mut canonical);

    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    tool.hash(&mut hasher);
    canonical.hash(&mut hasher);
    hasher.finish()
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for key in keys {
                out.push_str(key);
                out.push(':');
                write_canonical(&map[key], out);
                out.push(',');
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for item in items {
                write_canonical(item, out);
                out.push(',');
            }
            out.push(']');
        }
        other => out.push_str(&other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn manager() -> (Arc<ApprovalManager>, Arc<EventEmitter>) {
        let emitter = Arc::new(EventEmitter::new());
        (Arc::new(ApprovalManager::new(emitter.clone())), emitter)
    }

    fn write_action(path: &str) -> ApprovalAction {
        ApprovalAction::new(format!("Write file {}", path))
            .with_tool("write_file", json!({ "path": path, "content": "data" }))
    }

    #[tokio::test]
    async fn test_safe_actions_auto_approve() {
        let (manager, emitter) = manager();
        let mut sub = emitter.subscribe();

        let ticket = manager
            .request_approval("s1", "step_0", write_action("/tmp/a"), RiskTier::Safe, None, false)
            .await;
        assert!(matches!(ticket, ApprovalTicket::AutoApproved));
        assert!(ticket.decision().await.is_approved());

        // No approval_requested event was published
        assert!(sub.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_moderate_action_prompts_and_approves() {
        let (manager, emitter) = manager();
        let mut sub = emitter.subscribe();

        let ticket = manager
            .request_approval(
                "s1",
                "step_0",
                write_action("/tmp/a"),
                RiskTier::Moderate,
                None,
                false,
            )
            .await;
        let request_id = ticket.request_id().unwrap().to_string();

        let requested = sub.recv().await.unwrap();
        assert_eq!(requested.event_type, EventType::ApprovalRequested);

        assert!(manager.approve(&request_id, false).await);
        assert!(ticket.decision().await.is_approved());

        let resolved = sub.recv().await.unwrap();
        assert_eq!(resolved.event_type, EventType::ApprovalResolved);
        assert_eq!(resolved.data["decision"], "approved");
    }

    #[tokio::test]
    async fn test_resolve_rejected_routes_to_reject() {
        let (manager, _emitter) = manager();

        let ticket = manager
            .request_approval(
                "s1",
                "step_0",
                write_action("/tmp/a"),
                RiskTier::Moderate,
                None,
                false,
            )
            .await;
        let request_id = ticket.request_id().unwrap().to_string();

        assert!(manager.resolve(&request_id, "rejected", false).await);
        assert!(!ticket.decision().await.is_approved());
    }

    #[tokio::test]
    async fn test_resolve_twice_is_idempotent() {
        let (manager, _emitter) = manager();

        let ticket = manager
            .request_approval(
                "s1",
                "step_0",
                write_action("/tmp/a"),
                RiskTier::Moderate,
                None,
                false,
            )
            .await;
        let request_id = ticket.request_id().unwrap().to_string();

        assert!(manager.resolve(&request_id, "approved", false).await);
        // Second resolve is a no-op
        assert!(!manager.resolve(&request_id, "approved", false).await);
        assert!(!manager.resolve(&request_id, "rejected", false).await);
    }

    #[tokio::test]
    async fn test_unknown_decision_keeps_request_pending() {
        let (manager, _emitter) = manager();

        let ticket = manager
            .request_approval(
                "s1",
                "step_0",
                write_action("/tmp/a"),
                RiskTier::Moderate,
                None,
                false,
            )
            .await;
        let request_id = ticket.request_id().unwrap().to_string();

        assert!(!manager.resolve(&request_id, "shrug", false).await);
        assert_eq!(manager.pending_requests().await.len(), 1);

        // A real decision still lands afterwards
        assert!(manager.resolve(&request_id, "approved", false).await);
    }

    #[tokio::test]
    async fn test_similarity_cache_suppresses_second_prompt() {
        let (manager, emitter) = manager();
        let mut sub = emitter.subscribe();

        let first = manager
            .request_approval(
                "s1",
                "step_0",
                write_action("/tmp/a"),
                RiskTier::Moderate,
                None,
                false,
            )
            .await;
        let request_id = first.request_id().unwrap().to_string();
        manager.approve(&request_id, true).await;
        assert!(first.decision().await.is_approved());

        // Structurally identical action: auto-approved, no prompt event
        let second = manager
            .request_approval(
                "s1",
                "step_1",
                write_action("/tmp/a"),
                RiskTier::Moderate,
                None,
                false,
            )
            .await;
        assert!(matches!(second, ApprovalTicket::AutoApproved));

        // Different path: prompts again
        let third = manager
            .request_approval(
                "s1",
                "step_2",
                write_action("/tmp/other"),
                RiskTier::Moderate,
                None,
                false,
            )
            .await;
        assert!(third.request_id().is_some());

        // Events seen: requested(first), resolved(first), requested(third)
        let mut requested = 0;
        while let Some(event) = sub.try_recv() {
            if event.event_type == EventType::ApprovalRequested {
                requested += 1;
            }
        }
        assert_eq!(requested, 2);
    }

    #[tokio::test]
    async fn test_similarity_cache_is_session_scoped() {
        let (manager, _emitter) = manager();

        let first = manager
            .request_approval(
                "s1",
                "step_0",
                write_action("/tmp/a"),
                RiskTier::Moderate,
                None,
                false,
            )
            .await;
        manager
            .approve(first.request_id().unwrap(), true)
            .await;

        // Same action in another session still prompts
        let other_session = manager
            .request_approval(
                "s2",
                "step_0",
                write_action("/tmp/a"),
                RiskTier::Moderate,
                None,
                false,
            )
            .await;
        assert!(other_session.request_id().is_some());
    }

    #[tokio::test]
    async fn test_destructive_never_similarity_cached_nor_yolo_skipped() {
        let (manager, _emitter) = manager();

        let first = manager
            .request_approval(
                "s1",
                "step_0",
                write_action("/tmp/a"),
                RiskTier::Destructive,
                None,
                true, // YOLO on: destructive still prompts
            )
            .await;
        let request_id = first.request_id().expect("destructive must prompt").to_string();
        manager.approve(&request_id, true).await;

        // approve_similar was ignored for the destructive tier
        let second = manager
            .request_approval(
                "s1",
                "step_1",
                write_action("/tmp/a"),
                RiskTier::Destructive,
                None,
                true,
            )
            .await;
        assert!(second.request_id().is_some());
    }

    #[tokio::test]
    async fn test_yolo_skips_moderate_prompt() {
        let (manager, _emitter) = manager();
        let ticket = manager
            .request_approval(
                "s1",
                "step_0",
                write_action("/tmp/a"),
                RiskTier::Moderate,
                None,
                true,
            )
            .await;
        assert!(matches!(ticket, ApprovalTicket::AutoApproved));
    }

    #[tokio::test]
    async fn test_timeout_resolves_as_denial() {
        let (manager, emitter) = manager();
        let mut sub = emitter.subscribe();

        let ticket = manager
            .request_approval(
                "s1",
                "step_0",
                write_action("/tmp/a"),
                RiskTier::Moderate,
                Some(0.05),
                false,
            )
            .await;

        let decision = ticket.decision().await;
        assert_eq!(decision, ApprovalDecision::Timeout);
        assert!(!decision.is_approved());

        // approval_requested then approval_resolved with decision "timeout"
        let requested = sub.recv().await.unwrap();
        assert_eq!(requested.event_type, EventType::ApprovalRequested);
        let resolved = sub.recv().await.unwrap();
        assert_eq!(resolved.event_type, EventType::ApprovalResolved);
        assert_eq!(resolved.data["decision"], "timeout");
    }

    #[tokio::test]
    async fn test_fingerprint_ignores_key_order() {
        let a = action_fingerprint("t", &json!({ "x": 1, "y": { "b": 2, "a": 3 } }));
        let b = action_fingerprint("t", &json!({ "y": { "a": 3, "b": 2 }, "x": 1 }));
        assert_eq!(a, b);

        let c = action_fingerprint("t", &json!({ "x": 1, "y": { "b": 2, "a": 4 } }));
        assert_ne!(a, c);

        let d = action_fingerprint("other", &json!({ "x": 1, "y": { "b": 2, "a": 3 } }));
        assert_ne!(a, d);
    }
}
