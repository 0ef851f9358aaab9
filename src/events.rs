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

//! Typed event fan-out for agent execution.
//!
//! Every state transition in the core publishes an [`AgentEvent`] through the
//! process-wide [`EventEmitter`]. Subscribers (UI, trace observers, tests)
//! each get an independent bounded buffer; a slow subscriber loses its own
//! oldest events and never blocks the publisher or its peers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;
use tracing::debug;

/// Default per-subscription buffer capacity.
pub const DEFAULT_SUBSCRIPTION_CAPACITY: usize = 100;

/// Closed set of event types emitted by the core.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    StateChange,
    PlanCreated,
    StepStarted,
    StepCompleted,
    ToolCalled,
    ToolResult,
    Message,
    Error,
    BudgetWarning,
    BudgetExceeded,
    IterationLimit,
    ApprovalRequested,
    ApprovalResolved,
    Completed,
    Cancelled,
    ModelSelected,
    ModelSwitched,
    TraceStarted,
    TraceEnded,
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            EventType::StateChange => "state_change",
            EventType::PlanCreated => "plan_created",
            EventType::StepStarted => "step_started",
            EventType::StepCompleted => "step_completed",
            EventType::ToolCalled => "tool_called",
            EventType::ToolResult => "tool_result",
            EventType::Message => "message",
            EventType::Error => "error",
            EventType::BudgetWarning => "budget_warning",
            EventType::BudgetExceeded => "budget_exceeded",
            EventType::IterationLimit => "iteration_limit",
            EventType::ApprovalRequested => "approval_requested",
            EventType::ApprovalResolved => "approval_resolved",
            EventType::Completed => "completed",
            EventType::Cancelled => "cancelled",
            EventType::ModelSelected => "model_selected",
            EventType::ModelSwitched => "model_switched",
            EventType::TraceStarted => "trace_started",
            EventType::TraceEnded => "trace_ended",
        };
        write!(f, "{}", name)
    }
}

/// A single event published during session execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentEvent {
    /// Discriminant for the payload
    pub event_type: EventType,
    /// Session this event belongs to
    pub session_id: String,
    /// Opaque payload; shape depends on `event_type`
    pub data: Value,
    /// Wall-clock publication time
    pub timestamp: DateTime<Utc>,
}

impl AgentEvent {
    /// Creates a new event stamped with the current time.
    pub fn new(event_type: EventType, session_id: impl Into<String>, data: Value) -> Self {
        Self {
            event_type,
            session_id: session_id.into(),
            data,
            timestamp: Utc::now(),
        }
    }

    /// Creates a `state_change` event.
    pub fn state_change(session_id: &str, from: &str, to: &str) -> Self {
        Self::new(
            EventType::StateChange,
            session_id,
            serde_json::json!({ "from": from, "to": to }),
        )
    }

    /// Creates an `error` event.
    pub fn error(session_id: &str, message: impl Into<String>) -> Self {
        Self::new(
            EventType::Error,
            session_id,
            serde_json::json!({ "message": message.into() }),
        )
    }

    /// Creates a `message` event (informational, user-visible).
    pub fn message(session_id: &str, content: impl Into<String>) -> Self {
        Self::new(
            EventType::Message,
            session_id,
            serde_json::json!({ "content": content.into() }),
        )
    }
}

/// State shared between the emitter and one subscription.
struct SubscriberShared {
    queue: Mutex<VecDeque<AgentEvent>>,
    notify: Notify,
    closed: AtomicBool,
    capacity: usize,
    dropped: AtomicU64,
}

impl SubscriberShared {
    fn push(&self, event: AgentEvent) {
        let mut queue = self
            .queue
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if queue.len() >= self.capacity {
            // Oldest undelivered event is sacrificed for this subscriber only
            queue.pop_front();
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
        queue.push_back(event);
        drop(queue);
        self.notify.notify_one();
    }
}

/// Handle to a stream of published events.
///
/// Events arrive in publication order. After [`close`](Self::close) (or drop)
/// the buffer is released; `recv` drains what was already queued, then
/// returns `None`.
pub struct EventSubscription {
    shared: Arc<SubscriberShared>,
}

impl EventSubscription {
    /// Receives the next event, waiting if the buffer is empty.
    ///
    /// Returns `None` once the subscription is closed and drained.
    pub async fn recv(&mut self) -> Option<AgentEvent> {
        loop {
            // Register interest before checking the queue so a publish
            // between the check and the await still wakes us.
            let notified = self.shared.notify.notified();

            if let Some(event) = self.pop() {
                return Some(event);
            }
            if self.shared.closed.load(Ordering::Acquire) {
                return None;
            }

            notified.await;
        }
    }

    /// Returns the next buffered event without waiting.
    pub fn try_recv(&mut self) -> Option<AgentEvent> {
        self.pop()
    }

    /// Number of events dropped from this subscription's buffer so far.
    pub fn dropped_count(&self) -> u64 {
        self.shared.dropped.load(Ordering::Relaxed)
    }

    /// Closes the subscription. Buffered events remain readable.
    pub fn close(&self) {
        self.shared.closed.store(true, Ordering::Release);
        self.shared.notify.notify_waiters();
    }

    fn pop(&self) -> Option<AgentEvent> {
        self.shared
            .queue
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .pop_front()
    }
}

impl Drop for EventSubscription {
    fn drop(&mut self) {
        self.close();
    }
}

/// Bounded multi-subscriber event fan-out.
///
/// `publish` is synchronous and never blocks on a slow subscriber: each
/// subscription owns an independent bounded queue (default capacity
/// [`DEFAULT_SUBSCRIPTION_CAPACITY`]) with drop-oldest overflow.
///
/// # Thread Safety
///
/// Safe to share via `Arc<EventEmitter>`; multiple publishers may call
/// concurrently, and subscribe/close may overlap publishes.
pub struct EventEmitter {
    subscribers: Mutex<Vec<Arc<SubscriberShared>>>,
    capacity: usize,
}

impl EventEmitter {
    /// Creates an emitter with the default per-subscription capacity.
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_SUBSCRIPTION_CAPACITY)
    }

    /// Creates an emitter with a custom per-subscription capacity.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            subscribers: Mutex::new(Vec::new()),
            capacity: capacity.max(1),
        }
    }

    /// Publishes an event to every live subscription.
    ///
    /// Returns immediately; closed subscriptions are pruned in passing.
    pub fn publish(&self, event: AgentEvent) {
        let mut subscribers = self
            .subscribers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        subscribers.retain(|shared| !shared.closed.load(Ordering::Acquire));

        match subscribers.len() {
            0 => {}
            1 => subscribers[0].push(event),
            _ => {
                for shared in subscribers.iter() {
                    shared.push(event.clone());
                }
            }
        }
    }

    /// Registers a new subscription starting at the next published event.
    pub fn subscribe(&self) -> EventSubscription {
        let shared = Arc::new(SubscriberShared {
            queue: Mutex::new(VecDeque::with_capacity(self.capacity.min(16))),
            notify: Notify::new(),
            closed: AtomicBool::new(false),
            capacity: self.capacity,
            dropped: AtomicU64::new(0),
        });

        let mut subscribers = self
            .subscribers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        subscribers.push(shared.clone());
        debug!(subscriber_count = subscribers.len(), "Event subscriber added");

        EventSubscription { shared }
    }

    /// Number of live subscriptions.
    pub fn subscriber_count(&self) -> usize {
        let mut subscribers = self
            .subscribers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        subscribers.retain(|shared| !shared.closed.load(Ordering::Acquire));
        subscribers.len()
    }
}

impl Default for EventEmitter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_type_serialization() {
        let json = serde_json::to_string(&EventType::PlanCreated).unwrap();
        assert_eq!(json, "\"plan_created\"");

        let json = serde_json::to_string(&EventType::BudgetExceeded).unwrap();
        assert_eq!(json, "\"budget_exceeded\"");

        let parsed: EventType = serde_json::from_str("\"approval_requested\"").unwrap();
        assert_eq!(parsed, EventType::ApprovalRequested);
    }

    #[test]
    fn test_event_type_display_matches_serde() {
        for event_type in [
            EventType::StateChange,
            EventType::StepStarted,
            EventType::ToolResult,
            EventType::ModelSwitched,
            EventType::TraceEnded,
        ] {
            let display = event_type.to_string();
            let json = serde_json::to_string(&event_type).unwrap();
            assert_eq!(json, format!("\"{}\"", display));
        }
    }

    #[tokio::test]
    async fn test_publish_and_recv_in_order() {
        let emitter = EventEmitter::new();
        let mut sub = emitter.subscribe();

        for i in 0..5 {
            emitter.publish(AgentEvent::new(
                EventType::Message,
                "s1",
                serde_json::json!({ "n": i }),
            ));
        }

        for i in 0..5 {
            let event = sub.recv().await.expect("event expected");
            assert_eq!(event.data["n"], i);
            assert_eq!(event.session_id, "s1");
        }
    }

    #[tokio::test]
    async fn test_slow_subscriber_drops_oldest() {
        let emitter = EventEmitter::with_capacity(3);
        let mut sub = emitter.subscribe();

        for i in 0..10 {
            emitter.publish(AgentEvent::new(
                EventType::Message,
                "s1",
                serde_json::json!({ "n": i }),
            ));
        }

        // Only the 3 newest events survive; publication order is preserved.
        let mut seen = Vec::new();
        while let Some(event) = sub.try_recv() {
            seen.push(event.data["n"].as_i64().unwrap());
        }
        assert_eq!(seen, vec![7, 8, 9]);
        assert_eq!(sub.dropped_count(), 7);
    }

    #[tokio::test]
    async fn test_slow_subscriber_does_not_affect_others() {
        let emitter = EventEmitter::with_capacity(2);
        let mut slow = emitter.subscribe();
        let fast_emitter = Arc::new(emitter);

        for i in 0..4 {
            fast_emitter.publish(AgentEvent::new(
                EventType::Message,
                "s1",
                serde_json::json!({ "n": i }),
            ));
        }

        // A subscriber created later sees only subsequent events
        let mut late = fast_emitter.subscribe();
        fast_emitter.publish(AgentEvent::message("s1", "tail"));

        // The slow buffer kept the newest two: event 3 and the tail
        assert_eq!(slow.recv().await.unwrap().data["n"], 3);
        assert_eq!(late.recv().await.unwrap().data["content"], "tail");
    }

    #[tokio::test]
    async fn test_recv_returns_none_after_close() {
        let emitter = EventEmitter::new();
        let mut sub = emitter.subscribe();

        emitter.publish(AgentEvent::message("s1", "queued"));
        sub.close();

        // Buffered event is still delivered, then the stream ends
        assert!(sub.recv().await.is_some());
        assert!(sub.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_closed_subscription_is_pruned() {
        let emitter = EventEmitter::new();
        let sub = emitter.subscribe();
        assert_eq!(emitter.subscriber_count(), 1);

        drop(sub);
        assert_eq!(emitter.subscriber_count(), 0);

        // Publishing to an empty emitter is a no-op
        emitter.publish(AgentEvent::message("s1", "nobody listening"));
    }

    #[tokio::test]
    async fn test_recv_wakes_on_publish() {
        let emitter = Arc::new(EventEmitter::new());
        let mut sub = emitter.subscribe();

        let publisher = emitter.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            publisher.publish(AgentEvent::message("s1", "wakeup"));
        });

        let event = sub.recv().await.expect("event expected");
        assert_eq!(event.data["content"], "wakeup");
        handle.await.unwrap();
    }
}
