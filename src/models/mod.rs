// Copyright 2025 Zileo-Chat-3 Contributors
// SPDX-License-Identifier: Apache-2.0

//! Data models shared across the core components.

pub mod approval;
pub mod plan;
pub mod session;
pub mod trace;

pub use approval::{ApprovalAction, ApprovalDecision, ApprovalRequest, ApprovalStatus};
pub use plan::{ErrorPolicy, Plan, RiskTier, Step, StepStatus};
pub use session::{CancelMode, CancelRequest, ResultMode, Session, SessionState, SessionSummary};
pub use trace::{SessionRecord, TraceEntry, TraceQuery};
