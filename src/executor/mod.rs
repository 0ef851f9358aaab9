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

//! Executor: runs plans step by step.
//!
//! Drives the session state machine (`idle -> planning -> executing ->
//! completed | failed | cancelled`), gating risky steps through the approval
//! manager, pre-charging the token budget, retrying failed tools with
//! backoff, honoring cooperative cancellation at every suspension point, and
//! recording every transition in the trace store.

use crate::approval::ApprovalManager;
use crate::budget::TokenBudget;
use crate::config::CoreConfig;
use crate::events::{AgentEvent, EventEmitter, EventType};
use crate::llm::{estimate_tokens, pricing, with_retry, ChatConfig, ChatMessage, Gateway, RetryConfig};
use crate::models::approval::ApprovalAction;
use crate::models::plan::{ErrorPolicy, Plan, RiskTier, Step, StepStatus};
use crate::models::session::{
    CancelMode, CancelRequest, ResultMode, Session, SessionState, SessionSummary,
};
use crate::models::trace::TraceEntry;
use crate::planner::Planner;
use crate::tools::{ToolError, ToolRegistry};
use crate::trace::TraceStore;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Instant;
use tokio::sync::{watch, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

/// Bounded retries for schema-validation self-correction.
const SCHEMA_CORRECTION_RETRIES: u32 = 2;

/// Template placeholder: `{{step_0}}` is replaced with that step's output.
static TEMPLATE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\{\{\s*([A-Za-z0-9_.-]+)\s*\}\}").expect("valid template regex"));

/// Cancellation preferences attached to a session by `cancel`.
#[derive(Debug, Clone, Copy)]
struct CancelPrefs {
    mode: CancelMode,
    result: ResultMode,
}

/// Per-session control block shared between the executor task and the API.
struct SessionHandle {
    id: String,
    task: String,
    cancel_token: CancellationToken,
    cancel_prefs: StdMutex<Option<CancelPrefs>>,
    state_tx: watch::Sender<SessionState>,
    summary: StdMutex<Option<SessionSummary>>,
    /// Read-only view of the session served to observers
    snapshot: StdMutex<Session>,
}

impl SessionHandle {
    fn new(id: String, task: String) -> Self {
        let (state_tx, _) = watch::channel(SessionState::Idle);
        Self {
            snapshot: StdMutex::new(Session::new(id.clone(), task.clone())),
            id,
            task,
            cancel_token: CancellationToken::new(),
            cancel_prefs: StdMutex::new(None),
            state_tx,
            summary: StdMutex::new(None),
        }
    }

    fn cancel_prefs(&self) -> Option<CancelPrefs> {
        *self
            .cancel_prefs
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn state(&self) -> SessionState {
        *self.state_tx.borrow()
    }

    fn update_snapshot(&self, update: impl FnOnce(&mut Session)) {
        let mut snapshot = self
            .snapshot
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        update(&mut snapshot);
    }

    fn snapshot(&self) -> Session {
        self.snapshot
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

/// Everything the step loop carries per session.
struct SessionRun {
    handle: Arc<SessionHandle>,
    plan: Plan,
    budget: TokenBudget,
    /// Step outputs for template substitution, keyed by step id
    context: HashMap<String, String>,
    iteration: u32,
    total_cost: f64,
    started: Instant,
    /// Steps that never started because of cancellation
    cancelled_steps: Vec<String>,
    rollback_intended: bool,
}

/// How the step loop ended.
enum LoopOutcome {
    AllStepsTerminal,
    Cancelled,
    Failed(String),
}

/// Plan runner and session owner.
///
/// Process-wide; owns every live session exclusively. The UI interacts
/// through `submit`, `cancel`, the approval manager's `resolve`, and
/// read-only trace queries.
pub struct Executor {
    registry: Arc<ToolRegistry>,
    emitter: Arc<EventEmitter>,
    approval: Arc<ApprovalManager>,
    trace: Arc<TraceStore>,
    planner: Arc<Planner>,
    gateway: Arc<dyn Gateway>,
    config: CoreConfig,
    sessions: RwLock<HashMap<String, Arc<SessionHandle>>>,
    tool_retry: RetryConfig,
}

impl Executor {
    /// Creates an executor over the shared services.
    pub fn new(
        registry: Arc<ToolRegistry>,
        emitter: Arc<EventEmitter>,
        approval: Arc<ApprovalManager>,
        trace: Arc<TraceStore>,
        planner: Arc<Planner>,
        gateway: Arc<dyn Gateway>,
        config: CoreConfig,
    ) -> Self {
        Self {
            registry,
            emitter,
            approval,
            trace,
            planner,
            gateway,
            config,
            sessions: RwLock::new(HashMap::new()),
            // Max three attempts per tool call
            tool_retry: RetryConfig::new(2, 500, 5_000),
        }
    }

    /// Submits a task; returns the new session id immediately.
    ///
    /// The session runs on its own spawned task; observe progress through
    /// the emitter or await the terminal summary with [`wait`](Self::wait).
    pub async fn submit(self: &Arc<Self>, task: &str) -> String {
        let session_id = Uuid::new_v4().to_string();
        let handle = Arc::new(SessionHandle::new(session_id.clone(), task.to_string()));

        {
            let mut sessions = self.sessions.write().await;
            sessions.insert(session_id.clone(), handle.clone());
        }

        info!(session_id = %session_id, "Session submitted");

        let executor = Arc::clone(self);
        tokio::spawn(async move {
            executor.run_session(handle).await;
        });

        session_id
    }

    /// Requests cancellation of a session.
    ///
    /// Returns false when the session is unknown or already terminal.
    pub async fn cancel(&self, request: CancelRequest) -> bool {
        let handle = {
            let sessions = self.sessions.read().await;
            sessions.get(&request.session_id).cloned()
        };
        let Some(handle) = handle else {
            warn!(session_id = %request.session_id, "Cancel for unknown session");
            return false;
        };
        if handle.state().is_terminal() {
            return false;
        }

        info!(
            session_id = %request.session_id,
            cancel_mode = ?request.cancel_mode,
            result_mode = ?request.result_mode,
            "Cancellation requested"
        );

        {
            let mut prefs = handle
                .cancel_prefs
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            *prefs = Some(CancelPrefs {
                mode: request.cancel_mode,
                result: request.result_mode,
            });
        }

        if request.cancel_mode == CancelMode::Immediate {
            // Wake every pending await; after_current lets the step finish
            handle.cancel_token.cancel();
        }

        true
    }

    /// Current state of a session.
    pub async fn state(&self, session_id: &str) -> Option<SessionState> {
        let sessions = self.sessions.read().await;
        sessions.get(session_id).map(|h| h.state())
    }

    /// Read-only snapshot of a session (for the UI; plan state is never
    /// mutated through this view).
    pub async fn session_snapshot(&self, session_id: &str) -> Option<Session> {
        let sessions = self.sessions.read().await;
        sessions.get(session_id).map(|h| h.snapshot())
    }

    /// Awaits a session's terminal state and returns its summary.
    pub async fn wait(&self, session_id: &str) -> Option<SessionSummary> {
        let handle = {
            let sessions = self.sessions.read().await;
            sessions.get(session_id).cloned()
        }?;

        let mut rx = handle.state_tx.subscribe();
        loop {
            if rx.borrow().is_terminal() {
                break;
            }
            if rx.changed().await.is_err() {
                break;
            }
        }

        handle
            .summary
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Drops a terminal session's control block.
    pub async fn purge_session(&self, session_id: &str) -> bool {
        let mut sessions = self.sessions.write().await;
        match sessions.get(session_id) {
            Some(handle) if handle.state().is_terminal() => {
                sessions.remove(session_id);
                true
            }
            _ => false,
        }
    }

    // =========================================================================
    // Session driver
    // =========================================================================

    #[instrument(name = "executor_run_session", skip_all, fields(session_id = %handle.id))]
    async fn run_session(self: Arc<Self>, handle: Arc<SessionHandle>) {
        let session_id = handle.id.clone();
        let task = handle.task.clone();

        if let Err(e) = self.trace.start_session(&session_id, &task).await {
            warn!(error = %e, "Failed to open trace session");
        }
        self.record(
            &session_id,
            EventType::TraceStarted,
            serde_json::json!({ "task": task }),
        )
        .await;

        let budget = TokenBudget::with_warn_threshold(
            self.config.default_token_budget,
            self.config.warn_threshold,
        );

        self.transition(&handle, SessionState::Idle, SessionState::Planning)
            .await;

        // Planning is a suspension point; immediate cancellation interrupts it
        let outcome = tokio::select! {
            outcome = self.planner.plan(&session_id, &task) => Some(outcome),
            _ = handle.cancel_token.cancelled() => None,
        };

        let Some(outcome) = outcome else {
            self.finish_cancelled(
                &handle,
                SessionState::Planning,
                Plan::new(&task, vec![Step::new("step_0", task.clone())]),
                &budget,
                0.0,
                Vec::new(),
            )
            .await;
            return;
        };

        let mut run = SessionRun {
            handle: handle.clone(),
            plan: outcome.plan,
            budget,
            context: HashMap::new(),
            iteration: 0,
            total_cost: 0.0,
            started: Instant::now(),
            cancelled_steps: Vec::new(),
            rollback_intended: false,
        };
        {
            let plan = run.plan.clone();
            handle.update_snapshot(|s| s.plan = Some(plan));
        }

        // The planner's LLM call counts against budget and iterations
        let planning_tokens = outcome.tokens_input + outcome.tokens_output;
        if planning_tokens > 0 {
            run.iteration += 1;
            if let Some(model) = &outcome.model {
                run.total_cost +=
                    pricing::cost_for_call(model, outcome.tokens_input, outcome.tokens_output);
            }
            if !self
                .charge(&mut run, planning_tokens, "planning")
                .await
            {
                self.finish_failed(&mut run, SessionState::Planning, "token budget exceeded during planning")
                    .await;
                return;
            }
        }

        self.transition(&handle, SessionState::Planning, SessionState::Executing)
            .await;

        let outcome = self.run_steps(&mut run).await;

        match outcome {
            LoopOutcome::AllStepsTerminal => {
                self.finish_terminal(&mut run, SessionState::Completed, None)
                    .await;
            }
            LoopOutcome::Cancelled => {
                let prefs = handle.cancel_prefs();
                run.rollback_intended =
                    matches!(prefs.map(|p| p.result), Some(ResultMode::Rollback));
                self.finish_terminal(&mut run, SessionState::Cancelled, None)
                    .await;
            }
            LoopOutcome::Failed(reason) => {
                self.finish_terminal(&mut run, SessionState::Failed, Some(reason))
                    .await;
            }
        }
    }

    /// Runs steps in dependency-respecting order until a terminal condition.
    async fn run_steps(&self, run: &mut SessionRun) -> LoopOutcome {
        loop {
            // Suspension-point bookkeeping, checked every loop iteration
            if run.started.elapsed().as_secs() > self.config.session_timeout_secs {
                self.emit(
                    &run.handle.id,
                    AgentEvent::error(&run.handle.id, "session wall-clock timeout exceeded"),
                )
                .await;
                return LoopOutcome::Failed("session timeout".to_string());
            }

            if let Some(prefs) = run.handle.cancel_prefs() {
                // Both modes stop before starting another step
                self.collect_cancelled_pending(run);
                debug!(mode = ?prefs.mode, "Cancellation honored between steps");
                return LoopOutcome::Cancelled;
            }

            let Some(step_index) = Self::next_ready_step(&mut run.plan) else {
                return LoopOutcome::AllStepsTerminal;
            };

            match self.execute_step(run, step_index).await {
                StepOutcome::Advance => {}
                StepOutcome::Cancelled => {
                    self.collect_cancelled_pending(run);
                    return LoopOutcome::Cancelled;
                }
                StepOutcome::FailSession(reason) => return LoopOutcome::Failed(reason),
            }
        }
    }

    /// Picks the first pending step whose dependencies are all terminal.
    ///
    /// A completed or skipped dependency satisfies the edge; a failed one
    /// makes the dependent unrunnable, and it is marked skipped in passing.
    /// Returns `None` when no pending steps remain.
    fn next_ready_step(plan: &mut Plan) -> Option<usize> {
        loop {
            let mut blocked_by_failure: Option<usize> = None;
            let mut ready: Option<usize> = None;

            let statuses: HashMap<String, StepStatus> = plan
                .steps
                .iter()
                .map(|s| (s.id.clone(), s.status))
                .collect();

            for (index, step) in plan.steps.iter().enumerate() {
                if step.status != StepStatus::Pending {
                    continue;
                }
                let dep_failed = step
                    .depends_on
                    .iter()
                    .any(|d| matches!(statuses.get(d), Some(StepStatus::Failed)));
                if dep_failed {
                    blocked_by_failure = Some(index);
                    continue;
                }
                let all_terminal = step
                    .depends_on
                    .iter()
                    .all(|d| statuses.get(d).map(|s| s.is_terminal()).unwrap_or(true));
                if all_terminal {
                    ready = Some(index);
                    break;
                }
            }

            if let Some(index) = ready {
                return Some(index);
            }
            if let Some(index) = blocked_by_failure {
                // Unresolvable: propagate skip and keep scanning
                plan.steps[index].status = StepStatus::Skipped;
                continue;
            }
            return None;
        }
    }

    /// Marks every still-pending step as cancelled-before-start.
    fn collect_cancelled_pending(&self, run: &mut SessionRun) {
        for step in &run.plan.steps {
            if step.status == StepStatus::Pending {
                run.cancelled_steps.push(step.id.clone());
            }
        }
    }

    // =========================================================================
    // Single-step execution
    // =========================================================================

    async fn execute_step(&self, run: &mut SessionRun, step_index: usize) -> StepOutcome {
        let session_id = run.handle.id.clone();
        let step = run.plan.steps[step_index].clone();
        let step_started = Instant::now();

        run.plan.steps[step_index].status = StepStatus::Running;
        self.record(
            &session_id,
            EventType::StepStarted,
            serde_json::json!({ "step_id": step.id, "description": step.description }),
        )
        .await;

        // Effective risk: the step's own tier, raised by the tool's trust
        let registered = match &step.tool {
            Some(name) => self.registry.get_tool(name).await,
            None => None,
        };
        let implied = registered
            .as_ref()
            .map(|t| t.definition.trust.implied_risk())
            .unwrap_or(RiskTier::Safe);
        let risk = std::cmp::max_by_key(step.risk, implied, |r| match r {
            RiskTier::Safe => 0,
            RiskTier::Moderate => 1,
            RiskTier::Destructive => 2,
        });

        // Approval gate (a suspension point: cancellable while waiting)
        let action = ApprovalAction::new(step.description.clone()).with_tool(
            step.tool.clone().unwrap_or_else(|| "none".to_string()),
            step.args.clone().unwrap_or(Value::Null),
        );
        let ticket = self
            .approval
            .request_approval(&session_id, &step.id, action, risk, None, self.config.yolo)
            .await;

        let cancel_token = run.handle.cancel_token.clone();
        let decision = tokio::select! {
            decision = ticket.decision() => Some(decision),
            _ = cancel_token.cancelled() => None,
        };
        let Some(decision) = decision else {
            return self.step_interrupted(run, step_index, step_started).await;
        };

        if !decision.is_approved() {
            run.plan.steps[step_index].status = StepStatus::Skipped;
            self.record(
                &session_id,
                EventType::StepCompleted,
                serde_json::json!({
                    "step_id": step.id,
                    "status": "skipped",
                    "reason": format!("approval {}", decision),
                }),
            )
            .await;
            return StepOutcome::Advance;
        }

        // Pre-charge the estimate; reconciled after the call
        let args = step.args.clone().unwrap_or(Value::Null);
        let args = substitute_templates(&args, &run.context);
        let estimate = estimate_tokens(&step.description) + estimate_tokens(&args.to_string());
        if !self.charge_step(run, step_index, estimate).await {
            return StepOutcome::FailSession("token budget exceeded".to_string());
        }

        // Resolve the tool
        let Some(tool_name) = step.tool.clone() else {
            // Reasoning-only step: nothing to invoke
            run.budget.refund(estimate);
            run.plan.steps[step_index].status = StepStatus::Completed;
            run.context
                .insert(step.id.clone(), step.description.clone());
            self.record(
                &session_id,
                EventType::StepCompleted,
                serde_json::json!({ "step_id": step.id, "status": "completed" }),
            )
            .await;
            return StepOutcome::Advance;
        };

        let Some(registered) = registered else {
            run.budget.refund(estimate);
            run.plan.steps[step_index].status = StepStatus::Failed;
            self.emit(
                &session_id,
                AgentEvent::error(
                    &session_id,
                    format!("tool '{}' not found in registry", tool_name),
                ),
            )
            .await;
            self.record(
                &session_id,
                EventType::StepCompleted,
                serde_json::json!({
                    "step_id": step.id,
                    "status": "failed",
                    "reason": "tool_not_found",
                }),
            )
            .await;
            return self.apply_error_policy(run, format!("tool '{}' not found", tool_name));
        };

        // Iteration ceiling counts every LLM turn and tool call
        run.iteration += 1;
        if run.iteration > self.config.default_iteration_limit {
            run.budget.refund(estimate);
            self.record(
                &session_id,
                EventType::IterationLimit,
                serde_json::json!({
                    "limit": self.config.default_iteration_limit,
                    "step_id": step.id,
                }),
            )
            .await;
            run.plan.steps[step_index].status = StepStatus::Failed;
            return StepOutcome::FailSession("iteration limit reached".to_string());
        }

        self.record(
            &session_id,
            EventType::ToolCalled,
            serde_json::json!({ "step_id": step.id, "tool": tool_name, "args": args }),
        )
        .await;

        // Invoke with schema self-correction, then backoff retries
        let invoked = tokio::select! {
            outcome = self.invoke_tool(run, &step.id, &registered.invoker, &registered.definition.input_schema, args.clone()) => Some(outcome),
            _ = cancel_token.cancelled() => None,
        };
        let Some(invoked) = invoked else {
            run.budget.refund(estimate);
            return self.step_interrupted(run, step_index, step_started).await;
        };

        let duration_ms = step_started.elapsed().as_millis() as u64;

        let result = match invoked {
            InvokeOutcome::Finished(result) => result,
            InvokeOutcome::IterationLimitReached => {
                run.budget.refund(estimate);
                run.plan.steps[step_index].status = StepStatus::Failed;
                self.record(
                    &session_id,
                    EventType::StepCompleted,
                    serde_json::json!({
                        "step_id": step.id,
                        "status": "failed",
                        "reason": "iteration_limit",
                        "duration_ms": duration_ms,
                    }),
                )
                .await;
                return StepOutcome::FailSession("iteration limit reached".to_string());
            }
            InvokeOutcome::BudgetExhausted => {
                run.plan.steps[step_index].status = StepStatus::Failed;
                self.record(
                    &session_id,
                    EventType::StepCompleted,
                    serde_json::json!({
                        "step_id": step.id,
                        "status": "failed",
                        "reason": "budget_exceeded",
                        "duration_ms": duration_ms,
                    }),
                )
                .await;
                return StepOutcome::FailSession("token budget exceeded".to_string());
            }
        };

        match result {
            Ok(output) => {
                // Reconcile: replace the estimate with reported actuals
                let actual_input = output["tokens_input"].as_u64();
                let actual_output = output["tokens_output"].as_u64();
                if let (Some(input), Some(out)) = (actual_input, actual_output) {
                    run.budget.refund(estimate);
                    if !self.charge_step(run, step_index, input + out).await {
                        return StepOutcome::FailSession("token budget exceeded".to_string());
                    }
                    if let Some(model) = output["model"].as_str() {
                        run.total_cost += pricing::cost_for_call(model, input, out);
                    }
                }

                let output_text = output_as_text(&output);
                run.context.insert(step.id.clone(), output_text.clone());
                run.plan.steps[step_index].status = StepStatus::Completed;

                self.emit(
                    &session_id,
                    AgentEvent::new(
                        EventType::ToolResult,
                        &session_id,
                        serde_json::json!({
                            "step_id": step.id,
                            "tool": tool_name,
                            "output": output,
                        }),
                    ),
                )
                .await;
                self.save_entry(
                    TraceEntry::new(
                        &session_id,
                        EventType::ToolResult,
                        serde_json::json!({ "step_id": step.id, "tool": tool_name }),
                    )
                    .with_duration_ms(duration_ms)
                    .with_raw_io(Some(args.to_string()), Some(output_text)),
                )
                .await;

                self.record(
                    &session_id,
                    EventType::StepCompleted,
                    serde_json::json!({
                        "step_id": step.id,
                        "status": "completed",
                        "duration_ms": duration_ms,
                    }),
                )
                .await;
                StepOutcome::Advance
            }
            Err(e) => {
                run.plan.steps[step_index].status = StepStatus::Failed;
                self.emit(
                    &session_id,
                    AgentEvent::error(&session_id, format!("step '{}' failed: {}", step.id, e)),
                )
                .await;
                self.record(
                    &session_id,
                    EventType::StepCompleted,
                    serde_json::json!({
                        "step_id": step.id,
                        "status": "failed",
                        "reason": e.to_string(),
                        "duration_ms": duration_ms,
                    }),
                )
                .await;
                self.apply_error_policy(run, e.to_string())
            }
        }
    }

    /// Invokes a tool with backoff retries and bounded schema self-correction.
    ///
    /// Each correction turn is a real LLM call, so it is charged against the
    /// session budget and counted toward the iteration ceiling like any
    /// other turn; hitting either limit mid-correction ends the step.
    async fn invoke_tool(
        &self,
        run: &mut SessionRun,
        step_id: &str,
        tool: &Arc<dyn crate::tools::Tool>,
        input_schema: &Value,
        mut args: Value,
    ) -> InvokeOutcome {
        let mut schema_attempts = 0;

        loop {
            let call_args = args.clone();
            let result = with_retry(
                || tool.execute(call_args.clone()),
                &self.tool_retry,
                |e: &ToolError| e.is_retryable(),
            )
            .await;

            match result {
                Err(ToolError::InvalidInput(msg)) | Err(ToolError::SchemaValidation(msg))
                    if schema_attempts < SCHEMA_CORRECTION_RETRIES =>
                {
                    schema_attempts += 1;
                    debug!(
                        attempt = schema_attempts,
                        error = %msg,
                        "Asking the model to correct tool arguments"
                    );
                    match self
                        .correct_args(run, step_id, input_schema, &args, &msg)
                        .await
                    {
                        CorrectionOutcome::Corrected(corrected) => args = corrected,
                        CorrectionOutcome::Unusable => {
                            return InvokeOutcome::Finished(Err(ToolError::ExecutionFailed(msg)))
                        }
                        CorrectionOutcome::IterationLimitReached => {
                            return InvokeOutcome::IterationLimitReached
                        }
                        CorrectionOutcome::BudgetExhausted => {
                            return InvokeOutcome::BudgetExhausted
                        }
                    }
                }
                other => return InvokeOutcome::Finished(other),
            }
        }
    }

    /// One structured-feedback LLM call to repair invalid tool arguments.
    ///
    /// The turn counts against the iteration ceiling and is charged with the
    /// usual pre-charge/reconcile discipline before the corrected arguments
    /// are accepted.
    async fn correct_args(
        &self,
        run: &mut SessionRun,
        step_id: &str,
        schema: &Value,
        args: &Value,
        error: &str,
    ) -> CorrectionOutcome {
        run.iteration += 1;
        if run.iteration > self.config.default_iteration_limit {
            self.record(
                &run.handle.id,
                EventType::IterationLimit,
                serde_json::json!({
                    "limit": self.config.default_iteration_limit,
                    "step_id": step_id,
                    "while": "schema_correction",
                }),
            )
            .await;
            return CorrectionOutcome::IterationLimitReached;
        }

        let feedback = format!(
            "--- SCHEMA ---\n{}\n--- ARGUMENTS ---\n{}\n--- ERROR ---\n{}\n--- END ---",
            schema, args, error
        );
        let estimate = estimate_tokens(&feedback);
        if !self.charge(run, estimate, "schema_correction").await {
            return CorrectionOutcome::BudgetExhausted;
        }

        let messages = vec![
            ChatMessage::system(
                "Tool arguments failed validation. Reply with ONLY the corrected \
                 JSON argument object, nothing else.",
            ),
            ChatMessage::user(feedback),
        ];

        let response = match self.gateway.chat(&messages, &ChatConfig::default()).await {
            Ok(response) => response,
            Err(e) => {
                run.budget.refund(estimate);
                warn!(error = %e, "Argument correction call failed");
                return CorrectionOutcome::Unusable;
            }
        };

        // Reconcile: replace the estimate with what the turn actually cost
        run.budget.refund(estimate);
        if !self
            .charge(
                run,
                response.tokens_input + response.tokens_output,
                "schema_correction",
            )
            .await
        {
            return CorrectionOutcome::BudgetExhausted;
        }
        run.total_cost += pricing::cost_for_call(
            &response.model,
            response.tokens_input,
            response.tokens_output,
        );

        self.emit(
            &run.handle.id,
            AgentEvent::message(&run.handle.id, "retrying tool call with corrected arguments"),
        )
        .await;

        let content = response.content;
        let (Some(start), Some(end)) = (content.find('{'), content.rfind('}')) else {
            return CorrectionOutcome::Unusable;
        };
        if end <= start {
            return CorrectionOutcome::Unusable;
        }
        match serde_json::from_str(&content[start..=end]) {
            Ok(corrected) => CorrectionOutcome::Corrected(corrected),
            Err(_) => CorrectionOutcome::Unusable,
        }
    }

    /// Immediate-mode interruption of a running step.
    async fn step_interrupted(
        &self,
        run: &mut SessionRun,
        step_index: usize,
        step_started: Instant,
    ) -> StepOutcome {
        let step_id = run.plan.steps[step_index].id.clone();
        run.plan.steps[step_index].status = StepStatus::Failed;
        self.record(
            &run.handle.id,
            EventType::StepCompleted,
            serde_json::json!({
                "step_id": step_id,
                "status": "failed",
                "reason": "cancelled",
                "duration_ms": step_started.elapsed().as_millis() as u64,
            }),
        )
        .await;
        StepOutcome::Cancelled
    }

    fn apply_error_policy(&self, run: &SessionRun, reason: String) -> StepOutcome {
        match run.plan.error_policy {
            ErrorPolicy::Stop => StepOutcome::FailSession(reason),
            ErrorPolicy::Continue | ErrorPolicy::Retry => StepOutcome::Advance,
        }
    }

    // =========================================================================
    // Budget helpers
    // =========================================================================

    /// Charges tokens, emitting `budget_warning` on the threshold crossing.
    /// Returns false (after emitting `budget_exceeded`) when the charge fails.
    async fn charge(&self, run: &mut SessionRun, tokens: u64, what: &str) -> bool {
        match run.budget.consume(tokens) {
            Ok(consumption) => {
                if consumption.crossed_warn_threshold {
                    self.record(
                        &run.handle.id,
                        EventType::BudgetWarning,
                        serde_json::json!({
                            "used": consumption.used,
                            "max": run.budget.max(),
                        }),
                    )
                    .await;
                }
                true
            }
            Err(e) => {
                warn!(what = %what, error = %e, "Budget exhausted");
                self.record(
                    &run.handle.id,
                    EventType::BudgetExceeded,
                    serde_json::json!({
                        "requested": tokens,
                        "used": run.budget.used(),
                        "max": run.budget.max(),
                        "while": what,
                    }),
                )
                .await;
                false
            }
        }
    }

    /// Charge variant that marks the step failed when the budget trips.
    async fn charge_step(&self, run: &mut SessionRun, step_index: usize, tokens: u64) -> bool {
        let step_id = run.plan.steps[step_index].id.clone();
        if self.charge(run, tokens, &step_id).await {
            return true;
        }
        run.plan.steps[step_index].status = StepStatus::Failed;
        self.record(
            &run.handle.id,
            EventType::StepCompleted,
            serde_json::json!({
                "step_id": step_id,
                "status": "failed",
                "reason": "budget_exceeded",
            }),
        )
        .await;
        false
    }

    // =========================================================================
    // Terminal handling
    // =========================================================================

    async fn finish_cancelled(
        &self,
        handle: &Arc<SessionHandle>,
        from: SessionState,
        plan: Plan,
        budget: &TokenBudget,
        total_cost: f64,
        cancelled_steps: Vec<String>,
    ) {
        let prefs = handle.cancel_prefs();
        let summary = SessionSummary {
            session_id: handle.id.clone(),
            goal: plan.goal.clone(),
            state: SessionState::Cancelled,
            steps_completed: Vec::new(),
            steps_skipped: Vec::new(),
            steps_failed: Vec::new(),
            steps_cancelled: cancelled_steps,
            tokens_used: budget.used(),
            tokens_remaining: budget.remaining(),
            total_cost,
            rollback_intended: matches!(prefs.map(|p| p.result), Some(ResultMode::Rollback)),
            explanation: None,
        };
        self.seal(handle, from, SessionState::Cancelled, summary)
            .await;
    }

    async fn finish_failed(&self, run: &mut SessionRun, from: SessionState, reason: &str) {
        self.emit(
            &run.handle.id,
            AgentEvent::error(&run.handle.id, reason.to_string()),
        )
        .await;
        let summary = self.build_summary(run, SessionState::Failed, Some(reason.to_string()));
        let handle = run.handle.clone();
        self.seal(&handle, from, SessionState::Failed, summary).await;
    }

    async fn finish_terminal(
        &self,
        run: &mut SessionRun,
        state: SessionState,
        failure_reason: Option<String>,
    ) {
        let mut summary = self.build_summary(run, state, failure_reason);

        // A short wrap-up from the model; never retried, canned on failure
        if state == SessionState::Completed && self.gateway.is_configured() {
            if let Some(text) = self.explain(run, &summary).await {
                summary.explanation = Some(text);
            }
        }
        if summary.explanation.is_none() {
            summary.explanation = Some(format!(
                "Session {}: {} of {} steps completed.",
                state,
                summary.steps_completed.len(),
                run.plan.steps.len(),
            ));
        }

        let handle = run.handle.clone();
        self.seal(&handle, SessionState::Executing, state, summary)
            .await;
    }

    fn build_summary(
        &self,
        run: &SessionRun,
        state: SessionState,
        failure_reason: Option<String>,
    ) -> SessionSummary {
        let by_status = |status: StepStatus| -> Vec<String> {
            run.plan
                .steps
                .iter()
                .filter(|s| s.status == status)
                .map(|s| s.id.clone())
                .collect()
        };

        SessionSummary {
            session_id: run.handle.id.clone(),
            goal: run.plan.goal.clone(),
            state,
            steps_completed: by_status(StepStatus::Completed),
            steps_skipped: by_status(StepStatus::Skipped),
            steps_failed: by_status(StepStatus::Failed),
            steps_cancelled: run.cancelled_steps.clone(),
            tokens_used: run.budget.used(),
            tokens_remaining: run.budget.remaining(),
            total_cost: run.total_cost,
            rollback_intended: run.rollback_intended,
            explanation: failure_reason,
        }
    }

    /// One non-retried LLM call for the user-facing wrap-up.
    async fn explain(&self, run: &mut SessionRun, summary: &SessionSummary) -> Option<String> {
        let prompt = format!(
            "--- RESULT ---\ngoal: {}\ncompleted: {}\nskipped: {}\nfailed: {}\n--- END ---\n\
             Summarize this agent session outcome for the user in one or two sentences.",
            summary.goal,
            summary.steps_completed.len(),
            summary.steps_skipped.len(),
            summary.steps_failed.len(),
        );
        let messages = vec![ChatMessage::user(prompt)];
        let response = self
            .gateway
            .chat(&messages, &ChatConfig::default())
            .await
            .ok()?;

        // Best effort: an exhausted budget just skips the nicety
        if run
            .budget
            .consume(response.tokens_input + response.tokens_output)
            .is_err()
        {
            return None;
        }
        run.total_cost += pricing::cost_for_call(
            &response.model,
            response.tokens_input,
            response.tokens_output,
        );
        Some(response.content)
    }

    /// Publishes the terminal event, flushes the trace, parks the summary.
    async fn seal(
        &self,
        handle: &Arc<SessionHandle>,
        from: SessionState,
        state: SessionState,
        summary: SessionSummary,
    ) {
        self.transition(handle, from, state).await;

        let terminal_event = match state {
            SessionState::Completed => EventType::Completed,
            SessionState::Cancelled => EventType::Cancelled,
            _ => EventType::Error,
        };
        let payload = serde_json::to_value(&summary).unwrap_or(Value::Null);
        self.record(&handle.id, terminal_event, payload).await;

        if let Err(e) = self
            .trace
            .end_session(&handle.id, summary.tokens_used, summary.total_cost)
            .await
        {
            warn!(error = %e, "Failed to close trace session");
        }
        self.record(
            &handle.id,
            EventType::TraceEnded,
            serde_json::json!({ "state": state }),
        )
        .await;

        self.approval.clear_session(&handle.id).await;

        {
            let tokens_used = summary.tokens_used;
            let completed = summary.steps_completed.clone();
            handle.update_snapshot(|s| {
                s.tokens_used = tokens_used;
                s.completed_steps = completed;
            });
            let mut parked = handle
                .summary
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            *parked = Some(summary);
        }
        // State flips last so `wait` observers see the summary
        let _ = handle.state_tx.send(state);

        info!(session_id = %handle.id, state = %state, "Session reached terminal state");
    }

    /// Emits `state_change` and records it; updates the watch channel for
    /// non-terminal states (terminal states flip in `seal`).
    async fn transition(&self, handle: &Arc<SessionHandle>, from: SessionState, to: SessionState) {
        handle.update_snapshot(|s| s.state = to);
        if !to.is_terminal() {
            let _ = handle.state_tx.send(to);
        }
        self.record(
            &handle.id,
            EventType::StateChange,
            serde_json::json!({ "from": from.to_string(), "to": to.to_string() }),
        )
        .await;
    }

    // =========================================================================
    // Event + trace plumbing
    // =========================================================================

    /// Publishes an event and appends the matching trace entry.
    async fn record(&self, session_id: &str, event_type: EventType, data: Value) {
        self.emit(
            session_id,
            AgentEvent::new(event_type, session_id, data.clone()),
        )
        .await;
        self.save_entry(TraceEntry::new(session_id, event_type, data))
            .await;
    }

    async fn emit(&self, _session_id: &str, event: AgentEvent) {
        self.emitter.publish(event);
    }

    async fn save_entry(&self, entry: TraceEntry) {
        if let Err(e) = self.trace.save_trace(entry).await {
            warn!(error = %e, "Failed to persist trace entry");
        }
    }
}

/// Outcome of one step execution.
enum StepOutcome {
    Advance,
    Cancelled,
    FailSession(String),
}

/// Outcome of one tool invocation, including mid-correction terminations.
enum InvokeOutcome {
    Finished(Result<Value, ToolError>),
    IterationLimitReached,
    BudgetExhausted,
}

/// Outcome of one argument-correction LLM turn.
enum CorrectionOutcome {
    Corrected(Value),
    Unusable,
    IterationLimitReached,
    BudgetExhausted,
}

/// Replaces `{{step_id}}` placeholders with prior step outputs, recursively.
fn substitute_templates(value: &Value, context: &HashMap<String, String>) -> Value {
    match value {
        Value::String(text) => {
            let replaced = TEMPLATE_RE.replace_all(text, |caps: &regex::Captures<'_>| {
                let key = &caps[1];
                context
                    .get(key)
                    .cloned()
                    .unwrap_or_else(|| caps[0].to_string())
            });
            Value::String(replaced.into_owned())
        }
        Value::Array(items) => Value::Array(
            items
                .iter()
                .map(|item| substitute_templates(item, context))
                .collect(),
        ),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), substitute_templates(v, context)))
                .collect(),
        ),
        other => other.clone(),
    }
}

/// Renders a tool output as the text other steps template against.
fn output_as_text(output: &Value) -> String {
    output["content"]
        .as_str()
        .or_else(|| output["text"].as_str())
        .map(String::from)
        .unwrap_or_else(|| output.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_substitute_templates_string() {
        let mut context = HashMap::new();
        context.insert("step_0".to_string(), "hello".to_string());

        let input = json!({ "text": "say {{step_0}} twice: {{step_0}}", "n": 3 });
        let result = substitute_templates(&input, &context);
        assert_eq!(result["text"], "say hello twice: hello");
        assert_eq!(result["n"], 3);
    }

    #[test]
    fn test_substitute_templates_unknown_key_left_alone() {
        let context = HashMap::new();
        let input = json!("use {{step_9}} here");
        let result = substitute_templates(&input, &context);
        assert_eq!(result, json!("use {{step_9}} here"));
    }

    #[test]
    fn test_substitute_templates_nested() {
        let mut context = HashMap::new();
        context.insert("fetch".to_string(), "DATA".to_string());
        let input = json!({ "outer": { "inner": ["{{fetch}}", 1] } });
        let result = substitute_templates(&input, &context);
        assert_eq!(result["outer"]["inner"][0], "DATA");
    }

    #[test]
    fn test_output_as_text_prefers_content() {
        assert_eq!(output_as_text(&json!({ "content": "c", "text": "t" })), "c");
        assert_eq!(output_as_text(&json!({ "text": "t" })), "t");
        assert_eq!(output_as_text(&json!({ "other": 1 })), r#"{"other":1}"#);
    }

    #[test]
    fn test_next_ready_step_respects_order_and_deps() {
        let mut plan = Plan::new(
            "g",
            vec![
                Step::new("a", "first"),
                Step::new("b", "second").with_depends_on(vec!["a".to_string()]),
            ],
        );
        let first = Executor::next_ready_step(&mut plan).unwrap();
        assert_eq!(plan.steps[first].id, "a");

        plan.steps[0].status = StepStatus::Completed;
        let second = Executor::next_ready_step(&mut plan).unwrap();
        assert_eq!(plan.steps[second].id, "b");

        plan.steps[1].status = StepStatus::Completed;
        assert!(Executor::next_ready_step(&mut plan).is_none());
    }

    #[test]
    fn test_next_ready_step_skips_after_failed_dependency() {
        let mut plan = Plan::new(
            "g",
            vec![
                Step::new("a", "first"),
                Step::new("b", "second").with_depends_on(vec!["a".to_string()]),
                Step::new("c", "independent"),
            ],
        );
        plan.steps[0].status = StepStatus::Failed;

        // "b" is unrunnable and gets skipped; "c" is the ready one
        let ready = Executor::next_ready_step(&mut plan).unwrap();
        assert_eq!(plan.steps[ready].id, "c");
        assert_eq!(plan.steps[1].status, StepStatus::Skipped);
    }
}
