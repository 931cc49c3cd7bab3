//! The orchestrator context facade and the per-turn state it
//! is backed by.
//!
//! Every primitive an orchestrator calls is routed through here. Calls
//! that produce a result return a future; the future's first poll
//! allocates a task id, checks it against history (emitting a
//! [`NonDeterminismPanic`] on mismatch), and either resolves immediately
//! from a pre-seeded history completion or registers a new [`Action`] and
//! returns `Pending`. Because history is fully known at turn start, this
//! is sufficient to reproduce an "apply history, run to next suspension
//! point, repeat" turn loop in a single poll pass — there
//! is never a real waker to fire a second poll with new information.

use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context as PollContext, Poll};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::history::{Action, ActivityOptions, FailureDetail, FailureKind, HistoryEvent, TraceContext};
use crate::retry::RetryPolicy;

/// Snapshot passed to a [`RetryHandler`] before each retry attempt.
#[derive(Debug, Clone)]
pub struct RetryContext {
    pub attempt: u32,
    pub elapsed: Duration,
    pub last_failure: FailureDetail,
}

/// User-supplied veto consulted before every retry, independent of
/// `RetryPolicy`: return `false` to stop retrying even though the policy
/// would otherwise allow another attempt.
pub type RetryHandler<'a> = &'a dyn Fn(&RetryContext) -> bool;

/// Namespace used to derive deterministic orchestrator GUIDs, analogous to
/// the fixed namespaces `uuid::Uuid::new_v5` expects.
const GUID_NAMESPACE: uuid::Uuid = uuid::Uuid::from_bytes([
    0x6c, 0xa7, 0xb8, 0x10, 0x9d, 0xad, 0x11, 0xd1, 0x80, 0xb4, 0x00, 0xc0, 0x4f, 0xd4, 0x30, 0xc8,
]);

/// Default timer-splitting threshold (`maximumTimerInterval`).
pub const DEFAULT_MAX_TIMER_INTERVAL: Duration = Duration::from_secs(3 * 24 * 60 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Signaled {
    Success,
    Failure,
}

#[derive(Debug, Clone)]
enum CompletionPayload {
    Success(Value),
    Failure(FailureDetail),
}

/// Everything one turn needs, built once at turn start from the full
/// history plus any newly-delivered events.
pub(crate) struct TurnState {
    pub(crate) instance_id: String,
    pub(crate) turn_index: u64,
    pub(crate) max_timer_interval: Duration,
    execution_started_at: DateTime<Utc>,
    input: Value,
    next_task_id: u32,
    next_call_ordinal: u64,
    replay_boundary: u32,
    is_replaying: bool,
    scheduled_history: HashMap<u32, HistoryEvent>,
    completions: HashMap<u32, CompletionPayload>,
    event_queue: HashMap<String, VecDeque<Value>>,
    actions: Vec<Action>,
    custom_status: Option<Value>,
    continue_as_new: Option<(Value, bool)>,
    completed: Option<Result<Value, FailureDetail>>,
}

/// Raised to unwind out of an arbitrarily deep `.await` chain the moment a
/// call fails to match history. Caught by `turn::run_turn`'s
/// `catch_unwind` and converted into a `Failed` turn outcome; this keeps
/// every context method's signature free of a `Result` that callers would
/// otherwise have to thread through every combinator (`join_all`, `select`,
/// etc.).
pub(crate) struct NonDeterminismPanic(pub FailureDetail);

impl TurnState {
    pub(crate) fn new(
        instance_id: String,
        turn_index: u64,
        execution_started_at: DateTime<Utc>,
        input: Value,
        history: &[HistoryEvent],
        new_events: &[HistoryEvent],
        max_timer_interval: Duration,
    ) -> Self {
        let mut scheduled_history = HashMap::new();
        let mut completions = HashMap::new();
        let mut event_queue: HashMap<String, VecDeque<Value>> = HashMap::new();
        let mut replay_boundary = 0u32;

        for event in history {
            if is_scheduled_class(event) {
                if let Some(id) = event.task_id() {
                    replay_boundary = replay_boundary.max(id + 1);
                    scheduled_history.insert(id, event.clone());
                }
            }
        }

        for event in history.iter().chain(new_events.iter()) {
            if let Some((id, payload)) = as_completion(event) {
                completions.insert(id, payload);
            }
            if let HistoryEvent::EventRaised { name, input } = event {
                event_queue.entry(name.clone()).or_default().push_back(input.clone());
            }
        }

        Self {
            instance_id,
            turn_index,
            max_timer_interval,
            execution_started_at,
            input,
            next_task_id: 0,
            next_call_ordinal: 0,
            replay_boundary,
            is_replaying: replay_boundary > 0,
            scheduled_history,
            completions,
            event_queue,
            actions: Vec::new(),
            custom_status: None,
            continue_as_new: None,
            completed: None,
        }
    }

    fn allocate_task_id(&mut self) -> u32 {
        let id = self.next_task_id;
        self.next_task_id += 1;
        self.is_replaying = id < self.replay_boundary;
        id
    }

    fn next_ordinal(&mut self) -> u64 {
        let ordinal = self.next_call_ordinal;
        self.next_call_ordinal += 1;
        ordinal
    }

    pub(crate) fn into_parts(
        self,
    ) -> (
        Vec<Action>,
        Option<Value>,
        Option<(Value, bool)>,
        Option<Result<Value, FailureDetail>>,
    ) {
        (self.actions, self.custom_status, self.continue_as_new, self.completed)
    }
}

fn is_scheduled_class(event: &HistoryEvent) -> bool {
    matches!(
        event,
        HistoryEvent::TaskScheduled { .. }
            | HistoryEvent::TimerCreated { .. }
            | HistoryEvent::SubOrchCreated { .. }
            | HistoryEvent::EntityOperationCalled { .. }
            | HistoryEvent::EntityOperationSignaled { .. }
            | HistoryEvent::EntityLockRequested { .. }
    )
}

fn as_completion(event: &HistoryEvent) -> Option<(u32, CompletionPayload)> {
    match event {
        HistoryEvent::TaskCompleted { task_id, result } => {
            Some((*task_id, CompletionPayload::Success(result.clone())))
        }
        HistoryEvent::TaskFailed { task_id, failure } => {
            Some((*task_id, CompletionPayload::Failure(failure.clone())))
        }
        HistoryEvent::TimerFired { task_id } => {
            Some((*task_id, CompletionPayload::Success(Value::Null)))
        }
        HistoryEvent::SubOrchCompleted { task_id, result } => {
            Some((*task_id, CompletionPayload::Success(result.clone())))
        }
        HistoryEvent::SubOrchFailed { task_id, failure } => {
            Some((*task_id, CompletionPayload::Failure(failure.clone())))
        }
        HistoryEvent::EntityOperationCompleted { task_id, result } => {
            Some((*task_id, CompletionPayload::Success(result.clone())))
        }
        HistoryEvent::EntityOperationFailed { task_id, failure } => {
            Some((*task_id, CompletionPayload::Failure(failure.clone())))
        }
        HistoryEvent::EntityLockGranted { task_id } => {
            Some((*task_id, CompletionPayload::Success(Value::Null)))
        }
        _ => None,
    }
}

fn input_hash(value: &Value) -> String {
    let bytes = serde_json::to_vec(value).unwrap_or_default();
    let digest = Sha256::digest(&bytes);
    hex::encode(digest)
}

/// What a call registers as its "expected" shape, used to build the
/// non-determinism message and to assert the history entry matches.
struct ScheduledCall<'a> {
    name: &'a str,
    input: &'a Value,
}

fn assert_matches_history(
    task_id: u32,
    recorded: &HistoryEvent,
    call: &ScheduledCall,
    kind_label: &str,
) -> Result<(), FailureDetail> {
    let (recorded_name, recorded_input) = match recorded {
        HistoryEvent::TaskScheduled { name, input, .. } => (name.as_str(), input),
        HistoryEvent::SubOrchCreated { name, input, .. } => (name.as_str(), input),
        HistoryEvent::EntityOperationCalled { operation, input, .. } => (operation.as_str(), input),
        HistoryEvent::EntityOperationSignaled { operation, input, .. } => (operation.as_str(), input),
        HistoryEvent::TimerCreated { .. } | HistoryEvent::EntityLockRequested { .. } => {
            return Ok(());
        }
        _ => {
            return Err(FailureDetail::non_determinism(format!(
                "task id {task_id}: expected a {kind_label} record, found {recorded:?}"
            )))
        }
    };

    if recorded_name != call.name {
        return Err(FailureDetail::non_determinism(format!(
            "task id {task_id}: expected {kind_label} '{}', found '{}'",
            call.name, recorded_name
        )));
    }

    let expected_hash = input_hash(recorded_input);
    let observed_hash = input_hash(call.input);
    if expected_hash != observed_hash {
        return Err(FailureDetail::non_determinism(format!(
            "task id {task_id}: expected input hash {expected_hash}, observed input hash {observed_hash}"
        )));
    }

    Ok(())
}

/// Handle exposed to user orchestrator code. Cheap to clone; all clones
/// share the same turn state.
#[derive(Clone)]
pub struct OrchestrationContext {
    pub(crate) state: Rc<RefCell<TurnState>>,
}

impl fmt::Debug for OrchestrationContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OrchestrationContext").finish_non_exhaustive()
    }
}

impl OrchestrationContext {
    pub(crate) fn new(state: Rc<RefCell<TurnState>>) -> Self {
        Self { state }
    }

    pub fn instance_id(&self) -> String {
        self.state.borrow().instance_id.clone()
    }

    /// Deserializes the orchestration input. Idempotent — callable more
    /// than once, always returns the same value.
    pub fn get_input<T: DeserializeOwned>(&self) -> Result<T, FailureDetail> {
        let input = self.state.borrow().input.clone();
        serde_json::from_value(input)
            .map_err(|e| FailureDetail::new(FailureKind::Application, format!("invalid input: {e}")))
    }

    /// Deterministic clock: the timestamp of this execution's
    /// `orchestratorStarted` history event. Stable across replays.
    pub fn current_utc_date_time(&self) -> DateTime<Utc> {
        self.state.borrow().execution_started_at
    }

    /// True while resolving calls recorded in prior turns; flips false
    /// once the orchestrator reaches genuinely new work.
    pub fn is_replaying(&self) -> bool {
        self.state.borrow().is_replaying
    }

    /// Deterministic v5-style UUID derived from `(instanceId, turnIndex,
    /// callOrdinal)`. Stable across replays because all three inputs are.
    pub fn new_guid(&self) -> uuid::Uuid {
        let (instance_id, turn_index, ordinal) = {
            let mut state = self.state.borrow_mut();
            let ordinal = state.next_ordinal();
            (state.instance_id.clone(), state.turn_index, ordinal)
        };
        let name = format!("{instance_id}:{turn_index}:{ordinal}");
        uuid::Uuid::new_v5(&GUID_NAMESPACE, name.as_bytes())
    }

    /// A logger that is a no-op while `is_replaying()` is true, matching
    /// the restricted set of side effects an orchestrator is allowed to
    /// perform.
    pub fn create_replay_safe_logger(&self, category: impl Into<String>) -> ReplaySafeLogger {
        ReplaySafeLogger {
            category: category.into(),
            state: self.state.clone(),
        }
    }

    /// Any other service lookup is explicitly rejected — orchestrators may
    /// only obtain the replay-safe logger.
    pub fn resolve_service(&self, name: &str) -> Result<(), FailureDetail> {
        Err(FailureDetail::new(
            FailureKind::Application,
            format!("services other than logging cannot be injected into orchestrations (requested: {name})"),
        )
        .non_retriable())
    }

    pub fn call_activity<O: DeserializeOwned>(
        &self,
        name: &str,
        input: impl Serialize,
    ) -> impl Future<Output = Result<O, FailureDetail>> + '_ {
        self.call_activity_with_options(name, input, ActivityOptions::default())
    }

    pub fn call_activity_with_options<O: DeserializeOwned>(
        &self,
        name: &str,
        input: impl Serialize,
        options: ActivityOptions,
    ) -> TaskFuture<'_, O> {
        let input = serde_json::to_value(input).unwrap_or(Value::Null);
        TaskFuture::new(self, CallShape::Activity { name: name.to_string(), input, options })
    }

    /// Wraps `call_activity` with an in-orchestrator retry loop: on
    /// failure, compute the next delay from `policy`, create a timer,
    /// then re-issue the call, until attempts are exhausted or the
    /// failure is marked non-retriable.
    pub async fn call_activity_with_retry<O: DeserializeOwned>(
        &self,
        name: &str,
        input: impl Serialize + Clone,
        policy: RetryPolicy,
    ) -> Result<O, FailureDetail> {
        self.call_activity_with_retry_handler(name, input, policy, None).await
    }

    /// Same as [`Self::call_activity_with_retry`], but also consults
    /// `retry_handler` (if given) before scheduling each retry, and
    /// enforces `policy.retry_timeout` as a cumulative backoff deadline
    /// independent of `max_attempts`.
    pub async fn call_activity_with_retry_handler<O: DeserializeOwned>(
        &self,
        name: &str,
        input: impl Serialize + Clone,
        policy: RetryPolicy,
        retry_handler: Option<RetryHandler<'_>>,
    ) -> Result<O, FailureDetail> {
        let mut attempt = 1;
        let mut elapsed = Duration::ZERO;
        loop {
            let result: Result<O, FailureDetail> = self.call_activity(name, input.clone()).await;
            match result {
                Ok(value) => return Ok(value),
                Err(failure) => {
                    let kind_str = format!("{:?}", failure.kind);
                    let retryable = !failure.is_non_retriable
                        && failure.kind != FailureKind::TaskNotFound
                        && policy.should_retry(Some(&kind_str))
                        && policy.has_attempts_remaining(attempt);
                    if !retryable {
                        return Err(failure);
                    }
                    attempt += 1;
                    let delay = policy.delay_for_attempt(attempt);
                    elapsed += delay;
                    if let Some(timeout) = policy.retry_timeout {
                        if elapsed >= timeout {
                            return Err(failure);
                        }
                    }
                    if let Some(handler) = retry_handler {
                        let ctx = RetryContext { attempt, elapsed, last_failure: failure.clone() };
                        if !handler(&ctx) {
                            return Err(failure);
                        }
                    }
                    let fire_at = self.current_utc_date_time() + chrono::Duration::from_std(delay).unwrap_or_default();
                    self.create_timer(fire_at).await?;
                }
            }
        }
    }

    pub fn call_sub_orchestrator<O: DeserializeOwned>(
        &self,
        name: &str,
        instance_id: impl Into<String>,
        input: impl Serialize,
    ) -> TaskFuture<'_, O> {
        let input = serde_json::to_value(input).unwrap_or(Value::Null);
        TaskFuture::new(
            self,
            CallShape::SubOrchestrator { name: name.to_string(), instance_id: instance_id.into(), input },
        )
    }

    /// Durable timer, transparently split into a chain of sub-maximum
    /// timers when the requested span exceeds `max_timer_interval`. The
    /// split count depends only on the span and the (execution-immutable)
    /// max interval, so every replay produces the same chain.
    pub async fn create_timer(&self, fire_at: DateTime<Utc>) -> Result<(), FailureDetail> {
        let max_interval = self.state.borrow().max_timer_interval;
        let mut remaining = fire_at - self.current_utc_date_time();
        let max_chrono = chrono::Duration::from_std(max_interval).unwrap_or(chrono::Duration::zero());

        let mut checkpoint = self.current_utc_date_time();
        while remaining > max_chrono {
            checkpoint += max_chrono;
            self.create_timer_raw(checkpoint).await?;
            remaining = remaining - max_chrono;
        }
        self.create_timer_raw(fire_at).await
    }

    fn create_timer_raw(&self, fire_at: DateTime<Utc>) -> TaskFuture<'_, ()> {
        TaskFuture::new(self, CallShape::Timer { fire_at })
    }

    pub fn wait_for_external_event<T: DeserializeOwned>(
        &self,
        name: &str,
    ) -> ExternalEventFuture<'_, T> {
        ExternalEventFuture {
            ctx: self,
            name: name.to_string(),
            _marker: std::marker::PhantomData,
        }
    }

    pub fn call_entity<O: DeserializeOwned>(
        &self,
        entity_id: &str,
        operation: &str,
        input: impl Serialize,
    ) -> TaskFuture<'_, O> {
        let input = serde_json::to_value(input).unwrap_or(Value::Null);
        TaskFuture::new(
            self,
            CallShape::EntityCall { entity_id: entity_id.to_string(), operation: operation.to_string(), input },
        )
    }

    /// Fire-and-forget; appends an action without suspending.
    pub fn signal_entity(
        &self,
        entity_id: &str,
        operation: &str,
        input: impl Serialize,
        scheduled_time: Option<DateTime<Utc>>,
    ) {
        let input = serde_json::to_value(input).unwrap_or(Value::Null);
        let mut state = self.state.borrow_mut();
        let task_id = state.allocate_task_id();
        if let Some(recorded) = state.scheduled_history.get(&task_id).cloned() {
            let call = ScheduledCall { name: operation, input: &input };
            if let Err(failure) = assert_matches_history(task_id, &recorded, &call, "entity signal") {
                drop(state);
                panic_non_determinism(failure);
            }
            return;
        }
        state.actions.push(Action::SignalEntity {
            task_id,
            entity_id: entity_id.to_string(),
            operation: operation.to_string(),
            input,
            scheduled_time,
        });
    }

    /// Terminal action: drops pending tasks/timers and ends the current
    /// execution. `preserve_events` controls whether buffered, unconsumed
    /// external events carry over to the new execution.
    pub fn continue_as_new(&self, input: impl Serialize, preserve_events: bool) {
        let input = serde_json::to_value(input).unwrap_or(Value::Null);
        let mut state = self.state.borrow_mut();
        state.continue_as_new = Some((input, preserve_events));
    }

    /// Last-write-wins; visible to clients querying instance status.
    pub fn set_custom_status(&self, value: impl Serialize) {
        let value = serde_json::to_value(value).unwrap_or(Value::Null);
        self.state.borrow_mut().custom_status = Some(value);
    }

    pub fn complete(&self, result: impl Serialize) {
        let value = serde_json::to_value(result).unwrap_or(Value::Null);
        self.state.borrow_mut().completed = Some(Ok(value));
    }

    pub fn fail(&self, failure: FailureDetail) {
        self.state.borrow_mut().completed = Some(Err(failure));
    }
}

fn panic_non_determinism(failure: FailureDetail) -> ! {
    std::panic::panic_any(NonDeterminismPanic(failure))
}

/// A no-op-while-replaying logger
pub struct ReplaySafeLogger {
    category: String,
    state: Rc<RefCell<TurnState>>,
}

impl ReplaySafeLogger {
    fn is_replaying(&self) -> bool {
        self.state.borrow().is_replaying
    }

    pub fn info(&self, message: &str) {
        if !self.is_replaying() {
            tracing::info!(category = %self.category, "{message}");
        }
    }

    pub fn warn(&self, message: &str) {
        if !self.is_replaying() {
            tracing::warn!(category = %self.category, "{message}");
        }
    }

    pub fn error(&self, message: &str) {
        if !self.is_replaying() {
            tracing::error!(category = %self.category, "{message}");
        }
    }
}

enum CallShape {
    Activity { name: String, input: Value, options: ActivityOptions },
    SubOrchestrator { name: String, instance_id: String, input: Value },
    Timer { fire_at: DateTime<Utc> },
    EntityCall { entity_id: String, operation: String, input: Value },
}

/// Future returned by every awaited context primitive. Registers its call
/// against history on first poll, then resolves from the pre-seeded
/// completion map or yields `Pending` once genuinely new work is reached.
pub struct TaskFuture<'a, T> {
    ctx: &'a OrchestrationContext,
    shape: Option<CallShape>,
    task_id: Option<u32>,
    _marker: std::marker::PhantomData<T>,
}

impl<'a, T> TaskFuture<'a, T> {
    fn new(ctx: &'a OrchestrationContext, shape: CallShape) -> Self {
        Self { ctx, shape: Some(shape), task_id: None, _marker: std::marker::PhantomData }
    }
}

impl<'a, T: DeserializeOwned> Future for TaskFuture<'a, T> {
    type Output = Result<T, FailureDetail>;

    fn poll(self: Pin<&mut Self>, _cx: &mut PollContext<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let mut state = this.ctx.state.borrow_mut();

        let task_id = match this.task_id {
            Some(id) => id,
            None => {
                let shape = this.shape.take().expect("TaskFuture polled after completion");
                let id = state.allocate_task_id();
                this.task_id = Some(id);

                let (kind_label, call_name, call_input, action) = match shape {
                    CallShape::Activity { name, input, options } => {
                        let trace_context: Option<TraceContext> = None;
                        let action = Action::ScheduleActivity {
                            task_id: id,
                            name: name.clone(),
                            input: input.clone(),
                            options,
                            trace_context,
                        };
                        ("activity", name, input, action)
                    }
                    CallShape::SubOrchestrator { name, instance_id, input } => {
                        let action = Action::ScheduleSubOrchestrator {
                            task_id: id,
                            name: name.clone(),
                            instance_id,
                            input: input.clone(),
                            version: None,
                        };
                        ("sub-orchestrator", name, input, action)
                    }
                    CallShape::Timer { fire_at } => {
                        let action = Action::CreateTimer { task_id: id, fire_at };
                        ("timer", String::new(), Value::Null, action)
                    }
                    CallShape::EntityCall { entity_id, operation, input } => {
                        let action = Action::CallEntity {
                            task_id: id,
                            entity_id,
                            operation: operation.clone(),
                            input: input.clone(),
                        };
                        ("entity call", operation, input, action)
                    }
                };

                if let Some(recorded) = state.scheduled_history.get(&id).cloned() {
                    let call = ScheduledCall { name: &call_name, input: &call_input };
                    if let Err(failure) = assert_matches_history(id, &recorded, &call, kind_label) {
                        drop(state);
                        panic_non_determinism(failure);
                    }
                } else {
                    state.actions.push(action);
                }

                id
            }
        };

        match state.completions.remove(&task_id) {
            Some(CompletionPayload::Success(value)) => {
                drop(state);
                let typed = serde_json::from_value(value).map_err(|e| {
                    FailureDetail::new(FailureKind::Application, format!("deserialize result: {e}"))
                });
                Poll::Ready(typed)
            }
            Some(CompletionPayload::Failure(failure)) => Poll::Ready(Err(failure)),
            None => Poll::Pending,
        }
    }
}

/// Future for `waitForExternalEvent`. Unlike [`TaskFuture`], it is not
/// positionally task-id matched against history (events are matched by
/// name buffered-event handling), so a fresh task id is
/// still allocated only to record the subscription point deterministically
/// in the action buffer is unnecessary — the event queue is consulted
/// directly by name.
pub struct ExternalEventFuture<'a, T> {
    ctx: &'a OrchestrationContext,
    name: String,
    _marker: std::marker::PhantomData<T>,
}

impl<'a, T: DeserializeOwned> Future for ExternalEventFuture<'a, T> {
    type Output = T;

    fn poll(self: Pin<&mut Self>, _cx: &mut PollContext<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let mut state = this.ctx.state.borrow_mut();
        match state.event_queue.get_mut(&this.name).and_then(|q| q.pop_front()) {
            Some(value) => {
                drop(state);
                Poll::Ready(serde_json::from_value(value).unwrap_or_else(|_| {
                    panic_non_determinism(FailureDetail::new(
                        FailureKind::Application,
                        format!("external event '{}' had an unexpected shape", this.name),
                    ))
                }))
            }
            None => Poll::Pending,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fresh_state(history: Vec<HistoryEvent>, new_events: Vec<HistoryEvent>) -> Rc<RefCell<TurnState>> {
        Rc::new(RefCell::new(TurnState::new(
            "inst-1".to_string(),
            0,
            Utc::now(),
            Value::Null,
            &history,
            &new_events,
            DEFAULT_MAX_TIMER_INTERVAL,
        )))
    }

    #[test]
    fn new_guid_is_stable_for_same_ordinal() {
        let ctx1 = OrchestrationContext::new(fresh_state(vec![], vec![]));
        let ctx2 = OrchestrationContext::new(fresh_state(vec![], vec![]));
        assert_eq!(ctx1.new_guid(), ctx2.new_guid());
    }

    #[test]
    fn new_guid_changes_per_call_ordinal() {
        let ctx = OrchestrationContext::new(fresh_state(vec![], vec![]));
        let a = ctx.new_guid();
        let b = ctx.new_guid();
        assert_ne!(a, b);
    }

    #[test]
    fn resolve_service_is_always_rejected() {
        let ctx = OrchestrationContext::new(fresh_state(vec![], vec![]));
        assert!(ctx.resolve_service("database").is_err());
    }

    #[test]
    fn is_replaying_reflects_history_boundary() {
        let history = vec![HistoryEvent::TaskScheduled {
            task_id: 0,
            name: "a".into(),
            input: Value::Null,
        }];
        let ctx = OrchestrationContext::new(fresh_state(history, vec![]));
        assert!(ctx.is_replaying());
    }
}
