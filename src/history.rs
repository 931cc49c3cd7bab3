//! Wire-level data model: history events, actions, work items, and the
//! shared failure record.
//!
//! This is the vocabulary the scheduler and the worker exchange. It is the
//! generalization of `everruns_durable::workflow::{WorkflowEvent,
//! WorkflowAction}` to the three work-item kinds this runtime dispatches
//! (orchestrations, activities, entities) and to task-id-positional replay
//! matching instead of a flat append-only log owned locally.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Structured failure record that round-trips across the wire unchanged.
///
/// One shared failure shape, since orchestrations, activities, and entities
/// all need to surface failures to each other and to clients.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FailureDetail {
    /// Coarse classification used for retry and display decisions.
    pub kind: FailureKind,

    /// Human-readable message.
    pub message: String,

    /// Stack trace text, if the source runtime captured one. Sanitized of
    /// terminal control characters before being stored.
    pub stack_text: Option<String>,

    /// If true, retry policies must not retry this failure regardless of
    /// remaining attempts.
    pub is_non_retriable: bool,

    /// Chained cause, if any.
    pub inner_failure: Option<Box<FailureDetail>>,
}

impl FailureDetail {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: sanitize(message.into()),
            stack_text: None,
            is_non_retriable: matches!(
                kind,
                FailureKind::NonDeterminism | FailureKind::TaskNotFound
            ),
            inner_failure: None,
        }
    }

    pub fn application(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Application, message)
    }

    pub fn non_retriable(mut self) -> Self {
        self.is_non_retriable = true;
        self
    }

    pub fn with_stack(mut self, stack: impl Into<String>) -> Self {
        self.stack_text = Some(sanitize(stack.into()));
        self
    }

    pub fn with_inner(mut self, inner: FailureDetail) -> Self {
        self.inner_failure = Some(Box::new(inner));
        self
    }

    pub fn non_determinism(message: impl Into<String>) -> Self {
        Self::new(FailureKind::NonDeterminism, message)
    }

    pub fn task_not_found(name: &str) -> Self {
        Self::new(FailureKind::TaskNotFound, format!("task not found: {name}"))
    }
}

impl std::fmt::Display for FailureDetail {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for FailureDetail {}

/// Strip terminal control characters ("sanitized for terminal
/// control characters"). Keeps normal whitespace.
fn sanitize(s: String) -> String {
    s.chars()
        .filter(|c| !c.is_control() || *c == '\n' || *c == '\t')
        .collect()
}

/// Coarse failure classification. See error taxonomy.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Failure raised by user orchestrator/activity/entity code.
    Application,
    /// Replay observed a call that does not match recorded history.
    NonDeterminism,
    /// Registry had no handler for the requested name.
    TaskNotFound,
    /// An execution-imposed deadline elapsed.
    Timeout,
    /// The instance was terminated or cancelled.
    Canceled,
    /// Unexpected internal failure; the work item should be retried by the
    /// scheduler rather than surfaced to user code.
    Infrastructure,
}

/// Kind discriminant shared between [`HistoryEvent`] and [`Action`], used
/// for the positional task-id matching rule: an action is
/// consumed by a history entry only if both the task id *and* this kind
/// class agree.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    Activity,
    Timer,
    SubOrchestrator,
    EntityLock,
    EntityCall,
    EntitySignal,
}

/// Trace context propagated from an action to its eventual history record,
/// for telemetry span propagation across the replay boundary.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct TraceContext {
    pub trace_id: String,
    pub span_id: String,
    pub trace_flags: u8,
}

/// Options attached to `callActivity`/`callSubOrchestrator`, generalized
/// from `everruns_durable::workflow::ActivityOptions`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ActivityOptions {
    pub retry_policy: Option<crate::retry::RetryPolicy>,
    #[serde(with = "duration_millis")]
    pub start_to_close_timeout: Duration,
    pub version: Option<String>,
}

impl Default for ActivityOptions {
    fn default() -> Self {
        Self {
            retry_policy: None,
            start_to_close_timeout: Duration::from_secs(300),
            version: None,
        }
    }
}

/// An immutable log entry, replayed in sequence-number (index) order to
/// reconstruct orchestrator state. See "History Event".
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum HistoryEvent {
    OrchestratorStarted {
        timestamp: chrono::DateTime<chrono::Utc>,
    },
    ExecutionStarted {
        name: String,
        version: String,
        input: serde_json::Value,
    },
    ExecutionCompleted {
        result: serde_json::Value,
    },
    ExecutionFailed {
        failure: FailureDetail,
    },
    TaskScheduled {
        task_id: u32,
        name: String,
        input: serde_json::Value,
    },
    TaskCompleted {
        task_id: u32,
        result: serde_json::Value,
    },
    TaskFailed {
        task_id: u32,
        failure: FailureDetail,
    },
    TimerCreated {
        task_id: u32,
        fire_at: chrono::DateTime<chrono::Utc>,
    },
    TimerFired {
        task_id: u32,
    },
    SubOrchCreated {
        task_id: u32,
        name: String,
        instance_id: String,
        input: serde_json::Value,
    },
    SubOrchCompleted {
        task_id: u32,
        result: serde_json::Value,
    },
    SubOrchFailed {
        task_id: u32,
        failure: FailureDetail,
    },
    EventRaised {
        name: String,
        input: serde_json::Value,
    },
    EventSent {
        instance_id: String,
        name: String,
        input: serde_json::Value,
    },
    EntityOperationCalled {
        task_id: u32,
        entity_id: String,
        operation: String,
        input: serde_json::Value,
    },
    EntityOperationSignaled {
        task_id: u32,
        entity_id: String,
        operation: String,
        input: serde_json::Value,
    },
    EntityOperationCompleted {
        task_id: u32,
        result: serde_json::Value,
    },
    EntityOperationFailed {
        task_id: u32,
        failure: FailureDetail,
    },
    EntityLockRequested {
        task_id: u32,
        entity_ids: Vec<String>,
    },
    EntityLockGranted {
        task_id: u32,
    },
    ContinueAsNew {
        input: serde_json::Value,
        preserve_events: bool,
    },
    OrchestratorCompleted {},
}

impl HistoryEvent {
    /// The task id this event is positioned at, if it belongs to the
    /// task-id-indexed kind classes (scheduling or completion records).
    pub fn task_id(&self) -> Option<u32> {
        match self {
            Self::TaskScheduled { task_id, .. }
            | Self::TaskCompleted { task_id, .. }
            | Self::TaskFailed { task_id, .. }
            | Self::TimerCreated { task_id, .. }
            | Self::TimerFired { task_id, .. }
            | Self::SubOrchCreated { task_id, .. }
            | Self::SubOrchCompleted { task_id, .. }
            | Self::SubOrchFailed { task_id, .. }
            | Self::EntityOperationCalled { task_id, .. }
            | Self::EntityOperationSignaled { task_id, .. }
            | Self::EntityOperationCompleted { task_id, .. }
            | Self::EntityOperationFailed { task_id, .. }
            | Self::EntityLockRequested { task_id, .. }
            | Self::EntityLockGranted { task_id, .. } => Some(*task_id),
            _ => None,
        }
    }
}

/// Produced by one orchestrator turn. Same categorical space as
/// history-scheduled-events; consumed by the scheduler channel and, if the
/// orchestration is replayed again, matched back against the corresponding
/// `HistoryEvent` recorded for the same task id. See "Action".
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum Action {
    ScheduleActivity {
        task_id: u32,
        name: String,
        input: serde_json::Value,
        options: ActivityOptions,
        trace_context: Option<TraceContext>,
    },
    CreateTimer {
        task_id: u32,
        fire_at: chrono::DateTime<chrono::Utc>,
    },
    ScheduleSubOrchestrator {
        task_id: u32,
        name: String,
        instance_id: String,
        input: serde_json::Value,
        version: Option<String>,
    },
    SignalEntity {
        task_id: u32,
        entity_id: String,
        operation: String,
        input: serde_json::Value,
        scheduled_time: Option<chrono::DateTime<chrono::Utc>>,
    },
    CallEntity {
        task_id: u32,
        entity_id: String,
        operation: String,
        input: serde_json::Value,
    },
    LockEntities {
        task_id: u32,
        entity_ids: Vec<String>,
    },
    SendEvent {
        instance_id: String,
        name: String,
        input: serde_json::Value,
    },
    ContinueAsNew {
        input: serde_json::Value,
        preserve_events: bool,
    },
    SetCustomStatus {
        value: serde_json::Value,
    },
    CompleteOrchestration {
        result: serde_json::Value,
    },
    FailOrchestration {
        failure: FailureDetail,
    },
}

impl Action {
    pub fn task_id(&self) -> Option<u32> {
        match self {
            Self::ScheduleActivity { task_id, .. }
            | Self::CreateTimer { task_id, .. }
            | Self::ScheduleSubOrchestrator { task_id, .. }
            | Self::SignalEntity { task_id, .. }
            | Self::CallEntity { task_id, .. }
            | Self::LockEntities { task_id, .. } => Some(*task_id),
            _ => None,
        }
    }
}

/// Unit of work received from the scheduler. See "Work Item".
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum WorkItem {
    OrchestratorRequest {
        delivery_id: String,
        instance_id: String,
        orchestration_name: String,
        version: String,
        history: Vec<HistoryEvent>,
        new_events: Vec<HistoryEvent>,
    },
    ActivityRequest {
        delivery_id: String,
        instance_id: String,
        task_id: u32,
        name: String,
        input: serde_json::Value,
        trace_context: Option<TraceContext>,
    },
    EntityRequest {
        delivery_id: String,
        entity_id: String,
        operations: Vec<EntityOperationRequest>,
        state_snapshot: Option<serde_json::Value>,
    },
    HealthPing,
}

/// One operation within an [`WorkItem::EntityRequest`] batch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntityOperationRequest {
    pub id: String,
    pub operation: String,
    pub input: serde_json::Value,
    /// `true` for a fire-and-forget signal; `false` for a call awaiting a
    /// reply.
    pub is_signal: bool,
}

/// Result slot for one entity operation in a batch completion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntityOperationResult {
    pub id: String,
    pub result: Result<serde_json::Value, FailureDetail>,
}

/// What the worker sends back for a processed work item.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Completion {
    Orchestrator {
        delivery_id: String,
        instance_id: String,
        actions: Vec<Action>,
    },
    Activity {
        delivery_id: String,
        instance_id: String,
        task_id: u32,
        result: Result<serde_json::Value, FailureDetail>,
    },
    Entity {
        delivery_id: String,
        entity_id: String,
        state: Option<serde_json::Value>,
        results: Vec<EntityOperationResult>,
        signals: Vec<Action>,
    },
}

mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.as_millis().serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
