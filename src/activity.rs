//! Activity trait, invocation context, and the bounded-concurrency
//! dispatcher.
//!
//! `ActivityContext` carries attempt bookkeeping, a cancellation handle,
//! and a heartbeat sender. `ActivityDispatcher` runs a scheduler-fed
//! work-item loop with `Semaphore`-bounded concurrency and `watch`-channel
//! shutdown, the same shape as a bounded worker pool pulling off a task
//! queue.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use tokio::sync::{watch, Semaphore};
use tracing::{instrument, Instrument};

use crate::channel::SchedulerChannel;
use crate::history::{Completion, FailureDetail, FailureKind, TraceContext, WorkItem};

/// Per-invocation handle passed to [`Activity::execute`].
///
/// The attempt counter is populated by the retrying orchestrator rather
/// than a local queue, since retry lives in the orchestration context
/// rather than in dispatcher-side requeuing.
pub struct ActivityContext {
    instance_id: String,
    task_id: u32,
    name: String,
    attempt: u32,
    trace_context: Option<TraceContext>,
    cancelled: Arc<AtomicBool>,
}

impl ActivityContext {
    pub fn new(instance_id: String, task_id: u32, name: String, attempt: u32) -> Self {
        Self {
            instance_id,
            task_id,
            name,
            attempt,
            trace_context: None,
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    pub fn task_id(&self) -> u32 {
        self.task_id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn trace_context(&self) -> Option<&TraceContext> {
        self.trace_context.as_ref()
    }

    /// Handle other code can use to observe cooperative cancellation from
    /// a separate task (shutdown, scheduler-originated cancel, timeout).
    pub fn cancellation_handle(&self) -> CancellationHandle {
        CancellationHandle {
            cancelled: self.cancelled.clone(),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Relaxed)
    }
}

#[derive(Clone)]
pub struct CancellationHandle {
    cancelled: Arc<AtomicBool>,
}

impl CancellationHandle {
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Relaxed)
    }
}

/// One non-deterministic unit of work.
#[async_trait]
pub trait Activity: Send + Sync + 'static {
    const NAME: &'static str;
    type Input: DeserializeOwned + Send;
    type Output: Serialize;

    async fn execute(
        &self,
        ctx: &ActivityContext,
        input: Self::Input,
    ) -> Result<Self::Output, FailureDetail>;
}

/// Type-erased activity interface, carrying a single activity
/// definition through the dispatcher regardless of its concrete
/// input/output types.
#[async_trait]
pub trait AnyActivity: Send + Sync {
    fn name(&self) -> &'static str;

    async fn execute_any(
        &self,
        ctx: &ActivityContext,
        input: Value,
    ) -> Result<Value, FailureDetail>;
}

pub(crate) struct ActivityWrapper<A: Activity> {
    pub(crate) inner: A,
}

#[async_trait]
impl<A: Activity> AnyActivity for ActivityWrapper<A> {
    fn name(&self) -> &'static str {
        A::NAME
    }

    async fn execute_any(
        &self,
        ctx: &ActivityContext,
        input: Value,
    ) -> Result<Value, FailureDetail> {
        let typed: A::Input = serde_json::from_value(input).map_err(|e| {
            FailureDetail::new(FailureKind::Application, format!("deserialize input: {e}"))
                .non_retriable()
        })?;
        let output = self.inner.execute(ctx, typed).await?;
        serde_json::to_value(output).map_err(|e| {
            FailureDetail::new(FailureKind::Application, format!("serialize output: {e}"))
        })
    }
}

pub type ActivityFactory = Box<dyn Fn() -> Box<dyn AnyActivity> + Send + Sync>;

/// Bounded-concurrency activity dispatcher. Claims nothing on its own
/// initiative — it only reacts to `ActivityRequest` work items pushed by
/// the [`SchedulerChannel`] ("the worker does no background
/// polling of its own").
pub struct ActivityDispatcher<C: SchedulerChannel> {
    channel: Arc<C>,
    handlers: Arc<HashMap<String, Box<dyn AnyActivity>>>,
    permits: Arc<Semaphore>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
}

impl<C: SchedulerChannel + 'static> ActivityDispatcher<C> {
    pub fn new(
        channel: Arc<C>,
        handlers: HashMap<String, Box<dyn AnyActivity>>,
        max_concurrency: usize,
    ) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Self {
            channel,
            handlers: Arc::new(handlers),
            permits: Arc::new(Semaphore::new(max_concurrency.max(1))),
            shutdown_tx,
            shutdown_rx,
        }
    }

    /// Current free capacity, reported upstream as the `capacity` hint
    /// on health pings.
    pub fn available_capacity(&self) -> usize {
        self.permits.available_permits()
    }

    pub fn request_shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    /// Dispatches one `ActivityRequest` work item, spawning its execution
    /// on a fresh task bounded by the semaphore. Returns immediately; the
    /// eventual [`Completion`] is sent back over the channel from within
    /// the spawned task.
    #[instrument(skip(self, work_item), fields(activity.name))]
    pub async fn dispatch(&self, work_item: WorkItem) {
        let WorkItem::ActivityRequest {
            delivery_id,
            instance_id,
            task_id,
            name,
            input,
            trace_context,
        } = work_item
        else {
            tracing::warn!("activity dispatcher received non-activity work item");
            return;
        };
        tracing::Span::current().record("activity.name", &name.as_str());

        let handlers = self.handlers.clone();
        let channel = self.channel.clone();
        let permits = self.permits.clone();
        let mut shutdown_rx = self.shutdown_rx.clone();

        let Ok(permit) = permits.acquire_owned().await else {
            return;
        };

        tokio::spawn(
            async move {
                let ctx = ActivityContext::new(instance_id.clone(), task_id, name.clone(), 1);
                let mut ctx = ctx;
                ctx.trace_context = trace_context;
                if *shutdown_rx.borrow() {
                    ctx.cancellation_handle().cancel();
                }

                let result = match handlers.get(&name) {
                    Some(handler) => handler.execute_any(&ctx, input).await,
                    None => Err(FailureDetail::task_not_found(&name)),
                };

                let completion = Completion::Activity {
                    delivery_id,
                    instance_id,
                    task_id,
                    result,
                };
                if let Err(e) = channel.send(completion).await {
                    tracing::error!(error = %e, "failed to send activity completion");
                }
                drop(permit);
            }
            .in_current_span(),
        );
    }

    /// Waits until all in-flight activities have drained or `timeout`
    /// elapses.
    pub async fn shutdown(&self, total_permits: usize, timeout: std::time::Duration) {
        self.request_shutdown();
        let wait = async {
            loop {
                if self.permits.available_permits() >= total_permits {
                    return;
                }
                tokio::time::sleep(std::time::Duration::from_millis(50)).await;
            }
        };
        let _ = tokio::time::timeout(timeout, wait).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::InMemoryChannel;

    struct DoubleIt;

    #[async_trait]
    impl Activity for DoubleIt {
        const NAME: &'static str = "double_it";
        type Input = i64;
        type Output = i64;

        async fn execute(&self, _ctx: &ActivityContext, input: i64) -> Result<i64, FailureDetail> {
            Ok(input * 2)
        }
    }

    #[tokio::test]
    async fn dispatch_runs_registered_handler_and_sends_completion() {
        let channel = Arc::new(InMemoryChannel::new());
        let mut handlers: HashMap<String, Box<dyn AnyActivity>> = HashMap::new();
        handlers.insert(
            DoubleIt::NAME.to_string(),
            Box::new(ActivityWrapper { inner: DoubleIt }),
        );
        let dispatcher = ActivityDispatcher::new(channel.clone(), handlers, 4);

        dispatcher
            .dispatch(WorkItem::ActivityRequest {
                delivery_id: "d1".into(),
                instance_id: "inst1".into(),
                task_id: 0,
                name: "double_it".into(),
                input: serde_json::json!(21),
                trace_context: None,
            })
            .await;

        let completion = channel.next_sent().await.expect("completion expected");
        match completion {
            Completion::Activity { result, .. } => {
                assert_eq!(result.unwrap(), serde_json::json!(42));
            }
            _ => panic!("expected activity completion"),
        }
    }

    #[tokio::test]
    async fn unknown_activity_name_fails_with_task_not_found() {
        let channel = Arc::new(InMemoryChannel::new());
        let dispatcher = ActivityDispatcher::new(channel.clone(), HashMap::new(), 4);

        dispatcher
            .dispatch(WorkItem::ActivityRequest {
                delivery_id: "d1".into(),
                instance_id: "inst1".into(),
                task_id: 0,
                name: "nonexistent".into(),
                input: serde_json::json!(null),
                trace_context: None,
            })
            .await;

        let completion = channel.next_sent().await.expect("completion expected");
        match completion {
            Completion::Activity { result, .. } => {
                let err = result.unwrap_err();
                assert_eq!(err.kind, FailureKind::TaskNotFound);
                assert!(err.is_non_retriable);
            }
            _ => panic!("expected activity completion"),
        }
    }
}
