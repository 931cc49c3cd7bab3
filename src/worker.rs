//! Top-level worker: wires a [`Registry`] and a [`SchedulerChannel`]
//! together behind the three dispatchers and runs until shutdown.
//!
//! Follows the familiar start/drain/stop pool lifecycle shape, applied
//! here to the three work-item kinds this crate dispatches rather than a
//! single task-queue pool. The central receive loop exists because all
//! three dispatchers share one [`SchedulerChannel`] connection — a single
//! bidirectional stream every dispatcher shares — so routing one item at
//! a time avoids several independent `recv()` calls racing each other for
//! the same queue.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio::task::LocalSet;

use crate::activity::ActivityDispatcher;
use crate::channel::SchedulerChannel;
use crate::config::WorkerOptions;
use crate::entity::EntityDispatcher;
use crate::history::WorkItem;
use crate::orchestration::OrchestrationDispatcher;
use crate::registry::Registry;

/// Owns the three dispatchers and the single channel connection they
/// share. `Worker::run` must be awaited from a plain `tokio::main`
/// runtime (current-thread or multi-thread) — it builds its own
/// [`LocalSet`] internally to host the `!Send` orchestration turns.
pub struct Worker<C: SchedulerChannel> {
    channel: Arc<C>,
    worker_id: String,
    task_hub: String,
    orchestration: Arc<OrchestrationDispatcher<C>>,
    orchestration_permits: Arc<Semaphore>,
    activity: Arc<ActivityDispatcher<C>>,
    entity: Arc<EntityDispatcher>,
    entity_enabled: bool,
    options: WorkerOptions,
}

impl<C: SchedulerChannel + 'static> Worker<C> {
    pub fn new(channel: Arc<C>, worker_id: impl Into<String>, task_hub: impl Into<String>, registry: Registry, options: WorkerOptions) -> Self {
        let orchestration = Arc::new(OrchestrationDispatcher::new(
            channel.clone(),
            registry.build_orchestrator_handlers(),
            options.versioning.clone(),
            options.maximum_timer_interval,
        ));
        let activity = Arc::new(ActivityDispatcher::new(
            channel.clone(),
            registry.build_activity_handlers(),
            options.max_concurrent_activities,
        ));
        let entity = Arc::new(EntityDispatcher::new(registry.build_entity_handlers()));
        let orchestration_permits = Arc::new(Semaphore::new(options.max_concurrent_orchestrations.max(1)));

        Self {
            channel,
            worker_id: worker_id.into(),
            task_hub: task_hub.into(),
            orchestration,
            orchestration_permits,
            activity,
            entity,
            entity_enabled: options.enable_entity_support,
            options,
        }
    }

    /// Establishes the channel and processes work items until it closes or
    /// `shutdown` is requested (exit conditions: stream closed,
    /// shutdown requested, or unrecoverable transport error).
    pub async fn run(&self) -> Result<(), crate::channel::ChannelError> {
        self.channel.start(&self.worker_id, &self.task_hub).await?;

        let local = LocalSet::new();
        local
            .run_until(async {
                loop {
                    let Some(item) = self.channel.recv().await else {
                        break;
                    };
                    self.route(item).await;
                }
            })
            .await;

        Ok(())
    }

    async fn route(&self, item: WorkItem) {
        match &item {
            WorkItem::OrchestratorRequest { .. } => {
                let Ok(permit) = self.orchestration_permits.clone().acquire_owned().await else {
                    return;
                };
                let dispatcher = self.orchestration.clone();
                tokio::task::spawn_local(async move {
                    dispatcher.handle(item).await;
                    drop(permit);
                });
            }
            WorkItem::ActivityRequest { .. } => {
                self.activity.dispatch(item).await;
            }
            WorkItem::EntityRequest { .. } => {
                if !self.entity_enabled {
                    tracing::warn!("received entity request but entity support is disabled");
                    return;
                }
                let entity = self.entity.clone();
                let channel = self.channel.clone();
                tokio::spawn(async move {
                    if let Some(completion) = entity.dispatch(item).await {
                        if let Err(e) = channel.send(completion).await {
                            tracing::error!(error = %e, "failed to send entity completion");
                        }
                    }
                });
            }
            WorkItem::HealthPing => {
                let _ = self.channel.report_capacity(self.activity.available_capacity()).await;
            }
        }
    }

    /// Drains in-flight activities and orchestration turns, then closes
    /// the channel.
    pub async fn shutdown(&self, drain_timeout: Duration) {
        self.activity.shutdown(self.options.max_concurrent_activities, drain_timeout).await;

        let total_permits = self.options.max_concurrent_orchestrations.max(1);
        let wait_for_orchestrations = async {
            loop {
                if self.orchestration_permits.available_permits() >= total_permits {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        };
        let _ = tokio::time::timeout(drain_timeout, wait_for_orchestrations).await;

        let _ = self.channel.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::InMemoryChannel;
    use crate::history::{Completion, FailureDetail, HistoryEvent};
    use crate::orchestration::{Orchestration, OrchestrationContext};
    use async_trait::async_trait;
    use chrono::Utc;
    use serde_json::json;

    #[derive(Default)]
    struct Echo;

    #[async_trait(?Send)]
    impl Orchestration for Echo {
        const NAME: &'static str = "echo";
        type Input = String;
        type Output = String;

        async fn run(&self, _ctx: OrchestrationContext, input: String) -> Result<String, FailureDetail> {
            Ok(input)
        }
    }

    #[tokio::test]
    async fn worker_routes_orchestrator_requests_through_the_local_set() {
        let channel = Arc::new(InMemoryChannel::new());
        let registry = Registry::builder().add_orchestrator::<Echo>().build().unwrap();
        let worker = Worker::new(channel.clone(), "worker-1", "hub-1", registry, WorkerOptions::default());

        channel.push_work_item(WorkItem::OrchestratorRequest {
            delivery_id: "d1".into(),
            instance_id: "inst1".into(),
            orchestration_name: "echo".into(),
            version: "0.0.0".into(),
            history: vec![
                HistoryEvent::OrchestratorStarted { timestamp: Utc::now() },
                HistoryEvent::ExecutionStarted { name: "echo".into(), version: "0.0.0".into(), input: json!("hi") },
            ],
            new_events: vec![],
        });

        let run_handle = tokio::spawn(async move { worker.run().await });

        let sent = channel.next_sent().await.expect("completion expected");
        match sent {
            Completion::Orchestrator { actions, .. } => {
                assert!(matches!(actions.last(), Some(crate::history::Action::CompleteOrchestration { .. })));
            }
            _ => panic!("expected orchestrator completion"),
        }

        channel.close().await.unwrap();
        let _ = run_handle.await;
    }

    #[tokio::test]
    async fn orchestration_concurrency_bound_still_drains_every_request() {
        let channel = Arc::new(InMemoryChannel::new());
        let registry = Registry::builder().add_orchestrator::<Echo>().build().unwrap();
        let options = WorkerOptions::builder().max_concurrent_orchestrations(1).build();
        let worker = Worker::new(channel.clone(), "worker-1", "hub-1", registry, options);

        for i in 0..3 {
            channel.push_work_item(WorkItem::OrchestratorRequest {
                delivery_id: format!("d{i}"),
                instance_id: format!("inst{i}"),
                orchestration_name: "echo".into(),
                version: "0.0.0".into(),
                history: vec![
                    HistoryEvent::OrchestratorStarted { timestamp: Utc::now() },
                    HistoryEvent::ExecutionStarted { name: "echo".into(), version: "0.0.0".into(), input: json!("hi") },
                ],
                new_events: vec![],
            });
        }

        let run_handle = tokio::spawn(async move { worker.run().await });

        for _ in 0..3 {
            let sent = channel.next_sent().await.expect("completion expected");
            assert!(matches!(sent, Completion::Orchestrator { .. }));
        }

        channel.close().await.unwrap();
        let _ = run_handle.await;
    }
}
