//! Orchestration dispatcher: pulls `OrchestratorRequest` work items off a
//! [`SchedulerChannel`], drives one [`run_turn`] each, and sends the
//! resulting actions back as a `Completion`.
//!
//! Because a turn's [`OrchestrationContext`] is `Rc`-backed (single-
//! threaded cooperative execution within a turn), turns run on a
//! [`tokio::task::LocalSet`] via `spawn_local` rather than `tokio::spawn`.
//! Multiple dispatchers — one `LocalSet` per worker thread — give
//! multi-threaded parallelism at the dispatcher level across instances,
//! while each individual turn stays single-threaded.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::instrument;

use crate::channel::SchedulerChannel;
use crate::history::{Completion, FailureDetail, HistoryEvent, WorkItem};
use crate::orchestration::{run_turn, AnyOrchestration};
use crate::versioning::{VersionOutcome, VersioningPolicy};

pub struct OrchestrationDispatcher<C: SchedulerChannel> {
    channel: Arc<C>,
    orchestrators: Arc<HashMap<String, Box<dyn AnyOrchestration>>>,
    versioning: VersioningPolicy,
    max_timer_interval: Duration,
}

impl<C: SchedulerChannel + 'static> OrchestrationDispatcher<C> {
    pub fn new(
        channel: Arc<C>,
        orchestrators: HashMap<String, Box<dyn AnyOrchestration>>,
        versioning: VersioningPolicy,
        max_timer_interval: Duration,
    ) -> Self {
        Self {
            channel,
            orchestrators: Arc::new(orchestrators),
            versioning,
            max_timer_interval,
        }
    }

    /// Consumes `OrchestratorRequest` work items from the channel until it
    /// closes. Must be run inside a `tokio::task::LocalSet` because
    /// individual turns are `!Send`.
    pub async fn run(&self) {
        while let Some(item) = self.channel.recv().await {
            if let WorkItem::OrchestratorRequest { .. } = &item {
                self.handle(item).await;
            }
        }
    }

    /// Handles a single `OrchestratorRequest`. Exposed at `pub(crate)`
    /// visibility so [`crate::worker::Worker`] can route one work item at a
    /// time from its central receive loop rather than racing multiple
    /// independent `recv()` calls against the same channel.
    #[instrument(skip(self, item), fields(orchestration.name))]
    pub(crate) async fn handle(&self, item: WorkItem) {
        let WorkItem::OrchestratorRequest {
            delivery_id,
            instance_id,
            orchestration_name,
            version,
            history,
            new_events,
        } = item
        else {
            return;
        };
        tracing::Span::current().record("orchestration.name", &orchestration_name.as_str());

        if !self.versioning.accepts(&version) {
            match self.versioning.outcome_for_mismatch() {
                VersionOutcome::Reject => {
                    tracing::warn!(version = %version, "rejecting orchestrator request: version mismatch");
                    return;
                }
                VersionOutcome::Fail => {
                    let completion = Completion::Orchestrator {
                        delivery_id,
                        instance_id,
                        actions: vec![crate::history::Action::FailOrchestration {
                            failure: FailureDetail::new(
                                crate::history::FailureKind::Application,
                                format!("incompatible orchestration version: {version}"),
                            )
                            .non_retriable(),
                        }],
                    };
                    let _ = self.channel.send(completion).await;
                    return;
                }
            }
        }

        let Some(orchestrator) = self.orchestrators.get(&orchestration_name) else {
            let completion = Completion::Orchestrator {
                delivery_id,
                instance_id,
                actions: vec![crate::history::Action::FailOrchestration {
                    failure: FailureDetail::task_not_found(&orchestration_name),
                }],
            };
            let _ = self.channel.send(completion).await;
            return;
        };

        let execution_started_at = started_at(&history).unwrap_or_else(Utc::now);
        let turn_index = history.len() as u64;
        let input = execution_input(&history).unwrap_or(serde_json::Value::Null);

        let outcome = run_turn(
            orchestrator.as_ref(),
            instance_id.clone(),
            turn_index,
            execution_started_at,
            input,
            &history,
            &new_events,
            self.max_timer_interval,
        )
        .await;

        let mut actions = outcome.actions;
        if let Some(status) = outcome.custom_status {
            actions.push(crate::history::Action::SetCustomStatus { value: status });
        }
        if let Some((input, preserve_events)) = outcome.continue_as_new {
            // `continueAsNew` is itself terminal for this execution: the
            // orchestrator function still has to return something to
            // satisfy its signature, but that return value is not a real
            // completion and must not also emit `CompleteOrchestration`.
            actions.push(crate::history::Action::ContinueAsNew { input, preserve_events });
        } else {
            match outcome.completed {
                Some(Ok(result)) => actions.push(crate::history::Action::CompleteOrchestration { result }),
                Some(Err(failure)) => actions.push(crate::history::Action::FailOrchestration { failure }),
                None => {}
            }
        }

        let completion = Completion::Orchestrator { delivery_id, instance_id, actions };
        if let Err(e) = self.channel.send(completion).await {
            tracing::error!(error = %e, "failed to send orchestrator completion");
        }
    }
}

fn started_at(history: &[HistoryEvent]) -> Option<chrono::DateTime<Utc>> {
    history.iter().find_map(|e| match e {
        HistoryEvent::OrchestratorStarted { timestamp } => Some(*timestamp),
        _ => None,
    })
}

fn execution_input(history: &[HistoryEvent]) -> Option<serde_json::Value> {
    history.iter().find_map(|e| match e {
        HistoryEvent::ExecutionStarted { input, .. } => Some(input.clone()),
        _ => None,
    })
}
