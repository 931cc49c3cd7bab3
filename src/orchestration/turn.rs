//! `run_turn`: drives exactly one orchestrator turn to its next suspension
//! point.

use std::cell::RefCell;
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context as PollContext, Poll, RawWaker, RawWakerVTable, Waker};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value;

use super::context::{NonDeterminismPanic, OrchestrationContext, TurnState};
use super::AnyOrchestration;
use crate::history::{Action, FailureDetail, FailureKind, HistoryEvent};

/// Everything a turn produced, ready to be folded into a `Completion`.
pub struct TurnOutcome {
    pub actions: Vec<Action>,
    pub custom_status: Option<Value>,
    pub continue_as_new: Option<(Value, bool)>,
    pub completed: Option<Result<Value, FailureDetail>>,
}

/// A waker that does nothing: correct here because nothing in this
/// executor ever calls `wake()` from outside the single poll — there is
/// no real I/O or timer driving re-polls, so no second poll is ever
/// needed within a turn.
fn noop_waker() -> Waker {
    fn clone(_: *const ()) -> RawWaker {
        raw_waker()
    }
    fn no_op(_: *const ()) {}
    fn raw_waker() -> RawWaker {
        static VTABLE: RawWakerVTable = RawWakerVTable::new(clone, no_op, no_op, no_op);
        RawWaker::new(std::ptr::null(), &VTABLE)
    }
    unsafe { Waker::from_raw(raw_waker()) }
}

/// Executes one turn: builds a fresh [`TurnState`] from `history` plus
/// `new_events`, then polls the orchestrator's future once to drive it to
/// either completion or its next suspension point.
///
/// A replay mismatch anywhere inside the awaited call tree unwinds as a
/// [`NonDeterminismPanic`], caught here and converted into a `Failed`
/// turn outcome rather than propagated as a Rust panic.
pub async fn run_turn(
    orchestrator: &dyn AnyOrchestration,
    instance_id: String,
    turn_index: u64,
    execution_started_at: DateTime<Utc>,
    input: Value,
    history: &[HistoryEvent],
    new_events: &[HistoryEvent],
    max_timer_interval: Duration,
) -> TurnOutcome {
    let state = Rc::new(RefCell::new(TurnState::new(
        instance_id,
        turn_index,
        execution_started_at,
        input.clone(),
        history,
        new_events,
        max_timer_interval,
    )));
    let ctx = OrchestrationContext::new(state.clone());

    let mut future = orchestrator.run_any(ctx, input);
    let waker = noop_waker();
    let mut poll_cx = PollContext::from_waker(&waker);

    let poll_result =
        std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| Pin::new(&mut future).poll(&mut poll_cx)));

    // Drop the future — and the `OrchestrationContext` clone it holds —
    // before reclaiming `state`, so the `Rc` below has exactly one owner.
    drop(future);

    let reclaim = || {
        Rc::try_unwrap(state)
            .unwrap_or_else(|_| panic!("orchestration context outlived its turn"))
            .into_inner()
            .into_parts()
    };

    match poll_result {
        Ok(Poll::Ready(result)) => {
            let (actions, custom_status, continue_as_new, explicit_complete) = reclaim();
            TurnOutcome {
                actions,
                custom_status,
                continue_as_new,
                completed: explicit_complete.or(Some(result)),
            }
        }
        Ok(Poll::Pending) => {
            let (actions, custom_status, continue_as_new, completed) = reclaim();
            TurnOutcome { actions, custom_status, continue_as_new, completed }
        }
        Err(panic) => {
            let failure = panic
                .downcast::<NonDeterminismPanic>()
                .map(|p| p.0)
                .unwrap_or_else(|_| {
                    FailureDetail::new(FailureKind::Infrastructure, "orchestrator panicked").non_retriable()
                });
            let (actions, custom_status, continue_as_new, _) = reclaim();
            TurnOutcome { actions, custom_status, continue_as_new, completed: Some(Err(failure)) }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestration::{Orchestration, OrchestrationWrapper};
    use async_trait::async_trait;

    #[derive(Default)]
    struct SequentialCalls;

    #[async_trait(?Send)]
    impl Orchestration for SequentialCalls {
        const NAME: &'static str = "sequential_calls";
        type Input = Vec<i64>;
        type Output = Vec<i64>;

        async fn run(&self, ctx: OrchestrationContext, input: Vec<i64>) -> Result<Vec<i64>, FailureDetail> {
            let mut results = Vec::new();
            for n in input {
                results.push(ctx.call_activity::<i64>("double", n).await?);
            }
            Ok(results)
        }
    }

    #[tokio::test]
    async fn first_turn_schedules_one_activity_and_stays_pending() {
        let orchestrator = OrchestrationWrapper { inner: SequentialCalls };
        let outcome = run_turn(
            &orchestrator,
            "inst1".into(),
            0,
            Utc::now(),
            serde_json::json!([1, 2, 3]),
            &[],
            &[],
            Duration::from_secs(3 * 24 * 60 * 60),
        )
        .await;

        assert_eq!(outcome.actions.len(), 1, "only the first unresolved call should produce an action in one poll pass");
        assert!(outcome.completed.is_none());
    }

    #[tokio::test]
    async fn non_determinism_mismatch_fails_the_turn() {
        let orchestrator = OrchestrationWrapper { inner: SequentialCalls };
        let history = vec![
            HistoryEvent::OrchestratorStarted { timestamp: Utc::now() },
            HistoryEvent::ExecutionStarted {
                name: "sequential_calls".into(),
                version: "0.0.0".into(),
                input: serde_json::json!([1, 2, 3]),
            },
            HistoryEvent::TaskScheduled { task_id: 0, name: "not_double".into(), input: serde_json::json!(1) },
        ];
        let outcome = run_turn(
            &orchestrator,
            "inst1".into(),
            1,
            Utc::now(),
            serde_json::json!([1, 2, 3]),
            &history,
            &[],
            Duration::from_secs(3 * 24 * 60 * 60),
        )
        .await;

        let failure = outcome.completed.expect("turn should resolve").unwrap_err();
        assert_eq!(failure.kind, FailureKind::NonDeterminism);
        assert!(failure.is_non_retriable);
    }
}
