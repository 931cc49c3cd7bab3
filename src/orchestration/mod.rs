//! Orchestration dispatcher — the centerpiece of this crate.
//!
//! Submodules:
//! - [`context`] — the `OrchestrationContext` facade and per-turn state.
//! - [`turn`] — `run_turn`, the single-poll executor.
//! - [`dispatcher`] — wires a registry and a scheduler channel together
//!   across concurrently-running instances.

pub mod context;
pub mod dispatcher;
pub mod turn;

pub use context::{OrchestrationContext, ReplaySafeLogger, DEFAULT_MAX_TIMER_INTERVAL};
pub use dispatcher::OrchestrationDispatcher;
pub use turn::{run_turn, TurnOutcome};

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;

use crate::history::{FailureDetail, FailureKind};

/// Deterministic, replay-based workflow definition. Flattened
/// to a single entry point per the design note in ("flatten to a
/// single interface `Run(Context, input) -> output`").
///
/// Not `Send`-bound: `OrchestrationContext` is `Rc`-backed, since it only
/// ever runs on the single thread driving one turn.
#[async_trait(?Send)]
pub trait Orchestration: Default + 'static {
    const NAME: &'static str;
    type Input: DeserializeOwned;
    type Output: Serialize;

    async fn run(&self, ctx: OrchestrationContext, input: Self::Input) -> Result<Self::Output, FailureDetail>;
}

/// Type-erased orchestrator interface, carrying a single definition
/// through the coroutine execution model regardless of its concrete
/// input/output types.
#[async_trait(?Send)]
pub trait AnyOrchestration {
    fn name(&self) -> &'static str;

    async fn run_any(&self, ctx: OrchestrationContext, input: Value) -> Result<Value, FailureDetail>;
}

pub(crate) struct OrchestrationWrapper<O: Orchestration> {
    pub(crate) inner: O,
}

#[async_trait(?Send)]
impl<O: Orchestration> AnyOrchestration for OrchestrationWrapper<O> {
    fn name(&self) -> &'static str {
        O::NAME
    }

    async fn run_any(&self, ctx: OrchestrationContext, input: Value) -> Result<Value, FailureDetail> {
        let typed: O::Input = serde_json::from_value(input).map_err(|e| {
            FailureDetail::new(FailureKind::Application, format!("deserialize input: {e}")).non_retriable()
        })?;
        let output = self.inner.run(ctx, typed).await?;
        serde_json::to_value(output)
            .map_err(|e| FailureDetail::new(FailureKind::Application, format!("serialize output: {e}")))
    }
}

pub type OrchestrationFactory = Box<dyn Fn() -> Box<dyn AnyOrchestration>>;
