//! Entity trait, dispatch context, and the single-writer batch dispatcher.
//!
//! Method resolution is the most language-portable option: one
//! `handle_operation(name, input)` method the user implements with a
//! match, rather than a registration table or code generation. The
//! dispatcher intercepts the implicit `delete` operation
//! (case-insensitive) itself so user code never special-cases it. The
//! per-attempt cancellation shape mirrors the activity dispatch context;
//! the `is_signal` flag on each batched operation distinguishes a
//! fire-and-forget signal from a call awaiting a reply.

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;

use crate::history::{Action, EntityOperationRequest, EntityOperationResult, FailureDetail, FailureKind, WorkItem};

/// Name of the operation the dispatcher handles itself without invoking
/// user code ("implicit-delete method `delete` clears
/// state").
pub const DELETE_OPERATION: &str = "delete";

/// `(entity-name, key)` pair, encoded on the wire as `@name@key` (the
/// convention the scheduler's entity ids already follow).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EntityId {
    pub name: String,
    pub key: String,
}

impl EntityId {
    pub fn parse(raw: &str) -> Result<Self, FailureDetail> {
        let trimmed = raw.strip_prefix('@').unwrap_or(raw);
        let mut parts = trimmed.splitn(2, '@');
        let name = parts.next().unwrap_or_default().to_string();
        let key = parts
            .next()
            .ok_or_else(|| FailureDetail::new(FailureKind::Application, format!("malformed entity id: {raw}")))?
            .to_string();
        if name.is_empty() || key.is_empty() {
            return Err(FailureDetail::new(
                FailureKind::Application,
                format!("malformed entity id: {raw}"),
            ));
        }
        Ok(Self { name, key })
    }

    pub fn to_wire(&self) -> String {
        format!("@{}@{}", self.name, self.key)
    }
}

/// Handle passed to [`Entity::handle_operation`]. Collects outbound
/// signals/sub-orchestration starts an operation requests, flushed into
/// the batch's [`crate::history::Completion::Entity::signals`] list.
pub struct EntityContext {
    id: EntityId,
    outbound: Vec<Action>,
    next_task_id: u32,
}

impl EntityContext {
    fn new(id: EntityId) -> Self {
        Self { id, outbound: Vec::new(), next_task_id: 0 }
    }

    pub fn entity_id(&self) -> &EntityId {
        &self.id
    }

    /// Fire-and-forget signal to another entity, buffered until the batch
    /// completes.
    pub fn signal_entity(&mut self, entity_id: &str, operation: &str, input: impl Serialize) {
        let task_id = self.next_task_id;
        self.next_task_id += 1;
        self.outbound.push(Action::SignalEntity {
            task_id,
            entity_id: entity_id.to_string(),
            operation: operation.to_string(),
            input: serde_json::to_value(input).unwrap_or(Value::Null),
            scheduled_time: None,
        });
    }

    /// Starts a new orchestration instance, buffered until the batch
    /// completes.
    pub fn start_orchestration(&mut self, name: &str, instance_id: &str, input: impl Serialize) {
        let task_id = self.next_task_id;
        self.next_task_id += 1;
        self.outbound.push(Action::ScheduleSubOrchestrator {
            task_id,
            name: name.to_string(),
            instance_id: instance_id.to_string(),
            input: serde_json::to_value(input).unwrap_or(Value::Null),
            version: None,
        });
    }
}

/// Addressable, single-writer stateful object.
#[async_trait]
pub trait Entity: Send + Sync + Default + 'static {
    const NAME: &'static str;
    type State: Serialize + DeserializeOwned + Default + Send;

    async fn handle_operation(
        &self,
        ctx: &mut EntityContext,
        state: &mut Self::State,
        operation: &str,
        input: Value,
    ) -> Result<Value, FailureDetail>;
}

#[async_trait]
pub trait AnyEntity: Send + Sync {
    fn name(&self) -> &'static str;

    /// Runs one batch against a (possibly absent) state snapshot. Returns
    /// the final snapshot (`None` means deleted/never created), the
    /// ordered per-operation results, and any outbound actions.
    async fn run_batch(
        &self,
        id: &EntityId,
        state_snapshot: Option<Value>,
        operations: &[EntityOperationRequest],
    ) -> (Option<Value>, Vec<EntityOperationResult>, Vec<Action>);
}

pub(crate) struct EntityWrapper<E: Entity> {
    pub(crate) inner: E,
}

#[async_trait]
impl<E: Entity> AnyEntity for EntityWrapper<E> {
    fn name(&self) -> &'static str {
        E::NAME
    }

    async fn run_batch(
        &self,
        id: &EntityId,
        state_snapshot: Option<Value>,
        operations: &[EntityOperationRequest],
    ) -> (Option<Value>, Vec<EntityOperationResult>, Vec<Action>) {
        let mut state: E::State = match state_snapshot {
            Some(value) => serde_json::from_value(value).unwrap_or_default(),
            None => E::State::default(),
        };
        let mut deleted = state_snapshot.is_none() && false; // becomes true only via explicit delete
        let mut ctx = EntityContext::new(id.clone());
        let mut results = Vec::with_capacity(operations.len());

        for op in operations {
            let operation = op.operation.to_ascii_lowercase();
            if operation == DELETE_OPERATION {
                deleted = true;
                state = E::State::default();
                if !op.is_signal {
                    results.push(EntityOperationResult { id: op.id.clone(), result: Ok(Value::Null) });
                }
                continue;
            }

            let outcome = self
                .inner
                .handle_operation(&mut ctx, &mut state, &operation, op.input.clone())
                .await;

            if outcome.is_ok() {
                deleted = false;
            }

            if !op.is_signal {
                results.push(EntityOperationResult { id: op.id.clone(), result: outcome });
            }
        }

        let final_snapshot = if deleted {
            None
        } else {
            Some(serde_json::to_value(&state).unwrap_or(Value::Null))
        };

        (final_snapshot, results, ctx.outbound)
    }
}

pub type EntityFactory = Box<dyn Fn() -> Box<dyn AnyEntity> + Send + Sync>;

/// Drives one `EntityRequest` work item end to end against a registered
/// entity type. Single-writer per `(name, key)` is guaranteed by the
/// scheduler never dispatching two concurrent requests for the same
/// entity; the dispatcher does not additionally lock, trusting that
/// invariant rather than re-enforcing it.
pub struct EntityDispatcher {
    entities: std::collections::HashMap<String, Box<dyn AnyEntity>>,
}

impl EntityDispatcher {
    pub fn new(entities: std::collections::HashMap<String, Box<dyn AnyEntity>>) -> Self {
        Self { entities }
    }

    pub async fn dispatch(&self, work_item: WorkItem) -> Option<crate::history::Completion> {
        let WorkItem::EntityRequest { delivery_id, entity_id, operations, state_snapshot } = work_item else {
            return None;
        };

        let parsed = match EntityId::parse(&entity_id) {
            Ok(id) => id,
            Err(failure) => {
                let results = operations
                    .iter()
                    .filter(|op| !op.is_signal)
                    .map(|op| EntityOperationResult { id: op.id.clone(), result: Err(failure.clone()) })
                    .collect();
                return Some(crate::history::Completion::Entity {
                    delivery_id,
                    entity_id,
                    state: state_snapshot,
                    results,
                    signals: vec![],
                });
            }
        };

        let Some(entity) = self.entities.get(&parsed.name) else {
            let failure = FailureDetail::task_not_found(&parsed.name);
            let results = operations
                .iter()
                .filter(|op| !op.is_signal)
                .map(|op| EntityOperationResult { id: op.id.clone(), result: Err(failure.clone()) })
                .collect();
            return Some(crate::history::Completion::Entity {
                delivery_id,
                entity_id,
                state: state_snapshot,
                results,
                signals: vec![],
            });
        };

        let (state, results, signals) = entity.run_batch(&parsed, state_snapshot, &operations).await;

        Some(crate::history::Completion::Entity { delivery_id, entity_id, state, results, signals })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Default, Serialize, Deserialize)]
    struct CounterState {
        value: i64,
    }

    #[derive(Default)]
    struct Counter;

    #[async_trait]
    impl Entity for Counter {
        const NAME: &'static str = "Counter";
        type State = CounterState;

        async fn handle_operation(
            &self,
            _ctx: &mut EntityContext,
            state: &mut Self::State,
            operation: &str,
            input: Value,
        ) -> Result<Value, FailureDetail> {
            match operation {
                "add" => {
                    let amount: i64 = serde_json::from_value(input).map_err(|e| {
                        FailureDetail::new(FailureKind::Application, format!("bad input: {e}"))
                    })?;
                    state.value += amount;
                    Ok(Value::Null)
                }
                "get" => Ok(serde_json::json!(state.value)),
                other => Err(FailureDetail::task_not_found(other)),
            }
        }
    }

    #[test]
    fn entity_id_parses_wire_format() {
        let id = EntityId::parse("@Counter@k1").unwrap();
        assert_eq!(id.name, "Counter");
        assert_eq!(id.key, "k1");
        assert_eq!(id.to_wire(), "@Counter@k1");
    }

    #[test]
    fn malformed_entity_id_errors() {
        assert!(EntityId::parse("Counter").is_err());
    }

    #[tokio::test]
    async fn mixed_success_failure_batch_keeps_processing() {
        let wrapper = EntityWrapper { inner: Counter };
        let id = EntityId { name: "Counter".into(), key: "k1".into() };
        let ops = vec![
            EntityOperationRequest { id: "op1".into(), operation: "add".into(), input: serde_json::json!(5), is_signal: false },
            EntityOperationRequest { id: "op2".into(), operation: "add".into(), input: serde_json::json!("oops"), is_signal: false },
            EntityOperationRequest { id: "op3".into(), operation: "get".into(), input: Value::Null, is_signal: false },
        ];

        let (state, results, _signals) = wrapper.run_batch(&id, None, &ops).await;

        assert_eq!(results.len(), 3);
        assert!(results[0].result.is_ok());
        assert!(results[1].result.is_err());
        assert_eq!(results[2].result.clone().unwrap(), serde_json::json!(5));
        assert_eq!(state.unwrap(), serde_json::json!({"value": 5}));
    }

    #[tokio::test]
    async fn delete_operation_is_intercepted_without_user_code() {
        let wrapper = EntityWrapper { inner: Counter };
        let id = EntityId { name: "Counter".into(), key: "k1".into() };
        let ops = vec![
            EntityOperationRequest { id: "op1".into(), operation: "add".into(), input: serde_json::json!(5), is_signal: false },
            EntityOperationRequest { id: "op2".into(), operation: "DELETE".into(), input: Value::Null, is_signal: false },
        ];

        let (state, results, _) = wrapper.run_batch(&id, None, &ops).await;
        assert!(state.is_none());
        assert_eq!(results.len(), 2);
    }
}
