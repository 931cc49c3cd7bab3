//! Name → constructor mapping for orchestrators, activities, and entities:
//! three parallel tables behind one `build()` step.

use std::collections::HashMap;

use crate::activity::{Activity, AnyActivity, ActivityWrapper};
use crate::entity::{AnyEntity, Entity, EntityWrapper};
use crate::orchestration::{AnyOrchestration, Orchestration, OrchestrationWrapper};

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("name collision: '{0}' is already registered as {1}")]
    NameCollision(String, &'static str),

    #[error("unknown orchestrator type: {0}")]
    UnknownOrchestrator(String),

    #[error("unknown activity type: {0}")]
    UnknownActivity(String),

    #[error("unknown entity type: {0}")]
    UnknownEntity(String),
}

/// Accumulates registrations; name collisions are fatal at [`build`],
/// ("Name collision is fatal at build time").
#[derive(Default)]
pub struct RegistryBuilder {
    orchestrators: Vec<(String, Box<dyn Fn() -> Box<dyn AnyOrchestration>>)>,
    activities: Vec<(String, Box<dyn Fn() -> Box<dyn AnyActivity> + Send + Sync>)>,
    entities: Vec<(String, Box<dyn Fn() -> Box<dyn AnyEntity> + Send + Sync>)>,
}

impl RegistryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_orchestrator<O: Orchestration>(mut self) -> Self {
        self.orchestrators
            .push((O::NAME.to_string(), Box::new(|| Box::new(OrchestrationWrapper { inner: O::default() }))));
        self
    }

    /// Registers an orchestrator built by a user-supplied closure rather
    /// than `O::default()` — the "factory" registration mode, for types
    /// that need constructor arguments.
    pub fn add_orchestrator_factory<O, F>(mut self, factory: F) -> Self
    where
        O: Orchestration,
        F: Fn() -> O + 'static,
    {
        self.orchestrators.push((O::NAME.to_string(), Box::new(move || Box::new(OrchestrationWrapper { inner: factory() }))));
        self
    }

    /// Registers a single already-constructed orchestrator, cloned for
    /// each turn — the "instance" registration mode.
    pub fn add_orchestrator_instance<O: Orchestration + Clone>(mut self, instance: O) -> Self {
        self.orchestrators
            .push((O::NAME.to_string(), Box::new(move || Box::new(OrchestrationWrapper { inner: instance.clone() }))));
        self
    }

    pub fn add_activity<A: Activity + Default>(mut self) -> Self {
        self.activities
            .push((A::NAME.to_string(), Box::new(|| Box::new(ActivityWrapper { inner: A::default() }))));
        self
    }

    /// Registers an activity built by a user-supplied closure rather than
    /// `A::default()` — the "factory" registration mode.
    pub fn add_activity_factory<A, F>(mut self, factory: F) -> Self
    where
        A: Activity,
        F: Fn() -> A + Send + Sync + 'static,
    {
        self.activities.push((A::NAME.to_string(), Box::new(move || Box::new(ActivityWrapper { inner: factory() }))));
        self
    }

    /// Registers a single already-constructed activity, cloned for each
    /// dispatch — the "instance" registration mode.
    pub fn add_activity_instance<A: Activity + Clone>(mut self, instance: A) -> Self {
        self.activities
            .push((A::NAME.to_string(), Box::new(move || Box::new(ActivityWrapper { inner: instance.clone() }))));
        self
    }

    pub fn add_entity<E: Entity>(mut self) -> Self {
        self.entities
            .push((E::NAME.to_string(), Box::new(|| Box::new(EntityWrapper { inner: E::default() }))));
        self
    }

    /// Registers an entity built by a user-supplied closure rather than
    /// `E::default()` — the "factory" registration mode.
    pub fn add_entity_factory<E, F>(mut self, factory: F) -> Self
    where
        E: Entity,
        F: Fn() -> E + Send + Sync + 'static,
    {
        self.entities.push((E::NAME.to_string(), Box::new(move || Box::new(EntityWrapper { inner: factory() }))));
        self
    }

    /// Registers a single already-constructed entity, cloned for each
    /// batch — the "instance" registration mode.
    pub fn add_entity_instance<E: Entity + Clone>(mut self, instance: E) -> Self {
        self.entities
            .push((E::NAME.to_string(), Box::new(move || Box::new(EntityWrapper { inner: instance.clone() }))));
        self
    }

    pub fn build(self) -> Result<Registry, RegistryError> {
        let orchestrators = dedupe(self.orchestrators, "orchestrator")?;
        let activities = dedupe(self.activities, "activity")?;
        let entities = dedupe(self.entities, "entity")?;

        Ok(Registry {
            orchestrator_factories: orchestrators,
            activity_factories: activities,
            entity_factories: entities,
        })
    }
}

fn dedupe<F>(items: Vec<(String, F)>, kind: &'static str) -> Result<HashMap<String, F>, RegistryError> {
    let mut map = HashMap::with_capacity(items.len());
    for (name, factory) in items {
        if map.insert(name.clone(), factory).is_some() {
            return Err(RegistryError::NameCollision(name, kind));
        }
    }
    Ok(map)
}

/// Immutable after `build()`; reads are lock-free.
pub struct Registry {
    orchestrator_factories: HashMap<String, Box<dyn Fn() -> Box<dyn AnyOrchestration>>>,
    activity_factories: HashMap<String, Box<dyn Fn() -> Box<dyn AnyActivity> + Send + Sync>>,
    entity_factories: HashMap<String, Box<dyn Fn() -> Box<dyn AnyEntity> + Send + Sync>>,
}

impl Registry {
    pub fn builder() -> RegistryBuilder {
        RegistryBuilder::new()
    }

    pub fn try_create_orchestrator(&self, name: &str) -> Result<Box<dyn AnyOrchestration>, RegistryError> {
        self.orchestrator_factories
            .get(name)
            .map(|f| f())
            .ok_or_else(|| RegistryError::UnknownOrchestrator(name.to_string()))
    }

    pub fn try_create_activity(&self, name: &str) -> Result<Box<dyn AnyActivity>, RegistryError> {
        self.activity_factories
            .get(name)
            .map(|f| f())
            .ok_or_else(|| RegistryError::UnknownActivity(name.to_string()))
    }

    pub fn try_create_entity(&self, name: &str) -> Result<Box<dyn AnyEntity>, RegistryError> {
        self.entity_factories
            .get(name)
            .map(|f| f())
            .ok_or_else(|| RegistryError::UnknownEntity(name.to_string()))
    }

    /// Materializes every registered activity into the map
    /// `ActivityDispatcher` expects.
    pub fn build_activity_handlers(&self) -> HashMap<String, Box<dyn AnyActivity>> {
        self.activity_factories.iter().map(|(name, f)| (name.clone(), f())).collect()
    }

    /// Materializes every registered entity into the map
    /// `EntityDispatcher` expects.
    pub fn build_entity_handlers(&self) -> HashMap<String, Box<dyn AnyEntity>> {
        self.entity_factories.iter().map(|(name, f)| (name.clone(), f())).collect()
    }

    /// Materializes every registered orchestrator into the map
    /// `OrchestrationDispatcher` expects.
    pub fn build_orchestrator_handlers(&self) -> HashMap<String, Box<dyn AnyOrchestration>> {
        self.orchestrator_factories.iter().map(|(name, f)| (name.clone(), f())).collect()
    }

    pub fn orchestrator_count(&self) -> usize {
        self.orchestrator_factories.len()
    }

    pub fn activity_count(&self) -> usize {
        self.activity_factories.len()
    }

    pub fn entity_count(&self) -> usize {
        self.entity_factories.len()
    }
}
