//! Step registry mapping type strings to factories.

use super::{
    CircuitBreakerStep, ConditionalStep, ForEachStep, LogStep, RetryWithBackoffStep, SetStep,
    Step, CIRCUIT_BREAKER_STEP_TYPE, CONDITIONAL_STEP_TYPE, FOR_EACH_STEP_TYPE, LOG_STEP_TYPE,
    RETRY_STEP_TYPE, SET_STEP_TYPE,
};
use crate::errors::StepflowError;
use parking_lot::RwLock;
use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::Arc;

/// Raw configuration handed to a step factory.
pub type StepConfig = serde_json::Map<String, serde_json::Value>;

/// Builds a step from its name, configuration and services.
///
/// Factories validate configuration eagerly; an invalid configuration is an
/// error here, never at execution time.
pub type StepFactory =
    Arc<dyn Fn(&str, &StepConfig, &Services) -> Result<Arc<dyn Step>, StepflowError> + Send + Sync>;

/// Deferred access to a registry.
///
/// Composite factories hold one of these instead of the registry itself, so
/// they can be registered before the registry is complete. Returns `None`
/// once the registry has been dropped.
pub type RegistryProvider = Arc<dyn Fn() -> Option<Arc<StepRegistry>> + Send + Sync>;

/// Opaque services passed through to every factory.
///
/// The kernel never inspects these; leaf steps look up what they need by type.
#[derive(Clone, Default)]
pub struct Services {
    entries: Arc<HashMap<TypeId, Arc<dyn Any + Send + Sync>>>,
}

impl Services {
    /// Creates an empty set of services.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a service, replacing any previous one of the same type.
    #[must_use]
    pub fn with<T: Any + Send + Sync>(mut self, service: T) -> Self {
        Arc::make_mut(&mut self.entries).insert(TypeId::of::<T>(), Arc::new(service));
        self
    }

    /// Looks up a service by type.
    #[must_use]
    pub fn get<T: Any + Send + Sync>(&self) -> Option<&T> {
        self.entries
            .get(&TypeId::of::<T>())
            .and_then(|s| s.downcast_ref::<T>())
    }

    /// Returns the number of services.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if no services are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl std::fmt::Debug for Services {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Services")
            .field("count", &self.entries.len())
            .finish()
    }
}

/// Registry of step factories keyed by type string.
#[derive(Default)]
pub struct StepRegistry {
    factories: RwLock<HashMap<String, StepFactory>>,
}

impl StepRegistry {
    /// Creates a new empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a registry with the composite and built-in leaf step types.
    #[must_use]
    pub fn with_builtins() -> Arc<Self> {
        let registry = Arc::new(Self::new());
        registry.register_builtins();
        registry
    }

    /// Registers the composite and built-in leaf step types.
    pub fn register_builtins(self: &Arc<Self>) {
        let provider = self.provider();
        self.register(RETRY_STEP_TYPE, RetryWithBackoffStep::factory(Arc::clone(&provider)));
        self.register(
            CIRCUIT_BREAKER_STEP_TYPE,
            CircuitBreakerStep::factory(Arc::clone(&provider)),
        );
        self.register(FOR_EACH_STEP_TYPE, ForEachStep::factory(provider));
        self.register(SET_STEP_TYPE, SetStep::from_config);
        self.register(LOG_STEP_TYPE, LogStep::from_config);
        self.register(CONDITIONAL_STEP_TYPE, ConditionalStep::from_config);
    }

    /// Registers a factory. A later registration for the same type wins.
    pub fn register<F>(&self, step_type: impl Into<String>, factory: F)
    where
        F: Fn(&str, &StepConfig, &Services) -> Result<Arc<dyn Step>, StepflowError>
            + Send
            + Sync
            + 'static,
    {
        let step_type = step_type.into();
        tracing::debug!(step_type = %step_type, "Registering step factory");
        self.factories.write().insert(step_type, Arc::new(factory));
    }

    /// Builds a step of the given type.
    ///
    /// # Errors
    ///
    /// Returns `UnknownStepType` if no factory is registered, or whatever the
    /// factory reports for an invalid configuration.
    pub fn create(
        &self,
        step_type: &str,
        name: &str,
        config: &StepConfig,
        services: &Services,
    ) -> Result<Arc<dyn Step>, StepflowError> {
        // Composite factories call back into the registry, so the lock must
        // be released before the factory runs.
        let factory = self
            .factories
            .read()
            .get(step_type)
            .cloned()
            .ok_or_else(|| StepflowError::UnknownStepType {
                step_type: step_type.to_string(),
            })?;
        factory(name, config, services)
    }

    /// Returns true if a factory is registered for the type.
    #[must_use]
    pub fn contains(&self, step_type: &str) -> bool {
        self.factories.read().contains_key(step_type)
    }

    /// Lists registered types in sorted order.
    #[must_use]
    pub fn step_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.factories.read().keys().cloned().collect();
        types.sort();
        types
    }

    /// Returns a provider that resolves to this registry while it is alive.
    #[must_use]
    pub fn provider(self: &Arc<Self>) -> RegistryProvider {
        let registry = Arc::downgrade(self);
        Arc::new(move || registry.upgrade())
    }
}

impl std::fmt::Debug for StepRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StepRegistry")
            .field("step_types", &self.step_types())
            .finish()
    }
}
