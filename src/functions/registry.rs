//! Built-in function lookup

use super::builtin;
use super::ChainFunction;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Built-in transformations and destinations known to the process.
///
/// Transformations are keyed by the name after `builtin.transformation.`,
/// destinations by destination type (the part after `builtin.destination.`).
#[derive(Clone, Default)]
pub struct FunctionRegistry {
    transformations: HashMap<String, Arc<dyn ChainFunction>>,
    destinations: HashMap<String, Arc<dyn ChainFunction>>,
}

impl FunctionRegistry {
    /// Empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with everything shipped in this crate
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry
            .register_transformation("bot-filter", Arc::new(builtin::BotFilter))
            .register_transformation("ip-anonymization", Arc::new(builtin::IpAnonymization))
            .register_destination("webhook", Arc::new(builtin::WebhookDestination))
            .register_destination("devnull", Arc::new(builtin::DevNullDestination));
        registry
    }

    /// Add or replace a transformation
    pub fn register_transformation(
        &mut self,
        name: impl Into<String>,
        function: Arc<dyn ChainFunction>,
    ) -> &mut Self {
        self.transformations.insert(name.into(), function);
        self
    }

    /// Add or replace a destination
    pub fn register_destination(
        &mut self,
        destination_type: impl Into<String>,
        function: Arc<dyn ChainFunction>,
    ) -> &mut Self {
        self.destinations.insert(destination_type.into(), function);
        self
    }

    /// Look up a transformation by name
    pub fn transformation(&self, name: &str) -> Option<Arc<dyn ChainFunction>> {
        self.transformations.get(name).cloned()
    }

    /// Look up a destination by type
    pub fn destination(&self, destination_type: &str) -> Option<Arc<dyn ChainFunction>> {
        self.destinations.get(destination_type).cloned()
    }
}

impl fmt::Debug for FunctionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut transformations: Vec<_> = self.transformations.keys().collect();
        let mut destinations: Vec<_> = self.destinations.keys().collect();
        transformations.sort();
        destinations.sort();
        f.debug_struct("FunctionRegistry")
            .field("transformations", &transformations)
            .field("destinations", &destinations)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtins_registered() {
        let registry = FunctionRegistry::with_builtins();
        assert!(registry.destination("webhook").is_some());
        assert!(registry.destination("devnull").is_some());
        assert!(registry.destination("clickhouse").is_none());
        assert!(registry.transformation("bot-filter").is_some());
        assert!(registry.transformation("unknown").is_none());
    }
}
