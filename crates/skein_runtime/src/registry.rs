//! Unit registry: `unit_type` to implementation.
//!
//! Built once at startup and shared read-only afterwards.

use crate::unit::Unit;
use indexmap::IndexMap;
use skein_core::{CoreError, CoreResult};
use std::sync::Arc;

/// Registry of unit implementations
#[derive(Default, Clone)]
pub struct UnitRegistry {
    units: IndexMap<String, Arc<dyn Unit>>,
}

impl UnitRegistry {
    /// Create an empty registry
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a unit under its own `unit_type`
    ///
    /// # Errors
    ///
    /// Returns error if the type is already registered
    pub fn register(&mut self, unit: Arc<dyn Unit>) -> CoreResult<()> {
        let name = unit.unit_type().to_string();
        if self.units.contains_key(&name) {
            return Err(CoreError::AlreadyExists {
                kind: "unit".to_string(),
                id: name,
            });
        }
        self.units.insert(name, unit);
        Ok(())
    }

    /// Builder form of [`register`](Self::register)
    ///
    /// # Errors
    ///
    /// Returns error if the type is already registered
    pub fn with(mut self, unit: Arc<dyn Unit>) -> CoreResult<Self> {
        self.register(unit)?;
        Ok(self)
    }

    /// Look up a unit
    ///
    /// # Errors
    ///
    /// Returns error if nothing is registered under `unit_type`
    pub fn get(&self, unit_type: &str) -> CoreResult<Arc<dyn Unit>> {
        self.units
            .get(unit_type)
            .map(Arc::clone)
            .ok_or_else(|| CoreError::NotFound {
                kind: "unit".to_string(),
                id: unit_type.to_string(),
            })
    }

    /// Whether `unit_type` is registered
    #[must_use]
    pub fn contains(&self, unit_type: &str) -> bool {
        self.units.contains_key(unit_type)
    }

    /// Registered types, in registration order
    #[must_use]
    pub fn list(&self) -> Vec<&str> {
        self.units.keys().map(String::as_str).collect()
    }

    /// Number of registered units
    #[must_use]
    pub fn len(&self) -> usize {
        self.units.len()
    }

    /// Whether nothing is registered
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }
}

impl std::fmt::Debug for UnitRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.units.keys()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::unit::{StepContext, UnitError};
    use async_trait::async_trait;

    struct Noop(&'static str);

    #[async_trait]
    impl Unit for Noop {
        fn unit_type(&self) -> &str {
            self.0
        }

        async fn execute(&self, _ctx: &mut StepContext) -> Result<serde_json::Value, UnitError> {
            Ok(serde_json::Value::Null)
        }
    }

    #[test]
    fn test_registry_new() {
        let registry = UnitRegistry::new();
        assert!(registry.is_empty());
        assert_eq!(registry.len(), 0);
    }

    #[test]
    fn test_registry_register_and_get() {
        let registry = UnitRegistry::new()
            .with(Arc::new(Noop("discover_symbols")))
            .unwrap()
            .with(Arc::new(Noop("place_order")))
            .unwrap();

        assert_eq!(registry.len(), 2);
        assert!(registry.contains("place_order"));
        assert_eq!(registry.get("discover_symbols").unwrap().unit_type(), "discover_symbols");
        assert_eq!(registry.list(), vec!["discover_symbols", "place_order"]);
    }

    #[test]
    fn test_registry_duplicate() {
        let mut registry = UnitRegistry::new();
        registry.register(Arc::new(Noop("place_order"))).unwrap();
        let result = registry.register(Arc::new(Noop("place_order")));
        assert!(matches!(result, Err(CoreError::AlreadyExists { .. })));
    }

    #[test]
    fn test_registry_missing() {
        let registry = UnitRegistry::new();
        assert!(matches!(registry.get("nope"), Err(CoreError::NotFound { .. })));
    }
}
