//! Service name to schema registry
//!
//! Only services registered here are counted; recorder calls for any other
//! service are silently ignored.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use super::StatSchema;

/// Registered schemas keyed by service (or package, for package-level stats)
#[derive(Debug, Default)]
pub struct StatRegistry {
    services: RwLock<HashMap<String, &'static StatSchema>>,
}

impl StatRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) the schema for a service
    pub fn register(&self, service: &str, schema: &'static StatSchema) {
        let mut services = self.services.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(previous) = services.insert(service.to_string(), schema) {
            if previous != schema {
                tracing::debug!(service, %previous, %schema, "replaced registered schema");
            }
        }
    }

    /// Remove a service; returns whether it was registered
    pub fn unregister(&self, service: &str) -> bool {
        self.services
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(service)
            .is_some()
    }

    pub fn is_registered(&self, service: &str) -> bool {
        self.services
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(service)
    }

    pub fn schema(&self, service: &str) -> Option<&'static StatSchema> {
        self.services
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(service)
            .copied()
    }

    /// Registered service names, sorted
    pub fn services(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .services
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stats::{FieldDef, FieldKind, METHOD_CALLS};

    static QUEUE: StatSchema = StatSchema {
        package: "pkg",
        service: Some("queue"),
        fields: &[FieldDef::new(METHOD_CALLS, FieldKind::Tally)],
    };

    #[test]
    fn test_register_and_lookup() {
        let registry = StatRegistry::new();
        assert!(!registry.is_registered("queue"));

        registry.register("queue", &QUEUE);
        assert!(registry.is_registered("queue"));
        assert_eq!(registry.schema("queue"), Some(&QUEUE));
        assert_eq!(registry.services(), vec!["queue".to_string()]);
    }

    #[test]
    fn test_unregister() {
        let registry = StatRegistry::new();
        registry.register("queue", &QUEUE);

        assert!(registry.unregister("queue"));
        assert!(!registry.unregister("queue"));
        assert!(registry.schema("queue").is_none());
    }

    #[test]
    fn test_register_twice_keeps_one_entry() {
        let registry = StatRegistry::new();
        registry.register("queue", &QUEUE);
        registry.register("queue", &QUEUE);
        assert_eq!(registry.services().len(), 1);
    }
}
