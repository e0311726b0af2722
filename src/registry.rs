//! Lookup table from a capability name to the providers offering it
//!
//! The desktop host registers what it can offer (service descriptors,
//! menu actions, ...) under a capability name and collects them later in
//! registration order.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

pub struct CapabilityRegistry<T: ?Sized> {
    providers: RwLock<HashMap<String, Vec<Arc<T>>>>,
}

impl<T: ?Sized> Default for CapabilityRegistry<T> {
    fn default() -> Self {
        Self {
            providers: RwLock::new(HashMap::new()),
        }
    }
}

impl<T: ?Sized> CapabilityRegistry<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, capability: &str, provider: Arc<T>) {
        self.providers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(capability.to_string())
            .or_default()
            .push(provider);
    }

    pub fn lookup(&self, capability: &str) -> Vec<Arc<T>> {
        self.providers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(capability)
            .cloned()
            .unwrap_or_default()
    }

    pub fn capabilities(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .providers
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
    use crate::services::ServiceDescriptor;

    #[test]
    fn test_lookup_keeps_registration_order() {
        let registry: CapabilityRegistry<ServiceDescriptor> = CapabilityRegistry::new();
        for descriptor in ServiceDescriptor::defaults() {
            registry.register("interaction.service", Arc::new(descriptor));
        }

        let names: Vec<String> = registry
            .lookup("interaction.service")
            .iter()
            .map(|d| d.name().to_string())
            .collect();
        assert_eq!(
            names,
            vec!["web-content", "attendee-chat", "presenter-chat", "quiz"]
        );
    }

    #[test]
    fn test_unknown_capability_is_empty() {
        let registry: CapabilityRegistry<dyn Fn() -> u32 + Send + Sync> = CapabilityRegistry::new();
        registry.register("answer", Arc::new(|| 42u32));

        assert!(registry.lookup("question").is_empty());
        assert_eq!((registry.lookup("answer")[0])(), 42);
        assert_eq!(registry.capabilities(), vec!["answer"]);
    }
}
