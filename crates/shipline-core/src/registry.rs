//! Process-wide registry of deployment environments.
//!
//! Built once at startup and then shared immutably (behind `Arc`) by the
//! pipeline engine and rollback coordinator, so nothing can change it while
//! a run is in flight.

use std::collections::HashMap;

use crate::domain::{Environment, Result, ShiplineError};

#[derive(Debug, Clone, Default)]
pub struct EnvironmentRegistry {
    environments: HashMap<String, Environment>,
    /// Registration order, for stable listings.
    order: Vec<String>,
}

impl EnvironmentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an environment. Fails with `DuplicateEnvironment` if the id
    /// is already taken, and with `Configuration` for an empty id.
    pub fn register(&mut self, env: Environment) -> Result<()> {
        if env.id.trim().is_empty() {
            return Err(ShiplineError::Configuration(
                "environment id must not be empty".to_string(),
            ));
        }
        if self.environments.contains_key(&env.id) {
            return Err(ShiplineError::DuplicateEnvironment { id: env.id });
        }
        self.order.push(env.id.clone());
        self.environments.insert(env.id.clone(), env);
        Ok(())
    }

    /// Look up an environment. Fails with `UnknownEnvironment` if absent.
    pub fn resolve(&self, id: &str) -> Result<&Environment> {
        self.environments
            .get(id)
            .ok_or_else(|| ShiplineError::UnknownEnvironment { id: id.to_string() })
    }

    pub fn contains(&self, id: &str) -> bool {
        self.environments.contains_key(id)
    }

    /// Environments in registration order.
    pub fn iter(&self) -> impl Iterator<Item = &Environment> {
        self.order.iter().filter_map(|id| self.environments.get(id))
    }

    pub fn ids(&self) -> Vec<&str> {
        self.order.iter().map(String::as_str).collect()
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{CredentialRef, Tier};

    fn env(id: &str, tier: Tier) -> Environment {
        Environment::new(id, tier, CredentialRef::new(format!("{id}-alias")))
    }

    #[test]
    fn test_register_and_resolve() {
        let mut registry = EnvironmentRegistry::new();
        registry.register(env("qa", Tier::Qa)).unwrap();
        registry.register(env("prod", Tier::Prod)).unwrap();

        let qa = registry.resolve("qa").unwrap();
        assert_eq!(qa.tier, Tier::Qa);
        assert_eq!(qa.credential.as_str(), "qa-alias");
        assert_eq!(registry.ids(), vec!["qa", "prod"]);
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_duplicate_is_rejected() {
        let mut registry = EnvironmentRegistry::new();
        registry.register(env("qa", Tier::Qa)).unwrap();
        let err = registry.register(env("qa", Tier::Uat)).unwrap_err();
        assert!(matches!(err, ShiplineError::DuplicateEnvironment { ref id } if id == "qa"));
        // The original registration is untouched.
        assert_eq!(registry.resolve("qa").unwrap().tier, Tier::Qa);
    }

    #[test]
    fn test_unknown_is_rejected() {
        let registry = EnvironmentRegistry::new();
        let err = registry.resolve("uat").unwrap_err();
        assert!(matches!(err, ShiplineError::UnknownEnvironment { ref id } if id == "uat"));
    }

    #[test]
    fn test_empty_id_is_configuration_error() {
        let mut registry = EnvironmentRegistry::new();
        let err = registry.register(env("  ", Tier::Dev)).unwrap_err();
        assert!(matches!(err, ShiplineError::Configuration(_)));
        assert!(registry.is_empty());
    }
}
