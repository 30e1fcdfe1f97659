//! Process-wide record of declared scopes.
//!
//! Two scopes declared under one name but with different field sets would
//! emit overlapping condition ids with different meanings. Registering every
//! scope catches that at startup.

use std::collections::BTreeMap;
use std::sync::{PoisonError, RwLock};

use depcache_core::{CacheConfig, CacheResult, ConfigError, ValidationMode};

use crate::scope::Scope;

/// Declared scope names and their field sets.
#[derive(Debug, Default)]
pub struct ScopeRegistry {
    mode: ValidationMode,
    declared: RwLock<BTreeMap<String, Vec<String>>>,
}

impl ScopeRegistry {
    pub fn new(mode: ValidationMode) -> Self {
        Self {
            mode,
            declared: RwLock::new(BTreeMap::new()),
        }
    }

    pub fn from_config(config: &CacheConfig) -> Self {
        Self::new(config.validation_mode)
    }

    /// Record `scope`.
    ///
    /// Registering the same name with the same fields again is accepted. A
    /// different field set under a known name is a
    /// [`ConfigError::ConflictingDeclaration`] in development mode and is
    /// logged and ignored in production mode.
    pub fn register<T: ?Sized>(&self, scope: &Scope<T>) -> CacheResult<()> {
        let mut requested = scope.fields().to_vec();
        requested.sort();

        let mut declared = self
            .declared
            .write()
            .unwrap_or_else(PoisonError::into_inner);

        match declared.get(scope.name()) {
            None => {
                tracing::debug!(scope = scope.name(), fields = ?requested, "Registered scope");
                declared.insert(scope.name().to_string(), requested);
                Ok(())
            }
            Some(existing) if *existing == requested => Ok(()),
            Some(existing) if self.mode.is_production() => {
                tracing::warn!(
                    scope = scope.name(),
                    declared = ?existing,
                    requested = ?requested,
                    "Ignoring conflicting scope registration"
                );
                Ok(())
            }
            Some(existing) => Err(ConfigError::ConflictingDeclaration {
                scope: scope.name().to_string(),
                declared: existing.clone(),
                requested,
            }
            .into()),
        }
    }

    /// Sorted field set registered under `name`.
    pub fn fields_of(&self, name: &str) -> Option<Vec<String>> {
        self.declared
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    /// Registered scope names, sorted.
    pub fn names(&self) -> Vec<String> {
        self.declared
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.declared
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use depcache_core::{CacheError, FieldMap};

    fn scope(name: &str, fields: &[&str]) -> Scope<()> {
        Scope::declare(name)
            .describes(fields.iter().copied())
            .expect("valid declaration")
            .extractor(|_: &()| FieldMap::new())
    }

    #[test]
    fn test_register_and_reregister() {
        let registry = ScopeRegistry::new(ValidationMode::Development);
        registry
            .register(&scope("posts", &["a", "b"]))
            .expect("first registration");
        registry
            .register(&scope("posts", &["b", "a"]))
            .expect("identical declaration is accepted");
        registry
            .register(&scope("users", &["id"]))
            .expect("other name");

        assert_eq!(registry.names(), vec!["posts".to_string(), "users".to_string()]);
        assert_eq!(
            registry.fields_of("posts"),
            Some(vec!["a".to_string(), "b".to_string()])
        );
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_conflict_in_development() {
        let registry = ScopeRegistry::new(ValidationMode::Development);
        registry
            .register(&scope("posts", &["a", "b"]))
            .expect("first registration");

        let err = registry
            .register(&scope("posts", &["a"]))
            .expect_err("conflict should be rejected");
        assert!(matches!(
            err,
            CacheError::Config(ConfigError::ConflictingDeclaration { ref requested, .. })
                if requested == &vec!["a".to_string()]
        ));
    }

    #[test]
    fn test_conflict_in_production_keeps_first() {
        let registry = ScopeRegistry::from_config(
            &CacheConfig::default().with_validation_mode(ValidationMode::Production),
        );
        registry
            .register(&scope("posts", &["a", "b"]))
            .expect("first registration");
        registry
            .register(&scope("posts", &["c"]))
            .expect("production mode tolerates conflicts");

        assert_eq!(
            registry.fields_of("posts"),
            Some(vec!["a".to_string(), "b".to_string()])
        );
    }
}
