//! depcache Test Utilities
//!
//! Shared test infrastructure for the depcache workspace:
//! - Proptest generators for dependency identifiers and configuration
//! - A small article/author domain implementing the entity-graph traits
//! - Custom assertions for depcache error variants
//! - Tracing setup for tests

// Re-export core types for convenience
pub use depcache_core::{
    BackendError, CacheConfig, CacheError, CacheResult, ChangeTracking, ConfigError, DependencyId,
    FieldMap, FieldValue, Identifiable, IncludeMap, ValidationMode,
};

use tracing_subscriber::EnvFilter;

/// Install a `fmt` subscriber filtered by `RUST_LOG` (default `warn`).
///
/// Safe to call from every test; only the first call installs anything.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_test_writer()
        .try_init();
}

// ============================================================================
// PROPTEST GENERATORS
// ============================================================================

pub mod generators {
    //! Proptest strategies for depcache types.

    use super::*;
    use proptest::prelude::*;

    /// Field or kind name: short lowercase identifiers.
    pub fn arb_field_name() -> impl Strategy<Value = String> {
        "[a-z][a-z_]{0,7}"
    }

    /// Any field value, including separators and the null marker as text.
    pub fn arb_field_value() -> impl Strategy<Value = FieldValue> {
        prop_oneof![
            1 => Just(FieldValue::Null),
            3 => ".{0,12}".prop_map(FieldValue::Text),
            2 => any::<i64>().prop_map(FieldValue::from),
            1 => any::<bool>().prop_map(FieldValue::from),
        ]
    }

    /// Field map with up to `max_fields` entries.
    pub fn arb_field_map(max_fields: usize) -> impl Strategy<Value = FieldMap> {
        proptest::collection::btree_map(arb_field_name(), arb_field_value(), 0..=max_fields)
            .prop_map(|fields| fields.into_iter().collect())
    }

    /// Entity, tag, scope or catch-all identifier.
    pub fn arb_dependency_id() -> impl Strategy<Value = DependencyId> {
        prop_oneof![
            (arb_field_name(), any::<u32>()).prop_map(|(kind, id)| DependencyId::entity(kind, id)),
            ".{0,16}".prop_map(DependencyId::tag),
            (arb_field_name(), arb_field_map(4))
                .prop_map(|(scope, fields)| DependencyId::scope(&scope, &fields)),
            arb_field_name().prop_map(|scope| DependencyId::scope_catch_all(&scope)),
        ]
    }

    /// Set of up to `max` distinct identifiers.
    pub fn arb_dependency_set(max: usize) -> impl Strategy<Value = Vec<DependencyId>> {
        proptest::collection::btree_set(arb_dependency_id(), 0..=max)
            .prop_map(|set| set.into_iter().collect())
    }

    /// Cache key; may contain the backend key separator.
    pub fn arb_cache_key() -> impl Strategy<Value = String> {
        prop_oneof![
            3 => "[a-z0-9:_-]{1,24}",
            1 => ".{1,24}",
        ]
    }

    pub fn arb_validation_mode() -> impl Strategy<Value = ValidationMode> {
        prop_oneof![
            Just(ValidationMode::Development),
            Just(ValidationMode::Production),
        ]
    }

    /// Configuration that passes `CacheConfig::validate`.
    pub fn arb_valid_config() -> impl Strategy<Value = CacheConfig> {
        (
            "[a-z][a-z0-9_]{0,11}",
            proptest::option::of(1u64..86_400),
            arb_validation_mode(),
            any::<bool>(),
        )
            .prop_map(
                |(key_prefix, default_ttl_secs, validation_mode, log_invalidations)| CacheConfig {
                    key_prefix,
                    default_ttl_secs,
                    validation_mode,
                    log_invalidations,
                },
            )
    }
}

// ============================================================================
// TEST FIXTURES
// ============================================================================

pub mod fixtures {
    //! Article/author domain used across the workspace tests.

    use std::collections::BTreeSet;

    use serde::{Deserialize, Serialize};
    use uuid::Uuid;

    use super::*;

    /// Fields of [`Article`] that article-list scopes describe.
    pub const ARTICLE_SCOPE_FIELDS: [&str; 3] = ["author_id", "category", "published"];

    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct Author {
        pub id: Uuid,
        pub name: String,
    }

    impl Identifiable for Author {
        fn kind(&self) -> &str {
            "author"
        }

        fn identity(&self) -> Vec<FieldValue> {
            vec![self.id.into()]
        }
    }

    /// Article with a loaded author and change tracking.
    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct Article {
        pub id: i64,
        pub title: String,
        pub category: String,
        pub published: bool,
        pub author: Author,
        #[serde(skip)]
        changed: BTreeSet<String>,
    }

    impl Article {
        pub fn author_id(&self) -> Uuid {
            self.author.id
        }

        pub fn set_title(&mut self, title: impl Into<String>) {
            self.title = title.into();
            self.changed.insert("title".to_string());
        }

        pub fn set_category(&mut self, category: impl Into<String>) {
            self.category = category.into();
            self.changed.insert("category".to_string());
        }

        pub fn set_published(&mut self, published: bool) {
            self.published = published;
            self.changed.insert("published".to_string());
        }

        /// Move the article to another author.
        pub fn set_author(&mut self, author: Author) {
            self.author = author;
            self.changed.insert("author_id".to_string());
        }

        /// Forget recorded changes, as after a save.
        pub fn mark_saved(&mut self) {
            self.changed.clear();
        }

        /// Values of [`ARTICLE_SCOPE_FIELDS`].
        pub fn scope_fields(&self) -> FieldMap {
            FieldMap::new()
                .with("author_id", self.author_id())
                .with("category", self.category.as_str())
                .with("published", self.published)
        }
    }

    impl Identifiable for Article {
        fn kind(&self) -> &str {
            "article"
        }

        fn identity(&self) -> Vec<FieldValue> {
            vec![self.id.into()]
        }

        fn related(&self, relationship: &str) -> Vec<&dyn Identifiable> {
            match relationship {
                "author" => vec![&self.author as &dyn Identifiable],
                _ => Vec::new(),
            }
        }
    }

    impl ChangeTracking for Article {
        fn changed_fields(&self) -> BTreeSet<String> {
            self.changed.clone()
        }
    }

    /// Author with a fixed id derived from `n`.
    pub fn author(n: u128, name: &str) -> Author {
        Author {
            id: Uuid::from_u128(n),
            name: name.to_string(),
        }
    }

    /// Author with a fresh UUIDv7.
    pub fn fresh_author(name: &str) -> Author {
        Author {
            id: Uuid::now_v7(),
            name: name.to_string(),
        }
    }

    /// Article with no recorded changes.
    pub fn article(id: i64, author: &Author, category: &str, published: bool) -> Article {
        Article {
            id,
            title: format!("Article {}", id),
            category: category.to_string(),
            published,
            author: author.clone(),
            changed: BTreeSet::new(),
        }
    }

    /// A published "rust" article by author 1.
    pub fn published_article() -> Article {
        article(1, &author(1, "Ferris"), "rust", true)
    }
}

// ============================================================================
// CUSTOM ASSERTIONS
// ============================================================================

pub mod assertions {
    //! Assertions on depcache error variants.

    use super::*;

    /// Assert that a CacheResult is a NotInCache miss.
    #[track_caller]
    pub fn assert_not_in_cache<T: std::fmt::Debug>(result: &CacheResult<T>) {
        match result {
            Err(CacheError::NotInCache { .. }) => {}
            other => panic!("Expected NotInCache, got: {:?}", other),
        }
    }

    /// Assert that a CacheResult is a Config error.
    #[track_caller]
    pub fn assert_config_error<T: std::fmt::Debug>(result: &CacheResult<T>) {
        match result {
            Err(CacheError::Config(_)) => {}
            other => panic!("Expected Config error, got: {:?}", other),
        }
    }

    /// Assert that a CacheResult is a Backend error.
    #[track_caller]
    pub fn assert_backend_error<T: std::fmt::Debug>(result: &CacheResult<T>) {
        match result {
            Err(CacheError::Backend(_)) => {}
            other => panic!("Expected Backend error, got: {:?}", other),
        }
    }
}
