//! depcache Core - Dependency Identifiers
//!
//! Pure data types shared by every depcache crate: dependency identifiers
//! and their canonical encoding, the error taxonomy, configuration, and the
//! entity-graph adapter contract. No storage access happens here.

pub mod config;
pub mod dependency;
pub mod error;
pub mod graph;

pub use config::{validate_key_prefix, CacheConfig, ValidationMode};
pub use dependency::{
    DependencyId, FieldMap, FieldValue, ENTITY_NAMESPACE, SCOPE_NAMESPACE_PREFIX, TAG_NAMESPACE,
};
pub use error::{BackendError, BackendResult, CacheError, CacheResult, ConfigError};
pub use graph::{collect_dependencies, ChangeTracking, Identifiable, IncludeMap};
