//! Backend key layout.
//!
//! Every record the cache writes lives under one of three key families:
//!
//! - `<prefix>::data::<cache key>`: the serialized value
//! - `<prefix>::fdep::<cache key>`: forward set: canonical keys of the
//!   dependencies the entry was stored with
//! - `<prefix>::rdep::<canonical dependency key>`: reverse set: cache keys
//!   depending on that dependency
//!
//! The layout is persisted, so it must stay stable across releases.

use depcache_core::{validate_key_prefix, CacheResult, DependencyId};

/// Separator between key components.
const SEPARATOR: &str = "::";

/// Family of a backend key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KeyKind {
    /// Serialized cache value.
    Data,
    /// Forward dependency set of a cache key.
    Forward,
    /// Reverse dependency set of a dependency.
    Reverse,
}

impl KeyKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Data => "data",
            Self::Forward => "fdep",
            Self::Reverse => "rdep",
        }
    }

    fn parse(tag: &str) -> Option<Self> {
        match tag {
            "data" => Some(Self::Data),
            "fdep" => Some(Self::Forward),
            "rdep" => Some(Self::Reverse),
            _ => None,
        }
    }
}

/// A fully qualified backend key.
///
/// Only [`KeySpace`] constructs these, so a key always carries the prefix
/// of the cache that wrote it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StorageKey {
    prefix: String,
    kind: KeyKind,
    name: String,
}

impl StorageKey {
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn kind(&self) -> KeyKind {
        self.kind
    }

    /// Cache key (data/forward) or canonical dependency key (reverse).
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Encode to the backend string form.
    pub fn encode(&self) -> String {
        [self.prefix.as_str(), self.kind.as_str(), self.name.as_str()].join(SEPARATOR)
    }

    /// Decode a backend key.
    ///
    /// Returns `None` if the string lacks a prefix or kind, or the kind is
    /// unknown. The name may itself contain the separator.
    pub fn decode(encoded: &str) -> Option<Self> {
        let (prefix, rest) = encoded.split_once(SEPARATOR)?;
        let (tag, name) = rest.split_once(SEPARATOR)?;
        if prefix.is_empty() {
            return None;
        }
        Some(Self {
            prefix: prefix.to_string(),
            kind: KeyKind::parse(tag)?,
            name: name.to_string(),
        })
    }
}

/// Builds the backend keys of one cache instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeySpace {
    prefix: String,
}

impl KeySpace {
    /// Key space under `prefix`.
    ///
    /// # Errors
    ///
    /// An empty prefix or one containing `::` is a
    /// [`ConfigError::InvalidValue`](depcache_core::ConfigError::InvalidValue):
    /// it would make keys of different families ambiguous.
    pub fn new(prefix: impl Into<String>) -> CacheResult<Self> {
        let prefix = prefix.into();
        validate_key_prefix(&prefix)?;
        Ok(Self { prefix })
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    fn key(&self, kind: KeyKind, name: &str) -> StorageKey {
        StorageKey {
            prefix: self.prefix.clone(),
            kind,
            name: name.to_string(),
        }
    }

    pub fn data(&self, cache_key: &str) -> String {
        self.key(KeyKind::Data, cache_key).encode()
    }

    pub fn forward(&self, cache_key: &str) -> String {
        self.key(KeyKind::Forward, cache_key).encode()
    }

    pub fn reverse(&self, dependency: &DependencyId) -> String {
        self.reverse_encoded(&dependency.canonical_key())
    }

    /// Reverse set key for an already-encoded dependency.
    pub fn reverse_encoded(&self, canonical_key: &str) -> String {
        self.key(KeyKind::Reverse, canonical_key).encode()
    }
}
