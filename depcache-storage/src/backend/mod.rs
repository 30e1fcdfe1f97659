//! Backend capability consumed by the dependency index.
//!
//! A backend offers two kinds of records: opaque values with an optional TTL,
//! and string sets. The index keeps its forward and reverse maps entirely in
//! backend sets, so several processes can share one index through a shared
//! backend.
//!
//! # Set Semantics
//!
//! - A set with no members does not exist; removing the last member deletes
//!   it together with its expiry.
//! - A set created by `add_member` never expires until `extend_set_ttl`
//!   gives it an expiry.
//! - `extend_set_ttl` only ever lengthens the remaining lifetime; `None`
//!   makes the set persistent.
//!
//! # Batches
//!
//! [`Backend::execute`] submits several operations together. The default
//! implementation applies them one by one; the bundled backends apply a
//! batch atomically.

pub mod lmdb;
pub mod memory;

use std::collections::BTreeSet;
use std::time::Duration;

use async_trait::async_trait;
use depcache_core::BackendResult;

pub use lmdb::{LmdbBackend, LmdbBackendError};
pub use memory::InMemoryBackend;

/// One primitive operation inside a [`Batch`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendOp {
    StoreValue {
        key: String,
        value: Vec<u8>,
        ttl: Option<Duration>,
    },
    DeleteValue {
        key: String,
    },
    AddMember {
        set_key: String,
        member: String,
    },
    RemoveMember {
        set_key: String,
        member: String,
    },
    DeleteSet {
        set_key: String,
    },
    ExtendSetTtl {
        set_key: String,
        ttl: Option<Duration>,
    },
}

/// Ordered list of operations submitted together.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Batch {
    ops: Vec<BackendOp>,
}

impl Batch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, op: BackendOp) -> &mut Self {
        self.ops.push(op);
        self
    }

    pub fn store_value(&mut self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> &mut Self {
        self.push(BackendOp::StoreValue {
            key: key.to_string(),
            value,
            ttl,
        })
    }

    pub fn delete_value(&mut self, key: &str) -> &mut Self {
        self.push(BackendOp::DeleteValue {
            key: key.to_string(),
        })
    }

    pub fn add_member(&mut self, set_key: &str, member: &str) -> &mut Self {
        self.push(BackendOp::AddMember {
            set_key: set_key.to_string(),
            member: member.to_string(),
        })
    }

    pub fn remove_member(&mut self, set_key: &str, member: &str) -> &mut Self {
        self.push(BackendOp::RemoveMember {
            set_key: set_key.to_string(),
            member: member.to_string(),
        })
    }

    pub fn delete_set(&mut self, set_key: &str) -> &mut Self {
        self.push(BackendOp::DeleteSet {
            set_key: set_key.to_string(),
        })
    }

    pub fn extend_set_ttl(&mut self, set_key: &str, ttl: Option<Duration>) -> &mut Self {
        self.push(BackendOp::ExtendSetTtl {
            set_key: set_key.to_string(),
            ttl,
        })
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn ops(&self) -> &[BackendOp] {
        &self.ops
    }

    pub fn into_ops(self) -> Vec<BackendOp> {
        self.ops
    }
}

/// Storage primitives required by the cache.
///
/// Implementations must be safe to share between tasks and processes; the
/// cache performs no locking of its own.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Store `value` under `key`, replacing any previous value and its TTL.
    async fn store_value(&self, key: &str, value: &[u8], ttl: Option<Duration>)
        -> BackendResult<()>;

    /// Load the value under `key`, or `None` if absent or expired.
    async fn load_value(&self, key: &str) -> BackendResult<Option<Vec<u8>>>;

    /// True if a non-expired value exists under `key`.
    async fn has_value(&self, key: &str) -> BackendResult<bool> {
        Ok(self.load_value(key).await?.is_some())
    }

    /// Delete the value under `key`. Returns whether a live value existed.
    async fn delete_value(&self, key: &str) -> BackendResult<bool>;

    async fn add_member(&self, set_key: &str, member: &str) -> BackendResult<()>;

    async fn remove_member(&self, set_key: &str, member: &str) -> BackendResult<()>;

    /// Members of the set, empty if it does not exist or expired.
    async fn members_of(&self, set_key: &str) -> BackendResult<BTreeSet<String>>;

    async fn delete_set(&self, set_key: &str) -> BackendResult<()>;

    /// Make the set live for at least `ttl` from now (`None`: forever).
    async fn extend_set_ttl(&self, set_key: &str, ttl: Option<Duration>) -> BackendResult<()>;

    /// Apply every operation of `batch` in order.
    ///
    /// Stops at the first failure; operations already applied stay applied.
    async fn execute(&self, batch: Batch) -> BackendResult<()> {
        for op in batch.into_ops() {
            match op {
                BackendOp::StoreValue { key, value, ttl } => {
                    self.store_value(&key, &value, ttl).await?
                }
                BackendOp::DeleteValue { key } => {
                    self.delete_value(&key).await?;
                }
                BackendOp::AddMember { set_key, member } => {
                    self.add_member(&set_key, &member).await?
                }
                BackendOp::RemoveMember { set_key, member } => {
                    self.remove_member(&set_key, &member).await?
                }
                BackendOp::DeleteSet { set_key } => self.delete_set(&set_key).await?,
                BackendOp::ExtendSetTtl { set_key, ttl } => {
                    self.extend_set_ttl(&set_key, ttl).await?
                }
            }
        }
        Ok(())
    }
}
