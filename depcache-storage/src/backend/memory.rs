//! In-process backend.
//!
//! Keeps values and sets in hash maps behind one `RwLock`. Expiry is
//! checked on access against a [`Clock`]; expired records are dropped the
//! next time they are written or by [`InMemoryBackend::purge_expired`].
//! A whole [`Batch`] is applied under a single write lock, so it is atomic
//! with respect to every other call on the same instance.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use depcache_core::{BackendError, BackendResult};

use super::{Backend, BackendOp, Batch};
use crate::clock::{expiry_after, Clock, SystemClock};

#[derive(Debug, Clone)]
struct StoredValue {
    bytes: Vec<u8>,
    expires_at: Option<DateTime<Utc>>,
}

impl StoredValue {
    fn is_live(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map_or(true, |at| at > now)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SetExpiry {
    /// Created by `add_member`, no TTL requested yet.
    Unset,
    /// Explicitly persistent.
    Never,
    At(DateTime<Utc>),
}

#[derive(Debug, Clone)]
struct StoredSet {
    members: BTreeSet<String>,
    expiry: SetExpiry,
}

impl StoredSet {
    fn is_live(&self, now: DateTime<Utc>) -> bool {
        match self.expiry {
            SetExpiry::At(at) => at > now,
            SetExpiry::Unset | SetExpiry::Never => true,
        }
    }
}

#[derive(Debug, Default)]
struct State {
    values: HashMap<String, StoredValue>,
    sets: HashMap<String, StoredSet>,
}

impl State {
    fn live_value(&self, key: &str, now: DateTime<Utc>) -> Option<&StoredValue> {
        self.values.get(key).filter(|value| value.is_live(now))
    }

    fn live_set(&self, set_key: &str, now: DateTime<Utc>) -> Option<&StoredSet> {
        self.sets.get(set_key).filter(|set| set.is_live(now))
    }

    /// Forget `set_key` if it has expired, so writes start from empty.
    fn drop_expired_set(&mut self, set_key: &str, now: DateTime<Utc>) {
        if self.sets.get(set_key).is_some_and(|set| !set.is_live(now)) {
            self.sets.remove(set_key);
        }
    }

    /// Apply one operation. Returns whether a live record was removed.
    fn apply(&mut self, op: BackendOp, now: DateTime<Utc>) -> bool {
        match op {
            BackendOp::StoreValue { key, value, ttl } => {
                let expires_at = ttl.map(|ttl| expiry_after(now, ttl));
                self.values.insert(
                    key,
                    StoredValue {
                        bytes: value,
                        expires_at,
                    },
                );
                false
            }
            BackendOp::DeleteValue { key } => self
                .values
                .remove(&key)
                .is_some_and(|value| value.is_live(now)),
            BackendOp::AddMember { set_key, member } => {
                self.drop_expired_set(&set_key, now);
                self.sets
                    .entry(set_key)
                    .or_insert_with(|| StoredSet {
                        members: BTreeSet::new(),
                        expiry: SetExpiry::Unset,
                    })
                    .members
                    .insert(member);
                false
            }
            BackendOp::RemoveMember { set_key, member } => {
                self.drop_expired_set(&set_key, now);
                let Some(set) = self.sets.get_mut(&set_key) else {
                    return false;
                };
                let removed = set.members.remove(&member);
                if set.members.is_empty() {
                    self.sets.remove(&set_key);
                }
                removed
            }
            BackendOp::DeleteSet { set_key } => self
                .sets
                .remove(&set_key)
                .is_some_and(|set| set.is_live(now)),
            BackendOp::ExtendSetTtl { set_key, ttl } => {
                self.drop_expired_set(&set_key, now);
                if let Some(set) = self.sets.get_mut(&set_key) {
                    set.expiry = match (set.expiry, ttl) {
                        (_, None) | (SetExpiry::Never, _) => SetExpiry::Never,
                        (SetExpiry::Unset, Some(ttl)) => SetExpiry::At(expiry_after(now, ttl)),
                        (SetExpiry::At(current), Some(ttl)) => {
                            SetExpiry::At(current.max(expiry_after(now, ttl)))
                        }
                    };
                }
                false
            }
        }
    }
}

/// In-memory [`Backend`] for tests, single-process deployments, and as a
/// reference for the backend contract.
pub struct InMemoryBackend {
    state: RwLock<State>,
    clock: Arc<dyn Clock>,
}

impl InMemoryBackend {
    /// Create an empty backend driven by the wall clock.
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Create an empty backend driven by `clock`.
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            state: RwLock::new(State::default()),
            clock,
        }
    }

    fn read(&self) -> BackendResult<RwLockReadGuard<'_, State>> {
        self.state.read().map_err(|_| BackendError::LockPoisoned)
    }

    fn write(&self) -> BackendResult<RwLockWriteGuard<'_, State>> {
        self.state.write().map_err(|_| BackendError::LockPoisoned)
    }

    fn apply(&self, op: BackendOp) -> BackendResult<bool> {
        let now = self.clock.now();
        Ok(self.write()?.apply(op, now))
    }

    /// Drop every expired value and set. Returns the number of records
    /// removed.
    pub fn purge_expired(&self) -> BackendResult<usize> {
        let now = self.clock.now();
        let mut state = self.write()?;
        let before = state.values.len() + state.sets.len();
        state.values.retain(|_, value| value.is_live(now));
        state.sets.retain(|_, set| set.is_live(now));
        Ok(before - state.values.len() - state.sets.len())
    }

    /// Keys of every live set, sorted.
    pub fn set_keys(&self) -> BackendResult<Vec<String>> {
        let now = self.clock.now();
        let state = self.read()?;
        let mut keys: Vec<String> = state
            .sets
            .iter()
            .filter(|(_, set)| set.is_live(now))
            .map(|(key, _)| key.clone())
            .collect();
        keys.sort();
        Ok(keys)
    }

    /// Number of live values.
    pub fn value_count(&self) -> BackendResult<usize> {
        let now = self.clock.now();
        Ok(self
            .read()?
            .values
            .values()
            .filter(|value| value.is_live(now))
            .count())
    }
}

impl Default for InMemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Backend for InMemoryBackend {
    async fn store_value(
        &self,
        key: &str,
        value: &[u8],
        ttl: Option<Duration>,
    ) -> BackendResult<()> {
        self.apply(BackendOp::StoreValue {
            key: key.to_string(),
            value: value.to_vec(),
            ttl,
        })?;
        Ok(())
    }

    async fn load_value(&self, key: &str) -> BackendResult<Option<Vec<u8>>> {
        let now = self.clock.now();
        Ok(self
            .read()?
            .live_value(key, now)
            .map(|value| value.bytes.clone()))
    }

    async fn has_value(&self, key: &str) -> BackendResult<bool> {
        let now = self.clock.now();
        Ok(self.read()?.live_value(key, now).is_some())
    }

    async fn delete_value(&self, key: &str) -> BackendResult<bool> {
        self.apply(BackendOp::DeleteValue {
            key: key.to_string(),
        })
    }

    async fn add_member(&self, set_key: &str, member: &str) -> BackendResult<()> {
        self.apply(BackendOp::AddMember {
            set_key: set_key.to_string(),
            member: member.to_string(),
        })?;
        Ok(())
    }

    async fn remove_member(&self, set_key: &str, member: &str) -> BackendResult<()> {
        self.apply(BackendOp::RemoveMember {
            set_key: set_key.to_string(),
            member: member.to_string(),
        })?;
        Ok(())
    }

    async fn members_of(&self, set_key: &str) -> BackendResult<BTreeSet<String>> {
        let now = self.clock.now();
        Ok(self
            .read()?
            .live_set(set_key, now)
            .map(|set| set.members.clone())
            .unwrap_or_default())
    }

    async fn delete_set(&self, set_key: &str) -> BackendResult<()> {
        self.apply(BackendOp::DeleteSet {
            set_key: set_key.to_string(),
        })?;
        Ok(())
    }

    async fn extend_set_ttl(&self, set_key: &str, ttl: Option<Duration>) -> BackendResult<()> {
        self.apply(BackendOp::ExtendSetTtl {
            set_key: set_key.to_string(),
            ttl,
        })?;
        Ok(())
    }

    async fn execute(&self, batch: Batch) -> BackendResult<()> {
        let now = self.clock.now();
        let mut state = self.write()?;
        for op in batch.into_ops() {
            state.apply(op, now);
        }
        Ok(())
    }
}
