//! LMDB-backed [`Backend`].
//!
//! Uses the heed crate (Rust bindings for LMDB) so several processes on one
//! host can share a single cache and dependency index through a
//! memory-mapped file.
//!
//! # Record Layout
//!
//! Everything lives in one unnamed database. Keys start with a tag byte:
//!
//! - `v` + key: `[expires_at millis: 8 bytes LE][value bytes]`, 0 = never
//! - `s` + set key: set expiry as 8 bytes LE (0 unset, -1 persistent,
//!   otherwise expiry millis); present iff the set has members
//! - `m` + `[len: 4 bytes BE]` + set key + member: the member string
//!
//! Key components longer than LMDB comfortably allows are replaced by
//! their SHA-256 digest. Member records keep the full member string as
//! their value, so hashed members are still listed verbatim.
//!
//! # Atomicity
//!
//! Every call runs in its own write transaction; [`Backend::execute`]
//! applies a whole batch in one transaction.

use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use depcache_core::{BackendError, BackendResult};
use heed::types::Bytes;
use heed::{Database, Env, EnvOpenOptions, RoTxn, RwTxn};
use sha2::{Digest, Sha256};

use super::{Backend, BackendOp, Batch};
use crate::clock::{expiry_after, Clock, SystemClock};

const VALUE_TAG: u8 = b'v';
const SET_TAG: u8 = b's';
const MEMBER_TAG: u8 = b'm';

const INLINE_MARKER: u8 = b'=';
const HASHED_MARKER: u8 = b'#';

/// Components above this length are stored by digest (LMDB keys max out at
/// 511 bytes and a member key holds two components).
const MAX_INLINE_COMPONENT: usize = 200;

const EXPIRY_UNSET: i64 = 0;
const EXPIRY_NEVER: i64 = -1;

/// Error type for LMDB backend operations.
#[derive(Debug, thiserror::Error)]
pub enum LmdbBackendError {
    /// Failed to open or create the LMDB environment.
    #[error("Failed to open LMDB environment: {0}")]
    EnvOpen(String),

    /// Failed to open the database within the environment.
    #[error("Failed to open database: {0}")]
    DbOpen(String),

    /// Transaction error.
    #[error("Transaction error: {0}")]
    Transaction(String),

    /// A stored record could not be decoded.
    #[error("Corrupt record {record}: {reason}")]
    Corrupt { record: String, reason: String },

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<heed::Error> for LmdbBackendError {
    fn from(e: heed::Error) -> Self {
        LmdbBackendError::Transaction(e.to_string())
    }
}

impl From<LmdbBackendError> for BackendError {
    fn from(e: LmdbBackendError) -> Self {
        match e {
            LmdbBackendError::Transaction(reason) => BackendError::Transaction { reason },
            LmdbBackendError::Corrupt { record, reason } => BackendError::Corrupt { record, reason },
            other => BackendError::Unavailable {
                reason: other.to_string(),
            },
        }
    }
}

/// Encode one key component, hashing it when too long.
fn component(raw: &str) -> Vec<u8> {
    if raw.len() <= MAX_INLINE_COMPONENT {
        let mut out = Vec::with_capacity(raw.len() + 1);
        out.push(INLINE_MARKER);
        out.extend_from_slice(raw.as_bytes());
        out
    } else {
        let digest = hex::encode(Sha256::digest(raw.as_bytes()));
        let mut out = Vec::with_capacity(digest.len() + 1);
        out.push(HASHED_MARKER);
        out.extend_from_slice(digest.as_bytes());
        out
    }
}

fn tagged(tag: u8, component: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(component.len() + 1);
    out.push(tag);
    out.extend_from_slice(component);
    out
}

fn member_prefix(set_component: &[u8]) -> Vec<u8> {
    // Components are bounded by MAX_INLINE_COMPONENT, so the length fits.
    let len = set_component.len() as u32;
    let mut out = Vec::with_capacity(set_component.len() + 5);
    out.push(MEMBER_TAG);
    out.extend_from_slice(&len.to_be_bytes());
    out.extend_from_slice(set_component);
    out
}

fn read_i64(bytes: &[u8], record: &[u8]) -> Result<i64, LmdbBackendError> {
    let head: [u8; 8] = bytes
        .get(0..8)
        .and_then(|head| head.try_into().ok())
        .ok_or_else(|| LmdbBackendError::Corrupt {
            record: String::from_utf8_lossy(record).into_owned(),
            reason: "record shorter than its 8-byte header".to_string(),
        })?;
    Ok(i64::from_le_bytes(head))
}

fn millis_after(now_ms: i64, ttl: Duration) -> i64 {
    let now = chrono::DateTime::from_timestamp_millis(now_ms).unwrap_or_default();
    expiry_after(now, ttl).timestamp_millis().max(1)
}

fn value_is_live(expires_ms: i64, now_ms: i64) -> bool {
    expires_ms == 0 || expires_ms > now_ms
}

fn set_is_live(expiry: i64, now_ms: i64) -> bool {
    expiry == EXPIRY_UNSET || expiry == EXPIRY_NEVER || expiry > now_ms
}

/// LMDB-backed storage for values and sets.
///
/// # Example
///
/// ```ignore
/// use depcache_storage::{CacheStore, LmdbBackend};
///
/// let backend = Arc::new(LmdbBackend::new("/var/cache/app", 256)?);
/// let cache = CacheStore::new(backend, CacheConfig::default())?;
/// ```
pub struct LmdbBackend {
    env: Env,
    db: Database<Bytes, Bytes>,
    clock: Arc<dyn Clock>,
}

impl LmdbBackend {
    /// Open (or create) an LMDB environment under `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created or the
    /// environment or database cannot be opened.
    pub fn new<P: AsRef<Path>>(path: P, max_size_mb: usize) -> Result<Self, LmdbBackendError> {
        std::fs::create_dir_all(&path)?;

        let env = unsafe {
            EnvOpenOptions::new()
                .map_size(max_size_mb * 1024 * 1024)
                .max_dbs(1)
                .open(path.as_ref())
        }
        .map_err(|e| LmdbBackendError::EnvOpen(e.to_string()))?;

        let mut wtxn = env.write_txn()?;
        let db: Database<Bytes, Bytes> = env
            .create_database(&mut wtxn, None)
            .map_err(|e| LmdbBackendError::DbOpen(e.to_string()))?;
        wtxn.commit()?;

        Ok(Self {
            env,
            db,
            clock: Arc::new(SystemClock),
        })
    }

    /// Replace the time source used for expiry.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    fn now_ms(&self) -> i64 {
        self.clock.now().timestamp_millis()
    }

    fn write<T>(
        &self,
        f: impl FnOnce(&mut RwTxn<'_>) -> Result<T, LmdbBackendError>,
    ) -> Result<T, LmdbBackendError> {
        let mut wtxn = self.env.write_txn()?;
        let out = f(&mut wtxn)?;
        wtxn.commit()?;
        Ok(out)
    }

    fn set_expiry(&self, txn: &RoTxn<'_>, set_component: &[u8]) -> Result<Option<i64>, LmdbBackendError> {
        let meta_key = tagged(SET_TAG, set_component);
        match self.db.get(txn, &meta_key)? {
            Some(bytes) => Ok(Some(read_i64(bytes, &meta_key)?)),
            None => Ok(None),
        }
    }

    fn prefixed_keys(&self, txn: &RoTxn<'_>, prefix: &[u8]) -> Result<Vec<Vec<u8>>, LmdbBackendError> {
        let mut keys = Vec::new();
        for entry in self.db.prefix_iter(txn, prefix)? {
            let (key, _) = entry?;
            keys.push(key.to_vec());
        }
        Ok(keys)
    }

    fn clear_set(&self, wtxn: &mut RwTxn<'_>, set_component: &[u8]) -> Result<(), LmdbBackendError> {
        let members = self.prefixed_keys(wtxn, &member_prefix(set_component))?;
        for key in members {
            self.db.delete(wtxn, &key)?;
        }
        self.db.delete(wtxn, &tagged(SET_TAG, set_component))?;
        Ok(())
    }

    /// Forget an expired set so writes start from empty.
    fn drop_expired_set(
        &self,
        wtxn: &mut RwTxn<'_>,
        set_component: &[u8],
        now_ms: i64,
    ) -> Result<(), LmdbBackendError> {
        if let Some(expiry) = self.set_expiry(wtxn, set_component)? {
            if !set_is_live(expiry, now_ms) {
                self.clear_set(wtxn, set_component)?;
            }
        }
        Ok(())
    }

    /// Apply one operation. Returns whether a live record was removed.
    fn apply(&self, wtxn: &mut RwTxn<'_>, op: BackendOp, now_ms: i64) -> Result<bool, LmdbBackendError> {
        match op {
            BackendOp::StoreValue { key, value, ttl } => {
                let expires_ms = ttl.map_or(0, |ttl| millis_after(now_ms, ttl));
                let mut record = Vec::with_capacity(8 + value.len());
                record.extend_from_slice(&expires_ms.to_le_bytes());
                record.extend_from_slice(&value);
                self.db
                    .put(wtxn, &tagged(VALUE_TAG, &component(&key)), &record)?;
                Ok(false)
            }
            BackendOp::DeleteValue { key } => {
                let record_key = tagged(VALUE_TAG, &component(&key));
                let live = match self.db.get(wtxn, &record_key)? {
                    Some(bytes) => value_is_live(read_i64(bytes, &record_key)?, now_ms),
                    None => false,
                };
                self.db.delete(wtxn, &record_key)?;
                Ok(live)
            }
            BackendOp::AddMember { set_key, member } => {
                let set_component = component(&set_key);
                self.drop_expired_set(wtxn, &set_component, now_ms)?;
                let meta_key = tagged(SET_TAG, &set_component);
                if self.db.get(wtxn, &meta_key)?.is_none() {
                    self.db.put(wtxn, &meta_key, &EXPIRY_UNSET.to_le_bytes())?;
                }
                let mut member_key = member_prefix(&set_component);
                member_key.extend_from_slice(&component(&member));
                self.db.put(wtxn, &member_key, member.as_bytes())?;
                Ok(false)
            }
            BackendOp::RemoveMember { set_key, member } => {
                let set_component = component(&set_key);
                self.drop_expired_set(wtxn, &set_component, now_ms)?;
                let prefix = member_prefix(&set_component);
                let mut member_key = prefix.clone();
                member_key.extend_from_slice(&component(&member));
                let removed = self.db.delete(wtxn, &member_key)?;
                if removed && self.db.prefix_iter(wtxn, &prefix)?.next().is_none() {
                    self.db.delete(wtxn, &tagged(SET_TAG, &set_component))?;
                }
                Ok(removed)
            }
            BackendOp::DeleteSet { set_key } => {
                let set_component = component(&set_key);
                let live = self
                    .set_expiry(wtxn, &set_component)?
                    .is_some_and(|expiry| set_is_live(expiry, now_ms));
                self.clear_set(wtxn, &set_component)?;
                Ok(live)
            }
            BackendOp::ExtendSetTtl { set_key, ttl } => {
                let set_component = component(&set_key);
                self.drop_expired_set(wtxn, &set_component, now_ms)?;
                let Some(current) = self.set_expiry(wtxn, &set_component)? else {
                    return Ok(false);
                };
                let extended = match ttl {
                    None => EXPIRY_NEVER,
                    Some(_) if current == EXPIRY_NEVER => EXPIRY_NEVER,
                    Some(ttl) => current.max(millis_after(now_ms, ttl)),
                };
                self.db
                    .put(wtxn, &tagged(SET_TAG, &set_component), &extended.to_le_bytes())?;
                Ok(false)
            }
        }
    }

    fn run(&self, op: BackendOp) -> Result<bool, LmdbBackendError> {
        let now_ms = self.now_ms();
        self.write(|wtxn| self.apply(wtxn, op, now_ms))
    }

    /// Drop every expired value and set. Returns the number of records
    /// (values plus sets) removed.
    pub fn purge_expired(&self) -> Result<usize, LmdbBackendError> {
        let now_ms = self.now_ms();
        self.write(|wtxn| {
            let mut expired_values = Vec::new();
            for entry in self.db.prefix_iter(wtxn, &[VALUE_TAG])? {
                let (key, bytes) = entry?;
                if !value_is_live(read_i64(bytes, key)?, now_ms) {
                    expired_values.push(key.to_vec());
                }
            }

            let mut expired_sets = Vec::new();
            for entry in self.db.prefix_iter(wtxn, &[SET_TAG])? {
                let (key, bytes) = entry?;
                if !set_is_live(read_i64(bytes, key)?, now_ms) {
                    expired_sets.push(key[1..].to_vec());
                }
            }

            for key in &expired_values {
                self.db.delete(wtxn, key)?;
            }
            for set_component in &expired_sets {
                self.clear_set(wtxn, set_component)?;
            }
            Ok(expired_values.len() + expired_sets.len())
        })
    }
}

#[async_trait]
impl Backend for LmdbBackend {
    async fn store_value(
        &self,
        key: &str,
        value: &[u8],
        ttl: Option<Duration>,
    ) -> BackendResult<()> {
        self.run(BackendOp::StoreValue {
            key: key.to_string(),
            value: value.to_vec(),
            ttl,
        })?;
        Ok(())
    }

    async fn load_value(&self, key: &str) -> BackendResult<Option<Vec<u8>>> {
        let now_ms = self.now_ms();
        let rtxn = self.env.read_txn().map_err(LmdbBackendError::from)?;
        let record_key = tagged(VALUE_TAG, &component(key));

        match self.db.get(&rtxn, &record_key).map_err(LmdbBackendError::from)? {
            Some(bytes) => {
                let expires_ms = read_i64(bytes, &record_key)?;
                if value_is_live(expires_ms, now_ms) {
                    Ok(Some(bytes[8..].to_vec()))
                } else {
                    Ok(None)
                }
            }
            None => Ok(None),
        }
    }

    async fn delete_value(&self, key: &str) -> BackendResult<bool> {
        Ok(self.run(BackendOp::DeleteValue {
            key: key.to_string(),
        })?)
    }

    async fn add_member(&self, set_key: &str, member: &str) -> BackendResult<()> {
        self.run(BackendOp::AddMember {
            set_key: set_key.to_string(),
            member: member.to_string(),
        })?;
        Ok(())
    }

    async fn remove_member(&self, set_key: &str, member: &str) -> BackendResult<()> {
        self.run(BackendOp::RemoveMember {
            set_key: set_key.to_string(),
            member: member.to_string(),
        })?;
        Ok(())
    }

    async fn members_of(&self, set_key: &str) -> BackendResult<BTreeSet<String>> {
        let now_ms = self.now_ms();
        let rtxn = self.env.read_txn().map_err(LmdbBackendError::from)?;
        let set_component = component(set_key);

        match self.set_expiry(&rtxn, &set_component)? {
            Some(expiry) if set_is_live(expiry, now_ms) => {}
            _ => return Ok(BTreeSet::new()),
        }

        let mut members = BTreeSet::new();
        let iter = self
            .db
            .prefix_iter(&rtxn, &member_prefix(&set_component))
            .map_err(LmdbBackendError::from)?;
        for entry in iter {
            let (key, value) = entry.map_err(LmdbBackendError::from)?;
            let member = String::from_utf8(value.to_vec()).map_err(|e| BackendError::Corrupt {
                record: String::from_utf8_lossy(key).into_owned(),
                reason: e.to_string(),
            })?;
            members.insert(member);
        }
        Ok(members)
    }

    async fn delete_set(&self, set_key: &str) -> BackendResult<()> {
        self.run(BackendOp::DeleteSet {
            set_key: set_key.to_string(),
        })?;
        Ok(())
    }

    async fn extend_set_ttl(&self, set_key: &str, ttl: Option<Duration>) -> BackendResult<()> {
        self.run(BackendOp::ExtendSetTtl {
            set_key: set_key.to_string(),
            ttl,
        })?;
        Ok(())
    }

    async fn execute(&self, batch: Batch) -> BackendResult<()> {
        let now_ms = self.now_ms();
        self.write(|wtxn| {
            for op in batch.into_ops() {
                self.apply(wtxn, op, now_ms)?;
            }
            Ok(())
        })?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use tempfile::TempDir;

    fn create_test_backend() -> (LmdbBackend, Arc<ManualClock>, TempDir) {
        let temp_dir = TempDir::new().expect("TempDir creation should succeed");
        let clock = Arc::new(ManualClock::default());
        let backend = LmdbBackend::new(temp_dir.path(), 10)
            .expect("backend creation should succeed")
            .with_clock(clock.clone());
        (backend, clock, temp_dir)
    }

    #[tokio::test]
    async fn test_put_and_get() {
        let (backend, _clock, _temp_dir) = create_test_backend();
        backend
            .store_value("greeting", b"hello", None)
            .await
            .expect("store should succeed");

        let loaded = backend
            .load_value("greeting")
            .await
            .expect("load should succeed");
        assert_eq!(loaded, Some(b"hello".to_vec()));
        assert!(backend
            .load_value("missing")
            .await
            .expect("load should succeed")
            .is_none());
    }

    #[tokio::test]
    async fn test_value_expiry() {
        let (backend, clock, _temp_dir) = create_test_backend();
        backend
            .store_value("k", b"v", Some(Duration::from_secs(30)))
            .await
            .expect("store should succeed");

        clock.advance(Duration::from_secs(29));
        assert!(backend.has_value("k").await.expect("has should succeed"));
        clock.advance(Duration::from_secs(1));
        assert!(!backend.has_value("k").await.expect("has should succeed"));
    }

    #[tokio::test]
    async fn test_overwrite_replaces_ttl() {
        let (backend, clock, _temp_dir) = create_test_backend();
        backend
            .store_value("k", b"1", Some(Duration::from_secs(5)))
            .await
            .expect("store should succeed");
        backend
            .store_value("k", b"2", None)
            .await
            .expect("store should succeed");

        clock.advance(Duration::from_secs(60));
        assert_eq!(
            backend.load_value("k").await.expect("load should succeed"),
            Some(b"2".to_vec())
        );
    }

    #[tokio::test]
    async fn test_set_membership() {
        let (backend, _clock, _temp_dir) = create_test_backend();
        backend.add_member("s", "a").await.expect("add should succeed");
        backend.add_member("s", "b").await.expect("add should succeed");
        backend.add_member("s", "a").await.expect("add should succeed");
        backend.add_member("other", "z").await.expect("add should succeed");

        let members = backend.members_of("s").await.expect("members should succeed");
        assert_eq!(members.len(), 2);
        assert!(members.contains("a") && members.contains("b"));

        backend.remove_member("s", "a").await.expect("remove should succeed");
        backend.remove_member("s", "b").await.expect("remove should succeed");
        assert!(backend
            .members_of("s")
            .await
            .expect("members should succeed")
            .is_empty());

        let rtxn = backend.env.read_txn().expect("read txn");
        assert!(backend
            .set_expiry(&rtxn, &component("s"))
            .expect("expiry read")
            .is_none());
    }

    #[tokio::test]
    async fn test_long_members_are_hashed_but_listed_verbatim() {
        let (backend, _clock, _temp_dir) = create_test_backend();
        let long_set = "s".repeat(600);
        let long_member = "m".repeat(900);
        backend
            .add_member(&long_set, &long_member)
            .await
            .expect("add should succeed");

        let members = backend
            .members_of(&long_set)
            .await
            .expect("members should succeed");
        assert_eq!(members.into_iter().collect::<Vec<_>>(), vec![long_member.clone()]);

        backend
            .remove_member(&long_set, &long_member)
            .await
            .expect("remove should succeed");
        assert!(backend
            .members_of(&long_set)
            .await
            .expect("members should succeed")
            .is_empty());
    }

    #[tokio::test]
    async fn test_set_ttl_extend_only() {
        let (backend, clock, _temp_dir) = create_test_backend();
        backend.add_member("s", "a").await.expect("add should succeed");
        backend
            .extend_set_ttl("s", Some(Duration::from_secs(100)))
            .await
            .expect("extend should succeed");
        backend
            .extend_set_ttl("s", Some(Duration::from_secs(1)))
            .await
            .expect("extend should succeed");

        clock.advance(Duration::from_secs(50));
        assert_eq!(backend.members_of("s").await.expect("members").len(), 1);
        clock.advance(Duration::from_secs(60));
        assert!(backend.members_of("s").await.expect("members").is_empty());

        backend.add_member("s", "b").await.expect("add should succeed");
        let members = backend.members_of("s").await.expect("members");
        assert_eq!(members.into_iter().collect::<Vec<_>>(), vec!["b".to_string()]);
    }

    #[tokio::test]
    async fn test_batch_and_purge() {
        let (backend, clock, _temp_dir) = create_test_backend();
        let mut batch = Batch::new();
        batch
            .store_value("short", b"1".to_vec(), Some(Duration::from_secs(5)))
            .store_value("long", b"2".to_vec(), None)
            .add_member("s", "short")
            .extend_set_ttl("s", Some(Duration::from_secs(5)))
            .add_member("keep", "long");
        backend.execute(batch).await.expect("execute should succeed");

        clock.advance(Duration::from_secs(10));
        assert_eq!(backend.purge_expired().expect("purge should succeed"), 2);
        assert!(backend.has_value("long").await.expect("has should succeed"));
        assert_eq!(backend.members_of("keep").await.expect("members").len(), 1);
    }

    #[tokio::test]
    async fn test_reopen_persists() {
        let temp_dir = TempDir::new().expect("TempDir creation should succeed");
        {
            let backend =
                LmdbBackend::new(temp_dir.path(), 10).expect("backend creation should succeed");
            backend.add_member("s", "a").await.expect("add should succeed");
        }
        let backend =
            LmdbBackend::new(temp_dir.path(), 10).expect("backend creation should succeed");
        assert_eq!(backend.members_of("s").await.expect("members").len(), 1);
    }
}
