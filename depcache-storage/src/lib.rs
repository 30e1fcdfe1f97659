//! depcache Storage - Backends, Dependency Index and Cache Store
//!
//! Everything that touches storage lives here: the [`Backend`] contract and
//! its in-memory and LMDB implementations, the forward/reverse
//! [`DependencyIndex`] kept inside the backend, and the [`CacheStore`] that
//! ties values to their dependencies.
//!
//! # Example
//!
//! ```ignore
//! let cache = CacheStore::new(Arc::new(InMemoryBackend::new()), CacheConfig::default())?;
//!
//! cache
//!     .put("article-list", &articles, [DependencyId::tag("articles")], None)
//!     .await?;
//!
//! cache.invalidate([&DependencyId::tag("articles")]).await?;
//! assert!(!cache.has("article-list").await);
//! ```

pub mod backend;
pub mod clock;
pub mod index;
pub mod keys;
pub mod store;

pub use backend::{Backend, BackendOp, Batch, InMemoryBackend, LmdbBackend, LmdbBackendError};
pub use clock::{Clock, ManualClock, SystemClock};
pub use index::DependencyIndex;
pub use keys::{KeyKind, KeySpace, StorageKey};
pub use store::{CacheStats, CacheStore};
