//! Dependency index.
//!
//! Two maps live in the backend as sets:
//!
//! - forward: cache key → canonical keys of the dependencies it was stored
//!   with
//! - reverse: canonical dependency key → cache keys that depend on it
//!
//! The reverse map is what `invalidate` reads; the forward map lets a key be
//! removed from every reverse bucket it sits in, so buckets never keep
//! pointing at keys that are gone. Every per-key transition is submitted as
//! one [`Batch`].

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use depcache_core::{BackendResult, DependencyId};

use crate::backend::{Backend, Batch};
use crate::keys::KeySpace;

/// Reverse bucket a key was reached through during invalidation.
struct FoundIn<'a> {
    bucket: &'a str,
    canonical: &'a str,
}

/// Forward/reverse dependency index over a shared [`Backend`].
pub struct DependencyIndex<B: Backend + ?Sized> {
    backend: Arc<B>,
    keys: KeySpace,
    log_invalidations: bool,
}

impl<B: Backend + ?Sized> Clone for DependencyIndex<B> {
    fn clone(&self) -> Self {
        Self {
            backend: Arc::clone(&self.backend),
            keys: self.keys.clone(),
            log_invalidations: self.log_invalidations,
        }
    }
}

impl<B: Backend + ?Sized> DependencyIndex<B> {
    pub fn new(backend: Arc<B>, keys: KeySpace) -> Self {
        Self {
            backend,
            keys,
            log_invalidations: false,
        }
    }

    /// Log every invalidation sweep at `info` level.
    pub fn with_log_invalidations(mut self, enabled: bool) -> Self {
        self.log_invalidations = enabled;
        self
    }

    pub fn backend(&self) -> &Arc<B> {
        &self.backend
    }

    pub fn keys(&self) -> &KeySpace {
        &self.keys
    }

    /// Register `key` as depending on exactly `deps`.
    ///
    /// Dependencies the key was previously linked to but is not any more are
    /// unlinked in the same batch. Every touched set is kept alive for at
    /// least `ttl` (`None`: forever), so a reverse bucket never expires
    /// before an entry it points at.
    pub async fn link<'a, I>(&self, key: &str, deps: I, ttl: Option<Duration>) -> BackendResult<()>
    where
        I: IntoIterator<Item = &'a DependencyId>,
    {
        let linked: BTreeSet<String> = deps.into_iter().map(DependencyId::canonical_key).collect();
        let forward_key = self.keys.forward(key);
        let previous = self.backend.members_of(&forward_key).await?;

        let mut batch = Batch::new();
        for stale in previous.difference(&linked) {
            batch.remove_member(&self.keys.reverse_encoded(stale), key);
        }
        for canonical in &linked {
            let reverse_key = self.keys.reverse_encoded(canonical);
            batch
                .add_member(&reverse_key, key)
                .extend_set_ttl(&reverse_key, ttl);
        }
        batch.delete_set(&forward_key);
        for canonical in &linked {
            batch.add_member(&forward_key, canonical);
        }
        batch.extend_set_ttl(&forward_key, ttl);

        self.backend.execute(batch).await?;

        tracing::debug!(
            key,
            dependencies = linked.len(),
            unlinked = previous.difference(&linked).count(),
            "Linked cache key"
        );
        Ok(())
    }

    /// Remove every entry depending on any of `deps`.
    ///
    /// Returns the keys whose value was actually deleted. Keys whose value
    /// had already expired or been removed are still cleaned out of the
    /// index but not reported. Unknown dependencies are a no-op, so calling
    /// this twice is the same as calling it once.
    pub async fn invalidate<'a, I>(&self, deps: I) -> BackendResult<BTreeSet<String>>
    where
        I: IntoIterator<Item = &'a DependencyId>,
    {
        let mut removed = BTreeSet::new();
        let mut requested = 0usize;
        let mut candidates = 0usize;

        for dependency in deps {
            requested += 1;
            let canonical = dependency.canonical_key();
            let reverse_key = self.keys.reverse_encoded(&canonical);

            // Unregistering a key clears it from every bucket in its forward
            // set, so a key reachable through several requested dependencies
            // only shows up again here if it was re-linked meanwhile.
            for key in self.backend.members_of(&reverse_key).await? {
                candidates += 1;
                let found_in = FoundIn {
                    bucket: &reverse_key,
                    canonical: &canonical,
                };
                if self.unregister_found_in(&key, Some(found_in)).await? {
                    removed.insert(key);
                }
            }
        }

        if self.log_invalidations {
            tracing::info!(
                dependencies = requested,
                candidates,
                removed = removed.len(),
                "Invalidation sweep"
            );
        }
        Ok(removed)
    }

    /// Delete the value of `key` and every index record about it.
    ///
    /// Returns whether a live value existed.
    pub async fn unregister(&self, key: &str) -> BackendResult<bool> {
        self.unregister_found_in(key, None).await
    }

    async fn unregister_found_in(
        &self,
        key: &str,
        found_in: Option<FoundIn<'_>>,
    ) -> BackendResult<bool> {
        let data_key = self.keys.data(key);
        let forward_key = self.keys.forward(key);

        let forward = self.backend.members_of(&forward_key).await?;

        // The bucket outlived the key's previous forward set (it expired and
        // the key was stored again without this dependency). Only the
        // membership is stale; the current entry stays.
        if let Some(found_in) = &found_in {
            if !forward.contains(found_in.canonical) {
                self.drop_stale_membership(key, &forward_key, found_in).await?;
                return Ok(false);
            }
        }

        let existed = self.backend.has_value(&data_key).await?;

        let mut batch = Batch::new();
        batch.delete_value(&data_key);
        for canonical in &forward {
            batch.remove_member(&self.keys.reverse_encoded(canonical), key);
        }
        if let Some(found_in) = &found_in {
            batch.remove_member(found_in.bucket, key);
        }
        batch.delete_set(&forward_key);
        self.backend.execute(batch).await?;

        tracing::debug!(key, existed, dependencies = forward.len(), "Unregistered cache key");
        Ok(existed)
    }

    async fn drop_stale_membership(
        &self,
        key: &str,
        forward_key: &str,
        found_in: &FoundIn<'_>,
    ) -> BackendResult<()> {
        self.backend.remove_member(found_in.bucket, key).await?;

        // A concurrent link may have registered the key under this bucket
        // between the forward read and the removal.
        let relinked = self
            .backend
            .members_of(forward_key)
            .await?
            .contains(found_in.canonical);
        if relinked {
            self.backend.add_member(found_in.bucket, key).await?;
        }

        tracing::debug!(key, bucket = found_in.bucket, relinked, "Dropped stale reverse entry");
        Ok(())
    }

    /// Dependencies `key` is currently linked to.
    pub async fn dependencies_of(&self, key: &str) -> BackendResult<BTreeSet<DependencyId>> {
        self.backend
            .members_of(&self.keys.forward(key))
            .await?
            .iter()
            .map(|canonical| DependencyId::from_canonical_key(canonical))
            .collect()
    }

    /// Cache keys currently registered under `dependency`.
    pub async fn dependents_of(&self, dependency: &DependencyId) -> BackendResult<BTreeSet<String>> {
        self.backend.members_of(&self.keys.reverse(dependency)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::InMemoryBackend;

    fn index() -> (DependencyIndex<InMemoryBackend>, Arc<InMemoryBackend>) {
        let backend = Arc::new(InMemoryBackend::new());
        let keys = KeySpace::new("cache").expect("valid prefix");
        (DependencyIndex::new(backend.clone(), keys), backend)
    }

    async fn store(backend: &InMemoryBackend, key: &str) {
        backend
            .store_value(&format!("cache::data::{}", key), b"{}", None)
            .await
            .expect("store should succeed");
    }

    #[tokio::test]
    async fn test_link_populates_both_directions() {
        let (index, _backend) = index();
        let article = DependencyId::entity("article", 1);
        let author = DependencyId::entity("author", 7);

        index
            .link("page", [&article, &author], None)
            .await
            .expect("link should succeed");

        let deps = index.dependencies_of("page").await.expect("deps");
        assert_eq!(deps, BTreeSet::from([article.clone(), author.clone()]));
        assert_eq!(
            index.dependents_of(&article).await.expect("dependents"),
            BTreeSet::from(["page".to_string()])
        );
    }

    #[tokio::test]
    async fn test_relink_drops_stale_reverse_entries() {
        let (index, _backend) = index();
        let old = DependencyId::tag("old");
        let kept = DependencyId::tag("kept");
        let new = DependencyId::tag("new");

        index.link("k", [&old, &kept], None).await.expect("link");
        index.link("k", [&kept, &new], None).await.expect("link");

        assert!(index.dependents_of(&old).await.expect("dependents").is_empty());
        assert_eq!(index.dependents_of(&kept).await.expect("dependents").len(), 1);
        assert_eq!(index.dependents_of(&new).await.expect("dependents").len(), 1);
    }

    #[tokio::test]
    async fn test_invalidate_reports_only_live_keys() {
        let (index, backend) = index();
        let dep = DependencyId::entity("article", 1);
        store(&backend, "live").await;
        index.link("live", [&dep], None).await.expect("link");
        // Registered but its value is already gone.
        index.link("ghost", [&dep], None).await.expect("link");

        let removed = index.invalidate([&dep]).await.expect("invalidate");
        assert_eq!(removed, BTreeSet::from(["live".to_string()]));
        assert!(index.dependents_of(&dep).await.expect("dependents").is_empty());
        assert!(backend.set_keys().expect("keys").is_empty());
    }

    #[tokio::test]
    async fn test_invalidate_cleans_every_bucket_of_a_key() {
        let (index, backend) = index();
        let a = DependencyId::tag("a");
        let b = DependencyId::tag("b");
        store(&backend, "k").await;
        index.link("k", [&a, &b], None).await.expect("link");

        index.invalidate([&a]).await.expect("invalidate");
        assert!(index.dependents_of(&b).await.expect("dependents").is_empty());
        assert!(index.dependencies_of("k").await.expect("deps").is_empty());
    }

    #[tokio::test]
    async fn test_invalidate_twice_is_noop() {
        let (index, backend) = index();
        let dep = DependencyId::tag("t");
        store(&backend, "k").await;
        index.link("k", [&dep], None).await.expect("link");

        assert_eq!(index.invalidate([&dep]).await.expect("invalidate").len(), 1);
        assert!(index.invalidate([&dep]).await.expect("invalidate").is_empty());
        assert!(index
            .invalidate([&DependencyId::tag("unknown")])
            .await
            .expect("invalidate")
            .is_empty());
    }

    #[tokio::test]
    async fn test_key_reachable_through_two_requested_deps_is_removed_once() {
        let (index, backend) = index();
        let a = DependencyId::tag("a");
        let b = DependencyId::tag("b");
        store(&backend, "k").await;
        index.link("k", [&a, &b], None).await.expect("link");

        let removed = index.invalidate([&a, &b]).await.expect("invalidate");
        assert_eq!(removed.len(), 1);
        assert!(backend.set_keys().expect("keys").is_empty());
    }

    #[tokio::test]
    async fn test_stale_membership_does_not_remove_relinked_key() {
        let (index, backend) = index();
        let old = DependencyId::tag("old");
        let new = DependencyId::tag("new");
        store(&backend, "k").await;
        index.link("k", [&new], None).await.expect("link");
        // Left behind by a forward set that expired before the bucket did.
        backend
            .add_member(&index.keys().reverse(&old), "k")
            .await
            .expect("add should succeed");

        assert!(index.invalidate([&old]).await.expect("invalidate").is_empty());
        assert!(index.dependents_of(&old).await.expect("dependents").is_empty());
        assert!(backend
            .has_value(&index.keys().data("k"))
            .await
            .expect("has should succeed"));
        assert_eq!(
            index.dependencies_of("k").await.expect("deps"),
            BTreeSet::from([new.clone()])
        );

        assert_eq!(
            index.invalidate([&new]).await.expect("invalidate"),
            BTreeSet::from(["k".to_string()])
        );
    }

    #[tokio::test]
    async fn test_unregister() {
        let (index, backend) = index();
        let dep = DependencyId::tag("t");
        store(&backend, "k").await;
        index.link("k", [&dep], None).await.expect("link");

        assert!(index.unregister("k").await.expect("unregister"));
        assert!(!index.unregister("k").await.expect("unregister"));
        assert!(index.dependents_of(&dep).await.expect("dependents").is_empty());
    }
}
