//! Scope invalidation against a live cache.
//!
//! Uses the article/author fixtures: article listings are cached under
//! condition ids and dropped when an article change could move an article
//! into or out of the listing.

use std::collections::BTreeSet;
use std::sync::Arc;

use depcache_core::{
    CacheConfig, ChangeTracking, DependencyId, FieldMap, FieldValue, ValidationMode,
};
use depcache_scope::{subset_count, Scope, ScopeRegistry};
use depcache_storage::{CacheStore, InMemoryBackend};
use depcache_test_utils::assertions::assert_config_error;
use depcache_test_utils::fixtures::{article, author, Article, ARTICLE_SCOPE_FIELDS};
use depcache_test_utils::generators::arb_field_value;
use depcache_test_utils::init_tracing;
use proptest::prelude::*;

// ============================================================================
// HARNESS
// ============================================================================

fn articles_scope(mode: ValidationMode) -> Scope<Article> {
    Scope::declare("articles")
        .mode(mode)
        .describes(ARTICLE_SCOPE_FIELDS)
        .expect("valid declaration")
        .extractor(Article::scope_fields)
}

fn cache() -> CacheStore<InMemoryBackend> {
    CacheStore::new(Arc::new(InMemoryBackend::new()), CacheConfig::default())
        .expect("default config is valid")
}

async fn cache_listing(
    cache: &CacheStore<InMemoryBackend>,
    scope: &Scope<Article>,
    key: &str,
    condition: FieldMap,
) {
    let deps = scope.condition(&condition).expect("valid condition");
    cache
        .put(key, &key, deps, None)
        .await
        .expect("put should succeed");
}

// ============================================================================
// SCENARIOS
// ============================================================================

#[tokio::test]
async fn test_change_drops_only_affected_listings() {
    init_tracing();
    let cache = cache();
    let scope = articles_scope(ValidationMode::Development);
    let ferris = author(1, "Ferris");

    cache_listing(&cache, &scope, "rust", FieldMap::new().with("category", "rust")).await;
    cache_listing(&cache, &scope, "go", FieldMap::new().with("category", "go")).await;
    cache_listing(&cache, &scope, "drafts", FieldMap::new().with("published", false)).await;
    cache_listing(
        &cache,
        &scope,
        "ferris",
        FieldMap::new().with("author_id", ferris.id),
    )
    .await;

    let mut post = article(1, &ferris, "rust", true);

    // Title is not described: nothing to drop.
    post.set_title("Ownership, again");
    let removed = scope
        .invalidate_for(&cache, &post, Some(&post.changed_fields()))
        .await
        .expect("invalidate should succeed");
    assert!(removed.is_empty());
    post.mark_saved();

    // Unpublishing enters the drafts listing.
    post.set_published(false);
    let removed = scope
        .invalidate_for(&cache, &post, Some(&post.changed_fields()))
        .await
        .expect("invalidate should succeed");
    assert_eq!(removed, BTreeSet::from(["drafts".to_string()]));
    assert!(cache.has("rust").await);
    assert!(cache.has("go").await);
    assert!(cache.has("ferris").await);

    // A full invalidation (no change set) touches every condition the
    // article satisfies.
    let removed = scope
        .invalidate_for(&cache, &post, None)
        .await
        .expect("invalidate should succeed");
    assert_eq!(
        removed,
        BTreeSet::from(["ferris".to_string(), "rust".to_string()])
    );
    assert!(cache.has("go").await);
}

#[tokio::test]
async fn test_change_with_old_values_drops_listings_left_behind() {
    let cache = cache();
    let scope = articles_scope(ValidationMode::Development);
    let ferris = author(1, "Ferris");

    let published_rust = FieldMap::new()
        .with("category", "rust")
        .with("published", true);
    cache_listing(&cache, &scope, "published-rust", published_rust).await;
    cache_listing(&cache, &scope, "go", FieldMap::new().with("category", "go")).await;

    let before = article(1, &ferris, "rust", true);
    let mut after = before.clone();
    after.set_category("go");

    // Current values alone only reach the listing the article moved into.
    let removed = scope
        .invalidate_for(&cache, &after, Some(&after.changed_fields()))
        .await
        .expect("invalidate should succeed");
    assert_eq!(removed, BTreeSet::from(["go".to_string()]));
    assert!(cache.has("published-rust").await);

    cache_listing(&cache, &scope, "go", FieldMap::new().with("category", "go")).await;
    let removed = scope
        .invalidate_for_change(&cache, &before, &after, Some(&after.changed_fields()))
        .await
        .expect("invalidate should succeed");
    assert_eq!(
        removed,
        BTreeSet::from(["go".to_string(), "published-rust".to_string()])
    );
}

#[tokio::test]
async fn test_production_catch_all_is_invalidated_by_any_relevant_change() {
    let cache = cache();
    let scope = articles_scope(ValidationMode::Production);

    // `title` is not described; production mode falls back to the catch-all.
    cache_listing(&cache, &scope, "by-title", FieldMap::new().with("title", "x")).await;
    assert_eq!(
        cache.dependencies_of("by-title").await.expect("deps"),
        BTreeSet::from([scope.catch_all()])
    );

    let mut post = article(9, &author(3, "Corro"), "go", false);
    post.set_title("unrelated");
    assert!(scope
        .invalidate_for(&cache, &post, Some(&post.changed_fields()))
        .await
        .expect("invalidate should succeed")
        .is_empty());

    post.set_category("rust");
    let removed = scope
        .invalidate_for(&cache, &post, Some(&post.changed_fields()))
        .await
        .expect("invalidate should succeed");
    assert_eq!(removed, BTreeSet::from(["by-title".to_string()]));
}

#[tokio::test]
async fn test_entity_and_scope_dependencies_combine() {
    let cache = cache();
    let scope = articles_scope(ValidationMode::Development);
    let ferris = author(1, "Ferris");
    let post = article(4, &ferris, "rust", true);

    let mut deps = scope
        .condition(&FieldMap::new().with("category", "rust"))
        .expect("valid condition");
    deps.push(DependencyId::entity("article", post.id));
    cache
        .put("rust", &vec![post.clone()], deps, None)
        .await
        .expect("put should succeed");

    // Editing the article's body does not move it between listings but the
    // entity dependency still drops the listing that shows it.
    let removed = cache
        .invalidate([&DependencyId::entity("article", 4)])
        .await
        .expect("invalidate should succeed");
    assert_eq!(removed, BTreeSet::from(["rust".to_string()]));
}

#[tokio::test]
async fn test_single_field_condition_follows_only_its_own_field() {
    let cache = CacheStore::new(Arc::new(InMemoryBackend::new()), CacheConfig::default())
        .expect("default config is valid");
    let scope = Scope::declare("pairs")
        .describes(["a", "b"])
        .expect("valid declaration")
        .extractor(|object: &FieldMap| object.clone());
    let object = FieldMap::new().with("a", 1).with("b", 2);
    let listing = FieldMap::new().with("a", 1);

    assert_config_error(&scope.condition(&FieldMap::new().with("c", 1)));

    // `a` changed: the object may have entered or left `a = 1`.
    cache
        .put("L", &"a=1", scope.condition(&listing).expect("valid condition"), None)
        .await
        .expect("put should succeed");
    let removed = scope
        .invalidate_for(&cache, &object, Some(&BTreeSet::from(["a".to_string()])))
        .await
        .expect("invalidate should succeed");
    assert_eq!(removed, BTreeSet::from(["L".to_string()]));

    // Only `b` changed: membership in `a = 1` cannot flip, so the entry
    // stays. Entries filtered on `{a, b}` are the ones dropped.
    cache
        .put("L", &"a=1", scope.condition(&listing).expect("valid condition"), None)
        .await
        .expect("put should succeed");
    let both = scope
        .condition(&FieldMap::new().with("a", 1).with("b", 2))
        .expect("valid condition");
    cache
        .put("LB", &"a=1,b=2", both, None)
        .await
        .expect("put should succeed");
    let removed = scope
        .invalidate_for(&cache, &object, Some(&BTreeSet::from(["b".to_string()])))
        .await
        .expect("invalidate should succeed");
    assert_eq!(removed, BTreeSet::from(["LB".to_string()]));
    assert!(cache.has("L").await);

    // `c` is not described.
    let removed = scope
        .invalidate_for(&cache, &object, Some(&BTreeSet::from(["c".to_string()])))
        .await
        .expect("invalidate should succeed");
    assert!(removed.is_empty());
    assert!(cache.has("L").await);
}

#[test]
fn test_registry_detects_conflicting_article_scopes() {
    let registry = ScopeRegistry::new(ValidationMode::Development);
    registry
        .register(&articles_scope(ValidationMode::Development))
        .expect("first registration");

    let narrower = Scope::declare("articles")
        .describes(["category"])
        .expect("valid declaration")
        .extractor(Article::scope_fields);
    assert!(registry.register(&narrower).is_err());
}

// ============================================================================
// PROPERTIES
// ============================================================================

fn described() -> Vec<String> {
    ["a", "b", "c", "d", "e"].iter().map(|f| f.to_string()).collect()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(128))]

    /// Property: a condition over the object's own values is in the batch
    /// iff it filters on at least one modified field; the catch-all is in
    /// the batch iff any described field was modified.
    #[test]
    fn prop_batch_covers_exactly_the_affected_conditions(
        values in proptest::collection::vec(arb_field_value(), 5),
        modified in proptest::collection::btree_set("[a-g]", 0..5),
        condition_mask in 1u32..32,
    ) {
        let fields = described();
        let object: FieldMap = fields.iter().cloned().zip(values.iter().cloned()).collect();
        let scope = Scope::declare("props")
            .describes(fields.clone())
            .expect("valid declaration")
            .extractor(|object: &FieldMap| object.clone());

        let batch = scope.invalidation_batch(&object, Some(&modified)).expect("batch");

        let relevant_mask = fields
            .iter()
            .enumerate()
            .filter(|(_, f)| modified.contains(*f))
            .fold(0u32, |mask, (i, _)| mask | (1 << i));
        let expected_len = match subset_count(fields.len(), relevant_mask) {
            0 => 0,
            n => n + 1,
        };
        prop_assert_eq!(batch.len(), expected_len);
        prop_assert_eq!(batch.contains(&scope.catch_all()), relevant_mask != 0);

        let condition: FieldMap = fields
            .iter()
            .enumerate()
            .filter(|(i, _)| condition_mask & (1 << i) != 0)
            .map(|(i, f)| (f.clone(), values[i].clone()))
            .collect();
        let id = scope.condition(&condition).expect("valid condition").remove(0);
        prop_assert_eq!(batch.contains(&id), condition_mask & relevant_mask != 0);

        // A condition on a value the object does not have is never hit.
        let mut other = condition.clone();
        let (field, _) = condition.iter().next().expect("non-empty condition");
        other.insert(field.clone(), FieldValue::from("value-not-generated-by-the-strategy-!!!!"));
        let other_id = scope.condition(&other).expect("valid condition").remove(0);
        prop_assert!(!batch.contains(&other_id));
    }
}
