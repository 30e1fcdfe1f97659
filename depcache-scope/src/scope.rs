//! Scopes: filter-condition dependencies over one kind of object.
//!
//! A scope names a set of fields ("described fields") of some object kind.
//! A cached query result filtered by `{category: "rust", published: true}`
//! depends on the condition id for exactly that filter. When an object of
//! that kind changes, every condition it could satisfy is invalidated: one
//! id per non-empty subset of the described fields that touches a modified
//! field, plus the scope-wide catch-all.
//!
//! # Example
//!
//! ```ignore
//! let articles = Scope::declare("articles")
//!     .describes(["author_id", "category", "published"])?
//!     .extractor(|article: &Article| article.scope_fields());
//!
//! let deps = articles.condition(&FieldMap::new().with("category", "rust"))?;
//! cache.put("rust-articles", &listing, deps, None).await?;
//!
//! article.set_published(false);
//! articles
//!     .invalidate_for(&cache, &article, Some(&article.changed_fields()))
//!     .await?;
//! ```

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use depcache_core::{CacheResult, ConfigError, DependencyId, FieldMap, FieldValue, ValidationMode};
use depcache_storage::{Backend, CacheStore};

use crate::subsets::{full_mask, positions, relevant_subsets, MAX_DESCRIBED_FIELDS};

/// Above this many described fields, batches get large enough that a
/// warning is logged at declaration.
pub const RECOMMENDED_MAX_FIELDS: usize = 8;

type Extractor<T> = dyn Fn(&T) -> FieldMap + Send + Sync;

/// First step of declaring a scope: a name and a validation mode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScopeDeclaration {
    name: String,
    mode: ValidationMode,
}

impl ScopeDeclaration {
    /// How misuse of this scope is reported.
    pub fn mode(mut self, mode: ValidationMode) -> Self {
        self.mode = mode;
        self
    }

    /// Declare the fields this scope's conditions may filter on.
    ///
    /// # Errors
    ///
    /// In every mode: an empty field list, a repeated field, or more than
    /// [`MAX_DESCRIBED_FIELDS`] fields.
    pub fn describes<I, S>(self, fields: I) -> CacheResult<DescribedScope>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let fields: Vec<String> = fields.into_iter().map(Into::into).collect();
        validate_fields(&self.name, &fields)?;

        if fields.len() > RECOMMENDED_MAX_FIELDS {
            tracing::warn!(
                scope = %self.name,
                fields = fields.len(),
                recommended = RECOMMENDED_MAX_FIELDS,
                "Scope describes many fields; each change invalidates up to 2^n conditions"
            );
        }

        Ok(DescribedScope {
            name: self.name,
            mode: self.mode,
            fields,
        })
    }
}

fn validate_fields(scope: &str, fields: &[String]) -> CacheResult<()> {
    if fields.is_empty() {
        return Err(ConfigError::EmptyFieldSet {
            scope: scope.to_string(),
        }
        .into());
    }
    if fields.len() > MAX_DESCRIBED_FIELDS {
        return Err(ConfigError::TooManyFields {
            scope: scope.to_string(),
            count: fields.len(),
            max: MAX_DESCRIBED_FIELDS,
        }
        .into());
    }
    let mut seen = BTreeSet::new();
    for field in fields {
        if !seen.insert(field.as_str()) {
            return Err(ConfigError::DuplicateField {
                scope: scope.to_string(),
                field: field.clone(),
            }
            .into());
        }
    }
    Ok(())
}

fn sorted(fields: &[String]) -> Vec<String> {
    let mut sorted = fields.to_vec();
    sorted.sort();
    sorted
}

/// A scope with its described fields, waiting for an extractor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DescribedScope {
    name: String,
    mode: ValidationMode,
    fields: Vec<String>,
}

impl DescribedScope {
    /// Re-declare the described fields.
    ///
    /// The same set (in any order) is accepted as is. A different set is a
    /// [`ConfigError::ConflictingDeclaration`] in development mode; in
    /// production mode it is logged and the first declaration kept.
    pub fn describes<I, S>(self, fields: I) -> CacheResult<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let requested: Vec<String> = fields.into_iter().map(Into::into).collect();
        if sorted(&requested) == sorted(&self.fields) {
            return Ok(self);
        }

        if self.mode.is_production() {
            tracing::warn!(
                scope = %self.name,
                declared = ?self.fields,
                requested = ?requested,
                "Ignoring conflicting field declaration"
            );
            return Ok(self);
        }

        Err(ConfigError::ConflictingDeclaration {
            scope: self.name,
            declared: self.fields,
            requested,
        }
        .into())
    }

    pub fn fields(&self) -> &[String] {
        &self.fields
    }

    /// Attach the function reading described field values off an object.
    pub fn extractor<T, F>(self, extractor: F) -> Scope<T>
    where
        T: ?Sized,
        F: Fn(&T) -> FieldMap + Send + Sync + 'static,
    {
        Scope {
            name: self.name,
            mode: self.mode,
            fields: self.fields,
            extractor: Arc::new(extractor),
        }
    }
}

/// A fully declared scope over objects of type `T`.
///
/// Cheap to clone; clones share the extractor.
pub struct Scope<T: ?Sized> {
    name: String,
    mode: ValidationMode,
    fields: Vec<String>,
    extractor: Arc<Extractor<T>>,
}

impl Scope<()> {
    /// Start declaring a scope called `name`, in development mode.
    pub fn declare(name: impl Into<String>) -> ScopeDeclaration {
        ScopeDeclaration {
            name: name.into(),
            mode: ValidationMode::default(),
        }
    }
}

impl<T: ?Sized> Clone for Scope<T> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            mode: self.mode,
            fields: self.fields.clone(),
            extractor: Arc::clone(&self.extractor),
        }
    }
}

impl<T: ?Sized> fmt::Debug for Scope<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scope")
            .field("name", &self.name)
            .field("mode", &self.mode)
            .field("fields", &self.fields)
            .finish_non_exhaustive()
    }
}

impl<T: ?Sized> Scope<T> {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn mode(&self) -> ValidationMode {
        self.mode
    }

    /// Described fields, in declaration order.
    pub fn fields(&self) -> &[String] {
        &self.fields
    }

    pub fn describes_field(&self, field: &str) -> bool {
        self.fields.iter().any(|described| described == field)
    }

    /// The scope-wide id included in every non-empty invalidation batch.
    pub fn catch_all(&self) -> DependencyId {
        DependencyId::scope_catch_all(&self.name)
    }

    /// Field values of `object` as seen by this scope.
    pub fn extract(&self, object: &T) -> FieldMap {
        (self.extractor)(object)
    }

    /// Dependencies for a cache entry filtered by `condition`.
    ///
    /// Always exactly one id. An empty condition or one naming a field the
    /// scope does not describe is an error in development mode; in
    /// production mode the catch-all is returned so the entry is dropped on
    /// any change to this kind of object.
    pub fn condition(&self, condition: &FieldMap) -> CacheResult<Vec<DependencyId>> {
        if condition.is_empty() {
            return self.tolerate(
                ConfigError::EmptyCondition {
                    scope: self.name.clone(),
                },
                vec![self.catch_all()],
            );
        }

        if let Some(unknown) = condition.fields().find(|field| !self.describes_field(field)) {
            return self.tolerate(
                ConfigError::UnknownField {
                    scope: self.name.clone(),
                    field: unknown.to_string(),
                },
                vec![self.catch_all()],
            );
        }

        Ok(vec![DependencyId::scope(&self.name, condition)])
    }

    /// Every condition id `object` could satisfy through a modified field.
    ///
    /// With `modified` absent every described field counts as modified.
    /// Modified fields the scope does not describe are ignored; if none of
    /// the modified fields are described the batch is empty.
    pub fn invalidation_batch(
        &self,
        object: &T,
        modified: Option<&BTreeSet<String>>,
    ) -> CacheResult<BTreeSet<DependencyId>> {
        let k = self.fields.len();
        let relevant_mask = match modified {
            None => full_mask(k),
            Some(modified) => self
                .fields
                .iter()
                .enumerate()
                .filter(|(_, field)| modified.contains(*field))
                .fold(0u32, |mask, (position, _)| mask | (1 << position)),
        };
        if relevant_mask == 0 {
            return Ok(BTreeSet::new());
        }

        let extracted = self.extract(object);
        let mut values: Vec<&FieldValue> = Vec::with_capacity(k);
        for field in &self.fields {
            match extracted.get(field) {
                Some(value) => values.push(value),
                None => {
                    return self.tolerate(
                        ConfigError::MissingExtractedField {
                            scope: self.name.clone(),
                            field: field.clone(),
                        },
                        BTreeSet::from([self.catch_all()]),
                    )
                }
            }
        }

        let mut batch: BTreeSet<DependencyId> = relevant_subsets(k, relevant_mask)
            .map(|mask| {
                let subset: FieldMap = positions(mask)
                    .map(|position| (self.fields[position].as_str(), values[position].clone()))
                    .collect();
                DependencyId::scope(&self.name, &subset)
            })
            .collect();
        batch.insert(self.catch_all());
        Ok(batch)
    }

    /// Invalidate every entry whose condition `object` could satisfy through
    /// a modified field. Returns the cache keys removed.
    pub async fn invalidate_for<B>(
        &self,
        cache: &CacheStore<B>,
        object: &T,
        modified: Option<&BTreeSet<String>>,
    ) -> CacheResult<BTreeSet<String>>
    where
        B: Backend + ?Sized,
    {
        let batch = self.invalidation_batch(object, modified)?;
        cache.invalidate(&batch).await
    }

    /// Invalidate for an update, using both the old and the new field values.
    ///
    /// Entries cached under a condition only the old values satisfied (an
    /// article moved out of a category) are dropped along with those the new
    /// values satisfy.
    pub async fn invalidate_for_change<B>(
        &self,
        cache: &CacheStore<B>,
        before: &T,
        after: &T,
        modified: Option<&BTreeSet<String>>,
    ) -> CacheResult<BTreeSet<String>>
    where
        B: Backend + ?Sized,
    {
        let mut batch = self.invalidation_batch(before, modified)?;
        batch.extend(self.invalidation_batch(after, modified)?);
        cache.invalidate(&batch).await
    }

    /// Return `fallback` in production mode, `error` otherwise.
    fn tolerate<R>(&self, error: ConfigError, fallback: R) -> CacheResult<R> {
        if self.mode.is_production() {
            tracing::warn!(scope = %self.name, error = %error, "Falling back to scope catch-all");
            Ok(fallback)
        } else {
            Err(error.into())
        }
    }
}
