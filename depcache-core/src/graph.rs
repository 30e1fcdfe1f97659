//! Entity-graph adapter contract.
//!
//! Storage layers (ORMs, hand-written repositories) implement
//! [`Identifiable`] for their records so the dependencies of a query result
//! can be collected without naming each row by hand, and [`ChangeTracking`]
//! so updates can report which persisted fields changed.

use std::collections::{BTreeMap, BTreeSet, HashSet};

use crate::dependency::{DependencyId, FieldValue};

/// A record with a kind and a primary key, optionally linked to others.
pub trait Identifiable {
    /// Kind of record, e.g. the model or table name.
    fn kind(&self) -> &str;

    /// Primary key columns, in declaration order.
    fn identity(&self) -> Vec<FieldValue>;

    /// Records reachable through the named relationship. Unknown names
    /// yield nothing.
    fn related(&self, _relationship: &str) -> Vec<&dyn Identifiable> {
        Vec::new()
    }

    /// The entity dependency for this record.
    fn dependency(&self) -> DependencyId {
        DependencyId::primary_key(self.kind(), &self.identity())
    }
}

/// Reports persisted fields whose values differ from the last loaded state.
pub trait ChangeTracking {
    fn changed_fields(&self) -> BTreeSet<String>;
}

/// Tree of relationship names to follow while collecting dependencies.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IncludeMap(BTreeMap<String, IncludeMap>);

impl IncludeMap {
    /// Follow no relationships.
    pub fn new() -> Self {
        Self::default()
    }

    /// Follow `relationship`, then apply `nested` to the related records.
    pub fn include(mut self, relationship: impl Into<String>, nested: IncludeMap) -> Self {
        self.0.insert(relationship.into(), nested);
        self
    }

    /// Follow `relationship` without descending further.
    pub fn leaf(self, relationship: impl Into<String>) -> Self {
        self.include(relationship, IncludeMap::new())
    }

    /// Follow the same relationships on every level, `depth` levels deep.
    pub fn depth(depth: usize, relationships: &[&str]) -> Self {
        (0..depth).fold(IncludeMap::new(), |nested, _| {
            relationships.iter().fold(IncludeMap::new(), |map, name| {
                map.include(*name, nested.clone())
            })
        })
    }

    pub fn get(&self, relationship: &str) -> Option<&IncludeMap> {
        self.0.get(relationship)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Collect entity dependencies for `objects` and the related records named
/// by `include`.
///
/// Each record contributes its dependency once, in first-visit order
/// (depth-first, relationships in name order).
pub fn collect_dependencies<'a, T, I>(objects: I, include: &IncludeMap) -> Vec<DependencyId>
where
    T: Identifiable + ?Sized + 'a,
    I: IntoIterator<Item = &'a T>,
{
    let mut seen = HashSet::new();
    let mut out = Vec::new();
    for object in objects {
        visit(object, include, &mut seen, &mut out);
    }
    out
}

fn visit<T: Identifiable + ?Sized>(
    object: &T,
    include: &IncludeMap,
    seen: &mut HashSet<DependencyId>,
    out: &mut Vec<DependencyId>,
) {
    let dependency = object.dependency();
    if seen.insert(dependency.clone()) {
        out.push(dependency);
    }

    for (relationship, nested) in &include.0 {
        for related in object.related(relationship) {
            visit(related, nested, seen, out);
        }
    }
}
