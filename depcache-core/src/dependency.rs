//! Dependency identifiers and their canonical wire encoding.
//!
//! A [`DependencyId`] names "a fact a cache entry's correctness relies on":
//! a single entity row, a named tag, or a filter condition over a scope.
//! Its [`canonical_key`](DependencyId::canonical_key) is the only form in
//! which it is persisted, so the encoding is stable across restarts.
//!
//! # Canonical Encoding
//!
//! Every component is length-prefixed with its UTF-8 byte length:
//!
//! ```text
//! <len>:<namespace>{|<len>:<field>=<value>}*
//! value := <len>:<text> | ~
//! ```
//!
//! `entity(article, 1)` encodes to `6:entity|7:article=1:1`. Because no
//! component is ever read without its length, no choice of field names or
//! values can make two distinct identifiers encode to the same string.

use std::collections::btree_map;
use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{BackendError, BackendResult};

/// Namespace of identifiers naming a single entity.
pub const ENTITY_NAMESPACE: &str = "entity";

/// Namespace of plain named tags.
pub const TAG_NAMESPACE: &str = "tag";

/// Prefix of every scope namespace (`scope:<scope name>`).
pub const SCOPE_NAMESPACE_PREFIX: &str = "scope:";

/// Payload field used by tags.
const TAG_FIELD: &str = "name";

/// Marker for a null value in the canonical encoding.
const NULL_MARKER: char = '~';

// ============================================================================
// FIELD VALUES
// ============================================================================

/// A primitive attribute value used in dependency payloads.
///
/// Values are compared by their textual form: `FieldValue::from(7)` and
/// `FieldValue::from("7")` are the same value. This keeps a scope extractor
/// and a caller of `condition` in agreement even when they hold the
/// attribute in different Rust types.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum FieldValue {
    /// Absent value (SQL `NULL`, `None`).
    Null,
    /// Any other value, in its canonical textual form.
    Text(String),
}

impl FieldValue {
    /// Textual form, or `None` for [`FieldValue::Null`].
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Null => None,
            Self::Text(text) => Some(text),
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => f.write_str("null"),
            Self::Text(text) => f.write_str(text),
        }
    }
}

impl From<String> for FieldValue {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<&str> for FieldValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<&String> for FieldValue {
    fn from(value: &String) -> Self {
        Self::Text(value.clone())
    }
}

impl From<Uuid> for FieldValue {
    fn from(value: Uuid) -> Self {
        Self::Text(value.to_string())
    }
}

impl<T: Into<FieldValue>> From<Option<T>> for FieldValue {
    fn from(value: Option<T>) -> Self {
        value.map_or(Self::Null, Into::into)
    }
}

macro_rules! field_value_from_display {
    ($($ty:ty),* $(,)?) => {
        $(
            impl From<$ty> for FieldValue {
                fn from(value: $ty) -> Self {
                    Self::Text(value.to_string())
                }
            }
        )*
    };
}

field_value_from_display!(bool, char, i8, i16, i32, i64, i128, isize, u8, u16, u32, u64, u128, usize);

// ============================================================================
// FIELD MAP
// ============================================================================

/// Field name to value mapping, always iterated in field-name order.
///
/// Used both for the values a scope extractor pulls out of an object and for
/// the filter a caller passes to `condition`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FieldMap(BTreeMap<String, FieldValue>);

impl FieldMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert.
    pub fn with(mut self, field: impl Into<String>, value: impl Into<FieldValue>) -> Self {
        self.insert(field, value);
        self
    }

    /// Insert a field, returning the previous value if any.
    pub fn insert(
        &mut self,
        field: impl Into<String>,
        value: impl Into<FieldValue>,
    ) -> Option<FieldValue> {
        self.0.insert(field.into(), value.into())
    }

    pub fn get(&self, field: &str) -> Option<&FieldValue> {
        self.0.get(field)
    }

    pub fn contains(&self, field: &str) -> bool {
        self.0.contains_key(field)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Field names in sorted order.
    pub fn fields(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    pub fn iter(&self) -> btree_map::Iter<'_, String, FieldValue> {
        self.0.iter()
    }
}

impl<K: Into<String>, V: Into<FieldValue>> FromIterator<(K, V)> for FieldMap {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(
            iter.into_iter()
                .map(|(field, value)| (field.into(), value.into()))
                .collect(),
        )
    }
}

impl IntoIterator for FieldMap {
    type Item = (String, FieldValue);
    type IntoIter = btree_map::IntoIter<String, FieldValue>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

impl<'a> IntoIterator for &'a FieldMap {
    type Item = (&'a String, &'a FieldValue);
    type IntoIter = btree_map::Iter<'a, String, FieldValue>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

// ============================================================================
// DEPENDENCY ID
// ============================================================================

/// Canonical identifier for something cache entries can depend on.
///
/// The payload is kept sorted by field name, so two identifiers built from
/// the same logical condition are equal regardless of construction order.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DependencyId {
    namespace: String,
    payload: Vec<(String, FieldValue)>,
}

impl DependencyId {
    /// Build an identifier from raw parts. The payload is sorted by field
    /// name; a field given twice keeps its last value.
    pub fn new<I, K, V>(namespace: impl Into<String>, payload: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<FieldValue>,
    {
        let fields: FieldMap = payload.into_iter().collect();
        Self {
            namespace: namespace.into(),
            payload: fields.into_iter().collect(),
        }
    }

    /// "This cache entry used this specific row/object."
    pub fn entity(kind: impl Into<String>, id: impl fmt::Display) -> Self {
        Self {
            namespace: ENTITY_NAMESPACE.to_string(),
            payload: vec![(kind.into(), FieldValue::Text(id.to_string()))],
        }
    }

    /// Entity dependency from a (possibly composite) primary key.
    ///
    /// A single-column key stringifies its only value; a composite key
    /// renders as `(v1, v2, ...)`.
    pub fn primary_key(kind: impl Into<String>, identity: &[FieldValue]) -> Self {
        match identity {
            [single] => Self::entity(kind, single),
            columns => {
                let rendered: Vec<String> = columns.iter().map(ToString::to_string).collect();
                Self::entity(kind, format!("({})", rendered.join(", ")))
            }
        }
    }

    /// A named signal, invalidated explicitly by whoever owns the name.
    pub fn tag(name: impl Into<String>) -> Self {
        Self::namespaced_tag(TAG_NAMESPACE, name)
    }

    /// A named signal under a caller-chosen namespace.
    pub fn namespaced_tag(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            payload: vec![(TAG_FIELD.to_string(), FieldValue::Text(name.into()))],
        }
    }

    /// "This cache entry assumes the filter `fields` over scope `scope_name`."
    pub fn scope(scope_name: &str, fields: &FieldMap) -> Self {
        Self {
            namespace: scope_namespace(scope_name),
            payload: fields
                .iter()
                .map(|(field, value)| (field.clone(), value.clone()))
                .collect(),
        }
    }

    /// The scope-wide identifier with an empty payload. It is part of every
    /// scope invalidation batch and stands in for conditions that could not
    /// be expressed precisely.
    pub fn scope_catch_all(scope_name: &str) -> Self {
        Self {
            namespace: scope_namespace(scope_name),
            payload: Vec::new(),
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn payload(&self) -> &[(String, FieldValue)] {
        &self.payload
    }

    /// Name of the scope this identifier belongs to, if it is a scope id.
    pub fn scope_name(&self) -> Option<&str> {
        self.namespace.strip_prefix(SCOPE_NAMESPACE_PREFIX)
    }

    pub fn is_entity(&self) -> bool {
        self.namespace == ENTITY_NAMESPACE
    }

    /// Deterministic, collision-free string encoding.
    pub fn canonical_key(&self) -> String {
        let mut out = String::with_capacity(
            self.namespace.len()
                + self
                    .payload
                    .iter()
                    .map(|(field, value)| field.len() + value.as_text().map_or(1, str::len) + 12)
                    .sum::<usize>()
                + 4,
        );
        push_component(&mut out, &self.namespace);
        for (field, value) in &self.payload {
            out.push('|');
            push_component(&mut out, field);
            out.push('=');
            match value {
                FieldValue::Null => out.push(NULL_MARKER),
                FieldValue::Text(text) => push_component(&mut out, text),
            }
        }
        out
    }

    /// Parse a string produced by [`canonical_key`](Self::canonical_key).
    pub fn from_canonical_key(encoded: &str) -> BackendResult<Self> {
        let corrupt = |reason: &str| BackendError::Corrupt {
            record: encoded.to_string(),
            reason: reason.to_string(),
        };

        let mut rest = encoded;
        let namespace = take_component(&mut rest).ok_or_else(|| corrupt("bad namespace"))?;

        let mut payload = Vec::new();
        while !rest.is_empty() {
            rest = rest
                .strip_prefix('|')
                .ok_or_else(|| corrupt("expected field separator"))?;
            let field = take_component(&mut rest).ok_or_else(|| corrupt("bad field name"))?;
            rest = rest
                .strip_prefix('=')
                .ok_or_else(|| corrupt("expected value separator"))?;
            let value = if let Some(after) = rest.strip_prefix(NULL_MARKER) {
                rest = after;
                FieldValue::Null
            } else {
                FieldValue::Text(take_component(&mut rest).ok_or_else(|| corrupt("bad value"))?)
            };
            payload.push((field, value));
        }

        if payload.windows(2).any(|pair| pair[0].0 >= pair[1].0) {
            return Err(corrupt("payload is not in canonical order"));
        }

        Ok(Self { namespace, payload })
    }
}

impl fmt::Display for DependencyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}(", self.namespace)?;
        for (i, (field, value)) in self.payload.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{}={}", field, value)?;
        }
        f.write_str(")")
    }
}

fn scope_namespace(scope_name: &str) -> String {
    format!("{}{}", SCOPE_NAMESPACE_PREFIX, scope_name)
}

fn push_component(out: &mut String, component: &str) {
    out.push_str(&component.len().to_string());
    out.push(':');
    out.push_str(component);
}

/// Read one `<len>:<bytes>` component off the front of `rest`.
fn take_component(rest: &mut &str) -> Option<String> {
    let colon = rest.find(':')?;
    let digits = &rest[..colon];
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let len: usize = digits.parse().ok()?;
    let start = colon + 1;
    let end = start.checked_add(len)?;
    let component = rest.get(start..end)?.to_string();
    *rest = &rest[end..];
    Some(component)
}

// =============================================================================
// TESTS
// =============================================================================
