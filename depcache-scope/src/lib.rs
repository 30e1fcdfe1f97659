//! depcache Scope - Condition Dependencies
//!
//! Lets cached query results depend on the filter they were computed with,
//! not only on the rows they returned. A result filtered by
//! `category = "rust"` stays valid while no article enters or leaves that
//! filter; a [`Scope`] turns each object change into the set of condition
//! ids it could affect.
//!
//! Batches grow as `2^k` in the number of described fields, so scopes
//! should describe only the fields conditions actually filter on.

pub mod registry;
pub mod scope;
pub mod subsets;

pub use registry::ScopeRegistry;
pub use scope::{DescribedScope, Scope, ScopeDeclaration, RECOMMENDED_MAX_FIELDS};
pub use subsets::{relevant_subsets, subset_count, MAX_DESCRIBED_FIELDS};
