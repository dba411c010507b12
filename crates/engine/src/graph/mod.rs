//! Structural rules of the reference graph
//!
//! [`validate`] checks edges and tags before they are written;
//! [`cascade`] removes resources together with their dependents.

pub mod cascade;
pub mod validate;

pub use validate::{check_required_keys, edge_policy, parse_tags, resolve_edges, resolve_injected};
