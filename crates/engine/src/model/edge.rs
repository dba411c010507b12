use std::fmt;

use serde::{Deserialize, Serialize};

use super::ids::ResourceId;

/// Group of edges pointing at the public keys that wrap a resource's key
pub const KEY_GROUP: &str = "key";
/// Group of edges carrying a pending transfer
pub const TRANSFER_GROUP: &str = "transfer";
/// Group of the edge from a pushed resource to its parent
pub const PUSH_GROUP: &str = "push";

/// What happens to an edge's source when its target is deleted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING-KEBAB-CASE")]
pub enum DeleteRecursive {
    /// Delete the source together with the target
    Always,
    /// Keep the source, only the edge goes away
    Never,
    /// Delete the source only if no other edge of the same group survives
    GroupEmpty,
}

impl DeleteRecursive {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeleteRecursive::Always => "ALWAYS",
            DeleteRecursive::Never => "NEVER",
            DeleteRecursive::GroupEmpty => "GROUP-EMPTY",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "ALWAYS" => Some(DeleteRecursive::Always),
            "NEVER" => Some(DeleteRecursive::Never),
            "GROUP-EMPTY" => Some(DeleteRecursive::GroupEmpty),
            _ => None,
        }
    }
}

impl fmt::Display for DeleteRecursive {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A directed, labeled reference from one resource to another.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Edge {
    pub source: ResourceId,
    pub target: ResourceId,
    pub group: String,
    /// Opaque payload, usually a wrapped key or a signature
    pub extra: String,
    pub delete_recursive: DeleteRecursive,
}

impl Edge {
    /// The uniqueness key of an edge
    pub fn key(&self) -> (ResourceId, ResourceId, &str) {
        (self.source, self.target, self.group.as_str())
    }
}

/// An edge as requested by a writer, before validation fills in defaults.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EdgeSpec {
    pub target: ResourceId,
    pub group: String,
    #[serde(default)]
    pub extra: String,
    #[serde(default)]
    pub delete_recursive: Option<DeleteRecursive>,
}

impl EdgeSpec {
    pub fn new(target: ResourceId, group: impl Into<String>) -> Self {
        Self {
            target,
            group: group.into(),
            extra: String::new(),
            delete_recursive: None,
        }
    }

    pub fn with_extra(mut self, extra: impl Into<String>) -> Self {
        self.extra = extra.into();
        self
    }

    pub fn with_policy(mut self, policy: DeleteRecursive) -> Self {
        self.delete_recursive = Some(policy);
        self
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_policy_wire_names() {
        let json = serde_json::to_string(&DeleteRecursive::GroupEmpty).unwrap();
        assert_eq!(json, "\"GROUP-EMPTY\"");
        let parsed: DeleteRecursive = serde_json::from_str("\"ALWAYS\"").unwrap();
        assert_eq!(parsed, DeleteRecursive::Always);
        assert_eq!(DeleteRecursive::parse("NEVER"), Some(DeleteRecursive::Never));
        assert_eq!(DeleteRecursive::parse("never"), None);
    }
}
