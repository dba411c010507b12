//! Resource tags.
//!
//! A tag is either a bare flag (`frozen`) or a `name=value` pair. A leading
//! `~` marks a tag whose value is ciphertext: it is indexed and matched like
//! any other tag, but never interpreted.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Tag set on resources locked as a side effect of a freezing capability
pub const FROZEN_TAG: &str = "frozen";
/// Tag set on resources that must never be updated again
pub const IMMUTABLE_TAG: &str = "immutable";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TagError {
    #[error("tag is empty")]
    Empty,
    #[error("tag has an empty name: {0}")]
    EmptyName(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Tag(String);

impl Tag {
    pub fn parse(raw: &str) -> Result<Self, TagError> {
        if raw.is_empty() || raw == "~" {
            return Err(TagError::Empty);
        }
        let tag = Self(raw.to_string());
        if tag.name().is_empty() {
            return Err(TagError::EmptyName(raw.to_string()));
        }
        Ok(tag)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether the value is ciphertext the engine cannot read
    pub fn is_encrypted(&self) -> bool {
        self.0.starts_with('~')
    }

    /// The tag name, without the encryption marker
    pub fn name(&self) -> &str {
        let raw = self.0.strip_prefix('~').unwrap_or(&self.0);
        raw.split_once('=').map(|(name, _)| name).unwrap_or(raw)
    }

    pub fn value(&self) -> Option<&str> {
        self.0.split_once('=').map(|(_, value)| value)
    }

    /// Prefix match used by tag filters, allow-lists and removals
    pub fn matches_prefix(&self, prefix: &str) -> bool {
        self.0.starts_with(prefix)
    }

    /// Whether an incremental removal entry targets this tag: either the
    ///  exact tag, or its bare name which removes every value of that name
    pub fn matches_removal(&self, entry: &str) -> bool {
        if self.0 == entry {
            return true;
        }
        if entry.contains('=') {
            return false;
        }
        // the encryption marker is part of the name here: `~key` and `key` differ
        match self.0.split_once('=') {
            Some((name, _)) => name == entry,
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl FromStr for Tag {
    type Err = TagError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for Tag {
    type Error = TagError;
    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<Tag> for String {
    fn from(tag: Tag) -> Self {
        tag.0
    }
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_parse_flag_and_pair() {
        let flag = Tag::parse("frozen").unwrap();
        assert_eq!(flag.name(), "frozen");
        assert_eq!(flag.value(), None);

        let pair = Tag::parse("name=report.pdf").unwrap();
        assert_eq!(pair.name(), "name");
        assert_eq!(pair.value(), Some("report.pdf"));
        assert!(!pair.is_encrypted());
    }

    #[test]
    fn test_encrypted_tag() {
        let tag = Tag::parse("~title=aGVsbG8=").unwrap();
        assert!(tag.is_encrypted());
        assert_eq!(tag.name(), "title");
        assert_eq!(tag.value(), Some("aGVsbG8="));
    }

    #[test]
    fn test_reject_empty() {
        assert_eq!(Tag::parse(""), Err(TagError::Empty));
        assert_eq!(Tag::parse("~"), Err(TagError::Empty));
        assert!(matches!(Tag::parse("=value"), Err(TagError::EmptyName(_))));
    }

    #[test]
    fn test_removal_by_name() {
        let tag = Tag::parse("state=open").unwrap();
        assert!(tag.matches_removal("state=open"));
        assert!(tag.matches_removal("state"));
        assert!(!tag.matches_removal("stat"));
        assert!(!tag.matches_removal("state=closed"));

        let secret = Tag::parse("~key=abc").unwrap();
        assert!(secret.matches_removal("~key"));
        assert!(!secret.matches_removal("key"));
    }
}
