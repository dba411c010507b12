//! Decrypted capability payloads
//!
//! A [`Claim`] is the JSON object sealed inside a capability. Its `kind`
//! decides which handler reads it; every kind has its own typed body. Kinds
//! this build does not know deserialize to [`Claim::Unknown`], which never
//! applies during evaluation and is refused when a capability is issued.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::model::{DeleteRecursive, ResourceId, Tag, TenantId};

use super::predicate::{FieldMatch, Predicate};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ClaimError {
    #[error("malformed claim: {0}")]
    Malformed(String),
    #[error("unknown claim kind")]
    UnknownKind,
    #[error("invalid claim: {0}")]
    Invalid(String),
}

/// Filters shared by most claim kinds
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ResourceFilter {
    /// Tag prefixes of which at least one must be present
    pub include_tags: Vec<String>,
    /// Tag prefixes of which none may be present
    pub exclude_tags: Vec<String>,
    pub include_types: Vec<String>,
    pub exclude_types: Vec<String>,
    /// Allowed states, empty means no state restriction
    pub states: Vec<String>,
}

impl ResourceFilter {
    /// The filter as a predicate
    ///
    /// `hidden_states` are excluded unless the filter lists states itself.
    pub fn predicate(&self, hidden_states: &[String]) -> Predicate {
        let mut parts = Vec::new();
        if !self.include_types.is_empty() {
            parts.push(Predicate::Match(FieldMatch::Types(
                self.include_types.iter().cloned().collect(),
            )));
        }
        if !self.exclude_types.is_empty() {
            parts.push(
                Predicate::Match(FieldMatch::Types(
                    self.exclude_types.iter().cloned().collect(),
                ))
                .negate(),
            );
        }
        if !self.include_tags.is_empty() {
            parts.push(Predicate::Match(FieldMatch::TagPrefix(
                self.include_tags.iter().cloned().collect(),
            )));
        }
        if !self.exclude_tags.is_empty() {
            parts.push(
                Predicate::Match(FieldMatch::TagPrefix(
                    self.exclude_tags.iter().cloned().collect(),
                ))
                .negate(),
            );
        }
        if !self.states.is_empty() {
            parts.push(Predicate::Match(FieldMatch::States(
                self.states.iter().cloned().collect(),
            )));
        } else if !hidden_states.is_empty() {
            parts.push(
                Predicate::Match(FieldMatch::States(hidden_states.iter().cloned().collect()))
                    .negate(),
            );
        }
        Predicate::all(parts)
    }
}

/// An edge attached to every resource written under the claim
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InjectedReference {
    /// Resource id, or content hash within the written resource's tenant
    pub target: String,
    pub group: String,
    #[serde(default)]
    pub extra: String,
    #[serde(default)]
    pub delete_recursive: Option<DeleteRecursive>,
}

/// Side data every write under the claim must carry
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Injection {
    pub injected_tags: Vec<String>,
    pub injected_references: Vec<InjectedReference>,
    /// Content hashes (or ids) of keys the resource must reference in its
    ///  `key` group
    pub required_keys: Vec<String>,
}

impl Injection {
    pub fn is_empty(&self) -> bool {
        self.injected_tags.is_empty()
            && self.injected_references.is_empty()
            && self.required_keys.is_empty()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ViewClaim {
    #[serde(flatten)]
    pub filter: ResourceFilter,
    /// One-shot: the capability stops matching once exercised
    pub fetch: bool,
    /// Exercising the capability locks the viewed resources
    pub freeze: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DeleteClaim {
    #[serde(flatten)]
    pub filter: ResourceFilter,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct UpdateClaim {
    #[serde(flatten)]
    pub filter: ResourceFilter,
    #[serde(flatten)]
    pub injection: Injection,
    /// Tag prefixes a write may set, `None` allows any tag
    pub allowed_tags: Option<Vec<String>>,
    /// Only tags and edges may change
    pub restricted: bool,
    pub max_upload_size: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CreateClaim {
    /// Applied to the resource being created
    #[serde(flatten)]
    pub filter: ResourceFilter,
    #[serde(flatten)]
    pub injection: Injection,
    pub allowed_tags: Option<Vec<String>>,
    pub max_upload_size: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PushClaim {
    #[serde(flatten)]
    pub filter: ResourceFilter,
    #[serde(flatten)]
    pub injection: Injection,
    pub allowed_tags: Option<Vec<String>>,
    pub max_upload_size: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ManageExclusions {
    pub tenants: BTreeSet<TenantId>,
    pub resources: BTreeSet<ResourceId>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ManageClaim {
    pub exclude: ManageExclusions,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AuthClaim {
    /// Who asked for the proof, shown back to the holder
    pub requester: String,
    pub challenge: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct InjectClaim {
    #[serde(flatten)]
    pub injection: Injection,
}

/// A single, pre-authorized update: which resources, and which tags the
///  update may set on them
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StoredUpdateClaim {
    pub resources: BTreeSet<ResourceId>,
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum Claim {
    View(ViewClaim),
    Delete(DeleteClaim),
    Update(UpdateClaim),
    Create(CreateClaim),
    Push(PushClaim),
    Manage(ManageClaim),
    Auth(AuthClaim),
    Inject(InjectClaim),
    StoredUpdate(StoredUpdateClaim),
    #[serde(other)]
    Unknown,
}

impl Claim {
    /// Parse a decrypted payload; unknown kinds parse to [`Claim::Unknown`]
    pub fn from_slice(raw: &[u8]) -> Result<Self, ClaimError> {
        serde_json::from_slice(raw).map_err(|e| ClaimError::Malformed(e.to_string()))
    }

    pub fn to_vec(&self) -> Result<Vec<u8>, ClaimError> {
        serde_json::to_vec(self).map_err(|e| ClaimError::Malformed(e.to_string()))
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Claim::View(_) => "view",
            Claim::Delete(_) => "delete",
            Claim::Update(_) => "update",
            Claim::Create(_) => "create",
            Claim::Push(_) => "push",
            Claim::Manage(_) => "manage",
            Claim::Auth(_) => "auth",
            Claim::Inject(_) => "inject",
            Claim::StoredUpdate(_) => "storedUpdate",
            Claim::Unknown => "unknown",
        }
    }

    pub fn injection(&self) -> Option<&Injection> {
        match self {
            Claim::Update(claim) => Some(&claim.injection),
            Claim::Create(claim) => Some(&claim.injection),
            Claim::Push(claim) => Some(&claim.injection),
            Claim::Inject(claim) => Some(&claim.injection),
            _ => None,
        }
    }

    /// Write-time validation, run before a capability is sealed
    ///
    /// `forced_group_empty` lists the edge groups that may not carry an
    /// explicit ALWAYS/NEVER policy.
    pub fn validate(&self, forced_group_empty: &[String]) -> Result<(), ClaimError> {
        if let Claim::Unknown = self {
            return Err(ClaimError::UnknownKind);
        }
        if let Some(injection) = self.injection() {
            for tag in &injection.injected_tags {
                Tag::parse(tag).map_err(|e| ClaimError::Invalid(e.to_string()))?;
            }
            for reference in &injection.injected_references {
                if reference.target.is_empty() || reference.group.is_empty() {
                    return Err(ClaimError::Invalid(
                        "injected reference needs a target and a group".to_string(),
                    ));
                }
                let forced = forced_group_empty.iter().any(|g| *g == reference.group);
                if forced
                    && reference
                        .delete_recursive
                        .map(|p| p != DeleteRecursive::GroupEmpty)
                        .unwrap_or(false)
                {
                    return Err(ClaimError::Invalid(format!(
                        "group {} only allows GROUP-EMPTY",
                        reference.group
                    )));
                }
            }
        }
        if let Claim::StoredUpdate(claim) = self {
            for tag in &claim.tags {
                Tag::parse(tag).map_err(|e| ClaimError::Invalid(e.to_string()))?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn forced() -> Vec<String> {
        vec!["key".to_string(), "transfer".to_string()]
    }

    #[test]
    fn test_parse_view_claim() {
        let claim = Claim::from_slice(
            br#"{"kind":"view","includeTypes":["PublicKey"],"fetch":true}"#,
        )
        .unwrap();
        match claim {
            Claim::View(view) => {
                assert_eq!(view.filter.include_types, vec!["PublicKey".to_string()]);
                assert!(view.fetch);
                assert!(!view.freeze);
            }
            other => panic!("unexpected claim {:?}", other),
        }
    }

    #[test]
    fn test_parse_update_with_injection() {
        let claim = Claim::from_slice(
            br#"{
                "kind": "update",
                "allowedTags": ["name="],
                "injectedTags": ["signed"],
                "injectedReferences": [{"target": "abc", "group": "signature", "deleteRecursive": "NEVER"}],
                "requiredKeys": ["keyhash"],
                "restricted": true
            }"#,
        )
        .unwrap();
        let Claim::Update(update) = claim else {
            panic!("expected update claim");
        };
        assert_eq!(update.allowed_tags, Some(vec!["name=".to_string()]));
        assert!(update.restricted);
        assert_eq!(update.injection.injected_tags, vec!["signed".to_string()]);
        assert_eq!(
            update.injection.injected_references[0].delete_recursive,
            Some(DeleteRecursive::Never)
        );
        assert_eq!(update.injection.required_keys, vec!["keyhash".to_string()]);
    }

    #[test]
    fn test_stored_update_kind_name() {
        let claim = Claim::StoredUpdate(StoredUpdateClaim::default());
        let raw = String::from_utf8(claim.to_vec().unwrap()).unwrap();
        assert!(raw.contains("\"kind\":\"storedUpdate\""));
        assert_eq!(claim.kind(), "storedUpdate");
    }

    #[test]
    fn test_unknown_kind() {
        let claim = Claim::from_slice(br#"{"kind":"teleport","where":"mars"}"#).unwrap();
        assert_eq!(claim, Claim::Unknown);
        assert_eq!(claim.validate(&forced()), Err(ClaimError::UnknownKind));
    }

    #[test]
    fn test_malformed_payload() {
        assert!(matches!(
            Claim::from_slice(b"not json"),
            Err(ClaimError::Malformed(_))
        ));
        assert!(matches!(
            Claim::from_slice(br#"{"includeTypes":[]}"#),
            Err(ClaimError::Malformed(_))
        ));
    }

    #[test]
    fn test_validate_forced_groups() {
        let claim = Claim::Inject(InjectClaim {
            injection: Injection {
                injected_references: vec![InjectedReference {
                    target: "k".to_string(),
                    group: "key".to_string(),
                    extra: String::new(),
                    delete_recursive: Some(DeleteRecursive::Always),
                }],
                ..Default::default()
            },
        });
        assert!(matches!(
            claim.validate(&forced()),
            Err(ClaimError::Invalid(_))
        ));

        let claim = Claim::Inject(InjectClaim {
            injection: Injection {
                injected_references: vec![InjectedReference {
                    target: "k".to_string(),
                    group: "key".to_string(),
                    extra: String::new(),
                    delete_recursive: None,
                }],
                ..Default::default()
            },
        });
        assert!(claim.validate(&forced()).is_ok());
    }

    #[test]
    fn test_filter_predicate_hides_states_by_default() {
        let hidden = vec!["draft".to_string()];
        let filter = ResourceFilter::default();
        assert_eq!(
            filter.predicate(&hidden),
            Predicate::Match(FieldMatch::States(["draft".to_string()].into())).negate()
        );

        let filter = ResourceFilter {
            states: vec!["draft".to_string()],
            ..Default::default()
        };
        assert_eq!(
            filter.predicate(&hidden),
            Predicate::Match(FieldMatch::States(["draft".to_string()].into()))
        );
        assert_eq!(ResourceFilter::default().predicate(&[]), Predicate::True);
    }
}
