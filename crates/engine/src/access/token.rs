//! Parsing of authorization sets
//!
//! An authorization entry reads `<tenant>:<base64 key>`. The tenant is a
//! bare UUID or a global id, the base64 encoding of `Tenant:<uuid>`.

use base64::engine::general_purpose::{STANDARD, STANDARD_NO_PAD};
use base64::Engine as _;
use uuid::Uuid;

use crate::crypto::{digests, CapabilityKey, DigestAlgorithm};
use crate::model::TenantId;

const TENANT_KIND: &str = "Tenant";

#[derive(Debug, thiserror::Error)]
pub enum TokenError {
    #[error("malformed token: {0}")]
    MalformedToken(String),
}

/// One usable entry of an authorization set
#[derive(Debug, Clone)]
pub struct ResolvedToken {
    pub tenant: TenantId,
    pub key: CapabilityKey,
    /// Key digests, newest algorithm first
    pub digests: Vec<String>,
}

#[derive(Debug, Clone, Copy)]
pub struct TokenResolver<'a> {
    algorithms: &'a [DigestAlgorithm],
}

impl<'a> TokenResolver<'a> {
    pub fn new(algorithms: &'a [DigestAlgorithm]) -> Self {
        Self { algorithms }
    }

    pub fn resolve_one(&self, entry: &str) -> Result<ResolvedToken, TokenError> {
        let (tenant, key) = entry
            .split_once(':')
            .ok_or_else(|| TokenError::MalformedToken("missing separator".to_string()))?;
        let tenant = parse_tenant(tenant)?;
        let key = CapabilityKey::from_base64(key)
            .map_err(|e| TokenError::MalformedToken(e.to_string()))?;
        let digests = digests(self.algorithms, key.bytes());
        Ok(ResolvedToken {
            tenant,
            key,
            digests,
        })
    }

    /// Resolve every entry, skipping malformed ones
    ///
    /// The result keeps the order of the input.
    pub fn resolve<I, S>(&self, entries: I) -> Vec<ResolvedToken>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        entries
            .into_iter()
            .enumerate()
            .filter_map(|(index, entry)| match self.resolve_one(entry.as_ref()) {
                Ok(token) => Some(token),
                Err(err) => {
                    tracing::debug!("skipping authorization entry {}: {}", index, err);
                    None
                }
            })
            .collect()
    }
}

fn parse_tenant(raw: &str) -> Result<TenantId, TokenError> {
    if let Ok(id) = Uuid::parse_str(raw) {
        return Ok(id.into());
    }
    let decoded = STANDARD
        .decode(raw)
        .or_else(|_| STANDARD_NO_PAD.decode(raw))
        .map_err(|_| TokenError::MalformedToken("tenant is neither uuid nor global id".into()))?;
    let decoded = String::from_utf8(decoded)
        .map_err(|_| TokenError::MalformedToken("global id is not utf-8".into()))?;
    match decoded.split_once(':') {
        Some((TENANT_KIND, id)) => Uuid::parse_str(id)
            .map(TenantId::from)
            .map_err(|e| TokenError::MalformedToken(e.to_string())),
        Some((kind, _)) => Err(TokenError::MalformedToken(format!(
            "global id of kind {} is not a tenant",
            kind
        ))),
        None => Err(TokenError::MalformedToken("global id without kind".into())),
    }
}

/// The global id form of a tenant id
pub fn tenant_global_id(tenant: TenantId) -> String {
    STANDARD.encode(format!("{}:{}", TENANT_KIND, tenant))
}

/// Format an authorization entry for `tenant` and `key`
pub fn authorization_entry(tenant: TenantId, key: &CapabilityKey) -> String {
    format!("{}:{}", tenant, key.to_base64())
}
