use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::crypto::DigestAlgorithm;
use crate::model::{states, KEY_GROUP, TRANSFER_GROUP};

/// Engine configuration
///
/// Every field has a default, so an empty TOML document is a valid config.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Key digest algorithms, newest first
    #[serde(default = "default_digest_algorithms")]
    pub digest_algorithms: Vec<DigestAlgorithm>,
    /// Fixed byte overhead charged per stored edge
    #[serde(default = "default_edge_overhead")]
    pub edge_overhead: u64,
    /// Grace window between marking a resource for destruction and the sweep
    ///  being allowed to hard delete it
    #[serde(default = "default_destruction_grace_secs")]
    pub destruction_grace_secs: u64,
    /// States visible to anybody, without any capability
    #[serde(default = "default_public_states")]
    pub public_states: Vec<String>,
    /// States a view capability only reveals when it names them explicitly
    #[serde(default = "default_hidden_states")]
    pub hidden_states: Vec<String>,
    /// Edge groups whose delete policy is always GROUP-EMPTY
    #[serde(default = "default_forced_group_empty")]
    pub forced_group_empty: Vec<String>,
}

fn default_digest_algorithms() -> Vec<DigestAlgorithm> {
    vec![DigestAlgorithm::Sha512, DigestAlgorithm::Sha256]
}

fn default_edge_overhead() -> u64 {
    28
}

fn default_destruction_grace_secs() -> u64 {
    24 * 60 * 60
}

fn default_public_states() -> Vec<String> {
    vec![states::PUBLIC.to_string()]
}

fn default_hidden_states() -> Vec<String> {
    vec![states::DRAFT.to_string(), states::SENSITIVE.to_string()]
}

fn default_forced_group_empty() -> Vec<String> {
    vec![KEY_GROUP.to_string(), TRANSFER_GROUP.to_string()]
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            digest_algorithms: default_digest_algorithms(),
            edge_overhead: default_edge_overhead(),
            destruction_grace_secs: default_destruction_grace_secs(),
            public_states: default_public_states(),
            hidden_states: default_hidden_states(),
            forced_group_empty: default_forced_group_empty(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("toml error: {0}")]
    TomlDe(#[from] toml::de::Error),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

impl EngineConfig {
    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        let config: EngineConfig = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_toml_str(&raw)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.digest_algorithms.is_empty() {
            return Err(ConfigError::Invalid(
                "at least one digest algorithm is required".to_string(),
            ));
        }
        Ok(())
    }

    pub fn destruction_grace(&self) -> Duration {
        Duration::from_secs(self.destruction_grace_secs)
    }

    /// When something marked for destruction at `now` becomes due
    pub fn destruction_deadline(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        i64::try_from(self.destruction_grace_secs)
            .ok()
            .and_then(chrono::Duration::try_seconds)
            .and_then(|grace| now.checked_add_signed(grace))
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    /// The algorithm new digests are written with
    pub fn newest_digest(&self) -> DigestAlgorithm {
        self.digest_algorithms
            .first()
            .copied()
            .unwrap_or(DigestAlgorithm::Sha512)
    }

    pub fn is_forced_group_empty(&self, group: &str) -> bool {
        self.forced_group_empty.iter().any(|g| g == group)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_empty_document_uses_defaults() {
        let config = EngineConfig::from_toml_str("").unwrap();
        assert_eq!(config, EngineConfig::default());
        assert_eq!(config.newest_digest(), DigestAlgorithm::Sha512);
        assert!(config.is_forced_group_empty("key"));
        assert!(config.is_forced_group_empty("transfer"));
        assert!(!config.is_forced_group_empty("signature"));
    }

    #[test]
    fn test_overrides() {
        let config = EngineConfig::from_toml_str(
            r#"
            digest_algorithms = ["blake3", "sha512"]
            edge_overhead = 10
            destruction_grace_secs = 60
            "#,
        )
        .unwrap();
        assert_eq!(config.newest_digest(), DigestAlgorithm::Blake3);
        assert_eq!(config.edge_overhead, 10);
        assert_eq!(config.destruction_grace(), Duration::from_secs(60));
        assert_eq!(config.public_states, vec!["public".to_string()]);
        let now = Utc::now();
        assert_eq!(
            config.destruction_deadline(now),
            now + chrono::Duration::seconds(60)
        );
    }

    #[test]
    fn test_rejects_empty_digest_list() {
        let result = EngineConfig::from_toml_str("digest_algorithms = []");
        assert!(matches!(result, Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("engine.toml");
        std::fs::write(&path, "hidden_states = [\"draft\"]\n").unwrap();
        let config = EngineConfig::load(&path).unwrap();
        assert_eq!(config.hidden_states, vec!["draft".to_string()]);

        let missing = EngineConfig::load(&dir.path().join("missing.toml"));
        assert!(matches!(missing, Err(ConfigError::Io(_))));
    }
}
