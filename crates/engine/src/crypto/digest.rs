//! Key digests
//!
//! Capabilities are looked up by a digest of the presented key. The
//! configured algorithm list is ordered newest first; digests produced by an
//! older algorithm still match, and get rewritten to the newest one.

use std::fmt;
use std::str::FromStr;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256, Sha512};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DigestAlgorithm {
    Sha512,
    Sha256,
    Blake3,
}

impl DigestAlgorithm {
    pub fn name(&self) -> &'static str {
        match self {
            DigestAlgorithm::Sha512 => "sha512",
            DigestAlgorithm::Sha256 => "sha256",
            DigestAlgorithm::Blake3 => "blake3",
        }
    }

    /// `<algorithm>:<base64 digest>` of `data`
    ///
    /// The prefix keeps equally sized digests of different algorithms apart.
    pub fn digest(&self, data: &[u8]) -> String {
        let raw = match self {
            DigestAlgorithm::Sha512 => Sha512::digest(data).to_vec(),
            DigestAlgorithm::Sha256 => Sha256::digest(data).to_vec(),
            DigestAlgorithm::Blake3 => blake3::hash(data).as_bytes().to_vec(),
        };
        format!("{}:{}", self.name(), STANDARD.encode(raw))
    }
}

impl fmt::Display for DigestAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for DigestAlgorithm {
    type Err = anyhow::Error;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sha512" => Ok(DigestAlgorithm::Sha512),
            "sha256" => Ok(DigestAlgorithm::Sha256),
            "blake3" => Ok(DigestAlgorithm::Blake3),
            other => Err(anyhow::anyhow!("unknown digest algorithm: {}", other)),
        }
    }
}

/// Digests of `data` under every algorithm, in the given order
pub fn digests(algorithms: &[DigestAlgorithm], data: &[u8]) -> Vec<String> {
    algorithms.iter().map(|alg| alg.digest(data)).collect()
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_digests_are_prefixed_and_distinct() {
        let data = [7u8; 32];
        let all = digests(
            &[
                DigestAlgorithm::Sha512,
                DigestAlgorithm::Sha256,
                DigestAlgorithm::Blake3,
            ],
            &data,
        );
        assert!(all[0].starts_with("sha512:"));
        assert!(all[1].starts_with("sha256:"));
        assert!(all[2].starts_with("blake3:"));
        assert_ne!(all[1], all[2]);
        assert_eq!(all[0], DigestAlgorithm::Sha512.digest(&data));
    }

    #[test]
    fn test_parse_algorithm() {
        assert_eq!(
            "blake3".parse::<DigestAlgorithm>().unwrap(),
            DigestAlgorithm::Blake3
        );
        assert!("md5".parse::<DigestAlgorithm>().is_err());
    }
}
