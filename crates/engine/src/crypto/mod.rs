//! Cryptographic glue for capabilities
//!
//! - **Sealing**: ChaCha20-Poly1305 with a per-capability random nonce and the
//!   owning tenant bound as associated data ([`CapabilityKey`])
//! - **Lookup**: digests of the symmetric key under a rotating list of
//!   algorithms ([`DigestAlgorithm`])

mod digest;
mod key;

pub use digest::{digests, DigestAlgorithm};
pub use key::{CapabilityKey, KeyError, KEY_SIZE, NONCE_SIZE};
