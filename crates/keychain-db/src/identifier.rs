//! Container identifiers and parameters.

use keychain_crypto::BlobSignature;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifies one container lineage: the external name plus the signature
/// minted when the container was first created.
///
/// Ordered lexicographically on the name, then the signature, so identifiers
/// can key ordered maps.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DbIdentifier {
    name: String,
    signature: BlobSignature,
}

impl DbIdentifier {
    pub fn new(name: impl Into<String>, signature: BlobSignature) -> Self {
        Self {
            name: name.into(),
            signature,
        }
    }

    /// The container's external name (typically a file path).
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn signature(&self) -> &BlobSignature {
        &self.signature
    }
}

impl fmt::Display for DbIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)
    }
}

/// User-visible container behavior knobs, stored inside the blob.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DbParameters {
    /// Idle interval before the container relocks, in seconds.
    pub idle_timeout_secs: u64,
    /// Whether the container locks when the system sleeps.
    pub lock_on_sleep: bool,
}

impl Default for DbParameters {
    fn default() -> Self {
        Self {
            idle_timeout_secs: 600,
            lock_on_sleep: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ordering_name_then_signature() {
        let sig_a = BlobSignature([1u8; 20]);
        let sig_b = BlobSignature([2u8; 20]);

        let a = DbIdentifier::new("alpha", sig_b);
        let b = DbIdentifier::new("beta", sig_a);
        assert!(a < b);

        let c = DbIdentifier::new("alpha", sig_a);
        assert!(c < a);
    }

    #[test]
    fn test_equality_requires_both_fields() {
        let sig = BlobSignature([7u8; 20]);
        let a = DbIdentifier::new("kc", sig);
        let b = DbIdentifier::new("kc", sig);
        let c = DbIdentifier::new("kc", BlobSignature([8u8; 20]));
        assert_eq!(a, b);
        assert_ne!(a, c);
    }
}
