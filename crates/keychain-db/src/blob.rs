//! The encrypted container image.
//!
//! A blob is the persistent form of a keychain: a cleartext header (name,
//! signature, derivation salt, key check value, parameters) plus the sealed
//! payload carrying the ACL. The daemon treats blob bytes as opaque for
//! storage purposes; only this module knows the envelope.

use crate::{DbError, DbParameters, DbResult};
use keychain_crypto::{
    open, seal, BlobSignature, MasterSecrets, SealedPayload, CHECK_VALUE_SIZE, SALT_SIZE,
};
use serde::{Deserialize, Serialize};

/// Blob envelope format version.
const BLOB_FORMAT_VERSION: u32 = 1;

/// One access-control entry: a subject and the operations it may perform.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AclEntry {
    pub uid: u32,
    pub operations: Vec<String>,
}

impl AclEntry {
    pub fn allows(&self, uid: u32, operation: &str) -> bool {
        self.uid == uid && self.operations.iter().any(|op| op == operation)
    }
}

/// The protected contents of a container: what the sealed payload decodes to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DbPlain {
    pub params: DbParameters,
    pub acl: Vec<AclEntry>,
}

impl DbPlain {
    /// Whether the ACL grants `operation` to `uid`. Root passes always.
    pub fn acl_allows(&self, uid: u32, operation: &str) -> bool {
        uid == 0 || self.acl.iter().any(|entry| entry.allows(uid, operation))
    }
}

/// The encoded container image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DbBlob {
    format: u32,
    pub name: String,
    pub signature: BlobSignature,
    pub salt: [u8; SALT_SIZE],
    pub check: [u8; CHECK_VALUE_SIZE],
    pub params: DbParameters,
    payload: SealedPayload,
}

impl DbBlob {
    /// Seal `plain` under `secrets` into a fresh blob image.
    pub fn seal(
        name: &str,
        signature: BlobSignature,
        salt: [u8; SALT_SIZE],
        secrets: &MasterSecrets,
        plain: &DbPlain,
    ) -> DbResult<Self> {
        let cleartext = serde_json::to_vec(plain)
            .map_err(|e| DbError::MalformedBlob(e.to_string()))?;
        let payload = seal(secrets, &cleartext)?;
        Ok(Self {
            format: BLOB_FORMAT_VERSION,
            name: name.to_string(),
            signature,
            salt,
            check: secrets.check_value(),
            params: plain.params,
            payload,
        })
    }

    /// Open the sealed payload with established secrets.
    pub fn open(&self, secrets: &MasterSecrets) -> DbResult<DbPlain> {
        if secrets.check_value() != self.check {
            return Err(DbError::InvalidPassphrase);
        }
        let cleartext = open(secrets, &self.payload)?;
        serde_json::from_slice(&cleartext).map_err(|e| DbError::MalformedBlob(e.to_string()))
    }

    /// Cheap passphrase validation against the key check value, without
    /// touching the payload.
    pub fn validates(&self, passphrase: &[u8]) -> bool {
        MasterSecrets::derive(passphrase, &self.salt).check_value() == self.check
    }

    /// Serialize the blob to its opaque storage form.
    pub fn to_bytes(&self) -> DbResult<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| DbError::MalformedBlob(e.to_string()))
    }

    /// Parse a blob from its opaque storage form.
    pub fn from_bytes(bytes: &[u8]) -> DbResult<Self> {
        let blob: DbBlob =
            serde_json::from_slice(bytes).map_err(|e| DbError::MalformedBlob(e.to_string()))?;
        if blob.format != BLOB_FORMAT_VERSION {
            return Err(DbError::MalformedBlob(format!(
                "unsupported blob format {}",
                blob.format
            )));
        }
        Ok(blob)
    }
}
