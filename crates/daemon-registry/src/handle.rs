//! Opaque object handles.

use serde::{Deserialize, Serialize};
use std::fmt;

/// An opaque 64-bit identifier for a live daemon object.
///
/// Handles are unique for the lifetime of the process and are the only form
/// of object reference that crosses the IPC boundary. Zero is never issued.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Handle(u64);

impl Handle {
    /// Reconstruct a handle from its raw value (e.g. off the wire).
    pub fn from_raw(raw: u64) -> Self {
        Handle(raw)
    }

    /// The raw integer value.
    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:x}", self.0)
    }
}
