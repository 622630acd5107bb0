//! Session attribute bits.

use serde::{Deserialize, Serialize};
use std::ops::BitOr;

/// Session attribute bitset.
///
/// Attributes are monotone: bits are set at creation or by the one
/// successful `setup_attributes` call, and never cleared.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionAttributes(u32);

impl SessionAttributes {
    pub const NONE: SessionAttributes = SessionAttributes(0);
    /// This is the root (startup) session.
    pub const IS_ROOT: SessionAttributes = SessionAttributes(0x0001);
    /// The session has access to the graphics console.
    pub const HAS_GRAPHIC_ACCESS: SessionAttributes = SessionAttributes(0x0010);
    /// The session has an attached terminal.
    pub const HAS_TTY: SessionAttributes = SessionAttributes(0x0020);
    /// The session belongs to a remote login.
    pub const IS_REMOTE: SessionAttributes = SessionAttributes(0x1000);
    /// `setup_attributes` has run (set implicitly; further setup fails).
    pub const WAS_INITIALIZED: SessionAttributes = SessionAttributes(0x8000);

    /// The bits a session originator may set.
    pub const SETTABLE: SessionAttributes = SessionAttributes(0x0010 | 0x0020 | 0x1000);

    pub fn contains(&self, other: SessionAttributes) -> bool {
        self.0 & other.0 == other.0
    }

    /// Whether any bit outside `mask` is set.
    pub fn outside(&self, mask: SessionAttributes) -> bool {
        self.0 & !mask.0 != 0
    }

    pub fn bits(&self) -> u32 {
        self.0
    }

    pub fn from_bits(bits: u32) -> Self {
        SessionAttributes(bits)
    }
}

impl BitOr for SessionAttributes {
    type Output = SessionAttributes;

    fn bitor(self, rhs: SessionAttributes) -> SessionAttributes {
        SessionAttributes(self.0 | rhs.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_contains() {
        let attrs = SessionAttributes::IS_ROOT | SessionAttributes::WAS_INITIALIZED;
        assert!(attrs.contains(SessionAttributes::IS_ROOT));
        assert!(attrs.contains(SessionAttributes::WAS_INITIALIZED));
        assert!(!attrs.contains(SessionAttributes::HAS_TTY));
    }

    #[test]
    fn test_outside_settable_mask() {
        assert!(!SessionAttributes::HAS_TTY.outside(SessionAttributes::SETTABLE));
        assert!(SessionAttributes::IS_ROOT.outside(SessionAttributes::SETTABLE));
        assert!(
            (SessionAttributes::HAS_TTY | SessionAttributes::IS_ROOT)
                .outside(SessionAttributes::SETTABLE)
        );
    }
}
