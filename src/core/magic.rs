//! Versioned magic values for on-disk and on-wire structures.
//!
//! Every persistent or transmitted structure starts with an 8-byte magic.
//! Old envelope versions are recognized so they can be rejected with a
//! distinct "retired" error instead of a generic parse failure.

use crate::core::EnvelopeError;

/// An 8-byte format identifier with a human-readable name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Magic {
    /// Raw magic bytes as they appear on disk/wire.
    pub bytes: [u8; 8],
    /// Name used in error messages, e.g. `"CARVEv5"`.
    pub name: &'static str,
}

impl Magic {
    /// The error to return when this retired version is encountered.
    pub fn too_old(&self) -> EnvelopeError {
        EnvelopeError::Retired { version: self.name }
    }
}

/// Retired envelope format, first revision.
pub const MAGIC_ENV_V1: Magic = Magic { bytes: *b"CARVE\x00\x00\x01", name: "CARVEv1" };
/// Retired envelope format, second revision.
pub const MAGIC_ENV_V2: Magic = Magic { bytes: *b"CARVE\x00\x00\x02", name: "CARVEv2" };
/// Retired envelope format, third revision.
pub const MAGIC_ENV_V3: Magic = Magic { bytes: *b"CARVE\x00\x00\x03", name: "CARVEv3" };
/// Retired envelope format, fourth revision.
pub const MAGIC_ENV_V4: Magic = Magic { bytes: *b"CARVE\x00\x00\x04", name: "CARVEv4" };
/// Current envelope format.
pub const MAGIC_ENV_V5: Magic = Magic { bytes: *b"CARVE\x00\x00\x05", name: "CARVEv5" };

/// Current plaintext packet metadata format.
pub const MAGIC_PKT_V3: Magic = Magic { bytes: *b"CARVP\x00\x00\x03", name: "CARVPv3" };

/// Current synchronization-protocol link frame format.
pub const MAGIC_LINK_V1: Magic = Magic { bytes: *b"CARVS\x00\x00\x01", name: "CARVSv1" };

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn magics_are_distinct() {
        let all = [
            MAGIC_ENV_V1,
            MAGIC_ENV_V2,
            MAGIC_ENV_V3,
            MAGIC_ENV_V4,
            MAGIC_ENV_V5,
            MAGIC_PKT_V3,
            MAGIC_LINK_V1,
        ];
        for (i, a) in all.iter().enumerate() {
            for b in &all[i + 1..] {
                assert_ne!(a.bytes, b.bytes);
            }
        }
    }

    #[test]
    fn retired_error_names_version() {
        let err = MAGIC_ENV_V2.too_old();
        assert!(err.to_string().contains("CARVEv2"));
    }
}
