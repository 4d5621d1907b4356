//! Protocol constants.
//!
//! These values are fixed by the wire and spool formats and MUST NOT be
//! changed without bumping the relevant magic version.

use std::time::Duration;

// =============================================================================
// CRYPTOGRAPHIC CONSTANTS
// =============================================================================

/// Poly1305 authentication tag size.
pub const AEAD_TAG_SIZE: usize = 16;

/// ChaCha20-Poly1305 (IETF) nonce size.
pub const AEAD_NONCE_SIZE: usize = 12;

/// X25519 public key size.
pub const PUBLIC_KEY_SIZE: usize = 32;

/// X25519 private key size.
pub const PRIVATE_KEY_SIZE: usize = 32;

/// Ed25519 signature size.
pub const SIGNATURE_SIZE: usize = 64;

/// BLAKE2b-256 hash output size; also the content hash size.
pub const HASH_SIZE: usize = 32;

/// Node identifier size (content-derived from the three public keys).
pub const NODE_ID_SIZE: usize = 32;

// =============================================================================
// ENVELOPE FORMAT
// =============================================================================

/// Envelope body block size; each block is independently authenticated.
pub const ENC_BLK_SIZE: usize = 128 * (1 << 10);

/// Maximum length of a packet metadata path.
pub const MAX_PATH_SIZE: usize = (1 << 8) - 1;

/// Fixed envelope header size: magic + nice + sender + recipient +
/// ephemeral public key + signature.
pub const ENVELOPE_HEAD_SIZE: usize =
    8 + 1 + NODE_ID_SIZE + NODE_ID_SIZE + PUBLIC_KEY_SIZE + SIGNATURE_SIZE;

/// Fixed packet metadata header size (magic + type + nice + path length),
/// excluding the variable path bytes.
pub const PKT_HEAD_SIZE: usize = 8 + 1 + 1 + 1;

/// KDF context for the envelope body key.
pub const ENVELOPE_KDF_CTX: &str = "caravan envelope v5";

/// KDF context for the envelope padding keystream key.
pub const ENVELOPE_PAD_KDF_CTX: &str = "caravan envelope v5 pad";

// =============================================================================
// SYNCHRONIZATION PROTOCOL
// =============================================================================

/// Maximum size of one SP payload batch (fits one Noise transport message
/// with room for its overhead).
pub const MAX_SP_SIZE: usize = (1 << 16) - 256;

/// Size of an SP message head (the type octet).
pub const SP_HEAD_OVERHEAD: usize = 1;

/// Hard limit on an incoming wire frame payload.
pub const MAX_FRAME_PAYLOAD: usize = 1 << 17;

/// Rolling per-operation socket deadline.
pub const DEFAULT_DEADLINE: Duration = Duration::from_secs(10);

/// Default keepalive interval; a Ping is sent when nothing has been
/// transmitted for this long.
pub const PING_TIMEOUT: Duration = Duration::from_secs(60);

/// Default online deadline: the session dies when both non-ping
/// directions are idle for this long.
pub const DEFAULT_ONLINE_DEADLINE: Duration = Duration::from_secs(10);

/// Sender idle poll interval when there is no work.
pub const SENDER_IDLE_SLEEP: Duration = Duration::from_millis(100);

/// Cadence of the deadline/rescan tickers.
pub const TICK_INTERVAL: Duration = Duration::from_secs(1);

/// Number of deferred-checksum worker tasks per session.
pub const CHECKER_WORKERS: usize = 2;

// =============================================================================
// SPOOL
// =============================================================================

/// Suffix of partially received files.
pub const PART_SUFFIX: &str = ".part";

/// Suffix of fully received but not yet checksummed files.
pub const NOCK_SUFFIX: &str = ".nock";

/// Suffix marking already-processed packets.
pub const SEEN_SUFFIX: &str = ".seen";

/// Length of a spool packet file name (hex of a 32-byte content hash).
pub const HEX_ENCODED_HASH_LEN: usize = 2 * HASH_SIZE;
