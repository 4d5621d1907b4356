//! Error types for the CARAVAN protocol.

use thiserror::Error;

/// Errors opening or sealing a packet envelope.
///
/// All of these are fatal for the single packet being processed, never
/// for the surrounding session.
#[derive(Debug, Error)]
pub enum EnvelopeError {
    /// The magic does not match any known envelope version.
    #[error("unknown magic number")]
    UnknownMagic,

    /// The magic belongs to a retired envelope version.
    #[error("envelope version {version} is retired")]
    Retired {
        /// Name of the retired version.
        version: &'static str,
    },

    /// The envelope is signed by a node that is not in our peer set.
    #[error("unknown sender {id}")]
    UnknownSender {
        /// Hex-encoded sender identifier.
        id: String,
    },

    /// The envelope is addressed to a different identity.
    #[error("invalid recipient")]
    InvalidRecipient,

    /// The to-be-signed structure does not verify under the sender's key.
    #[error("invalid signature")]
    InvalidSignature,

    /// An AEAD block (or the sealed size field) failed authentication.
    #[error("authentication failure")]
    Authentication,

    /// Packet metadata path exceeds the format limit.
    #[error("path too long: {len} bytes")]
    TooLongPath {
        /// Offending path length.
        len: usize,
    },

    /// Packet metadata carries an unknown type octet.
    #[error("unknown packet type {0}")]
    UnknownPacketType(u8),

    /// The byte stream ended before the structure was complete.
    #[error("unexpected end of data")]
    UnexpectedEnd,

    /// Underlying reader/writer failure.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors in the session handshake and transport ciphers.
#[derive(Debug, Error)]
pub enum HandshakeError {
    /// The Noise handshake failed.
    #[error("handshake failed: {0}")]
    Failed(String),

    /// The revealed static key does not belong to any known peer.
    #[error("unknown peer {id}")]
    UnknownPeer {
        /// Hex-encoded static public key of the caller.
        id: String,
    },

    /// Transport-cipher encryption failed.
    #[error("transport encryption failed")]
    SealFailed,

    /// Transport-cipher decryption failed (invalid tag or corrupted).
    #[error("transport decryption failed")]
    OpenFailed,
}

/// Errors decoding synchronization-protocol messages.
///
/// Any of these terminates the session: a peer that produced an
/// unparsable batch cannot be trusted to stay in sync.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Unknown message type octet.
    #[error("unknown message type {0}")]
    UnknownMessage(u8),

    /// A message body was cut short.
    #[error("message truncated: expected {expected} bytes, got {actual}")]
    Truncated {
        /// Minimum bytes required.
        expected: usize,
        /// Bytes remaining in the batch.
        actual: usize,
    },

    /// A declared length exceeds the batch limit.
    #[error("message oversized: {size} bytes exceeds {limit}")]
    Oversized {
        /// Declared size.
        size: usize,
        /// Permitted maximum.
        limit: usize,
    },
}

/// Errors on the framed wire transport.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Frame magic mismatch; no partial-trust fallback exists.
    #[error("bad link magic")]
    BadMagic,

    /// Declared frame payload exceeds the hard limit.
    #[error("frame too large: {0} bytes")]
    Oversized(u32),

    /// The rolling per-operation deadline expired.
    #[error("i/o deadline expired")]
    Timeout,

    /// The peer closed the connection.
    #[error("connection closed")]
    Disconnected,

    /// Underlying socket failure.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors in the on-disk spool.
#[derive(Debug, Error)]
pub enum SpoolError {
    /// Another session already holds this spool direction.
    #[error("spool directory already locked: {dir}")]
    AlreadyLocked {
        /// Directory whose lock could not be acquired.
        dir: String,
    },

    /// A fully received file does not hash to its advertised identity.
    #[error("checksum mismatch for {pkt}")]
    ChecksumMismatch {
        /// Hex-encoded content hash.
        pkt: String,
    },

    /// Underlying filesystem failure.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

/// Fatal-to-session errors surfaced by the session driver.
#[derive(Debug, Error)]
pub enum SessionError {
    /// Handshake or transport-cipher failure.
    #[error("handshake error: {0}")]
    Handshake(#[from] HandshakeError),

    /// Wire framing failure.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// Malformed message batch.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Spool failure preventing session work.
    #[error("spool error: {0}")]
    Spool(#[from] SpoolError),

    /// Underlying i/o failure.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

/// Top-level CARAVAN errors.
#[derive(Debug, Error)]
pub enum CaravanError {
    /// Envelope codec error.
    #[error("envelope error: {0}")]
    Envelope(#[from] EnvelopeError),

    /// Session error.
    #[error("session error: {0}")]
    Session(#[from] SessionError),

    /// Spool error.
    #[error("spool error: {0}")]
    Spool(#[from] SpoolError),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// I/O error.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}
