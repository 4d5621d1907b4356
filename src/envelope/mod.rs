//! Packet envelope codec.
//!
//! An envelope is the signed, encrypted wrapper around one logical packet,
//! addressed to exactly one recipient:
//!
//! ```text
//! +0    Magic (8)
//! +8    Niceness (1)
//! +9    Sender id (32)
//! +41   Recipient id (32)
//! +73   Ephemeral X25519 public key (32)
//! +105  Ed25519 signature over the to-be-signed structure (64)
//! +169  Sealed size field (8 + tag)
//! +193  Body blocks (128 KiB each + tag), then optional padding
//! ```
//!
//! The signature covers magic, niceness, sender, recipient, and the
//! ephemeral key, so an envelope cannot be replayed toward a different
//! recipient or at a different niceness. The body key is derived from a
//! Diffie-Hellman agreement between a fresh ephemeral key and the
//! recipient's static exchange key: forward secrecy per packet,
//! independent of any live session. Padding is keystream-only and is
//! never read back by the receiver.

use std::collections::HashMap;
use std::io::{Read, Write};

use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::{ChaCha20Poly1305, Nonce};
use ed25519_dalek::Signature;
use rand::rngs::OsRng;
use x25519_dalek::{EphemeralSecret, PublicKey};

use crate::core::{
    AEAD_NONCE_SIZE, AEAD_TAG_SIZE, ENC_BLK_SIZE, ENVELOPE_HEAD_SIZE, ENVELOPE_KDF_CTX,
    ENVELOPE_PAD_KDF_CTX, EnvelopeError, MAGIC_ENV_V1, MAGIC_ENV_V2, MAGIC_ENV_V3, MAGIC_ENV_V4,
    MAGIC_ENV_V5, MAGIC_PKT_V3, MAX_PATH_SIZE, NODE_ID_SIZE, PKT_HEAD_SIZE, PUBLIC_KEY_SIZE,
    SIGNATURE_SIZE,
};
use crate::crypto::{LocalIdentity, NodeId, Peer};

/// Size of the sealed size field: 8 bytes plus the authentication tag.
pub const SEALED_SIZE_LEN: usize = 8 + AEAD_TAG_SIZE;

/// Logical packet payload type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PktType {
    /// A file destined for the recipient's incoming area.
    File,
    /// A request for a file from the recipient.
    FileRequest,
    /// An execution request (compressed payload).
    Exec,
    /// An execution request with uncompressed payload.
    ExecUncompressed,
    /// A packet in transit to a further node.
    Transit,
}

impl PktType {
    fn to_u8(self) -> u8 {
        match self {
            PktType::File => 0,
            PktType::FileRequest => 1,
            PktType::Exec => 2,
            PktType::ExecUncompressed => 3,
            PktType::Transit => 4,
        }
    }

    fn from_u8(v: u8) -> Result<Self, EnvelopeError> {
        Ok(match v {
            0 => PktType::File,
            1 => PktType::FileRequest,
            2 => PktType::Exec,
            3 => PktType::ExecUncompressed,
            4 => PktType::Transit,
            other => return Err(EnvelopeError::UnknownPacketType(other)),
        })
    }
}

/// Plaintext packet metadata, sealed inside the envelope body ahead of
/// the payload. Created at send time, consumed at receive-side
/// processing; the synchronization protocol never inspects it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pkt {
    /// Payload type.
    pub typ: PktType,
    /// Niceness the packet was queued at.
    pub nice: u8,
    /// Destination path or opaque payload handle, at most 255 bytes.
    pub path: Vec<u8>,
}

impl Pkt {
    /// Build packet metadata, validating the path length.
    pub fn new(typ: PktType, nice: u8, path: &[u8]) -> Result<Self, EnvelopeError> {
        if path.len() > MAX_PATH_SIZE {
            return Err(EnvelopeError::TooLongPath { len: path.len() });
        }
        Ok(Self { typ, nice, path: path.to_vec() })
    }

    /// Encoded size of this metadata.
    pub fn wire_size(&self) -> usize {
        PKT_HEAD_SIZE + self.path.len()
    }

    /// Encode to the on-wire layout.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.wire_size());
        buf.extend_from_slice(&MAGIC_PKT_V3.bytes);
        buf.push(self.typ.to_u8());
        buf.push(self.nice);
        buf.push(self.path.len() as u8);
        buf.extend_from_slice(&self.path);
        buf
    }

    /// Decode from the on-wire layout, returning the metadata and the
    /// bytes consumed.
    pub fn decode(data: &[u8]) -> Result<(Self, usize), EnvelopeError> {
        if data.len() < PKT_HEAD_SIZE {
            return Err(EnvelopeError::UnexpectedEnd);
        }
        if data[..8] != MAGIC_PKT_V3.bytes {
            return Err(EnvelopeError::UnknownMagic);
        }
        let typ = PktType::from_u8(data[8])?;
        let nice = data[9];
        let path_len = data[10] as usize;
        if data.len() < PKT_HEAD_SIZE + path_len {
            return Err(EnvelopeError::UnexpectedEnd);
        }
        let path = data[PKT_HEAD_SIZE..PKT_HEAD_SIZE + path_len].to_vec();
        Ok((Self { typ, nice, path }, PKT_HEAD_SIZE + path_len))
    }
}

/// Fixed envelope header.
#[derive(Debug, Clone)]
pub struct EnvelopeHead {
    /// Format magic.
    pub magic: [u8; 8],
    /// Niceness, bound by the signature.
    pub nice: u8,
    /// Sender identity.
    pub sender: NodeId,
    /// Recipient identity.
    pub recipient: NodeId,
    /// Fresh ephemeral X25519 public key.
    pub exch_pub: [u8; PUBLIC_KEY_SIZE],
    /// Signature over the to-be-signed structure.
    pub sign: [u8; SIGNATURE_SIZE],
}

impl EnvelopeHead {
    /// Encode the header into its fixed layout.
    pub fn encode(&self) -> [u8; ENVELOPE_HEAD_SIZE] {
        let mut buf = [0u8; ENVELOPE_HEAD_SIZE];
        buf[..8].copy_from_slice(&self.magic);
        buf[8] = self.nice;
        buf[9..41].copy_from_slice(self.sender.as_bytes());
        buf[41..73].copy_from_slice(self.recipient.as_bytes());
        buf[73..105].copy_from_slice(&self.exch_pub);
        buf[105..169].copy_from_slice(&self.sign);
        buf
    }

    /// Decode a header from its fixed layout. Only layout, not validity,
    /// is checked here.
    pub fn decode(buf: &[u8; ENVELOPE_HEAD_SIZE]) -> Self {
        let mut magic = [0u8; 8];
        magic.copy_from_slice(&buf[..8]);
        let mut sender = [0u8; NODE_ID_SIZE];
        sender.copy_from_slice(&buf[9..41]);
        let mut recipient = [0u8; NODE_ID_SIZE];
        recipient.copy_from_slice(&buf[41..73]);
        let mut exch_pub = [0u8; PUBLIC_KEY_SIZE];
        exch_pub.copy_from_slice(&buf[73..105]);
        let mut sign = [0u8; SIGNATURE_SIZE];
        sign.copy_from_slice(&buf[105..169]);
        Self {
            magic,
            nice: buf[8],
            sender: NodeId::from_bytes(sender),
            recipient: NodeId::from_bytes(recipient),
            exch_pub,
            sign,
        }
    }
}

/// The to-be-signed structure binding the header fields together.
fn tbs_bytes(
    nice: u8,
    sender: &NodeId,
    recipient: &NodeId,
    exch_pub: &[u8; PUBLIC_KEY_SIZE],
) -> Vec<u8> {
    let mut buf = Vec::with_capacity(8 + 1 + 2 * NODE_ID_SIZE + PUBLIC_KEY_SIZE);
    buf.extend_from_slice(&MAGIC_ENV_V5.bytes);
    buf.push(nice);
    buf.extend_from_slice(sender.as_bytes());
    buf.extend_from_slice(recipient.as_bytes());
    buf.extend_from_slice(exch_pub);
    buf
}

/// Block-counter nonce: zero except for a big-endian counter in the tail.
fn block_nonce(counter: u64) -> Nonce {
    let mut nonce = [0u8; AEAD_NONCE_SIZE];
    nonce[AEAD_NONCE_SIZE - 8..].copy_from_slice(&counter.to_be_bytes());
    nonce.into()
}

/// Read until `buf` is full or the source is exhausted.
fn read_full(r: &mut impl Read, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match r.read(&mut buf[filled..])? {
            0 => break,
            n => filled += n,
        }
    }
    Ok(filled)
}

/// Seal one packet into an envelope.
///
/// Writes the complete wire representation (header, sealed size, body
/// blocks, padding) to `out` and returns the raw header bytes. `data`
/// must yield exactly `payload_size` bytes.
pub fn seal(
    our: &LocalIdentity,
    their: &Peer,
    pkt: &Pkt,
    nice: u8,
    payload_size: u64,
    pad_size: u64,
    data: &mut impl Read,
    out: &mut impl Write,
) -> Result<Vec<u8>, EnvelopeError> {
    let ephemeral = EphemeralSecret::random_from_rng(OsRng);
    let eph_pub = *PublicKey::from(&ephemeral).as_bytes();

    let tbs = tbs_bytes(nice, &our.id, &their.id, &eph_pub);
    let signature = our.sign_tbs(&tbs);
    let head = EnvelopeHead {
        magic: MAGIC_ENV_V5.bytes,
        nice,
        sender: our.id,
        recipient: their.id,
        exch_pub: eph_pub,
        sign: signature.to_bytes(),
    };
    let head_raw = head.encode();
    out.write_all(&head_raw)?;

    let ad = *blake3::hash(&tbs).as_bytes();
    let shared = ephemeral.diffie_hellman(&their.exch_pub).to_bytes();
    let key = blake3::derive_key(ENVELOPE_KDF_CTX, &shared);
    let cipher = ChaCha20Poly1305::new(&key.into());

    let meta = pkt.encode();
    let full_size = meta.len() as u64 + payload_size;
    let sealed_size = cipher
        .encrypt(&block_nonce(0), Payload { msg: &full_size.to_be_bytes(), aad: &ad })
        .map_err(|_| EnvelopeError::Authentication)?;
    out.write_all(&sealed_size)?;

    let mut body = meta.as_slice().chain(data.take(payload_size));
    let mut buf = vec![0u8; ENC_BLK_SIZE];
    let mut counter = 0u64;
    let mut written = 0u64;
    loop {
        let n = read_full(&mut body, &mut buf)?;
        if n == 0 {
            break;
        }
        counter += 1;
        let block = cipher
            .encrypt(&block_nonce(counter), Payload { msg: &buf[..n], aad: &ad })
            .map_err(|_| EnvelopeError::Authentication)?;
        out.write_all(&block)?;
        written += n as u64;
        if n < ENC_BLK_SIZE {
            break;
        }
    }
    if written != full_size {
        return Err(EnvelopeError::UnexpectedEnd);
    }

    if pad_size > 0 {
        let pad_key = blake3::derive_key(ENVELOPE_PAD_KDF_CTX, &shared);
        let mut xof = blake3::Hasher::new_keyed(&pad_key).finalize_xof();
        let mut remaining = pad_size;
        let mut chunk = [0u8; 4096];
        while remaining > 0 {
            let take = remaining.min(chunk.len() as u64) as usize;
            xof.fill(&mut chunk[..take]);
            out.write_all(&chunk[..take])?;
            remaining -= take as u64;
        }
    }

    Ok(head_raw.to_vec())
}

/// Open an envelope addressed to us.
///
/// Verifies version, sender, recipient, and signature, then decrypts the
/// body (metadata plus payload) into `out`. Returns the sender identity
/// and the recovered plaintext size. Padding, if any, is left unread.
pub fn open(
    our: &LocalIdentity,
    peers: &HashMap<NodeId, Peer>,
    data: &mut impl Read,
    out: &mut impl Write,
) -> Result<(NodeId, u64), EnvelopeError> {
    let mut head_raw = [0u8; ENVELOPE_HEAD_SIZE];
    data.read_exact(&mut head_raw).map_err(eof_as_end)?;
    let head = EnvelopeHead::decode(&head_raw);

    match head.magic {
        m if m == MAGIC_ENV_V1.bytes => return Err(MAGIC_ENV_V1.too_old()),
        m if m == MAGIC_ENV_V2.bytes => return Err(MAGIC_ENV_V2.too_old()),
        m if m == MAGIC_ENV_V3.bytes => return Err(MAGIC_ENV_V3.too_old()),
        m if m == MAGIC_ENV_V4.bytes => return Err(MAGIC_ENV_V4.too_old()),
        m if m == MAGIC_ENV_V5.bytes => {}
        _ => return Err(EnvelopeError::UnknownMagic),
    }

    let their = peers
        .get(&head.sender)
        .ok_or_else(|| EnvelopeError::UnknownSender { id: head.sender.to_string() })?;
    if head.recipient != our.id {
        return Err(EnvelopeError::InvalidRecipient);
    }

    let tbs = tbs_bytes(head.nice, &their.id, &our.id, &head.exch_pub);
    let signature = Signature::from_bytes(&head.sign);
    their
        .sign_pub
        .verify_strict(&tbs, &signature)
        .map_err(|_| EnvelopeError::InvalidSignature)?;

    let ad = *blake3::hash(&tbs).as_bytes();
    let shared = our.exchange(&PublicKey::from(head.exch_pub));
    let key = blake3::derive_key(ENVELOPE_KDF_CTX, &shared);
    let cipher = ChaCha20Poly1305::new(&key.into());

    let mut sealed_size = [0u8; SEALED_SIZE_LEN];
    data.read_exact(&mut sealed_size).map_err(eof_as_end)?;
    let size_raw = cipher
        .decrypt(&block_nonce(0), Payload { msg: &sealed_size, aad: &ad })
        .map_err(|_| EnvelopeError::Authentication)?;
    let full_size = u64::from_be_bytes(
        size_raw.as_slice().try_into().map_err(|_| EnvelopeError::Authentication)?,
    );

    let mut buf = vec![0u8; ENC_BLK_SIZE + AEAD_TAG_SIZE];
    let mut remaining = full_size;
    let mut counter = 0u64;
    while remaining > 0 {
        let plain_len = remaining.min(ENC_BLK_SIZE as u64) as usize;
        let block = &mut buf[..plain_len + AEAD_TAG_SIZE];
        data.read_exact(block).map_err(eof_as_end)?;
        counter += 1;
        let plain = cipher
            .decrypt(&block_nonce(counter), Payload { msg: block, aad: &ad })
            .map_err(|_| EnvelopeError::Authentication)?;
        out.write_all(&plain)?;
        remaining -= plain_len as u64;
    }

    Ok((their.id, full_size))
}

fn eof_as_end(err: std::io::Error) -> EnvelopeError {
    if err.kind() == std::io::ErrorKind::UnexpectedEof {
        EnvelopeError::UnexpectedEnd
    } else {
        EnvelopeError::Io(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn two_nodes() -> (LocalIdentity, LocalIdentity, HashMap<NodeId, Peer>) {
        let alice = LocalIdentity::generate();
        let bob = LocalIdentity::generate();
        let mut peers = HashMap::new();
        let alice_peer = alice.peer_view();
        peers.insert(alice_peer.id, alice_peer);
        (alice, bob, peers)
    }

    fn seal_to_vec(
        our: &LocalIdentity,
        their: &Peer,
        payload: &[u8],
        pad: u64,
    ) -> (Vec<u8>, Pkt) {
        let pkt = Pkt::new(PktType::File, 96, b"inbox/report.txt").unwrap();
        let mut wire = Vec::new();
        seal(
            our,
            their,
            &pkt,
            96,
            payload.len() as u64,
            pad,
            &mut Cursor::new(payload),
            &mut wire,
        )
        .unwrap();
        (wire, pkt)
    }

    #[test]
    fn roundtrip_multiblock_with_padding() {
        let (alice, bob, peers) = two_nodes();
        // Three body blocks plus a partial one.
        let payload: Vec<u8> = (0..3 * ENC_BLK_SIZE + 1000).map(|i| (i % 251) as u8).collect();
        let (wire, pkt) = seal_to_vec(&alice, &bob.peer_view(), &payload, 777);

        let mut plain = Vec::new();
        let (sender, size) = open(&bob, &peers, &mut Cursor::new(&wire), &mut plain).unwrap();
        assert_eq!(sender, alice.id);
        assert_eq!(size as usize, pkt.wire_size() + payload.len());

        let (meta, consumed) = Pkt::decode(&plain).unwrap();
        assert_eq!(meta, pkt);
        assert_eq!(&plain[consumed..], &payload[..]);
    }

    #[test]
    fn roundtrip_empty_payload() {
        let (alice, bob, peers) = two_nodes();
        let (wire, pkt) = seal_to_vec(&alice, &bob.peer_view(), b"", 0);

        let mut plain = Vec::new();
        let (_, size) = open(&bob, &peers, &mut Cursor::new(&wire), &mut plain).unwrap();
        assert_eq!(size as usize, pkt.wire_size());
    }

    #[test]
    fn tampered_body_bit_fails_authentication() {
        let (alice, bob, peers) = two_nodes();
        let (mut wire, _) = seal_to_vec(&alice, &bob.peer_view(), b"payload bytes", 0);

        let body_at = ENVELOPE_HEAD_SIZE + SEALED_SIZE_LEN + 3;
        wire[body_at] ^= 0x10;
        let mut plain = Vec::new();
        let err = open(&bob, &peers, &mut Cursor::new(&wire), &mut plain).unwrap_err();
        assert!(matches!(err, EnvelopeError::Authentication));
    }

    #[test]
    fn tampered_header_bit_fails_signature() {
        let (alice, bob, peers) = two_nodes();
        let (mut wire, _) = seal_to_vec(&alice, &bob.peer_view(), b"payload bytes", 0);

        // Flip one bit inside the niceness byte: signature must break.
        wire[8] ^= 0x01;
        let mut plain = Vec::new();
        let err = open(&bob, &peers, &mut Cursor::new(&wire), &mut plain).unwrap_err();
        assert!(matches!(err, EnvelopeError::InvalidSignature));
    }

    #[test]
    fn wrong_recipient_is_rejected() {
        let (alice, bob, peers) = two_nodes();
        let carol = LocalIdentity::generate();
        let (wire, _) = seal_to_vec(&alice, &bob.peer_view(), b"misdelivered", 0);

        let mut plain = Vec::new();
        let err = open(&carol, &peers, &mut Cursor::new(&wire), &mut plain).unwrap_err();
        assert!(matches!(err, EnvelopeError::InvalidRecipient));
    }

    #[test]
    fn unknown_sender_is_rejected() {
        let (alice, bob, _) = two_nodes();
        let (wire, _) = seal_to_vec(&alice, &bob.peer_view(), b"from a stranger", 0);

        let empty = HashMap::new();
        let mut plain = Vec::new();
        let err = open(&bob, &empty, &mut Cursor::new(&wire), &mut plain).unwrap_err();
        assert!(matches!(err, EnvelopeError::UnknownSender { .. }));
    }

    #[test]
    fn retired_magic_reports_version() {
        let (alice, bob, peers) = two_nodes();
        let (mut wire, _) = seal_to_vec(&alice, &bob.peer_view(), b"old", 0);
        wire[..8].copy_from_slice(&MAGIC_ENV_V3.bytes);

        let mut plain = Vec::new();
        let err = open(&bob, &peers, &mut Cursor::new(&wire), &mut plain).unwrap_err();
        assert!(matches!(err, EnvelopeError::Retired { version: "CARVEv3" }));
    }

    #[test]
    fn truncated_stream_is_unexpected_end() {
        let (alice, bob, peers) = two_nodes();
        let (wire, _) = seal_to_vec(&alice, &bob.peer_view(), b"cut short", 0);

        let mut plain = Vec::new();
        let err =
            open(&bob, &peers, &mut Cursor::new(&wire[..wire.len() - 4]), &mut plain).unwrap_err();
        assert!(matches!(err, EnvelopeError::UnexpectedEnd));
    }

    #[test]
    fn path_length_is_bounded() {
        let long = vec![b'a'; MAX_PATH_SIZE + 1];
        let err = Pkt::new(PktType::File, 0, &long).unwrap_err();
        assert!(matches!(err, EnvelopeError::TooLongPath { len } if len == MAX_PATH_SIZE + 1));
    }

    #[test]
    fn padding_changes_wire_size_only() {
        let (alice, bob, peers) = two_nodes();
        let (plainwire, _) = seal_to_vec(&alice, &bob.peer_view(), b"same body", 0);
        let (padded, _) = seal_to_vec(&alice, &bob.peer_view(), b"same body", 512);
        assert_eq!(padded.len(), plainwire.len() + 512);

        let mut out = Vec::new();
        let (_, size) = open(&bob, &peers, &mut Cursor::new(&padded), &mut out).unwrap();
        let mut out2 = Vec::new();
        let (_, size2) = open(&bob, &peers, &mut Cursor::new(&plainwire), &mut out2).unwrap();
        assert_eq!(size, size2);
    }
}
