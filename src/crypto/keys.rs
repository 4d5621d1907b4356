//! Node identities and key management.
//!
//! A node owns three long-term keypairs: an X25519 exchange key (packet
//! envelopes), an Ed25519 signing key (envelope sender authentication),
//! and an X25519 static key for the Noise session handshake. The node
//! identifier is content-derived from the three public halves, so an
//! identity is immutable once generated.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use blake2::digest::consts::U32;
use blake2::{Blake2b, Digest};
use ed25519_dalek::{Signature, Signer, SigningKey, VerifyingKey};
use rand::rngs::OsRng;
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::Zeroize;

use crate::core::{
    CaravanError, DEFAULT_ONLINE_DEADLINE, NODE_ID_SIZE, PRIVATE_KEY_SIZE, PUBLIC_KEY_SIZE,
};

/// BLAKE2b with a 256-bit digest, the content hash used throughout.
pub type Blake2b256 = Blake2b<U32>;

/// Hash the given bytes with BLAKE2b-256.
pub fn content_hash(data: &[u8]) -> [u8; 32] {
    let mut hasher = Blake2b256::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// Content-derived node identifier.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId([u8; NODE_ID_SIZE]);

impl NodeId {
    /// Create from raw bytes.
    pub fn from_bytes(bytes: [u8; NODE_ID_SIZE]) -> Self {
        Self(bytes)
    }

    /// Get the raw bytes.
    pub fn as_bytes(&self) -> &[u8; NODE_ID_SIZE] {
        &self.0
    }

    /// Derive the identifier from the three public keys.
    pub fn derive(
        exch_pub: &[u8; PUBLIC_KEY_SIZE],
        sign_pub: &[u8; PUBLIC_KEY_SIZE],
        noise_pub: &[u8; PUBLIC_KEY_SIZE],
    ) -> Self {
        let mut hasher = Blake2b256::new();
        hasher.update(exch_pub);
        hasher.update(sign_pub);
        hasher.update(noise_pub);
        Self(hasher.finalize().into())
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({})", self)
    }
}

impl FromStr for NodeId {
    type Err = CaravanError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let raw = hex::decode(s).map_err(|e| CaravanError::Config(e.to_string()))?;
        let bytes: [u8; NODE_ID_SIZE] = raw
            .try_into()
            .map_err(|_| CaravanError::Config("bad node id length".into()))?;
        Ok(Self(bytes))
    }
}

/// Our own identity: the three keypairs plus the derived identifier.
pub struct LocalIdentity {
    /// Derived node identifier.
    pub id: NodeId,
    exch: StaticSecret,
    exch_pub: PublicKey,
    sign: SigningKey,
    noise_prv: [u8; PRIVATE_KEY_SIZE],
    noise_pub: [u8; PUBLIC_KEY_SIZE],
}

impl LocalIdentity {
    /// Generate a fresh identity.
    pub fn generate() -> Self {
        let exch = StaticSecret::random_from_rng(OsRng);
        let exch_pub = PublicKey::from(&exch);
        let sign = SigningKey::generate(&mut OsRng);

        // Noise static keys come from snow so they match the handshake suite.
        let builder = snow::Builder::new(super::NOISE_PATTERN.parse().unwrap());
        let keypair = builder.generate_keypair().unwrap();
        let mut noise_prv = [0u8; PRIVATE_KEY_SIZE];
        let mut noise_pub = [0u8; PUBLIC_KEY_SIZE];
        noise_prv.copy_from_slice(&keypair.private);
        noise_pub.copy_from_slice(&keypair.public);

        let id = NodeId::derive(
            exch_pub.as_bytes(),
            &sign.verifying_key().to_bytes(),
            &noise_pub,
        );
        Self { id, exch, exch_pub, sign, noise_prv, noise_pub }
    }

    /// Rebuild an identity from stored private key material.
    pub fn from_key_material(
        exch_prv: [u8; PRIVATE_KEY_SIZE],
        sign_prv: [u8; PRIVATE_KEY_SIZE],
        noise_prv: [u8; PRIVATE_KEY_SIZE],
    ) -> Self {
        let exch = StaticSecret::from(exch_prv);
        let exch_pub = PublicKey::from(&exch);
        let sign = SigningKey::from_bytes(&sign_prv);

        // Noise static keys are plain X25519; recompute the public half.
        let noise_pub = *PublicKey::from(&StaticSecret::from(noise_prv)).as_bytes();

        let id = NodeId::derive(
            exch_pub.as_bytes(),
            &sign.verifying_key().to_bytes(),
            &noise_pub,
        );
        Self { id, exch, exch_pub, sign, noise_prv, noise_pub }
    }

    /// Public half of the exchange key.
    pub fn exch_pub(&self) -> &PublicKey {
        &self.exch_pub
    }

    /// Public half of the signing key.
    pub fn sign_pub(&self) -> VerifyingKey {
        self.sign.verifying_key()
    }

    /// Public half of the Noise static key.
    pub fn noise_pub(&self) -> &[u8; PUBLIC_KEY_SIZE] {
        &self.noise_pub
    }

    /// Private half of the Noise static key.
    ///
    /// # Security
    /// Handle with care - this exposes sensitive key material.
    pub(crate) fn noise_prv(&self) -> &[u8; PRIVATE_KEY_SIZE] {
        &self.noise_prv
    }

    /// Private halves of all three keys, for persisting the identity.
    pub fn key_material(&self) -> ([u8; 32], [u8; 32], [u8; 32]) {
        (self.exch.to_bytes(), self.sign.to_bytes(), self.noise_prv)
    }

    /// Sign an envelope to-be-signed structure.
    pub fn sign_tbs(&self, tbs: &[u8]) -> Signature {
        self.sign.sign(tbs)
    }

    /// X25519 agreement between our static exchange key and an envelope's
    /// ephemeral public key.
    pub fn exchange(&self, ephemeral_pub: &PublicKey) -> [u8; 32] {
        self.exch.diffie_hellman(ephemeral_pub).to_bytes()
    }

    /// The peer-side view of this identity, as another node would store it.
    pub fn peer_view(&self) -> Peer {
        Peer::new(self.exch_pub, self.sign_pub(), self.noise_pub)
    }
}

impl Drop for LocalIdentity {
    fn drop(&mut self) {
        self.noise_prv.zeroize();
    }
}

/// A known remote node: its public keys and per-peer session settings.
#[derive(Clone)]
pub struct Peer {
    /// Derived node identifier.
    pub id: NodeId,
    /// Static X25519 exchange public key (envelope addressing).
    pub exch_pub: PublicKey,
    /// Ed25519 verifying key (envelope sender authentication).
    pub sign_pub: VerifyingKey,
    /// Noise static public key (session handshake).
    pub noise_pub: [u8; PUBLIC_KEY_SIZE],
    /// Receive rate ceiling in frames per second, 0 = unlimited.
    pub rx_rate: u32,
    /// Transmit rate ceiling in frames per second, 0 = unlimited.
    pub tx_rate: u32,
    /// Tear the session down after both non-ping directions have been
    /// idle this long.
    pub online_deadline: Duration,
    /// Unconditional session duration cap.
    pub max_online_time: Option<Duration>,
    /// Niceness ceiling for packets we accept from this peer.
    pub nice: u8,
}

impl Peer {
    /// Build a peer entry with default session settings.
    pub fn new(
        exch_pub: PublicKey,
        sign_pub: VerifyingKey,
        noise_pub: [u8; PUBLIC_KEY_SIZE],
    ) -> Self {
        let id = NodeId::derive(exch_pub.as_bytes(), &sign_pub.to_bytes(), &noise_pub);
        Self {
            id,
            exch_pub,
            sign_pub,
            noise_pub,
            rx_rate: 0,
            tx_rate: 0,
            online_deadline: DEFAULT_ONLINE_DEADLINE,
            max_online_time: None,
            nice: u8::MAX,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_id_is_deterministic() {
        let a = NodeId::derive(&[1; 32], &[2; 32], &[3; 32]);
        let b = NodeId::derive(&[1; 32], &[2; 32], &[3; 32]);
        assert_eq!(a, b);

        let c = NodeId::derive(&[1; 32], &[2; 32], &[4; 32]);
        assert_ne!(a, c);
    }

    #[test]
    fn node_id_hex_roundtrip() {
        let id = NodeId::derive(&[7; 32], &[8; 32], &[9; 32]);
        let parsed: NodeId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn generated_identities_differ() {
        let a = LocalIdentity::generate();
        let b = LocalIdentity::generate();
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn peer_view_matches_identity() {
        let local = LocalIdentity::generate();
        let peer = local.peer_view();
        assert_eq!(local.id, peer.id);
        assert_eq!(local.noise_pub(), &peer.noise_pub);
    }

    #[test]
    fn identity_rebuilds_from_key_material() {
        let local = LocalIdentity::generate();
        let (exch, sign, noise) = local.key_material();
        let rebuilt = LocalIdentity::from_key_material(exch, sign, noise);
        assert_eq!(local.id, rebuilt.id);
    }
}
