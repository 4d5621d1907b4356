//! Noise_IK session handshake.
//!
//! Two nodes establish a session with the IK pattern: the initiator knows
//! the responder's static key in advance, the responder learns the
//! initiator's static key from the first message and identifies the peer
//! by comparing it against its known-peer table in constant time.
//!
//! ```text
//! Noise_IK(s, rs):
//!   <- s                    # Responder's static key known to Initiator
//!   ...
//!   -> e, es, s, ss         # Initiator sends ephemeral + encrypted static
//!   <- e, ee, se            # Responder sends ephemeral, completes DH
//! ```
//!
//! After the two messages each side holds a [`CipherPair`]: one cipher per
//! direction, split so the sender and receiver tasks can run concurrently.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use snow::{Builder, HandshakeState, StatelessTransportState};
use subtle::ConstantTimeEq;

use super::{NodeId, Peer};
use crate::core::{HandshakeError, PUBLIC_KEY_SIZE};

/// Noise protocol pattern: the same suite the envelope stack is built on.
pub const NOISE_PATTERN: &str = "Noise_IK_25519_ChaChaPoly_BLAKE2b";

/// Handshake state machine for the calling side.
pub struct HandshakeInitiator {
    state: HandshakeState,
}

impl HandshakeInitiator {
    /// Create a new initiator handshake toward a known peer.
    pub fn new(
        local: &super::LocalIdentity,
        peer_noise_pub: &[u8; PUBLIC_KEY_SIZE],
    ) -> Result<Self, HandshakeError> {
        let builder = Builder::new(NOISE_PATTERN.parse().unwrap());
        let state = builder
            .local_private_key(local.noise_prv())
            .remote_public_key(peer_noise_pub)
            .build_initiator()
            .map_err(|e| HandshakeError::Failed(e.to_string()))?;
        Ok(Self { state })
    }

    /// Generate the first handshake message (`-> e, es, s, ss`).
    ///
    /// The payload carries the first advertisement batch, padded by the
    /// caller so queue depth is not observable.
    pub fn write_message(&mut self, payload: &[u8]) -> Result<Vec<u8>, HandshakeError> {
        let mut buf = vec![0u8; 65535];
        let len = self
            .state
            .write_message(payload, &mut buf)
            .map_err(|e| HandshakeError::Failed(e.to_string()))?;
        buf.truncate(len);
        Ok(buf)
    }

    /// Process the handshake response (`<- e, ee, se`), completing the
    /// handshake.
    pub fn read_message(self, message: &[u8]) -> Result<(Vec<u8>, CipherPair), HandshakeError> {
        let mut state = self.state;
        let mut payload = vec![0u8; 65535];
        let len = state
            .read_message(message, &mut payload)
            .map_err(|e| HandshakeError::Failed(e.to_string()))?;
        payload.truncate(len);

        let transport = state
            .into_stateless_transport_mode()
            .map_err(|e| HandshakeError::Failed(e.to_string()))?;
        Ok((payload, CipherPair { transport }))
    }
}

/// Handshake state machine for the answering side.
pub struct HandshakeResponder {
    state: HandshakeState,
}

impl HandshakeResponder {
    /// Create a new responder handshake.
    pub fn new(local: &super::LocalIdentity) -> Result<Self, HandshakeError> {
        let builder = Builder::new(NOISE_PATTERN.parse().unwrap());
        let state = builder
            .local_private_key(local.noise_prv())
            .build_responder()
            .map_err(|e| HandshakeError::Failed(e.to_string()))?;
        Ok(Self { state })
    }

    /// Process the initiator's first message, revealing its static key.
    pub fn read_message(
        &mut self,
        message: &[u8],
    ) -> Result<(Vec<u8>, [u8; PUBLIC_KEY_SIZE]), HandshakeError> {
        let mut payload = vec![0u8; 65535];
        let len = self
            .state
            .read_message(message, &mut payload)
            .map_err(|e| HandshakeError::Failed(e.to_string()))?;
        payload.truncate(len);

        let remote_static = self
            .state
            .get_remote_static()
            .ok_or_else(|| HandshakeError::Failed("no remote static key".into()))?;
        let mut remote_pub = [0u8; PUBLIC_KEY_SIZE];
        remote_pub.copy_from_slice(remote_static);
        Ok((payload, remote_pub))
    }

    /// Generate the handshake response, completing the handshake.
    pub fn write_message(self, payload: &[u8]) -> Result<(Vec<u8>, CipherPair), HandshakeError> {
        let mut state = self.state;
        let mut buf = vec![0u8; 65535];
        let len = state
            .write_message(payload, &mut buf)
            .map_err(|e| HandshakeError::Failed(e.to_string()))?;
        buf.truncate(len);

        let transport = state
            .into_stateless_transport_mode()
            .map_err(|e| HandshakeError::Failed(e.to_string()))?;
        Ok((buf, CipherPair { transport }))
    }
}

/// Identify the caller by its revealed static key, in constant time.
pub fn identify_peer<'a>(
    peers: &'a HashMap<NodeId, Peer>,
    static_pub: &[u8],
) -> Option<&'a Peer> {
    peers
        .values()
        .find(|peer| bool::from(peer.noise_pub[..].ct_eq(static_pub)))
}

/// Both direction ciphers of an established session.
pub struct CipherPair {
    transport: StatelessTransportState,
}

impl CipherPair {
    /// Split into independent send and receive halves.
    ///
    /// The halves share the underlying transport keys but carry their own
    /// nonce counters, so the session's sender and receiver tasks never
    /// contend on cipher state.
    pub fn split(self) -> (SendCipher, RecvCipher) {
        let transport = Arc::new(self.transport);
        (
            SendCipher { transport: Arc::clone(&transport), nonce: AtomicU64::new(0) },
            RecvCipher { transport, nonce: AtomicU64::new(0) },
        )
    }
}

/// Outbound transport cipher; one per session direction.
pub struct SendCipher {
    transport: Arc<StatelessTransportState>,
    nonce: AtomicU64,
}

impl SendCipher {
    /// Encrypt one payload batch for the wire.
    pub fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>, HandshakeError> {
        let nonce = self.nonce.fetch_add(1, Ordering::Relaxed);
        let mut buf = vec![0u8; plaintext.len() + 16];
        let len = self
            .transport
            .write_message(nonce, plaintext, &mut buf)
            .map_err(|_| HandshakeError::SealFailed)?;
        buf.truncate(len);
        Ok(buf)
    }
}

/// Inbound transport cipher; one per session direction.
pub struct RecvCipher {
    transport: Arc<StatelessTransportState>,
    nonce: AtomicU64,
}

impl RecvCipher {
    /// Decrypt one payload batch from the wire.
    ///
    /// Frames arrive on an ordered stream, so the nonce advances in
    /// lockstep with the peer's send counter.
    pub fn open(&self, ciphertext: &[u8]) -> Result<Vec<u8>, HandshakeError> {
        let nonce = self.nonce.fetch_add(1, Ordering::Relaxed);
        let mut buf = vec![0u8; ciphertext.len()];
        let len = self
            .transport
            .read_message(nonce, ciphertext, &mut buf)
            .map_err(|_| HandshakeError::OpenFailed)?;
        buf.truncate(len);
        Ok(buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::LocalIdentity;

    fn complete_handshake() -> (CipherPair, CipherPair, Vec<u8>, Vec<u8>) {
        let alice = LocalIdentity::generate();
        let bob = LocalIdentity::generate();

        let mut initiator = HandshakeInitiator::new(&alice, bob.noise_pub()).unwrap();
        let mut responder = HandshakeResponder::new(&bob).unwrap();

        let msg1 = initiator.write_message(b"first infos").unwrap();
        let (payload1, remote_static) = responder.read_message(&msg1).unwrap();
        assert_eq!(&remote_static, alice.noise_pub());

        let (msg2, bob_pair) = responder.write_message(b"reply infos").unwrap();
        let (payload2, alice_pair) = initiator.read_message(&msg2).unwrap();

        (alice_pair, bob_pair, payload1, payload2)
    }

    #[test]
    fn handshake_roundtrip() {
        let (alice, bob, payload1, payload2) = complete_handshake();
        assert_eq!(payload1, b"first infos");
        assert_eq!(payload2, b"reply infos");

        let (alice_tx, alice_rx) = alice.split();
        let (bob_tx, bob_rx) = bob.split();

        // Both directions, several frames in order.
        for i in 0..4u8 {
            let msg = vec![i; 100];
            let ct = alice_tx.seal(&msg).unwrap();
            assert_eq!(bob_rx.open(&ct).unwrap(), msg);

            let reply = vec![i ^ 0xff; 50];
            let ct = bob_tx.seal(&reply).unwrap();
            assert_eq!(alice_rx.open(&ct).unwrap(), reply);
        }
    }

    #[test]
    fn handshake_wrong_static_key_fails() {
        let alice = LocalIdentity::generate();
        let bob = LocalIdentity::generate();
        let mallory = LocalIdentity::generate();

        // Alice dials the wrong static key.
        let mut initiator = HandshakeInitiator::new(&alice, mallory.noise_pub()).unwrap();
        let mut responder = HandshakeResponder::new(&bob).unwrap();

        let msg1 = initiator.write_message(b"").unwrap();
        assert!(responder.read_message(&msg1).is_err());
    }

    #[test]
    fn tampered_transport_frame_fails() {
        let (alice, bob, _, _) = complete_handshake();
        let (alice_tx, _) = alice.split();
        let (_, bob_rx) = bob.split();

        let mut ct = alice_tx.seal(b"payload").unwrap();
        ct[0] ^= 0x01;
        assert!(matches!(bob_rx.open(&ct), Err(HandshakeError::OpenFailed)));
    }

    #[test]
    fn identify_peer_finds_only_known_keys() {
        let alice = LocalIdentity::generate();
        let stranger = LocalIdentity::generate();

        let peer = alice.peer_view();
        let mut peers = HashMap::new();
        peers.insert(peer.id, peer);

        assert!(identify_peer(&peers, &alice.noise_pub()[..]).is_some());
        assert!(identify_peer(&peers, &stranger.noise_pub()[..]).is_none());
    }
}
