//! Identity and peer configuration store.
//!
//! Resolves a peer identifier to its public keys and per-peer session
//! settings, and owns the spool handle. Key material is hex-encoded
//! JSON on disk.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use ed25519_dalek::VerifyingKey;
use serde::{Deserialize, Serialize};
use x25519_dalek::PublicKey;

use crate::core::{CaravanError, DEFAULT_ONLINE_DEADLINE};
use crate::crypto::{LocalIdentity, NodeId, Peer};
use crate::spool::Spool;

/// Everything a session needs to know about who we are and who we trust.
pub struct Ctx {
    /// Our own identity.
    pub local: LocalIdentity,
    /// Known peers, keyed by node identifier.
    pub peers: HashMap<NodeId, Peer>,
    /// The on-disk spool.
    pub spool: Spool,
}

impl std::fmt::Debug for Ctx {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ctx")
            .field("local", &self.local.id)
            .field("peers", &self.peers.keys().collect::<Vec<_>>())
            .field("spool", &self.spool)
            .finish()
    }
}

impl Ctx {
    /// Assemble a context directly, mostly for tests and embedders.
    pub fn new(local: LocalIdentity, peers: Vec<Peer>, spool: Spool) -> Self {
        let peers = peers.into_iter().map(|p| (p.id, p)).collect();
        Self { local, peers, spool }
    }

    /// Resolve a peer by identifier.
    pub fn find_peer(&self, id: &NodeId) -> Option<&Peer> {
        self.peers.get(id)
    }
}

/// Our own key material as persisted.
#[derive(Debug, Serialize, Deserialize)]
pub struct SelfCfg {
    /// Hex X25519 exchange private key.
    pub exchprv: String,
    /// Hex Ed25519 signing private key.
    pub signprv: String,
    /// Hex Noise static private key.
    pub noiseprv: String,
}

impl SelfCfg {
    /// Persistable form of an identity.
    pub fn from_identity(local: &LocalIdentity) -> Self {
        let (exch, sign, noise) = local.key_material();
        Self {
            exchprv: hex::encode(exch),
            signprv: hex::encode(sign),
            noiseprv: hex::encode(noise),
        }
    }
}

/// One configured neighbour.
#[derive(Debug, Serialize, Deserialize)]
pub struct PeerCfg {
    /// Hex X25519 exchange public key.
    pub exchpub: String,
    /// Hex Ed25519 verifying key.
    pub signpub: String,
    /// Hex Noise static public key.
    pub noisepub: String,
    /// Receive rate ceiling, frames per second.
    #[serde(default)]
    pub rx_rate: Option<u32>,
    /// Transmit rate ceiling, frames per second.
    #[serde(default)]
    pub tx_rate: Option<u32>,
    /// Online deadline in seconds.
    #[serde(default)]
    pub online_deadline: Option<u64>,
    /// Maximum online time in seconds.
    #[serde(default)]
    pub max_online_time: Option<u64>,
    /// Niceness ceiling for this peer.
    #[serde(default)]
    pub nice: Option<u8>,
}

/// The on-disk configuration file.
#[derive(Debug, Serialize, Deserialize)]
pub struct ConfigFile {
    /// Spool root directory.
    pub spool: PathBuf,
    /// Our own key material.
    #[serde(rename = "self")]
    pub self_: SelfCfg,
    /// Known neighbours by human-readable alias.
    #[serde(default)]
    pub neigh: HashMap<String, PeerCfg>,
}

fn hex32(field: &str, value: &str) -> Result<[u8; 32], CaravanError> {
    let raw =
        hex::decode(value).map_err(|e| CaravanError::Config(format!("{field}: {e}")))?;
    raw.try_into()
        .map_err(|_| CaravanError::Config(format!("{field}: expected 32 bytes")))
}

impl ConfigFile {
    /// Parse a configuration from JSON text.
    pub fn parse(raw: &str) -> Result<Self, CaravanError> {
        serde_json::from_str(raw).map_err(|e| CaravanError::Config(e.to_string()))
    }

    /// Load a configuration file from disk.
    pub fn load(path: &Path) -> Result<Self, CaravanError> {
        let raw = std::fs::read_to_string(path)?;
        Self::parse(&raw)
    }

    /// Serialize for writing back to disk.
    pub fn to_json(&self) -> Result<String, CaravanError> {
        serde_json::to_string_pretty(self).map_err(|e| CaravanError::Config(e.to_string()))
    }

    /// A fresh configuration with a newly generated identity and no
    /// neighbours.
    pub fn generate(spool: impl Into<PathBuf>) -> Self {
        let local = LocalIdentity::generate();
        Self {
            spool: spool.into(),
            self_: SelfCfg::from_identity(&local),
            neigh: HashMap::new(),
        }
    }

    /// Resolve the configuration into a usable [`Ctx`].
    pub fn into_ctx(self) -> Result<Ctx, CaravanError> {
        let local = LocalIdentity::from_key_material(
            hex32("self.exchprv", &self.self_.exchprv)?,
            hex32("self.signprv", &self.self_.signprv)?,
            hex32("self.noiseprv", &self.self_.noiseprv)?,
        );

        let mut peers = HashMap::new();
        for (alias, cfg) in &self.neigh {
            let exch_pub = PublicKey::from(hex32(alias, &cfg.exchpub)?);
            let sign_pub = VerifyingKey::from_bytes(&hex32(alias, &cfg.signpub)?)
                .map_err(|e| CaravanError::Config(format!("{alias}: {e}")))?;
            let noise_pub = hex32(alias, &cfg.noisepub)?;

            let mut peer = Peer::new(exch_pub, sign_pub, noise_pub);
            peer.rx_rate = cfg.rx_rate.unwrap_or(0);
            peer.tx_rate = cfg.tx_rate.unwrap_or(0);
            peer.online_deadline = cfg
                .online_deadline
                .map(Duration::from_secs)
                .unwrap_or(DEFAULT_ONLINE_DEADLINE);
            peer.max_online_time = cfg.max_online_time.map(Duration::from_secs);
            if let Some(nice) = cfg.nice {
                peer.nice = nice;
            }
            peers.insert(peer.id, peer);
        }

        Ok(Ctx { local, peers, spool: Spool::new(self.spool) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_config_roundtrips() {
        let mut cfg = ConfigFile::generate("/var/spool/caravan");
        let friend = LocalIdentity::generate();
        cfg.neigh.insert(
            "friend".into(),
            PeerCfg {
                exchpub: hex::encode(friend.exch_pub().as_bytes()),
                signpub: hex::encode(friend.sign_pub().to_bytes()),
                noisepub: hex::encode(friend.noise_pub()),
                rx_rate: Some(8),
                tx_rate: None,
                online_deadline: Some(30),
                max_online_time: None,
                nice: Some(128),
            },
        );

        let json = cfg.to_json().unwrap();
        let ctx = ConfigFile::parse(&json).unwrap().into_ctx().unwrap();

        assert_eq!(ctx.peers.len(), 1);
        let peer = ctx.find_peer(&friend.id).unwrap();
        assert_eq!(peer.rx_rate, 8);
        assert_eq!(peer.tx_rate, 0);
        assert_eq!(peer.online_deadline, Duration::from_secs(30));
        assert_eq!(peer.nice, 128);
    }

    #[test]
    fn identity_survives_persistence() {
        let cfg = ConfigFile::generate("/tmp/spool");
        let id_before = ConfigFile::parse(&cfg.to_json().unwrap())
            .unwrap()
            .into_ctx()
            .unwrap()
            .local
            .id;
        let id_again = cfg.into_ctx().unwrap().local.id;
        assert_eq!(id_before, id_again);
    }

    #[test]
    fn bad_key_material_is_a_config_error() {
        let mut cfg = ConfigFile::generate("/tmp/spool");
        cfg.self_.exchprv = "zz".into();
        let err = cfg.into_ctx().unwrap_err();
        assert!(matches!(err, CaravanError::Config(_)));
    }
}
