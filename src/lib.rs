//! # CARAVAN Protocol
//!
//! Store-and-forward node-to-node data exchange: peers queue encrypted
//! packets in an on-disk spool and exchange them opportunistically over
//! unreliable transports. This crate implements the protocol core:
//!
//! - **Envelope**: the signed, encrypted wrapper around one logical
//!   packet, addressed to exactly one recipient, with per-packet forward
//!   secrecy and length-concealing padding.
//! - **Handshake**: mutually authenticated Noise_IK key agreement
//!   producing one transport cipher per direction.
//! - **Synchronization**: a stateful, resumable session protocol that
//!   advertises, requests, and transfers queued packets in chunks, with
//!   durable verification before any receipt is confirmed.
//! - **Spool**: the per-peer, per-direction on-disk queue with advisory
//!   locking and crash-safe state transitions.
//!
//! The synchronization layer only ever moves opaque envelope bytes; a
//! packet is sealed when queued and opened when processed, never in
//! flight.
//!
//! ## Example
//!
//! ```no_run
//! use std::path::Path;
//! use std::sync::Arc;
//!
//! use caravan_protocol::config::ConfigFile;
//! use caravan_protocol::sync::{SessionConfig, call};
//!
//! # async fn dial(peer_id: caravan_protocol::crypto::NodeId) -> Result<(), Box<dyn std::error::Error>> {
//! let ctx = Arc::new(ConfigFile::load(Path::new("caravan.json"))?.into_ctx()?);
//! let conn = tokio::net::TcpStream::connect("peer.example.org:5400").await?;
//! let stats = call(ctx, &peer_id, conn, SessionConfig::default()).await?;
//! println!("exchanged {} / {} bytes", stats.rx_bytes, stats.tx_bytes);
//! # Ok(())
//! # }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![cfg_attr(docsrs, feature(doc_cfg))]

pub mod config;
pub mod core;
pub mod crypto;
pub mod envelope;
pub mod spool;
pub mod sync;
pub mod transport;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::config::{ConfigFile, Ctx};
    pub use crate::core::*;
    pub use crate::crypto::{LocalIdentity, NodeId, Peer};
    pub use crate::envelope::{Pkt, PktType};
    pub use crate::spool::{Direction, Job, Spool};
    pub use crate::sync::{SessionConfig, SessionStats, SpMessage, call, serve};
}

// Re-export commonly used items at crate root.
pub use crate::config::Ctx;
pub use crate::core::CaravanError;
pub use crate::crypto::{LocalIdentity, NodeId, Peer};
pub use crate::sync::{SessionConfig, SessionStats};
