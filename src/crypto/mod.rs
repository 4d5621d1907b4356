//! CARAVAN Protocol - identity keys and session handshake.
//!
//! - [`keys`]: the three long-term keypairs and the content-derived
//!   [`NodeId`], plus the BLAKE2b-256 content hash.
//! - [`noise`]: Noise_IK handshake producing the per-direction session
//!   ciphers.

mod keys;
mod noise;

pub use keys::*;
pub use noise::*;
