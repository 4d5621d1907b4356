//! CARAVAN Protocol - online synchronization.
//!
//! - [`message`]: the six message kinds and batch packing.
//! - [`state`]: shared session state, counters, and stats.
//! - [`engine`]: the session driver running the handshake and the
//!   concurrent worker loops over one live connection.

mod engine;
mod message;
mod state;

pub use engine::{SessionConfig, call, serve};
pub use message::{
    MAX_FILE_CHUNK, PktHash, SP_DONE_OVERHEAD, SP_FILE_OVERHEAD, SP_FREQ_OVERHEAD,
    SP_INFO_OVERHEAD, SpMessage, split_payloads,
};
pub use state::{AdvertisedInfo, Counters, FreqWithNice, SessionStats, SharedState};
