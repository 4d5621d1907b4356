//! CARAVAN Protocol - core constants, magics, and error types.
//!
//! This module has minimal dependencies and defines the shared vocabulary
//! of the crate: fixed sizes, format magics, and the error taxonomy.

mod constants;
mod error;
mod magic;

pub use constants::*;
pub use error::*;
pub use magic::*;
