//! Payload handling module.
//!
//! Provides loading and chunking for firmware images.

pub mod firmware;

pub use firmware::{ChunkIterator, FirmwareImage};
