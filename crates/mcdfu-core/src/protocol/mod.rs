//! Protocol definitions: memory map defaults, chunk layout and checksum.

pub mod chunk;
pub mod constants;

pub use chunk::{Chunk, checksum, is_erased};
