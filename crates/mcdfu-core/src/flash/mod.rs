//! Flash operations: comparison, NVM preservation and programming.

pub mod compare;
pub mod nvm;
pub mod program;
pub mod writer;

pub use compare::{Comparison, ImageComparator};
pub use nvm::{NvmBackup, NvmPreserver};
pub use program::FlashProgrammer;
pub use writer::ChunkWriter;
