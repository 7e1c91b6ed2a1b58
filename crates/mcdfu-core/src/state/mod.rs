//! Upload state machine module.

pub mod machine;

pub use machine::{UploadMachine, UploadState};
