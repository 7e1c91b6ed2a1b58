//! Errors of the flashing pipeline.

use std::path::PathBuf;

use thiserror::Error;

use crate::config::ConfigError;
use crate::device::SessionError;
use crate::state::UploadState;

#[derive(Error, Debug)]
pub enum FlashError {
    #[error("Firmware image {} not found", path.display())]
    ImageNotFound { path: PathBuf },

    #[error("Firmware image {} is empty", path.display())]
    EmptyImage { path: PathBuf },

    #[error("Flash erase failed with status {status}")]
    EraseFailure { status: u8 },

    #[error(
        "Checksum mismatch at address 0x{address:08X}: expected 0x{expected:08X}, device reported 0x{actual:08X}"
    )]
    ChecksumMismatch {
        address: u32,
        expected: u32,
        actual: u32,
    },

    #[error(
        "Verification failed at address 0x{address:08X}: expected 0x{expected:08X}, read 0x{actual:08X}"
    )]
    VerifyMismatch {
        address: u32,
        expected: u32,
        actual: u32,
    },

    #[error("Invalid state transition {from} -> {to}")]
    InvalidTransition { from: UploadState, to: UploadState },

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Device error: {0}")]
    Session(#[from] SessionError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
