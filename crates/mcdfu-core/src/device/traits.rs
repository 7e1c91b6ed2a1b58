//! Device session abstraction.
//!
//! A `DeviceSession` is one addressed bootloader instance on the bus. All
//! calls are blocking request/response exchanges and are issued serially.

use std::fmt;

use thiserror::Error;

use crate::config::ConfigError;
use crate::transport::TransportError;

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("No response from device within {timeout_ms}ms")]
    NoResponse { timeout_ms: u64 },

    #[error("Device rejected the argument list of `{command}`")]
    UnsupportedArgument { command: &'static str },

    #[error("Device rejected request: {0}")]
    Rejected(String),

    #[error("Unexpected response to `{command}`: {len} bytes, expected {expected}")]
    UnexpectedResponse {
        command: &'static str,
        len: usize,
        expected: usize,
    },

    #[error("Scratch register index {0} out of range")]
    InvalidScratchIndex(u8),

    #[error("Cannot address device: {0}")]
    Addressing(#[from] ConfigError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
}

/// Bootloader command set of one device.
pub trait DeviceSession {
    /// Read one word of flash.
    fn read_flash_32(&mut self, address: u32) -> Result<u32, SessionError>;

    /// Stage `value` in scratch register `index` (0..=3).
    fn write_scratch_32(&mut self, index: u8, value: u32) -> Result<(), SessionError>;

    /// Program the four scratch words at `address`; returns the
    /// device-computed checksum.
    fn commit(&mut self, address: u32, seed: Option<u32>) -> Result<u32, SessionError>;

    /// Erase all program flash; returns a status code, 0 on success.
    fn erase_all(&mut self, seed: Option<u32>) -> Result<u8, SessionError>;

    /// Leave the bootloader and boot the application.
    fn reset(&mut self) -> Result<(), SessionError>;

    /// The seed argument accepted by `commit` and `erase_all`, or `None` when
    /// the bootloader only knows the unseeded forms.
    fn command_seed(&self) -> Option<u32>;
}

impl<D: DeviceSession + ?Sized> DeviceSession for &mut D {
    fn read_flash_32(&mut self, address: u32) -> Result<u32, SessionError> {
        (**self).read_flash_32(address)
    }

    fn write_scratch_32(&mut self, index: u8, value: u32) -> Result<(), SessionError> {
        (**self).write_scratch_32(index, value)
    }

    fn commit(&mut self, address: u32, seed: Option<u32>) -> Result<u32, SessionError> {
        (**self).commit(address, seed)
    }

    fn erase_all(&mut self, seed: Option<u32>) -> Result<u8, SessionError> {
        (**self).erase_all(seed)
    }

    fn reset(&mut self) -> Result<(), SessionError> {
        (**self).reset()
    }

    fn command_seed(&self) -> Option<u32> {
        (**self).command_seed()
    }
}

/// Addresses a device on the bus, producing a session when it answers.
pub trait DeviceConnector {
    type Device: DeviceSession;

    /// One addressing attempt. A silent bus is `SessionError::NoResponse`.
    fn connect(&mut self) -> Result<Self::Device, SessionError>;
}

/// Which argument list `commit` and `erase_all` are sent with.
///
/// Decided once per session by [`CommandForm::negotiate`] and reused for
/// every command, so a device is never probed by trial and error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandForm {
    /// Trailing seed argument (current bootloaders).
    Seeded(u32),
    /// No seed argument (legacy bootloaders).
    Unseeded,
}

impl CommandForm {
    pub fn negotiate<D: DeviceSession + ?Sized>(device: &D) -> Self {
        match device.command_seed() {
            Some(seed) => CommandForm::Seeded(seed),
            None => CommandForm::Unseeded,
        }
    }

    pub fn seed(&self) -> Option<u32> {
        match self {
            CommandForm::Seeded(seed) => Some(*seed),
            CommandForm::Unseeded => None,
        }
    }
}

impl fmt::Display for CommandForm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CommandForm::Seeded(seed) => write!(f, "seeded (0x{:08X})", seed),
            CommandForm::Unseeded => write!(f, "unseeded"),
        }
    }
}
