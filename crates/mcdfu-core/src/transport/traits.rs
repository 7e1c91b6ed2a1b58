//! CAN transport abstraction.
//!
//! Defines the `CanTransport` trait for raw frame exchange on the bus,
//! allowing different implementations (gs_usb, mock, etc.).

use std::fmt;
use std::time::Duration;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Device not found: VID={vid:04X} PID={pid:04X}")]
    DeviceNotFound { vid: u16, pid: u16 },

    #[error("No CAN adapter available (tried: {tried})")]
    NoAdapter { tried: String },

    #[error("Failed to open device: {0}")]
    OpenFailed(String),

    #[error("Failed to claim interface {interface}: {message}")]
    ClaimInterfaceFailed { interface: u8, message: String },

    #[error("Endpoint not found: type={ep_type}, direction={direction}")]
    EndpointNotFound { ep_type: String, direction: String },

    #[error("Control request {request} failed: {message}")]
    ControlFailed { request: u8, message: String },

    #[error("Unsupported bitrate {bitrate} for a {clock} Hz CAN clock")]
    UnsupportedBitrate { bitrate: u32, clock: u32 },

    #[error("Write failed: {0}")]
    WriteFailed(String),

    #[error("Read failed: {0}")]
    ReadFailed(String),

    #[error("Malformed frame: {0}")]
    MalformedFrame(String),

    #[error("Timeout after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// A classic CAN frame (up to 8 data bytes).
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct CanFrame {
    pub id: u32,
    pub extended: bool,
    /// Remote transmission request.
    pub rtr: bool,
    data: [u8; 8],
    len: u8,
}

impl CanFrame {
    pub const MAX_DATA: usize = 8;

    /// Data frame. Fails if `payload` is longer than 8 bytes.
    pub fn new(id: u32, extended: bool, payload: &[u8]) -> Result<Self, TransportError> {
        if payload.len() > Self::MAX_DATA {
            return Err(TransportError::MalformedFrame(format!(
                "{} data bytes (max {})",
                payload.len(),
                Self::MAX_DATA
            )));
        }
        let mut data = [0u8; 8];
        data[..payload.len()].copy_from_slice(payload);
        Ok(Self {
            id,
            extended,
            rtr: false,
            data,
            len: payload.len() as u8,
        })
    }

    /// Remote frame requesting `len` bytes.
    pub fn remote(id: u32, extended: bool, len: u8) -> Self {
        Self {
            id,
            extended,
            rtr: true,
            data: [0u8; 8],
            len: len.min(8),
        }
    }

    /// Payload bytes (empty for remote frames).
    pub fn data(&self) -> &[u8] {
        if self.rtr {
            &[]
        } else {
            &self.data[..self.len as usize]
        }
    }

    /// Data length code.
    pub fn dlc(&self) -> u8 {
        self.len
    }
}

impl fmt::Debug for CanFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.extended {
            write!(f, "{:08X}", self.id)?;
        } else {
            write!(f, "{:03X}", self.id)?;
        }
        if self.rtr {
            write!(f, " [R{}]", self.len)
        } else {
            write!(f, " [{}]", self.len)?;
            for b in self.data() {
                write!(f, " {:02X}", b)?;
            }
            Ok(())
        }
    }
}

/// Abstract CAN transport interface.
///
/// This trait enables:
/// - Production implementation using a gs_usb adapter over nusb
/// - Mock implementation for unit testing
pub trait CanTransport: Send + Sync {
    /// Queue one frame for transmission.
    fn send(&self, frame: &CanFrame) -> Result<(), TransportError>;

    /// Wait up to `timeout` for the next received frame.
    fn recv(&self, timeout: Duration) -> Result<CanFrame, TransportError>;

    /// Human-readable adapter name for logs.
    fn name(&self) -> String;
}

impl<T: CanTransport + ?Sized> CanTransport for std::sync::Arc<T> {
    fn send(&self, frame: &CanFrame) -> Result<(), TransportError> {
        (**self).send(frame)
    }

    fn recv(&self, timeout: Duration) -> Result<CanFrame, TransportError> {
        (**self).recv(timeout)
    }

    fn name(&self) -> String {
        (**self).name()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_payload_limit() {
        assert!(CanFrame::new(0x10, false, &[0; 8]).is_ok());
        assert!(matches!(
            CanFrame::new(0x10, false, &[0; 9]),
            Err(TransportError::MalformedFrame(_))
        ));
    }

    #[test]
    fn test_remote_frame_has_no_payload() {
        let frame = CanFrame::remote(0x40, false, 4);
        assert!(frame.rtr);
        assert_eq!(frame.dlc(), 4);
        assert!(frame.data().is_empty());
    }

    #[test]
    fn test_frame_debug_format() {
        let frame = CanFrame::new(0x0C3, false, &[0x01, 0xAB]).unwrap();
        assert_eq!(format!("{:?}", frame), "0C3 [2] 01 AB");
    }
}
