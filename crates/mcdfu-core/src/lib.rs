//! mcdfu-core: firmware upload over the CAN bootloader of a motor controller.
//!
//! The bootloader exposes a small command set (read a flash word, stage four
//! scratch words, commit them with a checksum, erase everything, reset).
//! This crate builds a safe upload on top of it.
//!
//! # Architecture
//!
//! The crate is organized into layers:
//!
//! - **Protocol**: Chunk layout, checksum, memory constants
//! - **Transport**: CAN frame abstraction (gs_usb over nusb, mock)
//! - **Device**: Bootloader command set over CAN, plus an in-memory simulator
//! - **Flash**: Compare, NVM preservation, erase and programming
//! - **State**: Forward-only upload state machine
//! - **Events**: Observer pattern for UI decoupling
//! - **Session**: High-level upload orchestrator
//! - **Recovery**: Power-cycle bootstrap for unresponsive devices
//!
//! # Example
//!
//! ```no_run
//! use mcdfu_core::{
//!     CanDevice, FirmwareImage, FlashConfig, UploadOptions, Uploader, open_bus,
//! };
//!
//! # fn main() -> anyhow::Result<()> {
//! let config = FlashConfig::load_from_file("mcdfu.toml")?;
//! let image = FirmwareImage::load("firmware.bin")?;
//!
//! let bus = open_bus(&config.bus)?;
//! let profile = config.require_profile()?.clone();
//! let mut device = CanDevice::connect(bus, profile, 1, config.response_timeout())?;
//!
//! let outcome = Uploader::new(&mut device, &config, UploadOptions::default()).run(&image)?;
//! println!("{:?}", outcome);
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod device;
pub mod error;
pub mod events;
pub mod flash;
pub mod payload;
pub mod protocol;
pub mod recovery;
pub mod session;
pub mod state;
pub mod transport;

// Re-exports for convenience
pub use config::{BusConfig, ConfigError, DeviceProfile, EndpointMap, FlashConfig, MemoryLayout};
pub use device::{
    CanConnector, CanDevice, CommandForm, DeviceConnector, DeviceSession, SessionError,
    SimulatedDevice,
};
pub use error::FlashError;
pub use events::{FlashEvent, FlashObserver, LogLevel, NullObserver, Operation, TracingObserver};
pub use flash::{Comparison, NvmBackup};
pub use payload::FirmwareImage;
pub use protocol::Chunk;
pub use recovery::{Operator, RecoveryBootstrap};
pub use session::{UploadOptions, UploadOutcome, Uploader};
pub use state::UploadState;
pub use transport::{
    CanFrame, CanTransport, GsUsbTransport, MockCanTransport, TransportError, open_bus,
};
