//! Transport layer module.

pub mod gs_usb;
pub mod mock;
pub mod traits;

use std::sync::Arc;

use tracing::{info, warn};

use crate::config::BusConfig;

pub use gs_usb::GsUsbTransport;
pub use mock::MockCanTransport;
pub use traits::{CanFrame, CanTransport, TransportError};

/// Open the first available backend from `config.backends`.
pub fn open_bus(config: &BusConfig) -> Result<Arc<dyn CanTransport>, TransportError> {
    let index = config.channel.unwrap_or(0) as usize;
    let mut tried = Vec::new();

    for backend in &config.backends {
        match backend.trim() {
            "gs_usb" | "canine" | "candlelight" => {
                match GsUsbTransport::open(index, config.bitrate) {
                    Ok(transport) => {
                        info!(adapter = %transport.name(), "Bus opened");
                        return Ok(Arc::new(transport));
                    }
                    Err(e) => {
                        warn!(backend = %backend, error = %e, "Backend unavailable");
                        tried.push(backend.clone());
                    }
                }
            }
            other => {
                warn!(backend = %other, "Unknown bus backend, skipping");
                tried.push(other.to_string());
            }
        }
    }

    Err(TransportError::NoAdapter {
        tried: tried.join(", "),
    })
}
