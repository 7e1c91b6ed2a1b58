//! Device session layer.

pub mod can;
pub mod sim;
pub mod traits;

pub use can::{CanConnector, CanDevice};
pub use sim::SimulatedDevice;
pub use traits::{CommandForm, DeviceConnector, DeviceSession, SessionError};
