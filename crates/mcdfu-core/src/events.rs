//! Event system for UI decoupling.
//!
//! Lets the CLI (or any other front end) follow an upload without the core
//! printing anything itself.

use std::fmt;

use crate::state::UploadState;

/// Log level for events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

/// Long-running operations that report progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Compare,
    Verify,
    ReadNvm,
    WriteNvm,
    Program,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operation::Compare => write!(f, "Comparing"),
            Operation::Verify => write!(f, "Verifying"),
            Operation::ReadNvm => write!(f, "Reading NVM"),
            Operation::WriteNvm => write!(f, "Writing NVM"),
            Operation::Program => write!(f, "Flashing"),
        }
    }
}

/// Events emitted while flashing.
#[derive(Debug, Clone)]
pub enum FlashEvent {
    /// Pipeline moved to a new state.
    StateChanged { from: UploadState, to: UploadState },
    /// Progress of the current operation, in bytes.
    Progress {
        operation: Operation,
        current: u64,
        total: u64,
    },
    /// Chunk programmed and checksum confirmed.
    ChunkCommitted { address: u32, checksum: u32 },
    /// Log message.
    Log { level: LogLevel, message: String },
    /// Recovery: the device did not answer an addressing attempt.
    ConnectAttemptFailed { attempt: u64 },
    /// Upload finished (successfully or short-circuited).
    Complete,
}

/// Observer trait for receiving flashing events.
///
/// Implementations must return quickly; they run inline with bus traffic.
pub trait FlashObserver: Send + Sync {
    /// Called when an event occurs.
    fn on_event(&self, event: &FlashEvent);
}

/// No-op observer that discards all events.
pub struct NullObserver;

impl FlashObserver for NullObserver {
    fn on_event(&self, _event: &FlashEvent) {}
}

/// Observer that logs events using tracing.
pub struct TracingObserver;

impl FlashObserver for TracingObserver {
    fn on_event(&self, event: &FlashEvent) {
        match event {
            FlashEvent::StateChanged { from, to } => {
                tracing::info!(from = %from, to = %to, "State changed");
            }
            FlashEvent::Progress {
                operation,
                current,
                total,
            } => {
                let pct = if *total > 0 {
                    (*current * 100) / *total
                } else {
                    100
                };
                tracing::debug!(operation = %operation, progress = %format!("{}%", pct), "Progress");
            }
            FlashEvent::ChunkCommitted { address, checksum } => {
                tracing::trace!(
                    address = %format!("0x{:08X}", address),
                    checksum = %format!("0x{:08X}", checksum),
                    "Chunk committed"
                );
            }
            FlashEvent::Log { level, message } => match level {
                LogLevel::Trace => tracing::trace!("{}", message),
                LogLevel::Debug => tracing::debug!("{}", message),
                LogLevel::Info => tracing::info!("{}", message),
                LogLevel::Warn => tracing::warn!("{}", message),
                LogLevel::Error => tracing::error!("{}", message),
            },
            FlashEvent::ConnectAttemptFailed { attempt } => {
                tracing::debug!(attempt, "No response, retrying");
            }
            FlashEvent::Complete => {
                tracing::info!("Operation complete");
            }
        }
    }
}
