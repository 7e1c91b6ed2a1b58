//! Recovery bootstrap for devices whose firmware no longer answers.
//!
//! The bootloader only listens for a short window after power-up. The
//! operator power-cycles the device while addressing attempts run back to
//! back, and the first attempt that gets an answer wins.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use tracing::{info, instrument};

use crate::device::{DeviceConnector, SessionError};
use crate::error::FlashError;
use crate::events::{FlashEvent, FlashObserver, TracingObserver};

/// The person at the bench.
pub trait Operator {
    /// Ask for power to be removed; returns once acknowledged.
    fn request_power_off(&mut self) -> std::io::Result<()>;

    /// Ask for power to be applied; attempts start right after this returns.
    fn request_power_on(&mut self) -> std::io::Result<()>;
}

/// Retries device addressing until the bootloader answers.
pub struct RecoveryBootstrap<C: DeviceConnector, O: FlashObserver> {
    connector: C,
    observer: Arc<O>,
    retry_delay: Duration,
    retries: u64,
}

impl<C: DeviceConnector> RecoveryBootstrap<C, TracingObserver> {
    pub fn new(connector: C) -> Self {
        Self::with_observer(connector, Arc::new(TracingObserver))
    }
}

impl<C: DeviceConnector, O: FlashObserver> RecoveryBootstrap<C, O> {
    pub fn with_observer(connector: C, observer: Arc<O>) -> Self {
        Self {
            connector,
            observer,
            retry_delay: Duration::ZERO,
            retries: 0,
        }
    }

    /// Pause between failed attempts. Zero retries immediately.
    pub fn retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    /// Failed attempts before the last successful one.
    pub fn retries(&self) -> u64 {
        self.retries
    }

    /// Walk the operator through a power cycle and return the first
    /// session that answers.
    ///
    /// Only `NoResponse` is retried, with no upper bound; any other failure
    /// ends the recovery.
    #[instrument(skip_all)]
    pub fn run<P: Operator + ?Sized>(&mut self, operator: &mut P) -> Result<C::Device, FlashError> {
        operator.request_power_off()?;
        operator.request_power_on()?;
        info!("Waiting for bootloader...");

        loop {
            match self.connector.connect() {
                Ok(device) => {
                    info!(retries = self.retries, "Bootloader answered");
                    return Ok(device);
                }
                Err(SessionError::NoResponse { .. }) => {
                    self.retries += 1;
                    self.observer.on_event(&FlashEvent::ConnectAttemptFailed {
                        attempt: self.retries,
                    });
                    if !self.retry_delay.is_zero() {
                        thread::sleep(self.retry_delay);
                    }
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
}
