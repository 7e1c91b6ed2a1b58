//! Mock CAN transport for testing.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use super::traits::{CanFrame, CanTransport, TransportError};

/// Mock transport for unit testing the device codec.
#[derive(Clone, Default)]
pub struct MockCanTransport {
    /// Frames to hand out on `recv`, in order.
    rx_queue: Arc<Mutex<VecDeque<CanFrame>>>,
    /// Captured sends.
    tx_log: Arc<Mutex<Vec<CanFrame>>>,
}

impl MockCanTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a frame to be returned by the next `recv`.
    pub fn queue_frame(&self, frame: CanFrame) {
        self.rx_queue.lock().unwrap().push_back(frame);
    }

    /// Queue a data frame built from `id` and `payload`.
    pub fn queue_response(&self, id: u32, extended: bool, payload: &[u8]) {
        let frame = CanFrame::new(id, extended, payload).expect("mock payload exceeds 8 bytes");
        self.queue_frame(frame);
    }

    /// Get all captured sends.
    pub fn sent(&self) -> Vec<CanFrame> {
        self.tx_log.lock().unwrap().clone()
    }

    /// Clear captured sends.
    pub fn clear_sent(&self) {
        self.tx_log.lock().unwrap().clear();
    }

    pub fn pending(&self) -> usize {
        self.rx_queue.lock().unwrap().len()
    }
}

impl CanTransport for MockCanTransport {
    fn send(&self, frame: &CanFrame) -> Result<(), TransportError> {
        self.tx_log.lock().unwrap().push(*frame);
        Ok(())
    }

    fn recv(&self, timeout: Duration) -> Result<CanFrame, TransportError> {
        self.rx_queue
            .lock()
            .unwrap()
            .pop_front()
            .ok_or(TransportError::Timeout {
                timeout_ms: timeout.as_millis() as u64,
            })
    }

    fn name(&self) -> String {
        "mock".to_string()
    }
}
