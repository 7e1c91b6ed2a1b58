//! Scratchpad load + commit of a single chunk.

use std::thread;
use std::time::Duration;

use crate::device::{CommandForm, DeviceSession};
use crate::error::FlashError;
use crate::protocol::Chunk;

/// Programs chunks through the scratchpad, verifying each commit's checksum.
///
/// Shared by the firmware programmer and the NVM restore so both use the
/// same negotiated command form and timing.
#[derive(Debug, Clone, Copy)]
pub struct ChunkWriter {
    form: CommandForm,
    scratch_delay: Duration,
}

impl ChunkWriter {
    pub fn new(form: CommandForm, scratch_delay: Duration) -> Self {
        Self {
            form,
            scratch_delay,
        }
    }

    pub fn form(&self) -> CommandForm {
        self.form
    }

    /// Stage `chunk` in the scratch registers and commit it.
    ///
    /// Returns the confirmed checksum. A disagreeing checksum is
    /// `ChecksumMismatch`; the chunk is not retried.
    pub fn write<D: DeviceSession + ?Sized>(
        &self,
        device: &mut D,
        chunk: &Chunk,
    ) -> Result<u32, FlashError> {
        for (index, word) in chunk.words.iter().enumerate() {
            device.write_scratch_32(index as u8, *word)?;
            if !self.scratch_delay.is_zero() {
                thread::sleep(self.scratch_delay);
            }
        }

        let expected = chunk.checksum();
        let actual = device.commit(chunk.address, self.form.seed())?;
        if actual != expected {
            return Err(FlashError::ChecksumMismatch {
                address: chunk.address,
                expected,
                actual,
            });
        }
        Ok(actual)
    }
}
