//! Full-chip erase and firmware programming.

use tracing::{info, instrument};

use super::writer::ChunkWriter;
use crate::device::DeviceSession;
use crate::error::FlashError;
use crate::events::{FlashEvent, FlashObserver, Operation};
use crate::payload::FirmwareImage;
use crate::protocol::constants::ERASE_OK;

/// Erases the device and programs a firmware image from the flash base.
#[derive(Debug, Clone, Copy)]
pub struct FlashProgrammer {
    flash_base: u32,
    writer: ChunkWriter,
}

impl FlashProgrammer {
    pub fn new(flash_base: u32, writer: ChunkWriter) -> Self {
        Self { flash_base, writer }
    }

    /// Erase all flash, NVM included. Any non-zero status is fatal.
    #[instrument(level = "debug", skip_all, fields(form = %self.writer.form()))]
    pub fn erase<D: DeviceSession + ?Sized>(&self, device: &mut D) -> Result<(), FlashError> {
        let status = device.erase_all(self.writer.form().seed())?;
        if status != ERASE_OK {
            return Err(FlashError::EraseFailure { status });
        }
        info!("Flash erased");
        Ok(())
    }

    /// Program `image` chunk by chunk.
    ///
    /// Stops at the first checksum mismatch; nothing after that chunk is
    /// written. Returns the number of chunks committed.
    #[instrument(level = "debug", skip_all, fields(len = image.len()))]
    pub fn program<D, O>(
        &self,
        device: &mut D,
        image: &FirmwareImage,
        observer: &O,
    ) -> Result<usize, FlashError>
    where
        D: DeviceSession + ?Sized,
        O: FlashObserver + ?Sized,
    {
        let total = image.len() as u64;
        let mut chunks = image.chunks(self.flash_base);
        let mut written = 0;

        while let Some(chunk) = chunks.next() {
            let checksum = self.writer.write(device, &chunk)?;
            observer.on_event(&FlashEvent::ChunkCommitted {
                address: chunk.address,
                checksum,
            });
            written += 1;
            observer.on_event(&FlashEvent::Progress {
                operation: Operation::Program,
                current: chunks.consumed() as u64,
                total,
            });
        }

        info!(
            chunks = written,
            base = %format!("0x{:08X}", self.flash_base),
            "Firmware programmed"
        );
        Ok(written)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::device::{CommandForm, SimulatedDevice};
    use crate::events::NullObserver;
    use crate::events::testing::RecordingObserver;

    fn programmer(form: CommandForm) -> FlashProgrammer {
        FlashProgrammer::new(0x1000, ChunkWriter::new(form, Duration::ZERO))
    }

    #[test]
    fn test_erase_ok() {
        let mut dev = SimulatedDevice::new();
        dev.load(0x1000, &[0u8; 16]);
        programmer(CommandForm::Unseeded).erase(&mut dev).unwrap();
        assert_eq!(dev.erase_count(), 1);
        assert_eq!(dev.dump(0x1000, 16), vec![0xFF; 16]);
    }

    #[test]
    fn test_erase_failure_status() {
        let mut dev = SimulatedDevice::new();
        dev.fail_erase_with(2);
        assert!(matches!(
            programmer(CommandForm::Unseeded).erase(&mut dev),
            Err(FlashError::EraseFailure { status: 2 })
        ));
    }

    #[test]
    fn test_seeded_erase() {
        let mut dev = SimulatedDevice::with_seed(0xC0FFEE);
        let form = CommandForm::negotiate(&dev);
        programmer(form).erase(&mut dev).unwrap();
        assert_eq!(dev.erase_count(), 1);
    }

    #[test]
    fn test_program_64_bytes() {
        let image = FirmwareImage::from_bytes((0u8..64).collect());
        let mut dev = SimulatedDevice::new();
        let observer = RecordingObserver::default();

        let written = programmer(CommandForm::Unseeded)
            .program(&mut dev, &image, &observer)
            .unwrap();

        assert_eq!(written, 4);
        assert_eq!(dev.commits(), &[0x1000, 0x1010, 0x1020, 0x1030]);
        assert_eq!(dev.dump(0x1000, 64), image.raw_data());
        assert_eq!(observer.last_progress(Operation::Program), Some((64, 64)));
    }

    #[test]
    fn test_program_partial_chunk_is_zero_padded() {
        let image = FirmwareImage::from_bytes(vec![0xAB; 18]);
        let mut dev = SimulatedDevice::new();
        programmer(CommandForm::Unseeded)
            .program(&mut dev, &image, &NullObserver)
            .unwrap();

        let mut expected = vec![0xAB; 18];
        expected.extend_from_slice(&[0; 14]);
        assert_eq!(dev.dump(0x1000, 32), expected);
    }

    #[test]
    fn test_program_stops_at_first_mismatch() {
        let image = FirmwareImage::from_bytes(vec![0x11; 64]);
        let mut dev = SimulatedDevice::new();
        dev.inject_checksum_fault(0x1010);

        let result = programmer(CommandForm::Unseeded).program(&mut dev, &image, &NullObserver);
        assert!(matches!(
            result,
            Err(FlashError::ChecksumMismatch { address: 0x1010, .. })
        ));
        assert_eq!(dev.commits(), &[0x1000, 0x1010]);
        assert_eq!(dev.dump(0x1020, 32), vec![0xFF; 32]);
    }
}
