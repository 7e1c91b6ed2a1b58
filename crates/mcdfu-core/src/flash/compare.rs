//! Image-vs-flash comparison.

use tracing::{debug, instrument};

use crate::device::DeviceSession;
use crate::error::FlashError;
use crate::events::{FlashEvent, FlashObserver, Operation};
use crate::payload::FirmwareImage;

/// Outcome of comparing an image with device flash.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Comparison {
    Match,
    /// First differing word.
    Mismatch {
        address: u32,
        expected: u32,
        actual: u32,
    },
}

impl Comparison {
    pub fn is_match(&self) -> bool {
        matches!(self, Comparison::Match)
    }

    /// Turn a post-flash mismatch into `FlashError::VerifyMismatch`.
    pub fn into_verify_result(self) -> Result<(), FlashError> {
        match self {
            Comparison::Match => Ok(()),
            Comparison::Mismatch {
                address,
                expected,
                actual,
            } => Err(FlashError::VerifyMismatch {
                address,
                expected,
                actual,
            }),
        }
    }
}

/// Reads flash back word by word and compares it with an image.
#[derive(Debug, Clone, Copy)]
pub struct ImageComparator {
    flash_base: u32,
}

impl ImageComparator {
    pub fn new(flash_base: u32) -> Self {
        Self { flash_base }
    }

    /// Compare `image` with flash, stopping at the first differing word.
    ///
    /// Only issues reads. Progress is reported in bytes under `operation`.
    #[instrument(level = "debug", skip_all, fields(operation = %operation, len = image.len()))]
    pub fn compare<D, O>(
        &self,
        device: &mut D,
        image: &FirmwareImage,
        operation: Operation,
        observer: &O,
    ) -> Result<Comparison, FlashError>
    where
        D: DeviceSession + ?Sized,
        O: FlashObserver + ?Sized,
    {
        let total = image.len() as u64;
        let mut chunks = image.chunks(self.flash_base);

        while let Some(chunk) = chunks.next() {
            for (i, expected) in chunk.words.iter().enumerate() {
                let address = chunk.word_address(i);
                let actual = device.read_flash_32(address)?;
                if actual != *expected {
                    debug!(
                        address = %format!("0x{:08X}", address),
                        expected = %format!("0x{:08X}", expected),
                        actual = %format!("0x{:08X}", actual),
                        "Flash differs from image"
                    );
                    return Ok(Comparison::Mismatch {
                        address,
                        expected: *expected,
                        actual,
                    });
                }
            }
            observer.on_event(&FlashEvent::Progress {
                operation,
                current: chunks.consumed() as u64,
                total,
            });
        }

        Ok(Comparison::Match)
    }
}
