//! Upload session - orchestrates compare, erase, program and verify.

use std::sync::Arc;

use tracing::{error, info, instrument};

use crate::config::{FlashConfig, MemoryLayout};
use crate::device::{CommandForm, DeviceSession};
use crate::error::FlashError;
use crate::events::{FlashEvent, FlashObserver, LogLevel, Operation, TracingObserver};
use crate::flash::{ChunkWriter, Comparison, FlashProgrammer, ImageComparator, NvmPreserver};
use crate::payload::FirmwareImage;
use crate::state::{UploadMachine, UploadState};

/// Caller choices for one upload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UploadOptions {
    /// Skip the pre-flash comparison and always reprogram.
    pub force: bool,
    /// Reset the device into the new firmware when done.
    pub reset: bool,
}

impl Default for UploadOptions {
    fn default() -> Self {
        Self {
            force: false,
            reset: true,
        }
    }
}

/// How an upload ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadOutcome {
    /// Flash already held the image; nothing was written.
    AlreadyUpToDate,
    /// The image was programmed.
    Flashed {
        /// Whether a non-blank NVM region was written back.
        nvm_restored: bool,
        /// Post-flash read-back result. A mismatch is reported, not raised.
        verification: Comparison,
        /// Whether the device was reset.
        reset: bool,
    },
}

/// Drives one upload against a connected device.
///
/// The command form is negotiated once on construction and reused by every
/// erase and commit.
pub struct Uploader<'d, D: DeviceSession, O: FlashObserver> {
    device: &'d mut D,
    observer: Arc<O>,
    options: UploadOptions,
    form: CommandForm,
    layout: MemoryLayout,
    comparator: ImageComparator,
    nvm: NvmPreserver,
    programmer: FlashProgrammer,
    machine: UploadMachine,
}

impl<'d, D: DeviceSession> Uploader<'d, D, TracingObserver> {
    /// Create an uploader with the default tracing observer.
    pub fn new(device: &'d mut D, config: &FlashConfig, options: UploadOptions) -> Self {
        Self::with_observer(device, config, options, Arc::new(TracingObserver))
    }
}

impl<'d, D: DeviceSession, O: FlashObserver> Uploader<'d, D, O> {
    /// Create an uploader with a custom observer.
    pub fn with_observer(
        device: &'d mut D,
        config: &FlashConfig,
        options: UploadOptions,
        observer: Arc<O>,
    ) -> Self {
        let form = CommandForm::negotiate(&*device);
        let writer = ChunkWriter::new(form, config.scratch_write_delay());
        Self {
            device,
            observer,
            options,
            form,
            layout: config.layout,
            comparator: ImageComparator::new(config.layout.flash_base),
            nvm: NvmPreserver::new(config.layout, writer),
            programmer: FlashProgrammer::new(config.layout.flash_base, writer),
            machine: UploadMachine::new(),
        }
    }

    pub fn state(&self) -> UploadState {
        self.machine.state()
    }

    pub fn command_form(&self) -> CommandForm {
        self.form
    }

    /// State the upload failed in, once it has been aborted.
    pub fn aborted_in(&self) -> Option<UploadState> {
        self.machine.aborted_in()
    }

    /// Run the upload to completion.
    ///
    /// On error the machine is left in `Aborted`. A failure after the erase
    /// leaves the device without valid firmware and, before the restore,
    /// without its NVM contents; nothing is rolled back.
    #[instrument(skip_all, fields(len = image.len(), form = %self.form))]
    pub fn run(&mut self, image: &FirmwareImage) -> Result<UploadOutcome, FlashError> {
        let result = self.run_pipeline(image);
        if let Err(e) = &result {
            if !self.machine.state().is_terminal() {
                self.goto(UploadState::Aborted)?;
            }
            let failed_in = self.machine.aborted_in().unwrap_or(self.machine.state());
            self.report_damage(failed_in);
            error!(state = %failed_in, error = %e, "Upload failed");
        }
        result
    }

    /// Tell the operator what state the device was left in.
    fn report_damage(&self, failed_in: UploadState) {
        match failed_in {
            UploadState::Erase => self.log(
                LogLevel::Warn,
                "Erase did not complete; firmware and NVM config may have been erased",
            ),
            UploadState::Program => {
                self.log(LogLevel::Warn, "Device firmware is invalid until reflashed");
                self.log(LogLevel::Warn, "NVM config was erased and has not been restored");
            }
            UploadState::RestoreNvm => {
                self.log(LogLevel::Warn, "NVM config was only partially restored")
            }
            _ => {}
        }
    }

    fn run_pipeline(&mut self, image: &FirmwareImage) -> Result<UploadOutcome, FlashError> {
        self.layout.check_image_fits(image.len())?;

        if self.options.force {
            info!("Forced upload, skipping comparison");
        } else {
            self.goto(UploadState::Compare)?;
            let current = self.comparator.compare(
                self.device,
                image,
                Operation::Compare,
                self.observer.as_ref(),
            )?;
            if current.is_match() {
                self.log(LogLevel::Info, "Device firmware matches the image, nothing to do");
                self.goto(UploadState::Done)?;
                self.observer.on_event(&FlashEvent::Complete);
                return Ok(UploadOutcome::AlreadyUpToDate);
            }
            self.log(LogLevel::Info, "Device firmware differs from the image");
        }

        self.goto(UploadState::BackupNvm)?;
        let backup = self.nvm.backup(self.device, self.observer.as_ref())?;

        self.goto(UploadState::Erase)?;
        self.programmer.erase(self.device)?;

        self.goto(UploadState::Program)?;
        self.programmer
            .program(self.device, image, self.observer.as_ref())?;

        self.goto(UploadState::RestoreNvm)?;
        let restored = self
            .nvm
            .restore(self.device, backup.as_ref(), self.observer.as_ref())?;

        self.goto(UploadState::Verify)?;
        let verification = self.comparator.compare(
            self.device,
            image,
            Operation::Verify,
            self.observer.as_ref(),
        )?;
        match verification {
            Comparison::Match => self.log(LogLevel::Info, "Verification passed"),
            Comparison::Mismatch {
                address,
                expected,
                actual,
            } => self.log(
                LogLevel::Error,
                &format!(
                    "Verification failed at 0x{:08X}: expected 0x{:08X}, read 0x{:08X}",
                    address, expected, actual
                ),
            ),
        }

        let reset = self.options.reset;
        if reset {
            self.goto(UploadState::Reset)?;
            self.device.reset()?;
            self.log(LogLevel::Info, "Device reset");
        }

        self.goto(UploadState::Done)?;
        self.observer.on_event(&FlashEvent::Complete);
        Ok(UploadOutcome::Flashed {
            nvm_restored: restored > 0,
            verification,
            reset,
        })
    }

    fn goto(&mut self, next: UploadState) -> Result<(), FlashError> {
        let from = self.machine.goto_state(next)?;
        self.observer
            .on_event(&FlashEvent::StateChanged { from, to: next });
        Ok(())
    }

    fn log(&self, level: LogLevel, message: &str) {
        self.observer.on_event(&FlashEvent::Log {
            level,
            message: message.to_string(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigError;
    use crate::device::{SessionError, SimulatedDevice};
    use crate::events::testing::RecordingObserver;

    const FLASH: u32 = 0x1000;
    const NVM: u32 = 0x8000;

    fn config() -> FlashConfig {
        FlashConfig {
            scratch_write_delay_us: 0,
            layout: MemoryLayout {
                flash_base: FLASH,
                nvm_base: NVM,
                nvm_size: 64,
            },
            ..FlashConfig::default()
        }
    }

    fn image() -> FirmwareImage {
        FirmwareImage::from_bytes((0u8..64).collect())
    }

    fn nvm_pattern() -> Vec<u8> {
        let mut nvm = vec![0xFFu8; 64];
        nvm[16..32].copy_from_slice(&[0x42; 16]);
        nvm
    }

    fn warnings(observer: &RecordingObserver) -> Vec<String> {
        observer
            .events()
            .into_iter()
            .filter_map(|e| match e {
                FlashEvent::Log {
                    level: LogLevel::Warn,
                    message,
                } => Some(message),
                _ => None,
            })
            .collect()
    }

    type Run = (
        Result<UploadOutcome, FlashError>,
        Option<UploadState>,
        Arc<RecordingObserver>,
    );

    /// Runs one upload; the middle value is the state it aborted in, if any.
    fn upload(dev: &mut SimulatedDevice, options: UploadOptions) -> Run {
        let observer = Arc::new(RecordingObserver::default());
        let config = config();
        let mut uploader = Uploader::with_observer(dev, &config, options, observer.clone());
        let result = uploader.run(&image());
        let aborted_in = uploader.aborted_in();
        if aborted_in.is_none() {
            assert_eq!(uploader.state(), UploadState::Done);
        }
        (result, aborted_in, observer)
    }

    #[test]
    fn test_blank_device_full_pipeline() {
        let mut dev = SimulatedDevice::new();
        let (result, aborted_in, observer) = upload(&mut dev, UploadOptions::default());

        assert_eq!(
            result.unwrap(),
            UploadOutcome::Flashed {
                nvm_restored: false,
                verification: Comparison::Match,
                reset: true
            }
        );
        assert_eq!(aborted_in, None);
        assert_eq!(dev.dump(FLASH, 64), image().raw_data());
        assert_eq!(dev.commits(), &[0x1000, 0x1010, 0x1020, 0x1030]);
        assert_eq!(dev.erase_count(), 1);
        assert_eq!(dev.reset_count(), 1);
        assert_eq!(
            observer.states(),
            vec![
                UploadState::Compare,
                UploadState::BackupNvm,
                UploadState::Erase,
                UploadState::Program,
                UploadState::RestoreNvm,
                UploadState::Verify,
                UploadState::Reset,
                UploadState::Done,
            ]
        );
    }

    #[test]
    fn test_up_to_date_device_is_left_alone() {
        let mut dev = SimulatedDevice::new();
        dev.load(FLASH, image().raw_data());
        let (result, aborted_in, observer) = upload(&mut dev, UploadOptions::default());

        assert_eq!(result.unwrap(), UploadOutcome::AlreadyUpToDate);
        assert_eq!(aborted_in, None);
        assert_eq!(dev.erase_count(), 0);
        assert!(dev.commits().is_empty());
        assert_eq!(dev.reset_count(), 0);
        assert_eq!(observer.states(), vec![UploadState::Compare, UploadState::Done]);
    }

    #[test]
    fn test_force_reflashes_matching_device() {
        let mut dev = SimulatedDevice::new();
        dev.load(FLASH, image().raw_data());
        let options = UploadOptions {
            force: true,
            reset: true,
        };
        let (result, _, observer) = upload(&mut dev, options);

        assert!(matches!(result.unwrap(), UploadOutcome::Flashed { .. }));
        assert_eq!(dev.erase_count(), 1);
        assert_eq!(observer.states()[0], UploadState::BackupNvm);
    }

    #[test]
    fn test_nvm_survives_upload() {
        let mut dev = SimulatedDevice::new();
        dev.load(NVM, &nvm_pattern());
        let (result, _, _) = upload(&mut dev, UploadOptions::default());

        assert!(matches!(
            result.unwrap(),
            UploadOutcome::Flashed {
                nvm_restored: true,
                ..
            }
        ));
        assert_eq!(dev.dump(NVM, 64), nvm_pattern());
        // Only the one non-blank NVM chunk is rewritten.
        assert_eq!(dev.commits().last(), Some(&(NVM + 16)));
    }

    #[test]
    fn test_no_reset() {
        let mut dev = SimulatedDevice::new();
        let options = UploadOptions {
            force: false,
            reset: false,
        };
        let (result, _, observer) = upload(&mut dev, options);

        assert!(matches!(
            result.unwrap(),
            UploadOutcome::Flashed { reset: false, .. }
        ));
        assert_eq!(dev.reset_count(), 0);
        assert!(!observer.states().contains(&UploadState::Reset));
    }

    #[test]
    fn test_erase_failure_aborts_before_programming() {
        let mut dev = SimulatedDevice::new();
        dev.fail_erase_with(1);
        let (result, aborted_in, observer) = upload(&mut dev, UploadOptions::default());

        assert!(matches!(result, Err(FlashError::EraseFailure { status: 1 })));
        assert_eq!(aborted_in, Some(UploadState::Erase));
        assert!(dev.commits().is_empty());

        // A failed erase status does not prove anything was erased.
        let warnings = warnings(&observer);
        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].contains("may have been erased"));
    }

    #[test]
    fn test_program_failure_leaves_nvm_unrestored() {
        let mut dev = SimulatedDevice::new();
        dev.load(NVM, &nvm_pattern());
        dev.inject_checksum_fault(FLASH + 0x10);
        let (result, aborted_in, observer) = upload(&mut dev, UploadOptions::default());

        assert!(matches!(
            result,
            Err(FlashError::ChecksumMismatch { address: 0x1010, .. })
        ));
        assert_eq!(aborted_in, Some(UploadState::Program));
        assert_eq!(dev.commits(), &[0x1000, 0x1010]);
        assert_eq!(dev.dump(NVM, 64), vec![0xFF; 64]);
        assert_eq!(dev.reset_count(), 0);
        assert!(
            warnings(&observer)
                .iter()
                .any(|w| w.contains("NVM config was erased and has not been restored"))
        );
    }

    #[test]
    fn test_image_reaching_nvm_is_rejected_before_bus_traffic() {
        let mut dev = SimulatedDevice::new();
        dev.load(NVM, &nvm_pattern());
        let config = config();
        let oversized = FirmwareImage::from_bytes(vec![0u8; (NVM - FLASH) as usize + 1]);
        let mut uploader = Uploader::with_observer(
            &mut dev,
            &config,
            UploadOptions {
                force: true,
                reset: true,
            },
            Arc::new(RecordingObserver::default()),
        );

        let result = uploader.run(&oversized);
        assert!(matches!(
            result,
            Err(FlashError::Config(ConfigError::ImageTooLarge { limit: 0x7000, .. }))
        ));
        assert_eq!(uploader.aborted_in(), Some(UploadState::Start));
        assert_eq!(dev.read_count(), 0);
        assert_eq!(dev.erase_count(), 0);
        assert_eq!(dev.dump(NVM, 64), nvm_pattern());
    }

    #[test]
    fn test_default_layout_preserves_full_nvm_region() {
        let config = FlashConfig {
            scratch_write_delay_us: 0,
            ..FlashConfig::default()
        };
        let layout = config.layout;
        assert_eq!(layout.nvm_chunks(), 512);

        // Data in the first, a middle and the last chunk; a middle chunk with
        // some erased bytes still counts as data. Everything else is erased.
        let mut nvm = vec![0xFFu8; layout.nvm_size as usize];
        let dirty = [0usize, 255, 256, 511];
        for (n, &chunk) in dirty.iter().enumerate() {
            let start = chunk * 16;
            for (i, byte) in nvm[start..start + 16].iter_mut().enumerate() {
                *byte = (n * 16 + i) as u8;
            }
        }
        nvm[256 * 16 + 8..256 * 16 + 16].fill(0xFF);

        let mut dev = SimulatedDevice::new();
        dev.load(layout.nvm_base, &nvm);
        let mut uploader = Uploader::with_observer(
            &mut dev,
            &config,
            UploadOptions::default(),
            Arc::new(RecordingObserver::default()),
        );
        let outcome = uploader.run(&image()).unwrap();

        assert_eq!(
            outcome,
            UploadOutcome::Flashed {
                nvm_restored: true,
                verification: Comparison::Match,
                reset: true
            }
        );
        assert_eq!(dev.dump(layout.nvm_base, layout.nvm_size as usize), nvm);

        let program_commits = image().chunk_count();
        let restore_commits: Vec<u32> = dirty
            .iter()
            .map(|&chunk| layout.nvm_base + (chunk * 16) as u32)
            .collect();
        assert_eq!(&dev.commits()[..program_commits], &[0x1000, 0x1010, 0x1020, 0x1030]);
        assert_eq!(&dev.commits()[program_commits..], restore_commits.as_slice());
    }

    /// Flips the low bit of one word on read once the device has been erased.
    struct StuckBit {
        inner: SimulatedDevice,
        address: u32,
    }

    impl DeviceSession for StuckBit {
        fn read_flash_32(&mut self, address: u32) -> Result<u32, SessionError> {
            let value = self.inner.read_flash_32(address)?;
            if address == self.address && self.inner.erase_count() > 0 {
                Ok(value ^ 1)
            } else {
                Ok(value)
            }
        }

        fn write_scratch_32(&mut self, index: u8, value: u32) -> Result<(), SessionError> {
            self.inner.write_scratch_32(index, value)
        }

        fn commit(&mut self, address: u32, seed: Option<u32>) -> Result<u32, SessionError> {
            self.inner.commit(address, seed)
        }

        fn erase_all(&mut self, seed: Option<u32>) -> Result<u8, SessionError> {
            self.inner.erase_all(seed)
        }

        fn reset(&mut self) -> Result<(), SessionError> {
            self.inner.reset()
        }

        fn command_seed(&self) -> Option<u32> {
            self.inner.command_seed()
        }
    }

    #[test]
    fn test_verify_mismatch_is_reported_not_raised() {
        let mut dev = StuckBit {
            inner: SimulatedDevice::new(),
            address: FLASH + 0x20,
        };
        let config = config();
        let mut uploader = Uploader::with_observer(
            &mut dev,
            &config,
            UploadOptions::default(),
            Arc::new(RecordingObserver::default()),
        );

        let outcome = uploader.run(&image()).unwrap();
        assert_eq!(uploader.state(), UploadState::Done);
        assert_eq!(
            outcome,
            UploadOutcome::Flashed {
                nvm_restored: false,
                verification: Comparison::Mismatch {
                    address: FLASH + 0x20,
                    expected: 0x2322_2120,
                    actual: 0x2322_2121,
                },
                reset: true,
            }
        );
        assert_eq!(dev.inner.reset_count(), 1);
    }

    #[test]
    fn test_seeded_device_negotiates_once() {
        let mut dev = SimulatedDevice::with_seed(0x1234_5678);
        let observer = Arc::new(RecordingObserver::default());
        let config = config();
        let mut uploader =
            Uploader::with_observer(&mut dev, &config, UploadOptions::default(), observer);
        assert_eq!(uploader.command_form(), CommandForm::Seeded(0x1234_5678));
        assert!(uploader.run(&image()).is_ok());
        assert_eq!(dev.erase_count(), 1);
    }

    #[test]
    fn test_second_run_is_rejected() {
        let mut dev = SimulatedDevice::new();
        let config = config();
        let mut uploader = Uploader::with_observer(
            &mut dev,
            &config,
            UploadOptions::default(),
            Arc::new(RecordingObserver::default()),
        );
        uploader.run(&image()).unwrap();
        assert!(matches!(
            uploader.run(&image()),
            Err(FlashError::InvalidTransition { .. })
        ));
    }
}
