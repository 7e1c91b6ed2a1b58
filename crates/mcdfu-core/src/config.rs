//! Flashing configuration.
//!
//! Everything that depends on the target's memory map or on the bus lives
//! here so the same pipeline can drive different devices (and simulated ones
//! in tests).

use std::time::Duration;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::protocol::constants::{
    CAN_EFF_MASK, CAN_SFF_MASK, CHUNK_BYTES, DEFAULT_BITRATE, DEFAULT_FLASH_BASE,
    DEFAULT_NVM_BASE, DEFAULT_NVM_SIZE, DEFAULT_RESPONSE_TIMEOUT_MS,
    DEFAULT_SCRATCH_WRITE_DELAY_US,
};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{name} 0x{address:08X} is not aligned to 16 bytes")]
    Misaligned { name: &'static str, address: u32 },

    #[error("NVM size {size} is not a non-zero multiple of 16 bytes")]
    InvalidNvmSize { size: u32 },

    #[error("NVM region 0x{start:08X}..0x{end:08X} overlaps the flash base 0x{flash_base:08X}")]
    NvmOverlapsFlashBase { start: u32, end: u32, flash_base: u32 },

    #[error("NVM region 0x{start:08X} + {size} exceeds the 32-bit address space")]
    NvmOutOfRange { start: u32, size: u32 },

    #[error("No device profile configured; add a [profile] table to the config file")]
    MissingProfile,

    #[error("Bitrate must be non-zero")]
    ZeroBitrate,

    #[error("node_id_shift {shift} leaves no room for a node id (must be below 32)")]
    InvalidNodeIdShift { shift: u8 },

    #[error("Endpoint {name} = {endpoint} does not fit below the node id shift of {shift} bits")]
    EndpointOverflowsShift {
        name: &'static str,
        endpoint: u16,
        shift: u8,
    },

    #[error("Node {node_id} endpoint {endpoint} needs a frame id above 0x{max:08X}")]
    FrameIdOutOfRange { node_id: u8, endpoint: u16, max: u32 },

    #[error("Image of {len} bytes at 0x{flash_base:08X} exceeds the {limit} bytes available below NVM")]
    ImageTooLarge { len: u64, flash_base: u32, limit: u64 },
}

/// Device memory map.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryLayout {
    /// Address of the first firmware image byte.
    pub flash_base: u32,
    /// Address of the reserved NVM config region.
    pub nvm_base: u32,
    /// Size of the NVM config region in bytes.
    pub nvm_size: u32,
}

impl Default for MemoryLayout {
    fn default() -> Self {
        Self {
            flash_base: DEFAULT_FLASH_BASE,
            nvm_base: DEFAULT_NVM_BASE,
            nvm_size: DEFAULT_NVM_SIZE,
        }
    }
}

impl MemoryLayout {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let align = CHUNK_BYTES as u32;
        if self.flash_base % align != 0 {
            return Err(ConfigError::Misaligned {
                name: "flash_base",
                address: self.flash_base,
            });
        }
        if self.nvm_base % align != 0 {
            return Err(ConfigError::Misaligned {
                name: "nvm_base",
                address: self.nvm_base,
            });
        }
        if self.nvm_size == 0 || self.nvm_size % align != 0 {
            return Err(ConfigError::InvalidNvmSize {
                size: self.nvm_size,
            });
        }
        let end = self
            .nvm_base
            .checked_add(self.nvm_size)
            .ok_or(ConfigError::NvmOutOfRange {
                start: self.nvm_base,
                size: self.nvm_size,
            })?;
        if (self.nvm_base..end).contains(&self.flash_base) {
            return Err(ConfigError::NvmOverlapsFlashBase {
                start: self.nvm_base,
                end,
                flash_base: self.flash_base,
            });
        }
        Ok(())
    }

    /// Number of 16-byte chunks in the NVM region.
    pub fn nvm_chunks(&self) -> usize {
        self.nvm_size as usize / CHUNK_BYTES
    }

    /// Number of 32-bit words in the NVM region.
    pub fn nvm_words(&self) -> usize {
        self.nvm_size as usize / 4
    }

    /// Bytes an image may occupy from `flash_base` without reaching NVM
    /// (or the end of the address space when NVM sits below the flash base).
    pub fn max_image_len(&self) -> u64 {
        let end = if self.nvm_base > self.flash_base {
            self.nvm_base as u64
        } else {
            1u64 << 32
        };
        end - self.flash_base as u64
    }

    /// Reject an image of `len` bytes (padded to whole chunks) that would
    /// be programmed into the NVM region.
    pub fn check_image_fits(&self, len: usize) -> Result<(), ConfigError> {
        let padded = (len.div_ceil(CHUNK_BYTES) * CHUNK_BYTES) as u64;
        let limit = self.max_image_len();
        if padded > limit {
            return Err(ConfigError::ImageTooLarge {
                len: len as u64,
                flash_base: self.flash_base,
                limit,
            });
        }
        Ok(())
    }
}

/// Bus selection, overridable from the command line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    /// Backend names in order of preference; the first one that opens wins.
    pub backends: Vec<String>,
    /// Adapter index (for gs_usb: which matching USB adapter to open).
    pub channel: Option<u32>,
    pub bitrate: u32,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            backends: vec!["gs_usb".to_string()],
            channel: None,
            bitrate: DEFAULT_BITRATE,
        }
    }
}

/// CAN endpoint identifiers of the bootloader command set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointMap {
    pub protocol_hash: u16,
    pub read_flash_32: u16,
    pub write_scratch_32: u16,
    pub commit: u16,
    pub erase_all: u16,
    pub reset: u16,
}

impl EndpointMap {
    /// Every endpoint with its command name.
    pub fn named(&self) -> [(&'static str, u16); 6] {
        [
            ("protocol_hash", self.protocol_hash),
            ("read_flash_32", self.read_flash_32),
            ("write_scratch_32", self.write_scratch_32),
            ("commit", self.commit),
            ("erase_all", self.erase_all),
            ("reset", self.reset),
        ]
    }
}

/// How the target firmware maps commands onto CAN frames.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceProfile {
    /// Frame id is `(node_id << node_id_shift) | endpoint`.
    pub node_id_shift: u8,
    /// Use 29-bit identifiers.
    #[serde(default)]
    pub extended_id: bool,
    /// Whether `commit`/`erase_all` take the protocol hash as a trailing
    /// argument. Older bootloaders do not.
    #[serde(default)]
    pub seeded_commands: bool,
    pub endpoints: EndpointMap,
}

impl DeviceProfile {
    /// Check the id layout independently of any node id.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let shift = self.node_id_shift;
        if shift >= 32 {
            return Err(ConfigError::InvalidNodeIdShift { shift });
        }
        for (name, endpoint) in self.endpoints.named() {
            if (endpoint as u64) >> shift != 0 {
                return Err(ConfigError::EndpointOverflowsShift {
                    name,
                    endpoint,
                    shift,
                });
            }
        }
        Ok(())
    }

    /// Largest arbitration id the configured id width can carry.
    pub fn max_frame_id(&self) -> u32 {
        if self.extended_id {
            CAN_EFF_MASK
        } else {
            CAN_SFF_MASK
        }
    }

    /// Arbitration id for `endpoint` on `node_id`: `(node_id << shift) | endpoint`.
    pub fn frame_id(&self, node_id: u8, endpoint: u16) -> Result<u32, ConfigError> {
        let max = self.max_frame_id();
        let out_of_range = ConfigError::FrameIdOutOfRange {
            node_id,
            endpoint,
            max,
        };
        let id = (node_id as u64)
            .checked_shl(self.node_id_shift as u32)
            .filter(|base| base >> self.node_id_shift == node_id as u64)
            .ok_or_else(|| out_of_range.clone())?
            | endpoint as u64;
        if id > max as u64 {
            return Err(out_of_range);
        }
        Ok(id as u32)
    }
}

/// Complete configuration for one flashing run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FlashConfig {
    /// Delay between successive scratch writes, in microseconds.
    pub scratch_write_delay_us: u64,
    /// How long to wait for a response to one request.
    pub response_timeout_ms: u64,
    pub layout: MemoryLayout,
    pub bus: BusConfig,
    pub profile: Option<DeviceProfile>,
}

impl Default for FlashConfig {
    fn default() -> Self {
        Self {
            scratch_write_delay_us: DEFAULT_SCRATCH_WRITE_DELAY_US,
            response_timeout_ms: DEFAULT_RESPONSE_TIMEOUT_MS,
            layout: MemoryLayout::default(),
            bus: BusConfig::default(),
            profile: None,
        }
    }
}

impl FlashConfig {
    /// Load configuration from a TOML file
    pub fn load_from_file<P: AsRef<std::path::Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: FlashConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn save_to_file<P: AsRef<std::path::Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.layout.validate()?;
        if self.bus.bitrate == 0 {
            return Err(ConfigError::ZeroBitrate);
        }
        if let Some(profile) = &self.profile {
            profile.validate()?;
        }
        Ok(())
    }

    pub fn scratch_write_delay(&self) -> Duration {
        Duration::from_micros(self.scratch_write_delay_us)
    }

    pub fn response_timeout(&self) -> Duration {
        Duration::from_millis(self.response_timeout_ms)
    }

    /// The device profile, required for talking to real hardware.
    pub fn require_profile(&self) -> Result<&DeviceProfile, ConfigError> {
        self.profile.as_ref().ok_or(ConfigError::MissingProfile)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
scratch_write_delay_us = 20

[layout]
nvm_base = 0x3E000
nvm_size = 4096

[bus]
backends = ["gs_usb"]
bitrate = 500000

[profile]
node_id_shift = 6
seeded_commands = true

[profile.endpoints]
protocol_hash = 0
read_flash_32 = 1
write_scratch_32 = 2
commit = 3
erase_all = 4
reset = 5
"#;

    #[test]
    fn test_default_layout_is_valid() {
        let layout = MemoryLayout::default();
        assert!(layout.validate().is_ok());
        assert_eq!(layout.nvm_chunks(), 512);
        assert_eq!(layout.nvm_words(), 2048);
    }

    #[test]
    fn test_parse_partial_toml_keeps_defaults() {
        let config: FlashConfig = toml::from_str(SAMPLE).unwrap();
        assert_eq!(config.layout.flash_base, DEFAULT_FLASH_BASE);
        assert_eq!(config.layout.nvm_base, 0x3E000);
        assert_eq!(config.layout.nvm_size, 4096);
        assert_eq!(config.scratch_write_delay(), Duration::from_micros(20));
        assert_eq!(config.response_timeout_ms, DEFAULT_RESPONSE_TIMEOUT_MS);
        assert_eq!(config.bus.bitrate, 500_000);

        let profile = config.require_profile().unwrap();
        assert!(profile.seeded_commands);
        assert!(!profile.extended_id);
        assert_eq!(profile.frame_id(3, profile.endpoints.commit), Ok((3 << 6) | 3));
    }

    #[test]
    fn test_missing_profile() {
        let config = FlashConfig::default();
        assert_eq!(config.require_profile(), Err(ConfigError::MissingProfile));
    }

    #[test]
    fn test_toml_round_trip() {
        let config: FlashConfig = toml::from_str(SAMPLE).unwrap();
        let text = toml::to_string_pretty(&config).unwrap();
        let back: FlashConfig = toml::from_str(&text).unwrap();
        assert_eq!(config, back);
    }

    #[test]
    fn test_save_and_load_file() {
        let path = std::env::temp_dir().join(format!("mcdfu-config-{}.toml", std::process::id()));
        let config: FlashConfig = toml::from_str(SAMPLE).unwrap();
        config.save_to_file(&path).unwrap();
        assert_eq!(FlashConfig::load_from_file(&path).unwrap(), config);

        let bad = FlashConfig {
            layout: MemoryLayout {
                nvm_size: 0,
                ..Default::default()
            },
            ..config
        };
        bad.save_to_file(&path).unwrap();
        assert!(FlashConfig::load_from_file(&path).is_err());
        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn test_layout_validation() {
        let misaligned = MemoryLayout {
            nvm_base: 0x1E004,
            ..Default::default()
        };
        assert!(matches!(
            misaligned.validate(),
            Err(ConfigError::Misaligned { name: "nvm_base", .. })
        ));

        let bad_size = MemoryLayout {
            nvm_size: 100,
            ..Default::default()
        };
        assert_eq!(
            bad_size.validate(),
            Err(ConfigError::InvalidNvmSize { size: 100 })
        );

        let overlapping = MemoryLayout {
            flash_base: 0x1E010,
            ..Default::default()
        };
        assert!(matches!(
            overlapping.validate(),
            Err(ConfigError::NvmOverlapsFlashBase { .. })
        ));

        let wrapping = MemoryLayout {
            nvm_base: 0xFFFF_F000,
            nvm_size: 0x2000,
            ..Default::default()
        };
        assert!(matches!(
            wrapping.validate(),
            Err(ConfigError::NvmOutOfRange { .. })
        ));
    }

    fn sample_profile() -> DeviceProfile {
        let config: FlashConfig = toml::from_str(SAMPLE).unwrap();
        config.profile.unwrap()
    }

    #[test]
    fn test_profile_shift_must_leave_room() {
        let mut profile = sample_profile();
        profile.node_id_shift = 32;
        assert_eq!(
            profile.validate(),
            Err(ConfigError::InvalidNodeIdShift { shift: 32 })
        );

        let mut config: FlashConfig = toml::from_str(SAMPLE).unwrap();
        config.profile = Some(profile);
        assert_eq!(
            config.validate(),
            Err(ConfigError::InvalidNodeIdShift { shift: 32 })
        );
    }

    #[test]
    fn test_profile_endpoint_must_fit_below_shift() {
        let mut profile = sample_profile();
        profile.endpoints.reset = 64;
        assert_eq!(
            profile.validate(),
            Err(ConfigError::EndpointOverflowsShift {
                name: "reset",
                endpoint: 64,
                shift: 6
            })
        );
        profile.endpoints.reset = 63;
        assert!(profile.validate().is_ok());
    }

    #[test]
    fn test_frame_id_respects_id_width() {
        let mut profile = sample_profile();
        assert_eq!(profile.frame_id(31, 4), Ok((31 << 6) | 4));
        assert_eq!(
            profile.frame_id(32, 4),
            Err(ConfigError::FrameIdOutOfRange {
                node_id: 32,
                endpoint: 4,
                max: CAN_SFF_MASK
            })
        );

        profile.extended_id = true;
        assert_eq!(profile.frame_id(32, 4), Ok(0x804));
    }

    #[test]
    fn test_frame_id_with_oversized_shift_does_not_panic() {
        let mut profile = sample_profile();
        profile.extended_id = true;
        for shift in [29, 32, 40, 64, 255] {
            profile.node_id_shift = shift;
            assert!(profile.frame_id(1, 0).is_err(), "shift {}", shift);
        }
    }

    #[test]
    fn test_image_must_stay_below_nvm() {
        let layout = MemoryLayout::default();
        assert_eq!(layout.max_image_len(), 0x1D000);
        assert!(layout.check_image_fits(0x1D000).is_ok());
        // A partial last chunk is still programmed as a whole chunk.
        assert!(layout.check_image_fits(0x1D000 - 15).is_ok());
        assert!(matches!(
            layout.check_image_fits(0x1D001),
            Err(ConfigError::ImageTooLarge { len: 0x1D001, .. })
        ));

        let nvm_first = MemoryLayout {
            flash_base: 0x4000,
            nvm_base: 0x1000,
            nvm_size: 0x1000,
        };
        assert_eq!(nvm_first.max_image_len(), (1u64 << 32) - 0x4000);
    }

    #[test]
    fn test_zero_bitrate_rejected() {
        let mut config = FlashConfig::default();
        config.bus.bitrate = 0;
        assert_eq!(config.validate(), Err(ConfigError::ZeroBitrate));
    }
}
