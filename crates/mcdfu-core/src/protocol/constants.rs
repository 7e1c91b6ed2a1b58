//! Bootloader protocol constants.
//!
//! Addresses below are the defaults for the stock motor-controller memory
//! map; they are only used to seed `MemoryLayout::default()`.

/// Words staged in the scratchpad per commit.
pub const CHUNK_WORDS: usize = 4;

/// Bytes programmed per commit.
pub const CHUNK_BYTES: usize = CHUNK_WORDS * 4;

/// Number of scratch registers exposed by the bootloader.
pub const SCRATCH_REGISTERS: u8 = CHUNK_WORDS as u8;

/// Start of the application area in program flash.
pub const DEFAULT_FLASH_BASE: u32 = 0x0000_1000;

/// NVM config region: pages 120-127, the last 8 KiB of flash.
pub const DEFAULT_NVM_BASE: u32 = 0x0001_E000;
pub const DEFAULT_NVM_SIZE: u32 = 8 * 1024;

/// Value of an erased flash byte.
pub const ERASED_BYTE: u8 = 0xFF;
pub const ERASED_WORD: u32 = 0xFFFF_FFFF;

/// `erase_all` status reported on success.
pub const ERASE_OK: u8 = 0;

/// Device-side settle time between scratch writes.
pub const DEFAULT_SCRATCH_WRITE_DELAY_US: u64 = 10;

/// Response timeout for a single request on the bus.
pub const DEFAULT_RESPONSE_TIMEOUT_MS: u64 = 1000;

pub const DEFAULT_BITRATE: u32 = 1_000_000;

/// Largest 11-bit (standard) arbitration id.
pub const CAN_SFF_MASK: u32 = 0x0000_07FF;
/// Largest 29-bit (extended) arbitration id.
pub const CAN_EFF_MASK: u32 = 0x1FFF_FFFF;
