//! The 16-byte programming unit and its checksum.

use std::fmt;

use byteorder::{ByteOrder, LittleEndian};

use super::constants::{CHUNK_BYTES, CHUNK_WORDS, ERASED_BYTE};

/// One commit worth of data: four words destined for `address`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Chunk {
    pub address: u32,
    pub words: [u32; CHUNK_WORDS],
}

impl Chunk {
    /// Build a chunk from up to 16 bytes.
    ///
    /// Short input is zero-extended: a trailing 1-3 byte fragment becomes the
    /// low bytes of its word and missing words read as zero.
    pub fn from_bytes(address: u32, bytes: &[u8]) -> Self {
        let mut padded = [0u8; CHUNK_BYTES];
        let len = bytes.len().min(CHUNK_BYTES);
        padded[..len].copy_from_slice(&bytes[..len]);

        let mut words = [0u32; CHUNK_WORDS];
        LittleEndian::read_u32_into(&padded, &mut words);
        Self { address, words }
    }

    /// Host-side checksum, compared against the value returned by `commit`.
    pub fn checksum(&self) -> u32 {
        checksum(&self.words)
    }

    /// Address of word `index` within this chunk.
    pub fn word_address(&self, index: usize) -> u32 {
        self.address + (index as u32) * 4
    }

    pub fn to_bytes(&self) -> [u8; CHUNK_BYTES] {
        let mut bytes = [0u8; CHUNK_BYTES];
        LittleEndian::write_u32_into(&self.words, &mut bytes);
        bytes
    }
}

impl fmt::Display for Chunk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "chunk@0x{:08X}", self.address)
    }
}

/// Sum of the words modulo 2^32.
///
/// This is what the bootloader computes after a commit. It does not detect
/// reordered words within a chunk; changing it needs a bootloader protocol
/// bump.
pub fn checksum(words: &[u32]) -> u32 {
    words.iter().fold(0u32, |acc, w| acc.wrapping_add(*w))
}

/// True when every byte is in the erased state.
pub fn is_erased(bytes: &[u8]) -> bool {
    bytes.iter().all(|&b| b == ERASED_BYTE)
}
