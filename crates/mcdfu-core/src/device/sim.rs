//! In-memory bootloader model for testing.
//!
//! Behaves like the real command set: flash reads back `0xFF` when erased,
//! programming can only clear bits, and `commit` reports the sum of the staged
//! scratch words. Faults can be injected per address.

use std::collections::{BTreeMap, HashSet};

use byteorder::{ByteOrder, LittleEndian};

use super::traits::{DeviceSession, SessionError};
use crate::protocol::checksum;
use crate::protocol::constants::{CHUNK_WORDS, ERASE_OK, ERASED_WORD};

#[derive(Debug, Default)]
pub struct SimulatedDevice {
    /// Programmed words by address; anything absent is erased.
    flash: BTreeMap<u32, u32>,
    scratch: [u32; CHUNK_WORDS],
    seed: Option<u32>,
    erase_status: u8,
    checksum_faults: HashSet<u32>,
    commits: Vec<u32>,
    erase_count: usize,
    reset_count: usize,
    read_count: usize,
}

impl SimulatedDevice {
    /// Blank device with a legacy (unseeded) command set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Blank device whose `commit`/`erase_all` require `seed`.
    pub fn with_seed(seed: u32) -> Self {
        Self {
            seed: Some(seed),
            ..Self::default()
        }
    }

    /// Write `bytes` directly into flash, bypassing the command set.
    ///
    /// `address` must be word aligned; a trailing partial word is padded
    /// with `0xFF`.
    pub fn load(&mut self, address: u32, bytes: &[u8]) {
        for (i, word) in bytes.chunks(4).enumerate() {
            let mut padded = [0xFFu8; 4];
            padded[..word.len()].copy_from_slice(word);
            let value = LittleEndian::read_u32(&padded);
            let addr = address + (i as u32) * 4;
            if value == ERASED_WORD {
                self.flash.remove(&addr);
            } else {
                self.flash.insert(addr, value);
            }
        }
    }

    /// Read `len` bytes of flash without counting as bus traffic.
    pub fn dump(&self, address: u32, len: usize) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(len.div_ceil(4) * 4);
        for i in 0..len.div_ceil(4) {
            let addr = address + (i as u32) * 4;
            bytes.extend_from_slice(&self.word(addr).to_le_bytes());
        }
        bytes.truncate(len);
        bytes
    }

    /// Make `erase_all` fail with `status` (and leave flash untouched).
    pub fn fail_erase_with(&mut self, status: u8) {
        self.erase_status = status;
    }

    /// Make the commit at `address` report a corrupted checksum.
    pub fn inject_checksum_fault(&mut self, address: u32) {
        self.checksum_faults.insert(address);
    }

    /// Addresses of every commit, in order.
    pub fn commits(&self) -> &[u32] {
        &self.commits
    }

    pub fn erase_count(&self) -> usize {
        self.erase_count
    }

    pub fn reset_count(&self) -> usize {
        self.reset_count
    }

    pub fn read_count(&self) -> usize {
        self.read_count
    }

    fn word(&self, address: u32) -> u32 {
        self.flash.get(&address).copied().unwrap_or(ERASED_WORD)
    }

    fn check_seed(&self, command: &'static str, seed: Option<u32>) -> Result<(), SessionError> {
        match (self.seed, seed) {
            (None, Some(_)) => Err(SessionError::UnsupportedArgument { command }),
            (Some(expected), Some(got)) if expected == got => Ok(()),
            (Some(expected), got) => Err(SessionError::Rejected(format!(
                "{} expects seed 0x{:08X}, got {:?}",
                command, expected, got
            ))),
            (None, None) => Ok(()),
        }
    }
}

impl DeviceSession for SimulatedDevice {
    fn read_flash_32(&mut self, address: u32) -> Result<u32, SessionError> {
        if address % 4 != 0 {
            return Err(SessionError::Rejected(format!(
                "unaligned read at 0x{:08X}",
                address
            )));
        }
        self.read_count += 1;
        Ok(self.word(address))
    }

    fn write_scratch_32(&mut self, index: u8, value: u32) -> Result<(), SessionError> {
        let slot = self
            .scratch
            .get_mut(index as usize)
            .ok_or(SessionError::InvalidScratchIndex(index))?;
        *slot = value;
        Ok(())
    }

    fn commit(&mut self, address: u32, seed: Option<u32>) -> Result<u32, SessionError> {
        self.check_seed("commit", seed)?;
        if address % 4 != 0 {
            return Err(SessionError::Rejected(format!(
                "unaligned commit at 0x{:08X}",
                address
            )));
        }

        for (i, value) in self.scratch.iter().enumerate() {
            let addr = address + (i as u32) * 4;
            let programmed = self.word(addr) & value;
            if programmed == ERASED_WORD {
                self.flash.remove(&addr);
            } else {
                self.flash.insert(addr, programmed);
            }
        }
        self.commits.push(address);

        let sum = checksum(&self.scratch);
        if self.checksum_faults.contains(&address) {
            Ok(sum.wrapping_add(1))
        } else {
            Ok(sum)
        }
    }

    fn erase_all(&mut self, seed: Option<u32>) -> Result<u8, SessionError> {
        self.check_seed("erase_all", seed)?;
        if self.erase_status != ERASE_OK {
            return Ok(self.erase_status);
        }
        self.flash.clear();
        self.erase_count += 1;
        Ok(ERASE_OK)
    }

    fn reset(&mut self) -> Result<(), SessionError> {
        self.reset_count += 1;
        Ok(())
    }

    fn command_seed(&self) -> Option<u32> {
        self.seed
    }
}
