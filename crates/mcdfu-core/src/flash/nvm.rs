//! Preservation of the NVM config region across a full-chip erase.
//!
//! `erase_all` wipes the whole part, including the calibration and user
//! settings kept in NVM. The region is read into memory before erasing and
//! programmed back afterwards. Chunks that read back fully erased are
//! skipped on restore: they already hold their erased value.

use byteorder::{LittleEndian, WriteBytesExt};
use tracing::{debug, info, instrument};

use super::writer::ChunkWriter;
use crate::config::MemoryLayout;
use crate::device::DeviceSession;
use crate::error::FlashError;
use crate::events::{FlashEvent, FlashObserver, Operation};
use crate::protocol::constants::CHUNK_BYTES;
use crate::protocol::{Chunk, is_erased};

/// In-memory copy of the NVM region, present only if it held data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NvmBackup {
    data: Vec<u8>,
}

impl NvmBackup {
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Chunks holding data, in address order.
    fn dirty_chunks(&self, base: u32) -> impl Iterator<Item = Chunk> + '_ {
        self.data
            .chunks(CHUNK_BYTES)
            .enumerate()
            .filter(|(_, bytes)| !is_erased(bytes))
            .map(move |(i, bytes)| Chunk::from_bytes(base + (i * CHUNK_BYTES) as u32, bytes))
    }
}

/// Backs up and restores the NVM region.
#[derive(Debug, Clone, Copy)]
pub struct NvmPreserver {
    layout: MemoryLayout,
    writer: ChunkWriter,
}

impl NvmPreserver {
    pub fn new(layout: MemoryLayout, writer: ChunkWriter) -> Self {
        Self { layout, writer }
    }

    /// Read the whole NVM region.
    ///
    /// Returns `None` when every byte is erased, so an unconfigured device
    /// costs no restore writes.
    #[instrument(level = "debug", skip_all, fields(base = %format!("0x{:08X}", self.layout.nvm_base)))]
    pub fn backup<D, O>(&self, device: &mut D, observer: &O) -> Result<Option<NvmBackup>, FlashError>
    where
        D: DeviceSession + ?Sized,
        O: FlashObserver + ?Sized,
    {
        let total = self.layout.nvm_size as u64;
        let mut data = Vec::with_capacity(self.layout.nvm_size as usize);

        for i in 0..self.layout.nvm_words() {
            let address = self.layout.nvm_base + (i as u32) * 4;
            let word = device.read_flash_32(address)?;
            data.write_u32::<LittleEndian>(word)?;
            if data.len() % CHUNK_BYTES == 0 {
                observer.on_event(&FlashEvent::Progress {
                    operation: Operation::ReadNvm,
                    current: data.len() as u64,
                    total,
                });
            }
        }

        if is_erased(&data) {
            info!("NVM region is blank, nothing to preserve");
            return Ok(None);
        }
        debug!(bytes = data.len(), "NVM region backed up");
        Ok(Some(NvmBackup { data }))
    }

    /// Program `backup` back into the NVM region.
    ///
    /// Returns the number of chunks written. Each commit is checksum
    /// verified; the first mismatch aborts the restore.
    #[instrument(level = "debug", skip_all)]
    pub fn restore<D, O>(
        &self,
        device: &mut D,
        backup: Option<&NvmBackup>,
        observer: &O,
    ) -> Result<usize, FlashError>
    where
        D: DeviceSession + ?Sized,
        O: FlashObserver + ?Sized,
    {
        let Some(backup) = backup else {
            debug!("No NVM backup to restore");
            return Ok(0);
        };

        let total = backup.len() as u64;
        let mut written = 0;
        for chunk in backup.dirty_chunks(self.layout.nvm_base) {
            let checksum = self.writer.write(device, &chunk)?;
            observer.on_event(&FlashEvent::ChunkCommitted {
                address: chunk.address,
                checksum,
            });
            written += 1;

            let end = chunk.address - self.layout.nvm_base + CHUNK_BYTES as u32;
            observer.on_event(&FlashEvent::Progress {
                operation: Operation::WriteNvm,
                current: end as u64,
                total,
            });
        }

        info!(
            chunks = written,
            region_chunks = self.layout.nvm_chunks(),
            "NVM region restored"
        );
        Ok(written)
    }
}
