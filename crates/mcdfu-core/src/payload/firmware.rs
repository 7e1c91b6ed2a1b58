//! Firmware image loading and chunking.
//!
//! Images are flat binaries with no header: byte `n` of the file lands at
//! `flash_base + n`.

use std::path::Path;

use tracing::info;

use crate::error::FlashError;
use crate::protocol::Chunk;
use crate::protocol::constants::CHUNK_BYTES;

/// Immutable firmware image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FirmwareImage {
    data: Vec<u8>,
}

impl FirmwareImage {
    pub fn from_bytes(data: Vec<u8>) -> Self {
        Self { data }
    }

    /// Load an image from disk.
    ///
    /// Checked before any device traffic: a missing path is
    /// `ImageNotFound`, an empty file is `EmptyImage`.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, FlashError> {
        let path = path.as_ref();
        if !path.is_file() {
            return Err(FlashError::ImageNotFound {
                path: path.to_path_buf(),
            });
        }
        let data = std::fs::read(path)?;
        if data.is_empty() {
            return Err(FlashError::EmptyImage {
                path: path.to_path_buf(),
            });
        }
        info!(path = %path.display(), size = data.len(), "Loaded firmware image");
        Ok(Self::from_bytes(data))
    }

    /// Chunks of this image laid out from `base`.
    pub fn chunks(&self, base: u32) -> ChunkIterator<'_> {
        ChunkIterator::new(&self.data, base)
    }

    /// Number of commits needed to program the image.
    pub fn chunk_count(&self) -> usize {
        self.data.len().div_ceil(CHUNK_BYTES)
    }

    /// Get raw data.
    pub fn raw_data(&self) -> &[u8] {
        &self.data
    }

    /// Get total size.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Check if empty.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Iterator over 16-byte chunks; the last one may be a zero-padded partial.
#[derive(Debug)]
pub struct ChunkIterator<'a> {
    data: &'a [u8],
    base: u32,
    offset: usize,
}

impl<'a> ChunkIterator<'a> {
    pub fn new(data: &'a [u8], base: u32) -> Self {
        Self {
            data,
            base,
            offset: 0,
        }
    }

    /// Bytes of source data consumed so far.
    pub fn consumed(&self) -> usize {
        self.offset
    }
}

impl Iterator for ChunkIterator<'_> {
    type Item = Chunk;

    fn next(&mut self) -> Option<Self::Item> {
        if self.offset >= self.data.len() {
            return None;
        }

        let end = (self.offset + CHUNK_BYTES).min(self.data.len());
        let chunk = Chunk::from_bytes(self.base + self.offset as u32, &self.data[self.offset..end]);
        self.offset = end;
        Some(chunk)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let n = (self.data.len() - self.offset).div_ceil(CHUNK_BYTES);
        (n, Some(n))
    }
}

impl ExactSizeIterator for ChunkIterator<'_> {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chunk_addresses_advance_by_16() {
        let image = FirmwareImage::from_bytes((0u8..64).collect());
        let chunks: Vec<_> = image.chunks(0x1000).collect();
        assert_eq!(chunks.len(), 4);
        assert_eq!(image.chunk_count(), 4);
        for (i, chunk) in chunks.iter().enumerate() {
            assert_eq!(chunk.address, 0x1000 + 16 * i as u32);
        }
        assert_eq!(chunks[1].words[0], 0x1312_1110);
    }

    #[test]
    fn test_trailing_partial_chunk() {
        let image = FirmwareImage::from_bytes(vec![0xAB; 20]);
        let mut iter = image.chunks(0x1000);
        assert_eq!(iter.len(), 2);

        iter.next().unwrap();
        let last = iter.next().unwrap();
        assert_eq!(last.address, 0x1010);
        assert_eq!(last.words, [0xABAB_ABAB, 0, 0, 0]);
        assert_eq!(iter.consumed(), 20);
        assert!(iter.next().is_none());
    }

    #[test]
    fn test_load_missing_file() {
        let path = std::env::temp_dir().join("mcdfu-missing-image.bin");
        let _ = std::fs::remove_file(&path);
        assert!(matches!(
            FirmwareImage::load(&path),
            Err(FlashError::ImageNotFound { .. })
        ));
    }

    #[test]
    fn test_load_empty_and_valid_file() {
        let dir = std::env::temp_dir();
        let empty = dir.join(format!("mcdfu-empty-{}.bin", std::process::id()));
        std::fs::write(&empty, b"").unwrap();
        assert!(matches!(
            FirmwareImage::load(&empty),
            Err(FlashError::EmptyImage { .. })
        ));
        std::fs::remove_file(&empty).unwrap();

        let valid = dir.join(format!("mcdfu-valid-{}.bin", std::process::id()));
        std::fs::write(&valid, [1, 2, 3, 4]).unwrap();
        let image = FirmwareImage::load(&valid).unwrap();
        assert_eq!(image.raw_data(), &[1, 2, 3, 4]);
        std::fs::remove_file(&valid).unwrap();
    }
}
