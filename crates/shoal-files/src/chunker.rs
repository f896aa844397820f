//! Chunk layout, seekable file chunking and out-of-order reassembly.

use crate::{ChunkError, DEFAULT_CHUNK_SIZE, MAX_FILE_SIZE, Result};
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::ops::Range;
use std::path::Path;

/// Partition of a file into fixed-size chunks
///
/// Every chunk is `chunk_size` bytes except the final one, which holds the
/// remainder. A zero-byte file has zero chunks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkLayout {
    total_size: u64,
    chunk_size: usize,
}

impl ChunkLayout {
    /// Create a layout
    ///
    /// # Errors
    ///
    /// Returns `ChunkError::ZeroChunkSize` if `chunk_size` is zero.
    pub fn new(total_size: u64, chunk_size: usize) -> Result<Self> {
        if chunk_size == 0 {
            return Err(ChunkError::ZeroChunkSize);
        }
        Ok(Self {
            total_size,
            chunk_size,
        })
    }

    /// Total file size in bytes
    #[must_use]
    pub fn total_size(&self) -> u64 {
        self.total_size
    }

    /// Nominal chunk size in bytes
    #[must_use]
    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Number of chunks
    #[must_use]
    pub fn num_chunks(&self) -> u64 {
        self.total_size.div_ceil(self.chunk_size as u64)
    }

    /// Byte range covered by a chunk
    ///
    /// # Errors
    ///
    /// Returns `ChunkError::OutOfBounds` for an index past the last chunk.
    pub fn chunk_range(&self, index: u64) -> Result<Range<u64>> {
        let total = self.num_chunks();
        if index >= total {
            return Err(ChunkError::OutOfBounds { index, total });
        }
        let start = index * self.chunk_size as u64;
        let end = start.saturating_add(self.chunk_size as u64).min(self.total_size);
        Ok(start..end)
    }

    /// Length of a chunk in bytes
    ///
    /// # Errors
    ///
    /// Returns `ChunkError::OutOfBounds` for an index past the last chunk.
    pub fn chunk_len(&self, index: u64) -> Result<usize> {
        self.chunk_range(index).map(|r| (r.end - r.start) as usize)
    }
}

/// Seekable chunk reader over a local file
///
/// Used by the serving side to answer chunk requests and to build manifests.
pub struct FileChunker {
    file: File,
    layout: ChunkLayout,
    current_index: u64,
}

impl FileChunker {
    /// Open a file for chunking
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened, metadata cannot be read,
    /// or `chunk_size` is zero.
    pub fn new<P: AsRef<Path>>(path: P, chunk_size: usize) -> Result<Self> {
        let file = File::open(path)?;
        let total_size = file.metadata()?.len();

        Ok(Self {
            file,
            layout: ChunkLayout::new(total_size, chunk_size)?,
            current_index: 0,
        })
    }

    /// Open a file with the default chunk size
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened or metadata cannot be read.
    pub fn with_default_size<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::new(path, DEFAULT_CHUNK_SIZE)
    }

    /// Chunk layout of the underlying file
    #[must_use]
    pub fn layout(&self) -> ChunkLayout {
        self.layout
    }

    /// Number of chunks
    #[must_use]
    pub fn num_chunks(&self) -> u64 {
        self.layout.num_chunks()
    }

    /// Read the next chunk sequentially, `None` once the file is exhausted
    ///
    /// # Errors
    ///
    /// Returns an error if reading from the file fails.
    pub fn read_chunk(&mut self) -> Result<Option<Vec<u8>>> {
        if self.current_index >= self.layout.num_chunks() {
            return Ok(None);
        }
        let chunk = self.read_chunk_at(self.current_index)?;
        self.current_index += 1;
        Ok(Some(chunk))
    }

    /// Read a chunk by index
    ///
    /// # Errors
    ///
    /// Returns an error if the index is out of bounds or reading fails.
    pub fn read_chunk_at(&mut self, index: u64) -> Result<Vec<u8>> {
        let range = self.layout.chunk_range(index)?;
        let mut buffer = vec![0u8; (range.end - range.start) as usize];

        self.file.seek(SeekFrom::Start(range.start))?;
        self.file.read_exact(&mut buffer)?;

        Ok(buffer)
    }
}

/// In-memory reassembler for chunks arriving in any order
///
/// Tracks received chunks in a bitmap; a chunk written twice is counted once
/// and the later write wins.
pub struct ChunkReassembler {
    layout: ChunkLayout,
    buffer: Vec<u8>,
    /// Bitmap of received chunks: `bitmap[idx / 64] & (1 << (idx % 64))`
    chunk_bitmap: Vec<u64>,
    received_count: u64,
}

impl ChunkReassembler {
    /// Create a reassembler for the given layout
    ///
    /// # Errors
    ///
    /// Returns `ChunkError::TooLarge` if the file cannot be buffered in memory.
    pub fn new(layout: ChunkLayout) -> Result<Self> {
        let too_large = || ChunkError::TooLarge {
            size: layout.total_size(),
            limit: MAX_FILE_SIZE,
        };
        let len = usize::try_from(layout.total_size())
            .ok()
            .filter(|len| *len as u64 <= MAX_FILE_SIZE)
            .ok_or_else(too_large)?;

        let mut buffer = Vec::new();
        buffer.try_reserve_exact(len).map_err(|_| too_large())?;
        buffer.resize(len, 0);

        let bitmap_words = layout.num_chunks().div_ceil(64) as usize;
        Ok(Self {
            layout,
            buffer,
            chunk_bitmap: vec![0u64; bitmap_words],
            received_count: 0,
        })
    }

    /// Store a chunk at its index
    ///
    /// # Errors
    ///
    /// Returns an error if the index is out of bounds or the payload length
    /// does not match the layout.
    pub fn write_chunk(&mut self, index: u64, data: &[u8]) -> Result<()> {
        let range = self.layout.chunk_range(index)?;
        let expected = (range.end - range.start) as usize;
        if data.len() != expected {
            return Err(ChunkError::LengthMismatch {
                index,
                expected,
                actual: data.len(),
            });
        }

        self.buffer[range.start as usize..range.end as usize].copy_from_slice(data);

        if !bitmap_test(&self.chunk_bitmap, index) {
            bitmap_set(&mut self.chunk_bitmap, index);
            self.received_count += 1;
        }
        Ok(())
    }

    /// Whether a chunk has been stored
    #[must_use]
    pub fn has_chunk(&self, index: u64) -> bool {
        index < self.layout.num_chunks() && bitmap_test(&self.chunk_bitmap, index)
    }

    /// Indices not yet received, ascending
    #[must_use]
    pub fn missing_chunks(&self) -> Vec<u64> {
        (0..self.layout.num_chunks())
            .filter(|&i| !bitmap_test(&self.chunk_bitmap, i))
            .collect()
    }

    /// Number of chunks received
    #[must_use]
    pub fn received_count(&self) -> u64 {
        self.received_count
    }

    /// Progress (0.0 to 1.0)
    #[must_use]
    pub fn progress(&self) -> f64 {
        let total = self.layout.num_chunks();
        if total == 0 {
            1.0
        } else {
            self.received_count as f64 / total as f64
        }
    }

    /// Whether every chunk has been received
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.received_count == self.layout.num_chunks()
    }

    /// Concatenate the chunks in index order
    ///
    /// # Errors
    ///
    /// Returns `ChunkError::Incomplete` if any chunk is missing.
    pub fn finalize(self) -> Result<Vec<u8>> {
        if !self.is_complete() {
            return Err(ChunkError::Incomplete {
                received: self.received_count,
                total: self.layout.num_chunks(),
            });
        }
        Ok(self.buffer)
    }
}

fn bitmap_set(bitmap: &mut [u64], idx: u64) {
    bitmap[(idx / 64) as usize] |= 1u64 << (idx % 64);
}

fn bitmap_test(bitmap: &[u64], idx: u64) -> bool {
    (bitmap[(idx / 64) as usize] >> (idx % 64)) & 1 == 1
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_layout_last_chunk_shorter() {
        let layout = ChunkLayout::new(10_000, 4096).unwrap();
        assert_eq!(layout.num_chunks(), 3);
        assert_eq!(layout.chunk_len(0).unwrap(), 4096);
        assert_eq!(layout.chunk_len(1).unwrap(), 4096);
        assert_eq!(layout.chunk_len(2).unwrap(), 10_000 - 8192);
        assert_eq!(layout.chunk_range(2).unwrap(), 8192..10_000);
    }

    #[test]
    fn test_layout_exact_multiple() {
        let layout = ChunkLayout::new(8192, 4096).unwrap();
        assert_eq!(layout.num_chunks(), 2);
        assert_eq!(layout.chunk_len(1).unwrap(), 4096);
    }

    #[test]
    fn test_layout_empty_file() {
        let layout = ChunkLayout::new(0, 4096).unwrap();
        assert_eq!(layout.num_chunks(), 0);
        assert!(matches!(
            layout.chunk_range(0),
            Err(ChunkError::OutOfBounds { index: 0, total: 0 })
        ));
    }

    #[test]
    fn test_layout_zero_chunk_size() {
        assert!(matches!(
            ChunkLayout::new(100, 0),
            Err(ChunkError::ZeroChunkSize)
        ));
    }

    #[test]
    fn test_chunker_sequential_and_random_access() {
        let mut temp_file = NamedTempFile::new().unwrap();
        let data: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();
        temp_file.write_all(&data).unwrap();
        temp_file.flush().unwrap();

        let mut chunker = FileChunker::new(temp_file.path(), 4096).unwrap();
        assert_eq!(chunker.num_chunks(), 3);

        let mut chunks = Vec::new();
        while let Some(chunk) = chunker.read_chunk().unwrap() {
            chunks.push(chunk);
        }
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks.concat(), data);

        let middle = chunker.read_chunk_at(1).unwrap();
        assert_eq!(middle, &data[4096..8192]);
        assert!(chunker.read_chunk_at(3).is_err());
    }

    #[test]
    fn test_reassembler_out_of_order() {
        let data: Vec<u8> = (0..10_000u32).map(|i| (i % 7) as u8).collect();
        let layout = ChunkLayout::new(data.len() as u64, 4096).unwrap();
        let mut reassembler = ChunkReassembler::new(layout).unwrap();

        for index in [2u64, 0, 1] {
            let range = layout.chunk_range(index).unwrap();
            reassembler
                .write_chunk(index, &data[range.start as usize..range.end as usize])
                .unwrap();
        }

        assert!(reassembler.is_complete());
        assert_eq!(reassembler.progress(), 1.0);
        assert_eq!(reassembler.finalize().unwrap(), data);
    }

    #[test]
    fn test_reassembler_duplicate_write_counted_once() {
        let layout = ChunkLayout::new(8, 4).unwrap();
        let mut reassembler = ChunkReassembler::new(layout).unwrap();

        reassembler.write_chunk(0, &[1, 2, 3, 4]).unwrap();
        reassembler.write_chunk(0, &[1, 2, 3, 4]).unwrap();

        assert_eq!(reassembler.received_count(), 1);
        assert_eq!(reassembler.missing_chunks(), vec![1]);
        assert!(!reassembler.is_complete());
    }

    #[test]
    fn test_reassembler_rejects_wrong_length() {
        let layout = ChunkLayout::new(10, 4).unwrap();
        let mut reassembler = ChunkReassembler::new(layout).unwrap();

        let result = reassembler.write_chunk(2, &[0u8; 4]);
        assert!(matches!(
            result,
            Err(ChunkError::LengthMismatch {
                index: 2,
                expected: 2,
                actual: 4
            })
        ));
    }

    #[test]
    fn test_reassembler_finalize_incomplete() {
        let layout = ChunkLayout::new(10, 4).unwrap();
        let mut reassembler = ChunkReassembler::new(layout).unwrap();
        reassembler.write_chunk(0, &[0u8; 4]).unwrap();

        let err = reassembler.finalize().unwrap_err();
        assert!(err.to_string().contains("1/3"));
    }

    #[test]
    fn test_reassembler_refuses_unbufferable_size() {
        let layout = ChunkLayout::new(u64::MAX, 4096).unwrap();
        assert!(matches!(
            ChunkReassembler::new(layout),
            Err(ChunkError::TooLarge { size: u64::MAX, .. })
        ));

        // Within the limit but far beyond any allocator
        let layout = ChunkLayout::new(u64::MAX >> 1, usize::MAX).unwrap();
        assert!(matches!(
            ChunkReassembler::new(layout),
            Err(ChunkError::TooLarge { .. })
        ));
    }

    #[test]
    fn test_reassembler_empty_file_complete() {
        let layout = ChunkLayout::new(0, 4).unwrap();
        let reassembler = ChunkReassembler::new(layout).unwrap();
        assert!(reassembler.is_complete());
        assert_eq!(reassembler.progress(), 1.0);
        assert!(reassembler.finalize().unwrap().is_empty());
    }

    mod props {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn prop_chunks_tile_the_file(total in 0u64..1_000_000, chunk_size in 1usize..70_000) {
                let layout = ChunkLayout::new(total, chunk_size).unwrap();
                let mut next = 0;
                for index in 0..layout.num_chunks() {
                    let range = layout.chunk_range(index).unwrap();
                    prop_assert_eq!(range.start, next);
                    prop_assert!(range.end > range.start);
                    let last = index + 1 == layout.num_chunks();
                    prop_assert!(last || layout.chunk_len(index).unwrap() == chunk_size);
                    next = range.end;
                }
                prop_assert_eq!(next, total);
            }
        }
    }
}
