//! File manifests: per-chunk BLAKE3 hashes plus a whole-file digest.

use crate::chunker::{ChunkLayout, FileChunker};
use crate::{ChunkError, MAX_FILE_SIZE, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;

/// BLAKE3 hash of a chunk or a whole file
pub type ChunkHash = [u8; 32];

/// Opaque identifier of a shared file
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FileId(String);

impl FileId {
    /// Wrap an identifier
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Derive an identifier from a content digest
    #[must_use]
    pub fn from_digest(digest: &ChunkHash) -> Self {
        Self(hex::encode(digest))
    }

    /// Identifier as a string slice
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First 8 characters, for logs
    #[must_use]
    pub fn short(&self) -> &str {
        let end = self.0.char_indices().nth(8).map_or(self.0.len(), |(i, _)| i);
        &self.0[..end]
    }
}

impl fmt::Display for FileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Everything a downloader needs to fetch and verify a file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileManifest {
    /// File identifier
    pub file_id: FileId,
    /// Total size in bytes
    pub total_size: u64,
    /// Nominal chunk size in bytes
    pub chunk_size: usize,
    /// Expected BLAKE3 hash of every chunk, in index order
    #[serde(with = "hex_hashes")]
    pub chunk_hashes: Vec<ChunkHash>,
    /// Expected BLAKE3 hash of the concatenated file
    #[serde(with = "hex_hash")]
    pub digest: ChunkHash,
}

impl FileManifest {
    /// Build a manifest from in-memory content
    ///
    /// # Errors
    ///
    /// Returns `ChunkError::ZeroChunkSize` if `chunk_size` is zero.
    pub fn from_bytes(file_id: FileId, data: &[u8], chunk_size: usize) -> Result<Self> {
        let layout = ChunkLayout::new(data.len() as u64, chunk_size)?;
        let chunk_hashes = data
            .chunks(chunk_size)
            .map(|chunk| *blake3::hash(chunk).as_bytes())
            .collect();

        Ok(Self {
            file_id,
            total_size: layout.total_size(),
            chunk_size,
            chunk_hashes,
            digest: *blake3::hash(data).as_bytes(),
        })
    }

    /// Build a manifest by streaming a file chunk by chunk
    ///
    /// The file id defaults to the hex digest of the content.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or `chunk_size` is zero.
    pub fn from_file<P: AsRef<Path>>(
        path: P,
        chunk_size: usize,
        file_id: Option<FileId>,
    ) -> Result<Self> {
        let path = path.as_ref();
        let mut chunker = FileChunker::new(path, chunk_size)?;
        let layout = chunker.layout();

        let mut file_hasher = blake3::Hasher::new();
        let mut chunk_hashes = Vec::with_capacity(layout.num_chunks() as usize);
        while let Some(chunk) = chunker.read_chunk()? {
            file_hasher.update(&chunk);
            chunk_hashes.push(*blake3::hash(&chunk).as_bytes());
        }
        let digest = *file_hasher.finalize().as_bytes();

        tracing::debug!(
            "Built manifest for {} ({} bytes, {} chunks)",
            path.display(),
            layout.total_size(),
            chunk_hashes.len()
        );

        Ok(Self {
            file_id: file_id.unwrap_or_else(|| FileId::from_digest(&digest)),
            total_size: layout.total_size(),
            chunk_size,
            chunk_hashes,
            digest,
        })
    }

    /// Chunk layout described by this manifest
    ///
    /// # Errors
    ///
    /// Returns `ChunkError::ZeroChunkSize` if the manifest has a zero chunk size.
    pub fn layout(&self) -> Result<ChunkLayout> {
        ChunkLayout::new(self.total_size, self.chunk_size)
    }

    /// Number of chunks
    #[must_use]
    pub fn num_chunks(&self) -> u64 {
        self.chunk_hashes.len() as u64
    }

    /// Expected hash of a chunk
    #[must_use]
    pub fn expected_hash(&self, index: u64) -> Option<&ChunkHash> {
        self.chunk_hashes.get(index as usize)
    }

    /// Check that the hash list agrees with size and chunk size
    ///
    /// # Errors
    ///
    /// Returns `ChunkError::TooLarge` past [`MAX_FILE_SIZE`], or
    /// `ChunkError::InvalidManifest` describing the inconsistency.
    pub fn validate(&self) -> Result<()> {
        if self.total_size > MAX_FILE_SIZE {
            return Err(ChunkError::TooLarge {
                size: self.total_size,
                limit: MAX_FILE_SIZE,
            });
        }
        let layout = self.layout()?;
        if layout.num_chunks() != self.num_chunks() {
            return Err(ChunkError::InvalidManifest(format!(
                "{} chunk hashes for {} chunks",
                self.num_chunks(),
                layout.num_chunks()
            )));
        }
        Ok(())
    }
}

mod hex_hash {
    use super::ChunkHash;
    use serde::{Deserialize, Deserializer, Serializer, de::Error};

    pub fn serialize<S: Serializer>(hash: &ChunkHash, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&hex::encode(hash))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<ChunkHash, D::Error> {
        let text = String::deserialize(d)?;
        let mut out = [0u8; 32];
        hex::decode_to_slice(&text, &mut out).map_err(D::Error::custom)?;
        Ok(out)
    }
}

mod hex_hashes {
    use super::ChunkHash;
    use serde::{Deserialize, Deserializer, Serializer, de::Error, ser::SerializeSeq};

    pub fn serialize<S: Serializer>(hashes: &[ChunkHash], s: S) -> Result<S::Ok, S::Error> {
        let mut seq = s.serialize_seq(Some(hashes.len()))?;
        for hash in hashes {
            seq.serialize_element(&hex::encode(hash))?;
        }
        seq.end()
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<ChunkHash>, D::Error> {
        Vec::<String>::deserialize(d)?
            .iter()
            .map(|text| {
                let mut out = [0u8; 32];
                hex::decode_to_slice(text, &mut out).map_err(D::Error::custom)?;
                Ok(out)
            })
            .collect()
    }
}
