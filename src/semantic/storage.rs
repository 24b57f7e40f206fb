//! Binary persistence for the embedding column.
//!
//! File format: vectors.bin
//!
//! Header (47 bytes):
//! - version: u8 (1)
//! - model_id: [u8; 32] (SHA256 of the encoder model name)
//! - dimensions: u16 (little-endian)
//! - entry_count: u64 (little-endian)
//! - checksum: u32 (CRC32 of the 43 bytes before it)
//!
//! Entries (repeated):
//! - product_id: u64 (little-endian)
//! - image_fingerprint: u64 (little-endian)
//! - embedding: [f32; dimensions] (little-endian)

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use super::index::VectorIndex;

const FORMAT_VERSION: u8 = 1;

const HEADER_SIZE: usize = 47;
const CHECKSUMMED_LEN: usize = 43;

#[derive(Debug, thiserror::Error)]
pub enum VectorStorageError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Version mismatch: file version {0}, supported version {1}")]
    VersionMismatch(u8, u8),

    #[error("Model mismatch: file was written by a different encoder")]
    ModelMismatch,

    #[error("Checksum mismatch: file may be corrupted")]
    ChecksumMismatch,

    #[error("Dimension mismatch: expected {expected}, file has {got}")]
    DimensionMismatch { expected: usize, got: usize },

    #[error("Too many dimensions for the file format: {0}")]
    DimensionsTooLarge(usize),
}

#[derive(Debug, PartialEq)]
struct Header {
    version: u8,
    model_id: [u8; 32],
    dimensions: u16,
    entry_count: u64,
}

impl Header {
    fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut bytes = [0u8; HEADER_SIZE];
        bytes[0] = self.version;
        bytes[1..33].copy_from_slice(&self.model_id);
        bytes[33..35].copy_from_slice(&self.dimensions.to_le_bytes());
        bytes[35..43].copy_from_slice(&self.entry_count.to_le_bytes());
        let checksum = crc32fast::hash(&bytes[..CHECKSUMMED_LEN]);
        bytes[43..47].copy_from_slice(&checksum.to_le_bytes());
        bytes
    }

    fn from_bytes(bytes: &[u8; HEADER_SIZE]) -> Result<Self, VectorStorageError> {
        let version = bytes[0];
        if version > FORMAT_VERSION {
            return Err(VectorStorageError::VersionMismatch(version, FORMAT_VERSION));
        }

        let stored = u32::from_le_bytes([bytes[43], bytes[44], bytes[45], bytes[46]]);
        if stored != crc32fast::hash(&bytes[..CHECKSUMMED_LEN]) {
            return Err(VectorStorageError::ChecksumMismatch);
        }

        let mut model_id = [0u8; 32];
        model_id.copy_from_slice(&bytes[1..33]);
        let mut count = [0u8; 8];
        count.copy_from_slice(&bytes[35..43]);

        Ok(Self {
            version,
            model_id,
            dimensions: u16::from_le_bytes([bytes[33], bytes[34]]),
            entry_count: u64::from_le_bytes(count),
        })
    }
}

/// Reads and writes a [`VectorIndex`] to a single file.
pub struct VectorStorage {
    path: PathBuf,
}

impl VectorStorage {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    /// Load the index, refusing files written by another model or with
    /// different dimensions.
    pub fn load(
        &self,
        expected_model_id: &[u8; 32],
        expected_dimensions: usize,
    ) -> Result<VectorIndex, VectorStorageError> {
        let file = File::open(&self.path)?;
        let file_len = file.metadata()?.len();
        let mut reader = BufReader::new(file);

        let mut header_bytes = [0u8; HEADER_SIZE];
        reader.read_exact(&mut header_bytes)?;
        let header = Header::from_bytes(&header_bytes)?;

        if header.model_id != *expected_model_id {
            return Err(VectorStorageError::ModelMismatch);
        }
        let dimensions = header.dimensions as usize;
        if dimensions != expected_dimensions {
            return Err(VectorStorageError::DimensionMismatch {
                expected: expected_dimensions,
                got: dimensions,
            });
        }

        // the header count is only a hint; never reserve more than the file holds
        let entry_size = (16 + 4 * dimensions) as u64;
        let fits = file_len.saturating_sub(HEADER_SIZE as u64) / entry_size;
        let capacity = header.entry_count.min(fits) as usize;
        let mut index = VectorIndex::with_capacity(dimensions, capacity);
        let mut skipped = 0usize;
        for _ in 0..header.entry_count {
            let id = read_u64(&mut reader)?;
            let fingerprint = read_u64(&mut reader)?;
            let mut embedding = Vec::with_capacity(dimensions);
            for _ in 0..dimensions {
                let mut b = [0u8; 4];
                reader.read_exact(&mut b)?;
                embedding.push(f32::from_le_bytes(b));
            }
            if index.insert(id, fingerprint, embedding).is_err() {
                skipped += 1;
            }
        }
        if skipped > 0 {
            log::warn!("dropped {skipped} invalid embeddings from {:?}", self.path);
        }

        Ok(index)
    }

    /// Save the index atomically: temp file -> fsync -> rename.
    pub fn save(&self, index: &VectorIndex, model_id: &[u8; 32]) -> Result<(), VectorStorageError> {
        let dimensions = u16::try_from(index.dimensions())
            .map_err(|_| VectorStorageError::DimensionsTooLarge(index.dimensions()))?;
        let temp_path = self.path.with_extension("tmp");

        let result = Self::write_to(&temp_path, index, model_id, dimensions);
        if result.is_err() {
            let _ = std::fs::remove_file(&temp_path);
            return result;
        }

        std::fs::rename(&temp_path, &self.path)?;
        Ok(())
    }

    fn write_to(
        path: &Path,
        index: &VectorIndex,
        model_id: &[u8; 32],
        dimensions: u16,
    ) -> Result<(), VectorStorageError> {
        let mut writer = BufWriter::new(File::create(path)?);

        let header = Header {
            version: FORMAT_VERSION,
            model_id: *model_id,
            dimensions,
            entry_count: index.len() as u64,
        };
        writer.write_all(&header.to_bytes())?;

        for (id, entry) in index.iter() {
            writer.write_all(&id.to_le_bytes())?;
            writer.write_all(&entry.image_fingerprint.to_le_bytes())?;
            for value in &entry.embedding {
                writer.write_all(&value.to_le_bytes())?;
            }
        }

        writer.flush()?;
        let file = writer.into_inner().map_err(|e| e.into_error())?;
        file.sync_all()?;
        Ok(())
    }
}

fn read_u64(reader: &mut impl Read) -> Result<u64, VectorStorageError> {
    let mut b = [0u8; 8];
    reader.read_exact(&mut b)?;
    Ok(u64::from_le_bytes(b))
}
