//! The persisted embedding column: a [`VectorIndex`] guarded for shared
//! use plus the file it is mirrored to.

use std::path::PathBuf;
use std::sync::{Mutex, RwLock};

use super::index::{IndexError, SearchResult, VectorIndex};
use super::storage::{VectorStorage, VectorStorageError};

#[derive(Debug, thiserror::Error)]
pub enum EmbeddingStoreError {
    #[error("Index error: {0}")]
    Index(#[from] IndexError),

    #[error("Storage error: {0}")]
    Storage(#[from] VectorStorageError),

    #[error("Embedding store lock poisoned")]
    Poisoned,
}

pub struct EmbeddingStore {
    index: RwLock<VectorIndex>,
    /// Serializes writers so a rollback never undoes a later upsert.
    save_lock: Mutex<()>,
    storage: VectorStorage,
    model_id: [u8; 32],
}

impl EmbeddingStore {
    /// Open `path`, starting empty when the file is missing or was written
    /// by a different encoder (those embeddings are not comparable and get
    /// re-backfilled).
    pub fn open(
        path: PathBuf,
        model_id: [u8; 32],
        dimensions: usize,
    ) -> Result<Self, EmbeddingStoreError> {
        let storage = VectorStorage::new(path);

        let index = if storage.exists() {
            match storage.load(&model_id, dimensions) {
                Ok(idx) => {
                    log::info!("Loaded {} embeddings from {:?}", idx.len(), storage.path());
                    idx
                }
                Err(VectorStorageError::ModelMismatch) => {
                    log::warn!("Encoder changed, discarding stored embeddings");
                    VectorIndex::new(dimensions)
                }
                Err(VectorStorageError::DimensionMismatch { expected, got }) => {
                    log::warn!(
                        "Stored embeddings have {got} dimensions, expected {expected}; discarding"
                    );
                    VectorIndex::new(dimensions)
                }
                Err(VectorStorageError::VersionMismatch(file_ver, _)) => {
                    log::warn!("Storage version {file_ver} unsupported, starting fresh");
                    VectorIndex::new(dimensions)
                }
                Err(e) => {
                    log::error!("Failed to load embeddings: {e}");
                    return Err(e.into());
                }
            }
        } else {
            log::info!("No stored embeddings, starting fresh");
            VectorIndex::new(dimensions)
        };

        Ok(Self {
            index: RwLock::new(index),
            save_lock: Mutex::new(()),
            storage,
            model_id,
        })
    }

    /// An empty store that is never written to disk until the first upsert.
    #[cfg(test)]
    pub fn in_memory(path: PathBuf, model_id: [u8; 32], dimensions: usize) -> Self {
        Self {
            index: RwLock::new(VectorIndex::new(dimensions)),
            save_lock: Mutex::new(()),
            storage: VectorStorage::new(path),
            model_id,
        }
    }

    pub fn model_id(&self) -> [u8; 32] {
        self.model_id
    }

    pub fn dimensions(&self) -> usize {
        self.index.read().map(|i| i.dimensions()).unwrap_or(0)
    }

    pub fn len(&self) -> usize {
        self.index.read().map(|i| i.len()).unwrap_or(0)
    }

    pub fn is_current(&self, id: u64, image_fingerprint: u64) -> bool {
        self.index
            .read()
            .map(|i| i.is_current(id, image_fingerprint))
            .unwrap_or(false)
    }

    pub fn embedding(&self, id: u64) -> Option<Vec<f32>> {
        self.index
            .read()
            .ok()
            .and_then(|i| i.get(id).map(|e| e.embedding.clone()))
    }

    /// Store the embedding and persist the whole column before returning.
    ///
    /// The file is written from a snapshot, so readers are only blocked for
    /// the in-memory insert. They may see the new entry before it is on disk.
    pub fn upsert(
        &self,
        id: u64,
        image_fingerprint: u64,
        embedding: Vec<f32>,
    ) -> Result<(), EmbeddingStoreError> {
        let _save = self.save_lock.lock().map_err(|_| EmbeddingStoreError::Poisoned)?;

        let (previous, snapshot) = {
            let mut index = self.index.write().map_err(|_| EmbeddingStoreError::Poisoned)?;
            let previous = index.get(id).cloned();
            index.insert(id, image_fingerprint, embedding)?;
            (previous, index.clone())
        };

        if let Err(err) = self.storage.save(&snapshot, &self.model_id) {
            // keep memory and disk in agreement
            let mut index = self.index.write().map_err(|_| EmbeddingStoreError::Poisoned)?;
            match previous {
                Some(prev) => {
                    let _ = index.insert(id, prev.image_fingerprint, prev.embedding);
                }
                None => {
                    index.remove(id);
                }
            }
            return Err(err.into());
        }
        Ok(())
    }

    pub fn search(
        &self,
        query: &[f32],
        threshold: f32,
        limit: usize,
    ) -> Result<Vec<SearchResult>, EmbeddingStoreError> {
        let index = self.index.read().map_err(|_| EmbeddingStoreError::Poisoned)?;
        Ok(index.search(query, threshold, limit)?)
    }
}
