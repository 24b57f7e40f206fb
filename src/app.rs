//! Wiring: builds the search components from a [`Config`].

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;

use crate::{
    backfill::BackfillWorker,
    catalog::{Catalog, CatalogCsv, DefaultImageFetcher, ImageFetcher},
    config::{Config, SearchConfig},
    search::{hybrid::Weights, HybridRanker, LocalSimilarityStore, RankerOptions},
    semantic::{configured_model_id, EmbeddingStore, SharedEncoder},
};

const VECTORS_FILE: &str = "vectors.bin";
const UPLOADS_DIR: &str = "uploads";

#[derive(Debug, Clone)]
pub struct AppPaths {
    pub base_path: PathBuf,
    pub uploads_path: PathBuf,
    pub vectors_path: PathBuf,
}

impl AppPaths {
    pub fn new(base_path: &Path) -> Self {
        Self {
            base_path: base_path.to_path_buf(),
            uploads_path: base_path.join(UPLOADS_DIR),
            vectors_path: base_path.join(VECTORS_FILE),
        }
    }
}

pub struct SearchApp {
    pub config: SearchConfig,
    pub catalog: Arc<dyn Catalog>,
    pub encoder: Arc<SharedEncoder>,
    pub embeddings: Arc<EmbeddingStore>,
    pub ranker: Arc<HybridRanker>,
    pub backfill: Arc<BackfillWorker>,
}

impl SearchApp {
    /// Local catalog in the base directory and the configured encoder. The
    /// encoder is not loaded until first use.
    pub fn open(config: &Config) -> anyhow::Result<Self> {
        let paths = AppPaths::new(config.base_path());
        let search = &config.search;

        let catalog = Arc::new(CatalogCsv::load(&paths.base_path)?);
        let fetcher = Arc::new(DefaultImageFetcher::new(
            &paths.uploads_path,
            search.max_upload_bytes,
        )?);
        let encoder = Arc::new(SharedEncoder::from_config(
            search,
            paths.base_path.clone(),
        ));
        let embeddings = Arc::new(
            EmbeddingStore::open(
                paths.vectors_path.clone(),
                configured_model_id(&search.model),
                search.embedding_dimensions,
            )
            .with_context(|| format!("couldnt open {:?}", paths.vectors_path))?,
        );

        Self::with_parts(search, catalog, fetcher, encoder, embeddings)
    }

    pub fn with_parts(
        config: &SearchConfig,
        catalog: Arc<dyn Catalog>,
        fetcher: Arc<dyn ImageFetcher>,
        encoder: Arc<SharedEncoder>,
        embeddings: Arc<EmbeddingStore>,
    ) -> anyhow::Result<Self> {
        let weights = Weights {
            text: config.text_weight,
            image: config.image_weight,
        };
        let store = Arc::new(LocalSimilarityStore::new(
            catalog.clone(),
            embeddings.clone(),
            weights,
        ));
        let ranker = Arc::new(HybridRanker::new(
            encoder.clone(),
            store,
            catalog.clone(),
            RankerOptions::from(config),
        ));
        let backfill = Arc::new(BackfillWorker::new(
            catalog.clone(),
            fetcher,
            encoder.clone(),
            embeddings.clone(),
            config,
        )?);

        Ok(Self {
            config: config.clone(),
            catalog,
            encoder,
            embeddings,
            ranker,
            backfill,
        })
    }
}
