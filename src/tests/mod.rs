//! Cross-module scenarios, run against the deterministic stub encoder.

mod backfill;

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::anyhow;

use crate::app::SearchApp;
use crate::catalog::tests::MemCatalog;
use crate::catalog::{ImageFetcher, Product, TaxonomyEntry};
use crate::config::SearchConfig;
use crate::semantic::{configured_model_id, EmbeddingStore, Encoder, HashEncoder, SharedEncoder};

pub(crate) const DIMS: usize = 512;

pub(crate) struct MapFetcher(pub HashMap<String, Vec<u8>>);

impl ImageFetcher for MapFetcher {
    fn fetch(&self, url: &str) -> anyhow::Result<Vec<u8>> {
        self.0
            .get(url)
            .cloned()
            .ok_or_else(|| anyhow!("404 for {url}"))
    }
}

pub(crate) struct Fixture {
    pub(crate) dir: tempfile::TempDir,
    pub(crate) catalog: Arc<MemCatalog>,
    pub(crate) app: Arc<SearchApp>,
}

pub(crate) fn stub_config() -> SearchConfig {
    SearchConfig {
        model: HashEncoder::MODEL_NAME.to_string(),
        backfill_parallelism: "2".to_string(),
        ..Default::default()
    }
}

pub(crate) fn stub_encoder() -> Arc<SharedEncoder> {
    Arc::new(SharedEncoder::new(|| {
        Ok(Arc::new(HashEncoder::new(DIMS)) as Arc<dyn Encoder>)
    }))
}

impl Fixture {
    pub(crate) fn new(
        products: Vec<Product>,
        taxonomy: Vec<TaxonomyEntry>,
        images: HashMap<String, Vec<u8>>,
    ) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let catalog = Arc::new(MemCatalog::new(products).with_taxonomy(taxonomy));
        let app = Self::open_app(&dir, catalog.clone(), images);
        Self { dir, catalog, app }
    }

    /// A fresh app over the same catalog and vectors file, as after a restart.
    pub(crate) fn restart(&self, images: HashMap<String, Vec<u8>>) -> Arc<SearchApp> {
        Self::open_app(&self.dir, self.catalog.clone(), images)
    }

    fn open_app(
        dir: &tempfile::TempDir,
        catalog: Arc<MemCatalog>,
        images: HashMap<String, Vec<u8>>,
    ) -> Arc<SearchApp> {
        let config = stub_config();
        let embeddings = Arc::new(
            EmbeddingStore::open(
                dir.path().join("vectors.bin"),
                configured_model_id(&config.model),
                DIMS,
            )
            .unwrap(),
        );
        Arc::new(
            SearchApp::with_parts(
                &config,
                catalog,
                Arc::new(MapFetcher(images)),
                stub_encoder(),
                embeddings,
            )
            .unwrap(),
        )
    }
}
