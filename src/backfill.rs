//! Batched embedding backfill.
//!
//! Each call to [`BackfillWorker::run_batch`] picks up to `batch_size`
//! products that have an image but no current embedding, encodes them in
//! parallel and persists every success as soon as it is computed. Calls are
//! idempotent: once the backlog is drained a batch processes nothing.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use anyhow::{anyhow, Context};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::catalog::{image_fingerprint, Catalog, ImageFetcher, Product};
use crate::config::SearchConfig;
use crate::images::{self, PreprocessOptions};
use crate::semantic::{EmbeddingStore, SharedEncoder};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ItemStatus {
    Success,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemReport {
    pub id: u64,
    pub status: ItemStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BackfillReport {
    pub processed: usize,
    pub success: usize,
    pub failed: usize,
    pub details: Vec<ItemReport>,
    pub remaining: bool,
}

pub struct BackfillWorker {
    catalog: Arc<dyn Catalog>,
    fetcher: Arc<dyn ImageFetcher>,
    encoder: Arc<SharedEncoder>,
    embeddings: Arc<EmbeddingStore>,
    preprocess: PreprocessOptions,
    threads: usize,
    max_attempts: u32,
    /// Failed attempts per product id, for this process only
    failures: Mutex<HashMap<u64, u32>>,
    /// Held for the duration of a batch
    running: Mutex<()>,
}

impl BackfillWorker {
    pub fn new(
        catalog: Arc<dyn Catalog>,
        fetcher: Arc<dyn ImageFetcher>,
        encoder: Arc<SharedEncoder>,
        embeddings: Arc<EmbeddingStore>,
        config: &SearchConfig,
    ) -> anyhow::Result<Self> {
        Ok(Self {
            catalog,
            fetcher,
            encoder,
            embeddings,
            preprocess: PreprocessOptions::from(config),
            threads: config.backfill_threads()?,
            max_attempts: config.backfill_max_attempts,
            failures: Mutex::new(HashMap::new()),
            running: Mutex::new(()),
        })
    }

    /// Products still needing an embedding, lowest id first.
    fn candidates(&self, products: Vec<Product>) -> anyhow::Result<Vec<(Product, u64)>> {
        let failures = self
            .failures
            .lock()
            .map_err(|_| anyhow!("backfill failure map poisoned"))?;

        let mut candidates: Vec<(Product, u64)> = products
            .into_iter()
            .filter_map(|p| {
                let fingerprint = image_fingerprint(p.primary_image()?);
                Some((p, fingerprint))
            })
            .filter(|(p, fingerprint)| !self.embeddings.is_current(p.id, *fingerprint))
            .filter(|(p, _)| failures.get(&p.id).copied().unwrap_or(0) < self.max_attempts)
            .collect();

        candidates.sort_by_key(|(p, _)| p.id);
        Ok(candidates)
    }

    /// Number of products that would be picked up by future batches.
    pub fn pending(&self) -> anyhow::Result<usize> {
        Ok(self.candidates(self.catalog.products()?)?.len())
    }

    fn process(&self, product: &Product, fingerprint: u64) -> anyhow::Result<()> {
        let url = product
            .primary_image()
            .ok_or_else(|| anyhow!("product has no image"))?;
        let raw = self.fetcher.fetch(url)?;
        let canonical = images::preprocess(&raw, None, &self.preprocess)?;
        let embedding = self.encoder.encode_image(&canonical.data)?;
        self.embeddings
            .upsert(product.id, fingerprint, embedding)
            .context("couldnt persist embedding")?;
        Ok(())
    }

    /// Embed up to `batch_size` products. Per-item failures are reported,
    /// not raised; an error means the batch could not run at all.
    pub fn run_batch(&self, batch_size: usize) -> anyhow::Result<BackfillReport> {
        let _running = self
            .running
            .lock()
            .map_err(|_| anyhow!("backfill lock poisoned"))?;
        let started = Instant::now();

        let mut batch = self.candidates(self.catalog.products()?)?;
        batch.truncate(batch_size);

        if batch.is_empty() {
            log::debug!("backfill: nothing to do");
            return Ok(BackfillReport::default());
        }

        // surface a broken encoder once instead of failing every item
        self.encoder
            .get()
            .map_err(|err| anyhow!("encoder unavailable: {err}"))?;

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.threads.min(batch.len()).max(1))
            .thread_name(|i| format!("backfill-{i}"))
            .build()
            .map_err(|e| anyhow!("Failed to build backfill pool: {e}"))?;

        let outcomes: Vec<(u64, anyhow::Result<()>)> = pool.install(|| {
            batch
                .par_iter()
                .map(|(product, fingerprint)| (product.id, self.process(product, *fingerprint)))
                .collect()
        });

        let mut report = BackfillReport::default();
        {
            let mut failures = self
                .failures
                .lock()
                .map_err(|_| anyhow!("backfill failure map poisoned"))?;

            for (id, outcome) in outcomes {
                report.processed += 1;
                match outcome {
                    Ok(()) => {
                        failures.remove(&id);
                        report.success += 1;
                        report.details.push(ItemReport {
                            id,
                            status: ItemStatus::Success,
                            error: None,
                        });
                    }
                    Err(err) => {
                        let attempts = failures.entry(id).or_insert(0);
                        *attempts += 1;
                        log::warn!("backfill: product {id} failed (attempt {attempts}): {err:#}");
                        report.failed += 1;
                        report.details.push(ItemReport {
                            id,
                            status: ItemStatus::Failed,
                            error: Some(format!("{err:#}")),
                        });
                    }
                }
            }
        }

        report.remaining = self.pending()? > 0;
        log::info!(
            "backfill: processed={} success={} failed={} remaining={} in {:?}",
            report.processed,
            report.success,
            report.failed,
            report.remaining,
            started.elapsed()
        );
        Ok(report)
    }
}
