use std::path::{Path, PathBuf};

use anyhow::{bail, Context};
use serde::{Deserialize, Serialize};

use crate::{
    images::{DEFAULT_ALLOWED_MIME_TYPES, MAX_UPLOAD_BYTES},
    semantic::{DEFAULT_MODEL, EMBEDDING_DIMENSIONS},
    storage::{self, StorageManager},
};

const CONFIG_FILE: &str = "config.yaml";

const DEFAULT_LISTEN_ADDR: &str = "0.0.0.0:8080";
/// Text matches are near-exact, so the cutoff is tighter than for images
const DEFAULT_TEXT_THRESHOLD: f32 = 0.3;
/// Visual similarity is inherently fuzzier
const DEFAULT_IMAGE_THRESHOLD: f32 = 0.55;
const DEFAULT_TEXT_WEIGHT: f32 = 0.4;
const DEFAULT_IMAGE_WEIGHT: f32 = 0.6;
const DEFAULT_ENCODE_TIMEOUT_SECS: u64 = 15;
const DEFAULT_DOWNLOAD_TIMEOUT_SECS: u64 = 300;
const DEFAULT_BACKFILL_BATCH_SIZE: usize = 5;
const DEFAULT_BACKFILL_MAX_ATTEMPTS: u32 = 3;

/// Search subsystem settings
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SearchConfig {
    /// Encoder model: "clip-vit-b-32" or "stub"
    #[serde(default = "default_model")]
    pub model: String,

    #[serde(default = "default_embedding_dimensions")]
    pub embedding_dimensions: usize,

    #[serde(default = "default_max_upload_bytes")]
    pub max_upload_bytes: usize,

    #[serde(default = "default_allowed_mime_types")]
    pub allowed_mime_types: Vec<String>,

    /// Canonical images fit inside this square
    #[serde(default = "default_max_image_dimension")]
    pub max_image_dimension: u32,

    #[serde(default = "default_canonical_quality")]
    pub canonical_quality: u8,

    #[serde(default = "default_text_threshold")]
    pub text_threshold: f32,

    #[serde(default = "default_image_threshold")]
    pub image_threshold: f32,

    #[serde(default = "default_limit")]
    pub default_limit: usize,

    #[serde(default = "default_max_limit")]
    pub max_limit: usize,

    #[serde(default = "default_taxonomy_limit")]
    pub taxonomy_limit: usize,

    /// Weight of the lexical score when a product has both signals
    #[serde(default = "default_text_weight")]
    pub text_weight: f32,

    /// Weight of the visual score when a product has both signals
    #[serde(default = "default_image_weight")]
    pub image_weight: f32,

    /// Also encode text queries and match them against image embeddings
    #[serde(default = "default_true")]
    pub text_embedding: bool,

    #[serde(default = "default_encode_timeout_secs")]
    pub encode_timeout_secs: u64,

    #[serde(default = "default_download_timeout_secs")]
    pub download_timeout_secs: u64,

    #[serde(default = "default_backfill_batch_size")]
    pub backfill_batch_size: usize,

    /// "auto" or a positive integer
    #[serde(default = "default_backfill_parallelism")]
    pub backfill_parallelism: String,

    /// Failures after which a product is left alone for the rest of the process
    #[serde(default = "default_backfill_max_attempts")]
    pub backfill_max_attempts: u32,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            model: default_model(),
            embedding_dimensions: default_embedding_dimensions(),
            max_upload_bytes: default_max_upload_bytes(),
            allowed_mime_types: default_allowed_mime_types(),
            max_image_dimension: default_max_image_dimension(),
            canonical_quality: default_canonical_quality(),
            text_threshold: DEFAULT_TEXT_THRESHOLD,
            image_threshold: DEFAULT_IMAGE_THRESHOLD,
            default_limit: default_limit(),
            max_limit: default_max_limit(),
            taxonomy_limit: default_taxonomy_limit(),
            text_weight: DEFAULT_TEXT_WEIGHT,
            image_weight: DEFAULT_IMAGE_WEIGHT,
            text_embedding: true,
            encode_timeout_secs: DEFAULT_ENCODE_TIMEOUT_SECS,
            download_timeout_secs: DEFAULT_DOWNLOAD_TIMEOUT_SECS,
            backfill_batch_size: DEFAULT_BACKFILL_BATCH_SIZE,
            backfill_parallelism: default_backfill_parallelism(),
            backfill_max_attempts: DEFAULT_BACKFILL_MAX_ATTEMPTS,
        }
    }
}

fn default_model() -> String {
    DEFAULT_MODEL.to_string()
}

fn default_embedding_dimensions() -> usize {
    EMBEDDING_DIMENSIONS
}

fn default_max_upload_bytes() -> usize {
    MAX_UPLOAD_BYTES
}

fn default_allowed_mime_types() -> Vec<String> {
    DEFAULT_ALLOWED_MIME_TYPES
        .iter()
        .map(|m| m.to_string())
        .collect()
}

fn default_max_image_dimension() -> u32 {
    512
}

fn default_canonical_quality() -> u8 {
    85
}

fn default_text_threshold() -> f32 {
    DEFAULT_TEXT_THRESHOLD
}

fn default_image_threshold() -> f32 {
    DEFAULT_IMAGE_THRESHOLD
}

fn default_limit() -> usize {
    20
}

fn default_max_limit() -> usize {
    100
}

fn default_taxonomy_limit() -> usize {
    5
}

fn default_text_weight() -> f32 {
    DEFAULT_TEXT_WEIGHT
}

fn default_image_weight() -> f32 {
    DEFAULT_IMAGE_WEIGHT
}

fn default_true() -> bool {
    true
}

fn default_encode_timeout_secs() -> u64 {
    DEFAULT_ENCODE_TIMEOUT_SECS
}

fn default_download_timeout_secs() -> u64 {
    DEFAULT_DOWNLOAD_TIMEOUT_SECS
}

fn default_backfill_batch_size() -> usize {
    DEFAULT_BACKFILL_BATCH_SIZE
}

fn default_backfill_parallelism() -> String {
    "auto".to_string()
}

fn default_backfill_max_attempts() -> u32 {
    DEFAULT_BACKFILL_MAX_ATTEMPTS
}

impl SearchConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        for (name, value) in [
            ("text_threshold", self.text_threshold),
            ("image_threshold", self.image_threshold),
        ] {
            if !(0.0..=1.0).contains(&value) {
                bail!("search.{name} must be between 0.0 and 1.0, got {value}");
            }
        }

        if self.text_weight < 0.0 || self.image_weight < 0.0 {
            bail!("search.text_weight and search.image_weight must not be negative");
        }
        if (self.text_weight + self.image_weight - 1.0).abs() > 1e-3 {
            bail!(
                "search.text_weight + search.image_weight must equal 1.0, got {}",
                self.text_weight + self.image_weight
            );
        }

        for (name, value) in [
            ("embedding_dimensions", self.embedding_dimensions),
            ("max_upload_bytes", self.max_upload_bytes),
            ("default_limit", self.default_limit),
            ("max_limit", self.max_limit),
            ("backfill_batch_size", self.backfill_batch_size),
        ] {
            if value == 0 {
                bail!("search.{name} must be greater than 0");
            }
        }
        if self.default_limit > self.max_limit {
            bail!("search.default_limit must not exceed search.max_limit");
        }
        if self.max_image_dimension == 0 {
            bail!("search.max_image_dimension must be greater than 0");
        }
        if !(1..=100).contains(&self.canonical_quality) {
            bail!("search.canonical_quality must be between 1 and 100");
        }
        if self.encode_timeout_secs == 0 {
            bail!("search.encode_timeout_secs must be greater than 0");
        }
        if self.download_timeout_secs == 0 {
            bail!("search.download_timeout_secs must be greater than 0");
        }
        if self.allowed_mime_types.is_empty() {
            bail!("search.allowed_mime_types must not be empty");
        }

        self.backfill_threads()?;
        Ok(())
    }

    /// Resolve `backfill_parallelism` to a thread count.
    pub fn backfill_threads(&self) -> anyhow::Result<usize> {
        if self.backfill_parallelism == "auto" {
            return Ok(std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1));
        }
        match self.backfill_parallelism.parse::<usize>() {
            Ok(0) | Err(_) => bail!(
                "search.backfill_parallelism must be 'auto' or a positive integer, got '{}'",
                self.backfill_parallelism
            ),
            Ok(n) => Ok(n),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,

    #[serde(default)]
    pub search: SearchConfig,

    #[serde(skip_serializing, skip_deserializing)]
    base_path: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            search: SearchConfig::default(),
            base_path: PathBuf::new(),
        }
    }
}

fn default_listen_addr() -> String {
    DEFAULT_LISTEN_ADDR.to_string()
}

/// Data directory: `CATALOG_SEARCH_BASE_PATH` or `~/.local/share/catalog-search`.
pub fn default_base_path() -> anyhow::Result<PathBuf> {
    if let Ok(path) = std::env::var("CATALOG_SEARCH_BASE_PATH") {
        return Ok(PathBuf::from(path));
    }
    let home = homedir::my_home()
        .context("couldnt resolve home dir")?
        .context("couldnt find home dir")?;
    Ok(home.join(".local/share/catalog-search"))
}

impl Config {
    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    pub fn load() -> anyhow::Result<Self> {
        Self::load_with(&default_base_path()?)
    }

    pub fn load_with(base_path: &Path) -> anyhow::Result<Self> {
        let store = storage::BackendLocal::new(base_path)?;

        // create new if does not exist
        if !store.exists(CONFIG_FILE) {
            let defaults = serde_yml::to_string(&Self::default())?;
            store.write(CONFIG_FILE, defaults.as_bytes())?;
        }

        let config_str = String::from_utf8(store.read(CONFIG_FILE)?)
            .context("config file is not valid utf8")?;
        let mut config: Self = serde_yml::from_str(&config_str).context("config is malformed")?;

        config.base_path = base_path.to_path_buf();
        config.search.validate()?;

        // resave in case config version needs an upgrade
        if config_str != serde_yml::to_string(&config)? {
            config.save()?;
        }

        Ok(config)
    }

    pub fn save(&self) -> anyhow::Result<()> {
        let store = storage::BackendLocal::new(&self.base_path)?;
        let config_str = serde_yml::to_string(&self)?;
        store.write(CONFIG_FILE, config_str.as_bytes())?;
        Ok(())
    }
}
