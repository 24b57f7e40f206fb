//! Read-only view of the product catalog.
//!
//! The catalog itself is owned by catalog management; search only needs
//! "list products", "list categories/collections" and a way to fetch
//! product photos. `CatalogCsv` backs this with two CSV files in the data
//! directory and reloads them when they change on disk.

use std::{
    io::ErrorKind,
    path::{Path, PathBuf},
    sync::RwLock,
    time::{Instant, SystemTime},
};

use anyhow::{anyhow, Context};
use serde::{Deserialize, Serialize};

use crate::storage::{BackendLocal, StorageManager};

pub const PRODUCTS_FILE: &str = "products.csv";
pub const TAXONOMY_FILE: &str = "taxonomy.csv";

const PRODUCT_HEADERS: [&str; 7] = [
    "id",
    "name",
    "handle",
    "price",
    "currency",
    "image_urls",
    "description",
];
const TAXONOMY_HEADERS: [&str; 3] = ["kind", "name", "handle"];

/// Separator between image URLs inside the `image_urls` column
const IMAGE_URL_SEPARATOR: char = '|';

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Product {
    pub id: u64,
    pub name: String,
    pub handle: String,
    pub price: f64,
    pub currency: String,
    pub image_urls: Vec<String>,
    #[serde(default)]
    pub description: String,
}

impl Product {
    pub fn primary_image(&self) -> Option<&str> {
        self.image_urls
            .iter()
            .map(|u| u.trim())
            .find(|u| !u.is_empty())
    }

    pub fn summary(&self) -> ProductSummary {
        ProductSummary {
            id: self.id,
            title: self.name.clone(),
            handle: self.handle.clone(),
            thumbnail: self.primary_image().map(str::to_string),
            price: self.price,
            currency: self.currency.clone(),
        }
    }
}

/// What search responses carry for each product.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProductSummary {
    pub id: u64,
    pub title: String,
    pub handle: String,
    pub thumbnail: Option<String>,
    pub price: f64,
    pub currency: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaxonomyKind {
    Category,
    Collection,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaxonomyEntry {
    pub kind: TaxonomyKind,
    pub name: String,
    pub handle: String,
}

/// Fingerprint of the image an embedding is computed from. A changed
/// primary image changes the fingerprint, which invalidates the embedding.
pub fn image_fingerprint(url: &str) -> u64 {
    use sha2::{Digest, Sha256};
    let digest = Sha256::digest(url.trim().as_bytes());
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    u64::from_le_bytes(bytes)
}

pub trait Catalog: Send + Sync {
    fn products(&self) -> anyhow::Result<Vec<Product>>;
    fn product(&self, id: u64) -> anyhow::Result<Option<Product>>;
    fn taxonomy(&self, kind: TaxonomyKind) -> anyhow::Result<Vec<TaxonomyEntry>>;

    fn categories(&self) -> anyhow::Result<Vec<TaxonomyEntry>> {
        self.taxonomy(TaxonomyKind::Category)
    }

    fn collections(&self) -> anyhow::Result<Vec<TaxonomyEntry>> {
        self.taxonomy(TaxonomyKind::Collection)
    }
}

#[derive(Debug, Deserialize, Serialize)]
struct ProductRecord {
    id: u64,
    name: String,
    handle: String,
    price: f64,
    currency: String,
    image_urls: String,
    #[serde(default)]
    description: String,
}

impl From<ProductRecord> for Product {
    fn from(r: ProductRecord) -> Self {
        Product {
            id: r.id,
            name: r.name,
            handle: r.handle,
            price: r.price,
            currency: r.currency,
            image_urls: r
                .image_urls
                .split(IMAGE_URL_SEPARATOR)
                .map(|u| u.trim().to_string())
                .filter(|u| !u.is_empty())
                .collect(),
            description: r.description,
        }
    }
}

impl From<&Product> for ProductRecord {
    fn from(p: &Product) -> Self {
        ProductRecord {
            id: p.id,
            name: p.name.clone(),
            handle: p.handle.clone(),
            price: p.price,
            currency: p.currency.clone(),
            image_urls: p.image_urls.join(&IMAGE_URL_SEPARATOR.to_string()),
            description: p.description.clone(),
        }
    }
}

#[derive(Debug, Default)]
struct Snapshot {
    products: Vec<Product>,
    taxonomy: Vec<TaxonomyEntry>,
    modified: Option<(SystemTime, SystemTime)>,
}

#[derive(Debug)]
pub struct CatalogCsv {
    products_path: PathBuf,
    taxonomy_path: PathBuf,
    snapshot: RwLock<Snapshot>,
}

fn modtime(path: &Path) -> anyhow::Result<SystemTime> {
    let meta = std::fs::metadata(path).with_context(|| format!("couldnt stat {path:?}"))?;
    Ok(meta.modified()?)
}

fn ensure_csv(path: &Path, headers: &[&str]) -> anyhow::Result<()> {
    if let Err(err) = std::fs::metadata(path) {
        match err.kind() {
            ErrorKind::NotFound => {
                log::info!("Creating empty {path:?}");
                let mut wrt = csv::Writer::from_path(path)?;
                wrt.write_record(headers)?;
                wrt.flush()?;
            }
            _ => Err(err)?,
        }
    }
    Ok(())
}

pub fn read_products(path: &Path) -> anyhow::Result<Vec<Product>> {
    let mut reader = csv::Reader::from_path(path)?;
    let mut products = vec![];
    for (line, record) in reader.deserialize::<ProductRecord>().enumerate() {
        let record = record.with_context(|| format!("{path:?}: bad product row {}", line + 2))?;
        products.push(record.into());
    }
    Ok(products)
}

pub fn write_products(path: &Path, products: &[Product]) -> anyhow::Result<()> {
    let mut wrt = csv::Writer::from_path(path)?;
    for product in products {
        wrt.serialize(ProductRecord::from(product))?;
    }
    wrt.flush()?;
    Ok(())
}

fn read_taxonomy(path: &Path) -> anyhow::Result<Vec<TaxonomyEntry>> {
    let mut reader = csv::Reader::from_path(path)?;
    let mut entries = vec![];
    for (line, record) in reader.deserialize::<TaxonomyEntry>().enumerate() {
        entries.push(record.with_context(|| format!("{path:?}: bad taxonomy row {}", line + 2))?);
    }
    Ok(entries)
}

pub fn write_taxonomy(path: &Path, entries: &[TaxonomyEntry]) -> anyhow::Result<()> {
    let mut wrt = csv::Writer::from_path(path)?;
    for entry in entries {
        wrt.serialize(entry)?;
    }
    wrt.flush()?;
    Ok(())
}

impl CatalogCsv {
    /// Open (creating empty files if needed) the catalog in `base_dir`.
    pub fn load(base_dir: &Path) -> anyhow::Result<Self> {
        std::fs::create_dir_all(base_dir)?;
        let catalog = Self {
            products_path: base_dir.join(PRODUCTS_FILE),
            taxonomy_path: base_dir.join(TAXONOMY_FILE),
            snapshot: RwLock::new(Snapshot::default()),
        };
        ensure_csv(&catalog.products_path, &PRODUCT_HEADERS)?;
        ensure_csv(&catalog.taxonomy_path, &TAXONOMY_HEADERS)?;
        catalog.refresh_if_modified()?;
        Ok(catalog)
    }

    /// Re-read the CSV files when either changed on disk since last read.
    pub fn refresh_if_modified(&self) -> anyhow::Result<()> {
        let current = (modtime(&self.products_path)?, modtime(&self.taxonomy_path)?);
        {
            let snapshot = self
                .snapshot
                .read()
                .map_err(|_| anyhow!("catalog lock poisoned"))?;
            if snapshot.modified == Some(current) {
                return Ok(());
            }
        }

        let now = Instant::now();
        let products = read_products(&self.products_path)?;
        let taxonomy = read_taxonomy(&self.taxonomy_path)?;
        log::info!(
            "catalog loaded: {} products, {} taxonomy entries in {:?}",
            products.len(),
            taxonomy.len(),
            now.elapsed()
        );

        let mut snapshot = self
            .snapshot
            .write()
            .map_err(|_| anyhow!("catalog lock poisoned"))?;
        *snapshot = Snapshot {
            products,
            taxonomy,
            modified: Some(current),
        };
        Ok(())
    }

    fn read<T>(&self, f: impl FnOnce(&Snapshot) -> T) -> anyhow::Result<T> {
        self.refresh_if_modified()?;
        let snapshot = self
            .snapshot
            .read()
            .map_err(|_| anyhow!("catalog lock poisoned"))?;
        Ok(f(&snapshot))
    }

    /// Replace the catalog files with the contents of `products_csv` (and
    /// optionally `taxonomy_csv`) after checking they parse.
    pub fn import(
        &self,
        products_csv: &Path,
        taxonomy_csv: Option<&Path>,
    ) -> anyhow::Result<usize> {
        let products = read_products(products_csv)?;
        write_products(&self.products_path, &products)?;
        if let Some(taxonomy_csv) = taxonomy_csv {
            let taxonomy = read_taxonomy(taxonomy_csv)?;
            write_taxonomy(&self.taxonomy_path, &taxonomy)?;
        }
        self.refresh_if_modified()?;
        Ok(products.len())
    }
}

impl Catalog for CatalogCsv {
    fn products(&self) -> anyhow::Result<Vec<Product>> {
        self.read(|s| s.products.clone())
    }

    fn product(&self, id: u64) -> anyhow::Result<Option<Product>> {
        self.read(|s| s.products.iter().find(|p| p.id == id).cloned())
    }

    fn taxonomy(&self, kind: TaxonomyKind) -> anyhow::Result<Vec<TaxonomyEntry>> {
        self.read(|s| {
            s.taxonomy
                .iter()
                .filter(|t| t.kind == kind)
                .cloned()
                .collect()
        })
    }
}

/// Fetches product photo bytes by URL.
pub trait ImageFetcher: Send + Sync {
    fn fetch(&self, url: &str) -> anyhow::Result<Vec<u8>>;
}

/// `http(s)://` URLs over the network, anything else from the uploads
/// directory.
pub struct DefaultImageFetcher {
    client: reqwest::blocking::Client,
    uploads: BackendLocal,
    max_bytes: usize,
}

impl DefaultImageFetcher {
    pub fn new(uploads_dir: &Path, max_bytes: usize) -> anyhow::Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(std::time::Duration::from_secs(20))
            .build()?;
        Ok(Self {
            client,
            uploads: BackendLocal::new(uploads_dir)?,
            max_bytes,
        })
    }
}

impl ImageFetcher for DefaultImageFetcher {
    fn fetch(&self, url: &str) -> anyhow::Result<Vec<u8>> {
        match url::Url::parse(url) {
            Ok(parsed) if matches!(parsed.scheme(), "http" | "https") => {
                let response = self.client.get(parsed).send()?.error_for_status()?;
                if let Some(len) = response.content_length() {
                    if len as usize > self.max_bytes {
                        return Err(anyhow!("image at {url} is {len} bytes"));
                    }
                }
                let bytes = response.bytes()?;
                if bytes.len() > self.max_bytes {
                    return Err(anyhow!("image at {url} is {} bytes", bytes.len()));
                }
                Ok(bytes.to_vec())
            }
            Ok(parsed) => Err(anyhow!("unsupported image url scheme {}", parsed.scheme())),
            Err(_) => self
                .uploads
                .read(url.trim_start_matches("./"))
                .with_context(|| format!("couldnt read upload {url}")),
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Catalog held in memory; products can be swapped mid-test.
    #[derive(Default)]
    pub(crate) struct MemCatalog {
        pub(crate) products: RwLock<Vec<Product>>,
        pub(crate) taxonomy: Vec<TaxonomyEntry>,
    }

    impl MemCatalog {
        pub(crate) fn new(products: Vec<Product>) -> Self {
            Self {
                products: RwLock::new(products),
                taxonomy: vec![],
            }
        }

        pub(crate) fn with_taxonomy(mut self, taxonomy: Vec<TaxonomyEntry>) -> Self {
            self.taxonomy = taxonomy;
            self
        }
    }

    impl Catalog for MemCatalog {
        fn products(&self) -> anyhow::Result<Vec<Product>> {
            Ok(self.products.read().unwrap().clone())
        }

        fn product(&self, id: u64) -> anyhow::Result<Option<Product>> {
            Ok(self
                .products
                .read()
                .unwrap()
                .iter()
                .find(|p| p.id == id)
                .cloned())
        }

        fn taxonomy(&self, kind: TaxonomyKind) -> anyhow::Result<Vec<TaxonomyEntry>> {
            Ok(self
                .taxonomy
                .iter()
                .filter(|t| t.kind == kind)
                .cloned()
                .collect())
        }
    }

    pub(crate) fn taxonomy_entry(kind: TaxonomyKind, name: &str) -> TaxonomyEntry {
        TaxonomyEntry {
            kind,
            name: name.to_string(),
            handle: name.to_lowercase().replace(' ', "-"),
        }
    }

    pub(crate) fn product(id: u64, name: &str, images: &[&str]) -> Product {
        Product {
            id,
            name: name.to_string(),
            handle: name.to_lowercase().replace(' ', "-"),
            price: 9.99,
            currency: "USD".to_string(),
            image_urls: images.iter().map(|s| s.to_string()).collect(),
            description: String::new(),
        }
    }

    #[test]
    fn test_load_creates_empty_catalog() {
        let dir = tempfile::tempdir().unwrap();
        let catalog = CatalogCsv::load(dir.path()).unwrap();
        assert!(catalog.products().unwrap().is_empty());
        assert!(dir.path().join(PRODUCTS_FILE).exists());
        assert!(dir.path().join(TAXONOMY_FILE).exists());
    }

    #[test]
    fn test_products_round_trip_through_csv() {
        let dir = tempfile::tempdir().unwrap();
        let products = vec![
            product(1, "Wooden Train", &["trains/1.jpg", "trains/1b.jpg"]),
            product(2, "Plush Bear", &[]),
        ];
        write_products(&dir.path().join(PRODUCTS_FILE), &products).unwrap();

        let catalog = CatalogCsv::load(dir.path()).unwrap();
        assert_eq!(catalog.products().unwrap(), products);
        assert_eq!(
            catalog.product(1).unwrap().unwrap().primary_image(),
            Some("trains/1.jpg")
        );
        assert_eq!(catalog.product(2).unwrap().unwrap().primary_image(), None);
        assert!(catalog.product(3).unwrap().is_none());
    }

    #[test]
    fn test_taxonomy_by_kind() {
        let dir = tempfile::tempdir().unwrap();
        write_taxonomy(
            &dir.path().join(TAXONOMY_FILE),
            &[
                TaxonomyEntry {
                    kind: TaxonomyKind::Category,
                    name: "Robots".to_string(),
                    handle: "robots".to_string(),
                },
                TaxonomyEntry {
                    kind: TaxonomyKind::Collection,
                    name: "Robot Week".to_string(),
                    handle: "robot-week".to_string(),
                },
            ],
        )
        .unwrap();

        let catalog = CatalogCsv::load(dir.path()).unwrap();
        let categories = catalog.taxonomy(TaxonomyKind::Category).unwrap();
        assert_eq!(categories.len(), 1);
        assert_eq!(categories[0].name, "Robots");
    }

    #[test]
    fn test_import_replaces_products() {
        let dir = tempfile::tempdir().unwrap();
        let catalog = CatalogCsv::load(&dir.path().join("data")).unwrap();

        let src = dir.path().join("incoming.csv");
        write_products(&src, &[product(7, "Kite", &["kite.png"])]).unwrap();

        assert_eq!(catalog.import(&src, None).unwrap(), 1);
        assert_eq!(catalog.products().unwrap()[0].name, "Kite");
    }

    #[test]
    fn test_bad_row_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join(PRODUCTS_FILE),
            "id,name,handle,price,currency,image_urls,description\nnope,a,b,1,USD,,\n",
        )
        .unwrap();
        assert!(CatalogCsv::load(dir.path()).is_err());
    }

    #[test]
    fn test_image_fingerprint_tracks_url() {
        assert_eq!(image_fingerprint("a.jpg"), image_fingerprint(" a.jpg "));
        assert_ne!(image_fingerprint("a.jpg"), image_fingerprint("b.jpg"));
    }

    #[test]
    fn test_fetcher_reads_uploads_and_refuses_escape() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("bear.png"), b"png-bytes").unwrap();

        let fetcher = DefaultImageFetcher::new(dir.path(), 1024).unwrap();
        assert_eq!(fetcher.fetch("bear.png").unwrap(), b"png-bytes");
        assert!(fetcher.fetch("../bear.png").is_err());
        assert!(fetcher.fetch("ftp://example.com/bear.png").is_err());
    }
}
