use std::path::{Component, Path, PathBuf};

pub trait StorageManager: Send + Sync {
    fn write(&self, ident: &str, data: &[u8]) -> std::io::Result<()>;
    fn read(&self, ident: &str) -> std::io::Result<Vec<u8>>;
    fn exists(&self, ident: &str) -> bool;
}

/// Files under a single base directory.
#[derive(Clone, Debug)]
pub struct BackendLocal {
    pub base_dir: PathBuf,
}

impl BackendLocal {
    pub fn new(storage_dir: impl AsRef<Path>) -> std::io::Result<Self> {
        let path = storage_dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&path)?;
        Ok(BackendLocal { base_dir: path })
    }

    /// Resolve `ident` inside the base directory. Absolute paths and `..`
    /// components are refused so idents cannot escape it.
    fn resolve(&self, ident: &str) -> std::io::Result<PathBuf> {
        let rel = Path::new(ident);
        let escapes = rel
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
        if escapes || ident.is_empty() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("invalid storage ident {ident:?}"),
            ));
        }
        Ok(self.base_dir.join(rel))
    }
}

impl StorageManager for BackendLocal {
    fn exists(&self, ident: &str) -> bool {
        self.resolve(ident)
            .map(|path| std::fs::metadata(path).is_ok())
            .unwrap_or(false)
    }

    fn read(&self, ident: &str) -> std::io::Result<Vec<u8>> {
        std::fs::read(self.resolve(ident)?)
    }

    fn write(&self, ident: &str, data: &[u8]) -> std::io::Result<()> {
        let path = self.resolve(ident)?;
        let temp_path = path.with_file_name(format!(
            ".{}-{}",
            rand::random::<u64>(),
            path.file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default()
        ));

        std::fs::write(&temp_path, data)?;
        std::fs::rename(&temp_path, &path)
    }
}
