use std::path::{Path, PathBuf};

use anyhow::Context;
use async_trait::async_trait;

use crate::session::{FileStore, SavedFile};

/// Persists finished payloads into a target directory, renaming the partial
/// file into place and suffixing ` (n)` when the name is already taken.
pub struct DiskFileStore {
    dir: PathBuf,
}

impl DiskFileStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

#[async_trait]
impl FileStore for DiskFileStore {
    async fn save(&self, location: &Path, file_name: &str) -> anyhow::Result<SavedFile> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .with_context(|| format!("create_dir_all {}", self.dir.display()))?;

        let name = sanitize_filename::sanitize(file_name);
        let name = if name.is_empty() {
            "download.bin".to_string()
        } else {
            name
        };

        let target = unique_path(&self.dir, &name).await;
        tokio::fs::rename(location, &target)
            .await
            .with_context(|| {
                format!("move {} to {}", location.display(), target.display())
            })?;

        let file_name = target
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or(name);
        Ok(SavedFile {
            path: target,
            file_name,
        })
    }
}

async fn unique_path(dir: &Path, name: &str) -> PathBuf {
    let candidate = dir.join(name);
    if !path_exists(&candidate).await {
        return candidate;
    }

    let (stem, extension) = match name.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => (stem.to_string(), Some(ext.to_string())),
        _ => (name.to_string(), None),
    };

    let mut n = 1u32;
    loop {
        let numbered = match &extension {
            Some(ext) => format!("{} ({}).{}", stem, n, ext),
            None => format!("{} ({})", stem, n),
        };
        let candidate = dir.join(numbered);
        if !path_exists(&candidate).await {
            return candidate;
        }
        n += 1;
    }
}

async fn path_exists(path: &Path) -> bool {
    tokio::fs::try_exists(path).await.unwrap_or(false)
}
