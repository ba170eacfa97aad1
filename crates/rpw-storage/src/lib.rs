//! Catalog + ledger file stores with atomic temp-file-rename writes.
//!
//! Each file is owned by exactly one process at a time (the batch run); the
//! stores add no locking of their own. An interrupted run can never leave a
//! partially written file behind: writes go to a temp path in the same
//! directory and land via `rename`.

use std::collections::BTreeSet;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use rpw_core::PaperRecord;
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::info;
use uuid::Uuid;

pub const CRATE_NAME: &str = "rpw-storage";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("reading {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("writing {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), StoreError> {
    let write_err = |source| StoreError::Write {
        path: path.to_path_buf(),
        source,
    };

    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent).await.map_err(write_err)?;

    let temp_path = parent.join(format!(".{}.tmp", Uuid::new_v4()));
    let mut file = fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(&temp_path)
        .await
        .map_err(write_err)?;
    if let Err(err) = async {
        file.write_all(bytes).await?;
        file.flush().await?;
        drop(file);
        fs::rename(&temp_path, path).await
    }
    .await
    {
        let _ = fs::remove_file(&temp_path).await;
        return Err(write_err(err));
    }
    Ok(())
}

/// The persisted catalog: a JSON array of [`PaperRecord`], the system's
/// source of truth across runs.
#[derive(Debug, Clone)]
pub struct CatalogStore {
    path: PathBuf,
}

impl CatalogStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// `None` on first run, when no catalog file exists yet.
    pub async fn load(&self) -> Result<Option<Vec<PaperRecord>>, StoreError> {
        let text = match fs::read_to_string(&self.path).await {
            Ok(text) => text,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
            Err(err) => {
                return Err(StoreError::Read {
                    path: self.path.clone(),
                    source: err,
                })
            }
        };
        let catalog = serde_json::from_str(&text).map_err(|err| StoreError::Parse {
            path: self.path.clone(),
            source: err,
        })?;
        Ok(Some(catalog))
    }

    /// Replace the catalog atomically; the previous file survives any
    /// mid-write failure.
    pub async fn save(&self, catalog: &[PaperRecord]) -> Result<(), StoreError> {
        let bytes = serde_json::to_vec_pretty(catalog).map_err(|err| StoreError::Parse {
            path: self.path.clone(),
            source: err,
        })?;
        write_atomic(&self.path, &bytes).await?;
        info!(path = %self.path.display(), records = catalog.len(), "catalog persisted");
        Ok(())
    }
}

/// The append-only notification ledger: one id per line, never pruned.
/// Surviving its record's retention expiry is what prevents re-announcing a
/// paper that reappears after its catalog entry was dropped.
#[derive(Debug, Clone)]
pub struct LedgerStore {
    path: PathBuf,
}

impl LedgerStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Empty on first run, when no ledger file exists yet.
    pub async fn load(&self) -> Result<BTreeSet<String>, StoreError> {
        let text = match fs::read_to_string(&self.path).await {
            Ok(text) => text,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(BTreeSet::new()),
            Err(err) => {
                return Err(StoreError::Read {
                    path: self.path.clone(),
                    source: err,
                })
            }
        };
        Ok(text
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(str::to_string)
            .collect())
    }

    /// Append the just-notified ids. Whole-file read-union-rewrite behind an
    /// atomic rename, so either every id lands or none does.
    pub async fn append(&self, ids: &[String]) -> Result<(), StoreError> {
        if ids.is_empty() {
            return Ok(());
        }
        let mut entries = self.load().await?;
        entries.extend(ids.iter().cloned());

        let mut text = entries.into_iter().collect::<Vec<_>>().join("\n");
        text.push('\n');
        write_atomic(&self.path, text.as_bytes()).await?;
        info!(path = %self.path.display(), appended = ids.len(), "ledger appended");
        Ok(())
    }
}
