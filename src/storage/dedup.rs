//! Durable record of published entry identifiers and the last fetch time.

use std::collections::HashSet;
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use super::StoreError;

/// Maximum store file size accepted on load (16 MB).
const MAX_STORE_SIZE: u64 = 16 * 1024 * 1024;

/// Previously published identifiers plus the time of the last gated fetch.
///
/// Identifiers are persisted as an ordered sequence (insertion order) but
/// membership checks go through an in-memory index rebuilt on load.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DedupRecord {
    #[serde(default)]
    identifiers: Vec<String>,
    /// Milliseconds since the Unix epoch; 0 means "never fetched".
    #[serde(default)]
    last_fetch_time: i64,
    #[serde(skip)]
    index: HashSet<String>,
}

impl DedupRecord {
    /// Build a record from stored parts, dropping duplicate identifiers.
    pub fn from_parts<I, S>(identifiers: I, last_fetch_time: i64) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut record = Self {
            last_fetch_time,
            ..Self::default()
        };
        for id in identifiers {
            record.record(&id.into());
        }
        record
    }

    pub fn contains(&self, id: &str) -> bool {
        self.index.contains(id)
    }

    /// Append `id` if it has not been seen. Returns `true` when it was new.
    pub fn record(&mut self, id: &str) -> bool {
        if self.index.insert(id.to_string()) {
            self.identifiers.push(id.to_string());
            true
        } else {
            false
        }
    }

    pub fn identifiers(&self) -> &[String] {
        &self.identifiers
    }

    pub fn len(&self) -> usize {
        self.identifiers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.identifiers.is_empty()
    }

    pub fn last_fetch_time(&self) -> i64 {
        self.last_fetch_time
    }

    /// Stamp the fetch time. Earlier timestamps are ignored so the value
    /// only ever moves forward.
    pub fn stamp_fetch(&mut self, now_ms: i64) {
        if now_ms > self.last_fetch_time {
            self.last_fetch_time = now_ms;
        }
    }

    fn rebuild_index(&mut self) {
        let mut seen = HashSet::with_capacity(self.identifiers.len());
        self.identifiers.retain(|id| seen.insert(id.clone()));
        self.index = seen;
    }
}

/// File-backed store for a [`DedupRecord`].
#[derive(Debug, Clone)]
pub struct DedupStore {
    path: PathBuf,
}

impl DedupStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the record from disk.
    ///
    /// Never fails: a missing, oversized or corrupt file yields an empty
    /// record with `last_fetch_time == 0`. Corruption is logged.
    pub fn load(&self) -> DedupRecord {
        match self.try_load() {
            Ok(Some(record)) => {
                tracing::debug!(
                    path = %self.path.display(),
                    identifiers = record.len(),
                    last_fetch_time = record.last_fetch_time,
                    "Loaded dedup store"
                );
                record
            }
            Ok(None) => {
                tracing::debug!(path = %self.path.display(), "No dedup store found, starting empty");
                DedupRecord::default()
            }
            Err(e) => {
                tracing::warn!(
                    path = %self.path.display(),
                    error = %e,
                    "Dedup store unreadable, starting empty"
                );
                DedupRecord::default()
            }
        }
    }

    fn try_load(&self) -> Result<Option<DedupRecord>, StoreError> {
        match std::fs::metadata(&self.path) {
            Ok(meta) if meta.len() > MAX_STORE_SIZE => {
                return Err(StoreError::TooLarge(meta.len()));
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(StoreError::Io(e)),
            Ok(_) => {}
        }

        let content = match std::fs::read_to_string(&self.path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(StoreError::Io(e)),
        };

        if content.trim().is_empty() {
            return Ok(None);
        }

        let mut record: DedupRecord = serde_json::from_str(&content)?;
        record.rebuild_index();
        Ok(Some(record))
    }

    /// Persist the record, replacing the previous file wholesale.
    ///
    /// Writes to a randomized sibling temp file, syncs it, then renames it
    /// over the destination so readers never observe a half-written store.
    pub fn save(&self, record: &DedupRecord) -> Result<(), StoreError> {
        let content = serde_json::to_vec_pretty(record)?;

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let suffix = format!(
            "tmp.{:08x}{:08x}",
            std::process::id(),
            rand::random::<u32>()
        );
        let temp_path = self.path.with_extension(suffix);

        let result = write_then_rename(&temp_path, &self.path, &content);
        if result.is_err() {
            let _ = std::fs::remove_file(&temp_path);
        }
        result?;

        tracing::debug!(
            path = %self.path.display(),
            identifiers = record.len(),
            "Saved dedup store"
        );
        Ok(())
    }
}

fn write_then_rename(temp_path: &Path, dst: &Path, content: &[u8]) -> Result<(), StoreError> {
    let mut temp_file = std::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(temp_path)?;
    temp_file.write_all(content)?;
    temp_file.sync_all()?;
    drop(temp_file);

    // Windows refuses to rename over an existing file
    #[cfg(windows)]
    if dst.exists() {
        std::fs::remove_file(dst)?;
    }

    std::fs::rename(temp_path, dst)?;
    Ok(())
}
