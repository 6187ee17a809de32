//! Local cache of per-day archive files.
//!
//! Each (symbol, interval, day) maps to one file holding the archive exactly
//! as downloaded. Days never share a file, so concurrent workers can write
//! without coordination.

use crate::candle::RawPage;
use crate::csv_utils::decode_zip_page;
use crate::error::CacheError;
use chrono::NaiveDate;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, warn};

/// Deterministic cache file stem: `{symbol}-{interval}-{day}`.
pub fn cache_key(symbol: &str, interval: &str, day: NaiveDate) -> String {
    format!("{}-{}-{}", symbol, interval, day.format("%Y-%m-%d"))
}

#[derive(Debug, Clone)]
pub struct CacheStore {
    dir: PathBuf,
}

impl CacheStore {
    pub async fn open<P: AsRef<Path>>(dir: P) -> Result<Self, CacheError> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir).await.map_err(|source| CacheError::Io {
            path: dir.clone(),
            source,
        })?;
        Ok(Self { dir })
    }

    pub fn path_for(&self, symbol: &str, interval: &str, day: NaiveDate) -> PathBuf {
        self.dir.join(format!("{}.zip", cache_key(symbol, interval, day)))
    }

    /// Returns the cached page, or `None` on a miss. Unreadable or corrupt
    /// files also count as misses so the caller downloads the day again.
    pub async fn get(&self, symbol: &str, interval: &str, day: NaiveDate) -> Option<RawPage> {
        let path = self.path_for(symbol, interval, day);
        let bytes = match fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!(path = %path.display(), "Cache miss");
                return None;
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Unreadable cache file, treating as miss");
                return None;
            }
        };

        match decode_zip_page(&bytes) {
            Ok(page) => {
                debug!(path = %path.display(), rows = page.len(), "Cache hit");
                Some(page)
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Corrupt cache file, treating as miss");
                None
            }
        }
    }

    /// Stores the raw archive bytes for a day. The write goes to a temporary
    /// file that is renamed into place, replacing any corrupt predecessor.
    pub async fn put(
        &self,
        symbol: &str,
        interval: &str,
        day: NaiveDate,
        bytes: &[u8],
    ) -> Result<PathBuf, CacheError> {
        let final_path = self.path_for(symbol, interval, day);
        let tmp_path = self
            .dir
            .join(format!("{}.zip.tmp", cache_key(symbol, interval, day)));

        fs::write(&tmp_path, bytes).await.map_err(|source| CacheError::Io {
            path: tmp_path.clone(),
            source,
        })?;
        fs::rename(&tmp_path, &final_path)
            .await
            .map_err(|source| CacheError::Io {
                path: final_path.clone(),
                source,
            })?;

        debug!(path = %final_path.display(), bytes = bytes.len(), "Cached archive");
        Ok(final_path)
    }
}
