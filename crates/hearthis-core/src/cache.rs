//! On-disk page cache: one JSON file per (scope, page).
//!
//! The cache is advisory. Reads that fail for any reason are misses, and
//! write failures are reported but never stop the caller from merging the
//! page it just fetched.

use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::{NamedTempFile, TempDir};
use tracing::{debug, warn};

use crate::error::CacheError;
use crate::fetcher::parse_page;
use crate::model::{CatalogPage, Scope};
use crate::platform;

enum Storage {
    /// Removed when the cache is dropped.
    Session(TempDir),
    Persistent(PathBuf),
}

pub struct PageCache {
    storage: Storage,
}

impl PageCache {
    /// A store that only lives as long as this value.
    pub fn session() -> Result<Self, CacheError> {
        let parent = platform::cache_dir();
        std::fs::create_dir_all(&parent)?;
        let dir = tempfile::Builder::new()
            .prefix("session-")
            .tempdir_in(&parent)?;
        debug!("session page cache at {}", dir.path().display());
        Ok(Self {
            storage: Storage::Session(dir),
        })
    }

    /// A store that survives restarts. Pages never expire.
    pub fn persistent(dir: impl Into<PathBuf>) -> Result<Self, CacheError> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        debug!("persistent page cache at {}", dir.display());
        Ok(Self {
            storage: Storage::Persistent(dir),
        })
    }

    pub fn dir(&self) -> &Path {
        match &self.storage {
            Storage::Session(tmp) => tmp.path(),
            Storage::Persistent(dir) => dir,
        }
    }

    pub fn path_for(&self, scope: &Scope, page: u32) -> PathBuf {
        self.dir().join(cache_file_name(scope, page))
    }

    /// Cached page, or `None` on a miss or any read/parse problem.
    pub fn get(&self, scope: &Scope, page: u32) -> Option<CatalogPage> {
        let path = self.path_for(scope, page);
        let bytes = match std::fs::read(&path) {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
            Err(e) => {
                warn!("cache read {} failed: {}", path.display(), e);
                return None;
            }
        };
        let raw: serde_json::Value = match serde_json::from_slice(&bytes) {
            Ok(v) => v,
            Err(e) => {
                warn!("cache entry {} is not JSON: {}", path.display(), e);
                return None;
            }
        };
        match parse_page(scope, page, raw) {
            Ok(parsed) => {
                debug!("cache hit {} page {}", scope, page);
                Some(parsed)
            }
            Err(e) => {
                warn!("cache entry {} unusable: {}", path.display(), e);
                None
            }
        }
    }

    /// Store the raw body of `page`. Writing identical content again leaves
    /// the file untouched; different content replaces it atomically.
    pub fn set(&self, page: &CatalogPage) -> Result<(), CacheError> {
        let path = self.path_for(&page.scope, page.number);
        let bytes = serde_json::to_vec(&page.raw)
            .map_err(|e| CacheError::IoFailure(std::io::Error::other(e)))?;

        if let Ok(existing) = std::fs::read(&path) {
            if existing == bytes {
                return Ok(());
            }
            debug!("cache entry {} changed, overwriting", path.display());
        }

        let mut tmp = NamedTempFile::new_in(self.dir())?;
        tmp.write_all(&bytes)?;
        tmp.flush()?;
        tmp.persist(&path).map_err(|e| CacheError::IoFailure(e.error))?;
        Ok(())
    }
}

/// `<kind>_<id>_page<N>.json`; the id is percent-encoded so any query text
/// yields a safe, unambiguous file name.
pub fn cache_file_name(scope: &Scope, page: u32) -> String {
    format!(
        "{}_{}_page{}.json",
        scope.kind(),
        urlencoding::encode(&scope.id()),
        page
    )
}
