use std::io;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::{debug, warn};

use crate::digest::{short_digest, validate};
use crate::error::Result;

const LAYER_FILE: &str = "layer.tar";
const METADATA_FILE: &str = "metadata.json";
const STAGING_SUFFIX: &str = ".partial";

/// Content-addressed layer cache stored under
/// `<cache_dir>/layers/<algorithm>_<hex>/{layer.tar,metadata.json}`.
///
/// Entries are append-only: once `layer.tar` exists for a digest it is never
/// rewritten. Layers are shared with working directories through hard links,
/// so the cache and the output directory must live on the same filesystem;
/// when they do not, linking fails and the pull proceeds without the cache.
#[derive(Debug, Clone)]
pub struct BlobCache {
    cache_dir: PathBuf,
}

/// A stored cache entry, as described by its metadata record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub digest: String,
    pub size: u64,
    /// Seconds since the Unix epoch.
    pub cached_at: u64,
    #[serde(skip)]
    pub path: PathBuf,
}

impl BlobCache {
    pub fn new(cache_dir: PathBuf) -> Self {
        Self { cache_dir }
    }

    /// Return a reference to the underlying cache directory.
    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    fn layers_dir(&self) -> PathBuf {
        self.cache_dir.join("layers")
    }

    /// Directory holding the entry for `digest` (`:` replaced by `_`).
    ///
    /// Fails for anything that is not an `algorithm:hex` digest.
    pub fn entry_dir(&self, digest: &str) -> Result<PathBuf> {
        validate(digest)?;
        Ok(self.layers_dir().join(digest.replace(':', "_")))
    }

    /// Path of the cached layer for `digest`, if one exists.
    ///
    /// Existence only; the content is trusted as written. Malformed digests
    /// are never found.
    pub fn lookup(&self, digest: &str) -> Option<PathBuf> {
        let path = self.entry_dir(digest).ok()?.join(LAYER_FILE);
        path.is_file().then_some(path)
    }

    /// Hard-link the cached layer for `digest` to `<target_dir>/layer.tar`.
    pub async fn materialize(&self, digest: &str, target_dir: &Path) -> Result<PathBuf> {
        let src = self.lookup(digest).ok_or_else(|| {
            io::Error::new(io::ErrorKind::NotFound, format!("{} not cached", digest))
        })?;
        let dest = target_dir.join(LAYER_FILE);
        match fs::remove_file(&dest).await {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        fs::hard_link(&src, &dest).await?;
        debug!(digest = short_digest(digest), dest = %dest.display(), "linked cached layer");
        Ok(dest)
    }

    /// Register the decompressed layer at `source` under `digest`.
    ///
    /// Returns `Ok(false)` without touching anything when an entry already
    /// exists. The entry is assembled in a staging directory and renamed into
    /// place, so a concurrent store of the same digest or an interrupted one
    /// never leaves a half-written entry behind.
    pub async fn store(&self, digest: &str, source: &Path) -> Result<bool> {
        let final_dir = self.entry_dir(digest)?;
        if self.lookup(digest).is_some() {
            return Ok(false);
        }

        let layers_dir = self.layers_dir();
        fs::create_dir_all(&layers_dir).await?;

        let staging = layers_dir.join(format!(
            "{}.{}{}",
            digest.replace(':', "_"),
            uuid::Uuid::now_v7().simple(),
            STAGING_SUFFIX
        ));

        match self.stage_entry(digest, source, &staging).await {
            Ok(()) => {}
            Err(e) => {
                let _ = fs::remove_dir_all(&staging).await;
                return Err(e);
            }
        }

        match fs::rename(&staging, &final_dir).await {
            Ok(()) => {
                debug!(digest = short_digest(digest), "stored layer in cache");
                Ok(true)
            }
            Err(e) => {
                let _ = fs::remove_dir_all(&staging).await;
                if self.lookup(digest).is_some() {
                    // Another worker stored the same content first.
                    Ok(false)
                } else {
                    Err(e.into())
                }
            }
        }
    }

    async fn stage_entry(&self, digest: &str, source: &Path, staging: &Path) -> Result<()> {
        fs::create_dir(staging).await?;
        fs::hard_link(source, staging.join(LAYER_FILE)).await?;

        let size = fs::metadata(source).await?.len();
        let cached_at = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        let entry = CacheEntry {
            digest: digest.to_string(),
            size,
            cached_at,
            path: PathBuf::new(),
        };
        fs::write(staging.join(METADATA_FILE), serde_json::to_vec(&entry)?).await?;
        Ok(())
    }

    /// Read the metadata record for `digest`.
    pub async fn entry(&self, digest: &str) -> Result<Option<CacheEntry>> {
        let Some(path) = self.lookup(digest) else {
            return Ok(None);
        };
        let raw = fs::read(self.entry_dir(digest)?.join(METADATA_FILE)).await?;
        let mut entry: CacheEntry = serde_json::from_slice(&raw)?;
        entry.path = path;
        Ok(Some(entry))
    }

    /// Remove staging directories left by a process that died mid-store.
    pub async fn remove_stale_staging(&self) -> Result<usize> {
        let mut dir = match fs::read_dir(self.layers_dir()).await {
            Ok(d) => d,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };
        let mut removed = 0;
        while let Some(entry) = dir.next_entry().await? {
            let name = entry.file_name();
            if name.to_string_lossy().ends_with(STAGING_SUFFIX) {
                if let Err(e) = fs::remove_dir_all(entry.path()).await {
                    warn!(path = %entry.path().display(), error = %e, "failed to remove stale cache staging dir");
                } else {
                    removed += 1;
                }
            }
        }
        Ok(removed)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
