//! Seed the layer cache from an existing `docker save` style archive.
//!
//! Layers are keyed by the sha256 of their uncompressed `layer.tar`, which
//! is not the compressed digest a registry serves them under; imported
//! entries only produce hits for blobs that are stored uncompressed.

use std::fs::File;
use std::io::{self, BufReader};
use std::path::{Component, Path, PathBuf};

use docker_pull_oci::digest::{hex_encode, short_digest};
use docker_pull_oci::BlobCache;
use sha2::{Digest, Sha256};
use tracing::{info, warn};

use crate::archive::ArchiveManifestEntry;
use crate::error::{Error, Result};

/// Outcome of an import.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImportReport {
    /// Images listed in the archive's `manifest.json`.
    pub images: usize,
    pub imported: usize,
    /// Already cached.
    pub skipped: usize,
    /// Listed in the manifest but absent from the archive.
    pub missing: usize,
    /// Could not be stored.
    pub failed: usize,
    /// Bytes of newly imported layers.
    pub bytes: u64,
}

/// `sha256:<hex>` of a file, streamed.
pub fn file_digest(path: &Path) -> io::Result<String> {
    let mut reader = BufReader::new(File::open(path)?);
    let mut hasher = Sha256::new();
    io::copy(&mut reader, &mut hasher)?;
    Ok(format!("sha256:{}", hex_encode(&hasher.finalize())))
}

/// A `Layers` entry must stay inside the extracted archive.
fn is_contained(layer_path: &str) -> bool {
    !layer_path.is_empty()
        && Path::new(layer_path)
            .components()
            .all(|c| matches!(c, Component::Normal(_) | Component::CurDir))
}

/// Image count, `(path, digest)` per present layer, missing layer count.
type HashedLayers = (usize, Vec<(PathBuf, String)>, usize);

/// Unpacks `archive` and hashes every layer its manifest lists. Blocking.
fn extract_and_hash(archive: &Path, scratch: &Path) -> Result<HashedLayers> {
    let file = File::open(archive)
        .map_err(|e| Error::Import(format!("cannot open {}: {}", archive.display(), e)))?;
    tar::Archive::new(BufReader::new(file))
        .unpack(scratch)
        .map_err(|e| Error::Import(format!("cannot unpack {}: {}", archive.display(), e)))?;

    let manifest_path = scratch.join("manifest.json");
    let raw = std::fs::read(&manifest_path)
        .map_err(|_| Error::Import("archive has no manifest.json".to_string()))?;
    let images: Vec<ArchiveManifestEntry> = serde_json::from_slice(&raw)
        .map_err(|e| Error::Import(format!("invalid manifest.json: {}", e)))?;

    let mut layers = Vec::new();
    let mut missing = 0;
    for image in &images {
        if image.layers.is_empty() {
            warn!(config = %image.config, "image lists no layers, skipping");
            continue;
        }
        info!(tags = ?image.repo_tags, layers = image.layers.len(), "importing image");
        for layer in &image.layers {
            let path = scratch.join(layer);
            if !is_contained(layer) || !path.is_file() {
                warn!(layer = %layer, "layer file missing from archive");
                missing += 1;
                continue;
            }
            let digest = file_digest(&path)?;
            layers.push((path, digest));
        }
    }
    Ok((images.len(), layers, missing))
}

/// Unpack `archive` into a scratch directory inside the cache root and store
/// every layer that is not cached yet.
pub async fn import_tar(archive: &Path, cache: &BlobCache) -> Result<ImportReport> {
    if !archive.is_file() {
        return Err(Error::Import(format!("{} does not exist", archive.display())));
    }
    tokio::fs::create_dir_all(cache.cache_dir()).await?;
    // Inside the cache root so layers can be hard-linked into it.
    let scratch = tempfile::Builder::new()
        .prefix(".import-")
        .tempdir_in(cache.cache_dir())?;

    let src = archive.to_path_buf();
    let dir = scratch.path().to_path_buf();
    let (images, layers, missing) =
        tokio::task::spawn_blocking(move || extract_and_hash(&src, &dir)).await??;

    let mut report = ImportReport {
        images,
        missing,
        ..ImportReport::default()
    };
    for (path, digest) in layers {
        if cache.lookup(&digest).is_some() {
            info!(digest = short_digest(&digest), "layer already cached");
            report.skipped += 1;
            continue;
        }
        let size = tokio::fs::metadata(&path).await?.len();
        match cache.store(&digest, &path).await {
            Ok(true) => {
                info!(digest = short_digest(&digest), size, "layer imported");
                report.imported += 1;
                report.bytes += size;
            }
            // Same layer listed twice in the archive.
            Ok(false) => report.skipped += 1,
            Err(e) => {
                warn!(digest = %digest, error = %e, "failed to import layer");
                report.failed += 1;
            }
        }
    }

    scratch.close()?;
    Ok(report)
}
