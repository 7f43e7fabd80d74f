//! Layer download: cache lookup, streamed fetch with digest verification,
//! decompression and cache registration, run over a bounded worker pool.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use docker_pull_oci::digest::{short_digest, DigestVerifier};
use docker_pull_oci::{decompress_file, BlobCache, LayerDescriptor, OciError, RegistryClient};
use futures_util::StreamExt;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::progress::{LayerProgress, ProgressContext};
use crate::retry::RetryPolicy;

/// Compressed download, removed once decompressed.
pub const COMPRESSED_FILE: &str = "layer_gzip.tar";
/// Uncompressed layer as it appears in the archive.
pub const LAYER_FILE: &str = "layer.tar";

/// One layer to materialize.
#[derive(Debug, Clone)]
pub struct DownloadTask {
    /// Position in the manifest, bottom layer first.
    pub index: usize,
    pub layer: LayerDescriptor,
    /// Chain ID of the layer below; empty for the bottom layer.
    pub parent_id: String,
    pub chain_id: String,
    /// `<workdir>/<chain_id>`
    pub target_dir: PathBuf,
}

/// A layer whose `layer.tar` is in place under `target_dir`.
#[derive(Debug, Clone)]
pub struct DownloadResult {
    pub index: usize,
    pub chain_id: String,
    pub layer: LayerDescriptor,
    pub target_dir: PathBuf,
    pub from_cache: bool,
}

impl DownloadResult {
    pub fn layer_path(&self) -> PathBuf {
        self.target_dir.join(LAYER_FILE)
    }
}

/// Fetches layers for one image.
pub struct LayerFetcher {
    registry: Arc<RegistryClient>,
    cache: Option<BlobCache>,
    progress: Arc<ProgressContext>,
    retry: RetryPolicy,
}

impl LayerFetcher {
    pub fn new(
        registry: Arc<RegistryClient>,
        cache: Option<BlobCache>,
        progress: Arc<ProgressContext>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            registry,
            cache,
            progress,
            retry,
        }
    }

    /// Run every task on at most `max_concurrent` workers.
    ///
    /// The first failure cancels the remaining workers and is returned; on
    /// success the results come back in layer order regardless of the order
    /// in which they finished.
    pub async fn fetch_all(
        self: Arc<Self>,
        tasks: Vec<DownloadTask>,
        max_concurrent: usize,
        cancel: &CancellationToken,
    ) -> Result<Vec<DownloadResult>> {
        let abort = cancel.child_token();
        let semaphore = Arc::new(Semaphore::new(max_concurrent.max(1)));
        let mut join_set = JoinSet::new();
        let total = tasks.len();

        for task in tasks {
            let fetcher = self.clone();
            let semaphore = semaphore.clone();
            let abort = abort.clone();

            join_set.spawn(async move {
                let index = task.index;
                let digest = task.layer.digest.clone();
                let permit = tokio::select! {
                    _ = abort.cancelled() => None,
                    permit = semaphore.acquire_owned() => permit.ok(),
                };
                let result = match permit {
                    Some(_permit) => fetcher.fetch(task, &abort).await,
                    None => Err(Error::Cancelled),
                };
                (index, digest, result)
            });
        }

        let mut results = Vec::with_capacity(total);
        let mut failure: Option<Error> = None;

        while let Some(joined) = join_set.join_next().await {
            let err = match joined {
                Ok((_, _, Ok(done))) => {
                    results.push(done);
                    continue;
                }
                Ok((_, _, Err(e))) if e.is_cancelled() => e,
                Ok((index, digest, Err(e))) => Error::LayerFailed {
                    index,
                    digest,
                    source: Box::new(e),
                },
                Err(e) => Error::Join(e),
            };
            abort.cancel();
            // A real failure outranks the cancellations it triggers.
            match &failure {
                None => failure = Some(err),
                Some(prev) if prev.is_cancelled() && !err.is_cancelled() => failure = Some(err),
                Some(_) => {}
            }
        }

        if let Some(e) = failure {
            return Err(e);
        }
        results.sort_by_key(|r| r.index);
        Ok(results)
    }

    /// Materialize one layer at `<target_dir>/layer.tar`, from the cache when
    /// possible and from the registry otherwise.
    pub async fn fetch(&self, task: DownloadTask, cancel: &CancellationToken) -> Result<DownloadResult> {
        fs::create_dir_all(&task.target_dir).await?;
        let bar = self.progress.layer(&task.layer.digest, task.layer.size);

        if let Some(result) = self.try_cache(&task, &bar).await {
            return Ok(result);
        }
        self.progress.record_cache_miss();

        match self.download_and_unpack(&task, &bar, cancel).await {
            Ok(()) => {}
            Err(e) => {
                bar.abandon(if e.is_cancelled() { "cancelled" } else { "failed" });
                remove_quietly(&task.target_dir.join(COMPRESSED_FILE)).await;
                remove_quietly(&task.target_dir.join(LAYER_FILE)).await;
                return Err(e);
            }
        }

        if let Some(cache) = &self.cache {
            bar.set_stage("caching");
            match cache
                .store(&task.layer.digest, &task.target_dir.join(LAYER_FILE))
                .await
            {
                Ok(true) => self.progress.record_stored(),
                Ok(false) => {}
                Err(e) => warn!(
                    digest = %task.layer.digest,
                    error = %e,
                    "failed to store layer in cache",
                ),
            }
        }

        bar.finish("done");
        Ok(DownloadResult {
            index: task.index,
            chain_id: task.chain_id,
            layer: task.layer,
            target_dir: task.target_dir,
            from_cache: false,
        })
    }

    /// Cache failures are never fatal: any problem falls back to a download.
    async fn try_cache(&self, task: &DownloadTask, bar: &LayerProgress) -> Option<DownloadResult> {
        let cache = self.cache.as_ref()?;
        cache.lookup(&task.layer.digest)?;
        match cache.materialize(&task.layer.digest, &task.target_dir).await {
            Ok(path) => {
                let size = fs::metadata(&path).await.map(|m| m.len()).unwrap_or(0);
                self.progress.record_cache_hit(size);
                bar.finish("cached");
                info!(layer = task.index, digest = short_digest(&task.layer.digest), "using cached layer");
                Some(DownloadResult {
                    index: task.index,
                    chain_id: task.chain_id.clone(),
                    layer: task.layer.clone(),
                    target_dir: task.target_dir.clone(),
                    from_cache: true,
                })
            }
            Err(e) => {
                warn!(
                    digest = %task.layer.digest,
                    error = %e,
                    "cached layer could not be linked, downloading instead",
                );
                None
            }
        }
    }

    async fn download_and_unpack(
        &self,
        task: &DownloadTask,
        bar: &LayerProgress,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let compressed = task.target_dir.join(COMPRESSED_FILE);
        let label = format!("layer {}", task.index);
        let bytes = self
            .retry
            .run(&label, cancel, |_| self.download_once(task, &compressed, bar, cancel))
            .await?;
        self.progress.record_downloaded(bytes);

        bar.set_stage("extracting");
        let written = unpack(task, &compressed, cancel).await?;
        debug!(layer = task.index, compressed = bytes, uncompressed = written, "layer unpacked");

        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        Ok(())
    }

    /// One attempt: try each candidate URL in turn and stream the first that
    /// answers into `dest`, verifying the digest on the way.
    async fn download_once(
        &self,
        task: &DownloadTask,
        dest: &Path,
        bar: &LayerProgress,
        cancel: &CancellationToken,
    ) -> Result<u64> {
        let mut last_err: Option<Error> = None;
        for url in self.registry.blob_candidates(&task.layer) {
            let resp = tokio::select! {
                _ = cancel.cancelled() => return Err(Error::Cancelled),
                resp = self.registry.open_blob(&url) => resp,
            };
            match resp {
                Ok(resp) => {
                    debug!(layer = task.index, url = %url, "downloading blob");
                    bar.start_download(resp.content_length().unwrap_or(task.layer.size));
                    return stream_to_file(resp, dest, &task.layer.digest, bar, cancel).await;
                }
                Err(e) => {
                    warn!(layer = task.index, url = %url, error = %e, "blob source unavailable");
                    last_err = Some(e.into());
                }
            }
        }
        Err(last_err.unwrap_or_else(|| {
            OciError::Registry(format!("no download location for {}", task.layer.digest)).into()
        }))
    }
}

/// Decompress `compressed` into the task's `layer.tar` and drop the
/// compressed copy. Returns the uncompressed size.
async fn unpack(task: &DownloadTask, compressed: &Path, cancel: &CancellationToken) -> Result<u64> {
    if cancel.is_cancelled() {
        return Err(Error::Cancelled);
    }
    let src = compressed.to_path_buf();
    let dst = task.target_dir.join(LAYER_FILE);
    let media_type = task.layer.media_type.clone();
    let written =
        tokio::task::spawn_blocking(move || decompress_file(&src, &dst, media_type.as_deref()))
            .await??;
    fs::remove_file(compressed).await?;
    Ok(written)
}

async fn stream_to_file(
    resp: reqwest::Response,
    dest: &Path,
    digest: &str,
    bar: &LayerProgress,
    cancel: &CancellationToken,
) -> Result<u64> {
    let mut file = fs::File::create(dest).await?;
    let mut verifier = DigestVerifier::new(digest);
    let mut stream = resp.bytes_stream();
    let mut written = 0u64;

    loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            next = stream.next() => next,
        };
        let Some(chunk) = next else { break };
        let chunk = chunk.map_err(OciError::from)?;
        verifier.update(&chunk);
        file.write_all(&chunk).await?;
        written += chunk.len() as u64;
        bar.inc(chunk.len() as u64);
    }

    file.flush().await?;
    verifier.finish()?;
    Ok(written)
}

async fn remove_quietly(path: &Path) {
    if let Err(e) = fs::remove_file(path).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!(path = %path.display(), error = %e, "failed to remove partial file");
        }
    }
}
