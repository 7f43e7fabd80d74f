//! Pull orchestration: resolve, fetch layers, assemble the archive.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use docker_pull_oci::{
    BlobCache, ClientOptions, Credentials, ImageRef, ImageResolution, ManifestKind, Platform,
    RegistryClient, ResolvedImage,
};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::archive::{work_dir_name, ArchiveAssembler};
use crate::chain::chain_ids;
use crate::error::{Error, Result};
use crate::fetch::{DownloadTask, LayerFetcher};
use crate::progress::{ProgressContext, PullStats};
use crate::retry::RetryPolicy;

/// Default location of the layer cache, relative to the working directory.
pub const DEFAULT_CACHE_DIR: &str = "docker_images_cache";

/// Settings for one pull.
#[derive(Debug, Clone)]
pub struct PullOptions {
    /// Required for multi-platform images.
    pub platform: Option<Platform>,
    pub max_concurrent_downloads: usize,
    pub credentials: Option<Credentials>,
    pub cache_dir: PathBuf,
    pub use_cache: bool,
    /// Where the archive is written; the working directory lives here too.
    pub output_dir: PathBuf,
    pub retry: RetryPolicy,
    pub insecure_tls: bool,
    /// Deadline for metadata requests, and the longest a layer download may
    /// go without receiving data.
    pub request_timeout: Duration,
    pub show_progress: bool,
}

impl Default for PullOptions {
    fn default() -> Self {
        Self {
            platform: None,
            max_concurrent_downloads: 3,
            credentials: None,
            cache_dir: PathBuf::from(DEFAULT_CACHE_DIR),
            use_cache: true,
            output_dir: PathBuf::from("."),
            retry: RetryPolicy::default(),
            insecure_tls: false,
            request_timeout: Duration::from_secs(30),
            show_progress: false,
        }
    }
}

/// Summary of a finished pull.
#[derive(Debug, Clone)]
pub struct PullReport {
    pub image: ImageRef,
    pub archive: PathBuf,
    pub manifest_kind: ManifestKind,
    pub config_digest: String,
    /// Chain IDs, bottom layer first; the last one is the image ID.
    pub chain_ids: Vec<String>,
    pub stats: PullStats,
    pub elapsed: Duration,
}

impl PullReport {
    pub fn image_id(&self) -> Option<&str> {
        self.chain_ids.last().map(String::as_str)
    }
}

pub struct Puller {
    options: PullOptions,
    cancel: CancellationToken,
    progress: Arc<ProgressContext>,
}

impl Puller {
    /// `cancel` stops the pull at its next suspension point; the working
    /// directory is removed and [`Error::Cancelled`] returned.
    pub fn new(options: PullOptions, cancel: CancellationToken) -> Self {
        let progress = Arc::new(ProgressContext::new(options.show_progress));
        Self {
            options,
            cancel,
            progress,
        }
    }

    pub fn progress(&self) -> &Arc<ProgressContext> {
        &self.progress
    }

    /// The layer cache, or `None` when disabled or unusable.
    async fn open_cache(&self) -> Option<BlobCache> {
        if !self.options.use_cache {
            return None;
        }
        let cache = BlobCache::new(self.options.cache_dir.clone());
        if let Err(e) = tokio::fs::create_dir_all(cache.cache_dir()).await {
            warn!(
                cache_dir = %cache.cache_dir().display(),
                error = %e,
                "cache directory unavailable, continuing without cache",
            );
            return None;
        }
        match cache.remove_stale_staging().await {
            Ok(0) => {}
            Ok(n) => info!(removed = n, "removed interrupted cache writes"),
            Err(e) => warn!(error = %e, "failed to scan cache for interrupted writes"),
        }
        Some(cache)
    }

    pub async fn pull(&self, reference: &str) -> Result<PullReport> {
        let image = ImageRef::parse(reference)?;
        info!(
            registry = %image.registry,
            repository = %image.repository,
            reference = %image.reference,
            "pulling image",
        );

        let client = RegistryClient::new(
            image.clone(),
            ClientOptions {
                credentials: self.options.credentials.clone(),
                insecure: self.options.insecure_tls,
                request_timeout: self.options.request_timeout,
                read_timeout: self.options.request_timeout,
                ..ClientOptions::default()
            },
        )?;

        let resolved = tokio::select! {
            _ = self.cancel.cancelled() => return Err(Error::Cancelled),
            r = client.resolve_image(self.options.platform.as_ref()) => r?,
        };
        let resolved = match resolved {
            ImageResolution::Resolved(r) => r,
            ImageResolution::PlatformChoice(available) => {
                return Err(Error::PlatformRequired { available })
            }
        };

        let digests = resolved.manifest.layer_digests();
        let ids = chain_ids(&digests);
        self.progress.record_layers(digests.len());
        info!(layers = digests.len(), config = %resolved.config.digest, "manifest resolved");

        let workdir = self.options.output_dir.join(work_dir_name(&image));
        if tokio::fs::try_exists(&workdir).await? {
            warn!(path = %workdir.display(), "removing leftover working directory");
            tokio::fs::remove_dir_all(&workdir).await?;
        }
        tokio::fs::create_dir_all(&workdir).await?;

        let manifest_kind = resolved.manifest.kind;
        let config_digest = resolved.config.digest.clone();
        match self.build(&image, client, resolved, &ids, &workdir).await {
            Ok(archive) => Ok(PullReport {
                image,
                archive,
                manifest_kind,
                config_digest,
                chain_ids: ids,
                stats: self.progress.stats(),
                elapsed: self.progress.elapsed(),
            }),
            Err(e) => {
                remove_workdir(&workdir).await;
                Err(e)
            }
        }
    }

    /// Fetch every layer into `workdir` and pack the archive.
    async fn build(
        &self,
        image: &ImageRef,
        client: RegistryClient,
        resolved: ResolvedImage,
        ids: &[String],
        workdir: &Path,
    ) -> Result<PathBuf> {
        let tasks: Vec<DownloadTask> = resolved
            .manifest
            .layers
            .iter()
            .zip(ids)
            .enumerate()
            .map(|(index, (layer, chain_id))| DownloadTask {
                index,
                layer: layer.clone(),
                parent_id: index
                    .checked_sub(1)
                    .map(|p| ids[p].clone())
                    .unwrap_or_default(),
                chain_id: chain_id.clone(),
                target_dir: workdir.join(chain_id),
            })
            .collect();

        let fetcher = Arc::new(LayerFetcher::new(
            Arc::new(client),
            self.open_cache().await,
            self.progress.clone(),
            self.options.retry.clone(),
        ));
        let results = fetcher
            .fetch_all(tasks, self.options.max_concurrent_downloads, &self.cancel)
            .await?;

        if self.cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let image = image.clone();
        let config = resolved.config;
        let workdir = workdir.to_path_buf();
        let output_dir = self.options.output_dir.clone();
        let archive = tokio::task::spawn_blocking(move || {
            ArchiveAssembler::new(&image, &config, workdir).assemble(&results, &output_dir)
        })
        .await??;
        Ok(archive)
    }
}

async fn remove_workdir(path: &Path) {
    if let Err(e) = tokio::fs::remove_dir_all(path).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!(path = %path.display(), error = %e, "failed to remove working directory");
        }
    }
}
