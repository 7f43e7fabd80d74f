//! docker-pull: fetch container images from a registry without a daemon
//!
//! Resolves an image reference to a single-platform manifest, downloads its
//! layers over a bounded worker pool with a content-addressed cache, and
//! writes an archive that `docker load` accepts.
//!
//! # Example
//!
//! ```no_run
//! use docker_pull::{PullOptions, Puller};
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let options = PullOptions {
//!         platform: Some("linux/arm64".parse()?),
//!         ..PullOptions::default()
//!     };
//!     let report = Puller::new(options, CancellationToken::new())
//!         .pull("alpine:3.20")
//!         .await?;
//!     println!("wrote {}", report.archive.display());
//!     Ok(())
//! }
//! ```

pub mod archive;
pub mod chain;
pub mod error;
pub mod fetch;
pub mod import;
pub mod progress;
pub mod pull;
pub mod retry;

pub use archive::{archive_file_name, work_dir_name, ArchiveAssembler, ArchiveManifestEntry};
pub use chain::chain_ids;
pub use error::{Error, Result};
pub use fetch::{DownloadResult, DownloadTask, LayerFetcher};
pub use import::{import_tar, ImportReport};
pub use progress::{ProgressContext, PullStats};
pub use pull::{PullOptions, PullReport, Puller, DEFAULT_CACHE_DIR};
pub use retry::RetryPolicy;

pub use docker_pull_oci as oci;
