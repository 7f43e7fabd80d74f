//! Error types for docker-pull

use docker_pull_oci::manifest::Descriptor;
use docker_pull_oci::OciError;
use thiserror::Error;

/// Result type alias using docker-pull Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while pulling or importing an image
#[derive(Error, Debug)]
pub enum Error {
    /// Registry, manifest and cache errors
    #[error(transparent)]
    Oci(#[from] OciError),

    /// The user interrupted the pull
    #[error("pull cancelled")]
    Cancelled,

    /// A multi-platform image was requested without `--platform`
    #[error("image is multi-platform; choose one of: {}", platform_list(.available))]
    PlatformRequired { available: Vec<Descriptor> },

    /// A layer could not be fetched after exhausting retries
    #[error("layer {index} ({digest}) failed: {source}")]
    LayerFailed {
        index: usize,
        digest: String,
        #[source]
        source: Box<Error>,
    },

    /// Output archive assembly errors
    #[error("archive error: {0}")]
    Archive(String),

    /// Tar import errors
    #[error("import error: {0}")]
    Import(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization/deserialization errors
    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),

    /// A worker task panicked or was aborted
    #[error("worker task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

impl Error {
    /// Whether retrying the failed operation could succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            Error::Oci(e) => e.is_transient(),
            _ => false,
        }
    }

    /// Whether the error came from cancellation rather than a failure.
    pub fn is_cancelled(&self) -> bool {
        match self {
            Error::Cancelled => true,
            Error::LayerFailed { source, .. } => source.is_cancelled(),
            _ => false,
        }
    }
}

fn platform_list(available: &[Descriptor]) -> String {
    available
        .iter()
        .map(|d| d.effective_platform().to_string())
        .collect::<Vec<_>>()
        .join(", ")
}
