use reqwest::StatusCode;

/// Errors produced while talking to a registry or handling its content.
#[derive(Debug, thiserror::Error)]
pub enum OciError {
    #[error("invalid image reference: {0}")]
    InvalidReference(String),

    #[error("invalid digest: {0:?}")]
    InvalidDigest(String),

    #[error("registry error: {0}")]
    Registry(String),

    /// The registry answered with a status that may succeed on a later attempt
    /// (5xx, 429, or no candidate URL returned 200).
    #[error("GET {url} returned {status}")]
    Status { url: String, status: StatusCode },

    #[error("authentication failed: GET {url} returned {status}{hint}")]
    Auth {
        url: String,
        status: StatusCode,
        hint: String,
    },

    #[error("manifest error: {0}")]
    Manifest(String),

    #[error("no manifest found for platform {requested}; available: {}", .available.join(", "))]
    PlatformNotFound {
        requested: String,
        available: Vec<String>,
    },

    #[error("platform mismatch: requested {requested}, but image only supports {actual}")]
    PlatformMismatch { requested: String, actual: String },

    #[error("digest mismatch: expected {expected}, got {actual}")]
    DigestMismatch { expected: String, actual: String },

    #[error("unsupported media type: {0}")]
    UnsupportedMediaType(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("not found: {0}")]
    NotFound(String),
}

impl OciError {
    /// Whether a retry of the same request could plausibly succeed.
    ///
    /// Network-class failures are transient; authentication, schema, missing
    /// content and local disk errors are not.
    pub fn is_transient(&self) -> bool {
        match self {
            OciError::Http(e) => {
                e.is_connect() || e.is_timeout() || e.is_body() || e.is_request()
            }
            OciError::Status { .. } | OciError::DigestMismatch { .. } => true,
            _ => false,
        }
    }
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, OciError>;
