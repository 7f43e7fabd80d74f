use std::fmt;
use std::time::Duration;

use reqwest::header::WWW_AUTHENTICATE;
use reqwest::{Response, StatusCode};
use tracing::{debug, info};

use crate::auth::{Credentials, RegistryAuthenticator};
use crate::digest::DigestVerifier;
use crate::error::{OciError, Result};
use crate::layer::LayerDescriptor;
use crate::manifest::{
    self, ConfigBlob, ConfigSource, Descriptor, Manifest, Platform, Resolution,
    MANIFEST_ACCEPT_TYPES,
};

const DOCKER_HUB: &str = "registry-1.docker.io";

/// An index may point at another index; stop following after this many hops.
const MAX_INDEX_DEPTH: usize = 3;

// ---------------------------------------------------------------------------
// ImageRef
// ---------------------------------------------------------------------------

/// Tag or digest half of an image reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reference {
    Tag(String),
    Digest(String),
}

impl Reference {
    pub fn as_str(&self) -> &str {
        match self {
            Reference::Tag(t) => t,
            Reference::Digest(d) => d,
        }
    }
}

impl fmt::Display for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A parsed image reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageRef {
    /// Registry hostname (e.g. "registry-1.docker.io").
    pub registry: String,
    /// Repository path (e.g. "library/alpine").
    pub repository: String,
    /// Tag or digest (e.g. "latest" or "sha256:abc123").
    pub reference: Reference,
    /// The name as the user wrote it, without tag or digest
    /// (e.g. "alpine" or "ghcr.io/foo/bar").
    pub name: String,
}

impl ImageRef {
    /// Parse a raw image reference string.
    ///
    /// Supported formats:
    /// - `alpine:latest`
    /// - `ubuntu`
    /// - `ghcr.io/foo/bar:v1`
    /// - `my.registry.io/org/repo@sha256:<64 hex>`
    pub fn parse(raw: &str) -> Result<Self> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(OciError::InvalidReference("empty image reference".to_string()));
        }

        // Split off the reference (tag or digest).
        let (name_part, reference) = if let Some((name, digest)) = raw.split_once('@') {
            if crate::digest::validate(digest).is_err() {
                return Err(OciError::InvalidReference(format!(
                    "digest '{}' must look like algorithm:hex",
                    digest
                )));
            }
            (name, Reference::Digest(digest.to_string()))
        } else if let Some(colon_pos) = raw.rfind(':') {
            // A tag colon always comes after the last '/'; an earlier one
            // belongs to a registry port ("localhost:5000/repo").
            let after_last_slash = raw.rfind('/').map(|p| p + 1).unwrap_or(0);
            if colon_pos > after_last_slash {
                (&raw[..colon_pos], Reference::Tag(raw[colon_pos + 1..].to_string()))
            } else {
                (raw, Reference::Tag("latest".to_string()))
            }
        } else {
            (raw, Reference::Tag("latest".to_string()))
        };

        if name_part.is_empty() || reference.as_str().is_empty() {
            return Err(OciError::InvalidReference(raw.to_string()));
        }
        if name_part.split('/').any(str::is_empty) {
            return Err(OciError::InvalidReference(format!(
                "empty path component in '{}'",
                raw
            )));
        }

        // A first component is a registry hostname when it contains a dot
        // or a colon (port).
        let (registry, repository) = match name_part.split_once('/') {
            Some((first, rest)) if first.contains('.') || first.contains(':') => {
                (first.to_string(), rest.to_string())
            }
            _ => (DOCKER_HUB.to_string(), name_part.to_string()),
        };

        // Docker Hub official images live under "library/".
        let repository = if registry == DOCKER_HUB && !repository.contains('/') {
            format!("library/{}", repository)
        } else {
            repository
        };

        Ok(Self {
            registry,
            repository,
            reference,
            name: name_part.to_string(),
        })
    }

    /// Last path component of the repository ("alpine" for "library/alpine").
    pub fn image_name(&self) -> &str {
        self.repository
            .rsplit('/')
            .next()
            .unwrap_or(&self.repository)
    }

    /// `name:reference`, as recorded in the archive's `RepoTags`.
    pub fn repo_tag(&self) -> String {
        format!("{}:{}", self.name, self.reference)
    }
}

impl fmt::Display for ImageRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.reference {
            Reference::Tag(t) => write!(f, "{}/{}:{}", self.registry, self.repository, t),
            Reference::Digest(d) => write!(f, "{}/{}@{}", self.registry, self.repository, d),
        }
    }
}

// ---------------------------------------------------------------------------
// RegistryClient
// ---------------------------------------------------------------------------

/// HTTP settings for a [`RegistryClient`].
#[derive(Debug, Clone)]
pub struct ClientOptions {
    pub credentials: Option<Credentials>,
    /// Accept invalid TLS certificates.
    pub insecure: bool,
    /// Bound on auth probes, token requests, manifests and config blobs.
    pub request_timeout: Duration,
    pub connect_timeout: Duration,
    /// Longest a single read may wait for data. Layer downloads have no
    /// overall deadline; a connection that stalls mid-response fails with a
    /// timeout instead.
    pub read_timeout: Duration,
    pub user_agent: String,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            credentials: None,
            insecure: false,
            request_timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(10),
            read_timeout: Duration::from_secs(30),
            user_agent: concat!("docker-pull/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }
}

/// Return the base URL scheme for a registry host.
/// Localhost and loopback registries default to HTTP; everything else to HTTPS.
fn registry_scheme(registry: &str) -> &'static str {
    let host = registry.split(':').next().unwrap_or(registry);
    if host == "localhost" || host == "127.0.0.1" || host == "::1" {
        "http"
    } else {
        "https"
    }
}

/// Registry Distribution API client bound to one repository.
pub struct RegistryClient {
    client: reqwest::Client,
    auth: RegistryAuthenticator,
    base_url: String,
    image: ImageRef,
    request_timeout: Duration,
}

/// A single-platform image with its config, ready for layer download.
#[derive(Debug, Clone)]
pub struct ResolvedImage {
    pub manifest: Manifest,
    pub config: ConfigBlob,
}

/// What resolving an image reference produced.
#[derive(Debug, Clone)]
pub enum ImageResolution {
    Resolved(ResolvedImage),
    /// A multi-platform image and no platform was requested.
    PlatformChoice(Vec<Descriptor>),
}

impl RegistryClient {
    pub fn new(image: ImageRef, options: ClientOptions) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(options.user_agent.clone())
            .connect_timeout(options.connect_timeout)
            .read_timeout(options.read_timeout)
            .danger_accept_invalid_certs(options.insecure)
            .build()?;
        let base_url = format!("{}://{}", registry_scheme(&image.registry), image.registry);
        let auth = RegistryAuthenticator::new(
            client.clone(),
            base_url.clone(),
            image.registry.clone(),
            options.credentials,
            options.request_timeout,
        );
        Ok(Self {
            client,
            auth,
            base_url,
            image,
            request_timeout: options.request_timeout,
        })
    }

    pub fn image(&self) -> &ImageRef {
        &self.image
    }

    // -- public API ---------------------------------------------------------

    /// Fetch the raw manifest body for a tag or digest.
    pub async fn fetch_manifest(&self, reference: &str) -> Result<Vec<u8>> {
        let url = format!(
            "{}/v2/{}/manifests/{}",
            self.base_url, self.image.repository, reference
        );
        let resp = self
            .get(&url, &MANIFEST_ACCEPT_TYPES, Some(self.request_timeout))
            .await?;
        Ok(resp.bytes().await?.to_vec())
    }

    /// Registry blob endpoint for `digest`.
    pub fn blob_url(&self, digest: &str) -> String {
        format!(
            "{}/v2/{}/blobs/{}",
            self.base_url, self.image.repository, digest
        )
    }

    /// URLs to try for a layer: the registry first, then any alternates the
    /// descriptor advertises.
    pub fn blob_candidates(&self, layer: &LayerDescriptor) -> Vec<String> {
        std::iter::once(self.blob_url(&layer.digest))
            .chain(layer.urls.iter().cloned())
            .collect()
    }

    /// Start a blob download, returning the response once it answered `200`.
    ///
    /// Registry credentials are only attached to URLs on the registry itself.
    pub async fn open_blob(&self, url: &str) -> Result<Response> {
        if url.starts_with(&self.base_url) {
            self.get(url, &[], None).await
        } else {
            let resp = self.client.get(url).send().await?;
            check_status(url, resp, self.auth.has_credentials())
        }
    }

    /// Fetch a small blob into memory and verify its digest.
    pub async fn fetch_blob(&self, digest: &str) -> Result<Vec<u8>> {
        let url = self.blob_url(digest);
        let resp = self.get(&url, &[], Some(self.request_timeout)).await?;
        let body = resp.bytes().await?;
        let mut verifier = DigestVerifier::new(digest);
        verifier.update(&body);
        verifier.finish()?;
        Ok(body.to_vec())
    }

    /// The config blob, fetched for schema 2 manifests and taken as-is when
    /// it was synthesized.
    pub async fn fetch_config(&self, source: &ConfigSource) -> Result<ConfigBlob> {
        match source {
            ConfigSource::Synthesized(blob) => Ok(blob.clone()),
            ConfigSource::Remote(desc) => {
                info!(digest = %desc.digest, "fetching image config");
                Ok(ConfigBlob {
                    digest: desc.digest.clone(),
                    bytes: self.fetch_blob(&desc.digest).await?,
                })
            }
        }
    }

    /// Resolve the bound reference to a single-platform manifest plus its
    /// config, following an index to the entry for `platform`.
    ///
    /// When the registry serves a single manifest and `platform` is given,
    /// the config's platform has to match it.
    pub async fn resolve_image(&self, platform: Option<&Platform>) -> Result<ImageResolution> {
        let mut reference = self.image.reference.as_str().to_string();
        let mut from_index = false;

        for _ in 0..MAX_INDEX_DEPTH {
            let body = self.fetch_manifest(&reference).await?;
            match manifest::resolve(&body, platform)? {
                Resolution::Manifest(manifest) => {
                    info!(kind = %manifest.kind, layers = manifest.layers.len(), "resolved manifest");
                    let config = self.fetch_config(&manifest.config).await?;
                    if let (Some(requested), false) = (platform, from_index) {
                        verify_platform(&config, requested)?;
                    }
                    return Ok(ImageResolution::Resolved(ResolvedImage { manifest, config }));
                }
                Resolution::Select(desc) => {
                    info!(
                        digest = %desc.digest,
                        platform = %desc.effective_platform(),
                        "selected manifest from index",
                    );
                    reference = desc.digest;
                    from_index = true;
                }
                Resolution::Platforms(list) => return Ok(ImageResolution::PlatformChoice(list)),
            }
        }

        Err(OciError::Manifest(format!(
            "index nesting deeper than {} levels",
            MAX_INDEX_DEPTH
        )))
    }

    // -- internals ----------------------------------------------------------

    /// GET against the registry with auth headers. A `401` carrying a fresh
    /// bearer challenge is retried once with a token for that challenge.
    async fn get(&self, url: &str, accept: &[&str], timeout: Option<Duration>) -> Result<Response> {
        let mut retried_auth = false;
        loop {
            let headers = self
                .auth
                .auth_headers(accept, &self.image.repository)
                .await;
            let mut req = self.client.get(url).headers(headers);
            if let Some(t) = timeout {
                req = req.timeout(t);
            }
            let resp = req.send().await?;

            if resp.status() == StatusCode::UNAUTHORIZED && !retried_auth {
                let challenge = resp
                    .headers()
                    .get(WWW_AUTHENTICATE)
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or("")
                    .to_string();
                if self.auth.adopt_challenge(&challenge).await {
                    debug!(url, "retrying with token from registry challenge");
                    retried_auth = true;
                    continue;
                }
            }

            return check_status(url, resp, self.auth.has_credentials());
        }
    }
}

/// Map a response to the error taxonomy; `200` passes through.
fn check_status(url: &str, resp: Response, has_credentials: bool) -> Result<Response> {
    let status = resp.status();
    match status {
        StatusCode::OK => Ok(resp),
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            let hint = if has_credentials {
                String::new()
            } else {
                "; this image may require credentials (--username/--password)".to_string()
            };
            Err(OciError::Auth {
                url: url.to_string(),
                status,
                hint,
            })
        }
        StatusCode::NOT_FOUND => Err(OciError::NotFound(url.to_string())),
        _ => Err(OciError::Status {
            url: url.to_string(),
            status,
        }),
    }
}

fn verify_platform(config: &ConfigBlob, requested: &Platform) -> Result<()> {
    let actual = config.platform()?;
    if actual.matches(requested) {
        info!(platform = %requested, "platform verified");
        Ok(())
    } else {
        Err(OciError::PlatformMismatch {
            requested: requested.to_string(),
            actual: actual.to_string(),
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
