use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::digest::{sha256_digest, validate};
use crate::layer::LayerDescriptor;
use crate::{OciError, Result};

// ---------------------------------------------------------------------------
// Media type constants
// ---------------------------------------------------------------------------

pub const MEDIA_TYPE_OCI_INDEX: &str = "application/vnd.oci.image.index.v1+json";
pub const MEDIA_TYPE_OCI_MANIFEST: &str = "application/vnd.oci.image.manifest.v1+json";
pub const MEDIA_TYPE_DOCKER_MANIFEST_LIST: &str =
    "application/vnd.docker.distribution.manifest.list.v2+json";
pub const MEDIA_TYPE_DOCKER_MANIFEST: &str = "application/vnd.docker.distribution.manifest.v2+json";
pub const MEDIA_TYPE_DOCKER_MANIFEST_V1: &str =
    "application/vnd.docker.distribution.manifest.v1+json";
pub const MEDIA_TYPE_DOCKER_MANIFEST_V1_SIGNED: &str =
    "application/vnd.docker.distribution.manifest.v1+prettyjws";

/// `Accept` values for manifest requests, in preference order.
pub const MANIFEST_ACCEPT_TYPES: [&str; 5] = [
    MEDIA_TYPE_OCI_INDEX,
    MEDIA_TYPE_OCI_MANIFEST,
    MEDIA_TYPE_DOCKER_MANIFEST_LIST,
    MEDIA_TYPE_DOCKER_MANIFEST,
    MEDIA_TYPE_DOCKER_MANIFEST_V1,
];

/// Annotation docker buildx puts on attestation entries inside an index.
const ANNOTATION_REFERENCE_TYPE: &str = "vnd.docker.reference.type";
const ATTESTATION_MANIFEST: &str = "attestation-manifest";

/// Returns `true` when `media_type` is an image index / manifest list.
pub fn is_index_media_type(media_type: &str) -> bool {
    media_type == MEDIA_TYPE_OCI_INDEX || media_type == MEDIA_TYPE_DOCKER_MANIFEST_LIST
}

/// Returns `true` when `media_type` is a single image manifest.
pub fn is_manifest_media_type(media_type: &str) -> bool {
    media_type == MEDIA_TYPE_OCI_MANIFEST || media_type == MEDIA_TYPE_DOCKER_MANIFEST
}

// ---------------------------------------------------------------------------
// Descriptor
// ---------------------------------------------------------------------------

/// A content-addressable descriptor used in both manifests and image indexes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Descriptor {
    #[serde(rename = "mediaType", default)]
    pub media_type: String,

    pub digest: String,

    #[serde(default)]
    pub size: u64,

    /// Alternate locations for foreign layers.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub urls: Vec<String>,

    #[serde(default)]
    pub platform: Option<Platform>,

    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub annotations: HashMap<String, String>,
}

impl Descriptor {
    /// The entry's platform with the legacy defaults (`linux`, `amd64`)
    /// filled in for missing fields.
    pub fn effective_platform(&self) -> Platform {
        self.platform.clone().unwrap_or_default()
    }

    /// Attestation and other non-image entries that indices carry next to
    /// the real per-platform manifests.
    pub fn is_attestation(&self) -> bool {
        if self
            .annotations
            .get(ANNOTATION_REFERENCE_TYPE)
            .is_some_and(|t| t == ATTESTATION_MANIFEST)
        {
            return true;
        }
        matches!(
            &self.platform,
            Some(p) if p.os == "unknown" && p.architecture == "unknown"
        )
    }
}

// ---------------------------------------------------------------------------
// Platform
// ---------------------------------------------------------------------------

/// Target platform: `os/architecture[/variant]`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Platform {
    #[serde(default = "default_architecture")]
    pub architecture: String,
    #[serde(default = "default_os")]
    pub os: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variant: Option<String>,
}

fn default_os() -> String {
    "linux".to_string()
}

fn default_architecture() -> String {
    "amd64".to_string()
}

impl Default for Platform {
    fn default() -> Self {
        Self {
            architecture: default_architecture(),
            os: default_os(),
            variant: None,
        }
    }
}

impl Platform {
    /// Same os and architecture, ignoring the variant.
    fn same_os_arch(&self, other: &Platform) -> bool {
        self.os == other.os && self.architecture == other.architecture
    }

    /// Whether an image built for `self` satisfies a request for `requested`.
    /// A request without a variant accepts any variant.
    pub fn matches(&self, requested: &Platform) -> bool {
        self.same_os_arch(requested)
            && match requested.variant.as_deref().filter(|v| !v.is_empty()) {
                None => true,
                Some(v) => self.variant.as_deref() == Some(v),
            }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.os, self.architecture)?;
        if let Some(v) = self.variant.as_deref().filter(|v| !v.is_empty()) {
            write!(f, "/{}", v)?;
        }
        Ok(())
    }
}

impl FromStr for Platform {
    type Err = OciError;

    fn from_str(s: &str) -> Result<Self> {
        let parts: Vec<&str> = s.trim().split('/').collect();
        let bad = || {
            OciError::Manifest(format!(
                "invalid platform '{}': expected os/arch[/variant]",
                s
            ))
        };
        match parts.as_slice() {
            [os, arch] if !os.is_empty() && !arch.is_empty() => Ok(Self {
                os: os.to_string(),
                architecture: arch.to_string(),
                variant: None,
            }),
            [os, arch, variant] if !os.is_empty() && !arch.is_empty() && !variant.is_empty() => {
                Ok(Self {
                    os: os.to_string(),
                    architecture: arch.to_string(),
                    variant: Some(variant.to_string()),
                })
            }
            _ => Err(bad()),
        }
    }
}

// ---------------------------------------------------------------------------
// Wire documents
// ---------------------------------------------------------------------------

/// A schema 2 image manifest, Docker (`...manifest.v2+json`) or OCI
/// (`...image.manifest.v1+json`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageManifest {
    #[serde(rename = "schemaVersion")]
    pub schema_version: u32,

    #[serde(rename = "mediaType", default)]
    pub media_type: String,

    pub config: Descriptor,

    pub layers: Vec<Descriptor>,
}

/// An OCI image index or Docker manifest list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageIndex {
    #[serde(rename = "schemaVersion")]
    pub schema_version: u32,

    #[serde(rename = "mediaType", default)]
    pub media_type: String,

    pub manifests: Vec<Descriptor>,
}

impl ImageIndex {
    /// Entries that describe runnable images (attestations removed).
    pub fn image_manifests(&self) -> Vec<&Descriptor> {
        self.manifests.iter().filter(|d| !d.is_attestation()).collect()
    }

    /// Select the entry whose platform matches `target`.
    ///
    /// An exact `os/arch[/variant]` match wins. A request without a variant
    /// also accepts a single entry with the same os and architecture, so
    /// `linux/arm64` finds an entry published as `linux/arm64/v8`.
    pub fn select_platform(&self, target: &Platform) -> Result<&Descriptor> {
        let candidates = self.image_manifests();
        let wanted = target.to_string();

        if let Some(desc) = candidates
            .iter()
            .copied()
            .find(|d| d.effective_platform().to_string() == wanted)
        {
            return Ok(desc);
        }

        if target.variant.is_none() {
            let loose: Vec<&Descriptor> = candidates
                .iter()
                .copied()
                .filter(|d| d.effective_platform().same_os_arch(target))
                .collect();
            if let [only] = loose.as_slice() {
                return Ok(*only);
            }
        }

        Err(OciError::PlatformNotFound {
            requested: wanted,
            available: candidates
                .iter()
                .map(|d| d.effective_platform().to_string())
                .collect(),
        })
    }
}

/// A legacy schema 1 manifest.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct V1Manifest {
    #[serde(rename = "schemaVersion", default)]
    pub schema_version: u32,

    #[serde(default)]
    pub name: Option<String>,

    #[serde(default)]
    pub tag: Option<String>,

    #[serde(default)]
    pub architecture: Option<String>,

    #[serde(rename = "fsLayers")]
    pub fs_layers: Vec<FsLayer>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FsLayer {
    #[serde(rename = "blobSum")]
    pub blob_sum: String,
}

// ---------------------------------------------------------------------------
// Classification
// ---------------------------------------------------------------------------

/// The schema a manifest document was written in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManifestKind {
    V1,
    V2,
    OciManifest,
    OciIndex,
}

impl fmt::Display for ManifestKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ManifestKind::V1 => "schema v1 manifest",
            ManifestKind::V2 => "schema v2 manifest",
            ManifestKind::OciManifest => "OCI manifest",
            ManifestKind::OciIndex => "multi-platform index",
        };
        f.write_str(name)
    }
}

/// A parsed manifest document, tagged by schema.
#[derive(Debug, Clone)]
pub enum RawManifest {
    V1(V1Manifest),
    V2(ImageManifest),
    Oci(ImageManifest),
    Index(ImageIndex),
}

impl RawManifest {
    /// Classify and parse a manifest response body.
    ///
    /// `manifests` marks an index, `layers` a schema 2 manifest, `fsLayers` a
    /// legacy schema 1 manifest, checked in that order.
    pub fn parse(body: &[u8]) -> Result<Self> {
        let value: serde_json::Value = serde_json::from_slice(body)
            .map_err(|e| OciError::Manifest(format!("malformed manifest JSON: {}", e)))?;
        let obj = value.as_object().ok_or_else(|| {
            OciError::Manifest("unrecognized manifest shape: not a JSON object".to_string())
        })?;
        let media_type = obj
            .get("mediaType")
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .to_string();

        let raw = if obj.contains_key("manifests") {
            if !media_type.is_empty() && !is_index_media_type(&media_type) {
                return Err(OciError::UnsupportedMediaType(media_type));
            }
            RawManifest::Index(serde_json::from_value(value)?)
        } else if obj.contains_key("layers") {
            if !media_type.is_empty() && !is_manifest_media_type(&media_type) {
                return Err(OciError::UnsupportedMediaType(media_type));
            }
            let manifest: ImageManifest = serde_json::from_value(value)?;
            // mediaType is optional in OCI manifests; fall back to the config
            // descriptor to tell the two apart.
            let oci = media_type == MEDIA_TYPE_OCI_MANIFEST
                || (media_type.is_empty()
                    && manifest.config.media_type.starts_with("application/vnd.oci."));
            if oci {
                RawManifest::Oci(manifest)
            } else {
                RawManifest::V2(manifest)
            }
        } else if obj.contains_key("fsLayers") {
            RawManifest::V1(serde_json::from_value(value)?)
        } else {
            let mut keys: Vec<&str> = obj.keys().map(String::as_str).collect();
            keys.sort_unstable();
            return Err(OciError::Manifest(format!(
                "unrecognized manifest shape: no manifests, layers or fsLayers (keys: {})",
                keys.join(", ")
            )));
        };

        raw.check_digests()?;
        Ok(raw)
    }

    /// Every digest the document names, validated before any of them is used
    /// as a URL segment or cache path.
    fn check_digests(&self) -> Result<()> {
        let digests: Vec<&str> = match self {
            RawManifest::V1(m) => m.fs_layers.iter().map(|l| l.blob_sum.as_str()).collect(),
            RawManifest::V2(m) | RawManifest::Oci(m) => std::iter::once(&m.config)
                .chain(&m.layers)
                .map(|d| d.digest.as_str())
                .collect(),
            RawManifest::Index(i) => i.manifests.iter().map(|d| d.digest.as_str()).collect(),
        };
        for digest in digests {
            validate(digest).map_err(|_| {
                OciError::Manifest(format!("invalid digest in manifest: {:?}", digest))
            })?;
        }
        Ok(())
    }

    pub fn kind(&self) -> ManifestKind {
        match self {
            RawManifest::V1(_) => ManifestKind::V1,
            RawManifest::V2(_) => ManifestKind::V2,
            RawManifest::Oci(_) => ManifestKind::OciManifest,
            RawManifest::Index(_) => ManifestKind::OciIndex,
        }
    }
}

// ---------------------------------------------------------------------------
// Normalized manifest
// ---------------------------------------------------------------------------

/// Raw image configuration bytes and the digest they are addressed by.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigBlob {
    pub digest: String,
    pub bytes: Vec<u8>,
}

impl ConfigBlob {
    /// `os/architecture[/variant]` recorded in the config, with the same
    /// defaults index entries get.
    pub fn platform(&self) -> Result<Platform> {
        Ok(serde_json::from_slice(&self.bytes)?)
    }
}

/// Where the image config comes from.
#[derive(Debug, Clone)]
pub enum ConfigSource {
    /// Fetched from the registry as a blob.
    Remote(Descriptor),
    /// Built locally for schema 1 manifests, which carry no config blob.
    Synthesized(ConfigBlob),
}

impl ConfigSource {
    pub fn digest(&self) -> &str {
        match self {
            ConfigSource::Remote(d) => &d.digest,
            ConfigSource::Synthesized(c) => &c.digest,
        }
    }
}

/// A single-platform manifest in schema 2 shape, whatever schema it was
/// served in.
#[derive(Debug, Clone)]
pub struct Manifest {
    pub kind: ManifestKind,
    pub config: ConfigSource,
    /// Bottom-most layer first.
    pub layers: Vec<LayerDescriptor>,
}

impl Manifest {
    pub fn layer_digests(&self) -> Vec<String> {
        self.layers.iter().map(|l| l.digest.clone()).collect()
    }
}

/// Outcome of resolving one manifest document.
#[derive(Debug, Clone)]
pub enum Resolution {
    /// A concrete manifest, ready for layer download.
    Manifest(Manifest),
    /// An index entry was chosen; fetch it by digest and resolve again.
    Select(Descriptor),
    /// An index with several images and no platform requested.
    Platforms(Vec<Descriptor>),
}

/// Classify `body` and, for indices, pick the entry for `requested`.
pub fn resolve(body: &[u8], requested: Option<&Platform>) -> Result<Resolution> {
    let raw = RawManifest::parse(body)?;
    match raw {
        RawManifest::Index(index) => resolve_index(&index, requested),
        other => Ok(Resolution::Manifest(normalize(other)?)),
    }
}

fn resolve_index(index: &ImageIndex, requested: Option<&Platform>) -> Result<Resolution> {
    if let Some(target) = requested {
        return index.select_platform(target).cloned().map(Resolution::Select);
    }

    let candidates = index.image_manifests();
    match candidates.as_slice() {
        [] => Err(OciError::Manifest(
            "index contains no image manifests".to_string(),
        )),
        [only] => Ok(Resolution::Select((*only).clone())),
        many => Ok(Resolution::Platforms(
            many.iter().map(|d| (*d).clone()).collect(),
        )),
    }
}

/// Convert a concrete manifest into the schema 2 shape.
pub fn normalize(raw: RawManifest) -> Result<Manifest> {
    let kind = raw.kind();
    match raw {
        RawManifest::V2(m) | RawManifest::Oci(m) => Ok(Manifest {
            kind,
            layers: m.layers.iter().map(LayerDescriptor::from).collect(),
            config: ConfigSource::Remote(m.config),
        }),
        RawManifest::V1(m) => {
            let config = synthesize_v1_config(&m)?;
            Ok(Manifest {
                kind,
                layers: m
                    .fs_layers
                    .iter()
                    .map(|l| LayerDescriptor::new(l.blob_sum.clone()))
                    .collect(),
                config: ConfigSource::Synthesized(config),
            })
        }
        RawManifest::Index(_) => Err(OciError::Manifest(
            "an index cannot be normalized; select a platform first".to_string(),
        )),
    }
}

/// The fixed minimal config used in place of a schema 1 image's missing
/// config blob.
fn synthesize_v1_config(m: &V1Manifest) -> Result<ConfigBlob> {
    let config = serde_json::json!({
        "architecture": m.architecture.as_deref().unwrap_or("amd64"),
        "config": {},
        "created": "1970-01-01T00:00:00Z",
        "history": [],
        "os": "linux",
        "rootfs": {
            "type": "layers",
            "diff_ids": [],
        },
    });
    let bytes = serde_json::to_vec(&config)?;
    Ok(ConfigBlob {
        digest: sha256_digest(&bytes),
        bytes,
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
