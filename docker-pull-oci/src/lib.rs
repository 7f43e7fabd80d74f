//! Registry-side building blocks for pulling container images: reference
//! parsing, authentication, manifest resolution, layer decoding and the
//! content-addressed layer cache.

pub mod auth;
pub mod cache;
pub mod digest;
pub mod error;
pub mod layer;
pub mod manifest;
pub mod registry;

pub use auth::{Credentials, RegistryAuthenticator};
pub use cache::{BlobCache, CacheEntry};
pub use error::{OciError, Result};
pub use layer::{decompress_file, Compression, LayerDescriptor};
pub use manifest::{ConfigBlob, ConfigSource, Descriptor, Manifest, ManifestKind, Platform};
pub use registry::{
    ClientOptions, ImageRef, ImageResolution, Reference, RegistryClient, ResolvedImage,
};
