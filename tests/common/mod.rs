//! In-process fake registry for pull tests.

#![allow(dead_code)]

use std::io::Write;
use std::time::Duration;

use docker_pull::oci::digest::sha256_digest;
use flate2::write::GzEncoder;
use httpmock::prelude::*;
use httpmock::Mock;
use serde_json::{json, Value};

pub const DOCKER_MANIFEST: &str = "application/vnd.docker.distribution.manifest.v2+json";
pub const DOCKER_LAYER: &str = "application/vnd.docker.image.rootfs.diff.tar.gzip";
pub const OCI_INDEX: &str = "application/vnd.oci.image.index.v1+json";

pub fn gzip(data: &[u8]) -> Vec<u8> {
    let mut enc = GzEncoder::new(Vec::new(), flate2::Compression::default());
    enc.write_all(data).unwrap();
    enc.finish().unwrap()
}

/// A layer as served by the registry.
#[derive(Debug, Clone)]
pub struct TestLayer {
    pub digest: String,
    pub compressed: Vec<u8>,
    pub uncompressed: Vec<u8>,
}

impl TestLayer {
    pub fn new(content: &str) -> Self {
        let uncompressed = content.as_bytes().to_vec();
        let compressed = gzip(&uncompressed);
        Self {
            digest: sha256_digest(&compressed),
            compressed,
            uncompressed,
        }
    }

    pub fn descriptor(&self) -> Value {
        json!({
            "mediaType": DOCKER_LAYER,
            "digest": self.digest,
            "size": self.compressed.len(),
        })
    }
}

pub fn config_for(arch: &str) -> Vec<u8> {
    serde_json::to_vec(&json!({
        "architecture": arch,
        "os": "linux",
        "config": {"Cmd": ["/bin/sh"]},
        "history": [{"created_by": "test"}],
        "rootfs": {"type": "layers", "diff_ids": []},
    }))
    .unwrap()
}

pub fn manifest_for(config: &[u8], layers: &[TestLayer]) -> Vec<u8> {
    serde_json::to_vec(&json!({
        "schemaVersion": 2,
        "mediaType": DOCKER_MANIFEST,
        "config": {
            "mediaType": "application/vnd.docker.container.image.v1+json",
            "digest": sha256_digest(config),
            "size": config.len(),
        },
        "layers": layers.iter().map(TestLayer::descriptor).collect::<Vec<_>>(),
    }))
    .unwrap()
}

pub const TOKEN_SERVICE: &str = "fake-registry";

pub struct FakeRegistry {
    pub server: MockServer,
    pub repository: String,
    /// `Authorization` value manifest and blob mocks require, if any.
    pub authorization: Option<String>,
}

impl FakeRegistry {
    pub async fn start(repository: &str) -> Self {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/v2/");
                then.status(200);
            })
            .await;
        Self {
            server,
            repository: repository.to_string(),
            authorization: None,
        }
    }

    /// A registry whose `/v2/` answers `401` with a bearer challenge pointing
    /// at `/token` on the same server. Manifest and blob mocks registered
    /// afterwards demand `Bearer <token>` when `token` is given.
    pub async fn start_bearer(repository: &str, token: Option<&str>) -> Self {
        let server = MockServer::start_async().await;
        let challenge = format!(
            r#"Bearer realm="{}/token",service="{}""#,
            server.base_url(),
            TOKEN_SERVICE
        );
        server
            .mock_async(|when, then| {
                when.method(GET).path("/v2/");
                then.status(401).header("WWW-Authenticate", challenge);
            })
            .await;
        Self {
            server,
            repository: repository.to_string(),
            authorization: token.map(|t| format!("Bearer {}", t)),
        }
    }

    /// Token endpoint answering only the exact pull scope for this repository.
    pub async fn token_endpoint(&self, status: u16, token: &str) -> Mock<'_> {
        let scope = format!("repository:{}:pull", self.repository);
        let body = json!({ "token": token, "expires_in": 300 }).to_string();
        self.server
            .mock_async(|when, then| {
                when.method(GET)
                    .path("/token")
                    .query_param("service", TOKEN_SERVICE)
                    .query_param("scope", scope);
                then.status(status)
                    .header("content-type", "application/json")
                    .body(body);
            })
            .await
    }

    async fn get_mock(&self, path: String, body: Vec<u8>, delay: Option<Duration>) -> Mock<'_> {
        let authorization = self.authorization.clone();
        self.server
            .mock_async(|when, then| {
                let when = when.method(GET).path(path);
                if let Some(value) = authorization {
                    when.header("authorization", value);
                }
                let then = then.status(200).body(body);
                if let Some(d) = delay {
                    then.delay(d);
                }
            })
            .await
    }

    /// `127.0.0.1:<port>/<repository>:<tag>`
    pub fn reference(&self, tag: &str) -> String {
        format!("{}/{}:{}", self.server.address(), self.repository, tag)
    }

    pub async fn manifest(&self, reference: &str, body: Vec<u8>) -> Mock<'_> {
        let path = format!("/v2/{}/manifests/{}", self.repository, reference);
        self.get_mock(path, body, None).await
    }

    pub async fn blob(&self, digest: &str, body: Vec<u8>) -> Mock<'_> {
        let path = format!("/v2/{}/blobs/{}", self.repository, digest);
        self.get_mock(path, body, None).await
    }

    pub async fn slow_blob(&self, digest: &str, body: Vec<u8>, delay: Duration) -> Mock<'_> {
        let path = format!("/v2/{}/blobs/{}", self.repository, digest);
        self.get_mock(path, body, Some(delay)).await
    }

    pub async fn status(&self, path: &str, status: u16) -> Mock<'_> {
        let path = path.to_string();
        self.server
            .mock_async(|when, then| {
                when.method(GET).path(path);
                then.status(status);
            })
            .await
    }

    /// Serve a single-platform image under `tag`; returns the layer mocks.
    pub async fn image(&self, tag: &str, config: &[u8], layers: &[TestLayer]) -> Vec<Mock<'_>> {
        self.manifest(tag, manifest_for(config, layers)).await;
        self.blob(&sha256_digest(config), config.to_vec()).await;
        let mut mocks = Vec::new();
        for layer in layers {
            mocks.push(self.blob(&layer.digest, layer.compressed.clone()).await);
        }
        mocks
    }
}
