//! End-to-end pulls against an in-process fake registry.
//!
//! ```bash
//! cargo test --test pull_integration
//! ```

mod common;

use std::collections::BTreeMap;
use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::time::Duration;

use common::*;
use docker_pull::oci::digest::{sha256_digest, sha256_hex};
use docker_pull::oci::OciError;
use docker_pull::{
    chain_ids, import_tar, ArchiveManifestEntry, Error, PullOptions, PullReport, Puller,
    RetryPolicy,
};
use httpmock::prelude::*;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

fn options(root: &Path) -> PullOptions {
    PullOptions {
        cache_dir: root.join("cache"),
        output_dir: root.join("out"),
        retry: RetryPolicy {
            initial_delay: Duration::from_millis(5),
            max_delay: Duration::from_millis(20),
            ..RetryPolicy::default()
        },
        request_timeout: Duration::from_secs(10),
        ..PullOptions::default()
    }
}

async fn pull(reference: &str, options: PullOptions) -> docker_pull::Result<PullReport> {
    Puller::new(options, CancellationToken::new())
        .pull(reference)
        .await
}

fn archive_entries(path: &Path) -> BTreeMap<String, Vec<u8>> {
    let mut archive = tar::Archive::new(File::open(path).unwrap());
    let mut out = BTreeMap::new();
    for entry in archive.entries().unwrap() {
        let mut entry = entry.unwrap();
        if entry.header().entry_type().is_dir() {
            continue;
        }
        let name = entry.path().unwrap().to_string_lossy().into_owned();
        let mut body = Vec::new();
        entry.read_to_end(&mut body).unwrap();
        out.insert(name, body);
    }
    out
}

fn archive_manifest(entries: &BTreeMap<String, Vec<u8>>) -> ArchiveManifestEntry {
    let mut list: Vec<ArchiveManifestEntry> =
        serde_json::from_slice(&entries["manifest.json"]).unwrap();
    assert_eq!(list.len(), 1);
    list.remove(0)
}

fn three_layers() -> Vec<TestLayer> {
    vec![
        TestLayer::new("bottom layer"),
        TestLayer::new("middle layer"),
        TestLayer::new("top layer"),
    ]
}

// ---------------------------------------------------------------------------
// Archive layout
// ---------------------------------------------------------------------------

#[tokio::test]
async fn archive_layers_follow_manifest_order_and_chain_ids() {
    let registry = FakeRegistry::start("library/busybox").await;
    let layers = three_layers();
    let config = config_for("amd64");
    registry.image("latest", &config, &layers).await;

    let tmp = tempfile::tempdir().unwrap();
    let report = pull(&registry.reference("latest"), options(tmp.path()))
        .await
        .unwrap();

    assert_eq!(report.archive, tmp.path().join("out/library_busybox.tar"));
    let digests: Vec<&str> = layers.iter().map(|l| l.digest.as_str()).collect();
    let ids = chain_ids(&digests);
    assert_eq!(report.chain_ids, ids);

    let entries = archive_entries(&report.archive);
    let manifest = archive_manifest(&entries);
    let expected: Vec<String> = ids.iter().map(|id| format!("{}/layer.tar", id)).collect();
    assert_eq!(manifest.layers, expected);
    assert_eq!(manifest.config, format!("{}.json", sha256_hex(&config)));
    assert_eq!(manifest.repo_tags, vec![registry.reference("latest")]);
    assert_eq!(entries[&manifest.config], config);

    for (id, layer) in ids.iter().zip(&layers) {
        assert_eq!(entries[&format!("{}/layer.tar", id)], layer.uncompressed);
        assert_eq!(entries[&format!("{}/VERSION", id)], b"1.0");
    }

    let repositories: Value = serde_json::from_slice(&entries["repositories"]).unwrap();
    let name = format!("{}/library/busybox", registry.server.address());
    assert_eq!(repositories, json!({ (name): { "latest": ids[2].clone() } }));

    let top: Value = serde_json::from_slice(&entries[&format!("{}/json", ids[2])]).unwrap();
    assert_eq!(top["parent"], ids[1].as_str());
    assert_eq!(top["architecture"], "amd64");
    assert!(top.get("history").is_none());

    // Working directory is gone once the archive exists.
    let leftovers: Vec<_> = std::fs::read_dir(tmp.path().join("out"))
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    assert_eq!(leftovers, vec!["library_busybox.tar"]);
}

#[tokio::test]
async fn pool_size_does_not_change_the_archive() {
    let registry = FakeRegistry::start("team/app").await;
    let layers: Vec<TestLayer> = (0..6)
        .map(|i| TestLayer::new(&format!("layer number {}", i).repeat(200)))
        .collect();
    registry.image("v1", &config_for("amd64"), &layers).await;

    let tmp = tempfile::tempdir().unwrap();
    let mut archives = Vec::new();
    for (pool, dir) in [(1, "serial"), (8, "parallel")] {
        let opts = PullOptions {
            max_concurrent_downloads: pool,
            use_cache: false,
            ..options(&tmp.path().join(dir))
        };
        let report = pull(&registry.reference("v1"), opts).await.unwrap();
        archives.push(std::fs::read(&report.archive).unwrap());
    }
    assert_eq!(archives[0], archives[1]);
}

// ---------------------------------------------------------------------------
// Cache
// ---------------------------------------------------------------------------

#[tokio::test]
async fn second_pull_is_served_from_cache() {
    let registry = FakeRegistry::start("library/alpine").await;
    let layers = three_layers();
    let blob_mocks = registry.image("3.20", &config_for("amd64"), &layers).await;

    let tmp = tempfile::tempdir().unwrap();
    let first = pull(&registry.reference("3.20"), options(tmp.path()))
        .await
        .unwrap();
    assert_eq!(first.stats.cache_misses, 3);
    assert_eq!(first.stats.cache_stored, 3);
    let first_entries = archive_entries(&first.archive);

    // Layer blobs are no longer served; only the cache can satisfy them.
    for mock in blob_mocks {
        mock.delete_async().await;
    }

    let second = pull(&registry.reference("3.20"), options(tmp.path()))
        .await
        .unwrap();
    assert_eq!(second.stats.cache_hits, 3);
    assert_eq!(second.stats.cache_misses, 0);
    assert_eq!(second.stats.bytes_downloaded, 0);

    let second_entries = archive_entries(&second.archive);
    for id in &second.chain_ids {
        let name = format!("{}/layer.tar", id);
        assert_eq!(first_entries[&name], second_entries[&name]);
    }

    for layer in &layers {
        let entry = tmp
            .path()
            .join("cache/layers")
            .join(layer.digest.replace(':', "_"));
        assert_eq!(std::fs::read(entry.join("layer.tar")).unwrap(), layer.uncompressed);
        let meta: Value =
            serde_json::from_slice(&std::fs::read(entry.join("metadata.json")).unwrap()).unwrap();
        assert_eq!(meta["digest"], layer.digest.as_str());
    }
}

#[tokio::test]
async fn no_cache_leaves_cache_dir_untouched() {
    let registry = FakeRegistry::start("library/alpine").await;
    registry
        .image("latest", &config_for("amd64"), &three_layers())
        .await;

    let tmp = tempfile::tempdir().unwrap();
    let opts = PullOptions {
        use_cache: false,
        ..options(tmp.path())
    };
    let report = pull(&registry.reference("latest"), opts).await.unwrap();
    assert_eq!(report.stats.cache_hits + report.stats.cache_stored, 0);
    assert!(!tmp.path().join("cache").exists());
}

#[tokio::test]
async fn imported_archive_layers_land_in_cache() {
    let registry = FakeRegistry::start("library/busybox").await;
    let layers = three_layers();
    registry.image("latest", &config_for("amd64"), &layers).await;

    let tmp = tempfile::tempdir().unwrap();
    let opts = PullOptions {
        use_cache: false,
        ..options(tmp.path())
    };
    let report = pull(&registry.reference("latest"), opts).await.unwrap();

    let cache = docker_pull::oci::BlobCache::new(tmp.path().join("imported"));
    let imported = import_tar(&report.archive, &cache).await.unwrap();
    assert_eq!(imported.imported, 3);
    assert_eq!(imported.skipped, 0);
    for layer in &layers {
        assert!(cache.lookup(&sha256_digest(&layer.uncompressed)).is_some());
    }

    let again = import_tar(&report.archive, &cache).await.unwrap();
    assert_eq!(again.imported, 0);
    assert_eq!(again.skipped, 3);
}

// ---------------------------------------------------------------------------
// Platform selection
// ---------------------------------------------------------------------------

async fn multi_platform(registry: &FakeRegistry) -> (Vec<u8>, Vec<TestLayer>) {
    let amd_manifest = manifest_for(&config_for("amd64"), &[TestLayer::new("amd64 layer")]);
    let arm_layers = vec![TestLayer::new("arm64 layer")];
    let arm_config = config_for("arm64");
    let arm_manifest = manifest_for(&arm_config, &arm_layers);

    let index = serde_json::to_vec(&json!({
        "schemaVersion": 2,
        "mediaType": OCI_INDEX,
        "manifests": [
            {"mediaType": DOCKER_MANIFEST, "digest": sha256_digest(&amd_manifest),
             "size": amd_manifest.len(), "platform": {"os": "linux", "architecture": "amd64"}},
            {"mediaType": DOCKER_MANIFEST, "digest": sha256_digest(&arm_manifest),
             "size": arm_manifest.len(), "platform": {"os": "linux", "architecture": "arm64"}},
            {"mediaType": DOCKER_MANIFEST, "digest": sha256_digest(b"attestation"),
             "size": 1, "platform": {"os": "unknown", "architecture": "unknown"},
             "annotations": {"vnd.docker.reference.type": "attestation-manifest"}}
        ]
    }))
    .unwrap();

    registry.manifest("latest", index).await;
    // Only the arm64 manifest is reachable by digest.
    registry
        .manifest(&sha256_digest(&arm_manifest), arm_manifest.clone())
        .await;
    registry
        .blob(&sha256_digest(&arm_config), arm_config.clone())
        .await;
    for layer in &arm_layers {
        registry.blob(&layer.digest, layer.compressed.clone()).await;
    }
    (arm_config, arm_layers)
}

#[tokio::test]
async fn requested_platform_selects_its_manifest() {
    let registry = FakeRegistry::start("library/multi").await;
    let (arm_config, arm_layers) = multi_platform(&registry).await;

    let tmp = tempfile::tempdir().unwrap();
    let opts = PullOptions {
        platform: Some("linux/arm64".parse().unwrap()),
        ..options(tmp.path())
    };
    let report = pull(&registry.reference("latest"), opts).await.unwrap();
    assert_eq!(report.config_digest, sha256_digest(&arm_config));
    assert_eq!(report.chain_ids, chain_ids(&[arm_layers[0].digest.as_str()]));
}

#[tokio::test]
async fn absent_platform_reports_available_list() {
    let registry = FakeRegistry::start("library/multi").await;
    multi_platform(&registry).await;

    let tmp = tempfile::tempdir().unwrap();
    let opts = PullOptions {
        platform: Some("linux/arm/v7".parse().unwrap()),
        ..options(tmp.path())
    };
    let err = pull(&registry.reference("latest"), opts).await.unwrap_err();
    match err {
        Error::Oci(OciError::PlatformNotFound { requested, available }) => {
            assert_eq!(requested, "linux/arm/v7");
            assert_eq!(available, vec!["linux/amd64", "linux/arm64"]);
        }
        other => panic!("unexpected error: {other}"),
    }
    assert!(!tmp.path().join("out").join("tmp_multi_latest").exists());
}

#[tokio::test]
async fn multi_platform_without_request_lists_choices() {
    let registry = FakeRegistry::start("library/multi").await;
    multi_platform(&registry).await;

    let tmp = tempfile::tempdir().unwrap();
    let err = pull(&registry.reference("latest"), options(tmp.path()))
        .await
        .unwrap_err();
    match err {
        Error::PlatformRequired { available } => {
            let platforms: Vec<String> = available
                .iter()
                .map(|d| d.effective_platform().to_string())
                .collect();
            assert_eq!(platforms, vec!["linux/amd64", "linux/arm64"]);
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn single_manifest_platform_is_verified() {
    let registry = FakeRegistry::start("library/busybox").await;
    registry
        .image("latest", &config_for("amd64"), &three_layers())
        .await;

    let tmp = tempfile::tempdir().unwrap();
    let opts = PullOptions {
        platform: Some("linux/arm64".parse().unwrap()),
        ..options(tmp.path())
    };
    let err = pull(&registry.reference("latest"), opts).await.unwrap_err();
    assert!(
        matches!(err, Error::Oci(OciError::PlatformMismatch { .. })),
        "{err}"
    );
}

// ---------------------------------------------------------------------------
// Schema 1
// ---------------------------------------------------------------------------

#[tokio::test]
async fn v1_manifest_chains_like_v2() {
    let layers = vec![TestLayer::new("first"), TestLayer::new("second")];

    let v2 = FakeRegistry::start("library/legacy").await;
    v2.image("v2", &config_for("amd64"), &layers).await;

    let v1 = FakeRegistry::start("library/legacy").await;
    let v1_manifest = serde_json::to_vec(&json!({
        "schemaVersion": 1,
        "name": "library/legacy",
        "tag": "v1",
        "architecture": "amd64",
        "fsLayers": layers.iter().map(|l| json!({"blobSum": l.digest})).collect::<Vec<_>>(),
    }))
    .unwrap();
    v1.manifest("v1", v1_manifest).await;
    for layer in &layers {
        v1.blob(&layer.digest, layer.compressed.clone()).await;
    }

    let tmp = tempfile::tempdir().unwrap();
    let from_v2 = pull(&v2.reference("v2"), options(&tmp.path().join("a")))
        .await
        .unwrap();
    let from_v1 = pull(&v1.reference("v1"), options(&tmp.path().join("b")))
        .await
        .unwrap();
    assert_eq!(from_v1.chain_ids, from_v2.chain_ids);

    let entries = archive_entries(&from_v1.archive);
    let manifest = archive_manifest(&entries);
    let config: Value = serde_json::from_slice(&entries[&manifest.config]).unwrap();
    assert_eq!(config["architecture"], "amd64");
    assert_eq!(config["rootfs"]["type"], "layers");
}

// ---------------------------------------------------------------------------
// Bearer auth
// ---------------------------------------------------------------------------

#[tokio::test]
async fn bearer_token_authorizes_manifest_and_blob_requests() {
    let registry = FakeRegistry::start_bearer("team/app", Some("s3cr3t")).await;
    let token = registry.token_endpoint(200, "s3cr3t").await;
    let layers = three_layers();
    let config = config_for("amd64");
    registry.image("v1", &config, &layers).await;

    let tmp = tempfile::tempdir().unwrap();
    let report = pull(&registry.reference("v1"), options(tmp.path()))
        .await
        .unwrap();

    // One token serves the manifest, the config and every layer.
    token.assert_hits_async(1).await;
    let entries = archive_entries(&report.archive);
    let top = format!("{}/layer.tar", report.chain_ids[2]);
    assert_eq!(entries[&top], layers[2].uncompressed);
}

#[tokio::test]
async fn failed_token_request_continues_anonymously() {
    let registry = FakeRegistry::start_bearer("team/app", None).await;
    let token = registry.token_endpoint(500, "unused").await;
    let layers = vec![TestLayer::new("public layer")];
    let config = config_for("amd64");
    registry.image("v1", &config, &layers).await;

    let tmp = tempfile::tempdir().unwrap();
    let report = pull(&registry.reference("v1"), options(tmp.path()))
        .await
        .unwrap();

    assert!(token.hits_async().await >= 1);
    assert_eq!(report.stats.layers, 1);
    assert!(report.archive.is_file());
}

// ---------------------------------------------------------------------------
// Failures
// ---------------------------------------------------------------------------

#[tokio::test]
async fn path_like_layer_digest_is_rejected_before_cache_lookup() {
    let registry = FakeRegistry::start("library/busybox").await;
    let tmp = tempfile::tempdir().unwrap();
    let outside = tmp.path().join("outside");
    std::fs::create_dir_all(&outside).unwrap();
    std::fs::write(outside.join("layer.tar"), b"local file").unwrap();

    let config = config_for("amd64");
    let manifest = serde_json::to_vec(&json!({
        "schemaVersion": 2,
        "mediaType": DOCKER_MANIFEST,
        "config": {"mediaType": "application/vnd.docker.container.image.v1+json",
                   "digest": sha256_digest(&config), "size": config.len()},
        "layers": [{"mediaType": DOCKER_LAYER,
                    "digest": outside.to_string_lossy(), "size": 10}],
    }))
    .unwrap();
    registry.manifest("latest", manifest).await;
    registry.blob(&sha256_digest(&config), config).await;

    let err = pull(&registry.reference("latest"), options(tmp.path()))
        .await
        .unwrap_err();
    match &err {
        Error::Oci(OciError::Manifest(msg)) => assert!(msg.contains("invalid digest"), "{msg}"),
        other => panic!("unexpected error: {other}"),
    }
    assert!(!tmp.path().join("out/library_busybox.tar").exists());
}

#[tokio::test]
async fn stalled_blob_times_out_and_is_retried() {
    let registry = FakeRegistry::start("library/busybox").await;
    let layer = TestLayer::new("never arrives");
    let config = config_for("amd64");
    registry
        .manifest("latest", manifest_for(&config, &[layer.clone()]))
        .await;
    registry.blob(&sha256_digest(&config), config.clone()).await;
    registry
        .slow_blob(&layer.digest, layer.compressed.clone(), Duration::from_secs(60))
        .await;

    let tmp = tempfile::tempdir().unwrap();
    let mut opts = options(tmp.path());
    opts.request_timeout = Duration::from_millis(500);
    opts.retry.max_attempts = 2;

    let err = tokio::time::timeout(
        Duration::from_secs(20),
        pull(&registry.reference("latest"), opts),
    )
    .await
    .expect("a stalled download must time out")
    .unwrap_err();
    match &err {
        Error::LayerFailed { index, source, .. } => {
            assert_eq!(*index, 0);
            assert!(source.is_transient(), "{source}");
        }
        other => panic!("unexpected error: {other}"),
    }
    assert!(!tmp.path().join("out/tmp_busybox_latest").exists());
}

#[tokio::test]
async fn unauthorized_manifest_hints_at_credentials() {
    let registry = FakeRegistry::start("private/app").await;
    registry
        .status("/v2/private/app/manifests/latest", 401)
        .await;

    let tmp = tempfile::tempdir().unwrap();
    let err = pull(&registry.reference("latest"), options(tmp.path()))
        .await
        .unwrap_err();
    match &err {
        Error::Oci(OciError::Auth { hint, .. }) => assert!(hint.contains("--username")),
        other => panic!("unexpected error: {other}"),
    }
    assert!(!err.is_transient());
}

#[tokio::test]
async fn corrupt_blob_fails_after_retries() {
    let registry = FakeRegistry::start("library/busybox").await;
    let good = TestLayer::new("good");
    let bad = TestLayer::new("expected");
    let config = config_for("amd64");
    registry
        .manifest("latest", manifest_for(&config, &[good.clone(), bad.clone()]))
        .await;
    registry.blob(&sha256_digest(&config), config.clone()).await;
    registry.blob(&good.digest, good.compressed.clone()).await;
    registry.blob(&bad.digest, gzip(b"tampered")).await;

    let tmp = tempfile::tempdir().unwrap();
    let err = pull(&registry.reference("latest"), options(tmp.path()))
        .await
        .unwrap_err();
    match &err {
        Error::LayerFailed { index, source, .. } => {
            assert_eq!(*index, 1);
            assert!(matches!(**source, Error::Oci(OciError::DigestMismatch { .. })));
        }
        other => panic!("unexpected error: {other}"),
    }
    assert!(!tmp.path().join("out/tmp_busybox_latest").exists());
    assert!(!tmp.path().join("out/library_busybox.tar").exists());
    assert!(!tmp
        .path()
        .join("cache/layers")
        .join(bad.digest.replace(':', "_"))
        .exists());
}

#[tokio::test]
async fn alternate_url_serves_foreign_layer() {
    let registry = FakeRegistry::start("library/win").await;
    let foreign = TestLayer::new("foreign layer");
    let config = config_for("amd64");
    let alt = format!("http://{}/foreign/blob", registry.server.address());
    let manifest = serde_json::to_vec(&json!({
        "schemaVersion": 2,
        "mediaType": DOCKER_MANIFEST,
        "config": {"mediaType": "application/vnd.docker.container.image.v1+json",
                   "digest": sha256_digest(&config), "size": config.len()},
        "layers": [{"mediaType": "application/vnd.docker.image.rootfs.foreign.diff.tar.gzip",
                    "digest": foreign.digest, "size": foreign.compressed.len(),
                    "urls": [alt]}],
    }))
    .unwrap();
    registry.manifest("latest", manifest).await;
    registry.blob(&sha256_digest(&config), config).await;
    registry
        .status(&format!("/v2/library/win/blobs/{}", foreign.digest), 404)
        .await;
    registry
        .server
        .mock_async(|when, then| {
            when.method(GET).path("/foreign/blob");
            then.status(200).body(foreign.compressed.clone());
        })
        .await;

    let tmp = tempfile::tempdir().unwrap();
    let report = pull(&registry.reference("latest"), options(tmp.path()))
        .await
        .unwrap();
    let entries = archive_entries(&report.archive);
    let name = format!("{}/layer.tar", report.chain_ids[0]);
    assert_eq!(entries[&name], foreign.uncompressed);
}

#[tokio::test]
async fn cancellation_removes_working_directory() {
    let registry = FakeRegistry::start("library/busybox").await;
    let fast = TestLayer::new("fast");
    let slow = TestLayer::new("slow");
    let config = config_for("amd64");
    registry
        .manifest("latest", manifest_for(&config, &[fast.clone(), slow.clone()]))
        .await;
    registry.blob(&sha256_digest(&config), config.clone()).await;
    registry.blob(&fast.digest, fast.compressed.clone()).await;
    registry
        .slow_blob(&slow.digest, slow.compressed.clone(), Duration::from_secs(10))
        .await;

    let tmp = tempfile::tempdir().unwrap();
    let token = CancellationToken::new();
    let puller = Puller::new(options(tmp.path()), token.clone());

    let canceller = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(500)).await;
        token.cancel();
    });
    let err = puller
        .pull(&registry.reference("latest"))
        .await
        .unwrap_err();
    canceller.await.unwrap();

    assert!(err.is_cancelled(), "{err}");
    assert!(!tmp.path().join("out/tmp_busybox_latest").exists());
    assert!(!tmp.path().join("out/library_busybox.tar").exists());

    let layers_dir = tmp.path().join("cache/layers");
    assert!(!layers_dir.join(slow.digest.replace(':', "_")).exists());
    if layers_dir.exists() {
        let partial = std::fs::read_dir(&layers_dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .any(|n| n.ends_with(".partial"));
        assert!(!partial);
    }
}
