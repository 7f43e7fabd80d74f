//! Builds the `docker load` archive from downloaded layers.
//!
//! Layout inside the tar, in this order:
//!
//! ```text
//! repositories
//! manifest.json
//! <config hex>.json
//! <chain id>/VERSION
//! <chain id>/json
//! <chain id>/layer.tar
//! ...
//! ```
//!
//! Headers are written in deterministic mode, so the same layers and config
//! always produce a byte-identical archive.

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use docker_pull_oci::digest::digest_hex;
use docker_pull_oci::{ConfigBlob, ImageRef, Reference};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{json, Map, Value};
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::fetch::{DownloadResult, LAYER_FILE};

const VERSION_FILE: &str = "VERSION";
const LAYER_JSON_FILE: &str = "json";
const LAYER_FORMAT_VERSION: &str = "1.0";
const MANIFEST_FILE: &str = "manifest.json";
const REPOSITORIES_FILE: &str = "repositories";

/// One entry of `manifest.json`.
///
/// `docker save` writes `"RepoTags": null` for untagged images, so both lists
/// read `null` or an absent key as empty.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchiveManifestEntry {
    #[serde(rename = "Config", default)]
    pub config: String,
    #[serde(rename = "RepoTags", default, deserialize_with = "null_as_empty")]
    pub repo_tags: Vec<String>,
    #[serde(rename = "Layers", default, deserialize_with = "null_as_empty")]
    pub layers: Vec<String>,
}

fn null_as_empty<'de, D>(deserializer: D) -> std::result::Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<Vec<String>>::deserialize(deserializer)?.unwrap_or_default())
}

/// Working directory for an image: `tmp_<image>_<reference>` with `:` in the
/// reference replaced by `@`.
pub fn work_dir_name(image: &ImageRef) -> String {
    format!(
        "tmp_{}_{}",
        image.image_name(),
        image.reference.as_str().replace(':', "@")
    )
}

/// Archive file name: the repository path with `/` replaced by `_`.
pub fn archive_file_name(image: &ImageRef) -> String {
    format!("{}.tar", image.repository.replace('/', "_"))
}

/// Metadata for layers below the top one.
fn placeholder_layer_json() -> Map<String, Value> {
    let value = json!({
        "created": "1970-01-01T00:00:00Z",
        "container_config": {
            "Hostname": "",
            "Domainname": "",
            "User": "",
            "AttachStdin": false,
            "AttachStdout": false,
            "AttachStderr": false,
            "Tty": false,
            "OpenStdin": false,
            "StdinOnce": false,
            "Env": null,
            "Cmd": null,
            "Image": "",
            "Volumes": null,
            "WorkingDir": "",
            "Entrypoint": null,
            "OnBuild": null,
            "Labels": null
        }
    });
    match value {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}

/// Metadata for the top layer: the image config without `history` and
/// `rootfs`.
fn top_layer_json(config: &ConfigBlob) -> Result<Map<String, Value>> {
    let mut map: Map<String, Value> = serde_json::from_slice(&config.bytes)
        .map_err(|e| Error::Archive(format!("image config is not a JSON object: {}", e)))?;
    map.remove("history");
    if map.remove("rootfs").is_none() {
        map.remove("rootfS");
    }
    Ok(map)
}

/// Writes per-layer metadata and the top-level files into the working
/// directory, then packs it into the output archive.
pub struct ArchiveAssembler<'a> {
    image: &'a ImageRef,
    config: &'a ConfigBlob,
    workdir: PathBuf,
}

impl<'a> ArchiveAssembler<'a> {
    pub fn new(image: &'a ImageRef, config: &'a ConfigBlob, workdir: impl Into<PathBuf>) -> Self {
        Self {
            image,
            config,
            workdir: workdir.into(),
        }
    }

    fn config_file_name(&self) -> String {
        format!("{}.json", digest_hex(&self.config.digest))
    }

    fn repo_tags(&self) -> Vec<String> {
        match &self.image.reference {
            Reference::Tag(_) => vec![self.image.repo_tag()],
            Reference::Digest(_) => Vec::new(),
        }
    }

    /// Build `<output_dir>/<archive name>` from `layers`, which must be in
    /// manifest order, and remove the working directory.
    ///
    /// An image without layers still gets an archive; its `repositories`
    /// entry then points at an empty ID.
    pub fn assemble(&self, layers: &[DownloadResult], output_dir: &Path) -> Result<PathBuf> {
        let top_id = layers.last().map(|l| l.chain_id.clone()).unwrap_or_default();
        if layers.windows(2).any(|w| w[0].index >= w[1].index) {
            return Err(Error::Archive("layers are not in manifest order".to_string()));
        }

        fs::write(self.workdir.join(self.config_file_name()), &self.config.bytes)?;
        self.write_layer_metadata(layers)?;

        let entry = ArchiveManifestEntry {
            config: self.config_file_name(),
            repo_tags: self.repo_tags(),
            layers: layers
                .iter()
                .map(|l| format!("{}/{}", l.chain_id, LAYER_FILE))
                .collect(),
        };
        fs::write(
            self.workdir.join(MANIFEST_FILE),
            serde_json::to_vec(&[entry])?,
        )?;

        let mut tags = BTreeMap::new();
        tags.insert(self.image.reference.as_str().to_string(), top_id);
        let mut repositories = BTreeMap::new();
        repositories.insert(self.image.name.clone(), tags);
        fs::write(
            self.workdir.join(REPOSITORIES_FILE),
            serde_json::to_vec(&repositories)?,
        )?;

        fs::create_dir_all(output_dir)?;
        let archive = output_dir.join(archive_file_name(self.image));
        self.write_tar(layers, &archive)?;
        info!(archive = %archive.display(), layers = layers.len(), "archive written");

        fs::remove_dir_all(&self.workdir)?;
        Ok(archive)
    }

    fn write_layer_metadata(&self, layers: &[DownloadResult]) -> Result<()> {
        let last = layers.len().saturating_sub(1);
        let mut parent: Option<&str> = None;
        for (pos, layer) in layers.iter().enumerate() {
            let dir = &layer.target_dir;
            fs::write(dir.join(VERSION_FILE), LAYER_FORMAT_VERSION)?;

            let mut meta = if pos == last {
                top_layer_json(self.config)?
            } else {
                placeholder_layer_json()
            };
            meta.insert("id".to_string(), Value::String(layer.chain_id.clone()));
            if let Some(p) = parent {
                meta.insert("parent".to_string(), Value::String(p.to_string()));
            }
            fs::write(dir.join(LAYER_JSON_FILE), serde_json::to_vec(&meta)?)?;
            parent = Some(&layer.chain_id);
        }
        Ok(())
    }

    /// Pack into a staging file first so a failed run never leaves a
    /// truncated archive under the final name.
    fn write_tar(&self, layers: &[DownloadResult], archive: &Path) -> Result<()> {
        let staging = archive.with_extension(format!("tar.{}.partial", uuid::Uuid::now_v7().simple()));
        let result = self.write_tar_to(layers, &staging);
        match result {
            Ok(()) => {
                fs::rename(&staging, archive)?;
                Ok(())
            }
            Err(e) => {
                let _ = fs::remove_file(&staging);
                Err(e)
            }
        }
    }

    fn write_tar_to(&self, layers: &[DownloadResult], path: &Path) -> Result<()> {
        let file = BufWriter::new(File::create(path)?);
        let mut builder = tar::Builder::new(file);
        builder.mode(tar::HeaderMode::Deterministic);
        builder.follow_symlinks(false);

        for name in [REPOSITORIES_FILE, MANIFEST_FILE] {
            builder.append_path_with_name(self.workdir.join(name), name)?;
        }
        let config_name = self.config_file_name();
        builder.append_path_with_name(self.workdir.join(&config_name), &config_name)?;

        for layer in layers {
            builder.append_dir(&layer.chain_id, &layer.target_dir)?;
            for name in [VERSION_FILE, LAYER_JSON_FILE, LAYER_FILE] {
                let entry = format!("{}/{}", layer.chain_id, name);
                builder.append_path_with_name(layer.target_dir.join(name), &entry)?;
            }
            debug!(layer = layer.index, chain_id = %layer.chain_id, "layer added to archive");
        }

        let mut out = builder.into_inner()?;
        out.flush()?;
        Ok(())
    }
}
