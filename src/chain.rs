//! Legacy per-layer identifiers for the `docker load` archive format.
//!
//! Each layer gets `sha256(parent + "\n" + digest + "\n")` where `parent` is
//! the previous layer's ID and the empty string for the bottom layer. The
//! IDs name the per-layer directories inside the archive and the top one is
//! recorded as the image ID in `repositories`.

use docker_pull_oci::digest::sha256_hex;

/// Chain ID of a layer stacked on `parent` ("" for the bottom layer).
pub fn chain_id(parent: &str, digest: &str) -> String {
    sha256_hex(format!("{}\n{}\n", parent, digest).as_bytes())
}

/// Chain IDs for an ordered digest list, bottom layer first.
pub fn chain_ids<S: AsRef<str>>(digests: &[S]) -> Vec<String> {
    let mut ids: Vec<String> = Vec::with_capacity(digests.len());
    for digest in digests {
        let parent = ids.last().map(String::as_str).unwrap_or("");
        let id = chain_id(parent, digest.as_ref());
        ids.push(id);
    }
    ids
}
