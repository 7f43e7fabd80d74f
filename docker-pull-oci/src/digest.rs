//! Helpers for `algorithm:hex` content digests.

use sha2::{Digest, Sha256};

/// Hex-encode `bytes` in lowercase.
pub fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

/// SHA-256 of `data` as lowercase hex.
pub fn sha256_hex(data: &[u8]) -> String {
    hex_encode(&Sha256::digest(data))
}

/// SHA-256 of `data` as a `sha256:<hex>` digest string.
pub fn sha256_digest(data: &[u8]) -> String {
    format!("sha256:{}", sha256_hex(data))
}

/// Check that `digest` has the `algorithm:hex` shape registries use.
///
/// The algorithm is `[a-z0-9+._-]+` and the encoded part lowercase hex;
/// `sha256` digests must carry exactly 64 hex characters. Digests name
/// cache directories, so anything else is refused before it reaches a path.
pub fn validate(digest: &str) -> crate::Result<()> {
    let invalid = || crate::OciError::InvalidDigest(digest.to_string());
    let (algorithm, hex) = digest.split_once(':').ok_or_else(invalid)?;
    let algorithm_ok = !algorithm.is_empty()
        && algorithm
            .bytes()
            .all(|b| matches!(b, b'a'..=b'z' | b'0'..=b'9' | b'+' | b'.' | b'_' | b'-'));
    let hex_ok = !hex.is_empty() && hex.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'));
    if !algorithm_ok || !hex_ok {
        return Err(invalid());
    }
    if algorithm == "sha256" && hex.len() != 64 {
        return Err(invalid());
    }
    Ok(())
}

/// The hex portion of a digest string (`sha256:abcd` -> `abcd`).
pub fn digest_hex(digest: &str) -> &str {
    digest.split_once(':').map(|(_, hex)| hex).unwrap_or(digest)
}

/// First 12 hex characters, the short form used in log lines and progress bars.
pub fn short_digest(digest: &str) -> &str {
    let hex = digest_hex(digest);
    &hex[..hex.len().min(12)]
}

/// Incremental SHA-256 verifier for streamed blob bodies.
///
/// Only `sha256:` digests are checked; any other algorithm is accepted as-is.
pub struct DigestVerifier {
    expected: String,
    hasher: Option<Sha256>,
}

impl DigestVerifier {
    pub fn new(expected: &str) -> Self {
        let hasher = expected.starts_with("sha256:").then(Sha256::new);
        Self {
            expected: expected.to_string(),
            hasher,
        }
    }

    pub fn update(&mut self, chunk: &[u8]) {
        if let Some(h) = self.hasher.as_mut() {
            h.update(chunk);
        }
    }

    /// Consume the verifier, failing if the streamed bytes do not hash to the
    /// expected digest.
    pub fn finish(self) -> crate::Result<()> {
        let Some(hasher) = self.hasher else {
            return Ok(());
        };
        let actual = hex_encode(&hasher.finalize());
        let expected = digest_hex(&self.expected);
        if actual != expected {
            return Err(crate::OciError::DigestMismatch {
                expected: expected.to_string(),
                actual,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn well_formed_digests_validate() {
        assert!(validate(&sha256_digest(b"")).is_ok());
        assert!(validate("sha512:0123abcd").is_ok());
        assert!(validate("multihash+base58:abcdef").is_ok());
    }

    #[test]
    fn path_like_digests_are_rejected() {
        let short = "sha256:abcd";
        let upper = format!("sha256:{}", "A".repeat(64));
        for bad in [
            "",
            "sha256",
            "sha256:",
            ":abcd",
            "/tmp/layer",
            "x/../..",
            "sha256:../../etc",
            "sha256:abcd/..",
            "SHA256:abcd",
            short,
            upper.as_str(),
        ] {
            assert!(
                matches!(validate(bad), Err(crate::OciError::InvalidDigest(_))),
                "accepted {bad:?}"
            );
        }
    }

    #[test]
    fn hex_and_short_forms() {
        let d = "sha256:0123456789abcdef0123";
        assert_eq!(digest_hex(d), "0123456789abcdef0123");
        assert_eq!(short_digest(d), "0123456789ab");
        assert_eq!(short_digest("sha256:abc"), "abc");
    }

    #[test]
    fn verifier_accepts_matching_stream() {
        let digest = sha256_digest(b"hello world");
        let mut v = DigestVerifier::new(&digest);
        v.update(b"hello ");
        v.update(b"world");
        assert!(v.finish().is_ok());
    }

    #[test]
    fn verifier_rejects_corrupt_stream() {
        let digest = sha256_digest(b"hello world");
        let mut v = DigestVerifier::new(&digest);
        v.update(b"hello there");
        assert!(matches!(
            v.finish(),
            Err(crate::OciError::DigestMismatch { .. })
        ));
    }

    #[test]
    fn verifier_skips_unknown_algorithms() {
        let mut v = DigestVerifier::new("sha512:abc");
        v.update(b"anything");
        assert!(v.finish().is_ok());
    }
}
