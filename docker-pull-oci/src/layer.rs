use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::Path;

use flate2::read::GzDecoder;
use tracing::{debug, warn};

use crate::error::Result;
use crate::manifest::Descriptor;

/// One filesystem layer of a manifest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LayerDescriptor {
    /// Content-addressable digest (e.g. "sha256:abcdef…").
    pub digest: String,
    /// Compressed size in bytes; zero when the manifest does not say.
    pub size: u64,
    /// Layer media type, absent for schema 1 layers.
    pub media_type: Option<String>,
    /// Alternate download locations, tried after the registry blob endpoint.
    pub urls: Vec<String>,
}

impl LayerDescriptor {
    pub fn new(digest: impl Into<String>) -> Self {
        Self {
            digest: digest.into(),
            size: 0,
            media_type: None,
            urls: Vec::new(),
        }
    }
}

impl From<&Descriptor> for LayerDescriptor {
    fn from(d: &Descriptor) -> Self {
        Self {
            digest: d.digest.clone(),
            size: d.size,
            media_type: (!d.media_type.is_empty()).then(|| d.media_type.clone()),
            urls: d.urls.clone(),
        }
    }
}

// ---------------------------------------------------------------------------
// Compression
// ---------------------------------------------------------------------------

/// Gzip magic bytes (1f 8b).
const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];
/// Zstandard frame magic (28 b5 2f fd).
const ZSTD_MAGIC: [u8; 4] = [0x28, 0xb5, 0x2f, 0xfd];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compression {
    Gzip,
    Zstd,
    None,
}

impl Compression {
    /// Decide from the first bytes of the blob, using the media type only
    /// when the bytes are inconclusive.
    pub fn detect(media_type: Option<&str>, head: &[u8]) -> Self {
        if head.starts_with(&GZIP_MAGIC) {
            return Compression::Gzip;
        }
        if head.starts_with(&ZSTD_MAGIC) {
            return Compression::Zstd;
        }
        match media_type {
            Some(mt) if mt.contains("gzip") => {
                warn!(media_type = mt, "gzip media type without gzip header");
                Compression::None
            }
            Some(mt) if mt.contains("zstd") => {
                warn!(media_type = mt, "zstd media type without zstd header");
                Compression::None
            }
            _ => Compression::None,
        }
    }
}

/// Stream-decompress the blob at `src` into `dst`, returning the number of
/// bytes written.
///
/// Memory use is bounded by the reader/writer buffers regardless of layer
/// size. A partially written `dst` is removed on failure.
pub fn decompress_file(src: &Path, dst: &Path, media_type: Option<&str>) -> Result<u64> {
    let result = decompress_inner(src, dst, media_type);
    if result.is_err() {
        let _ = fs::remove_file(dst);
    }
    result
}

fn decompress_inner(src: &Path, dst: &Path, media_type: Option<&str>) -> Result<u64> {
    let mut head = [0u8; 4];
    let head_len = {
        let mut f = File::open(src)?;
        read_up_to(&mut f, &mut head)?
    };
    let compression = Compression::detect(media_type, &head[..head_len]);
    debug!(src = %src.display(), ?compression, "decompressing layer");

    let input = BufReader::new(File::open(src)?);
    let mut reader: Box<dyn Read> = match compression {
        Compression::Gzip => Box::new(GzDecoder::new(input)),
        Compression::Zstd => Box::new(zstd::Decoder::with_buffer(input)?),
        Compression::None => Box::new(input),
    };

    let mut out = BufWriter::new(File::create(dst)?);
    let written = io::copy(&mut reader, &mut out)?;
    out.flush()?;
    Ok(written)
}

fn read_up_to(r: &mut impl Read, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match r.read(&mut buf[filled..])? {
            0 => break,
            n => filled += n,
        }
    }
    Ok(filled)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
