//! Flat guest images
//!
//! A flat image is raw RV32 code and data meant to be copied to a fixed
//! base. Images may be shipped gzip or zstd compressed; the format is
//! detected from the leading magic bytes.

use std::borrow::Cow;
use std::io::Read;

use flate2::read::GzDecoder;
use thiserror::Error;

const GZIP_MAGIC: [u8; 2] = [0x1F, 0x8B];
const ZSTD_MAGIC: [u8; 4] = [0x28, 0xB5, 0x2F, 0xFD];

/// Decompressed images larger than this are rejected
pub const MAX_IMAGE_SIZE: usize = 0x1000_0000;

#[derive(Debug, Error)]
pub enum ImageError {
    #[error("image is empty")]
    Empty,
    #[error("gzip decompression failed: {0}")]
    Gzip(#[source] std::io::Error),
    #[error("zstd decompression failed: {0}")]
    Zstd(#[source] std::io::Error),
    #[error("image is {0} bytes, larger than the guest address range allows")]
    TooLarge(usize),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Compression {
    None,
    Gzip,
    Zstd,
}

impl Compression {
    pub fn detect(data: &[u8]) -> Self {
        if data.starts_with(&ZSTD_MAGIC) {
            Compression::Zstd
        } else if data.starts_with(&GZIP_MAGIC) {
            Compression::Gzip
        } else {
            Compression::None
        }
    }
}

/// Raw image bytes, decompressed if needed
pub fn decode(data: &[u8]) -> Result<Cow<'_, [u8]>, ImageError> {
    if data.is_empty() {
        return Err(ImageError::Empty);
    }
    let bytes = match Compression::detect(data) {
        Compression::None => Cow::Borrowed(data),
        Compression::Gzip => {
            let mut out = Vec::new();
            GzDecoder::new(data)
                .take(MAX_IMAGE_SIZE as u64 + 1)
                .read_to_end(&mut out)
                .map_err(ImageError::Gzip)?;
            Cow::Owned(out)
        }
        Compression::Zstd => Cow::Owned(zstd::stream::decode_all(data).map_err(ImageError::Zstd)?),
    };
    if bytes.len() > MAX_IMAGE_SIZE {
        return Err(ImageError::TooLarge(bytes.len()));
    }
    if bytes.is_empty() {
        return Err(ImageError::Empty);
    }
    Ok(bytes)
}
