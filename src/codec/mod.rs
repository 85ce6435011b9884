//! Zlib codec.
//!
//! Every index and compiled-script stream in the wild is zlib-wrapped,
//! but a few third-party packers emit raw deflate.  [`inflate`] therefore
//! tries the wrapped form first and falls back to a raw stream.

use std::io::{self, Read, Write};

use flate2::read::{DeflateDecoder, ZlibDecoder};
use flate2::write::ZlibEncoder;
use flate2::Compression;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CodecError {
    #[error("not a zlib or raw deflate stream")]
    NotCompressed,
    #[error("io: {0}")]
    Io(#[from] io::Error),
}

/// Compress with zlib wrapping at the default level.
pub fn deflate(data: &[u8]) -> Result<Vec<u8>, CodecError> {
    let mut enc = ZlibEncoder::new(Vec::new(), Compression::default());
    enc.write_all(data)?;
    Ok(enc.finish()?)
}

/// Decompress a zlib-wrapped stream only.  Used when scanning unknown
/// bytes: raw deflate can "succeed" on junk, the wrapped form cannot.
pub fn inflate_zlib(data: &[u8]) -> Result<Vec<u8>, CodecError> {
    let mut out = Vec::new();
    ZlibDecoder::new(data)
        .read_to_end(&mut out)
        .map_err(|_| CodecError::NotCompressed)?;
    Ok(out)
}

/// Decompress `data`, accepting both zlib-wrapped and raw deflate streams.
pub fn inflate(data: &[u8]) -> Result<Vec<u8>, CodecError> {
    let mut out = Vec::new();
    if ZlibDecoder::new(data).read_to_end(&mut out).is_ok() {
        return Ok(out);
    }

    out.clear();
    if DeflateDecoder::new(data).read_to_end(&mut out).is_ok() {
        return Ok(out);
    }

    Err(CodecError::NotCompressed)
}
