//! Byte-level codecs for container file payloads

use crate::error::{Result, VdcError};
use flate2::read::{DeflateDecoder, DeflateEncoder};
use serde::{Deserialize, Serialize};
use std::io::Read;

/// Codec applied to the serialized body of a container file.
///
/// The discriminant is the byte stored in the container header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum PayloadCodec {
    #[default]
    None = 0,
    Deflate = 1,
    Zstd = 3,
}

impl PayloadCodec {
    pub const ALL: [PayloadCodec; 3] = [PayloadCodec::None, PayloadCodec::Deflate, PayloadCodec::Zstd];

    pub fn from_header_byte(byte: u8) -> Option<Self> {
        Self::ALL.into_iter().find(|c| *c as u8 == byte)
    }

    pub fn header_byte(self) -> u8 {
        self as u8
    }

    /// Effort level used when a container body is written
    pub fn write_effort(self) -> u32 {
        match self {
            PayloadCodec::None => 0,
            PayloadCodec::Deflate => 1,
            PayloadCodec::Zstd => 3,
        }
    }

    pub fn compressor(self) -> &'static dyn PayloadCompressor {
        match self {
            PayloadCodec::None => &Stored,
            PayloadCodec::Deflate => &Deflate,
            PayloadCodec::Zstd => &Zstd,
        }
    }

    pub fn encode(self, body: &[u8]) -> Result<Vec<u8>> {
        self.compressor().compress(body, self.write_effort())
    }

    pub fn decode(self, body: &[u8]) -> Result<Vec<u8>> {
        self.compressor().decompress(body)
    }
}

/// Whole-buffer compressor for one payload codec
pub trait PayloadCompressor: Send + Sync {
    fn compress(&self, body: &[u8], effort: u32) -> Result<Vec<u8>>;

    fn decompress(&self, body: &[u8]) -> Result<Vec<u8>>;
}

struct Stored;

impl PayloadCompressor for Stored {
    fn compress(&self, body: &[u8], _effort: u32) -> Result<Vec<u8>> {
        Ok(body.to_vec())
    }

    fn decompress(&self, body: &[u8]) -> Result<Vec<u8>> {
        Ok(body.to_vec())
    }
}

struct Deflate;

impl PayloadCompressor for Deflate {
    fn compress(&self, body: &[u8], effort: u32) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(body.len() / 2);
        DeflateEncoder::new(body, flate2::Compression::new(effort.min(9)))
            .read_to_end(&mut out)
            .map_err(|e| VdcError::Compression(format!("deflate: {e}")))?;
        Ok(out)
    }

    fn decompress(&self, body: &[u8]) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(body.len() * 4);
        DeflateDecoder::new(body)
            .read_to_end(&mut out)
            .map_err(|e| VdcError::Decompression(format!("deflate: {e}")))?;
        Ok(out)
    }
}

struct Zstd;

impl PayloadCompressor for Zstd {
    fn compress(&self, body: &[u8], effort: u32) -> Result<Vec<u8>> {
        zstd::encode_all(body, effort.min(22) as i32)
            .map_err(|e| VdcError::Compression(format!("zstd: {e}")))
    }

    fn decompress(&self, body: &[u8]) -> Result<Vec<u8>> {
        zstd::decode_all(body).map_err(|e| VdcError::Decompression(format!("zstd: {e}")))
    }
}
