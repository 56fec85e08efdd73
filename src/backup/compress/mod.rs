pub mod deflate;

use crate::backup::finish::Finish;
use crate::backup::result_error::error::IntegrityFailure;
use crate::backup::result_error::result::Result;
use crate::backup::result_error::WithDebugObjectAndFnName;
use derive_more::{Display, From};
use flate2::read::DeflateDecoder;
use flate2::write::DeflateEncoder;
use io_enum::{Read, Write};
use serde::{Deserialize, Serialize};
use std::io;
use std::io::{Read, Write};
use std::result;
use validator::{Validate, ValidationErrors};

#[derive(Write, From)]
pub enum Compressor<W: Write> {
    None(W),
    Deflate(DeflateEncoder<W>),
}

#[derive(Read)]
pub enum Decompressor<R: Read> {
    None(R),
    Deflate(DeflateDecoder<R>),
}

/// Codec recorded next to each artifact so it can be reversed later
#[derive(Clone, Copy, Debug, Display, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompressionCodec {
    #[display("none")]
    None,
    #[display("deflate")]
    Deflate,
}

#[derive(Clone, From, Serialize, Deserialize, Debug, PartialEq, Eq)]
#[serde(tag = "compressor_type")]
#[serde(rename_all = "snake_case")]
#[serde(deny_unknown_fields)]
pub enum CompressorConfig {
    None,
    Deflate(deflate::DeflateConfig),
}

impl Default for CompressorConfig {
    fn default() -> Self {
        CompressorConfig::Deflate(deflate::DeflateConfig::default())
    }
}

impl Validate for CompressorConfig {
    fn validate(&self) -> result::Result<(), ValidationErrors> {
        match self {
            CompressorConfig::None => Ok(()),
            CompressorConfig::Deflate(deflate) => deflate.validate(),
        }
    }
}

pub trait CompressorBuilder<W: Write> {
    fn build_compressor(&self, writer: W) -> Result<Compressor<W>>;
}

impl<W: Write> Finish<W> for Compressor<W> {
    fn finish(self) -> io::Result<W> {
        match self {
            Compressor::None(w) => Ok(w),
            Compressor::Deflate(w) => w.finish(),
        }
    }
}

impl<W: Write> CompressorBuilder<W> for CompressorConfig {
    fn build_compressor(&self, writer: W) -> Result<Compressor<W>> {
        match self {
            CompressorConfig::None => Ok(Compressor::None(writer)),
            CompressorConfig::Deflate(deflate) => deflate.build_compressor(writer),
        }
        .with_debug_object_and_fn_name(self.clone(), "build_compressor")
    }
}

impl CompressorConfig {
    pub fn codec(&self) -> CompressionCodec {
        match self {
            CompressorConfig::None => CompressionCodec::None,
            CompressorConfig::Deflate(_) => CompressionCodec::Deflate,
        }
    }

    pub fn compress(&self, data: &[u8]) -> Result<Vec<u8>> {
        let mut compressor = self.build_compressor(Vec::with_capacity(data.len() / 2))?;
        compressor.write_all(data)?;
        Ok(compressor.finish()?)
    }
}

impl<R: Read> Decompressor<R> {
    pub fn new(codec: CompressionCodec, reader: R) -> Self {
        match codec {
            CompressionCodec::None => Decompressor::None(reader),
            CompressionCodec::Deflate => Decompressor::Deflate(DeflateDecoder::new(reader)),
        }
    }
}

/// Inflates `data`, reading at most one byte past `expected_len` so a
/// corrupt stream cannot expand without bound.
pub fn decompress(
    codec: CompressionCodec,
    data: &[u8],
    expected_len: u64,
) -> result::Result<Vec<u8>, IntegrityFailure> {
    let mut out = Vec::new();
    Decompressor::new(codec, data)
        .take(expected_len.saturating_add(1))
        .read_to_end(&mut out)
        .map_err(|e| {
            tracing::debug!("Decompression failed: {}", e);
            IntegrityFailure::Decompress
        })?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_deflate() {
        let config = CompressorConfig::default();
        assert_eq!(config.codec(), CompressionCodec::Deflate);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_serialization() {
        let serialized = serde_json::to_string(&CompressorConfig::None).unwrap();
        assert_eq!(serialized, "{\"compressor_type\":\"none\"}");

        let config: CompressorConfig =
            serde_yml::from_str("compressor_type: deflate\nlevel: 3\n").unwrap();
        assert_eq!(config.codec(), CompressionCodec::Deflate);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_compress_roundtrip() {
        let data = b"backup backup backup backup backup backup".repeat(20);
        for config in [CompressorConfig::None, CompressorConfig::default()] {
            let packed = config.compress(&data).unwrap();
            let unpacked = decompress(config.codec(), &packed, data.len() as u64).unwrap();
            assert_eq!(unpacked, data);
        }
    }

    #[test]
    fn test_deflate_shrinks_repetitive_input() {
        let data = vec![7u8; 4096];
        let packed = CompressorConfig::default().compress(&data).unwrap();
        assert!(packed.len() < data.len() / 10);
    }

    #[test]
    fn test_garbage_fails_to_inflate() {
        let err = decompress(CompressionCodec::Deflate, &[0xff; 32], 100).unwrap_err();
        assert_eq!(err, IntegrityFailure::Decompress);
    }

    #[test]
    fn test_output_is_capped() {
        let data = vec![0u8; 1000];
        let packed = CompressorConfig::default().compress(&data).unwrap();
        let out = decompress(CompressionCodec::Deflate, &packed, 10).unwrap();
        assert_eq!(out.len(), 11);
    }
}
