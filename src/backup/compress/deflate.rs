use crate::backup::compress::{Compressor, CompressorBuilder};
use crate::backup::result_error::result::Result;
use flate2::write::DeflateEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use serde_with::skip_serializing_none;
use std::io::Write;
use validator::Validate;

static DEFAULT_COMPRESSION_LEVEL: u32 = 6;

/// Raw deflate stream settings
#[skip_serializing_none]
#[derive(Clone, Default, Validate, Serialize, Deserialize, Debug, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct DeflateConfig {
    /// 0 stores, 9 compresses hardest
    #[validate(range(min = 0, max = 9))]
    level: Option<u32>,
}

impl DeflateConfig {
    pub fn with_level(level: u32) -> Self {
        Self { level: Some(level) }
    }

    pub fn level(&self) -> u32 {
        self.level.unwrap_or(DEFAULT_COMPRESSION_LEVEL)
    }
}

impl<W: Write> CompressorBuilder<W> for DeflateConfig {
    fn build_compressor(&self, writer: W) -> Result<Compressor<W>> {
        let level = self.level();
        tracing::debug!("Creating deflate compressor with level={}", level);
        Ok(DeflateEncoder::new(writer, Compression::new(level)).into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup::finish::Finish;

    #[test]
    fn test_level_validation() {
        assert!(DeflateConfig::with_level(0).validate().is_ok());
        assert!(DeflateConfig::with_level(9).validate().is_ok());
        assert!(DeflateConfig::with_level(10).validate().is_err());
        assert_eq!(DeflateConfig::default().level(), DEFAULT_COMPRESSION_LEVEL);
    }

    #[test]
    fn test_build_compressor() {
        let mut compressor = DeflateConfig::with_level(1)
            .build_compressor(Vec::new())
            .unwrap();
        compressor.write_all(b"abc").unwrap();
        match compressor {
            Compressor::Deflate(_) => (),
            _ => panic!("Expected deflate encoder"),
        }
        assert!(!compressor.finish().unwrap().is_empty());
    }
}
