//! Collection-wide settings

use crate::catalog::CompressionParams;
use crate::compression::PayloadCodec;
use crate::error::{Result, VdcError};
use crate::wasp::{default_nthreads, WaspOptions};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Variables smaller than this many bytes, and not compressed, are stored
/// in the master file
pub const DEFAULT_MASTER_THRESHOLD: usize = 10 * 1024 * 1024;

/// Grid points per side file before timesteps are split across files
pub const DEFAULT_VARIABLE_THRESHOLD: usize = 100 * 1024 * 1024;

/// Settings for a collection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VdcConfig {
    /// Worker threads for block compression
    pub nthreads: usize,
    pub master_threshold: usize,
    pub variable_threshold: usize,
    /// Codec applied to every container file body
    pub payload_codec: PayloadCodec,
    /// Defaults for variables defined as compressed
    pub compression: CompressionParams,
}

impl Default for VdcConfig {
    fn default() -> Self {
        Self {
            nthreads: default_nthreads(),
            master_threshold: DEFAULT_MASTER_THRESHOLD,
            variable_threshold: DEFAULT_VARIABLE_THRESHOLD,
            payload_codec: PayloadCodec::default(),
            compression: CompressionParams::default(),
        }
    }
}

impl VdcConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_nthreads(mut self, nthreads: usize) -> Self {
        self.nthreads = nthreads;
        self
    }

    pub fn with_master_threshold(mut self, bytes: usize) -> Self {
        self.master_threshold = bytes;
        self
    }

    pub fn with_variable_threshold(mut self, points: usize) -> Self {
        self.variable_threshold = points;
        self
    }

    pub fn with_payload_codec(mut self, codec: PayloadCodec) -> Self {
        self.payload_codec = codec;
        self
    }

    pub fn with_compression(mut self, params: CompressionParams) -> Self {
        self.compression = params;
        self
    }

    /// Load settings from a JSON file; missing fields take their defaults
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        let config: VdcConfig = serde_json::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.nthreads == 0 {
            return Err(VdcError::Configuration(
                "nthreads must be at least 1".to_string(),
            ));
        }
        if self.variable_threshold == 0 {
            return Err(VdcError::Configuration(
                "variable_threshold must be at least 1".to_string(),
            ));
        }
        self.compression.validate()
    }

    pub(crate) fn wasp_options(&self) -> WaspOptions {
        WaspOptions {
            nthreads: self.nthreads.max(1),
            payload_codec: self.payload_codec,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_defaults_are_valid() {
        let config = VdcConfig::default();
        assert!(config.nthreads >= 1);
        assert_eq!(config.compression.cratios, vec![500, 100, 10, 1]);
        config.validate().unwrap();
    }

    #[test]
    fn test_builders() {
        let config = VdcConfig::new()
            .with_nthreads(2)
            .with_master_threshold(0)
            .with_payload_codec(PayloadCodec::Zstd);
        assert_eq!(config.nthreads, 2);
        assert_eq!(config.master_threshold, 0);
        assert_eq!(config.wasp_options().payload_codec, PayloadCodec::Zstd);
        assert!(config.clone().with_nthreads(0).validate().is_err());
    }

    #[test]
    fn test_from_json_file() {
        let mut file = NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"nthreads": 3, "payload_codec": "deflate",
                "compression": {{"bs": [32, 32, 32], "wname": "bior2.2",
                                 "cratios": [100, 10, 1], "periodic": [false, false, false]}}}}"#
        )
        .unwrap();

        let config = VdcConfig::from_json_file(file.path()).unwrap();
        assert_eq!(config.nthreads, 3);
        assert_eq!(config.payload_codec, PayloadCodec::Deflate);
        assert_eq!(config.compression.bs, vec![32, 32, 32]);
        assert_eq!(config.variable_threshold, DEFAULT_VARIABLE_THRESHOLD);
    }

    #[test]
    fn test_rejects_invalid_json_settings() {
        let mut file = NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"compression": {{"bs": [64, 64, 64], "wname": "bior4.4",
                                 "cratios": [10, 100], "periodic": []}}}}"#
        )
        .unwrap();
        assert!(VdcConfig::from_json_file(file.path()).is_err());

        let mut file = NamedTempFile::new().unwrap();
        write!(file, "not json").unwrap();
        assert!(matches!(
            VdcConfig::from_json_file(file.path()),
            Err(VdcError::Configuration(_))
        ));
    }
}
