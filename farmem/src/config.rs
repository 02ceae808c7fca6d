use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::FarError;

const DEFAULT_CACHE_BYTES:  usize = 64 * 1024 * 1024;
const DEFAULT_FAR_BYTES:    usize = 4 * 1024 * 1024 * 1024;
const DEFAULT_BLOCK_BYTES:  usize = 4096;

/// Knobs of a [`FarMemory`](crate::FarMemory) pool, usually read from a
/// TOML file:
///
/// ```toml
/// cache_bytes = 67108864   # local cache budget
/// far_bytes   = 4294967296 # far tier capacity
/// block_bytes = 4096       # size of dataset blocks
/// ```
///
/// Every key is optional.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FarConfig {
    #[serde(default = "default_cache_bytes")]
    pub cache_bytes:    usize,
    #[serde(default = "default_far_bytes")]
    pub far_bytes:      usize,
    #[serde(default = "default_block_bytes")]
    pub block_bytes:    usize,
}

fn default_cache_bytes() -> usize { DEFAULT_CACHE_BYTES }
fn default_far_bytes() -> usize { DEFAULT_FAR_BYTES }
fn default_block_bytes() -> usize { DEFAULT_BLOCK_BYTES }

impl Default for FarConfig {
    fn default() -> Self {
        Self {
            cache_bytes:    DEFAULT_CACHE_BYTES,
            far_bytes:      DEFAULT_FAR_BYTES,
            block_bytes:    DEFAULT_BLOCK_BYTES,
        }
    }
}

impl FarConfig {
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, FarError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|source| FarError::ConfigIo { path: path.to_path_buf(), source })?;
        let cfg: Self = toml::from_str(&text)
            .map_err(|source| FarError::ConfigParse { path: path.to_path_buf(), source })?;
        cfg.validate()?;

        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), FarError> {
        if self.cache_bytes == 0 {
            return Err(FarError::Invalid("cache_bytes must be > 0".into()));
        }
        if self.block_bytes == 0 {
            return Err(FarError::Invalid("block_bytes must be > 0".into()));
        }
        if self.far_bytes < self.block_bytes {
            return Err(FarError::Invalid("far_bytes must hold at least one block".into()));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn missing_keys_fall_back_to_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "cache_bytes = 1024").unwrap();
        let cfg = FarConfig::from_path(file.path()).unwrap();
        assert_eq!(cfg.cache_bytes, 1024);
        assert_eq!(cfg.block_bytes, DEFAULT_BLOCK_BYTES);
        assert_eq!(cfg.far_bytes, DEFAULT_FAR_BYTES);
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "cache_size = 1024").unwrap();
        assert!(matches!(
            FarConfig::from_path(file.path()),
            Err(FarError::ConfigParse { .. })
        ));
    }

    #[test]
    fn zero_sized_cache_is_invalid() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "cache_bytes = 0").unwrap();
        assert!(matches!(FarConfig::from_path(file.path()), Err(FarError::Invalid(_))));
    }

    #[test]
    fn missing_file_is_an_io_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            FarConfig::from_path(dir.path().join("nope.toml")),
            Err(FarError::ConfigIo { .. })
        ));
    }
}
