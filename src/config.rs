//! Configuration surface. Layers defaults, an optional file, and
//! environment variables through the `config` crate.

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::error::{Error, Result};

/// Which `BlobFileSystem` backend to use for `useBlobFs`/`blobFsType`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BlobFsType {
    Local,
    S3,
    Redis,
    Kafka,
}

/// Deserialized form of the recognized configuration options (design §6).
/// Field names match the on-the-wire config keys; accessors below convert
/// to the typed values the rest of the engine wants (e.g. `Duration`).
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreConfig {
    pub storage_directory: PathBuf,

    #[serde(default = "defaults::channel_count")]
    pub channel_count: u32,

    #[serde(default = "defaults::data_file_minimum_size")]
    pub data_file_minimum_size: u64,
    #[serde(default = "defaults::data_file_maximum_size")]
    pub data_file_maximum_size: u64,

    #[serde(default = "defaults::entity_cache_threshold")]
    pub entity_cache_threshold: u64,
    #[serde(default = "defaults::entity_cache_timeout_ms")]
    pub entity_cache_timeout_ms: u64,

    #[serde(default = "defaults::housekeeping_interval_ms")]
    pub housekeeping_interval_ms: u64,
    #[serde(default = "defaults::housekeeping_time_budget_ns")]
    pub housekeeping_time_budget_ns: u64,
    #[serde(default)]
    pub housekeeping_on_startup: bool,

    #[serde(default)]
    pub validate_on_startup: bool,

    #[serde(default)]
    pub backup_directory: Option<PathBuf>,

    #[serde(default = "defaults::use_blob_fs")]
    pub use_blob_fs: bool,
    #[serde(default = "defaults::blob_fs_type")]
    pub blob_fs_type: BlobFsType,
    #[serde(default)]
    pub blob_fs_connection: Option<String>,
    #[serde(default)]
    pub blob_fs_use_cache: bool,

    /// File-retirement threshold: `liveBytes / logicalSize < threshold`
    /// triggers eligibility.
    #[serde(default = "defaults::retirement_threshold")]
    pub retirement_threshold: f64,

    /// Target fraction of `entityCacheThreshold` the cache sweeps down to
    /// (design §4.4's `softRatio`, documented as "≈ 0.8").
    #[serde(default = "defaults::cache_soft_ratio")]
    pub cache_soft_ratio: f64,
}

mod defaults {
    use super::BlobFsType;

    pub fn channel_count() -> u32 {
        8
    }
    pub fn data_file_minimum_size() -> u64 {
        1024 * 1024
    }
    pub fn data_file_maximum_size() -> u64 {
        128 * 1024 * 1024
    }
    pub fn entity_cache_threshold() -> u64 {
        64 * 1024 * 1024
    }
    pub fn entity_cache_timeout_ms() -> u64 {
        60_000
    }
    pub fn housekeeping_interval_ms() -> u64 {
        1_000
    }
    pub fn housekeeping_time_budget_ns() -> u64 {
        10_000_000 // 10ms
    }
    pub fn use_blob_fs() -> bool {
        false
    }
    pub fn blob_fs_type() -> BlobFsType {
        BlobFsType::Local
    }
    pub fn retirement_threshold() -> f64 {
        0.5
    }
    pub fn cache_soft_ratio() -> f64 {
        0.8
    }
}

impl StoreConfig {
    /// Builds a config layering (in increasing priority): built-in
    /// defaults, an optional TOML/YAML/JSON file, then `NEBULA_*`
    /// environment variables.
    pub fn load(storage_directory: PathBuf, file: Option<&std::path::Path>) -> Result<Self> {
        let mut builder = config::Config::builder().set_default(
            "storage_directory",
            storage_directory.to_string_lossy().to_string(),
        )?;
        if let Some(path) = file {
            builder = builder.add_source(config::File::from(path).required(false));
        }
        builder = builder.add_source(config::Environment::with_prefix("NEBULA").separator("__"));
        let raw = builder.build()?;
        let config: StoreConfig = raw.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.channel_count == 0 {
            return Err(Error::config("channelCount must be at least 1"));
        }
        if self.data_file_minimum_size == 0
            || self.data_file_maximum_size < self.data_file_minimum_size
        {
            return Err(Error::config(
                "dataFileMaximumSize must be >= dataFileMinimumSize > 0",
            ));
        }
        if !(0.0..1.0).contains(&self.retirement_threshold) {
            return Err(Error::config("retirementThreshold must be in [0, 1)"));
        }
        if !(0.0..=1.0).contains(&self.cache_soft_ratio) {
            return Err(Error::config("cacheSoftRatio must be in [0, 1]"));
        }
        Ok(())
    }

    pub fn entity_cache_timeout(&self) -> Duration {
        Duration::from_millis(self.entity_cache_timeout_ms)
    }

    pub fn housekeeping_interval(&self) -> Duration {
        Duration::from_millis(self.housekeeping_interval_ms)
    }

    pub fn housekeeping_time_budget(&self) -> Duration {
        Duration::from_nanos(self.housekeeping_time_budget_ns)
    }

    /// A config good enough for unit and integration tests: small files so
    /// rollover kicks in quickly, short cache timeouts so sweeps are
    /// observable without sleeping for a long time.
    pub fn for_testing(storage_directory: PathBuf) -> Self {
        StoreConfig {
            storage_directory,
            channel_count: 4,
            data_file_minimum_size: 1024,
            data_file_maximum_size: 64 * 1024,
            entity_cache_threshold: 4096,
            entity_cache_timeout_ms: 50,
            housekeeping_interval_ms: 10,
            housekeeping_time_budget_ns: 5_000_000,
            housekeeping_on_startup: false,
            validate_on_startup: true,
            backup_directory: None,
            use_blob_fs: false,
            blob_fs_type: BlobFsType::Local,
            blob_fs_connection: None,
            blob_fs_use_cache: false,
            retirement_threshold: 0.5,
            cache_soft_ratio: 0.8,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case(0, 1024, 2048, 0.5, 0.8 => false; "zero channel count")]
    #[test_case(4, 2048, 1024, 0.5, 0.8 => false; "max below min file size")]
    #[test_case(4, 1024, 2048, 1.0, 0.8 => false; "retirement threshold at upper bound")]
    #[test_case(4, 1024, 2048, -0.1, 0.8 => false; "retirement threshold negative")]
    #[test_case(4, 1024, 2048, 0.5, 1.1 => false; "cache soft ratio above one")]
    #[test_case(4, 1024, 2048, 0.5, 0.8 => true; "all fields within range")]
    fn validate_accepts_or_rejects(
        channel_count: u32,
        data_file_minimum_size: u64,
        data_file_maximum_size: u64,
        retirement_threshold: f64,
        cache_soft_ratio: f64,
    ) -> bool {
        let mut cfg = StoreConfig::for_testing(PathBuf::from("/tmp/x"));
        cfg.channel_count = channel_count;
        cfg.data_file_minimum_size = data_file_minimum_size;
        cfg.data_file_maximum_size = data_file_maximum_size;
        cfg.retirement_threshold = retirement_threshold;
        cfg.cache_soft_ratio = cache_soft_ratio;
        cfg.validate().is_ok()
    }

    #[test]
    fn load_layers_a_json_file_over_the_defaults() {
        let dir = tempfile::TempDir::with_prefix("nebula-config").unwrap();
        let file_path = dir.path().join("nebula.json");
        let overrides = serde_json::json!({
            "channelCount": 16,
            "dataFileMinimumSize": 2048,
            "dataFileMaximumSize": 4096,
        });
        std::fs::write(&file_path, serde_json::to_vec(&overrides).unwrap()).unwrap();

        let cfg = StoreConfig::load(dir.path().to_path_buf(), Some(&file_path)).unwrap();
        assert_eq!(cfg.channel_count, 16);
        assert_eq!(cfg.data_file_minimum_size, 2048);
        assert_eq!(cfg.data_file_maximum_size, 4096);
        // Fields absent from the file fall back to the built-in defaults.
        assert_eq!(cfg.entity_cache_threshold, defaults::entity_cache_threshold());
    }
}
