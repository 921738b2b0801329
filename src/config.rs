//! Configuration management for vfsync

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Encryption sector size in bytes
pub const SECTOR_SIZE: u64 = 4096;

/// Page size used by the stream tracker
pub const PAGE_SIZE: u64 = 4096;

/// Default number of read streams tracked per open file
pub const DEFAULT_STREAM_COUNT: usize = 4;

/// Default smallest read-ahead window: 64KB
pub const DEFAULT_MIN_READAHEAD: u64 = 64 * 1024;

/// Default largest read-ahead window: 8MB
pub const DEFAULT_MAX_READAHEAD: u64 = 8 * 1024 * 1024;

/// Default fetch size while throttled: 32KB
pub const DEFAULT_THROTTLED_FETCH: u64 = 32 * 1024;

/// Default number of log entries allowed before folding them into the data file
pub const DEFAULT_CHECKPOINT_THRESHOLD: usize = 64;

/// Default handle lock timeout before a deadlock is assumed (seconds)
pub const DEFAULT_LOCK_TIMEOUT_SECS: u64 = 60;

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Local cache configuration
    pub cache: CacheConfig,

    /// Read stream / read-ahead configuration
    #[serde(default)]
    pub streams: StreamConfig,

    /// Encryption configuration
    #[serde(default)]
    pub encryption: EncryptionConfig,

    /// Handle lock configuration
    #[serde(default)]
    pub locking: LockConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Local cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Directory holding data, index and log files of open files
    pub cache_dir: PathBuf,

    /// Largest logical file size accepted
    pub max_file_size: u64,

    /// Seconds after the last write before a modified file is handed to the uploader
    pub upload_delay_secs: u64,
}

/// Read stream configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamConfig {
    /// Number of concurrent sequential streams tracked per file
    pub streams_per_file: usize,

    /// Smallest read-ahead window in bytes
    pub min_readahead: u64,

    /// Largest read-ahead window in bytes
    pub max_readahead: u64,

    /// Fetch size used while a file is throttled
    pub throttled_fetch: u64,

    /// Seconds without access after which a stream counts as stalled
    pub stall_timeout_secs: u64,
}

/// Encryption configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EncryptionConfig {
    /// Argon2 memory cost in KiB
    pub argon2_memory_kib: u32,

    /// Argon2 time cost (iterations)
    pub argon2_iterations: u32,

    /// Argon2 parallelism
    pub argon2_parallelism: u32,

    /// Salt for key derivation (will be generated if not set)
    #[serde(with = "hex_serde")]
    pub salt: Vec<u8>,

    /// Pending log entries that trigger folding the log into the data file
    pub checkpoint_threshold: usize,

    /// Sectors zero-filled per step while extending an encrypted file
    pub extend_batch_sectors: u64,
}

/// Handle lock configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockConfig {
    /// Seconds a handle lock may be waited on before the process aborts
    pub timeout_secs: u64,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,

    /// Log file path
    pub file: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        let data_dir = dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("vfsync");

        Config {
            cache: CacheConfig {
                cache_dir: data_dir.join("cache"),
                max_file_size: 1 << 40,
                upload_delay_secs: 3,
            },
            streams: StreamConfig::default(),
            encryption: EncryptionConfig::default(),
            locking: LockConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Default for StreamConfig {
    fn default() -> Self {
        StreamConfig {
            streams_per_file: DEFAULT_STREAM_COUNT,
            min_readahead: DEFAULT_MIN_READAHEAD,
            max_readahead: DEFAULT_MAX_READAHEAD,
            throttled_fetch: DEFAULT_THROTTLED_FETCH,
            stall_timeout_secs: 5,
        }
    }
}

impl Default for EncryptionConfig {
    fn default() -> Self {
        EncryptionConfig {
            argon2_memory_kib: 65536, // 64 MiB
            argon2_iterations: 3,
            argon2_parallelism: 4,
            salt: Vec::new(),
            checkpoint_threshold: DEFAULT_CHECKPOINT_THRESHOLD,
            extend_batch_sectors: 16,
        }
    }
}

impl Default for LockConfig {
    fn default() -> Self {
        LockConfig {
            timeout_secs: DEFAULT_LOCK_TIMEOUT_SECS,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            level: "info".to_string(),
            file: None,
        }
    }
}

impl StreamConfig {
    pub fn stall_timeout(&self) -> Duration {
        Duration::from_secs(self.stall_timeout_secs)
    }
}

impl LockConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl CacheConfig {
    pub fn upload_delay(&self) -> Duration {
        Duration::from_secs(self.upload_delay_secs)
    }
}

impl Config {
    /// Load configuration from a file (YAML or JSON), with environment variable substitution
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path_ref = path.as_ref();
        let content = std::fs::read_to_string(path_ref)
            .map_err(|e| Error::Config(format!("Failed to read config file: {}", e)))?;

        let content = Self::substitute_env_vars(&content);

        let mut config: Config = if is_yaml(path_ref) {
            serde_yaml::from_str(&content)
                .map_err(|e| Error::Config(format!("Failed to parse YAML config: {}", e)))?
        } else {
            serde_json::from_str(&content)
                .map_err(|e| Error::Config(format!("Failed to parse JSON config: {}", e)))?
        };

        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Substitute environment variables in config content
    /// Supports ${VAR_NAME} syntax
    fn substitute_env_vars(content: &str) -> String {
        let mut result = content.to_string();

        let re = match regex::Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)\}") {
            Ok(re) => re,
            Err(_) => return result,
        };

        for cap in re.captures_iter(content) {
            let full_match = &cap[0];
            let var_name = &cap[1];

            if let Ok(value) = std::env::var(var_name) {
                result = result.replace(full_match, &value);
            }
        }

        result
    }

    /// Apply environment variable overrides to configuration
    pub fn apply_env_overrides(&mut self) {
        if let Ok(dir) = std::env::var("VFSYNC_CACHE_DIR") {
            let dir = dir.trim();
            if !dir.is_empty() {
                self.cache.cache_dir = PathBuf::from(dir);
            }
        }

        if let Ok(count) = std::env::var("VFSYNC_STREAMS_PER_FILE") {
            if let Ok(count) = count.trim().parse::<usize>() {
                self.streams.streams_per_file = count;
            }
        }

        if let Ok(secs) = std::env::var("VFSYNC_LOCK_TIMEOUT") {
            if let Ok(secs) = secs.trim().parse::<u64>() {
                self.locking.timeout_secs = secs;
            }
        }

        if let Ok(level) = std::env::var("VFSYNC_LOG") {
            let level = level.trim().to_string();
            if !level.is_empty() {
                self.logging.level = level;
            }
        }
    }

    /// Save configuration to a file (format determined by extension)
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path_ref = path.as_ref();

        let content = if is_yaml(path_ref) {
            serde_yaml::to_string(self)
                .map_err(|e| Error::Config(format!("Failed to serialize config to YAML: {}", e)))?
        } else {
            serde_json::to_string_pretty(self)
                .map_err(|e| Error::Config(format!("Failed to serialize config to JSON: {}", e)))?
        };

        std::fs::write(path_ref, content)
            .map_err(|e| Error::Config(format!("Failed to write config file: {}", e)))?;

        Ok(())
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.streams.streams_per_file == 0 {
            return Err(Error::InvalidConfig(
                "At least one stream per file is required".to_string(),
            ));
        }

        if self.streams.min_readahead == 0 {
            return Err(Error::InvalidConfig(
                "Read-ahead window must be greater than 0".to_string(),
            ));
        }

        if self.streams.min_readahead > self.streams.max_readahead {
            return Err(Error::InvalidConfig(format!(
                "min_readahead ({}) exceeds max_readahead ({})",
                self.streams.min_readahead, self.streams.max_readahead
            )));
        }

        if self.encryption.checkpoint_threshold == 0 {
            return Err(Error::InvalidConfig(
                "checkpoint_threshold must be greater than 0".to_string(),
            ));
        }

        if self.encryption.extend_batch_sectors == 0 {
            return Err(Error::InvalidConfig(
                "extend_batch_sectors must be greater than 0".to_string(),
            ));
        }

        if self.locking.timeout_secs == 0 {
            return Err(Error::InvalidConfig(
                "Lock timeout must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }

    /// Ensure all required directories exist
    pub fn ensure_directories(&self) -> Result<()> {
        std::fs::create_dir_all(&self.cache.cache_dir)?;
        Ok(())
    }

    /// Configuration rooted at an explicit cache directory (tests and tools)
    pub fn with_cache_dir<P: Into<PathBuf>>(cache_dir: P) -> Self {
        let mut config = Config::default();
        config.cache.cache_dir = cache_dir.into();
        config
    }
}

fn is_yaml(path: &Path) -> bool {
    matches!(
        path.extension().and_then(|s| s.to_str()),
        Some("yaml") | Some("yml")
    )
}

/// Hex serialization for byte arrays
mod hex_serde {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        if s.is_empty() {
            return Ok(Vec::new());
        }
        hex::decode(&s).map_err(serde::de::Error::custom)
    }
}
