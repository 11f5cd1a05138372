//! Transfer tuning knobs.
//!
//! Everything has a default; a TOML file may override any subset:
//!
//! ```toml
//! page_size = 200
//! chunk_size = 4194304
//! slow_consumer_after = "30s"
//! interface = "wlan0"
//! ```

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::network::Bind;
use crate::protocol::MAX_FILE_CONTENT_LEN;

/// Units allowed on the wire without a write completion. Not configurable.
pub const IN_FLIGHT_UNITS: usize = 1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferConfig {
    /// Records per keyset page
    pub page_size: usize,
    /// Bytes per file chunk
    pub chunk_size: usize,
    /// Permit wait after which a slow consumer is reported
    #[serde(with = "human_duration")]
    pub slow_consumer_after: Duration,
    /// Receiver reports progress after this many consumed items
    pub progress_every: u64,
    /// Interface to bind or dial from. None = first wireless interface.
    pub interface: Option<String>,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            page_size: 100,
            chunk_size: 10 * 1024 * 1024,
            slow_consumer_after: Duration::from_secs(10),
            progress_every: 100,
            interface: None,
        }
    }
}

impl TransferConfig {
    /// Read and validate a TOML config file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.display().to_string(),
            source: e,
        })?;
        let config: TransferConfig = toml::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.page_size == 0 {
            return Err(ConfigError::Invalid("page_size must be at least 1".into()));
        }
        if self.chunk_size == 0 {
            return Err(ConfigError::Invalid("chunk_size must be at least 1".into()));
        }
        if self.chunk_size as u64 > MAX_FILE_CONTENT_LEN {
            return Err(ConfigError::Invalid(format!(
                "chunk_size {} exceeds the largest file frame",
                self.chunk_size
            )));
        }
        if self.progress_every == 0 {
            return Err(ConfigError::Invalid(
                "progress_every must be at least 1".into(),
            ));
        }
        Ok(())
    }

    /// Interface policy derived from `interface`
    pub fn bind(&self) -> Bind {
        match &self.interface {
            Some(name) => Bind::Interface(name.clone()),
            None => Bind::Wireless,
        }
    }
}

mod human_duration {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&humantime::format_duration(*value).to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let text = String::deserialize(deserializer)?;
        humantime::parse_duration(&text).map_err(serde::de::Error::custom)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_defaults() {
        let config = TransferConfig::default();
        assert_eq!(config.page_size, 100);
        assert_eq!(config.chunk_size, 10 * 1024 * 1024);
        assert_eq!(config.slow_consumer_after, Duration::from_secs(10));
        assert_eq!(config.bind(), Bind::Wireless);
        config.validate().unwrap();
    }

    #[test]
    fn test_partial_file() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "page_size = 10").unwrap();
        writeln!(file, "slow_consumer_after = \"1m 30s\"").unwrap();
        writeln!(file, "interface = \"wlan1\"").unwrap();

        let config = TransferConfig::load(file.path()).unwrap();
        assert_eq!(config.page_size, 10);
        assert_eq!(config.slow_consumer_after, Duration::from_secs(90));
        assert_eq!(config.chunk_size, TransferConfig::default().chunk_size);
        assert_eq!(config.bind(), Bind::Interface("wlan1".to_string()));
    }

    #[test]
    fn test_rejects_zero_page_size() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "page_size = 0").unwrap();
        assert!(matches!(
            TransferConfig::load(file.path()),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn test_bad_duration() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "slow_consumer_after = \"soon\"").unwrap();
        assert!(matches!(
            TransferConfig::load(file.path()),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn test_serialize_round_trip() {
        let config = TransferConfig {
            progress_every: 7,
            ..TransferConfig::default()
        };
        let text = toml::to_string(&config).unwrap();
        assert!(text.contains("slow_consumer_after = \"10s\""));
        assert_eq!(toml::from_str::<TransferConfig>(&text).unwrap(), config);
    }
}
