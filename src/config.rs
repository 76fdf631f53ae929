//! JSON configuration.
//!
//! ```json
//! {
//!   "transport": { "quiescence_interval_ms": 2000, "chunk_size": 128 },
//!   "sync": { "card_path": "/passwordvault/db.kdbx", "connect_retries": 2 },
//!   "vault": { "transform_rounds": 80000, "gzip": true }
//! }
//! ```
//!
//! Every field is optional and falls back to its default.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::crypto::{KdfParams, MIN_TRANSFORM_ROUNDS};
use crate::error::ConfigError;
use crate::format::Compression;
use crate::sync::{CARD_PATH, SyncSettings};
use crate::transport::{MAX_CHUNK_SIZE, MAX_PATH_LEN, TransportSettings};

/// Environment variable naming a config file.
pub const CONFIG_ENV: &str = "CARDVAULT_CONFIG";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub transport: TransportConfig,
    pub sync: SyncConfig,
    pub vault: VaultConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TransportConfig {
    pub connect_timeout_ms: u64,
    pub quiescence_interval_ms: u64,
    pub response_timeout_ms: u64,
    pub chunk_size: usize,
    pub chunk_delay_ms: u64,
}

impl Default for TransportConfig {
    fn default() -> Self {
        let d = TransportSettings::default();
        Self {
            connect_timeout_ms: d.connect_timeout.as_millis() as u64,
            quiescence_interval_ms: d.quiescence_interval.as_millis() as u64,
            response_timeout_ms: d.response_timeout.as_millis() as u64,
            chunk_size: d.chunk_size,
            chunk_delay_ms: d.chunk_delay.as_millis() as u64,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SyncConfig {
    pub card_path: String,
    pub connect_retries: u32,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            card_path: CARD_PATH.to_string(),
            connect_retries: 2,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct VaultConfig {
    pub transform_rounds: u64,
    pub gzip: bool,
}

impl Default for VaultConfig {
    fn default() -> Self {
        Self {
            transform_rounds: MIN_TRANSFORM_ROUNDS,
            gzip: true,
        }
    }
}

impl Config {
    /// Loads the configuration.
    ///
    /// An explicit path, then `CARDVAULT_CONFIG`, must name an existing file.
    /// Without either, `default` is read if present; otherwise the built-in
    /// defaults apply.
    pub fn load(explicit: Option<&Path>, default: Option<PathBuf>) -> Result<Self, ConfigError> {
        let from_env = std::env::var_os(CONFIG_ENV).map(PathBuf::from);

        let config = match explicit.map(Path::to_path_buf).or(from_env) {
            Some(path) => Self::from_file(&path)?,
            None => match default.filter(|p| p.exists()) {
                Some(path) => Self::from_file(&path)?,
                None => Self::default(),
            },
        };
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        debug!(path = %path.display(), "reading config");
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_json(&text)
    }

    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let t = &self.transport;
        if t.chunk_size == 0 || t.chunk_size > MAX_CHUNK_SIZE {
            return Err(ConfigError::Invalid(format!(
                "transport.chunk_size must be between 1 and {MAX_CHUNK_SIZE}"
            )));
        }
        if t.quiescence_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "transport.quiescence_interval_ms must be positive".into(),
            ));
        }
        if t.response_timeout_ms < t.quiescence_interval_ms {
            return Err(ConfigError::Invalid(
                "transport.response_timeout_ms is shorter than the quiescence interval".into(),
            ));
        }
        if self.sync.card_path.len() > MAX_PATH_LEN {
            return Err(ConfigError::Invalid(format!(
                "sync.card_path exceeds {MAX_PATH_LEN} bytes"
            )));
        }
        if self.vault.transform_rounds < MIN_TRANSFORM_ROUNDS {
            return Err(ConfigError::Invalid(format!(
                "vault.transform_rounds must be at least {MIN_TRANSFORM_ROUNDS}"
            )));
        }
        Ok(())
    }

    pub fn transport_settings(&self) -> TransportSettings {
        let t = &self.transport;
        TransportSettings {
            connect_timeout: Duration::from_millis(t.connect_timeout_ms),
            quiescence_interval: Duration::from_millis(t.quiescence_interval_ms),
            response_timeout: Duration::from_millis(t.response_timeout_ms),
            chunk_size: t.chunk_size,
            chunk_delay: Duration::from_millis(t.chunk_delay_ms),
        }
    }

    pub fn sync_settings(&self) -> SyncSettings {
        SyncSettings {
            card_path: self.sync.card_path.clone(),
            connect_retries: self.sync.connect_retries,
        }
    }

    pub fn kdf(&self) -> Result<KdfParams, ConfigError> {
        KdfParams::new(self.vault.transform_rounds).map_err(|e| ConfigError::Invalid(e.to_string()))
    }

    pub fn compression(&self) -> Compression {
        if self.vault.gzip {
            Compression::Gzip
        } else {
            Compression::None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn defaults_match_the_card_protocol() {
        let config = Config::default();
        config.validate().unwrap();

        assert_eq!(config.transport_settings(), TransportSettings::default());
        assert_eq!(config.sync_settings(), SyncSettings::default());
        assert_eq!(config.compression(), Compression::Gzip);
    }

    #[test]
    fn partial_json_keeps_other_defaults() {
        let config =
            Config::from_json(r#"{ "transport": { "quiescence_interval_ms": 50 } }"#).unwrap();

        assert_eq!(config.transport.quiescence_interval_ms, 50);
        assert_eq!(config.transport.chunk_size, 128);
        assert_eq!(config.sync.card_path, CARD_PATH);
    }

    #[test]
    fn unknown_fields_are_rejected() {
        assert!(matches!(
            Config::from_json(r#"{ "transport": { "mtu": 20 } }"#),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn validation_limits() {
        let mut config = Config::default();
        config.transport.chunk_size = 129;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.sync.card_path = format!("/{}", "x".repeat(30));
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.vault.transform_rounds = 6_000;
        assert!(config.validate().is_err());
    }

    #[test]
    fn explicit_path_must_exist() {
        let dir = tempdir().unwrap();
        let missing = dir.path().join("missing.json");
        assert!(matches!(
            Config::load(Some(&missing), None),
            Err(ConfigError::Read { .. })
        ));
    }

    #[test]
    fn missing_default_file_means_defaults() {
        let dir = tempdir().unwrap();
        let config = Config::load(None, Some(dir.path().join("config.json")));
        // CARDVAULT_CONFIG may be set by the surrounding environment
        if std::env::var_os(CONFIG_ENV).is_none() {
            assert_eq!(config.unwrap(), Config::default());
        }
    }

    #[test]
    fn explicit_file_is_read_and_validated() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.json");
        fs::write(&path, r#"{ "vault": { "transform_rounds": 100000, "gzip": false } }"#).unwrap();

        let config = Config::load(Some(&path), None).unwrap();
        assert_eq!(config.kdf().unwrap().transform_rounds(), 100_000);
        assert_eq!(config.compression(), Compression::None);

        fs::write(&path, r#"{ "transport": { "chunk_size": 0 } }"#).unwrap();
        assert!(matches!(
            Config::load(Some(&path), None),
            Err(ConfigError::Invalid(_))
        ));
    }
}
