// Configuration management for the meshwire CLI
//
// Cross-platform config stored in:
// - macOS: ~/Library/Application Support/meshwire/config.json
// - Linux: ~/.config/meshwire/config.json
// - Windows: %APPDATA%\meshwire\config.json

use anyhow::{Context, Result};
use meshwire_core::{EngineConfig, IdentityKeys};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Hex private key (64-byte seed || public key). Absent: a fresh key per run
    pub private_key: Option<String>,

    /// Engine and radio settings
    pub engine: EngineConfig,
}

impl Config {
    /// Default config file location (cross-platform)
    pub fn default_path() -> Result<PathBuf> {
        Ok(dirs::config_dir()
            .context("Failed to determine config directory")?
            .join("meshwire")
            .join("config.json"))
    }

    /// Load config from `path`; a missing file yields the defaults
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let config: Config =
            serde_json::from_str(&contents).context("Failed to parse config file")?;
        config
            .engine
            .validate()
            .context("Config file holds invalid engine settings")?;
        Ok(config)
    }

    /// Save config to `path`, creating the parent directory
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).context("Failed to create config directory")?;
        }
        let contents = serde_json::to_string_pretty(self).context("Failed to serialize config")?;
        std::fs::write(path, contents)
            .with_context(|| format!("Failed to write {}", path.display()))?;
        Ok(())
    }

    /// Keys from the stored private key, if any
    pub fn keys(&self) -> Result<Option<IdentityKeys>> {
        self.private_key
            .as_deref()
            .map(|hex| IdentityKeys::from_hex(hex).context("Stored private key is invalid"))
            .transpose()
    }

    /// Set a config value. The result is validated before it is accepted.
    pub fn set(&mut self, key: &str, value: &str) -> Result<()> {
        let mut next = self.clone();
        let engine = &mut next.engine;
        match key {
            "nickname" => engine.nickname = value.to_string(),
            "private_key" => {
                next.private_key = if value.is_empty() {
                    None
                } else {
                    IdentityKeys::from_hex(value).context("Invalid private key")?;
                    Some(value.to_string())
                };
            }
            "announce_interval_ms" => {
                engine.announce_interval_ms = value.parse().context("Invalid number")?
            }
            "stale_multiplier" => {
                engine.stale_multiplier = value.parse().context("Invalid number")?
            }
            "message_ttl" => engine.message_ttl = value.parse().context("Invalid TTL")?,
            "fragment_delay_ms" => {
                engine.fragment_delay_ms = value.parse().context("Invalid number")?
            }
            "reassembly_timeout_ms" => {
                engine.reassembly_timeout_ms = value.parse().context("Invalid number")?
            }
            "delivery_acks" => {
                engine.delivery_acks = value.parse().context("Invalid boolean value")?
            }
            "connect_timeout_ms" => {
                engine.ble.connect_timeout_ms = value.parse().context("Invalid number")?
            }
            "scan_timeout_ms" => {
                engine.ble.scan_timeout_ms = value.parse().context("Invalid number")?
            }
            "rescan_interval_ms" => {
                engine.ble.rescan_interval_ms = value.parse().context("Invalid number")?
            }
            _ => anyhow::bail!("Unknown config key: {}", key),
        }
        next.engine.validate().context("Rejected config value")?;
        *self = next;
        Ok(())
    }

    /// Get a config value
    pub fn get(&self, key: &str) -> Option<String> {
        self.list()
            .into_iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v)
    }

    /// List all config values
    pub fn list(&self) -> Vec<(String, String)> {
        let engine = &self.engine;
        let key_state = if self.private_key.is_some() {
            "(stored)".to_string()
        } else {
            "(ephemeral)".to_string()
        };
        vec![
            ("nickname".to_string(), engine.nickname.clone()),
            ("private_key".to_string(), key_state),
            ("announce_interval_ms".to_string(), engine.announce_interval_ms.to_string()),
            ("stale_multiplier".to_string(), engine.stale_multiplier.to_string()),
            ("message_ttl".to_string(), engine.message_ttl.to_string()),
            ("fragment_delay_ms".to_string(), engine.fragment_delay_ms.to_string()),
            ("reassembly_timeout_ms".to_string(), engine.reassembly_timeout_ms.to_string()),
            ("delivery_acks".to_string(), engine.delivery_acks.to_string()),
            ("connect_timeout_ms".to_string(), engine.ble.connect_timeout_ms.to_string()),
            ("scan_timeout_ms".to_string(), engine.ble.scan_timeout_ms.to_string()),
            ("rescan_interval_ms".to_string(), engine.ble.rescan_interval_ms.to_string()),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = tempdir().unwrap();
        let config = Config::load(&dir.path().join("config.json")).unwrap();
        assert_eq!(config, Config::default());
        assert!(config.keys().unwrap().is_none());
    }

    #[test]
    fn test_save_and_reload() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("config.json");

        let mut config = Config::default();
        config.set("nickname", "alice").unwrap();
        config.set("delivery_acks", "true").unwrap();
        config.set("message_ttl", "3").unwrap();
        config.save(&path).unwrap();

        let loaded = Config::load(&path).unwrap();
        assert_eq!(loaded, config);
        assert_eq!(loaded.get("nickname").as_deref(), Some("alice"));
        assert_eq!(loaded.get("delivery_acks").as_deref(), Some("true"));
    }

    #[test]
    fn test_private_key_roundtrip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.json");
        let keys = IdentityKeys::generate();

        let mut config = Config::default();
        config
            .set("private_key", &hex::encode(*keys.private_key_bytes()))
            .unwrap();
        config.save(&path).unwrap();

        let loaded = Config::load(&path).unwrap().keys().unwrap().unwrap();
        assert_eq!(loaded.public_key(), keys.public_key());
        assert_eq!(Config::load(&path).unwrap().get("private_key").as_deref(), Some("(stored)"));
    }

    #[test]
    fn test_rejects_bad_values() {
        let mut config = Config::default();
        assert!(config.set("message_ttl", "8").is_err());
        assert!(config.set("message_ttl", "seven").is_err());
        assert!(config.set("private_key", "abcd").is_err());
        assert!(config.set("no_such_key", "1").is_err());
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{"engine":{"nickname":"bob"}}"#).unwrap();

        let config = Config::load(&path).unwrap();
        assert_eq!(config.engine.nickname, "bob");
        assert_eq!(config.engine.announce_interval_ms, EngineConfig::default().announce_interval_ms);
    }

    #[test]
    fn test_corrupt_file_is_an_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, "{ not json").unwrap();
        assert!(Config::load(&path).is_err());
    }
}
