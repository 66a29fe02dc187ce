use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use serde::{Deserialize, Serialize};

use crate::client::{ClientOptions, FailurePolicy};
use crate::error::{Error, Result};
use crate::pool::PoolSettings;
use crate::transfer::DEFAULT_BLOCK_SIZE;

pub const DEFAULT_FTP_PORT: u16 = 21;

fn default_port() -> u16 {
    DEFAULT_FTP_PORT
}

/// Transfer and pool tuning
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(default)]
pub struct Settings {
    pub pool_size: usize,
    pub acquire_timeout_secs: u64,
    pub poll_interval_secs: u64,
    pub block_size: usize,
    pub suppress_upload_failures: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            pool_size: 6,
            acquire_timeout_secs: 30,
            poll_interval_secs: 3,
            block_size: DEFAULT_BLOCK_SIZE,
            suppress_upload_failures: false,
        }
    }
}

impl Settings {
    pub fn pool_settings(&self) -> PoolSettings {
        PoolSettings {
            poll_interval: Duration::from_secs(self.poll_interval_secs),
            acquire_timeout: Duration::from_secs(self.acquire_timeout_secs),
        }
    }

    pub fn client_options(&self) -> ClientOptions {
        ClientOptions {
            block_size: self.block_size.max(1),
            upload_failures: if self.suppress_upload_failures {
                FailurePolicy::Suppress
            } else {
                FailurePolicy::Propagate
            },
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.pool_size == 0 {
            return Err(Error::Validation(
                "pool_size must be greater than 0".to_string(),
            ));
        }
        if self.block_size == 0 {
            return Err(Error::Validation(
                "block_size must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}

/// A named FTP server to connect to
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct ServerProfile {
    pub name: String,
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    pub username: String,
    #[serde(default)]
    pub password: String,
}

impl ServerProfile {
    pub fn new(name: String, host: String, port: u16, username: String, password: String) -> Self {
        Self {
            name,
            host,
            port,
            username,
            password,
        }
    }

    pub fn host_port(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Validates the connection parameters
    pub fn validate(&self) -> Result<()> {
        if self.host.trim().is_empty() {
            return Err(Error::Validation("Host cannot be empty".to_string()));
        }

        if self.port == 0 {
            return Err(Error::Validation(
                "Port must be greater than 0".to_string(),
            ));
        }

        if self.username.trim().is_empty() {
            return Err(Error::Validation(
                "Username cannot be empty".to_string(),
            ));
        }

        Ok(())
    }
}

/// Main configuration structure
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
#[serde(default)]
pub struct Config {
    pub profiles: Vec<ServerProfile>,
    pub settings: Settings,
}

/// Loads, edits and persists the TOML configuration file
pub struct ConfigManager {
    config_path: PathBuf,
    config: Config,
}

impl ConfigManager {
    /// Open the configuration at the default location
    pub fn new() -> Result<Self> {
        let config_path = Self::get_config_path()?;
        Self::with_path(config_path)
    }

    /// Open the configuration at a custom path
    pub fn with_path<P: AsRef<Path>>(config_path: P) -> Result<Self> {
        let config_path = config_path.as_ref().to_path_buf();
        let config = Self::load_config_from_path(&config_path)?;

        Ok(Self {
            config_path,
            config,
        })
    }

    fn get_config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| Error::Config("Could not determine config directory".to_string()))?
            .join("ftptree");

        Ok(config_dir.join("config.toml"))
    }

    fn load_config_from_path(config_path: &Path) -> Result<Config> {
        if !config_path.exists() {
            return Ok(Config::default());
        }

        let config_content = fs::read_to_string(config_path)
            .map_err(|e| Error::Config(format!("Failed to read config file: {}", e)))?;

        let config: Config = toml::from_str(&config_content)
            .map_err(|e| Error::Config(format!("Failed to parse config file: {}", e)))?;
        config.settings.validate()?;

        Ok(config)
    }

    /// Persist current config to disk
    pub fn save(&self) -> Result<()> {
        if let Some(parent) = self.config_path.parent() {
            fs::create_dir_all(parent).map_err(|e| {
                Error::Config(format!("Failed to create config directory: {}", e))
            })?;
        }
        let toml = toml::to_string_pretty(&self.config)
            .map_err(|e| Error::Config(format!("Failed to serialize config: {}", e)))?;
        fs::write(&self.config_path, toml)
            .map_err(|e| Error::Config(format!("Failed to write config: {}", e)))?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.config_path
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn settings(&self) -> &Settings {
        &self.config.settings
    }

    pub fn profiles(&self) -> &[ServerProfile] {
        &self.config.profiles
    }

    pub fn profile(&self, name: &str) -> Option<&ServerProfile> {
        self.config.profiles.iter().find(|p| p.name == name)
    }

    /// Add or replace a profile by name and persist it
    pub fn add_profile(&mut self, profile: ServerProfile) -> Result<()> {
        profile.validate()?;

        match self
            .config
            .profiles
            .iter_mut()
            .find(|p| p.name == profile.name)
        {
            Some(existing) => *existing = profile,
            None => self.config.profiles.push(profile),
        }
        self.save()
    }

    /// Remove a profile by name and persist the change
    pub fn remove_profile(&mut self, name: &str) -> Result<()> {
        let initial_len = self.config.profiles.len();
        self.config.profiles.retain(|p| p.name != name);

        if self.config.profiles.len() == initial_len {
            return Err(Error::Config(format!("Profile not found: {name}")));
        }
        self.save()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn profile(name: &str) -> ServerProfile {
        ServerProfile::new(
            name.to_string(),
            "ftp.example.com".to_string(),
            21,
            "anonymous".to_string(),
            "guest".to_string(),
        )
    }

    #[test]
    fn test_serialize_deserialize_profile() {
        let profile = profile("mirror");
        let serialized = toml::to_string(&profile).unwrap();

        let deserialized: ServerProfile = toml::from_str(&serialized).unwrap();
        assert_eq!(profile, deserialized);
    }

    #[test]
    fn test_missing_fields_use_defaults() {
        let config: Config = toml::from_str(
            r#"
            [[profiles]]
            name = "box"
            host = "10.0.0.2"
            username = "me"

            [settings]
            pool_size = 2
            "#,
        )
        .unwrap();

        assert_eq!(config.profiles[0].port, 21);
        assert_eq!(config.profiles[0].password, "");
        assert_eq!(config.settings.pool_size, 2);
        assert_eq!(config.settings.block_size, 8192);
        assert_eq!(
            config.settings.pool_settings(),
            PoolSettings {
                poll_interval: Duration::from_secs(3),
                acquire_timeout: Duration::from_secs(30),
            }
        );
    }

    #[test]
    fn test_missing_file_gives_default_config() {
        let dir = tempfile::tempdir().unwrap();
        let manager = ConfigManager::with_path(dir.path().join("config.toml")).unwrap();
        assert_eq!(manager.config(), &Config::default());
    }

    #[test]
    fn test_add_and_remove_profile_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");
        let mut manager = ConfigManager::with_path(&path).unwrap();

        manager.add_profile(profile("a")).unwrap();
        manager.add_profile(profile("b")).unwrap();
        let mut replaced = profile("a");
        replaced.port = 2121;
        manager.add_profile(replaced).unwrap();

        let reloaded = ConfigManager::with_path(&path).unwrap();
        assert_eq!(reloaded.profiles().len(), 2);
        assert_eq!(reloaded.profile("a").map(|p| p.port), Some(2121));

        manager.remove_profile("b").unwrap();
        assert!(manager.remove_profile("b").is_err());
        let reloaded = ConfigManager::with_path(&path).unwrap();
        assert!(reloaded.profile("b").is_none());
    }

    #[test]
    fn test_invalid_profile_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut manager = ConfigManager::with_path(dir.path().join("c.toml")).unwrap();
        let mut bad = profile("bad");
        bad.host = " ".to_string();
        assert!(matches!(
            manager.add_profile(bad),
            Err(Error::Validation(_))
        ));
    }

    #[test]
    fn test_client_options_follow_settings() {
        let settings = Settings {
            suppress_upload_failures: true,
            ..Settings::default()
        };
        assert_eq!(
            settings.client_options().upload_failures,
            FailurePolicy::Suppress
        );
        assert!(Settings { pool_size: 0, ..Settings::default() }.validate().is_err());
    }
}
