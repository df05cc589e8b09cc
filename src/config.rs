//! # Configuration Management
//!
//! Centralized configuration for the lobby protocol library.
//!
//! This module provides structured configuration for the lobby client,
//! including connection parameters, timeouts, the client version identity
//! reported during login, and session retry policy.
//!
//! ## Configuration Sources
//! - TOML files via `from_file()`
//! - Direct instantiation with defaults

use crate::error::{ProtocolError, Result};
use crate::protocol::session::{FileReport, VersionInfo};
use crate::utils::timeout;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::time::Duration;

/// Main configuration structure that contains all configurable settings
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct LobbyConfig {
    /// Client connection configuration
    #[serde(default)]
    pub client: ClientConfig,

    /// Client version identity reported to the server
    #[serde(default)]
    pub version: VersionConfig,

    /// Session retry policy
    #[serde(default)]
    pub retry: RetryConfig,
}

impl LobbyConfig {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut file = File::open(path)
            .map_err(|e| ProtocolError::ConfigError(format!("Failed to open config file: {e}")))?;

        let mut contents = String::new();
        file.read_to_string(&mut contents)
            .map_err(|e| ProtocolError::ConfigError(format!("Failed to read config file: {e}")))?;

        Self::from_toml(&contents)
    }

    /// Load configuration from TOML string
    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str::<Self>(content)
            .map_err(|e| ProtocolError::ConfigError(format!("Failed to parse TOML: {e}")))
    }

    /// Apply overrides to the default configuration
    pub fn default_with_overrides<F>(mutator: F) -> Self
    where
        F: FnOnce(&mut Self),
    {
        let mut config = Self::default();
        mutator(&mut config);
        config
    }

    /// Validate the configuration for common issues and misconfigurations
    ///
    /// Returns a list of validation errors. Empty list means configuration is valid.
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        errors.extend(self.client.validate());
        errors.extend(self.version.validate());
        errors
    }

    /// Validate and return Result - convenience method
    pub fn validate_strict(&self) -> Result<()> {
        let errors = self.validate();
        if errors.is_empty() {
            Ok(())
        } else {
            Err(ProtocolError::ConfigError(format!(
                "Configuration validation failed:\n  - {}",
                errors.join("\n  - ")
            )))
        }
    }
}

/// Client connection configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ClientConfig {
    /// Lobby server address (e.g., "neolobby01.ffxiv.com:54994")
    pub address: String,

    /// Timeout for connection attempts
    #[serde(with = "duration_serde")]
    pub connection_timeout: Duration,

    /// Interval for sending keepalive pings
    #[serde(with = "duration_serde")]
    pub keepalive_interval: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            address: String::from("127.0.0.1:54994"),
            connection_timeout: timeout::DEFAULT_TIMEOUT,
            keepalive_interval: timeout::KEEPALIVE_INTERVAL,
        }
    }
}

impl ClientConfig {
    /// Validate client configuration
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.address.is_empty() {
            errors.push("Client address cannot be empty".to_string());
        } else if !self.address.contains(':') {
            errors.push(format!(
                "Invalid client address format: '{}' (expected format: 'host:port')",
                self.address
            ));
        }

        if self.connection_timeout.as_millis() < 100 {
            errors.push("Connection timeout too short (minimum: 100ms)".to_string());
        } else if self.connection_timeout.as_secs() > 300 {
            errors.push("Connection timeout too long (maximum: 300s)".to_string());
        }

        if self.keepalive_interval.as_millis() < 100 {
            errors.push("Keepalive interval too short (minimum: 100ms)".to_string());
        } else if self.keepalive_interval.as_secs() > 60 {
            errors.push("Keepalive interval too long (maximum: 60s)".to_string());
        }

        errors
    }
}

/// Client version identity reported to the server during login
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct VersionConfig {
    /// Handshake phrase for cipher key derivation (32 ASCII bytes)
    pub cipher_phrase: String,

    /// Protocol version mixed into cipher key derivation
    pub cipher_version: u32,

    /// Login protocol version stamped into the credential exchange
    pub login_version: u16,

    /// Name of the game executable reported to the server
    pub game_exe_name: String,

    /// Size in bytes of the game executable
    pub game_exe_size: u64,

    /// Lowercase hex SHA-1 of the game executable
    pub game_exe_sha1: String,

    /// Expansion version strings, oldest first
    pub ex_versions: Vec<String>,
}

impl Default for VersionConfig {
    fn default() -> Self {
        Self {
            cipher_phrase: "0".repeat(32),
            cipher_version: 7000,
            login_version: 7000,
            game_exe_name: String::from("ffxiv_dx11.exe"),
            game_exe_size: 0,
            game_exe_sha1: String::new(),
            ex_versions: Vec::new(),
        }
    }
}

impl VersionConfig {
    /// Validate version configuration
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.cipher_phrase.len() != 32 || !self.cipher_phrase.is_ascii() {
            errors.push(format!(
                "Cipher phrase must be 32 ASCII bytes, got {} bytes",
                self.cipher_phrase.len()
            ));
        }

        if self.game_exe_name.is_empty() {
            errors.push("Game executable name cannot be empty".to_string());
        }

        if !self.game_exe_sha1.is_empty()
            && (self.game_exe_sha1.len() != 40
                || !self.game_exe_sha1.bytes().all(|b| b.is_ascii_hexdigit()))
        {
            errors.push(format!(
                "Game executable SHA-1 must be 40 hex characters, got '{}'",
                self.game_exe_sha1
            ));
        }

        errors
    }

    /// Build the version identity the handshake reports
    pub fn to_version_info(&self) -> VersionInfo {
        VersionInfo {
            cipher_phrase: self.cipher_phrase.clone(),
            cipher_version: self.cipher_version,
            login_version: self.login_version,
            game_exe: FileReport::new(
                self.game_exe_name.clone(),
                self.game_exe_size,
                self.game_exe_sha1.clone(),
            ),
            ex_versions: self.ex_versions.clone(),
        }
    }
}

/// Session retry policy
///
/// Some login rejections mean the cached session credentials have gone
/// stale and a fresh login through the external provider is needed rather
/// than a plain retry.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct RetryConfig {
    /// Login error codes that indicate a stale cached session
    #[serde(default)]
    pub stale_session_codes: Vec<u16>,
}

impl RetryConfig {
    /// Whether a login rejection with this code calls for refreshing the
    /// cached session instead of retrying with the same credentials.
    pub fn is_stale_session(&self, code: u16) -> bool {
        self.stale_session_codes.contains(&code)
    }
}

/// Helper module for Duration serialization/deserialization
mod duration_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let millis = duration.as_millis() as u64;
        millis.serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
