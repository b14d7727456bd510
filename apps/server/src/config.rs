//! Server configuration.
//!
//! Supports loading from YAML files with environment variable overrides.

use std::net::IpAddr;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;

/// Server configuration loaded from YAML with environment overrides.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// TCP port the hub listens on.
    /// Override: `GLYPHCAST_PORT`
    pub port: u16,

    /// IPv4 bind address; null disables the IPv4 listener.
    pub ipv4_bind: Option<IpAddr>,

    /// IPv6 bind address; null disables the IPv6 listener.
    pub ipv6_bind: Option<IpAddr>,

    /// Maximum simultaneously connected clients.
    /// Override: `GLYPHCAST_MAX_CLIENTS`
    pub max_clients: usize,

    /// Whether sessions negotiate encryption.
    pub encryption: bool,

    /// Explicit opt-in for running without encryption.
    pub allow_plaintext: bool,

    /// Path to the server's Ed25519 identity key; generated when missing.
    /// Override: `GLYPHCAST_IDENTITY_KEY`
    pub identity_key: Option<PathBuf>,

    /// Session password, mixed into the key schedule via Argon2id.
    /// Override: `GLYPHCAST_PASSWORD`
    pub password: Option<String>,

    /// Allow-listed client public keys (hex, 64 chars each).
    pub client_allowlist: Vec<String>,

    /// Use the Opus AUDIO profile instead of VOIP.
    pub opus_audio_profile: bool,

    /// Opus encoder bitrate in bits per second.
    pub opus_bitrate: i32,

    /// Route mixed audio through the ducking/compression stage.
    pub mixer: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: glyphcast_core::DEFAULT_PORT,
            ipv4_bind: Some(IpAddr::V4(std::net::Ipv4Addr::UNSPECIFIED)),
            ipv6_bind: None,
            max_clients: 32,
            encryption: true,
            allow_plaintext: false,
            identity_key: None,
            password: None,
            client_allowlist: Vec::new(),
            opus_audio_profile: false,
            opus_bitrate: 128_000,
            mixer: true,
        }
    }
}

impl ServerConfig {
    /// Loads configuration from a YAML file, then applies environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = if let Some(path) = path {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file: {}", path.display()))?;
            serde_yaml::from_str(&content)
                .with_context(|| format!("Failed to parse config file: {}", path.display()))?
        } else {
            Self::default()
        };

        config.apply_env_overrides();
        Ok(config)
    }

    /// Applies environment variable overrides to the configuration.
    fn apply_env_overrides(&mut self) {
        if let Ok(val) = std::env::var("GLYPHCAST_PORT") {
            if let Ok(port) = val.parse() {
                self.port = port;
            }
        }

        if let Ok(val) = std::env::var("GLYPHCAST_MAX_CLIENTS") {
            if let Ok(max) = val.parse() {
                self.max_clients = max;
            }
        }

        if let Ok(val) = std::env::var("GLYPHCAST_PASSWORD") {
            if !val.is_empty() {
                self.password = Some(val);
            }
        }

        // Note: GLYPHCAST_IDENTITY_KEY is handled by clap via #[arg(env = ...)]
    }

    /// Parses the hex allow-list entries into raw key bytes.
    pub fn parse_allowlist(&self) -> Result<Option<Vec<[u8; 32]>>> {
        if self.client_allowlist.is_empty() {
            return Ok(None);
        }
        let mut keys = Vec::with_capacity(self.client_allowlist.len());
        for entry in &self.client_allowlist {
            keys.push(parse_hex_key(entry).with_context(|| {
                format!("Invalid allow-list entry (expected 64 hex chars): {entry}")
            })?);
        }
        Ok(Some(keys))
    }

    /// Converts to glyphcast-core's HostConfig.
    pub fn to_host_config(&self) -> Result<glyphcast_core::HostConfig> {
        let mut config = glyphcast_core::HostConfig {
            port: self.port,
            ipv4_bind: self.ipv4_bind,
            ipv6_bind: self.ipv6_bind,
            encryption_enabled: self.encryption,
            allow_plaintext: self.allow_plaintext,
            identity_key_path: self.identity_key.clone(),
            password: self.password.clone(),
            client_allowlist: self.parse_allowlist()?,
            opus_audio_profile: self.opus_audio_profile,
            opus_bitrate: self.opus_bitrate,
            mixer_enabled: self.mixer,
            ..Default::default()
        };
        config.limits.max_clients = self.max_clients;
        Ok(config)
    }
}

fn parse_hex_key(hex: &str) -> Result<[u8; 32]> {
    anyhow::ensure!(hex.len() == 64, "expected 64 hex characters");
    let mut key = [0u8; 32];
    for (index, byte) in key.iter_mut().enumerate() {
        *byte = u8::from_str_radix(&hex[index * 2..index * 2 + 2], 16)
            .context("not valid hexadecimal")?;
    }
    Ok(key)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_converts() {
        let config = ServerConfig::default();
        let host = config.to_host_config().unwrap();
        assert_eq!(host.port, glyphcast_core::DEFAULT_PORT);
        assert!(host.validate().is_ok());
    }

    #[test]
    fn hex_allowlist_parses() {
        let mut config = ServerConfig::default();
        config.client_allowlist = vec!["ab".repeat(32)];
        let keys = config.parse_allowlist().unwrap().unwrap();
        assert_eq!(keys[0], [0xAB; 32]);
    }

    #[test]
    fn bad_allowlist_entry_is_an_error() {
        let mut config = ServerConfig::default();
        config.client_allowlist = vec!["zz".repeat(32)];
        assert!(config.parse_allowlist().is_err());
    }
}
