//! Configuration for the GIP host stack.
//!
//! Resolution order: environment variables → config file → defaults.
//!
//! Config file location:
//!   1. $GIP_CONFIG (explicit override)
//!   2. $XDG_CONFIG_HOME/gip/config.toml
//!   3. ~/.config/gip/config.toml

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GipConfig {
    pub audio: AudioSettings,
    pub pairing: PairingSettings,
    pub power: PowerSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioSettings {
    /// GIP packets per 8 ms audio interval. Must be ≥ 1.
    pub packet_count: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PairingSettings {
    /// Seconds before pairing mode switches itself off.
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PowerSettings {
    /// Seconds to wait for all wireless clients to depart on power-off.
    pub off_wait_secs: u64,
}

// ── Defaults ──────────────────────────────────────────────────────────────────

impl Default for GipConfig {
    fn default() -> Self {
        Self {
            audio: AudioSettings::default(),
            pairing: PairingSettings::default(),
            power: PowerSettings::default(),
        }
    }
}

impl Default for AudioSettings {
    fn default() -> Self {
        Self { packet_count: 8 }
    }
}

impl Default for PairingSettings {
    fn default() -> Self {
        Self { timeout_secs: 30 }
    }
}

impl Default for PowerSettings {
    fn default() -> Self {
        Self { off_wait_secs: 5 }
    }
}

// ── Path helpers ──────────────────────────────────────────────────────────────

fn config_dir() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            std::env::var("HOME")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("/tmp"))
                .join(".config")
        })
        .join("gip")
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {0}: {1}")]
    ReadFailed(PathBuf, std::io::Error),
    #[error("failed to parse {0}: {1}")]
    ParseFailed(PathBuf, toml::de::Error),
}

// ── Loading ───────────────────────────────────────────────────────────────────

impl GipConfig {
    /// Load config: env vars → file → defaults.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::file_path();
        let mut config = if path.exists() {
            let text = std::fs::read_to_string(&path)
                .map_err(|e| ConfigError::ReadFailed(path.clone(), e))?;
            toml::from_str(&text).map_err(|e| ConfigError::ParseFailed(path.clone(), e))?
        } else {
            GipConfig::default()
        };
        config.apply_env_overrides();
        Ok(config)
    }

    /// Config file path.
    pub fn file_path() -> PathBuf {
        std::env::var("GIP_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| config_dir().join("config.toml"))
    }

    /// Apply GIP_* env var overrides.
    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("GIP_AUDIO__PACKET_COUNT") {
            if let Ok(n) = v.parse::<usize>() {
                if n >= 1 {
                    self.audio.packet_count = n;
                }
            }
        }
        if let Ok(v) = std::env::var("GIP_PAIRING__TIMEOUT_SECS") {
            if let Ok(n) = v.parse() {
                self.pairing.timeout_secs = n;
            }
        }
        if let Ok(v) = std::env::var("GIP_POWER__OFF_WAIT_SECS") {
            if let Ok(n) = v.parse() {
                self.power.off_wait_secs = n;
            }
        }
    }
}
