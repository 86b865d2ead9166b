//! Configuration system for Swarmcast.
//!
//! Resolution order: environment variables → config file → defaults.
//!
//! Config file location:
//!   1. $SWARMCAST_CONFIG (explicit override)
//!   2. $XDG_CONFIG_HOME/swarmcast/config.toml
//!   3. ~/.config/swarmcast/config.toml

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::wire::DEFAULT_MAX_FRAME_BYTES;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SwarmcastConfig {
    pub actor: ActorConfig,
    pub wire: WireConfig,
    pub throttle: ThrottleSettings,
    pub repair: RepairConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ActorConfig {
    /// Bound of every actor mailbox.
    pub mailbox_capacity: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WireConfig {
    /// Largest frame body accepted or produced, in bytes.
    pub max_frame_bytes: u32,
}

/// Optional byte-rate caps applied to every peer connection of a node.
/// Absent = unthrottled in that direction.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ThrottleSettings {
    pub read: Option<BucketSettings>,
    pub write: Option<BucketSettings>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BucketSettings {
    /// Burst size in bytes.
    pub capacity: u64,
    /// Refill rate in bytes per second.
    pub rate: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RepairConfig {
    pub strategy: RepairStrategy,
    /// Redistribution rounds before a publish gives up on failed shards.
    pub max_rounds: u32,
}

/// What a fan-out does when some, but not all, peers fail.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RepairStrategy {
    /// Keep the degraded replication and report it.
    Accept,
    /// Surface the failure to the caller as an error.
    Fail,
    /// Resend failed shards to surviving peers.
    #[default]
    Redistribute,
}

impl std::str::FromStr for RepairStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "accept" => Ok(RepairStrategy::Accept),
            "fail" => Ok(RepairStrategy::Fail),
            "redistribute" => Ok(RepairStrategy::Redistribute),
            other => Err(format!("unknown repair strategy: {other}")),
        }
    }
}

// ── Defaults ──────────────────────────────────────────────────────────────────

impl Default for ActorConfig {
    fn default() -> Self {
        Self {
            mailbox_capacity: 64,
        }
    }
}

impl Default for WireConfig {
    fn default() -> Self {
        Self {
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
        }
    }
}

impl Default for RepairConfig {
    fn default() -> Self {
        Self {
            strategy: RepairStrategy::Redistribute,
            max_rounds: 2,
        }
    }
}

// ── Path helpers ──────────────────────────────────────────────────────────────

fn config_dir() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_or_home().join(".config"))
        .join("swarmcast")
}

fn dirs_or_home() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {0}: {1}")]
    ReadFailed(PathBuf, std::io::Error),
    #[error("failed to parse {0}: {1}")]
    ParseFailed(PathBuf, toml::de::Error),
    #[error("failed to write {0}: {1}")]
    WriteFailed(PathBuf, std::io::Error),
    #[error("failed to serialize: {0}")]
    SerializeFailed(toml::ser::Error),
    #[error("invalid value for {0}: {1}")]
    InvalidValue(&'static str, String),
}

// ── Loading ───────────────────────────────────────────────────────────────────

impl SwarmcastConfig {
    /// Load config: env vars → file → defaults.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::file_path();
        let mut config = if path.exists() {
            let text = std::fs::read_to_string(&path)
                .map_err(|e| ConfigError::ReadFailed(path.clone(), e))?;
            Self::from_toml(&text).map_err(|e| ConfigError::ParseFailed(path.clone(), e))?
        } else {
            SwarmcastConfig::default()
        };
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml(text: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(text)
    }

    /// Config file path.
    pub fn file_path() -> PathBuf {
        std::env::var("SWARMCAST_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| config_dir().join("config.toml"))
    }

    /// Write default config if none exists. Returns the path.
    pub fn write_default_if_missing() -> Result<PathBuf, ConfigError> {
        let path = Self::file_path();
        if !path.exists() {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
            }
            let text = toml::to_string_pretty(&SwarmcastConfig::default())
                .map_err(ConfigError::SerializeFailed)?;
            std::fs::write(&path, text).map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
        }
        Ok(path)
    }

    /// Reject values the actors cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.actor.mailbox_capacity == 0 {
            return Err(ConfigError::InvalidValue(
                "actor.mailbox_capacity",
                "must be at least 1".into(),
            ));
        }
        let buckets = [
            ("throttle.read", self.throttle.read),
            ("throttle.write", self.throttle.write),
        ];
        for (name, bucket) in buckets {
            if let Some(b) = bucket {
                if b.capacity == 0 || b.rate == 0 {
                    return Err(ConfigError::InvalidValue(
                        name,
                        "capacity and rate must be non-zero".into(),
                    ));
                }
            }
        }
        Ok(())
    }

    /// Apply SWARMCAST_* env var overrides.
    fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    /// Apply overrides from any key lookup. Split out so tests need not
    /// touch the process environment.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("SWARMCAST_ACTOR__MAILBOX_CAPACITY") {
            self.actor.mailbox_capacity = v
                .parse()
                .map_err(|_| ConfigError::InvalidValue("actor.mailbox_capacity", v))?;
        }
        if let Some(v) = lookup("SWARMCAST_WIRE__MAX_FRAME_BYTES") {
            self.wire.max_frame_bytes = v
                .parse()
                .map_err(|_| ConfigError::InvalidValue("wire.max_frame_bytes", v))?;
        }
        if let Some(v) = lookup("SWARMCAST_REPAIR__STRATEGY") {
            self.repair.strategy = v
                .parse()
                .map_err(|e| ConfigError::InvalidValue("repair.strategy", e))?;
        }
        if let Some(v) = lookup("SWARMCAST_THROTTLE__READ_RATE") {
            self.throttle.read = parse_rate(&v, self.throttle.read, "throttle.read")?;
        }
        if let Some(v) = lookup("SWARMCAST_THROTTLE__WRITE_RATE") {
            self.throttle.write = parse_rate(&v, self.throttle.write, "throttle.write")?;
        }
        Ok(())
    }
}

/// `0` or `off` disables the bucket; any other number sets the rate and,
/// when no bucket was configured, a one-second burst.
fn parse_rate(
    value: &str,
    current: Option<BucketSettings>,
    name: &'static str,
) -> Result<Option<BucketSettings>, ConfigError> {
    if value == "off" || value == "0" {
        return Ok(None);
    }
    let rate: u64 = value
        .parse()
        .map_err(|_| ConfigError::InvalidValue(name, value.to_string()))?;
    Ok(Some(match current {
        Some(b) => BucketSettings { rate, ..b },
        None => BucketSettings {
            capacity: rate,
            rate,
        },
    }))
}
