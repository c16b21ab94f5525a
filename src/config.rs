//! Node configuration.
//!
//! Loaded from a JSON file; every field has a default so an empty file (or
//! no file at all) yields a working node.

use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::assets::forward::DEFAULT_THROTTLE_BUMP_MS;
use crate::assets::records::DEFAULT_MAX_RECORDS;

/// Errors related to configuration loading.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config file: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Top-level node configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NodeConfig {
    /// This node's id in the mesh.
    #[serde(default)]
    pub stone_id: u8,

    #[serde(default)]
    pub microapp: MicroappConfig,

    #[serde(default)]
    pub filtering: FilteringConfig,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            stone_id: 0,
            microapp: MicroappConfig::default(),
            filtering: FilteringConfig::default(),
        }
    }
}

impl NodeConfig {
    /// Load configuration from a JSON file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&contents)?)
    }
}

/// Microapp hosting configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MicroappConfig {
    /// Whether the microapp slot may be started at boot.
    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl Default for MicroappConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

/// Asset filtering configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FilteringConfig {
    /// Throttling granted per forwarded asset message, in milliseconds.
    #[serde(default = "default_throttle_bump_ms")]
    pub throttle_bump_ms: u16,

    /// Capacity of the asset record store.
    #[serde(default = "default_max_records")]
    pub max_asset_records: usize,
}

impl Default for FilteringConfig {
    fn default() -> Self {
        Self {
            throttle_bump_ms: default_throttle_bump_ms(),
            max_asset_records: default_max_records(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_throttle_bump_ms() -> u16 {
    DEFAULT_THROTTLE_BUMP_MS
}

fn default_max_records() -> usize {
    DEFAULT_MAX_RECORDS
}
