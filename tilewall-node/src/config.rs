//! Deployment configuration for one wall process.

use std::path::Path;

use serde::{Deserialize, Serialize};
use tilewall_core::{BridgeConfig, NetConfig, NodeConfig, SyncConfig};

/// What this process runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// Allocates nodes to producers and relays their streams.
    Bridge,
    /// Receives streams for the tiles of one display host.
    #[default]
    Display,
    /// Frame synchronization coordinator.
    Sync,
}

/// Top-level configuration loaded from a TOML (or JSON) file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WallConfig {
    pub role: Role,
    /// Socket settings shared by every role.
    pub network: NetConfig,
    pub bridge: BridgeConfig,
    pub display: NodeConfig,
    pub sync: SyncConfig,
    pub logging: LoggingConfig,
}

/// Logging settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level: "trace", "debug", "info", "warn", "error".
    /// `RUST_LOG` overrides it.
    pub level: String,
}

// ── Defaults ─────────────────────────────────────────────────────

impl Default for WallConfig {
    fn default() -> Self {
        Self {
            role: Role::default(),
            network: NetConfig::default(),
            bridge: BridgeConfig::default(),
            display: NodeConfig::default(),
            sync: SyncConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
        }
    }
}

// ── Loading ──────────────────────────────────────────────────────

impl WallConfig {
    /// Load configuration from `path`, falling back to defaults when
    /// the file is missing or invalid. Files ending in `.json` are read
    /// as JSON, everything else as TOML.
    pub fn load(path: &Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(contents) => Self::parse(path, &contents).unwrap_or_else(|e| {
                tracing::warn!("invalid config {}: {e}; using defaults", path.display());
                Self::default()
            }),
            Err(_) => {
                tracing::info!("no config at {}; using defaults", path.display());
                Self::default()
            }
        }
    }

    fn parse(path: &Path, contents: &str) -> Result<Self, Box<dyn std::error::Error>> {
        if path.extension().is_some_and(|e| e == "json") {
            Ok(serde_json::from_str(contents)?)
        } else {
            Ok(toml::from_str(contents)?)
        }
    }

    /// Write the default configuration to a file (for bootstrapping).
    pub fn write_default(path: &Path) -> std::io::Result<()> {
        let text = toml::to_string_pretty(&Self::default()).map_err(std::io::Error::other)?;
        std::fs::write(path, text)
    }
}

// ── Tests ────────────────────────────────────────────────────────
