use crate::core::central::types::{ConnectOptions, ScanOptions};
use crate::core::diagnostics::DEFAULT_DIAGNOSTICS_CAPACITY;
use crate::utils::ensure_directory_exists;
use anyhow::Result;
use log::{error, info, warn, LevelFilter};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tokio::fs;

pub const CONFIG_FILE_NAME: &str = "bridge_config.json";

/// Options passed to the native stack when a manager is created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ManagerOptions {
    /// Create this manager at startup. Commands to a disabled manager fail.
    pub enabled: bool,
    /// Ask the system to warn the user when Bluetooth is powered off.
    pub show_power_alert: bool,
    /// Key under which the system preserves state across relaunches.
    /// Without one, no restoration events are delivered.
    pub restore_identifier: Option<String>,
}

impl Default for ManagerOptions {
    fn default() -> Self {
        Self {
            enabled: true,
            show_power_alert: false,
            restore_identifier: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    pub central: ManagerOptions,
    pub peripheral: ManagerOptions,
    /// Options used by scans started without explicit options.
    pub scan: ScanOptions,
    /// Options used by connects started without explicit options.
    pub connect: ConnectOptions,
    /// One of `off`, `error`, `warn`, `info`, `debug`, `trace`.
    pub log_level: String,
    /// Most recent diagnostic records kept in memory.
    pub diagnostics_capacity: usize,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        BridgeConfig {
            central: ManagerOptions::default(),
            peripheral: ManagerOptions::default(),
            scan: ScanOptions::default(),
            connect: ConnectOptions::default(),
            log_level: "info".to_string(),
            diagnostics_capacity: DEFAULT_DIAGNOSTICS_CAPACITY,
        }
    }
}

impl BridgeConfig {
    /// Loads the config from `path`, falling back to defaults when the file is missing.
    pub async fn load_config(path: &Path) -> Result<Self> {
        let file_path_str = path.to_string_lossy().into_owned();

        if !path.exists() {
            warn!(
                "Config file not found at {:?}, using default.",
                file_path_str
            );
            return Ok(Self::default());
        }

        let config_json = fs::read_to_string(path).await?;
        let config: Self = serde_json::from_str(&config_json)?;

        info!("Config loaded from {:?}", file_path_str);
        Ok(config)
    }

    /// Saves the config to `path`, creating its directory if needed.
    pub async fn save_config(&self, path: &Path) -> Result<()> {
        if let Some(config_dir) = path.parent().filter(|dir| !dir.as_os_str().is_empty()) {
            ensure_directory_exists(config_dir).await?;
        }
        let file_path_str = path.to_string_lossy().into_owned();

        let config_json = match serde_json::to_string_pretty(&self) {
            Ok(json) => json,
            Err(e) => {
                error!("Failed to serialize bridge config to JSON: {}", e);
                return Err(e.into());
            }
        };

        fs::write(path, config_json).await?;

        info!("Bridge config saved to {:?}.", file_path_str);
        Ok(())
    }

    /// Unrecognized levels fall back to `info`.
    pub fn level_filter(&self) -> LevelFilter {
        self.log_level.parse().unwrap_or_else(|_| {
            warn!("Unknown log level {:?}, using info.", self.log_level);
            LevelFilter::Info
        })
    }
}
