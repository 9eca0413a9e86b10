use std::path::Path;
use std::time::Duration;

use anyhow::Result;
use log::{error, info, warn};
use serde::{Deserialize, Serialize};
use tokio::fs;

use crate::core::bluetooth::{
    DEFAULT_CONNECT_TIMEOUT_SECS, DEFAULT_MTU, DEFAULT_REQUEST_TIMEOUT_SECS,
    DEFAULT_TICK_INTERVAL_MS, Error, MAX_MTU,
};
use crate::utils::create_config_dir;

const CONFIG_FILE_NAME: &str = "central_config.json";

/// Tunables of a [`Central`](crate::core::bluetooth::Central)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CentralConfig {
    /// Timeout of RSSI and characteristic requests, in seconds
    pub request_timeout_secs: u64,

    /// Timeout of connect requests, 0 waits forever
    pub connect_timeout_secs: u64,

    /// MTU requested once a peripheral connects
    pub max_mtu: u16,

    /// Retries of a connect failing with a transient status.
    /// `None` keeps retrying until the connect request times out.
    pub max_connect_retries: Option<u32>,

    /// Lets the native layer connect whenever the peripheral becomes available
    pub auto_connect: bool,

    /// Interval between two drains of the execution queue
    pub tick_interval_ms: u64,
}

impl Default for CentralConfig {
    fn default() -> Self {
        CentralConfig {
            request_timeout_secs: DEFAULT_REQUEST_TIMEOUT_SECS,
            connect_timeout_secs: DEFAULT_CONNECT_TIMEOUT_SECS,
            max_mtu: MAX_MTU,
            max_connect_retries: None,
            auto_connect: false,
            tick_interval_ms: DEFAULT_TICK_INTERVAL_MS,
        }
    }
}

impl CentralConfig {
    pub fn validate(&self) -> Result<(), Error> {
        if self.max_mtu < DEFAULT_MTU || self.max_mtu > MAX_MTU {
            return Err(Error::InvalidArgument(format!(
                "max_mtu must be within {}..={}, got {}",
                DEFAULT_MTU, MAX_MTU, self.max_mtu
            )));
        }
        if self.tick_interval_ms == 0 {
            return Err(Error::InvalidArgument("tick_interval_ms must not be 0".into()));
        }
        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    /// Loads the config from `config_dir`, falling back to defaults if the file is missing.
    pub async fn load_config(config_dir: &Path) -> Result<Self> {
        let file_path = config_dir.join(CONFIG_FILE_NAME);

        if !file_path.exists() {
            warn!("Config file not found at {:?}, using default.", file_path);
            return Ok(Self::default());
        }

        let config_json = fs::read_to_string(&file_path).await?;
        let config: Self = serde_json::from_str(&config_json)?;
        config.validate()?;

        info!("Config loaded from {:?}", file_path);
        Ok(config)
    }

    /// Saves the config to `config_dir`, creating the directory if needed.
    pub async fn save_config(&self, config_dir: &Path) -> Result<()> {
        create_config_dir(config_dir).await?;
        let file_path = config_dir.join(CONFIG_FILE_NAME);

        let config_json = match serde_json::to_string_pretty(self) {
            Ok(json) => json,
            Err(e) => {
                error!("Failed to serialize central config to JSON: {}", e);
                return Err(e.into());
            }
        };

        fs::write(&file_path, config_json).await?;

        info!("Central config saved to {:?}.", file_path);
        Ok(())
    }
}
