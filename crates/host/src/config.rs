//! Host stack configuration management

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Bit times in one full-speed frame
pub const FULL_SPEED_FRAME_BITS: u32 = 12_000;

/// Shortest connection debounce USB 2.0 allows (7.1.7.3)
pub const MIN_DEBOUNCE_MS: u32 = 100;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostConfig {
    /// Upper bound on the channel pool; the core may implement fewer
    #[serde(default = "HostConfig::default_channels")]
    pub channels: usize,
    /// End-of-frame guard band in full-speed bit times
    #[serde(default = "HostConfig::default_guard_band")]
    pub guard_band_bit_times: u32,
    /// Connection debounce before a port is reset
    #[serde(default = "HostConfig::default_debounce_ms")]
    pub debounce_ms: u32,
    /// How long the root port reset is held
    #[serde(default = "HostConfig::default_port_reset_ms")]
    pub port_reset_ms: u32,
    /// Length of the first GET_DESCRIPTOR(CONFIGURATION) request
    #[serde(default = "HostConfig::default_config_probe_len")]
    pub config_probe_len: u16,
    /// Language ID used for string descriptors
    #[serde(default = "HostConfig::default_string_language")]
    pub string_language: u16,
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "HostConfig::default_log_level")]
    pub log_level: String,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            channels: Self::default_channels(),
            guard_band_bit_times: Self::default_guard_band(),
            debounce_ms: Self::default_debounce_ms(),
            port_reset_ms: Self::default_port_reset_ms(),
            config_probe_len: Self::default_config_probe_len(),
            string_language: Self::default_string_language(),
            log_level: Self::default_log_level(),
        }
    }
}

impl HostConfig {
    fn default_channels() -> usize {
        8
    }

    fn default_guard_band() -> u32 {
        FULL_SPEED_FRAME_BITS / 10
    }

    fn default_debounce_ms() -> u32 {
        MIN_DEBOUNCE_MS
    }

    fn default_port_reset_ms() -> u32 {
        50
    }

    fn default_config_probe_len() -> u16 {
        64
    }

    fn default_string_language() -> u16 {
        protocol::types::LANG_EN_US
    }

    fn default_log_level() -> String {
        "info".to_string()
    }

    /// Load configuration from file
    pub fn load(path: Option<PathBuf>) -> Result<Self> {
        let config_path = if let Some(p) = path {
            p
        } else {
            let candidates = vec![Self::default_path(), PathBuf::from("/etc/otg-host/host.toml")];

            candidates
                .into_iter()
                .find(|p| p.exists())
                .ok_or_else(|| anyhow!("No configuration file found, using defaults"))?
        };

        let content = fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;

        let config: HostConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", config_path.display()))?;

        config.validate()?;

        tracing::info!("Loaded configuration from: {}", config_path.display());
        Ok(config)
    }

    /// Load configuration or return defaults if not found
    pub fn load_or_default() -> Self {
        match Self::load(None) {
            Ok(config) => config,
            Err(e) => {
                tracing::warn!("Failed to load config: {}, using defaults", e);
                Self::default()
            }
        }
    }

    /// Save configuration to the specified path
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize configuration")?;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        tracing::info!("Saved configuration to: {}", path.display());
        Ok(())
    }

    /// Get the default configuration file path
    pub fn default_path() -> PathBuf {
        if let Some(config_dir) = dirs::config_dir() {
            config_dir.join("otg-host").join("host.toml")
        } else {
            PathBuf::from(".config/otg-host/host.toml")
        }
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.log_level.as_str()) {
            return Err(anyhow!(
                "Invalid log level '{}', must be one of: {:?}",
                self.log_level,
                valid_levels
            ));
        }

        if self.channels == 0 {
            return Err(anyhow!("Channel pool must hold at least one channel"));
        }

        if self.guard_band_bit_times >= FULL_SPEED_FRAME_BITS {
            return Err(anyhow!(
                "Guard band of {} bit times leaves no room in a {}-bit frame",
                self.guard_band_bit_times,
                FULL_SPEED_FRAME_BITS
            ));
        }

        if self.debounce_ms < MIN_DEBOUNCE_MS {
            return Err(anyhow!(
                "Debounce of {}ms is shorter than the {}ms minimum",
                self.debounce_ms,
                MIN_DEBOUNCE_MS
            ));
        }

        if self.config_probe_len < protocol::descriptor::CONFIGURATION_DESC_LEN as u16 {
            return Err(anyhow!(
                "Configuration probe of {} bytes cannot hold the configuration header",
                self.config_probe_len
            ));
        }

        Ok(())
    }
}

/// Load configuration from a path that may start with `~`
pub fn load_config(path: &str) -> Result<HostConfig> {
    let path_buf = PathBuf::from(shellexpand::tilde(path).as_ref());
    HostConfig::load(Some(path_buf))
}
