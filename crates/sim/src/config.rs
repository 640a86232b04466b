//! Simulation scenario configuration

use anyhow::{Context, Result, anyhow};
use host::HostConfig;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimConfig {
    /// Frames (milliseconds) to simulate
    #[serde(default = "SimConfig::default_frames")]
    pub frames: u64,
    /// Seed for fault injection
    #[serde(default)]
    pub seed: u64,
    /// Probability that a data packet is NAKed
    #[serde(default)]
    pub nak_rate: f64,
    /// Probability that a transaction is corrupted
    #[serde(default)]
    pub error_rate: f64,
    /// Host channels the simulated core implements
    #[serde(default = "SimConfig::default_core_channels")]
    pub core_channels: usize,
    #[serde(default)]
    pub host: HostConfig,
    /// Device plugged into the root port
    #[serde(default)]
    pub root: Option<DeviceSpec>,
}

/// A simulated device and, for hubs, what hangs off it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DeviceSpec {
    Hub {
        ports: u8,
        #[serde(default)]
        children: Vec<PortSpec>,
    },
    Keyboard {
        #[serde(default)]
        low_speed: bool,
    },
    Function {
        vendor_id: u16,
        product_id: u16,
        #[serde(default)]
        low_speed: bool,
        #[serde(default)]
        manufacturer: Option<String>,
        #[serde(default)]
        product: Option<String>,
        #[serde(default = "DeviceSpec::default_configurations")]
        configurations: u8,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortSpec {
    pub port: u8,
    #[serde(flatten)]
    pub device: DeviceSpec,
}

impl DeviceSpec {
    fn default_configurations() -> u8 {
        1
    }

    /// Devices in this subtree, hubs included
    pub fn count(&self) -> usize {
        match self {
            Self::Hub { children, .. } => 1 + children.iter().map(|c| c.device.count()).sum::<usize>(),
            _ => 1,
        }
    }

    fn validate(&self) -> Result<()> {
        match self {
            Self::Hub { ports, children } => {
                if *ports == 0 || *ports > 127 {
                    return Err(anyhow!("Hub must have 1..=127 ports, got {}", ports));
                }
                for child in children {
                    if child.port == 0 || child.port > *ports {
                        return Err(anyhow!(
                            "Port {} does not exist on a {}-port hub",
                            child.port,
                            ports
                        ));
                    }
                    if children.iter().filter(|c| c.port == child.port).count() > 1 {
                        return Err(anyhow!("Port {} is used twice", child.port));
                    }
                    child.device.validate()?;
                }
                Ok(())
            }
            Self::Function { configurations, .. } if *configurations == 0 => {
                Err(anyhow!("A function needs at least one configuration"))
            }
            _ => Ok(()),
        }
    }
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            frames: Self::default_frames(),
            seed: 0,
            nak_rate: 0.0,
            error_rate: 0.0,
            core_channels: Self::default_core_channels(),
            host: HostConfig::default(),
            root: Some(DeviceSpec::Hub {
                ports: 4,
                children: vec![
                    PortSpec {
                        port: 1,
                        device: DeviceSpec::Keyboard { low_speed: true },
                    },
                    PortSpec {
                        port: 3,
                        device: DeviceSpec::Function {
                            vendor_id: 0x1234,
                            product_id: 0x5678,
                            low_speed: false,
                            manufacturer: Some("Acme".to_string()),
                            product: Some("Widget".to_string()),
                            configurations: 2,
                        },
                    },
                ],
            }),
        }
    }
}

impl SimConfig {
    fn default_frames() -> u64 {
        2000
    }

    fn default_core_channels() -> usize {
        8
    }

    /// Load configuration from file
    pub fn load(path: Option<PathBuf>) -> Result<Self> {
        let config_path = match path {
            Some(p) => p,
            None => {
                let default = Self::default_path();
                if !default.exists() {
                    return Err(anyhow!("No configuration file found, using defaults"));
                }
                default
            }
        };

        let content = fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;

        let config: SimConfig = toml::from_str(&content)
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
            config_dir.join("otg-host").join("sim.toml")
        } else {
            PathBuf::from(".config/otg-host/sim.toml")
        }
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        self.host.validate()?;

        for (name, rate) in [("nak_rate", self.nak_rate), ("error_rate", self.error_rate)] {
            if !(0.0..=1.0).contains(&rate) {
                return Err(anyhow!("{} must be between 0 and 1, got {}", name, rate));
            }
        }

        if self.core_channels == 0 || self.core_channels > 16 {
            return Err(anyhow!(
                "Simulated core must have 1..=16 channels, got {}",
                self.core_channels
            ));
        }

        if let Some(root) = &self.root {
            root.validate()?;
            // Address 0 is the default address
            if root.count() > 127 {
                return Err(anyhow!("Topology has {} devices, at most 127 fit", root.count()));
            }
        }

        Ok(())
    }
}

/// Load configuration from a path that may start with `~`
pub fn load_config(path: &str) -> Result<SimConfig> {
    let path_buf = PathBuf::from(shellexpand::tilde(path).as_ref());
    SimConfig::load(Some(path_buf))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = SimConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.root.as_ref().map(DeviceSpec::count), Some(3));
    }

    #[test]
    fn test_parse_nested_topology() {
        let config: SimConfig = toml::from_str(
            r#"
            frames = 500
            nak_rate = 0.1

            [host]
            channels = 4

            [root]
            type = "hub"
            ports = 2

            [[root.children]]
            port = 2
            type = "keyboard"
            low_speed = true
            "#,
        )
        .unwrap();
        assert_eq!(config.frames, 500);
        assert_eq!(config.host.channels, 4);
        assert_eq!(config.host.debounce_ms, 100);
        let Some(DeviceSpec::Hub { ports, children }) = &config.root else {
            panic!("expected a hub at the root");
        };
        assert_eq!(*ports, 2);
        assert_eq!(children[0].port, 2);
        assert_eq!(children[0].device, DeviceSpec::Keyboard { low_speed: true });
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_topology() {
        let config = SimConfig {
            root: Some(DeviceSpec::Hub {
                ports: 2,
                children: vec![PortSpec {
                    port: 3,
                    device: DeviceSpec::Keyboard { low_speed: false },
                }],
            }),
            ..SimConfig::default()
        };
        assert!(config.validate().is_err());

        let config = SimConfig {
            nak_rate: 1.5,
            ..SimConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_save_and_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sim.toml");
        let config = SimConfig {
            frames: 42,
            seed: 7,
            ..SimConfig::default()
        };
        config.save(&path).unwrap();
        assert_eq!(SimConfig::load(Some(path)).unwrap(), config);
    }
}
