// Configuration management for the quakemesh CLI
//
// Cross-platform config stored in:
// - macOS: ~/.config/quakemesh/config.json
// - Linux: ~/.config/quakemesh/config.json
// - Windows: %APPDATA%\quakemesh\config.json

use anyhow::{Context, Result};
use quakemesh_core::NodeConfig;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Rendezvous servers used to join the network (`host:port`)
    pub bootstrap_servers: Vec<String>,

    /// Listen port for inbound peers (0 = random)
    pub listen_port: u16,

    /// Inbound peer cap
    pub max_inbound: usize,

    /// Outbound peers dialed per candidate list
    pub max_outbound: usize,

    /// Seconds between keep-alive echoes to the rendezvous server
    pub echo_interval: u64,

    /// Default area code for originated broadcasts
    pub area_code: u32,

    /// Key material path; None keeps keys under the data directory
    pub key_file: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        let core = NodeConfig::default();
        Self {
            bootstrap_servers: Vec::new(),
            listen_port: core.listen_port,
            max_inbound: core.max_inbound,
            max_outbound: core.max_outbound,
            echo_interval: 600,
            area_code: 900,
            key_file: None,
        }
    }
}

impl Config {
    /// Get the config directory path (cross-platform)
    pub fn config_dir() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .context("Failed to determine config directory")?
            .join("quakemesh");

        std::fs::create_dir_all(&config_dir).context("Failed to create config directory")?;

        Ok(config_dir)
    }

    /// Get the data directory path (cross-platform)
    pub fn data_dir() -> Result<PathBuf> {
        let data_dir = dirs::data_local_dir()
            .context("Failed to determine data directory")?
            .join("quakemesh");

        std::fs::create_dir_all(&data_dir).context("Failed to create data directory")?;

        Ok(data_dir)
    }

    /// Get the config file path
    pub fn config_file() -> Result<PathBuf> {
        Ok(Self::config_dir()?.join("config.json"))
    }

    /// Where key material lives unless overridden
    pub fn key_path(&self) -> Result<PathBuf> {
        match &self.key_file {
            Some(path) => Ok(PathBuf::from(path)),
            None => Ok(Self::data_dir()?.join("keys.dat")),
        }
    }

    /// Load config from file, or create default if not exists
    pub fn load() -> Result<Self> {
        let config_file = Self::config_file()?;

        if config_file.exists() {
            let contents =
                std::fs::read_to_string(&config_file).context("Failed to read config file")?;
            let config: Config =
                serde_json::from_str(&contents).context("Failed to parse config file")?;
            Ok(config)
        } else {
            let config = Config::default();
            config.save()?;
            Ok(config)
        }
    }

    /// Save config to file
    pub fn save(&self) -> Result<()> {
        let config_file = Self::config_file()?;
        let contents = serde_json::to_string_pretty(self).context("Failed to serialize config")?;
        std::fs::write(&config_file, contents).context("Failed to write config file")?;
        Ok(())
    }

    /// Translate into the engine's configuration
    pub fn to_node_config(&self, port_override: Option<u16>) -> Result<NodeConfig> {
        let mut node = NodeConfig::default();
        node.bootstrap_servers = self.bootstrap_servers.clone();
        node.listen_port = port_override.unwrap_or(self.listen_port);
        node.max_inbound = self.max_inbound;
        node.max_outbound = self.max_outbound;
        node.key_file = Some(self.key_path()?);
        Ok(node)
    }

    /// Set a config value
    pub fn set(&mut self, key: &str, value: &str) -> Result<()> {
        match key {
            "listen_port" => {
                self.listen_port = value.parse().context("Invalid port number")?;
            }
            "max_inbound" => {
                self.max_inbound = value.parse().context("Invalid number")?;
            }
            "max_outbound" => {
                self.max_outbound = value.parse().context("Invalid number")?;
            }
            "echo_interval" => {
                self.echo_interval = value.parse().context("Invalid number")?;
            }
            "area_code" => {
                self.area_code = value.parse().context("Invalid area code")?;
            }
            "key_file" => {
                self.key_file = if value.is_empty() {
                    None
                } else {
                    Some(value.to_string())
                };
            }
            "bootstrap_servers" => {
                self.bootstrap_servers = value
                    .split(',')
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .collect();
            }
            _ => anyhow::bail!("Unknown config key: {}", key),
        }
        self.save()?;
        Ok(())
    }

    /// Get a config value
    pub fn get(&self, key: &str) -> Option<String> {
        match key {
            "listen_port" => Some(self.listen_port.to_string()),
            "max_inbound" => Some(self.max_inbound.to_string()),
            "max_outbound" => Some(self.max_outbound.to_string()),
            "echo_interval" => Some(self.echo_interval.to_string()),
            "area_code" => Some(self.area_code.to_string()),
            "key_file" => self.key_file.clone(),
            "bootstrap_servers" => Some(self.bootstrap_servers.join(",")),
            _ => None,
        }
    }

    /// List all config values
    pub fn list(&self) -> Vec<(String, String)> {
        vec![
            ("listen_port".to_string(), self.listen_port.to_string()),
            ("max_inbound".to_string(), self.max_inbound.to_string()),
            ("max_outbound".to_string(), self.max_outbound.to_string()),
            (
                "echo_interval".to_string(),
                format!("{}s", self.echo_interval),
            ),
            ("area_code".to_string(), self.area_code.to_string()),
            (
                "key_file".to_string(),
                self.key_file.clone().unwrap_or_else(|| "(auto)".to_string()),
            ),
            (
                "bootstrap_servers".to_string(),
                if self.bootstrap_servers.is_empty() {
                    "(none)".to_string()
                } else {
                    self.bootstrap_servers.join(",")
                },
            ),
        ]
    }

    pub fn echo_interval(&self) -> Duration {
        Duration::from_secs(self.echo_interval.max(1))
    }
}
