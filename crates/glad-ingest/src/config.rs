// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Ingest service configuration.

use crate::error::ConfigError;
use crate::ring::WaitStrategy;
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Which feeds the service runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataSource {
    #[default]
    Socket,
    Bus,
    Both,
}

impl DataSource {
    pub fn uses_socket(self) -> bool {
        matches!(self, Self::Socket | Self::Both)
    }

    pub fn uses_bus(self) -> bool {
        matches!(self, Self::Bus | Self::Both)
    }
}

impl std::str::FromStr for DataSource {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "socket" => Ok(Self::Socket),
            "bus" | "jms" => Ok(Self::Bus),
            "both" => Ok(Self::Both),
            other => Err(format!("unknown data source '{}'", other)),
        }
    }
}

/// Ingest service configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestConfig {
    /// Address to bind the socket server to (default: 0.0.0.0)
    #[serde(default = "default_bind_address")]
    pub bind_address: IpAddr,

    /// TCP port for the socket server (default: 8900, 0 = ephemeral)
    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default)]
    pub data_source: DataSource,

    /// Ring size of each socket client's private queue
    #[serde(default = "default_ring_size")]
    pub client_ring_size: usize,

    #[serde(default)]
    pub client_wait_strategy: WaitStrategy,

    /// Ring size of the shared bus queue
    #[serde(default = "default_ring_size")]
    pub bus_ring_size: usize,

    #[serde(default)]
    pub bus_wait_strategy: WaitStrategy,

    /// Bytes requested per socket read
    #[serde(default = "default_read_buffer_size")]
    pub read_buffer_size: usize,

    /// Consecutive read errors before a client is dropped
    #[serde(default = "default_max_consecutive_errors")]
    pub max_consecutive_errors: u32,

    /// Socket read timeout; a timed-out read counts as an empty read
    #[serde(default = "default_read_timeout_ms")]
    pub read_timeout_ms: u64,

    /// Accept poll interval
    #[serde(default = "default_accept_timeout_ms")]
    pub accept_timeout_ms: u64,

    #[serde(default = "default_reap_interval")]
    pub reap_interval_secs: u64,

    /// Bound on joining one client handler
    #[serde(default = "default_join_timeout")]
    pub join_timeout_secs: u64,

    /// Bound on draining a queue at shutdown
    #[serde(default = "default_drain_timeout")]
    pub drain_timeout_secs: u64,

    /// Maximum concurrent clients (None = unlimited)
    #[serde(default)]
    pub max_clients: Option<usize>,

    /// Closed-client summaries kept in memory
    #[serde(default = "default_closed_in_memory")]
    pub closed_clients_in_memory: usize,

    /// JSON-lines file receiving summaries evicted from memory
    #[serde(default)]
    pub closed_clients_path: Option<PathBuf>,

    #[serde(default)]
    pub bus_topics: Vec<String>,

    /// Accepted bus message types; `*` wildcards allowed
    #[serde(default = "default_bus_accepted_types")]
    pub bus_accepted_types: Vec<String>,

    /// Stats log interval (0 = disabled)
    #[serde(default)]
    pub metrics_report_interval_secs: u64,

    #[serde(default = "default_health_yellow")]
    pub health_yellow_percent: u8,

    #[serde(default = "default_health_red")]
    pub health_red_percent: u8,

    /// Connection attempts made by the socket loader
    #[serde(default = "default_loader_retries")]
    pub socket_loader_retries: u32,

    #[serde(default = "default_loader_retry_delay_ms")]
    pub socket_loader_retry_delay_ms: u64,

    /// Records retained by the in-memory sink of the daemon
    #[serde(default = "default_sink_capacity")]
    pub sink_capacity: usize,
}

fn default_bind_address() -> IpAddr {
    IpAddr::V4(Ipv4Addr::UNSPECIFIED)
}

fn default_port() -> u16 {
    8900
}

fn default_ring_size() -> usize {
    1024
}

fn default_read_buffer_size() -> usize {
    64 * 1024
}

fn default_max_consecutive_errors() -> u32 {
    10
}

fn default_read_timeout_ms() -> u64 {
    500
}

fn default_accept_timeout_ms() -> u64 {
    100
}

fn default_reap_interval() -> u64 {
    2
}

fn default_join_timeout() -> u64 {
    30
}

fn default_drain_timeout() -> u64 {
    10
}

fn default_closed_in_memory() -> usize {
    1000
}

fn default_bus_accepted_types() -> Vec<String> {
    vec![
        "AlarmedChannelSample".into(),
        "EventRecord".into(),
        "GroupedChannelSamples".into(),
        "RawChannelSample".into(),
    ]
}

fn default_health_yellow() -> u8 {
    90
}

fn default_health_red() -> u8 {
    100
}

fn default_loader_retries() -> u32 {
    10
}

fn default_loader_retry_delay_ms() -> u64 {
    2000
}

fn default_sink_capacity() -> usize {
    100_000
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            port: default_port(),
            data_source: DataSource::default(),
            client_ring_size: default_ring_size(),
            client_wait_strategy: WaitStrategy::default(),
            bus_ring_size: default_ring_size(),
            bus_wait_strategy: WaitStrategy::default(),
            read_buffer_size: default_read_buffer_size(),
            max_consecutive_errors: default_max_consecutive_errors(),
            read_timeout_ms: default_read_timeout_ms(),
            accept_timeout_ms: default_accept_timeout_ms(),
            reap_interval_secs: default_reap_interval(),
            join_timeout_secs: default_join_timeout(),
            drain_timeout_secs: default_drain_timeout(),
            max_clients: None,
            closed_clients_in_memory: default_closed_in_memory(),
            closed_clients_path: None,
            bus_topics: Vec::new(),
            bus_accepted_types: default_bus_accepted_types(),
            metrics_report_interval_secs: 0,
            health_yellow_percent: default_health_yellow(),
            health_red_percent: default_health_red(),
            socket_loader_retries: default_loader_retries(),
            socket_loader_retry_delay_ms: default_loader_retry_delay_ms(),
            sink_capacity: default_sink_capacity(),
        }
    }
}

impl IngestConfig {
    /// Load configuration from a JSON file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to a JSON file.
    pub fn to_file(&self, path: &Path) -> Result<(), ConfigError> {
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn listen_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind_address, self.port)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    pub fn accept_timeout(&self) -> Duration {
        Duration::from_millis(self.accept_timeout_ms)
    }

    pub fn reap_interval(&self) -> Duration {
        Duration::from_secs(self.reap_interval_secs)
    }

    pub fn join_timeout(&self) -> Duration {
        Duration::from_secs(self.join_timeout_secs)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_secs(self.drain_timeout_secs)
    }

    pub fn loader_retry_delay(&self) -> Duration {
        Duration::from_millis(self.socket_loader_retry_delay_ms)
    }

    /// Validate configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.client_ring_size == 0 || self.bus_ring_size == 0 {
            return Err(ConfigError::InvalidValue("ring sizes cannot be 0".into()));
        }
        if self.read_buffer_size == 0 {
            return Err(ConfigError::InvalidValue(
                "read_buffer_size cannot be 0".into(),
            ));
        }
        if self.max_consecutive_errors == 0 {
            return Err(ConfigError::InvalidValue(
                "max_consecutive_errors cannot be 0".into(),
            ));
        }
        if self.read_timeout_ms == 0 || self.accept_timeout_ms == 0 {
            return Err(ConfigError::InvalidValue(
                "read and accept timeouts cannot be 0".into(),
            ));
        }
        if self.reap_interval_secs == 0 {
            return Err(ConfigError::InvalidValue(
                "reap_interval_secs cannot be 0".into(),
            ));
        }
        if self.max_clients == Some(0) {
            return Err(ConfigError::InvalidValue("max_clients cannot be 0".into()));
        }
        if self.health_yellow_percent > self.health_red_percent || self.health_red_percent > 100 {
            return Err(ConfigError::InvalidValue(format!(
                "health thresholds must satisfy yellow <= red <= 100 (got {}/{})",
                self.health_yellow_percent, self.health_red_percent
            )));
        }
        if self.data_source.uses_bus() {
            if self.bus_topics.is_empty() {
                return Err(ConfigError::InvalidValue(
                    "bus_topics required when the bus feed is enabled".into(),
                ));
            }
            if self.bus_accepted_types.is_empty() {
                return Err(ConfigError::InvalidValue(
                    "bus_accepted_types cannot be empty".into(),
                ));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = IngestConfig::default();
        assert_eq!(config.port, 8900);
        assert_eq!(config.client_ring_size, 1024);
        assert_eq!(config.bus_ring_size, 1024);
        assert_eq!(config.client_wait_strategy, WaitStrategy::Block);
        assert_eq!(config.socket_loader_retries, 10);
        assert_eq!(config.loader_retry_delay(), Duration::from_millis(2000));
        assert_eq!(config.reap_interval(), Duration::from_secs(2));
        assert_eq!(config.join_timeout(), Duration::from_secs(30));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let json = r#"{ "port": 9100, "data_source": "both", "bus_topics": ["mpcs.eha"],
                        "bus_wait_strategy": "yield" }"#;
        let config: IngestConfig = serde_json::from_str(json).expect("parse");
        assert_eq!(config.port, 9100);
        assert_eq!(config.data_source, DataSource::Both);
        assert_eq!(config.bus_wait_strategy, WaitStrategy::Yield);
        assert_eq!(config.read_buffer_size, 64 * 1024);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects() {
        let config = IngestConfig {
            max_consecutive_errors: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = IngestConfig {
            health_yellow_percent: 95,
            health_red_percent: 80,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = IngestConfig {
            data_source: DataSource::Bus,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_file_roundtrip() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("glad.json");
        let config = IngestConfig {
            port: 0,
            max_clients: Some(8),
            ..Default::default()
        };
        config.to_file(&path).expect("write");
        let loaded = IngestConfig::from_file(&path).expect("read");
        assert_eq!(loaded.port, 0);
        assert_eq!(loaded.max_clients, Some(8));
    }

    #[test]
    fn test_data_source_parse() {
        assert_eq!("JMS".parse::<DataSource>(), Ok(DataSource::Bus));
        assert_eq!("socket".parse::<DataSource>(), Ok(DataSource::Socket));
        assert!("carrier-pigeon".parse::<DataSource>().is_err());
    }
}
