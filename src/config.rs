//! Configuration file support for the Verity node.
//!
//! Loads optional `verity.toml` from the data directory (or an explicit
//! path). CLI flags override config file values. If no config file exists,
//! defaults are used.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use crate::constants::{
    DEFAULT_MAX_RESPONSE_TIME_MS, DEFAULT_MIN_CONSENSUS_FRACTION, DEFAULT_REQUEST_TIMEOUT_MS,
    DEFAULT_RPC_PORT, MIN_AGREEING_RESULTS,
};
use crate::verification::sla::Sla;

pub const CONFIG_FILE_NAME: &str = "verity.toml";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("failed to parse {path}: {source}")]
    Parse {
        path: String,
        source: toml::de::Error,
    },
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Top-level configuration.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct VerityConfig {
    pub node: NodeConfig,
    pub cycle: CycleConfig,
}

/// Node configuration section.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub data_dir: String,
    pub rpc_host: String,
    pub rpc_port: u16,
}

impl Default for NodeConfig {
    fn default() -> Self {
        NodeConfig {
            data_dir: "./verity-data".into(),
            rpc_host: "127.0.0.1".into(),
            rpc_port: DEFAULT_RPC_PORT,
        }
    }
}

impl NodeConfig {
    pub fn rpc_addr(&self) -> Result<SocketAddr, ConfigError> {
        format!("{}:{}", self.rpc_host, self.rpc_port)
            .parse()
            .map_err(|e| ConfigError::Invalid(format!("rpc address: {}", e)))
    }
}

/// When verification cycles are triggered.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Schedule {
    /// Only on an explicit trigger (CLI `run` or the RPC verify route).
    Manual,
    /// Every N seconds while `serve` is running.
    Every(u64),
}

/// Verification cycle section.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct CycleConfig {
    pub schedule: Schedule,
    /// Empty means: discover active agents from the registry.
    pub agent_endpoints: Vec<String>,
    /// Store namespace of the escrow ledger.
    pub escrow_address: String,
    /// Store namespace of the agent registry.
    pub registry_address: String,
    /// Task verified by scheduled cycles.
    pub task_id: Option<String>,
    pub max_response_time_ms: u64,
    pub min_consensus_fraction: f64,
    pub request_timeout_ms: u64,
    pub min_agreeing_results: usize,
}

impl Default for CycleConfig {
    fn default() -> Self {
        CycleConfig {
            schedule: Schedule::Manual,
            agent_endpoints: vec![],
            escrow_address: "escrow".into(),
            registry_address: "registry".into(),
            task_id: None,
            max_response_time_ms: DEFAULT_MAX_RESPONSE_TIME_MS,
            min_consensus_fraction: DEFAULT_MIN_CONSENSUS_FRACTION,
            request_timeout_ms: DEFAULT_REQUEST_TIMEOUT_MS,
            min_agreeing_results: MIN_AGREEING_RESULTS,
        }
    }
}

impl CycleConfig {
    pub fn sla(&self) -> Sla {
        Sla {
            max_response_time_ms: self.max_response_time_ms,
            min_consensus_fraction: self.min_consensus_fraction,
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let f = self.min_consensus_fraction;
        if !(f > 0.0 && f <= 1.0) {
            return Err(ConfigError::Invalid(format!(
                "min_consensus_fraction must be in (0, 1], got {}",
                f
            )));
        }
        if self.max_response_time_ms == 0 {
            return Err(ConfigError::Invalid("max_response_time_ms must be positive".into()));
        }
        if self.request_timeout_ms < self.max_response_time_ms {
            return Err(ConfigError::Invalid(format!(
                "request_timeout_ms ({}) is shorter than max_response_time_ms ({})",
                self.request_timeout_ms, self.max_response_time_ms
            )));
        }
        if self.min_agreeing_results < MIN_AGREEING_RESULTS {
            return Err(ConfigError::Invalid(format!(
                "min_agreeing_results must be at least {}, got {}",
                MIN_AGREEING_RESULTS, self.min_agreeing_results
            )));
        }
        for (name, ns) in [
            ("escrow_address", &self.escrow_address),
            ("registry_address", &self.registry_address),
        ] {
            if ns.trim().is_empty() || ns.contains('/') {
                return Err(ConfigError::Invalid(format!(
                    "{} must be a non-empty name without '/'",
                    name
                )));
            }
        }
        if self.escrow_address == self.registry_address {
            return Err(ConfigError::Invalid(
                "escrow_address and registry_address must differ".into(),
            ));
        }
        if self.schedule == Schedule::Every(0) {
            return Err(ConfigError::Invalid("schedule interval must be positive".into()));
        }
        Ok(())
    }
}

impl VerityConfig {
    /// Load `verity.toml` from the given directory.
    /// Returns `Default` if the file doesn't exist.
    pub fn load(data_dir: &Path) -> Result<Self, ConfigError> {
        Self::load_from(&data_dir.join(CONFIG_FILE_NAME))
    }

    /// Load a config file by path. Returns `Default` if the file doesn't exist.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let contents = match std::fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(source) => {
                return Err(ConfigError::Read {
                    path: path.display().to_string(),
                    source,
                })
            }
        };
        let config: VerityConfig = toml::from_str(&contents).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })?;
        tracing::info!("Loaded config from {}", path.display());
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.node.rpc_addr()?;
        self.cycle.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_valid() {
        let config = VerityConfig::default();
        assert_eq!(config.node.rpc_port, DEFAULT_RPC_PORT);
        assert_eq!(config.cycle.schedule, Schedule::Manual);
        assert_eq!(config.cycle.sla(), Sla::default());
        config.validate().unwrap();
    }

    #[test]
    fn parse_toml_config() {
        let toml_str = r#"
[node]
rpc_port = 9999
rpc_host = "0.0.0.0"

[cycle]
schedule = { every = 30 }
agent_endpoints = ["http://a:8001", "http://b:8002"]
escrow_address = "escrow-main"
task_id = "match-42"
max_response_time_ms = 2000
min_consensus_fraction = 0.75
"#;
        let config: VerityConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.node.rpc_port, 9999);
        assert_eq!(config.node.rpc_host, "0.0.0.0");
        assert_eq!(config.cycle.schedule, Schedule::Every(30));
        assert_eq!(config.cycle.agent_endpoints.len(), 2);
        assert_eq!(config.cycle.escrow_address, "escrow-main");
        assert_eq!(config.cycle.registry_address, "registry");
        assert_eq!(config.cycle.task_id.as_deref(), Some("match-42"));
        assert_eq!(config.cycle.request_timeout_ms, DEFAULT_REQUEST_TIMEOUT_MS);
        config.validate().unwrap();
    }

    #[test]
    fn manual_schedule_parses_from_string() {
        let config: VerityConfig = toml::from_str("[cycle]\nschedule = \"manual\"\n").unwrap();
        assert_eq!(config.cycle.schedule, Schedule::Manual);
    }

    #[test]
    fn missing_config_returns_default() {
        let dir = tempfile::tempdir().unwrap();
        let config = VerityConfig::load(dir.path()).unwrap();
        assert_eq!(config.node.rpc_port, DEFAULT_RPC_PORT);
    }

    #[test]
    fn malformed_config_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(CONFIG_FILE_NAME), "[cycle\nbroken").unwrap();
        assert!(matches!(
            VerityConfig::load(dir.path()),
            Err(ConfigError::Parse { .. })
        ));
    }

    #[test]
    fn validation_rejects_bad_values() {
        let bad: Vec<fn(&mut CycleConfig)> = vec![
            |c| c.min_consensus_fraction = 0.0,
            |c| c.min_consensus_fraction = 1.5,
            |c| c.min_consensus_fraction = f64::NAN,
            |c| c.max_response_time_ms = 0,
            |c| c.request_timeout_ms = 100,
            |c| c.min_agreeing_results = 0,
            |c| {
                c.min_agreeing_results = 1;
                c.min_consensus_fraction = 0.5;
            },
            |c| c.escrow_address = String::new(),
            |c| c.registry_address = "a/b".into(),
            |c| c.registry_address = c.escrow_address.clone(),
            |c| c.schedule = Schedule::Every(0),
        ];
        for (i, mutate) in bad.into_iter().enumerate() {
            let mut cycle = CycleConfig::default();
            mutate(&mut cycle);
            assert!(cycle.validate().is_err(), "case {} should be rejected", i);
        }
    }

    #[test]
    fn invalid_rpc_host_is_rejected() {
        let mut config = VerityConfig::default();
        config.node.rpc_host = "not a host".into();
        assert!(config.validate().is_err());
    }
}
