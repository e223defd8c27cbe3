use std::{
    collections::BTreeMap,
    fmt::Display,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{ChainId, EvmNetwork};

/// Name under which the built-in simulated network is selected.
pub const SIMULATED_NETWORK: &str = "SIMULATED";

/// Chain id of the built-in simulated network.
pub const SIMULATED_CHAIN_ID: ChainId = 1337;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load env config from {path}: {source}")]
    Load {
        path: PathBuf,
        #[source]
        source: ::config::ConfigError,
    },

    #[error("no network selected")]
    NoNetworkSelected,

    #[error("unknown network {0}")]
    UnknownNetwork(String),

    #[error("network {0} is live but has no rpc urls")]
    MissingRpcUrls(String),
}

// ============================================================================
// Logging
// ============================================================================

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum LogTarget {
    File,
    Loki,
    InMemory,
}

impl Display for LogTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}",
            match self {
                Self::File => "file",
                Self::Loki => "loki",
                Self::InMemory => "in-memory",
            }
        )
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct LogStreamConfig {
    #[serde(default)]
    pub log_targets: Vec<LogTarget>,

    #[serde(default = "LogStreamConfig::default_producer_timeout")]
    pub log_producer_timeout_secs: u64,

    #[serde(default = "LogStreamConfig::default_producer_retry_limit")]
    pub log_producer_retry_limit: u32,
}

impl LogStreamConfig {
    fn default_producer_timeout() -> u64 {
        10
    }

    fn default_producer_retry_limit() -> u32 {
        10
    }

    pub fn has_target(&self, target: LogTarget) -> bool {
        self.log_targets.contains(&target)
    }
}

impl Default for LogStreamConfig {
    fn default() -> Self {
        Self {
            log_targets: vec![],
            log_producer_timeout_secs: Self::default_producer_timeout(),
            log_producer_retry_limit: Self::default_producer_retry_limit(),
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
pub struct LoggingConfig {
    /// Flush the log stream even when the test passes.
    #[serde(default)]
    pub test_log_collect: bool,

    #[serde(default)]
    pub log_stream: LogStreamConfig,
}

// ============================================================================
// Network selection
// ============================================================================

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
pub struct NetworkConfig {
    /// Networks to run against; only the first one drives the environment.
    #[serde(default)]
    pub selected_networks: Vec<String>,

    /// Custom network definitions, keyed by name.
    #[serde(default)]
    pub evm_networks: BTreeMap<String, EvmNetwork>,

    /// Per-network http url overrides, keyed by name.
    #[serde(default)]
    pub rpc_http_urls: BTreeMap<String, Vec<String>>,

    /// Per-network websocket url overrides, keyed by name.
    #[serde(default)]
    pub rpc_ws_urls: BTreeMap<String, Vec<String>>,
}

fn lookup<'a, T>(map: &'a BTreeMap<String, T>, name: &str) -> Option<&'a T> {
    map.iter()
        .find(|(key, _)| key.eq_ignore_ascii_case(name))
        .map(|(_, value)| value)
}

pub fn simulated_network() -> EvmNetwork {
    EvmNetwork {
        name: "Simulated Geth".into(),
        chain_id: SIMULATED_CHAIN_ID,
        urls: vec!["ws://localhost:8546".into()],
        http_urls: vec!["http://localhost:8545".into()],
        simulated: true,
        supports_eip1559: true,
        finality_depth: 1,
    }
}

impl NetworkConfig {
    pub fn select(names: &[&str]) -> Self {
        Self {
            selected_networks: names.iter().map(|x| x.to_string()).collect(),
            ..Default::default()
        }
    }

    /// Resolves the selected names into network descriptors, applying url
    /// overrides.
    pub fn selected_networks(&self) -> Result<Vec<EvmNetwork>, ConfigError> {
        if self.selected_networks.is_empty() {
            return Err(ConfigError::NoNetworkSelected);
        }

        self.selected_networks
            .iter()
            .map(|name| self.resolve(name))
            .collect()
    }

    /// The network the environment is built around.
    pub fn primary_network(&self) -> Result<EvmNetwork, ConfigError> {
        let mut selected = self.selected_networks()?;
        Ok(selected.remove(0))
    }

    fn resolve(&self, name: &str) -> Result<EvmNetwork, ConfigError> {
        let mut network = match lookup(&self.evm_networks, name) {
            Some(custom) => custom.clone(),
            None if name.eq_ignore_ascii_case(SIMULATED_NETWORK) => simulated_network(),
            None => return Err(ConfigError::UnknownNetwork(name.to_owned())),
        };

        if let Some(urls) = lookup(&self.rpc_http_urls, name) {
            network.http_urls = urls.clone();
        }

        if let Some(urls) = lookup(&self.rpc_ws_urls, name) {
            network.urls = urls.clone();
        }

        if !network.simulated && network.urls.is_empty() && network.http_urls.is_empty() {
            return Err(ConfigError::MissingRpcUrls(name.to_owned()));
        }

        Ok(network)
    }
}

// ============================================================================
// Node configuration fragments
// ============================================================================

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
pub struct NodeTomlConfig {
    #[serde(default)]
    pub base_config_toml: String,

    /// Applied to every chain section.
    #[serde(default)]
    pub common_chain_config_toml: String,

    /// Applied on top of the common fragment, keyed by decimal chain id.
    #[serde(default)]
    pub chain_config_toml_by_chain_id: BTreeMap<String, String>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
pub struct TestConfig {
    #[serde(default)]
    pub logging: LoggingConfig,

    #[serde(default)]
    pub network: NetworkConfig,

    #[serde(default)]
    pub node: NodeTomlConfig,
}

// ============================================================================
// Environment config
// ============================================================================

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
pub struct MockAdapterEnvConfig {
    pub container_name: String,

    #[serde(default)]
    pub impostors_path: Option<PathBuf>,
}

/// Describes pre-existing infrastructure an environment should reuse.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
pub struct TestEnvConfig {
    /// Container networks to join instead of creating one.
    #[serde(default)]
    pub networks: Vec<String>,

    #[serde(default)]
    pub mock_adapter: Option<MockAdapterEnvConfig>,
}

impl TestEnvConfig {
    /// Loads the file at `path` (format picked by extension), then lets
    /// `TESTENV__*` variables override individual keys.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let load = || -> Result<Self, ::config::ConfigError> {
            ::config::Config::builder()
                .add_source(::config::File::from(path).required(true))
                .add_source(::config::Environment::with_prefix("TESTENV").separator("__"))
                .build()?
                .try_deserialize()
        };

        load().map_err(|source| ConfigError::Load {
            path: path.to_path_buf(),
            source,
        })
    }
}
