use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

mod chain;
pub mod config;
pub mod harness;
pub mod logstream;
pub mod node_config;
pub mod scan;

pub use chain::*;
pub use config::{
    ConfigError, LogStreamConfig, LogTarget, LoggingConfig, MockAdapterEnvConfig, NetworkConfig,
    NodeTomlConfig, TestConfig, TestEnvConfig,
};
pub use harness::{CleanupFn, TestHandle, TestInstance};
pub use logstream::{LogContent, LogProcessError, LogProcessor, LogStream, LogStreamError};
pub use scan::{AllowedLogMessage, LogLevel, LogScanSettings, ScanError};

/// The EVM chain id of a network
pub type ChainId = i64;

/// Rendered node configuration, as handed to the cluster launcher
pub type NodeConfig = toml::Table;

/// Customizes a node right before its container is created
pub type NodeOption = Arc<dyn Fn(&mut NodeSpec) + Send + Sync>;

#[derive(Debug, Error)]
pub enum PlatformError {
    #[error("failed to start {component}: {source}")]
    Startup {
        component: &'static str,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("failed to stop {component}: {source}")]
    Shutdown {
        component: &'static str,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("node config error: {0}")]
    NodeConfig(#[from] node_config::NodeConfigError),

    #[error("container runtime error: {0}")]
    Internal(#[source] Box<dyn std::error::Error + Send + Sync>),
}

impl PlatformError {
    pub fn internal<T>(value: T) -> Self
    where
        T: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        PlatformError::Internal(value.into())
    }

    pub fn startup<T>(component: &'static str, value: T) -> Self
    where
        T: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        PlatformError::Startup {
            component,
            source: value.into(),
        }
    }

    pub fn shutdown<T>(component: &'static str, value: T) -> Self
    where
        T: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        PlatformError::Shutdown {
            component,
            source: value.into(),
        }
    }
}

/// A container network that chains, nodes and the mock adapter attach to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerNetwork {
    pub name: String,
}

impl ContainerNetwork {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

/// Launch parameters of a single node, open to [`NodeOption`] customizers.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeSpec {
    pub container_name: String,
    pub image: Option<String>,
    pub version: Option<String>,
    pub config: NodeConfig,
    pub secrets: String,
}

impl NodeSpec {
    pub fn new(container_name: impl Into<String>, config: NodeConfig, secrets: &str) -> Self {
        Self {
            container_name: container_name.into(),
            image: None,
            version: None,
            config,
            secrets: secrets.to_owned(),
        }
    }
}

/// A long-lived component started by the platform.
pub trait Resource: Send + 'static {
    fn stop(&mut self) -> Result<(), PlatformError>;
}

pub trait NodeCluster: Resource {
    fn nodes(&self) -> &[NodeSpec];

    /// One CSA public key per node, in node order.
    fn node_csa_keys(&self) -> Result<Vec<String>, PlatformError>;
}

/// Outcome of starting a private chain.
pub struct StartedChain<C> {
    pub network: EvmNetwork,
    pub rpc_provider: RpcProvider,
    pub runtime: C,
}

pub struct MockAdapterRequest<L> {
    pub networks: Vec<String>,
    pub container_name: Option<String>,
    pub impostors_path: Option<std::path::PathBuf>,
    pub log_stream: Option<Arc<L>>,
}

pub struct ClusterRequest<'a, L> {
    pub node_config: &'a NodeConfig,
    pub node_count: usize,
    pub secrets: &'a str,
    pub test_config: &'a TestConfig,
    pub options: &'a [NodeOption],
    pub networks: &'a [String],
    pub log_stream: Option<Arc<L>>,
}

/// The container runtime and the launchers that run on top of it.
///
/// Every call may block on I/O. Implementations own whatever parallelism the
/// launched components need; callers drive them from a single thread.
pub trait Platform: Clone + Send + Sync + 'static {
    type LogStream: LogStream;
    type Chain: Resource;
    type MockAdapter: Resource;
    type Cluster: NodeCluster;

    fn create_network(&self) -> Result<ContainerNetwork, PlatformError>;

    fn remove_network(&self, network: &ContainerNetwork) -> Result<(), PlatformError>;

    fn new_log_stream(
        &self,
        test_name: Option<&str>,
        logging: &LoggingConfig,
    ) -> Result<Self::LogStream, PlatformError>;

    fn start_mock_adapter(
        &self,
        request: MockAdapterRequest<Self::LogStream>,
    ) -> Result<Self::MockAdapter, PlatformError>;

    fn start_ethereum_network(
        &self,
        chain: &PrivateChain,
    ) -> Result<StartedChain<Self::Chain>, PlatformError>;

    fn build_node_config(
        &self,
        chains: &[EvmNetwork],
        node: &NodeTomlConfig,
    ) -> Result<NodeConfig, PlatformError> {
        let config = node_config::build_node_config(
            chains,
            &node.base_config_toml,
            &node.common_chain_config_toml,
            &node.chain_config_toml_by_chain_id,
        )?;

        Ok(config)
    }

    fn start_cluster(
        &self,
        request: ClusterRequest<'_, Self::LogStream>,
    ) -> Result<Self::Cluster, PlatformError>;
}
