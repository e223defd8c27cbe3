use std::fmt::Display;

use serde::{Deserialize, Serialize};

use crate::ChainId;

/// Descriptor of an EVM-compatible network as seen by clients and nodes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvmNetwork {
    pub name: String,
    pub chain_id: ChainId,

    /// Websocket endpoints
    #[serde(default)]
    pub urls: Vec<String>,

    #[serde(default)]
    pub http_urls: Vec<String>,

    #[serde(default)]
    pub simulated: bool,

    #[serde(default)]
    pub supports_eip1559: bool,

    #[serde(default)]
    pub finality_depth: u64,
}

impl EvmNetwork {
    pub fn new(name: impl Into<String>, chain_id: ChainId) -> Self {
        Self {
            name: name.into(),
            chain_id,
            urls: vec![],
            http_urls: vec![],
            simulated: false,
            supports_eip1559: false,
            finality_depth: 0,
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionLayer {
    #[default]
    Geth,
    Nethermind,
    Besu,
    Erigon,
    Reth,
}

impl Display for ExecutionLayer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}",
            match self {
                Self::Geth => "geth",
                Self::Nethermind => "nethermind",
                Self::Besu => "besu",
                Self::Erigon => "erigon",
                Self::Reth => "reth",
            }
        )
    }
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ConsensusType {
    #[default]
    Pow,
    Pos,
}

impl Display for ConsensusType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pow => write!(f, "pow"),
            Self::Pos => write!(f, "pos"),
        }
    }
}

/// A private chain the environment is asked to launch.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct PrivateChain {
    pub chain_id: ChainId,

    #[serde(default)]
    pub execution_layer: ExecutionLayer,

    #[serde(default)]
    pub consensus_type: ConsensusType,

    /// Docker image tag of the execution client, latest if unset.
    #[serde(default)]
    pub version: Option<String>,

    /// Container networks the chain joins; filled in by the environment
    /// right before launch.
    #[serde(default)]
    pub container_networks: Vec<String>,

    #[serde(default)]
    pub wait_for_finalization: bool,
}

impl PrivateChain {
    pub fn new(chain_id: ChainId) -> Self {
        Self {
            chain_id,
            execution_layer: Default::default(),
            consensus_type: Default::default(),
            version: None,
            container_networks: vec![],
            wait_for_finalization: false,
        }
    }

    pub fn describe(&self) -> String {
        format!(
            "chain id: {}, execution layer: {}, consensus type: {}, version: {}",
            self.chain_id,
            self.execution_layer,
            self.consensus_type,
            self.version.as_deref().unwrap_or("latest"),
        )
    }
}

/// Endpoints of a single chain, split by who is expected to dial them.
///
/// Public urls are reachable from the test process, private urls from inside
/// the container network.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
pub struct RpcProvider {
    pub public_http_urls: Vec<String>,
    pub public_ws_urls: Vec<String>,
    pub private_http_urls: Vec<String>,
    pub private_ws_urls: Vec<String>,
}

impl RpcProvider {
    pub fn new(
        public_http_urls: Vec<String>,
        public_ws_urls: Vec<String>,
        private_http_urls: Vec<String>,
        private_ws_urls: Vec<String>,
    ) -> Self {
        Self {
            public_http_urls,
            public_ws_urls,
            private_http_urls,
            private_ws_urls,
        }
    }

    /// Provider for a network nobody launched: private slots mirror the
    /// public ones.
    pub fn from_public(network: &EvmNetwork) -> Self {
        Self::new(
            network.http_urls.clone(),
            network.urls.clone(),
            network.http_urls.clone(),
            network.urls.clone(),
        )
    }
}
