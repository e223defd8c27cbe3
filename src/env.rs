use std::{
    collections::BTreeMap,
    fmt::Debug,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use testenv_core::{
    ChainId, ClusterRequest, ConfigError, ContainerNetwork, EvmNetwork, MockAdapterRequest,
    NodeCluster, NodeConfig, NodeOption, Platform, PlatformError, PrivateChain, Resource,
    RpcProvider, StartedChain, TestConfig, TestEnvConfig,
};
use thiserror::Error;
use tracing::{error, info, warn};

#[derive(Debug, Error)]
pub enum EnvError {
    #[error("cannot start {component} without a container network")]
    NoNetwork { component: &'static str },

    #[error("rpc provider for chain {0} not found")]
    MissingRpcProvider(ChainId),

    #[error("a node cluster is already running")]
    ClusterExists,

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Platform(#[from] PlatformError),
}

#[derive(Debug, Clone, Default)]
pub struct CleanupOpts {
    pub test_name: Option<String>,
    pub test_failed: bool,
}

/// Everything a test runs against: the container network and the chains,
/// mock adapter, node cluster and log stream attached to it.
pub struct TestEnv<P: Platform> {
    platform: P,
    network: Option<ContainerNetwork>,
    owns_network: bool,
    env_config: Option<TestEnvConfig>,
    pub(crate) test_config: TestConfig,
    pub(crate) test_name: Option<String>,
    pub(crate) log_stream: Option<Arc<P::LogStream>>,
    mock_adapter: Option<P::MockAdapter>,
    chains: Vec<(ChainId, P::Chain)>,
    pub(crate) evm_networks: Vec<EvmNetwork>,
    pub(crate) rpc_providers: BTreeMap<ChainId, RpcProvider>,
    pub(crate) private_chains: Vec<PrivateChain>,
    cluster: Option<P::Cluster>,
    node_containers: Vec<String>,
    pub(crate) default_node_csa_keys: Vec<String>,
    pub(crate) is_simulated_network: bool,
}

impl<P: Platform> TestEnv<P> {
    /// An environment on a freshly created container network, removed again
    /// on cleanup.
    pub fn new(platform: P) -> Result<Self, EnvError> {
        let network = platform.create_network()?;
        info!(network = %network.name, "container network created");

        let mut env = Self::without_network(platform);
        env.network = Some(network);
        env.owns_network = true;

        Ok(env)
    }

    pub fn without_network(platform: P) -> Self {
        Self {
            platform,
            network: None,
            owns_network: false,
            env_config: None,
            test_config: TestConfig::default(),
            test_name: None,
            log_stream: None,
            mock_adapter: None,
            chains: vec![],
            evm_networks: vec![],
            rpc_providers: BTreeMap::new(),
            private_chains: vec![],
            cluster: None,
            node_containers: vec![],
            default_node_csa_keys: vec![],
            is_simulated_network: false,
        }
    }

    /// Joins the first network named by `config` and keeps the rest of it for
    /// later steps.
    pub fn with_env_config(mut self, config: TestEnvConfig) -> Self {
        if let Some(name) = config.networks.first() {
            if let Some(owned) = self.network.take().filter(|_| self.owns_network) {
                if let Err(err) = self.platform.remove_network(&owned) {
                    warn!(network = %owned.name, %err, "failed to remove replaced network");
                }
            }

            info!(network = %name, "joining existing container network");
            self.network = Some(ContainerNetwork::new(name.clone()));
            self.owns_network = false;
        }

        self.env_config = Some(config);
        self
    }

    pub fn platform(&self) -> &P {
        &self.platform
    }

    pub fn container_network(&self) -> Option<&ContainerNetwork> {
        self.network.as_ref()
    }

    pub fn env_config(&self) -> Option<&TestEnvConfig> {
        self.env_config.as_ref()
    }

    pub fn test_config(&self) -> &TestConfig {
        &self.test_config
    }

    pub fn test_name(&self) -> Option<&str> {
        self.test_name.as_deref()
    }

    pub fn log_stream(&self) -> Option<&Arc<P::LogStream>> {
        self.log_stream.as_ref()
    }

    pub fn mock_adapter(&self) -> Option<&P::MockAdapter> {
        self.mock_adapter.as_ref()
    }

    pub fn cluster(&self) -> Option<&P::Cluster> {
        self.cluster.as_ref()
    }

    /// Container names of the nodes started, in node order. Kept after the
    /// cluster is stopped so logs can still be looked up.
    pub fn node_containers(&self) -> &[String] {
        &self.node_containers
    }

    pub fn evm_networks(&self) -> &[EvmNetwork] {
        &self.evm_networks
    }

    pub fn rpc_provider(&self, chain_id: ChainId) -> Option<&RpcProvider> {
        self.rpc_providers.get(&chain_id)
    }

    pub fn rpc_providers(&self) -> &BTreeMap<ChainId, RpcProvider> {
        &self.rpc_providers
    }

    pub fn private_chains(&self) -> &[PrivateChain] {
        &self.private_chains
    }

    pub fn chain_ids(&self) -> Vec<ChainId> {
        self.chains.iter().map(|(id, _)| *id).collect()
    }

    pub fn default_node_csa_keys(&self) -> &[String] {
        &self.default_node_csa_keys
    }

    pub fn is_simulated_network(&self) -> bool {
        self.is_simulated_network
    }

    fn require_network(&self, component: &'static str) -> Result<&ContainerNetwork, EnvError> {
        self.network.as_ref().ok_or(EnvError::NoNetwork { component })
    }

    pub fn start_mock_adapter(&mut self) -> Result<(), EnvError> {
        let network = self.require_network("mock adapter")?.name.clone();

        let (container_name, impostors_path) = match self
            .env_config
            .as_ref()
            .and_then(|x| x.mock_adapter.as_ref())
        {
            Some(x) => (Some(x.container_name.clone()), x.impostors_path.clone()),
            None => (None, None),
        };

        let adapter = self.platform.start_mock_adapter(MockAdapterRequest {
            networks: vec![network],
            container_name,
            impostors_path,
            log_stream: self.log_stream.clone(),
        })?;

        info!("mock adapter started");
        self.mock_adapter = Some(adapter);

        Ok(())
    }

    /// Launches `chain` on the environment's network and keeps its runtime
    /// for cleanup.
    pub fn start_ethereum_network(
        &mut self,
        chain: &PrivateChain,
    ) -> Result<(EvmNetwork, RpcProvider), EnvError> {
        let network = self.require_network("private chain")?.name.clone();

        let mut chain = chain.clone();
        chain.container_networks = vec![network];

        let StartedChain {
            network,
            rpc_provider,
            runtime,
        } = self.platform.start_ethereum_network(&chain)?;

        info!(chain = %chain.describe(), "private chain started");
        self.chains.push((network.chain_id, runtime));

        Ok((network, rpc_provider))
    }

    pub fn start_cluster(
        &mut self,
        node_config: &NodeConfig,
        node_count: usize,
        secrets: &str,
        options: &[NodeOption],
    ) -> Result<(), EnvError> {
        if self.cluster.is_some() {
            return Err(EnvError::ClusterExists);
        }

        let networks: Vec<_> = self.network.iter().map(|x| x.name.clone()).collect();

        let cluster = self.platform.start_cluster(ClusterRequest {
            node_config,
            node_count,
            secrets,
            test_config: &self.test_config,
            options,
            networks: &networks,
            log_stream: self.log_stream.clone(),
        })?;

        self.node_containers = cluster
            .nodes()
            .iter()
            .map(|x| x.container_name.clone())
            .collect();

        info!(nodes = node_count, "node cluster started");
        self.cluster = Some(cluster);

        Ok(())
    }

    /// Stops everything the environment started, most recent first: the node
    /// cluster, the chains, the mock adapter, and finally the container
    /// network if it was created here. Keeps going past failures and returns
    /// the first one.
    pub fn cleanup(&mut self, opts: CleanupOpts) -> Result<(), EnvError> {
        info!(
            test = opts.test_name.as_deref().unwrap_or("unnamed"),
            failed = opts.test_failed,
            "cleaning up test environment"
        );

        let mut first: Option<EnvError> = None;

        let mut record = |result: Result<(), PlatformError>| {
            if let Err(err) = result {
                error!(%err, "error during environment cleanup");
                first.get_or_insert(err.into());
            }
        };

        if let Some(mut cluster) = self.cluster.take() {
            record(cluster.stop());
        }

        while let Some((_, mut chain)) = self.chains.pop() {
            record(chain.stop());
        }

        if let Some(mut adapter) = self.mock_adapter.take() {
            record(adapter.stop());
        }

        if self.owns_network {
            if let Some(network) = self.network.take() {
                record(self.platform.remove_network(&network));
            }

            self.owns_network = false;
        }

        match first {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

/// Shared handle to a [`TestEnv`]; clones point at the same environment.
pub struct TestEnvHandle<P: Platform>(Arc<Mutex<TestEnv<P>>>);

impl<P: Platform> Clone for TestEnvHandle<P> {
    fn clone(&self) -> Self {
        Self(self.0.clone())
    }
}

impl<P: Platform> Debug for TestEnv<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TestEnv")
            .field("network", &self.network)
            .field("evm_networks", &self.evm_networks)
            .field("is_simulated_network", &self.is_simulated_network)
            .field("nodes", &self.node_containers.len())
            .finish()
    }
}

impl<P: Platform> Debug for TestEnvHandle<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("TestEnvHandle").field(&*self.lock()).finish()
    }
}

impl<P: Platform> TestEnvHandle<P> {
    pub fn new(env: TestEnv<P>) -> Self {
        Self(Arc::new(Mutex::new(env)))
    }

    /// Locks the environment. A panic in another holder does not make it
    /// unusable, since teardown runs while failing tests unwind.
    pub fn lock(&self) -> MutexGuard<'_, TestEnv<P>> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn evm_networks(&self) -> Vec<EvmNetwork> {
        self.lock().evm_networks.clone()
    }

    pub fn rpc_provider(&self, chain_id: ChainId) -> Option<RpcProvider> {
        self.lock().rpc_providers.get(&chain_id).cloned()
    }

    pub fn rpc_providers(&self) -> BTreeMap<ChainId, RpcProvider> {
        self.lock().rpc_providers.clone()
    }

    pub fn is_simulated_network(&self) -> bool {
        self.lock().is_simulated_network
    }

    pub fn container_network(&self) -> Option<ContainerNetwork> {
        self.lock().network.clone()
    }

    pub fn test_config(&self) -> TestConfig {
        self.lock().test_config.clone()
    }

    pub fn private_chains(&self) -> Vec<PrivateChain> {
        self.lock().private_chains.clone()
    }

    pub fn default_node_csa_keys(&self) -> Vec<String> {
        self.lock().default_node_csa_keys.clone()
    }

    pub fn log_stream(&self) -> Option<Arc<P::LogStream>> {
        self.lock().log_stream.clone()
    }

    pub fn has_mock_adapter(&self) -> bool {
        self.lock().mock_adapter.is_some()
    }

    pub fn has_cluster(&self) -> bool {
        self.lock().cluster.is_some()
    }

    pub fn cleanup(&self, opts: CleanupOpts) -> Result<(), EnvError> {
        self.lock().cleanup(opts)
    }

    /// Unwraps the environment if this is the last handle to it.
    pub fn into_env(self) -> Result<TestEnv<P>, Self> {
        match Arc::try_unwrap(self.0) {
            Ok(mutex) => Ok(mutex.into_inner().unwrap_or_else(PoisonError::into_inner)),
            Err(shared) => Err(Self(shared)),
        }
    }
}

#[cfg(test)]
mod tests {
    use testenv_core::TestEnvConfig;
    use testenv_testing::{Event, FakePlatform, TestFault};

    use super::*;

    #[test]
    fn owned_network_is_removed_on_cleanup() {
        let platform = FakePlatform::new();
        let mut env = TestEnv::new(platform.clone()).unwrap();

        env.start_mock_adapter().unwrap();
        env.start_ethereum_network(&PrivateChain::new(1337)).unwrap();
        env.start_ethereum_network(&PrivateChain::new(2337)).unwrap();

        env.cleanup(CleanupOpts::default()).unwrap();

        let events = platform.events();
        let tail = &events[events.len() - 4..];

        assert_eq!(
            tail,
            &[
                Event::ChainStopped(2337),
                Event::ChainStopped(1337),
                Event::MockAdapterStopped,
                Event::NetworkRemoved("testenv-net-0".into()),
            ]
        );
        assert!(env.container_network().is_none());
    }

    #[test]
    fn joined_network_is_left_alone() {
        let platform = FakePlatform::new();

        let mut env = TestEnv::without_network(platform.clone()).with_env_config(TestEnvConfig {
            networks: vec!["shared".into()],
            mock_adapter: None,
        });

        assert_eq!(env.container_network().unwrap().name, "shared");

        env.cleanup(CleanupOpts::default()).unwrap();

        assert!(platform.events().is_empty());
    }

    #[test]
    fn chain_requires_network() {
        let mut env = TestEnv::without_network(FakePlatform::new());

        let err = env
            .start_ethereum_network(&PrivateChain::new(1337))
            .unwrap_err();

        assert!(matches!(
            err,
            EnvError::NoNetwork {
                component: "private chain"
            }
        ));
    }

    #[test]
    fn chain_joins_env_network() {
        let platform = FakePlatform::new();
        let mut env = TestEnv::new(platform.clone()).unwrap();

        env.start_ethereum_network(&PrivateChain::new(1337)).unwrap();

        assert!(platform.events().contains(&Event::ChainStarted {
            chain_id: 1337,
            networks: vec!["testenv-net-0".into()],
        }));
    }

    #[test]
    fn network_creation_failure() {
        let platform = FakePlatform::new().with_fault(TestFault::NetworkCreate);

        let result = TestEnv::new(platform);

        assert!(matches!(result, Err(EnvError::Platform(_))));
    }

    #[test]
    fn handle_unwraps_when_unique() {
        let handle = TestEnvHandle::new(TestEnv::without_network(FakePlatform::new()));
        let other = handle.clone();

        let handle = handle.into_env().unwrap_err();
        drop(other);

        assert!(format!("{handle:?}").starts_with("TestEnvHandle(TestEnv {"));

        assert!(handle.into_env().is_ok());
    }
}
