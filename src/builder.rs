use std::{fmt::Debug, path::Path, sync::Arc};

use itertools::Itertools;
use testenv_core::{
    EvmNetwork, LogScanSettings, NodeCluster as _, NodeConfig, NodeOption, Platform,
    PrivateChain, TestConfig, TestEnvConfig, TestHandle,
};
use thiserror::Error;
use tracing::{error, info, info_span, warn};

use crate::{
    cleanup::{CleanupMode, CleanupRegistrar},
    logstream::LogStreamTeardown,
    CleanupOpts, EnvError, TestEnv, TestEnvHandle, Topology,
};

/// Variable pointing at a [`TestEnvConfig`] file to build the environment
/// from.
pub const TEST_ENV_CONFIG_PATH: &str = "TEST_ENV_CONFIG_PATH";

/// Rewrites the primary EVM network descriptor before nodes see it.
pub type EvmNetworkOption = Arc<dyn Fn(EvmNetwork) -> EvmNetwork + Send + Sync>;

#[derive(Error)]
pub enum BuildError<P: Platform> {
    #[error("test config must be set")]
    MissingTestConfig,

    /// The environment built so far is handed back so the caller can still
    /// tear it down.
    #[error("explicit cleanup type must be set when building test environment")]
    UnsetCleanup(TestEnvHandle<P>),

    #[error("test environment builder failed: {0}")]
    Env(#[from] EnvError),
}

impl<P: Platform> Debug for BuildError<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MissingTestConfig => write!(f, "MissingTestConfig"),
            Self::UnsetCleanup(env) => f.debug_tuple("UnsetCleanup").field(env).finish(),
            Self::Env(err) => f.debug_tuple("Env").field(err).finish(),
        }
    }
}

impl<P: Platform> BuildError<P> {
    /// The partially built environment, if the error carries one.
    pub fn into_env(self) -> Option<TestEnvHandle<P>> {
        match self {
            Self::UnsetCleanup(env) => Some(env),
            _ => None,
        }
    }
}

/// Collects the pieces a test needs and assembles them into a [`TestEnv`].
///
/// Nothing is validated until [`TestEnvBuilder::build`].
pub struct TestEnvBuilder<P: Platform> {
    platform: P,
    has_log_stream: bool,
    has_mock_adapter: bool,
    node_count: usize,
    node_options: Vec<NodeOption>,
    node_config_override: Option<NodeConfig>,
    secrets: String,
    is_evm: bool,
    private_chains: Vec<PrivateChain>,
    test_config: Option<TestConfig>,
    evm_network_options: Vec<EvmNetworkOption>,
    scan_settings: Option<LogScanSettings>,
    cleanup_mode: CleanupMode,
    test: Option<Arc<dyn TestHandle>>,
    env: Option<TestEnv<P>>,
}

impl<P: Platform> Debug for TestEnvBuilder<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TestEnvBuilder")
            .field("has_log_stream", &self.has_log_stream)
            .field("has_mock_adapter", &self.has_mock_adapter)
            .field("node_count", &self.node_count)
            .field("node_options", &self.node_options.len())
            .field("node_config_override", &self.node_config_override)
            .field("secrets", &format_args!("<{} bytes>", self.secrets.len()))
            .field("is_evm", &self.is_evm)
            .field("private_chains", &self.private_chains)
            .field("test_config", &self.test_config)
            .field("evm_network_options", &self.evm_network_options.len())
            .field("scan_settings", &self.scan_settings)
            .field("cleanup_mode", &self.cleanup_mode)
            .field("test", &self.test.as_ref().map(|x| x.name().to_owned()))
            .field("env", &self.env.is_some())
            .finish()
    }
}

impl<P: Platform> TestEnvBuilder<P> {
    pub fn new(platform: P) -> Self {
        Self {
            platform,
            has_log_stream: true,
            has_mock_adapter: false,
            node_count: 0,
            node_options: vec![],
            node_config_override: None,
            secrets: String::new(),
            is_evm: true,
            private_chains: vec![],
            test_config: None,
            evm_network_options: vec![],
            scan_settings: Some(LogScanSettings::default_policy()),
            cleanup_mode: CleanupMode::Unset,
            test: None,
            env: None,
        }
    }

    /// Uses `existing` as the environment, or creates one when `None`. When
    /// [`TEST_ENV_CONFIG_PATH`] is set, the file it points at is laid over
    /// whichever environment was picked.
    pub fn with_env(mut self, existing: Option<TestEnv<P>>) -> Result<Self, EnvError> {
        self.env = Some(self.resolve_env(existing)?);
        Ok(self)
    }

    fn resolve_env(&self, existing: Option<TestEnv<P>>) -> Result<TestEnv<P>, EnvError> {
        let config = match std::env::var_os(TEST_ENV_CONFIG_PATH) {
            Some(path) => Some(TestEnvConfig::from_file(Path::new(&path))?),
            None => None,
        };

        let env = match (existing, &config) {
            (Some(env), _) => env,
            // the config names a network to join, don't create another one
            (None, Some(config)) if !config.networks.is_empty() => {
                TestEnv::without_network(self.platform.clone())
            }
            (None, _) => TestEnv::new(self.platform.clone())?,
        };

        Ok(match config {
            Some(config) => env.with_env_config(config),
            None => env,
        })
    }

    /// Ties logging and cleanup to a running test.
    pub fn with_test_instance(mut self, test: Arc<dyn TestHandle>) -> Self {
        self.test = Some(test);
        self
    }

    pub fn with_test_config(mut self, config: TestConfig) -> Self {
        self.test_config = Some(config);
        self
    }

    pub fn without_log_stream(mut self) -> Self {
        self.has_log_stream = false;
        self
    }

    pub fn with_log_scan_settings(mut self, settings: LogScanSettings) -> Self {
        self.scan_settings = Some(settings);
        self
    }

    pub fn without_log_scan(mut self) -> Self {
        self.scan_settings = None;
        self
    }

    pub fn with_mock_adapter(mut self) -> Self {
        self.has_mock_adapter = true;
        self
    }

    pub fn with_cl_nodes(mut self, count: usize) -> Self {
        self.node_count = count;
        self
    }

    /// Appends node customizers; they run in the order given.
    pub fn with_cl_node_options(mut self, options: impl IntoIterator<Item = NodeOption>) -> Self {
        self.node_options.extend(options);
        self
    }

    /// Uses `config` as is instead of rendering one from the test config.
    pub fn with_cl_node_config(mut self, config: NodeConfig) -> Self {
        self.node_config_override = Some(config);
        self
    }

    pub fn with_secrets_config(mut self, secrets: impl Into<String>) -> Self {
        self.secrets = secrets.into();
        self
    }

    pub fn with_non_evm(mut self) -> Self {
        self.is_evm = false;
        self
    }

    pub fn with_private_chain(mut self, chain: PrivateChain) -> Self {
        self.private_chains.push(chain);
        self
    }

    pub fn with_private_chains(mut self, chains: Vec<PrivateChain>) -> Self {
        self.private_chains = chains;
        self
    }

    /// Replaces the EVM network options with `options`.
    pub fn with_evm_network_options(
        mut self,
        options: impl IntoIterator<Item = EvmNetworkOption>,
    ) -> Self {
        self.evm_network_options = options.into_iter().collect();
        self
    }

    pub fn with_standard_cleanup(mut self) -> Self {
        self.cleanup_mode = CleanupMode::Standard;
        self
    }

    pub fn with_custom_cleanup(mut self, f: impl FnOnce() + Send + 'static) -> Self {
        self.cleanup_mode = CleanupMode::Custom(Box::new(f));
        self
    }

    pub fn without_cleanup(mut self) -> Self {
        self.cleanup_mode = CleanupMode::Disabled;
        self
    }

    fn scan_enabled(&self) -> bool {
        self.scan_settings
            .as_ref()
            .is_some_and(LogScanSettings::is_enabled)
    }

    pub fn build(mut self) -> Result<TestEnvHandle<P>, BuildError<P>> {
        let test_name = self.test.as_ref().map(|x| x.name().to_owned());

        let span = info_span!("test_env", test = test_name.as_deref().unwrap_or("unnamed"));
        let _guard = span.enter();

        let test_config = self
            .test_config
            .take()
            .ok_or(BuildError::MissingTestConfig)?;

        let mut env = match self.env.take() {
            Some(env) => env,
            None => self.resolve_env(None)?,
        };

        env.test_config = test_config;
        env.test_name = test_name;

        let env = TestEnvHandle::new(env);
        let registrar = CleanupRegistrar::new(self.test.clone());

        if self.has_log_stream {
            env.start_log_stream(self.scan_settings.as_ref())?;

            // registered first so that it runs last
            if self.test.is_some() && !self.cleanup_mode.is_disabled() {
                let teardown = LogStreamTeardown {
                    env: env.clone(),
                    scan: self.scan_settings.clone(),
                    node_count: self.node_count,
                };

                registrar.register("log stream", move |test| teardown.run(test));
            } else {
                warn!("log stream won't be cleaned up, because either test instance is not set or cleanup is disabled");
            }
        }

        if self.has_mock_adapter {
            env.lock().start_mock_adapter()?;
        }

        match std::mem::take(&mut self.cleanup_mode) {
            CleanupMode::Standard => {
                let handle = env.clone();

                registrar.register("test env", move |test| {
                    let opts = CleanupOpts {
                        test_name: Some(test.name().to_owned()),
                        test_failed: test.failed(),
                    };

                    if let Err(err) = handle.cleanup(opts) {
                        error!(%err, "error cleaning up test environment");
                    }
                });
            }
            CleanupMode::Custom(f) => {
                registrar.register("custom", move |_| f());
            }
            CleanupMode::Disabled => {
                warn!("test environment won't be cleaned up");
            }
            CleanupMode::Unset => {
                return Err(BuildError::UnsetCleanup(env));
            }
        }

        if !self.has_log_stream && self.scan_enabled() {
            warn!("log scan settings provided, but log stream is disabled, no node logs will be scanned");
        }

        {
            let mut env = env.lock();

            let network = env.test_config.network.clone();
            let topology = env.arbitrate_networks(&network, &self.private_chains)?;

            // options only make sense for the single network case
            if self.is_evm && topology == Topology::Single {
                if let Some(primary) = env.evm_networks.first_mut() {
                    *primary = self
                        .evm_network_options
                        .iter()
                        .fold(primary.clone(), |network, option| option(network));
                }
            }

            if self.node_count > 0 {
                self.start_nodes(&mut env)?;
            }

            let chains = if env.private_chains.is_empty() {
                "none".to_string()
            } else {
                env.private_chains.iter().map(PrivateChain::describe).join("; ")
            };

            info!(
                private_chains = %chains,
                has_mock_adapter = self.has_mock_adapter,
                nodes = self.node_count,
                csa_keys = ?env.default_node_csa_keys,
                "built test environment"
            );
        }

        Ok(env)
    }

    /// Renders the node config against the environment's chains and starts
    /// the cluster.
    fn start_nodes(&self, env: &mut TestEnv<P>) -> Result<(), EnvError> {
        let chains = match self.is_evm {
            true => env
                .evm_networks
                .iter()
                .map(|network| {
                    if !network.simulated {
                        return Ok(network.clone());
                    }

                    // nodes sit inside the container network
                    let provider = env
                        .rpc_provider(network.chain_id)
                        .ok_or(EnvError::MissingRpcProvider(network.chain_id))?;

                    Ok(EvmNetwork {
                        urls: provider.private_ws_urls.clone(),
                        http_urls: provider.private_http_urls.clone(),
                        ..network.clone()
                    })
                })
                .collect::<Result<Vec<_>, EnvError>>()?,
            false => vec![],
        };

        let node_config = match &self.node_config_override {
            Some(config) => config.clone(),
            None => env
                .platform()
                .build_node_config(&chains, &env.test_config.node)?,
        };

        env.start_cluster(&node_config, self.node_count, &self.secrets, &self.node_options)?;

        let keys = match env.cluster() {
            Some(cluster) => cluster.node_csa_keys()?,
            None => vec![],
        };

        env.default_node_csa_keys = keys;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;
    use testenv_core::{LogLevel, NodeSpec};
    use testenv_testing::{live_test_config, simulated_test_config, FakePlatform};

    use super::*;

    #[derive(Debug, Clone)]
    enum Op {
        WithoutLogStream,
        WithMockAdapter,
        ClNodes(usize),
        Secrets(String),
        NonEvm,
        PrivateChains(Vec<i64>),
        ScanThreshold(usize),
        WithoutLogScan,
        LiveConfig,
        SimulatedConfig,
        StandardCleanup,
        WithoutCleanup,
    }

    fn apply(builder: TestEnvBuilder<FakePlatform>, op: &Op) -> TestEnvBuilder<FakePlatform> {
        match op {
            Op::WithoutLogStream => builder.without_log_stream(),
            Op::WithMockAdapter => builder.with_mock_adapter(),
            Op::ClNodes(n) => builder.with_cl_nodes(*n),
            Op::Secrets(s) => builder.with_secrets_config(s.clone()),
            Op::NonEvm => builder.with_non_evm(),
            Op::PrivateChains(ids) => {
                builder.with_private_chains(ids.iter().copied().map(PrivateChain::new).collect())
            }
            Op::ScanThreshold(threshold) => builder.with_log_scan_settings(LogScanSettings {
                failing_level: LogLevel::Error,
                threshold: *threshold,
                allowed_messages: vec![],
            }),
            Op::WithoutLogScan => builder.without_log_scan(),
            Op::LiveConfig => builder.with_test_config(live_test_config()),
            Op::SimulatedConfig => builder.with_test_config(simulated_test_config()),
            Op::StandardCleanup => builder.with_standard_cleanup(),
            Op::WithoutCleanup => builder.without_cleanup(),
        }
    }

    fn any_op() -> impl Strategy<Value = Op> {
        prop_oneof![
            Just(Op::WithoutLogStream),
            Just(Op::WithMockAdapter),
            (0usize..8).prop_map(Op::ClNodes),
            "[a-z]{0,12}".prop_map(Op::Secrets),
            Just(Op::NonEvm),
            prop::collection::vec(1i64..5000, 0..4).prop_map(Op::PrivateChains),
            (0usize..5).prop_map(Op::ScanThreshold),
            Just(Op::WithoutLogScan),
            Just(Op::LiveConfig),
            Just(Op::SimulatedConfig),
            Just(Op::StandardCleanup),
            Just(Op::WithoutCleanup),
        ]
    }

    proptest! {
        #[test]
        fn setters_are_idempotent(ops in prop::collection::vec(any_op(), 0..10)) {
            let once = ops
                .iter()
                .fold(TestEnvBuilder::new(FakePlatform::new()), apply);

            let twice = ops
                .iter()
                .fold(TestEnvBuilder::new(FakePlatform::new()), |b, op| apply(apply(b, op), op));

            prop_assert_eq!(format!("{once:?}"), format!("{twice:?}"));
        }
    }

    #[test]
    fn append_style_setters_keep_order() {
        let noop: NodeOption = Arc::new(|_: &mut NodeSpec| {});

        let builder = TestEnvBuilder::new(FakePlatform::new())
            .with_private_chain(PrivateChain::new(3))
            .with_private_chain(PrivateChain::new(1))
            .with_private_chain(PrivateChain::new(3))
            .with_cl_node_options([noop.clone()])
            .with_cl_node_options([noop.clone(), noop]);

        let ids: Vec<_> = builder.private_chains.iter().map(|x| x.chain_id).collect();
        assert_eq!(ids, vec![3, 1, 3]);
        assert_eq!(builder.node_options.len(), 3);

        let builder = builder.with_private_chains(vec![PrivateChain::new(7)]);
        assert_eq!(builder.private_chains.len(), 1);
    }

    #[test]
    fn evm_network_options_replace() {
        let rename: EvmNetworkOption = Arc::new(|network: EvmNetwork| EvmNetwork {
            name: "renamed".into(),
            ..network
        });

        let builder = TestEnvBuilder::new(FakePlatform::new())
            .with_evm_network_options([rename.clone(), rename.clone()])
            .with_evm_network_options([rename]);

        assert_eq!(builder.evm_network_options.len(), 1);
    }

    #[test]
    fn defaults() {
        let builder = TestEnvBuilder::new(FakePlatform::new());

        assert!(builder.has_log_stream);
        assert!(builder.is_evm);
        assert_eq!(builder.scan_settings, Some(LogScanSettings::default_policy()));
        assert!(matches!(builder.cleanup_mode, CleanupMode::Unset));
    }

    #[test]
    fn missing_test_config() {
        let platform = FakePlatform::new();

        let result = TestEnvBuilder::new(platform.clone())
            .with_standard_cleanup()
            .build();

        assert!(matches!(result, Err(BuildError::MissingTestConfig)));
        assert!(platform.events().is_empty());
    }
}
