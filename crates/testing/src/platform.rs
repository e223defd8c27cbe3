//! In-process stand-ins for the container runtime and its launchers.
//!
//! Nothing is started for real. Every call is appended to a [`Journal`]
//! shared by all clones of the platform and by everything it creates, so
//! tests can assert on what happened and in which order.

use std::{
    collections::BTreeMap,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex, PoisonError,
    },
};

use testenv_core::{
    ChainId, ClusterRequest, ContainerNetwork, EvmNetwork, LogContent, LogProcessError,
    LogStream, LogStreamError, LogTarget, LoggingConfig, MockAdapterRequest, NodeCluster,
    NodeConfig, NodeSpec, Platform, PlatformError, PrivateChain, Resource, RpcProvider,
    ScanError, StartedChain,
};

use crate::TestFault;

#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    NetworkCreated(String),
    NetworkRemoved(String),
    LogStreamStarted {
        test_name: Option<String>,
        targets: Vec<LogTarget>,
    },
    LogsProcessingStarted(String),
    LogsProcessingFinished(String),
    LogStreamFlushed,
    LogLocationsSaved,
    MockAdapterStarted {
        networks: Vec<String>,
        container_name: Option<String>,
    },
    MockAdapterStopped,
    ChainStarted {
        chain_id: ChainId,
        networks: Vec<String>,
    },
    ChainStopped(ChainId),
    ClusterStarted {
        nodes: usize,
        networks: Vec<String>,
        node_config: NodeConfig,
    },
    ClusterStopped,
}

#[derive(Debug, Clone, Default)]
pub struct Journal(Arc<Mutex<Vec<Event>>>);

impl Journal {
    pub fn record(&self, event: Event) {
        self.0
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event);
    }

    pub fn events(&self) -> Vec<Event> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Index of the first event matching `predicate`.
    pub fn position(&self, predicate: impl Fn(&Event) -> bool) -> Option<usize> {
        self.events().iter().position(predicate)
    }

    pub fn count(&self, predicate: impl Fn(&Event) -> bool) -> usize {
        self.events().iter().filter(|x| predicate(x)).count()
    }
}

/// Container name of the node at `index`.
pub fn node_container_name(index: usize) -> String {
    format!("cl-node-{index}")
}

#[derive(Clone, Default)]
pub struct FakePlatform {
    journal: Journal,
    fault: TestFault,
    container_logs: Arc<BTreeMap<String, Vec<String>>>,
    networks_created: Arc<AtomicUsize>,
}

impl FakePlatform {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_fault(mut self, fault: TestFault) -> Self {
        self.fault = fault;
        self
    }

    /// Lines the log stream will hold for `container`.
    pub fn with_container_logs<I, S>(mut self, container: impl Into<String>, lines: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Arc::make_mut(&mut self.container_logs)
            .insert(container.into(), lines.into_iter().map(Into::into).collect());

        self
    }

    pub fn journal(&self) -> &Journal {
        &self.journal
    }

    pub fn events(&self) -> Vec<Event> {
        self.journal.events()
    }
}

impl Platform for FakePlatform {
    type LogStream = FakeLogStream;
    type Chain = FakeChain;
    type MockAdapter = FakeMockAdapter;
    type Cluster = FakeCluster;

    fn create_network(&self) -> Result<ContainerNetwork, PlatformError> {
        self.fault.check(TestFault::NetworkCreate, "container network")?;

        let seq = self.networks_created.fetch_add(1, Ordering::SeqCst);
        let network = ContainerNetwork::new(format!("testenv-net-{seq}"));

        self.journal
            .record(Event::NetworkCreated(network.name.clone()));

        Ok(network)
    }

    fn remove_network(&self, network: &ContainerNetwork) -> Result<(), PlatformError> {
        self.journal
            .record(Event::NetworkRemoved(network.name.clone()));

        Ok(())
    }

    fn new_log_stream(
        &self,
        test_name: Option<&str>,
        logging: &LoggingConfig,
    ) -> Result<FakeLogStream, PlatformError> {
        self.fault.check(TestFault::LogStreamStart, "log stream")?;

        let targets = logging.log_stream.log_targets.clone();

        self.journal.record(Event::LogStreamStarted {
            test_name: test_name.map(ToOwned::to_owned),
            targets: targets.clone(),
        });

        Ok(FakeLogStream {
            journal: self.journal.clone(),
            fault: self.fault,
            test_name: test_name.unwrap_or("unnamed").to_owned(),
            targets,
            logs: self.container_logs.clone(),
            intake: Mutex::new(()),
        })
    }

    fn start_mock_adapter(
        &self,
        request: MockAdapterRequest<FakeLogStream>,
    ) -> Result<FakeMockAdapter, PlatformError> {
        self.fault.check(TestFault::MockAdapterStart, "mock adapter")?;

        self.journal.record(Event::MockAdapterStarted {
            networks: request.networks,
            container_name: request.container_name,
        });

        Ok(FakeMockAdapter {
            journal: self.journal.clone(),
        })
    }

    fn start_ethereum_network(
        &self,
        chain: &PrivateChain,
    ) -> Result<StartedChain<FakeChain>, PlatformError> {
        self.fault.check(TestFault::ChainStart, "private chain")?;

        let id = chain.chain_id;
        let port = 10_000 + id.rem_euclid(50_000);

        let network = EvmNetwork {
            urls: vec![format!("ws://127.0.0.1:{port}")],
            http_urls: vec![format!("http://127.0.0.1:{port}")],
            simulated: true,
            supports_eip1559: true,
            finality_depth: 1,
            ..EvmNetwork::new(format!("Simulated {} {id}", chain.execution_layer), id)
        };

        let rpc_provider = RpcProvider::new(
            network.http_urls.clone(),
            network.urls.clone(),
            vec![format!("http://geth-{id}:8545")],
            vec![format!("ws://geth-{id}:8546")],
        );

        self.journal.record(Event::ChainStarted {
            chain_id: id,
            networks: chain.container_networks.clone(),
        });

        Ok(StartedChain {
            network,
            rpc_provider,
            runtime: FakeChain {
                chain_id: id,
                journal: self.journal.clone(),
            },
        })
    }

    fn start_cluster(
        &self,
        request: ClusterRequest<'_, FakeLogStream>,
    ) -> Result<FakeCluster, PlatformError> {
        self.fault.check(TestFault::ClusterStart, "node cluster")?;

        let nodes = (0..request.node_count)
            .map(|i| {
                let mut spec = NodeSpec::new(
                    node_container_name(i),
                    request.node_config.clone(),
                    request.secrets,
                );

                for option in request.options {
                    option(&mut spec);
                }

                spec
            })
            .collect();

        self.journal.record(Event::ClusterStarted {
            nodes: request.node_count,
            networks: request.networks.to_vec(),
            node_config: request.node_config.clone(),
        });

        Ok(FakeCluster {
            nodes,
            fault: self.fault,
            journal: self.journal.clone(),
        })
    }
}

pub struct FakeLogStream {
    journal: Journal,
    fault: TestFault,
    test_name: String,
    targets: Vec<LogTarget>,
    logs: Arc<BTreeMap<String, Vec<String>>>,
    intake: Mutex<()>,
}

impl FakeLogStream {
    pub fn targets(&self) -> &[LogTarget] {
        &self.targets
    }

    fn replay(
        &self,
        container: &str,
        f: &mut dyn FnMut(&LogContent) -> Result<(), ScanError>,
    ) -> Result<(), LogProcessError> {
        self.fault.check_stream(TestFault::ContainerLogs)?;

        let lines = self
            .logs
            .get(container)
            .ok_or_else(|| LogStreamError::ContainerNotFound(container.to_owned()))?;

        for line in lines {
            f(&LogContent {
                container: container.to_owned(),
                content: line.clone(),
            })?;
        }

        Ok(())
    }
}

impl LogStream for FakeLogStream {
    fn process_container_logs(
        &self,
        container: &str,
        f: &mut dyn FnMut(&LogContent) -> Result<(), ScanError>,
    ) -> Result<(), LogProcessError> {
        // processing a second container while one is in flight deadlocks a
        // real stream, so fail loudly instead
        let _intake = self
            .intake
            .try_lock()
            .map_err(|_| LogStreamError::internal("concurrent log processing"))?;

        self.journal
            .record(Event::LogsProcessingStarted(container.to_owned()));

        let result = self.replay(container, f);

        self.journal
            .record(Event::LogsProcessingFinished(container.to_owned()));

        result
    }

    fn flush_and_shutdown(&self) -> Result<(), LogStreamError> {
        self.fault.check_stream(TestFault::LogStreamFlush)?;
        self.journal.record(Event::LogStreamFlushed);

        Ok(())
    }

    fn log_target_locations(&self) -> Vec<(LogTarget, String)> {
        self.targets
            .iter()
            .map(|target| {
                let location = match target {
                    LogTarget::File => format!("logs/{}", self.test_name),
                    LogTarget::Loki => "http://localhost:3000/explore".to_string(),
                    LogTarget::InMemory => "memory".to_string(),
                };

                (*target, location)
            })
            .collect()
    }

    fn save_log_location_in_test_summary(&self) -> Result<(), LogStreamError> {
        self.journal.record(Event::LogLocationsSaved);

        Ok(())
    }
}

pub struct FakeChain {
    chain_id: ChainId,
    journal: Journal,
}

impl Resource for FakeChain {
    fn stop(&mut self) -> Result<(), PlatformError> {
        self.journal.record(Event::ChainStopped(self.chain_id));

        Ok(())
    }
}

pub struct FakeMockAdapter {
    journal: Journal,
}

impl Resource for FakeMockAdapter {
    fn stop(&mut self) -> Result<(), PlatformError> {
        self.journal.record(Event::MockAdapterStopped);

        Ok(())
    }
}

pub struct FakeCluster {
    nodes: Vec<NodeSpec>,
    fault: TestFault,
    journal: Journal,
}

impl Resource for FakeCluster {
    fn stop(&mut self) -> Result<(), PlatformError> {
        self.journal.record(Event::ClusterStopped);

        Ok(())
    }
}

impl NodeCluster for FakeCluster {
    fn nodes(&self) -> &[NodeSpec] {
        &self.nodes
    }

    fn node_csa_keys(&self) -> Result<Vec<String>, PlatformError> {
        if self.fault == TestFault::CsaKeys {
            return Err(PlatformError::internal("fault injection: csa keys"));
        }

        let keys = self
            .nodes
            .iter()
            .map(|_| hex::encode(rand::random::<[u8; 32]>()))
            .collect();

        Ok(keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clones_share_the_journal() {
        let platform = FakePlatform::new();
        let clone = platform.clone();

        clone.create_network().unwrap();

        assert_eq!(
            platform.events(),
            vec![Event::NetworkCreated("testenv-net-0".into())]
        );
    }

    #[test]
    fn chain_endpoints_split_public_and_private() {
        let started = FakePlatform::new()
            .start_ethereum_network(&PrivateChain::new(1337))
            .unwrap();

        assert!(started.network.simulated);
        assert_eq!(started.network.urls, started.rpc_provider.public_ws_urls);
        assert_eq!(
            started.rpc_provider.private_ws_urls,
            vec!["ws://geth-1337:8546".to_string()]
        );
    }

    #[test]
    fn injected_fault() {
        let platform = FakePlatform::new().with_fault(TestFault::ChainStart);

        let result = platform.start_ethereum_network(&PrivateChain::new(1337));

        assert!(matches!(result, Err(PlatformError::Startup { .. })));
        assert!(platform.events().is_empty());
    }
}
