use testenv_core::{NetworkConfig, Platform, PrivateChain, RpcProvider};
use tracing::{info, warn};

use crate::{EnvError, TestEnv};

/// Shape of the chains the environment ended up with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Topology {
    /// One network, taken from the selected config or from the single
    /// private chain that replaced it.
    Single,

    /// Several private chains; the selected network config plays no part.
    MultiChain,
}

impl<P: Platform> TestEnv<P> {
    /// Decides which chains the environment runs against, starting private
    /// chains where needed, and records their descriptors and rpc providers.
    ///
    /// A live selected network always wins over a single private chain.
    pub fn arbitrate_networks(
        &mut self,
        network: &NetworkConfig,
        private_chains: &[PrivateChain],
    ) -> Result<Topology, EnvError> {
        self.rpc_providers.clear();
        self.evm_networks.clear();
        self.private_chains.clear();

        if private_chains.len() > 1 {
            for chain in private_chains {
                let (started, provider) = self.start_ethereum_network(chain)?;

                self.rpc_providers.insert(started.chain_id, provider);
                self.evm_networks.push(started);
            }

            self.private_chains = private_chains.to_vec();
            self.is_simulated_network = true;

            info!(chains = private_chains.len(), "running on multiple private chains");

            return Ok(Topology::MultiChain);
        }

        let mut selected = network.primary_network()?;

        match (private_chains.first(), selected.simulated) {
            (Some(chain), true) => {
                let (started, provider) = self.start_ethereum_network(chain)?;

                self.rpc_providers.insert(started.chain_id, provider);
                self.private_chains = vec![chain.clone()];
                self.is_simulated_network = true;

                selected = started;
            }
            (Some(_), false) => {
                warn!(
                    network = %selected.name,
                    chain_id = selected.chain_id,
                    "private chain config provided, but running on a live network, ignoring it"
                );

                self.rpc_providers
                    .insert(selected.chain_id, RpcProvider::from_public(&selected));
                self.is_simulated_network = false;
            }
            (None, false) => {
                self.rpc_providers
                    .insert(selected.chain_id, RpcProvider::from_public(&selected));
                self.is_simulated_network = false;
            }
            (None, true) => {
                self.is_simulated_network = false;
            }
        }

        self.evm_networks.push(selected);

        Ok(Topology::Single)
    }
}
