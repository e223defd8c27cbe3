//! Assembles container-backed test environments: a container network,
//! private EVM chains, a mock adapter, a node cluster and the log stream
//! that watches them, torn down in an order that keeps their logs.

mod builder;
mod cleanup;
mod env;
mod logstream;
mod network;

pub use builder::{BuildError, EvmNetworkOption, TestEnvBuilder, TEST_ENV_CONFIG_PATH};
pub use env::{CleanupOpts, EnvError, TestEnv, TestEnvHandle};
pub use network::Topology;

pub use testenv_core as core;
