use testenv_core::{
    config::SIMULATED_NETWORK, ChainId, EvmNetwork, LogLevel, NetworkConfig, PrivateChain,
    TestConfig,
};

pub const LIVE_NETWORK: &str = "SEPOLIA";
pub const LIVE_CHAIN_ID: ChainId = 11155111;

pub fn live_network() -> EvmNetwork {
    EvmNetwork {
        urls: vec!["wss://sepolia.example/ws".into()],
        http_urls: vec!["https://sepolia.example".into()],
        supports_eip1559: true,
        finality_depth: 50,
        ..EvmNetwork::new("Sepolia Testnet", LIVE_CHAIN_ID)
    }
}

/// A config that selects a live network with public endpoints.
pub fn live_test_config() -> TestConfig {
    let mut network = NetworkConfig::select(&[LIVE_NETWORK]);
    network
        .evm_networks
        .insert(LIVE_NETWORK.into(), live_network());

    TestConfig {
        network,
        ..Default::default()
    }
}

/// A config that selects the built-in simulated network.
pub fn simulated_test_config() -> TestConfig {
    TestConfig {
        network: NetworkConfig::select(&[SIMULATED_NETWORK]),
        ..Default::default()
    }
}

pub fn private_chain(chain_id: ChainId) -> PrivateChain {
    PrivateChain::new(chain_id)
}

/// A node log line the way nodes print them.
pub fn json_log_line(level: LogLevel, msg: &str) -> String {
    serde_json::json!({
        "level": level.to_string(),
        "ts": "2024-01-01T00:00:00.000Z",
        "logger": "fixture",
        "msg": msg,
    })
    .to_string()
}
