//! Renders the node configuration from the chains a cluster talks to.

use std::collections::BTreeMap;

use thiserror::Error;
use toml::{Table, Value};

use crate::{EvmNetwork, NodeConfig};

#[derive(Debug, Error)]
pub enum NodeConfigError {
    #[error("invalid {section} toml: {source}")]
    Parse {
        section: String,
        #[source]
        source: toml::de::Error,
    },
}

fn parse(section: impl Into<String>, raw: &str) -> Result<Table, NodeConfigError> {
    toml::from_str(raw).map_err(|source| NodeConfigError::Parse {
        section: section.into(),
        source,
    })
}

/// Recursively merges `overlay` into `base`; tables merge, everything else is
/// replaced.
fn merge(base: &mut Table, overlay: Table) {
    for (key, value) in overlay {
        match (base.get_mut(&key), value) {
            (Some(Value::Table(existing)), Value::Table(incoming)) => merge(existing, incoming),
            (_, value) => {
                base.insert(key, value);
            }
        }
    }
}

fn primary_node(chain: &EvmNetwork) -> Value {
    let mut node = Table::new();

    node.insert(
        "Name".into(),
        Value::String(format!("primary_0_{}", chain.chain_id)),
    );

    if let Some(ws) = chain.urls.first() {
        node.insert("WSURL".into(), Value::String(ws.clone()));
    }

    if let Some(http) = chain.http_urls.first() {
        node.insert("HTTPURL".into(), Value::String(http.clone()));
    }

    Value::Table(node)
}

/// Builds the node config: `base` at the top level plus one `[[EVM]]` entry
/// per chain carrying the common fragment and, on top of it, the fragment
/// registered for that chain id.
pub fn build_node_config(
    chains: &[EvmNetwork],
    base: &str,
    common_chain: &str,
    per_chain: &BTreeMap<String, String>,
) -> Result<NodeConfig, NodeConfigError> {
    let mut config = parse("base", base)?;
    let common = parse("common chain", common_chain)?;

    let mut sections = Vec::with_capacity(chains.len());

    for chain in chains {
        let mut section = Table::new();
        section.insert("ChainID".into(), Value::String(chain.chain_id.to_string()));

        merge(&mut section, common.clone());

        let key = chain.chain_id.to_string();
        if let Some(raw) = per_chain.get(&key) {
            merge(&mut section, parse(format!("chain {key}"), raw)?);
        }

        section.insert("Nodes".into(), Value::Array(vec![primary_node(chain)]));

        sections.push(Value::Table(section));
    }

    if !sections.is_empty() {
        config.insert("EVM".into(), Value::Array(sections));
    }

    Ok(config)
}
