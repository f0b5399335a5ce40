//! Configuration schema definitions
//!
//! This module defines the structure of the configuration read by a
//! governance node agent: the network it joins, the RPC reliability layer
//! and logging.

use govnode_logging::LoggingConfig;
use govnode_rpc::{RpcConfig, SEPOLIA_CHAIN_ID};
use serde::{Deserialize, Serialize};

/// Network the node operates on
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Human-readable network name
    pub name: String,

    /// Chain ID of the network
    pub chain_id: u64,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            name: "sepolia".to_string(),
            chain_id: SEPOLIA_CHAIN_ID,
        }
    }
}

/// Main node configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Agent name, used in logs
    #[serde(default = "default_node_name")]
    pub name: String,

    #[serde(default)]
    pub network: NetworkConfig,

    /// RPC reliability layer
    #[serde(default)]
    pub rpc: RpcConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

fn default_node_name() -> String {
    "govnode-agent".to_string()
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            name: default_node_name(),
            network: NetworkConfig::default(),
            rpc: RpcConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_target_sepolia() {
        let config = NodeConfig::default();
        assert_eq!(config.network.name, "sepolia");
        assert_eq!(config.rpc.expected_chain_id, Some(config.network.chain_id));
        assert!(!config.rpc.endpoints.is_empty());
    }

    #[test]
    fn test_partial_yaml() {
        let yaml = r#"
name: agent-7
rpc:
  endpoints:
    - name: alchemy
      url: https://eth-sepolia.g.alchemy.com/v2/key
      priority: 1
  retry:
    max_retries: 5
"#;
        let config: NodeConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.name, "agent-7");
        assert_eq!(config.rpc.endpoints.len(), 1);
        assert_eq!(config.rpc.endpoints[0].max_requests_per_second, 5.0);
        assert_eq!(config.rpc.retry.max_retries, 5);
        assert_eq!(config.rpc.retry.pre_delay_min_ms, 500);
        assert_eq!(config.network, NetworkConfig::default());
    }
}
