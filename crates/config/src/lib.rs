//! Configuration system for governance node agents
//!
//! This module loads the node configuration from layered sources
//! (defaults, a JSON/YAML/TOML file, environment variables) and validates
//! the RPC and logging sections before the node starts.

pub mod error;
pub mod loader;
pub mod schema;

pub use error::{ConfigError, ConfigResult};
pub use loader::ConfigLoader;
pub use schema::{NetworkConfig, NodeConfig};

use std::path::Path;

/// Load the node configuration with the default loader
pub fn load_config(path: Option<&Path>) -> ConfigResult<NodeConfig> {
    ConfigLoader::new().with_cli_config_path(path).load()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_load_config_from_file() -> ConfigResult<()> {
        let dir = tempdir()?;
        let path = dir.path().join("node.yaml");

        let mut config = NodeConfig::default();
        config.name = "from-file".to_string();
        ConfigLoader::new().save_config(&config, &path)?;

        let loaded = load_config(Some(path.as_path()))?;
        assert_eq!(loaded.name, "from-file");
        assert_eq!(loaded.rpc.endpoints, config.rpc.endpoints);
        Ok(())
    }
}
