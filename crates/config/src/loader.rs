//! Configuration loading and validation
//!
//! Sources are layered in this order, later ones winning:
//! 1. Built-in defaults
//! 2. One configuration file (CLI path, or the first existing search path)
//! 3. Environment variables, e.g. `GOVNODE_RPC__RETRY__MAX_RETRIES=5`
//! 4. `GOVNODE_RPC_URLS`, a comma-separated list replacing the endpoint list

use crate::error::{ConfigError, ConfigResult};
use crate::schema::NodeConfig;
use config::{builder::DefaultState, Config, ConfigBuilder, Environment, File, FileFormat};
use std::env;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Configuration loader
#[derive(Debug)]
pub struct ConfigLoader {
    /// Command-line specified config path
    cli_config_path: Option<PathBuf>,

    /// Environment variable prefix
    env_prefix: String,

    /// Search paths for configuration files
    search_paths: Vec<PathBuf>,

    /// Default configuration
    default_config: NodeConfig,

    /// Configuration sources that were used
    used_sources: Vec<String>,
}

impl ConfigLoader {
    /// Create a new configuration loader
    pub fn new() -> Self {
        Self {
            cli_config_path: None,
            env_prefix: "GOVNODE".to_string(),
            search_paths: vec![
                PathBuf::from("./govnode.json"),
                PathBuf::from("./govnode.yaml"),
                PathBuf::from("./govnode.toml"),
                Self::get_user_config_path(),
                Self::get_system_config_path(),
            ],
            default_config: NodeConfig::default(),
            used_sources: Vec::new(),
        }
    }

    /// Set command-line specified config path
    pub fn with_cli_config_path<P: AsRef<Path>>(mut self, path: Option<P>) -> Self {
        self.cli_config_path = path.map(|p| p.as_ref().to_path_buf());
        self
    }

    /// Set environment variable prefix
    pub fn with_env_prefix<S: Into<String>>(mut self, prefix: S) -> Self {
        self.env_prefix = prefix.into();
        self
    }

    /// Replace the search paths
    pub fn with_search_paths<I, P>(mut self, paths: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: AsRef<Path>,
    {
        self.search_paths = paths.into_iter().map(|p| p.as_ref().to_path_buf()).collect();
        self
    }

    /// Add a search path
    pub fn add_search_path<P: AsRef<Path>>(&mut self, path: P) {
        self.search_paths.push(path.as_ref().to_path_buf());
    }

    /// Set default configuration
    pub fn with_default_config(mut self, config: NodeConfig) -> Self {
        self.default_config = config;
        self
    }

    /// Load configuration
    pub fn load(&mut self) -> ConfigResult<NodeConfig> {
        info!("Loading configuration...");
        self.used_sources.clear();

        let mut builder = Config::builder().add_source(Config::try_from(&self.default_config)?);
        self.used_sources.push("default configuration".to_string());

        let mut found_config_file = false;

        // Command-line path first; a missing file is an error
        if let Some(path) = &self.cli_config_path {
            if !path.exists() {
                warn!("CLI-specified config file not found: {:?}", path);
                return Err(ConfigError::LoadError(format!(
                    "CLI-specified config file not found: {:?}",
                    path
                )));
            }
            debug!("Loading configuration from CLI-specified path: {:?}", path);
            builder = Self::add_file_source(builder, path)?;
            self.used_sources.push(format!("CLI-specified config: {:?}", path));
            found_config_file = true;
        }

        if !found_config_file {
            if let Some(path) = self.search_paths.iter().find(|p| p.exists()) {
                debug!("Loading configuration from: {:?}", path);
                builder = Self::add_file_source(builder, path)?;
                self.used_sources.push(format!("config file: {:?}", path));
            }
        }

        let env_source = Environment::with_prefix(&self.env_prefix)
            .prefix_separator("_")
            .separator("__")
            .try_parsing(true);
        builder = builder.add_source(env_source);
        self.used_sources
            .push(format!("environment variables with prefix {}", self.env_prefix));

        let mut config: NodeConfig = builder.build()?.try_deserialize()?;

        let urls_var = self.rpc_urls_var();
        if let Some(urls) = Self::read_url_list(&urls_var)? {
            config.rpc = std::mem::take(&mut config.rpc).with_endpoint_urls(urls);
            self.used_sources.push(urls_var);
        }

        self.validate_config(&config)?;

        info!("Configuration loaded from: {}", self.used_sources.join(", "));

        Ok(config)
    }

    /// Name of the variable that replaces the endpoint list
    pub fn rpc_urls_var(&self) -> String {
        format!("{}_RPC_URLS", self.env_prefix)
    }

    fn read_url_list(var: &str) -> ConfigResult<Option<Vec<String>>> {
        let raw = match env::var(var) {
            Ok(raw) => raw,
            Err(env::VarError::NotPresent) => return Ok(None),
            Err(e) => return Err(ConfigError::EnvVarError(format!("{}: {}", var, e))),
        };

        let urls: Vec<String> = raw
            .split(',')
            .map(str::trim)
            .filter(|url| !url.is_empty())
            .map(str::to_string)
            .collect();

        if urls.is_empty() {
            return Err(ConfigError::EnvVarError(format!(
                "{} is set but contains no URLs",
                var
            )));
        }

        Ok(Some(urls))
    }

    /// Add a file source to the config builder
    fn add_file_source(
        builder: ConfigBuilder<DefaultState>,
        path: &Path,
    ) -> ConfigResult<ConfigBuilder<DefaultState>> {
        let format = match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") => FileFormat::Json,
            Some("yaml") | Some("yml") => FileFormat::Yaml,
            Some("toml") => FileFormat::Toml,
            _ => {
                // Try to detect format from content
                let content = std::fs::read_to_string(path).map_err(|e| {
                    ConfigError::LoadError(format!(
                        "Could not determine file format for {:?}: {}",
                        path, e
                    ))
                })?;
                if content.trim_start().starts_with('{') {
                    FileFormat::Json
                } else {
                    FileFormat::Yaml
                }
            }
        };

        Ok(builder.add_source(File::from(path).format(format).required(true)))
    }

    /// Validate configuration
    fn validate_config(&self, config: &NodeConfig) -> ConfigResult<()> {
        config.rpc.validate()?;
        config.logging.validate()?;

        if config.network.chain_id == 0 {
            return Err(ConfigError::ValidationError(
                "Network chain ID must be greater than 0".to_string(),
            ));
        }

        if let Some(expected) = config.rpc.expected_chain_id {
            if expected != config.network.chain_id {
                return Err(ConfigError::ValidationError(format!(
                    "RPC expected chain ID {} does not match network {} ({})",
                    expected, config.network.name, config.network.chain_id
                )));
            }
        }

        Ok(())
    }

    /// Get user configuration path
    fn get_user_config_path() -> PathBuf {
        if let Some(mut path) = dirs::home_dir() {
            path.push(".govnode");
            path.push("config.json");
            path
        } else {
            PathBuf::from("~/.govnode/config.json")
        }
    }

    /// Get system configuration path
    fn get_system_config_path() -> PathBuf {
        if cfg!(windows) {
            PathBuf::from("C:\\ProgramData\\govnode\\config.json")
        } else {
            PathBuf::from("/etc/govnode/config.json")
        }
    }

    /// Save configuration to a file, YAML for `.yaml`/`.yml` and JSON otherwise
    pub fn save_config(&self, config: &NodeConfig, path: &Path) -> ConfigResult<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content = match path.extension().and_then(|ext| ext.to_str()) {
            Some("yaml") | Some("yml") => serde_yaml::to_string(config)?,
            _ => serde_json::to_string_pretty(config)?,
        };
        std::fs::write(path, content)?;

        info!("Configuration saved to: {:?}", path);

        Ok(())
    }

    /// Get the sources that were used to load the configuration
    pub fn get_used_sources(&self) -> &[String] {
        &self.used_sources
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use govnode_logging::OutputFormat;
    use tempfile::tempdir;

    // Each test uses its own prefix so environment changes do not leak
    fn loader(prefix: &str) -> ConfigLoader {
        ConfigLoader::default()
            .with_env_prefix(prefix)
            .with_search_paths(Vec::<PathBuf>::new())
    }

    #[test]
    fn test_config_loader_default() {
        let loader = ConfigLoader::default();
        assert_eq!(loader.env_prefix, "GOVNODE");
        assert_eq!(loader.search_paths.len(), 5);
        assert!(loader.cli_config_path.is_none());
        assert_eq!(loader.rpc_urls_var(), "GOVNODE_RPC_URLS");
    }

    #[test]
    fn test_load_defaults() -> ConfigResult<()> {
        let mut loader = loader("GOVNODE_TEST_DEFAULTS");
        let config = loader.load()?;

        assert_eq!(config, NodeConfig::default());
        assert_eq!(loader.get_used_sources().len(), 2);
        Ok(())
    }

    #[test]
    fn test_missing_cli_path_is_an_error() {
        let mut loader = loader("GOVNODE_TEST_MISSING")
            .with_cli_config_path(Some(PathBuf::from("/nonexistent/govnode.yaml")));
        assert!(matches!(loader.load(), Err(ConfigError::LoadError(_))));
    }

    #[test]
    fn test_file_overrides_defaults() -> ConfigResult<()> {
        let dir = tempdir()?;
        let path = dir.path().join("govnode.yaml");
        std::fs::write(
            &path,
            "name: agent-3\nrpc:\n  retry:\n    max_retries: 5\nlogging:\n  format: json\n",
        )?;

        let mut loader = loader("GOVNODE_TEST_FILE").with_cli_config_path(Some(&path));
        let config = loader.load()?;

        assert_eq!(config.name, "agent-3");
        assert_eq!(config.rpc.retry.max_retries, 5);
        assert_eq!(config.rpc.retry.call_timeout_ms, 10_000);
        assert_eq!(config.logging.format, OutputFormat::Json);
        assert!(loader
            .get_used_sources()
            .iter()
            .any(|s| s.contains(&*path.to_string_lossy())));
        Ok(())
    }

    #[test]
    fn test_toml_file() -> ConfigResult<()> {
        let dir = tempdir()?;
        let path = dir.path().join("govnode.toml");
        std::fs::write(&path, "[rpc.pool]\nsize_per_endpoint = 2\n")?;

        let config = loader("GOVNODE_TEST_TOML")
            .with_cli_config_path(Some(&path))
            .load()?;
        assert_eq!(config.rpc.pool.size_per_endpoint, 2);
        Ok(())
    }

    #[test]
    fn test_environment_overrides_file() -> ConfigResult<()> {
        let dir = tempdir()?;
        let path = dir.path().join("govnode.json");
        std::fs::write(&path, r#"{"rpc": {"monitor": {"interval_ms": 10000}}}"#)?;

        env::set_var("GOVNODE_TEST_ENV_RPC__MONITOR__INTERVAL_MS", "15000");
        let result = loader("GOVNODE_TEST_ENV")
            .with_cli_config_path(Some(&path))
            .load();
        env::remove_var("GOVNODE_TEST_ENV_RPC__MONITOR__INTERVAL_MS");

        assert_eq!(result?.rpc.monitor.interval_ms, 15_000);
        Ok(())
    }

    #[test]
    fn test_rpc_urls_replace_endpoints() -> ConfigResult<()> {
        env::set_var(
            "GOVNODE_TEST_URLS_RPC_URLS",
            "https://eth-sepolia.g.alchemy.com/v2/key, https://sepolia.infura.io/v3/key,",
        );
        let mut loader = loader("GOVNODE_TEST_URLS");
        let result = loader.load();
        env::remove_var("GOVNODE_TEST_URLS_RPC_URLS");

        let config = result?;
        assert_eq!(config.rpc.endpoints.len(), 2);
        assert_eq!(config.rpc.endpoints[0].name, "eth-sepolia.g.alchemy.com");
        assert_eq!(config.rpc.endpoints[1].priority, 2);
        assert!(loader
            .get_used_sources()
            .iter()
            .any(|s| s == "GOVNODE_TEST_URLS_RPC_URLS"));
        Ok(())
    }

    #[test]
    fn test_empty_rpc_urls_is_rejected() {
        env::set_var("GOVNODE_TEST_EMPTY_RPC_URLS", " , ");
        let result = loader("GOVNODE_TEST_EMPTY").load();
        env::remove_var("GOVNODE_TEST_EMPTY_RPC_URLS");

        assert!(matches!(result, Err(ConfigError::EnvVarError(_))));
    }

    #[test]
    fn test_chain_mismatch_is_rejected() {
        let mut config = NodeConfig::default();
        config.network.chain_id = 1;

        let result = loader("GOVNODE_TEST_CHAIN")
            .with_default_config(config)
            .load();
        assert!(matches!(result, Err(ConfigError::ValidationError(_))));
    }

    #[test]
    fn test_invalid_rpc_config_is_rejected() {
        let mut config = NodeConfig::default();
        config.rpc.pool.size_per_endpoint = 0;

        let result = loader("GOVNODE_TEST_INVALID")
            .with_default_config(config)
            .load();
        assert!(matches!(result, Err(ConfigError::ValidationError(_))));
    }

    #[test]
    fn test_save_and_load_config() -> ConfigResult<()> {
        let dir = tempdir()?;

        let mut config = NodeConfig::default();
        config.name = "round-trip".to_string();
        config.rpc.retry.max_retries = 4;

        for file in ["config.json", "nested/config.yaml"] {
            let path = dir.path().join(file);
            let loader = ConfigLoader::default();
            loader.save_config(&config, &path)?;

            let loaded = ConfigLoader::default()
                .with_env_prefix("GOVNODE_TEST_SAVE")
                .with_cli_config_path(Some(&path))
                .load()?;
            assert_eq!(loaded.name, "round-trip");
            assert_eq!(loaded.rpc.retry.max_retries, 4);
            assert_eq!(loaded.rpc.endpoints, config.rpc.endpoints);
        }

        Ok(())
    }
}
