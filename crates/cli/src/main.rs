//! Command Line Interface for governance node operators
//!
//! This module provides a CLI around the RPC reliability layer:
//! - Probe every configured endpoint and show its state
//! - Validate that every endpoint serves the expected chain
//! - Send a single JSON-RPC call with rotation and retries
//! - Run the background health monitor in the foreground
//! - Generate a default configuration

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use govnode_config::{ConfigLoader, NodeConfig};
use govnode_logging::Logger;
use govnode_rpc::{ChainCheckStatus, Connection, RpcDispatcher};
use tracing::info;

mod display;
mod utils;

use display::{DisplayFormat, Renderer};
use utils::{parse_params, print_error, print_info, print_success, print_warning};

/// Governance node RPC CLI
#[derive(Parser, Debug)]
#[clap(name = "govnode", version, about, long_about = None)]
struct Cli {
    /// Sets a custom config file
    #[clap(short, long, value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    /// Overrides the configured log level
    #[clap(short, long, value_name = "LEVEL", global = true)]
    log_level: Option<String>,

    /// Output format
    #[clap(short, long, value_enum, default_value = "text", global = true)]
    format: DisplayFormat,

    /// Subcommand to execute
    #[clap(subcommand)]
    command: Commands,
}

/// CLI commands
#[derive(Subcommand, Debug)]
enum Commands {
    /// Probe every endpoint once and show its state
    Status,

    /// Check the chain ID of every endpoint
    ValidateChain,

    /// Send one JSON-RPC call through the dispatcher
    Call {
        /// JSON-RPC method, e.g. eth_blockNumber
        #[clap(value_name = "METHOD")]
        method: String,

        /// Parameters as a JSON array or object
        #[clap(short, long)]
        params: Option<String>,

        /// Attempt budget, defaults to the configured value
        #[clap(short, long)]
        retries: Option<u32>,
    },

    /// Run the health monitor until Ctrl+C
    Monitor {
        /// Seconds between printed reports, defaults to the configured report interval
        #[clap(long, value_name = "SECONDS")]
        report_every: Option<u64>,
    },

    /// Generate a default configuration
    GenerateConfig {
        /// Output file
        #[clap(short, long, value_name = "FILE")]
        output: PathBuf,
    },
}

/// Main entry point
#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Commands::GenerateConfig { output } = &cli.command {
        ConfigLoader::new()
            .save_config(&NodeConfig::default(), output)
            .with_context(|| format!("Failed to write configuration to {:?}", output))?;
        print_success(&format!("Configuration generated: {:?}", output));
        return Ok(());
    }

    let mut config =
        govnode_config::load_config(cli.config.as_deref()).context("Failed to load configuration")?;
    if let Some(level) = &cli.log_level {
        config.logging.default_level = level.clone();
    }

    let _guard = Logger::init(&config.logging).context("Failed to initialize logging")?;
    govnode_rpc::init();
    info!(node = %config.name, network = %config.network.name, "Configuration loaded");

    let renderer = Renderer::new(cli.format);
    let dispatcher = RpcDispatcher::new(config.rpc).context("Failed to create RPC dispatcher")?;

    let result = process_command(cli.command, &dispatcher, &renderer).await;
    dispatcher.stop().await;
    result
}

/// Process CLI command
async fn process_command(
    command: Commands,
    dispatcher: &RpcDispatcher,
    renderer: &Renderer,
) -> Result<()> {
    match command {
        Commands::Status => {
            let outcomes = dispatcher.monitor().check_all().await;
            let failed = outcomes.iter().filter(|o| !o.is_success()).count();

            renderer.render_endpoints(&dispatcher.get_endpoint_status(), &dispatcher.pool_status())?;
            renderer.render_health(&dispatcher.health_report())?;

            if renderer.format() == DisplayFormat::Text {
                if failed == 0 {
                    print_success(&format!("All {} endpoints answered", outcomes.len()));
                } else {
                    print_warning(&format!("{} of {} endpoints failed", failed, outcomes.len()));
                }
            }
        }
        Commands::ValidateChain => {
            let checks = dispatcher
                .validate_chain()
                .await
                .context("No endpoint serves the expected chain")?;
            renderer.render_chain_checks(&checks)?;

            let mismatched = checks
                .iter()
                .filter(|c| c.status == ChainCheckStatus::Mismatched)
                .count();
            if mismatched > 0 && renderer.format() == DisplayFormat::Text {
                print_warning(&format!("{} endpoints serve another chain", mismatched));
            }
        }
        Commands::Call {
            method,
            params,
            retries,
        } => {
            let params = parse_params(params.as_deref()).context("Invalid --params")?;
            let retries = retries.unwrap_or(dispatcher.config().retry.max_retries);

            let op_method = method.clone();
            let result = dispatcher
                .execute_with_retry(
                    move |connection: Connection| {
                        let method = op_method.clone();
                        let params = params.clone();
                        async move { connection.request(&method, params).await }
                    },
                    retries,
                    &method,
                )
                .await;

            match result {
                Ok(value) => renderer.render_value(&value)?,
                Err(e) => {
                    print_error(&format!("{} failed: {}", method, e));
                    renderer.render_metrics(&dispatcher.get_metrics())?;
                    return Err(e.into());
                }
            }
        }
        Commands::Monitor { report_every } => {
            let every = report_every
                .filter(|secs| *secs > 0)
                .map(Duration::from_secs)
                .unwrap_or_else(|| dispatcher.config().monitor.report_interval());

            if dispatcher.config().expected_chain_id.is_some() {
                let checks = dispatcher.validate_chain().await?;
                renderer.render_chain_checks(&checks)?;
            }

            dispatcher.start_monitor();
            print_info("Health monitor running, press Ctrl+C to stop");

            let mut ticker = tokio::time::interval(every);
            // First tick completes immediately, before any probe has run
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        renderer.render_endpoints(&dispatcher.get_endpoint_status(), &dispatcher.pool_status())?;
                        renderer.render_health(&dispatcher.health_report())?;
                    }
                    signal = tokio::signal::ctrl_c() => {
                        signal.context("Failed to listen for Ctrl+C")?;
                        break;
                    }
                }
            }

            print_success("Health monitor stopped");
        }
        Commands::GenerateConfig { .. } => {
            // Handled before the configuration is loaded
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_call() {
        let cli = Cli::try_parse_from([
            "govnode",
            "--format",
            "json",
            "call",
            "eth_getBalance",
            "--params",
            r#"["0xabc", "latest"]"#,
            "--retries",
            "5",
        ])
        .unwrap();

        assert_eq!(cli.format, DisplayFormat::Json);
        match cli.command {
            Commands::Call {
                method, retries, ..
            } => {
                assert_eq!(method, "eth_getBalance");
                assert_eq!(retries, Some(5));
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn test_global_options_after_subcommand() {
        let cli = Cli::try_parse_from(["govnode", "status", "-c", "node.yaml", "-l", "debug"]).unwrap();
        assert!(matches!(cli.command, Commands::Status));
        assert_eq!(cli.config, Some(PathBuf::from("node.yaml")));
        assert_eq!(cli.log_level.as_deref(), Some("debug"));
        assert_eq!(cli.format, DisplayFormat::Text);
    }

    #[test]
    fn test_subcommand_is_required() {
        assert!(Cli::try_parse_from(["govnode"]).is_err());
    }
}
