// Copyright (c) 2026 The Isthmus Authors
// SPDX-License-Identifier: AGPL-3.0

//! # Isthmus
//!
//! The `isthmus` binary runs the ingress controller and emits data-plane
//! bootstrap configuration.
//!
//! ## Commands
//!
//! - `isthmus serve` runs the controller: watch the cluster, build the
//!   routing graph, serve xDS to the Envoy fleet
//! - `isthmus bootstrap` writes the Envoy bootstrap file pointing at this
//!   controller's xDS endpoint
//! - `isthmus config validate|show` for configuration tooling

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;

use isthmus_core::domain::config::IsthmusConfig;
use isthmus_core::infrastructure::bootstrap::{self, BootstrapParams, BootstrapTls};

mod serve;

/// Isthmus, an xDS ingress controller for Kubernetes.
#[derive(Parser)]
#[command(name = "isthmus")]
#[command(version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Path to the configuration file
    #[arg(
        short,
        long,
        global = true,
        env = "ISTHMUS_CONFIG_PATH",
        value_name = "FILE"
    )]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true, env = "ISTHMUS_LOG_LEVEL", default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the ingress controller
    Serve,

    /// Emit the data-plane bootstrap configuration
    Bootstrap {
        /// Output path for the bootstrap file
        #[arg(long, value_name = "FILE")]
        out: PathBuf,

        /// Address the data plane dials for xDS (defaults to the
        /// configured xds-address)
        #[arg(long)]
        xds_address: Option<String>,

        /// Port the data plane dials for xDS
        #[arg(long)]
        xds_port: Option<u16>,

        /// Admin interface address
        #[arg(long, default_value = "127.0.0.1")]
        admin_address: String,

        /// Admin interface port
        #[arg(long, default_value_t = 9001)]
        admin_port: u16,

        /// Client certificate for mutual TLS towards the controller
        #[arg(long, requires = "key_file", requires = "ca_file")]
        cert_file: Option<String>,

        /// Client private key
        #[arg(long)]
        key_file: Option<String>,

        /// CA bundle used to verify the controller
        #[arg(long)]
        ca_file: Option<String>,
    },

    /// Configuration tooling
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },
}

#[derive(Subcommand)]
enum ConfigCommand {
    /// Parse and validate the configuration file, then exit
    Validate,
    /// Print the effective configuration as YAML
    Show,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&cli.log_level)),
        )
        .init();

    let config = match &cli.config {
        Some(path) => IsthmusConfig::load(path)
            .with_context(|| format!("loading configuration from {}", path.display()))?,
        None => IsthmusConfig::default(),
    };

    match cli.command {
        Commands::Serve => serve::run(config, cli.config).await,
        Commands::Bootstrap {
            out,
            xds_address,
            xds_port,
            admin_address,
            admin_port,
            cert_file,
            key_file,
            ca_file,
        } => {
            let params = BootstrapParams {
                xds_address: xds_address.unwrap_or_else(|| config.xds_address.clone()),
                xds_port: xds_port.unwrap_or(config.xds_port),
                admin_address,
                admin_port,
                tls: match (cert_file, key_file, ca_file) {
                    (Some(cert_file), Some(key_file), Some(ca_file)) => {
                        Some(BootstrapTls { cert_file, key_file, ca_file })
                    }
                    _ => None,
                },
                max_requests_per_io_cycle: config.listener.max_requests_per_io_cycle,
                incremental: matches!(
                    config.xds_server_type,
                    isthmus_core::domain::config::XdsServerType::Incremental
                ),
            };
            bootstrap::emit(&params, &out)
                .with_context(|| format!("writing bootstrap to {}", out.display()))?;
            info!(path = %out.display(), "bootstrap written");
            Ok(())
        }
        Commands::Config { command } => match command {
            ConfigCommand::Validate => {
                // Loading already validated; reaching here means success.
                println!("configuration is valid");
                Ok(())
            }
            ConfigCommand::Show => {
                print!("{}", config.to_yaml());
                Ok(())
            }
        },
    }
}
