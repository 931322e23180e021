//! Kubecraft registration server

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing::{error, info};

use kubecraft_common::kube_utils::create_client;
use kubecraft_common::telemetry::{init_logging, LogFormat, LoggingConfig, DEFAULT_FILTER};
use kubecraft_provisioner::{KubeClientImpl, TenantProvisioner};
use kubecraft_registration::{serve, AppState, ConfigArgs};

/// Kubecraft - tenant onboarding for a shared game-server cluster
#[derive(Parser, Debug)]
#[command(name = "kubecraft-registration", version, about, long_about = None)]
struct Cli {
    /// Path to kubeconfig file (inferred when omitted)
    #[arg(long, env = "KUBECONFIG")]
    kubeconfig: Option<PathBuf>,

    /// Address the registration API listens on
    #[arg(long, env = "KUBECRAFT_LISTEN_ADDR", default_value = "0.0.0.0:8080")]
    listen: SocketAddr,

    /// Log line format: json or pretty
    #[arg(long, env = "KUBECRAFT_LOG_FORMAT", default_value = "json")]
    log_format: LogFormat,

    #[command(flatten)]
    config: ConfigArgs,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Serve the registration API (default)
    Serve,
    /// Remove a tenant's namespace and authorization list entry
    Deregister {
        /// Tenant name
        tenant: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    if let Err(e) = rustls::crypto::aws_lc_rs::default_provider().install_default() {
        eprintln!("CRITICAL: Failed to install crypto provider: {:?}", e);
        std::process::exit(1);
    }

    let cli = Cli::parse();

    init_logging(LoggingConfig {
        format: cli.log_format,
        default_filter: DEFAULT_FILTER.to_string(),
    })?;

    let config = match cli.config.into_config() {
        Ok(config) => Arc::new(config),
        Err(e) => {
            error!(error = %e, "Invalid configuration");
            std::process::exit(e.exit_code());
        }
    };

    let client = create_client(cli.kubeconfig.as_deref(), &config).await?;
    let kube = Arc::new(KubeClientImpl::new(client, &config));
    let provisioner = Arc::new(TenantProvisioner::new(kube, config));

    match cli.command {
        Some(Commands::Deregister { tenant }) => {
            if let Err(e) = provisioner.deregister(&tenant).await {
                error!(tenant = %tenant, error = %e, "Deregistration failed");
                std::process::exit(e.exit_code());
            }
            info!(tenant = %tenant, "Tenant deregistered");
            Ok(())
        }
        Some(Commands::Serve) | None => {
            serve(cli.listen, AppState { provisioner }).await?;
            Ok(())
        }
    }
}
