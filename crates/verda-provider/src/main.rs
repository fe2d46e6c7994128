//! verda-provider — cluster-autoscaler cloud provider for Verda.
//!
//! Serves the externalgrpc `CloudProvider` protocol on top of the Verda
//! API:
//! - Static node-group configuration (YAML or TOML)
//! - Instance state store, optionally snapshotted to disk
//! - Node-group engine (scale up/down, pricing, node templates)
//! - gRPC server, mTLS when `TLS_*_FILE` are set
//!
//! # Usage
//!
//! ```text
//! VERDA_CLIENT_ID=... VERDA_CLIENT_SECRET=... \
//!   verda-provider --config config.yaml --port 8086 --log-level INFO
//! ```

use std::net::{Ipv6Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, ValueEnum};
use tonic::transport::Server;
use tracing::{info, warn};

use verda_client::{Credentials, VerdaApi, VerdaClient};
use verda_core::AppConfig;
use verda_grpc::{load_server_tls, TlsFiles, VerdaCloudProvider};
use verda_nodegroup::NodeGroupEngine;
use verda_state::StateStore;

/// In-flight RPCs allowed per autoscaler connection.
const MAX_CONCURRENT_RPCS: usize = 10;

#[derive(Parser, Debug)]
#[command(
    name = "verda-provider",
    about = "Verda cloud provider for the cluster-autoscaler externalgrpc protocol"
)]
struct Cli {
    /// Log level for the provider's own crates. `RUST_LOG` overrides it.
    #[arg(long, value_enum, ignore_case = true, default_value = "INFO")]
    log_level: LogLevel,

    /// Node-group configuration file (`.yaml` or `.toml`).
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    /// Port to listen on.
    #[arg(long, default_value = "8086")]
    port: u16,

    /// JSON snapshot of tracked instances, rewritten on every change.
    #[arg(long)]
    state_file: Option<PathBuf>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
#[value(rename_all = "UPPER")]
enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
    Critical,
}

impl LogLevel {
    fn filter(self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warning => "warn",
            LogLevel::Error | LogLevel::Critical => "error",
        }
    }

    /// Default filter: the provider's crates at this level, dependencies at warn.
    fn directives(self) -> String {
        format!("warn,verda={}", self.filter())
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(cli.log_level.directives())),
        )
        .init();

    run(cli).await
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    info!("Verda cloud provider starting");

    // ── Configuration ──────────────────────────────────────────

    let config = AppConfig::from_file(&cli.config)
        .with_context(|| format!("loading configuration from {}", cli.config.display()))?;
    info!(
        path = %cli.config.display(),
        groups = config.node_groups.len(),
        "configuration loaded"
    );

    let credentials = Credentials::from_env().context("reading Verda API credentials")?;
    info!(api = %credentials.base_url, "Verda API client configured");
    let api: Arc<dyn VerdaApi> = Arc::new(VerdaClient::new(credentials)?);

    // ── Engine ─────────────────────────────────────────────────

    let store = match &cli.state_file {
        Some(path) => StateStore::with_snapshot(path),
        None => StateStore::new(),
    };
    let engine = Arc::new(NodeGroupEngine::new(api, config, store));
    engine.initialize().await;

    // ── gRPC server ────────────────────────────────────────────

    let addr = SocketAddr::from((Ipv6Addr::UNSPECIFIED, cli.port));
    let mut server = Server::builder().concurrency_limit_per_connection(MAX_CONCURRENT_RPCS);

    match TlsFiles::from_env() {
        Some(files) => {
            let tls = load_server_tls(&files).context("loading mTLS credentials")?;
            server = server.tls_config(tls)?;
            info!(%addr, "serving CloudProvider (mTLS)");
        }
        None => {
            warn!("mTLS not configured: running in insecure mode");
            info!(%addr, "serving CloudProvider (insecure)");
        }
    }

    server
        .add_service(VerdaCloudProvider::new(engine).into_service())
        .serve_with_shutdown(addr, async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!(error = %e, "failed to listen for shutdown signal");
                std::future::pending::<()>().await;
            }
            info!("shutdown signal received");
        })
        .await?;

    info!("Verda cloud provider stopped");
    Ok(())
}
