use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio::net::TcpListener;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use caregraph::config::SupergraphConfig;
use caregraph::federation_gateway::FederationGateway;
use caregraph::server::{CorsPolicy, serve};
use caregraph::subgraph::{SubgraphKind, serve_subgraph};

#[derive(Parser, Debug)]
#[command(name = "caregraph", version, about = "Federated GraphQL gateway and subgraphs")]
struct Args {
    /// Deployment file; the embedded one is used when omitted.
    #[arg(long, env = "CAREGRAPH_CONFIG")]
    config: Option<PathBuf>,

    /// Emit logs as JSON lines.
    #[arg(long)]
    log_json: bool,

    /// Replaces the secret of the active signing key.
    #[arg(long, env = "JWT_SECRET", hide_env_values = true)]
    jwt_secret: Option<String>,

    /// Selects the active signing key id.
    #[arg(long, env = "JWT_KEY_ID")]
    jwt_key_id: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the federation gateway.
    Gateway {
        #[arg(long)]
        listen: Option<SocketAddr>,
    },
    /// Run one subgraph service.
    Subgraph {
        #[arg(value_enum)]
        kind: SubgraphKind,
        #[arg(long)]
        listen: Option<SocketAddr>,
    },
}

fn init_tracing(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "caregraph=info".into());
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "failed to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
}

async fn run_gateway(config: SupergraphConfig, listen: Option<SocketAddr>) -> anyhow::Result<()> {
    let authority = config.identity.authority()?;
    let gateway = Arc::new(FederationGateway::with_timeout(
        config.gateway.subgraph_timeout(),
    ));

    gateway
        .load_schemas(&config)
        .await
        .context("failed to compose the supergraph")?;
    if let Some(interval) = config.gateway.poll_interval() {
        info!(interval_secs = interval.as_secs(), "polling subgraph schemas");
        gateway.spawn_schema_polling(interval);
    }

    let addr = listen.unwrap_or(config.gateway.listen);
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!("GraphQL federation gateway starting on http://{addr}/graphql");

    let cors = CorsPolicy::new(config.gateway.cors_origins.clone());
    serve(listener, gateway, authority, cors, shutdown_signal()).await?;
    Ok(())
}

async fn run_subgraph(
    config: SupergraphConfig,
    kind: SubgraphKind,
    listen: Option<SocketAddr>,
) -> anyhow::Result<()> {
    let authority = config.identity.authority()?;
    let addr = match listen {
        Some(addr) => addr,
        None => config.subgraph_listen(kind.as_str())?,
    };
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!(service = kind.as_str(), "subgraph starting on http://{addr}/graphql");

    serve_subgraph(kind, listener, &config, authority, shutdown_signal()).await?;
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.log_json);

    let mut config = match &args.config {
        Some(path) => SupergraphConfig::load(path)?,
        None => SupergraphConfig::embedded()?,
    };
    config
        .identity
        .apply_overrides(args.jwt_key_id, args.jwt_secret);

    match args.command {
        Command::Gateway { listen } => run_gateway(config, listen).await,
        Command::Subgraph { kind, listen } => run_subgraph(config, kind, listen).await,
    }
}
