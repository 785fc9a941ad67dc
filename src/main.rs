use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use thiserror::Error;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use changeset_gate::config::{ConfigError, PipelineConfig};
use changeset_gate::dag::GraphError;
use changeset_gate::github::GitHubPlatform;
use changeset_gate::orchestrator::Orchestrator;
use changeset_gate::persistence::FileGateStore;
use changeset_gate::server::{AppState, WebhookSecret, build_router};

const DEFAULT_CONFIG: &str = "changeset-gate.toml";
const DEFAULT_STATE_DIR: &str = "state";
const DEFAULT_LISTEN_ADDR: &str = "0.0.0.0:3000";

#[derive(Debug, Error)]
enum StartupError {
    #[error("{0} must be set")]
    MissingEnv(&'static str),

    #[error("invalid GATE_LISTEN_ADDR {0:?}")]
    ListenAddr(String),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("invalid build graph: {0}")]
    Graph(#[from] GraphError),

    #[error("failed to build GitHub client: {0}")]
    GitHub(#[from] octocrab::Error),

    #[error("server error: {0}")]
    Io(#[from] std::io::Error),
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "changeset_gate=debug,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "Exiting");
            ExitCode::FAILURE
        }
    }
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

async fn run() -> Result<(), StartupError> {
    let config_path = PathBuf::from(env_or("GATE_CONFIG", DEFAULT_CONFIG));
    let config = PipelineConfig::load(&config_path)?;
    info!(path = %config_path.display(), nodes = config.nodes.len(), "Loaded pipeline");

    let token = std::env::var("GITHUB_TOKEN").map_err(|_| StartupError::MissingEnv("GITHUB_TOKEN"))?;
    let platform = Arc::new(GitHubPlatform::from_token(token)?);
    let store = Arc::new(FileGateStore::new(env_or("GATE_STATE_DIR", DEFAULT_STATE_DIR)));
    let orchestrator = Arc::new(Orchestrator::from_config(&config, platform, store)?);

    let webhook_secret = std::env::var("GATE_WEBHOOK_SECRET").ok().map(WebhookSecret::new);
    if webhook_secret.is_none() {
        warn!("GATE_WEBHOOK_SECRET not set, webhook endpoint disabled");
    }
    let app = build_router(AppState::new(Arc::clone(&orchestrator), webhook_secret));

    let listen = env_or("GATE_LISTEN_ADDR", DEFAULT_LISTEN_ADDR);
    let addr: SocketAddr = listen
        .parse()
        .map_err(|_| StartupError::ListenAddr(listen.clone()))?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            if tokio::signal::ctrl_c().await.is_err() {
                warn!("Could not listen for shutdown signal");
                std::future::pending::<()>().await;
            }
            info!("Shutting down, cancelling active runs");
            orchestrator.shutdown().await;
        })
        .await?;
    Ok(())
}
