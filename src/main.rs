use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use analysis_orchestrator::collab::{
    BlobStore, Collaborators, LocalBlobStore, LocalDocumentStore, LocalTokenLedger,
};
use analysis_orchestrator::config::Config;
use analysis_orchestrator::orchestrator::{self, Orchestrator};
use analysis_orchestrator::retention::spawn_sweeper;
use analysis_orchestrator::sandbox::DockerRuntime;
use analysis_orchestrator::snapshot::{JsonSnapshot, StateDirLock};

/// Session and job orchestrator for analysis containers.
#[derive(Debug, Parser)]
#[command(name = "analysis-orchestrator", version, about)]
struct Args {
    /// Address to listen on (overrides ORCHESTRATOR_HOST/ORCHESTRATOR_PORT).
    #[arg(long)]
    bind: Option<SocketAddr>,

    /// Data directory for session data and snapshots (overrides ORCHESTRATOR_DATA_DIR).
    #[arg(long)]
    data_dir: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let mut config = Config::from_env()?;
    if let Some(data_dir) = args.data_dir {
        config.storage.set_data_dir(data_dir);
    }

    init_tracing(config.server.log_json);

    std::fs::create_dir_all(config.storage.data_dir())?;
    let _lock = StateDirLock::acquire(config.storage.data_dir())?;

    let docker = DockerRuntime::connect().await?;
    if !docker.image_exists(&config.sandbox.image).await {
        tracing::warn!(
            image = %config.sandbox.image,
            "Sandbox image not found locally; session creation will fail until it is built"
        );
    }

    let blobs: Arc<dyn BlobStore> = match &config.storage.blob_base_url {
        Some(base_url) => Arc::new(LocalBlobStore::new(config.storage.blobs_dir(), base_url)),
        None => Arc::new(LocalBlobStore::file_urls(config.storage.blobs_dir())),
    };
    let collaborators = Collaborators::new(
        Arc::new(LocalDocumentStore::with_root(config.storage.documents_dir())),
        blobs,
        Arc::new(LocalTokenLedger::open(JsonSnapshot::new(config.storage.ledger_file())).await?),
    );

    let orchestrator = Orchestrator::start(&config, Arc::new(docker), collaborators).await?;
    let sweeper = spawn_sweeper(Arc::clone(&orchestrator), config.retention.to_policy());

    let addr = match args.bind {
        Some(addr) => addr,
        None => config.server.bind_addr()?,
    };
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(
        data_dir = %config.storage.data_dir().display(),
        "Orchestrator listening on {}",
        addr
    );

    axum::serve(listener, orchestrator::router(orchestrator))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("Orchestrator shutting down");
        })
        .await?;

    sweeper.abort();
    Ok(())
}

fn init_tracing(json: bool) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("analysis_orchestrator=info,tower_http=info"));

    let registry = tracing_subscriber::registry().with(env_filter);
    if json {
        registry
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}
