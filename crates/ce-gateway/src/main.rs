#![deny(unsafe_code)]
use anyhow::{Context, Result};
use ce_comfy::ComfyClient;
use ce_config::RuntimeConfig;
use ce_core::WorkflowContract;
use ce_executor::{ExecutorConfig, JobExecutor};
use ce_gateway::{build_app, AppState};
use ce_mapper::MapperEnv;
use ce_store::{ArtifactStore, FileStore, JobStore};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "ce-gateway", version, about = "Workflow endpoint gateway")]
struct Args {
    /// Bind host.
    #[arg(long, default_value = "0.0.0.0")]
    listen_host: String,

    /// Bind port.
    #[arg(long, default_value_t = 3000)]
    listen_port: u16,

    /// Per-app secret checked against x-api-key.
    #[arg(long, env = "CE_API_KEY")]
    api_key: String,

    /// Graph engine base URL.
    #[arg(long, env = "CE_COMFY_URL", default_value = "http://127.0.0.1:8188")]
    comfy_url: String,

    /// Contract JSON file.
    #[arg(long)]
    contract_path: PathBuf,

    /// Workflow JSON file.
    #[arg(long)]
    workflow_path: PathBuf,

    /// SQLite index file; blobs and artifacts live next to it.
    #[arg(long, default_value = "/var/lib/comfy_endpoints/state.db")]
    state_db_path: PathBuf,

    /// Root for per-job artifact dumps.
    #[arg(long, default_value = "/var/lib/comfy_endpoints/artifacts")]
    artifacts_dir: PathBuf,

    /// Owner tag stamped on generated files.
    #[arg(long, env = "CE_APP_ID")]
    app_id: Option<String>,

    /// Per-job output deadline in seconds.
    #[arg(long, default_value_t = 180)]
    output_timeout_seconds: u64,

    /// Sleep between artifact poll ticks, in seconds.
    #[arg(long, default_value_t = 1.5)]
    output_poll_seconds: f64,

    /// Grace window after the engine reports done, in seconds.
    #[arg(long, default_value_t = 5.0)]
    artifact_grace_seconds: f64,

    /// Enable debug logging.
    #[arg(long)]
    debug: bool,
}

impl Args {
    fn into_config(self) -> RuntimeConfig {
        RuntimeConfig {
            listen_host: self.listen_host,
            listen_port: self.listen_port,
            api_key: self.api_key,
            comfy_url: self.comfy_url,
            contract_path: self.contract_path,
            workflow_path: self.workflow_path,
            state_db_path: self.state_db_path,
            artifacts_dir: self.artifacts_dir,
            app_id: self.app_id,
            cache_root: None,
            watch_paths: Vec::new(),
            min_file_size_mb: 100,
            output_timeout_seconds: self.output_timeout_seconds,
            output_poll_seconds: self.output_poll_seconds,
            artifact_grace_seconds: self.artifact_grace_seconds,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let filter = if args.debug {
        EnvFilter::new("ce=debug")
    } else {
        EnvFilter::new("ce=info")
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = args.into_config();
    for warning in ce_config::validate_config(&config).context("invalid configuration")? {
        warn!(%warning, "configuration warning");
    }

    let contract = Arc::new(
        WorkflowContract::load(&config.contract_path).context("load contract")?,
    );
    let workflow: serde_json::Value = serde_json::from_str(
        &std::fs::read_to_string(&config.workflow_path)
            .with_context(|| format!("read workflow {}", config.workflow_path.display()))?,
    )
    .context("parse workflow")?;
    ce_mapper::validate_contract_nodes(&workflow, &contract)
        .context("contract does not match workflow")?;
    let workflow = Arc::new(workflow);

    let files = Arc::new(FileStore::open(&config.state_db_path).context("open file store")?);
    let jobs = Arc::new(JobStore::open(&config.state_db_path).context("open job store")?);
    let artifacts = ArtifactStore::new(&config.artifacts_dir);
    let engine = Arc::new(ComfyClient::new(&config.comfy_url));

    let executor = Arc::new(JobExecutor::new(
        contract.clone(),
        workflow,
        files.clone(),
        jobs.clone(),
        artifacts,
        engine,
        ExecutorConfig {
            output_timeout: Duration::from_secs(config.output_timeout_seconds),
            output_poll: Duration::from_secs_f64(config.output_poll_seconds),
            artifact_grace: Duration::from_secs_f64(config.artifact_grace_seconds),
            app_id: config.app_id.clone(),
            mapper_env: MapperEnv {
                artifacts_dir: config.artifacts_dir.display().to_string(),
                state_db: config.state_db_path.display().to_string(),
            },
        },
    ));

    let state = Arc::new(AppState {
        contract,
        files,
        jobs,
        executor,
        api_key: config.api_key.clone(),
    });
    let app = build_app(state);

    let bind = format!("{}:{}", config.listen_host, config.listen_port);
    let listener = tokio::net::TcpListener::bind(&bind)
        .await
        .with_context(|| format!("bind {bind}"))?;
    info!(bind = %bind, comfy = %config.comfy_url, "ce-gateway listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("serve")?;

    info!("ce-gateway shut down");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };
    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
