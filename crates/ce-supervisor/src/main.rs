#![deny(unsafe_code)]
use anyhow::{Context, Result};
use ce_comfy::ComfyClient;
use ce_core::WorkflowContract;
use ce_mapper::MapperEnv;
use ce_resolver::{ArtifactSpec, ResolverContext, ResolverFailure};
use ce_supervisor::{cache::CacheManager, degraded, engine, materialize};
use clap::Parser;
use serde_json::Value;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "ce-supervisor", version, about = "In-pod supervisor for workflow endpoints")]
struct Args {
    /// Gateway bind host.
    #[arg(long, default_value = "0.0.0.0")]
    listen_host: String,

    /// Gateway bind port.
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

    /// Inline contract JSON, written to --contract-path when the file is
    /// missing.
    #[arg(long, env = "CE_CONTRACT_JSON")]
    contract_json: Option<String>,

    /// Inline workflow JSON, written to --workflow-path when the file is
    /// missing.
    #[arg(long, env = "CE_WORKFLOW_JSON")]
    workflow_json: Option<String>,

    /// SQLite index file; blobs and artifacts live next to it.
    #[arg(long, default_value = "/var/lib/comfy_endpoints/state.db")]
    state_db_path: PathBuf,

    /// Root for per-job artifact dumps.
    #[arg(long, default_value = "/var/lib/comfy_endpoints/artifacts")]
    artifacts_dir: PathBuf,

    /// Owner tag stamped on generated files.
    #[arg(long, env = "CE_APP_ID")]
    app_id: Option<String>,

    /// Declared artifacts (models and custom nodes) as a JSON file.
    #[arg(long)]
    artifacts_spec_path: Option<PathBuf>,

    /// Content cache root; cache reconciliation is skipped when unset.
    #[arg(long)]
    cache_root: Option<PathBuf>,

    /// Comma-separated directories scanned during cache reconciliation.
    #[arg(long, default_value = "")]
    watch_paths: String,

    /// Minimum size for a file to be moved into the cache.
    #[arg(long, default_value_t = 100)]
    min_file_size_mb: u64,

    /// Command line that starts the graph engine.
    #[arg(
        long,
        env = "COMFY_START_COMMAND",
        default_value = "python /opt/comfy/main.py --listen 127.0.0.1 --port 8188 --disable-auto-launch"
    )]
    comfy_command: String,

    /// The engine's models directory (subdirs become cache symlinks).
    #[arg(long, default_value = "/opt/comfy/models")]
    comfy_models_root: PathBuf,

    /// Cache directory model downloads land in.
    #[arg(long, default_value = "/var/lib/comfy_endpoints/cache_models")]
    cache_models_root: PathBuf,

    /// Directory custom nodes are cloned into.
    #[arg(long, default_value = "/opt/comfy/custom_nodes")]
    custom_nodes_root: PathBuf,

    /// How long to wait for the engine readiness endpoint.
    #[arg(long, default_value_t = 180)]
    engine_ready_timeout_seconds: u64,

    /// Enable debug logging.
    #[arg(long)]
    debug: bool,
}

fn split_csv(raw: &str) -> Vec<PathBuf> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(PathBuf::from)
        .collect()
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let args = Args::parse();
    let filter = if args.debug {
        EnvFilter::new("ce=debug")
    } else {
        EnvFilter::new("ce=info")
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    // 1. Materialize contract and workflow onto disk.
    materialize::materialize_json_file(
        &args.contract_path,
        args.contract_json.as_deref(),
        "contract",
    )?;
    materialize::materialize_json_file(
        &args.workflow_path,
        args.workflow_json.as_deref(),
        "workflow",
    )?;

    let contract =
        WorkflowContract::load(&args.contract_path).context("load contract")?;
    let workflow: Value = serde_json::from_str(
        &std::fs::read_to_string(&args.workflow_path).context("read workflow")?,
    )
    .context("parse workflow")?;
    ce_mapper::validate_contract_nodes(&workflow, &contract)
        .context("contract does not match workflow")?;

    // 2. Optional cache reconciliation.
    if let Some(cache_root) = &args.cache_root {
        let manager = CacheManager::new(cache_root, split_csv(&args.watch_paths), args.min_file_size_mb)
            .context("open cache")?;
        manager.reconcile().context("cache reconciliation")?;
    }

    // 3. Artifact resolution against the preflight graph.
    let mapper_env = MapperEnv {
        artifacts_dir: args.artifacts_dir.display().to_string(),
        state_db: args.state_db_path.display().to_string(),
    };
    let preflight = ce_mapper::build_preflight_payload(&workflow, &contract, &mapper_env)
        .context("build preflight payload")?;

    let specs = load_artifact_specs(args.artifacts_spec_path.as_deref())?;
    let resolver_ctx = ResolverContext {
        engine_models_root: args.comfy_models_root.clone(),
        cache_models_root: args.cache_models_root.clone(),
        custom_nodes_root: args.custom_nodes_root.clone(),
    };
    if let Err(failure) = ce_resolver::resolve_artifacts(&preflight, &specs, &resolver_ctx).await {
        return serve_degraded(&args, failure).await;
    }
    info!("artifact resolution complete");

    // 4. Engine up, then prove the graph with the preflight submission.
    let engine_client = ComfyClient::new(&args.comfy_url);
    let mut engine_process =
        engine::EngineProcess::spawn(&args.comfy_command).context("start engine")?;

    if let Err(e) = engine::await_engine_ready(
        &engine_client,
        Duration::from_secs(args.engine_ready_timeout_seconds),
        Duration::from_secs(2),
    )
    .await
    {
        engine_process.kill().await;
        return Err(e).context("engine readiness");
    }

    match engine_client.submit(&preflight).await {
        Ok(prompt_id) => info!(prompt_id, "preflight accepted by engine"),
        Err(e) => {
            error!(error = %e, "preflight submission rejected, aborting startup");
            engine_process.kill().await;
            anyhow::bail!("preflight failed: {e}");
        }
    }

    // 5. Gateway subprocess bound to the same files, then wait for the
    // first exit or a signal.
    let mut gateway_process = spawn_gateway(&args).context("start gateway")?;
    let code = supervise(&mut engine_process, &mut gateway_process).await;
    Ok(ExitCode::from(code))
}

fn load_artifact_specs(path: Option<&std::path::Path>) -> Result<Vec<ArtifactSpec>> {
    let Some(path) = path else {
        return Ok(Vec::new());
    };
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("read artifact specs {}", path.display()))?;
    let specs: Vec<ArtifactSpec> =
        serde_json::from_str(&raw).context("parse artifact specs")?;
    ArtifactSpec::validate_all(&specs).context("invalid artifact specs")?;
    Ok(specs)
}

/// The degraded endpoint takes the gateway's place; only a signal ends it.
async fn serve_degraded(args: &Args, failure: ResolverFailure) -> Result<ExitCode> {
    error!(stage = %failure.stage, message = %failure.message, "artifact resolution failed");
    let app = degraded::build_degraded_app(Arc::new(failure));
    let bind = format!("{}:{}", args.listen_host, args.listen_port);
    let listener = tokio::net::TcpListener::bind(&bind)
        .await
        .with_context(|| format!("bind {bind}"))?;
    warn!(bind = %bind, "serving degraded endpoint");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("serve degraded endpoint")?;
    Ok(ExitCode::SUCCESS)
}

/// The gateway binary ships next to the supervisor in the image.
fn spawn_gateway(args: &Args) -> Result<tokio::process::Child> {
    let gateway_bin = std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(|dir| dir.join("ce-gateway")))
        .filter(|candidate| candidate.is_file())
        .unwrap_or_else(|| PathBuf::from("ce-gateway"));

    let mut cmd = tokio::process::Command::new(gateway_bin);
    cmd.arg("--listen-host")
        .arg(&args.listen_host)
        .arg("--listen-port")
        .arg(args.listen_port.to_string())
        .arg("--api-key")
        .arg(&args.api_key)
        .arg("--comfy-url")
        .arg(&args.comfy_url)
        .arg("--contract-path")
        .arg(&args.contract_path)
        .arg("--workflow-path")
        .arg(&args.workflow_path)
        .arg("--state-db-path")
        .arg(&args.state_db_path)
        .arg("--artifacts-dir")
        .arg(&args.artifacts_dir);
    if let Some(app_id) = &args.app_id {
        cmd.arg("--app-id").arg(app_id);
    }
    if args.debug {
        cmd.arg("--debug");
    }

    let child = cmd.spawn().context("spawn ce-gateway")?;
    info!("gateway subprocess started");
    Ok(child)
}

enum FirstExit {
    Engine(i32),
    Gateway(i32),
    Signal,
}

/// Wait for either child to exit (propagating its code) or a signal
/// (exit 0), terminating the other child in all cases.
async fn supervise(
    engine_process: &mut engine::EngineProcess,
    gateway_process: &mut tokio::process::Child,
) -> u8 {
    let first = tokio::select! {
        engine_code = engine_process.wait() => FirstExit::Engine(engine_code.unwrap_or(1)),
        gateway_status = gateway_process.wait() => {
            FirstExit::Gateway(gateway_status.ok().and_then(|s| s.code()).unwrap_or(1))
        }
        _ = shutdown_signal() => FirstExit::Signal,
    };

    let code = match first {
        FirstExit::Engine(code) => {
            warn!(code, "engine exited first");
            let _ = gateway_process.kill().await;
            let _ = gateway_process.wait().await;
            code
        }
        FirstExit::Gateway(code) => {
            warn!(code, "gateway exited first");
            engine_process.kill().await;
            code
        }
        FirstExit::Signal => {
            info!("signal received, stopping children");
            let _ = gateway_process.kill().await;
            let _ = gateway_process.wait().await;
            engine_process.kill().await;
            0
        }
    };
    code.clamp(0, 255) as u8
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
