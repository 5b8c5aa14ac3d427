// veridian-sidecar: composition root.
// Parses configuration, applies the determinism environment, loads and
// gates the model, wires the backend, and serves the facade until a
// shutdown signal drains the process.

use anyhow::Context;
use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

use veridian_determinism::{DeterminismController, DeterminismPolicy};
use veridian_engine::{InferenceConfig, InferenceEngine, TOTAL_FEATURE_DIM};
use veridian_model::ModelLoader;
use veridian_rpc::{serve, AppContext, Lifecycle, LifecycleState};
use veridian_serving::{ServingClient, ServingConfig};
use veridian_telemetry::InferenceMetrics;

#[derive(Parser, Debug)]
#[command(
    name = "veridian-sidecar",
    version,
    about = "Deterministic identity-scoring inference sidecar"
)]
struct Args {
    /// Path to the model artifact
    #[arg(long, env = "VERIDIAN_MODEL_PATH")]
    model_path: PathBuf,

    /// Model version the operator expects to be running
    #[arg(long, env = "VERIDIAN_MODEL_VERSION", default_value = "")]
    model_version: String,

    /// Required artifact content hash, lowercase hex; omit to disable the gate
    #[arg(long, env = "VERIDIAN_EXPECTED_MODEL_HASH")]
    expected_model_hash: Option<String>,

    /// Fleet-wide pin for the default test vector's output hash
    #[arg(long, env = "VERIDIAN_PINNED_V0_HASH")]
    pinned_v0_hash: Option<String>,

    /// Remote serving base URL; omit to run stub-only
    #[arg(long, env = "VERIDIAN_SERVING_URL")]
    serving_url: Option<String>,

    /// Model name in the serving registry
    #[arg(long, env = "VERIDIAN_SERVING_MODEL", default_value = "identity_score")]
    serving_model: String,

    /// Facade listen address
    #[arg(long, env = "VERIDIAN_LISTEN_ADDR", default_value = "0.0.0.0:8700")]
    listen: SocketAddr,

    /// Per-request deadline, milliseconds
    #[arg(long, env = "VERIDIAN_TIMEOUT_MS", default_value_t = 1000)]
    timeout_ms: u64,

    /// Refuse GPU execution paths
    #[arg(long, env = "VERIDIAN_FORCE_CPU", default_value_t = true, action = clap::ArgAction::Set)]
    force_cpu: bool,

    /// Random seed exported to the backend
    #[arg(long, env = "VERIDIAN_SEED", default_value_t = 42)]
    seed: u64,

    /// Fall back to the in-process stub when remote serving fails
    #[arg(long, env = "VERIDIAN_ALLOW_STUB_FALLBACK", default_value_t = true, action = clap::ArgAction::Set)]
    allow_stub_fallback: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let policy = DeterminismPolicy::new(args.seed, args.force_cpu);
    apply_environment(&DeterminismController::new(policy));

    let config = InferenceConfig {
        model_path: args.model_path.clone(),
        model_version: args.model_version.clone(),
        expected_model_hash: args.expected_model_hash.clone(),
        request_timeout: Duration::from_millis(args.timeout_ms),
        force_cpu: args.force_cpu,
        seed: args.seed,
        allow_stub_fallback: args.allow_stub_fallback,
        pinned_default_vector_hash: args.pinned_v0_hash.clone(),
    };

    let lifecycle = Arc::new(Lifecycle::new());
    let metrics = Arc::new(InferenceMetrics::new());

    let (engine, startup_error) = match build_engine(&args, config, metrics) {
        Ok(engine) => {
            lifecycle
                .transition(LifecycleState::Loaded)
                .and_then(|_| lifecycle.transition(LifecycleState::Ready))
                .map_err(anyhow::Error::msg)?;
            info!(
                version = engine.artifact().version(),
                hash = &engine.artifact().hash_hex()[..16],
                input_dim = engine.artifact().input_dim(),
                serving = args.serving_url.as_deref().unwrap_or("(stub only)"),
                "veridian sidecar ready"
            );
            (Some(Arc::new(engine)), None)
        }
        Err(err) => {
            // Keep serving so HealthCheck reports Unhealthy; everything else
            // is refused until an operator replaces the artifact.
            error!(error = %err, "startup failed, refusing Ready");
            (None, Some(format!("{err:#}")))
        }
    };

    let ctx = Arc::new(AppContext {
        engine,
        lifecycle,
        startup_error,
        pipeline_version: env!("CARGO_PKG_VERSION").to_string(),
    });

    serve(ctx, args.listen, shutdown_signal()).await;
    Ok(())
}

fn build_engine(
    args: &Args,
    config: InferenceConfig,
    metrics: Arc<InferenceMetrics>,
) -> anyhow::Result<InferenceEngine> {
    let artifact = ModelLoader::load(
        &args.model_path,
        TOTAL_FEATURE_DIM,
        args.expected_model_hash.as_deref(),
    )
    .context("model artifact failed integrity checks")?;

    if !args.model_version.is_empty() && args.model_version != artifact.version() {
        warn!(
            declared = %args.model_version,
            loaded = %artifact.version(),
            "declared model version differs from loaded artifact"
        );
    }

    let serving = match &args.serving_url {
        Some(url) => Some(Arc::new(ServingClient::new(ServingConfig {
            endpoint: url.clone(),
            model_name: args.serving_model.clone(),
            input_name: artifact.input_name().to_string(),
            output_name: artifact.output_name().to_string(),
            timeout: Duration::from_millis(args.timeout_ms),
            retries: 0,
        })?)),
        None => None,
    };

    Ok(InferenceEngine::new(
        config,
        Arc::new(artifact),
        serving,
        metrics,
    )?)
}

/// Applies the backend-tuning variables, skipping anything the operator
/// already set.
fn apply_environment(controller: &DeterminismController) {
    for (key, value) in controller.environment_overrides() {
        if std::env::var_os(&key).is_none() {
            std::env::set_var(&key, &value);
            info!(%key, %value, "determinism override applied");
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(err) => {
                warn!(error = %err, "SIGTERM handler unavailable");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("ctrl-c received, draining"),
        _ = terminate => info!("SIGTERM received, draining"),
    }
}
