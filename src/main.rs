use anyhow::Result;
use axum::{routing::get, Router};
use panoscan_detector::config::Config;
use panoscan_detector::inference::{load_class_names, InferenceEngine, YoloDetector};
use panoscan_detector::metrics;
use panoscan_detector::pipeline::{Pipeline, PipelineSettings};
use panoscan_detector::retry::{Backoff, RetryExecutor};
use panoscan_detector::store::SqliteStore;
use panoscan_detector::taxonomy::TaxonomyMapper;

/// Serve /health and /metrics for the supervisor and scraper
async fn start_metrics_server(bind_addr: String) -> Result<()> {
    let addr: std::net::SocketAddr = bind_addr
        .parse()
        .map_err(|e| anyhow::anyhow!("Invalid metrics bind address: {}", e))?;

    let app = Router::new()
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler));

    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("📈 Metrics endpoint listening on {}", addr);

    axum::serve(listener, app)
        .await
        .map_err(|e| anyhow::anyhow!("Metrics server error: {}", e))
}

/// Health check endpoint
async fn health_handler() -> &'static str {
    "OK"
}

/// Prometheus metrics endpoint
async fn metrics_handler() -> String {
    metrics::export_metrics()
}

#[tokio::main]
async fn main() -> Result<()> {
    // ONNX Runtime logs every session build at info
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                tracing_subscriber::EnvFilter::new("info,ort=warn")
            }),
        )
        .init();

    tracing::info!("Starting panorama detection pipeline...");

    metrics::init_metrics();

    let config = Config::load()?;
    tracing::info!(
        model_version = %config.model_config.model_version,
        db_path = %config.store_config.db_path.display(),
        "Configuration loaded"
    );

    // A bad taxonomy file only degrades labels to "Unknown"
    let taxonomy = TaxonomyMapper::load(&config.taxonomy_path);

    let db_path = config.store_config.db_path.clone();
    if let Some(parent) = db_path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    let store = RetryExecutor::new(Backoff {
        max_attempts: config.store_config.connect_attempts,
        base_delay_ms: 500,
        max_delay_ms: 10_000,
    })
    .execute(|| {
        let path = db_path.clone();
        async move { SqliteStore::open(&path) }
    })
    .await?;
    if config.store_config.init_schema {
        store.apply_schema()?;
        tracing::info!("Store schema applied");
    }
    tracing::info!("Store opened at {}", db_path.display());

    ort::init()
        .with_execution_providers([ort::execution_providers::CPUExecutionProvider::default().build()])
        .commit()
        .map_err(|e| anyhow::anyhow!("Failed to initialize ONNX Runtime: {}", e))?;

    let model_config = &config.model_config;
    let class_names = load_class_names(model_config.class_names_path.as_deref());
    let detector = YoloDetector::load(
        &model_config.model_path,
        model_config.params.clone(),
        class_names,
    )?;

    let pipeline = Pipeline::new(
        store,
        InferenceEngine::new(detector),
        taxonomy,
        PipelineSettings {
            model_version: model_config.model_version.clone(),
            poll_interval: config.poll_config.interval(),
            batch_limit: config.poll_config.batch_limit,
        },
    );

    if let Some(bind_addr) = config.metrics_bind.clone() {
        tokio::spawn(async move {
            if let Err(e) = start_metrics_server(bind_addr).await {
                tracing::error!("❌ Metrics server error: {}", e);
            }
        });
    } else {
        tracing::info!("Metrics endpoint disabled");
    }

    let poll_loop = tokio::spawn(pipeline.run());

    tokio::select! {
        joined = poll_loop => match joined {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(e.into()),
            Err(e) => Err(anyhow::anyhow!("Poll loop task failed: {}", e)),
        },
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Termination signal received, exiting");
            Ok(())
        }
    }
}
