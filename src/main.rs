use std::sync::Arc;

use tower_http::cors::CorsLayer;

use scrape_orchestrator::api::{AppState, job_routes};
use scrape_orchestrator::config::OrchestratorConfig;
use scrape_orchestrator::error::Result;
use scrape_orchestrator::jobs::{
    JobLifecycleManager, JobManager, ReconnectReconciler, spawn_lifecycle_task,
    spawn_reconnect_listener,
};
use scrape_orchestrator::pipeline::{PipelineExecutor, build_registry};
use scrape_orchestrator::rpc::{RpcClient, RpcTransport, WorkerRpc};
use scrape_orchestrator::store::{JobStore, LibSqlJobStore};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let config = OrchestratorConfig::from_env()?;

    eprintln!("Scrape orchestrator v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Worker: {}", config.rpc.url);
    eprintln!("   Job API: http://0.0.0.0:{}/api/jobs", config.http_port);
    eprintln!("   Job feed: ws://0.0.0.0:{}/ws/jobs", config.http_port);

    // ── Database ─────────────────────────────────────────────────────────
    let db_path = std::path::Path::new(&config.db_path);
    let store: Arc<dyn JobStore> = Arc::new(LibSqlJobStore::new_local(db_path).await.map_err(
        |e| {
            eprintln!("Error: Failed to open database at {}: {}", config.db_path, e);
            e
        },
    )?);
    eprintln!("   Database: {}", config.db_path);

    // ── Worker connection ───────────────────────────────────────────────
    let transport = Arc::new(RpcTransport::new(config.rpc.clone()));
    if let Err(e) = transport.connect_with_retry(config.connect_attempts).await {
        eprintln!(
            "Error: Could not reach worker at {} after {} attempts: {}",
            config.rpc.url, config.connect_attempts, e
        );
        return Err(e.into());
    }
    let worker: Arc<dyn WorkerRpc> = Arc::new(RpcClient::new(Arc::clone(&transport)));
    match worker.health_check().await {
        Ok(reply) => tracing::info!(request_id = %reply.request_id, "Worker healthy"),
        Err(e) => tracing::warn!(error = %e, "Worker health check failed"),
    }

    // ── Pipelines ───────────────────────────────────────────────────────
    let registry = Arc::new(build_registry(Arc::clone(&worker)));
    let pipeline_count = registry.count().await;
    eprintln!("   Pipelines: {} registered", pipeline_count);
    let executor = Arc::new(PipelineExecutor::new(registry));

    // ── Jobs ────────────────────────────────────────────────────────────
    let jobs = JobManager::new(Arc::clone(&store)).with_worker(Arc::clone(&worker));

    let lifecycle = Arc::new(JobLifecycleManager::new(
        jobs.clone(),
        config.timeouts.clone(),
        config.lifecycle.clone(),
    ));
    let _sweep_handle = spawn_lifecycle_task(lifecycle);

    let reconciler = Arc::new(ReconnectReconciler::new(jobs.clone(), config.timeouts.clone()));
    // Jobs left active by a previous run are audited like a reconnect.
    reconciler.reconcile().await;
    let _reconnect_handle = spawn_reconnect_listener(reconciler, transport.subscribe());

    // ── HTTP ────────────────────────────────────────────────────────────
    let app = job_routes(AppState {
        jobs,
        transport: Some(Arc::clone(&transport)),
        executor,
    })
    .layer(CorsLayer::permissive());
    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", config.http_port)).await?;
    tracing::info!(port = config.http_port, "Job API server started");
    eprintln!("   Ready.\n");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("Shutdown requested");
        })
        .await?;

    transport.disconnect().await;
    Ok(())
}
