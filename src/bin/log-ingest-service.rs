/// Log Ingestion Service
///
/// Accepts uploaded log files, parses and scores them on a background worker
/// pool, and serves queries, analytics and streamed AI analysis.
/// Port: 3002
use log_pipeline::analysis_stream::AnalysisStreamer;
use log_pipeline::api::{self, AppState};
use log_pipeline::clickhouse_store::ClickHouseStore;
use log_pipeline::config::{Config, StoreBackend};
use log_pipeline::llm_service::LlmClient;
use log_pipeline::memory_store::MemoryStore;
use log_pipeline::root_cause::RootCauseAnalyzer;
use log_pipeline::similarity::{OpenAiEmbeddings, SimilaritySearch};
use log_pipeline::traits::LogStore;
use log_pipeline::LogPipeline;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

fn build_store(config: &Config) -> anyhow::Result<Arc<dyn LogStore>> {
    Ok(match config.store_backend {
        StoreBackend::ClickHouse => {
            info!("Connecting to ClickHouse: {}", config.clickhouse_url);
            Arc::new(ClickHouseStore::from_config(config)?)
        }
        StoreBackend::Memory => Arc::new(MemoryStore::new()),
    })
}

fn build_analyzer(config: &Config) -> Option<Arc<RootCauseAnalyzer>> {
    let llm_config = config.llm_config()?;
    match LlmClient::new(llm_config) {
        Ok(client) => Some(Arc::new(RootCauseAnalyzer::new(Arc::new(client)))),
        Err(e) => {
            warn!("LLM disabled: {}", e);
            None
        }
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Could not listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present (fails silently if not found)
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .with_thread_ids(true)
        .init();

    info!("Starting Log Ingestion Service");

    let config = Config::from_env()?;
    config.log_config();

    let store = build_store(&config)?;
    store.init().await?;

    let pipeline = Arc::new(LogPipeline::start(store.clone(), config.pipeline_options()));
    let streamer = AnalysisStreamer::new(build_analyzer(&config));

    let mut state = AppState::new(pipeline.clone(), streamer);
    if let Some(api_key) = config.embedding_api_key() {
        let embeddings = OpenAiEmbeddings::new(api_key, &config.embedding_model);
        state = state.with_similarity(Arc::new(SimilaritySearch::new(Arc::new(embeddings))));
        info!("Similarity search enabled ({})", config.embedding_model);
    }

    let app = api::router(state);

    let addr = format!("0.0.0.0:{}", config.port);
    info!("🚀 Log Ingestion Service listening on {}", addr);
    info!("");
    info!("📊 Endpoints:");
    info!("   GET  /health               - Health check");
    info!("   POST /upload-log?filename= - Upload a .log/.txt file (raw body)");
    info!("   GET  /jobs/:job_id         - Job status");
    info!("   POST /jobs/:job_id/embed   - Add a completed job to the similarity index");
    info!("   GET  /logs                 - Query logs (filters + pagination)");
    info!("   GET  /analytics            - Last 24h aggregates");
    info!("   POST /ask-ai               - Streamed analysis (SSE)");

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Draining task queue");
    pipeline.shutdown().await;
    store.close().await?;

    Ok(())
}
