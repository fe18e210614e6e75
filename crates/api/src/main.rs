mod config;
mod metrics;
mod routes;

use anyhow::{Context, Result};
use extract::{LanguageModel, LlmProvider};
use index::{EntityGraph, GraphStore, Neo4jStore, OllamaEmbedder, QdrantStore};
use query::Gateways;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::config::AppConfig;
use crate::routes::AppState;

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let config = AppConfig::load()?;
    let state = Arc::new(build_state(&config).await?);

    let app = routes::router(state.clone());
    let listener = tokio::net::TcpListener::bind(&config.server.bind)
        .await
        .with_context(|| format!("Failed to bind {}", config.server.bind))?;

    info!(bind = %config.server.bind, "Server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(state.shutdown.clone()))
        .await
        .context("Server error")?;

    Ok(())
}

/// JSON lines when `GRAPHRAG_LOG_FORMAT=json`, human-readable otherwise. Level from `RUST_LOG`.
fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let json = std::env::var("GRAPHRAG_LOG_FORMAT").is_ok_and(|v| v.eq_ignore_ascii_case("json"));

    let subscriber = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        subscriber.json().init();
    } else {
        subscriber.init();
    }
}

/// Connect every gateway once and hand the same handles to the query and ingestion paths.
async fn build_state(config: &AppConfig) -> Result<AppState> {
    let retry = config.retry.policy();

    let llm: Arc<dyn LanguageModel> = Arc::new(
        LlmProvider::from_config(&config.llm, retry.clone())
            .context("Failed to build language model client")?,
    );

    let embedder = Arc::new(
        OllamaEmbedder::new(
            &config.embedding.base_url,
            &config.embedding.model,
            config.embedding.dimension,
            config.embedding.timeout(),
            retry.clone(),
        )
        .context("Failed to build embedding client")?,
    );

    let qdrant = QdrantStore::new(
        &config.qdrant.url,
        &config.qdrant.collection,
        config.qdrant.timeout(),
        retry,
    )
    .context("Failed to build Qdrant client")?;
    qdrant
        .ensure_collection(config.embedding.dimension)
        .await
        .context("Failed to prepare Qdrant collection")?;

    let neo4j = Arc::new(
        Neo4jStore::connect(&config.neo4j.uri, &config.neo4j.user, &config.neo4j.password)
            .await
            .context("Failed to connect to Neo4j")?,
    );
    neo4j.init_schema().await.context("Failed to initialize Neo4j schema")?;

    let graph: Arc<dyn GraphStore> = neo4j.clone();
    let entity_graph: Arc<dyn EntityGraph> = neo4j;

    info!(
        provider = llm.provider_name(),
        model = %config.llm.model,
        classifier = ?config.classifier,
        collection = %config.qdrant.collection,
        "Gateways ready"
    );

    let gateways = Gateways {
        embedder,
        vectors: Arc::new(qdrant),
        graph,
        llm,
    };
    Ok(AppState::new(gateways, entity_graph, config))
}

async fn shutdown_signal(shutdown: CancellationToken) {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
    shutdown.cancel();
}
