use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use extract::{ExtractedChunk, Extractor, LlmError};
use futures::{stream, FutureExt, StreamExt};
use index::{EntityGraph, GraphStore, IndexError, IndexReport, Indexer, VectorStore};
use ingest::{Chunk, ClassificationLevel};
use query::{
    ConversationMemory, Exchange, Gateways, IntentClassifier, LlmIntentClassifier, PipelineError,
    PipelineOutput, Query, RetrievalPipeline, RuleBasedClassifier,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tower::ServiceBuilder;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{error, info, warn};

use crate::config::{AppConfig, ClassifierKind, ConcurrencyConfig};
use crate::metrics::{Metrics, QueryOutcome, TimedOperation};

pub struct AppState {
    pub pipeline: RetrievalPipeline,
    pub indexer: Indexer,
    pub extractor: Extractor,
    pub vectors: Arc<dyn VectorStore>,
    pub graph: Arc<dyn GraphStore>,
    pub metrics: Arc<Metrics>,
    pub concurrency: ConcurrencyConfig,
    /// Cancelled on shutdown; in-flight queries hold child tokens.
    pub shutdown: CancellationToken,
}

impl AppState {
    pub fn new(gateways: Gateways, entity_graph: Arc<dyn EntityGraph>, config: &AppConfig) -> Self {
        let classifier: Arc<dyn IntentClassifier> = match config.classifier {
            ClassifierKind::Rules => Arc::new(RuleBasedClassifier::new()),
            ClassifierKind::Llm => Arc::new(LlmIntentClassifier::new(gateways.llm.clone())),
        };
        let memory = Arc::new(ConversationMemory::new(
            config.memory.max_exchanges,
            config.memory.max_sessions,
        ));
        let indexer = Indexer::new(
            gateways.embedder.clone(),
            gateways.vectors.clone(),
            entity_graph,
            config.resolver.clone(),
        );

        Self {
            vectors: gateways.vectors.clone(),
            graph: gateways.graph.clone(),
            extractor: Extractor::new(gateways.llm.clone()),
            pipeline: RetrievalPipeline::new(gateways, classifier, memory, config.pipeline.clone()),
            indexer,
            metrics: Metrics::new(),
            concurrency: config.concurrency.clone(),
            shutdown: CancellationToken::new(),
        }
    }
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/query", post(answer_query))
        .route("/ingest", post(ingest_documents))
        .route("/stats", get(get_stats))
        .route("/metrics", get(get_metrics))
        .route("/sessions/:id/history", get(session_history))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::permissive()),
        )
        .with_state(state)
}

/// Error body carrying only a user-safe message; details go to the log.
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self { status, message: message.into() }
    }
}

impl From<PipelineError> for ApiError {
    fn from(err: PipelineError) -> Self {
        error!(error = %err, "Request failed");
        let status = match &err {
            PipelineError::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            PipelineError::Cancelled => StatusCode::SERVICE_UNAVAILABLE,
            PipelineError::Llm(e) if e.is_transient() => StatusCode::SERVICE_UNAVAILABLE,
            PipelineError::Index(e) if e.is_transient() => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self::new(status, err.user_message())
    }
}

impl From<IndexError> for ApiError {
    fn from(err: IndexError) -> Self {
        PipelineError::from(err).into()
    }
}

impl From<LlmError> for ApiError {
    fn from(err: LlmError) -> Self {
        PipelineError::from(err).into()
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(serde_json::json!({ "error": self.message }))).into_response()
    }
}

#[derive(Serialize)]
struct HealthResponse {
    qdrant: String,
    neo4j: String,
}

fn health_status(result: Result<(), IndexError>) -> String {
    match result {
        Ok(()) => "ok".to_string(),
        Err(e) => format!("error: {}", e),
    }
}

async fn health_check(State(state): State<Arc<AppState>>) -> (StatusCode, Json<HealthResponse>) {
    let (vectors, graph) = tokio::join!(state.vectors.health(), state.graph.health());
    let status = if vectors.is_ok() && graph.is_ok() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        status,
        Json(HealthResponse {
            qdrant: health_status(vectors),
            neo4j: health_status(graph),
        }),
    )
}

#[derive(Deserialize)]
struct QueryRequest {
    query: String,
    session_id: Option<String>,
    user_id: Option<String>,
    access_level: Option<ClassificationLevel>,
}

async fn answer_query(
    State(state): State<Arc<AppState>>,
    Json(req): Json<QueryRequest>,
) -> Result<Json<PipelineOutput>, ApiError> {
    let timer = TimedOperation::start();

    let mut query = Query::new(req.query);
    if let Some(session_id) = req.session_id {
        query = query.with_session(session_id);
    }
    if let Some(user_id) = req.user_id {
        query = query.with_user(user_id);
    }
    if let Some(level) = req.access_level {
        query = query.with_access_level(level);
    }

    let run = state.pipeline.run_with_cancel(query, state.shutdown.child_token());
    let result = match tokio::time::timeout(state.concurrency.request_timeout(), run).await {
        Ok(result) => result,
        Err(_) => {
            state.metrics.record_query(QueryOutcome::Failed, 0, timer.elapsed());
            warn!("Query exceeded the request timeout");
            return Err(ApiError::new(
                StatusCode::GATEWAY_TIMEOUT,
                "The request took too long to answer. Please try again shortly.",
            ));
        }
    };

    match result {
        Ok(output) => {
            let outcome = QueryOutcome::from_terminal(output.trace.terminal);
            state.metrics.record_query(outcome, output.trace.retries, timer.elapsed());
            Ok(Json(output))
        }
        Err(err) => {
            state.metrics.record_query(QueryOutcome::Failed, 0, timer.elapsed());
            Err(err.into())
        }
    }
}

#[derive(Deserialize)]
struct IngestRequest {
    path: String,
}

#[derive(Serialize)]
struct IngestResponse {
    chunks_created: usize,
    doc_ids: Vec<String>,
    entities_extracted: usize,
    resolution: IndexReport,
}

/// Read, chunk, extract and index a file or directory. Documents are replaced, not appended.
async fn ingest_documents(
    State(state): State<Arc<AppState>>,
    Json(req): Json<IngestRequest>,
) -> Result<Json<IngestResponse>, ApiError> {
    let timer = TimedOperation::start();
    let path = PathBuf::from(&req.path);

    if !path.exists() {
        return Err(ApiError::new(StatusCode::NOT_FOUND, format!("No such path: {}", req.path)));
    }

    let read = if path.is_dir() {
        ingest::ingest_directory(&path).await
    } else {
        ingest::ingest_file(&path).await
    };
    let chunks = read.map_err(|e| {
        warn!(path = %req.path, error = %e, "Failed to read documents");
        ApiError::new(StatusCode::BAD_REQUEST, "The document could not be read.")
    })?;

    // Extract everything before the stores are touched; a failure keeps the indexed version.
    let extractions: Vec<_> = chunks
        .iter()
        .map(|chunk| {
            state
                .extractor
                .extract_chunk(&chunk.chunk_id, &chunk.doc_id, &chunk.text)
                .boxed()
        })
        .collect();
    let extracted: Vec<ExtractedChunk> = stream::iter(extractions)
        .buffered(state.concurrency.max_concurrent_extractions.max(1))
        .collect::<Vec<Result<ExtractedChunk, LlmError>>>()
        .await
        .into_iter()
        .collect::<Result<_, _>>()?;

    let chunk_count = chunks.len();
    let entities_extracted: usize = extracted.iter().map(|e| e.extraction.entities.len()).sum();

    let mut documents: BTreeMap<String, Vec<(Chunk, ExtractedChunk)>> = BTreeMap::new();
    for (chunk, extracted) in chunks.into_iter().zip(extracted) {
        documents.entry(chunk.doc_id.clone()).or_default().push((chunk, extracted));
    }

    let mut resolution = IndexReport::default();
    for (doc_id, batch) in &documents {
        resolution.absorb(state.indexer.replace_document(doc_id, batch).await?);
    }

    state.metrics.record_ingest(timer.elapsed(), chunk_count, entities_extracted);
    info!(
        path = %req.path,
        documents = documents.len(),
        chunks = chunk_count,
        entities = entities_extracted,
        ?resolution,
        "Ingested documents"
    );

    Ok(Json(IngestResponse {
        chunks_created: chunk_count,
        doc_ids: documents.into_keys().collect(),
        entities_extracted,
        resolution,
    }))
}

async fn get_stats(State(state): State<Arc<AppState>>) -> Result<Json<index::IndexStats>, ApiError> {
    Ok(Json(state.indexer.get_stats().await?))
}

async fn get_metrics(State(state): State<Arc<AppState>>) -> Json<crate::metrics::MetricsSnapshot> {
    Json(state.metrics.snapshot())
}

#[derive(Serialize)]
struct SessionHistory {
    session_id: String,
    exchanges: Vec<Exchange>,
}

async fn session_history(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
) -> Json<SessionHistory> {
    let exchanges = state.pipeline.memory().history(&session_id);
    Json(SessionHistory { session_id, exchanges })
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use extract::{ChatMessage, LanguageModel};
    use futures::stream::BoxStream;
    use index::{HashingEmbedder, InMemoryGraphStore, InMemoryVectorStore};
    use serde_json::{json, Value};
    use std::sync::atomic::{AtomicBool, Ordering};
    use tower::ServiceExt;

    /// Canned answers; structured calls fail so extraction falls back to patterns.
    /// While `down` is set they fail with a 503 instead.
    #[derive(Default)]
    struct CannedModel {
        down: AtomicBool,
    }

    #[async_trait]
    impl LanguageModel for CannedModel {
        fn provider_name(&self) -> &'static str {
            "canned"
        }

        fn supports_structured_output(&self) -> bool {
            false
        }

        async fn complete(
            &self,
            _messages: &[ChatMessage],
            _temperature: f32,
            _max_tokens: Option<u32>,
        ) -> Result<String, LlmError> {
            Ok("Apply lockout tagout before opening V-201 [1].".to_string())
        }

        async fn complete_structured(
            &self,
            _messages: &[ChatMessage],
            _schema: &Value,
            _temperature: f32,
        ) -> Result<Value, LlmError> {
            if self.down.load(Ordering::SeqCst) {
                return Err(LlmError::Status { status: 503, body: "overloaded".into() });
            }
            Err(LlmError::Schema("no structured output".into()))
        }

        async fn stream(
            &self,
            _messages: &[ChatMessage],
            _temperature: f32,
        ) -> Result<BoxStream<'static, Result<String, LlmError>>, LlmError> {
            Err(LlmError::Unsupported { provider: "canned", capability: "stream" })
        }
    }

    fn app() -> (Router, Arc<AppState>) {
        app_with(Arc::new(CannedModel::default()), Arc::new(InMemoryVectorStore::new()))
    }

    fn app_with(llm: Arc<CannedModel>, vectors: Arc<InMemoryVectorStore>) -> (Router, Arc<AppState>) {
        let graph = Arc::new(InMemoryGraphStore::new());
        let gateways = Gateways {
            embedder: Arc::new(HashingEmbedder::new(128)),
            vectors,
            graph: graph.clone(),
            llm,
        };
        let state = Arc::new(AppState::new(gateways, graph, &AppConfig::default()));
        (router(state.clone()), state)
    }

    async fn call(app: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let body = body.map(|b| Body::from(b.to_string())).unwrap_or_else(Body::empty);
        let request = Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json")
            .body(body)
            .unwrap();

        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    async fn ingest_valve_sop(app: &Router) -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("valve-isolation.md"),
            "+++\ntitle = \"Valve isolation\"\ndoc_type = \"SOP\"\n+++\n\
             Before opening V-201 apply lockout tagout and wear chemical gloves.\n",
        )
        .unwrap();

        let (status, body) = call(
            app,
            "POST",
            "/ingest",
            Some(json!({ "path": dir.path().to_string_lossy() })),
        )
        .await;
        assert_eq!(status, StatusCode::OK, "{body}");
        assert_eq!(body["chunks_created"], 1);
        dir
    }

    #[tokio::test]
    async fn test_health_reports_both_stores() {
        let (app, _) = app();
        let (status, body) = call(&app, "GET", "/health", None).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["qdrant"], "ok");
        assert_eq!(body["neo4j"], "ok");
    }

    #[tokio::test]
    async fn test_ingest_missing_path_is_not_found() {
        let (app, _) = app();
        let (status, body) = call(&app, "POST", "/ingest", Some(json!({ "path": "/no/such/dir" }))).await;

        assert_eq!(status, StatusCode::NOT_FOUND);
        assert!(body["error"].as_str().unwrap().contains("/no/such/dir"));
    }

    #[tokio::test]
    async fn test_ingest_then_bypass_query_escalates() {
        let (app, state) = app();
        let _dir = ingest_valve_sop(&app).await;

        let (status, body) = call(
            &app,
            "POST",
            "/query",
            Some(json!({ "query": "How do I bypass the interlock on valve V-201?", "session_id": "shift-a" })),
        )
        .await;

        assert_eq!(status, StatusCode::OK, "{body}");
        assert_eq!(body["trace"]["terminal"], "ESCALATE");
        assert_eq!(body["safety_escalation"]["severity"], "HIGH");
        assert_eq!(body["confidence"], 0.0);

        let (_, metrics) = call(&app, "GET", "/metrics", None).await;
        assert_eq!(metrics["total_queries"], 1);
        assert_eq!(metrics["escalated"], 1);
        assert_eq!(metrics["ingest_requests"], 1);

        let (_, history) = call(&app, "GET", "/sessions/shift-a/history", None).await;
        assert_eq!(history["exchanges"].as_array().unwrap().len(), 1);
        assert_eq!(state.pipeline.memory().session_count(), 1);
    }

    #[tokio::test]
    async fn test_reingest_replaces_document() {
        let (app, _) = app();
        let dir = ingest_valve_sop(&app).await;

        let (status, body) = call(
            &app,
            "POST",
            "/ingest",
            Some(json!({ "path": dir.path().to_string_lossy() })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        // Same asset tag resolves onto the entity created by the first run.
        assert_eq!(body["resolution"]["created"], 0);

        let (_, stats) = call(&app, "GET", "/stats", None).await;
        assert_eq!(stats["entities"], 1);
    }

    #[tokio::test]
    async fn test_failed_reingest_keeps_indexed_version() {
        let llm = Arc::new(CannedModel::default());
        let vectors = Arc::new(InMemoryVectorStore::new());
        let (app, _) = app_with(llm.clone(), vectors.clone());
        let dir = ingest_valve_sop(&app).await;
        assert_eq!(vectors.len().await, 1);

        llm.down.store(true, Ordering::SeqCst);
        let (status, body) = call(
            &app,
            "POST",
            "/ingest",
            Some(json!({ "path": dir.path().to_string_lossy() })),
        )
        .await;

        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE, "{body}");
        assert_eq!(vectors.len().await, 1);
        let (_, stats) = call(&app, "GET", "/stats", None).await;
        assert_eq!(stats["entities"], 1);
    }

    #[tokio::test]
    async fn test_router_serves_from_spawned_tasks() {
        let (app, _) = app();
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("pump.md"), "Inspect P-101 seals monthly.\n").unwrap();
        let path = dir.path().to_string_lossy().to_string();

        // Handlers run on the multi-threaded runtime, so their futures must be Send.
        let ingest = tokio::spawn({
            let app = app.clone();
            async move { call(&app, "POST", "/ingest", Some(json!({ "path": path }))).await }
        });
        let (status, _) = ingest.await.unwrap();
        assert_eq!(status, StatusCode::OK);

        let query = tokio::spawn(async move {
            call(&app, "POST", "/query", Some(json!({ "query": "How often are P-101 seals inspected?" }))).await
        });
        let (status, body) = query.await.unwrap();
        assert_eq!(status, StatusCode::OK, "{body}");
    }
}
