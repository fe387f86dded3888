use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{
    Json, Router,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use research_core::stub::{StubLanguageModel, StubSearchProvider, StubTransport};
use research_core::{
    ConfigLoader, PipelineError, PipelineOrchestrator, QueryGenerationError, Question,
    ResearchOptions, ResearchStats, SubQuery, SynthesisError, TelemetryOptions,
    init_metrics_from_env, init_telemetry,
};
use serde::{Deserialize, Serialize};
use tokio::{
    net::TcpListener,
    signal,
    sync::{OwnedSemaphorePermit, Semaphore, TryAcquireError},
};
use tracing::{info, warn};

#[derive(Clone)]
struct AppState {
    pipeline: Arc<PipelineOrchestrator>,
    request_permits: Arc<Semaphore>,
    max_requests: usize,
}

impl AppState {
    fn new(pipeline: PipelineOrchestrator, max_requests: usize) -> Self {
        Self {
            pipeline: Arc::new(pipeline),
            request_permits: Arc::new(Semaphore::new(max_requests)),
            max_requests,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = ConfigLoader::load(None).context("failed to load configuration")?;
    init_telemetry(TelemetryOptions {
        env_filter: Some(config.logging.level.clone()),
        with_ansi: false,
        ..TelemetryOptions::default()
    })?;
    init_metrics_from_env("research-api");

    let addr: SocketAddr = std::env::var("RESEARCH_API_ADDR")
        .unwrap_or_else(|_| "0.0.0.0:8080".to_string())
        .parse()
        .context("invalid RESEARCH_API_ADDR")?;

    let max_requests = std::env::var("RESEARCH_API_MAX_CONCURRENT")
        .ok()
        .and_then(|value| value.parse::<usize>().ok())
        .filter(|limit| *limit > 0)
        .unwrap_or(4);

    let offline = std::env::var("RESEARCH_API_OFFLINE")
        .map(|value| matches!(value.trim(), "1" | "true" | "yes"))
        .unwrap_or(false);
    let builder = PipelineOrchestrator::builder(config);
    let builder = if offline {
        warn!("RESEARCH_API_OFFLINE set; serving canned research results");
        builder
            .language_model(Arc::new(StubLanguageModel::offline()))
            .search_provider(Arc::new(StubSearchProvider::new()))
            .transport(Arc::new(StubTransport::new()))
    } else {
        builder
    };
    let pipeline = builder.build()?;

    let app = router(AppState::new(pipeline, max_requests));

    info!(%addr, max_requests, "research API listening");

    let listener = TcpListener::bind(addr).await?;
    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(handle_health))
        .route("/research-assistant", post(handle_research))
        .with_state(state)
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            warn!(error = %err, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };
    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(err) => {
                warn!(error = %err, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("shutdown signal received, stopping server");
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
enum ExplainFormat {
    #[default]
    Markdown,
    Mermaid,
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    stage: Option<&'static str>,
}

#[derive(Debug)]
struct AppError {
    status: StatusCode,
    message: String,
    stage: Option<&'static str>,
}

impl AppError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
            stage: None,
        }
    }
}

impl From<PipelineError> for AppError {
    fn from(error: PipelineError) -> Self {
        let status = match &error {
            PipelineError::InvalidQuestion(_) | PipelineError::InvalidOptions(_) => {
                StatusCode::BAD_REQUEST
            }
            PipelineError::Timeout(_)
            | PipelineError::QueryGeneration(QueryGenerationError::Timeout)
            | PipelineError::Synthesis(SynthesisError::Timeout) => StatusCode::GATEWAY_TIMEOUT,
            PipelineError::QueryGeneration(_) | PipelineError::Synthesis(_) => {
                StatusCode::BAD_GATEWAY
            }
        };
        Self {
            status,
            message: error.to_string(),
            stage: Some(error.stage()),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = Json(ErrorResponse {
            error: self.message,
            stage: self.stage,
        });
        (self.status, body).into_response()
    }
}

type ApiResult<T> = std::result::Result<T, AppError>;

fn acquire_request_permit(state: &AppState) -> ApiResult<OwnedSemaphorePermit> {
    match state.request_permits.clone().try_acquire_owned() {
        Ok(permit) => Ok(permit),
        Err(TryAcquireError::NoPermits) => Err(AppError::new(
            StatusCode::TOO_MANY_REQUESTS,
            "research capacity reached; retry once a slot frees up",
        )),
        Err(TryAcquireError::Closed) => Err(AppError::new(
            StatusCode::SERVICE_UNAVAILABLE,
            "research executor unavailable",
        )),
    }
}

#[derive(Debug, Deserialize)]
struct ResearchRequest {
    question: String,
    sub_query_count: Option<usize>,
    results_per_query: Option<usize>,
    explain: Option<ExplainFormat>,
}

#[derive(Debug, Serialize)]
struct ResearchResponse {
    request_id: String,
    report: String,
    sources: Vec<String>,
    sub_queries: Vec<SubQuery>,
    stats: ResearchStats,
    #[serde(skip_serializing_if = "Option::is_none")]
    explanation: Option<String>,
}

#[derive(Debug, Serialize)]
struct CapacityReport {
    max_requests: usize,
    available_requests: usize,
    active_requests: usize,
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    capacity: CapacityReport,
}

fn capacity_report(state: &AppState) -> CapacityReport {
    let available = state.request_permits.available_permits();
    CapacityReport {
        max_requests: state.max_requests,
        available_requests: available,
        active_requests: state.max_requests.saturating_sub(available),
    }
}

async fn handle_health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        capacity: capacity_report(&state),
    })
}

async fn handle_research(
    State(state): State<AppState>,
    Json(request): Json<ResearchRequest>,
) -> ApiResult<Json<ResearchResponse>> {
    let question = Question::new(request.question)?;
    let _permit = acquire_request_permit(&state)?;

    let options = ResearchOptions {
        sub_query_count: request.sub_query_count,
        results_per_query: request.results_per_query,
    };
    let outcome = state
        .pipeline
        .research_with_options(&question, options)
        .await?;

    let explanation = request.explain.map(|format| {
        let summary = outcome.trace.summary();
        match format {
            ExplainFormat::Markdown => summary.render_markdown(),
            ExplainFormat::Mermaid => summary.render_mermaid(),
        }
    });

    Ok(Json(ResearchResponse {
        request_id: outcome.request_id,
        report: outcome.report.body,
        sources: outcome.report.sources,
        sub_queries: outcome.sub_queries,
        stats: outcome.stats,
        explanation,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{Body, to_bytes};
    use axum::http::Request;
    use research_core::{LlmError, PromptPurpose, ResearchConfig};
    use serde_json::{Value, json};
    use tower::ServiceExt;

    fn state_with(llm: StubLanguageModel, max_requests: usize) -> AppState {
        let pipeline = PipelineOrchestrator::builder(ResearchConfig::default())
            .language_model(Arc::new(llm))
            .search_provider(Arc::new(StubSearchProvider::new()))
            .transport(Arc::new(StubTransport::new()))
            .build()
            .expect("default configuration is valid");
        AppState::new(pipeline, max_requests)
    }

    async fn post_json(app: Router, body: Value) -> (StatusCode, Value) {
        let request = Request::builder()
            .method("POST")
            .uri("/research-assistant")
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[tokio::test]
    async fn research_returns_report_and_sources() {
        let app = router(state_with(StubLanguageModel::offline(), 2));
        let (status, body) = post_json(
            app,
            json!({
                "question": "Compare X and Y",
                "sub_query_count": 2,
                "results_per_query": 2,
                "explain": "mermaid"
            }),
        )
        .await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["sources"].as_array().unwrap().len(), 4);
        assert_eq!(body["stats"]["hits"], 4);
        assert!(body["report"].as_str().unwrap().contains("Offline research report"));
        assert!(
            body["explanation"]
                .as_str()
                .unwrap()
                .starts_with("flowchart TD")
        );
    }

    #[tokio::test]
    async fn blank_question_is_rejected() {
        let app = router(state_with(StubLanguageModel::offline(), 1));
        let (status, body) = post_json(app, json!({ "question": "   " })).await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["stage"], "input");
    }

    #[tokio::test]
    async fn unparsable_expansion_is_a_bad_gateway() {
        let llm = StubLanguageModel::new(|request| match request.purpose {
            PromptPurpose::QueryGeneration => Ok("no list here".to_string()),
            _ => Err(LlmError::EmptyCompletion),
        });
        let app = router(state_with(llm, 1));
        let (status, body) = post_json(app, json!({ "question": "q" })).await;

        assert_eq!(status, StatusCode::BAD_GATEWAY);
        assert_eq!(body["stage"], "query_generation");
        assert!(body["error"].as_str().unwrap().contains("unparsable"));
    }

    #[test]
    fn timeouts_map_to_gateway_timeout() {
        let err = AppError::from(PipelineError::Synthesis(SynthesisError::Timeout));
        assert_eq!(err.status, StatusCode::GATEWAY_TIMEOUT);
        let err = AppError::from(PipelineError::Timeout(std::time::Duration::from_secs(1)));
        assert_eq!(err.stage, Some("timeout"));
    }

    #[test]
    fn capacity_limit_returns_429() {
        let state = state_with(StubLanguageModel::offline(), 1);

        let permit = acquire_request_permit(&state).expect("first permit should succeed");
        let err = acquire_request_permit(&state).expect_err("second permit should fail");
        let response = err.into_response();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        drop(permit);
    }

    #[tokio::test]
    async fn health_reports_capacity() {
        let app = router(state_with(StubLanguageModel::offline(), 3));
        let response = app
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["capacity"]["max_requests"], 3);
        assert_eq!(body["capacity"]["active_requests"], 0);
    }
}
