//! Vision Extract - streaming extraction server.

use axum::{
    body::Body,
    extract::{DefaultBodyLimit, State},
    http::{header, StatusCode, Uri},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use futures::StreamExt;
use serde::Deserialize;
use serde_json::{json, Value};
use std::convert::Infallible;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use vision_extract::codec::encode;
use vision_extract::config::AppConfig;
use vision_extract::error::ApiError;
use vision_extract::providers::{
    ChatCompletionProvider, CloudVisionProvider, LocalOcrProvider, Providers,
};
use vision_extract::record_store::{FileRecordStore, StoredRecord};
use vision_extract::schema::{InboundRequest, ProviderConfig, RequestDefaults};
use vision_extract::supervisor::{BridgeStatus, LogEntry, Supervisor, Tier};
use vision_extract::{Coordinator, Orchestrator};

/// Application state shared across handlers.
#[derive(Clone)]
struct AppState {
    coordinator: Coordinator,
    supervisor: Arc<Supervisor>,
    defaults: Arc<RequestDefaults>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| "vision_extract=debug,tower_http=debug".into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = AppConfig::from_env()?;
    let client = reqwest::Client::builder().build()?;

    let supervisor = Arc::new(Supervisor::new(config.bridge.clone(), client.clone()));
    let providers = Providers {
        cloud_vision: Arc::new(CloudVisionProvider::new(client.clone(), config.stream_idle_timeout)),
        chat: Arc::new(ChatCompletionProvider::new(client.clone(), config.stream_idle_timeout)),
        local_ocr: Arc::new(LocalOcrProvider::new(Arc::clone(&supervisor), client.clone())),
    };
    let store = FileRecordStore::open(&config.records_path).await?;
    info!("Record store at {:?}", store.path());

    let state = AppState {
        coordinator: Coordinator::new(Orchestrator::new(providers), Arc::new(store)),
        supervisor: Arc::clone(&supervisor),
        defaults: Arc::new(config.request_defaults()),
    };

    if config.bridge.autostart && supervisor.status().await.installed {
        let supervisor = Arc::clone(&supervisor);
        tokio::spawn(async move {
            let state = supervisor.start(None).await;
            info!("Bridge autostart finished: {:?}", state);
        });
    }

    let app = Router::new()
        .route("/health", get(health))
        .route("/api/extract", post(extract))
        .route("/api/records", get(list_records))
        .route("/api/providers/health", post(provider_health))
        .route("/api/bridge/status", get(bridge_status))
        .route("/api/bridge/logs", get(bridge_logs))
        .route("/api/bridge/install", post(bridge_install))
        .route("/api/bridge/start", post(bridge_start))
        .route("/api/bridge/stop", post(bridge_stop))
        .route("/api/bridge/tier", post(bridge_tier))
        .fallback(not_found)
        .layer(DefaultBodyLimit::max(50 * 1024 * 1024)) // 50MB, base64 images
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state);

    let addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("Server listening on http://{}", addr);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Stopping bridge");
    supervisor.stop().await;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}

// ============================================================================
// Handlers
// ============================================================================

/// Health check endpoint.
async fn health() -> &'static str {
    "ok"
}

/// Run an extraction, streaming NDJSON frames.
async fn extract(
    State(state): State<AppState>,
    Json(inbound): Json<InboundRequest>,
) -> Result<Response, ApiError> {
    let validated = inbound.validate(&state.defaults)?;
    info!(
        "Extraction request: model={}, strategy={:?}, image={}",
        validated.provider.model,
        validated.strategy,
        validated.request.has_image()
    );

    let frames = state
        .coordinator
        .run(validated)
        .map(|frame| Ok::<_, Infallible>(encode(&frame)));

    Ok((
        [
            (header::CONTENT_TYPE, "application/x-ndjson"),
            (header::CACHE_CONTROL, "no-cache"),
        ],
        Body::from_stream(frames),
    )
        .into_response())
}

async fn list_records(State(state): State<AppState>) -> Result<Json<Vec<StoredRecord>>, ApiError> {
    Ok(Json(state.coordinator.store().list().await?))
}

#[derive(Deserialize)]
struct ProviderHealthRequest {
    model: String,
    #[serde(default)]
    base_url: Option<String>,
    #[serde(default)]
    api_key: Option<String>,
}

/// Probe the provider a request with this model/base URL would use.
async fn provider_health(
    State(state): State<AppState>,
    Json(body): Json<ProviderHealthRequest>,
) -> Result<Json<Value>, ApiError> {
    if body.model.trim().is_empty() {
        return Err(ApiError::BadRequest("model is required".to_string()));
    }
    let mut config = ProviderConfig::new(
        body.base_url
            .filter(|u| !u.trim().is_empty())
            .unwrap_or_else(|| state.defaults.base_url.clone()),
        body.model,
    );
    config.api_key = body.api_key.or_else(|| state.defaults.api_key.clone());

    let (kind, provider) = state.coordinator.orchestrator().providers().select(&config);
    let healthy = provider.check_health(&config).await;
    Ok(Json(json!({ "healthy": healthy, "provider": kind })))
}

async fn bridge_status(State(state): State<AppState>) -> Json<BridgeStatus> {
    Json(state.supervisor.status().await)
}

/// Destructive read of the bridge log buffer.
async fn bridge_logs(State(state): State<AppState>) -> Json<Vec<LogEntry>> {
    Json(state.supervisor.drain_logs())
}

#[derive(Deserialize)]
struct TierBody {
    tier: String,
}

impl TierBody {
    fn parse(&self) -> Result<Tier, ApiError> {
        self.tier.parse().map_err(ApiError::BadRequest)
    }
}

async fn bridge_install(
    State(state): State<AppState>,
    Json(body): Json<TierBody>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    let tier = body.parse()?;
    state.supervisor.install(tier);
    Ok((
        StatusCode::ACCEPTED,
        Json(json!({ "status": "installing", "tier": tier })),
    ))
}

/// Start in the background; progress shows up in status and logs.
async fn bridge_start(
    State(state): State<AppState>,
    body: Option<Json<TierBody>>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    let tier = body.map(|Json(b)| b.parse()).transpose()?;
    let supervisor = Arc::clone(&state.supervisor);
    tokio::spawn(async move {
        supervisor.start(tier).await;
    });
    Ok((StatusCode::ACCEPTED, Json(json!({ "status": "starting" }))))
}

async fn bridge_stop(State(state): State<AppState>) -> Json<Value> {
    state.supervisor.stop().await;
    Json(json!({ "status": "stopped" }))
}

async fn bridge_tier(
    State(state): State<AppState>,
    Json(body): Json<TierBody>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    let tier = body.parse()?;
    let supervisor = Arc::clone(&state.supervisor);
    tokio::spawn(async move {
        supervisor.set_active_tier(tier).await;
    });
    Ok((
        StatusCode::ACCEPTED,
        Json(json!({ "status": "switching", "tier": tier })),
    ))
}

async fn not_found(uri: Uri) -> ApiError {
    ApiError::NotFound(uri.path().to_string())
}
