mod api;

use axum::{
    body::Body,
    extract::State,
    http::{header, HeaderMap},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use futures::TryStreamExt;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

// Internal imports
use crate::api::{ApiError, ChatRequest};
use berachat_core::ratelimit::{UpstashStore, DAILY_LIMIT};
use berachat_core::{
    Brain, Catalog, Dispatcher, Orchestrator, RateLimiter, Settings, SlidingWindow,
};

// Shared by every request. The limiter is absent in development or without KV credentials.
#[derive(Clone)]
struct AppState {
    orchestrator: Arc<Orchestrator>,
    limiter: Option<Arc<RateLimiter>>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 1. Logging Setup
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,tower_http=info")),
        )
        .with_target(false)
        .compact()
        .init();

    info!("BeraChat Gateway Initializing...");
    let settings = Settings::from_env()?;

    // 2. The Brain
    info!("Connecting to OpenAI Brain...");
    let brain = Brain::new(&settings.llm)?;
    match brain.say_hello().await {
        Ok(msg) => info!("Brain Status: {}", msg),
        Err(e) => error!("Brain is online but unresponsive: {}", e),
    }

    // 3. The Catalog, loaded once and offered to the Brain on every request
    info!("Loading Function Catalog...");
    let catalog = match &settings.catalog_path {
        Some(path) => Catalog::load(path).await?,
        None => Catalog::builtin()?,
    };
    info!("Loaded {} functions available for the Brain.", catalog.len());

    let dispatcher = Dispatcher::new(
        &settings.data_api.base_url,
        settings.data_api.timeout,
        Arc::new(catalog),
    )?;
    info!("Data API at {}", settings.data_api.base_url);

    let system_prompt = settings.system_prompt().await?;
    let orchestrator = Orchestrator::new(Arc::new(brain), dispatcher, system_prompt, settings.pacing);

    // 4. Rate limiting
    let limiter = match settings.rate_limit_backend() {
        Some(kv) => {
            info!("Rate limiting enabled: {} requests per client per day", DAILY_LIMIT);
            Some(Arc::new(RateLimiter::new(
                Arc::new(UpstashStore::new(kv)?),
                SlidingWindow::daily(DAILY_LIMIT),
            )))
        }
        None => None,
    };
    if limiter.is_none() {
        info!("Rate limiting disabled");
    }

    let state = AppState {
        orchestrator: Arc::new(orchestrator),
        limiter,
    };

    // 5. Start Server
    let listener = TcpListener::bind(settings.bind_addr).await?;
    info!("Gateway listening on {}...", settings.bind_addr);

    axum::serve(listener, app(state))
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

fn app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/api/chat", post(chat))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {}", e);
    }
    info!("Shutting down...");
}

// --- HANDLERS ---

async fn health_check() -> &'static str {
    "BeraChat Gateway: Operational"
}

async fn chat(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<ChatRequest>,
) -> Result<Response, ApiError> {
    if let Some(limiter) = &state.limiter {
        let ip = client_ip(&headers);
        match limiter.limit(ip).await {
            Ok(decision) if !decision.success => {
                warn!("Client {} is over its daily limit", ip);
                return Err(ApiError::RateLimited(decision));
            }
            Ok(_) => {}
            // The counter lives elsewhere; an outage there should not take chat down.
            Err(e) => error!("Rate limiter unavailable, letting request through: {}", e),
        }
    }

    info!("Chat request with {} messages", payload.messages.len());
    let stream = state.orchestrator.handle(payload.messages).await?;

    let body = Body::from_stream(
        stream.inspect_err(|e| error!("Response stream aborted: {}", e)),
    );
    Ok((
        [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        body,
    )
        .into_response())
}

// First hop of X-Forwarded-For, as set by the proxy in front of us.
fn client_ip(headers: &HeaderMap) -> &str {
    headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|ip| !ip.is_empty())
        .unwrap_or("unknown")
}
