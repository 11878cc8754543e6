// =============================================================================
// REST API Endpoints — Axum 0.7
// =============================================================================
//
// Reality-side endpoints live under `/api/v1/`; the matching surface keeps
// its service-root paths (`/orders`, `/cancel`, `/market/...`). Public reads
// require no authentication; the admin surface requires the shared admin key
// and event ingress requires a valid payload signature.
//
// CORS is configured permissively for development; tighten allowed origins in
// production.
// =============================================================================

use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{Json, Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Router,
};
use chrono::{Duration, Utc};
use serde::Deserialize;
use tower_http::cors::{Any, CorsLayer};
use tracing::info;
use uuid::Uuid;

use crate::api::auth::{AdminKey, SIGNATURE_HEADER};
use crate::api::error::ApiError;
use crate::app_state::AppState;
use crate::ingest::IngestOutcome;
use crate::matching::engine::PlaceOrderRequest;
use crate::store::instruments::CreateInstrument;
use crate::types::Instrument;

// =============================================================================
// Router construction
// =============================================================================

/// Build the full router with CORS middleware and shared state.
pub fn router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        // ── Public ──────────────────────────────────────────────────
        .route("/api/v1/health", get(health))
        .route("/api/v1/stats", get(stats))
        .route("/api/v1/stocks", get(public_stocks))
        .route("/api/v1/scores/:symbol", get(get_score))
        .route("/api/v1/scores/:symbol/history", get(score_history))
        .route("/api/v1/events/:symbol", get(symbol_events))
        // ── Event ingress (signed) ──────────────────────────────────
        .route("/api/v1/reality/ingest", post(ingest_event))
        // ── Admin (shared key) ──────────────────────────────────────
        .route("/api/v1/admin/stocks", post(create_stock).get(admin_stocks))
        .route("/api/v1/admin/stocks/:symbol/weights", post(update_weights))
        .route("/api/v1/admin/audits", get(list_audits))
        .route("/api/v1/admin/audits/:id/approve", post(decide_audit))
        // ── Matching surface ────────────────────────────────────────
        .route("/orders", post(place_order))
        .route("/cancel", post(cancel_order))
        .route("/market/:symbol/snapshot", get(market_snapshot))
        .route("/market/:symbol/pressure", get(market_pressure))
        // ── Subscription channel ────────────────────────────────────
        .route("/api/v1/ws", get(crate::api::ws::ws_handler))
        // ── Middleware & State ──────────────────────────────────────
        .layer(cors)
        .with_state(state)
}

// =============================================================================
// Health & stats (public)
// =============================================================================

async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "state_version": state.current_state_version(),
        "server_time": Utc::now().timestamp_millis(),
    }))
}

async fn stats(State(state): State<Arc<AppState>>) -> Result<impl IntoResponse, ApiError> {
    let total_events = state.db.count_events().await?;
    let total_stocks = state.db.count_instruments().await?;
    let total_trades = state.db.count_trades().await?;
    let last_event_at = state.db.last_event_at().await?;

    Ok(Json(serde_json::json!({
        "total_events": total_events,
        "total_stocks": total_stocks,
        "total_trades": total_trades,
        "last_event_at": last_event_at,
        "uptime_secs": state.start_time.elapsed().as_secs(),
    })))
}

// =============================================================================
// Event ingress
// =============================================================================

async fn ingest_event(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<impl IntoResponse, ApiError> {
    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok());

    let outcome = state.gateway.ingest(&body, signature).await?;
    state.increment_version();

    let response = match outcome {
        IngestOutcome::Created { event_id } => (
            StatusCode::CREATED,
            Json(serde_json::json!({ "status": "created", "event_id": event_id })),
        ),
        IngestOutcome::Duplicate { event_id } => (
            StatusCode::OK,
            Json(serde_json::json!({ "status": "duplicate", "event_id": event_id })),
        ),
        IngestOutcome::PendingReview { event_id, reason } => (
            StatusCode::ACCEPTED,
            Json(serde_json::json!({
                "status": "pending_review",
                "event_id": event_id,
                "reason": reason,
            })),
        ),
    };
    Ok(response)
}

// =============================================================================
// Public read surface
// =============================================================================

async fn public_stocks(
    State(state): State<Arc<AppState>>,
) -> Result<impl IntoResponse, ApiError> {
    let instruments = state.db.list_instruments().await?;
    let scores = state.reality.read_all_scores(Utc::now()).await?;
    Ok(Json(serde_json::json!({
        "count": instruments.len(),
        "stocks": instruments,
        "scores": scores,
    })))
}

async fn get_score(
    State(state): State<Arc<AppState>>,
    Path(symbol): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    match state.reality.read_score(&symbol, Utc::now()).await? {
        Some(view) => Ok(Json(view)),
        None => Err(ApiError::NotFound(format!("no score for {symbol:?}"))),
    }
}

#[derive(Deserialize)]
struct HistoryQuery {
    #[serde(default = "default_history_hours")]
    hours: i64,
}

fn default_history_hours() -> i64 {
    24
}

async fn score_history(
    State(state): State<Arc<AppState>>,
    Path(symbol): Path<String>,
    Query(query): Query<HistoryQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let hours = query.hours.clamp(1, 24 * 30);
    let since = Utc::now() - Duration::hours(hours);
    let changes = state.db.score_changes_since(&symbol, since).await?;
    Ok(Json(serde_json::json!({
        "symbol": symbol,
        "hours": hours,
        "count": changes.len(),
        "changes": changes,
    })))
}

#[derive(Deserialize)]
struct EventsQuery {
    #[serde(default = "default_events_limit")]
    limit: usize,
}

fn default_events_limit() -> usize {
    20
}

async fn symbol_events(
    State(state): State<Arc<AppState>>,
    Path(symbol): Path<String>,
    Query(query): Query<EventsQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let limit = query.limit.clamp(1, 100);
    let events = state.db.events_for_symbol(&symbol, limit).await?;
    Ok(Json(serde_json::json!({
        "symbol": symbol,
        "count": events.len(),
        "events": events,
    })))
}

// =============================================================================
// Admin surface
// =============================================================================

#[derive(Deserialize)]
struct CreateStockRequest {
    symbol: String,
    name: String,
    #[serde(default)]
    description: String,
    market_weight: f64,
    reality_weight: f64,
    #[serde(default)]
    min_price: Option<f64>,
    #[serde(default)]
    max_price: Option<f64>,
}

async fn create_stock(
    _admin: AdminKey,
    State(state): State<Arc<AppState>>,
    Json(req): Json<CreateStockRequest>,
) -> Result<impl IntoResponse, ApiError> {
    if req.symbol.trim().is_empty() {
        return Err(ApiError::BadRequest("symbol must not be empty".to_string()));
    }
    if !Instrument::weights_valid(req.market_weight, req.reality_weight) {
        return Err(ApiError::BadRequest(format!(
            "weights must each lie in [0, 1] and sum to 1 (got {} + {})",
            req.market_weight, req.reality_weight
        )));
    }

    let (neutral, lo, hi) = {
        let config = state.runtime_config.read();
        (config.neutral_score, config.min_price, config.max_price)
    };
    let min_price = req.min_price.unwrap_or(lo);
    let max_price = req.max_price.unwrap_or(hi);
    if min_price < lo || max_price < min_price || max_price > hi {
        return Err(ApiError::BadRequest(format!(
            "price band requires {lo} <= min_price <= max_price <= {hi}"
        )));
    }

    let inst = Instrument {
        symbol: req.symbol.trim().to_uppercase(),
        name: req.name,
        description: req.description,
        market_weight: req.market_weight,
        reality_weight: req.reality_weight,
        min_price,
        max_price,
        created_at: Utc::now(),
    };

    match state.db.create_instrument(&inst, neutral, 0.1).await? {
        CreateInstrument::Created => {
            state.increment_version();
            info!(symbol = %inst.symbol, "instrument created");
            Ok((StatusCode::CREATED, Json(inst)))
        }
        CreateInstrument::Duplicate => Err(ApiError::Conflict(format!(
            "symbol {:?} already exists",
            inst.symbol
        ))),
    }
}

async fn admin_stocks(
    _admin: AdminKey,
    State(state): State<Arc<AppState>>,
) -> Result<impl IntoResponse, ApiError> {
    let instruments = state.db.list_instruments().await?;
    Ok(Json(instruments))
}

#[derive(Deserialize)]
struct WeightsRequest {
    market_weight: f64,
    reality_weight: f64,
}

async fn update_weights(
    _admin: AdminKey,
    State(state): State<Arc<AppState>>,
    Path(symbol): Path<String>,
    Json(req): Json<WeightsRequest>,
) -> Result<impl IntoResponse, ApiError> {
    if !Instrument::weights_valid(req.market_weight, req.reality_weight) {
        return Err(ApiError::BadRequest(format!(
            "weights must each lie in [0, 1] and sum to 1 (got {} + {})",
            req.market_weight, req.reality_weight
        )));
    }

    let updated = state
        .db
        .update_instrument_weights(&symbol, req.market_weight, req.reality_weight)
        .await?;
    if !updated {
        return Err(ApiError::NotFound(format!("unknown symbol {symbol:?}")));
    }

    state.increment_version();
    info!(symbol, req.market_weight, req.reality_weight, "blend weights updated");
    Ok(Json(serde_json::json!({
        "symbol": symbol,
        "market_weight": req.market_weight,
        "reality_weight": req.reality_weight,
    })))
}

#[derive(Deserialize)]
struct AuditsQuery {
    #[serde(default)]
    pending_only: bool,
}

async fn list_audits(
    _admin: AdminKey,
    State(state): State<Arc<AppState>>,
    Query(query): Query<AuditsQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let audits = state.audit.list(query.pending_only).await?;
    Ok(Json(audits))
}

#[derive(Deserialize)]
struct DecideRequest {
    approved: bool,
    approved_by: String,
    #[serde(default)]
    reason: Option<String>,
}

async fn decide_audit(
    _admin: AdminKey,
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(req): Json<DecideRequest>,
) -> Result<impl IntoResponse, ApiError> {
    if req.approved_by.trim().is_empty() {
        return Err(ApiError::BadRequest("approved_by must not be empty".to_string()));
    }

    let record = state
        .audit
        .decide(id, &req.approved_by, req.approved, req.reason.as_deref())
        .await?;
    state.increment_version();
    Ok(Json(record))
}

// =============================================================================
// Matching surface
// =============================================================================

async fn place_order(
    State(state): State<Arc<AppState>>,
    Json(req): Json<PlaceOrderRequest>,
) -> Result<impl IntoResponse, ApiError> {
    state
        .matching
        .validate(&req)
        .map_err(ApiError::BadRequest)?;

    let (order, trades) = state.matching.place_order(req).await?;
    state.increment_version();

    Ok((
        StatusCode::CREATED,
        Json(serde_json::json!({ "order": order, "trades": trades })),
    ))
}

#[derive(Deserialize)]
struct CancelQuery {
    symbol: String,
    order_id: Uuid,
}

async fn cancel_order(
    State(state): State<Arc<AppState>>,
    Query(query): Query<CancelQuery>,
) -> Result<impl IntoResponse, ApiError> {
    match state
        .matching
        .cancel_order(&query.symbol, query.order_id)
        .await?
    {
        Some(order) => {
            state.increment_version();
            Ok(Json(order))
        }
        None => Err(ApiError::NotFound(format!(
            "order {} not found for {:?}",
            query.order_id, query.symbol
        ))),
    }
}

/// Depth levels returned per side in a snapshot.
const SNAPSHOT_DEPTH: usize = 10;

async fn market_snapshot(
    State(state): State<Arc<AppState>>,
    Path(symbol): Path<String>,
) -> impl IntoResponse {
    Json(state.matching.snapshot(&symbol, SNAPSHOT_DEPTH).await)
}

async fn market_pressure(
    State(state): State<Arc<AppState>>,
    Path(symbol): Path<String>,
) -> impl IntoResponse {
    Json(state.matching.pressure(&symbol).await)
}
