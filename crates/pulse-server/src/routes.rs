use crate::state::AppState;
use axum::extract::{Query, State};
use axum::http::{header, StatusCode};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Json};
use axum::routing::{delete, get};
use axum::Router;
use futures::Stream;
use pulse_analytics::{ReportGenerator, ReportKind};
use pulse_core::session::VisitorSession;
use serde::Deserialize;
use std::convert::Infallible;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_stream::StreamExt;

// ── Health ──────────────────────────────────────────────────────────────

pub fn health_routes() -> Router<AppState> {
    Router::new().route("/health", get(health))
}

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

// ── Analytics ───────────────────────────────────────────────────────────

pub fn analytics_routes() -> Router<AppState> {
    Router::new()
        .route("/v1/analytics/stats", get(stats))
        .route("/v1/analytics/visitors", get(visitors))
        .route("/v1/analytics/report", get(report))
        .route("/v1/analytics/events", get(events))
        .route("/v1/analytics", delete(clear))
}

async fn stats(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.store.statistics())
}

#[derive(Debug, Deserialize)]
struct VisitorsQuery {
    limit: Option<usize>,
}

/// Most recent sessions first.
async fn visitors(
    State(state): State<AppState>,
    Query(query): Query<VisitorsQuery>,
) -> Json<Vec<VisitorSession>> {
    let limit = query.limit.unwrap_or(state.config.stats.recent_limit);
    let recent = state.store.history().into_iter().rev().take(limit).collect();
    Json(recent)
}

#[derive(Debug, Deserialize)]
struct ReportQuery {
    kind: Option<String>,
}

async fn report(
    State(state): State<AppState>,
    Query(query): Query<ReportQuery>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    let kind = match query.kind.as_deref() {
        Some(raw) => raw
            .parse::<ReportKind>()
            .map_err(|e| (StatusCode::BAD_REQUEST, e.to_string()))?,
        None => ReportKind::Summary,
    };
    let body = ReportGenerator::render(&state.store, kind);
    Ok(([(header::CONTENT_TYPE, "text/markdown; charset=utf-8")], body))
}

/// One `statistics` event per subscription delivery.
async fn events(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let (subscription, rx) = state.store.watch();

    let stream = UnboundedReceiverStream::new(rx).map(move |stats| {
        // The stream owns the subscription; it stops when the client goes away.
        let _keep = &subscription;
        Ok(Event::default()
            .event("statistics")
            .json_data(&stats)
            .unwrap_or_else(|_| Event::default().comment("serialization failed")))
    });

    Sse::new(stream).keep_alive(KeepAlive::default())
}

#[derive(Debug, Deserialize)]
struct ClearQuery {
    #[serde(default)]
    confirm: bool,
}

async fn clear(
    State(state): State<AppState>,
    Query(query): Query<ClearQuery>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    if !query.confirm {
        return Err((
            StatusCode::BAD_REQUEST,
            "Refusing to clear analytics without confirm=true".into(),
        ));
    }
    state.store.clear(None);
    Ok(Json(serde_json::json!({ "cleared": true })))
}
