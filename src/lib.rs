//! Core library for statewarden.  This module wires the monitoring engine
//! together with its configuration and exposes the operator HTTP surface
//! (report, metrics, blocklist, per-user events and health).

pub mod blocklist;
mod config;
pub mod detector;
mod engine;
pub mod notify;
pub mod recorder;
pub mod report;
pub mod retention;
pub mod state;
pub mod util;
pub mod validator;

pub use config::{AppConfig, MonitorConfig, RotationConfig};
pub use engine::{Engine, EngineBuilder};

pub use crate::detector::detect_cycles;
pub use crate::notify::{AdminNotifier, AdminSink, LogSink, NotifyError, WebhookSink};
pub use crate::recorder::{Anomaly, AnomalyKind, MetricsSnapshot, StateTransitionEvent};
pub use crate::state::{StateId, TransitionTable, UserId};
pub use crate::validator::{
    HandlerChain, HandlerOutcome, Layer, StepError, StepHandler, TransitionGuard, UserScoped,
};

use axum::extract::{Path, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::{routing::get, Json, Router};
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::report::MetricsPersister;
use crate::util::window_start;

#[derive(Debug, Serialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct ErrorResponse {
    pub error_code: i32,
    pub message: String,
    pub http_status: u16,
}

/// State shared across operator handlers.
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<Engine>,
    /// Bearer tokens accepted by operator routes (None => open)
    pub admin_tokens: Option<HashSet<String>>,
    /// Metrics JSON larger than this is served as an attachment.
    pub report_inline_limit: usize,
    pub process_start_instant: Instant,
}

impl AppState {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self {
            engine,
            admin_tokens: None,
            report_inline_limit: 4000,
            process_start_instant: Instant::now(),
        }
    }
}

/// Build state from environment variables (see [`AppConfig::from_env`]).
/// Background loops are not started; call [`Engine::start`].
pub async fn build_state_from_env() -> Result<AppState, Box<dyn std::error::Error>> {
    let config = AppConfig::from_env()?;
    let AppConfig {
        monitor,
        transitions,
        metrics_dir,
        stats_dir,
        rotation,
        admin_ids,
        admin_webhook_url,
        admin_webhook_timeout_ms,
        admin_tokens,
        report_inline_limit,
    } = config;

    let sink: Arc<dyn AdminSink> = match admin_webhook_url.as_deref() {
        Some(url) => {
            match WebhookSink::new(url, Duration::from_millis(admin_webhook_timeout_ms)) {
                Ok(sink) => Arc::new(sink),
                Err(e) => {
                    tracing::warn!(url = %url, error = %e, "Failed to build admin webhook client; alerts will only be logged");
                    Arc::new(LogSink)
                }
            }
        }
        None => {
            tracing::info!("Admin webhook not configured; alerts will only be logged");
            Arc::new(LogSink)
        }
    };
    if admin_ids.is_empty() {
        tracing::warn!("STATEWARDEN_ADMIN_IDS not set; admin alerts disabled");
    }

    let engine = Engine::builder(monitor)
        .transitions(transitions)
        .notifier(AdminNotifier::new(sink, admin_ids))
        .persister(MetricsPersister::new(metrics_dir, stats_dir, rotation))
        .build();

    Ok(AppState {
        engine,
        admin_tokens,
        report_inline_limit,
        process_start_instant: Instant::now(),
    })
}

/// Build the Axum router for the operator surface.
pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/report", get(report_handler))
        .route("/metrics", get(metrics_handler))
        .route("/blocked", get(blocked_handler))
        .route("/users/:user_id/events", get(user_events_handler))
        .route("/healthz", get(healthz_handler))
        .with_state(state)
}

fn respond_with_error(err: ErrorResponse) -> axum::response::Response {
    let status = StatusCode::from_u16(err.http_status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (status, Json(err)).into_response()
}

fn authorization_error() -> ErrorResponse {
    ErrorResponse {
        error_code: 2001,
        message: "Unauthorized".into(),
        http_status: 401,
    }
}

fn extract_bearer_token(headers: &HeaderMap) -> Result<String, ErrorResponse> {
    let raw = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .ok_or_else(authorization_error)?;

    if raw.len() < 7 || !raw[..6].eq_ignore_ascii_case("bearer") {
        return Err(authorization_error());
    }
    let token = raw[6..].trim();
    if token.is_empty() {
        return Err(authorization_error());
    }
    Ok(token.to_string())
}

fn ensure_authorized(
    headers: &HeaderMap,
    admin_tokens: Option<&HashSet<String>>,
) -> Result<(), ErrorResponse> {
    if let Some(tokens) = admin_tokens {
        let token = extract_bearer_token(headers)?;
        if !tokens.contains(&token) {
            return Err(authorization_error());
        }
    }
    Ok(())
}

/// Human readable digest of the last hour.
async fn report_handler(State(state): State<AppState>, headers: HeaderMap) -> axum::response::Response {
    if let Err(err) = ensure_authorized(&headers, state.admin_tokens.as_ref()) {
        return respond_with_error(err);
    }
    let report = state.engine.generate_report();
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        report,
    )
        .into_response()
}

/// Full metrics as pretty JSON.  Payloads above the inline limit are sent as
/// a file attachment.
async fn metrics_handler(State(state): State<AppState>, headers: HeaderMap) -> axum::response::Response {
    if let Err(err) = ensure_authorized(&headers, state.admin_tokens.as_ref()) {
        return respond_with_error(err);
    }
    let metrics = state.engine.current_metrics();
    let body = match serde_json::to_string_pretty(&metrics) {
        Ok(body) => body,
        Err(e) => {
            tracing::warn!(error = %e, "Failed to serialize metrics");
            return respond_with_error(ErrorResponse {
                error_code: 5001,
                message: "Failed to serialize metrics".into(),
                http_status: 500,
            });
        }
    };
    if body.len() > state.report_inline_limit {
        let filename = format!("metrics_{}.json", metrics.timestamp.format("%Y%m%d_%H%M%S"));
        let disposition = format!("attachment; filename=\"{}\"", filename);
        return (
            StatusCode::OK,
            [
                (header::CONTENT_TYPE, "application/json".to_string()),
                (header::CONTENT_DISPOSITION, disposition),
            ],
            body,
        )
            .into_response();
    }
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "application/json")],
        body,
    )
        .into_response()
}

async fn blocked_handler(State(state): State<AppState>, headers: HeaderMap) -> axum::response::Response {
    if let Err(err) = ensure_authorized(&headers, state.admin_tokens.as_ref()) {
        return respond_with_error(err);
    }
    let blocked = state.engine.blocklist().blocked_users();
    (StatusCode::OK, Json(blocked)).into_response()
}

/// Events of one user inside the detection window, with state names.
async fn user_events_handler(
    State(state): State<AppState>,
    Path(user_id): Path<UserId>,
    headers: HeaderMap,
) -> axum::response::Response {
    if let Err(err) = ensure_authorized(&headers, state.admin_tokens.as_ref()) {
        return respond_with_error(err);
    }
    let engine = &state.engine;
    let since = window_start(chrono::Utc::now(), engine.config().window);
    let events: Vec<serde_json::Value> = engine
        .recorder()
        .events_for_user(user_id, since)
        .iter()
        .map(|e| e.to_json(engine.transitions()))
        .collect();
    let json = serde_json::json!({
        "userId": user_id,
        "currentState": engine.states().get(user_id),
        "errorCount": engine.recorder().error_count(user_id),
        "blocked": engine.blocklist().is_blocked(user_id),
        "events": events,
    });
    (StatusCode::OK, Json(json)).into_response()
}

/// Simple health endpoint for container readiness / liveness checks.
async fn healthz_handler(State(state): State<AppState>) -> axum::response::Response {
    let engine = &state.engine;
    let json = serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "monitoring": engine.is_running(),
        "events": engine.recorder().len(),
        "activeDialogues": engine.states().len(),
        "blockedUsers": engine.blocklist().len(),
        "uptimeSecs": state.process_start_instant.elapsed().as_secs(),
    });
    (StatusCode::OK, Json(json)).into_response()
}
