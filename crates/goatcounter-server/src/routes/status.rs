use std::sync::Arc;

use axum::{
    extract::State,
    http::{header, HeaderMap},
    response::IntoResponse,
    Json,
};
use serde_json::{json, Value};

use crate::error::AppError;
use crate::routes::count::MaybeConnectInfo;
use crate::state::AppState;

/// `GET /status`: liveness and a few runtime numbers. Always answers 200,
/// even when the database is unreachable.
pub async fn status(State(state): State<Arc<AppState>>) -> Json<Value> {
    let db_status = match state.store.ping().await {
        Ok(()) => "ok".to_string(),
        Err(e) => {
            tracing::warn!(error = %e, "status: database ping failed");
            format!("error: {e}")
        }
    };

    Json(json!({
        "uptime": format_uptime(state.started_at.elapsed().as_secs()),
        "uptime_secs": state.started_at.elapsed().as_secs(),
        "version": env!("CARGO_PKG_VERSION"),
        "database": {
            "kind": state.store.kind(),
            "status": db_status,
        },
        "runtime": {
            "os": std::env::consts::OS,
            "arch": std::env::consts::ARCH,
        },
        "queue": state.memstore.len(),
        "sessions": state.memstore.session_count(),
        "jobs": state.runner.running(),
    }))
}

/// `GET /status/sessions`: the session table as TOML. Only answered on a
/// direct loopback connection since it covers every site.
pub async fn sessions(
    State(state): State<Arc<AppState>>,
    MaybeConnectInfo(peer): MaybeConnectInfo,
    headers: HeaderMap,
) -> Result<impl IntoResponse, AppError> {
    let local = peer.is_some_and(|p| p.ip().is_loopback());
    if !local || headers.contains_key("x-forwarded-for") {
        return Err(AppError::Forbidden("only available from localhost".into()));
    }
    let dump = state.memstore.dump_sessions()?;
    Ok(([(header::CONTENT_TYPE, "text/plain; charset=utf-8")], dump))
}

fn format_uptime(secs: u64) -> String {
    let (d, h, m, s) = (secs / 86400, secs / 3600 % 24, secs / 60 % 60, secs % 60);
    if d > 0 {
        format!("{d}d{h}h{m}m{s}s")
    } else if h > 0 {
        format!("{h}h{m}m{s}s")
    } else if m > 0 {
        format!("{m}m{s}s")
    } else {
        format!("{s}s")
    }
}
