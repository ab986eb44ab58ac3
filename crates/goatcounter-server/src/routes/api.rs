use std::collections::BTreeMap;
use std::sync::Arc;

use axum::{
    extract::{rejection::JsonRejection, State},
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use chrono::Utc;
use serde_json::json;

use goatcounter_core::bot::{classify_user_agent, resolve};
use goatcounter_core::config::{RateLimitClass, PERSIST_PRESSURE};
use goatcounter_core::hit::{validate_bot, ApiCountRequest, Hit, Size};
use goatcounter_core::site::{Collect, Permissions, Site};

use crate::auth::{authenticate, Caller};
use crate::error::AppError;
use crate::routes::count::{client_ip, header_str, MaybeConnectInfo};
use crate::state::AppState;

/// `POST /api/v0/count`: queue a batch of hits.
///
/// The whole batch is rejected with per-index messages if any hit fails
/// validation. Hits from ignored IPs are dropped and their indexes reported
/// in `X-Goatcounter-Filter`.
#[tracing::instrument(skip_all)]
pub async fn count(
    State(state): State<Arc<AppState>>,
    MaybeConnectInfo(peer): MaybeConnectInfo,
    headers: HeaderMap,
    body: Result<Json<ApiCountRequest>, JsonRejection>,
) -> Result<Response, AppError> {
    let caller = authenticate(&state, &headers).await?;
    caller.require(Permissions::COUNT)?;

    let site = match &caller {
        Caller::Token(token) => state
            .store
            .site_by_id(token.site_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("site {} not found", token.site_id)))?,
        Caller::Buffer => {
            let host = header_str(&headers, header::HOST);
            state
                .site_for_host(host)
                .await?
                .ok_or_else(|| AppError::NotFound(format!("no site at {host:?}")))?
        }
    };
    if !matches!(caller, Caller::Buffer) {
        state.check_rate_limit(RateLimitClass::ApiCount, &client_ip(&headers, peer))?;
    }

    let Json(req) = body.map_err(|e| AppError::BadRequest(e.body_text()))?;
    if req.hits.is_empty() {
        return Err(AppError::BadRequest("no hits".into()));
    }
    if req.hits.len() > state.config.api_max {
        return Err(AppError::BadRequest(format!(
            "maximum amount of hits is {}; got {}",
            state.config.api_max,
            req.hits.len()
        )));
    }

    if state.memstore.len() >= PERSIST_PRESSURE {
        // Failed inserts are requeued rather than returned as an error, so
        // the queue length is what tells whether the persist got anywhere.
        let res = state.cron.task_persist_and_stat().await;
        let queued = state.memstore.len();
        if res.is_err() || queued >= PERSIST_PRESSURE {
            if let Err(e) = res {
                tracing::error!(error = %e, queued, "inline persist failed");
            } else {
                tracing::error!(queued, "inline persist left the queue full");
            }
            return Err(AppError::Overloaded(
                "too many pending hits; try again later".into(),
            ));
        }
    }

    let (hits, filtered) = build_hits(&state, &site, &req)?;

    if let Some(earliest) = hits.iter().map(|h| h.created_at).min() {
        state.store.pull_back_first_hit(site.id, earliest).await?;
    }
    tracing::debug!(site_id = site.id, hits = hits.len(), filtered = filtered.len(), "queued");
    state.memstore.append(hits);

    let mut response = (StatusCode::ACCEPTED, Json(json!({ "status": "ok" }))).into_response();
    if !filtered.is_empty() {
        let list = filtered
            .iter()
            .map(usize::to_string)
            .collect::<Vec<_>>()
            .join(", ");
        if let Ok(v) = HeaderValue::from_str(&list) {
            response.headers_mut().insert("x-goatcounter-filter", v);
        }
    }
    Ok(response)
}

/// Validate every hit and turn the accepted ones into [`Hit`]s. Returns the
/// hits to queue and the indexes dropped by the IP filter.
fn build_hits(
    state: &AppState,
    site: &Site,
    req: &ApiCountRequest,
) -> Result<(Vec<Hit>, Vec<usize>), AppError> {
    let now = Utc::now();
    let collect = site.settings.collect;
    let mut errors = BTreeMap::new();
    let mut filtered = Vec::new();
    let mut hits = Vec::with_capacity(req.hits.len());

    for (i, h) in req.hits.iter().enumerate() {
        if let Err(msg) = h.validate(req.no_sessions, now) {
            errors.insert(i, msg);
            continue;
        }
        if req.filters_ip() && !h.ip.is_empty() && site.settings.ignored_ip(&h.ip).is_some() {
            filtered.push(i);
            continue;
        }

        // Both were checked by validate().
        let hint = validate_bot(h.bot).unwrap_or(0);
        let size = Size::from_slice(&h.size).ok().flatten();

        let location = if !h.location.is_empty() {
            h.location.clone()
        } else if collect.has(Collect::LOCATION) {
            state.geo.lookup(&h.ip)
        } else {
            String::new()
        };

        hits.push(Hit {
            title: h.title.clone(),
            event: h.event,
            referrer: h.referrer.clone(),
            size,
            query: h.query.clone(),
            bot: resolve(hint, &[classify_user_agent(&h.user_agent)]),
            location,
            ua_header: h.user_agent.clone(),
            remote_addr: h.ip.clone(),
            client_session: (!h.session.is_empty()).then(|| h.session.clone()),
            no_sessions: req.no_sessions,
            ..Hit::new(site.id, h.path.clone(), h.created_at.unwrap_or(now))
        });
    }

    if !errors.is_empty() {
        return Err(AppError::HitErrors(errors));
    }
    Ok((hits, filtered))
}

/// `GET /api/v0/me`: the calling token and the user it belongs to.
#[tracing::instrument(skip_all)]
pub async fn me(
    State(state): State<Arc<AppState>>,
    MaybeConnectInfo(peer): MaybeConnectInfo,
    headers: HeaderMap,
) -> Result<Json<serde_json::Value>, AppError> {
    state.check_rate_limit(RateLimitClass::Api, &client_ip(&headers, peer))?;

    let token = match authenticate(&state, &headers).await? {
        Caller::Token(token) => token,
        Caller::Buffer => {
            return Err(AppError::Forbidden(
                "buffer secret can't be used here".into(),
            ))
        }
    };
    let user = state.store.user_by_id(token.user_id).await?;
    Ok(Json(json!({ "token": token, "user": user })))
}
