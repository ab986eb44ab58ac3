//! Buffer sidecar: accepts `/count` beacons while the main server is down and
//! replays them through the batch API once it's back.
//!
//! Forwarding is best-effort. A batch the backend refuses is logged and
//! dropped rather than retried.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::{
    extract::{Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use chrono::Utc;
use serde::Serialize;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use goatcounter_core::hit::{ApiCountRequestHit, Size};

use crate::auth::BUFFER_HEADER;
use crate::bot_detection;
use crate::error::AppError;
use crate::routes::count::{client_ip, gif_rejection, gif_response, header_str, CountParams, MaybeConnectInfo};

/// Most hits forwarded per send tick.
const SEND_BATCH: usize = 100;

#[derive(Debug, Clone)]
pub struct BufferConfig {
    pub listen: String,
    /// Base URL of the main server, without trailing slash.
    pub backend: String,
    pub bufsize: usize,
    pub secret: String,
    pub silent: bool,
    pub check_every: Duration,
    pub send_every: Duration,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            listen: "localhost:8082".to_string(),
            backend: "http://localhost:8081".to_string(),
            bufsize: 500_000,
            secret: String::new(),
            silent: false,
            check_every: Duration::from_secs(10),
            send_every: Duration::from_secs(3),
        }
    }
}

/// One queued beacon and the host it was sent to.
#[derive(Debug, Clone, Serialize)]
pub struct Buffered {
    pub host: String,
    pub hit: ApiCountRequestHit,
}

impl Buffered {
    /// Hits without both an IP and a User-Agent can't be fingerprinted and go
    /// in a separate `no_sessions` request.
    fn no_sessions(&self) -> bool {
        self.hit.ip.is_empty() || self.hit.user_agent.is_empty()
    }
}

#[derive(Serialize)]
struct ForwardRequest<'a> {
    no_sessions: bool,
    hits: &'a [ApiCountRequestHit],
}

pub struct BufferState {
    pub config: BufferConfig,
    tx: mpsc::Sender<Buffered>,
    rx: Mutex<mpsc::Receiver<Buffered>>,
    is_down: AtomicBool,
    client: reqwest::Client,
}

impl BufferState {
    pub fn new(config: BufferConfig) -> Result<Self> {
        let (tx, rx) = mpsc::channel(config.bufsize.max(1));
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .user_agent(concat!("goatcounter-buffer/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("building HTTP client")?;
        Ok(Self {
            config,
            tx,
            rx: Mutex::new(rx),
            is_down: AtomicBool::new(false),
            client,
        })
    }

    /// Number of queued hits.
    pub fn len(&self) -> usize {
        self.tx.max_capacity() - self.tx.capacity()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_down(&self) -> bool {
        self.is_down.load(Ordering::Relaxed)
    }

    /// Poll the backend's `/status` and update the down flag.
    pub async fn check_backend(&self) -> bool {
        let url = format!("{}/status", self.config.backend);
        let up = match self.client.get(&url).send().await {
            Ok(resp) => resp.status().is_success(),
            Err(e) => {
                debug!(error = %e, "backend status check failed");
                false
            }
        };
        let was_down = self.is_down.swap(!up, Ordering::Relaxed);
        if was_down == up {
            if up {
                info!(backend = %self.config.backend, "backend is up");
            } else {
                warn!(backend = %self.config.backend, queued = self.len(), "backend is down; buffering");
            }
        }
        up
    }

    /// Forward up to [`SEND_BATCH`] hits, one request per host. Returns the
    /// number of hits the backend accepted.
    pub async fn send_once(&self) -> usize {
        let batch: Vec<Buffered> = {
            let mut rx = self.rx.lock().await;
            let mut batch = Vec::new();
            while batch.len() < SEND_BATCH {
                match rx.try_recv() {
                    Ok(b) => batch.push(b),
                    Err(_) => break,
                }
            }
            batch
        };
        if batch.is_empty() {
            return 0;
        }

        let mut groups: BTreeMap<(String, bool), Vec<ApiCountRequestHit>> = BTreeMap::new();
        for b in batch {
            let key = (b.host.clone(), b.no_sessions());
            groups.entry(key).or_default().push(b.hit);
        }

        let mut sent = 0;
        for ((host, no_sessions), hits) in groups {
            match self.forward(&host, no_sessions, &hits).await {
                Ok(()) => {
                    sent += hits.len();
                    if !self.config.silent {
                        info!(host = %host, hits = hits.len(), "forwarded");
                    }
                }
                Err(e) => error!(host = %host, hits = hits.len(), error = %e, "forwarding failed; batch dropped"),
            }
        }
        sent
    }

    async fn forward(&self, host: &str, no_sessions: bool, hits: &[ApiCountRequestHit]) -> Result<()> {
        let resp = self
            .client
            .post(format!("{}/api/v0/count", self.config.backend))
            .header(header::HOST, host)
            .header(BUFFER_HEADER, "1")
            .bearer_auth(&self.config.secret)
            .json(&ForwardRequest { no_sessions, hits })
            .send()
            .await?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            anyhow::bail!("backend answered {status}: {body}");
        }
        Ok(())
    }

    /// Print every queued hit to stderr and put it back. Returns the count.
    pub async fn list(&self) -> usize {
        let mut rx = self.rx.lock().await;
        let mut all = Vec::new();
        while let Ok(b) = rx.try_recv() {
            all.push(b);
        }
        for b in &all {
            match serde_json::to_string(b) {
                Ok(line) => eprintln!("{line}"),
                Err(e) => eprintln!("{b:?}: {e}"),
            }
        }
        let n = all.len();
        for b in all {
            // Can only fail if /count filled the freed slots in the meantime.
            if self.tx.try_send(b).is_err() {
                warn!("buffer filled up while listing; hit dropped");
            }
        }
        n
    }
}

/// `GET/POST /count` on the sidecar: validate like the main server, then
/// queue.
#[tracing::instrument(skip_all)]
async fn count(
    State(state): State<Arc<BufferState>>,
    MaybeConnectInfo(peer): MaybeConnectInfo,
    headers: HeaderMap,
    Query(params): Query<CountParams>,
) -> Result<Response, AppError> {
    if bot_detection::is_prefetch(&headers) {
        return Ok(gif_response(StatusCode::OK));
    }
    let parsed = match params.parse() {
        Ok(p) => p,
        Err(e) => return Ok(gif_rejection(&e)),
    };

    let hit = ApiCountRequestHit {
        path: parsed.path,
        title: parsed.title,
        event: parsed.event,
        referrer: parsed.referrer,
        size: parsed
            .size
            .map(|Size { width, height, scale }| vec![width, height, scale])
            .unwrap_or_default(),
        query: parsed.query,
        bot: i64::from(parsed.bot),
        user_agent: header_str(&headers, header::USER_AGENT).to_string(),
        ip: client_ip(&headers, peer),
        created_at: Some(Utc::now()),
        ..Default::default()
    };
    let host = header_str(&headers, header::HOST).to_string();

    match state.tx.try_send(Buffered { host, hit }) {
        Ok(()) => Ok(gif_response(StatusCode::OK)),
        Err(mpsc::error::TrySendError::Full(_)) => Ok((
            StatusCode::TOO_MANY_REQUESTS,
            "buffer is full",
        )
            .into_response()),
        Err(mpsc::error::TrySendError::Closed(_)) => {
            Err(AppError::Overloaded("buffer is closed".into()))
        }
    }
}

/// `GET /_list`: dump the queue to stderr for inspection.
async fn list(State(state): State<Arc<BufferState>>) -> String {
    let n = state.list().await;
    format!("{n} hits in buffer; backend down: {}\n", state.is_down())
}

pub fn build_buffer_app(state: Arc<BufferState>) -> Router {
    Router::new()
        .route("/count", get(count).post(count))
        .route("/_list", get(list))
        .with_state(state)
}

/// Drive the backend check and send tickers until `cancel` fires.
pub async fn run(state: Arc<BufferState>, cancel: CancellationToken) {
    let mut check = tokio::time::interval(state.config.check_every);
    check.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut send = tokio::time::interval(state.config.send_every);
    send.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = check.tick() => {
                state.check_backend().await;
            }
            _ = send.tick() => {
                if !state.is_down() {
                    state.send_once().await;
                }
            }
        }
    }
    info!(queued = state.len(), "buffer stopped");
}
