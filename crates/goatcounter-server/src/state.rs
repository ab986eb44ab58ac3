use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;
use chrono::Utc;
use tokio::sync::RwLock;

use goatcounter_core::config::{Config, RateLimitClass};
use goatcounter_core::session::Sessions;
use goatcounter_core::site::Site;
use goatcounter_core::store::Store;

use crate::bgrun::Runner;
use crate::cron::Cron;
use crate::error::AppError;
use crate::geo::Geo;
use crate::memstore::Memstore;
use crate::ratelimit::RateLimiter;

/// Shared application state injected into every handler via
/// [`axum::extract::State`].
pub struct AppState {
    pub store: Arc<dyn Store>,
    pub config: Arc<Config>,
    pub memstore: Arc<Memstore>,
    pub cron: Arc<Cron>,
    pub runner: Arc<Runner>,
    pub limiter: RateLimiter,
    pub geo: Geo,
    pub started_at: Instant,

    /// Sites by request host. Filled on first use.
    site_cache: RwLock<HashMap<String, Site>>,
}

impl AppState {
    pub fn new(store: Arc<dyn Store>, config: Config, geo: Geo) -> Self {
        Self::with_sessions(store, config, geo, Sessions::new(Utc::now()))
    }

    pub fn with_sessions(
        store: Arc<dyn Store>,
        config: Config,
        geo: Geo,
        sessions: Sessions,
    ) -> Self {
        let memstore = Arc::new(Memstore::new(Arc::clone(&store), sessions));
        let runner = Arc::new(Runner::default());
        let cron = Arc::new(Cron::new(Arc::clone(&store), Arc::clone(&memstore)));
        cron.register(&runner);
        Self {
            limiter: RateLimiter::new(config.rate_limits.clone()),
            config: Arc::new(config),
            store,
            memstore,
            cron,
            runner,
            geo,
            started_at: Instant::now(),
            site_cache: RwLock::new(HashMap::new()),
        }
    }

    /// Find the site served at `host`: a matching cname, or `<code>.<domain>`.
    pub async fn site_for_host(&self, host: &str) -> Result<Option<Site>> {
        let host = host
            .rsplit_once(':')
            .filter(|(_, port)| port.chars().all(|c| c.is_ascii_digit()))
            .map_or(host, |(h, _)| h)
            .to_ascii_lowercase();
        if let Some(site) = self.site_cache.read().await.get(&host) {
            return Ok(Some(site.clone()));
        }

        let mut site = self.store.site_by_cname(&host).await?;
        if site.is_none() {
            let suffix = format!(".{}", self.config.domain);
            if let Some(code) = host.strip_suffix(&suffix) {
                site = self.store.site_by_code(code).await?;
            }
        }
        if let Some(site) = &site {
            self.site_cache
                .write()
                .await
                .insert(host, site.clone());
        }
        Ok(site)
    }

    /// Take a token from the `class` bucket for `key`.
    pub fn check_rate_limit(&self, class: RateLimitClass, key: &str) -> Result<(), AppError> {
        let d = self.limiter.check(class, key);
        if d.allowed {
            return Ok(());
        }
        Err(AppError::RateLimited {
            limit: d.limit,
            remaining: d.remaining,
            reset_secs: d.reset.as_secs_f64().ceil() as u64,
        })
    }
}
