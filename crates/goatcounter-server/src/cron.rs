//! Periodic persist-and-aggregate loop plus the minute and daily jobs.

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use chrono::{DateTime, Duration as ChronoDuration, NaiveTime, Utc};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use goatcounter_core::aggregate::{aggregate, AggregateRow};
use goatcounter_core::site::Collect;
use goatcounter_core::store::Store;

use crate::bgrun::Runner;
use crate::memstore::Memstore;
use crate::state::AppState;

/// Soft-deleted sites are purged this long after deletion.
pub const DELETED_SITE_RETENTION_DAYS: i64 = 7;

/// Raw hits are kept this many seconds when the site doesn't collect them.
pub const UNCOLLECTED_HITS_RETENTION_SECS: i64 = 3600;

/// Vacuum runs daily at this UTC time.
const VACUUM_AT_HOUR: u32 = 3;

const SHUTDOWN_WAIT: Duration = Duration::from_secs(10);

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct VacuumStats {
    pub sites_purged: u64,
    pub hits_deleted: u64,
}

/// Counter deltas for one site that haven't been written yet.
type Unapplied = Vec<(i64, Vec<AggregateRow>)>;

pub struct Cron {
    store: Arc<dyn Store>,
    memstore: Arc<Memstore>,
    /// Held for the duration of a persist; at most one runs at a time. Holds
    /// the aggregates of hits that were inserted but whose stats update
    /// failed, retried at the start of the next persist.
    persist: Mutex<Unapplied>,
}

impl Cron {
    pub fn new(store: Arc<dyn Store>, memstore: Arc<Memstore>) -> Self {
        Self {
            store,
            memstore,
            persist: Mutex::new(Vec::new()),
        }
    }

    /// Register the named background tasks this type provides.
    pub fn register(self: &Arc<Self>, runner: &Runner) {
        let cron = Arc::clone(self);
        runner.new_task("vacuum", 1, move |_| {
            let cron = Arc::clone(&cron);
            async move { cron.vacuum(Utc::now()).await.map(|_| ()) }
        });
    }

    /// Persist the Memstore and aggregate what was written. Returns the
    /// number of hits persisted.
    pub async fn persist_and_stat(&self) -> Result<usize> {
        let mut unapplied = self.persist.lock().await;
        self.persist_and_stat_locked(&mut unapplied).await
    }

    /// Out-of-band trigger: runs a persist unless one is already in progress,
    /// in which case it waits for that one instead.
    pub async fn task_persist_and_stat(&self) -> Result<()> {
        match self.persist.try_lock() {
            Ok(mut unapplied) => self.persist_and_stat_locked(&mut unapplied).await.map(|_| ()),
            Err(_) => {
                self.wait_persist_and_stat().await;
                Ok(())
            }
        }
    }

    /// Wait for a running persist to finish.
    pub async fn wait_persist_and_stat(&self) {
        drop(self.persist.lock().await);
    }

    async fn persist_and_stat_locked(&self, unapplied: &mut Unapplied) -> Result<usize> {
        let start = Instant::now();
        for (site_id, rows) in std::mem::take(unapplied) {
            self.apply_or_keep(site_id, rows, unapplied).await;
        }

        let persisted = self.memstore.persist().await?;
        for (site_id, rows) in aggregate(&persisted.hits) {
            self.apply_or_keep(site_id, rows, unapplied).await;
        }
        if !unapplied.is_empty() {
            warn!(sites = unapplied.len(), "stats updates pending for the next run");
        }

        let n = persisted.hits.len();
        if n > 0 {
            debug!(
                hits = n,
                requeued = persisted.requeued,
                elapsed_ms = start.elapsed().as_millis() as u64,
                "persisted and aggregated"
            );
        }
        Ok(n)
    }

    /// Add `rows` for `site_id`, retrying once. Rows that still fail go into
    /// `unapplied`; the hits they came from are already in the database.
    async fn apply_or_keep(&self, site_id: i64, rows: Vec<AggregateRow>, unapplied: &mut Unapplied) {
        let mut res = self.store.apply_aggregates(site_id, &rows).await;
        if let Err(e) = &res {
            warn!(site_id, error = %e, "updating stats failed; retrying");
            res = self.store.apply_aggregates(site_id, &rows).await;
        }
        if let Err(e) = res {
            error!(site_id, rows = rows.len(), error = %e, "updating stats failed; kept for the next run");
            unapplied.push((site_id, rows));
        }
    }

    /// Delete old data: sites deleted more than
    /// [`DELETED_SITE_RETENTION_DAYS`] ago, and raw hits past each site's
    /// retention.
    pub async fn vacuum(&self, now: DateTime<Utc>) -> Result<VacuumStats> {
        let mut stats = VacuumStats {
            sites_purged: self
                .store
                .purge_deleted_sites(now - ChronoDuration::days(DELETED_SITE_RETENTION_DAYS))
                .await?,
            ..Default::default()
        };

        for site in self.store.list_sites().await? {
            let cutoff = if !site.settings.collect.has(Collect::HITS) {
                Some(now - ChronoDuration::seconds(UNCOLLECTED_HITS_RETENTION_SECS))
            } else if site.settings.keep_hits > 0 {
                Some(now - ChronoDuration::days(i64::from(site.settings.keep_hits)))
            } else {
                None
            };
            if let Some(cutoff) = cutoff {
                stats.hits_deleted += self.store.delete_hits_before(site.id, cutoff).await?;
            }
        }
        info!(
            sites_purged = stats.sites_purged,
            hits_deleted = stats.hits_deleted,
            "vacuum finished"
        );
        Ok(stats)
    }
}

/// Time until the next daily vacuum.
fn until_next_vacuum(now: DateTime<Utc>) -> Duration {
    let at = NaiveTime::from_hms_opt(VACUUM_AT_HOUR, 0, 0).unwrap_or_default();
    let mut next = now.date_naive().and_time(at).and_utc();
    if next <= now {
        next += ChronoDuration::days(1);
    }
    (next - now).to_std().unwrap_or(Duration::from_secs(1))
}

/// Minute-level housekeeping: session eviction, salt rotation and pruning of
/// idle rate-limit buckets.
pub fn tick_minute(state: &AppState, now: DateTime<Utc>) {
    let evicted = state.memstore.evict_sessions(now);
    if state.memstore.rotate_salt_if_due(now) {
        info!("session salt rotated");
    }
    let pruned = state.limiter.prune(Instant::now());
    debug!(evicted, pruned, "minute tick");
}

/// Drive the cron loop until `cancel` fires.
pub async fn run(state: Arc<AppState>, cancel: CancellationToken) {
    let every = state.config.store_every;
    info!(store_every_secs = every.as_secs(), "cron started");

    let mut persist = tokio::time::interval(every);
    persist.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut minute = tokio::time::interval(Duration::from_secs(60));
    minute.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let vacuum = tokio::time::sleep(until_next_vacuum(Utc::now()));
    tokio::pin!(vacuum);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = persist.tick() => {
                if let Err(e) = state.cron.persist_and_stat().await {
                    error!(error = %e, "persist failed; hits kept for the next run");
                }
            }
            _ = minute.tick() => tick_minute(&state, Utc::now()),
            _ = &mut vacuum => {
                if let Err(e) = state.runner.run_task("vacuum") {
                    warn!(error = %e, "vacuum not started");
                }
                vacuum
                    .as_mut()
                    .reset(tokio::time::Instant::now() + until_next_vacuum(Utc::now()));
            }
        }
    }
    info!("cron stopped");
}

/// Final persist, session eviction, then wait for background jobs.
pub async fn shutdown(state: &AppState) {
    match state.cron.persist_and_stat().await {
        Ok(n) => info!(hits = n, "final persist done"),
        Err(e) => error!(error = %e, queued = state.memstore.len(), "final persist failed"),
    }
    state.memstore.evict_sessions(Utc::now());
    if let Err(e) = state.runner.wait_for(SHUTDOWN_WAIT, "").await {
        warn!(error = %e, "background jobs did not finish in time");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn next_vacuum_is_at_three() {
        let before = Utc.with_ymd_and_hms(2020, 6, 18, 2, 0, 0).unwrap();
        assert_eq!(until_next_vacuum(before), Duration::from_secs(3600));

        let after = Utc.with_ymd_and_hms(2020, 6, 18, 3, 0, 0).unwrap();
        assert_eq!(until_next_vacuum(after), Duration::from_secs(24 * 3600));
    }
}
