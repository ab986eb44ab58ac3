//! In-memory queue of pending hits.
//!
//! Handlers [`Memstore::append`] hits without touching the database. The cron
//! loop calls [`Memstore::persist`], which drains the queue, resolves the raw
//! fields into surrogate IDs and sessions, and writes the hits per site.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

use anyhow::Result;
use chrono::{DateTime, Utc};
use tracing::{debug, error, warn};

use goatcounter_core::bot::{self, Bot};
use goatcounter_core::clean::{self, RefScheme};
use goatcounter_core::hit::Hit;
use goatcounter_core::session::Sessions;
use goatcounter_core::site::{Collect, SiteSettings};
use goatcounter_core::store::Store;
use goatcounter_core::useragent;

#[derive(Debug, Clone, Copy)]
struct UaIds {
    user_agent_id: i64,
    browser_id: i64,
    system_id: i64,
    bot: Bot,
}

#[derive(Debug, Default)]
struct IdCache {
    paths: HashMap<(i64, String, bool), i64>,
    user_agents: HashMap<String, UaIds>,
    refs: HashMap<(String, RefScheme), i64>,
    campaigns: HashMap<(i64, String), i64>,
}

/// Result of one [`Memstore::persist`].
#[derive(Debug, Default)]
pub struct Persisted {
    /// Hits written to the database, ready for aggregation.
    pub hits: Vec<Hit>,
    /// Hits put back in the queue after a failed insert.
    pub requeued: usize,
}

pub struct Memstore {
    store: Arc<dyn Store>,
    pending: Mutex<Vec<Hit>>,
    ids: RwLock<IdCache>,
    sessions: Mutex<Sessions>,
    sites: RwLock<HashMap<i64, SiteSettings>>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Memstore {
    pub fn new(store: Arc<dyn Store>, sessions: Sessions) -> Self {
        Self {
            store,
            pending: Mutex::new(Vec::new()),
            ids: RwLock::new(IdCache::default()),
            sessions: Mutex::new(sessions),
            sites: RwLock::new(HashMap::new()),
        }
    }

    pub fn append(&self, hits: impl IntoIterator<Item = Hit>) {
        lock(&self.pending).extend(hits);
    }

    pub fn len(&self) -> usize {
        lock(&self.pending).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop queued hits and the cached IDs and site settings. Sessions are
    /// kept. Used by tests to start from a known state.
    pub fn reset(&self) {
        lock(&self.pending).clear();
        *self.ids.write().unwrap_or_else(PoisonError::into_inner) = IdCache::default();
        self.sites
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    pub fn evict_sessions(&self, now: DateTime<Utc>) -> usize {
        lock(&self.sessions).evict_idle(now)
    }

    pub fn rotate_salt_if_due(&self, now: DateTime<Utc>) -> bool {
        lock(&self.sessions).rotate_if_due(now)
    }

    pub fn session_count(&self) -> usize {
        lock(&self.sessions).len()
    }

    pub fn dump_sessions(&self) -> Result<String> {
        Ok(lock(&self.sessions).dump_toml()?)
    }

    /// Put `hits` back at the front of the queue, ahead of anything appended
    /// since the drain.
    fn requeue(&self, hits: Vec<Hit>) {
        if hits.is_empty() {
            return;
        }
        let mut pending = lock(&self.pending);
        let newer = std::mem::replace(&mut *pending, hits);
        pending.extend(newer);
    }

    /// Drain the queue, resolve every hit and insert them, one transaction
    /// per site.
    ///
    /// A failed lookup puts the whole batch back and returns the error. A
    /// failed insert is retried once; if it fails again that site's hits go
    /// back in the queue and the other sites are still written.
    pub async fn persist(&self) -> Result<Persisted> {
        let drained = std::mem::take(&mut *lock(&self.pending));
        if drained.is_empty() {
            return Ok(Persisted::default());
        }

        let mut resolved: Vec<Hit> = Vec::with_capacity(drained.len());
        let mut iter = drained.into_iter();
        while let Some(hit) = iter.next() {
            match self.resolve(hit.clone()).await {
                Ok(Some(h)) => resolved.push(h),
                Ok(None) => {}
                Err(e) => {
                    resolved.push(hit);
                    resolved.extend(iter);
                    let n = resolved.len();
                    self.requeue(resolved);
                    error!(error = %e, requeued = n, "persist: resolving hits failed");
                    return Err(e);
                }
            }
        }

        let mut by_site: BTreeMap<i64, Vec<Hit>> = BTreeMap::new();
        for hit in resolved {
            by_site.entry(hit.site_id).or_default().push(hit);
        }

        let mut out = Persisted::default();
        for (site_id, hits) in by_site {
            let mut res = self.store.insert_hits(site_id, &hits).await;
            if let Err(e) = &res {
                warn!(site_id, error = %e, "inserting hits failed; retrying");
                res = self.store.insert_hits(site_id, &hits).await;
            }
            match res {
                Ok(()) => {
                    debug!(site_id, count = hits.len(), "hits persisted");
                    out.hits.extend(hits);
                }
                Err(e) => {
                    error!(site_id, count = hits.len(), error = %e, "inserting hits failed; requeued");
                    out.requeued += hits.len();
                    self.requeue(hits);
                }
            }
        }
        Ok(out)
    }

    async fn site_settings(&self, site_id: i64) -> Result<Option<SiteSettings>> {
        if let Some(s) = self
            .sites
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&site_id)
        {
            return Ok(Some(s.clone()));
        }
        let Some(site) = self.store.site_by_id(site_id).await? else {
            return Ok(None);
        };
        self.sites
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(site_id, site.settings.clone());
        Ok(Some(site.settings))
    }

    /// Fill the surrogate IDs, session and first-visit flag. `None` means the
    /// hit was dropped.
    async fn resolve(&self, mut hit: Hit) -> Result<Option<Hit>> {
        if hit.is_resolved() {
            return Ok(Some(hit));
        }
        let Some(settings) = self.site_settings(hit.site_id).await? else {
            warn!(site_id = hit.site_id, "dropping hit for unknown site");
            return Ok(None);
        };
        let collect = settings.collect;

        let ua = hit.ua_header.trim().to_string();
        let mut bot_value = hit.bot;
        let mut ua_ids = None;
        if !ua.is_empty() {
            if collect.has(Collect::USER_AGENT) {
                let ids = self.user_agent(&ua).await?;
                bot_value = bot::resolve(bot_value, &[ids.bot]);
                ua_ids = Some(ids);
            } else {
                bot_value = bot::resolve(bot_value, &[bot::classify_user_agent(&ua)]);
            }
        }

        let path = clean::clean_path(&hit.path, hit.event);
        let path_id = self
            .path_id(hit.site_id, &path, hit.title.trim(), hit.event)
            .await?;

        let (ref_id, campaign_id) = if collect.has(Collect::REFERRER) {
            let cleaned = match clean::clean_ref(&hit.referrer, &hit.query) {
                Ok(r) => r,
                Err(e) => {
                    warn!(site_id = hit.site_id, error = %e, "dropping hit with invalid ref");
                    return Ok(None);
                }
            };
            let ref_id = self.ref_id(&cleaned.referrer, cleaned.scheme).await?;
            let campaign_id = match clean::campaign_name(&hit.query) {
                Some(name) => Some(self.campaign_id(hit.site_id, &name).await?),
                None => None,
            };
            (ref_id, campaign_id)
        } else {
            (clean::EMPTY_REF_ID, None)
        };

        let (session, first_visit) = if hit.no_sessions || !collect.has(Collect::SESSIONS) {
            (None, true)
        } else {
            let (sid, first) = lock(&self.sessions).session_or_first(
                hit.site_id,
                &hit.ua_header,
                &hit.remote_addr,
                hit.client_session.as_deref(),
                path_id,
                hit.created_at,
            );
            (Some(sid), first)
        };

        if !collect.has(Collect::SIZE) {
            hit.size = None;
        }
        if !collect.has(Collect::LOCATION) {
            hit.location.clear();
        }
        if !collect.has(Collect::LANGUAGE) {
            hit.language = None;
        }

        hit.path = path;
        hit.bot = bot_value;
        hit.user_agent_id = ua_ids.map(|u| u.user_agent_id);
        hit.browser_id = ua_ids.map(|u| u.browser_id);
        hit.system_id = ua_ids.map(|u| u.system_id);
        hit.ref_id = ref_id;
        hit.campaign_id = campaign_id;
        hit.session = session;
        hit.first_visit = first_visit;
        hit.path_id = path_id;
        Ok(Some(hit))
    }

    async fn user_agent(&self, ua: &str) -> Result<UaIds> {
        let short = useragent::shorten(ua);
        if let Some(ids) = self
            .ids
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .user_agents
            .get(&short)
        {
            return Ok(*ids);
        }
        let info = useragent::parse(ua);
        let browser_id = self
            .store
            .browser_get_or_insert(&info.browser, &info.browser_version)
            .await?;
        let system_id = self
            .store
            .system_get_or_insert(&info.system, &info.system_version)
            .await?;
        let bot = info.bot;
        let user_agent_id = self
            .store
            .user_agent_get_or_insert(&short, browser_id, system_id, bot.as_u8())
            .await?;
        let ids = UaIds {
            user_agent_id,
            browser_id,
            system_id,
            bot,
        };
        self.ids
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .user_agents
            .insert(short, ids);
        Ok(ids)
    }

    async fn path_id(&self, site_id: i64, path: &str, title: &str, event: bool) -> Result<i64> {
        let key = (site_id, path.to_string(), event);
        if let Some(id) = self
            .ids
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .paths
            .get(&key)
        {
            return Ok(*id);
        }
        let id = self
            .store
            .path_get_or_insert(site_id, path, title, event)
            .await?;
        self.ids
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .paths
            .insert(key, id);
        Ok(id)
    }

    async fn ref_id(&self, referrer: &str, scheme: RefScheme) -> Result<i64> {
        let key = (referrer.to_lowercase(), scheme);
        if let Some(id) = self
            .ids
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .refs
            .get(&key)
        {
            return Ok(*id);
        }
        let id = self.store.ref_get_or_insert(referrer, scheme).await?;
        self.ids
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .refs
            .insert(key, id);
        Ok(id)
    }

    async fn campaign_id(&self, site_id: i64, name: &str) -> Result<i64> {
        let key = (site_id, name.to_lowercase());
        if let Some(id) = self
            .ids
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .campaigns
            .get(&key)
        {
            return Ok(*id);
        }
        let id = self.store.campaign_get_or_insert(site_id, name).await?;
        self.ids
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .campaigns
            .insert(key, id);
        Ok(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use goatcounter_store::SqliteStore;

    const FIREFOX: &str = "Mozilla/5.0 (Linux) Firefox/1";

    async fn setup() -> (Arc<SqliteStore>, Memstore, i64) {
        let db = Arc::new(SqliteStore::open_in_memory().unwrap());
        let site = db
            .create_site("test", None, &SiteSettings::default())
            .await
            .unwrap();
        let at = Utc.with_ymd_and_hms(2020, 6, 18, 14, 0, 0).unwrap();
        let store: Arc<dyn Store> = db.clone();
        let ms = Memstore::new(store, Sessions::with_seed(0, at));
        (db, ms, site.id)
    }

    fn hit(site_id: i64, path: &str, ip: &str, ua: &str, min: u32) -> Hit {
        let at = Utc.with_ymd_and_hms(2020, 6, 18, 14, min, 0).unwrap();
        Hit {
            remote_addr: ip.into(),
            ua_header: ua.into(),
            ..Hit::new(site_id, path, at)
        }
    }

    #[tokio::test]
    async fn empty_persist_is_a_noop() {
        let (_, ms, _) = setup().await;
        let out = ms.persist().await.unwrap();
        assert!(out.hits.is_empty());
        assert_eq!(out.requeued, 0);
    }

    #[tokio::test]
    async fn same_visitor_is_one_session() {
        let (_, ms, site) = setup().await;
        ms.append([
            hit(site, "/a", "1.1.1.1", FIREFOX, 1),
            hit(site, "/a", "1.1.1.1", FIREFOX, 2),
        ]);
        assert_eq!(ms.len(), 2);

        let out = ms.persist().await.unwrap();
        assert_eq!(ms.len(), 0);
        assert_eq!(out.hits.len(), 2);
        assert_eq!(out.hits[0].path_id, out.hits[1].path_id);
        assert_eq!(out.hits[0].user_agent_id, out.hits[1].user_agent_id);
        assert_eq!(out.hits[0].session, out.hits[1].session);
        assert!(out.hits[0].first_visit);
        assert!(!out.hits[1].first_visit);
        assert_eq!(ms.session_count(), 1);
    }

    #[tokio::test]
    async fn reset_drops_the_queue_and_caches() {
        let (db, ms, site) = setup().await;
        ms.append([hit(site, "/a", "1.1.1.1", FIREFOX, 0)]);
        ms.persist().await.unwrap();
        ms.append([hit(site, "/b", "1.1.1.1", FIREFOX, 1)]);

        ms.reset();
        assert!(ms.is_empty());
        assert!(ms.ids.read().unwrap().paths.is_empty());
        assert!(ms.sites.read().unwrap().is_empty());
        assert_eq!(ms.session_count(), 1);

        // IDs resolve again from the database after a reset.
        ms.append([hit(site, "/a", "1.1.1.1", FIREFOX, 2)]);
        let out = ms.persist().await.unwrap();
        let path_id = db.path_get_or_insert(site, "/a", "", false).await.unwrap();
        assert_eq!(out.hits[0].path_id, path_id);
    }

    #[tokio::test]
    async fn curl_is_stored_as_bot() {
        let (_, ms, site) = setup().await;
        ms.append([hit(site, "/a", "1.1.1.1", "curl/7.8", 0)]);
        let out = ms.persist().await.unwrap();
        assert!(bot::is_bot(out.hits[0].bot));
    }

    #[tokio::test]
    async fn detected_bot_replaces_the_hint() {
        let (_, ms, site) = setup().await;
        let mut hinted = hit(site, "/a", "1.1.1.1", FIREFOX, 0);
        hinted.bot = 160;
        let mut curl = hit(site, "/a", "1.1.1.2", "curl/7.88.1 (x86_64)", 1);
        curl.bot = 160;
        ms.append([hinted, curl]);

        let out = ms.persist().await.unwrap();
        assert_eq!(out.hits[0].bot, 160);
        assert_eq!(out.hits[1].bot, Bot::Short.as_u8());
    }

    #[tokio::test]
    async fn newline_ref_drops_the_hit() {
        let (_, ms, site) = setup().await;
        let mut bad = hit(site, "/a", "1.1.1.1", FIREFOX, 0);
        bad.referrer = "https://example.com/\nx".into();
        ms.append([bad, hit(site, "a", "1.1.1.1", FIREFOX, 1)]);
        let out = ms.persist().await.unwrap();
        assert_eq!(out.hits.len(), 1);
        assert_eq!(out.hits[0].path, "/a");
    }

    #[tokio::test]
    async fn no_sessions_marks_every_hit_first() {
        let (_, ms, site) = setup().await;
        let mut a = hit(site, "/a", "", "", 0);
        a.no_sessions = true;
        let b = a.clone();
        ms.append([a, b]);
        let out = ms.persist().await.unwrap();
        assert!(out.hits.iter().all(|h| h.first_visit && h.session.is_none()));
    }

    #[tokio::test]
    async fn failed_insert_is_requeued() {
        let (db, ms, site) = setup().await;
        ms.append([hit(site, "/a", "1.1.1.1", FIREFOX, 0)]);
        db.conn_for_test()
            .await
            .execute_batch("DROP TABLE hits")
            .unwrap();

        let out = ms.persist().await.unwrap();
        assert!(out.hits.is_empty());
        assert_eq!(out.requeued, 1);
        assert_eq!(ms.len(), 1);

        // The requeued hit keeps its resolved IDs and first-visit flag.
        let pending = lock(&ms.pending)[0].clone();
        assert!(pending.is_resolved());
        assert!(pending.first_visit);
    }

    #[tokio::test]
    async fn unknown_site_is_dropped() {
        let (_, ms, _) = setup().await;
        ms.append([hit(999, "/a", "1.1.1.1", FIREFOX, 0)]);
        let out = ms.persist().await.unwrap();
        assert!(out.hits.is_empty());
        assert_eq!(ms.len(), 0);
    }
}
