use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, ErrorCode, OptionalExtension, Row, ToSql};
use tokio::sync::Mutex;
use tracing::info;

use goatcounter_core::aggregate::AggregateRow;
use goatcounter_core::clean::{RefScheme, EMPTY_REF_ID};
use goatcounter_core::hit::Hit;
use goatcounter_core::site::{Access, ApiToken, Permissions, Site, SiteSettings, User};
use goatcounter_core::store::Store;

use crate::schema::{SITE_TABLES, SQLITE_SCHEMA};
use crate::{add_stats, StoreError};

const TIME_FMT: &str = "%Y-%m-%d %H:%M:%S";
const DAY_FMT: &str = "%Y-%m-%d";

pub(crate) fn fmt_time(t: DateTime<Utc>) -> String {
    t.format(TIME_FMT).to_string()
}

fn fmt_day(d: NaiveDate) -> String {
    d.format(DAY_FMT).to_string()
}

fn conversion_err(idx: usize, e: impl std::error::Error + Send + Sync + 'static) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e))
}

fn time_col(row: &Row, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    NaiveDateTime::parse_from_str(&raw, TIME_FMT)
        .map(|t| t.and_utc())
        .map_err(|e| conversion_err(idx, e))
}

fn opt_time_col(row: &Row, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let raw: Option<String> = row.get(idx)?;
    raw.map(|r| {
        NaiveDateTime::parse_from_str(&r, TIME_FMT)
            .map(|t| t.and_utc())
            .map_err(|e| conversion_err(idx, e))
    })
    .transpose()
}

const SITE_COLUMNS: &str =
    "site_id, parent, code, cname, settings, first_hit_at, created_at, deleted_at";

fn site_from_row(row: &Row) -> rusqlite::Result<Site> {
    let settings: String = row.get(4)?;
    Ok(Site {
        id: row.get(0)?,
        parent: row.get(1)?,
        code: row.get(2)?,
        cname: row.get(3)?,
        settings: serde_json::from_str(&settings).map_err(|e| conversion_err(4, e))?,
        first_hit_at: time_col(row, 5)?,
        created_at: time_col(row, 6)?,
        deleted_at: opt_time_col(row, 7)?,
    })
}

fn user_from_row(row: &Row) -> rusqlite::Result<User> {
    let access: String = row.get(3)?;
    Ok(User {
        id: row.get(0)?,
        site_id: row.get(1)?,
        email: row.get(2)?,
        access: Access::parse(&access).unwrap_or(Access::Readonly),
        created_at: time_col(row, 4)?,
    })
}

fn token_from_row(row: &Row) -> rusqlite::Result<ApiToken> {
    let perms: u32 = row.get(4)?;
    Ok(ApiToken {
        id: row.get(0)?,
        site_id: row.get(1)?,
        user_id: row.get(2)?,
        name: row.get(3)?,
        permissions: Permissions::from_bits(perms),
        created_at: time_col(row, 5)?,
        last_used_at: opt_time_col(row, 6)?,
    })
}

fn is_unique_violation(e: &rusqlite::Error) -> bool {
    matches!(e, rusqlite::Error::SqliteFailure(f, _) if f.code == ErrorCode::ConstraintViolation)
}

/// Look up a surrogate ID, inserting the row if it doesn't exist. A unique
/// violation on insert means someone else got there first; fetch their row.
fn get_or_insert(
    conn: &Connection,
    select: &str,
    select_params: &[&dyn ToSql],
    insert: &str,
    insert_params: &[&dyn ToSql],
) -> rusqlite::Result<i64> {
    if let Some(id) = conn
        .query_row(select, select_params, |r| r.get(0))
        .optional()?
    {
        return Ok(id);
    }
    match conn.execute(insert, insert_params) {
        Ok(_) => Ok(conn.last_insert_rowid()),
        Err(e) if is_unique_violation(&e) => conn.query_row(select, select_params, |r| r.get(0)),
        Err(e) => Err(e),
    }
}

/// SQLite backend.
///
/// SQLite allows one writer at a time, so the connection sits behind an async
/// mutex: handlers and the cron loop queue up on it instead of getting
/// `SQLITE_BUSY`.
pub struct SqliteStore {
    pub(crate) conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Open (or create) the database file at `path` and apply the schema.
    pub fn open(path: &str) -> Result<Self> {
        if let Some(parent) = Path::new(path).parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("creating {}", parent.display()))?;
            }
        }
        let conn = Connection::open(path)?;
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |_| Ok(()))?;
        conn.execute_batch(SQLITE_SCHEMA)?;
        info!(path, "SQLite database opened");
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Open an in-memory database. Data is discarded on drop; meant for tests.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SQLITE_SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Direct access to the connection for tests that inspect stored rows.
    pub async fn conn_for_test(&self) -> tokio::sync::MutexGuard<'_, Connection> {
        self.conn.lock().await
    }
}

#[async_trait]
impl Store for SqliteStore {
    fn kind(&self) -> &'static str {
        "sqlite3"
    }

    async fn ping(&self) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.query_row("SELECT 1", [], |r| r.get::<_, i64>(0))?;
        Ok(())
    }

    async fn create_site(
        &self,
        code: &str,
        cname: Option<&str>,
        settings: &SiteSettings,
    ) -> Result<Site> {
        settings.validate()?;
        let now = fmt_time(Utc::now());
        let settings_json = serde_json::to_string(settings)?;
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO sites (code, cname, settings, first_hit_at, created_at)
             VALUES (?1, ?2, ?3, ?4, ?4)",
            params![code, cname, settings_json, now],
        )
        .map_err(|e| {
            if is_unique_violation(&e) {
                anyhow::Error::new(StoreError::Conflict(format!("site {code:?}")))
            } else {
                e.into()
            }
        })?;
        let id = conn.last_insert_rowid();
        let site = conn.query_row(
            &format!("SELECT {SITE_COLUMNS} FROM sites WHERE site_id = ?1"),
            [id],
            site_from_row,
        )?;
        Ok(site)
    }

    async fn site_by_id(&self, id: i64) -> Result<Option<Site>> {
        let conn = self.conn.lock().await;
        Ok(conn
            .query_row(
                &format!("SELECT {SITE_COLUMNS} FROM sites WHERE site_id = ?1 AND deleted_at IS NULL"),
                [id],
                site_from_row,
            )
            .optional()?)
    }

    async fn site_by_code(&self, code: &str) -> Result<Option<Site>> {
        let conn = self.conn.lock().await;
        Ok(conn
            .query_row(
                &format!("SELECT {SITE_COLUMNS} FROM sites WHERE code = ?1 AND deleted_at IS NULL"),
                [code],
                site_from_row,
            )
            .optional()?)
    }

    async fn site_by_cname(&self, cname: &str) -> Result<Option<Site>> {
        let conn = self.conn.lock().await;
        Ok(conn
            .query_row(
                &format!("SELECT {SITE_COLUMNS} FROM sites WHERE cname = ?1 AND deleted_at IS NULL"),
                [cname],
                site_from_row,
            )
            .optional()?)
    }

    async fn list_sites(&self) -> Result<Vec<Site>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(&format!(
            "SELECT {SITE_COLUMNS} FROM sites WHERE deleted_at IS NULL ORDER BY site_id"
        ))?;
        let sites = stmt
            .query_map([], site_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(sites)
    }

    async fn delete_site(&self, id: i64, at: DateTime<Utc>) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "UPDATE sites SET deleted_at = ?1 WHERE site_id = ?2",
            params![fmt_time(at), id],
        )?;
        Ok(())
    }

    async fn pull_back_first_hit(&self, site_id: i64, at: DateTime<Utc>) -> Result<()> {
        let at = fmt_time(at);
        let conn = self.conn.lock().await;
        conn.execute(
            "UPDATE sites SET first_hit_at = ?1 WHERE site_id = ?2 AND first_hit_at > ?1",
            params![at, site_id],
        )?;
        Ok(())
    }

    async fn create_user(&self, site_id: i64, email: &str, access: Access) -> Result<User> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO users (site_id, email, access, created_at) VALUES (?1, ?2, ?3, ?4)",
            params![site_id, email, access.as_str(), fmt_time(Utc::now())],
        )?;
        let id = conn.last_insert_rowid();
        Ok(conn.query_row(
            "SELECT user_id, site_id, email, access, created_at FROM users WHERE user_id = ?1",
            [id],
            user_from_row,
        )?)
    }

    async fn user_by_id(&self, id: i64) -> Result<Option<User>> {
        let conn = self.conn.lock().await;
        Ok(conn
            .query_row(
                "SELECT user_id, site_id, email, access, created_at FROM users WHERE user_id = ?1",
                [id],
                user_from_row,
            )
            .optional()?)
    }

    async fn first_user(&self, site_id: i64) -> Result<Option<User>> {
        let conn = self.conn.lock().await;
        Ok(conn
            .query_row(
                "SELECT user_id, site_id, email, access, created_at FROM users
                 WHERE site_id = ?1 ORDER BY user_id LIMIT 1",
                [site_id],
                user_from_row,
            )
            .optional()?)
    }

    async fn create_api_token(
        &self,
        site_id: i64,
        user_id: i64,
        name: &str,
        token_hash: &str,
        permissions: Permissions,
    ) -> Result<ApiToken> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO api_tokens (site_id, user_id, name, token, permissions, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                site_id,
                user_id,
                name,
                token_hash,
                permissions.bits(),
                fmt_time(Utc::now())
            ],
        )?;
        let id = conn.last_insert_rowid();
        Ok(conn.query_row(
            "SELECT api_token_id, site_id, user_id, name, permissions, created_at, last_used_at
             FROM api_tokens WHERE api_token_id = ?1",
            [id],
            token_from_row,
        )?)
    }

    async fn api_token_by_hash(&self, token_hash: &str) -> Result<Option<ApiToken>> {
        let conn = self.conn.lock().await;
        Ok(conn
            .query_row(
                "SELECT api_token_id, site_id, user_id, name, permissions, created_at, last_used_at
                 FROM api_tokens WHERE token = ?1",
                [token_hash],
                token_from_row,
            )
            .optional()?)
    }

    async fn touch_api_token(&self, id: i64, at: DateTime<Utc>) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "UPDATE api_tokens SET last_used_at = ?1 WHERE api_token_id = ?2",
            params![fmt_time(at), id],
        )?;
        Ok(())
    }

    async fn get_value(&self, key: &str) -> Result<Option<String>> {
        let conn = self.conn.lock().await;
        Ok(conn
            .query_row("SELECT value FROM store WHERE key = ?1", [key], |r| r.get(0))
            .optional()?)
    }

    async fn set_value(&self, key: &str, value: &str) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO store (key, value) VALUES (?1, ?2)
             ON CONFLICT (key) DO UPDATE SET value = excluded.value",
            params![key, value],
        )?;
        Ok(())
    }

    async fn path_get_or_insert(
        &self,
        site_id: i64,
        path: &str,
        title: &str,
        event: bool,
    ) -> Result<i64> {
        let conn = self.conn.lock().await;
        let event = i64::from(event);
        let id = get_or_insert(
            &conn,
            "SELECT path_id FROM paths WHERE site_id = ?1 AND path = ?2 AND event = ?3",
            &[&site_id, &path, &event],
            "INSERT INTO paths (site_id, path, event, title) VALUES (?1, ?2, ?3, ?4)",
            &[&site_id, &path, &event, &title],
        )?;
        Ok(id)
    }

    async fn browser_get_or_insert(&self, name: &str, version: &str) -> Result<i64> {
        let conn = self.conn.lock().await;
        let id = get_or_insert(
            &conn,
            "SELECT browser_id FROM browsers WHERE name = ?1 AND version = ?2",
            &[&name, &version],
            "INSERT INTO browsers (name, version) VALUES (?1, ?2)",
            &[&name, &version],
        )?;
        Ok(id)
    }

    async fn system_get_or_insert(&self, name: &str, version: &str) -> Result<i64> {
        let conn = self.conn.lock().await;
        let id = get_or_insert(
            &conn,
            "SELECT system_id FROM systems WHERE name = ?1 AND version = ?2",
            &[&name, &version],
            "INSERT INTO systems (name, version) VALUES (?1, ?2)",
            &[&name, &version],
        )?;
        Ok(id)
    }

    async fn user_agent_get_or_insert(
        &self,
        ua: &str,
        browser_id: i64,
        system_id: i64,
        bot: u8,
    ) -> Result<i64> {
        let conn = self.conn.lock().await;
        let id = get_or_insert(
            &conn,
            "SELECT user_agent_id FROM user_agents WHERE ua = ?1",
            &[&ua],
            "INSERT INTO user_agents (ua, browser_id, system_id, isbot) VALUES (?1, ?2, ?3, ?4)",
            &[&ua, &browser_id, &system_id, &bot],
        )?;
        Ok(id)
    }

    async fn ref_get_or_insert(&self, referrer: &str, scheme: RefScheme) -> Result<i64> {
        if referrer.is_empty() && scheme == RefScheme::Other {
            return Ok(EMPTY_REF_ID);
        }
        let conn = self.conn.lock().await;
        let scheme = scheme.as_str();
        let id = get_or_insert(
            &conn,
            "SELECT ref_id FROM refs WHERE lower(ref) = lower(?1) AND ref_scheme = ?2",
            &[&referrer, &scheme],
            "INSERT INTO refs (ref, ref_scheme) VALUES (?1, ?2)",
            &[&referrer, &scheme],
        )?;
        Ok(id)
    }

    async fn campaign_get_or_insert(&self, site_id: i64, name: &str) -> Result<i64> {
        let conn = self.conn.lock().await;
        let id = get_or_insert(
            &conn,
            "SELECT campaign_id FROM campaigns WHERE site_id = ?1 AND lower(name) = lower(?2)",
            &[&site_id, &name],
            "INSERT INTO campaigns (site_id, name) VALUES (?1, ?2)",
            &[&site_id, &name],
        )?;
        Ok(id)
    }

    async fn insert_hits(&self, site_id: i64, hits: &[Hit]) -> Result<()> {
        if hits.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO hits (
                    site_id, path_id, ref_id, user_agent_id, campaign_id,
                    session, bot, size, location, language, first_visit, created_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            )?;
            for hit in hits {
                stmt.execute(params![
                    site_id,
                    hit.path_id,
                    hit.ref_id,
                    hit.user_agent_id,
                    hit.campaign_id,
                    hit.session.map(|s| s.to_string()),
                    hit.bot,
                    hit.size.map(|s| s.to_string()).unwrap_or_default(),
                    hit.location,
                    hit.language,
                    hit.first_visit,
                    fmt_time(hit.created_at),
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    async fn apply_aggregates(&self, site_id: i64, rows: &[AggregateRow]) -> Result<()> {
        if rows.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;
        for row in rows {
            match row {
                AggregateRow::HitCounts { path_id, hour, total } => {
                    tx.execute(
                        "INSERT INTO hit_counts (site_id, path_id, hour, total) VALUES (?1, ?2, ?3, ?4)
                         ON CONFLICT (site_id, path_id, hour) DO UPDATE SET total = total + excluded.total",
                        params![site_id, path_id, fmt_time(*hour), total],
                    )?;
                }
                AggregateRow::HitStats { path_id, day, stats } => {
                    let day = fmt_day(*day);
                    let existing: Option<String> = tx
                        .query_row(
                            "SELECT stats FROM hit_stats WHERE site_id = ?1 AND path_id = ?2 AND day = ?3",
                            params![site_id, path_id, day],
                            |r| r.get(0),
                        )
                        .optional()?;
                    match existing {
                        Some(raw) => {
                            let merged = add_stats(&raw, stats)?;
                            tx.execute(
                                "UPDATE hit_stats SET stats = ?1 WHERE site_id = ?2 AND path_id = ?3 AND day = ?4",
                                params![merged, site_id, path_id, day],
                            )?;
                        }
                        None => {
                            tx.execute(
                                "INSERT INTO hit_stats (site_id, path_id, day, stats) VALUES (?1, ?2, ?3, ?4)",
                                params![site_id, path_id, day, serde_json::to_string(stats)?],
                            )?;
                        }
                    }
                }
                AggregateRow::RefCounts { path_id, ref_id, hour, total } => {
                    tx.execute(
                        "INSERT INTO ref_counts (site_id, path_id, ref_id, hour, total) VALUES (?1, ?2, ?3, ?4, ?5)
                         ON CONFLICT (site_id, path_id, ref_id, hour) DO UPDATE SET total = total + excluded.total",
                        params![site_id, path_id, ref_id, fmt_time(*hour), total],
                    )?;
                }
                AggregateRow::BrowserStats { path_id, browser_id, day, count } => {
                    tx.execute(
                        "INSERT INTO browser_stats (site_id, path_id, browser_id, day, count) VALUES (?1, ?2, ?3, ?4, ?5)
                         ON CONFLICT (site_id, path_id, browser_id, day) DO UPDATE SET count = count + excluded.count",
                        params![site_id, path_id, browser_id, fmt_day(*day), count],
                    )?;
                }
                AggregateRow::SystemStats { path_id, system_id, day, count } => {
                    tx.execute(
                        "INSERT INTO system_stats (site_id, path_id, system_id, day, count) VALUES (?1, ?2, ?3, ?4, ?5)
                         ON CONFLICT (site_id, path_id, system_id, day) DO UPDATE SET count = count + excluded.count",
                        params![site_id, path_id, system_id, fmt_day(*day), count],
                    )?;
                }
                AggregateRow::LocationStats { path_id, day, location, count } => {
                    tx.execute(
                        "INSERT INTO location_stats (site_id, path_id, day, location, count) VALUES (?1, ?2, ?3, ?4, ?5)
                         ON CONFLICT (site_id, path_id, day, location) DO UPDATE SET count = count + excluded.count",
                        params![site_id, path_id, fmt_day(*day), location, count],
                    )?;
                }
                AggregateRow::LanguageStats { path_id, day, language, count } => {
                    tx.execute(
                        "INSERT INTO language_stats (site_id, path_id, day, language, count) VALUES (?1, ?2, ?3, ?4, ?5)
                         ON CONFLICT (site_id, path_id, day, language) DO UPDATE SET count = count + excluded.count",
                        params![site_id, path_id, fmt_day(*day), language, count],
                    )?;
                }
                AggregateRow::SizeStats { path_id, day, width, count } => {
                    tx.execute(
                        "INSERT INTO size_stats (site_id, path_id, day, width, count) VALUES (?1, ?2, ?3, ?4, ?5)
                         ON CONFLICT (site_id, path_id, day, width) DO UPDATE SET count = count + excluded.count",
                        params![site_id, path_id, fmt_day(*day), width, count],
                    )?;
                }
                AggregateRow::CampaignStats { campaign_id, day, session, count, count_unique } => {
                    tx.execute(
                        "INSERT INTO campaign_stats (site_id, campaign_id, day, session, count, count_unique)
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                         ON CONFLICT (site_id, campaign_id, day, session) DO UPDATE SET
                             count = count + excluded.count,
                             count_unique = count_unique + excluded.count_unique",
                        params![site_id, campaign_id, fmt_day(*day), session, count, count_unique],
                    )?;
                }
            }
        }
        tx.commit()?;
        Ok(())
    }

    async fn delete_hits_before(&self, site_id: i64, before: DateTime<Utc>) -> Result<u64> {
        let conn = self.conn.lock().await;
        let n = conn.execute(
            "DELETE FROM hits WHERE site_id = ?1 AND created_at < ?2",
            params![site_id, fmt_time(before)],
        )?;
        Ok(n as u64)
    }

    async fn purge_deleted_sites(&self, before: DateTime<Utc>) -> Result<u64> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;
        let ids: Vec<i64> = {
            let mut stmt = tx.prepare(
                "SELECT site_id FROM sites WHERE deleted_at IS NOT NULL AND deleted_at < ?1",
            )?;
            let ids = stmt
                .query_map([fmt_time(before)], |r| r.get(0))?
                .collect::<rusqlite::Result<Vec<i64>>>()?;
            ids
        };
        for id in &ids {
            for table in SITE_TABLES {
                tx.execute(&format!("DELETE FROM {table} WHERE site_id = ?1"), [id])?;
            }
            tx.execute("DELETE FROM sites WHERE site_id = ?1", [id])?;
        }
        tx.commit()?;
        Ok(ids.len() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn time_format_round_trips() {
        let t = Utc.with_ymd_and_hms(2020, 6, 18, 14, 42, 0).unwrap();
        let s = fmt_time(t);
        assert_eq!(s, "2020-06-18 14:42:00");
        let back = NaiveDateTime::parse_from_str(&s, TIME_FMT).unwrap().and_utc();
        assert_eq!(back, t);
    }

    #[tokio::test]
    async fn empty_ref_is_reserved() {
        let db = SqliteStore::open_in_memory().unwrap();
        let conn = db.conn_for_test().await;
        let (r, scheme): (String, String) = conn
            .query_row("SELECT ref, ref_scheme FROM refs WHERE ref_id = 1", [], |r| {
                Ok((r.get(0)?, r.get(1)?))
            })
            .unwrap();
        assert_eq!(r, "");
        assert_eq!(scheme, "o");
    }
}
