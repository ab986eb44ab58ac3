use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::{Postgres, Row, Transaction};
use tracing::info;

use goatcounter_core::aggregate::AggregateRow;
use goatcounter_core::clean::{RefScheme, EMPTY_REF_ID};
use goatcounter_core::config::DbConn;
use goatcounter_core::hit::Hit;
use goatcounter_core::site::{Access, ApiToken, Permissions, Site, SiteSettings, User};
use goatcounter_core::store::Store;

use crate::schema::{POSTGRES_SCHEMA, SITE_TABLES};
use crate::{add_stats, StoreError};

const SITE_COLUMNS: &str =
    "site_id, parent, code, cname, settings, first_hit_at, created_at, deleted_at";

fn site_from_row(row: &PgRow) -> Result<Site> {
    let settings: String = row.try_get("settings")?;
    Ok(Site {
        id: row.try_get("site_id")?,
        parent: row.try_get("parent")?,
        code: row.try_get("code")?,
        cname: row.try_get("cname")?,
        settings: serde_json::from_str(&settings)?,
        first_hit_at: row.try_get("first_hit_at")?,
        created_at: row.try_get("created_at")?,
        deleted_at: row.try_get("deleted_at")?,
    })
}

fn user_from_row(row: &PgRow) -> Result<User> {
    let access: String = row.try_get("access")?;
    Ok(User {
        id: row.try_get("user_id")?,
        site_id: row.try_get("site_id")?,
        email: row.try_get("email")?,
        access: Access::parse(&access).unwrap_or(Access::Readonly),
        created_at: row.try_get("created_at")?,
    })
}

fn token_from_row(row: &PgRow) -> Result<ApiToken> {
    let perms: i64 = row.try_get("permissions")?;
    Ok(ApiToken {
        id: row.try_get("api_token_id")?,
        site_id: row.try_get("site_id")?,
        user_id: row.try_get("user_id")?,
        name: row.try_get("name")?,
        permissions: Permissions::from_bits(u32::try_from(perms).unwrap_or(0)),
        created_at: row.try_get("created_at")?,
        last_used_at: row.try_get("last_used_at")?,
    })
}

fn is_unique_violation(e: &sqlx::Error) -> bool {
    matches!(e, sqlx::Error::Database(d) if d.is_unique_violation())
}

/// PostgreSQL backend on a sqlx pool.
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn connect(dsn: &str, conn: DbConn) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(conn.max_open)
            .min_connections(conn.max_idle.min(conn.max_open))
            .connect(dsn)
            .await?;
        for stmt in POSTGRES_SCHEMA {
            sqlx::query(stmt).execute(&pool).await?;
        }
        info!(max_open = conn.max_open, "PostgreSQL pool connected");
        Ok(Self { pool })
    }

    /// The `INSERT … ON CONFLICT DO NOTHING RETURNING` form returns no row
    /// when the conflict fires; fall back to a select in that case.
    async fn get_or_insert<'q>(
        &self,
        select: sqlx::query::QueryScalar<'q, Postgres, i64, sqlx::postgres::PgArguments>,
        insert: sqlx::query::QueryScalar<'q, Postgres, i64, sqlx::postgres::PgArguments>,
        again: sqlx::query::QueryScalar<'q, Postgres, i64, sqlx::postgres::PgArguments>,
    ) -> Result<i64> {
        if let Some(id) = select.fetch_optional(&self.pool).await? {
            return Ok(id);
        }
        match insert.fetch_optional(&self.pool).await {
            Ok(Some(id)) => Ok(id),
            Ok(None) => Ok(again.fetch_one(&self.pool).await?),
            Err(e) if is_unique_violation(&e) => Ok(again.fetch_one(&self.pool).await?),
            Err(e) => Err(e.into()),
        }
    }

    async fn apply_row(
        tx: &mut Transaction<'_, Postgres>,
        site_id: i64,
        row: &AggregateRow,
    ) -> Result<()> {
        match row {
            AggregateRow::HitCounts { path_id, hour, total } => {
                sqlx::query(
                    "INSERT INTO hit_counts (site_id, path_id, hour, total) VALUES ($1, $2, $3, $4)
                     ON CONFLICT (site_id, path_id, hour) DO UPDATE SET total = hit_counts.total + excluded.total",
                )
                .bind(site_id)
                .bind(path_id)
                .bind(hour)
                .bind(total)
                .execute(&mut **tx)
                .await?;
            }
            AggregateRow::HitStats { path_id, day, stats } => {
                // Insert first so there is always a row for FOR UPDATE to lock;
                // a concurrent insert of the same key waits for the other
                // transaction and then does nothing.
                let inserted = sqlx::query(
                    "INSERT INTO hit_stats (site_id, path_id, day, stats) VALUES ($1, $2, $3, $4)
                     ON CONFLICT (site_id, path_id, day) DO NOTHING",
                )
                .bind(site_id)
                .bind(path_id)
                .bind(day)
                .bind(serde_json::to_string(stats)?)
                .execute(&mut **tx)
                .await?
                .rows_affected();
                if inserted == 0 {
                    let existing: String = sqlx::query_scalar(
                        "SELECT stats FROM hit_stats WHERE site_id = $1 AND path_id = $2 AND day = $3 FOR UPDATE",
                    )
                    .bind(site_id)
                    .bind(path_id)
                    .bind(day)
                    .fetch_one(&mut **tx)
                    .await?;
                    sqlx::query(
                        "UPDATE hit_stats SET stats = $1 WHERE site_id = $2 AND path_id = $3 AND day = $4",
                    )
                    .bind(add_stats(&existing, stats)?)
                    .bind(site_id)
                    .bind(path_id)
                    .bind(day)
                    .execute(&mut **tx)
                    .await?;
                }
            }
            AggregateRow::RefCounts { path_id, ref_id, hour, total } => {
                sqlx::query(
                    "INSERT INTO ref_counts (site_id, path_id, ref_id, hour, total) VALUES ($1, $2, $3, $4, $5)
                     ON CONFLICT (site_id, path_id, ref_id, hour) DO UPDATE SET total = ref_counts.total + excluded.total",
                )
                .bind(site_id)
                .bind(path_id)
                .bind(ref_id)
                .bind(hour)
                .bind(total)
                .execute(&mut **tx)
                .await?;
            }
            AggregateRow::BrowserStats { path_id, browser_id, day, count } => {
                sqlx::query(
                    "INSERT INTO browser_stats (site_id, path_id, browser_id, day, count) VALUES ($1, $2, $3, $4, $5)
                     ON CONFLICT (site_id, path_id, browser_id, day) DO UPDATE SET count = browser_stats.count + excluded.count",
                )
                .bind(site_id)
                .bind(path_id)
                .bind(browser_id)
                .bind(day)
                .bind(count)
                .execute(&mut **tx)
                .await?;
            }
            AggregateRow::SystemStats { path_id, system_id, day, count } => {
                sqlx::query(
                    "INSERT INTO system_stats (site_id, path_id, system_id, day, count) VALUES ($1, $2, $3, $4, $5)
                     ON CONFLICT (site_id, path_id, system_id, day) DO UPDATE SET count = system_stats.count + excluded.count",
                )
                .bind(site_id)
                .bind(path_id)
                .bind(system_id)
                .bind(day)
                .bind(count)
                .execute(&mut **tx)
                .await?;
            }
            AggregateRow::LocationStats { path_id, day, location, count } => {
                sqlx::query(
                    "INSERT INTO location_stats (site_id, path_id, day, location, count) VALUES ($1, $2, $3, $4, $5)
                     ON CONFLICT (site_id, path_id, day, location) DO UPDATE SET count = location_stats.count + excluded.count",
                )
                .bind(site_id)
                .bind(path_id)
                .bind(day)
                .bind(location)
                .bind(count)
                .execute(&mut **tx)
                .await?;
            }
            AggregateRow::LanguageStats { path_id, day, language, count } => {
                sqlx::query(
                    "INSERT INTO language_stats (site_id, path_id, day, language, count) VALUES ($1, $2, $3, $4, $5)
                     ON CONFLICT (site_id, path_id, day, language) DO UPDATE SET count = language_stats.count + excluded.count",
                )
                .bind(site_id)
                .bind(path_id)
                .bind(day)
                .bind(language)
                .bind(count)
                .execute(&mut **tx)
                .await?;
            }
            AggregateRow::SizeStats { path_id, day, width, count } => {
                sqlx::query(
                    "INSERT INTO size_stats (site_id, path_id, day, width, count) VALUES ($1, $2, $3, $4, $5)
                     ON CONFLICT (site_id, path_id, day, width) DO UPDATE SET count = size_stats.count + excluded.count",
                )
                .bind(site_id)
                .bind(path_id)
                .bind(day)
                .bind(width)
                .bind(count)
                .execute(&mut **tx)
                .await?;
            }
            AggregateRow::CampaignStats { campaign_id, day, session, count, count_unique } => {
                sqlx::query(
                    "INSERT INTO campaign_stats (site_id, campaign_id, day, session, count, count_unique)
                     VALUES ($1, $2, $3, $4, $5, $6)
                     ON CONFLICT (site_id, campaign_id, day, session) DO UPDATE SET
                         count = campaign_stats.count + excluded.count,
                         count_unique = campaign_stats.count_unique + excluded.count_unique",
                )
                .bind(site_id)
                .bind(campaign_id)
                .bind(day)
                .bind(session)
                .bind(count)
                .bind(count_unique)
                .execute(&mut **tx)
                .await?;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Store for PgStore {
    fn kind(&self) -> &'static str {
        "postgres"
    }

    async fn ping(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    async fn create_site(
        &self,
        code: &str,
        cname: Option<&str>,
        settings: &SiteSettings,
    ) -> Result<Site> {
        settings.validate()?;
        let now = Utc::now();
        let row = sqlx::query(&format!(
            "INSERT INTO sites (code, cname, settings, first_hit_at, created_at)
             VALUES ($1, $2, $3, $4, $4) RETURNING {SITE_COLUMNS}"
        ))
        .bind(code)
        .bind(cname)
        .bind(serde_json::to_string(settings)?)
        .bind(now)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                anyhow::Error::new(StoreError::Conflict(format!("site {code:?}")))
            } else {
                e.into()
            }
        })?;
        site_from_row(&row)
    }

    async fn site_by_id(&self, id: i64) -> Result<Option<Site>> {
        sqlx::query(&format!(
            "SELECT {SITE_COLUMNS} FROM sites WHERE site_id = $1 AND deleted_at IS NULL"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?
        .as_ref()
        .map(site_from_row)
        .transpose()
    }

    async fn site_by_code(&self, code: &str) -> Result<Option<Site>> {
        sqlx::query(&format!(
            "SELECT {SITE_COLUMNS} FROM sites WHERE code = $1 AND deleted_at IS NULL"
        ))
        .bind(code)
        .fetch_optional(&self.pool)
        .await?
        .as_ref()
        .map(site_from_row)
        .transpose()
    }

    async fn site_by_cname(&self, cname: &str) -> Result<Option<Site>> {
        sqlx::query(&format!(
            "SELECT {SITE_COLUMNS} FROM sites WHERE cname = $1 AND deleted_at IS NULL"
        ))
        .bind(cname)
        .fetch_optional(&self.pool)
        .await?
        .as_ref()
        .map(site_from_row)
        .transpose()
    }

    async fn list_sites(&self) -> Result<Vec<Site>> {
        sqlx::query(&format!(
            "SELECT {SITE_COLUMNS} FROM sites WHERE deleted_at IS NULL ORDER BY site_id"
        ))
        .fetch_all(&self.pool)
        .await?
        .iter()
        .map(site_from_row)
        .collect()
    }

    async fn delete_site(&self, id: i64, at: DateTime<Utc>) -> Result<()> {
        sqlx::query("UPDATE sites SET deleted_at = $1 WHERE site_id = $2")
            .bind(at)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn pull_back_first_hit(&self, site_id: i64, at: DateTime<Utc>) -> Result<()> {
        sqlx::query("UPDATE sites SET first_hit_at = $1 WHERE site_id = $2 AND first_hit_at > $1")
            .bind(at)
            .bind(site_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn create_user(&self, site_id: i64, email: &str, access: Access) -> Result<User> {
        let row = sqlx::query(
            "INSERT INTO users (site_id, email, access, created_at) VALUES ($1, $2, $3, $4)
             RETURNING user_id, site_id, email, access, created_at",
        )
        .bind(site_id)
        .bind(email)
        .bind(access.as_str())
        .bind(Utc::now())
        .fetch_one(&self.pool)
        .await?;
        user_from_row(&row)
    }

    async fn user_by_id(&self, id: i64) -> Result<Option<User>> {
        sqlx::query("SELECT user_id, site_id, email, access, created_at FROM users WHERE user_id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .as_ref()
            .map(user_from_row)
            .transpose()
    }

    async fn first_user(&self, site_id: i64) -> Result<Option<User>> {
        sqlx::query(
            "SELECT user_id, site_id, email, access, created_at FROM users
             WHERE site_id = $1 ORDER BY user_id LIMIT 1",
        )
        .bind(site_id)
        .fetch_optional(&self.pool)
        .await?
        .as_ref()
        .map(user_from_row)
        .transpose()
    }

    async fn create_api_token(
        &self,
        site_id: i64,
        user_id: i64,
        name: &str,
        token_hash: &str,
        permissions: Permissions,
    ) -> Result<ApiToken> {
        let row = sqlx::query(
            "INSERT INTO api_tokens (site_id, user_id, name, token, permissions, created_at)
             VALUES ($1, $2, $3, $4, $5, $6)
             RETURNING api_token_id, site_id, user_id, name, permissions, created_at, last_used_at",
        )
        .bind(site_id)
        .bind(user_id)
        .bind(name)
        .bind(token_hash)
        .bind(i64::from(permissions.bits()))
        .bind(Utc::now())
        .fetch_one(&self.pool)
        .await?;
        token_from_row(&row)
    }

    async fn api_token_by_hash(&self, token_hash: &str) -> Result<Option<ApiToken>> {
        sqlx::query(
            "SELECT api_token_id, site_id, user_id, name, permissions, created_at, last_used_at
             FROM api_tokens WHERE token = $1",
        )
        .bind(token_hash)
        .fetch_optional(&self.pool)
        .await?
        .as_ref()
        .map(token_from_row)
        .transpose()
    }

    async fn touch_api_token(&self, id: i64, at: DateTime<Utc>) -> Result<()> {
        sqlx::query("UPDATE api_tokens SET last_used_at = $1 WHERE api_token_id = $2")
            .bind(at)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn get_value(&self, key: &str) -> Result<Option<String>> {
        Ok(sqlx::query_scalar("SELECT value FROM store WHERE key = $1")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?)
    }

    async fn set_value(&self, key: &str, value: &str) -> Result<()> {
        sqlx::query(
            "INSERT INTO store (key, value) VALUES ($1, $2)
             ON CONFLICT (key) DO UPDATE SET value = excluded.value",
        )
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn path_get_or_insert(
        &self,
        site_id: i64,
        path: &str,
        title: &str,
        event: bool,
    ) -> Result<i64> {
        let event = i32::from(event);
        let select = "SELECT path_id FROM paths WHERE site_id = $1 AND path = $2 AND event = $3";
        self.get_or_insert(
            sqlx::query_scalar(select).bind(site_id).bind(path).bind(event),
            sqlx::query_scalar(
                "INSERT INTO paths (site_id, path, event, title) VALUES ($1, $2, $3, $4)
                 ON CONFLICT DO NOTHING RETURNING path_id",
            )
            .bind(site_id)
            .bind(path)
            .bind(event)
            .bind(title),
            sqlx::query_scalar(select).bind(site_id).bind(path).bind(event),
        )
        .await
    }

    async fn browser_get_or_insert(&self, name: &str, version: &str) -> Result<i64> {
        let select = "SELECT browser_id FROM browsers WHERE name = $1 AND version = $2";
        self.get_or_insert(
            sqlx::query_scalar(select).bind(name).bind(version),
            sqlx::query_scalar(
                "INSERT INTO browsers (name, version) VALUES ($1, $2)
                 ON CONFLICT DO NOTHING RETURNING browser_id",
            )
            .bind(name)
            .bind(version),
            sqlx::query_scalar(select).bind(name).bind(version),
        )
        .await
    }

    async fn system_get_or_insert(&self, name: &str, version: &str) -> Result<i64> {
        let select = "SELECT system_id FROM systems WHERE name = $1 AND version = $2";
        self.get_or_insert(
            sqlx::query_scalar(select).bind(name).bind(version),
            sqlx::query_scalar(
                "INSERT INTO systems (name, version) VALUES ($1, $2)
                 ON CONFLICT DO NOTHING RETURNING system_id",
            )
            .bind(name)
            .bind(version),
            sqlx::query_scalar(select).bind(name).bind(version),
        )
        .await
    }

    async fn user_agent_get_or_insert(
        &self,
        ua: &str,
        browser_id: i64,
        system_id: i64,
        bot: u8,
    ) -> Result<i64> {
        let select = "SELECT user_agent_id FROM user_agents WHERE ua = $1";
        self.get_or_insert(
            sqlx::query_scalar(select).bind(ua),
            sqlx::query_scalar(
                "INSERT INTO user_agents (ua, browser_id, system_id, isbot) VALUES ($1, $2, $3, $4)
                 ON CONFLICT DO NOTHING RETURNING user_agent_id",
            )
            .bind(ua)
            .bind(browser_id)
            .bind(system_id)
            .bind(i32::from(bot)),
            sqlx::query_scalar(select).bind(ua),
        )
        .await
    }

    async fn ref_get_or_insert(&self, referrer: &str, scheme: RefScheme) -> Result<i64> {
        if referrer.is_empty() && scheme == RefScheme::Other {
            return Ok(EMPTY_REF_ID);
        }
        let scheme = scheme.as_str();
        let select = "SELECT ref_id FROM refs WHERE lower(ref) = lower($1) AND ref_scheme = $2";
        self.get_or_insert(
            sqlx::query_scalar(select).bind(referrer).bind(scheme),
            sqlx::query_scalar(
                "INSERT INTO refs (ref, ref_scheme) VALUES ($1, $2)
                 ON CONFLICT DO NOTHING RETURNING ref_id",
            )
            .bind(referrer)
            .bind(scheme),
            sqlx::query_scalar(select).bind(referrer).bind(scheme),
        )
        .await
    }

    async fn campaign_get_or_insert(&self, site_id: i64, name: &str) -> Result<i64> {
        let select =
            "SELECT campaign_id FROM campaigns WHERE site_id = $1 AND lower(name) = lower($2)";
        self.get_or_insert(
            sqlx::query_scalar(select).bind(site_id).bind(name),
            sqlx::query_scalar(
                "INSERT INTO campaigns (site_id, name) VALUES ($1, $2)
                 ON CONFLICT DO NOTHING RETURNING campaign_id",
            )
            .bind(site_id)
            .bind(name),
            sqlx::query_scalar(select).bind(site_id).bind(name),
        )
        .await
    }

    async fn insert_hits(&self, site_id: i64, hits: &[Hit]) -> Result<()> {
        if hits.is_empty() {
            return Ok(());
        }
        let mut tx = self.pool.begin().await?;
        for hit in hits {
            sqlx::query(
                "INSERT INTO hits (
                    site_id, path_id, ref_id, user_agent_id, campaign_id,
                    session, bot, size, location, language, first_visit, created_at
                ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)",
            )
            .bind(site_id)
            .bind(hit.path_id)
            .bind(hit.ref_id)
            .bind(hit.user_agent_id)
            .bind(hit.campaign_id)
            .bind(hit.session.map(|s| s.to_string()))
            .bind(i32::from(hit.bot))
            .bind(hit.size.map(|s| s.to_string()).unwrap_or_default())
            .bind(&hit.location)
            .bind(&hit.language)
            .bind(i32::from(hit.first_visit))
            .bind(hit.created_at)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn apply_aggregates(&self, site_id: i64, rows: &[AggregateRow]) -> Result<()> {
        if rows.is_empty() {
            return Ok(());
        }
        let mut tx = self.pool.begin().await?;
        for row in rows {
            Self::apply_row(&mut tx, site_id, row).await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn delete_hits_before(&self, site_id: i64, before: DateTime<Utc>) -> Result<u64> {
        let res = sqlx::query("DELETE FROM hits WHERE site_id = $1 AND created_at < $2")
            .bind(site_id)
            .bind(before)
            .execute(&self.pool)
            .await?;
        Ok(res.rows_affected())
    }

    async fn purge_deleted_sites(&self, before: DateTime<Utc>) -> Result<u64> {
        let mut tx = self.pool.begin().await?;
        let ids: Vec<i64> = sqlx::query_scalar(
            "SELECT site_id FROM sites WHERE deleted_at IS NOT NULL AND deleted_at < $1",
        )
        .bind(before)
        .fetch_all(&mut *tx)
        .await?;
        for id in &ids {
            for table in SITE_TABLES {
                sqlx::query(&format!("DELETE FROM {table} WHERE site_id = $1"))
                    .bind(id)
                    .execute(&mut *tx)
                    .await?;
            }
            sqlx::query("DELETE FROM sites WHERE site_id = $1")
                .bind(id)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(ids.len() as u64)
    }
}
