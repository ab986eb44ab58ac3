//! Storage abstraction.
//!
//! The ingestion pipeline only talks to the database through [`Store`], so the
//! same Memstore and cron code runs against SQLite and PostgreSQL.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::aggregate::AggregateRow;
use crate::clean::RefScheme;
use crate::hit::Hit;
use crate::site::{Access, ApiToken, Permissions, Site, SiteSettings, User};

#[async_trait]
pub trait Store: Send + Sync {
    /// Short name for `/status`, e.g. `"sqlite3"`.
    fn kind(&self) -> &'static str;

    async fn ping(&self) -> Result<()>;

    // Sites.
    async fn create_site(
        &self,
        code: &str,
        cname: Option<&str>,
        settings: &SiteSettings,
    ) -> Result<Site>;
    async fn site_by_id(&self, id: i64) -> Result<Option<Site>>;
    async fn site_by_code(&self, code: &str) -> Result<Option<Site>>;
    async fn site_by_cname(&self, cname: &str) -> Result<Option<Site>>;
    async fn list_sites(&self) -> Result<Vec<Site>>;
    /// Mark a site deleted; its data is removed by the vacuum job later.
    async fn delete_site(&self, id: i64, at: DateTime<Utc>) -> Result<()>;
    /// Move `first_hit_at` back to `at` if that is earlier.
    async fn pull_back_first_hit(&self, site_id: i64, at: DateTime<Utc>) -> Result<()>;

    // Users and tokens.
    async fn create_user(&self, site_id: i64, email: &str, access: Access) -> Result<User>;
    async fn user_by_id(&self, id: i64) -> Result<Option<User>>;
    async fn first_user(&self, site_id: i64) -> Result<Option<User>>;
    async fn create_api_token(
        &self,
        site_id: i64,
        user_id: i64,
        name: &str,
        token_hash: &str,
        permissions: Permissions,
    ) -> Result<ApiToken>;
    async fn api_token_by_hash(&self, token_hash: &str) -> Result<Option<ApiToken>>;
    async fn touch_api_token(&self, id: i64, at: DateTime<Utc>) -> Result<()>;

    // Key/value settings.
    async fn get_value(&self, key: &str) -> Result<Option<String>>;
    async fn set_value(&self, key: &str, value: &str) -> Result<()>;

    // Surrogate IDs; each returns the existing row if there is one.
    async fn path_get_or_insert(&self, site_id: i64, path: &str, title: &str, event: bool)
        -> Result<i64>;
    async fn browser_get_or_insert(&self, name: &str, version: &str) -> Result<i64>;
    async fn system_get_or_insert(&self, name: &str, version: &str) -> Result<i64>;
    async fn user_agent_get_or_insert(
        &self,
        ua: &str,
        browser_id: i64,
        system_id: i64,
        bot: u8,
    ) -> Result<i64>;
    async fn ref_get_or_insert(&self, referrer: &str, scheme: RefScheme) -> Result<i64>;
    async fn campaign_get_or_insert(&self, site_id: i64, name: &str) -> Result<i64>;

    /// Insert resolved hits for one site in a single transaction.
    async fn insert_hits(&self, site_id: i64, hits: &[Hit]) -> Result<()>;

    /// Add counter deltas for one site in a single transaction.
    async fn apply_aggregates(&self, site_id: i64, rows: &[AggregateRow]) -> Result<()>;

    // Vacuum.
    async fn delete_hits_before(&self, site_id: i64, before: DateTime<Utc>) -> Result<u64>;
    /// Remove every row belonging to sites deleted before `before`.
    async fn purge_deleted_sites(&self, before: DateTime<Utc>) -> Result<u64>;
}
