//! Command line flags.
//!
//! Composite values (`--db`, `--dbconn`, `--ratelimit`) are parsed by
//! `goatcounter_core::config`; this module only maps flags onto [`Config`].

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use clap::{Args, Parser, Subcommand};

pub use goatcounter_core::config::Config;
use goatcounter_core::config::{Database, DbConn, RateLimits};
use goatcounter_core::store::Store;
use goatcounter_store::SqliteStore;

use crate::buffer::BufferConfig;

#[derive(Parser)]
#[command(name = "goatcounter", version, about = "Web analytics ingestion server")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Command>,

    #[command(flatten)]
    pub serve: ServeArgs,
}

#[derive(Subcommand)]
pub enum Command {
    /// Run the HTTP server (the default)
    Serve(ServeArgs),

    /// Run the buffer sidecar in front of a server
    Buffer(BufferArgs),

    /// Query a running server's /status; exits 1 if it doesn't answer 200
    Health {
        #[arg(long, default_value = "http://localhost:8081", env = "GOATCOUNTER_URL")]
        url: String,
    },

    /// Create an API token for a site and print its secret
    Token(TokenArgs),
}

#[derive(Args, Debug, Clone)]
pub struct ServeArgs {
    /// Address to listen on
    #[arg(long, default_value = "localhost:8081", env = "GOATCOUNTER_LISTEN")]
    pub listen: String,

    /// sqlite+PATH or postgres+DSN
    #[arg(long, default_value = "sqlite+db/goatcounter.sqlite3", env = "GOATCOUNTER_DB")]
    pub db: String,

    /// Connection pool size as max_open,max_idle
    #[arg(long, default_value = "16,4", env = "GOATCOUNTER_DBCONN")]
    pub dbconn: String,

    /// Seconds between persisting queued hits
    #[arg(long, default_value_t = 10, env = "GOATCOUNTER_STORE_EVERY")]
    pub store_every: u64,

    /// Override rate limits, e.g. count:10/1,api-count:100/60
    #[arg(long, default_value = "", env = "GOATCOUNTER_RATELIMIT")]
    pub ratelimit: String,

    /// Most hits accepted in one /api/v0/count request
    #[arg(long, default_value_t = 500, env = "GOATCOUNTER_API_MAX")]
    pub api_max: usize,

    /// Serve domain; sites without a cname are found at <code>.<domain>
    #[arg(long, default_value = "localhost", env = "GOATCOUNTER_DOMAIN")]
    pub domain: String,

    /// MaxMind GeoIP2/GeoLite2 country database
    #[arg(long, env = "GOATCOUNTER_GEODB")]
    pub geodb: Option<String>,

    /// Request timeout for /count, in seconds
    #[arg(long, default_value_t = 3, env = "GOATCOUNTER_COUNT_TIMEOUT")]
    pub count_timeout: u64,

    /// Request timeout for the API, in seconds
    #[arg(long, default_value_t = 15, env = "GOATCOUNTER_API_TIMEOUT")]
    pub api_timeout: u64,
}

impl ServeArgs {
    pub fn into_config(self) -> Result<Config> {
        let config = Config {
            listen: self.listen,
            db: Database::parse(&self.db)?,
            db_conn: DbConn::parse(&self.dbconn)?,
            domain: self.domain.trim().to_ascii_lowercase(),
            store_every: Duration::from_secs(self.store_every),
            rate_limits: RateLimits::parse(&self.ratelimit)?,
            api_max: self.api_max,
            geodb: self.geodb.filter(|p| !p.is_empty()),
            count_timeout: Duration::from_secs(self.count_timeout),
            api_timeout: Duration::from_secs(self.api_timeout),
        };
        config.validate()?;
        Ok(config)
    }
}

#[derive(Args, Debug, Clone)]
pub struct BufferArgs {
    /// Address to listen on
    #[arg(long, default_value = "localhost:8082", env = "GOATCOUNTER_BUFFER_LISTEN")]
    pub listen: String,

    /// Base URL of the server to forward to
    #[arg(long, default_value = "http://localhost:8081", env = "GOATCOUNTER_BUFFER_BACKEND")]
    pub backend: String,

    /// Most hits held while the backend is down
    #[arg(long, default_value_t = 500_000, env = "GOATCOUNTER_BUFSIZE")]
    pub bufsize: usize,

    /// Don't log every forwarded batch
    #[arg(long)]
    pub silent: bool,

    /// Store a new shared secret in the database, print it, and exit
    #[arg(long)]
    pub generate_key: bool,

    /// Database used by --generate-key
    #[arg(long, default_value = "sqlite+db/goatcounter.sqlite3", env = "GOATCOUNTER_DB")]
    pub db: String,

    /// Shared secret, as printed by --generate-key
    #[arg(long, env = "GOATCOUNTER_BUFFER_SECRET", hide_env_values = true)]
    pub secret: Option<String>,
}

impl BufferArgs {
    pub fn into_config(self) -> Result<BufferConfig> {
        let Some(secret) = self.secret.filter(|s| !s.is_empty()) else {
            bail!("GOATCOUNTER_BUFFER_SECRET is not set; create one with --generate-key");
        };
        if self.bufsize == 0 {
            bail!("invalid value for --bufsize: must be at least 1");
        }
        Ok(BufferConfig {
            listen: self.listen,
            backend: self.backend.trim_end_matches('/').to_string(),
            bufsize: self.bufsize,
            secret,
            silent: self.silent,
            ..BufferConfig::default()
        })
    }
}

#[derive(Args, Debug, Clone)]
pub struct TokenArgs {
    #[arg(long, default_value = "sqlite+db/goatcounter.sqlite3", env = "GOATCOUNTER_DB")]
    pub db: String,

    /// Site code
    #[arg(long, default_value = "default")]
    pub site: String,

    /// Token name
    #[arg(long, default_value = "api")]
    pub name: String,

    /// Comma-separated permissions: count, export, site_read, site_create,
    /// site_update, stats
    #[arg(long, default_value = "count")]
    pub perm: String,
}

/// Open the configured database and apply the schema.
pub async fn open_store(db: &Database, conn: DbConn) -> Result<Arc<dyn Store>> {
    match db {
        Database::Sqlite(path) => Ok(Arc::new(SqliteStore::open(path)?)),
        #[cfg(feature = "postgres")]
        Database::Postgres(dsn) => Ok(Arc::new(
            goatcounter_store::PgStore::connect(dsn, conn).await?,
        )),
        #[cfg(not(feature = "postgres"))]
        Database::Postgres(_) => {
            let _ = conn;
            bail!("PostgreSQL support is not compiled in; rebuild with --features postgres")
        }
    }
}
