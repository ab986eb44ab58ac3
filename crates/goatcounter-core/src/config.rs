use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use crate::error::CoreError;

/// Which database to open.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Database {
    Sqlite(String),
    Postgres(String),
}

impl Database {
    /// Parse `sqlite+PATH` or `postgres+DSN`.
    pub fn parse(s: &str) -> Result<Self, CoreError> {
        let err = |reason: &str| CoreError::Flag {
            flag: "db",
            reason: reason.to_string(),
        };
        let (engine, rest) = s
            .split_once('+')
            .ok_or_else(|| err("must be sqlite+PATH or postgres+DSN"))?;
        if rest.is_empty() {
            return Err(err("connection string is empty"));
        }
        match engine {
            "sqlite" | "sqlite3" => Ok(Database::Sqlite(rest.to_string())),
            "postgres" | "postgresql" => Ok(Database::Postgres(rest.to_string())),
            other => Err(err(&format!("unknown engine {other:?}"))),
        }
    }
}

impl fmt::Display for Database {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Database::Sqlite(p) => write!(f, "sqlite+{p}"),
            // Don't print credentials.
            Database::Postgres(_) => f.write_str("postgres+…"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DbConn {
    pub max_open: u32,
    pub max_idle: u32,
}

impl Default for DbConn {
    fn default() -> Self {
        Self {
            max_open: 16,
            max_idle: 4,
        }
    }
}

impl DbConn {
    /// Parse `max_open,max_idle`.
    pub fn parse(s: &str) -> Result<Self, CoreError> {
        let err = |reason: String| CoreError::Flag {
            flag: "dbconn",
            reason,
        };
        let (open, idle) = s
            .split_once(',')
            .ok_or_else(|| err("must be max_open,max_idle".into()))?;
        let max_open: u32 = open
            .trim()
            .parse()
            .map_err(|e| err(format!("max_open: {e}")))?;
        let max_idle: u32 = idle
            .trim()
            .parse()
            .map_err(|e| err(format!("max_idle: {e}")))?;
        if max_open == 0 {
            return Err(err("max_open must be at least 1".into()));
        }
        Ok(Self { max_open, max_idle })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum RateLimitClass {
    Count,
    Api,
    ApiCount,
    Export,
    Login,
}

impl RateLimitClass {
    pub const ALL: [RateLimitClass; 5] = [
        RateLimitClass::Count,
        RateLimitClass::Api,
        RateLimitClass::ApiCount,
        RateLimitClass::Export,
        RateLimitClass::Login,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            RateLimitClass::Count => "count",
            RateLimitClass::Api => "api",
            RateLimitClass::ApiCount => "api-count",
            RateLimitClass::Export => "export",
            RateLimitClass::Login => "login",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|c| c.name() == name)
    }
}

/// `requests` are allowed per `per` window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Limit {
    pub requests: u32,
    pub per: Duration,
}

impl Limit {
    pub const fn new(requests: u32, per_secs: u64) -> Self {
        Self {
            requests,
            per: Duration::from_secs(per_secs),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimits(HashMap<RateLimitClass, Limit>);

impl Default for RateLimits {
    fn default() -> Self {
        Self(HashMap::from([
            (RateLimitClass::Count, Limit::new(4, 1)),
            (RateLimitClass::Api, Limit::new(4, 1)),
            (RateLimitClass::ApiCount, Limit::new(60, 120)),
            (RateLimitClass::Export, Limit::new(1, 3600)),
            (RateLimitClass::Login, Limit::new(20, 60)),
        ]))
    }
}

impl RateLimits {
    pub fn get(&self, class: RateLimitClass) -> Limit {
        self.0
            .get(&class)
            .copied()
            .unwrap_or_else(|| RateLimits::default().0[&class])
    }

    pub fn set(&mut self, class: RateLimitClass, limit: Limit) {
        self.0.insert(class, limit);
    }

    /// Parse `name:requests/seconds,…` on top of the defaults.
    pub fn parse(s: &str) -> Result<Self, CoreError> {
        let err = |reason: String| CoreError::Flag {
            flag: "ratelimit",
            reason,
        };
        let mut limits = Self::default();
        for item in s.split(',').map(str::trim).filter(|i| !i.is_empty()) {
            let (name, rate) = item
                .split_once(':')
                .ok_or_else(|| err(format!("{item:?}: missing ':'")))?;
            let class = RateLimitClass::from_name(name.trim())
                .ok_or_else(|| err(format!("unknown limit {name:?}")))?;
            let (req, secs) = rate
                .split_once('/')
                .ok_or_else(|| err(format!("{item:?}: must be requests/seconds")))?;
            let requests: u32 = req
                .trim()
                .parse()
                .map_err(|e| err(format!("{item:?}: {e}")))?;
            let secs: u64 = secs
                .trim()
                .parse()
                .map_err(|e| err(format!("{item:?}: {e}")))?;
            if requests == 0 || secs == 0 {
                return Err(err(format!("{item:?}: values must be at least 1")));
            }
            limits.set(class, Limit::new(requests, secs));
        }
        Ok(limits)
    }
}

/// Queue depth at which the batch API persists inline before accepting more.
pub const PERSIST_PRESSURE: usize = 5000;

/// Runtime configuration for the main server.
#[derive(Debug, Clone)]
pub struct Config {
    pub listen: String,
    pub db: Database,
    pub db_conn: DbConn,
    /// Serve domain; sites are reachable as `<code>.<domain>`.
    pub domain: String,
    pub store_every: Duration,
    pub rate_limits: RateLimits,
    pub api_max: usize,
    pub geodb: Option<String>,
    pub count_timeout: Duration,
    pub api_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen: "localhost:8081".to_string(),
            db: Database::Sqlite("db/goatcounter.sqlite3".to_string()),
            db_conn: DbConn::default(),
            domain: "localhost".to_string(),
            store_every: Duration::from_secs(10),
            rate_limits: RateLimits::default(),
            api_max: 500,
            geodb: None,
            count_timeout: Duration::from_secs(3),
            api_timeout: Duration::from_secs(15),
        }
    }
}

impl Config {
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.store_every < Duration::from_secs(1) {
            return Err(CoreError::Flag {
                flag: "store-every",
                reason: "must be at least 1 second".into(),
            });
        }
        if self.api_max == 0 {
            return Err(CoreError::Flag {
                flag: "api-max",
                reason: "must be at least 1".into(),
            });
        }
        Ok(())
    }
}
