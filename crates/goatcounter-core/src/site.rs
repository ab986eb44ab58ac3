use std::fmt;
use std::net::IpAddr;
use std::ops::BitOr;

use chrono::{DateTime, Utc};
use ipnet::IpNet;
use serde::{Deserialize, Serialize};

use crate::error::CoreError;

/// Which data a site collects, as a bitmask.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Collect(u32);

impl Collect {
    pub const HITS: Self = Self(1 << 0);
    pub const LANGUAGE: Self = Self(1 << 1);
    pub const LOCATION: Self = Self(1 << 2);
    pub const SIZE: Self = Self(1 << 3);
    pub const REFERRER: Self = Self(1 << 4);
    pub const USER_AGENT: Self = Self(1 << 5);
    pub const SESSIONS: Self = Self(1 << 6);

    pub const fn empty() -> Self {
        Self(0)
    }

    pub const fn all() -> Self {
        Self(0b111_1111)
    }

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub const fn has(self, flag: Self) -> bool {
        self.0 & flag.0 == flag.0
    }

    pub fn without(self, flag: Self) -> Self {
        Self(self.0 & !flag.0)
    }
}

impl Default for Collect {
    fn default() -> Self {
        Self::all()
    }
}

impl BitOr for Collect {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SiteSettings {
    pub collect: Collect,
    /// Single addresses or CIDR networks.
    pub ignore_ips: Vec<String>,
    pub allow_embed: Vec<String>,
    pub number_format: char,
    pub timezone: String,
    /// Days of raw hits to keep; 0 keeps them forever.
    pub keep_hits: u32,
}

impl Default for SiteSettings {
    fn default() -> Self {
        Self {
            collect: Collect::default(),
            ignore_ips: Vec::new(),
            allow_embed: Vec::new(),
            number_format: '\u{202f}',
            timezone: "UTC".to_string(),
            keep_hits: 0,
        }
    }
}

impl SiteSettings {
    pub fn validate(&self) -> Result<(), CoreError> {
        self.timezone
            .parse::<chrono_tz::Tz>()
            .map_err(|_| CoreError::InvalidTimezone(self.timezone.clone()))?;
        Ok(())
    }

    /// Return the matching ignore entry, if `ip` is ignored.
    pub fn ignored_ip(&self, ip: &str) -> Option<&str> {
        let addr: Option<IpAddr> = ip.parse().ok();
        self.ignore_ips.iter().map(String::as_str).find(|entry| {
            if *entry == ip {
                return true;
            }
            match (entry.parse::<IpNet>(), addr) {
                (Ok(net), Some(a)) => net.contains(&a),
                _ => matches!((entry.parse::<IpAddr>(), addr), (Ok(e), Some(a)) if e == a),
            }
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Site {
    pub id: i64,
    pub parent: Option<i64>,
    pub code: String,
    pub cname: Option<String>,
    pub settings: SiteSettings,
    pub first_hit_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Access {
    Readonly,
    Settings,
    Admin,
    Superuser,
}

impl Access {
    pub fn as_str(&self) -> &'static str {
        match self {
            Access::Readonly => "readonly",
            Access::Settings => "settings",
            Access::Admin => "admin",
            Access::Superuser => "superuser",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "readonly" => Some(Access::Readonly),
            "settings" => Some(Access::Settings),
            "admin" => Some(Access::Admin),
            "superuser" => Some(Access::Superuser),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub id: i64,
    pub site_id: i64,
    pub email: String,
    pub access: Access,
    pub created_at: DateTime<Utc>,
}

/// API token permissions as a bitmask.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Permissions(u32);

impl Permissions {
    pub const COUNT: Self = Self(2);
    pub const EXPORT: Self = Self(4);
    pub const SITE_READ: Self = Self(8);
    pub const SITE_CREATE: Self = Self(16);
    pub const SITE_UPDATE: Self = Self(32);
    pub const STATS: Self = Self(64);

    const NAMES: [(&'static str, Permissions); 6] = [
        ("count", Self::COUNT),
        ("export", Self::EXPORT),
        ("site_read", Self::SITE_READ),
        ("site_create", Self::SITE_CREATE),
        ("site_update", Self::SITE_UPDATE),
        ("stats", Self::STATS),
    ];

    pub const fn empty() -> Self {
        Self(0)
    }

    pub const fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub const fn has(self, p: Self) -> bool {
        self.0 & p.0 == p.0
    }

    /// Parse a comma-separated list such as `count,export`.
    pub fn parse_list(s: &str) -> Result<Self, String> {
        s.split(',')
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .try_fold(Self::empty(), |acc, name| {
                Self::NAMES
                    .iter()
                    .find(|(n, _)| *n == name)
                    .map(|(_, p)| acc | *p)
                    .ok_or_else(|| format!("unknown permission {name:?}"))
            })
    }
}

impl BitOr for Permissions {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl fmt::Display for Permissions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = Self::NAMES
            .iter()
            .filter(|(_, p)| self.has(*p))
            .map(|(n, _)| *n)
            .collect();
        f.write_str(&names.join(","))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiToken {
    pub id: i64,
    pub site_id: i64,
    pub user_id: i64,
    pub name: String,
    pub permissions: Permissions,
    pub created_at: DateTime<Utc>,
    pub last_used_at: Option<DateTime<Utc>>,
}
