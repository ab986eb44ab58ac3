//! Location and language lookups for incoming hits.

use std::net::IpAddr;
use std::path::Path;

use anyhow::Result;
use tracing::{info, warn};

/// Country lookup backed by an optional MaxMind database. Without a database
/// every lookup returns an empty location.
pub struct Geo {
    reader: Option<maxminddb::Reader<Vec<u8>>>,
}

impl Geo {
    pub fn disabled() -> Self {
        Self { reader: None }
    }

    /// Open the database at `path`. A missing file is logged and leaves
    /// lookups disabled; a corrupt one is an error.
    pub fn open(path: Option<&str>) -> Result<Self> {
        let Some(path) = path else {
            return Ok(Self::disabled());
        };
        if !Path::new(path).exists() {
            warn!(geodb = %path, "GeoIP database not found; locations will be empty");
            return Ok(Self::disabled());
        }
        let reader = maxminddb::Reader::open_readfile(path)?;
        info!(geodb = %path, "GeoIP database loaded");
        Ok(Self {
            reader: Some(reader),
        })
    }

    /// ISO 3166-1 alpha-2 code for `ip`, or an empty string.
    pub fn lookup(&self, ip: &str) -> String {
        let Some(reader) = &self.reader else {
            return String::new();
        };
        let Ok(addr) = ip.parse::<IpAddr>() else {
            return String::new();
        };
        reader
            .lookup::<maxminddb::geoip2::Country>(addr)
            .ok()
            .and_then(|r| r.country)
            .and_then(|c| c.iso_code)
            .map(str::to_string)
            .unwrap_or_default()
    }
}

const ISO_639_3: &[(&str, &str)] = &[
    ("ar", "ara"),
    ("bg", "bul"),
    ("cs", "ces"),
    ("da", "dan"),
    ("de", "deu"),
    ("el", "ell"),
    ("en", "eng"),
    ("es", "spa"),
    ("et", "est"),
    ("fa", "fas"),
    ("fi", "fin"),
    ("fr", "fra"),
    ("he", "heb"),
    ("hi", "hin"),
    ("hr", "hrv"),
    ("hu", "hun"),
    ("id", "ind"),
    ("it", "ita"),
    ("ja", "jpn"),
    ("ko", "kor"),
    ("lt", "lit"),
    ("lv", "lav"),
    ("nb", "nob"),
    ("nl", "nld"),
    ("no", "nor"),
    ("pl", "pol"),
    ("pt", "por"),
    ("ro", "ron"),
    ("ru", "rus"),
    ("sk", "slk"),
    ("sl", "slv"),
    ("sr", "srp"),
    ("sv", "swe"),
    ("th", "tha"),
    ("tr", "tur"),
    ("uk", "ukr"),
    ("vi", "vie"),
    ("zh", "zho"),
];

/// ISO 639-3 code of the preferred language in an `Accept-Language` header.
pub fn language(accept_language: &str) -> Option<String> {
    let first = accept_language
        .split(',')
        .map(|part| part.split(';').next().unwrap_or_default().trim())
        .find(|tag| !tag.is_empty() && *tag != "*")?;
    let primary = first
        .split(['-', '_'])
        .next()
        .unwrap_or_default()
        .to_ascii_lowercase();
    if primary.len() == 3 && primary.chars().all(|c| c.is_ascii_lowercase()) {
        return Some(primary);
    }
    ISO_639_3
        .iter()
        .find(|(two, _)| *two == primary)
        .map(|(_, three)| three.to_string())
}
