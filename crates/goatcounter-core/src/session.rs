//! Session fingerprinting.
//!
//! A visitor is identified by `sha256(site ∥ ip ∥ ua ∥ salt)` truncated to 16
//! bytes. Two salts are live at a time: the current one mints new sessions,
//! the previous one is only consulted on lookup so sessions survive a single
//! rotation. Nothing here is persisted; a restart starts every visitor over.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::str::FromStr;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use chrono::{DateTime, Utc};
use rand::RngCore;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};

/// How often the salt is replaced, in seconds.
pub const SALT_ROTATE_EVERY: i64 = 4 * 3600;

/// Sessions not seen for this many seconds are dropped by
/// [`Sessions::evict_idle`].
pub const SESSION_IDLE: i64 = 8 * 3600;

pub type Salt = [u8; 16];
pub type SessionKey = [u8; 16];

/// Opaque 128-bit session identifier, rendered as 32 hex digits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(pub u128);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:032x}", self.0)
    }
}

impl FromStr for SessionId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        u128::from_str_radix(s, 16).map(SessionId)
    }
}

impl Serialize for SessionId {
    fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for SessionId {
    fn deserialize<D: Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(d)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

#[derive(Debug, Clone, Copy)]
struct KeyEntry {
    id: SessionId,
    /// Salt generation the key was minted under; `None` for client keys,
    /// which don't depend on the salt.
    generation: Option<u64>,
}

#[derive(Debug)]
pub struct Sessions {
    cur_salt: Salt,
    prev_salt: Salt,
    salt_rotated_at: DateTime<Utc>,
    generation: u64,
    next_id: u128,
    by_hash: HashMap<SessionKey, KeyEntry>,
    by_id: HashMap<SessionId, SessionKey>,
    seen_paths: HashMap<SessionId, HashSet<i64>>,
    last_seen: HashMap<SessionId, i64>,
}

fn random_salt() -> Salt {
    let mut salt = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut salt);
    salt
}

fn truncate(digest: &[u8]) -> SessionKey {
    let mut key = [0u8; 16];
    key.copy_from_slice(&digest[..16]);
    key
}

fn fingerprint(site_id: i64, ip: &str, ua: &str, salt: &Salt) -> SessionKey {
    let mut h = Sha256::new();
    h.update(site_id.to_be_bytes());
    h.update(ip.as_bytes());
    h.update([0]);
    h.update(ua.as_bytes());
    h.update([0]);
    h.update(salt);
    truncate(&h.finalize())
}

fn client_fingerprint(site_id: i64, client_key: &str) -> SessionKey {
    let mut h = Sha256::new();
    h.update(site_id.to_be_bytes());
    h.update(client_key.as_bytes());
    truncate(&h.finalize())
}

impl Sessions {
    /// Start with fresh random salts and a random ID seed.
    pub fn new(now: DateTime<Utc>) -> Self {
        let seed = u128::from(rand::random::<u64>()) << 64;
        Self::with_seed(seed, now)
    }

    /// Deterministic IDs starting at `seed + 1`.
    pub fn with_seed(seed: u128, now: DateTime<Utc>) -> Self {
        Self {
            cur_salt: random_salt(),
            prev_salt: random_salt(),
            salt_rotated_at: now,
            generation: 0,
            next_id: seed,
            by_hash: HashMap::new(),
            by_id: HashMap::new(),
            seen_paths: HashMap::new(),
            last_seen: HashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }

    pub fn salt_rotated_at(&self) -> DateTime<Utc> {
        self.salt_rotated_at
    }

    pub fn salts(&self) -> (Salt, Salt) {
        (self.cur_salt, self.prev_salt)
    }

    /// Return the session for this visitor and whether `path_id` is new to it.
    ///
    /// A non-empty `client_key` replaces the IP/UA fingerprint and ignores
    /// the salts. Rotates the salt first if it is due.
    pub fn session_or_first(
        &mut self,
        site_id: i64,
        ua: &str,
        ip: &str,
        client_key: Option<&str>,
        path_id: i64,
        now: DateTime<Utc>,
    ) -> (SessionId, bool) {
        self.rotate_if_due(now);

        let id = match client_key.filter(|k| !k.is_empty()) {
            Some(k) => {
                let key = client_fingerprint(site_id, k);
                match self.by_hash.get(&key) {
                    Some(e) => e.id,
                    None => self.register(key, None),
                }
            }
            None => {
                let cur = fingerprint(site_id, ip, ua, &self.cur_salt);
                if let Some(e) = self.by_hash.get(&cur) {
                    e.id
                } else {
                    let prev = fingerprint(site_id, ip, ua, &self.prev_salt);
                    match self.by_hash.get(&prev) {
                        Some(e) => e.id,
                        None => self.register(cur, Some(self.generation)),
                    }
                }
            }
        };

        self.last_seen.insert(id, now.timestamp());
        let first = self.seen_paths.entry(id).or_default().insert(path_id);
        (id, first)
    }

    fn register(&mut self, key: SessionKey, generation: Option<u64>) -> SessionId {
        self.next_id = self.next_id.wrapping_add(1);
        let id = SessionId(self.next_id);
        self.by_hash.insert(key, KeyEntry { id, generation });
        self.by_id.insert(id, key);
        self.seen_paths.insert(id, HashSet::new());
        id
    }

    fn remove(&mut self, id: SessionId) {
        if let Some(key) = self.by_id.remove(&id) {
            self.by_hash.remove(&key);
        }
        self.seen_paths.remove(&id);
        self.last_seen.remove(&id);
    }

    /// Rotate when [`SALT_ROTATE_EVERY`] has passed since the last rotation.
    pub fn rotate_if_due(&mut self, now: DateTime<Utc>) -> bool {
        if (now - self.salt_rotated_at).num_seconds() < SALT_ROTATE_EVERY {
            return false;
        }
        self.rotate(now);
        true
    }

    /// Move the current salt to previous and mint a new one. Sessions keyed by
    /// the salt that fell out are dropped.
    pub fn rotate(&mut self, now: DateTime<Utc>) {
        self.prev_salt = self.cur_salt;
        self.cur_salt = random_salt();
        self.salt_rotated_at = now;
        self.generation += 1;

        let oldest_live = self.generation - 1;
        let expired: Vec<SessionId> = self
            .by_hash
            .values()
            .filter(|e| e.generation.is_some_and(|g| g < oldest_live))
            .map(|e| e.id)
            .collect();
        for id in expired {
            self.remove(id);
        }
    }

    /// Drop sessions idle for longer than [`SESSION_IDLE`]. Returns how many
    /// were removed.
    pub fn evict_idle(&mut self, now: DateTime<Utc>) -> usize {
        let cutoff = now.timestamp() - SESSION_IDLE;
        let idle: Vec<SessionId> = self
            .last_seen
            .iter()
            .filter(|(_, &seen)| seen < cutoff)
            .map(|(&id, _)| id)
            .collect();
        for &id in &idle {
            self.remove(id);
        }
        idle.len()
    }

    /// TOML rendering of the session table for debugging.
    pub fn dump_toml(&self) -> Result<String, toml::ser::Error> {
        let mut sessions: Vec<DumpSession> = self
            .by_id
            .iter()
            .map(|(id, key)| {
                let mut paths: Vec<i64> = self
                    .seen_paths
                    .get(id)
                    .map(|p| p.iter().copied().collect())
                    .unwrap_or_default();
                paths.sort_unstable();
                DumpSession {
                    id: id.to_string(),
                    key: hex::encode(key),
                    last_seen: self.last_seen.get(id).copied().unwrap_or_default(),
                    paths,
                }
            })
            .collect();
        sessions.sort_by(|a, b| a.id.cmp(&b.id));

        toml::to_string(&Dump {
            cur_salt: BASE64.encode(self.cur_salt),
            prev_salt: BASE64.encode(self.prev_salt),
            salt_rotated: self.salt_rotated_at.to_rfc3339(),
            sessions,
        })
    }

    #[cfg(test)]
    fn check_consistency(&self) {
        for (key, e) in &self.by_hash {
            assert_eq!(self.by_id.get(&e.id), Some(key), "by_hash entry without by_id");
        }
        for id in self.by_id.keys() {
            assert!(self.seen_paths.contains_key(id), "by_id entry without seen_paths");
        }
        assert_eq!(self.seen_paths.len(), self.by_id.len());
    }
}

#[derive(Serialize)]
struct Dump {
    cur_salt: String,
    prev_salt: String,
    salt_rotated: String,
    sessions: Vec<DumpSession>,
}

#[derive(Serialize)]
struct DumpSession {
    id: String,
    key: String,
    last_seen: i64,
    paths: Vec<i64>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    const UA: &str = "Mozilla/5.0 (Linux) Firefox/1";

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2020, 6, 18, 12, 0, 0).unwrap()
    }

    #[test]
    fn same_visitor_same_path_is_first_once() {
        let mut s = Sessions::with_seed(0, t0());
        let (a, first_a) = s.session_or_first(1, UA, "1.1.1.1", None, 10, t0());
        let (b, first_b) = s.session_or_first(1, UA, "1.1.1.1", None, 10, t0());
        assert_eq!(a, b);
        assert!(first_a);
        assert!(!first_b);
        assert_eq!(s.len(), 1);
        s.check_consistency();
    }

    #[test]
    fn different_ip_is_different_session() {
        let mut s = Sessions::with_seed(0, t0());
        let (a, fa) = s.session_or_first(1, UA, "1.1.1.1", None, 10, t0());
        let (b, fb) = s.session_or_first(1, UA, "1.1.1.2", None, 10, t0());
        let (c, fc) = s.session_or_first(1, UA, "1.1.1.1", None, 10, t0());
        assert_ne!(a, b);
        assert_eq!(a, c);
        assert!(fa && fb && !fc);
        assert_eq!(s.len(), 2);
    }

    #[test]
    fn new_path_in_same_session_is_first() {
        let mut s = Sessions::with_seed(0, t0());
        let (a, _) = s.session_or_first(1, UA, "1.1.1.1", None, 10, t0());
        let (b, first) = s.session_or_first(1, UA, "1.1.1.1", None, 11, t0());
        assert_eq!(a, b);
        assert!(first);
    }

    #[test]
    fn sites_do_not_share_sessions() {
        let mut s = Sessions::with_seed(0, t0());
        let (a, _) = s.session_or_first(1, UA, "1.1.1.1", None, 10, t0());
        let (b, _) = s.session_or_first(2, UA, "1.1.1.1", None, 10, t0());
        assert_ne!(a, b);
    }

    #[test]
    fn ids_are_monotonic_from_seed() {
        let mut s = Sessions::with_seed(41, t0());
        let (a, _) = s.session_or_first(1, UA, "1.1.1.1", None, 1, t0());
        let (b, _) = s.session_or_first(1, UA, "1.1.1.2", None, 1, t0());
        assert_eq!(a, SessionId(42));
        assert_eq!(b, SessionId(43));
        assert_eq!(a.to_string(), format!("{:032x}", 42));
    }

    #[test]
    fn client_key_ignores_ip_and_salt() {
        let mut s = Sessions::with_seed(0, t0());
        let (a, _) = s.session_or_first(1, "", "", Some("abc"), 10, t0());
        let (b, first) = s.session_or_first(1, UA, "9.9.9.9", Some("abc"), 10, t0());
        assert_eq!(a, b);
        assert!(!first);

        // Survives two rotations; only idleness removes it.
        let later = t0() + Duration::hours(9);
        s.rotate(t0() + Duration::hours(4));
        s.rotate(later);
        let (c, _) = s.session_or_first(1, "", "", Some("abc"), 10, later);
        assert_eq!(a, c);
    }

    #[test]
    fn salt_rotation_keeps_previous_window() {
        let mut s = Sessions::with_seed(0, t0());
        let (x, _) = s.session_or_first(1, UA, "1.1.1.1", None, 10, t0());
        let (cur_before, _) = s.salts();

        let t1 = t0() + Duration::hours(4) + Duration::seconds(1);
        let (x2, first) = s.session_or_first(1, UA, "1.1.1.1", None, 10, t1);
        let (cur_after, prev_after) = s.salts();
        assert_ne!(cur_before, cur_after, "rotation must mint a new salt");
        assert_eq!(prev_after, cur_before);
        assert_eq!(x, x2, "previous salt still recognised");
        assert!(!first);

        let t2 = t0() + Duration::hours(8) + Duration::seconds(2);
        let (y, first) = s.session_or_first(1, UA, "1.1.1.1", None, 10, t2);
        assert_ne!(x, y, "both salts rotated out");
        assert!(first);
        s.check_consistency();
    }

    #[test]
    fn no_rotation_before_due() {
        let mut s = Sessions::with_seed(0, t0());
        assert!(!s.rotate_if_due(t0() + Duration::hours(3)));
        assert!(s.rotate_if_due(t0() + Duration::hours(4)));
        assert_eq!(s.salt_rotated_at(), t0() + Duration::hours(4));
    }

    #[test]
    fn evicts_idle_sessions() {
        let mut s = Sessions::with_seed(0, t0());
        s.session_or_first(1, "", "", Some("old"), 1, t0());
        let later = t0() + Duration::hours(7);
        s.session_or_first(1, "", "", Some("new"), 1, later);

        assert_eq!(s.evict_idle(t0() + Duration::hours(8) + Duration::seconds(1)), 1);
        assert_eq!(s.len(), 1);
        s.check_consistency();
    }

    #[test]
    fn dump_is_toml() {
        let mut s = Sessions::with_seed(0, t0());
        s.session_or_first(1, UA, "1.1.1.1", None, 7, t0());
        let out = s.dump_toml().unwrap();
        let parsed: toml::Value = toml::from_str(&out).unwrap();
        let cur = parsed["cur_salt"].as_str().unwrap();
        assert_eq!(BASE64.decode(cur).unwrap().len(), 16);
        assert_eq!(parsed["salt_rotated"].as_str().unwrap(), t0().to_rfc3339());
        assert_eq!(parsed["sessions"].as_array().unwrap().len(), 1);
    }
}
