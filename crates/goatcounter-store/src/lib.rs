pub mod schema;
pub mod sqlite;

#[cfg(feature = "postgres")]
pub mod postgres;

pub use sqlite::SqliteStore;

#[cfg(feature = "postgres")]
pub use postgres::PgStore;

/// Re-export `rusqlite` so tests can inspect rows without an extra dependency.
pub use rusqlite;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("already exists: {0}")]
    Conflict(String),

    #[error("hit_stats: stored value is not 24 integers: {0}")]
    BadStats(String),
}

/// Add `delta` to the stored JSON array of 24 hourly counts.
pub(crate) fn add_stats(stored: &str, delta: &[i64; 24]) -> Result<String, StoreError> {
    let mut current: Vec<i64> =
        serde_json::from_str(stored).map_err(|_| StoreError::BadStats(stored.to_string()))?;
    if current.len() != 24 {
        return Err(StoreError::BadStats(stored.to_string()));
    }
    for (c, d) in current.iter_mut().zip(delta) {
        *c += d;
    }
    serde_json::to_string(&current).map_err(|_| StoreError::BadStats(stored.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_stats_sums_per_hour() {
        let stored = serde_json::to_string(&[1i64; 24]).unwrap();
        let mut delta = [0i64; 24];
        delta[14] = 2;
        let merged: Vec<i64> = serde_json::from_str(&add_stats(&stored, &delta).unwrap()).unwrap();
        assert_eq!(merged[14], 3);
        assert_eq!(merged[0], 1);
    }

    #[test]
    fn add_stats_rejects_garbage() {
        assert!(add_stats("[1,2]", &[0; 24]).is_err());
        assert!(add_stats("nope", &[0; 24]).is_err());
    }
}
