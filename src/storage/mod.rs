//! SQLite storage layer -- schema, channel store, job and result store.

pub mod channels;
pub mod jobs;
pub mod results;
pub mod schema;

pub use self::channels::ChannelStore;
pub use self::jobs::JobStore;

use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use r2d2::Pool as R2D2Pool;
use r2d2_sqlite::SqliteConnectionManager;

/// Connection Pool type
pub type Pool = R2D2Pool<SqliteConnectionManager>;

/// Open (or create) the SQLite database and return a connection pool.
pub fn open_pool(path: impl AsRef<Path>) -> Result<Pool> {
    let path = path.as_ref();
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create database directory {}", parent.display()))?;
    }

    let manager = SqliteConnectionManager::file(path).with_init(|c| {
        c.execute_batch(
            "PRAGMA journal_mode = WAL;
                 PRAGMA synchronous = NORMAL;
                 PRAGMA temp_store = MEMORY;
                 PRAGMA foreign_keys = ON;
                 PRAGMA busy_timeout = 5000;",
        )
    });

    let pool = R2D2Pool::new(manager)?;

    // Run migrations on a single connection
    let conn = pool.get()?;
    schema::migrate(&conn)?;

    Ok(pool)
}

/// Current time as stored in TEXT timestamp columns.
pub(crate) fn now_rfc3339() -> String {
    Utc::now().to_rfc3339()
}

pub(crate) fn parse_timestamp(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_default()
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use tempfile::TempDir;

    /// A pool over a scratch database that lives as long as the returned dir.
    pub fn scratch_pool() -> (TempDir, Pool) {
        let dir = tempfile::tempdir().unwrap();
        let pool = open_pool(dir.path().join("relaymedic.db")).unwrap();
        (dir, pool)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_pool_creates_parent_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/deeper/relay.db");
        open_pool(&path).unwrap();
        assert!(path.exists());
    }

    #[test]
    fn test_timestamp_round_trip() {
        let now = now_rfc3339();
        let parsed = parse_timestamp(&now);
        assert_eq!(parsed.to_rfc3339(), now);
        assert_eq!(parse_timestamp("garbage"), DateTime::<Utc>::default());
    }
}
