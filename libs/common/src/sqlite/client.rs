use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use sqlx::{
    sqlite::{
        SqliteAutoVacuum, SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions,
        SqliteSynchronous,
    },
    SqlitePool as SqlxSqlitePool,
};
use tracing::{debug, info, warn};

pub type SqlitePool = SqlxSqlitePool;

/// How freed pages are returned to the filesystem after large deletes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum VacuumMode {
    /// `PRAGMA incremental_vacuum` (requires `auto_vacuum=INCREMENTAL`)
    #[default]
    Incremental,
    /// Full `VACUUM`, rewrites the whole file
    Full,
    /// Leave free pages in place
    None,
}

impl VacuumMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Incremental => "incremental",
            Self::Full => "full",
            Self::None => "none",
        }
    }
}

impl FromStr for VacuumMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "incremental" | "inc" => Ok(Self::Incremental),
            "full" | "vacuum" => Ok(Self::Full),
            "none" | "off" => Ok(Self::None),
            other => Err(format!("unknown vacuum mode '{}'", other)),
        }
    }
}

/// Connection tuning for a data-logging database
#[derive(Debug, Clone)]
pub struct SqliteTuning {
    pub max_connections: u32,
    pub busy_timeout: Duration,
    /// Page cache in KiB
    pub cache_size_kib: i64,
    pub create_if_missing: bool,
}

impl Default for SqliteTuning {
    fn default() -> Self {
        Self {
            max_connections: 4,
            busy_timeout: Duration::from_secs(5),
            cache_size_kib: 2000,
            create_if_missing: true,
        }
    }
}

#[derive(Clone)]
pub struct SqliteClient {
    pool: Arc<SqlitePool>,
    db_path: PathBuf,
}

impl SqliteClient {
    /// Open (or create) a database in WAL mode with `synchronous=NORMAL`,
    /// incremental auto-vacuum and foreign keys enforced
    pub async fn open(db_path: impl AsRef<Path>, tuning: SqliteTuning) -> Result<Self> {
        let db_path = db_path.as_ref().to_path_buf();

        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        if tuning.create_if_missing {
            purge_orphan_sidecars(&db_path);
        }

        let options = SqliteConnectOptions::new()
            .filename(&db_path)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .auto_vacuum(SqliteAutoVacuum::Incremental)
            .foreign_keys(true)
            .busy_timeout(tuning.busy_timeout)
            .pragma("cache_size", format!("-{}", tuning.cache_size_kib))
            .create_if_missing(tuning.create_if_missing);

        let pool = SqlitePoolOptions::new()
            .max_connections(tuning.max_connections.max(1))
            .connect_with(options)
            .await?;

        info!("SQLite database opened: {}", db_path.display());

        Ok(Self {
            pool: Arc::new(pool),
            db_path,
        })
    }

    /// Open an existing database without creating it
    pub async fn open_existing(db_path: impl AsRef<Path>) -> Result<Self> {
        let path = db_path.as_ref();
        if !path.exists() {
            warn!("Database file does not exist: {}", path.display());
            return Err(anyhow::anyhow!("Database file not found: {}", path.display()));
        }
        Self::open(
            path,
            SqliteTuning {
                create_if_missing: false,
                ..SqliteTuning::default()
            },
        )
        .await
    }

    /// Get the underlying connection pool
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Fold the WAL back into the main file and truncate it
    pub async fn checkpoint(&self) -> Result<()> {
        sqlx::query("PRAGMA wal_checkpoint(TRUNCATE)")
            .execute(&*self.pool)
            .await?;
        Ok(())
    }

    /// Reclaim free pages according to `mode`
    pub async fn vacuum(&self, mode: VacuumMode) -> Result<()> {
        match mode {
            VacuumMode::Incremental => {
                sqlx::query("PRAGMA incremental_vacuum")
                    .execute(&*self.pool)
                    .await?;
            },
            VacuumMode::Full => {
                sqlx::query("VACUUM").execute(&*self.pool).await?;
            },
            VacuumMode::None => return Ok(()),
        }
        info!("Database vacuumed ({}): {}", mode.as_str(), self.db_path.display());
        Ok(())
    }

    /// Close every pooled connection
    pub async fn close(&self) {
        self.pool.close().await;
    }
}

/// Remove `-wal`, `-shm` and `-journal` files left behind when the main
/// database file is gone. Reopening over them would fail or resurrect
/// pages that belong to a different file.
pub fn purge_orphan_sidecars(db_path: &Path) {
    if db_path.exists() {
        return;
    }
    for suffix in ["-wal", "-shm", "-journal"] {
        let mut name = db_path.as_os_str().to_owned();
        name.push(suffix);
        let sidecar = PathBuf::from(name);
        if sidecar.exists() {
            match std::fs::remove_file(&sidecar) {
                Ok(()) => debug!("Removed orphaned sidecar {}", sidecar.display()),
                Err(e) => warn!("Cannot remove orphaned sidecar {}: {}", sidecar.display(), e),
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_vacuum_mode_parse() {
        assert_eq!("INC".parse::<VacuumMode>().unwrap(), VacuumMode::Incremental);
        assert_eq!("full".parse::<VacuumMode>().unwrap(), VacuumMode::Full);
        assert_eq!("off".parse::<VacuumMode>().unwrap(), VacuumMode::None);
        assert!("sometimes".parse::<VacuumMode>().is_err());
    }

    #[test]
    fn test_purge_orphan_sidecars() {
        let dir = TempDir::new().unwrap();
        let db = dir.path().join("data.db");
        std::fs::write(dir.path().join("data.db-wal"), b"stale").unwrap();
        std::fs::write(dir.path().join("data.db-shm"), b"stale").unwrap();

        purge_orphan_sidecars(&db);

        assert!(!dir.path().join("data.db-wal").exists());
        assert!(!dir.path().join("data.db-shm").exists());
    }

    #[tokio::test]
    async fn test_open_sets_wal_and_foreign_keys() {
        let dir = TempDir::new().unwrap();
        let client = SqliteClient::open(dir.path().join("sub/test.db"), SqliteTuning::default())
            .await
            .unwrap();

        let mode: String = sqlx::query_scalar("PRAGMA journal_mode")
            .fetch_one(client.pool())
            .await
            .unwrap();
        assert_eq!(mode.to_lowercase(), "wal");

        let fk: i64 = sqlx::query_scalar("PRAGMA foreign_keys")
            .fetch_one(client.pool())
            .await
            .unwrap();
        assert_eq!(fk, 1);

        client.checkpoint().await.unwrap();
        client.vacuum(VacuumMode::Incremental).await.unwrap();
        assert!(dir.path().join("sub/test.db").exists());
        client.close().await;
    }

    #[tokio::test]
    async fn test_open_existing_missing_file() {
        let dir = TempDir::new().unwrap();
        assert!(SqliteClient::open_existing(dir.path().join("none.db")).await.is_err());
    }
}
