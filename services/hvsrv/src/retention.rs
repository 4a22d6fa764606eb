//! Retention: archive and delete old runs, then reclaim space
//!
//! A pass selects the union of runs older than `keep_days` and runs beyond
//! the newest `keep_runs`. Selected runs are archived to one CSV file each
//! (when enabled) before anything is deleted; rows and run records are then
//! deleted in a single transaction. Passes are refused while a run is being
//! recorded, and a run that opens mid-pass is never deleted.

use std::collections::BTreeSet;
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use common::sqlite::{SqliteClient, SqlitePool, VacuumMode};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{HvError, HvResult};
use crate::recorder::schema::DATA_COLUMNS;
use crate::recorder::RecordingActivity;

const DAY_MS: i64 = 86_400_000;
const KEEP_ALL: u32 = 10_000;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetentionPolicy {
    pub keep_days: u32,
    pub keep_runs: u32,
    pub archive_before_delete: bool,
    pub archive_dir: PathBuf,
    pub vacuum_mode: VacuumMode,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            keep_days: 30,
            keep_runs: 200,
            archive_before_delete: true,
            archive_dir: PathBuf::from("data/archive"),
            vacuum_mode: VacuumMode::Incremental,
        }
    }
}

impl RetentionPolicy {
    /// Build the process-wide policy. Disabled retention keeps everything.
    pub fn load(
        enabled: bool,
        keep_days: u32,
        keep_runs: u32,
        archive_before_delete: bool,
        archive_dir: PathBuf,
        vacuum_mode: VacuumMode,
    ) -> Self {
        if !enabled {
            return Self {
                keep_days: KEEP_ALL,
                keep_runs: KEEP_ALL,
                archive_before_delete: false,
                archive_dir,
                vacuum_mode,
            };
        }
        Self {
            keep_days,
            keep_runs,
            archive_before_delete,
            archive_dir,
            vacuum_mode,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RetentionReport {
    pub deleted_runs: u64,
    pub deleted_rows: u64,
    pub archived_files: u64,
    pub archived_rows: u64,
    pub archive_dir: PathBuf,
    pub vacuum_mode: VacuumMode,
    pub elapsed_ms: u64,
}

impl RetentionReport {
    fn empty(policy: &RetentionPolicy) -> Self {
        Self {
            deleted_runs: 0,
            deleted_rows: 0,
            archived_files: 0,
            archived_rows: 0,
            archive_dir: policy.archive_dir.clone(),
            vacuum_mode: policy.vacuum_mode,
            elapsed_ms: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DbStats {
    pub path: PathBuf,
    pub exists: bool,
    pub size_bytes: u64,
    pub runs: u64,
    pub rows: u64,
    pub min_ts_ms: Option<i64>,
    pub max_ts_ms: Option<i64>,
}

/// Size and row counts of the database at `path`
pub async fn db_stats(path: &Path) -> HvResult<DbStats> {
    let mut stats = DbStats {
        path: path.to_path_buf(),
        exists: path.is_file(),
        size_bytes: 0,
        runs: 0,
        rows: 0,
        min_ts_ms: None,
        max_ts_ms: None,
    };
    if !stats.exists {
        return Ok(stats);
    }
    stats.size_bytes = fs::metadata(path)?.len();

    let client = open(path).await?;
    let pool = client.pool();
    let runs: i64 = sqlx::query_scalar("SELECT COUNT(1) FROM runs")
        .fetch_one(pool)
        .await?;
    let (rows, min_ts, max_ts): (i64, Option<i64>, Option<i64>) =
        sqlx::query_as("SELECT COUNT(1), MIN(ts_ms), MAX(ts_ms) FROM data")
            .fetch_one(pool)
            .await?;
    client.close().await;

    stats.runs = runs.max(0) as u64;
    stats.rows = rows.max(0) as u64;
    stats.min_ts_ms = min_ts;
    stats.max_ts_ms = max_ts;
    Ok(stats)
}

async fn open(path: &Path) -> HvResult<SqliteClient> {
    SqliteClient::open_existing(path)
        .await
        .map_err(|e| HvError::storage(format!("open {}: {e}", path.display())))
}

pub struct RetentionManager {
    db_path: PathBuf,
    policy: RetentionPolicy,
    activity: RecordingActivity,
}

impl RetentionManager {
    pub fn new(db_path: impl Into<PathBuf>, policy: RetentionPolicy, activity: RecordingActivity) -> Self {
        Self {
            db_path: db_path.into(),
            policy,
            activity,
        }
    }

    pub fn policy(&self) -> &RetentionPolicy {
        &self.policy
    }

    pub async fn db_stats(&self) -> HvResult<DbStats> {
        db_stats(&self.db_path).await
    }

    /// One pass with the configured policy
    pub async fn cleanup(&self) -> HvResult<RetentionReport> {
        self.cleanup_with(&self.policy).await
    }

    pub async fn cleanup_with(&self, policy: &RetentionPolicy) -> HvResult<RetentionReport> {
        if self.activity.is_active() {
            return Err(HvError::policy("cleanup refused while recording is active"));
        }
        if !self.db_path.is_file() {
            debug!("Retention: {} not found", self.db_path.display());
            return Ok(RetentionReport::empty(policy));
        }

        let started = Instant::now();
        let client = open(&self.db_path).await?;
        let result = run_pass(&client, policy, &self.activity).await;
        client.close().await;

        let mut report = result?;
        report.elapsed_ms = started.elapsed().as_millis() as u64;
        if report.deleted_runs > 0 {
            info!(
                "Retention removed {} runs ({} rows), archived {} files in {} ms",
                report.deleted_runs, report.deleted_rows, report.archived_files, report.elapsed_ms
            );
        }
        Ok(report)
    }

    /// Run `cleanup` every `interval` until cancelled. Passes that would
    /// overlap a recording are skipped.
    pub fn spawn_periodic(self: Arc<Self>, interval: Duration, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {}
                }
                if self.activity.is_active() {
                    debug!("Retention pass skipped: recording active");
                    continue;
                }
                if let Err(e) = self.cleanup().await {
                    error!("Retention pass failed: {}", e);
                }
            }
            debug!("Retention task stopped");
        })
    }
}

async fn run_pass(
    client: &SqliteClient,
    policy: &RetentionPolicy,
    activity: &RecordingActivity,
) -> HvResult<RetentionReport> {
    let pool = client.pool();
    let mut report = RetentionReport::empty(policy);

    let mut run_ids = select_runs(pool, policy, Utc::now().timestamp_millis()).await?;
    if let Some(active) = activity.active_run() {
        run_ids.retain(|id| *id != active);
    }
    if run_ids.is_empty() {
        return Ok(report);
    }

    if policy.archive_before_delete {
        let (files, rows) = archive_runs(pool, &run_ids, &policy.archive_dir)
            .await
            .map_err(|e| HvError::storage(format!("archive failed, nothing deleted: {e}")))?;
        report.archived_files = files;
        report.archived_rows = rows;
    }

    let mut tx = pool.begin().await?;
    for run_id in &run_ids {
        // Recording may have started while archiving
        if activity.active_run().as_deref() == Some(run_id.as_str()) {
            info!("Retention skipped run {}: now recording", run_id);
            continue;
        }
        let data = sqlx::query("DELETE FROM data WHERE run_id = ?")
            .bind(run_id)
            .execute(&mut *tx)
            .await?;
        report.deleted_rows += data.rows_affected();
        sqlx::query("DELETE FROM runs WHERE run_id = ?")
            .bind(run_id)
            .execute(&mut *tx)
            .await?;
        report.deleted_runs += 1;
    }
    // dropping an uncommitted transaction rolls it back
    tx.commit().await?;

    if let Err(e) = client.checkpoint().await {
        warn!("WAL checkpoint after cleanup failed: {}", e);
    }
    if let Err(e) = client.vacuum(policy.vacuum_mode).await {
        warn!("Vacuum after cleanup failed: {}", e);
    }
    Ok(report)
}

/// Union of the count rule and the age rule, sorted by run id
async fn select_runs(pool: &SqlitePool, policy: &RetentionPolicy, now_ms: i64) -> HvResult<Vec<String>> {
    let mut selected = BTreeSet::new();

    let newest_first: Vec<String> =
        sqlx::query_scalar("SELECT run_id FROM runs ORDER BY start_ms DESC")
            .fetch_all(pool)
            .await?;
    selected.extend(newest_first.into_iter().skip(policy.keep_runs as usize));

    let cutoff = now_ms - i64::from(policy.keep_days) * DAY_MS;
    let aged: Vec<String> = sqlx::query_scalar("SELECT run_id FROM runs WHERE start_ms < ?")
        .bind(cutoff)
        .fetch_all(pool)
        .await?;
    selected.extend(aged);

    Ok(selected.into_iter().collect())
}

type DataRecord = (
    String,
    i64,
    Option<String>,
    Option<f64>,
    Option<f64>,
    Option<f64>,
    Option<f64>,
    Option<f64>,
    Option<f64>,
    Option<f64>,
    Option<f64>,
    Option<f64>,
);

async fn archive_runs(pool: &SqlitePool, run_ids: &[String], dir: &Path) -> HvResult<(u64, u64)> {
    fs::create_dir_all(dir)?;
    let mut files = 0;
    let mut rows = 0;

    for run_id in run_ids {
        let records: Vec<DataRecord> = sqlx::query_as(
            r#"
            SELECT run_id, ts_ms, time_text, hv_voltage, cathode, gate, anode, backup, vacuum,
                   keithley_voltage, gate_plus_anode, anode_cathode_ratio
            FROM data WHERE run_id = ? ORDER BY ts_ms ASC
            "#,
        )
        .bind(run_id)
        .fetch_all(pool)
        .await?;

        let path = dir.join(format!("run_{run_id}.csv"));
        let mut writer = csv::Writer::from_writer(File::create(&path)?);
        writer.write_record(DATA_COLUMNS)?;
        for r in &records {
            writer.write_record([
                r.0.clone(),
                r.1.to_string(),
                r.2.clone().unwrap_or_default(),
                num(r.3),
                num(r.4),
                num(r.5),
                num(r.6),
                num(r.7),
                num(r.8),
                num(r.9),
                num(r.10),
                num(r.11),
            ])?;
        }
        writer.flush()?;
        debug!("Archived run {} ({} rows) to {}", run_id, records.len(), path.display());

        files += 1;
        rows += records.len() as u64;
    }
    Ok((files, rows))
}

fn num(value: Option<f64>) -> String {
    value.map(|v| v.to_string()).unwrap_or_default()
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;
    use crate::recorder::schema::init_schema;
    use common::sqlite::SqliteTuning;
    use tempfile::TempDir;

    async fn seed(path: &Path, runs: &[(&str, i64, usize)]) {
        let client = SqliteClient::open(path, SqliteTuning::default()).await.unwrap();
        init_schema(client.pool()).await.unwrap();
        for (run_id, start_ms, rows) in runs {
            sqlx::query("INSERT INTO runs(run_id, start_ms, end_ms, params_json) VALUES (?, ?, NULL, '{}')")
                .bind(run_id)
                .bind(start_ms)
                .execute(client.pool())
                .await
                .unwrap();
            for i in 0..*rows {
                sqlx::query("INSERT INTO data(run_id, ts_ms, time_text, cathode, anode) VALUES (?, ?, 't', 1.5, 2.0)")
                    .bind(run_id)
                    .bind(start_ms + i as i64)
                    .execute(client.pool())
                    .await
                    .unwrap();
            }
        }
        client.close().await;
    }

    fn policy(dir: &TempDir, keep_days: u32, keep_runs: u32) -> RetentionPolicy {
        RetentionPolicy {
            keep_days,
            keep_runs,
            archive_before_delete: true,
            archive_dir: dir.path().join("archive"),
            vacuum_mode: VacuumMode::Incremental,
        }
    }

    // ========================================================================
    // Selection
    // ========================================================================

    #[tokio::test]
    async fn test_union_of_age_and_count_rules() {
        let dir = TempDir::new().unwrap();
        let db = dir.path().join("hv.db");
        let now = Utc::now().timestamp_millis();
        seed(
            &db,
            &[
                ("new", now, 2),
                ("ten_days", now - 10 * DAY_MS, 3),
                ("forty_days", now - 40 * DAY_MS, 4),
            ],
        )
        .await;

        let mgr = RetentionManager::new(&db, policy(&dir, 30, 1), RecordingActivity::default());
        let report = mgr.cleanup().await.unwrap();
        assert_eq!(report.deleted_runs, 2);
        assert_eq!(report.deleted_rows, 7);
        assert_eq!(report.archived_files, 2);
        assert_eq!(report.archived_rows, 7);

        let stats = mgr.db_stats().await.unwrap();
        assert_eq!(stats.runs, 1);
        assert_eq!(stats.rows, 2);
        assert_eq!(stats.min_ts_ms, Some(now));
    }

    #[tokio::test]
    async fn test_age_rule_alone() {
        let dir = TempDir::new().unwrap();
        let db = dir.path().join("hv.db");
        let now = Utc::now().timestamp_millis();
        seed(&db, &[("a", now, 1), ("b", now - 10 * DAY_MS, 1), ("c", now - 40 * DAY_MS, 1)]).await;

        let pool_client = SqliteClient::open_existing(&db).await.unwrap();
        let selected = select_runs(pool_client.pool(), &policy(&dir, 30, 100), now)
            .await
            .unwrap();
        pool_client.close().await;
        assert_eq!(selected, vec!["c".to_string()]);
    }

    // ========================================================================
    // Archive
    // ========================================================================

    #[tokio::test]
    async fn test_archive_file_contents() {
        let dir = TempDir::new().unwrap();
        let db = dir.path().join("hv.db");
        let old = Utc::now().timestamp_millis() - 90 * DAY_MS;
        seed(&db, &[("old", old, 2)]).await;

        let mgr = RetentionManager::new(&db, policy(&dir, 30, 10), RecordingActivity::default());
        mgr.cleanup().await.unwrap();

        let text = fs::read_to_string(dir.path().join("archive/run_old.csv")).unwrap();
        let mut lines = text.lines();
        assert_eq!(lines.next().unwrap(), DATA_COLUMNS.join(","));
        assert_eq!(lines.next().unwrap(), format!("old,{old},t,,1.5,,2,,,,,"));
        assert_eq!(text.lines().count(), 3);
    }

    #[tokio::test]
    async fn test_no_archive_when_disabled() {
        let dir = TempDir::new().unwrap();
        let db = dir.path().join("hv.db");
        seed(&db, &[("old", Utc::now().timestamp_millis() - 90 * DAY_MS, 1)]).await;

        let mut p = policy(&dir, 30, 10);
        p.archive_before_delete = false;
        let mgr = RetentionManager::new(&db, p, RecordingActivity::default());
        let report = mgr.cleanup().await.unwrap();
        assert_eq!(report.deleted_runs, 1);
        assert_eq!(report.archived_files, 0);
        assert!(!dir.path().join("archive").exists());
    }

    // ========================================================================
    // Guards
    // ========================================================================

    #[tokio::test]
    async fn test_refused_while_recording() {
        let dir = TempDir::new().unwrap();
        let db = dir.path().join("hv.db");
        seed(&db, &[("old", 0, 1)]).await;

        let activity = RecordingActivity::default();
        activity.set(Some("new".into()));
        let mgr = RetentionManager::new(&db, policy(&dir, 30, 10), activity);
        assert!(matches!(mgr.cleanup().await, Err(HvError::PolicyViolation(_))));
        assert_eq!(mgr.db_stats().await.unwrap().runs, 1);
    }

    #[tokio::test]
    async fn test_run_opened_mid_pass_survives() {
        let dir = TempDir::new().unwrap();
        let db = dir.path().join("hv.db");
        let now = Utc::now().timestamp_millis();
        seed(&db, &[("done", now - 20, 2), ("live", now - 10, 3)]).await;

        // Past the entry check: recording has just opened "live"
        let activity = RecordingActivity::default();
        activity.set(Some("live".into()));
        let client = open(&db).await.unwrap();
        let report = run_pass(&client, &policy(&dir, 30, 0), &activity).await.unwrap();
        client.close().await;

        assert_eq!(report.deleted_runs, 1);
        assert_eq!(report.deleted_rows, 2);
        assert!(!dir.path().join("archive/run_live.csv").exists());
        let stats = db_stats(&db).await.unwrap();
        assert_eq!(stats.runs, 1);
        assert_eq!(stats.rows, 3);
    }

    #[tokio::test]
    async fn test_missing_database() {
        let dir = TempDir::new().unwrap();
        let db = dir.path().join("absent.db");
        let mgr = RetentionManager::new(&db, policy(&dir, 30, 10), RecordingActivity::default());

        let report = mgr.cleanup().await.unwrap();
        assert_eq!(report.deleted_runs, 0);
        let stats = mgr.db_stats().await.unwrap();
        assert!(!stats.exists);
        assert_eq!(stats.size_bytes, 0);
        assert!(!db.exists());
    }

    #[test]
    fn test_disabled_policy_keeps_everything() {
        let p = RetentionPolicy::load(false, 1, 1, true, PathBuf::from("a"), VacuumMode::Full);
        assert_eq!(p.keep_days, 10_000);
        assert_eq!(p.keep_runs, 10_000);
        assert!(!p.archive_before_delete);
    }
}
