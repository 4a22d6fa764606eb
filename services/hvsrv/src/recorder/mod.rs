//! Batched acquisition recorder
//!
//! Callers enqueue rows without blocking; a single writer task owns the
//! SQLite pool and commits a batch every `commit_every_rows` rows or
//! `commit_every` after the last commit, whichever comes first. With WAL and
//! `synchronous=NORMAL`, a crash loses at most the open batch.

pub mod csv_export;
pub mod row;
pub mod schema;
mod writer;

use std::path::PathBuf;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Local, Utc};
use common::sqlite::{SqliteClient, SqliteTuning};
use parking_lot::{Mutex as SyncMutex, RwLock};
use serde::Serialize;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{info, warn};

pub use row::{AcquisitionRow, Readings, CSV_HEADERS};

use crate::error::{HvError, HvResult};
use writer::{Writer, WriterCommand};

const CONTROL_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct RecorderSettings {
    pub path: PathBuf,
    pub commit_every_rows: usize,
    pub commit_every: Duration,
    pub queue_capacity: usize,
}

impl Default for RecorderSettings {
    fn default() -> Self {
        Self {
            path: PathBuf::from("data/hv_data.db"),
            commit_every_rows: 200,
            commit_every: Duration::from_millis(500),
            queue_capacity: 20_000,
        }
    }
}

/// Shared view of the run being recorded, for maintenance tasks
#[derive(Debug, Clone, Default)]
pub struct RecordingActivity(Arc<RwLock<Option<String>>>);

impl RecordingActivity {
    pub fn is_active(&self) -> bool {
        self.0.read().is_some()
    }

    /// Id of the open run, if any
    pub fn active_run(&self) -> Option<String> {
        self.0.read().clone()
    }

    pub(crate) fn set(&self, run_id: Option<String>) {
        *self.0.write() = run_id;
    }
}

#[derive(Debug, Default)]
pub(crate) struct RecorderStats {
    total_enqueued: AtomicU64,
    total_inserted: AtomicU64,
    batch_commits: AtomicU64,
    dropped: AtomicU64,
    /// 0 until the first commit
    last_commit_ms: AtomicI64,
    last_error: RwLock<Option<String>>,
}

impl RecorderStats {
    fn committed(&self, rows: u64) {
        self.total_inserted.fetch_add(rows, Ordering::Relaxed);
        self.batch_commits.fetch_add(1, Ordering::Relaxed);
        self.last_commit_ms
            .store(Utc::now().timestamp_millis(), Ordering::Relaxed);
        *self.last_error.write() = None;
    }

    fn add_dropped(&self, rows: u64) {
        self.dropped.fetch_add(rows, Ordering::Relaxed);
    }

    fn record_error(&self, message: String) {
        *self.last_error.write() = Some(message);
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RecorderStatus {
    pub path: PathBuf,
    pub run_id: Option<String>,
    pub queue_len: usize,
    pub total_enqueued: u64,
    pub total_inserted: u64,
    pub batch_commits: u64,
    pub dropped: u64,
    pub last_commit_ms: Option<i64>,
    pub last_error: Option<String>,
}

/// Run id from local time, `YYYYMMDD_HHMMSS_mmm`
pub fn run_id_at(at: DateTime<Local>) -> String {
    at.format("%Y%m%d_%H%M%S_%3f").to_string()
}

pub struct AcquisitionRecorder {
    settings: RecorderSettings,
    client: SqliteClient,
    tx: mpsc::Sender<WriterCommand>,
    run_id: SyncMutex<Option<String>>,
    activity: RecordingActivity,
    stats: Arc<RecorderStats>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl AcquisitionRecorder {
    /// Open (or create) the database and start the writer task
    pub async fn open(settings: RecorderSettings) -> HvResult<Self> {
        let client = SqliteClient::open(&settings.path, SqliteTuning::default())
            .await
            .map_err(|e| HvError::storage(format!("open {}: {e}", settings.path.display())))?;
        schema::init_schema(client.pool()).await?;

        let (tx, rx) = mpsc::channel(settings.queue_capacity.max(1));
        let stats = Arc::new(RecorderStats::default());
        let writer = Writer {
            pool: client.pool().clone(),
            commit_every_rows: settings.commit_every_rows.max(1),
            commit_every: settings.commit_every,
            stats: stats.clone(),
        };
        let handle = tokio::spawn(writer.run(rx));
        info!(
            "Recorder opened: {} (commit every {} rows / {:?})",
            settings.path.display(),
            settings.commit_every_rows,
            settings.commit_every
        );

        Ok(Self {
            settings,
            client,
            tx,
            run_id: SyncMutex::new(None),
            activity: RecordingActivity::default(),
            stats,
            handle: Mutex::new(Some(handle)),
        })
    }

    pub fn activity(&self) -> RecordingActivity {
        self.activity.clone()
    }

    pub fn client(&self) -> &SqliteClient {
        &self.client
    }

    pub fn run_id(&self) -> Option<String> {
        self.run_id.lock().clone()
    }

    /// Open a run with an id derived from the current local time
    pub async fn start_run(&self, params: &serde_json::Value) -> HvResult<String> {
        let run_id = run_id_at(Local::now());
        self.start_run_with_id(&run_id, params).await?;
        Ok(run_id)
    }

    /// Open run `run_id`. A run that is still open is closed first.
    pub async fn start_run_with_id(&self, run_id: &str, params: &serde_json::Value) -> HvResult<()> {
        if self.run_id().is_some() {
            self.stop_run().await?;
        }
        // Visible to retention before the run record exists
        self.activity.set(Some(run_id.to_string()));
        let started = self
            .send_control(WriterCommand::StartRun {
                run_id: run_id.to_string(),
                start_ms: Utc::now().timestamp_millis(),
                params_json: serde_json::to_string(params)?,
            })
            .await;
        if let Err(e) = started {
            self.activity.set(None);
            return Err(e);
        }
        *self.run_id.lock() = Some(run_id.to_string());
        info!("Recording run {} started", run_id);
        Ok(())
    }

    pub async fn stop_run(&self) -> HvResult<()> {
        let Some(run_id) = self.run_id.lock().take() else {
            return Ok(());
        };
        self.activity.set(None);
        self.send_control(WriterCommand::StopRun {
            run_id: run_id.clone(),
            end_ms: Utc::now().timestamp_millis(),
        })
        .await?;
        info!("Recording run {} stopped", run_id);
        Ok(())
    }

    /// Queue one row without waiting. Returns `false` when the row was not
    /// queued (no open run, or the queue is full).
    pub fn enqueue_row(&self, ts_ms: i64, row: AcquisitionRow) -> bool {
        let Some(run_id) = self.run_id() else {
            return false;
        };
        match self.tx.try_send(WriterCommand::Row { run_id, ts_ms, row }) {
            Ok(()) => {
                self.stats.total_enqueued.fetch_add(1, Ordering::Relaxed);
                true
            },
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.stats.add_dropped(1);
                self.stats
                    .record_error("recorder queue full, row dropped".to_string());
                warn!("Recorder queue full, dropping row at {}", ts_ms);
                false
            },
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.stats.add_dropped(1);
                self.stats
                    .record_error("recorder stopped, row dropped".to_string());
                false
            },
        }
    }

    /// Queue a marker row (e.g. a cycle boundary) in the same batch stream
    pub fn enqueue_marker(&self, ts_ms: i64, text: &str) -> bool {
        self.enqueue_row(ts_ms, AcquisitionRow::marker(text))
    }

    /// Commit whatever is batched and wait for it
    pub async fn flush(&self) -> HvResult<()> {
        let (reply, rx) = oneshot::channel();
        self.send_control(WriterCommand::Flush(reply)).await?;
        tokio::time::timeout(CONTROL_TIMEOUT, rx)
            .await
            .map_err(|_| HvError::timeout("recorder flush"))?
            .map_err(|_| HvError::not_open("recorder writer gone"))?
    }

    pub fn status(&self) -> RecorderStatus {
        let last_commit_ms = self.stats.last_commit_ms.load(Ordering::Relaxed);
        RecorderStatus {
            path: self.settings.path.clone(),
            run_id: self.run_id(),
            queue_len: self.tx.max_capacity() - self.tx.capacity(),
            total_enqueued: self.stats.total_enqueued.load(Ordering::Relaxed),
            total_inserted: self.stats.total_inserted.load(Ordering::Relaxed),
            batch_commits: self.stats.batch_commits.load(Ordering::Relaxed),
            dropped: self.stats.dropped.load(Ordering::Relaxed),
            last_commit_ms: (last_commit_ms > 0).then_some(last_commit_ms),
            last_error: self.stats.last_error.read().clone(),
        }
    }

    /// Close the open run, drain the queue and close the database
    pub async fn stop(&self) -> HvResult<()> {
        self.stop_run().await?;
        let Some(handle) = self.handle.lock().await.take() else {
            return Ok(());
        };

        let (reply, rx) = oneshot::channel();
        self.send_control(WriterCommand::Shutdown(reply)).await?;
        if tokio::time::timeout(CONTROL_TIMEOUT, rx).await.is_err() {
            warn!("Recorder writer did not drain in time");
        }
        let _ = handle.await;
        self.client.close().await;
        info!("Recorder stopped");
        Ok(())
    }

    async fn send_control(&self, cmd: WriterCommand) -> HvResult<()> {
        tokio::time::timeout(CONTROL_TIMEOUT, self.tx.send(cmd))
            .await
            .map_err(|_| HvError::timeout("recorder queue busy"))?
            .map_err(|_| HvError::not_open("recorder writer gone"))
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::TempDir;
    use tracing_test::traced_test;

    fn settings(dir: &TempDir, rows: usize) -> RecorderSettings {
        RecorderSettings {
            path: dir.path().join("rec.db"),
            commit_every_rows: rows,
            commit_every: Duration::from_secs(60),
            queue_capacity: 1000,
        }
    }

    fn sample(i: i64) -> AcquisitionRow {
        AcquisitionRow::from_readings(
            Local::now(),
            Readings {
                hv_voltage: Some(1000.0 + i as f64),
                cathode: 10.0,
                anode: 5.0,
                ..Readings::default()
            },
        )
    }

    async fn count_rows(rec: &AcquisitionRecorder) -> i64 {
        sqlx::query_scalar("SELECT COUNT(*) FROM data")
            .fetch_one(rec.client().pool())
            .await
            .unwrap()
    }

    // ========================================================================
    // Tests
    // ========================================================================

    #[test]
    fn test_run_id_format() {
        let at = Local.with_ymd_and_hms(2024, 1, 2, 3, 4, 5).unwrap();
        assert_eq!(run_id_at(at), "20240102_030405_000");
    }

    #[tokio::test]
    async fn test_rows_ignored_without_run() {
        let dir = TempDir::new().unwrap();
        let rec = AcquisitionRecorder::open(settings(&dir, 10)).await.unwrap();
        assert!(!rec.enqueue_row(1, sample(1)));
        assert_eq!(rec.status().total_enqueued, 0);
        rec.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_commit_on_row_threshold() {
        let dir = TempDir::new().unwrap();
        let rec = AcquisitionRecorder::open(settings(&dir, 5)).await.unwrap();
        rec.start_run_with_id("r1", &serde_json::json!({"target": 1})).await.unwrap();
        assert!(rec.activity().is_active());

        for i in 0..4 {
            assert!(rec.enqueue_row(i, sample(i)));
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(rec.status().batch_commits, 0);
        assert_eq!(count_rows(&rec).await, 0);

        rec.enqueue_row(4, sample(4));
        for _ in 0..50 {
            if rec.status().batch_commits == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(rec.status().batch_commits, 1);
        assert_eq!(count_rows(&rec).await, 5);
        rec.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_commit_on_time() {
        let dir = TempDir::new().unwrap();
        let mut s = settings(&dir, 1000);
        s.commit_every = Duration::from_millis(100);
        let rec = AcquisitionRecorder::open(s).await.unwrap();
        rec.start_run_with_id("r1", &serde_json::Value::Null).await.unwrap();

        rec.enqueue_row(1, sample(1));
        tokio::time::sleep(Duration::from_millis(600)).await;
        assert_eq!(rec.status().total_inserted, 1);
        rec.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_flush_and_stop_close_run() {
        let dir = TempDir::new().unwrap();
        let rec = AcquisitionRecorder::open(settings(&dir, 100)).await.unwrap();
        rec.start_run_with_id("r1", &serde_json::Value::Null).await.unwrap();
        rec.enqueue_row(1, sample(1));
        rec.enqueue_marker(2, "cycle 1");
        rec.flush().await.unwrap();
        assert_eq!(count_rows(&rec).await, 2);

        let marker: String =
            sqlx::query_scalar("SELECT time_text FROM data WHERE cathode IS NULL")
                .fetch_one(rec.client().pool())
                .await
                .unwrap();
        assert_eq!(marker, "# cycle 1");

        rec.stop_run().await.unwrap();
        assert!(!rec.activity().is_active());
        rec.flush().await.unwrap();
        let end: Option<i64> = sqlx::query_scalar("SELECT end_ms FROM runs WHERE run_id = 'r1'")
            .fetch_one(rec.client().pool())
            .await
            .unwrap();
        assert!(end.is_some());
        rec.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_reused_run_id_keeps_rows() {
        let dir = TempDir::new().unwrap();
        let rec = AcquisitionRecorder::open(settings(&dir, 100)).await.unwrap();
        rec.start_run_with_id("r1", &serde_json::json!({"pass": 1})).await.unwrap();
        for i in 0..3 {
            rec.enqueue_row(i, sample(i));
        }
        rec.stop_run().await.unwrap();
        rec.flush().await.unwrap();

        rec.start_run_with_id("r1", &serde_json::json!({"pass": 2})).await.unwrap();
        assert_eq!(rec.activity().active_run().as_deref(), Some("r1"));
        rec.enqueue_row(3, sample(3));
        rec.flush().await.unwrap();

        assert_eq!(count_rows(&rec).await, 4);
        let (end, params): (Option<i64>, String) =
            sqlx::query_as("SELECT end_ms, params_json FROM runs WHERE run_id = 'r1'")
                .fetch_one(rec.client().pool())
                .await
                .unwrap();
        assert!(end.is_none());
        assert!(params.contains("2"));
        rec.stop().await.unwrap();
    }

    #[tokio::test]
    #[traced_test]
    async fn test_full_queue_drops_newest() {
        let dir = TempDir::new().unwrap();
        let mut s = settings(&dir, 10_000);
        s.queue_capacity = 3;
        let rec = AcquisitionRecorder::open(s).await.unwrap();
        rec.start_run_with_id("r1", &serde_json::Value::Null).await.unwrap();
        rec.flush().await.unwrap();

        // the writer only runs when this task yields, so the queue fills
        let accepted = (0..10).filter(|i| rec.enqueue_row(*i, sample(*i))).count();
        assert_eq!(accepted, 3);
        let status = rec.status();
        assert_eq!(status.dropped, 7);
        assert!(status.last_error.unwrap().contains("queue full"));
        assert!(logs_contain("Recorder queue full"));
        rec.stop().await.unwrap();
    }
}
