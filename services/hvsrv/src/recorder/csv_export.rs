//! Flat-file (CSV) export of acquisition rows
//!
//! Files derived from one base path:
//! - `<stem>.csv`: raw rows, appended (UTF-8 BOM and header on a new file)
//! - `<stem>_cycle.csv`: per-cycle anode minimum
//! - `<stem>_summary.csv`: overall minimum, rewritten on finalize
//!
//! A locked destination never loses rows. They stay pending and the next
//! attempt waits for `retry_interval`; rows that reached the file before a
//! failure are dropped from the pending set so a retry never duplicates them.
//! An explicit flush, finalize or stop that still cannot append writes
//! `<stem>_recovery_<timestamp>.csv` with exactly the pending rows.
//!
//! [`CsvExportHandle`] runs every file operation on the blocking pool.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::Local;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use super::row::{AcquisitionRow, CSV_HEADERS};
use crate::error::{HvError, HvResult};

const BOM: &[u8] = b"\xEF\xBB\xBF";
const CYCLE_HEADERS: [&str; 4] = ["cycle", "min_anode", "voltage", "time"];

#[derive(Debug, Clone)]
pub struct CsvExportSettings {
    pub base_path: PathBuf,
    pub batch_size: usize,
    pub flush_interval: Duration,
    pub retry_interval: Duration,
}

impl CsvExportSettings {
    pub fn new(base_path: impl Into<PathBuf>) -> Self {
        Self {
            base_path: base_path.into(),
            batch_size: 100,
            flush_interval: Duration::from_secs(1),
            retry_interval: Duration::from_secs(2),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CycleStat {
    pub cycle: u32,
    pub min_anode: f64,
    pub voltage: f64,
    pub time: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnodeMinimum {
    pub min_anode: f64,
    pub voltage: f64,
    pub time: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum FlushOutcome {
    /// Nothing pending, or the batch threshold not reached yet
    Idle,
    Written { rows: usize },
    /// Destination locked; rows kept for a later attempt
    Deferred { pending: usize },
    /// Destination locked; rows copied to a recovery file and still pending
    Recovered { path: PathBuf, rows: usize },
}

pub struct CsvExporter {
    settings: CsvExportSettings,
    csv_path: PathBuf,
    stem: PathBuf,
    pending: Vec<Vec<String>>,
    last_flush: Instant,
    next_retry: Option<Instant>,
    /// The last failed append stopped inside a record
    torn: bool,
}

impl CsvExporter {
    pub fn new(settings: CsvExportSettings) -> Self {
        let stem = settings.base_path.with_extension("");
        let csv_path = with_suffix(&stem, ".csv");
        Self {
            settings,
            csv_path,
            stem,
            pending: Vec::new(),
            last_flush: Instant::now(),
            next_retry: None,
            torn: false,
        }
    }

    pub fn csv_path(&self) -> &Path {
        &self.csv_path
    }

    pub fn cycle_path(&self) -> PathBuf {
        with_suffix(&self.stem, "_cycle.csv")
    }

    pub fn summary_path(&self) -> PathBuf {
        with_suffix(&self.stem, "_summary.csv")
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn push_rows(&mut self, rows: &[AcquisitionRow]) -> FlushOutcome {
        self.pending.extend(rows.iter().map(AcquisitionRow::csv_record));
        self.maybe_flush()
    }

    /// Marker rows follow the same batching as data rows
    pub fn push_marker(&mut self, text: &str) -> FlushOutcome {
        self.pending.push(AcquisitionRow::marker(text).csv_record());
        self.maybe_flush()
    }

    /// Time-based flush check, called periodically
    pub fn tick(&mut self) -> FlushOutcome {
        self.maybe_flush()
    }

    fn maybe_flush(&mut self) -> FlushOutcome {
        if self.pending.is_empty() {
            return FlushOutcome::Idle;
        }
        let now = Instant::now();
        let due = self.pending.len() >= self.settings.batch_size
            || now.saturating_duration_since(self.last_flush) >= self.settings.flush_interval;
        if !due {
            return FlushOutcome::Idle;
        }
        if self.next_retry.is_some_and(|t| now < t) {
            return FlushOutcome::Deferred {
                pending: self.pending.len(),
            };
        }
        self.try_append()
    }

    fn try_append(&mut self) -> FlushOutcome {
        match append_records(&self.csv_path, &CSV_HEADERS, &self.pending, self.torn) {
            Ok(()) => {
                let rows = self.pending.len();
                self.pending.clear();
                self.torn = false;
                self.last_flush = Instant::now();
                self.next_retry = None;
                debug!("Appended {} rows to {}", rows, self.csv_path.display());
                FlushOutcome::Written { rows }
            },
            Err(failure) => {
                self.pending.drain(..failure.written);
                self.torn |= failure.torn;
                warn!(
                    "CSV {} not writable ({}), {} rows written, keeping {} pending",
                    self.csv_path.display(),
                    failure.error,
                    failure.written,
                    self.pending.len()
                );
                self.next_retry = Some(Instant::now() + self.settings.retry_interval);
                FlushOutcome::Deferred {
                    pending: self.pending.len(),
                }
            },
        }
    }

    /// Write pending rows now; a locked file produces a recovery copy
    pub fn flush(&mut self) -> HvResult<FlushOutcome> {
        if self.pending.is_empty() {
            return Ok(FlushOutcome::Idle);
        }
        match self.try_append() {
            FlushOutcome::Deferred { .. } => self.write_recovery(),
            written => Ok(written),
        }
    }

    fn write_recovery(&self) -> HvResult<FlushOutcome> {
        let stamp = Local::now().format("%Y%m%d_%H%M%S");
        let path = with_suffix(&self.stem, &format!("_recovery_{stamp}.csv"));
        write_records(&path, &CSV_HEADERS, &self.pending).map_err(|e| {
            HvError::locked(format!(
                "{} locked and recovery file {} failed: {e}",
                self.csv_path.display(),
                path.display()
            ))
        })?;
        warn!(
            "CSV {} locked, {} rows written to {}",
            self.csv_path.display(),
            self.pending.len(),
            path.display()
        );
        Ok(FlushOutcome::Recovered {
            path,
            rows: self.pending.len(),
        })
    }

    pub fn append_cycle_row(&self, stat: &CycleStat) -> HvResult<()> {
        append_records(&self.cycle_path(), &CYCLE_HEADERS, &[cycle_record(stat)], false).map_err(
            |f| HvError::locked(format!("{}: {}", self.cycle_path().display(), f.error)),
        )
    }

    /// Flush, then rewrite the summary and (when given) the cycle file
    pub fn finalize(
        &mut self,
        minimum: Option<&AnodeMinimum>,
        cycles: &[CycleStat],
    ) -> HvResult<FlushOutcome> {
        let outcome = self.flush()?;

        let mut summary = vec![];
        if let Some(min) = minimum {
            summary.push(vec!["min_anode".to_string(), min.min_anode.to_string()]);
            summary.push(vec!["min_anode_voltage".to_string(), min.voltage.to_string()]);
            summary.push(vec!["min_anode_time".to_string(), min.time.clone()]);
        }
        write_records(&self.summary_path(), &["item", "value"], &summary)?;

        if !cycles.is_empty() {
            let records: Vec<_> = cycles.iter().map(cycle_record).collect();
            write_records(&self.cycle_path(), &CYCLE_HEADERS, &records)?;
        }
        info!("CSV export finalized: {}", self.csv_path.display());
        Ok(outcome)
    }
}

fn with_suffix(stem: &Path, suffix: &str) -> PathBuf {
    let mut name = stem.as_os_str().to_owned();
    name.push(suffix);
    PathBuf::from(name)
}

fn cycle_record(stat: &CycleStat) -> Vec<String> {
    vec![
        stat.cycle.to_string(),
        stat.min_anode.to_string(),
        stat.voltage.to_string(),
        stat.time.clone(),
    ]
}

fn ensure_parent(path: &Path) -> HvResult<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    Ok(())
}

/// CSV bytes for one append plus the offset where each record ends
struct Encoded {
    bytes: Vec<u8>,
    /// Offset of the first record; everything before is BOM, header or a
    /// line break closing a torn record
    body_start: usize,
    record_ends: Vec<usize>,
}

impl Encoded {
    fn new(
        header: Option<&[&str]>,
        newline_first: bool,
        records: &[Vec<String>],
    ) -> HvResult<Self> {
        let mut prefix = Vec::new();
        if newline_first {
            prefix.push(b'\n');
        }
        if header.is_some() {
            prefix.extend_from_slice(BOM);
        }
        let mut writer = csv::WriterBuilder::new().from_writer(prefix);
        if let Some(headers) = header {
            writer.write_record(headers)?;
        }
        writer.flush()?;
        let body_start = writer.get_ref().len();

        let mut record_ends = Vec::with_capacity(records.len());
        for record in records {
            writer.write_record(record)?;
            writer.flush()?;
            record_ends.push(writer.get_ref().len());
        }
        let bytes = writer
            .into_inner()
            .map_err(|e| HvError::io(format!("CSV encode: {e}")))?;
        Ok(Self {
            bytes,
            body_start,
            record_ends,
        })
    }

    /// Records entirely inside the first `pos` bytes, and whether `pos`
    /// falls inside a record
    fn progress(&self, pos: usize) -> (usize, bool) {
        let written = self.record_ends.iter().take_while(|&&end| end <= pos).count();
        let boundary = pos == 0
            || pos == self.body_start
            || self.record_ends.binary_search(&pos).is_ok();
        (written, !boundary)
    }
}

/// An append that stopped early
#[derive(Debug)]
struct AppendFailure {
    /// Records fully on disk before the failure
    written: usize,
    /// The file now ends inside a record
    torn: bool,
    error: HvError,
}

impl AppendFailure {
    fn before_write(error: HvError) -> Self {
        Self {
            written: 0,
            torn: false,
            error,
        }
    }
}

/// Write `encoded` to `out`, reporting how far it got on failure
fn write_tracked<W: Write>(out: &mut W, encoded: &Encoded) -> Result<(), AppendFailure> {
    let mut pos = 0;
    let fail = |pos: usize, err: io::Error| {
        let (written, torn) = encoded.progress(pos);
        AppendFailure {
            written,
            torn,
            error: err.into(),
        }
    };
    while pos < encoded.bytes.len() {
        match out.write(&encoded.bytes[pos..]) {
            Ok(0) => return Err(fail(pos, io::Error::from(io::ErrorKind::WriteZero))),
            Ok(n) => pos += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {},
            Err(e) => return Err(fail(pos, e)),
        }
    }
    // Bytes handed to a `File` are already with the OS
    out.flush().map_err(|e| fail(pos, e))
}

fn append_records(
    path: &Path,
    headers: &[&str],
    records: &[Vec<String>],
    newline_first: bool,
) -> Result<(), AppendFailure> {
    ensure_parent(path).map_err(AppendFailure::before_write)?;
    let needs_header = fs::metadata(path).map_or(true, |m| m.len() == 0);
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|e| AppendFailure::before_write(e.into()))?;
    let encoded = Encoded::new(
        needs_header.then_some(headers),
        newline_first && !needs_header,
        records,
    )
    .map_err(AppendFailure::before_write)?;
    write_tracked(&mut file, &encoded)
}

fn write_records(path: &Path, headers: &[&str], records: &[Vec<String>]) -> HvResult<()> {
    ensure_parent(path)?;
    let mut file = File::create(path)?;
    let encoded = Encoded::new(Some(headers), false, records)?;
    write_tracked(&mut file, &encoded).map_err(|f| f.error)
}

// ============================================================================
// Export task
// ============================================================================

enum CsvCommand {
    Rows(Vec<AcquisitionRow>),
    Marker(String),
    Cycle(CycleStat),
    Flush(oneshot::Sender<HvResult<FlushOutcome>>),
    Finalize {
        minimum: Option<AnodeMinimum>,
        cycles: Vec<CycleStat>,
        reply: oneshot::Sender<HvResult<FlushOutcome>>,
    },
    Stop(oneshot::Sender<HvResult<FlushOutcome>>),
}

/// Owns a [`CsvExporter`] on its own task and drives the time-based flush
pub struct CsvExportHandle {
    tx: mpsc::Sender<CsvCommand>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl CsvExportHandle {
    pub fn spawn(settings: CsvExportSettings) -> Self {
        let period = settings.flush_interval.max(Duration::from_millis(100));
        let exporter = CsvExporter::new(settings);
        info!("CSV export to {}", exporter.csv_path().display());
        let (tx, rx) = mpsc::channel(1024);
        let handle = tokio::spawn(export_loop(exporter, rx, period));
        Self {
            tx,
            handle: Mutex::new(Some(handle)),
        }
    }

    pub async fn add_rows(&self, rows: Vec<AcquisitionRow>) -> HvResult<()> {
        self.send(CsvCommand::Rows(rows)).await
    }

    pub async fn add_marker(&self, text: impl Into<String>) -> HvResult<()> {
        self.send(CsvCommand::Marker(text.into())).await
    }

    pub async fn append_cycle_row(&self, stat: CycleStat) -> HvResult<()> {
        self.send(CsvCommand::Cycle(stat)).await
    }

    pub async fn flush(&self) -> HvResult<FlushOutcome> {
        let (reply, rx) = oneshot::channel();
        self.send(CsvCommand::Flush(reply)).await?;
        rx.await
            .map_err(|_| HvError::not_open("CSV export task gone"))?
    }

    pub async fn finalize(
        &self,
        minimum: Option<AnodeMinimum>,
        cycles: Vec<CycleStat>,
    ) -> HvResult<FlushOutcome> {
        let (reply, rx) = oneshot::channel();
        self.send(CsvCommand::Finalize {
            minimum,
            cycles,
            reply,
        })
        .await?;
        rx.await
            .map_err(|_| HvError::not_open("CSV export task gone"))?
    }

    /// Flush (with recovery) and end the task
    pub async fn stop(&self) -> HvResult<FlushOutcome> {
        let Some(handle) = self.handle.lock().await.take() else {
            return Ok(FlushOutcome::Idle);
        };
        let (reply, rx) = oneshot::channel();
        self.send(CsvCommand::Stop(reply)).await?;
        let outcome = rx
            .await
            .map_err(|_| HvError::not_open("CSV export task gone"))?;
        let _ = handle.await;
        outcome
    }

    async fn send(&self, cmd: CsvCommand) -> HvResult<()> {
        self.tx
            .send(cmd)
            .await
            .map_err(|_| HvError::not_open("CSV export task gone"))
    }
}

/// Run one exporter operation on the blocking pool. `None` means the
/// operation panicked and the exporter is gone.
async fn on_blocking_pool<T, F>(mut exporter: CsvExporter, op: F) -> Option<(CsvExporter, T)>
where
    T: Send + 'static,
    F: FnOnce(&mut CsvExporter) -> T + Send + 'static,
{
    let joined = tokio::task::spawn_blocking(move || {
        let out = op(&mut exporter);
        (exporter, out)
    })
    .await;
    match joined {
        Ok(done) => Some(done),
        Err(e) => {
            error!("CSV export operation failed: {}", e);
            None
        },
    }
}

async fn export_loop(exporter: CsvExporter, mut rx: mpsc::Receiver<CsvCommand>, period: Duration) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut slot = Some(exporter);

    while let Some(exporter) = slot.take() {
        let cmd = tokio::select! {
            cmd = rx.recv() => cmd,
            _ = ticker.tick() => {
                slot = on_blocking_pool(exporter, |e| e.tick()).await.map(|(e, _)| e);
                continue;
            }
        };
        let Some(cmd) = cmd else {
            let _ = on_blocking_pool(exporter, |e| e.flush()).await;
            break;
        };
        slot = match cmd {
            CsvCommand::Rows(rows) => on_blocking_pool(exporter, move |e| e.push_rows(&rows))
                .await
                .map(|(e, _)| e),
            CsvCommand::Marker(text) => on_blocking_pool(exporter, move |e| e.push_marker(&text))
                .await
                .map(|(e, _)| e),
            CsvCommand::Cycle(stat) => {
                on_blocking_pool(exporter, move |e| e.append_cycle_row(&stat))
                    .await
                    .map(|(e, written)| {
                        if let Err(err) = written {
                            warn!("Cycle row not written: {}", err);
                        }
                        e
                    })
            },
            CsvCommand::Flush(reply) => on_blocking_pool(exporter, |e| e.flush())
                .await
                .map(|(e, outcome)| {
                    let _ = reply.send(outcome);
                    e
                }),
            CsvCommand::Finalize {
                minimum,
                cycles,
                reply,
            } => on_blocking_pool(exporter, move |e| e.finalize(minimum.as_ref(), &cycles))
                .await
                .map(|(e, outcome)| {
                    let _ = reply.send(outcome);
                    e
                }),
            CsvCommand::Stop(reply) => {
                if let Some((_, outcome)) = on_blocking_pool(exporter, |e| e.flush()).await {
                    let _ = reply.send(outcome);
                }
                break;
            },
        };
    }
    debug!("CSV export task stopped");
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;
    use crate::recorder::row::Readings;
    use tempfile::TempDir;

    fn row(anode: f64) -> AcquisitionRow {
        AcquisitionRow::from_readings(
            Local::now(),
            Readings {
                cathode: 10.0,
                anode,
                ..Readings::default()
            },
        )
    }

    fn exporter(dir: &TempDir, batch_size: usize) -> CsvExporter {
        let mut settings = CsvExportSettings::new(dir.path().join("run1.csv"));
        settings.batch_size = batch_size;
        settings.flush_interval = Duration::from_secs(3600);
        CsvExporter::new(settings)
    }

    fn read(path: &Path) -> String {
        String::from_utf8(fs::read(path).unwrap()).unwrap()
    }

    // ========================================================================
    // Batching
    // ========================================================================

    #[tokio::test]
    async fn test_batch_threshold() {
        let dir = TempDir::new().unwrap();
        let mut exp = exporter(&dir, 3);

        assert_eq!(exp.push_rows(&[row(1.0), row(2.0)]), FlushOutcome::Idle);
        assert!(!exp.csv_path().exists());

        assert_eq!(exp.push_marker("cycle 1"), FlushOutcome::Written { rows: 3 });
        let text = read(exp.csv_path());
        assert!(text.starts_with("\u{FEFF}time,HV voltage,cathode"));
        assert!(text.contains("# cycle 1,,,,,,,,,"));
        assert_eq!(text.lines().count(), 4);

        // no second header on append
        exp.push_rows(&[row(1.0), row(2.0), row(3.0)]);
        assert_eq!(read(exp.csv_path()).matches("HV voltage").count(), 1);
    }

    // ========================================================================
    // Locked destination
    // ========================================================================

    #[tokio::test]
    async fn test_locked_file_keeps_rows_and_writes_recovery() {
        let dir = TempDir::new().unwrap();
        let mut exp = exporter(&dir, 2);
        // a directory at the CSV path cannot be opened for append
        fs::create_dir_all(exp.csv_path()).unwrap();

        assert_eq!(
            exp.push_rows(&[row(1.0), row(2.0)]),
            FlushOutcome::Deferred { pending: 2 }
        );
        let before = exp.pending_len();

        let outcome = exp.flush().unwrap();
        assert_eq!(exp.pending_len(), before);
        let FlushOutcome::Recovered { path, rows } = outcome else {
            panic!("expected recovery, got {outcome:?}");
        };
        assert_eq!(rows, 2);
        assert!(path
            .file_name()
            .unwrap()
            .to_string_lossy()
            .starts_with("run1_recovery_"));
        // header + exactly the pending rows
        assert_eq!(read(&path).lines().count(), 3);

        // the lock clears and the same rows land in the main file
        fs::remove_dir(exp.csv_path()).unwrap();
        assert_eq!(exp.flush().unwrap(), FlushOutcome::Written { rows: 2 });
        assert_eq!(exp.pending_len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_waits_after_failure() {
        let dir = TempDir::new().unwrap();
        let mut exp = exporter(&dir, 1);
        fs::create_dir_all(exp.csv_path()).unwrap();

        assert_eq!(exp.push_rows(&[row(1.0)]), FlushOutcome::Deferred { pending: 1 });
        fs::remove_dir(exp.csv_path()).unwrap();

        // still inside the retry interval
        assert_eq!(exp.push_rows(&[row(2.0)]), FlushOutcome::Deferred { pending: 2 });
        assert!(!exp.csv_path().exists());

        tokio::time::advance(Duration::from_secs(3)).await;
        assert_eq!(exp.tick(), FlushOutcome::Written { rows: 2 });
    }

    // ========================================================================
    // Interrupted appends
    // ========================================================================

    /// Accepts `limit` bytes, then fails like a full disk
    struct ShortWriter {
        out: Vec<u8>,
        limit: usize,
    }

    impl Write for ShortWriter {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            let room = self.limit - self.out.len();
            if room == 0 {
                return Err(io::Error::other("no space left on device"));
            }
            let n = buf.len().min(room).min(7);
            self.out.extend_from_slice(&buf[..n]);
            Ok(n)
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn records(n: usize) -> Vec<Vec<String>> {
        (0..n).map(|i| row(i as f64).csv_record()).collect()
    }

    #[test]
    fn test_interrupted_write_counts_complete_records() {
        let encoded = Encoded::new(Some(&CSV_HEADERS[..]), false, &records(3)).unwrap();

        let mut out = ShortWriter {
            out: Vec::new(),
            limit: encoded.record_ends[1],
        };
        let failure = write_tracked(&mut out, &encoded).unwrap_err();
        assert_eq!(failure.written, 2);
        assert!(!failure.torn);

        let mut out = ShortWriter {
            out: Vec::new(),
            limit: encoded.record_ends[1] + 3,
        };
        let failure = write_tracked(&mut out, &encoded).unwrap_err();
        assert_eq!(failure.written, 2);
        assert!(failure.torn);

        // Stopped inside the header: nothing written, file torn
        let mut out = ShortWriter {
            out: Vec::new(),
            limit: 5,
        };
        let failure = write_tracked(&mut out, &encoded).unwrap_err();
        assert_eq!(failure.written, 0);
        assert!(failure.torn);
    }

    #[tokio::test]
    async fn test_retry_after_torn_append_starts_new_line() {
        let dir = TempDir::new().unwrap();
        let mut exp = exporter(&dir, 100);
        exp.push_rows(&[row(1.0)]);
        exp.flush().unwrap();

        // Simulate an append that died halfway through a record
        let mut file = OpenOptions::new().append(true).open(exp.csv_path()).unwrap();
        file.write_all(b"2024-01-01 00:00:00,1").unwrap();
        drop(file);
        exp.torn = true;

        exp.push_rows(&[row(2.0)]);
        assert_eq!(exp.flush().unwrap(), FlushOutcome::Written { rows: 1 });
        let text = read(exp.csv_path());
        let lines: Vec<_> = text.lines().collect();
        assert_eq!(lines.len(), 4);
        assert_eq!(lines[2], "2024-01-01 00:00:00,1");
        assert!(!exp.torn);
    }

    // ========================================================================
    // Cycle and summary files
    // ========================================================================

    #[tokio::test]
    async fn test_cycle_and_summary_files() {
        let dir = TempDir::new().unwrap();
        let mut exp = exporter(&dir, 100);
        let stat = CycleStat {
            cycle: 1,
            min_anode: 0.5,
            voltage: 1200.0,
            time: "2024-01-01 10:00:00".into(),
        };
        exp.append_cycle_row(&stat).unwrap();
        exp.append_cycle_row(&CycleStat { cycle: 2, ..stat.clone() }).unwrap();
        assert_eq!(read(&exp.cycle_path()).lines().count(), 3);

        exp.push_rows(&[row(1.0)]);
        let min = AnodeMinimum {
            min_anode: 0.5,
            voltage: 1200.0,
            time: "2024-01-01 10:00:00".into(),
        };
        let outcome = exp.finalize(Some(&min), &[stat]).unwrap();
        assert_eq!(outcome, FlushOutcome::Written { rows: 1 });

        let summary = read(&exp.summary_path());
        assert!(summary.contains("min_anode,0.5"));
        assert!(summary.contains("min_anode_voltage,1200"));
        // finalize overwrites the cycle file
        assert_eq!(read(&exp.cycle_path()).lines().count(), 2);
    }

    #[tokio::test]
    async fn test_export_task_flushes_on_stop() {
        let dir = TempDir::new().unwrap();
        let mut settings = CsvExportSettings::new(dir.path().join("task"));
        settings.flush_interval = Duration::from_secs(3600);
        let handle = CsvExportHandle::spawn(settings);

        handle.add_rows(vec![row(1.0), row(2.0)]).await.unwrap();
        handle.add_marker("end").await.unwrap();
        assert_eq!(handle.stop().await.unwrap(), FlushOutcome::Written { rows: 3 });
        assert_eq!(read(&dir.path().join("task.csv")).lines().count(), 4);
    }
}
