//! Unified logging for the high-voltage test services
//!
//! Console output plus a daily rolling log file named `{YYYYMMDD}_{service}.log`,
//! rotated by size within a day. SIGHUP reopens the file and a background
//! task gzips old files and removes very old archives.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::{Duration, SystemTime};

use flate2::write::GzEncoder;
use flate2::Compression;
use tracing::Level;
use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_subscriber::{
    fmt::{
        self,
        format::{FmtSpan, Writer},
        FmtContext, FormatEvent, FormatFields, MakeWriter,
    },
    layer::SubscriberExt,
    registry::LookupSpan,
    util::SubscriberInitExt,
    EnvFilter, Layer,
};

/// Environment variable overriding the log directory
pub const LOG_DIR_ENV: &str = "HVSRV_LOG_DIR";

/// Default max file size before an intra-day rotation: 100MB
pub const DEFAULT_MAX_FILE_SIZE: u64 = 100 * 1024 * 1024;

const DAY_SECS: u64 = 86_400;

fn format_level(level: &Level) -> &'static str {
    match *level {
        Level::TRACE => "[TRACE]",
        Level::DEBUG => "[DEBUG]",
        Level::INFO => "[INFO]",
        Level::WARN => "[WARN]",
        Level::ERROR => "[ERROR]",
    }
}

/// Event formatter producing `timestamp [LEVEL] message`
///
/// Example output: `2026-03-02T00:50:44.809000Z [INFO] Recorder started`
struct BracketedLevelFormat;

impl<S, N> FormatEvent<S, N> for BracketedLevelFormat
where
    S: tracing::Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &tracing::Event<'_>,
    ) -> std::fmt::Result {
        let now = chrono::Utc::now();
        write!(writer, "{} ", now.format("%Y-%m-%dT%H:%M:%S%.6fZ"))?;

        let level = *event.metadata().level();
        if writer.has_ansi_escapes() {
            let color = match level {
                Level::TRACE => "\x1b[35m",
                Level::DEBUG => "\x1b[34m",
                Level::INFO => "\x1b[32m",
                Level::WARN => "\x1b[33m",
                Level::ERROR => "\x1b[31m",
            };
            write!(writer, "{}{}\x1b[0m ", color, format_level(&level))?;
        } else {
            write!(writer, "{} ", format_level(&level))?;
        }

        ctx.field_format().format_fields(writer.by_ref(), event)?;

        writeln!(writer)
    }
}

// Keeps the non-blocking worker alive for the process lifetime
static GUARD: OnceLock<Mutex<Option<WorkerGuard>>> = OnceLock::new();

// ============================================================================
// Log directory resolution
// ============================================================================

/// Resolve the log directory
///
/// Priority:
/// 1. `HVSRV_LOG_DIR` environment variable
/// 2. `configured` (from the service configuration file)
/// 3. `"logs"` in the working directory
pub fn resolve_log_dir(configured: Option<&str>) -> PathBuf {
    std::env::var(LOG_DIR_ENV)
        .ok()
        .filter(|s| !s.is_empty())
        .or_else(|| configured.filter(|s| !s.is_empty()).map(str::to_string))
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("logs"))
}

fn log_file_name(date: &str, service_name: &str, rotation: u32) -> String {
    if rotation == 0 {
        format!("{}_{}.log", date, service_name)
    } else {
        format!("{}_{}.{}.log", date, service_name, rotation)
    }
}

fn today() -> String {
    chrono::Local::now().format("%Y%m%d").to_string()
}

fn poisoned<T>(e: std::sync::PoisonError<T>) -> std::io::Error {
    std::io::Error::other(format!("Mutex poisoned: {}", e))
}

// ============================================================================
// Daily rolling writer
// ============================================================================

/// File writer that switches to a new file when the date changes, when the
/// current file was deleted underneath it, or when it grows past `max_file_size`
/// (`{YYYYMMDD}_{service}.N.log`).
#[derive(Clone)]
struct DailyRollingWriter {
    service_name: String,
    log_dir: PathBuf,
    current_date: Arc<Mutex<String>>,
    current_file: Arc<Mutex<Option<File>>>,
    current_size: Arc<AtomicU64>,
    max_file_size: u64,
    rotation_count: Arc<AtomicU32>,
}

impl DailyRollingWriter {
    fn new(service_name: String, log_dir: PathBuf, max_file_size: u64) -> std::io::Result<Self> {
        let current_date = today();
        fs::create_dir_all(&log_dir)?;

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(log_dir.join(log_file_name(&current_date, &service_name, 0)))?;
        let initial_size = file.metadata().map(|m| m.len()).unwrap_or(0);

        Ok(Self {
            service_name,
            log_dir,
            current_date: Arc::new(Mutex::new(current_date)),
            current_file: Arc::new(Mutex::new(Some(file))),
            current_size: Arc::new(AtomicU64::new(initial_size)),
            max_file_size: max_file_size.max(1),
            rotation_count: Arc::new(AtomicU32::new(0)),
        })
    }

    fn rotate_by_size(&self) -> std::io::Result<()> {
        let current_date = self.current_date.lock().map_err(poisoned)?;
        let count = self.rotation_count.fetch_add(1, Ordering::SeqCst) + 1;

        let new_file = OpenOptions::new().create(true).append(true).open(
            self.log_dir
                .join(log_file_name(&current_date, &self.service_name, count)),
        )?;

        self.current_size.store(0, Ordering::SeqCst);
        *self.current_file.lock().map_err(poisoned)? = Some(new_file);
        Ok(())
    }

    fn get_writer(&self) -> std::io::Result<std::sync::MutexGuard<'_, Option<File>>> {
        let today = today();
        let mut current_date = self.current_date.lock().map_err(poisoned)?;

        let rotation = self.rotation_count.load(Ordering::SeqCst);
        let current_path =
            self.log_dir
                .join(log_file_name(&current_date, &self.service_name, rotation));
        let date_changed = *current_date != today;

        if date_changed || !current_path.exists() {
            if date_changed {
                *current_date = today;
                self.rotation_count.store(0, Ordering::SeqCst);
            }
            let rotation = self.rotation_count.load(Ordering::SeqCst);
            fs::create_dir_all(&self.log_dir)?;

            let new_file = OpenOptions::new().create(true).append(true).open(
                self.log_dir
                    .join(log_file_name(&current_date, &self.service_name, rotation)),
            )?;
            let initial_size = new_file.metadata().map(|m| m.len()).unwrap_or(0);
            self.current_size.store(initial_size, Ordering::SeqCst);
            *self.current_file.lock().map_err(poisoned)? = Some(new_file);
        }

        self.current_file.lock().map_err(poisoned)
    }
}

impl std::io::Write for DailyRollingWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let current_size = self.current_size.load(Ordering::Relaxed);
        if current_size > 0 && current_size + buf.len() as u64 > self.max_file_size {
            self.rotate_by_size()?;
        }

        if let Some(ref mut file) = *self.get_writer()? {
            let written = file.write(buf)?;
            self.current_size
                .fetch_add(written as u64, Ordering::Relaxed);
            Ok(written)
        } else {
            Ok(0)
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        if let Some(ref mut file) = *self.get_writer()? {
            file.flush()
        } else {
            Ok(())
        }
    }
}

// ============================================================================
// Reloadable writer
// ============================================================================

/// Swappable wrapper so the file sink can be reopened without rebuilding
/// the subscriber
#[derive(Clone)]
struct ReloadableWriter {
    inner: Arc<Mutex<Option<NonBlocking>>>,
}

impl ReloadableWriter {
    fn new(writer: NonBlocking) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Some(writer))),
        }
    }

    fn reload(&self, new_writer: NonBlocking) {
        if let Ok(mut guard) = self.inner.lock() {
            *guard = Some(new_writer);
        }
    }
}

impl std::io::Write for ReloadableWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        if let Ok(mut guard) = self.inner.lock() {
            if let Some(ref mut writer) = *guard {
                return writer.write(buf);
            }
        }
        Ok(0)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        if let Ok(mut guard) = self.inner.lock() {
            if let Some(ref mut writer) = *guard {
                return writer.flush();
            }
        }
        Ok(())
    }
}

impl MakeWriter<'_> for ReloadableWriter {
    type Writer = Self;

    fn make_writer(&'_ self) -> Self::Writer {
        self.clone()
    }
}

// ============================================================================
// Initialization
// ============================================================================

#[derive(Clone)]
struct LogRuntime {
    service_name: String,
    log_dir: PathBuf,
    max_file_size: u64,
}

static LOG_RUNTIME: OnceLock<Mutex<LogRuntime>> = OnceLock::new();
static FILE_WRITER: OnceLock<ReloadableWriter> = OnceLock::new();

/// Logger configuration
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Service name used in file names and the default filter (e.g. "hvsrv")
    pub service_name: String,
    /// Directory receiving the log files
    pub log_dir: PathBuf,
    /// Default filter level when `RUST_LOG` is unset
    pub level: Level,
    /// Write JSON lines to the file instead of the bracketed text format
    pub enable_json: bool,
    /// Size threshold for intra-day rotation
    pub max_file_size: u64,
    /// Plain log files older than this are gzip-compressed
    pub compress_after_days: u64,
    /// Compressed archives older than this are deleted
    pub delete_after_days: u64,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            service_name: "hvsrv".to_string(),
            log_dir: resolve_log_dir(None),
            level: Level::INFO,
            enable_json: false,
            max_file_size: DEFAULT_MAX_FILE_SIZE,
            compress_after_days: 7,
            delete_after_days: 365,
        }
    }
}

/// Initialize the global subscriber: console plus rolling file. `RUST_LOG` wins over `config.level` when set.
///
/// Must be called from within a tokio runtime (the compression task is spawned).
pub fn init_with_config(config: LogConfig) -> Result<(), Box<dyn std::error::Error>> {
    fs::create_dir_all(&config.log_dir)?;

    let file_writer = DailyRollingWriter::new(
        config.service_name.clone(),
        config.log_dir.clone(),
        config.max_file_size,
    )?;
    let (non_blocking, guard) = tracing_appender::non_blocking(file_writer);
    store_guard(guard);

    let filter_str = std::env::var("RUST_LOG").unwrap_or_else(|_| {
        format!(
            "{},{}=debug,sqlx=warn",
            config.level.as_str().to_lowercase(),
            config.service_name
        )
    });
    let filter = EnvFilter::new(&filter_str);

    let console_layer = fmt::layer()
        .with_ansi(true)
        .event_format(BracketedLevelFormat)
        .boxed();

    let writer = FILE_WRITER
        .get_or_init(|| ReloadableWriter::new(non_blocking.clone()))
        .clone();
    writer.reload(non_blocking);

    let file_layer = if config.enable_json {
        fmt::layer()
            .json()
            .with_writer(writer)
            .with_level(true)
            .with_target(true)
            .with_thread_ids(true)
            .with_span_events(FmtSpan::CLOSE)
            .boxed()
    } else {
        fmt::layer()
            .with_writer(writer)
            .with_ansi(false)
            .event_format(BracketedLevelFormat)
            .boxed()
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(console_layer)
        .with(file_layer)
        .try_init()?;

    let runtime = LogRuntime {
        service_name: config.service_name.clone(),
        log_dir: config.log_dir.clone(),
        max_file_size: config.max_file_size,
    };
    let slot = LOG_RUNTIME.get_or_init(|| Mutex::new(runtime.clone()));
    if let Ok(mut slot) = slot.lock() {
        *slot = runtime;
    }

    tracing::info!("Logging: {} @ {:?}", config.service_name, config.log_dir);

    start_log_compression_task(
        config.log_dir,
        config.service_name,
        config.compress_after_days,
        config.delete_after_days,
    );

    Ok(())
}

fn store_guard(guard: WorkerGuard) {
    let slot = GUARD.get_or_init(|| Mutex::new(None));
    match slot.lock() {
        Ok(mut slot) => *slot = Some(guard),
        Err(poisoned) => {
            eprintln!("Warning: log guard lock was poisoned, recovering...");
            *poisoned.into_inner() = Some(guard);
        },
    }
}

/// Reopen the log file (after external rotation or manual deletion)
pub fn reopen_logs_now() -> Result<(), Box<dyn std::error::Error>> {
    let runtime = LOG_RUNTIME
        .get()
        .ok_or("logging not initialized")?
        .lock()
        .map_err(|_| "poisoned lock")?
        .clone();

    let file_writer = DailyRollingWriter::new(
        runtime.service_name.clone(),
        runtime.log_dir.clone(),
        runtime.max_file_size,
    )?;
    let (non_blocking, guard) = tracing_appender::non_blocking(file_writer);
    store_guard(guard);

    FILE_WRITER
        .get()
        .ok_or("file writer not initialized")?
        .reload(non_blocking);

    tracing::debug!("Log reopened");
    Ok(())
}

/// Reopen logs on SIGHUP (Unix only)
pub fn enable_sighup_log_reopen() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        tokio::spawn(async move {
            match signal(SignalKind::hangup()) {
                Ok(mut hup) => loop {
                    hup.recv().await;
                    if let Err(e) = reopen_logs_now() {
                        tracing::warn!("SIGHUP reopen: {}", e);
                    }
                },
                Err(e) => tracing::warn!("SIGHUP handler: {}", e),
            }
        });
    }
}

// ==================== Log Compression Support ====================

/// Spawn the daily compression pass (first run one minute after start)
pub fn start_log_compression_task(
    log_dir: PathBuf,
    service_name: String,
    compress_after_days: u64,
    delete_after_days: u64,
) {
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(60)).await;
        let mut interval = tokio::time::interval(Duration::from_secs(DAY_SECS));

        loop {
            interval.tick().await;
            let policy = CompressionPolicy {
                compress_after: Duration::from_secs(compress_after_days * DAY_SECS),
                delete_after: Duration::from_secs(delete_after_days * DAY_SECS),
            };
            if let Err(e) = compress_old_logs(&log_dir, &service_name, policy).await {
                tracing::error!("Log compression error for {}: {}", service_name, e);
            }
        }
    });
}

/// Age thresholds for one compression pass
#[derive(Debug, Clone, Copy)]
pub struct CompressionPolicy {
    pub compress_after: Duration,
    pub delete_after: Duration,
}

/// Compress old plain logs of `service_name` and delete expired archives.
/// Returns `(compressed, deleted)` counts.
pub async fn compress_old_logs(
    log_dir: &Path,
    service_name: &str,
    policy: CompressionPolicy,
) -> Result<(usize, usize), Box<dyn std::error::Error>> {
    let mut entries = tokio::fs::read_dir(log_dir).await?;
    let marker = format!("_{}", service_name);
    let (mut compressed, mut deleted) = (0, 0);

    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        let file_name = match path.file_name() {
            Some(name) => name.to_string_lossy().to_string(),
            None => continue,
        };
        if !file_name.contains(&marker) {
            continue;
        }
        let is_archive = file_name.ends_with(".log.gz");
        if !is_archive && !file_name.ends_with(".log") {
            continue;
        }

        let modified = tokio::fs::metadata(&path).await?.modified()?;
        let age = SystemTime::now()
            .duration_since(modified)
            .unwrap_or_default();

        if is_archive {
            if age >= policy.delete_after {
                tokio::fs::remove_file(&path).await?;
                deleted += 1;
                tracing::debug!("Deleted: {}", file_name);
            }
        } else if age >= policy.compress_after {
            compress_file(&path).await?;
            tokio::fs::remove_file(&path).await?;
            compressed += 1;
            tracing::debug!("Compressed: {}", file_name);
        }
    }

    Ok((compressed, deleted))
}

async fn compress_file(path: &Path) -> Result<(), Box<dyn std::error::Error>> {
    let buffer = tokio::fs::read(path).await?;

    let output_path = format!("{}.gz", path.display());
    let output = File::create(&output_path)?;
    let mut encoder = GzEncoder::new(output, Compression::best());
    encoder.write_all(&buffer)?;
    encoder.finish()?;

    Ok(())
}
