//! Service configuration
//!
//! Every section falls back to its `Default`, so an empty YAML file (or no
//! file at all) yields a runnable configuration. The binary loads this with
//! `common::config_loader::load_config`; the library only consumes the typed
//! structs.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{HvError, HvResult};
use crate::meters::{cm52, dmm, MeterKind};
use crate::modbus::driver::DriverSettings;
use crate::modbus::reconnect::ReconnectPolicy;
use crate::port::serial::{SerialParity, SerialSettings};
use crate::port::PortTarget;
use crate::recorder::csv_export::CsvExportSettings;
use crate::recorder::RecorderSettings;
use crate::retention::RetentionPolicy;
use crate::stabilization::{CurrentSource, StabilizationParams};
use common::sqlite::VacuumMode;

/// Environment prefix for overrides, e.g. `HVSRV_SERIAL__PORT=/dev/ttyUSB1`
pub const ENV_PREFIX: &str = "HVSRV_";

/// Default config file location
pub const DEFAULT_CONFIG_PATH: &str = "config/hvsrv.yaml";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct HvsrvConfig {
    pub logging: LoggingSection,
    pub serial: SerialSection,
    pub driver: DriverSection,
    pub recorder: RecorderSection,
    pub csv: CsvSection,
    pub retention: RetentionSection,
    pub stabilization: StabilizationParams,
    pub poller: PollerSection,
    pub meters: Vec<MeterSection>,
    pub session: SessionSection,
}

// ============================================================================
// Sections
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSection {
    /// Log root; `HVSRV_LOG_DIR` takes precedence
    pub dir: Option<String>,
    pub level: String,
    pub json: bool,
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            dir: None,
            level: "info".to_string(),
            json: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SerialSection {
    pub port: String,
    pub baud: u32,
    pub data_bits: u8,
    pub parity: SerialParity,
    pub stop_bits: u8,
    pub open_settle_ms: u64,
    /// Connect the HAPS06 when `run` starts
    pub connect_on_start: bool,
}

impl Default for SerialSection {
    fn default() -> Self {
        Self {
            port: "/dev/ttyUSB0".to_string(),
            baud: 9600,
            data_bits: 8,
            parity: SerialParity::None,
            stop_bits: 1,
            open_settle_ms: 250,
            connect_on_start: false,
        }
    }
}

impl SerialSection {
    pub fn target(&self) -> PortTarget {
        PortTarget::new(self.port.clone(), self.baud)
    }

    pub fn settings(&self) -> SerialSettings {
        SerialSettings {
            data_bits: self.data_bits,
            parity: self.parity,
            stop_bits: self.stop_bits,
            open_settle: Duration::from_millis(self.open_settle_ms),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectSection {
    /// 0 means unlimited
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub backoff_multiplier: f64,
    pub jitter: bool,
}

impl Default for ReconnectSection {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay_ms: 500,
            max_delay_ms: 5000,
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DriverSection {
    pub probe_timeout_ms: u64,
    pub probe_budget_ms: u64,
    pub io_timeout_ms: u64,
    pub inter_frame_ms: u64,
    pub failure_threshold: u32,
    pub restore_manual_setpoint: bool,
    /// Address tried first on the very first connect
    pub initial_slave_addr: u8,
    pub reconnect: ReconnectSection,
}

impl Default for DriverSection {
    fn default() -> Self {
        Self {
            probe_timeout_ms: 250,
            probe_budget_ms: 1200,
            io_timeout_ms: 500,
            inter_frame_ms: 6,
            failure_threshold: 5,
            restore_manual_setpoint: false,
            initial_slave_addr: 1,
            reconnect: ReconnectSection::default(),
        }
    }
}

impl DriverSection {
    pub fn to_settings(&self) -> DriverSettings {
        DriverSettings {
            probe_timeout: Duration::from_millis(self.probe_timeout_ms),
            probe_budget: Duration::from_millis(self.probe_budget_ms),
            io_timeout: Duration::from_millis(self.io_timeout_ms),
            inter_frame: Duration::from_millis(self.inter_frame_ms),
            failure_threshold: self.failure_threshold,
            restore_manual_setpoint: self.restore_manual_setpoint,
            initial_slave_addr: self.initial_slave_addr,
            reconnect: ReconnectPolicy {
                max_attempts: self.reconnect.max_attempts,
                initial_delay: Duration::from_millis(self.reconnect.initial_delay_ms),
                max_delay: Duration::from_millis(self.reconnect.max_delay_ms),
                backoff_multiplier: self.reconnect.backoff_multiplier,
                jitter: self.reconnect.jitter,
            },
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RecorderSection {
    pub path: PathBuf,
    pub commit_every_rows: usize,
    pub commit_every_ms: u64,
    pub queue_capacity: usize,
}

impl Default for RecorderSection {
    fn default() -> Self {
        Self {
            path: PathBuf::from("data/hv_data.db"),
            commit_every_rows: 200,
            commit_every_ms: 500,
            queue_capacity: 20_000,
        }
    }
}

impl RecorderSection {
    pub fn to_settings(&self) -> RecorderSettings {
        RecorderSettings {
            path: self.path.clone(),
            commit_every_rows: self.commit_every_rows,
            commit_every: Duration::from_millis(self.commit_every_ms),
            queue_capacity: self.queue_capacity,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CsvSection {
    /// Base path without extension; `None` disables the CSV export
    pub path: Option<PathBuf>,
    pub batch_size: usize,
    pub flush_interval_ms: u64,
    pub retry_interval_ms: u64,
}

impl Default for CsvSection {
    fn default() -> Self {
        Self {
            path: None,
            batch_size: 100,
            flush_interval_ms: 1000,
            retry_interval_ms: 2000,
        }
    }
}

impl CsvSection {
    pub fn to_settings(&self, base: PathBuf) -> CsvExportSettings {
        CsvExportSettings {
            base_path: base,
            batch_size: self.batch_size,
            flush_interval: Duration::from_millis(self.flush_interval_ms),
            retry_interval: Duration::from_millis(self.retry_interval_ms),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetentionSection {
    pub enabled: bool,
    pub keep_days: u32,
    pub keep_runs: u32,
    pub archive_before_delete: bool,
    pub archive_dir: PathBuf,
    pub vacuum_mode: VacuumMode,
    /// Seconds between periodic passes; 0 disables the periodic task
    pub interval_secs: u64,
}

impl Default for RetentionSection {
    fn default() -> Self {
        Self {
            enabled: true,
            keep_days: 30,
            keep_runs: 200,
            archive_before_delete: true,
            archive_dir: PathBuf::from("data/archive"),
            vacuum_mode: VacuumMode::Incremental,
            interval_secs: 6 * 3600,
        }
    }
}

impl RetentionSection {
    pub fn to_policy(&self) -> RetentionPolicy {
        RetentionPolicy::load(
            self.enabled,
            self.keep_days,
            self.keep_runs,
            self.archive_before_delete,
            self.archive_dir.clone(),
            self.vacuum_mode,
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PollerSection {
    pub interval_ms: u64,
}

impl Default for PollerSection {
    fn default() -> Self {
        Self { interval_ms: 500 }
    }
}

/// One instrument reader. `channel` names the feed channel it publishes;
/// rows record `cathode`, `gate`, `anode`, `backup` and `vacuum`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MeterSection {
    pub channel: String,
    pub kind: MeterKind,
    pub port: String,
    #[serde(default = "default_meter_baud")]
    pub baud: u32,
    /// CM52 gauge channel, ignored for multimeters
    #[serde(default = "default_gauge_channel")]
    pub gauge_channel: u8,
    #[serde(default = "default_meter_poll_ms")]
    pub poll_ms: u64,
}

fn default_meter_baud() -> u32 {
    dmm::DEFAULT_BAUD
}

fn default_gauge_channel() -> u8 {
    cm52::DEFAULT_CHANNEL
}

fn default_meter_poll_ms() -> u64 {
    300
}

impl MeterSection {
    pub fn target(&self) -> PortTarget {
        PortTarget::new(self.port.clone(), self.baud)
    }

    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.poll_ms)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionSection {
    /// Start a stabilization session once the HAPS06 is connected
    pub stabilize_on_start: bool,
}

// ============================================================================
// Validation
// ============================================================================

impl HvsrvConfig {
    /// Reject values the actors cannot run with
    pub fn validate(&self) -> HvResult<()> {
        if self.serial.port.trim().is_empty() {
            return Err(HvError::config("serial.port must not be empty"));
        }
        if self.serial.baud == 0 {
            return Err(HvError::config("serial.baud must be positive"));
        }
        if !(5..=8).contains(&self.serial.data_bits) {
            return Err(HvError::config(format!(
                "serial.data_bits must be 5..=8, got {}",
                self.serial.data_bits
            )));
        }
        if !matches!(self.serial.stop_bits, 1 | 2) {
            return Err(HvError::config(format!(
                "serial.stop_bits must be 1 or 2, got {}",
                self.serial.stop_bits
            )));
        }
        if !(1..=64).contains(&self.driver.initial_slave_addr) {
            return Err(HvError::config(format!(
                "driver.initial_slave_addr must be 1..=64, got {}",
                self.driver.initial_slave_addr
            )));
        }
        if self.driver.probe_timeout_ms == 0 || self.driver.io_timeout_ms == 0 {
            return Err(HvError::config("driver timeouts must be positive"));
        }
        if self.driver.probe_budget_ms < self.driver.probe_timeout_ms {
            return Err(HvError::config(
                "driver.probe_budget_ms must cover at least one probe",
            ));
        }
        if self.driver.failure_threshold == 0 {
            return Err(HvError::config("driver.failure_threshold must be positive"));
        }
        if self.driver.reconnect.backoff_multiplier < 1.0 {
            return Err(HvError::config(
                "driver.reconnect.backoff_multiplier must be >= 1.0",
            ));
        }
        if self.recorder.commit_every_rows == 0 || self.recorder.queue_capacity == 0 {
            return Err(HvError::config(
                "recorder.commit_every_rows and queue_capacity must be positive",
            ));
        }
        if self.csv.batch_size == 0 {
            return Err(HvError::config("csv.batch_size must be positive"));
        }
        if self.retention.enabled && self.retention.keep_runs == 0 && self.retention.keep_days == 0
        {
            return Err(HvError::config(
                "retention with keep_days=0 and keep_runs=0 would delete every run",
            ));
        }
        self.stabilization.check()?;
        self.validate_meters()?;
        if self.session.stabilize_on_start && !self.serial.connect_on_start {
            return Err(HvError::config(
                "session.stabilize_on_start needs serial.connect_on_start",
            ));
        }
        Ok(())
    }

    fn validate_meters(&self) -> HvResult<()> {
        for (i, meter) in self.meters.iter().enumerate() {
            if meter.channel.trim().is_empty() || meter.port.trim().is_empty() {
                return Err(HvError::config(format!(
                    "meters[{i}]: channel and port must not be empty"
                )));
            }
            if meter.baud == 0 {
                return Err(HvError::config(format!("meters[{i}].baud must be positive")));
            }
            if self.meters[..i].iter().any(|m| m.channel == meter.channel) {
                return Err(HvError::config(format!(
                    "meters[{i}]: channel '{}' configured twice",
                    meter.channel
                )));
            }
        }
        if let CurrentSource::Meter(channel) = &self.stabilization.current_source {
            if self.session.stabilize_on_start && !self.meters.iter().any(|m| &m.channel == channel) {
                return Err(HvError::config(format!(
                    "stabilization.current_source reads '{channel}' but no meter publishes it"
                )));
            }
        }
        Ok(())
    }
}
