//! Acquisition session wiring used by `hvsrv run`
//!
//! Meter readers publish onto one [`MeterFeed`]. Each voltage the poller
//! reports is combined with the freshest meter values into an
//! [`AcquisitionRow`] for the recorder and the CSV export, while a
//! [`StabilizationController`] may regulate the same source from that feed.

use std::sync::Arc;
use std::time::Duration;

use chrono::Local;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::MeterSection;
use crate::meter::MeterFeed;
use crate::meters::{reopen_policy, Cm52Protocol, DmmProtocol, MeterKind, MeterReader};
use crate::poller::PollerEvent;
use crate::port::PortOpener;
use crate::recorder::csv_export::CsvExportHandle;
use crate::recorder::row::{AcquisitionRow, Readings};
use crate::recorder::AcquisitionRecorder;
use crate::stabilization::StabilizationEvent;

pub const CATHODE: &str = "cathode";
pub const GATE: &str = "gate";
pub const ANODE: &str = "anode";
pub const BACKUP: &str = "backup";
pub const VACUUM: &str = "vacuum";

/// Start one reader per configured meter, all opened through `opener`
pub fn spawn_meter_readers<O: PortOpener>(
    opener: Arc<O>,
    sections: &[MeterSection],
    feed: &MeterFeed,
) -> Vec<MeterReader> {
    sections
        .iter()
        .map(|meter| {
            let publisher = feed.publisher(meter.channel.clone());
            match meter.kind {
                MeterKind::Dmm => MeterReader::spawn(
                    opener.clone(),
                    meter.target(),
                    DmmProtocol::new(meter.interval()),
                    publisher,
                    reopen_policy(),
                ),
                MeterKind::Cm52 => MeterReader::spawn(
                    opener.clone(),
                    meter.target(),
                    Cm52Protocol::new(meter.gauge_channel, meter.interval()),
                    publisher,
                    reopen_policy(),
                ),
            }
        })
        .collect()
}

/// Row readings from the feed: currents in µA, vacuum in Pa. Missing or
/// stale channels read 0.
pub fn sample_readings(feed: &MeterFeed, hv_voltage: Option<f64>, max_age: Duration) -> Readings {
    let current = |channel| feed.current_ua(channel, max_age).unwrap_or(0.0);
    Readings {
        hv_voltage,
        cathode: current(CATHODE),
        gate: current(GATE),
        anode: current(ANODE),
        backup: current(BACKUP),
        vacuum: feed.value(VACUUM, max_age).unwrap_or(0.0),
        keithley_voltage: 0.0,
    }
}

/// Record every polled voltage, with the meter values of the moment, into
/// the open run and the CSV export
pub fn spawn_forwarder(
    mut events: broadcast::Receiver<PollerEvent>,
    feed: MeterFeed,
    max_age: Duration,
    recorder: Arc<AcquisitionRecorder>,
    csv: Option<Arc<CsvExportHandle>>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => break,
                event = events.recv() => event,
            };
            match event {
                Ok(PollerEvent::Voltage(volts)) => {
                    let now = Local::now();
                    let row = AcquisitionRow::from_readings(
                        now,
                        sample_readings(&feed, Some(volts), max_age),
                    );
                    if let Some(csv) = &csv {
                        if let Err(e) = csv.add_rows(vec![row.clone()]).await {
                            warn!("CSV export rejected row: {}", e);
                        }
                    }
                    recorder.enqueue_row(now.timestamp_millis(), row);
                },
                Ok(PollerEvent::Error(msg)) => warn!("Poller: {}", msg),
                Err(RecvError::Lagged(n)) => warn!("Forwarder lagged by {} poller events", n),
                Err(RecvError::Closed) => break,
            }
        }
    })
}

/// Log session events and mark stability changes in the recorded data.
/// Runs until the controller is dropped.
pub fn spawn_session_log(
    mut events: broadcast::Receiver<StabilizationEvent>,
    recorder: Arc<AcquisitionRecorder>,
    csv: Option<Arc<CsvExportHandle>>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let marker = match events.recv().await {
                Ok(StabilizationEvent::Status(text)) => {
                    info!("Stabilization: {}", text);
                    continue;
                },
                Ok(StabilizationEvent::VoltageSet { volts }) => {
                    debug!("Stabilization setpoint {:.1} V", volts);
                    continue;
                },
                Ok(StabilizationEvent::Stable { current_ua }) => {
                    info!("Current stable at {:.2} uA", current_ua);
                    format!("stable {current_ua:.2} uA")
                },
                Ok(StabilizationEvent::Stopped) => "stabilization stopped".to_string(),
                Err(RecvError::Lagged(n)) => {
                    warn!("Session log lagged by {} events", n);
                    continue;
                },
                Err(RecvError::Closed) => break,
            };
            recorder.enqueue_marker(Local::now().timestamp_millis(), &marker);
            if let Some(csv) = &csv {
                if let Err(e) = csv.add_marker(marker).await {
                    warn!("CSV export rejected marker: {}", e);
                }
            }
        }
    })
}
