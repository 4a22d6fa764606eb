//! Background polling of the HAPS06 output voltage

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::modbus::driver::Haps06Driver;
use crate::port::PortOpener;

const MIN_INTERVAL: Duration = Duration::from_millis(100);
const ERROR_AFTER_FAILURES: u32 = 5;
const ERROR_REPORT_GAP: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, PartialEq)]
pub enum PollerEvent {
    Voltage(f64),
    Error(String),
}

pub struct VoltagePoller {
    cancel: CancellationToken,
    events: broadcast::Sender<PollerEvent>,
    handle: JoinHandle<()>,
}

impl VoltagePoller {
    /// Start polling every `interval` (at least 100 ms)
    pub fn spawn<O: PortOpener>(driver: Arc<Haps06Driver<O>>, interval: Duration) -> Self {
        let interval = interval.max(MIN_INTERVAL);
        let cancel = CancellationToken::new();
        let (events, _) = broadcast::channel(64);

        let handle = tokio::spawn(poll_loop(driver, interval, cancel.clone(), events.clone()));
        info!("Voltage poller started ({:?})", interval);

        Self {
            cancel,
            events,
            handle,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PollerEvent> {
        self.events.subscribe()
    }

    pub async fn stop(self) {
        self.cancel.cancel();
        if tokio::time::timeout(Duration::from_secs(2), self.handle)
            .await
            .is_err()
        {
            warn!("Voltage poller did not stop in time");
        }
    }
}

async fn poll_loop<O: PortOpener>(
    driver: Arc<Haps06Driver<O>>,
    interval: Duration,
    cancel: CancellationToken,
    events: broadcast::Sender<PollerEvent>,
) {
    let mut failures: u32 = 0;
    let mut last_report: Option<Instant> = None;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(interval) => {}
        }

        if !driver.wants_reads() {
            failures = 0;
            continue;
        }

        let read = tokio::select! {
            _ = cancel.cancelled() => break,
            r = driver.read_actual_voltage() => r,
        };

        match read {
            Ok(volts) => {
                failures = 0;
                let _ = events.send(PollerEvent::Voltage(volts));
            },
            Err(e) => {
                failures += 1;
                debug!("Voltage poll failed ({} in a row): {}", failures, e);
                let due = last_report.map_or(true, |t| t.elapsed() >= ERROR_REPORT_GAP);
                if failures >= ERROR_AFTER_FAILURES && due {
                    last_report = Some(Instant::now());
                    warn!("Voltage polling failing: {}", e);
                    let _ = events.send(PollerEvent::Error(e.to_string()));
                }
            },
        }
    }
    debug!("Voltage poller stopped");
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;
    use crate::modbus::driver::DriverSettings;
    use crate::modbus::reconnect::ReconnectPolicy;
    use crate::modbus::simulator::Haps06Simulator;
    use crate::port::PortTarget;

    fn settings() -> DriverSettings {
        DriverSettings {
            probe_timeout: Duration::from_millis(15),
            io_timeout: Duration::from_millis(50),
            failure_threshold: 1000,
            reconnect: ReconnectPolicy {
                max_attempts: 1,
                jitter: false,
                ..ReconnectPolicy::default()
            },
            ..DriverSettings::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_emits_voltage() {
        let sim = Haps06Simulator::new(1);
        sim.set_actual_voltage(250.0);
        let driver = Arc::new(Haps06Driver::new(sim.opener(), settings()));
        driver.connect(PortTarget::new("sim0", 9600)).await.unwrap();

        let poller = VoltagePoller::spawn(driver.clone(), Duration::from_millis(500));
        let mut rx = poller.subscribe();
        assert_eq!(rx.recv().await.unwrap(), PollerEvent::Voltage(250.0));
        poller.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_error_reported_once_per_window() {
        let sim = Haps06Simulator::new(1);
        let driver = Arc::new(Haps06Driver::new(sim.opener(), settings()));
        driver.connect(PortTarget::new("sim0", 9600)).await.unwrap();
        sim.set_silent(true);

        let poller = VoltagePoller::spawn(driver.clone(), Duration::from_millis(100));
        let mut rx = poller.subscribe();

        tokio::time::sleep(Duration::from_secs(8)).await;
        let mut errors = 0;
        while let Ok(ev) = rx.try_recv() {
            if matches!(ev, PollerEvent::Error(_)) {
                errors += 1;
            }
        }
        assert_eq!(errors, 1);
        poller.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_while_disconnected() {
        let sim = Haps06Simulator::new(1);
        let driver = Arc::new(Haps06Driver::new(sim.opener(), settings()));

        let poller = VoltagePoller::spawn(driver, Duration::from_millis(100));
        let mut rx = poller.subscribe();
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(rx.try_recv().is_err());
        poller.stop().await;
    }
}
