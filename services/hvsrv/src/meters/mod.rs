//! Instrument readers that feed [`MeterFeed`](crate::meter::MeterFeed)
//!
//! Each reader owns one port through a [`PortWorker`] and the only
//! [`MeterPublisher`] for its channel. A lost or unopenable port is retried
//! with exponential backoff capped at 10 s until the reader stops.

pub mod cm52;
pub mod dmm;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::HvResult;
use crate::meter::{MeterPublisher, MeterUnit};
use crate::modbus::reconnect::{ReconnectHelper, ReconnectPolicy};
use crate::port::{PortEvent, PortOpener, PortTarget, PortWorker, SerialIo};

pub use cm52::Cm52Protocol;
pub use dmm::DmmProtocol;

/// Wait after a read error before the port is reopened
const REOPEN_PAUSE: Duration = Duration::from_secs(2);

/// Supported instrument families
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MeterKind {
    Dmm,
    Cm52,
}

/// One poll of an instrument over its worker
#[async_trait]
pub trait MeterProtocol: Send + 'static {
    fn name(&self) -> &'static str;

    /// Unit tagged on invalid readings
    fn idle_unit(&self) -> MeterUnit;

    /// Pause between polls
    fn interval(&self) -> Duration;

    /// `Ok(None)` when nothing usable arrived this time
    async fn poll<P: SerialIo>(&mut self, worker: &PortWorker<P>) -> HvResult<Option<(f64, MeterUnit)>>;

    /// Forget partial input after the port is reopened
    fn reset(&mut self) {}
}

/// Backoff used while a meter port is unavailable
pub fn reopen_policy() -> ReconnectPolicy {
    ReconnectPolicy {
        max_attempts: 0,
        initial_delay: Duration::from_secs(1),
        max_delay: Duration::from_secs(10),
        backoff_multiplier: 2.0,
        jitter: false,
    }
}

pub struct MeterReader {
    channel: String,
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl MeterReader {
    pub fn spawn<O, M>(
        opener: Arc<O>,
        target: PortTarget,
        protocol: M,
        publisher: MeterPublisher,
        policy: ReconnectPolicy,
    ) -> Self
    where
        O: PortOpener,
        M: MeterProtocol,
    {
        let cancel = CancellationToken::new();
        let channel = publisher.channel().to_string();
        info!(
            "{} reader for '{}' starting on {}",
            protocol.name(),
            channel,
            target
        );
        let handle = tokio::spawn(read_loop(
            opener,
            target,
            protocol,
            publisher,
            ReconnectHelper::new(policy),
            cancel.clone(),
        ));
        Self {
            channel,
            cancel,
            handle,
        }
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    pub async fn stop(self) {
        self.cancel.cancel();
        if tokio::time::timeout(Duration::from_secs(3), self.handle)
            .await
            .is_err()
        {
            warn!("Meter reader '{}' did not stop in time", self.channel);
        }
    }
}

async fn read_loop<O, M>(
    opener: Arc<O>,
    target: PortTarget,
    mut protocol: M,
    publisher: MeterPublisher,
    mut reconnect: ReconnectHelper,
    cancel: CancellationToken,
) where
    O: PortOpener,
    M: MeterProtocol,
{
    let (port_events, _) = broadcast::channel::<PortEvent>(16);

    'outer: while !cancel.is_cancelled() {
        let opened = reconnect
            .execute_reconnect(&cancel, |_attempt| {
                let opener = opener.clone();
                let target = target.clone();
                let port_events = port_events.clone();
                async move { PortWorker::start(opener.as_ref(), target, port_events).await }
            })
            .await;
        let worker = match opened {
            Ok(worker) => worker,
            // Unlimited attempts: only cancellation ends the wait
            Err(e) => {
                debug!("{} reader for '{}' gave up: {}", protocol.name(), publisher.channel(), e);
                break;
            },
        };
        reconnect.mark_connected();
        protocol.reset();
        info!("{} connected on {}", protocol.name(), target);

        loop {
            let polled = tokio::select! {
                _ = cancel.cancelled() => {
                    worker.stop().await;
                    break 'outer;
                }
                r = protocol.poll(&worker) => r,
            };

            match polled {
                Ok(Some((value, unit))) => publisher.publish_reading(value, unit),
                Ok(None) => {},
                Err(e) => {
                    warn!(
                        "{} read error on {}: {}; reopening",
                        protocol.name(),
                        target,
                        e
                    );
                    publisher.publish_invalid(protocol.idle_unit());
                    worker.stop().await;
                    reconnect.mark_disconnected();
                    tokio::select! {
                        _ = cancel.cancelled() => break 'outer,
                        _ = tokio::time::sleep(REOPEN_PAUSE) => {}
                    }
                    continue 'outer;
                },
            }

            tokio::select! {
                _ = cancel.cancelled() => {
                    worker.stop().await;
                    break 'outer;
                }
                _ = tokio::time::sleep(protocol.interval()) => {}
            }
        }
    }
    debug!("Meter reader '{}' stopped", publisher.channel());
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;
    use crate::error::HvError;
    use crate::meter::{CurrentUnit, MeterFeed, DEFAULT_MAX_AGE};
    use parking_lot::Mutex;
    use std::collections::VecDeque;
    use std::io;
    use std::sync::atomic::{AtomicUsize, Ordering};

    // ========================================================================
    // Scripted instrument
    // ========================================================================

    /// Replies to writes with `reply`, or streams `stream` unprompted
    #[derive(Clone, Default)]
    struct Script {
        reply: Option<Vec<u8>>,
        stream: Option<Vec<u8>>,
        fail_opens: Arc<AtomicUsize>,
        opens: Arc<AtomicUsize>,
        writes: Arc<Mutex<Vec<Vec<u8>>>>,
    }

    struct ScriptPort {
        script: Script,
        rx: VecDeque<u8>,
    }

    #[async_trait]
    impl SerialIo for ScriptPort {
        async fn write_all(&mut self, data: &[u8]) -> io::Result<()> {
            self.script.writes.lock().push(data.to_vec());
            if let Some(reply) = &self.script.reply {
                self.rx.extend(reply.iter().copied());
            }
            Ok(())
        }

        async fn read_some(&mut self, buf: &mut [u8], limit: Duration) -> io::Result<usize> {
            if self.rx.is_empty() {
                if let Some(stream) = &self.script.stream {
                    self.rx.extend(stream.iter().copied());
                }
            }
            if self.rx.is_empty() {
                tokio::time::sleep(limit).await;
                return Ok(0);
            }
            let n = buf.len().min(self.rx.len());
            for (slot, b) in buf.iter_mut().zip(self.rx.drain(..n)) {
                *slot = b;
            }
            Ok(n)
        }

        async fn clear_buffers(&mut self) -> io::Result<()> {
            self.rx.clear();
            Ok(())
        }
    }

    #[async_trait]
    impl PortOpener for Script {
        type Port = ScriptPort;

        async fn open(&self, target: &PortTarget) -> HvResult<ScriptPort> {
            let left = self.fail_opens.load(Ordering::SeqCst);
            if left > 0 {
                self.fail_opens.store(left - 1, Ordering::SeqCst);
                return Err(HvError::connection(format!("cannot open {}", target.port)));
            }
            self.opens.fetch_add(1, Ordering::SeqCst);
            Ok(ScriptPort {
                script: self.clone(),
                rx: VecDeque::new(),
            })
        }
    }

    fn dmm_frame(digits: [u8; 5]) -> Vec<u8> {
        let mut f = vec![0x30];
        f.extend(digits.iter().map(|d| 0x30 | d));
        f.extend_from_slice(&[0x3D, 0x30, 0x30, 0x30, 0x30, 0x30, 0x0D, 0x0A]);
        f
    }

    async fn wait_for(feed: &MeterFeed, channel: &str) -> Arc<crate::meter::MeterSnapshot> {
        loop {
            if let Some(snap) = feed.latest(channel) {
                if snap.valid {
                    return snap;
                }
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    // ========================================================================
    // Tests
    // ========================================================================

    #[tokio::test(start_paused = true)]
    async fn test_dmm_reader_publishes_current() {
        let script = Script {
            stream: Some(dmm_frame([0, 2, 5, 0, 0])),
            ..Script::default()
        };
        let feed = MeterFeed::new();
        let reader = MeterReader::spawn(
            Arc::new(script),
            PortTarget::new("dmm0", dmm::DEFAULT_BAUD),
            DmmProtocol::new(Duration::from_millis(200)),
            feed.publisher("anode"),
            reopen_policy(),
        );

        let snap = wait_for(&feed, "anode").await;
        assert_eq!(snap.unit, MeterUnit::Current(CurrentUnit::MicroAmp));
        assert_eq!(feed.current_ua("anode", DEFAULT_MAX_AGE), Some(25.0));
        assert_eq!(reader.channel(), "anode");
        reader.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_cm52_reader_queries_channel() {
        let script = Script {
            reply: Some(b"0,\t1.5E-03\r\n".to_vec()),
            ..Script::default()
        };
        let writes = script.writes.clone();
        let feed = MeterFeed::new();
        let reader = MeterReader::spawn(
            Arc::new(script),
            PortTarget::new("cm52", cm52::DEFAULT_BAUD),
            Cm52Protocol::new(cm52::DEFAULT_CHANNEL, Duration::from_millis(300)),
            feed.publisher("vacuum"),
            reopen_policy(),
        );

        let snap = wait_for(&feed, "vacuum").await;
        assert_eq!(snap.unit, MeterUnit::Pascal);
        assert!((snap.value - 1.5e-3).abs() < 1e-12);
        assert_eq!(writes.lock()[0], b"RPV3\r".to_vec());

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(writes.lock().len() >= 2);
        assert!(feed.value("vacuum", DEFAULT_MAX_AGE).is_some());
        reader.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_reader_retries_open_with_backoff() {
        let script = Script {
            stream: Some(dmm_frame([0, 1, 0, 0, 0])),
            ..Script::default()
        };
        script.fail_opens.store(3, Ordering::SeqCst);
        let opens = script.opens.clone();
        let feed = MeterFeed::new();
        let started = tokio::time::Instant::now();
        let reader = MeterReader::spawn(
            Arc::new(script),
            PortTarget::new("dmm0", dmm::DEFAULT_BAUD),
            DmmProtocol::new(Duration::from_millis(200)),
            feed.publisher("cathode"),
            reopen_policy(),
        );

        wait_for(&feed, "cathode").await;
        // 2 s, 4 s and 8 s of backoff before the fourth attempt
        assert!(started.elapsed() >= Duration::from_secs(14));
        assert_eq!(opens.load(Ordering::SeqCst), 1);
        reader.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_while_port_unavailable() {
        let script = Script::default();
        script.fail_opens.store(usize::MAX, Ordering::SeqCst);
        let feed = MeterFeed::new();
        let reader = MeterReader::spawn(
            Arc::new(script),
            PortTarget::new("missing", dmm::DEFAULT_BAUD),
            DmmProtocol::new(Duration::from_millis(200)),
            feed.publisher("gate"),
            reopen_policy(),
        );

        tokio::time::sleep(Duration::from_secs(5)).await;
        reader.stop().await;
        assert!(feed.latest("gate").is_none());
    }
}
