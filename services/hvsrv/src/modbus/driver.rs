//! HAPS06 high-voltage source over Modbus-RTU
//!
//! State machine:
//! `Disconnected -> Connecting -> Connected -> Reconnecting -> Connected`.
//!
//! Every public operation takes the entry mutex for its whole multi-frame
//! sequence, so a setpoint write + apply + verify never interleaves with a
//! poller read. Frames themselves go through the [`PortWorker`] queue.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::{broadcast, Mutex};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::frame::{self, registers, ModbusFrame, EXCEPTION_LEN};
use super::reconnect::{ReconnectHelper, ReconnectPolicy};
use super::retry::RetryPolicy;
use crate::error::{HvError, HvResult};
use crate::port::{PortEvent, PortOpener, PortTarget, PortWorker, SerialIo};

/// Added to the I/O timeout for the worker call itself
const CALL_MARGIN: Duration = Duration::from_secs(2);
const COIL_SETTLE: Duration = Duration::from_millis(50);
const VERIFY_DELAY: Duration = Duration::from_millis(100);
const EXIT_REMOTE_TIMEOUT: Duration = Duration::from_millis(300);
const RESET_VOLTAGE: f64 = 100.0;

#[derive(Debug, Clone)]
pub struct DriverSettings {
    /// Per-address probe timeout
    pub probe_timeout: Duration,
    /// Upper bound for the whole address scan
    pub probe_budget: Duration,
    pub io_timeout: Duration,
    /// Line silence before each transmit
    pub inter_frame: Duration,
    /// Consecutive read failures that trigger a reconnect
    pub failure_threshold: u32,
    /// Restore a setpoint after reconnect even without an active session
    pub restore_manual_setpoint: bool,
    pub initial_slave_addr: u8,
    pub reconnect: ReconnectPolicy,
}

impl Default for DriverSettings {
    fn default() -> Self {
        Self {
            probe_timeout: Duration::from_millis(250),
            probe_budget: Duration::from_millis(1200),
            io_timeout: Duration::from_millis(500),
            inter_frame: Duration::from_millis(6),
            failure_threshold: 5,
            restore_manual_setpoint: false,
            initial_slave_addr: 1,
            reconnect: ReconnectPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LinkState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

/// Snapshot of the source as last seen by the driver
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ControllerState {
    pub link: LinkState,
    pub slave_addr: u8,
    pub remote_enabled: bool,
    pub setpoint_voltage: f64,
    pub last_read_voltage: Option<f64>,
    pub consecutive_failures: u32,
    pub last_target: Option<PortTarget>,
    /// A reconnect gave up; reads keep retrying until the link returns or
    /// the caller disconnects.
    pub link_lost: bool,
}

impl ControllerState {
    fn new(slave_addr: u8) -> Self {
        Self {
            link: LinkState::Disconnected,
            slave_addr,
            remote_enabled: false,
            setpoint_voltage: 0.0,
            last_read_voltage: None,
            consecutive_failures: 0,
            last_target: None,
            link_lost: false,
        }
    }
}

/// Result of a setpoint write sequence
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SetpointOutcome {
    pub requested: f64,
    pub readback: Option<f64>,
    pub verified: bool,
    pub attempts: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub enum DriverEvent {
    Connected { port: String, slave_addr: u8 },
    Disconnected,
    RemoteControl { enabled: bool },
    VoltageRead { volts: f64 },
    SetpointApplied { outcome: SetpointOutcome },
    ReconnectStarted { reason: String },
    ReconnectFinished { ok: bool },
}

struct Inner<P: SerialIo> {
    worker: Option<PortWorker<P>>,
    state: ControllerState,
    reconnect: ReconnectHelper,
    /// Remote mode to restore once a lost link comes back
    restore_remote: bool,
}

pub struct Haps06Driver<O: PortOpener> {
    opener: Arc<O>,
    settings: DriverSettings,
    inner: Mutex<Inner<O::Port>>,
    snapshot: RwLock<ControllerState>,
    events: broadcast::Sender<DriverEvent>,
    port_events: broadcast::Sender<PortEvent>,
    session_active: AtomicBool,
    cancel: parking_lot::Mutex<CancellationToken>,
}

// ============================================================================
// Frame exchange and address probing
// ============================================================================

/// One request/response round trip on the worker: inter-frame silence,
/// buffer clear, write, fixed-length read. The reply is validated before it
/// is returned.
async fn exchange<P: SerialIo>(
    worker: &PortWorker<P>,
    request: ModbusFrame,
    io_timeout: Duration,
    inter_frame: Duration,
) -> HvResult<Vec<u8>> {
    let expected = request.expected_response_len();
    let wire = request.encode();
    let sent = wire.clone();

    let raw = worker
        .submit(io_timeout + CALL_MARGIN, move |port: &mut P| {
            async move {
                tokio::time::sleep(inter_frame).await;
                port.clear_buffers().await?;
                debug!(
                    hex_data = %common::hex::encode_frame(&wire),
                    direction = "send",
                    "[HAPS06] TX"
                );
                port.write_all(&wire).await?;

                let deadline = Instant::now() + io_timeout;
                let mut raw = port
                    .read_exact_within(expected.min(EXCEPTION_LEN), io_timeout)
                    .await?;
                let is_exception = raw.len() == EXCEPTION_LEN && raw[1] & 0x80 != 0;
                if raw.len() == EXCEPTION_LEN && !is_exception && expected > EXCEPTION_LEN {
                    let left = deadline.saturating_duration_since(Instant::now());
                    let rest = port.read_exact_within(expected - raw.len(), left).await?;
                    raw.extend_from_slice(&rest);
                }
                Ok(raw)
            }
            .boxed()
        })
        .await?;

    debug!(
        hex_data = %common::hex::encode_frame(&raw),
        direction = "recv",
        "[HAPS06] RX"
    );
    frame::check_response(&sent, &raw, expected)?;
    Ok(raw)
}

/// Find the slave address: `hint` first, then 1..=64. Each probe is bounded
/// by `probe_timeout`, the whole scan by `probe_budget`.
pub async fn probe_address<P: SerialIo>(
    worker: &PortWorker<P>,
    hint: u8,
    settings: &DriverSettings,
) -> HvResult<u8> {
    let started = Instant::now();
    let first = (1..=64).contains(&hint).then_some(hint);
    let candidates = first.into_iter().chain((1..=64u8).filter(|a| Some(*a) != first));

    for addr in candidates {
        let elapsed = started.elapsed();
        if elapsed >= settings.probe_budget {
            break;
        }
        let limit = settings.probe_timeout.min(settings.probe_budget - elapsed);
        let request = ModbusFrame::read_holding(addr, registers::MODEL, 1);

        match exchange(worker, request, limit, settings.inter_frame).await {
            Ok(resp) if resp[0] == addr && resp[1] == 0x03 && resp[2] == 0x02 => {
                info!("HAPS06 answered at address {} after {:?}", addr, started.elapsed());
                return Ok(addr);
            },
            Ok(_) => debug!("Probe {}: unexpected reply", addr),
            Err(HvError::NotOpen(msg)) => return Err(HvError::connection(msg)),
            Err(e) => debug!("Probe {}: {}", addr, e),
        }
    }

    Err(HvError::connection(format!(
        "no HAPS06 answered within {:?}",
        settings.probe_budget
    )))
}

/// Open a fresh worker and probe the slave. The worker is stopped again
/// when no slave answers.
async fn open_and_probe<O: PortOpener>(
    opener: &O,
    target: &PortTarget,
    settings: &DriverSettings,
    port_events: broadcast::Sender<PortEvent>,
    hint: u8,
) -> HvResult<(PortWorker<O::Port>, u8)> {
    let worker = PortWorker::start(opener, target.clone(), port_events)
        .await
        .map_err(|e| match e {
            HvError::ConnectionError(_) => e,
            other => HvError::connection(other.to_string()),
        })?;

    match probe_address(&worker, hint, settings).await {
        Ok(addr) => Ok((worker, addr)),
        Err(e) => {
            worker.stop().await;
            Err(e)
        },
    }
}

// ============================================================================
// Driver
// ============================================================================

impl<O: PortOpener> Haps06Driver<O> {
    pub fn new(opener: O, settings: DriverSettings) -> Self {
        let (events, _) = broadcast::channel(256);
        let (port_events, _) = broadcast::channel(64);
        let state = ControllerState::new(settings.initial_slave_addr);
        Self {
            opener: Arc::new(opener),
            inner: Mutex::new(Inner {
                worker: None,
                state: state.clone(),
                reconnect: ReconnectHelper::new(settings.reconnect.clone()),
                restore_remote: false,
            }),
            snapshot: RwLock::new(state),
            events,
            port_events,
            session_active: AtomicBool::new(false),
            cancel: parking_lot::Mutex::new(CancellationToken::new()),
            settings,
        }
    }

    pub fn settings(&self) -> &DriverSettings {
        &self.settings
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DriverEvent> {
        self.events.subscribe()
    }

    pub fn subscribe_port(&self) -> broadcast::Receiver<PortEvent> {
        self.port_events.subscribe()
    }

    /// Last published state; may lag an operation in progress
    pub fn state(&self) -> ControllerState {
        self.snapshot.read().clone()
    }

    pub fn is_connected(&self) -> bool {
        self.snapshot.read().link == LinkState::Connected
    }

    /// Connected, or lost and still being brought back by reads
    pub fn wants_reads(&self) -> bool {
        let state = self.snapshot.read();
        state.link == LinkState::Connected || state.link_lost
    }

    /// Mark a test or stabilization session for the reconnect restore rule
    pub fn set_session_active(&self, active: bool) {
        self.session_active.store(active, Ordering::Release);
    }

    pub fn session_active(&self) -> bool {
        self.session_active.load(Ordering::Acquire)
    }

    fn publish(&self, state: &ControllerState) {
        *self.snapshot.write() = state.clone();
    }

    fn emit(&self, event: DriverEvent) {
        let _ = self.events.send(event);
    }

    fn io_timeout(&self) -> Duration {
        self.settings.io_timeout
    }

    /// Open the port, settle and probe the slave address.
    pub async fn connect(&self, target: PortTarget) -> HvResult<u8> {
        *self.cancel.lock() = CancellationToken::new();
        let mut guard = self.inner.lock().await;
        let inner = &mut *guard;

        if let Some(old) = inner.worker.take() {
            old.stop().await;
        }
        inner.state.link_lost = false;
        inner.restore_remote = false;
        inner.state.link = LinkState::Connecting;
        inner.state.remote_enabled = false;
        self.publish(&inner.state);

        let hint = inner.state.slave_addr;
        info!("Connecting HAPS06 on {}", target);
        match open_and_probe(
            self.opener.as_ref(),
            &target,
            &self.settings,
            self.port_events.clone(),
            hint,
        )
        .await
        {
            Ok((worker, addr)) => {
                inner.worker = Some(worker);
                inner.state.slave_addr = addr;
                inner.state.link = LinkState::Connected;
                inner.state.consecutive_failures = 0;
                inner.state.last_target = Some(target.clone());
                inner.reconnect.mark_connected();
                self.publish(&inner.state);
                self.emit(DriverEvent::Connected {
                    port: target.port,
                    slave_addr: addr,
                });
                Ok(addr)
            },
            Err(e) => {
                warn!("HAPS06 connect failed on {}: {}", target, e);
                inner.state.link = LinkState::Disconnected;
                self.publish(&inner.state);
                Err(e)
            },
        }
    }

    /// Best-effort exit from remote control, then close the port.
    /// Cancels a reconnect in progress.
    pub async fn disconnect(&self) {
        self.cancel.lock().cancel();
        let mut guard = self.inner.lock().await;
        let inner = &mut *guard;

        if let Some(worker) = inner.worker.take() {
            if inner.state.remote_enabled {
                let request = ModbusFrame::write_coil(
                    inner.state.slave_addr,
                    registers::REMOTE_COIL,
                    false,
                );
                if let Err(e) =
                    exchange(&worker, request, EXIT_REMOTE_TIMEOUT, self.settings.inter_frame).await
                {
                    debug!("Exit remote on disconnect: {}", e);
                }
            }
            worker.stop().await;
        }

        inner.state.link = LinkState::Disconnected;
        inner.state.remote_enabled = false;
        inner.state.consecutive_failures = 0;
        inner.state.link_lost = false;
        inner.restore_remote = false;
        inner.reconnect.mark_disconnected();
        self.publish(&inner.state);
        self.emit(DriverEvent::Disconnected);
        info!("HAPS06 disconnected");
    }

    pub async fn enable_remote_control(&self) -> HvResult<()> {
        let mut inner = self.inner.lock().await;
        self.write_remote_locked(&mut inner, true).await
    }

    pub async fn exit_remote_control(&self) -> HvResult<()> {
        let mut inner = self.inner.lock().await;
        self.write_remote_locked(&mut inner, false).await
    }

    async fn write_remote_locked(
        &self,
        inner: &mut Inner<O::Port>,
        enable: bool,
    ) -> HvResult<()> {
        let Inner { worker, state, .. } = inner;
        let worker = worker
            .as_ref()
            .ok_or_else(|| HvError::not_open("HAPS06 not connected"))?;

        let request = ModbusFrame::write_coil(state.slave_addr, registers::REMOTE_COIL, enable);
        let wire = request.encode();
        let policy = RetryPolicy::coil();
        let mut last_err = None;

        for attempt in policy.attempts() {
            let result = exchange(worker, request.clone(), self.io_timeout(), self.settings.inter_frame)
                .await
                .and_then(|resp| {
                    if resp == wire {
                        Ok(())
                    } else {
                        Err(HvError::protocol("coil echo does not match request"))
                    }
                });
            match result {
                Ok(()) => {
                    tokio::time::sleep(COIL_SETTLE).await;
                    state.remote_enabled = enable;
                    state.consecutive_failures = 0;
                    self.publish(state);
                    self.emit(DriverEvent::RemoteControl { enabled: enable });
                    info!("HAPS06 remote control {}", if enable { "enabled" } else { "exited" });
                    return Ok(());
                },
                Err(e) => {
                    warn!("Remote control write failed (attempt {}): {}", attempt, e);
                    last_err = Some(e);
                    policy.pause(attempt).await;
                },
            }
        }
        Err(last_err.unwrap_or_else(|| HvError::protocol("remote control write failed")))
    }

    /// Read VS. One short retry; after `failure_threshold` consecutive
    /// failures the link is rebuilt before the error is returned. A link
    /// whose reconnect gave up is retried the same way on later reads.
    pub async fn read_actual_voltage(&self) -> HvResult<f64> {
        let mut guard = self.inner.lock().await;
        let result = self.read_actual_locked(&mut guard).await;

        if result.is_err() && guard.worker.is_none() && guard.state.link_lost {
            guard.state.consecutive_failures += 1;
            self.publish(&guard.state);
        }

        let recoverable = guard.worker.is_some() || guard.state.link_lost;
        if result.is_err()
            && recoverable
            && guard.state.consecutive_failures >= self.settings.failure_threshold
        {
            let reason = format!(
                "{} consecutive read failures",
                guard.state.consecutive_failures
            );
            guard.state.consecutive_failures = 0;
            self.reconnect_locked(&mut guard, &reason).await;
        }
        result
    }

    async fn read_actual_locked(&self, inner: &mut Inner<O::Port>) -> HvResult<f64> {
        let Inner { worker, state, .. } = inner;
        let worker = worker
            .as_ref()
            .ok_or_else(|| HvError::not_open("HAPS06 not connected"))?;

        let request = ModbusFrame::read_holding(state.slave_addr, registers::VS, 2);
        let policy = RetryPolicy::reads();
        let mut last_err = None;

        for attempt in policy.attempts() {
            let result = exchange(worker, request.clone(), self.io_timeout(), self.settings.inter_frame)
                .await
                .and_then(|resp| frame::decode_f32(frame::register_data(&resp)?));
            match result {
                Ok(volts) => {
                    state.last_read_voltage = Some(volts);
                    state.consecutive_failures = 0;
                    self.publish(state);
                    self.emit(DriverEvent::VoltageRead { volts });
                    return Ok(volts);
                },
                Err(e) => {
                    state.consecutive_failures += 1;
                    debug!(
                        "VS read failed (attempt {}, {} consecutive): {}",
                        attempt, state.consecutive_failures, e
                    );
                    last_err = Some(e);
                    policy.pause(attempt).await;
                },
            }
        }
        self.publish(state);
        Err(last_err.unwrap_or_else(|| HvError::protocol("voltage read failed")))
    }

    /// Read back the VSET register
    pub async fn read_set_voltage(&self) -> HvResult<f64> {
        let inner = self.inner.lock().await;
        let worker = inner
            .worker
            .as_ref()
            .ok_or_else(|| HvError::not_open("HAPS06 not connected"))?;
        read_vset(worker, inner.state.slave_addr, &self.settings).await
    }

    /// Write VSET, apply it and verify by reading it back.
    pub async fn set_voltage_only(&self, volts: f64) -> HvResult<SetpointOutcome> {
        let mut inner = self.inner.lock().await;
        self.set_voltage_locked(&mut inner, volts).await
    }

    async fn set_voltage_locked(
        &self,
        inner: &mut Inner<O::Port>,
        volts: f64,
    ) -> HvResult<SetpointOutcome> {
        let Inner { worker, state, .. } = inner;
        let worker = worker
            .as_ref()
            .ok_or_else(|| HvError::not_open("HAPS06 not connected"))?;

        let addr = state.slave_addr;
        let policy = RetryPolicy::writes();
        let write_vset =
            ModbusFrame::write_registers(addr, registers::VSET, &frame::encode_f32(volts));
        let apply = ModbusFrame::write_registers(addr, registers::CMD, &[0x00, 0x01]);

        let mut written = false;
        let mut readback = None;
        let mut attempts = 0;
        let mut last_err = None;

        for attempt in policy.attempts() {
            attempts = attempt;
            let wrote = async {
                let vset_wire = write_vset.encode();
                let resp = exchange(worker, write_vset.clone(), self.io_timeout(), self.settings.inter_frame).await?;
                frame::check_write_ack(&vset_wire, &resp)?;
                let cmd_wire = apply.encode();
                let resp = exchange(worker, apply.clone(), self.io_timeout(), self.settings.inter_frame).await?;
                frame::check_write_ack(&cmd_wire, &resp)
            }
            .await;

            if let Err(e) = wrote {
                warn!("Setpoint {:.1} V write failed (attempt {}): {}", volts, attempt, e);
                last_err = Some(e);
                policy.pause(attempt).await;
                continue;
            }
            written = true;

            tokio::time::sleep(VERIFY_DELAY).await;
            match read_vset(worker, addr, &self.settings).await {
                Ok(rb) => {
                    readback = Some(rb);
                    if policy.verified(volts, rb) {
                        break;
                    }
                    debug!("Setpoint readback {:.2} V != {:.2} V (attempt {})", rb, volts, attempt);
                },
                Err(e) => {
                    debug!("Setpoint readback failed (attempt {}): {}", attempt, e);
                    last_err = Some(e);
                },
            }
            policy.pause(attempt).await;
        }

        if !written {
            return Err(last_err.unwrap_or_else(|| HvError::protocol("setpoint write failed")));
        }

        let verified = readback.is_some_and(|rb| policy.verified(volts, rb));
        if !verified {
            warn!("Setpoint {:.1} V written but not verified (readback {:?})", volts, readback);
        }
        state.setpoint_voltage = volts;
        state.consecutive_failures = 0;
        self.publish(state);

        let outcome = SetpointOutcome {
            requested: volts,
            readback,
            verified,
            attempts,
        };
        self.emit(DriverEvent::SetpointApplied {
            outcome: outcome.clone(),
        });
        Ok(outcome)
    }

    /// Zero the output
    pub async fn stop_output(&self) -> HvResult<SetpointOutcome> {
        self.set_voltage_only(0.0).await
    }

    pub async fn reset_voltage(&self) -> HvResult<SetpointOutcome> {
        self.set_voltage_only(RESET_VOLTAGE).await
    }

    /// Rebuild the link on the last port. Never fails past the caller;
    /// returns whether the source is usable again.
    pub async fn reconnect(&self, reason: &str) -> bool {
        let mut inner = self.inner.lock().await;
        self.reconnect_locked(&mut inner, reason).await
    }

    async fn reconnect_locked(&self, inner: &mut Inner<O::Port>, reason: &str) -> bool {
        let Some(target) = inner.state.last_target.clone() else {
            warn!("Reconnect requested ({}) but no port was ever connected", reason);
            return false;
        };

        warn!("HAPS06 reconnecting on {}: {}", target, reason);
        self.emit(DriverEvent::ReconnectStarted {
            reason: reason.to_string(),
        });

        let was_remote = inner.state.remote_enabled || inner.restore_remote;
        let setpoint = inner.state.setpoint_voltage;
        let hint = inner.state.slave_addr;

        if let Some(old) = inner.worker.take() {
            old.stop().await;
        }
        inner.state.link = LinkState::Reconnecting;
        inner.state.remote_enabled = false;
        self.publish(&inner.state);

        let token = self.cancel.lock().clone();
        let opener = self.opener.clone();
        let settings = &self.settings;
        let port_events = &self.port_events;
        let target_ref = &target;

        let result = inner
            .reconnect
            .execute_reconnect(&token, |_attempt| {
                let opener = opener.clone();
                let port_events = port_events.clone();
                async move {
                    open_and_probe(opener.as_ref(), target_ref, settings, port_events, hint).await
                }
            })
            .await;

        match result {
            Ok((worker, addr)) => {
                inner.worker = Some(worker);
                inner.state.link_lost = false;
                inner.restore_remote = false;
                inner.state.slave_addr = addr;
                inner.state.link = LinkState::Connected;
                inner.state.consecutive_failures = 0;
                self.publish(&inner.state);
                self.emit(DriverEvent::Connected {
                    port: target.port.clone(),
                    slave_addr: addr,
                });

                if was_remote {
                    if let Err(e) = self.write_remote_locked(inner, true).await {
                        warn!("Remote control not restored after reconnect: {}", e);
                    }
                }
                let restore = self.session_active() || self.settings.restore_manual_setpoint;
                if restore && setpoint > 0.0 {
                    match self.set_voltage_locked(inner, setpoint).await {
                        Ok(outcome) => info!(
                            "Setpoint {:.1} V restored after reconnect (verified={})",
                            setpoint, outcome.verified
                        ),
                        Err(e) => warn!("Setpoint not restored after reconnect: {}", e),
                    }
                }

                self.emit(DriverEvent::ReconnectFinished { ok: true });
                true
            },
            Err(e) => {
                warn!("HAPS06 reconnect failed: {}", e);
                // A cancelled reconnect means disconnect() is waiting for the lock
                inner.state.link_lost = !token.is_cancelled();
                inner.restore_remote = was_remote;
                inner.state.link = LinkState::Disconnected;
                self.publish(&inner.state);
                self.emit(DriverEvent::ReconnectFinished { ok: false });
                false
            },
        }
    }
}

async fn read_vset<P: SerialIo>(
    worker: &PortWorker<P>,
    addr: u8,
    settings: &DriverSettings,
) -> HvResult<f64> {
    let request = ModbusFrame::read_holding(addr, registers::VSET, 2);
    let resp = exchange(worker, request, settings.io_timeout, settings.inter_frame).await?;
    frame::decode_f32(frame::register_data(&resp)?)
}
