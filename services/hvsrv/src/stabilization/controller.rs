//! Stabilization session actor
//!
//! `start()` performs the start sequence inline so a failure is returned to
//! the caller, then hands the [`Regulator`] to a spawned loop. However the
//! loop ends (stop, cancellation, source failure), its exit path zeroes the
//! setpoint and disables the output before reporting `Stopped`.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::regulator::{Regulator, TickAction};
use super::{CurrentSource, StabilizationParams};
use crate::error::{HvError, HvResult};
use crate::meter::MeterFeed;
use crate::source::VoltageSource;

const OUTPUT_SETTLE: Duration = Duration::from_secs(1);
const STOP_GRACE: Duration = Duration::from_secs(5);
const ABORT_GRACE: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, PartialEq)]
pub enum StabilizationEvent {
    Status(String),
    VoltageSet { volts: f64 },
    /// Current entered the stability band
    Stable { current_ua: f64 },
    Stopped,
}

struct Session {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

pub struct StabilizationController<S: VoltageSource + ?Sized + 'static> {
    source: Arc<S>,
    meters: MeterFeed,
    params: RwLock<StabilizationParams>,
    events: broadcast::Sender<StabilizationEvent>,
    session: Mutex<Option<Session>>,
}

impl<S: VoltageSource + ?Sized + 'static> StabilizationController<S> {
    pub fn new(source: Arc<S>, meters: MeterFeed, params: StabilizationParams) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            source,
            meters,
            params: RwLock::new(params),
            events,
            session: Mutex::new(None),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StabilizationEvent> {
        self.events.subscribe()
    }

    pub fn params(&self) -> StabilizationParams {
        self.params.read().clone()
    }

    /// Replace the parameters used by the next `start()`
    pub fn configure(&self, params: StabilizationParams) -> HvResult<()> {
        params.check()?;
        *self.params.write() = params;
        Ok(())
    }

    pub async fn is_running(&self) -> bool {
        self.session
            .lock()
            .await
            .as_ref()
            .is_some_and(|s| !s.handle.is_finished())
    }

    pub async fn start(&self) -> HvResult<()> {
        let mut slot = self.session.lock().await;
        if slot.as_ref().is_some_and(|s| !s.handle.is_finished()) {
            return Err(HvError::policy("stabilization already running"));
        }

        let params = self.params().normalized();
        let start_voltage = params.start_voltage;
        let mut regulator = Regulator::new(params.clone());
        self.emit(StabilizationEvent::Status("Stabilization starting".into()));
        self.source.set_session_active(true);

        if let Err(e) = self.source.set_voltage(start_voltage).await {
            self.emit(StabilizationEvent::Status(format!(
                "Setting start voltage failed: {e}"
            )));
            shutdown_output(self.source.as_ref(), &self.events).await;
            return Err(e);
        }
        regulator.begin(start_voltage, Instant::now());
        self.emit(StabilizationEvent::VoltageSet {
            volts: start_voltage,
        });
        self.emit(StabilizationEvent::Status(format!(
            "Start voltage {start_voltage} V"
        )));

        if let Err(e) = self.source.enable_high_voltage().await {
            self.emit(StabilizationEvent::Status(format!(
                "Enabling high voltage failed: {e}"
            )));
            shutdown_output(self.source.as_ref(), &self.events).await;
            return Err(e);
        }
        self.emit(StabilizationEvent::Status("High voltage enabled".into()));

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(control_loop(
            self.source.clone(),
            self.meters.clone(),
            regulator,
            cancel.clone(),
            self.events.clone(),
        ));
        info!(
            "Stabilization started: target {} uA ±{} uA, {:?}",
            params.target_current, params.stability_range, params.algorithm
        );
        *slot = Some(Session { cancel, handle });
        Ok(())
    }

    /// Cancel the session and wait up to 5 s for its exit path. A loop
    /// stuck past that is aborted before the output is zeroed here, so it can
    /// never touch the source again. The slot stays locked until then, which
    /// makes a concurrent `start()` wait.
    pub async fn stop(&self) {
        let mut slot = self.session.lock().await;
        let Some(Session { cancel, mut handle }) = slot.take() else {
            return;
        };
        cancel.cancel();
        if tokio::time::timeout(STOP_GRACE, &mut handle).await.is_err() {
            warn!("Stabilization loop did not stop in time, aborting it");
            handle.abort();
            if tokio::time::timeout(ABORT_GRACE, handle).await.is_err() {
                warn!("Aborted stabilization loop still running");
            }
            shutdown_output(self.source.as_ref(), &self.events).await;
        }
    }

    fn emit(&self, event: StabilizationEvent) {
        let _ = self.events.send(event);
    }
}

async fn control_loop<S: VoltageSource + ?Sized>(
    source: Arc<S>,
    meters: MeterFeed,
    mut regulator: Regulator,
    cancel: CancellationToken,
    events: broadcast::Sender<StabilizationEvent>,
) {
    let emit = |event: StabilizationEvent| {
        let _ = events.send(event);
    };
    let period = regulator.params().period();
    let target = regulator.params().target_current;

    tokio::select! {
        _ = cancel.cancelled() => {},
        _ = tokio::time::sleep(OUTPUT_SETTLE) => {},
    }

    while !cancel.is_cancelled() {
        let reading = tokio::select! {
            _ = cancel.cancelled() => break,
            r = read_current(source.as_ref(), &meters, &regulator) => r,
        };

        match reading {
            Ok(Some(current)) => {
                match regulator.tick(current, Instant::now()) {
                    TickAction::Stable { entered: true } => {
                        emit(StabilizationEvent::Stable {
                            current_ua: current,
                        });
                        emit(StabilizationEvent::Status(format!(
                            "Current stable: {current:.2} uA (target {target} uA)"
                        )));
                    },
                    TickAction::Stable { entered: false } | TickAction::Hold => {},
                    TickAction::Adjust {
                        du,
                        set_u,
                        voltage,
                        mode,
                    } => match source.set_voltage(voltage).await {
                        Ok(()) => {
                            regulator.commit(set_u, Instant::now());
                            emit(StabilizationEvent::VoltageSet { volts: voltage });
                            emit(StabilizationEvent::Status(format!(
                                "[{}] I={current:.2} uA, target={target} uA, dV={du:.2} V, Vset={voltage:.1} V",
                                mode.as_str()
                            )));
                        },
                        Err(e) => {
                            emit(StabilizationEvent::Status(format!(
                                "Setting voltage failed: {e}"
                            )));
                        },
                    },
                }
            },
            Ok(None) => emit(StabilizationEvent::Status("No current reading".into())),
            Err(e) => {
                debug!("Current read failed: {}", e);
                emit(StabilizationEvent::Status(format!(
                    "Current read failed: {e}"
                )));
            },
        }

        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(period) => {},
        }
    }

    shutdown_output(source.as_ref(), &events).await;
    info!("Stabilization stopped");
}

async fn read_current<S: VoltageSource + ?Sized>(
    source: &S,
    meters: &MeterFeed,
    regulator: &Regulator,
) -> HvResult<Option<f64>> {
    match &regulator.params().current_source {
        CurrentSource::Source => source.read_current().await,
        CurrentSource::Meter(channel) => {
            Ok(meters.current_ua(channel, regulator.params().meter_max_age()))
        },
    }
}

/// Zero the setpoint and disable the output, ignoring failures
async fn shutdown_output<S: VoltageSource + ?Sized>(
    source: &S,
    events: &broadcast::Sender<StabilizationEvent>,
) {
    if let Err(e) = source.set_voltage(0.0).await {
        warn!("Zeroing voltage on stop failed: {}", e);
    }
    if let Err(e) = source.disable_high_voltage().await {
        warn!("Disabling high voltage on stop failed: {}", e);
    }
    source.set_session_active(false);
    let _ = events.send(StabilizationEvent::VoltageSet { volts: 0.0 });
    let _ = events.send(StabilizationEvent::Status("Stabilization stopped".into()));
    let _ = events.send(StabilizationEvent::Stopped);
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;
    use crate::meter::CurrentUnit;
    use crate::stabilization::Algorithm;
    use async_trait::async_trait;
    use parking_lot::Mutex as SyncMutex;

    // ========================================================================
    // Linear plant: I = gain * |V| while the output is on
    // ========================================================================

    #[derive(Default)]
    struct Plant {
        voltage: f64,
        hv_on: bool,
        session: bool,
        fail_set: bool,
        /// The next `set_voltage` stalls this long before applying
        stall_next_set: Option<Duration>,
        sets: Vec<f64>,
    }

    struct FakeSource {
        gain: f64,
        plant: SyncMutex<Plant>,
    }

    impl FakeSource {
        fn new(gain: f64) -> Arc<Self> {
            Arc::new(Self {
                gain,
                plant: SyncMutex::new(Plant::default()),
            })
        }
    }

    #[async_trait]
    impl VoltageSource for FakeSource {
        async fn set_voltage(&self, volts: f64) -> HvResult<()> {
            let stall = self.plant.lock().stall_next_set.take();
            if let Some(stall) = stall {
                tokio::time::sleep(stall).await;
            }
            let mut plant = self.plant.lock();
            if plant.fail_set {
                return Err(HvError::timeout("no reply"));
            }
            plant.voltage = volts;
            plant.sets.push(volts);
            Ok(())
        }

        async fn enable_high_voltage(&self) -> HvResult<()> {
            self.plant.lock().hv_on = true;
            Ok(())
        }

        async fn disable_high_voltage(&self) -> HvResult<()> {
            self.plant.lock().hv_on = false;
            Ok(())
        }

        async fn read_voltage(&self) -> HvResult<f64> {
            Ok(self.plant.lock().voltage)
        }

        async fn read_current(&self) -> HvResult<Option<f64>> {
            let plant = self.plant.lock();
            let on = if plant.hv_on { 1.0 } else { 0.0 };
            Ok(Some(self.gain * plant.voltage.abs() * on))
        }

        fn set_session_active(&self, active: bool) {
            self.plant.lock().session = active;
        }
    }

    fn params(algorithm: Algorithm, start_voltage: f64) -> StabilizationParams {
        StabilizationParams {
            target_current: 100.0,
            stability_range: 2.0,
            start_voltage,
            algorithm,
            ..StabilizationParams::default()
        }
    }

    async fn wait_for_stable(rx: &mut broadcast::Receiver<StabilizationEvent>) -> f64 {
        tokio::time::timeout(Duration::from_secs(120), async {
            loop {
                if let StabilizationEvent::Stable { current_ua } = rx.recv().await.unwrap() {
                    return current_ua;
                }
            }
        })
        .await
        .unwrap()
    }

    // ========================================================================
    // Tests
    // ========================================================================

    #[tokio::test(start_paused = true)]
    async fn test_approach_reaches_band() {
        let source = FakeSource::new(0.5);
        let ctl = StabilizationController::new(
            source.clone(),
            MeterFeed::new(),
            params(Algorithm::Approach, 190.0),
        );
        let mut rx = ctl.subscribe();
        ctl.start().await.unwrap();

        let current = wait_for_stable(&mut rx).await;
        assert!((current - 100.0).abs() <= 2.0);
        assert_eq!(source.plant.lock().voltage, 196.0);
        // one volt per tick
        assert_eq!(&source.plant.lock().sets[..3], &[190.0, 191.0, 192.0]);
        ctl.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_pid_converges() {
        let source = FakeSource::new(0.5);
        let ctl = StabilizationController::new(
            source.clone(),
            MeterFeed::new(),
            params(Algorithm::Pid, 100.0),
        );
        let mut rx = ctl.subscribe();
        ctl.start().await.unwrap();

        let current = wait_for_stable(&mut rx).await;
        assert!((current - 100.0).abs() <= 2.0);
        assert!(source.plant.lock().session);
        ctl.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_zeroes_and_disables() {
        let source = FakeSource::new(0.5);
        let ctl = StabilizationController::new(
            source.clone(),
            MeterFeed::new(),
            params(Algorithm::Pid, 100.0),
        );
        let mut rx = ctl.subscribe();
        ctl.start().await.unwrap();
        tokio::time::sleep(Duration::from_secs(3)).await;

        ctl.stop().await;
        assert!(!ctl.is_running().await);
        {
            let plant = source.plant.lock();
            assert_eq!(plant.voltage, 0.0);
            assert!(!plant.hv_on);
            assert!(!plant.session);
        }

        let mut saw_zero = false;
        let mut saw_stopped = false;
        while let Ok(ev) = rx.try_recv() {
            match ev {
                StabilizationEvent::VoltageSet { volts } if volts == 0.0 => saw_zero = true,
                StabilizationEvent::Stopped => saw_stopped = true,
                _ => {},
            }
        }
        assert!(saw_zero && saw_stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stuck_loop_cannot_zero_next_session() {
        let source = FakeSource::new(0.5);
        let ctl = StabilizationController::new(
            source.clone(),
            MeterFeed::new(),
            params(Algorithm::Approach, 100.0),
        );
        ctl.start().await.unwrap();
        tokio::time::sleep(Duration::from_secs(3)).await;

        // The loop's next adjustment hangs well past the stop grace
        source.plant.lock().stall_next_set = Some(Duration::from_secs(30));
        tokio::time::sleep(Duration::from_secs(4)).await;
        ctl.stop().await;
        assert!(!source.plant.lock().hv_on);

        ctl.start().await.unwrap();
        tokio::time::sleep(Duration::from_secs(60)).await;
        {
            let plant = source.plant.lock();
            assert!(plant.hv_on);
            assert!(plant.session);
            assert!(plant.voltage > 0.0, "{:?}", plant.sets);
        }
        ctl.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_failure_leaves_output_off() {
        let source = FakeSource::new(0.5);
        source.plant.lock().fail_set = true;
        let ctl = StabilizationController::new(
            source.clone(),
            MeterFeed::new(),
            params(Algorithm::Pid, 100.0),
        );

        assert!(matches!(ctl.start().await, Err(HvError::Timeout(_))));
        assert!(!ctl.is_running().await);
        assert!(!source.plant.lock().hv_on);
        assert!(!source.plant.lock().session);
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_start_rejected() {
        let source = FakeSource::new(0.5);
        let ctl = StabilizationController::new(
            source.clone(),
            MeterFeed::new(),
            params(Algorithm::Approach, 10.0),
        );
        ctl.start().await.unwrap();
        assert!(matches!(
            ctl.start().await,
            Err(HvError::PolicyViolation(_))
        ));
        ctl.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_meter_holds_voltage() {
        let source = FakeSource::new(0.5);
        let meters = MeterFeed::new();
        let anode = meters.publisher("anode");
        anode.publish(10.0, CurrentUnit::MicroAmp);

        let mut p = params(Algorithm::Approach, 150.0);
        p.current_source = CurrentSource::Meter("anode".into());
        let ctl = StabilizationController::new(source.clone(), meters, p);
        let mut rx = ctl.subscribe();
        ctl.start().await.unwrap();

        tokio::time::sleep(Duration::from_secs(8)).await;
        // fresh for the first ticks only; afterwards the loop holds
        let sets = source.plant.lock().sets.clone();
        assert!(sets.len() < 5, "{sets:?}");

        let mut no_reading = false;
        while let Ok(ev) = rx.try_recv() {
            if ev == StabilizationEvent::Status("No current reading".into()) {
                no_reading = true;
            }
        }
        assert!(no_reading);
        ctl.stop().await;
    }

    #[test]
    fn test_configure_rejects_bad_params() {
        let ctl = StabilizationController::new(
            FakeSource::new(1.0),
            MeterFeed::new(),
            StabilizationParams::default(),
        );
        let bad = StabilizationParams {
            max_adjust_voltage: 0.0,
            ..StabilizationParams::default()
        };
        assert!(ctl.configure(bad).is_err());
    }
}
