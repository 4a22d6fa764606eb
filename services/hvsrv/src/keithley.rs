//! Keithley 248 high-voltage supply (SCPI text through a serial-GPIB adapter)

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, info, warn};

use crate::error::{HvError, HvResult};
use crate::port::{PortEvent, PortOpener, PortTarget, PortWorker, SerialIo};
use crate::source::VoltageSource;

const WRITE_PAUSE: Duration = Duration::from_millis(50);
const CALL_TIMEOUT: Duration = Duration::from_secs(3);
const IDN_TIMEOUT: Duration = Duration::from_secs(4);

pub struct Keithley248<O: PortOpener> {
    opener: Arc<O>,
    io_timeout: Duration,
    worker: Mutex<Option<PortWorker<O::Port>>>,
    port_events: broadcast::Sender<PortEvent>,
}

impl<O: PortOpener> Keithley248<O> {
    pub fn new(opener: O, io_timeout: Duration) -> Self {
        let (port_events, _) = broadcast::channel(64);
        Self {
            opener: Arc::new(opener),
            io_timeout,
            worker: Mutex::new(None),
            port_events,
        }
    }

    pub fn subscribe_port(&self) -> broadcast::Receiver<PortEvent> {
        self.port_events.subscribe()
    }

    pub async fn is_connected(&self) -> bool {
        self.worker.lock().await.as_ref().is_some_and(|w| w.is_running())
    }

    /// Open the adapter and identify the instrument. Returns the `*IDN?`
    /// reply.
    pub async fn connect(&self, target: PortTarget) -> HvResult<String> {
        let mut slot = self.worker.lock().await;
        if let Some(old) = slot.take() {
            old.stop().await;
        }

        let worker = PortWorker::start(self.opener.as_ref(), target.clone(), self.port_events.clone())
            .await?;
        match query_on(&worker, "*IDN?", self.io_timeout, IDN_TIMEOUT).await {
            Ok(idn) if !idn.is_empty() => {
                info!("Keithley 248 connected on {}: {}", target, idn);
                *slot = Some(worker);
                Ok(idn)
            },
            Ok(_) => {
                worker.stop().await;
                Err(HvError::connection(format!("no *IDN? reply on {target}")))
            },
            Err(e) => {
                worker.stop().await;
                Err(HvError::connection(format!("identify on {target} failed: {e}")))
            },
        }
    }

    pub async fn disconnect(&self) {
        if let Some(worker) = self.worker.lock().await.take() {
            worker.stop().await;
            info!("Keithley 248 disconnected");
        }
    }

    /// Query commands end with `?` and return the trimmed reply; others
    /// are written and followed by a short pause.
    pub async fn send_command(&self, command: &str) -> HvResult<String> {
        let slot = self.worker.lock().await;
        let worker = slot
            .as_ref()
            .ok_or_else(|| HvError::not_open("Keithley 248 not connected"))?;

        if command.ends_with('?') {
            query_on(worker, command, self.io_timeout, CALL_TIMEOUT).await
        } else {
            let line = format!("{command}\n");
            debug!("[K248] >> {}", command);
            worker
                .submit(CALL_TIMEOUT, move |port: &mut O::Port| {
                    async move {
                        port.write_all(line.as_bytes()).await?;
                        tokio::time::sleep(WRITE_PAUSE).await;
                        Ok(())
                    }
                    .boxed()
                })
                .await?;
            Ok(String::from("OK"))
        }
    }

    async fn query_f64(&self, command: &str) -> HvResult<f64> {
        let reply = self.send_command(command).await?;
        reply
            .parse::<f64>()
            .map_err(|_| HvError::protocol(format!("{command} returned '{reply}'")))
    }

    pub async fn read_output_voltage(&self) -> HvResult<f64> {
        self.query_f64("VOUT?").await
    }

    /// Output current in µA
    pub async fn read_output_current(&self) -> HvResult<f64> {
        Ok(self.query_f64("IOUT?").await? * 1e6)
    }

    pub async fn set_output_voltage(&self, volts: f64) -> HvResult<()> {
        self.send_command(&format!("VSET {volts}")).await.map(|_| ())
    }

    pub async fn set_current_limit(&self, current_ua: f64) -> HvResult<()> {
        self.send_command(&format!("ILIM {}", current_ua / 1e6))
            .await
            .map(|_| ())
    }

    pub async fn set_current_trip(&self, current_ua: f64) -> HvResult<()> {
        self.send_command(&format!("ITRP {}", current_ua / 1e6))
            .await
            .map(|_| ())
    }

    pub async fn set_voltage_limit(&self, volts: f64) -> HvResult<()> {
        self.send_command(&format!("VLIM {volts}")).await.map(|_| ())
    }

    pub async fn identify(&self) -> HvResult<String> {
        self.send_command("*IDN?").await
    }
}

async fn query_on<P: SerialIo>(
    worker: &PortWorker<P>,
    command: &str,
    io_timeout: Duration,
    call_timeout: Duration,
) -> HvResult<String> {
    let line = format!("{command}\n");
    debug!("[K248] >> {}", command);
    let reply = worker
        .submit(call_timeout, move |port: &mut P| {
            async move {
                port.clear_buffers().await?;
                port.write_all(line.as_bytes()).await?;
                port.read_line_within(io_timeout).await
            }
            .boxed()
        })
        .await?;

    let reply = reply.trim().to_string();
    debug!("[K248] << {}", reply);
    if reply.is_empty() {
        warn!("No reply to {}", command);
        return Err(HvError::timeout(format!("no reply to {command}")));
    }
    Ok(reply)
}

#[async_trait]
impl<O: PortOpener> VoltageSource for Keithley248<O> {
    async fn set_voltage(&self, volts: f64) -> HvResult<()> {
        self.set_output_voltage(volts).await
    }

    async fn enable_high_voltage(&self) -> HvResult<()> {
        self.send_command("HVON").await.map(|_| ())
    }

    async fn disable_high_voltage(&self) -> HvResult<()> {
        self.send_command("HVOF").await.map(|_| ())
    }

    async fn read_voltage(&self) -> HvResult<f64> {
        self.read_output_voltage().await
    }

    async fn read_current(&self) -> HvResult<Option<f64>> {
        self.read_output_current().await.map(Some)
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;
    use parking_lot::Mutex as SyncMutex;
    use std::collections::VecDeque;
    use std::io;

    // ========================================================================
    // Scripted SCPI instrument
    // ========================================================================

    #[derive(Default)]
    struct Instrument {
        vset: f64,
        hv_on: bool,
        log: Vec<String>,
    }

    struct ScpiPort {
        inst: Arc<SyncMutex<Instrument>>,
        rx: VecDeque<u8>,
    }

    #[async_trait]
    impl SerialIo for ScpiPort {
        async fn write_all(&mut self, data: &[u8]) -> io::Result<()> {
            let cmd = String::from_utf8_lossy(data).trim().to_string();
            let mut inst = self.inst.lock();
            inst.log.push(cmd.clone());
            let reply = match cmd.split_whitespace().next().unwrap_or_default() {
                "*IDN?" => Some("KEITHLEY INSTRUMENTS,248,0,1.0".to_string()),
                "VOUT?" => Some(format!("{}", inst.vset)),
                "IOUT?" => Some("1.5E-5".to_string()),
                "VSET" => {
                    inst.vset = cmd[5..].parse().unwrap();
                    None
                },
                "HVON" => {
                    inst.hv_on = true;
                    None
                },
                "HVOF" => {
                    inst.hv_on = false;
                    None
                },
                _ => None,
            };
            if let Some(reply) = reply {
                self.rx.extend(format!("{reply}\r\n").bytes());
            }
            Ok(())
        }

        async fn read_some(&mut self, buf: &mut [u8], limit: Duration) -> io::Result<usize> {
            if self.rx.is_empty() {
                tokio::time::sleep(limit).await;
                return Ok(0);
            }
            let n = buf.len().min(self.rx.len());
            for (slot, byte) in buf.iter_mut().zip(self.rx.drain(..n)) {
                *slot = byte;
            }
            Ok(n)
        }

        async fn clear_buffers(&mut self) -> io::Result<()> {
            self.rx.clear();
            Ok(())
        }
    }

    struct ScpiOpener {
        inst: Arc<SyncMutex<Instrument>>,
    }

    #[async_trait]
    impl PortOpener for ScpiOpener {
        type Port = ScpiPort;

        async fn open(&self, _target: &PortTarget) -> HvResult<ScpiPort> {
            Ok(ScpiPort {
                inst: self.inst.clone(),
                rx: VecDeque::new(),
            })
        }
    }

    async fn connected() -> (Keithley248<ScpiOpener>, Arc<SyncMutex<Instrument>>) {
        let inst = Arc::new(SyncMutex::new(Instrument::default()));
        let k = Keithley248::new(ScpiOpener { inst: inst.clone() }, Duration::from_millis(200));
        let idn = k.connect(PortTarget::new("gpib14", 9600)).await.unwrap();
        assert!(idn.starts_with("KEITHLEY"));
        (k, inst)
    }

    // ========================================================================
    // Tests
    // ========================================================================

    #[tokio::test]
    async fn test_set_and_read_voltage() {
        let (k, inst) = connected().await;
        k.set_voltage(1200.0).await.unwrap();
        assert_eq!(inst.lock().vset, 1200.0);
        assert_eq!(k.read_voltage().await.unwrap(), 1200.0);
    }

    #[tokio::test]
    async fn test_current_converted_to_microamps() {
        let (k, _inst) = connected().await;
        let ua = k.read_current().await.unwrap().unwrap();
        assert!((ua - 15.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_high_voltage_switch_and_limits() {
        let (k, inst) = connected().await;
        k.enable_high_voltage().await.unwrap();
        assert!(inst.lock().hv_on);
        k.set_current_limit(50.0).await.unwrap();
        k.disable_high_voltage().await.unwrap();
        assert!(!inst.lock().hv_on);
        assert!(inst.lock().log.iter().any(|c| c == "ILIM 0.00005"));
    }

    #[tokio::test]
    async fn test_commands_fail_when_disconnected() {
        let (k, _inst) = connected().await;
        k.disconnect().await;
        assert!(matches!(k.read_voltage().await, Err(HvError::NotOpen(_))));
    }
}
