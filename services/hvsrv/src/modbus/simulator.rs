//! In-process HAPS06 Modbus-RTU slave for tests and dry runs
//!
//! Implements [`SerialIo`], so the real driver code talks to it through a
//! [`PortWorker`](crate::port::PortWorker) exactly like it talks to a serial
//! port. Fault knobs make the slave go silent, drop a number of replies or
//! corrupt CRCs.

use std::collections::VecDeque;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::debug;

use super::frame::{self, registers, FC_READ_HOLDING, FC_WRITE_COIL, FC_WRITE_MULTIPLE};
use crate::error::{HvError, HvResult};
use crate::port::{PortOpener, PortTarget, SerialIo};

const MODEL_ID: u16 = 0x0006;

#[derive(Debug)]
struct SimState {
    address: u8,
    remote: bool,
    vset: f64,
    vs: f64,
    /// Actual voltage follows the setpoint when applied
    track_setpoint: bool,
    /// Readback reports this offset on top of VSET
    readback_offset: f64,
    silent: bool,
    drop_next: u32,
    corrupt_next: u32,
    requests: Vec<Vec<u8>>,
}

/// Shared handle to the simulated slave
#[derive(Debug, Clone)]
pub struct Haps06Simulator {
    state: Arc<Mutex<SimState>>,
}

impl Haps06Simulator {
    pub fn new(address: u8) -> Self {
        Self {
            state: Arc::new(Mutex::new(SimState {
                address,
                remote: false,
                vset: 0.0,
                vs: 0.0,
                track_setpoint: true,
                readback_offset: 0.0,
                silent: false,
                drop_next: 0,
                corrupt_next: 0,
                requests: Vec::new(),
            })),
        }
    }

    pub fn opener(&self) -> SimulatorOpener {
        SimulatorOpener {
            sim: self.clone(),
            fail_open: Arc::new(AtomicBool::new(false)),
            opens: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn set_address(&self, address: u8) {
        self.state.lock().address = address;
    }

    /// Stop answering entirely
    pub fn set_silent(&self, silent: bool) {
        self.state.lock().silent = silent;
    }

    /// Ignore the next `n` requests
    pub fn drop_next(&self, n: u32) {
        self.state.lock().drop_next = n;
    }

    /// Flip a CRC bit in the next `n` replies
    pub fn corrupt_next(&self, n: u32) {
        self.state.lock().corrupt_next = n;
    }

    pub fn set_actual_voltage(&self, volts: f64) {
        let mut state = self.state.lock();
        state.vs = volts;
        state.track_setpoint = false;
    }

    pub fn set_readback_offset(&self, offset: f64) {
        self.state.lock().readback_offset = offset;
    }

    /// Forget remote mode and setpoints, like a source that lost power
    pub fn power_cycle(&self) {
        let mut state = self.state.lock();
        state.remote = false;
        state.vset = 0.0;
        state.vs = 0.0;
    }

    pub fn remote(&self) -> bool {
        self.state.lock().remote
    }

    pub fn vset(&self) -> f64 {
        self.state.lock().vset
    }

    pub fn requests(&self) -> Vec<Vec<u8>> {
        self.state.lock().requests.clone()
    }

    pub fn clear_requests(&self) {
        self.state.lock().requests.clear();
    }

    fn handle(&self, request: &[u8]) -> Option<Vec<u8>> {
        let mut state = self.state.lock();
        state.requests.push(request.to_vec());

        if state.silent {
            return None;
        }
        if state.drop_next > 0 {
            state.drop_next -= 1;
            return None;
        }
        if request.len() < 4 || !frame::verify_crc(request) || request[0] != state.address {
            return None;
        }

        let addr = request[0];
        let func = request[1];
        let body = &request[2..request.len() - 2];

        let mut reply = match func {
            FC_READ_HOLDING if body.len() == 4 => {
                let start = u16::from_be_bytes([body[0], body[1]]);
                let count = u16::from_be_bytes([body[2], body[3]]);
                let data: Option<Vec<u8>> = match (start, count) {
                    (registers::MODEL, 1) => Some(MODEL_ID.to_be_bytes().to_vec()),
                    (registers::VSET, 2) => {
                        Some(frame::encode_f32(state.vset + state.readback_offset).to_vec())
                    },
                    (registers::VS, 2) => Some(frame::encode_f32(state.vs).to_vec()),
                    _ => None,
                };
                match data {
                    Some(data) => {
                        let mut out = vec![addr, func, data.len() as u8];
                        out.extend_from_slice(&data);
                        out
                    },
                    None => vec![addr, func | 0x80, 0x02],
                }
            },
            FC_WRITE_COIL if body.len() == 4 => {
                let coil = u16::from_be_bytes([body[0], body[1]]);
                if coil == registers::REMOTE_COIL {
                    state.remote = body[2] == 0xFF;
                    request[..6].to_vec()
                } else {
                    vec![addr, func | 0x80, 0x02]
                }
            },
            FC_WRITE_MULTIPLE if body.len() >= 5 => {
                let start = u16::from_be_bytes([body[0], body[1]]);
                let data = &body[5..];
                match start {
                    registers::VSET if data.len() == 4 => {
                        if let Ok(v) = frame::decode_f32(data) {
                            state.vset = v;
                        }
                        request[..6].to_vec()
                    },
                    registers::CMD => {
                        if state.track_setpoint {
                            state.vs = state.vset;
                        }
                        request[..6].to_vec()
                    },
                    _ => vec![addr, func | 0x80, 0x02],
                }
            },
            _ => vec![addr, func | 0x80, 0x01],
        };

        frame::append_crc(&mut reply);
        if state.corrupt_next > 0 {
            state.corrupt_next -= 1;
            if let Some(last) = reply.last_mut() {
                *last ^= 0x01;
            }
        }
        Some(reply)
    }
}

/// Opens [`SimulatorPort`]s onto one shared slave
#[derive(Debug, Clone)]
pub struct SimulatorOpener {
    sim: Haps06Simulator,
    fail_open: Arc<AtomicBool>,
    opens: Arc<AtomicUsize>,
}

impl SimulatorOpener {
    /// Make subsequent opens fail like a missing device node
    pub fn set_fail_open(&self, fail: bool) {
        self.fail_open.store(fail, Ordering::SeqCst);
    }

    pub fn open_count(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    pub fn simulator(&self) -> &Haps06Simulator {
        &self.sim
    }
}

#[async_trait]
impl PortOpener for SimulatorOpener {
    type Port = SimulatorPort;

    async fn open(&self, target: &PortTarget) -> HvResult<SimulatorPort> {
        if self.fail_open.load(Ordering::SeqCst) {
            return Err(HvError::connection(format!("cannot open {}", target.port)));
        }
        self.opens.fetch_add(1, Ordering::SeqCst);
        debug!("Simulator port opened: {}", target);
        Ok(SimulatorPort {
            sim: self.sim.clone(),
            rx: VecDeque::new(),
        })
    }
}

pub struct SimulatorPort {
    sim: Haps06Simulator,
    rx: VecDeque<u8>,
}

#[async_trait]
impl SerialIo for SimulatorPort {
    async fn write_all(&mut self, data: &[u8]) -> io::Result<()> {
        if let Some(reply) = self.sim.handle(data) {
            self.rx.extend(reply);
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

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;
    use crate::modbus::frame::ModbusFrame;

    #[test]
    fn test_ignores_other_addresses() {
        let sim = Haps06Simulator::new(7);
        let probe = ModbusFrame::read_holding(1, registers::MODEL, 1).encode();
        assert!(sim.handle(&probe).is_none());

        let probe = ModbusFrame::read_holding(7, registers::MODEL, 1).encode();
        let reply = sim.handle(&probe).unwrap();
        assert_eq!(&reply[..3], &[7, 0x03, 0x02]);
        assert!(frame::verify_crc(&reply));
    }

    #[test]
    fn test_setpoint_apply_tracks_output() {
        let sim = Haps06Simulator::new(1);
        let vset = ModbusFrame::write_registers(1, registers::VSET, &frame::encode_f32(750.0)).encode();
        sim.handle(&vset).unwrap();
        let cmd = ModbusFrame::write_registers(1, registers::CMD, &[0, 1]).encode();
        sim.handle(&cmd).unwrap();

        let read = ModbusFrame::read_holding(1, registers::VS, 2).encode();
        let reply = sim.handle(&read).unwrap();
        assert_eq!(frame::decode_f32(&reply[3..7]).unwrap(), 750.0);
    }
}
