//! HAPS06 high-voltage source over Modbus-RTU

pub mod driver;
pub mod frame;
pub mod reconnect;
pub mod retry;
pub mod simulator;

pub use driver::{ControllerState, DriverEvent, DriverSettings, Haps06Driver, LinkState};
pub use simulator::{Haps06Simulator, SimulatorOpener};
