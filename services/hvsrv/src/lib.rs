//! hvsrv - high-voltage test-system core
//!
//! Serial-port actors, the HAPS06 Modbus-RTU source driver, the Keithley 248
//! SCPI source, multimeter and vacuum-gauge readers, closed-loop current
//! stabilization and acquisition recording to SQLite and CSV.

pub mod config;
pub mod error;
pub mod keithley;
pub mod meter;
pub mod meters;
pub mod modbus;
pub mod poller;
pub mod port;
pub mod recorder;
pub mod retention;
pub mod session;
pub mod source;
pub mod stabilization;

pub use error::{HvError, HvResult};
