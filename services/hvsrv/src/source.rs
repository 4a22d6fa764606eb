//! Controllable voltage sources
//!
//! The stabilization loop drives any [`VoltageSource`]; both the HAPS06 and
//! the Keithley 248 implement it.

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::HvResult;
use crate::modbus::driver::Haps06Driver;
use crate::port::PortOpener;

#[async_trait]
pub trait VoltageSource: Send + Sync {
    /// Apply a new output setpoint in volts
    async fn set_voltage(&self, volts: f64) -> HvResult<()>;

    async fn enable_high_voltage(&self) -> HvResult<()>;

    async fn disable_high_voltage(&self) -> HvResult<()>;

    async fn read_voltage(&self) -> HvResult<f64>;

    /// Output current in µA, `None` when the source cannot measure it
    async fn read_current(&self) -> HvResult<Option<f64>>;

    /// Mark a session whose state must survive a reconnect
    fn set_session_active(&self, _active: bool) {}
}

#[async_trait]
impl<O: PortOpener> VoltageSource for Haps06Driver<O> {
    async fn set_voltage(&self, volts: f64) -> HvResult<()> {
        self.set_voltage_only(volts).await.map(|_| ())
    }

    /// Output is live once the source accepts remote setpoints
    async fn enable_high_voltage(&self) -> HvResult<()> {
        self.enable_remote_control().await
    }

    async fn disable_high_voltage(&self) -> HvResult<()> {
        self.set_voltage_only(0.0).await.map(|_| ())
    }

    async fn read_voltage(&self) -> HvResult<f64> {
        self.read_actual_voltage().await
    }

    async fn read_current(&self) -> HvResult<Option<f64>> {
        Ok(None)
    }

    fn set_session_active(&self, active: bool) {
        Haps06Driver::set_session_active(self, active);
    }
}

#[async_trait]
impl<S: VoltageSource + ?Sized> VoltageSource for Arc<S> {
    async fn set_voltage(&self, volts: f64) -> HvResult<()> {
        (**self).set_voltage(volts).await
    }

    async fn enable_high_voltage(&self) -> HvResult<()> {
        (**self).enable_high_voltage().await
    }

    async fn disable_high_voltage(&self) -> HvResult<()> {
        (**self).disable_high_voltage().await
    }

    async fn read_voltage(&self) -> HvResult<f64> {
        (**self).read_voltage().await
    }

    async fn read_current(&self) -> HvResult<Option<f64>> {
        (**self).read_current().await
    }

    fn set_session_active(&self, active: bool) {
        (**self).set_session_active(active);
    }
}
