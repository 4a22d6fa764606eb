//! Meter readings as published snapshots
//!
//! Each meter channel has exactly one [`MeterPublisher`], owned by whatever
//! task reads the instrument (see [`crate::meters`]). Consumers hold a
//! [`MeterFeed`] and only ever copy the latest `Arc<MeterSnapshot>`; nothing
//! is written back.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::time::Instant;

/// Readings older than this are ignored by the control loop
pub const DEFAULT_MAX_AGE: Duration = Duration::from_secs(3);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CurrentUnit {
    #[serde(rename = "uA")]
    MicroAmp,
    #[serde(rename = "mA")]
    MilliAmp,
    #[serde(rename = "A")]
    Amp,
}

impl CurrentUnit {
    pub fn to_microamps(self, value: f64) -> f64 {
        match self {
            Self::MicroAmp => value,
            Self::MilliAmp => value * 1000.0,
            Self::Amp => value * 1e6,
        }
    }
}

/// What a channel measures
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MeterUnit {
    Current(CurrentUnit),
    Volt,
    Pascal,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MeterSnapshot {
    pub channel: String,
    pub value: f64,
    pub unit: MeterUnit,
    pub taken_at: Instant,
    pub valid: bool,
}

impl MeterSnapshot {
    /// `None` when the channel does not measure a current
    pub fn current_ua(&self) -> Option<f64> {
        match self.unit {
            MeterUnit::Current(unit) => Some(unit.to_microamps(self.value)),
            MeterUnit::Volt | MeterUnit::Pascal => None,
        }
    }

    pub fn age(&self) -> Duration {
        self.taken_at.elapsed()
    }
}

/// Write side of one meter channel
#[derive(Debug)]
pub struct MeterPublisher {
    channel: String,
    tx: watch::Sender<Option<Arc<MeterSnapshot>>>,
}

impl MeterPublisher {
    pub fn channel(&self) -> &str {
        &self.channel
    }

    pub fn publish(&self, value: f64, unit: CurrentUnit) {
        self.send(value, MeterUnit::Current(unit), true);
    }

    pub fn publish_reading(&self, value: f64, unit: MeterUnit) {
        self.send(value, unit, true);
    }

    /// Record a failed read so consumers stop trusting the last value
    pub fn publish_invalid(&self, unit: MeterUnit) {
        self.send(f64::NAN, unit, false);
    }

    fn send(&self, value: f64, unit: MeterUnit, valid: bool) {
        let snapshot = MeterSnapshot {
            channel: self.channel.clone(),
            value,
            unit,
            taken_at: Instant::now(),
            valid: valid && value.is_finite(),
        };
        self.tx.send_replace(Some(Arc::new(snapshot)));
    }
}

/// Read side over every registered channel
#[derive(Debug, Clone, Default)]
pub struct MeterFeed {
    channels: Arc<RwLock<HashMap<String, watch::Receiver<Option<Arc<MeterSnapshot>>>>>>,
}

impl MeterFeed {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `channel` and hand out its single publisher. Registering a
    /// channel again replaces the old publisher.
    pub fn publisher(&self, channel: impl Into<String>) -> MeterPublisher {
        let channel = channel.into();
        let (tx, rx) = watch::channel(None);
        self.channels.write().insert(channel.clone(), rx);
        MeterPublisher { channel, tx }
    }

    pub fn channels(&self) -> Vec<String> {
        self.channels.read().keys().cloned().collect()
    }

    pub fn latest(&self, channel: &str) -> Option<Arc<MeterSnapshot>> {
        self.channels
            .read()
            .get(channel)
            .and_then(|rx| rx.borrow().clone())
    }

    /// Latest reading if it is valid and no older than `max_age`
    pub fn fresh(&self, channel: &str, max_age: Duration) -> Option<Arc<MeterSnapshot>> {
        let snapshot = self.latest(channel)?;
        if !snapshot.valid || snapshot.age() > max_age {
            return None;
        }
        Some(snapshot)
    }

    /// Current in µA, `None` when missing, invalid, older than `max_age` or
    /// not a current channel
    pub fn current_ua(&self, channel: &str, max_age: Duration) -> Option<f64> {
        self.fresh(channel, max_age)?.current_ua()
    }

    /// Raw value of a fresh reading, whatever its unit
    pub fn value(&self, channel: &str, max_age: Duration) -> Option<f64> {
        self.fresh(channel, max_age).map(|s| s.value)
    }

    /// Wait for the next snapshot on `channel`
    pub async fn changed(&self, channel: &str) -> Option<Arc<MeterSnapshot>> {
        let mut rx = self.channels.read().get(channel)?.clone();
        rx.changed().await.ok()?;
        let latest = rx.borrow_and_update().clone();
        latest
    }
}
