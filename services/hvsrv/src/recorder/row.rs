//! One acquisition sample

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};

/// Column names of the flat-file export, in record order
pub const CSV_HEADERS: [&str; 10] = [
    "time",
    "HV voltage",
    "cathode",
    "grid",
    "anode",
    "collector",
    "vacuum(Pa)",
    "grid voltage",
    "grid+anode+collector",
    "(anode/cathode)x100",
];

/// Raw readings taken in one acquisition tick
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Readings {
    /// `None` when the HAPS06 read failed this tick
    pub hv_voltage: Option<f64>,
    pub cathode: f64,
    pub gate: f64,
    pub anode: f64,
    pub backup: f64,
    pub vacuum: f64,
    pub keithley_voltage: f64,
}

/// A data row as stored in the `data` table. Marker rows carry only
/// `time_text` (prefixed with `# `).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AcquisitionRow {
    pub time_text: String,
    pub hv_voltage: Option<f64>,
    pub cathode: Option<f64>,
    pub gate: Option<f64>,
    pub anode: Option<f64>,
    pub backup: Option<f64>,
    pub vacuum: Option<f64>,
    pub keithley_voltage: Option<f64>,
    pub gate_plus_anode: Option<f64>,
    pub anode_cathode_ratio: Option<f64>,
}

impl AcquisitionRow {
    pub fn from_readings(taken_at: DateTime<Local>, r: Readings) -> Self {
        let ratio = if r.cathode != 0.0 {
            r.anode / r.cathode * 100.0
        } else {
            0.0
        };
        Self {
            time_text: taken_at.format("%Y-%m-%d %H:%M:%S").to_string(),
            hv_voltage: r.hv_voltage,
            cathode: Some(r.cathode),
            gate: Some(r.gate),
            anode: Some(r.anode),
            backup: Some(r.backup),
            vacuum: Some(r.vacuum),
            keithley_voltage: Some(r.keithley_voltage),
            gate_plus_anode: Some(r.gate + r.anode + r.backup),
            anode_cathode_ratio: Some(ratio),
        }
    }

    pub fn marker(text: &str) -> Self {
        Self {
            time_text: format!("# {text}"),
            ..Self::default()
        }
    }

    pub fn is_marker(&self) -> bool {
        self.time_text.starts_with("# ") && self.cathode.is_none()
    }

    /// Export record: voltages to 2 decimals, currents to 4, vacuum as read
    pub fn csv_record(&self) -> Vec<String> {
        if self.is_marker() {
            let mut record = vec![String::new(); CSV_HEADERS.len()];
            record[0] = self.time_text.clone();
            return record;
        }
        vec![
            self.time_text.clone(),
            fixed(self.hv_voltage, 2),
            fixed(self.cathode, 4),
            fixed(self.gate, 4),
            fixed(self.anode, 4),
            fixed(self.backup, 4),
            self.vacuum.map(|v| v.to_string()).unwrap_or_default(),
            fixed(self.keithley_voltage, 2),
            fixed(self.gate_plus_anode, 4),
            fixed(self.anode_cathode_ratio, 2),
        ]
    }
}

fn fixed(value: Option<f64>, places: usize) -> String {
    value
        .map(|v| format!("{v:.places$}"))
        .unwrap_or_default()
}
