//! Bench multimeter that streams fixed 14-byte frames (19200 8N1)
//!
//! Frame layout: `[range, d0..d4, function, sign, 4 status bytes, CR, LF]`.
//! The low nibble of each digit byte is the digit; `range` and `function`
//! together place the decimal point. Some meters set the high bit of the LF.

use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;

use super::MeterProtocol;
use crate::error::HvResult;
use crate::meter::{CurrentUnit, MeterUnit};
use crate::port::{PortWorker, SerialIo};

pub const FRAME_LEN: usize = 14;
pub const DEFAULT_BAUD: u32 = 19200;

const FUNC_VOLT: u8 = 0x3B;
const FUNC_MICROAMP: u8 = 0x3D;
const FUNC_MILLIAMP: u8 = 0xBF;
const FUNC_AMP: u8 = 0xB0;
const SIGN_NEGATIVE: u8 = 0x34;

/// Longest unsynchronised run kept while hunting for a terminator
const MAX_BACKLOG: usize = 4 * FRAME_LEN;

/// Decode one frame into a value and unit. Millivolts come back as volts.
pub fn parse_frame(frame: &[u8]) -> Option<(f64, MeterUnit)> {
    if frame.len() != FRAME_LEN || frame[12] != 0x0D || !matches!(frame[13], 0x0A | 0x8A) {
        return None;
    }

    let range = frame[0] & 0x7F;
    let function = frame[6];

    // Integer digits before the decimal point, and the unit
    let (int_digits, unit, scale) = match (function, range) {
        (FUNC_VOLT, 0x34) => (3, MeterUnit::Volt, 1e-3),
        (FUNC_VOLT, 0x30) => (1, MeterUnit::Volt, 1.0),
        (FUNC_VOLT, 0x31) => (2, MeterUnit::Volt, 1.0),
        (FUNC_VOLT, 0x32) => (3, MeterUnit::Volt, 1.0),
        (FUNC_VOLT, 0x33) => (4, MeterUnit::Volt, 1.0),
        (FUNC_MICROAMP, 0x30) => (3, MeterUnit::Current(CurrentUnit::MicroAmp), 1.0),
        (FUNC_MICROAMP, 0x31) => (4, MeterUnit::Current(CurrentUnit::MicroAmp), 1.0),
        (FUNC_MILLIAMP, 0x30) => (2, MeterUnit::Current(CurrentUnit::MilliAmp), 1.0),
        (FUNC_MILLIAMP, 0x31) => (3, MeterUnit::Current(CurrentUnit::MilliAmp), 1.0),
        (FUNC_AMP, 0x30) => (2, MeterUnit::Current(CurrentUnit::Amp), 1.0),
        _ => return None,
    };

    let mut mantissa: u32 = 0;
    for b in &frame[1..6] {
        let digit = b & 0x0F;
        if digit > 9 {
            return None;
        }
        mantissa = mantissa * 10 + u32::from(digit);
    }

    let sign = if frame[7] == SIGN_NEGATIVE { -1.0 } else { 1.0 };
    let value = f64::from(mantissa) / 10f64.powi(5 - int_digits) * sign * scale;
    Some((value, unit))
}

/// Reassembles frames from an arbitrarily chunked byte stream
#[derive(Debug, Default)]
pub struct FrameSync {
    buf: Vec<u8>,
}

impl FrameSync {
    pub fn push(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Next complete frame, aligned on its CR LF terminator
    pub fn next_frame(&mut self) -> Option<[u8; FRAME_LEN]> {
        loop {
            let end = self
                .buf
                .windows(2)
                .enumerate()
                .skip(FRAME_LEN - 2)
                .find(|(_, w)| w[0] == 0x0D && matches!(w[1], 0x0A | 0x8A))
                .map(|(i, _)| i + 2);

            let Some(end) = end else {
                if self.buf.len() > MAX_BACKLOG {
                    let keep = self.buf.len() - (FRAME_LEN - 1);
                    self.buf.drain(..keep);
                }
                return None;
            };

            let mut frame = [0u8; FRAME_LEN];
            frame.copy_from_slice(&self.buf[end - FRAME_LEN..end]);
            self.buf.drain(..end);
            if parse_frame(&frame).is_some() {
                return Some(frame);
            }
        }
    }

    /// Drop everything up to the newest complete frame and return it
    pub fn latest_frame(&mut self) -> Option<[u8; FRAME_LEN]> {
        let mut latest = None;
        while let Some(frame) = self.next_frame() {
            latest = Some(frame);
        }
        latest
    }
}

/// Streaming multimeter. The instrument talks unprompted; each poll drains
/// what arrived and keeps the newest frame.
#[derive(Debug)]
pub struct DmmProtocol {
    sync: FrameSync,
    read_window: Duration,
    interval: Duration,
}

impl DmmProtocol {
    pub fn new(interval: Duration) -> Self {
        Self {
            sync: FrameSync::default(),
            read_window: Duration::from_millis(500),
            interval,
        }
    }
}

#[async_trait]
impl MeterProtocol for DmmProtocol {
    fn name(&self) -> &'static str {
        "DMM"
    }

    fn idle_unit(&self) -> MeterUnit {
        MeterUnit::Current(CurrentUnit::MicroAmp)
    }

    fn interval(&self) -> Duration {
        self.interval
    }

    async fn poll<P: SerialIo>(&mut self, worker: &PortWorker<P>) -> HvResult<Option<(f64, MeterUnit)>> {
        let window = self.read_window;
        let bytes = worker
            .submit(window + Duration::from_secs(1), move |port: &mut P| {
                async move { port.read_exact_within(FRAME_LEN, window).await }.boxed()
            })
            .await?;
        self.sync.push(&bytes);
        Ok(self.sync.latest_frame().and_then(|f| parse_frame(&f)))
    }

    fn reset(&mut self) {
        self.sync = FrameSync::default();
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;

    fn frame(range: u8, digits: &[u8; 5], function: u8, sign: u8) -> Vec<u8> {
        let mut f = vec![range];
        f.extend(digits.iter().map(|d| 0x30 | d));
        f.push(function);
        f.push(sign);
        f.extend_from_slice(&[0x30, 0x30, 0x30, 0x30, 0x0D, 0x8A]);
        f
    }

    // ========================================================================
    // Frame decoding
    // ========================================================================

    #[test]
    fn test_microamp_ranges() {
        let f = frame(0x30, &[1, 2, 3, 4, 5], FUNC_MICROAMP, 0x30);
        assert_eq!(parse_frame(&f), Some((123.45, MeterUnit::Current(CurrentUnit::MicroAmp))));

        let f = frame(0xB1, &[1, 2, 3, 4, 5], FUNC_MICROAMP, 0x30);
        let (v, _) = parse_frame(&f).unwrap();
        assert!((v - 1234.5).abs() < 1e-9);
    }

    #[test]
    fn test_milliamp_negative() {
        let f = frame(0x31, &[0, 1, 2, 3, 4], FUNC_MILLIAMP, SIGN_NEGATIVE);
        let (v, unit) = parse_frame(&f).unwrap();
        assert!((v + 12.34).abs() < 1e-9);
        assert_eq!(unit, MeterUnit::Current(CurrentUnit::MilliAmp));
    }

    #[test]
    fn test_millivolts_reported_as_volts() {
        let f = frame(0x34, &[1, 2, 3, 4, 5], FUNC_VOLT, 0x30);
        let (v, unit) = parse_frame(&f).unwrap();
        assert!((v - 0.12345).abs() < 1e-12);
        assert_eq!(unit, MeterUnit::Volt);
    }

    #[test]
    fn test_rejects_bad_frames() {
        let mut f = frame(0x30, &[1, 2, 3, 4, 5], FUNC_MICROAMP, 0x30);
        f[13] = 0x00;
        assert_eq!(parse_frame(&f), None);

        // Unknown function byte
        let f = frame(0x30, &[1, 2, 3, 4, 5], 0x11, 0x30);
        assert_eq!(parse_frame(&f), None);

        // Digit nibble out of range
        let mut f = frame(0x30, &[1, 2, 3, 4, 5], FUNC_MICROAMP, 0x30);
        f[3] = 0x3C;
        assert_eq!(parse_frame(&f), None);

        assert_eq!(parse_frame(&f[..13]), None);
    }

    // ========================================================================
    // Stream resynchronisation
    // ========================================================================

    #[test]
    fn test_sync_skips_leading_garbage_and_split_chunks() {
        let good = frame(0x30, &[0, 0, 5, 0, 0], FUNC_MICROAMP, 0x30);
        let mut sync = FrameSync::default();

        sync.push(&[0x12, 0x0D, 0x99]);
        sync.push(&good[..6]);
        assert_eq!(sync.next_frame(), None);
        sync.push(&good[6..]);

        let got = sync.next_frame().unwrap();
        assert_eq!(parse_frame(&got).unwrap().0, 5.0);
        assert_eq!(sync.next_frame(), None);
    }

    #[test]
    fn test_sync_keeps_newest_frame() {
        let older = frame(0x30, &[0, 0, 1, 0, 0], FUNC_MICROAMP, 0x30);
        let newer = frame(0x30, &[0, 0, 2, 0, 0], FUNC_MICROAMP, 0x30);
        let mut sync = FrameSync::default();
        sync.push(&older);
        sync.push(&newer);

        let got = sync.latest_frame().unwrap();
        assert_eq!(parse_frame(&got).unwrap().0, 2.0);
    }

    #[test]
    fn test_sync_bounds_backlog_without_terminator() {
        let mut sync = FrameSync::default();
        sync.push(&[0x55; 200]);
        assert_eq!(sync.next_frame(), None);
        assert!(sync.buf.len() < FRAME_LEN);
    }
}
