//! Leybold COMBIVAC CM 52 vacuum gauge controller
//!
//! Polled with `RPV<channel>\r`; the reply is `<status>[,]<TAB><x.xxxxE±xx>`
//! terminated by CR (optionally followed by LF). Pressure is in Pa.

use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use tokio::time::Instant;
use tracing::debug;

use super::MeterProtocol;
use crate::error::HvResult;
use crate::meter::MeterUnit;
use crate::port::{PortWorker, SerialIo};

pub const DEFAULT_BAUD: u32 = 19200;
/// IONIVAC gauge; 1 and 2 are the two TM channels
pub const DEFAULT_CHANNEL: u8 = 3;

const REPLY_TIMEOUT: Duration = Duration::from_millis(600);

/// Pressure from one `RPV` reply line. The status field is ignored.
pub fn parse_rpv(line: &str) -> Option<f64> {
    let cleaned = line.trim().replace([',', '\t'], " ");
    let mut fields = cleaned.split_whitespace();
    let _status = fields.next()?;
    let value = fields.next()?.parse::<f64>().ok()?;
    value.is_finite().then_some(value)
}

async fn read_until_cr<P: SerialIo>(port: &mut P, limit: Duration) -> std::io::Result<Vec<u8>> {
    let deadline = Instant::now() + limit;
    let mut line = Vec::new();
    let mut byte = [0u8; 1];
    while Instant::now() < deadline {
        let n = port
            .read_some(&mut byte, deadline.saturating_duration_since(Instant::now()))
            .await?;
        if n == 0 {
            let left = deadline.saturating_duration_since(Instant::now());
            tokio::time::sleep(left.min(Duration::from_millis(5))).await;
            continue;
        }
        if byte[0] == b'\r' {
            break;
        }
        line.push(byte[0]);
    }
    Ok(line)
}

#[derive(Debug)]
pub struct Cm52Protocol {
    channel: u8,
    interval: Duration,
}

impl Cm52Protocol {
    pub fn new(channel: u8, interval: Duration) -> Self {
        Self {
            channel,
            // The gauge needs a moment between queries
            interval: interval.max(Duration::from_millis(100)),
        }
    }
}

#[async_trait]
impl MeterProtocol for Cm52Protocol {
    fn name(&self) -> &'static str {
        "CM52"
    }

    fn idle_unit(&self) -> MeterUnit {
        MeterUnit::Pascal
    }

    fn interval(&self) -> Duration {
        self.interval
    }

    async fn poll<P: SerialIo>(&mut self, worker: &PortWorker<P>) -> HvResult<Option<(f64, MeterUnit)>> {
        let command = format!("RPV{}\r", self.channel);
        let raw = worker
            .submit(REPLY_TIMEOUT + Duration::from_secs(1), move |port: &mut P| {
                async move {
                    port.clear_buffers().await?;
                    port.write_all(command.as_bytes()).await?;
                    read_until_cr(port, REPLY_TIMEOUT).await
                }
                .boxed()
            })
            .await?;

        // A trailing LF from the previous reply lands at the front
        let line = String::from_utf8_lossy(&raw);
        let line = line.trim_start_matches('\n');
        if line.is_empty() {
            return Ok(None);
        }
        let pressure = parse_rpv(line);
        if pressure.is_none() {
            debug!("CM52 reply not understood: {:?}", line);
        }
        Ok(pressure.map(|pa| (pa, MeterUnit::Pascal)))
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;

    #[test]
    fn test_parse_reply_separators() {
        assert_eq!(parse_rpv("0,\t1.2345E-03"), Some(1.2345e-3));
        assert_eq!(parse_rpv("0\t2.0E+02"), Some(200.0));
        assert_eq!(parse_rpv("  1 5.5E-05  "), Some(5.5e-5));
    }

    #[test]
    fn test_parse_rejects_incomplete_reply() {
        assert_eq!(parse_rpv(""), None);
        assert_eq!(parse_rpv("0"), None);
        assert_eq!(parse_rpv("0,\tover"), None);
        assert_eq!(parse_rpv("0, inf"), None);
    }
}
