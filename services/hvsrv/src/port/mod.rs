//! Exclusive serial-port access
//!
//! A physical interface is owned by exactly one [`worker::PortWorker`] task.
//! Everything that talks to the device goes through the traits below so the
//! same drivers run against real hardware ([`serial::SerialOpener`]) and the
//! in-process simulator used by the tests.

pub mod serial;
pub mod worker;

use std::fmt;
use std::io;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::error::HvResult;

pub use worker::{PortEvent, PortWorker};

/// Port name and line speed of one physical interface
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortTarget {
    pub port: String,
    pub baud: u32,
}

impl PortTarget {
    pub fn new(port: impl Into<String>, baud: u32) -> Self {
        Self {
            port: port.into(),
            baud,
        }
    }
}

impl fmt::Display for PortTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.port, self.baud)
    }
}

/// Byte-level access to an opened interface
#[async_trait]
pub trait SerialIo: Send + 'static {
    async fn write_all(&mut self, data: &[u8]) -> io::Result<()>;

    /// Read whatever arrives within `limit`. `Ok(0)` means nothing arrived.
    async fn read_some(&mut self, buf: &mut [u8], limit: Duration) -> io::Result<usize>;

    /// Discard both the input and output buffers
    async fn clear_buffers(&mut self) -> io::Result<()>;

    /// Collect up to `len` bytes before `limit` expires. The result may be
    /// short (or empty) when the device stops talking.
    async fn read_exact_within(&mut self, len: usize, limit: Duration) -> io::Result<Vec<u8>> {
        let deadline = Instant::now() + limit;
        let mut out = Vec::with_capacity(len);
        let mut buf = [0u8; 256];

        while out.len() < len {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            let want = (len - out.len()).min(buf.len());
            let n = self.read_some(&mut buf[..want], deadline - now).await?;
            if n == 0 {
                let left = deadline.saturating_duration_since(Instant::now());
                tokio::time::sleep(left.min(Duration::from_millis(5))).await;
                continue;
            }
            out.extend_from_slice(&buf[..n]);
        }
        Ok(out)
    }

    /// Read one `\n`-terminated line (terminator stripped) within `limit`.
    /// Returns whatever was collected when the deadline passes.
    async fn read_line_within(&mut self, limit: Duration) -> io::Result<String> {
        let deadline = Instant::now() + limit;
        let mut line = Vec::new();
        let mut byte = [0u8; 1];

        loop {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            let n = self.read_some(&mut byte, deadline - now).await?;
            if n == 0 {
                let left = deadline.saturating_duration_since(Instant::now());
                tokio::time::sleep(left.min(Duration::from_millis(5))).await;
                continue;
            }
            if byte[0] == b'\n' {
                break;
            }
            line.push(byte[0]);
        }
        Ok(String::from_utf8_lossy(&line).trim_end_matches('\r').to_string())
    }
}

/// Opens interfaces for a [`PortWorker`]
#[async_trait]
pub trait PortOpener: Send + Sync + 'static {
    type Port: SerialIo;

    async fn open(&self, target: &PortTarget) -> HvResult<Self::Port>;
}
