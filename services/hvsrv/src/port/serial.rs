//! Real serial ports via `tokio-serial`

use std::io;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_serial::{ClearBuffer, SerialPort, SerialPortBuilderExt, SerialStream};
use tracing::{debug, error, info};

use super::{PortOpener, PortTarget, SerialIo};
use crate::error::{HvError, HvResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SerialParity {
    #[default]
    None,
    Odd,
    Even,
}

/// Line settings shared by every port opened through one [`SerialOpener`]
#[derive(Debug, Clone)]
pub struct SerialSettings {
    pub data_bits: u8,
    pub parity: SerialParity,
    pub stop_bits: u8,
    /// Pause after opening before the first frame
    pub open_settle: Duration,
}

impl Default for SerialSettings {
    fn default() -> Self {
        Self {
            data_bits: 8,
            parity: SerialParity::None,
            stop_bits: 1,
            open_settle: Duration::from_millis(250),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct SerialOpener {
    settings: SerialSettings,
}

impl SerialOpener {
    pub fn new(settings: SerialSettings) -> Self {
        Self { settings }
    }
}

#[async_trait]
impl PortOpener for SerialOpener {
    type Port = SerialPortIo;

    async fn open(&self, target: &PortTarget) -> HvResult<SerialPortIo> {
        debug!("RTU: {} @{}baud", target.port, target.baud);

        let data_bits = match self.settings.data_bits {
            5 => tokio_serial::DataBits::Five,
            6 => tokio_serial::DataBits::Six,
            7 => tokio_serial::DataBits::Seven,
            _ => tokio_serial::DataBits::Eight,
        };
        let parity = match self.settings.parity {
            SerialParity::None => tokio_serial::Parity::None,
            SerialParity::Odd => tokio_serial::Parity::Odd,
            SerialParity::Even => tokio_serial::Parity::Even,
        };
        let stop_bits = match self.settings.stop_bits {
            2 => tokio_serial::StopBits::Two,
            _ => tokio_serial::StopBits::One,
        };

        let mut stream = tokio_serial::new(&target.port, target.baud)
            .data_bits(data_bits)
            .parity(parity)
            .stop_bits(stop_bits)
            .timeout(Duration::from_millis(100))
            .open_native_async()
            .map_err(|e| {
                error!("RTU err: {} - {}", target.port, e);
                HvError::connection(format!("Failed to open serial port {}: {e}", target.port))
            })?;

        // Some USB adapters reset the device on DTR/RTS edges
        if let Err(e) = stream.write_data_terminal_ready(false) {
            debug!("DTR: {}", e);
        }
        if let Err(e) = stream.write_request_to_send(false) {
            debug!("RTS: {}", e);
        }
        if let Err(e) = stream.clear(ClearBuffer::All) {
            debug!("Clear on open: {}", e);
        }
        tokio::time::sleep(self.settings.open_settle).await;

        info!("RTU opened: {}", target);
        Ok(SerialPortIo {
            stream,
            name: target.port.clone(),
        })
    }
}

/// Opened serial interface
pub struct SerialPortIo {
    stream: SerialStream,
    name: String,
}

impl SerialPortIo {
    pub fn name(&self) -> &str {
        &self.name
    }
}

#[async_trait]
impl SerialIo for SerialPortIo {
    async fn write_all(&mut self, data: &[u8]) -> io::Result<()> {
        self.stream.write_all(data).await?;
        self.stream.flush().await
    }

    async fn read_some(&mut self, buf: &mut [u8], limit: Duration) -> io::Result<usize> {
        match tokio::time::timeout(limit, self.stream.read(buf)).await {
            Ok(result) => result,
            Err(_) => Ok(0),
        }
    }

    async fn clear_buffers(&mut self) -> io::Result<()> {
        self.stream.clear(ClearBuffer::All).map_err(io::Error::from)
    }
}
