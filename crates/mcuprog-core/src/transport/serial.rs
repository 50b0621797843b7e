//! UART transport on `serialport`, plus a sysfs-style GPIO reset line.

use std::io::{ErrorKind, Read, Write};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use serialport::{DataBits, Parity, SerialPort, StopBits};
use tracing::{debug, info, instrument, trace};

use super::traits::{FlowControl, ResetControl, SerialTransport, TransportError};
use crate::protocol::constants::{DEFAULT_BAUD_RATE, RESET_SETTLE_MS};

/// Serial port transport.
pub struct SerialPortTransport {
    port: Box<dyn SerialPort>,
    path: String,
}

impl SerialPortTransport {
    /// Open `path` at the default 115200 8N1.
    #[instrument(level = "info")]
    pub fn open(path: &str) -> Result<Self, TransportError> {
        Self::open_with_baud(path, DEFAULT_BAUD_RATE)
    }

    pub fn open_with_baud(path: &str, baud_rate: u32) -> Result<Self, TransportError> {
        let port = serialport::new(path, baud_rate)
            .data_bits(DataBits::Eight)
            .parity(Parity::None)
            .stop_bits(StopBits::One)
            .timeout(Duration::from_millis(100))
            .open()
            .map_err(|e| TransportError::OpenFailed {
                path: path.to_string(),
                message: e.to_string(),
            })?;

        info!(path = %path, baud_rate, "Serial port opened");
        Ok(Self {
            port,
            path: path.to_string(),
        })
    }

    pub fn path(&self) -> &str {
        &self.path
    }
}

impl SerialTransport for SerialPortTransport {
    fn write(&mut self, data: &[u8]) -> Result<usize, TransportError> {
        self.port
            .write_all(data)
            .map_err(|e| TransportError::WriteFailed(e.to_string()))?;
        self.port
            .flush()
            .map_err(|e| TransportError::WriteFailed(e.to_string()))?;
        trace!(bytes_written = data.len(), "Write complete");
        Ok(data.len())
    }

    fn read(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize, TransportError> {
        if self.port.timeout() != timeout {
            self.port
                .set_timeout(timeout)
                .map_err(|e| TransportError::ReadFailed(e.to_string()))?;
        }
        match self.port.read(buf) {
            Ok(n) => {
                trace!(bytes_read = n, "Read complete");
                Ok(n)
            }
            Err(e) if e.kind() == ErrorKind::TimedOut || e.kind() == ErrorKind::WouldBlock => Ok(0),
            Err(e) if e.kind() == ErrorKind::Interrupted => Ok(0),
            Err(e) => Err(TransportError::ReadFailed(e.to_string())),
        }
    }

    fn configure(&mut self, baud_rate: u32, flow: FlowControl) -> Result<(), TransportError> {
        let flow = match flow {
            FlowControl::None => serialport::FlowControl::None,
            FlowControl::Hardware => serialport::FlowControl::Hardware,
        };
        let apply = |port: &mut Box<dyn SerialPort>| -> serialport::Result<()> {
            port.set_baud_rate(baud_rate)?;
            port.set_flow_control(flow)?;
            port.set_data_bits(DataBits::Eight)?;
            port.set_parity(Parity::None)?;
            port.set_stop_bits(StopBits::One)
        };
        apply(&mut self.port).map_err(|e| TransportError::ConfigureFailed(e.to_string()))?;
        debug!(baud_rate, ?flow, "Serial port configured");
        Ok(())
    }
}

/// Reset line driven by writing `0`/`1` into a GPIO value file.
///
/// The line is active low: `0` holds the target in reset.
#[derive(Debug, Clone)]
pub struct SysfsResetLine {
    value_file: PathBuf,
    settle: Duration,
}

impl SysfsResetLine {
    pub fn new(value_file: impl AsRef<Path>) -> Self {
        Self::with_settle(value_file, Duration::from_millis(RESET_SETTLE_MS))
    }

    pub fn with_settle(value_file: impl AsRef<Path>, settle: Duration) -> Self {
        Self {
            value_file: value_file.as_ref().to_path_buf(),
            settle,
        }
    }

    fn drive(&self, level: &str) -> Result<(), TransportError> {
        std::fs::write(&self.value_file, level).map_err(|e| {
            TransportError::ResetFailed(format!("{}: {}", self.value_file.display(), e))
        })?;
        thread::sleep(self.settle);
        Ok(())
    }
}

impl ResetControl for SysfsResetLine {
    fn assert_reset(&mut self) -> Result<(), TransportError> {
        trace!(file = %self.value_file.display(), "Drop reset line");
        self.drive("0")
    }

    fn deassert_reset(&mut self) -> Result<(), TransportError> {
        trace!(file = %self.value_file.display(), "Release reset line");
        self.drive("1")
    }
}
