//! Serial transport layer abstraction.
//!
//! Defines the `SerialTransport` trait for the UART link and the
//! `ResetControl` trait for the target's reset line, allowing different
//! implementations (serialport + sysfs GPIO, mock, etc.).

use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Failed to open {path}: {message}")]
    OpenFailed { path: String, message: String },

    #[error("Failed to configure port: {0}")]
    ConfigureFailed(String),

    #[error("Write failed: {0}")]
    WriteFailed(String),

    #[error("Read failed: {0}")]
    ReadFailed(String),

    #[error("Reset line failed: {0}")]
    ResetFailed(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// UART flow control mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FlowControl {
    /// No flow control (the serial bootloader runs without RTS/CTS).
    #[default]
    None,
    /// Hardware RTS/CTS.
    Hardware,
}

/// Abstract serial link to the target.
///
/// Reads are bounded: `read` waits at most `timeout` for data and returns
/// `Ok(0)` when nothing arrived in that window.
pub trait SerialTransport {
    /// Write all of `data` to the link.
    fn write(&mut self, data: &[u8]) -> Result<usize, TransportError>;

    /// Read whatever is available into `buf`, waiting up to `timeout`.
    fn read(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize, TransportError>;

    /// Apply line settings before talking to the bootloader.
    fn configure(&mut self, baud_rate: u32, flow: FlowControl) -> Result<(), TransportError>;
}

impl<T: SerialTransport + ?Sized> SerialTransport for &mut T {
    fn write(&mut self, data: &[u8]) -> Result<usize, TransportError> {
        (**self).write(data)
    }

    fn read(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize, TransportError> {
        (**self).read(buf, timeout)
    }

    fn configure(&mut self, baud_rate: u32, flow: FlowControl) -> Result<(), TransportError> {
        (**self).configure(baud_rate, flow)
    }
}

/// Target reset line.
///
/// Implementations settle after each edge, so a pulse is just
/// `assert_reset` followed by `deassert_reset`.
pub trait ResetControl {
    /// Hold the target in reset.
    fn assert_reset(&mut self) -> Result<(), TransportError>;

    /// Release the target from reset.
    fn deassert_reset(&mut self) -> Result<(), TransportError>;

    /// Full reset pulse.
    fn pulse(&mut self) -> Result<(), TransportError> {
        self.assert_reset()?;
        self.deassert_reset()
    }
}

impl<R: ResetControl + ?Sized> ResetControl for &mut R {
    fn assert_reset(&mut self) -> Result<(), TransportError> {
        (**self).assert_reset()
    }

    fn deassert_reset(&mut self) -> Result<(), TransportError> {
        (**self).deassert_reset()
    }
}
