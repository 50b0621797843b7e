//! mcuprog-core: mcuboot serial-recovery upload protocol in Rust.
//!
//! This crate programs a firmware image into a microcontroller running the
//! mcuboot serial bootloader, over a UART plus a GPIO reset line.
//!
//! # Architecture
//!
//! The crate is organized into layers:
//!
//! - **Protocol**: CRC16, NLIP line framing and reassembly, NMP header
//! - **Transport**: serial link and reset line abstraction (serialport, sysfs GPIO, mock)
//! - **NMP**: request/response client with a session-owned sequence counter
//! - **Payload**: CBOR upload chunks and chunk bookkeeping
//! - **Upload**: chunked image upload engine
//! - **State**: session state machine
//! - **Events**: Observer pattern for UI decoupling
//! - **Session**: High-level orchestrator
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use mcuprog_core::events::TracingObserver;
//! use mcuprog_core::session::{ProgramSession, SessionConfig};
//!
//! let config = SessionConfig {
//!     device: "/dev/ttyUSB0".to_string(),
//!     slot: 1,
//!     ..Default::default()
//! };
//!
//! let mut session = ProgramSession::open(config, Arc::new(TracingObserver)).expect("open failed");
//! session.program_file("app.signed.bin").expect("programming failed");
//! ```

pub mod events;
pub mod nmp;
pub mod payload;
pub mod protocol;
pub mod session;
pub mod state;
pub mod transport;
pub mod upload;

// Re-exports for convenience
pub use events::{LogLevel, ProgEvent, ProgObserver, ProgPhase, TracingObserver};
pub use nmp::{NmpClient, NmpError, NmpResponse};
pub use payload::{ChunkState, ImageError, ImageSlot};
pub use protocol::{CrcPolicy, FramerConfig, NmpHeader, NmpOp, crc16};
pub use session::{ProgramSession, SessionConfig, SessionError};
pub use transport::{
    MockTransport, ResetControl, SerialPortTransport, SerialTransport, SysfsResetLine,
    TransportError,
};
pub use upload::{UploadError, UploadReport, upload_image};
