//! Transport layer module.

pub mod line;
pub mod mock;
pub mod serial;
pub mod traits;

pub use line::{LineRead, LineReader};
pub use mock::{MockResetLine, MockTransport};
pub use serial::{SerialPortTransport, SysfsResetLine};
pub use traits::{FlowControl, ResetControl, SerialTransport, TransportError};
