//! Protocol module - NLIP framing and NMP definitions.

pub mod constants;
pub mod crc;
pub mod frame;
pub mod header;

pub use constants::*;
pub use crc::crc16;
pub use frame::{CrcPolicy, FrameError, Framer, FramerConfig, Reassembler, SegmentKind};
pub use header::{HeaderError, NmpHeader, NmpOp};
