//! Protocol constants for the mcuboot serial bootloader.
//!
//! Values come from the newtmgr (NMP) management protocol and the
//! shell "NLIP" line framing used by mcuboot's serial recovery mode.

// NMP operations
pub const NMP_OP_READ: u8 = 0;
pub const NMP_OP_READ_RSP: u8 = 1;
pub const NMP_OP_WRITE: u8 = 2;
pub const NMP_OP_WRITE_RSP: u8 = 3;

// NMP groups
pub const NMP_GROUP_DEFAULT: u16 = 0;
pub const NMP_GROUP_IMAGE: u16 = 1;

// NMP command ids
pub const NMP_ID_CONS_ECHO_CTRL: u8 = 1; // group DEFAULT
pub const NMP_ID_IMAGE_UPLOAD: u8 = 1; // group IMAGE

/// Size of the fixed NMP header.
pub const NMP_HDR_SIZE: usize = 8;

// Segment markers
pub const SHELL_NLIP_PKT_START: [u8; 2] = [0x06, 0x09];
pub const SHELL_NLIP_DATA_START: [u8; 2] = [0x04, 0x14];

/// Maximum base64 characters written per segment line.
///
/// Must stay a multiple of 4 so each line decodes on its own. With the
/// 2-byte marker and the newline the line fits the target's 128 byte buffer.
pub const MAX_SEGMENT_CHARS: usize = 124;

/// Raw bytes carried by one full segment (124 / 4 * 3).
pub const SEGMENT_RAW_BYTES: usize = MAX_SEGMENT_CHARS / 4 * 3;

/// Length prefix plus CRC trailer around every frame payload.
pub const FRAME_OVERHEAD: usize = 4;

/// Largest payload whose `len + 2` still fits the 16-bit length prefix.
pub const MAX_FRAME_PAYLOAD: usize = u16::MAX as usize - 2;

/// Longest line accepted from the target before it is dropped.
pub const MAX_LINE_LEN: usize = 512;

/// Image bytes sent per upload request.
///
/// Header + CBOR map + base64 expansion must fit the target's receive buffer.
pub const READ_CHUNK_SIZE: usize = 196;

/// Slot number lives in the top byte of the first chunk's `len` field.
pub const SLOT_SHIFT: u32 = 24;
pub const IMAGE_SIZE_MASK: u32 = 0x00FF_FFFF;

/// Handshake line printed by the bootloader after reset.
pub const READY_BANNER: &[u8] = b"ready";

// Timing defaults (milliseconds)
pub const RX_TIMEOUT_MS: u64 = 10_000;
pub const BYTE_TIMEOUT_MS: u64 = RX_TIMEOUT_MS / 2;
pub const SEGMENT_DELAY_MS: u64 = 20;
pub const RESET_SETTLE_MS: u64 = 100;

pub const MAX_RESET_ATTEMPTS: u32 = 5;

// Serial defaults
pub const DEFAULT_BAUD_RATE: u32 = 115_200;
pub const DEFAULT_DEVICE: &str = "/dev/ttyO4";
pub const DEFAULT_RESET_GPIO: &str = "/tmp/io/bleReset";
