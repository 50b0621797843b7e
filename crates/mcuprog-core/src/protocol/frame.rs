//! NLIP line framing.
//!
//! A payload travels as a frame:
//!
//! ```text
//! +-------------------+-----------+---------------+
//! | len+2 (2B, BE)    | payload   | CRC16 (2B BE) |
//! +-------------------+-----------+---------------+
//! ```
//!
//! The frame is base64 encoded and cut into lines of at most 124
//! characters. The first line starts with `06 09`, later lines with
//! `04 14`, and every line ends in `\n`.

use std::thread;
use std::time::{Duration, Instant};

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, trace, warn};

use super::constants::{
    BYTE_TIMEOUT_MS, FRAME_OVERHEAD, MAX_FRAME_PAYLOAD, MAX_SEGMENT_CHARS, RX_TIMEOUT_MS,
    SEGMENT_DELAY_MS, SHELL_NLIP_DATA_START, SHELL_NLIP_PKT_START,
};
use super::crc::crc16;
use crate::transport::line::{LineRead, LineReader};
use crate::transport::traits::{SerialTransport, TransportError};

#[derive(Error, Debug)]
pub enum FrameError {
    #[error("Payload too large: {len} bytes, maximum {max}")]
    PayloadTooLarge { len: usize, max: usize },
    #[error("No complete frame within {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
}

/// What to do with a reassembled frame whose CRC does not check out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CrcPolicy {
    /// Log a warning and hand the payload up anyway.
    #[default]
    Warn,
    /// Drop the frame and keep waiting for a good one.
    Reject,
}

/// Timing and integrity knobs for the framer.
#[derive(Debug, Clone, Copy)]
pub struct FramerConfig {
    /// Overall deadline for one `receive`.
    pub rx_timeout: Duration,
    /// Longest wait for the next byte of a line.
    pub byte_timeout: Duration,
    /// Pause before each continuation line.
    pub segment_delay: Duration,
    pub crc_policy: CrcPolicy,
}

impl Default for FramerConfig {
    fn default() -> Self {
        Self {
            rx_timeout: Duration::from_millis(RX_TIMEOUT_MS),
            byte_timeout: Duration::from_millis(BYTE_TIMEOUT_MS),
            segment_delay: Duration::from_millis(SEGMENT_DELAY_MS),
            crc_policy: CrcPolicy::Warn,
        }
    }
}

/// Segment type, from the two marker bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentKind {
    Start,
    Continuation,
}

impl SegmentKind {
    pub fn marker(self) -> [u8; 2] {
        match self {
            SegmentKind::Start => SHELL_NLIP_PKT_START,
            SegmentKind::Continuation => SHELL_NLIP_DATA_START,
        }
    }
}

/// Wrap `payload` in length prefix and CRC trailer.
pub fn encode_frame(payload: &[u8]) -> Result<Vec<u8>, FrameError> {
    if payload.len() > MAX_FRAME_PAYLOAD {
        return Err(FrameError::PayloadTooLarge {
            len: payload.len(),
            max: MAX_FRAME_PAYLOAD,
        });
    }
    let len_prefix = (payload.len() + 2) as u16;
    let crc = crc16(payload, true);

    let mut frame = Vec::with_capacity(payload.len() + FRAME_OVERHEAD);
    frame.extend_from_slice(&len_prefix.to_be_bytes());
    frame.extend_from_slice(payload);
    frame.extend_from_slice(&crc.to_be_bytes());
    Ok(frame)
}

/// Encode `payload` into the wire lines that carry it, markers and `\n` included.
pub fn encode_segments(payload: &[u8]) -> Result<Vec<Vec<u8>>, FrameError> {
    let encoded = STANDARD.encode(encode_frame(payload)?);

    let lines = encoded
        .as_bytes()
        .chunks(MAX_SEGMENT_CHARS)
        .enumerate()
        .map(|(i, chunk)| {
            let kind = if i == 0 {
                SegmentKind::Start
            } else {
                SegmentKind::Continuation
            };
            let mut line = Vec::with_capacity(chunk.len() + 3);
            line.extend_from_slice(&kind.marker());
            line.extend_from_slice(chunk);
            line.push(b'\n');
            line
        })
        .collect();
    Ok(lines)
}

/// Classify and decode one received line (without its `\n`).
///
/// Returns `None` for anything that is not a usable segment: no marker,
/// invalid base64, or nothing left after decoding.
pub fn parse_segment(line: &[u8]) -> Option<(SegmentKind, Vec<u8>)> {
    let line = line.strip_prefix(b"\r").unwrap_or(line);
    if line.len() < 2 {
        return None;
    }
    let kind = match [line[0], line[1]] {
        SHELL_NLIP_PKT_START => SegmentKind::Start,
        SHELL_NLIP_DATA_START => SegmentKind::Continuation,
        _ => return None,
    };
    let text = &line[2..];
    let text = text.strip_suffix(b"\r").unwrap_or(text);

    let decoded = STANDARD.decode(text).ok()?;
    if decoded.is_empty() {
        return None;
    }
    Some((kind, decoded))
}

/// A fully reassembled frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedFrame {
    /// Frame payload, CRC trailer removed.
    pub payload: Vec<u8>,
    /// CRC residual over payload + trailer; 0 when intact.
    pub crc_residual: u16,
}

impl ReceivedFrame {
    pub fn crc_ok(&self) -> bool {
        self.crc_residual == 0
    }
}

/// Accumulates decoded segments until a whole frame is present.
#[derive(Debug, Default)]
pub struct Reassembler {
    buf: Vec<u8>,
    expected: Option<usize>,
}

impl Reassembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one decoded segment. Returns the frame once it is complete.
    pub fn push(&mut self, kind: SegmentKind, decoded: &[u8]) -> Option<ReceivedFrame> {
        match kind {
            SegmentKind::Start => {
                if decoded.len() < 2 {
                    trace!("Start segment too short for length prefix");
                    self.reset();
                    return None;
                }
                let total = usize::from(u16::from_be_bytes([decoded[0], decoded[1]]));
                self.buf.clear();
                self.buf.extend_from_slice(&decoded[2..]);
                self.expected = Some(total);
            }
            SegmentKind::Continuation => {
                if self.expected.is_none() {
                    trace!("Continuation without start segment, dropped");
                    return None;
                }
                self.buf.extend_from_slice(decoded);
            }
        }

        let total = self.expected?;
        if self.buf.len() > total {
            warn!(expected = total, got = self.buf.len(), "Frame overran its length prefix, dropped");
            self.reset();
            return None;
        }
        if self.buf.len() < total {
            return None;
        }

        let crc_residual = crc16(&self.buf, true);
        let mut payload = std::mem::take(&mut self.buf);
        self.expected = None;
        payload.truncate(total.saturating_sub(2));
        Some(ReceivedFrame {
            payload,
            crc_residual,
        })
    }

    /// Forget any partial frame.
    pub fn reset(&mut self) {
        self.buf.clear();
        self.expected = None;
    }

    pub fn in_progress(&self) -> bool {
        self.expected.is_some()
    }
}

/// Sends and receives framed payloads over a serial transport.
///
/// Owns the line buffer and reassembly state for one session.
#[derive(Debug)]
pub struct Framer {
    config: FramerConfig,
    reader: LineReader,
    reassembler: Reassembler,
}

impl Framer {
    pub fn new(config: FramerConfig) -> Self {
        Self {
            config,
            reader: LineReader::new(),
            reassembler: Reassembler::new(),
        }
    }

    pub fn config(&self) -> &FramerConfig {
        &self.config
    }

    /// Write `payload` as one frame.
    pub fn send<T: SerialTransport + ?Sized>(
        &mut self,
        transport: &mut T,
        payload: &[u8],
    ) -> Result<(), FrameError> {
        let segments = encode_segments(payload)?;
        debug!(len = payload.len(), segments = segments.len(), "Sending frame");

        for (i, segment) in segments.iter().enumerate() {
            if i > 0 && !self.config.segment_delay.is_zero() {
                thread::sleep(self.config.segment_delay);
            }
            transport.write(segment)?;
        }
        Ok(())
    }

    /// Wait for the next complete frame and return its payload.
    pub fn receive<T: SerialTransport + ?Sized>(
        &mut self,
        transport: &mut T,
    ) -> Result<Vec<u8>, FrameError> {
        let deadline = Instant::now() + self.config.rx_timeout;
        self.reassembler.reset();

        loop {
            let now = Instant::now();
            if now >= deadline {
                return Err(FrameError::Timeout {
                    timeout_ms: self.config.rx_timeout.as_millis() as u64,
                });
            }
            let wait = self.config.byte_timeout.min(deadline - now);

            let line = match self.reader.read_line(transport, wait)? {
                LineRead::Line(line) => line,
                LineRead::Overflow | LineRead::TimedOut => continue,
            };
            let Some((kind, decoded)) = parse_segment(&line) else {
                trace!(len = line.len(), "Ignoring non-segment line");
                continue;
            };
            let Some(frame) = self.reassembler.push(kind, &decoded) else {
                continue;
            };

            if !frame.crc_ok() {
                match self.config.crc_policy {
                    CrcPolicy::Warn => {
                        warn!(residual = %format!("0x{:04X}", frame.crc_residual), "Bad CRC on received frame, using it anyway");
                    }
                    CrcPolicy::Reject => {
                        warn!(residual = %format!("0x{:04X}", frame.crc_residual), "Bad CRC on received frame, dropped");
                        continue;
                    }
                }
            }
            debug!(len = frame.payload.len(), "Received frame");
            return Ok(frame.payload);
        }
    }

    /// Read one raw text line, e.g. the bootloader's `ready` banner.
    pub fn read_line<T: SerialTransport + ?Sized>(
        &mut self,
        transport: &mut T,
    ) -> Result<Option<Vec<u8>>, FrameError> {
        match self.reader.read_line(transport, self.config.byte_timeout)? {
            LineRead::Line(line) => Ok(Some(line)),
            LineRead::Overflow | LineRead::TimedOut => Ok(None),
        }
    }
}
