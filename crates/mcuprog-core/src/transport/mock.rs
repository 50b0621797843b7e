//! Mock serial transport simulating an mcuboot serial bootloader.
//!
//! Host writes are reassembled into frames with the real framing code and
//! handed to a responder; whatever it returns is framed and queued for the
//! host to read. Reset pulses can make the target print its `ready` banner.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use super::traits::{FlowControl, ResetControl, SerialTransport, TransportError};
use crate::payload::image::{UploadChunk, UploadResponse};
use crate::protocol::constants::{
    NMP_GROUP_DEFAULT, NMP_GROUP_IMAGE, NMP_HDR_SIZE, NMP_ID_CONS_ECHO_CTRL, NMP_ID_IMAGE_UPLOAD,
};
use crate::protocol::frame::{Reassembler, encode_segments, parse_segment};
use crate::protocol::header::{NmpHeader, NmpOp};

/// Maps a request payload (header + body) to a response payload.
pub type Responder = Box<dyn FnMut(&[u8]) -> Option<Vec<u8>> + Send>;

struct MockState {
    /// Bytes waiting for the host to read.
    rx: VecDeque<u8>,
    /// Host bytes not yet terminated by `\n`.
    tx_partial: Vec<u8>,
    reassembler: Reassembler,
    /// Every line the host wrote, `\n` stripped.
    lines: Vec<Vec<u8>>,
    /// Reassembled request payloads.
    requests: Vec<Vec<u8>>,
    responder: Option<Responder>,
    /// Emit `ready` once this many pulses have happened; `None` never.
    ready_after: Option<usize>,
    in_reset: bool,
    pulses: usize,
    line_settings: Option<(u32, FlowControl)>,
    /// Cap on bytes returned per read, to exercise partial reads.
    max_read: usize,
}

/// Mock transport for unit testing protocol and session logic.
///
/// Clones share state, so a test can keep one handle for inspection
/// while the session owns another.
#[derive(Clone)]
pub struct MockTransport {
    inner: Arc<Mutex<MockState>>,
}

impl MockTransport {
    /// A well-behaved target: ready after every reset, answers echo and upload.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(MockState {
                rx: VecDeque::new(),
                tx_partial: Vec::new(),
                reassembler: Reassembler::new(),
                lines: Vec::new(),
                requests: Vec::new(),
                responder: Some(Box::new(mcuboot_responder)),
                ready_after: Some(1),
                in_reset: false,
                pulses: 0,
                line_settings: None,
                max_read: 64,
            })),
        }
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        // A panic while holding the lock only happens inside a failing test.
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Replace the target's request handler.
    pub fn set_responder<F>(&self, responder: F)
    where
        F: FnMut(&[u8]) -> Option<Vec<u8>> + Send + 'static,
    {
        self.state().responder = Some(Box::new(responder));
    }

    /// Print `ready` from the `n`th reset pulse on; `None` never answers.
    pub fn ready_after(&self, pulses: Option<usize>) {
        self.state().ready_after = pulses;
    }

    /// Cap the bytes handed out per read call.
    pub fn set_max_read(&self, max_read: usize) {
        self.state().max_read = max_read.max(1);
    }

    /// Queue raw bytes for the host to read.
    pub fn push_rx(&self, bytes: &[u8]) {
        self.state().rx.extend(bytes.iter().copied());
    }

    /// Queue a framed response payload for the host to read.
    pub fn push_frame(&self, payload: &[u8]) {
        let mut state = self.state();
        if let Ok(lines) = encode_segments(payload) {
            for line in lines {
                state.rx.extend(line);
            }
        }
    }

    /// Request payloads received so far.
    pub fn requests(&self) -> Vec<Vec<u8>> {
        self.state().requests.clone()
    }

    /// Request headers received so far.
    pub fn request_headers(&self) -> Vec<NmpHeader> {
        self.state()
            .requests
            .iter()
            .filter_map(|r| NmpHeader::from_bytes(r).ok())
            .collect()
    }

    /// Lines the host wrote, newline stripped.
    pub fn lines_written(&self) -> Vec<Vec<u8>> {
        self.state().lines.clone()
    }

    /// Completed reset pulses.
    pub fn reset_pulses(&self) -> usize {
        self.state().pulses
    }

    pub fn is_in_reset(&self) -> bool {
        self.state().in_reset
    }

    /// Last `configure` call, if any.
    pub fn line_settings(&self) -> Option<(u32, FlowControl)> {
        self.state().line_settings
    }

    /// Handle to drive this target's reset line.
    pub fn reset_line(&self) -> MockResetLine {
        MockResetLine {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl MockState {
    fn take_line(&mut self, line: Vec<u8>) {
        if let Some((kind, decoded)) = parse_segment(&line)
            && let Some(frame) = self.reassembler.push(kind, &decoded)
        {
            if let Some(responder) = self.responder.as_mut()
                && let Some(response) = responder(&frame.payload)
                && let Ok(segments) = encode_segments(&response)
            {
                for segment in segments {
                    self.rx.extend(segment);
                }
            }
            self.requests.push(frame.payload);
        }
        self.lines.push(line);
    }
}

impl SerialTransport for MockTransport {
    fn write(&mut self, data: &[u8]) -> Result<usize, TransportError> {
        let mut state = self.state();
        for &b in data {
            if b == b'\n' {
                let line = std::mem::take(&mut state.tx_partial);
                state.take_line(line);
            } else {
                state.tx_partial.push(b);
            }
        }
        Ok(data.len())
    }

    fn read(&mut self, buf: &mut [u8], _timeout: Duration) -> Result<usize, TransportError> {
        let mut state = self.state();
        let n = buf.len().min(state.max_read).min(state.rx.len());
        for (slot, byte) in buf.iter_mut().zip(state.rx.drain(..n)) {
            *slot = byte;
        }
        Ok(n)
    }

    fn configure(&mut self, baud_rate: u32, flow: FlowControl) -> Result<(), TransportError> {
        self.state().line_settings = Some((baud_rate, flow));
        Ok(())
    }
}

/// Reset line wired to a `MockTransport` target.
#[derive(Clone)]
pub struct MockResetLine {
    inner: Arc<Mutex<MockState>>,
}

impl ResetControl for MockResetLine {
    fn assert_reset(&mut self) -> Result<(), TransportError> {
        let mut state = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        state.in_reset = true;
        state.reassembler.reset();
        state.tx_partial.clear();
        Ok(())
    }

    fn deassert_reset(&mut self) -> Result<(), TransportError> {
        let mut state = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        if state.in_reset {
            state.pulses += 1;
        }
        state.in_reset = false;
        if state.ready_after.is_some_and(|n| state.pulses >= n) {
            state.rx.extend(b"ready\r\n".iter().copied());
        }
        Ok(())
    }
}

/// Default target behaviour: answer echo with an empty map and
/// acknowledge every upload chunk with `{rc: 0, off: next}`.
pub fn mcuboot_responder(request: &[u8]) -> Option<Vec<u8>> {
    let header = NmpHeader::from_bytes(request).ok()?;
    let body = &request[NMP_HDR_SIZE..];

    let rsp_body = match (header.op, header.group, header.id) {
        (NmpOp::Read, NMP_GROUP_DEFAULT, NMP_ID_CONS_ECHO_CTRL) => vec![0xA0],
        (NmpOp::Write, NMP_GROUP_IMAGE, NMP_ID_IMAGE_UPLOAD) => {
            let chunk = UploadChunk::decode(body).ok()?;
            UploadResponse {
                rc: Some(0),
                off: Some(i64::from(chunk.off) + chunk.data.len() as i64),
            }
            .encode()
            .ok()?
        }
        _ => return None,
    };
    Some(response_for(&header, &rsp_body))
}

/// Build a response payload mirroring `request`'s header.
pub fn response_for(request: &NmpHeader, body: &[u8]) -> Vec<u8> {
    let header = NmpHeader {
        op: request.op.response(),
        len: body.len() as u16,
        ..*request
    };
    let mut out = header.to_bytes().to_vec();
    out.extend_from_slice(body);
    out
}
