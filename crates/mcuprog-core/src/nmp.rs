//! NMP request/response layer.
//!
//! One request is in flight at a time: build the 8-byte header, send
//! header + body as a frame, then block until the response frame arrives.
//! The client owns the framer buffers and the sequence counter, so
//! independent clients never share state.

use thiserror::Error;
use tracing::{debug, instrument};

use crate::protocol::constants::{NMP_GROUP_DEFAULT, NMP_HDR_SIZE, NMP_ID_CONS_ECHO_CTRL};
use crate::protocol::frame::{FrameError, Framer, FramerConfig};
use crate::protocol::header::{HeaderError, NmpHeader, NmpOp};
use crate::transport::traits::{FlowControl, SerialTransport, TransportError};

#[derive(Error, Debug)]
pub enum NmpError {
    #[error("Frame error: {0}")]
    Frame(#[from] FrameError),
    #[error("Header error: {0}")]
    Header(#[from] HeaderError),
    #[error("Unexpected response header: expected {expected_op} group={expected_group} id={expected_id}, got {got}")]
    UnexpectedHeader {
        expected_op: NmpOp,
        expected_group: u16,
        expected_id: u8,
        got: NmpHeader,
    },
}

impl From<TransportError> for NmpError {
    fn from(e: TransportError) -> Self {
        NmpError::Frame(FrameError::Transport(e))
    }
}

/// Parsed response: header plus body bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NmpResponse {
    pub header: NmpHeader,
    pub body: Vec<u8>,
}

impl NmpResponse {
    pub fn parse(raw: &[u8]) -> Result<Self, NmpError> {
        let header = NmpHeader::from_bytes(raw)?;
        let rest = &raw[NMP_HDR_SIZE..];
        let body_len = usize::from(header.len).min(rest.len());
        if body_len < usize::from(header.len) {
            debug!(declared = header.len, actual = rest.len(), "Response body shorter than header length");
        }
        Ok(Self {
            header,
            body: rest[..body_len].to_vec(),
        })
    }

    /// Fail unless the header carries the given op, group and id.
    pub fn expect(&self, op: NmpOp, group: u16, id: u8) -> Result<(), NmpError> {
        if self.header.matches(op, group, id) {
            Ok(())
        } else {
            Err(NmpError::UnexpectedHeader {
                expected_op: op,
                expected_group: group,
                expected_id: id,
                got: self.header,
            })
        }
    }
}

/// NMP client over a serial link.
pub struct NmpClient<T: SerialTransport> {
    transport: T,
    framer: Framer,
    seq: u8,
}

impl<T: SerialTransport> NmpClient<T> {
    pub fn new(transport: T, config: FramerConfig) -> Self {
        Self {
            transport,
            framer: Framer::new(config),
            seq: 0,
        }
    }

    /// Build a request header, consuming the next sequence number.
    pub fn populate_header(
        &mut self,
        op: NmpOp,
        group: u16,
        id: u8,
        body_len: usize,
    ) -> Result<NmpHeader, NmpError> {
        let header = NmpHeader::new(op, group, id, self.seq, body_len)?;
        self.seq = self.seq.wrapping_add(1);
        Ok(header)
    }

    /// Sequence number the next header will carry.
    pub fn next_seq(&self) -> u8 {
        self.seq
    }

    /// Send header + body and return the raw response payload.
    #[instrument(level = "debug", skip(self, header, body), fields(header = %header, body_len = body.len()))]
    pub fn send_request(&mut self, header: &NmpHeader, body: &[u8]) -> Result<Vec<u8>, NmpError> {
        let mut payload = Vec::with_capacity(NMP_HDR_SIZE + body.len());
        payload.extend_from_slice(&header.to_bytes());
        payload.extend_from_slice(body);

        self.framer.send(&mut self.transport, &payload)?;
        Ok(self.framer.receive(&mut self.transport)?)
    }

    /// Full exchange: header, send, parse, and check the response header.
    pub fn request(
        &mut self,
        op: NmpOp,
        group: u16,
        id: u8,
        body: &[u8],
    ) -> Result<NmpResponse, NmpError> {
        let header = self.populate_header(op, group, id, body.len())?;
        let raw = self.send_request(&header, body)?;
        let response = NmpResponse::parse(&raw)?;
        response.expect(op.response(), group, id)?;
        Ok(response)
    }

    /// Echo request with an empty body; succeeds when the target answers.
    pub fn ping(&mut self) -> Result<(), NmpError> {
        self.request(NmpOp::Read, NMP_GROUP_DEFAULT, NMP_ID_CONS_ECHO_CTRL, &[])?;
        debug!("Ping answered");
        Ok(())
    }

    /// Read one raw text line from the link.
    pub fn read_line(&mut self) -> Result<Option<Vec<u8>>, NmpError> {
        Ok(self.framer.read_line(&mut self.transport)?)
    }

    pub fn configure(&mut self, baud_rate: u32, flow: FlowControl) -> Result<(), NmpError> {
        Ok(self.transport.configure(baud_rate, flow)?)
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    pub fn into_inner(self) -> T {
        self.transport
    }
}
