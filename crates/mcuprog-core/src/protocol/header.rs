//! NMP message header.

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::fmt;
use std::io::Cursor;
use thiserror::Error;

use super::constants::{
    NMP_HDR_SIZE, NMP_OP_READ, NMP_OP_READ_RSP, NMP_OP_WRITE, NMP_OP_WRITE_RSP,
};

#[derive(Error, Debug)]
pub enum HeaderError {
    #[error("Buffer too small: expected {expected}, got {actual}")]
    BufferTooSmall { expected: usize, actual: usize },
    #[error("Body too large for NMP header: {0} bytes")]
    BodyTooLarge(usize),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// NMP operation codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NmpOp {
    Read,
    ReadRsp,
    Write,
    WriteRsp,
    Unknown(u8),
}

impl From<u8> for NmpOp {
    fn from(raw: u8) -> Self {
        match raw {
            NMP_OP_READ => NmpOp::Read,
            NMP_OP_READ_RSP => NmpOp::ReadRsp,
            NMP_OP_WRITE => NmpOp::Write,
            NMP_OP_WRITE_RSP => NmpOp::WriteRsp,
            other => NmpOp::Unknown(other),
        }
    }
}

impl From<NmpOp> for u8 {
    fn from(op: NmpOp) -> Self {
        match op {
            NmpOp::Read => NMP_OP_READ,
            NmpOp::ReadRsp => NMP_OP_READ_RSP,
            NmpOp::Write => NMP_OP_WRITE,
            NmpOp::WriteRsp => NMP_OP_WRITE_RSP,
            NmpOp::Unknown(raw) => raw,
        }
    }
}

impl NmpOp {
    /// Response op the target answers this request op with.
    pub fn response(self) -> NmpOp {
        match self {
            NmpOp::Read => NmpOp::ReadRsp,
            NmpOp::Write => NmpOp::WriteRsp,
            other => other,
        }
    }
}

impl fmt::Display for NmpOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NmpOp::Read => write!(f, "READ"),
            NmpOp::ReadRsp => write!(f, "READ_RSP"),
            NmpOp::Write => write!(f, "WRITE"),
            NmpOp::WriteRsp => write!(f, "WRITE_RSP"),
            NmpOp::Unknown(raw) => write!(f, "OP(0x{raw:02X})"),
        }
    }
}

/// NMP Header (8 bytes)
///
/// ```text
/// +------+-------+----------+------------+-----+----+
/// | op   | flags | len (BE) | group (BE) | seq | id |
/// | 1    | 1     | 2        | 2          | 1   | 1  |
/// +------+-------+----------+------------+-----+----+
/// ```
///
/// `len` is the byte length of the body that follows the header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NmpHeader {
    pub op: NmpOp,
    pub flags: u8,
    pub len: u16,
    pub group: u16,
    pub seq: u8,
    pub id: u8,
}

impl NmpHeader {
    pub const SIZE: usize = NMP_HDR_SIZE;

    pub fn new(op: NmpOp, group: u16, id: u8, seq: u8, body_len: usize) -> Result<Self, HeaderError> {
        let len = u16::try_from(body_len).map_err(|_| HeaderError::BodyTooLarge(body_len))?;
        Ok(Self {
            op,
            flags: 0,
            len,
            group,
            seq,
            id,
        })
    }

    pub fn to_bytes(&self) -> [u8; NMP_HDR_SIZE] {
        let mut buf = [0u8; NMP_HDR_SIZE];
        let mut cursor = Cursor::new(&mut buf[..]);
        // Writes into a fixed 8-byte slice cannot fail.
        let _ = cursor.write_u8(self.op.into());
        let _ = cursor.write_u8(self.flags);
        let _ = cursor.write_u16::<BigEndian>(self.len);
        let _ = cursor.write_u16::<BigEndian>(self.group);
        let _ = cursor.write_u8(self.seq);
        let _ = cursor.write_u8(self.id);
        buf
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, HeaderError> {
        if data.len() < Self::SIZE {
            return Err(HeaderError::BufferTooSmall {
                expected: Self::SIZE,
                actual: data.len(),
            });
        }
        let mut cursor = Cursor::new(data);
        Ok(Self {
            op: NmpOp::from(cursor.read_u8()?),
            flags: cursor.read_u8()?,
            len: cursor.read_u16::<BigEndian>()?,
            group: cursor.read_u16::<BigEndian>()?,
            seq: cursor.read_u8()?,
            id: cursor.read_u8()?,
        })
    }

    /// True when op, group and id match what a response must carry.
    pub fn matches(&self, op: NmpOp, group: u16, id: u8) -> bool {
        self.op == op && self.group == group && self.id == id
    }
}

impl fmt::Display for NmpHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} group={} id={} seq={} len={}",
            self.op, self.group, self.id, self.seq, self.len
        )
    }
}
