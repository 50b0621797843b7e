//! Image upload bodies and chunk bookkeeping.
//!
//! Each upload request carries a CBOR map:
//!
//! ```text
//! { "off": uint, "len": uint (first chunk only), "data": bstr }
//! ```
//!
//! The first chunk's `len` doubles as slot selector: the image size sits in
//! the low 24 bits and the target slot in the top byte.

use minicbor::data::Type;
use minicbor::decode::Error as CborDecodeError;
use minicbor::{Decoder, Encoder};
use thiserror::Error;

use crate::protocol::constants::{IMAGE_SIZE_MASK, READ_CHUNK_SIZE, SLOT_SHIFT};

#[derive(Error, Debug)]
pub enum ImageError {
    #[error("Image too large: {size} bytes, maximum {max}")]
    ImageTooLarge { size: u64, max: u64 },
    #[error("CBOR encode failed: {0}")]
    CborEncode(String),
    #[error("CBOR decode failed: {0}")]
    CborDecode(#[from] CborDecodeError),
    #[error("Missing field: {0}")]
    MissingField(&'static str),
}

/// Bootloader image slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ImageSlot {
    /// Slot 0.
    #[default]
    Primary,
    /// Slot 1.
    Secondary,
}

impl ImageSlot {
    /// Map a user-supplied slot number; anything but 0 or 1 becomes slot 0.
    pub fn from_index(index: i64) -> Self {
        match index {
            1 => ImageSlot::Secondary,
            _ => ImageSlot::Primary,
        }
    }

    pub fn index(self) -> u32 {
        match self {
            ImageSlot::Primary => 0,
            ImageSlot::Secondary => 1,
        }
    }
}

/// Pack image size and slot into the first chunk's `len` field.
///
/// Slot 0 leaves the size untouched. `size` must fit in 24 bits.
pub fn encode_len_field(size: u32, slot: ImageSlot) -> u32 {
    match slot.index() {
        0 => size,
        idx => (size & IMAGE_SIZE_MASK) | ((idx & 0x0F) << SLOT_SHIFT),
    }
}

/// Split a `len` field back into image size and slot.
pub fn decode_len_field(raw: u32) -> (u32, ImageSlot) {
    let slot = ImageSlot::from_index(i64::from(raw >> SLOT_SHIFT));
    (raw & IMAGE_SIZE_MASK, slot)
}

/// Largest image whose size does not spill into the slot bits.
pub const MAX_IMAGE_SIZE: u64 = IMAGE_SIZE_MASK as u64;

/// One image upload request body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadChunk<'a> {
    pub off: u32,
    /// Present on the first chunk only.
    pub len: Option<u32>,
    pub data: &'a [u8],
}

impl<'a> UploadChunk<'a> {
    /// Encode as an indefinite-length CBOR map, keys in wire order.
    pub fn encode(&self) -> Result<Vec<u8>, ImageError> {
        let mut e = Encoder::new(Vec::with_capacity(self.data.len() + 24));
        e.begin_map()
            .and_then(|e| e.str("off"))
            .and_then(|e| e.u32(self.off))
            .map_err(|err| ImageError::CborEncode(err.to_string()))?;
        if let Some(len) = self.len {
            e.str("len")
                .and_then(|e| e.u32(len))
                .map_err(|err| ImageError::CborEncode(err.to_string()))?;
        }
        e.str("data")
            .and_then(|e| e.bytes(self.data))
            .and_then(|e| e.end())
            .map_err(|err| ImageError::CborEncode(err.to_string()))?;
        Ok(e.into_writer())
    }

    /// Parse a request body, as the target would.
    pub fn decode(body: &'a [u8]) -> Result<Self, ImageError> {
        let mut d = Decoder::new(body);
        let mut off = None;
        let mut len = None;
        let mut data = None;
        for_each_entry(&mut d, |key, d| {
            match key {
                "off" => off = Some(d.u32()?),
                "len" => len = Some(d.u32()?),
                "data" => data = Some(d.bytes()?),
                _ => d.skip()?,
            }
            Ok(())
        })?;
        Ok(Self {
            off: off.ok_or(ImageError::MissingField("off"))?,
            len,
            data: data.ok_or(ImageError::MissingField("data"))?,
        })
    }
}

/// Fields of interest in an upload (or echo) response body.
///
/// Both are informational; the host never acts on them.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UploadResponse {
    pub rc: Option<i64>,
    pub off: Option<i64>,
}

impl UploadResponse {
    pub fn decode(body: &[u8]) -> Result<Self, ImageError> {
        let mut d = Decoder::new(body);
        let mut rsp = Self::default();
        for_each_entry(&mut d, |key, d| {
            match key {
                "rc" => rsp.rc = read_int(d)?,
                "off" => rsp.off = read_int(d)?,
                _ => d.skip()?,
            }
            Ok(())
        })?;
        Ok(rsp)
    }

    /// Encode as a definite-length map, as mcuboot does.
    pub fn encode(&self) -> Result<Vec<u8>, ImageError> {
        let fields = [("rc", self.rc), ("off", self.off)];
        let count = fields.iter().filter(|(_, v)| v.is_some()).count() as u64;

        let mut e = Encoder::new(Vec::new());
        e.map(count)
            .map_err(|err| ImageError::CborEncode(err.to_string()))?;
        for (key, value) in fields {
            if let Some(value) = value {
                e.str(key)
                    .and_then(|e| e.i64(value))
                    .map_err(|err| ImageError::CborEncode(err.to_string()))?;
            }
        }
        Ok(e.into_writer())
    }
}

fn for_each_entry<'b, F>(d: &mut Decoder<'b>, mut f: F) -> Result<(), CborDecodeError>
where
    F: FnMut(&'b str, &mut Decoder<'b>) -> Result<(), CborDecodeError>,
{
    match d.map()? {
        Some(n) => {
            for _ in 0..n {
                let key = d.str()?;
                f(key, d)?;
            }
        }
        None => {
            while d.datatype()? != Type::Break {
                let key = d.str()?;
                f(key, d)?;
            }
        }
    }
    Ok(())
}

fn read_int(d: &mut Decoder<'_>) -> Result<Option<i64>, CborDecodeError> {
    match d.datatype()? {
        Type::U8 | Type::U16 | Type::U32 | Type::U64 | Type::I8 | Type::I16 | Type::I32 | Type::I64 => {
            Ok(Some(d.i64()?))
        }
        _ => {
            d.skip()?;
            Ok(None)
        }
    }
}

/// Offset/remaining bookkeeping for one transfer.
#[derive(Debug, Clone)]
pub struct ChunkState {
    /// Image size in bytes.
    pub total: u32,
    /// Next byte offset to send.
    pub offset: u32,
    /// Bytes still to send.
    pub remaining: u32,
    /// Chunks sent so far.
    pub current: usize,
    /// Bytes per chunk.
    pub chunk_size: usize,
}

impl ChunkState {
    pub fn new(image_size: u64) -> Result<Self, ImageError> {
        Self::with_chunk_size(image_size, READ_CHUNK_SIZE)
    }

    pub fn with_chunk_size(image_size: u64, chunk_size: usize) -> Result<Self, ImageError> {
        if image_size > MAX_IMAGE_SIZE {
            return Err(ImageError::ImageTooLarge {
                size: image_size,
                max: MAX_IMAGE_SIZE,
            });
        }
        let total = image_size as u32;
        Ok(Self {
            total,
            offset: 0,
            remaining: total,
            current: 0,
            chunk_size,
        })
    }

    /// Size of the next chunk to read.
    pub fn next_len(&self) -> usize {
        (self.remaining as usize).min(self.chunk_size)
    }

    pub fn is_first(&self) -> bool {
        self.offset == 0
    }

    /// `len` field for the first chunk. Re-masks `remaining` to the size bits.
    pub fn take_len_field(&mut self, slot: ImageSlot) -> u32 {
        let raw = encode_len_field(self.remaining, slot);
        self.remaining = raw & IMAGE_SIZE_MASK;
        raw
    }

    pub fn advance(&mut self, sent: usize) {
        self.remaining -= sent as u32;
        self.offset += sent as u32;
        self.current += 1;
    }

    pub fn is_done(&self) -> bool {
        self.remaining == 0
    }

    /// Number of requests needed for the whole image.
    pub fn total_chunks(&self) -> usize {
        (self.total as usize).div_ceil(self.chunk_size)
    }

    /// Whole chunks covered by the bytes sent so far.
    pub fn chunks_sent(&self) -> usize {
        self.offset as usize / self.chunk_size
    }

    /// Whole chunks in the image; a trailing partial chunk is not counted.
    pub fn whole_chunks(&self) -> usize {
        self.total as usize / self.chunk_size
    }

    /// Progress is only reported once past the first chunk, where the
    /// target spends its time erasing.
    pub fn past_erase(&self) -> bool {
        self.offset as usize > self.chunk_size
    }

    /// Progress as percentage of bytes sent.
    pub fn progress_pct(&self) -> u8 {
        if self.total == 0 {
            return 100;
        }
        ((u64::from(self.offset) * 100) / u64::from(self.total)) as u8
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slot_clamping() {
        assert_eq!(ImageSlot::from_index(0), ImageSlot::Primary);
        assert_eq!(ImageSlot::from_index(1), ImageSlot::Secondary);
        assert_eq!(ImageSlot::from_index(2), ImageSlot::Primary);
        assert_eq!(ImageSlot::from_index(-1), ImageSlot::Primary);
    }

    #[test]
    fn test_len_field_packing() {
        assert_eq!(encode_len_field(500, ImageSlot::Primary), 500);
        assert_eq!(encode_len_field(500, ImageSlot::Secondary), 500 | (1 << 24));
        assert_eq!(
            decode_len_field(0x0100_1234),
            (0x1234, ImageSlot::Secondary)
        );
        for size in [1u32, 196, 0x00FF_FFFF] {
            for slot in [ImageSlot::Primary, ImageSlot::Secondary] {
                assert_eq!(decode_len_field(encode_len_field(size, slot)), (size, slot));
            }
        }
    }

    #[test]
    fn test_first_chunk_body() {
        let data = [0xAAu8; 4];
        let chunk = UploadChunk {
            off: 0,
            len: Some(300),
            data: &data,
        };
        let body = chunk.encode().unwrap();
        // Indefinite map, then "off": 0
        assert_eq!(&body[..6], &[0xBF, 0x63, b'o', b'f', b'f', 0x00]);
        assert_eq!(*body.last().unwrap(), 0xFF);

        let parsed = UploadChunk::decode(&body).unwrap();
        assert_eq!(parsed, chunk);
    }

    #[test]
    fn test_later_chunk_omits_len() {
        let data = [1u8, 2, 3];
        let body = UploadChunk {
            off: 196,
            len: None,
            data: &data,
        }
        .encode()
        .unwrap();
        let parsed = UploadChunk::decode(&body).unwrap();
        assert_eq!(parsed.off, 196);
        assert_eq!(parsed.len, None);
        assert_eq!(parsed.data, &data);
    }

    #[test]
    fn test_response_decode() {
        let body = UploadResponse {
            rc: Some(0),
            off: Some(392),
        }
        .encode()
        .unwrap();
        let rsp = UploadResponse::decode(&body).unwrap();
        assert_eq!(rsp.rc, Some(0));
        assert_eq!(rsp.off, Some(392));
    }

    #[test]
    fn test_response_ignores_unknown_keys_and_trailing_bytes() {
        // {"rc": -1, "x": "y"} followed by two stray bytes
        let body = [0xA2, 0x62, b'r', b'c', 0x20, 0x61, b'x', 0x61, b'y', 0x12, 0x34];
        let rsp = UploadResponse::decode(&body).unwrap();
        assert_eq!(rsp.rc, Some(-1));
        assert_eq!(rsp.off, None);
    }

    #[test]
    fn test_response_decode_failure() {
        assert!(UploadResponse::decode(&[0x41]).is_err());
        assert!(UploadResponse::decode(&[]).is_err());
    }

    #[test]
    fn test_chunk_state_first_chunk_masks_slot_bits() {
        let mut state = ChunkState::new(500).unwrap();
        assert!(state.is_first());
        assert_eq!(state.next_len(), 196);

        let len = state.take_len_field(ImageSlot::Secondary);
        assert_eq!(len, 500 | (1 << 24));
        assert_eq!(state.remaining, 500);

        state.advance(196);
        assert_eq!(state.remaining, 500 - 196);
        assert_eq!(state.offset, 196);
        assert_eq!(state.total_chunks(), 3);
        assert_eq!(state.progress_pct(), 39);
        assert!(!state.past_erase());

        state.advance(196);
        assert!(state.past_erase());
        assert_eq!(state.chunks_sent(), 2);
        assert_eq!(state.whole_chunks(), 2);
        assert_eq!(state.progress_pct(), 78);
    }

    #[test]
    fn test_chunk_state_empty_image_is_done() {
        let state = ChunkState::new(0).unwrap();
        assert!(state.is_done());
        assert_eq!(state.total_chunks(), 0);
        assert_eq!(state.progress_pct(), 100);
    }

    #[test]
    fn test_chunk_state_limits() {
        assert!(matches!(
            ChunkState::new(1 << 24),
            Err(ImageError::ImageTooLarge { .. })
        ));
        assert!(ChunkState::new((1 << 24) - 1).is_ok());
    }
}
