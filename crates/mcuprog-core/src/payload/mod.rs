//! Payload handling module.
//!
//! Provides CBOR bodies and chunk bookkeeping for image uploads.

pub mod image;

pub use image::{ChunkState, ImageError, ImageSlot, UploadChunk, UploadResponse};
