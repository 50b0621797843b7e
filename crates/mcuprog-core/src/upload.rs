//! Image upload engine.
//!
//! Streams an image to the bootloader in 196-byte chunks, one NMP
//! `WRITE image/upload` request per chunk, waiting for each response
//! before sending the next.

use std::io::Read;

use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use crate::events::{ProgEvent, ProgObserver, ProgPhase};
use crate::nmp::{NmpClient, NmpError, NmpResponse};
use crate::payload::image::{ChunkState, ImageError, ImageSlot, UploadChunk, UploadResponse};
use crate::protocol::constants::{NMP_GROUP_IMAGE, NMP_ID_IMAGE_UPLOAD};
use crate::protocol::header::{NmpHeader, NmpOp};
use crate::transport::traits::SerialTransport;

#[derive(Error, Debug)]
pub enum UploadError {
    #[error("Image error: {0}")]
    Image(#[from] ImageError),
    #[error("Error reading image data at offset {offset}: {source}")]
    Read {
        offset: u32,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to send firmware data packet at offset {offset}: {source}")]
    Send {
        offset: u32,
        #[source]
        source: NmpError,
    },
    #[error("Unexpected header response data at offset {offset}: {header}")]
    UnexpectedHeader { offset: u32, header: NmpHeader },
}

/// Summary of a finished upload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UploadReport {
    pub chunks: usize,
    pub bytes: u64,
    pub slot: ImageSlot,
}

/// Upload `image_size` bytes read from `image` into `slot`.
///
/// Stops at the first failed exchange or mismatched response header.
#[instrument(skip_all, fields(image_size = image_size, slot = slot.index()))]
pub fn upload_image<T, R, O>(
    client: &mut NmpClient<T>,
    image: &mut R,
    image_size: u64,
    slot: ImageSlot,
    observer: &O,
) -> Result<UploadReport, UploadError>
where
    T: SerialTransport,
    R: Read + ?Sized,
    O: ProgObserver + ?Sized,
{
    let mut state = ChunkState::new(image_size)?;
    let mut data = vec![0u8; state.chunk_size];
    let total_chunks = state.total_chunks();

    info!(image_size, total_chunks, "Starting image upload");

    while !state.is_done() {
        let read_count = state.next_len();
        let offset = state.offset;

        if state.is_first() {
            observer.on_event(&ProgEvent::PhaseChanged {
                from: ProgPhase::Ping,
                to: ProgPhase::Erase,
            });
        }

        image
            .read_exact(&mut data[..read_count])
            .map_err(|source| UploadError::Read { offset, source })?;

        let len = state.is_first().then(|| state.take_len_field(slot));
        let body = UploadChunk {
            off: offset,
            len,
            data: &data[..read_count],
        }
        .encode()?;

        let header = client
            .populate_header(NmpOp::Write, NMP_GROUP_IMAGE, NMP_ID_IMAGE_UPLOAD, body.len())
            .map_err(|source| UploadError::Send { offset, source })?;
        let raw = client
            .send_request(&header, &body)
            .map_err(|source| UploadError::Send { offset, source })?;
        let response =
            NmpResponse::parse(&raw).map_err(|source| UploadError::Send { offset, source })?;

        if !response
            .header
            .matches(NmpOp::WriteRsp, NMP_GROUP_IMAGE, NMP_ID_IMAGE_UPLOAD)
        {
            return Err(UploadError::UnexpectedHeader {
                offset,
                header: response.header,
            });
        }

        check_response_body(&response.body, offset, observer);

        state.advance(read_count);

        if state.current == 1 {
            observer.on_event(&ProgEvent::PhaseChanged {
                from: ProgPhase::Erase,
                to: ProgPhase::Upload,
            });
        }
        if state.past_erase() {
            observer.on_event(&ProgEvent::Progress {
                chunk: state.chunks_sent(),
                total_chunks: state.whole_chunks(),
                percent: state.progress_pct(),
                image_size,
            });
        }
    }

    info!(chunks = state.current, "Image upload complete");
    Ok(UploadReport {
        chunks: state.current,
        bytes: image_size,
        slot,
    })
}

/// Inspect `rc`/`off` in a chunk response. Problems are reported, never fatal.
fn check_response_body<O: ProgObserver + ?Sized>(body: &[u8], offset: u32, observer: &O) {
    match UploadResponse::decode(body) {
        Ok(rsp) => {
            debug!(offset, rc = ?rsp.rc, off = ?rsp.off, "Chunk acknowledged");
            if let Some(rc) = rsp.rc.filter(|&rc| rc != 0) {
                let message = format!("Target returned rc={rc} for chunk at offset {offset}");
                warn!("{}", message);
                observer.on_event(&ProgEvent::Warning { message });
            }
        }
        Err(e) => {
            let message = format!("Error decoding CBOR response at offset {offset}: {e}");
            warn!("{}", message);
            observer.on_event(&ProgEvent::Warning { message });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{NullObserver, RecordingObserver};
    use crate::payload::image::decode_len_field;
    use crate::protocol::frame::FramerConfig;
    use crate::transport::mock::{MockTransport, mcuboot_responder, response_for};
    use std::io::Cursor;
    use std::time::Duration;

    fn client(mock: &MockTransport) -> NmpClient<MockTransport> {
        NmpClient::new(
            mock.clone(),
            FramerConfig {
                rx_timeout: Duration::from_millis(50),
                byte_timeout: Duration::from_millis(10),
                segment_delay: Duration::ZERO,
                ..Default::default()
            },
        )
    }

    fn image(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    fn chunks_sent(mock: &MockTransport) -> Vec<(u32, Option<u32>, Vec<u8>)> {
        mock.requests()
            .iter()
            .map(|r| {
                let c = UploadChunk::decode(&r[NmpHeader::SIZE..]).unwrap();
                (c.off, c.len, c.data.to_vec())
            })
            .collect()
    }

    #[test]
    fn test_upload_reassembles_image() {
        let mock = MockTransport::new();
        let mut client = client(&mock);
        let data = image(500);

        let report =
            upload_image(&mut client, &mut Cursor::new(&data), 500, ImageSlot::Primary, &NullObserver)
                .unwrap();
        assert_eq!(report.chunks, 3);

        let sent = chunks_sent(&mock);
        let offsets: Vec<u32> = sent.iter().map(|c| c.0).collect();
        let lens: Vec<usize> = sent.iter().map(|c| c.2.len()).collect();
        assert_eq!(offsets, vec![0, 196, 392]);
        assert_eq!(lens, vec![196, 196, 108]);
        assert_eq!(sent[0].1, Some(500));
        assert!(sent[1..].iter().all(|c| c.1.is_none()));

        let rebuilt: Vec<u8> = sent.into_iter().flat_map(|c| c.2).collect();
        assert_eq!(rebuilt, data);
    }

    #[test]
    fn test_secondary_slot_len_field() {
        let mock = MockTransport::new();
        let mut client = client(&mock);
        let data = image(300);

        upload_image(&mut client, &mut Cursor::new(&data), 300, ImageSlot::Secondary, &NullObserver)
            .unwrap();

        let sent = chunks_sent(&mock);
        let len = sent[0].1.unwrap();
        assert_eq!(len, 300 | (1 << 24));
        assert_eq!(decode_len_field(len), (300, ImageSlot::Secondary));
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[1].2.len(), 104);
    }

    #[test]
    fn test_headers_and_sequence() {
        let mock = MockTransport::new();
        let mut client = client(&mock);
        let data = image(400);
        upload_image(&mut client, &mut Cursor::new(&data), 400, ImageSlot::Primary, &NullObserver)
            .unwrap();

        let headers = mock.request_headers();
        assert_eq!(headers.len(), 3);
        for (i, h) in headers.iter().enumerate() {
            assert_eq!(h.op, NmpOp::Write);
            assert_eq!(h.group, NMP_GROUP_IMAGE);
            assert_eq!(h.id, NMP_ID_IMAGE_UPLOAD);
            assert_eq!(h.seq, i as u8);
            assert_eq!(usize::from(h.len), mock.requests()[i].len() - NmpHeader::SIZE);
        }
    }

    #[test]
    fn test_short_read_fails() {
        let mock = MockTransport::new();
        let mut client = client(&mock);
        let data = image(250);

        let err = upload_image(&mut client, &mut Cursor::new(&data), 400, ImageSlot::Primary, &NullObserver)
            .unwrap_err();
        assert!(matches!(err, UploadError::Read { offset: 196, .. }));
        assert_eq!(mock.requests().len(), 1);
    }

    #[test]
    fn test_header_mismatch_stops_upload() {
        let mock = MockTransport::new();
        mock.set_responder(|request| {
            let header = NmpHeader::from_bytes(request).ok()?;
            let wrong = NmpHeader { group: 0, ..header };
            Some(response_for(&wrong, &[0xA0]))
        });
        let mut client = client(&mock);
        let data = image(1000);

        let err = upload_image(&mut client, &mut Cursor::new(&data), 1000, ImageSlot::Primary, &NullObserver)
            .unwrap_err();
        assert!(matches!(err, UploadError::UnexpectedHeader { offset: 0, .. }));
        assert_eq!(mock.requests().len(), 1);
    }

    #[test]
    fn test_no_response_fails() {
        let mock = MockTransport::new();
        mock.set_responder(|_| None);
        let mut client = client(&mock);
        let data = image(10);

        let err = upload_image(&mut client, &mut Cursor::new(&data), 10, ImageSlot::Primary, &NullObserver)
            .unwrap_err();
        assert!(matches!(err, UploadError::Send { offset: 0, .. }));
    }

    #[test]
    fn test_bad_cbor_and_rc_are_warnings() {
        let mock = MockTransport::new();
        let mut calls = 0;
        mock.set_responder(move |request| {
            calls += 1;
            let header = NmpHeader::from_bytes(request).ok()?;
            if calls == 1 {
                Some(response_for(&header, &[0xFF, 0xFF]))
            } else {
                let body = UploadResponse { rc: Some(3), off: None }.encode().ok()?;
                Some(response_for(&header, &body))
            }
        });
        let mut client = client(&mock);
        let observer = RecordingObserver::new();
        let data = image(300);

        upload_image(&mut client, &mut Cursor::new(&data), 300, ImageSlot::Primary, &observer).unwrap();

        let warnings: Vec<String> = observer
            .events()
            .into_iter()
            .filter_map(|e| match e {
                ProgEvent::Warning { message } => Some(message),
                _ => None,
            })
            .collect();
        assert_eq!(warnings.len(), 2);
        assert!(warnings[0].contains("CBOR"));
        assert!(warnings[1].contains("rc=3"));
    }

    fn progress_of(len: usize) -> Vec<(usize, usize, u8)> {
        let mock = MockTransport::new();
        mock.set_responder(mcuboot_responder);
        let mut client = client(&mock);
        let observer = RecordingObserver::new();
        let data = image(len);

        upload_image(&mut client, &mut Cursor::new(&data), len as u64, ImageSlot::Primary, &observer)
            .unwrap();

        observer
            .events()
            .into_iter()
            .filter_map(|e| match e {
                ProgEvent::Progress {
                    chunk,
                    total_chunks,
                    percent,
                    ..
                } => Some((chunk, total_chunks, percent)),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_progress_events() {
        // Nothing while the first chunk erases the slot.
        assert_eq!(progress_of(196), vec![]);
        assert_eq!(progress_of(392), vec![(2, 2, 100)]);
        // Whole chunks only: the trailing partial chunk does not count.
        assert_eq!(progress_of(500), vec![(2, 2, 78), (2, 2, 100)]);
    }

    #[test]
    fn test_empty_image_uploads_nothing() {
        let mock = MockTransport::new();
        let mut client = client(&mock);
        let observer = RecordingObserver::new();

        let report =
            upload_image(&mut client, &mut Cursor::new(Vec::new()), 0, ImageSlot::Primary, &observer)
                .unwrap();
        assert_eq!(report.chunks, 0);
        assert_eq!(report.bytes, 0);
        assert!(mock.requests().is_empty());
        assert!(observer.events().is_empty());
    }
}
