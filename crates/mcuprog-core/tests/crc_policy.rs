//! Responses with a bad CRC trailer under both integrity policies.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;

use mcuprog_core::nmp::{NmpClient, NmpError};
use mcuprog_core::protocol::constants::{NMP_GROUP_DEFAULT, NMP_ID_CONS_ECHO_CTRL};
use mcuprog_core::protocol::frame::FrameError;
use mcuprog_core::session::SessionConfig;
use mcuprog_core::{CrcPolicy, MockTransport, NmpHeader, NmpOp, crc16};

fn client(mock: &MockTransport, crc_policy: CrcPolicy) -> NmpClient<MockTransport> {
    let config = SessionConfig {
        rx_timeout_ms: 50,
        byte_timeout_ms: 10,
        segment_delay_ms: 0,
        crc_policy,
        ..Default::default()
    };
    NmpClient::new(mock.clone(), config.framer_config())
}

fn echo_response(op: NmpOp) -> Vec<u8> {
    let header = NmpHeader::new(op, NMP_GROUP_DEFAULT, NMP_ID_CONS_ECHO_CTRL, 0, 1).unwrap();
    let mut payload = header.to_bytes().to_vec();
    payload.push(0xA0);
    payload
}

/// A single start line carrying `payload` with a wrong CRC trailer.
fn corrupted_line(payload: &[u8]) -> Vec<u8> {
    let mut frame = ((payload.len() + 2) as u16).to_be_bytes().to_vec();
    frame.extend_from_slice(payload);
    let crc = crc16(&frame[2..], true) ^ 0x0101;
    frame.extend_from_slice(&crc.to_be_bytes());

    let mut line = vec![0x06, 0x09];
    line.extend_from_slice(STANDARD.encode(&frame).as_bytes());
    line.push(b'\n');
    line
}

#[test]
fn warn_policy_uses_corrupted_frame() {
    let mock = MockTransport::new();
    mock.set_responder(|_| None);
    // The corrupted frame carries the wrong op, so using it fails the ping.
    mock.push_rx(&corrupted_line(&echo_response(NmpOp::WriteRsp)));
    mock.push_frame(&echo_response(NmpOp::ReadRsp));

    let err = client(&mock, CrcPolicy::Warn).ping().unwrap_err();
    assert!(matches!(err, NmpError::UnexpectedHeader { .. }));
}

#[test]
fn reject_policy_skips_to_next_good_frame() {
    let mock = MockTransport::new();
    mock.set_responder(|_| None);
    mock.push_rx(&corrupted_line(&echo_response(NmpOp::WriteRsp)));
    mock.push_frame(&echo_response(NmpOp::ReadRsp));

    client(&mock, CrcPolicy::Reject).ping().unwrap();
}

#[test]
fn reject_policy_times_out_without_good_frame() {
    let mock = MockTransport::new();
    mock.set_responder(|_| None);
    mock.push_rx(&corrupted_line(&echo_response(NmpOp::ReadRsp)));

    let err = client(&mock, CrcPolicy::Reject).ping().unwrap_err();
    assert!(matches!(err, NmpError::Frame(FrameError::Timeout { .. })));
}

#[test]
fn warn_policy_accepts_good_payload_with_bad_trailer() {
    let mock = MockTransport::new();
    mock.set_responder(|_| None);
    mock.push_rx(&corrupted_line(&echo_response(NmpOp::ReadRsp)));

    client(&mock, CrcPolicy::Warn).ping().unwrap();
}
