//! Buffered line reader for the serial link.
//!
//! Bytes are pulled from the transport in blocks and split on `\n`.
//! Each wait for more data is bounded by the caller's per-byte timeout;
//! overall receive deadlines are layered on top by the framer.

use std::time::Duration;

use super::traits::{SerialTransport, TransportError};
use crate::protocol::constants::MAX_LINE_LEN;

const READ_BLOCK: usize = 256;

/// Outcome of one `read_line` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LineRead {
    /// A complete line, without its `\n`.
    Line(Vec<u8>),
    /// A line longer than the reader's limit was dropped.
    Overflow,
    /// Nothing completed a line before the timeout. Partial data is dropped.
    TimedOut,
}

#[derive(Debug)]
pub struct LineReader {
    pending: Vec<u8>,
    max_line: usize,
    discarding: bool,
}

impl LineReader {
    pub fn new() -> Self {
        Self::with_max_line(MAX_LINE_LEN)
    }

    pub fn with_max_line(max_line: usize) -> Self {
        Self {
            pending: Vec::with_capacity(max_line),
            max_line,
            discarding: false,
        }
    }

    /// Read one line, waiting at most `timeout` between arrivals.
    pub fn read_line<T: SerialTransport + ?Sized>(
        &mut self,
        transport: &mut T,
        timeout: Duration,
    ) -> Result<LineRead, TransportError> {
        let mut block = [0u8; READ_BLOCK];
        loop {
            if let Some(pos) = self.pending.iter().position(|&b| b == b'\n') {
                let mut line: Vec<u8> = self.pending.drain(..=pos).collect();
                line.pop();
                if std::mem::take(&mut self.discarding) || line.len() > self.max_line {
                    return Ok(LineRead::Overflow);
                }
                return Ok(LineRead::Line(line));
            }

            if self.pending.len() > self.max_line {
                self.pending.clear();
                self.discarding = true;
            }

            let n = transport.read(&mut block, timeout)?;
            if n == 0 {
                self.pending.clear();
                self.discarding = false;
                return Ok(LineRead::TimedOut);
            }
            self.pending.extend_from_slice(&block[..n]);
        }
    }

    /// Bytes received but not yet returned as part of a line.
    pub fn buffered(&self) -> usize {
        self.pending.len()
    }
}

impl Default for LineReader {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::traits::FlowControl;
    use std::collections::VecDeque;

    /// Hands out queued reads one at a time.
    struct Scripted {
        reads: VecDeque<Vec<u8>>,
    }

    impl SerialTransport for Scripted {
        fn write(&mut self, data: &[u8]) -> Result<usize, TransportError> {
            Ok(data.len())
        }

        fn read(&mut self, buf: &mut [u8], _timeout: Duration) -> Result<usize, TransportError> {
            match self.reads.pop_front() {
                Some(chunk) => {
                    buf[..chunk.len()].copy_from_slice(&chunk);
                    Ok(chunk.len())
                }
                None => Ok(0),
            }
        }

        fn configure(&mut self, _baud: u32, _flow: FlowControl) -> Result<(), TransportError> {
            Ok(())
        }
    }

    fn scripted(reads: &[&[u8]]) -> Scripted {
        Scripted {
            reads: reads.iter().map(|r| r.to_vec()).collect(),
        }
    }

    #[test]
    fn test_lines_split_across_reads() {
        let mut t = scripted(&[b"rea", b"dy\r\nsec", b"ond\n"]);
        let mut reader = LineReader::new();
        let timeout = Duration::from_millis(10);

        assert_eq!(
            reader.read_line(&mut t, timeout).unwrap(),
            LineRead::Line(b"ready\r".to_vec())
        );
        assert_eq!(
            reader.read_line(&mut t, timeout).unwrap(),
            LineRead::Line(b"second".to_vec())
        );
        assert_eq!(reader.read_line(&mut t, timeout).unwrap(), LineRead::TimedOut);
    }

    #[test]
    fn test_multiple_lines_in_one_read() {
        let mut t = scripted(&[b"a\nb\n"]);
        let mut reader = LineReader::new();
        let timeout = Duration::from_millis(10);

        assert_eq!(reader.read_line(&mut t, timeout).unwrap(), LineRead::Line(b"a".to_vec()));
        assert_eq!(reader.buffered(), 2);
        assert_eq!(reader.read_line(&mut t, timeout).unwrap(), LineRead::Line(b"b".to_vec()));
    }

    #[test]
    fn test_partial_line_dropped_on_timeout() {
        let mut t = scripted(&[b"partial"]);
        let mut reader = LineReader::new();
        let timeout = Duration::from_millis(10);

        assert_eq!(reader.read_line(&mut t, timeout).unwrap(), LineRead::TimedOut);
        assert_eq!(reader.buffered(), 0);
    }

    #[test]
    fn test_overlong_line_discarded() {
        let long = vec![b'x'; 40];
        let mut t = scripted(&[&long, &long, b"tail\nok\n"]);
        let mut reader = LineReader::with_max_line(32);
        let timeout = Duration::from_millis(10);

        assert_eq!(reader.read_line(&mut t, timeout).unwrap(), LineRead::Overflow);
        assert_eq!(reader.read_line(&mut t, timeout).unwrap(), LineRead::Line(b"ok".to_vec()));
    }
}
