//! Stats derivation and engine log-stream framing.
//!
//! The engine multiplexes stdout/stderr over one byte stream using an
//! 8-byte frame header: byte 0 is the stream (1 = stdout, 2 = stderr),
//! bytes 4..8 are the big-endian payload length. Frame boundaries carry the
//! structure; payload newlines mean nothing to the parser.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamKind {
    Stdout,
    Stderr,
}

/// One CPU sample pair from the engine.
#[derive(Debug, Clone, Copy, Default)]
pub struct CpuSample {
    pub container_total: u64,
    pub container_prev: u64,
    pub system_total: u64,
    pub system_prev: u64,
    pub online_cpus: u64,
}

/// cpu% = (Δcontainer / Δsystem) × online_cpus × 100.
pub fn cpu_percent(sample: &CpuSample) -> f64 {
    let container_delta = sample.container_total.saturating_sub(sample.container_prev) as f64;
    let system_delta = sample.system_total.saturating_sub(sample.system_prev) as f64;
    if system_delta <= 0.0 {
        return 0.0;
    }
    (container_delta / system_delta) * sample.online_cpus.max(1) as f64 * 100.0
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogFrame {
    pub stream: StreamKind,
    pub payload: Vec<u8>,
}

/// Incremental parser over the multiplexed stream. Partial frames are
/// buffered until the rest arrives.
#[derive(Default)]
pub struct LogFrameParser {
    buffer: Vec<u8>,
}

const HEADER_LEN: usize = 8;

impl LogFrameParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed bytes; returns every frame completed by this chunk.
    pub fn feed(&mut self, bytes: &[u8]) -> Vec<LogFrame> {
        self.buffer.extend_from_slice(bytes);
        let mut frames = Vec::new();

        loop {
            if self.buffer.len() < HEADER_LEN {
                break;
            }
            let length = u32::from_be_bytes([
                self.buffer[4],
                self.buffer[5],
                self.buffer[6],
                self.buffer[7],
            ]) as usize;
            if self.buffer.len() < HEADER_LEN + length {
                break;
            }

            let stream = match self.buffer[0] {
                1 => Some(StreamKind::Stdout),
                2 => Some(StreamKind::Stderr),
                _ => None,
            };
            let payload = self.buffer[HEADER_LEN..HEADER_LEN + length].to_vec();
            self.buffer.drain(..HEADER_LEN + length);

            // Unknown streams (stdin echo, console) are skipped, not errors.
            if let Some(stream) = stream {
                frames.push(LogFrame { stream, payload });
            }
        }
        frames
    }

    /// Bytes held back waiting for a frame to complete.
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(stream: u8, payload: &[u8]) -> Vec<u8> {
        let mut bytes = vec![stream, 0, 0, 0];
        bytes.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        bytes.extend_from_slice(payload);
        bytes
    }

    #[test]
    fn cpu_percent_matches_formula() {
        let sample = CpuSample {
            container_total: 2_000,
            container_prev: 1_000,
            system_total: 20_000,
            system_prev: 10_000,
            online_cpus: 4,
        };
        // (1000 / 10000) × 4 × 100 = 40%
        assert!((cpu_percent(&sample) - 40.0).abs() < f64::EPSILON);
    }

    #[test]
    fn cpu_percent_handles_zero_system_delta() {
        let sample = CpuSample {
            container_total: 100,
            container_prev: 50,
            ..Default::default()
        };
        assert_eq!(cpu_percent(&sample), 0.0);
    }

    #[test]
    fn parses_back_to_back_frames() {
        let mut parser = LogFrameParser::new();
        let mut bytes = frame(1, b"hello");
        bytes.extend(frame(2, b"warning"));

        let frames = parser.feed(&bytes);
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].stream, StreamKind::Stdout);
        assert_eq!(frames[0].payload, b"hello");
        assert_eq!(frames[1].stream, StreamKind::Stderr);
        assert_eq!(parser.pending(), 0);
    }

    #[test]
    fn newlines_in_payload_do_not_split_frames() {
        let mut parser = LogFrameParser::new();
        let frames = parser.feed(&frame(1, b"a\nb\nc"));
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].payload, b"a\nb\nc");
    }

    #[test]
    fn partial_frames_wait_for_more_bytes() {
        let mut parser = LogFrameParser::new();
        let full = frame(1, b"deferred");

        let first = parser.feed(&full[..6]);
        assert!(first.is_empty());
        assert_eq!(parser.pending(), 6);

        let second = parser.feed(&full[6..]);
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].payload, b"deferred");
    }

    #[test]
    fn header_split_across_chunks_is_reassembled() {
        let mut parser = LogFrameParser::new();
        let full = frame(2, b"x");
        assert!(parser.feed(&full[..3]).is_empty());
        let frames = parser.feed(&full[3..]);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].stream, StreamKind::Stderr);
    }

    #[test]
    fn unknown_stream_bytes_are_skipped() {
        let mut parser = LogFrameParser::new();
        let mut bytes = frame(0, b"stdin echo");
        bytes.extend(frame(1, b"kept"));
        let frames = parser.feed(&bytes);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].payload, b"kept");
    }

    #[test]
    fn empty_payload_frame_is_valid() {
        let mut parser = LogFrameParser::new();
        let frames = parser.feed(&frame(1, b""));
        assert_eq!(frames.len(), 1);
        assert!(frames[0].payload.is_empty());
    }
}
