// ABOUTME: Demultiplexer for Docker-style framed stdout/stderr log streams
// ABOUTME: Reassembles 8-byte-header frames across arbitrary chunk boundaries into leveled log records

use bytes::{Buf, BytesMut};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::warn;

pub const FRAME_HEADER_LEN: usize = 8;
/// Largest payload a frame may declare; longer headers are treated as corrupt
pub const MAX_FRAME_LEN: usize = 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogStream {
    Stdout,
    Stderr,
}

impl LogStream {
    fn from_type_byte(byte: u8) -> Self {
        if byte == 2 {
            LogStream::Stderr
        } else {
            LogStream::Stdout
        }
    }

    fn type_byte(self) -> u8 {
        match self {
            LogStream::Stdout => 1,
            LogStream::Stderr => 2,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Info,
    Warn,
    Error,
}

/// Case-insensitive "error" wins over "warn"; everything else is info
pub fn classify_level(message: &str) -> LogLevel {
    let lower = message.to_lowercase();
    if lower.contains("error") {
        LogLevel::Error
    } else if lower.contains("warn") {
        LogLevel::Warn
    } else {
        LogLevel::Info
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct LogRecord {
    pub stream: LogStream,
    pub level: LogLevel,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

/// Wrap a payload in a frame header: stream type in byte 0, big-endian length in bytes 4..8
pub fn encode_frame(stream: LogStream, payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(FRAME_HEADER_LEN + payload.len());
    frame.extend_from_slice(&[stream.type_byte(), 0, 0, 0]);
    frame.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    frame.extend_from_slice(payload);
    frame
}

/// Stateful decoder for one container's multiplexed log stream
#[derive(Debug, Default)]
pub struct LogDemuxer {
    buffer: BytesMut,
    discarded: usize,
}

impl LogDemuxer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bytes received that do not yet form a complete frame
    pub fn pending_bytes(&self) -> usize {
        self.buffer.len()
    }

    /// Total bytes skipped while resynchronising after corrupt headers
    pub fn discarded_bytes(&self) -> usize {
        self.discarded
    }

    /// Feed the next chunk and return every record completed by it.
    ///
    /// A header with an unknown stream type, non-zero padding or a length above
    /// `MAX_FRAME_LEN` is not buffered toward; bytes are skipped one at a time
    /// until a plausible header lines up again.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<LogRecord> {
        self.buffer.extend_from_slice(chunk);
        let mut records = Vec::new();
        let mut skipped = 0;

        while self.buffer.len() >= FRAME_HEADER_LEN {
            let header = &self.buffer[..FRAME_HEADER_LEN];
            let len = u32::from_be_bytes([header[4], header[5], header[6], header[7]]) as usize;
            if header[0] > 2 || header[1..4] != [0, 0, 0] || len > MAX_FRAME_LEN {
                self.buffer.advance(1);
                skipped += 1;
                continue;
            }
            let stream = LogStream::from_type_byte(header[0]);

            if self.buffer.len() < FRAME_HEADER_LEN + len {
                break;
            }

            self.buffer.advance(FRAME_HEADER_LEN);
            let payload = self.buffer.split_to(len);
            let message = String::from_utf8_lossy(&payload).trim().to_string();
            if message.is_empty() {
                continue;
            }

            records.push(LogRecord {
                stream,
                level: classify_level(&message),
                message,
                timestamp: Utc::now(),
            });
        }

        if skipped > 0 {
            self.discarded += skipped;
            warn!("Skipped {} bytes of corrupt log framing", skipped);
        }
        records
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_level() {
        assert_eq!(classify_level("Server listening on 3000"), LogLevel::Info);
        assert_eq!(classify_level("npm WARN deprecated"), LogLevel::Warn);
        assert_eq!(classify_level("TypeError: x is undefined"), LogLevel::Error);
        assert_eq!(classify_level("warning: error budget"), LogLevel::Error);
    }

    #[test]
    fn test_single_complete_frame() {
        let mut demux = LogDemuxer::new();
        let records = demux.push(&encode_frame(LogStream::Stdout, b"VITE ready\n"));
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].stream, LogStream::Stdout);
        assert_eq!(records[0].level, LogLevel::Info);
        assert_eq!(records[0].message, "VITE ready");
        assert_eq!(demux.pending_bytes(), 0);
    }

    #[test]
    fn test_header_split_across_chunks() {
        let frame = encode_frame(LogStream::Stderr, b"Error: listen EADDRINUSE");
        let mut demux = LogDemuxer::new();

        assert!(demux.push(&frame[..4]).is_empty());
        let records = demux.push(&frame[4..]);

        assert_eq!(records.len(), 1);
        assert_eq!(records[0].stream, LogStream::Stderr);
        assert_eq!(records[0].level, LogLevel::Error);
        assert_eq!(records[0].message, "Error: listen EADDRINUSE");
    }

    #[test]
    fn test_byte_at_a_time_and_multiple_frames() {
        let mut bytes = encode_frame(LogStream::Stdout, b"one");
        bytes.extend(encode_frame(LogStream::Stderr, b"warn two"));
        bytes.extend(encode_frame(LogStream::Stdout, b"three"));

        let mut demux = LogDemuxer::new();
        let mut records = Vec::new();
        for byte in &bytes {
            records.extend(demux.push(std::slice::from_ref(byte)));
        }

        let messages: Vec<_> = records.iter().map(|r| r.message.as_str()).collect();
        assert_eq!(messages, vec!["one", "warn two", "three"]);
        assert_eq!(records[1].level, LogLevel::Warn);
    }

    #[test]
    fn test_empty_payloads_are_discarded() {
        let mut bytes = encode_frame(LogStream::Stdout, b"");
        bytes.extend(encode_frame(LogStream::Stdout, b"  \n"));
        bytes.extend(encode_frame(LogStream::Stdout, b"kept"));

        let records = LogDemuxer::new().push(&bytes);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].message, "kept");
    }

    #[test]
    fn test_oversized_header_is_skipped_not_buffered() {
        let mut bytes = vec![1, 0, 0, 0, 0xFF, 0xFF, 0xFF, 0xFF];
        bytes.extend(encode_frame(LogStream::Stderr, b"warn after garbage"));

        let mut demux = LogDemuxer::new();
        let records = demux.push(&bytes);

        assert_eq!(records.len(), 1);
        assert_eq!(records[0].message, "warn after garbage");
        assert_eq!(records[0].stream, LogStream::Stderr);
        assert_eq!(demux.discarded_bytes(), 8);
        assert_eq!(demux.pending_bytes(), 0);
    }

    #[test]
    fn test_corrupt_header_alone_does_not_grow_buffer() {
        let mut demux = LogDemuxer::new();
        let mut header = encode_frame(LogStream::Stdout, b"");
        header[4..8].copy_from_slice(&((MAX_FRAME_LEN + 1) as u32).to_be_bytes());

        assert!(demux.push(&header).is_empty());
        assert!(demux.push(&[b'x'; 64]).is_empty());
        assert!(demux.pending_bytes() < FRAME_HEADER_LEN);
    }

    #[test]
    fn test_unknown_stream_type_is_stdout() {
        let mut frame = encode_frame(LogStream::Stdout, b"console");
        frame[0] = 0;
        let records = LogDemuxer::new().push(&frame);
        assert_eq!(records[0].stream, LogStream::Stdout);
    }
}
