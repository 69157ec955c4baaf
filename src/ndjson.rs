//! Newline-delimited JSON message parsing for the stream source.
//!
//! Mirrors the line-buffering shape of a text/event-stream reader, adapted
//! for bare JSON lines instead of `data:`-prefixed SSE frames: accumulate
//! decoded text, split on `\n`, carry the trailing (possibly empty)
//! fragment into the next chunk, and expose an explicit `flush()` for the
//! fragment remaining when the stream ends.

use serde::Deserialize;

use crate::core::data::Datafile;

/// One parsed line from the stream body.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamMessage {
    /// A new datafile arrived.
    Datafile(Datafile),
    /// A liveness heartbeat; resets the reconnect backoff counter.
    Ping,
}

#[derive(Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum WireMessage {
    Datafile { data: Datafile },
    Ping,
}

/// Chunk-boundary-safe NDJSON line reader.
///
/// `feed()` accepts an arbitrarily chunked byte stream and returns every
/// complete line it can extract. Raw bytes are accumulated across calls and
/// only decoded once a complete line has been identified in the byte
/// buffer — `\n` is always a single ASCII byte, so splitting on it never
/// lands inside a multi-byte UTF-8 sequence, unlike decoding each incoming
/// chunk independently. Parse failures on individual lines are swallowed
/// (logged, not fatal) so one malformed line cannot kill the connection.
/// Unknown `type` values are ignored.
#[derive(Debug, Default)]
pub struct NdjsonReader {
    buffer: Vec<u8>,
}

impl NdjsonReader {
    /// A reader with an empty buffer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk of bytes, returning every [`StreamMessage`] that could
    /// be parsed from the complete lines now available.
    pub fn feed(&mut self, bytes: &[u8]) -> Vec<StreamMessage> {
        self.buffer.extend_from_slice(bytes);
        self.drain_complete_lines()
    }

    /// Drain whatever partial line remains in the buffer, for use when the
    /// stream has ended. A stream that ends mid-line with no trailing
    /// newline still yields its last message.
    pub fn flush(&mut self) -> Vec<StreamMessage> {
        let remainder = std::mem::take(&mut self.buffer);
        Self::parse_lines(&String::from_utf8_lossy(&remainder))
    }

    fn drain_complete_lines(&mut self) -> Vec<StreamMessage> {
        let Some(last_newline) = self.buffer.iter().rposition(|&b| b == b'\n') else {
            return Vec::new();
        };
        let complete: Vec<u8> = self.buffer.drain(..=last_newline).collect();
        Self::parse_lines(&String::from_utf8_lossy(&complete))
    }

    fn parse_lines(text: &str) -> Vec<StreamMessage> {
        let mut out = Vec::new();
        for raw_line in text.split('\n') {
            let line = raw_line.trim_end_matches('\r').trim();
            if line.is_empty() {
                continue;
            }
            match serde_json::from_str::<WireMessage>(line) {
                Ok(WireMessage::Datafile { data }) => out.push(StreamMessage::Datafile(data)),
                Ok(WireMessage::Ping) => out.push(StreamMessage::Ping),
                Err(e) => {
                    tracing::debug!(error = %e, line, "discarding unparseable stream line");
                }
            }
        }
        out
    }
}
