//! Demultiplexer for the line-framed model event stream.
//!
//! Each logical frame is one line: a `data:` marker followed by a JSON
//! payload. Transport chunks arrive with arbitrary boundaries, so a line
//! assembly buffer is kept across calls. A `[DONE]` payload ends the stream.

use serde_json::Value;
use tracing::{debug, warn};

/// Protocol marker that prefixes every frame line.
const DATA_MARKER: &str = "data:";

/// Sentinel payload signalling end-of-stream.
const DONE_SENTINEL: &str = "[DONE]";

/// Event produced by the demultiplexer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    /// An incremental text fragment from the model.
    Delta(String),
    /// The stream has ended; no further deltas will follow.
    Done,
}

/// Parses raw transport chunks into [`StreamEvent`]s.
///
/// Chunk boundaries may split a frame (or even a UTF-8 code point), so bytes
/// are accumulated until a full line is available. Malformed JSON in a single
/// frame is logged and dropped; it never ends the session.
#[derive(Debug, Default)]
pub struct StreamDemux {
    line_buf: Vec<u8>,
    done: bool,
}

impl StreamDemux {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a transport chunk, returning the events it completed.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<StreamEvent> {
        let mut events = Vec::new();
        if self.done {
            return events;
        }

        self.line_buf.extend_from_slice(chunk);

        while let Some(newline) = self.line_buf.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.line_buf.drain(..=newline).collect();
            let line = String::from_utf8_lossy(&line);
            let line = line.trim_end_matches(['\n', '\r']);

            match self.parse_line(line) {
                Some(StreamEvent::Done) => {
                    self.done = true;
                    events.push(StreamEvent::Done);
                    return events;
                }
                Some(event) => events.push(event),
                None => {}
            }
        }

        events
    }

    /// Parse one complete frame line, if it carries anything of interest.
    fn parse_line(&self, line: &str) -> Option<StreamEvent> {
        let line = line.trim();
        if line.is_empty() {
            return None;
        }

        let payload = match line.strip_prefix(DATA_MARKER) {
            Some(rest) => rest.trim_start(),
            None => {
                // Comment lines and unknown fields are part of the protocol;
                // skip them silently.
                debug!("Skipping non-data line: {}", line);
                return None;
            }
        };

        if payload == DONE_SENTINEL {
            return Some(StreamEvent::Done);
        }

        let value: Value = match serde_json::from_str(payload) {
            Ok(value) => value,
            Err(e) => {
                warn!("Dropping malformed frame ({}): {}", e, payload);
                return None;
            }
        };

        match extract_delta(&value) {
            Some(text) if !text.is_empty() => Some(StreamEvent::Delta(text.to_string())),
            _ => None,
        }
    }
}

/// Extract the text delta from a payload, tolerating the known field shapes.
fn extract_delta(value: &Value) -> Option<&str> {
    let candidates = [
        &["choices", "0", "delta", "content"][..],
        &["choices", "0", "text"],
        &["message", "content"],
        &["delta", "text"],
        &["content"],
    ];

    for path in candidates {
        let mut node = value;
        let mut matched = true;
        for key in path {
            node = match key.parse::<usize>() {
                Ok(index) => match node.get(index) {
                    Some(next) => next,
                    None => {
                        matched = false;
                        break;
                    }
                },
                Err(_) => match node.get(key) {
                    Some(next) => next,
                    None => {
                        matched = false;
                        break;
                    }
                },
            };
        }
        if matched && let Some(text) = node.as_str() {
            return Some(text);
        }
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_frame() {
        let mut demux = StreamDemux::new();
        let events = demux.push(b"data: {\"choices\":[{\"delta\":{\"content\":\"Hi\"}}]}\n");
        assert_eq!(events, vec![StreamEvent::Delta("Hi".to_string())]);
    }

    #[test]
    fn test_frame_split_across_chunks() {
        let mut demux = StreamDemux::new();
        assert!(demux.push(b"data: {\"choices\":[{\"delta\":").is_empty());
        let events = demux.push(b"{\"content\":\"Hello\"}}]}\ndata: [DONE]\n");
        assert_eq!(
            events,
            vec![StreamEvent::Delta("Hello".to_string()), StreamEvent::Done]
        );
    }

    #[test]
    fn test_malformed_frame_is_dropped() {
        let mut demux = StreamDemux::new();
        let mut events = demux.push(b"data: {not json}\n");
        events.extend(demux.push(b"data: {\"content\":\"still here\"}\n"));
        assert_eq!(events, vec![StreamEvent::Delta("still here".to_string())]);
    }

    #[test]
    fn test_alternate_field_shapes() {
        let mut demux = StreamDemux::new();
        let events = demux.push(
            b"data: {\"message\":{\"content\":\"a\"}}\n\
              data: {\"delta\":{\"text\":\"b\"}}\n\
              data: {\"choices\":[{\"text\":\"c\"}]}\n",
        );
        let texts: Vec<_> = events
            .iter()
            .map(|e| match e {
                StreamEvent::Delta(t) => t.as_str(),
                StreamEvent::Done => "<done>",
            })
            .collect();
        assert_eq!(texts, vec!["a", "b", "c"]);
    }

    #[test]
    fn test_nothing_after_done() {
        let mut demux = StreamDemux::new();
        demux.push(b"data: [DONE]\n");
        assert!(demux.push(b"data: {\"content\":\"late\"}\n").is_empty());
    }

    #[test]
    fn test_crlf_and_blank_lines() {
        let mut demux = StreamDemux::new();
        let events = demux.push(b"\r\ndata: {\"content\":\"x\"}\r\n\r\n");
        assert_eq!(events, vec![StreamEvent::Delta("x".to_string())]);
    }

    #[test]
    fn test_empty_delta_is_skipped() {
        let mut demux = StreamDemux::new();
        assert!(demux.push(b"data: {\"content\":\"\"}\n").is_empty());
    }
}
