//! Incremental decoder for the upstream's line-delimited event stream.
//!
//! Input arrives as opaque byte chunks whose boundaries have nothing to do
//! with event boundaries. The decoder keeps one pending partial line and
//! only decodes a line once its terminating `\n` has been seen, so both
//! event lines and multi-byte UTF-8 sequences may be split anywhere.

use serde_json::Value;

use crate::error::RelayError;
use crate::stream::ContentEvent;

const TRACING_TARGET: &str = "chatrelay_core::frame";

/// Prefix introducing an event payload.
pub const EVENT_PREFIX: &str = "data:";
/// Payload that terminates the stream.
pub const DONE_SENTINEL: &str = "[DONE]";

/// One decoded unit of the upstream stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Content(ContentEvent),
    Done,
}

/// Path of the increment inside one event payload.
const CONTENT_POINTER: &str = "/choices/0/delta/content";

/// `choices[0].delta.content`, or `""` if any link is missing or not of
/// the expected shape.
fn content_of(payload: &Value) -> &str {
    payload
        .pointer(CONTENT_POINTER)
        .and_then(Value::as_str)
        .unwrap_or_default()
}

/// Stateful decoder for one upstream response. Never share across exchanges.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    pending: Vec<u8>,
    finished: bool,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// True once `[DONE]` was decoded; further input is ignored.
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Feed one chunk and return the frames completed by it, in order.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Frame> {
        let mut out = Vec::new();
        if self.finished {
            return out;
        }
        self.pending.extend_from_slice(chunk);

        let mut start = 0;
        while let Some(pos) = self.pending[start..].iter().position(|b| *b == b'\n') {
            let end = start + pos;
            let decoded = decode_line(&self.pending[start..end]);
            start = end + 1;
            match decoded {
                Some(Frame::Done) => {
                    self.finish_with_done(&mut out);
                    return out;
                }
                Some(frame) => out.push(frame),
                None => {}
            }
        }
        self.pending.drain(..start);
        out
    }

    /// Decode whatever is left once the body is exhausted. A last line
    /// without a trailing newline is still honoured.
    pub fn finish(&mut self) -> Vec<Frame> {
        let mut out = Vec::new();
        if self.finished || self.pending.is_empty() {
            return out;
        }
        let tail = std::mem::take(&mut self.pending);
        match decode_line(&tail) {
            Some(Frame::Done) => self.finish_with_done(&mut out),
            Some(frame) => out.push(frame),
            None => {}
        }
        out
    }

    fn finish_with_done(&mut self, out: &mut Vec<Frame>) {
        self.finished = true;
        self.pending = Vec::new();
        out.push(Frame::Done);
    }
}

/// Decode one complete line (without its `\n`). `None` means "not an event".
fn decode_line(raw: &[u8]) -> Option<Frame> {
    let raw = raw.strip_suffix(b"\r").unwrap_or(raw);
    if raw.is_empty() {
        return None;
    }
    let line = String::from_utf8_lossy(raw);
    let payload = line.strip_prefix(EVENT_PREFIX)?;
    let payload = payload.strip_prefix(' ').unwrap_or(payload).trim();

    if payload == DONE_SENTINEL {
        return Some(Frame::Done);
    }

    match serde_json::from_str::<Value>(payload) {
        Ok(chunk) => Some(Frame::Content(ContentEvent::new(content_of(&chunk)))),
        Err(e) => {
            let err = RelayError::Decode(e.to_string());
            tracing::warn!(
                target: TRACING_TARGET,
                error = %err,
                payload_len = payload.len(),
                "skipping undecodable event line"
            );
            None
        }
    }
}
