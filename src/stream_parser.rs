//! Stream Chunk Parser
//!
//! Turns the incremental text the transport delivers into typed
//! [`StreamEvent`]s. Chunks never line up with frames: one frame can span
//! several `feed` calls and one call can carry several frames.
//!
//! ## Wire formats
//! - [`WireFormat::JsonObjects`]: bare `{...}` objects embedded in plain text,
//!   delimited by brace balance (string literals and escapes respected).
//! - [`WireFormat::Sse`]: `data: {...}` records, one per `data:` line, with
//!   continuation lines joined onto the pending record.
//!
//! Frame boundaries are decided from buffered bytes alone, so the emitted
//! events do not depend on where the transport split the stream. A frame
//! that fails to decode is recorded in [`StreamChunkParser::errors`] and
//! scanning resumes at the next boundary.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::FrameError;
use crate::protocol::{StreamEvent, ToolUse};

/// Largest frame body buffered before it is abandoned as unterminated
pub const MAX_FRAME_BYTES: usize = 1024 * 1024;

/// Sentinel some backends send as the last SSE payload
const SSE_DONE_SENTINEL: &str = "[DONE]";

/// One wire format per session, chosen by the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WireFormat {
    #[default]
    JsonObjects,
    Sse,
}

impl std::str::FromStr for WireFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "json" | "json_objects" => Ok(WireFormat::JsonObjects),
            "sse" => Ok(WireFormat::Sse),
            other => Err(format!("unknown wire format `{other}`")),
        }
    }
}

/// Brace-balance tracker for one candidate frame
#[derive(Debug, Clone, Copy)]
struct FrameScan {
    start: usize,
    depth: usize,
    in_string: bool,
    escaped: bool,
}

impl FrameScan {
    fn open_at(start: usize) -> Self {
        Self {
            start,
            depth: 1,
            in_string: false,
            escaped: false,
        }
    }

    /// Consumes one byte; true when the outermost brace closes
    fn step(&mut self, byte: u8) -> bool {
        if self.in_string {
            if self.escaped {
                self.escaped = false;
            } else if byte == b'\\' {
                self.escaped = true;
            } else if byte == b'"' {
                self.in_string = false;
            }
            return false;
        }

        match byte {
            b'"' => self.in_string = true,
            b'{' => self.depth += 1,
            b'}' => {
                self.depth -= 1;
                return self.depth == 0;
            }
            _ => {}
        }
        false
    }
}

#[derive(Debug, Clone, Copy)]
enum ScanState {
    AwaitingBoundary,
    InFrame(FrameScan),
}

enum ScanStep {
    Advance,
    Open,
    Close { start: usize },
    Abandon { start: usize },
}

pub struct StreamChunkParser {
    format: WireFormat,
    buffer: String,
    /// Next unscanned byte of `buffer` (JSON objects format)
    cursor: usize,
    state: ScanState,
    /// Payload of the SSE record being assembled
    record: Option<String>,
    max_frame_bytes: usize,
    errors: Vec<FrameError>,
}

impl StreamChunkParser {
    pub fn new(format: WireFormat) -> Self {
        Self::with_max_frame_bytes(format, MAX_FRAME_BYTES)
    }

    pub fn with_max_frame_bytes(format: WireFormat, max_frame_bytes: usize) -> Self {
        Self {
            format,
            buffer: String::new(),
            cursor: 0,
            state: ScanState::AwaitingBoundary,
            record: None,
            max_frame_bytes,
            errors: Vec::new(),
        }
    }

    pub fn format(&self) -> WireFormat {
        self.format
    }

    /// Parse errors recorded so far, in stream order
    pub fn errors(&self) -> &[FrameError] {
        &self.errors
    }

    pub fn take_errors(&mut self) -> Vec<FrameError> {
        std::mem::take(&mut self.errors)
    }

    pub fn feed(&mut self, chunk: &str) -> Vec<StreamEvent> {
        self.buffer.push_str(chunk);
        let mut events = Vec::new();
        match self.format {
            WireFormat::JsonObjects => self.scan_objects(&mut events),
            WireFormat::Sse => self.scan_lines(&mut events),
        }
        events
    }

    /// Flushes whatever is still buffered and resets the parser
    pub fn finish(&mut self) -> Vec<StreamEvent> {
        let mut events = Vec::new();
        match self.format {
            WireFormat::JsonObjects => {
                self.scan_objects(&mut events);
                // Any frame still open never terminated: report it and rescan
                // its interior for complete frames.
                while let ScanState::InFrame(scan) = self.state {
                    self.record_error(FrameError::Unterminated {
                        len: self.buffer.len() - scan.start,
                    });
                    self.state = ScanState::AwaitingBoundary;
                    self.cursor = scan.start + 1;
                    self.scan_objects(&mut events);
                }
            }
            WireFormat::Sse => {
                self.scan_lines(&mut events);
                if !self.buffer.is_empty() {
                    let line = std::mem::take(&mut self.buffer);
                    self.sse_line(line.trim_end_matches('\r'), &mut events);
                }
                self.dispatch_record(&mut events);
            }
        }

        self.buffer.clear();
        self.cursor = 0;
        self.state = ScanState::AwaitingBoundary;
        self.record = None;
        events
    }

    fn scan_objects(&mut self, events: &mut Vec<StreamEvent>) {
        let mut i = self.cursor;
        while i < self.buffer.len() {
            let byte = self.buffer.as_bytes()[i];
            let step = match &mut self.state {
                ScanState::AwaitingBoundary if byte == b'{' => ScanStep::Open,
                ScanState::AwaitingBoundary => ScanStep::Advance,
                ScanState::InFrame(scan) => {
                    if scan.step(byte) {
                        ScanStep::Close { start: scan.start }
                    } else if i + 1 - scan.start > self.max_frame_bytes {
                        ScanStep::Abandon { start: scan.start }
                    } else {
                        ScanStep::Advance
                    }
                }
            };

            match step {
                ScanStep::Advance => i += 1,
                ScanStep::Open => {
                    self.state = ScanState::InFrame(FrameScan::open_at(i));
                    i += 1;
                }
                ScanStep::Close { start } => {
                    self.state = ScanState::AwaitingBoundary;
                    match decode_frame(&self.buffer[start..=i]) {
                        Ok(event) => {
                            events.extend(event);
                            i += 1;
                        }
                        Err(err @ FrameError::Syntax { .. }) => {
                            // Balanced but not JSON: a truncated frame may be
                            // hiding a complete one inside it.
                            self.record_error(err);
                            i = start + 1;
                        }
                        Err(err) => {
                            self.record_error(err);
                            i += 1;
                        }
                    }
                }
                ScanStep::Abandon { start } => {
                    self.record_error(FrameError::Oversized {
                        limit: self.max_frame_bytes,
                    });
                    self.state = ScanState::AwaitingBoundary;
                    i = start + 1;
                }
            }
        }
        self.cursor = i;
        self.compact();
    }

    /// Drops scanned bytes that can no longer be part of a frame
    fn compact(&mut self) {
        let keep_from = match self.state {
            ScanState::AwaitingBoundary => self.cursor,
            ScanState::InFrame(scan) => scan.start,
        };
        if keep_from == 0 {
            return;
        }
        self.buffer.drain(..keep_from);
        self.cursor -= keep_from;
        if let ScanState::InFrame(scan) = &mut self.state {
            scan.start -= keep_from;
        }
    }

    fn scan_lines(&mut self, events: &mut Vec<StreamEvent>) {
        while let Some(idx) = self.buffer.find('\n') {
            let line: String = self.buffer.drain(..=idx).collect();
            let line = line.trim_end_matches(['\n', '\r']);
            self.sse_line(line, events);
        }
    }

    fn sse_line(&mut self, line: &str, events: &mut Vec<StreamEvent>) {
        if line.is_empty() {
            self.dispatch_record(events);
            return;
        }

        if let Some(rest) = line.strip_prefix("data:") {
            self.dispatch_record(events);
            let payload = rest.strip_prefix(' ').unwrap_or(rest);
            self.record = Some(payload.to_string());
        } else if line.starts_with(':')
            || line.starts_with("event:")
            || line.starts_with("id:")
            || line.starts_with("retry:")
        {
            return;
        } else if let Some(record) = self.record.as_mut() {
            record.push('\n');
            record.push_str(line);
        } else {
            tracing::debug!(line, "ignoring text outside an SSE record");
            return;
        }

        // A record that already holds a complete JSON value cannot grow any
        // further, so it is dispatched without waiting for the next boundary.
        let complete = self
            .record
            .as_deref()
            .map(|r| serde_json::from_str::<Value>(r).is_ok())
            .unwrap_or(false);
        if complete {
            self.dispatch_record(events);
        }
    }

    fn dispatch_record(&mut self, events: &mut Vec<StreamEvent>) {
        let Some(record) = self.record.take() else {
            return;
        };
        let payload = record.trim();
        if payload.is_empty() {
            return;
        }
        if payload == SSE_DONE_SENTINEL {
            events.push(StreamEvent::Done);
            return;
        }

        match decode_frame(payload) {
            Ok(event) => events.extend(event),
            Err(err) => self.record_error(err),
        }
    }

    fn record_error(&mut self, err: FrameError) {
        tracing::warn!(error = %err, format = ?self.format, "skipping malformed frame");
        self.errors.push(err);
    }
}

/// Typed shapes of the frames this client understands
#[derive(Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum WireFrame {
    Text {
        content: String,
    },
    ToolUse {
        name: String,
        #[serde(default)]
        input: Value,
    },
    Error {
        #[serde(alias = "message", alias = "error")]
        content: String,
    },
    Done {},
}

/// Decodes one frame body. Unknown `type` values yield `Ok(None)`.
fn decode_frame(raw: &str) -> Result<Option<StreamEvent>, FrameError> {
    let value: Value = serde_json::from_str(raw).map_err(|e| FrameError::Syntax {
        reason: e.to_string(),
    })?;

    let kind = value
        .get("type")
        .and_then(Value::as_str)
        .ok_or(FrameError::MissingType)?
        .to_string();

    match kind.as_str() {
        "text" | "tool_use" | "error" | "done" => {}
        "message_delta" => return Ok(Some(StreamEvent::MessageDelta { payload: value })),
        other => {
            tracing::debug!(kind = other, "dropping frame of unknown type");
            return Ok(None);
        }
    }

    let frame: WireFrame =
        serde_json::from_value(value).map_err(|e| FrameError::InvalidPayload {
            kind: kind.clone(),
            reason: e.to_string(),
        })?;

    Ok(Some(match frame {
        WireFrame::Text { content } => StreamEvent::Text { content },
        WireFrame::ToolUse { name, input } => StreamEvent::ToolUse(ToolUse { name, input }),
        WireFrame::Error { content } => StreamEvent::Error { message: content },
        WireFrame::Done {} => StreamEvent::Done,
    }))
}

/// Decodes transport bytes to text, carrying a multi-byte sequence split
/// across chunks over to the next call.
#[derive(Debug, Default)]
pub struct Utf8Decoder {
    pending: Vec<u8>,
}

impl Utf8Decoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn decode(&mut self, bytes: &[u8]) -> String {
        self.pending.extend_from_slice(bytes);
        let mut out = String::new();

        loop {
            match std::str::from_utf8(&self.pending) {
                Ok(text) => {
                    out.push_str(text);
                    self.pending.clear();
                    return out;
                }
                Err(e) => {
                    let valid = e.valid_up_to();
                    match e.error_len() {
                        // Incomplete sequence at the end: wait for more bytes
                        None => {
                            out.push_str(&String::from_utf8_lossy(&self.pending[..valid]));
                            self.pending.drain(..valid);
                            return out;
                        }
                        Some(len) => {
                            out.push_str(&String::from_utf8_lossy(&self.pending[..valid + len]));
                            self.pending.drain(..valid + len);
                        }
                    }
                }
            }
        }
    }

    pub fn finish(&mut self) -> String {
        let out = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn feed_all(format: WireFormat, chunks: &[&str]) -> (Vec<StreamEvent>, Vec<FrameError>) {
        let mut parser = StreamChunkParser::new(format);
        let mut events = Vec::new();
        for chunk in chunks {
            events.extend(parser.feed(chunk));
        }
        events.extend(parser.finish());
        (events, parser.take_errors())
    }

    fn sample_events() -> Vec<StreamEvent> {
        vec![
            StreamEvent::text("Hel"),
            StreamEvent::text("lo {with} \"braces\" \\ and ünïcode"),
            StreamEvent::ToolUse(ToolUse {
                name: "create_ticket".to_string(),
                input: json!({"title": "Bug", "labels": {"area": "ui"}}),
            }),
            StreamEvent::Error {
                message: "rate limited".to_string(),
            },
            StreamEvent::text("!"),
            StreamEvent::Done,
        ]
    }

    fn sample_frames() -> Vec<String> {
        vec![
            json!({"type": "text", "content": "Hel"}).to_string(),
            json!({"type": "text", "content": "lo {with} \"braces\" \\ and ünïcode"}).to_string(),
            json!({"type": "tool_use", "name": "create_ticket", "input": {"title": "Bug", "labels": {"area": "ui"}}}).to_string(),
            json!({"type": "error", "content": "rate limited"}).to_string(),
            json!({"type": "text", "content": "!"}).to_string(),
            json!({"type": "done"}).to_string(),
        ]
    }

    fn char_splits(payload: &str) -> Vec<usize> {
        payload.char_indices().map(|(i, _)| i).skip(1).collect()
    }

    #[test]
    fn test_example_scenario() {
        let (events, errors) = feed_all(
            WireFormat::JsonObjects,
            &[
                "{\"type\":\"te",
                "xt\",\"content\":\"Hel",
                "lo\"}",
                "{\"type\":\"done\"}",
            ],
        );
        assert_eq!(events, vec![StreamEvent::text("Hello"), StreamEvent::Done]);
        assert!(errors.is_empty());
    }

    #[test]
    fn test_frames_emitted_as_soon_as_complete() {
        let mut parser = StreamChunkParser::new(WireFormat::JsonObjects);
        let first = parser.feed("{\"type\":\"text\",\"content\":\"a\"}{\"type\"");
        assert_eq!(first, vec![StreamEvent::text("a")]);
        assert_eq!(parser.feed(":\"done\"}"), vec![StreamEvent::Done]);
    }

    #[test]
    fn test_json_objects_boundary_independence() {
        let payload = format!("noise {} trailing", sample_frames().join("\n"));
        let (whole, _) = feed_all(WireFormat::JsonObjects, &[&payload]);
        assert_eq!(whole, sample_events());

        for split in char_splits(&payload) {
            let (a, b) = payload.split_at(split);
            let (events, _) = feed_all(WireFormat::JsonObjects, &[a, b]);
            assert_eq!(events, whole, "split at {split}");
        }

        let singles: Vec<String> = payload.chars().map(String::from).collect();
        let refs: Vec<&str> = singles.iter().map(String::as_str).collect();
        let (events, _) = feed_all(WireFormat::JsonObjects, &refs);
        assert_eq!(events, whole);
    }

    #[test]
    fn test_sse_boundary_independence() {
        let payload: String = sample_frames()
            .iter()
            .map(|f| format!("event: message\ndata: {f}\n\n"))
            .collect();
        let (whole, errors) = feed_all(WireFormat::Sse, &[&payload]);
        assert_eq!(whole, sample_events());
        assert!(errors.is_empty());

        for split in char_splits(&payload) {
            let (a, b) = payload.split_at(split);
            let (events, _) = feed_all(WireFormat::Sse, &[a, b]);
            assert_eq!(events, whole, "split at {split}");
        }
    }

    #[test]
    fn test_sse_without_blank_lines() {
        let payload: String = sample_frames()
            .iter()
            .map(|f| format!("data: {f}\n"))
            .collect();
        let mut parser = StreamChunkParser::new(WireFormat::Sse);
        let events = parser.feed(&payload);
        assert_eq!(events, sample_events());
    }

    #[test]
    fn test_sse_continuation_and_done_sentinel() {
        let (events, errors) = feed_all(
            WireFormat::Sse,
            &["data: {\"type\":\"text\",\n", "\"content\":\"hi\"}\n", "data: [DONE]\n"],
        );
        assert_eq!(events, vec![StreamEvent::text("hi"), StreamEvent::Done]);
        assert!(errors.is_empty());
    }

    #[test]
    fn test_sse_bad_record_skipped() {
        let (events, errors) = feed_all(
            WireFormat::Sse,
            &["data: {\"type\":\"text\",\"content\":\n\ndata: {\"type\":\"done\"}\n\n"],
        );
        assert_eq!(events, vec![StreamEvent::Done]);
        assert_eq!(errors.len(), 1);
        assert!(matches!(errors[0], FrameError::Syntax { .. }));
    }

    #[test]
    fn test_sse_final_line_without_newline() {
        let (events, _) = feed_all(WireFormat::Sse, &["data: {\"type\":\"done\"}"]);
        assert_eq!(events, vec![StreamEvent::Done]);
    }

    #[test]
    fn test_invalid_frame_skipped_and_resynchronized() {
        let (events, errors) = feed_all(
            WireFormat::JsonObjects,
            &["{\"type\":\"text\",\"content\":\"a\"}{\"type\": nope}{\"type\":\"done\"}"],
        );
        assert_eq!(events, vec![StreamEvent::text("a"), StreamEvent::Done]);
        assert_eq!(errors.len(), 1);
    }

    #[test]
    fn test_truncated_frame_does_not_hide_following_frame() {
        let (events, errors) = feed_all(
            WireFormat::JsonObjects,
            &["{\"type\":\"te", "{\"type\":\"done\"}"],
        );
        assert_eq!(events, vec![StreamEvent::Done]);
        assert!(matches!(errors[0], FrameError::Unterminated { .. }));
    }

    #[test]
    fn test_unknown_type_dropped_without_error() {
        let (events, errors) = feed_all(
            WireFormat::JsonObjects,
            &["{\"type\":\"usage\",\"tokens\":3}{\"type\":\"done\"}"],
        );
        assert_eq!(events, vec![StreamEvent::Done]);
        assert!(errors.is_empty());
    }

    #[test]
    fn test_schema_errors_recorded() {
        let (events, errors) = feed_all(
            WireFormat::JsonObjects,
            &["{\"content\":\"no type\"}{\"type\":\"text\"}{\"type\":\"tool_use\",\"input\":{}}"],
        );
        assert!(events.is_empty());
        assert_eq!(errors.len(), 3);
        assert_eq!(errors[0], FrameError::MissingType);
        assert!(matches!(&errors[1], FrameError::InvalidPayload { kind, .. } if kind == "text"));
        assert!(matches!(&errors[2], FrameError::InvalidPayload { kind, .. } if kind == "tool_use"));
    }

    #[test]
    fn test_message_delta_and_error_aliases() {
        let (events, _) = feed_all(
            WireFormat::JsonObjects,
            &["{\"type\":\"message_delta\",\"usage\":1}{\"type\":\"error\",\"message\":\"slow down\"}"],
        );
        assert!(matches!(events[0], StreamEvent::MessageDelta { .. }));
        assert_eq!(
            events[1],
            StreamEvent::Error {
                message: "slow down".to_string()
            }
        );
    }

    #[test]
    fn test_oversized_frame_abandoned() {
        let mut parser = StreamChunkParser::with_max_frame_bytes(WireFormat::JsonObjects, 32);
        let long = format!("{{\"type\":\"text\",\"content\":\"{}", "x".repeat(64));
        let mut events = parser.feed(&long);
        events.extend(parser.feed("{\"type\":\"done\"}"));
        assert_eq!(events, vec![StreamEvent::Done]);
        assert!(matches!(parser.errors()[0], FrameError::Oversized { limit: 32 }));
    }

    #[test]
    fn test_utf8_decoder_carries_split_code_points() {
        let text = "{\"type\":\"text\",\"content\":\"héllo ✓\"}";
        let bytes = text.as_bytes();
        for split in 1..bytes.len() {
            let mut decoder = Utf8Decoder::new();
            let mut parser = StreamChunkParser::new(WireFormat::JsonObjects);
            let mut events = parser.feed(&decoder.decode(&bytes[..split]));
            events.extend(parser.feed(&decoder.decode(&bytes[split..])));
            events.extend(parser.feed(&decoder.finish()));
            assert_eq!(events, vec![StreamEvent::text("héllo ✓")], "split at {split}");
        }
    }

    #[test]
    fn test_utf8_decoder_replaces_invalid_bytes() {
        let mut decoder = Utf8Decoder::new();
        assert_eq!(decoder.decode(b"a\xffb"), "a\u{fffd}b");
    }
}
