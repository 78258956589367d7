//! Server-Sent Events wire codec.
//!
//! [`SseFrame`] encodes outgoing frames in the exact wire format
//! (`id:` / `event:` / `retry:` / `data:` lines, comment heartbeats,
//! the `[DONE]` terminator). [`SseDecoder`] parses upstream byte chunks
//! back into events, handling the `data:` prefix, line buffering across
//! TCP chunk boundaries, and empty keep-alive lines.

use serde_json::{json, Value};

/// Response headers every SSE endpoint must send.
pub const RESPONSE_HEADERS: [(&str, &str); 4] = [
    ("Content-Type", "text/event-stream"),
    ("Cache-Control", "no-cache"),
    ("Connection", "keep-alive"),
    ("X-Accel-Buffering", "no"),
];

/// One outgoing SSE frame.
///
/// # Example
///
/// ```
/// use llm_relay::sse::SseFrame;
///
/// let frame = SseFrame::data("{\"x\":1}").with_id("42");
/// assert_eq!(frame.encode(), "id: 42\ndata: {\"x\":1}\n\n");
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseFrame {
    /// Optional `id:` line.
    pub id: Option<String>,
    /// Optional `event:` line.
    pub event: Option<String>,
    /// Optional `retry:` line (milliseconds).
    pub retry_ms: Option<u64>,
    /// The payload. Multi-line payloads encode as one `data:` line each.
    pub data: String,
    comment: bool,
}

impl SseFrame {
    /// A plain data frame.
    pub fn data(payload: impl Into<String>) -> Self {
        Self {
            id: None,
            event: None,
            retry_ms: None,
            data: payload.into(),
            comment: false,
        }
    }

    /// A named event frame.
    pub fn event(name: impl Into<String>, payload: impl Into<String>) -> Self {
        Self {
            event: Some(name.into()),
            ..Self::data(payload)
        }
    }

    /// The stream terminator: `data: [DONE]`.
    pub fn done() -> Self {
        Self::data("[DONE]")
    }

    /// A `: heartbeat` comment frame (ignored by EventSource parsers,
    /// keeps intermediaries from closing the connection).
    pub fn heartbeat() -> Self {
        Self {
            id: None,
            event: None,
            retry_ms: None,
            data: "heartbeat".to_string(),
            comment: true,
        }
    }

    /// The `connected` event sent once when a client attaches.
    pub fn connected(client_id: &str, timestamp_ms: u64) -> Self {
        Self::event(
            "connected",
            json!({"client_id": client_id, "timestamp": timestamp_ms}).to_string(),
        )
    }

    /// A sanitized mid-stream error event.
    pub fn error(message: &str) -> Self {
        Self::event(
            "error",
            json!({"message": message, "type": "stream_error"}).to_string(),
        )
    }

    /// Set the `id:` line.
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Set the `retry:` line.
    pub fn with_retry_ms(mut self, ms: u64) -> Self {
        self.retry_ms = Some(ms);
        self
    }

    /// Whether this frame marks the end of the stream.
    pub fn is_done(&self) -> bool {
        !self.comment && self.data == "[DONE]"
    }

    /// Encode to the wire format, terminated by the blank line.
    pub fn encode(&self) -> String {
        if self.comment {
            return format!(": {}\n\n", self.data);
        }

        let mut out = String::new();
        if let Some(ref id) = self.id {
            out.push_str("id: ");
            out.push_str(id);
            out.push('\n');
        }
        if let Some(ref event) = self.event {
            out.push_str("event: ");
            out.push_str(event);
            out.push('\n');
        }
        if let Some(retry) = self.retry_ms {
            out.push_str("retry: ");
            out.push_str(&retry.to_string());
            out.push('\n');
        }
        for line in self.data.split('\n') {
            out.push_str("data: ");
            out.push_str(line);
            out.push('\n');
        }
        out.push('\n');
        out
    }
}

/// One decoded upstream event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SseEvent {
    /// A `data:` payload, with the preceding `event:` name when present.
    Message {
        /// The `event:` name, if the upstream sent one.
        event: Option<String>,
        /// Raw payload text of the `data:` line.
        data: String,
    },
    /// The `data: [DONE]` terminator.
    Done,
}

impl SseEvent {
    /// Parse the payload as JSON, if this is a message.
    pub fn json(&self) -> Option<Value> {
        match self {
            SseEvent::Message { data, .. } => serde_json::from_str(data).ok(),
            SseEvent::Done => None,
        }
    }
}

/// Streaming decoder for upstream SSE bytes.
///
/// Buffers partial lines across chunk boundaries, tracks the pending
/// `event:` name, ignores comments and `id:`/`retry:` fields, and
/// surfaces `[DONE]` as [`SseEvent::Done`].
///
/// # Example
///
/// ```
/// use llm_relay::sse::{SseDecoder, SseEvent};
///
/// let mut decoder = SseDecoder::new();
/// let events = decoder.decode(b"data: {\"x\":1}\n\ndata: [DONE]\n\n");
/// assert_eq!(events.len(), 2);
/// assert_eq!(events[1], SseEvent::Done);
/// ```
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: String,
    pending_event: Option<String>,
}

impl SseDecoder {
    /// A fresh decoder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed raw bytes and return any complete events.
    pub fn decode(&mut self, chunk: &[u8]) -> Vec<SseEvent> {
        let text = String::from_utf8_lossy(chunk);
        self.buffer.push_str(&text);

        let mut events = Vec::new();

        while let Some(pos) = self.buffer.find('\n') {
            let line: String = self.buffer.drain(..=pos).collect();
            let line = line.trim_end_matches(['\n', '\r']);

            if line.is_empty() {
                // Blank line ends the current event block.
                self.pending_event = None;
                continue;
            }

            // Comment / keep-alive line.
            if line.starts_with(':') {
                continue;
            }

            if let Some(name) = strip_field(line, "event") {
                self.pending_event = Some(name.to_string());
                continue;
            }

            if let Some(data) = strip_field(line, "data") {
                if data == "[DONE]" {
                    events.push(SseEvent::Done);
                } else {
                    events.push(SseEvent::Message {
                        event: self.pending_event.clone(),
                        data: data.to_string(),
                    });
                }
                continue;
            }

            // id:, retry:, and unknown fields are ignored.
        }

        events
    }

    /// Flush a trailing `data:` line not terminated by a newline.
    pub fn flush(&mut self) -> Option<SseEvent> {
        let remaining = self.buffer.trim().to_string();
        self.buffer.clear();
        self.pending_event = None;

        let data = strip_field(&remaining, "data")?;
        if data == "[DONE]" {
            return Some(SseEvent::Done);
        }
        Some(SseEvent::Message {
            event: None,
            data: data.to_string(),
        })
    }
}

/// Strip `"<field>: "` or `"<field>:"` from the start of `line`.
fn strip_field<'a>(line: &'a str, field: &str) -> Option<&'a str> {
    let rest = line.strip_prefix(field)?;
    let rest = rest.strip_prefix(':')?;
    Some(rest.strip_prefix(' ').unwrap_or(rest))
}
