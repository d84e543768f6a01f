//! Server-Sent Events parsing for streaming chat completions.

use serde::Deserialize;

use super::types::Usage;

#[derive(Debug, Deserialize)]
struct StreamChunk {
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    choices: Vec<StreamChoice>,
    #[serde(default)]
    usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    #[serde(default)]
    delta: StreamDelta,
}

#[derive(Debug, Default, Deserialize)]
struct StreamDelta {
    content: Option<String>,
}

/// Event decoded from one SSE line
#[derive(Debug, Clone, PartialEq)]
pub enum SseEvent {
    /// A content fragment (may be empty for role-only chunks).
    Delta {
        content: String,
        model: Option<String>,
        usage: Option<Usage>,
    },
    /// `data: [DONE]`
    Done,
    /// A data line that was not valid chunk JSON.
    Error(String),
}

/// Parse a single SSE line. Blank lines and comments yield `None`.
pub fn parse_sse_line(line: &str) -> Option<SseEvent> {
    let line = line.trim();

    if line.is_empty() || line.starts_with(':') {
        return None;
    }

    let data = line.strip_prefix("data:")?.trim_start();

    if data == "[DONE]" {
        return Some(SseEvent::Done);
    }

    match serde_json::from_str::<StreamChunk>(data) {
        Ok(chunk) => Some(SseEvent::Delta {
            content: chunk
                .choices
                .into_iter()
                .next()
                .and_then(|c| c.delta.content)
                .unwrap_or_default(),
            model: chunk.model,
            usage: chunk.usage,
        }),
        Err(e) => Some(SseEvent::Error(format!("Failed to parse chunk: {}", e))),
    }
}

/// Incremental line splitter for a byte stream.
#[derive(Debug, Default)]
pub(crate) struct SseBuffer {
    buffer: String,
}

impl SseBuffer {
    /// Append raw bytes and drain every complete line as parsed events.
    pub fn push(&mut self, bytes: &[u8]) -> Vec<SseEvent> {
        self.buffer.push_str(&String::from_utf8_lossy(bytes));
        let mut events = Vec::new();
        while let Some(pos) = self.buffer.find('\n') {
            let line: String = self.buffer.drain(..=pos).collect();
            if let Some(event) = parse_sse_line(&line) {
                events.push(event);
            }
        }
        events
    }

    /// Parse whatever is left once the stream ends.
    pub fn finish(&mut self) -> Option<SseEvent> {
        let rest = std::mem::take(&mut self.buffer);
        parse_sse_line(&rest)
    }
}
