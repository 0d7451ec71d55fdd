// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Line-buffering SSE parser: turns a byte stream into complete `data: ...`
//! lines, tolerating chunk boundaries that split a line across reads.
//!
//! Extraction of content/usage/response-id happens one layer up in
//! `stream_session`; this module only deals with framing.

use serde::Deserialize;

/// Accumulates bytes across reads and yields complete lines.
#[derive(Debug, Default)]
pub struct SseLineBuffer {
    buffer: String,
}

impl SseLineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk of bytes, returning every complete line extracted so far.
    /// Invalid UTF-8 bytes are replaced, matching `String::from_utf8_lossy`.
    pub fn feed(&mut self, bytes: &[u8]) -> Vec<String> {
        self.buffer.push_str(&String::from_utf8_lossy(bytes));
        self.drain_complete_lines()
    }

    /// Flush whatever partial line remains (called at upstream EOF).
    pub fn flush(&mut self) -> Option<String> {
        if self.buffer.is_empty() {
            None
        } else {
            Some(std::mem::take(&mut self.buffer))
        }
    }

    fn drain_complete_lines(&mut self) -> Vec<String> {
        let mut lines = Vec::new();
        while let Some(idx) = self.buffer.find('\n') {
            let mut line: String = self.buffer.drain(..=idx).collect();
            if line.ends_with('\n') {
                line.pop();
            }
            if line.ends_with('\r') {
                line.pop();
            }
            lines.push(line);
        }
        lines
    }
}

pub const DONE_LINE: &str = "data: [DONE]";

/// Extracted fields of interest from one `data: {...}` payload. Every field
/// is best-effort: a malformed or partial chunk simply leaves fields `None`.
#[derive(Debug, Default, Clone)]
pub struct ExtractedDelta {
    pub content: Option<String>,
    pub usage: Option<TokenUsage>,
    pub response_id: Option<String>,
}

#[derive(Debug, Clone, Copy, Deserialize, serde::Serialize)]
pub struct TokenUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

#[derive(Deserialize)]
struct RawChunk {
    id: Option<String>,
    choices: Option<Vec<RawChoice>>,
    usage: Option<TokenUsage>,
}

#[derive(Deserialize)]
struct RawChoice {
    delta: Option<RawDelta>,
}

#[derive(Deserialize)]
struct RawDelta {
    content: Option<String>,
}

/// Parse a raw `data: ...` line's JSON payload. Returns `None` for non-data
/// lines (blank keepalive lines, comments) or the `[DONE]` terminator, and
/// `Some(ExtractedDelta::default())` for malformed JSON — the line is still
/// stored and broadcast verbatim by the caller regardless of this result.
pub fn extract(line: &str) -> Option<ExtractedDelta> {
    let payload = line.strip_prefix("data:")?.trim_start();
    if payload.is_empty() || payload == "[DONE]" {
        return None;
    }

    let parsed: RawChunk = match serde_json::from_str(payload) {
        Ok(v) => v,
        Err(_) => return Some(ExtractedDelta::default()),
    };

    let content = parsed
        .choices
        .as_ref()
        .and_then(|cs| cs.first())
        .and_then(|c| c.delta.as_ref())
        .and_then(|d| d.content.clone());

    Some(ExtractedDelta { content, usage: parsed.usage, response_id: parsed.id })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn feed_splits_lines_across_calls() {
        let mut buf = SseLineBuffer::new();
        assert!(buf.feed(b"data: {\"a\":").is_empty());
        let lines = buf.feed(b"1}\ndata: [DONE]\n");
        assert_eq!(lines, vec!["data: {\"a\":1}", "data: [DONE]"]);
    }

    #[test]
    fn flush_returns_trailing_partial_line() {
        let mut buf = SseLineBuffer::new();
        buf.feed(b"data: partial");
        assert_eq!(buf.flush(), Some("data: partial".to_owned()));
        assert_eq!(buf.flush(), None);
    }

    #[test]
    fn extract_pulls_content_usage_and_id() {
        let line = r#"data: {"id":"resp_1","choices":[{"delta":{"content":"hi"}}],"usage":{"prompt_tokens":1,"completion_tokens":2,"total_tokens":3}}"#;
        let extracted = extract(line).unwrap();
        assert_eq!(extracted.content.as_deref(), Some("hi"));
        assert_eq!(extracted.response_id.as_deref(), Some("resp_1"));
        assert_eq!(extracted.usage.unwrap().total_tokens, 3);
    }

    #[test]
    fn extract_is_none_for_done_and_blank() {
        assert!(extract(DONE_LINE).is_none());
        assert!(extract("data:").is_none());
    }

    #[test]
    fn extract_is_non_fatal_on_malformed_json() {
        let extracted = extract("data: {not json").unwrap();
        assert!(extracted.content.is_none());
    }
}
