//! Output capture and buffering for service runs.
//!
//! This module provides the bounded per-run buffer (`OutputBuffer`), the
//! entry type it stores, and the byte-to-text decoding applied to every chunk
//! read from a child's stdout/stderr.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strip_ansi_escapes::strip;

use crate::shell::Platform;

/// Number of entries kept per run unless configured otherwise.
pub const DEFAULT_OUTPUT_CAPACITY: usize = 1000;

/// Indicates the source stream of an output entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamKind {
    /// Standard Output.
    Stdout,
    /// Standard Error.
    Stderr,
}

/// A single chunk of output from a process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputEntry {
    /// The stream it originated from (stdout/stderr).
    #[serde(rename = "type")]
    pub stream: StreamKind,
    /// Decoded text of the chunk, including any trailing newline.
    #[serde(rename = "data")]
    pub text: String,
    pub timestamp: DateTime<Utc>,
}

impl OutputEntry {
    pub fn now(stream: StreamKind, text: impl Into<String>) -> Self {
        Self {
            stream,
            text: text.into(),
            timestamp: Utc::now(),
        }
    }
}

/// A fixed-capacity ring buffer of `OutputEntry`s, oldest evicted first.
#[derive(Debug, Clone)]
pub struct OutputBuffer {
    capacity: usize,
    entries: VecDeque<OutputEntry>,
}

impl OutputBuffer {
    /// Creates a new `OutputBuffer` with the specified maximum capacity.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            entries: VecDeque::with_capacity(capacity.min(1024)),
        }
    }

    /// Adds an entry to the buffer.
    ///
    /// Returns `true` if an old entry was dropped to make room.
    pub fn push(&mut self, entry: OutputEntry) -> bool {
        let mut dropped = false;
        self.entries.push_back(entry);
        while self.entries.len() > self.capacity {
            self.entries.pop_front();
            dropped = true;
        }
        dropped
    }

    /// Returns the most recent `limit` entries, oldest first.
    pub fn tail(&self, limit: usize) -> Vec<OutputEntry> {
        let skip = self.entries.len().saturating_sub(limit);
        self.entries.iter().skip(skip).cloned().collect()
    }
}

/// Decodes a raw output chunk into text.
///
/// On Windows the console code page varies between interpreters, so the
/// regional code page (GBK) is tried first, then UTF-8. If both produce
/// replacement characters the GBK text wins. Elsewhere chunks are UTF-8.
pub fn decode_chunk(bytes: &[u8], platform: Platform) -> String {
    match platform {
        Platform::Posix => String::from_utf8_lossy(bytes).into_owned(),
        Platform::Windows => {
            let (regional, _, regional_errors) = encoding_rs::GBK.decode(bytes);
            if !regional_errors && !regional.contains(char::REPLACEMENT_CHARACTER) {
                return regional.into_owned();
            }
            let utf8 = String::from_utf8_lossy(bytes);
            if !utf8.contains(char::REPLACEMENT_CHARACTER) {
                return utf8.into_owned();
            }
            regional.into_owned()
        }
    }
}

/// Sanitizes text for display, optionally stripping ANSI escape codes.
pub fn sanitize_text(text: &str, strip_ansi: bool) -> String {
    if !strip_ansi {
        return text.to_string();
    }
    let stripped = strip(text.as_bytes());
    String::from_utf8_lossy(&stripped).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(text: &str) -> OutputEntry {
        OutputEntry::now(StreamKind::Stdout, text)
    }

    #[test]
    fn output_buffer_drops_oldest() {
        let mut buffer = OutputBuffer::new(2);
        buffer.push(entry("a"));
        buffer.push(entry("b"));
        let dropped = buffer.push(entry("c"));
        assert!(dropped);
        let texts = buffer.tail(usize::MAX).into_iter().map(|e| e.text).collect::<Vec<_>>();
        assert_eq!(texts, vec!["b", "c"]);
    }

    #[test]
    fn bounded_at_capacity_after_overflow() {
        let mut buffer = OutputBuffer::new(DEFAULT_OUTPUT_CAPACITY);
        for i in 0..1100 {
            buffer.push(entry(&format!("line {i}")));
        }
        let kept = buffer.tail(usize::MAX);
        assert_eq!(kept.len(), 1000);
        assert_eq!(kept[0].text, "line 100");
    }

    #[test]
    fn tail_returns_most_recent_oldest_first() {
        let mut buffer = OutputBuffer::new(DEFAULT_OUTPUT_CAPACITY);
        for i in 0..200 {
            buffer.push(entry(&format!("{i}")));
        }
        let tail = buffer.tail(50);
        assert_eq!(tail.len(), 50);
        assert_eq!(tail.first().unwrap().text, "150");
        assert_eq!(tail.last().unwrap().text, "199");
        assert_eq!(buffer.tail(500).len(), 200);
    }

    #[test]
    fn posix_decodes_utf8() {
        let text = decode_chunk("héllo 世界\n".as_bytes(), Platform::Posix);
        assert_eq!(text, "héllo 世界\n");
    }

    #[test]
    fn windows_prefers_regional_code_page() {
        // "中文" in GBK
        let bytes = [0xD6, 0xD0, 0xCE, 0xC4];
        assert_eq!(decode_chunk(&bytes, Platform::Windows), "中文");
    }

    #[test]
    fn windows_falls_back_to_utf8() {
        // U+00E9 + U+4E16 as UTF-8; the trailing 0x96 is not a valid GBK sequence
        let text = "é世";
        let decoded = decode_chunk(text.as_bytes(), Platform::Windows);
        assert_eq!(decoded, text);
    }

    #[test]
    fn windows_keeps_regional_when_both_fail() {
        let bytes = [b'o', b'k', 0xFF];
        let decoded = decode_chunk(&bytes, Platform::Windows);
        let (regional, _, _) = encoding_rs::GBK.decode(&bytes);
        assert_eq!(decoded, regional);
    }

    #[test]
    fn sanitize_strips_ansi() {
        assert_eq!(sanitize_text("\u{1b}[31mred\u{1b}[0m", true), "red");
        assert_eq!(sanitize_text("plain", false), "plain");
    }
}
