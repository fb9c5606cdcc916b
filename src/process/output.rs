//! Bounded tail of a process's output
//!
//! Keeps the most recent lines within a fixed byte budget. When the budget
//! is exceeded the oldest lines are evicted first; a single line larger than
//! the whole budget is truncated to fit.

use std::collections::VecDeque;

use regex::Regex;

use crate::common::truncate_to_bytes;

/// Which pipe a line came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stream {
    Stdout,
    Stderr,
}

impl Stream {
    pub fn as_str(self) -> &'static str {
        match self {
            Stream::Stdout => "stdout",
            Stream::Stderr => "stderr",
        }
    }
}

/// A captured line of output
#[derive(Debug, Clone)]
pub struct OutputLine {
    pub stream: Stream,
    pub text: String,
}

/// Byte-capped ring of output lines
#[derive(Debug)]
pub struct OutputTail {
    lines: VecDeque<OutputLine>,
    max_bytes: usize,
    current_bytes: usize,
    dropped_lines: usize,
}

impl OutputTail {
    pub fn new(max_bytes: usize) -> Self {
        Self {
            lines: VecDeque::new(),
            max_bytes,
            current_bytes: 0,
            dropped_lines: 0,
        }
    }

    /// Append a line, evicting from the front to stay within the budget
    pub fn push(&mut self, stream: Stream, text: &str) {
        let text = if text.len() > self.max_bytes {
            tracing::debug!(
                "Output line ({} bytes) exceeds tail budget ({} bytes), truncating",
                text.len(),
                self.max_bytes
            );
            truncate_to_bytes(text, self.max_bytes).to_string()
        } else {
            text.to_string()
        };

        let bytes = text.len();

        while self.current_bytes + bytes > self.max_bytes && !self.lines.is_empty() {
            if let Some(removed) = self.lines.pop_front() {
                self.current_bytes = self.current_bytes.saturating_sub(removed.text.len());
                self.dropped_lines += 1;
            }
        }

        self.lines.push_back(OutputLine { stream, text });
        self.current_bytes += bytes;
    }

    pub fn bytes(&self) -> usize {
        self.current_bytes
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    /// Number of lines evicted so far
    pub fn dropped_lines(&self) -> usize {
        self.dropped_lines
    }

    /// First capture group of the first retained line matching `pattern`
    pub fn find_capture(&self, pattern: &Regex) -> Option<String> {
        self.lines.iter().find_map(|line| {
            pattern
                .captures(&line.text)
                .and_then(|c| c.get(1).or_else(|| c.get(0)))
                .map(|m| m.as_str().to_string())
        })
    }

    /// Render the retained lines for an error report
    pub fn render(&self) -> String {
        let mut out = String::with_capacity(self.current_bytes + self.lines.len() * 10);
        if self.dropped_lines > 0 {
            out.push_str(&format!("[... {} earlier lines dropped]\n", self.dropped_lines));
        }
        for line in &self.lines {
            if line.stream == Stream::Stderr {
                out.push_str("[stderr] ");
            }
            out.push_str(&line.text);
            out.push('\n');
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_evicts_oldest_lines_first() {
        let mut tail = OutputTail::new(10);
        tail.push(Stream::Stdout, "aaaa");
        tail.push(Stream::Stdout, "bbbb");
        assert_eq!(tail.bytes(), 8);

        tail.push(Stream::Stderr, "cccc");
        assert_eq!(tail.len(), 2);
        assert_eq!(tail.bytes(), 8);
        assert_eq!(tail.dropped_lines(), 1);

        let rendered = tail.render();
        assert!(!rendered.contains("aaaa"));
        assert!(rendered.contains("bbbb\n"));
        assert!(rendered.contains("[stderr] cccc"));
        assert!(rendered.starts_with("[... 1 earlier lines dropped]"));
    }

    #[test]
    fn test_oversized_line_is_truncated() {
        let mut tail = OutputTail::new(4);
        tail.push(Stream::Stdout, "xx");
        tail.push(Stream::Stdout, "0123456789");
        assert_eq!(tail.len(), 1);
        assert_eq!(tail.bytes(), 4);
        assert!(tail.render().contains("0123"));
    }

    #[test]
    fn test_find_capture() {
        let mut tail = OutputTail::new(1024);
        tail.push(Stream::Stdout, "TCP Address: 127.0.0.1:7070");
        tail.push(Stream::Stdout, "I2P Public ID: xyz.b32.i2p");

        let id = Regex::new(r"I2P Public ID: (\S+)").unwrap();
        assert_eq!(tail.find_capture(&id).as_deref(), Some("xyz.b32.i2p"));

        let whole = Regex::new(r"TCP Address").unwrap();
        assert_eq!(tail.find_capture(&whole).as_deref(), Some("TCP Address"));

        let missing = Regex::new(r"obfs4").unwrap();
        assert!(tail.find_capture(&missing).is_none());
    }
}
