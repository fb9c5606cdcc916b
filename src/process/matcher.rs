//! Readiness detection on process output
//!
//! Output is matched one complete line at a time. A marker split across two
//! writes still arrives as one line, but a marker spanning a newline is never
//! recognized; processes are expected to print their marker on one line.

use std::time::Instant;

use regex::Regex;

/// The first line that matched a readiness pattern
#[derive(Debug, Clone)]
pub struct ReadyEvent {
    /// The matching line, without its terminator
    pub line: String,
    /// Capture groups of the match; index 0 is the whole match
    pub captures: Vec<Option<String>>,
    /// When the line was observed
    pub at: Instant,
}

impl ReadyEvent {
    /// Capture group `i` of the match, if it participated
    pub fn capture(&self, i: usize) -> Option<&str> {
        self.captures.get(i).and_then(|c| c.as_deref())
    }
}

/// Watches lines for a pattern and fires once
#[derive(Debug)]
pub struct ReadinessMatcher {
    pattern: Regex,
    fired: bool,
}

impl ReadinessMatcher {
    pub fn new(pattern: Regex) -> Self {
        Self {
            pattern,
            fired: false,
        }
    }

    /// Feed one line; returns the event the first time the pattern matches
    pub fn feed(&mut self, line: &str) -> Option<ReadyEvent> {
        if self.fired {
            return None;
        }

        let caps = self.pattern.captures(line)?;
        self.fired = true;

        Some(ReadyEvent {
            line: line.to_string(),
            captures: caps
                .iter()
                .map(|m| m.map(|m| m.as_str().to_string()))
                .collect(),
            at: Instant::now(),
        })
    }

    pub fn has_fired(&self) -> bool {
        self.fired
    }
}
