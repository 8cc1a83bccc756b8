use regex::Regex;
use std::sync::LazyLock;

// Matches "  45% 12 + docs/file.txt" and bare " 45%"
static PERCENT_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*(\d{1,3})%").expect("valid progress pattern"));

/// Turns archiver output lines into a deduplicated, strictly increasing
/// sequence of percentages.
#[derive(Debug, Default)]
pub struct ProgressParser {
    last: Option<u8>,
}

impl ProgressParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a percentage only when the line carries one that is larger
    /// than everything seen so far.
    pub fn feed(&mut self, line: &str) -> Option<u8> {
        let caps = PERCENT_PATTERN.captures(line)?;
        let percentage: u8 = caps.get(1)?.as_str().parse().ok()?;

        if percentage > 100 {
            return None;
        }

        match self.last {
            Some(last) if percentage <= last => None,
            _ => {
                self.last = Some(percentage);
                Some(percentage)
            }
        }
    }

    pub fn last(&self) -> Option<u8> {
        self.last
    }
}

/// Splits a byte stream on `\n`, `\r` and backspace, which 7z uses to
/// redraw its progress line in place.
#[derive(Debug, Default)]
pub struct LineSplitter {
    buffer: Vec<u8>,
}

impl LineSplitter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        let mut lines = Vec::new();

        for &b in bytes {
            if b == b'\n' || b == b'\r' || b == 0x08 {
                if !self.buffer.is_empty() {
                    lines.push(String::from_utf8_lossy(&self.buffer).into_owned());
                    self.buffer.clear();
                }
            } else {
                self.buffer.push(b);
            }
        }

        lines
    }

    /// Whatever remains after the stream ended without a terminator.
    pub fn finish(&mut self) -> Option<String> {
        if self.buffer.is_empty() {
            return None;
        }
        let line = String::from_utf8_lossy(&self.buffer).into_owned();
        self.buffer.clear();
        Some(line)
    }
}
