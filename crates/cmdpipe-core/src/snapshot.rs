//! Bounded stderr snapshot.
//!
//! [`ErrorRecorder`] consumes an arbitrary amount of output and keeps only
//! what is useful in an error report: the first few non-blank lines, a
//! sliding window of the last few, each cut to a fixed width.

use std::collections::VecDeque;
use std::fmt;

use crate::config::SnapshotConfig;

/// Collects a head/tail summary of line-oriented output.
#[derive(Debug, Clone)]
pub struct ErrorRecorder {
    line_width: usize,
    head_limit: usize,
    tail_limit: usize,
    head: Vec<String>,
    tail: VecDeque<String>,
    /// Raw bytes of the line being assembled, capped so one endless line
    /// cannot grow without bound.
    current: Vec<u8>,
}

impl ErrorRecorder {
    pub fn new(line_width: usize, head_lines: usize, tail_lines: usize) -> Self {
        Self {
            line_width,
            head_limit: head_lines,
            tail_limit: tail_lines,
            head: Vec::with_capacity(head_lines),
            tail: VecDeque::with_capacity(tail_lines),
            current: Vec::new(),
        }
    }

    pub fn from_config(config: &SnapshotConfig) -> Self {
        Self::new(config.line_width, config.head_lines, config.tail_lines)
    }

    /// Feed a chunk of output. Chunks may split lines and UTF-8 sequences
    /// anywhere.
    pub fn record(&mut self, chunk: &[u8]) {
        // 4 bytes per char is enough to hold `line_width` characters.
        let byte_cap = self.line_width.saturating_mul(4);
        for &byte in chunk {
            match byte {
                b'\n' => self.commit(),
                b'\r' => {}
                _ if self.current.len() < byte_cap => self.current.push(byte),
                _ => {}
            }
        }
    }

    /// Flush a trailing line that was not newline-terminated.
    pub fn finish(&mut self) {
        if !self.current.is_empty() {
            self.commit();
        }
    }

    pub fn is_empty(&self) -> bool {
        self.head.is_empty() && self.tail.is_empty()
    }

    fn commit(&mut self) {
        let raw = std::mem::take(&mut self.current);
        let line: String = String::from_utf8_lossy(&raw)
            .chars()
            .take(self.line_width)
            .collect();
        if line.trim().is_empty() {
            return;
        }
        if self.head.len() < self.head_limit {
            self.head.push(line);
            return;
        }
        if self.tail_limit == 0 {
            return;
        }
        if self.tail.len() >= self.tail_limit {
            self.tail.pop_front();
        }
        self.tail.push_back(line);
    }
}

impl Default for ErrorRecorder {
    fn default() -> Self {
        Self::from_config(&SnapshotConfig::default())
    }
}

impl fmt::Display for ErrorRecorder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut lines: Vec<&str> = self.head.iter().map(String::as_str).collect();
        if !self.tail.is_empty() {
            lines.push("...");
            lines.extend(self.tail.iter().map(String::as_str));
        }
        f.write_str(&lines.join("\n"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn recorded(text: &str) -> String {
        let mut recorder = ErrorRecorder::default();
        recorder.record(text.as_bytes());
        recorder.finish();
        recorder.to_string()
    }

    #[test]
    fn short_output_is_kept_whole() {
        assert_eq!(recorded("foo\nbar\n"), "foo\nbar");
    }

    #[test]
    fn blank_lines_and_carriage_returns_are_dropped() {
        assert_eq!(recorded("a\r\n\n   \nb"), "a\nb");
    }

    #[test]
    fn long_lines_are_cut_to_width() {
        let long = "x".repeat(200);
        let out = recorded(&long);
        assert_eq!(out.chars().count(), 80);
    }

    #[test]
    fn head_and_tail_with_ellipsis() {
        let text = (1..=12).map(|i| format!("line {i}")).collect::<Vec<_>>().join("\n");
        let out = recorded(&text);
        assert_eq!(
            out,
            "line 1\nline 2\nline 3\nline 4\n...\nline 9\nline 10\nline 11\nline 12"
        );
    }

    #[test]
    fn multibyte_characters_survive_chunk_splits() {
        let text = "果てなく続いていく\n生きとし生けるもの\n";
        let bytes = text.as_bytes();
        let mut recorder = ErrorRecorder::default();
        for chunk in bytes.chunks(5) {
            recorder.record(chunk);
        }
        recorder.finish();
        assert_eq!(recorder.to_string(), "果てなく続いていく\n生きとし生けるもの");
    }

    #[test]
    fn width_counts_characters_not_bytes() {
        let mut recorder = ErrorRecorder::new(3, 4, 4);
        recorder.record("抗うことの\n".as_bytes());
        recorder.finish();
        assert_eq!(recorder.to_string(), "抗うこ");
    }
}
