//! Output handling and buffering for service logs.
//!
//! This module provides the bounded, append-only `LogBuffer` each service owns and the
//! `Cursor` subscribers use to remember how far into a buffer they have read. It also
//! handles text sanitization for captured output.

use std::collections::VecDeque;

use strip_ansi_escapes::strip;

/// Number of lines a service keeps so a late subscriber still sees some history.
pub const DEFAULT_HISTORY_LIMIT: usize = 200;

/// Indicates the source stream of a captured line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    /// Standard Output.
    Stdout,
    /// Standard Error.
    Stderr,
}

/// A subscriber's position within a `LogBuffer`.
///
/// A cursor names the last entry already delivered, or nothing at all ("undelivered"),
/// in which case the next read starts at the oldest retained entry. Entries are numbered
/// with a sequence that only ever grows, so a cursor stays meaningful after the entry it
/// names has been evicted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Cursor(Option<u64>);

impl Cursor {
    /// A cursor that has not delivered anything yet.
    pub const UNDELIVERED: Cursor = Cursor(None);

    /// Returns `true` if nothing has been delivered through this cursor.
    pub fn is_undelivered(&self) -> bool {
        self.0.is_none()
    }
}

/// A fixed-capacity, append-only log of lines.
///
/// Appending past the capacity evicts the oldest line. Readers never hold references into
/// the buffer between reads; they keep a `Cursor` and ask for everything after it.
#[derive(Debug, Clone)]
pub struct LogBuffer {
    max_lines: usize,
    lines: VecDeque<String>,
    /// Sequence number of `lines[0]`.
    first_seq: u64,
}

impl LogBuffer {
    /// Creates a new `LogBuffer` with the specified maximum capacity.
    pub fn new(max_lines: usize) -> Self {
        let max_lines = max_lines.max(1);
        Self {
            max_lines,
            lines: VecDeque::with_capacity(max_lines.min(1024)),
            first_seq: 0,
        }
    }

    /// Adds a line to the buffer.
    ///
    /// Returns `true` if an old line was dropped to make room.
    pub fn append(&mut self, line: impl Into<String>) -> bool {
        let mut dropped = false;
        self.lines.push_back(line.into());
        while self.lines.len() > self.max_lines {
            self.lines.pop_front();
            self.first_seq += 1;
            dropped = true;
        }
        dropped
    }

    /// Returns every retained line after `cursor`, plus the cursor to use next time.
    ///
    /// An undelivered cursor reads from the oldest retained line. A cursor that fell behind
    /// the retention window is clamped forward to the oldest retained line. If there is
    /// nothing new the returned cursor equals the one passed in.
    pub fn read_from(&self, cursor: Cursor) -> (impl Iterator<Item = &str> + '_, Cursor) {
        let start = match cursor.0 {
            None => self.first_seq,
            Some(last) => last.saturating_add(1).max(self.first_seq),
        };
        let offset = usize::try_from(start - self.first_seq)
            .unwrap_or(usize::MAX)
            .min(self.lines.len());
        let next = if offset < self.lines.len() {
            Cursor(Some(self.next_seq() - 1))
        } else {
            cursor
        };
        (self.lines.range(offset..).map(String::as_str), next)
    }

    /// Drops every retained line. Sequence numbers keep growing, so stale cursors never
    /// alias lines appended afterwards.
    pub fn clear(&mut self) {
        self.first_seq = self.next_seq();
        self.lines.clear();
    }

    /// Returns the number of lines currently in the buffer.
    pub fn len(&self) -> usize {
        self.lines.len()
    }

    /// Returns `true` if the buffer holds no lines.
    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    /// Returns an iterator over the lines in the buffer, oldest first.
    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.lines.iter().map(String::as_str)
    }

    fn next_seq(&self) -> u64 {
        self.first_seq + self.lines.len() as u64
    }
}

impl Default for LogBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY_LIMIT)
    }
}

/// Sanitizes text for display, optionally stripping ANSI escape codes.
///
/// If `strip_ansi` is true, ANSI codes are removed. Invalid UTF-8 sequences are replaced.
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

    fn read_all(buffer: &LogBuffer, cursor: Cursor) -> (Vec<String>, Cursor) {
        let (lines, next) = buffer.read_from(cursor);
        (lines.map(str::to_string).collect(), next)
    }

    #[test]
    fn log_buffer_retains_most_recent_lines() {
        for appended in [0usize, 1, 3, 5, 12] {
            let mut buffer = LogBuffer::new(5);
            for i in 0..appended {
                buffer.append(format!("line {i}"));
            }
            assert_eq!(buffer.len(), appended.min(5));
            let expected = (appended.saturating_sub(5)..appended)
                .map(|i| format!("line {i}"))
                .collect::<Vec<_>>();
            assert_eq!(buffer.iter().map(str::to_string).collect::<Vec<_>>(), expected);
        }
    }

    #[test]
    fn append_reports_dropped_lines() {
        let mut buffer = LogBuffer::new(2);
        assert!(!buffer.append("a"));
        assert!(!buffer.append("b"));
        assert!(buffer.append("c"));
        assert_eq!(buffer.iter().collect::<Vec<_>>(), vec!["b", "c"]);
    }

    #[test]
    fn undelivered_cursor_reads_from_root() {
        let mut buffer = LogBuffer::new(10);
        let (lines, cursor) = read_all(&buffer, Cursor::UNDELIVERED);
        assert!(lines.is_empty());
        assert!(cursor.is_undelivered());

        buffer.append("first");
        buffer.append("second");
        let (lines, cursor) = read_all(&buffer, Cursor::UNDELIVERED);
        assert_eq!(lines, vec!["first", "second"]);
        assert!(!cursor.is_undelivered());
    }

    #[test]
    fn cursor_reads_only_new_lines_once() {
        let mut buffer = LogBuffer::new(10);
        buffer.append("a");
        let (_, cursor) = read_all(&buffer, Cursor::UNDELIVERED);

        buffer.append("b");
        buffer.append("c");
        buffer.append("d");
        let (lines, cursor) = read_all(&buffer, cursor);
        assert_eq!(lines, vec!["b", "c", "d"]);

        let (lines, again) = read_all(&buffer, cursor);
        assert!(lines.is_empty());
        assert_eq!(again, cursor);
    }

    #[test]
    fn lagging_cursor_is_clamped_to_retained_window() {
        let mut buffer = LogBuffer::new(3);
        buffer.append("old");
        let (_, cursor) = read_all(&buffer, Cursor::UNDELIVERED);

        for i in 0..10 {
            buffer.append(format!("new {i}"));
        }
        let (lines, cursor) = read_all(&buffer, cursor);
        assert_eq!(lines, vec!["new 7", "new 8", "new 9"]);

        buffer.append("tail");
        let (lines, _) = read_all(&buffer, cursor);
        assert_eq!(lines, vec!["tail"]);
    }

    #[test]
    fn clear_keeps_cursors_from_aliasing_new_lines() {
        let mut buffer = LogBuffer::new(5);
        buffer.append("run one");
        let (_, cursor) = read_all(&buffer, Cursor::UNDELIVERED);

        buffer.clear();
        assert!(buffer.is_empty());
        buffer.append("run two");
        let (lines, _) = read_all(&buffer, cursor);
        assert_eq!(lines, vec!["run two"]);
    }

    #[test]
    fn sanitize_strips_ansi_when_requested() {
        let colored = "\u{1b}[31mred\u{1b}[0m";
        assert_eq!(sanitize_text(colored, true), "red");
        assert_eq!(sanitize_text(colored, false), colored);
    }
}
