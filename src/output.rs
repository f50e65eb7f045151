//! Output capture for supervised tasks.
//!
//! Processes hand us raw byte chunks that do not line up with line breaks.
//! `OutputCapture` splits them into lines per stream and keeps the most recent
//! lines in a fixed-capacity `LineBuffer`, which is what ends up in a
//! `TaskResult`.

use std::collections::VecDeque;

use strip_ansi_escapes::strip;

/// Indicates the source stream of a chunk of output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    /// Standard Output.
    Stdout,
    /// Standard Error.
    Stderr,
}

/// A fixed-capacity ring buffer of text lines.
#[derive(Debug, Clone)]
pub struct LineBuffer {
    max_lines: usize,
    lines: VecDeque<String>,
}

impl LineBuffer {
    /// Creates a new `LineBuffer` with the specified maximum capacity.
    pub fn new(max_lines: usize) -> Self {
        Self {
            max_lines,
            lines: VecDeque::with_capacity(max_lines.min(1024)),
        }
    }

    /// Adds a line to the buffer.
    ///
    /// Returns `true` if an old line was dropped to make room.
    pub fn push(&mut self, line: String) -> bool {
        let mut dropped = false;
        self.lines.push_back(line);
        while self.lines.len() > self.max_lines {
            self.lines.pop_front();
            dropped = true;
        }
        dropped
    }

    /// Returns the number of lines currently in the buffer.
    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn into_vec(self) -> Vec<String> {
        self.lines.into()
    }
}

/// Splits one stream's chunks into lines, holding back the unterminated tail.
#[derive(Debug, Clone)]
struct LineSplitter {
    partial: Vec<u8>,
    lines: LineBuffer,
}

impl LineSplitter {
    fn new(max_lines: usize) -> Self {
        Self {
            partial: Vec::new(),
            lines: LineBuffer::new(max_lines),
        }
    }

    fn push(&mut self, data: &[u8]) {
        for byte in data {
            if *byte == b'\n' {
                let raw = std::mem::take(&mut self.partial);
                self.lines.push(decode_line(&raw));
            } else {
                self.partial.push(*byte);
            }
        }
    }

    fn finish(mut self) -> Vec<String> {
        if !self.partial.is_empty() {
            let raw = std::mem::take(&mut self.partial);
            self.lines.push(decode_line(&raw));
        }
        self.lines.into_vec()
    }
}

fn decode_line(raw: &[u8]) -> String {
    let raw = raw.strip_suffix(b"\r").unwrap_or(raw);
    String::from_utf8_lossy(raw).into_owned()
}

/// In-memory copy of a task's stdout and stderr, split into lines.
#[derive(Debug, Clone)]
pub struct OutputCapture {
    stdout: LineSplitter,
    stderr: LineSplitter,
}

impl OutputCapture {
    pub fn new(max_lines: usize) -> Self {
        Self {
            stdout: LineSplitter::new(max_lines),
            stderr: LineSplitter::new(max_lines),
        }
    }

    pub fn push(&mut self, stream: StreamKind, data: &[u8]) {
        match stream {
            StreamKind::Stdout => self.stdout.push(data),
            StreamKind::Stderr => self.stderr.push(data),
        }
    }

    /// Flushes unterminated lines and returns `(stdout, stderr)`.
    pub fn finish(self) -> (Vec<String>, Vec<String>) {
        (self.stdout.finish(), self.stderr.finish())
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
