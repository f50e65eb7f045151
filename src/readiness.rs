//! Readiness detection from process output.
//!
//! A background service is "ready" once the text it has printed to stdout so
//! far matches a pattern. Matching always runs over the cumulative text, so a
//! token split across two reads is still found.

use regex::{Regex, RegexBuilder};

use crate::output::sanitize_text;

/// Pattern used when the caller does not supply one.
pub const DEFAULT_RUNNING_PATTERN: &str =
    "started|successfully|finished|crashed|failed|listening|compiled|ready";

/// Upper bound on the text kept for matching.
const MAX_BUFFER_BYTES: usize = 64 * 1024;

/// How a supervisor decides that its process is ready.
#[derive(Debug, Clone)]
pub enum ReadinessPattern {
    /// Ready as soon as the process has been spawned.
    OnStart,
    /// Ready once cumulative stdout matches the regex.
    Output(Regex),
}

impl ReadinessPattern {
    /// Resolves a user-supplied pattern.
    ///
    /// `None` falls back to `default`; an empty string selects `OnStart`.
    /// Patterns are compiled case-insensitive.
    pub fn resolve(raw: Option<&str>, default: &str) -> Result<Self, regex::Error> {
        match raw {
            None => Self::regex(default),
            Some("") => Ok(Self::OnStart),
            Some(pattern) => Self::regex(pattern),
        }
    }

    pub fn regex(pattern: &str) -> Result<Self, regex::Error> {
        let regex = RegexBuilder::new(pattern).case_insensitive(true).build()?;
        Ok(Self::Output(regex))
    }

    pub fn default_pattern() -> Self {
        Self::regex(DEFAULT_RUNNING_PATTERN).unwrap_or(Self::OnStart)
    }

    pub fn is_on_start(&self) -> bool {
        matches!(self, Self::OnStart)
    }

    pub fn describe(&self) -> String {
        match self {
            Self::OnStart => "<process start>".to_string(),
            Self::Output(regex) => format!("/{}/i", regex.as_str()),
        }
    }
}

/// Accumulates stdout text and tests it against a pattern.
#[derive(Debug)]
pub struct ReadinessMatcher {
    pattern: ReadinessPattern,
    buffer: String,
    // Trailing bytes of a character split across reads.
    pending: Vec<u8>,
    max_bytes: usize,
}

impl ReadinessMatcher {
    pub fn new(pattern: ReadinessPattern) -> Self {
        Self::with_capacity(pattern, MAX_BUFFER_BYTES)
    }

    fn with_capacity(pattern: ReadinessPattern, max_bytes: usize) -> Self {
        Self {
            pattern,
            buffer: String::new(),
            pending: Vec::new(),
            max_bytes,
        }
    }

    /// Tests `cumulative` as a whole.
    pub fn test(&self, cumulative: &str) -> bool {
        match &self.pattern {
            ReadinessPattern::OnStart => true,
            ReadinessPattern::Output(regex) => regex.is_match(cumulative),
        }
    }

    /// Appends a chunk of stdout and tests the accumulated text.
    ///
    /// An incomplete UTF-8 sequence at the end of `chunk` is held back until
    /// the next call completes it.
    pub fn feed(&mut self, chunk: &[u8]) -> bool {
        self.pending.extend_from_slice(chunk);
        let split = incomplete_tail_start(&self.pending);
        let tail = self.pending.split_off(split);
        let bytes = std::mem::replace(&mut self.pending, tail);
        let text = String::from_utf8_lossy(&bytes);
        self.buffer.push_str(&sanitize_text(&text, true));
        self.trim();
        self.test(&self.buffer)
    }

    // Keep only the newest `max_bytes`, cut on a char boundary.
    fn trim(&mut self) {
        if self.buffer.len() <= self.max_bytes {
            return;
        }
        let mut cut = self.buffer.len() - self.max_bytes;
        while !self.buffer.is_char_boundary(cut) {
            cut += 1;
        }
        self.buffer.drain(..cut);
    }
}

// Index where a trailing, not yet complete UTF-8 sequence starts, or
// `bytes.len()` when there is none.
fn incomplete_tail_start(bytes: &[u8]) -> usize {
    let start = bytes.len().saturating_sub(3);
    (start..bytes.len())
        .find(|&i| {
            matches!(
                std::str::from_utf8(&bytes[i..]),
                Err(err) if err.valid_up_to() == 0 && err.error_len().is_none()
            )
        })
        .unwrap_or(bytes.len())
}
