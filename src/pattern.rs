//! # Pattern
//!
//! Wildcarded byte patterns and the compare primitive used by every scan
//! mode.
//!
//! The textual form is a sequence of whitespace-separated tokens, each
//! either a two-digit hex byte (case-insensitive) or `?`/`??` for a byte
//! that matches anything:
//!
//! ```
//! use hookscan::Pattern;
//!
//! let pattern: Pattern = "48 89 5C 24 ?? 57".parse().unwrap();
//! assert!(pattern.matches(&[0x48, 0x89, 0x5C, 0x24, 0xFF, 0x57]));
//! assert!(!pattern.matches(&[0x48, 0x89, 0x5C, 0x24, 0xFF, 0x58]));
//! ```
//!
//! Parsing is purely syntactic and independent of scanning.

use std::fmt;
use std::str::FromStr;

use thiserror::Error;

/// Errors raised while parsing a textual pattern.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PatternError {
    /// A token was neither a wildcard nor a two-digit hex byte.
    #[error("invalid pattern token `{0}`")]
    InvalidToken(String),
}

/// A byte pattern where each position is either an exact byte or a wildcard.
#[derive(Clone, PartialEq, Eq)]
pub struct Pattern {
    /// One entry per byte position; `None` matches any byte.
    tokens: Vec<Option<u8>>,
}

impl Pattern {
    /// Parses the textual token form. An empty string yields an empty
    /// pattern, which is legal and matches nothing.
    pub fn parse(text: &str) -> Result<Self, PatternError> {
        let mut tokens = Vec::new();
        for token in text.split_whitespace() {
            if token == "?" || token == "??" {
                tokens.push(None);
            } else if token.len() == 2 && token.chars().all(|c| c.is_ascii_hexdigit()) {
                // from_str_radix also accepts `+7f`; the explicit digit check
                // above keeps the accepted grammar to plain hex pairs.
                tokens.push(Some(u8::from_str_radix(token, 16).unwrap()));
            } else {
                return Err(PatternError::InvalidToken(token.to_string()));
            }
        }
        Ok(Self { tokens })
    }

    /// Builds an exact pattern (no wildcards) from raw bytes.
    pub fn from_bytes(bytes: &[u8]) -> Self {
        Self {
            tokens: bytes.iter().copied().map(Some).collect(),
        }
    }

    /// Number of byte positions in the pattern.
    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    /// Whether the pattern has no positions.
    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    /// The raw token sequence.
    pub fn tokens(&self) -> &[Option<u8>] {
        &self.tokens
    }

    /// Compares the pattern against the start of `window`. Returns `false`
    /// when the window is shorter than the pattern. An empty pattern never
    /// matches; absence of constraints is not treated as a hit.
    pub fn matches(&self, window: &[u8]) -> bool {
        if self.tokens.is_empty() || window.len() < self.tokens.len() {
            return false;
        }
        self.tokens
            .iter()
            .zip(window)
            .all(|(token, byte)| token.map_or(true, |expected| expected == *byte))
    }

    /// Offset of the first match within `haystack`, if any.
    pub fn find_in(&self, haystack: &[u8]) -> Option<usize> {
        if self.tokens.is_empty() || haystack.len() < self.tokens.len() {
            return None;
        }
        (0..=haystack.len() - self.tokens.len()).find(|&offset| self.matches(&haystack[offset..]))
    }

    /// Offsets of every match within `haystack`, including overlapping ones.
    pub fn find_all_in(&self, haystack: &[u8]) -> Vec<usize> {
        if self.tokens.is_empty() || haystack.len() < self.tokens.len() {
            return Vec::new();
        }
        (0..=haystack.len() - self.tokens.len())
            .filter(|&offset| self.matches(&haystack[offset..]))
            .collect()
    }

    /// Derives the pattern common to several equal-length byte windows:
    /// positions where all windows agree become exact bytes, the rest become
    /// wildcards. Useful for turning a handful of matched sites into a
    /// signature that survives small build-to-build changes.
    ///
    /// Returns an empty pattern when `windows` is empty.
    pub fn common(windows: &[&[u8]]) -> Self {
        let Some(first) = windows.first() else {
            return Self { tokens: Vec::new() };
        };
        let len = windows.iter().map(|w| w.len()).min().unwrap_or(first.len());
        let tokens = (0..len)
            .map(|i| {
                let byte = first[i];
                windows[1..]
                    .iter()
                    .all(|w| w[i] == byte)
                    .then_some(byte)
            })
            .collect();
        Self { tokens }
    }
}

impl FromStr for Pattern {
    type Err = PatternError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for Pattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, token) in self.tokens.iter().enumerate() {
            if i > 0 {
                f.write_str(" ")?;
            }
            match token {
                Some(byte) => write!(f, "{byte:02X}")?,
                None => f.write_str("??")?,
            }
        }
        Ok(())
    }
}

impl fmt::Debug for Pattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Pattern({self})")
    }
}
