//! Line-indexed document model
//!
//! The model is built once per input and shared read-only by every stage,
//! so two artifacts that cite the same line always see the same text.
//!
//! # Line handling
//!
//! - Every CRLF, CR, or LF ends a line, so mixed endings number like an editor does
//! - Line numbers are contiguous and 1-based
//! - Each line remembers its own terminator; multi-line ranges rejoin with them
//! - `raw` keeps the line exactly as written (used for exact matching)
//! - `normalized` collapses whitespace runs and trims (used for tolerant matching)

use std::path::Path;

use anyhow::{Context, Result};
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Line separator detected in the source text
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineSeparator {
    Lf,
    CrLf,
    Cr,
}

impl LineSeparator {
    /// Most frequent separator in `text` (LF when there is none or on a tie)
    pub fn detect(text: &str) -> Self {
        let mut counts = [0usize; 3];
        for (_, ending) in split_lines(text) {
            match ending {
                Some(LineSeparator::Lf) => counts[0] += 1,
                Some(LineSeparator::CrLf) => counts[1] += 1,
                Some(LineSeparator::Cr) => counts[2] += 1,
                None => {}
            }
        }
        if counts[1] > counts[0] && counts[1] >= counts[2] {
            LineSeparator::CrLf
        } else if counts[2] > counts[0] && counts[2] > counts[1] {
            LineSeparator::Cr
        } else {
            LineSeparator::Lf
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            LineSeparator::Lf => "\n",
            LineSeparator::CrLf => "\r\n",
            LineSeparator::Cr => "\r",
        }
    }
}

/// A single addressable line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Line {
    /// 1-based line number
    pub number: usize,
    /// Text as written, without the separator
    pub raw: String,
    /// Whitespace-collapsed form of `raw`
    pub normalized: String,
    /// Terminator that ended the line; `None` for an unterminated last line
    pub ending: Option<LineSeparator>,
}

/// Errors from addressing lines
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RangeError {
    #[error("Line range {start}-{end} is out of range for a document of {len} lines")]
    OutOfRange { start: usize, end: usize, len: usize },
}

/// Ordered, 1-based lines of one source document
#[derive(Debug, Clone)]
pub struct DocumentModel {
    source: String,
    separator: LineSeparator,
    lines: Vec<Line>,
    digest: String,
}

impl DocumentModel {
    /// Build a model from raw text. Never fails; empty text has zero lines.
    pub fn build(source: impl Into<String>, text: &str) -> Self {
        let lines = split_lines(text)
            .into_iter()
            .enumerate()
            .map(|(idx, (raw, ending))| Line {
                number: idx + 1,
                raw: raw.to_string(),
                normalized: normalized(raw),
                ending,
            })
            .collect();

        Self {
            source: source.into(),
            separator: LineSeparator::detect(text),
            lines,
            digest: compute_hash(text.as_bytes()),
        }
    }

    /// Read a document from disk and build its model
    pub async fn load(path: &Path) -> Result<Self> {
        let text = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read input document: {}", path.display()))?;
        Ok(Self::build(path.to_string_lossy(), &text))
    }

    /// Identifier the document was built from (usually its path)
    pub fn source(&self) -> &str {
        &self.source
    }

    /// File name component of the source identifier
    pub fn file_name(&self) -> &str {
        Path::new(&self.source)
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or(&self.source)
    }

    pub fn separator(&self) -> LineSeparator {
        self.separator
    }

    pub fn lines(&self) -> &[Line] {
        &self.lines
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    /// `sha256:` digest of the full source text
    pub fn digest(&self) -> &str {
        &self.digest
    }

    /// Get a line by its 1-based number
    pub fn line(&self, number: usize) -> Option<&Line> {
        number.checked_sub(1).and_then(|idx| self.lines.get(idx))
    }

    /// Whether `(start, end)` addresses existing lines in order
    pub fn is_valid_range(&self, start: usize, end: usize) -> bool {
        start >= 1 && start <= end && end <= self.lines.len()
    }

    /// Raw lines `start..=end` exactly as they appear in the source,
    /// joined by the terminator each line ended with
    pub fn line_range_text(&self, start: usize, end: usize) -> Result<String, RangeError> {
        let lines = self.range(start, end)?;
        let mut text = String::new();
        for (idx, line) in lines.iter().enumerate() {
            if idx > 0 {
                let previous = &lines[idx - 1];
                text.push_str(previous.ending.unwrap_or(self.separator).as_str());
            }
            text.push_str(&line.raw);
        }
        Ok(text)
    }

    /// Normalized form of `line_range_text(start, end)`
    pub fn normalized_range_text(&self, start: usize, end: usize) -> Result<String, RangeError> {
        let lines = self.range(start, end)?;
        Ok(lines
            .iter()
            .map(|l| l.normalized.as_str())
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>()
            .join(" "))
    }

    /// Render every line as `N: text` for prompts that must cite line numbers
    pub fn numbered_text(&self) -> String {
        self.lines
            .iter()
            .map(|l| format!("{}: {}", l.number, l.raw))
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Whether an evidence `input_file` refers to this document
    pub fn is_source(&self, input_file: &str) -> bool {
        let input_file = input_file.trim();
        if input_file.is_empty() {
            return false;
        }
        if input_file == self.source {
            return true;
        }
        let claimed = Path::new(input_file)
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or(input_file);
        claimed == self.file_name()
    }

    /// Lines `start..=end`, or an error when the range is not addressable
    pub fn range(&self, start: usize, end: usize) -> Result<&[Line], RangeError> {
        if !self.is_valid_range(start, end) {
            return Err(RangeError::OutOfRange {
                start,
                end,
                len: self.lines.len(),
            });
        }
        Ok(&self.lines[start - 1..end])
    }
}

/// Split `text` into lines, ending each at the first CRLF, CR, or LF.
/// A trailing terminator closes the last line rather than opening a new one.
fn split_lines(text: &str) -> Vec<(&str, Option<LineSeparator>)> {
    let bytes = text.as_bytes();
    let mut lines = Vec::new();
    let mut start = 0;
    let mut idx = 0;

    while idx < bytes.len() {
        let ending = match bytes[idx] {
            b'\n' => Some((LineSeparator::Lf, 1)),
            b'\r' if bytes.get(idx + 1) == Some(&b'\n') => Some((LineSeparator::CrLf, 2)),
            b'\r' => Some((LineSeparator::Cr, 1)),
            _ => None,
        };
        match ending {
            Some((separator, width)) => {
                lines.push((&text[start..idx], Some(separator)));
                idx += width;
                start = idx;
            }
            None => idx += 1,
        }
    }
    if start < bytes.len() {
        lines.push((&text[start..], None));
    }
    lines
}

/// Collapse every whitespace run (including line breaks) to one space and trim.
/// Case is preserved.
pub fn normalized(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Compute SHA256 hash of a byte slice, returning hex string with prefix
pub fn compute_hash(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("sha256:{}", hex::encode(hasher.finalize()))
}
