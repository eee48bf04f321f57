//! Per-file scan records.

use crate::rules::Match;
use std::fmt;
use std::path::{Path, PathBuf};

/// Index of a file inside a [`ScanReport`](super::ScanReport)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FileId(pub(crate) usize);

impl FileId {
    /// Position in the report's file list
    pub fn index(self) -> usize {
        self.0
    }
}

impl fmt::Display for FileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// An error recorded against a file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Diagnostic {
    /// Rule being evaluated when the error happened
    pub rule: Option<String>,
    /// Error text
    pub message: String,
    /// Whether the error was an internal invariant violation
    pub internal: bool,
}

impl Diagnostic {
    pub(crate) fn new(rule: Option<String>, error: &crate::Error) -> Self {
        Self {
            rule,
            message: error.to_string(),
            internal: error.is_internal(),
        }
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(rule) = &self.rule {
            write!(f, "[{rule}] ")?;
        }
        f.write_str(&self.message)
    }
}

/// Everything known about one scanned file
#[derive(Debug, Clone)]
pub struct FileEntry {
    /// Identifier within the report
    pub id: FileId,
    /// Path on disk
    pub path: PathBuf,
    /// Size in bytes
    pub size: u64,
    /// File whose rules created this one; `None` for user inputs
    pub parent: Option<FileId>,
    /// Nesting depth; user inputs are at depth 0
    pub depth: usize,
    /// BLAKE3 hash of the content
    pub hash: Option<blake3::Hash>,
    /// Earlier file with identical content
    pub duplicate_of: Option<FileId>,
    /// Top-level rule matches, in evaluation order
    pub matches: Vec<Match>,
    /// Distinct tags of all matched rules
    pub tags: Vec<String>,
    /// Errors recorded while handling the file
    pub errors: Vec<Diagnostic>,
    /// Warnings emitted by rules
    pub warnings: Vec<String>,
    /// Messages logged by rules
    pub logs: Vec<String>,
    /// Whether rules were evaluated against the file
    pub processed: bool,
}

impl FileEntry {
    pub(crate) fn new(id: FileId, path: PathBuf, parent: Option<FileId>, depth: usize) -> Self {
        Self {
            id,
            path,
            size: 0,
            parent,
            depth,
            hash: None,
            duplicate_of: None,
            matches: Vec::new(),
            tags: Vec::new(),
            errors: Vec::new(),
            warnings: Vec::new(),
            logs: Vec::new(),
            processed: false,
        }
    }

    /// File name without directories
    pub fn short_name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.path.display().to_string())
    }

    /// Path on disk
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether the content duplicates an earlier file
    pub fn is_duplicate(&self) -> bool {
        self.duplicate_of.is_some()
    }

    /// Whether any error was recorded
    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }

    /// Whether a match of rule `id` exists anywhere in the match trees
    pub fn matched(&self, id: &str) -> bool {
        self.matches.iter().any(|m| m.find(id).is_some())
    }

    /// Matches without matched children across all match trees
    pub fn leaf_matches(&self) -> Vec<&Match> {
        self.matches.iter().flat_map(Match::leaves).collect()
    }

    pub(crate) fn error(&mut self, rule: Option<String>, error: &crate::Error) {
        self.errors.push(Diagnostic::new(rule, error));
    }
}
