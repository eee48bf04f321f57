//! Scan event callbacks.

use super::FileEntry;
use crate::rules::Match;

/// Receives scan events.
///
/// Every method has a no-op default, so implementors only override what
/// they need.
pub trait ScanObserver {
    /// A file is about to be evaluated against the rules
    fn on_file_start(&mut self, entry: &FileEntry) {
        let _ = entry;
    }

    /// Called once per leaf match (a match whose children all failed)
    fn on_match_rule(&mut self, entry: &FileEntry, matched: &Match) {
        let _ = (entry, matched);
    }

    /// Called once per distinct tag of a file's matches
    fn on_match_tag(&mut self, entry: &FileEntry, tag: &str) {
        let _ = (entry, tag);
    }

    /// A file entry is final: evaluated, skipped as duplicate, or errored
    fn on_file_done(&mut self, entry: &FileEntry) {
        let _ = entry;
    }
}

/// An observer that ignores every event
#[derive(Debug, Default, Clone, Copy)]
pub struct NullObserver;

impl ScanObserver for NullObserver {}

/// An observer that counts events
#[derive(Debug, Default, Clone)]
pub struct StatsObserver {
    /// Files evaluated against rules
    pub files_evaluated: usize,
    /// Files finished, including duplicates and errored files
    pub files_done: usize,
    /// Leaf matches
    pub rule_matches: usize,
    /// Tag events
    pub tags: usize,
    /// Files finished with errors
    pub files_with_errors: usize,
}

impl ScanObserver for StatsObserver {
    fn on_file_start(&mut self, _entry: &FileEntry) {
        self.files_evaluated += 1;
    }

    fn on_match_rule(&mut self, _entry: &FileEntry, _matched: &Match) {
        self.rule_matches += 1;
    }

    fn on_match_tag(&mut self, _entry: &FileEntry, _tag: &str) {
        self.tags += 1;
    }

    fn on_file_done(&mut self, entry: &FileEntry) {
        self.files_done += 1;
        if entry.has_errors() {
            self.files_with_errors += 1;
        }
    }
}
