//! Recursive scan orchestration.
//!
//! The [`Scanner`] drives a closed [`RuleSet`] over a set of input paths:
//!
//! 1. Pop the most recently queued path from a LIFO worklist; directories
//!    are expanded into their entries, symlinks are rejected unless
//!    configured otherwise.
//! 2. Reject files nested deeper than [`ScanConfig::max_depth`].
//! 3. Hash the content; a file identical to one already seen is marked as
//!    its duplicate and not evaluated again.
//! 4. Evaluate every top-level rule, pass by pass in ascending order, with
//!    a fresh per-file [`Environment`].
//! 5. Collect tags and notify the [`ScanObserver`], then queue every file
//!    the actions created as a child at depth + 1.
//!
//! Because the worklist is LIFO, extracted files are scanned before
//! siblings queued earlier, giving a depth-first walk of the extraction
//! tree.

mod entry;
mod observer;
mod output;

pub use entry::{Diagnostic, FileEntry, FileId};
pub use observer::{NullObserver, ScanObserver, StatsObserver};
pub use output::{sanitize, OutputDir};

use crate::env::{Environment, SeekSource};
use crate::error::{Error, Result};
use crate::operator::OperatorRegistry;
use crate::register::Register;
use crate::rules::{RuleId, RuleSet};
use crate::value::{Number, Primitive, Width};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

/// Configuration for a scan
#[derive(Debug, Clone)]
pub struct ScanConfig {
    /// Deepest nesting level that is still evaluated (inputs are depth 0)
    pub max_depth: usize,
    /// Where actions create files; without it, creating files fails
    pub output_dir: Option<PathBuf>,
    /// Follow symbolic links instead of rejecting them
    pub follow_symlinks: bool,
    /// Return the first internal error instead of recording it
    pub abort_on_internal: bool,
    /// Extra `$` globals visible to every file
    pub globals: Register,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            max_depth: 16,
            output_dir: None,
            follow_symlinks: false,
            abort_on_internal: false,
            globals: Register::new(),
        }
    }
}

impl ScanConfig {
    /// Creates a config with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the maximum nesting depth
    pub fn max_depth(mut self, depth: usize) -> Self {
        self.max_depth = depth;
        self
    }

    /// Sets the output directory for created files
    pub fn output_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.output_dir = Some(dir.into());
        self
    }

    /// Sets whether symlinks are followed
    pub fn follow_symlinks(mut self, follow: bool) -> Self {
        self.follow_symlinks = follow;
        self
    }

    /// Sets whether internal errors abort the scan
    pub fn abort_on_internal(mut self, abort: bool) -> Self {
        self.abort_on_internal = abort;
        self
    }

    /// Adds a global; a `$` is prepended to the key when missing
    pub fn global(mut self, key: &str, value: impl Into<Primitive>) -> Self {
        let key = if key.starts_with('$') {
            key.to_string()
        } else {
            format!("${key}")
        };
        self.globals.set(key, value);
        self
    }
}

/// Outcome of a scan
#[derive(Debug, Default)]
pub struct ScanReport {
    /// Every file entry, in the order files were reached
    pub files: Vec<FileEntry>,
    /// Problems not tied to a file entry (rejected symlinks, unreadable
    /// directories)
    pub warnings: Vec<String>,
}

impl ScanReport {
    /// The entry for `id`
    pub fn file(&self, id: FileId) -> &FileEntry {
        &self.files[id.0]
    }

    /// Finds the entry for a path
    pub fn get(&self, path: &Path) -> Option<&FileEntry> {
        self.files.iter().find(|f| f.path == path)
    }

    /// Entries created from files passed in by the user
    pub fn roots(&self) -> impl Iterator<Item = &FileEntry> {
        self.files.iter().filter(|f| f.parent.is_none())
    }

    /// Entries created by actions running on `id`
    pub fn children(&self, id: FileId) -> impl Iterator<Item = &FileEntry> {
        self.files.iter().filter(move |f| f.parent == Some(id))
    }

    /// Whether any file accumulated errors
    pub fn has_errors(&self) -> bool {
        self.files.iter().any(FileEntry::has_errors)
    }

    /// Total number of recorded errors
    pub fn error_count(&self) -> usize {
        self.files.iter().map(|f| f.errors.len()).sum()
    }

    /// Tag to files index
    pub fn tags(&self) -> BTreeMap<&str, Vec<FileId>> {
        let mut index: BTreeMap<&str, Vec<FileId>> = BTreeMap::new();
        for file in &self.files {
            for tag in &file.tags {
                index.entry(tag.as_str()).or_default().push(file.id);
            }
        }
        index
    }
}

/// A path waiting to be scanned
#[derive(Debug)]
struct WorkItem {
    path: PathBuf,
    parent: Option<FileId>,
    depth: usize,
}

/// Mutable state of one scan
struct ScanState {
    report: ScanReport,
    worklist: Vec<WorkItem>,
    seen: HashSet<PathBuf>,
    hashes: HashMap<blake3::Hash, FileId>,
}

impl ScanState {
    /// Queues a path unless it was queued before
    fn enqueue(&mut self, path: PathBuf, parent: Option<FileId>, depth: usize) {
        if self.seen.insert(path.clone()) {
            self.worklist.push(WorkItem {
                path,
                parent,
                depth,
            });
        }
    }

    fn next_id(&self) -> FileId {
        FileId(self.report.files.len())
    }
}

/// Drives a rule set over files
pub struct Scanner<'r> {
    rules: &'r RuleSet,
    operators: &'r OperatorRegistry,
    config: ScanConfig,
}

impl<'r> Scanner<'r> {
    /// Creates a scanner with default configuration
    pub fn new(rules: &'r RuleSet, operators: &'r OperatorRegistry) -> Self {
        Self::with_config(rules, operators, ScanConfig::default())
    }

    /// Creates a scanner with custom configuration
    pub fn with_config(
        rules: &'r RuleSet,
        operators: &'r OperatorRegistry,
        config: ScanConfig,
    ) -> Self {
        Self {
            rules,
            operators,
            config,
        }
    }

    /// The active configuration
    pub fn config(&self) -> &ScanConfig {
        &self.config
    }

    /// Scans `inputs` and everything extracted from them
    pub fn scan<P: AsRef<Path>>(&self, inputs: &[P]) -> Result<ScanReport> {
        self.scan_with(inputs, &mut NullObserver)
    }

    /// Scans `inputs`, reporting events to `observer`.
    ///
    /// Per-file problems are recorded in the report. An error is returned
    /// only when the output directory can't be created, or for internal
    /// errors when [`ScanConfig::abort_on_internal`] is set.
    pub fn scan_with<P: AsRef<Path>>(
        &self,
        inputs: &[P],
        observer: &mut dyn ScanObserver,
    ) -> Result<ScanReport> {
        let mut output = self
            .config
            .output_dir
            .as_ref()
            .map(|dir| OutputDir::new(dir.clone()))
            .transpose()?;
        let passes = self.rules.passes();
        let globals = Arc::new(self.config.globals.clone());

        let mut state = ScanState {
            report: ScanReport::default(),
            worklist: Vec::new(),
            seen: HashSet::new(),
            hashes: HashMap::new(),
        };
        for input in inputs.iter().rev() {
            state.enqueue(input.as_ref().to_path_buf(), None, 0);
        }

        while let Some(item) = state.worklist.pop() {
            let Some(mut entry) = self.stat(&mut state, item) else {
                continue;
            };
            if entry.has_errors() {
                self.commit(&mut state, entry, observer);
                continue;
            }

            if entry.depth > self.config.max_depth {
                let err = Error::DepthExceeded {
                    depth: entry.depth,
                    max: self.config.max_depth,
                };
                warn!(path = %entry.path.display(), "{err}");
                entry.error(None, &err);
                self.commit(&mut state, entry, observer);
                continue;
            }

            match hash_file(&entry.path) {
                Ok(hash) => entry.hash = Some(hash),
                Err(e) => {
                    entry.error(None, &e);
                    self.commit(&mut state, entry, observer);
                    continue;
                }
            }

            if let Some(original) = entry.hash.and_then(|h| state.hashes.get(&h).copied()) {
                self.mark_duplicate(&mut entry, original, &state.report, output.as_ref());
                self.commit(&mut state, entry, observer);
                continue;
            }
            if let Some(hash) = entry.hash {
                state.hashes.insert(hash, entry.id);
            }

            observer.on_file_start(&entry);
            let created = self.evaluate(&mut entry, &passes, &globals, output.as_mut())?;
            self.notify_matches(&entry, observer);

            let (id, depth) = (entry.id, entry.depth);
            self.commit(&mut state, entry, observer);
            for path in created.into_iter().rev() {
                state.enqueue(path, Some(id), depth + 1);
            }
        }

        let report = state.report;
        info!(
            files = report.files.len(),
            errors = report.error_count(),
            warnings = report.warnings.len(),
            "scan complete"
        );
        Ok(report)
    }

    /// Resolves a popped path into a file entry.
    ///
    /// Directories are expanded onto the worklist and rejected paths
    /// become warnings; both yield `None`. Unreadable paths yield an entry
    /// carrying the error.
    fn stat(&self, state: &mut ScanState, item: WorkItem) -> Option<FileEntry> {
        let id = state.next_id();
        let mut entry = FileEntry::new(id, item.path, item.parent, item.depth);

        let mut meta = match fs::symlink_metadata(&entry.path) {
            Ok(meta) => meta,
            Err(e) => {
                entry.error(None, &Error::file_read(&entry.path, e));
                return Some(entry);
            }
        };

        if meta.file_type().is_symlink() {
            if !self.config.follow_symlinks {
                let err = Error::SymlinkRejected {
                    path: entry.path.clone(),
                };
                warn!("{err}");
                state.report.warnings.push(err.to_string());
                return None;
            }
            meta = match fs::metadata(&entry.path) {
                Ok(meta) => meta,
                Err(e) => {
                    entry.error(None, &Error::file_read(&entry.path, e));
                    return Some(entry);
                }
            };
        }

        if meta.is_dir() {
            let children: Vec<PathBuf> = WalkDir::new(&entry.path)
                .min_depth(1)
                .max_depth(1)
                .follow_links(false)
                .sort_by_file_name()
                .into_iter()
                .filter_map(|e| match e {
                    Ok(e) => Some(e.into_path()),
                    Err(e) => {
                        state.report.warnings.push(e.to_string());
                        None
                    }
                })
                .collect();
            debug!(path = %entry.path.display(), entries = children.len(), "expanding directory");
            for child in children.into_iter().rev() {
                state.enqueue(child, entry.parent, entry.depth);
            }
            return None;
        }

        if !meta.is_file() {
            state
                .report
                .warnings
                .push(format!("skipping '{}': not a regular file", entry.path.display()));
            return None;
        }

        entry.size = meta.len();
        Some(entry)
    }

    fn mark_duplicate(
        &self,
        entry: &mut FileEntry,
        original: FileId,
        report: &ScanReport,
        output: Option<&OutputDir>,
    ) {
        let original_path = &report.file(original).path;
        debug!(
            path = %entry.path.display(),
            original = %original_path.display(),
            "duplicate content"
        );
        entry.duplicate_of = Some(original);
        if let Some(out) = output.filter(|o| entry.parent.is_some() && o.contains(&entry.path)) {
            if let Err(e) = out.replace_with_reference(&entry.path, original_path) {
                warn!(path = %entry.path.display(), error = %e, "could not replace duplicate");
                entry.error(None, &e);
            }
        }
    }

    /// Runs every pass against one file, returning the paths its actions
    /// created
    fn evaluate(
        &self,
        entry: &mut FileEntry,
        passes: &BTreeMap<i64, Vec<RuleId>>,
        globals: &Arc<Register>,
        output: Option<&mut OutputDir>,
    ) -> Result<Vec<PathBuf>> {
        debug!(path = %entry.path.display(), depth = entry.depth, "scanning");
        let source = match SeekSource::open(&entry.path) {
            Ok(source) => source,
            Err(e) => {
                entry.error(None, &e);
                return Ok(Vec::new());
            }
        };

        let file_globals = file_globals(entry, globals, output.as_deref());
        let mut env =
            Environment::new(self.rules, self.operators, source).with_globals(file_globals);
        if let Some(out) = output {
            env = env.with_output(out);
        }

        for (pass, ids) in passes {
            debug!(pass, rules = ids.len(), "running pass");
            for &id in ids {
                match env.evaluate_rule(id) {
                    Ok(Some(matched)) => entry.matches.push(matched),
                    Ok(None) => {}
                    Err(e) => env.record_rule_failure(Some(id), e),
                }
            }
        }

        let effects = env.finish();
        entry.processed = true;
        entry.logs = effects.logs;
        entry.warnings = effects.warnings;
        for failure in effects.failures {
            if failure.error.is_internal() && self.config.abort_on_internal {
                return Err(failure.error);
            }
            debug!(rule = ?failure.rule, error = %failure.error, "rule failure");
            entry.error(failure.rule, &failure.error);
        }

        let mut tags: Vec<String> = Vec::new();
        for matched in entry.matches.iter().flat_map(|m| m.iter()) {
            for tag in self.rules.rule(matched.rule).tags() {
                if !tags.contains(&tag) {
                    tags.push(tag);
                }
            }
        }
        entry.tags = tags;
        Ok(effects.created)
    }

    fn notify_matches(&self, entry: &FileEntry, observer: &mut dyn ScanObserver) {
        for leaf in entry.leaf_matches() {
            observer.on_match_rule(entry, leaf);
        }
        for tag in &entry.tags {
            observer.on_match_tag(entry, tag);
        }
    }

    fn commit(&self, state: &mut ScanState, entry: FileEntry, observer: &mut dyn ScanObserver) {
        observer.on_file_done(&entry);
        state.report.files.push(entry);
    }
}

/// Builds the `$` register for one file, chained to the configured globals
fn file_globals(entry: &FileEntry, base: &Arc<Register>, output: Option<&OutputDir>) -> Register {
    let path_str = |p: &Path| Primitive::from(p.to_string_lossy().as_ref());
    let mut globals = Register::with_parent(base.clone());
    globals.set("$filename", path_str(&entry.path));
    globals.set("$shortfilename", Primitive::from(entry.short_name().as_str()));
    globals.set(
        "$path",
        path_str(entry.path.parent().unwrap_or_else(|| Path::new(""))),
    );
    globals.set("$filesize", Number::unsigned(entry.size, Width::W8));
    globals.set("$depth", Number::unsigned(entry.depth as u64, Width::W8));
    if let Some(out) = output {
        globals.set("$outdir", path_str(out.root()));
    }
    globals
}

fn hash_file(path: &Path) -> Result<blake3::Hash> {
    let mut file = File::open(path).map_err(|e| Error::file_read(path, e))?;
    let mut hasher = blake3::Hasher::new();
    io::copy(&mut file, &mut hasher).map_err(|e| Error::file_read(path, e))?;
    Ok(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_config_builder() {
        let config = ScanConfig::new()
            .max_depth(3)
            .output_dir("/tmp/out")
            .follow_symlinks(true)
            .abort_on_internal(true)
            .global("arch", "arm")
            .global("$mode", true);
        assert_eq!(config.max_depth, 3);
        assert_eq!(config.output_dir, Some(PathBuf::from("/tmp/out")));
        assert!(config.follow_symlinks && config.abort_on_internal);
        assert!(config.globals.get_string("$arch").is_some());
        assert_eq!(config.globals.get_bool("$mode"), Some(true));
    }

    #[test]
    fn test_file_globals() {
        let entry = {
            let mut e = FileEntry::new(FileId(0), PathBuf::from("/data/fw/boot.img"), None, 1);
            e.size = 42;
            e
        };
        let base = Arc::new(Register::new());
        let globals = file_globals(&entry, &base, None);
        assert_eq!(
            globals.get_string("$shortfilename").map(|b| b.as_ref()),
            Some(&b"boot.img"[..])
        );
        assert_eq!(
            globals.get_string("$path").map(|b| b.as_ref()),
            Some(&b"/data/fw"[..])
        );
        assert_eq!(globals.get_number("$filesize").map(|n| n.get()), Some(42));
        assert!(globals.get("$outdir").is_none());
    }

    #[test]
    fn test_directories_expand_in_name_order() {
        let dir = TempDir::new().unwrap();
        for name in ["b.bin", "a.bin", "c.bin"] {
            fs::write(dir.path().join(name), name).unwrap();
        }
        let rules = RuleSet::default();
        let operators = OperatorRegistry::new();
        let report = Scanner::new(&rules, &operators).scan(&[dir.path()]).unwrap();
        let names: Vec<_> = report.files.iter().map(FileEntry::short_name).collect();
        assert_eq!(names, vec!["a.bin", "b.bin", "c.bin"]);
        assert!(report.files.iter().all(|f| f.depth == 0 && f.processed));
    }

    #[test]
    fn test_missing_input_is_an_error() {
        let dir = TempDir::new().unwrap();
        let rules = RuleSet::default();
        let operators = OperatorRegistry::new();
        let report = Scanner::new(&rules, &operators)
            .scan(&[dir.path().join("missing")])
            .unwrap();
        assert!(report.has_errors());
        assert!(!report.files[0].processed);
    }

    #[test]
    fn test_same_path_scanned_once() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("a.bin");
        fs::write(&file, b"x").unwrap();
        let rules = RuleSet::default();
        let operators = OperatorRegistry::new();
        let report = Scanner::new(&rules, &operators)
            .scan(&[file.clone(), file])
            .unwrap();
        assert_eq!(report.files.len(), 1);
    }

    #[cfg(unix)]
    #[test]
    fn test_symlinks_rejected_by_default() {
        let dir = TempDir::new().unwrap();
        let target = dir.path().join("target.bin");
        fs::write(&target, b"x").unwrap();
        let link = dir.path().join("link.bin");
        std::os::unix::fs::symlink(&target, &link).unwrap();

        let rules = RuleSet::default();
        let operators = OperatorRegistry::new();
        let report = Scanner::new(&rules, &operators).scan(&[&link]).unwrap();
        assert!(report.files.is_empty());
        assert_eq!(report.warnings.len(), 1);

        let config = ScanConfig::new().follow_symlinks(true);
        let report = Scanner::with_config(&rules, &operators, config)
            .scan(&[&link])
            .unwrap();
        assert_eq!(report.files.len(), 1);
        assert!(report.files[0].processed);
    }
}
