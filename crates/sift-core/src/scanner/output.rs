//! Output directory for files created by rule actions.

use crate::error::{Error, Result};
use std::collections::HashSet;
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};

/// Longest sanitized name, before any de-duplication suffix
const MAX_NAME_LEN: usize = 200;

/// Replaces everything outside `[A-Za-z0-9._-]` with `_`.
///
/// A leading `.` also becomes `_`, so names can neither be hidden nor
/// climb out of the output directory. Empty names become `unnamed`.
pub fn sanitize(name: &str) -> String {
    let mut clean: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .take(MAX_NAME_LEN)
        .collect();
    if clean.starts_with('.') {
        clean.replace_range(..1, "_");
    }
    if clean.is_empty() {
        clean.push_str("unnamed");
    }
    clean
}

/// Splits `name.ext` into `("name", ".ext")`; a leading dot is not an extension
fn split_extension(name: &str) -> (&str, &str) {
    match name.rfind('.') {
        Some(i) if i > 0 => name.split_at(i),
        _ => (name, ""),
    }
}

/// Flat directory receiving extracted files, with unique sanitized names
#[derive(Debug)]
pub struct OutputDir {
    root: PathBuf,
    taken: HashSet<PathBuf>,
}

impl OutputDir {
    /// Uses `root`, creating it when missing
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root).map_err(|e| Error::directory_create(&root, e))?;
        Ok(Self {
            root,
            taken: HashSet::new(),
        })
    }

    /// The directory itself
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Whether `path` lies inside this directory
    pub fn contains(&self, path: &Path) -> bool {
        path.starts_with(&self.root)
    }

    /// Reserves a unique path for `suggestion`.
    ///
    /// Collisions with earlier reservations or existing files get a
    /// numeric suffix before the extension: `part.bin`, `part_1.bin`, ...
    pub fn new_name(&mut self, suggestion: &str) -> Result<PathBuf> {
        let name = sanitize(suggestion);
        let (stem, ext) = split_extension(&name);
        let mut candidate = self.root.join(&name);
        let mut n = 0u64;
        while self.taken.contains(&candidate) || candidate.symlink_metadata().is_ok() {
            n += 1;
            candidate = self.root.join(format!("{stem}_{n}{ext}"));
        }
        self.taken.insert(candidate.clone());
        Ok(candidate)
    }

    /// Creates a new empty file under a unique name
    pub fn create(&mut self, suggestion: &str) -> Result<(PathBuf, File)> {
        let path = self.new_name(suggestion)?;
        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .map_err(|e| Error::file_write(&path, e))?;
        Ok((path, file))
    }

    /// Creates a new directory under a unique name
    pub fn mkdir(&mut self, suggestion: &str) -> Result<PathBuf> {
        let path = self.new_name(suggestion)?;
        fs::create_dir(&path).map_err(|e| Error::directory_create(&path, e))?;
        Ok(path)
    }

    /// Replaces a generated file with a reference to `original`.
    ///
    /// On Unix the reference is a symlink; elsewhere it is a small text
    /// file naming the original.
    pub fn replace_with_reference(&self, path: &Path, original: &Path) -> Result<()> {
        if !self.contains(path) {
            return Err(Error::internal(format!(
                "'{}' is not inside the output directory",
                path.display()
            )));
        }
        fs::remove_file(path).map_err(|e| Error::file_write(path, e))?;
        let target = original.canonicalize().unwrap_or_else(|_| original.to_path_buf());
        #[cfg(unix)]
        {
            std::os::unix::fs::symlink(&target, path).map_err(|e| Error::file_write(path, e))
        }
        #[cfg(not(unix))]
        {
            fs::write(path, format!("duplicate of {}\n", target.display()))
                .map_err(|e| Error::file_write(path, e))
        }
    }
}
