//! Evaluation environment.
//!
//! An [`Environment`] is built once per scanned file. It ties together the
//! closed rule set, the operator registry, the file's bytes, the per-file
//! global register, the stack of rule scopes and the output directory that
//! actions write extracted files into. Everything a rule evaluation produces
//! besides its [`Match`](crate::rules::Match) tree (created files, logs,
//! warnings and recorded failures) accumulates here until [`Environment::finish`].

use crate::error::{Error, Result};
use crate::operator::OperatorRegistry;
use crate::register::Register;
use crate::rules::{RuleId, RuleSet};
use crate::scanner::OutputDir;
use crate::scope::{Binding, Scope};
use crate::value::Primitive;
use bytes::Bytes;
use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use tracing::{info, trace, warn};

/// Deepest nesting of expression nodes, variable lookups and child rules
/// during one evaluation
pub const MAX_EVAL_DEPTH: usize = 512;

/// Random-access byte reader for the file under evaluation
pub trait DataSource {
    /// Total size in bytes
    fn size(&self) -> u64;

    /// Reads exactly `len` bytes starting at `offset`.
    ///
    /// Reading past the end is an [`Error::OutOfRange`].
    fn read_bytes(&mut self, offset: u64, len: usize) -> Result<Bytes>;

    /// Reads up to `max` bytes starting at `offset`, stopping before the
    /// first NUL byte or at end of data
    fn read_cstr(&mut self, offset: u64, max: usize) -> Result<Bytes> {
        let size = self.size();
        if offset > size {
            return Err(Error::out_of_range(format!(
                "offset {offset} past end of data ({size} bytes)"
            )));
        }
        let available = usize::try_from(size - offset).unwrap_or(usize::MAX);
        let bytes = self.read_bytes(offset, max.min(available))?;
        let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
        Ok(bytes.slice(..end))
    }
}

/// [`DataSource`] over any seekable reader
#[derive(Debug)]
pub struct SeekSource<R> {
    reader: R,
    size: u64,
    name: PathBuf,
}

impl<R: Read + Seek> SeekSource<R> {
    /// Wraps `reader`, measuring its size
    pub fn new(mut reader: R) -> io::Result<Self> {
        let size = reader.seek(SeekFrom::End(0))?;
        reader.seek(SeekFrom::Start(0))?;
        Ok(Self {
            reader,
            size,
            name: PathBuf::from("<memory>"),
        })
    }

    /// Sets the name used in read error messages
    pub fn with_name(mut self, name: impl Into<PathBuf>) -> Self {
        self.name = name.into();
        self
    }
}

impl SeekSource<File> {
    /// Opens a file from disk
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path).map_err(|e| Error::file_read(path, e))?;
        Ok(Self::new(file)
            .map_err(|e| Error::file_read(path, e))?
            .with_name(path))
    }
}

impl<R: Read + Seek> DataSource for SeekSource<R> {
    fn size(&self) -> u64 {
        self.size
    }

    fn read_bytes(&mut self, offset: u64, len: usize) -> Result<Bytes> {
        let end = offset.checked_add(len as u64).filter(|end| *end <= self.size);
        if end.is_none() {
            return Err(Error::out_of_range(format!(
                "read of {len} bytes at offset {offset} past end of data ({} bytes)",
                self.size
            )));
        }
        let mut buf = vec![0u8; len];
        self.reader
            .seek(SeekFrom::Start(offset))
            .and_then(|_| self.reader.read_exact(&mut buf))
            .map_err(|e| Error::file_read(&self.name, e))?;
        Ok(Bytes::from(buf))
    }
}

/// A failure recorded while evaluating a rule instance
#[derive(Debug)]
pub struct Failure {
    /// Id of the rule being evaluated, if any
    pub rule: Option<String>,
    /// What went wrong
    pub error: Error,
}

/// Side effects accumulated by one [`Environment`]
#[derive(Debug, Default)]
pub struct Effects {
    /// Files and directories created by actions, in creation order
    pub created: Vec<PathBuf>,
    /// Messages emitted by `Log`
    pub logs: Vec<String>,
    /// Messages emitted by `Warn`
    pub warnings: Vec<String>,
    /// Recorded evaluation and action failures
    pub failures: Vec<Failure>,
}

/// Per-file evaluation context
pub struct Environment<'a> {
    rules: &'a RuleSet,
    operators: &'a OperatorRegistry,
    globals: Register,
    source: Box<dyn DataSource + 'a>,
    scope: Scope<'a>,
    output: Option<&'a mut OutputDir>,
    effects: Effects,
    depth: usize,
}

impl<'a> Environment<'a> {
    /// Creates an environment reading from `source`
    pub fn new(
        rules: &'a RuleSet,
        operators: &'a OperatorRegistry,
        source: impl DataSource + 'a,
    ) -> Self {
        Self {
            rules,
            operators,
            globals: Register::new(),
            source: Box::new(source),
            scope: Scope::new(),
            output: None,
            effects: Effects::default(),
            depth: 0,
        }
    }

    /// Replaces the global register (`$filename`, `$filesize`, ...)
    pub fn with_globals(mut self, globals: Register) -> Self {
        self.globals = globals;
        self
    }

    /// Lets actions create files under `output`
    pub fn with_output(mut self, output: &'a mut OutputDir) -> Self {
        self.output = Some(output);
        self
    }

    /// The rule set being evaluated
    pub fn rules(&self) -> &'a RuleSet {
        self.rules
    }

    /// The global register
    pub fn globals(&self) -> &Register {
        &self.globals
    }

    /// Mutable access to the global register
    pub fn globals_mut(&mut self) -> &mut Register {
        &mut self.globals
    }

    pub(crate) fn scope(&self) -> &Scope<'a> {
        &self.scope
    }

    pub(crate) fn scope_mut(&mut self) -> &mut Scope<'a> {
        &mut self.scope
    }

    /// Size of the current file
    pub fn size(&self) -> u64 {
        self.source.size()
    }

    /// Reads `len` bytes of the current file at `offset`
    pub fn read_bytes(&mut self, offset: u64, len: usize) -> Result<Bytes> {
        self.source.read_bytes(offset, len)
    }

    /// Reads a NUL-terminated string of at most `max` bytes at `offset`
    pub fn read_cstr(&mut self, offset: u64, max: usize) -> Result<Bytes> {
        self.source.read_cstr(offset, max)
    }

    /// Runs `f` one nesting level deeper, failing once the limit is hit
    pub(crate) fn nested<T>(&mut self, f: impl FnOnce(&mut Self) -> Result<T>) -> Result<T> {
        if self.depth >= MAX_EVAL_DEPTH {
            return Err(Error::TooDeep {
                limit: MAX_EVAL_DEPTH,
            });
        }
        self.depth += 1;
        let result = f(self);
        self.depth -= 1;
        result
    }

    /// Resolves a variable.
    ///
    /// Names starting with `$` live only in the global register. Other
    /// names are looked up in the scope chain, evaluating a declared but
    /// unevaluated binding on first use and caching its value, then in the
    /// global register.
    pub fn resolve(&mut self, name: &str) -> Result<Primitive> {
        if name.starts_with('$') {
            return self.global(name);
        }
        if self.scope.is_empty() {
            return Err(Error::MissingScope {
                name: name.to_string(),
            });
        }
        let (frame, binding) = match self.scope.lookup(name) {
            Some((frame, binding)) => (frame, binding.clone()),
            None => return self.global(name),
        };
        match binding {
            Binding::Resolved(value) => Ok(value),
            Binding::InProgress => Err(Error::CircularDependency {
                name: name.to_string(),
            }),
            Binding::Unevaluated(expr) => {
                self.scope.set_at(frame, name, Binding::InProgress);
                match expr.evaluate(self) {
                    Ok(value) => {
                        trace!(name, %value, "resolved variable");
                        self.scope
                            .set_at(frame, name, Binding::Resolved(value.clone()));
                        Ok(value)
                    }
                    Err(e) => {
                        self.scope.set_at(frame, name, Binding::Unevaluated(expr));
                        Err(e)
                    }
                }
            }
        }
    }

    fn global(&self, name: &str) -> Result<Primitive> {
        self.globals
            .get(name)
            .cloned()
            .ok_or_else(|| Error::UnresolvedVariable {
                name: name.to_string(),
            })
    }

    /// Invokes a registered operator with already evaluated arguments
    pub fn call(&mut self, name: &str, args: &[Primitive], meta: &Register) -> Result<Primitive> {
        let operators = self.operators;
        let op = operators.get(name).ok_or_else(|| Error::UnknownFunction {
            name: name.to_string(),
        })?;
        op.signature().check(name, args)?;
        trace!(name, argc = args.len(), "calling operator");
        op.call(self, args, meta)
    }

    fn output_dir(&mut self) -> Result<&mut OutputDir> {
        self.output.as_deref_mut().ok_or(Error::NoOutputDirectory)
    }

    /// Returns a fresh, sanitized path in the output directory without
    /// creating anything
    pub fn new_name(&mut self, suggestion: &str) -> Result<PathBuf> {
        self.output_dir()?.new_name(suggestion)
    }

    /// Creates a new output file; its path is queued for scanning
    pub fn create(&mut self, name: &str) -> Result<(PathBuf, File)> {
        let (path, file) = self.output_dir()?.create(name)?;
        self.effects.created.push(path.clone());
        Ok((path, file))
    }

    /// Deletes a file this environment created and takes it off the queue.
    ///
    /// Used when an action fails after `create`, so a partial artifact is
    /// never scanned.
    pub fn discard(&mut self, path: &Path) {
        self.effects.created.retain(|p| p != path);
        if let Err(e) = std::fs::remove_file(path) {
            warn!(path = %path.display(), error = %e, "failed to remove partial output");
        }
    }

    /// Creates a new output directory; its path is queued for scanning
    pub fn mkdir(&mut self, name: &str) -> Result<PathBuf> {
        let path = self.output_dir()?.mkdir(name)?;
        self.effects.created.push(path.clone());
        Ok(path)
    }

    /// Records a rule-emitted log message
    pub fn log(&mut self, message: impl Into<String>) {
        let message = message.into();
        info!(target: "sift::rules", "{message}");
        self.effects.logs.push(message);
    }

    /// Records a rule-emitted warning
    pub fn warn(&mut self, message: impl Into<String>) {
        let message = message.into();
        warn!(target: "sift::rules", "{message}");
        self.effects.warnings.push(message);
    }

    /// Id of the rule currently being evaluated
    pub fn current_rule(&self) -> Option<RuleId> {
        self.scope.current_rule()
    }

    /// Records a failure against the current rule
    pub fn record_failure(&mut self, error: Error) {
        self.record_rule_failure(self.scope.current_rule(), error);
    }

    /// Records a failure against a specific rule
    pub(crate) fn record_rule_failure(&mut self, rule: Option<RuleId>, error: Error) {
        let rule = rule.map(|id| self.rules.rule(id).id().to_string());
        self.effects.failures.push(Failure { rule, error });
    }

    /// Whether an internal error has been recorded
    pub fn has_internal_failure(&self) -> bool {
        self.effects.failures.iter().any(|f| f.error.is_internal())
    }

    /// Consumes the environment, returning everything it accumulated
    pub fn finish(self) -> Effects {
        self.effects
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::Expr;
    use crate::value::{BinaryOp, Number};
    use std::io::Cursor;
    use tempfile::TempDir;

    fn source(data: &[u8]) -> SeekSource<Cursor<Vec<u8>>> {
        SeekSource::new(Cursor::new(data.to_vec())).unwrap()
    }

    #[test]
    fn test_read_past_end() {
        let mut src = source(b"abcd");
        assert_eq!(src.size(), 4);
        assert_eq!(&src.read_bytes(2, 2).unwrap()[..], b"cd");
        assert!(matches!(src.read_bytes(3, 2), Err(Error::OutOfRange { .. })));
        assert!(matches!(src.read_bytes(u64::MAX, 2), Err(Error::OutOfRange { .. })));
    }

    #[test]
    fn test_read_cstr_bounded() {
        let mut src = source(b"ab\0cd");
        assert_eq!(&src.read_cstr(0, 10).unwrap()[..], b"ab");
        assert_eq!(&src.read_cstr(3, 10).unwrap()[..], b"cd");
        assert_eq!(&src.read_cstr(0, 1).unwrap()[..], b"a");
        assert!(src.read_cstr(6, 1).is_err());
    }

    #[test]
    fn test_special_variables_use_globals() {
        let rules = RuleSet::default();
        let operators = OperatorRegistry::new();
        let mut globals = Register::new();
        globals.set("$filesize", Number::literal(4));
        let mut env = Environment::new(&rules, &operators, source(b"abcd")).with_globals(globals);

        assert_eq!(env.resolve("$filesize").unwrap(), Number::literal(4).into());
        assert!(matches!(
            env.resolve("$nothing"),
            Err(Error::UnresolvedVariable { .. })
        ));
        assert!(matches!(env.resolve("plain"), Err(Error::MissingScope { .. })));
    }

    #[test]
    fn test_lazy_resolution_caches() {
        let rules = RuleSet::default();
        let operators = OperatorRegistry::new();
        let a = Expr::binary(BinaryOp::Add, Expr::number(1), Expr::number(2));
        let b = Expr::binary(BinaryOp::Mul, Expr::variable("a"), Expr::number(2));
        let mut env = Environment::new(&rules, &operators, source(&[]));
        env.scope_mut().push(RuleId(0), [("a", &a), ("b", &b)]);

        assert_eq!(env.resolve("b").unwrap(), Number::literal(6).into());
        assert_eq!(env.scope().get("a"), Some(&Number::literal(3).into()));
    }

    #[test]
    fn test_circular_dependency_is_an_error() {
        let rules = RuleSet::default();
        let operators = OperatorRegistry::new();
        let a = Expr::variable("b");
        let b = Expr::variable("a");
        let mut env = Environment::new(&rules, &operators, source(&[]));
        env.scope_mut().push(RuleId(0), [("a", &a), ("b", &b)]);

        let err = env.resolve("a").unwrap_err();
        assert!(matches!(err, Error::CircularDependency { .. }));
        assert!(err.is_internal());
        // The failed bindings are restored, not left in progress.
        assert!(matches!(
            env.scope().lookup("a"),
            Some((_, Binding::Unevaluated(_)))
        ));
    }

    #[test]
    fn test_create_without_output_dir() {
        let rules = RuleSet::default();
        let operators = OperatorRegistry::new();
        let mut env = Environment::new(&rules, &operators, source(&[]));
        assert!(matches!(env.create("x"), Err(Error::NoOutputDirectory)));
    }

    #[test]
    fn test_created_paths_are_recorded() {
        let dir = TempDir::new().unwrap();
        let mut output = OutputDir::new(dir.path()).unwrap();
        let rules = RuleSet::default();
        let operators = OperatorRegistry::new();
        let mut env =
            Environment::new(&rules, &operators, source(&[])).with_output(&mut output);

        let (first, _) = env.create("part.bin").unwrap();
        let (second, _) = env.create("part.bin").unwrap();
        let sub = env.mkdir("tree").unwrap();
        assert_ne!(first, second);
        assert!(sub.is_dir());

        let effects = env.finish();
        assert_eq!(effects.created, vec![first, second, sub]);
    }
}
