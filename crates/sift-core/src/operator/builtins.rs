//! Operators available to every rule set.

use super::{Operator, OperatorRegistry, Signature};
use crate::env::Environment;
use crate::error::{Error, Result};
use crate::register::Register;
use crate::value::{Kind, Number, Primitive, Width};
use std::fs::File;
use std::io::{BufWriter, Write as _};
use std::path::Path;
use tracing::debug;

/// Size of the chunks copied by [`Carve`]
const COPY_CHUNK: usize = 64 * 1024;

pub(super) fn register(registry: &mut OperatorRegistry) {
    let builtins: [(&str, Box<dyn Operator>); 5] = [
        ("Len", Box::new(Len)),
        ("Log", Box::new(Log)),
        ("Warn", Box::new(Warn)),
        ("Carve", Box::new(Carve)),
        ("Write", Box::new(Write)),
    ];
    for (name, op) in builtins {
        registry.ops.insert(name.to_string(), op);
    }
}

/// Joins arguments for display; strings are shown unquoted
fn render(args: &[Primitive]) -> String {
    args.iter()
        .map(|arg| match arg {
            Primitive::Bytes(b) => String::from_utf8_lossy(b).into_owned(),
            other => other.to_string(),
        })
        .collect::<Vec<_>>()
        .join(" ")
}

fn path_bytes(path: &Path) -> Primitive {
    Primitive::from(path.to_string_lossy().as_ref())
}

/// `Len(bytes)`: length of a byte string
#[derive(Debug, Clone, Copy)]
pub struct Len;

impl Operator for Len {
    fn signature(&self) -> Signature {
        Signature::new([Kind::Bytes])
    }

    fn call(
        &self,
        _env: &mut Environment<'_>,
        args: &[Primitive],
        _meta: &Register,
    ) -> Result<Primitive> {
        let len = args[0].as_bytes()?.len();
        Ok(Number::unsigned(len as u64, Width::W8).into())
    }
}

/// `Log(any...)`: records a message on the current file
#[derive(Debug, Clone, Copy)]
pub struct Log;

impl Operator for Log {
    fn signature(&self) -> Signature {
        Signature::new([]).variadic(Kind::Any)
    }

    fn call(
        &self,
        env: &mut Environment<'_>,
        args: &[Primitive],
        _meta: &Register,
    ) -> Result<Primitive> {
        env.log(render(args));
        Ok(Primitive::Bool(true))
    }
}

/// `Warn(any...)`: records a warning on the current file
#[derive(Debug, Clone, Copy)]
pub struct Warn;

impl Operator for Warn {
    fn signature(&self) -> Signature {
        Signature::new([]).variadic(Kind::Any)
    }

    fn call(
        &self,
        env: &mut Environment<'_>,
        args: &[Primitive],
        _meta: &Register,
    ) -> Result<Primitive> {
        env.warn(render(args));
        Ok(Primitive::Bool(true))
    }
}

/// `Carve(prefix, p0, p1, p2...)`: copies each range `[p_i, p_i+1)` of the
/// current file into a new output file named after `prefix`.
///
/// Returns the number of files written.
#[derive(Debug, Clone, Copy)]
pub struct Carve;

impl Operator for Carve {
    fn signature(&self) -> Signature {
        Signature::new([Kind::Bytes, Kind::Number, Kind::Number]).variadic(Kind::Number)
    }

    fn call(
        &self,
        env: &mut Environment<'_>,
        args: &[Primitive],
        _meta: &Register,
    ) -> Result<Primitive> {
        let prefix = String::from_utf8_lossy(args[0].as_bytes()?).into_owned();
        let positions = args[1..]
            .iter()
            .map(Primitive::as_offset)
            .collect::<Result<Vec<_>>>()?;

        let size = env.size();
        for pair in positions.windows(2) {
            if pair[0] >= pair[1] || pair[1] > size {
                return Err(Error::out_of_range(format!(
                    "cannot carve [{}:{}] from {size} bytes",
                    pair[0], pair[1]
                )));
            }
        }

        for pair in positions.windows(2) {
            let (path, file) = env.create(&prefix)?;
            if let Err(e) = copy_range(env, &path, file, pair[0], pair[1]) {
                env.discard(&path);
                return Err(e);
            }
            debug!(path = %path.display(), start = pair[0], end = pair[1], "carved");
        }

        Ok(Number::unsigned(positions.len() as u64 - 1, Width::W8).into())
    }
}

/// Copies `[start, end)` of the current file into `file` in chunks
fn copy_range(
    env: &mut Environment<'_>,
    path: &Path,
    file: File,
    start: u64,
    end: u64,
) -> Result<()> {
    let mut out = BufWriter::new(file);
    let mut offset = start;
    while offset < end {
        let len = usize::try_from(end - offset).map_or(COPY_CHUNK, |n| n.min(COPY_CHUNK));
        let chunk = env.read_bytes(offset, len)?;
        out.write_all(&chunk).map_err(|e| Error::file_write(path, e))?;
        offset += len as u64;
    }
    out.flush().map_err(|e| Error::file_write(path, e))
}

/// `Write(name, bytes)`: writes `bytes` to a new output file.
///
/// Returns the created path.
#[derive(Debug, Clone, Copy)]
pub struct Write;

impl Operator for Write {
    fn signature(&self) -> Signature {
        Signature::new([Kind::Bytes, Kind::Bytes])
    }

    fn call(
        &self,
        env: &mut Environment<'_>,
        args: &[Primitive],
        _meta: &Register,
    ) -> Result<Primitive> {
        let name = String::from_utf8_lossy(args[0].as_bytes()?).into_owned();
        let data = args[1].as_bytes()?;
        let (path, mut file) = env.create(&name)?;
        if let Err(e) = file.write_all(data) {
            drop(file);
            env.discard(&path);
            return Err(Error::file_write(&path, e));
        }
        Ok(path_bytes(&path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::env::{DataSource, SeekSource};
    use bytes::Bytes;
    use crate::rules::RuleSet;
    use crate::scanner::OutputDir;
    use std::fs;
    use std::io::Cursor;
    use tempfile::TempDir;

    fn run(data: &[u8], name: &str, args: &[Primitive]) -> (Result<Primitive>, Vec<Vec<u8>>) {
        let dir = TempDir::new().unwrap();
        let mut output = OutputDir::new(dir.path()).unwrap();
        let rules = RuleSet::default();
        let operators = OperatorRegistry::with_builtins();
        let source = SeekSource::new(Cursor::new(data.to_vec())).unwrap();
        let mut env = Environment::new(&rules, &operators, source).with_output(&mut output);
        let result = env.call(name, args, &Register::new());
        let files = env
            .finish()
            .created
            .iter()
            .map(|p| fs::read(p).unwrap())
            .collect();
        (result, files)
    }

    #[test]
    fn test_len() {
        let (result, _) = run(&[], "Len", &["hello".into()]);
        assert_eq!(result.unwrap().as_number().unwrap().get(), 5);
    }

    #[test]
    fn test_carve_ranges() {
        let (result, files) = run(
            b"0123456789",
            "Carve",
            &[
                "part".into(),
                Number::literal(0).into(),
                Number::literal(4).into(),
                Number::literal(10).into(),
            ],
        );
        assert_eq!(result.unwrap().as_number().unwrap().get(), 2);
        assert_eq!(files, vec![b"0123".to_vec(), b"456789".to_vec()]);
    }

    #[test]
    fn test_carve_rejects_bad_ranges() {
        let (result, files) = run(
            b"0123",
            "Carve",
            &["part".into(), Number::literal(2).into(), Number::literal(9).into()],
        );
        assert!(matches!(result, Err(Error::OutOfRange { .. })));
        assert!(files.is_empty());
    }

    /// Claims more bytes than it can deliver
    struct ShortRead {
        data: Vec<u8>,
        claimed: u64,
    }

    impl DataSource for ShortRead {
        fn size(&self) -> u64 {
            self.claimed
        }

        fn read_bytes(&mut self, offset: u64, len: usize) -> Result<Bytes> {
            let start = offset as usize;
            self.data
                .get(start..start + len)
                .map(Bytes::copy_from_slice)
                .ok_or_else(|| Error::out_of_range("short read"))
        }
    }

    #[test]
    fn test_failed_carve_leaves_no_partial_file() {
        let dir = TempDir::new().unwrap();
        let mut output = OutputDir::new(dir.path()).unwrap();
        let rules = RuleSet::default();
        let operators = OperatorRegistry::with_builtins();
        let source = ShortRead {
            data: b"abcd".to_vec(),
            claimed: 8,
        };
        let mut env = Environment::new(&rules, &operators, source).with_output(&mut output);
        let args: [Primitive; 4] = [
            "part".into(),
            Number::literal(0).into(),
            Number::literal(2).into(),
            Number::literal(8).into(),
        ];
        let result = env.call("Carve", &args, &Register::new());
        assert!(matches!(result, Err(Error::OutOfRange { .. })));

        let created = env.finish().created;
        assert_eq!(created.len(), 1);
        assert_eq!(fs::read(&created[0]).unwrap(), b"ab");
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    #[test]
    fn test_write() {
        let (result, files) = run(&[], "Write", &["note.txt".into(), "payload".into()]);
        let path = result.unwrap();
        assert!(path.as_bytes().unwrap().ends_with(b"note.txt"));
        assert_eq!(files, vec![b"payload".to_vec()]);
    }

    #[test]
    fn test_wrong_argument_kind() {
        let (result, _) = run(&[], "Len", &[Number::literal(1).into()]);
        assert!(matches!(result, Err(Error::TypeMismatch { .. })));
    }

    #[test]
    fn test_render() {
        let msg = render(&["found".into(), Number::literal(3).into(), true.into()]);
        assert_eq!(msg, "found 3 true");
    }
}
