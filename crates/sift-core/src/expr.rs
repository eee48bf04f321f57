//! Expression trees.
//!
//! Every node supports two kinds of processing:
//!
//! - [`Expr::simplify`] folds constant subtrees without any environment.
//!   It returns [`Cow::Borrowed`] when nothing changed, so unchanged
//!   subtrees are never rebuilt.
//! - [`Expr::evaluate`] reduces the tree to a [`Primitive`] against a live
//!   [`Environment`], reading file bytes and resolving variables lazily.

use crate::env::Environment;
use crate::error::{Error, Result};
use crate::register::Register;
use crate::value::{BinaryOp, Number, Primitive, UnaryOp, Width};
use std::borrow::Cow;
use std::fmt;
use std::sync::Arc;
use tracing::trace;

/// How an extract node interprets the bytes it reads
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtractFormat {
    /// Fixed-width integer; byte order and sign come from metadata
    Number,
    /// Exactly `size` raw bytes
    String,
    /// Bytes up to the first NUL, reading at most `size` bytes
    StringZ,
}

/// An immutable expression tree
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    /// Literal value
    Value(Primitive),
    /// Reference to a rule variable or a `$global`
    Variable(String),
    /// Unary operation
    Unary {
        /// Operator
        op: UnaryOp,
        /// Operand
        operand: Box<Expr>,
    },
    /// Binary operation
    Binary {
        /// Operator
        op: BinaryOp,
        /// Left operand; its width determines the result width
        left: Box<Expr>,
        /// Right operand
        right: Box<Expr>,
    },
    /// `expr[start]` or `expr[start:end]` on a byte string
    Slice {
        /// Sliced byte string
        expr: Box<Expr>,
        /// First index
        start: Box<Expr>,
        /// Exclusive end, for the range form
        end: Option<Box<Expr>>,
    },
    /// Read from the current file
    Extract {
        /// File offset
        offset: Box<Expr>,
        /// Width or length in bytes
        size: Box<Expr>,
        /// Interpretation of the bytes
        format: ExtractFormat,
        /// Per-call metadata, chained to the declaring rule's metadata
        meta: Arc<Register>,
    },
    /// Call of a registered operator
    Call {
        /// Operator name
        name: String,
        /// Positional arguments
        args: Vec<Expr>,
        /// Per-call metadata, chained to the declaring rule's metadata
        meta: Arc<Register>,
    },
}

impl Expr {
    /// Literal number with the default literal width
    pub fn number(value: u64) -> Self {
        Expr::Value(Number::literal(value).into())
    }

    /// Literal byte string
    pub fn string(value: impl Into<Primitive>) -> Self {
        Expr::Value(value.into())
    }

    /// Variable reference
    pub fn variable(name: impl Into<String>) -> Self {
        Expr::Variable(name.into())
    }

    /// Binary operation node
    pub fn binary(op: BinaryOp, left: Expr, right: Expr) -> Self {
        Expr::Binary {
            op,
            left: Box::new(left),
            right: Box::new(right),
        }
    }

    /// Unary operation node
    pub fn unary(op: UnaryOp, operand: Expr) -> Self {
        Expr::Unary {
            op,
            operand: Box::new(operand),
        }
    }

    /// Fixed-width numeric extract (`Byte`, `Short`, `Long`, `Quad`)
    pub fn extract_number(offset: Expr, width: Width, meta: Register) -> Self {
        Expr::Extract {
            offset: Box::new(offset),
            size: Box::new(Expr::number(width.bytes() as u64)),
            format: ExtractFormat::Number,
            meta: Arc::new(meta),
        }
    }

    /// Literal value held by this node, if it is one
    pub fn as_value(&self) -> Option<&Primitive> {
        match self {
            Expr::Value(value) => Some(value),
            _ => None,
        }
    }

    /// Folds constant subtrees.
    ///
    /// Fails when a constant subtree cannot be folded, for example on a
    /// division by zero between two literals.
    pub fn simplify(&self) -> Result<Cow<'_, Expr>> {
        match self {
            Expr::Value(_) | Expr::Variable(_) => Ok(Cow::Borrowed(self)),
            Expr::Unary { op, operand } => {
                let operand = operand.simplify()?;
                if let Some(value) = operand.as_value() {
                    return Ok(Cow::Owned(Expr::Value(value.unary(*op)?)));
                }
                Ok(match operand {
                    Cow::Borrowed(_) => Cow::Borrowed(self),
                    Cow::Owned(operand) => Cow::Owned(Expr::unary(*op, operand)),
                })
            }
            Expr::Binary { op, left, right } => {
                let (l, r) = (left.simplify()?, right.simplify()?);
                if let (Some(a), Some(b)) = (l.as_value(), r.as_value()) {
                    return Ok(Cow::Owned(Expr::Value(a.binary(*op, b)?)));
                }
                if matches!(op, BinaryOp::And | BinaryOp::Or) {
                    if let Some(a) = l.as_value() {
                        let decided = a.truthy()?;
                        if decided == (*op == BinaryOp::Or) {
                            return Ok(Cow::Owned(Expr::Value(Primitive::Bool(decided))));
                        }
                    }
                }
                if is_borrowed(&l) && is_borrowed(&r) {
                    return Ok(Cow::Borrowed(self));
                }
                Ok(Cow::Owned(Expr::binary(*op, l.into_owned(), r.into_owned())))
            }
            Expr::Slice { expr, start, end } => {
                let inner = expr.simplify()?;
                let first = start.simplify()?;
                let last = end.as_deref().map(Expr::simplify).transpose()?;
                let literal_end = match &last {
                    Some(e) => e.as_value().map(Some),
                    None => Some(None),
                };
                if let (Some(v), Some(s), Some(e)) =
                    (inner.as_value(), first.as_value(), literal_end)
                {
                    return Ok(Cow::Owned(Expr::Value(slice_value(v, s, e)?)));
                }
                if is_borrowed(&inner)
                    && is_borrowed(&first)
                    && last.as_ref().map_or(true, is_borrowed)
                {
                    return Ok(Cow::Borrowed(self));
                }
                Ok(Cow::Owned(Expr::Slice {
                    expr: Box::new(inner.into_owned()),
                    start: Box::new(first.into_owned()),
                    end: last.map(|e| Box::new(e.into_owned())),
                }))
            }
            Expr::Extract {
                offset,
                size,
                format,
                meta,
            } => {
                let (o, s) = (offset.simplify()?, size.simplify()?);
                if is_borrowed(&o) && is_borrowed(&s) {
                    return Ok(Cow::Borrowed(self));
                }
                Ok(Cow::Owned(Expr::Extract {
                    offset: Box::new(o.into_owned()),
                    size: Box::new(s.into_owned()),
                    format: *format,
                    meta: meta.clone(),
                }))
            }
            Expr::Call { name, args, meta } => {
                let simplified = args
                    .iter()
                    .map(Expr::simplify)
                    .collect::<Result<Vec<_>>>()?;
                if simplified.iter().all(is_borrowed) {
                    return Ok(Cow::Borrowed(self));
                }
                Ok(Cow::Owned(Expr::Call {
                    name: name.clone(),
                    args: simplified.into_iter().map(Cow::into_owned).collect(),
                    meta: meta.clone(),
                }))
            }
        }
    }

    /// Re-parents the metadata of every extract and call node to `rule_meta`
    pub(crate) fn bind_metadata(&self, rule_meta: &Arc<Register>) -> Expr {
        let rebind = |meta: &Arc<Register>| {
            let mut local = (**meta).clone();
            local.set_parent(Some(rule_meta.clone()));
            Arc::new(local)
        };
        match self {
            Expr::Value(_) | Expr::Variable(_) => self.clone(),
            Expr::Unary { op, operand } => Expr::unary(*op, operand.bind_metadata(rule_meta)),
            Expr::Binary { op, left, right } => Expr::binary(
                *op,
                left.bind_metadata(rule_meta),
                right.bind_metadata(rule_meta),
            ),
            Expr::Slice { expr, start, end } => Expr::Slice {
                expr: Box::new(expr.bind_metadata(rule_meta)),
                start: Box::new(start.bind_metadata(rule_meta)),
                end: end.as_ref().map(|e| Box::new(e.bind_metadata(rule_meta))),
            },
            Expr::Extract {
                offset,
                size,
                format,
                meta,
            } => Expr::Extract {
                offset: Box::new(offset.bind_metadata(rule_meta)),
                size: Box::new(size.bind_metadata(rule_meta)),
                format: *format,
                meta: rebind(meta),
            },
            Expr::Call { name, args, meta } => Expr::Call {
                name: name.clone(),
                args: args.iter().map(|a| a.bind_metadata(rule_meta)).collect(),
                meta: rebind(meta),
            },
        }
    }

    /// Reduces the expression to a value
    pub fn evaluate(&self, env: &mut Environment<'_>) -> Result<Primitive> {
        env.nested(|env| self.evaluate_node(env))
    }

    fn evaluate_node(&self, env: &mut Environment<'_>) -> Result<Primitive> {
        match self {
            Expr::Value(value) => Ok(value.clone()),
            Expr::Variable(name) => env.resolve(name),
            Expr::Unary { op, operand } => operand.evaluate(env)?.unary(*op),
            Expr::Binary { op, left, right } => {
                let lhs = left.evaluate(env)?;
                if matches!(op, BinaryOp::And | BinaryOp::Or) {
                    let decided = lhs.truthy()?;
                    if decided == (*op == BinaryOp::Or) {
                        return Ok(Primitive::Bool(decided));
                    }
                    return Ok(Primitive::Bool(right.evaluate(env)?.truthy()?));
                }
                let rhs = right.evaluate(env)?;
                lhs.binary(*op, &rhs)
            }
            Expr::Slice { expr, start, end } => {
                let value = expr.evaluate(env)?;
                let first = start.evaluate(env)?;
                let last = end.as_ref().map(|e| e.evaluate(env)).transpose()?;
                slice_value(&value, &first, last.as_ref())
            }
            Expr::Extract {
                offset,
                size,
                format,
                meta,
            } => {
                let offset = offset.evaluate(env)?.as_offset()?;
                let size = size.evaluate(env)?.as_offset()?;
                extract(env, offset, size, *format, meta)
            }
            Expr::Call { name, args, meta } => {
                let values = args
                    .iter()
                    .map(|arg| arg.evaluate(env))
                    .collect::<Result<Vec<_>>>()?;
                env.call(name, &values, meta)
            }
        }
    }
}

fn is_borrowed(expr: &Cow<'_, Expr>) -> bool {
    matches!(expr, Cow::Borrowed(_))
}

/// Indexes or sub-slices a byte string
fn slice_value(value: &Primitive, start: &Primitive, end: Option<&Primitive>) -> Result<Primitive> {
    let bytes = value.as_bytes()?;
    let len = bytes.len() as u64;
    let start = start.as_offset()?;
    match end {
        None => {
            if start >= len {
                return Err(Error::out_of_range(format!(
                    "index {start} out of range for length {len}"
                )));
            }
            let byte = bytes[start as usize];
            Ok(Number::unsigned(u64::from(byte), Width::W1).into())
        }
        Some(end) => {
            let end = end.as_offset()?;
            if start >= end || end > len {
                return Err(Error::out_of_range(format!(
                    "slice [{start}:{end}] out of range for length {len}"
                )));
            }
            Ok(Primitive::Bytes(bytes.slice(start as usize..end as usize)))
        }
    }
}

fn extract(
    env: &mut Environment<'_>,
    offset: u64,
    size: u64,
    format: ExtractFormat,
    meta: &Register,
) -> Result<Primitive> {
    match format {
        ExtractFormat::Number => {
            let width = Width::try_from(size)?;
            let bytes = env.read_bytes(offset, width.bytes())?;
            let big_endian = meta.get_bool("bigendian").unwrap_or(true);
            let signed = meta.get_bool("signed").unwrap_or(false);
            let fold = |acc: u64, b: &u8| (acc << 8) | u64::from(*b);
            let raw = if big_endian {
                bytes.iter().fold(0, fold)
            } else {
                bytes.iter().rev().fold(0, fold)
            };
            trace!(offset, size, big_endian, signed, raw, "numeric extract");
            Ok(Number::new(raw, width, signed).into())
        }
        ExtractFormat::String => {
            let len = usize::try_from(size)
                .map_err(|_| Error::out_of_range(format!("length {size} too large")))?;
            Ok(Primitive::Bytes(env.read_bytes(offset, len)?))
        }
        ExtractFormat::StringZ => {
            let max = usize::try_from(size)
                .map_err(|_| Error::out_of_range(format!("length {size} too large")))?;
            Ok(Primitive::Bytes(env.read_cstr(offset, max)?))
        }
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn nested(f: &mut fmt::Formatter<'_>, expr: &Expr) -> fmt::Result {
            match expr {
                Expr::Binary { .. } => write!(f, "({expr})"),
                _ => write!(f, "{expr}"),
            }
        }
        fn metadata(f: &mut fmt::Formatter<'_>, meta: &Register) -> fmt::Result {
            for (key, value) in meta.iter() {
                write!(f, ", {key}={value}")?;
            }
            Ok(())
        }

        match self {
            Expr::Value(value) => write!(f, "{value}"),
            Expr::Variable(name) => f.write_str(name),
            Expr::Unary { op, operand } => {
                write!(f, "{op}")?;
                nested(f, operand)
            }
            Expr::Binary { op, left, right } => {
                nested(f, left)?;
                write!(f, " {op} ")?;
                nested(f, right)
            }
            Expr::Slice { expr, start, end } => {
                nested(f, expr)?;
                match end {
                    Some(end) => write!(f, "[{start}:{end}]"),
                    None => write!(f, "[{start}]"),
                }
            }
            Expr::Extract {
                offset,
                size,
                format,
                meta,
            } => {
                let width = size
                    .as_value()
                    .and_then(|v| v.as_offset().ok())
                    .and_then(|n| Width::try_from(n).ok());
                match (format, width) {
                    (ExtractFormat::Number, Some(Width::W1)) => write!(f, "Byte({offset}")?,
                    (ExtractFormat::Number, Some(Width::W2)) => write!(f, "Short({offset}")?,
                    (ExtractFormat::Number, Some(Width::W4)) => write!(f, "Long({offset}")?,
                    (ExtractFormat::Number, Some(Width::W8)) => write!(f, "Quad({offset}")?,
                    (ExtractFormat::Number, None) => write!(f, "Number({offset}, {size}")?,
                    (ExtractFormat::String, _) => write!(f, "String({offset}, {size}")?,
                    (ExtractFormat::StringZ, _) => write!(f, "StringZ({offset}, {size}")?,
                }
                metadata(f, meta)?;
                f.write_str(")")
            }
            Expr::Call { name, args, meta } => {
                write!(f, "{name}(")?;
                for (i, arg) in args.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{arg}")?;
                }
                if args.is_empty() {
                    for (i, (key, value)) in meta.iter().enumerate() {
                        if i > 0 {
                            f.write_str(", ")?;
                        }
                        write!(f, "{key}={value}")?;
                    }
                } else {
                    metadata(f, meta)?;
                }
                f.write_str(")")
            }
        }
    }
}
