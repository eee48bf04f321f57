//! Primitive values manipulated by rule expressions.
//!
//! A [`Primitive`] is a sized number, a boolean or a byte string. Numbers
//! carry their declared byte width and signedness; the stored bits are
//! always normalized (masked, then sign-extended when signed) to that width,
//! and every arithmetic result is re-normalized to the width of the left
//! operand.

use crate::error::{Error, Result};
use bytes::Bytes;
use std::cmp::Ordering;
use std::fmt;

/// Byte width of a [`Number`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum Width {
    /// 8-bit
    W1 = 1,
    /// 16-bit
    W2 = 2,
    /// 32-bit
    W4 = 4,
    /// 64-bit
    W8 = 8,
}

impl Width {
    /// Width in bytes
    pub fn bytes(self) -> usize {
        self as usize
    }

    /// Width in bits
    pub fn bits(self) -> u32 {
        self as u32 * 8
    }

    fn mask(self) -> u64 {
        match self {
            Width::W8 => u64::MAX,
            w => (1u64 << w.bits()) - 1,
        }
    }
}

impl TryFrom<u64> for Width {
    type Error = Error;

    fn try_from(value: u64) -> Result<Self> {
        match value {
            1 => Ok(Width::W1),
            2 => Ok(Width::W2),
            4 => Ok(Width::W4),
            8 => Ok(Width::W8),
            width => Err(Error::InvalidWidth { width }),
        }
    }
}

/// A fixed-width integer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Number {
    raw: u64,
    width: Width,
    signed: bool,
}

impl Number {
    /// Creates a number, truncating `value` to `width` and sign-extending
    /// it when `signed` is set
    pub fn new(value: u64, width: Width, signed: bool) -> Self {
        let masked = value & width.mask();
        let raw = if signed && width != Width::W8 && (masked >> (width.bits() - 1)) & 1 == 1 {
            masked | !width.mask()
        } else {
            masked
        };
        Self { raw, width, signed }
    }

    /// Creates an unsigned number
    pub fn unsigned(value: u64, width: Width) -> Self {
        Self::new(value, width, false)
    }

    /// Creates a signed number
    pub fn signed(value: i64, width: Width) -> Self {
        Self::new(value as u64, width, true)
    }

    /// Creates a number for an integer literal.
    ///
    /// Literals are 4-byte signed when they fit, then 4-byte unsigned,
    /// then 8-byte signed, then 8-byte unsigned.
    pub fn literal(value: u64) -> Self {
        if value <= i32::MAX as u64 {
            Self::new(value, Width::W4, true)
        } else if value <= u32::MAX as u64 {
            Self::new(value, Width::W4, false)
        } else if value <= i64::MAX as u64 {
            Self::new(value, Width::W8, true)
        } else {
            Self::new(value, Width::W8, false)
        }
    }

    /// Returns the numeric value as seen through the declared native type
    /// (`u8`..`u64` or `i8`..`i64`)
    pub fn get(&self) -> i128 {
        if self.signed {
            self.raw as i64 as i128
        } else {
            self.raw as i128
        }
    }

    /// Returns the normalized 64-bit storage
    pub fn raw(&self) -> u64 {
        self.raw
    }

    /// Declared width
    pub fn width(&self) -> Width {
        self.width
    }

    /// Whether the number is signed
    pub fn is_signed(&self) -> bool {
        self.signed
    }

    /// Whether the number is zero
    pub fn is_zero(&self) -> bool {
        self.raw == 0
    }

    /// Rebuilds a number with the same width and sign from new bits
    fn rewrap(&self, raw: u64) -> Self {
        Self::new(raw, self.width, self.signed)
    }

    fn arithmetic(&self, op: BinaryOp, rhs: &Number) -> Result<Number> {
        let (a, b) = (self.raw, rhs.raw);
        let raw = match op {
            BinaryOp::Add => a.wrapping_add(b),
            BinaryOp::Sub => a.wrapping_sub(b),
            BinaryOp::Mul => a.wrapping_mul(b),
            BinaryOp::Div | BinaryOp::Rem => {
                if rhs.is_zero() {
                    return Err(Error::DivisionByZero);
                }
                let divisor = rhs.get() as i64;
                match (op, self.signed) {
                    (BinaryOp::Div, true) => (a as i64).wrapping_div(divisor) as u64,
                    (BinaryOp::Div, false) => a / divisor as u64,
                    (_, true) => (a as i64).wrapping_rem(divisor) as u64,
                    (_, false) => a % divisor as u64,
                }
            }
            BinaryOp::BitAnd => a & b,
            BinaryOp::BitOr => a | b,
            BinaryOp::BitXor => a ^ b,
            BinaryOp::Shl | BinaryOp::Shr => {
                let amount = u32::try_from(rhs.get()).ok().filter(|n| *n < 64);
                match (op, self.signed) {
                    (BinaryOp::Shl, _) => amount.map_or(0, |n| a << n),
                    (_, true) => {
                        let v = a as i64;
                        amount.map_or(if v < 0 { -1 } else { 0 }, |n| v >> n) as u64
                    }
                    (_, false) => amount.map_or(0, |n| a >> n),
                }
            }
            _ => return Err(Error::internal(format!("'{op}' is not arithmetic"))),
        };
        Ok(self.rewrap(raw))
    }
}

impl fmt::Display for Number {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.get())
    }
}

/// Kind tag of a [`Primitive`], also used to describe operator parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    /// Sized integer
    Number,
    /// Boolean
    Bool,
    /// Byte string
    Bytes,
    /// Accepts any kind (operator parameters only)
    Any,
}

impl Kind {
    /// Whether a value of kind `other` is acceptable where `self` is expected
    pub fn accepts(self, other: Kind) -> bool {
        self == Kind::Any || self == other
    }
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Kind::Number => "number",
            Kind::Bool => "boolean",
            Kind::Bytes => "string",
            Kind::Any => "any",
        })
    }
}

/// Binary operators
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    /// `+`
    Add,
    /// `-`
    Sub,
    /// `*`
    Mul,
    /// `/`
    Div,
    /// `%`
    Rem,
    /// `&`
    BitAnd,
    /// `|`
    BitOr,
    /// `^`
    BitXor,
    /// `<<`
    Shl,
    /// `>>`
    Shr,
    /// `==`
    Eq,
    /// `!=`
    Ne,
    /// `<`
    Lt,
    /// `>`
    Gt,
    /// `<=`
    Le,
    /// `>=`
    Ge,
    /// `&&`
    And,
    /// `||`
    Or,
}

impl BinaryOp {
    /// Source spelling of the operator
    pub fn symbol(self) -> &'static str {
        match self {
            BinaryOp::Add => "+",
            BinaryOp::Sub => "-",
            BinaryOp::Mul => "*",
            BinaryOp::Div => "/",
            BinaryOp::Rem => "%",
            BinaryOp::BitAnd => "&",
            BinaryOp::BitOr => "|",
            BinaryOp::BitXor => "^",
            BinaryOp::Shl => "<<",
            BinaryOp::Shr => ">>",
            BinaryOp::Eq => "==",
            BinaryOp::Ne => "!=",
            BinaryOp::Lt => "<",
            BinaryOp::Gt => ">",
            BinaryOp::Le => "<=",
            BinaryOp::Ge => ">=",
            BinaryOp::And => "&&",
            BinaryOp::Or => "||",
        }
    }

    fn is_comparison(self) -> bool {
        matches!(
            self,
            BinaryOp::Eq | BinaryOp::Ne | BinaryOp::Lt | BinaryOp::Gt | BinaryOp::Le | BinaryOp::Ge
        )
    }
}

impl fmt::Display for BinaryOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.symbol())
    }
}

/// Unary operators
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    /// `-x`
    Neg,
    /// `+x`
    Plus,
    /// `~x`
    BitNot,
    /// `!x`
    Not,
}

impl fmt::Display for UnaryOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            UnaryOp::Neg => "-",
            UnaryOp::Plus => "+",
            UnaryOp::BitNot => "~",
            UnaryOp::Not => "!",
        })
    }
}

/// A fully reduced value
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Primitive {
    /// Sized integer
    Number(Number),
    /// Boolean
    Bool(bool),
    /// Byte string
    Bytes(Bytes),
}

impl Primitive {
    /// Kind tag of this value
    pub fn kind(&self) -> Kind {
        match self {
            Primitive::Number(_) => Kind::Number,
            Primitive::Bool(_) => Kind::Bool,
            Primitive::Bytes(_) => Kind::Bytes,
        }
    }

    /// Borrows the number, failing for other kinds
    pub fn as_number(&self) -> Result<&Number> {
        match self {
            Primitive::Number(n) => Ok(n),
            other => Err(Error::type_mismatch(format!(
                "expected number, found {}",
                other.kind()
            ))),
        }
    }

    /// Borrows the byte string, failing for other kinds
    pub fn as_bytes(&self) -> Result<&Bytes> {
        match self {
            Primitive::Bytes(b) => Ok(b),
            other => Err(Error::type_mismatch(format!(
                "expected string, found {}",
                other.kind()
            ))),
        }
    }

    /// Returns the boolean, failing for other kinds
    pub fn as_bool(&self) -> Result<bool> {
        match self {
            Primitive::Bool(b) => Ok(*b),
            other => Err(Error::type_mismatch(format!(
                "expected boolean, found {}",
                other.kind()
            ))),
        }
    }

    /// Interprets a number as a non-negative file offset or length
    pub fn as_offset(&self) -> Result<u64> {
        let n = self.as_number()?.get();
        u64::try_from(n).map_err(|_| Error::out_of_range(format!("negative offset {n}")))
    }

    /// Truth value of booleans and numbers (non-zero is true)
    pub fn truthy(&self) -> Result<bool> {
        match self {
            Primitive::Bool(b) => Ok(*b),
            Primitive::Number(n) => Ok(!n.is_zero()),
            Primitive::Bytes(_) => Err(Error::type_mismatch(
                "a string has no truth value".to_string(),
            )),
        }
    }

    /// Applies a binary operator.
    ///
    /// `&&` and `||` here see both operands already evaluated; short-circuit
    /// evaluation happens one level up in the expression evaluator.
    pub fn binary(&self, op: BinaryOp, rhs: &Primitive) -> Result<Primitive> {
        use Primitive::{Bool, Bytes as Str, Number as Num};

        if matches!(op, BinaryOp::And | BinaryOp::Or) {
            let (a, b) = (self.truthy()?, rhs.truthy()?);
            return Ok(Bool(if op == BinaryOp::And { a && b } else { a || b }));
        }

        match (self, rhs) {
            (Num(a), Num(b)) if op.is_comparison() => {
                Ok(Bool(compare(op, a.get().cmp(&b.get()))))
            }
            (Num(a), Num(b)) => Ok(Num(a.arithmetic(op, b)?)),
            (Bool(a), Bool(b)) if matches!(op, BinaryOp::Eq | BinaryOp::Ne) => {
                Ok(Bool((a == b) == (op == BinaryOp::Eq)))
            }
            (Str(a), Str(b)) if matches!(op, BinaryOp::Eq | BinaryOp::Ne) => {
                Ok(Bool((a == b) == (op == BinaryOp::Eq)))
            }
            (Str(a), Str(b)) if op == BinaryOp::Add => {
                let mut joined = Vec::with_capacity(a.len() + b.len());
                joined.extend_from_slice(a);
                joined.extend_from_slice(b);
                Ok(Str(joined.into()))
            }
            _ => Err(Error::type_mismatch(format!(
                "cannot apply '{}' to {} and {}",
                op,
                self.kind(),
                rhs.kind()
            ))),
        }
    }

    /// Applies a unary operator
    pub fn unary(&self, op: UnaryOp) -> Result<Primitive> {
        match (op, self) {
            (UnaryOp::Plus, Primitive::Number(_)) => Ok(self.clone()),
            (UnaryOp::Neg, Primitive::Number(n)) => {
                Ok(Primitive::Number(n.rewrap(n.raw.wrapping_neg())))
            }
            (UnaryOp::BitNot, Primitive::Number(n)) => Ok(Primitive::Number(n.rewrap(!n.raw))),
            (UnaryOp::Not, Primitive::Bool(_) | Primitive::Number(_)) => {
                Ok(Primitive::Bool(!self.truthy()?))
            }
            _ => Err(Error::type_mismatch(format!(
                "cannot apply '{}' to {}",
                op,
                self.kind()
            ))),
        }
    }
}

fn compare(op: BinaryOp, ordering: Ordering) -> bool {
    match op {
        BinaryOp::Eq => ordering == Ordering::Equal,
        BinaryOp::Ne => ordering != Ordering::Equal,
        BinaryOp::Lt => ordering == Ordering::Less,
        BinaryOp::Gt => ordering == Ordering::Greater,
        BinaryOp::Le => ordering != Ordering::Greater,
        _ => ordering != Ordering::Less,
    }
}

impl From<Number> for Primitive {
    fn from(n: Number) -> Self {
        Primitive::Number(n)
    }
}

impl From<bool> for Primitive {
    fn from(b: bool) -> Self {
        Primitive::Bool(b)
    }
}

impl From<Bytes> for Primitive {
    fn from(b: Bytes) -> Self {
        Primitive::Bytes(b)
    }
}

impl From<Vec<u8>> for Primitive {
    fn from(b: Vec<u8>) -> Self {
        Primitive::Bytes(b.into())
    }
}

impl From<&str> for Primitive {
    fn from(s: &str) -> Self {
        Primitive::Bytes(Bytes::copy_from_slice(s.as_bytes()))
    }
}

impl fmt::Display for Primitive {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Primitive::Number(n) => write!(f, "{n}"),
            Primitive::Bool(b) => write!(f, "{b}"),
            Primitive::Bytes(bytes) => {
                f.write_str("\"")?;
                for &b in bytes.iter() {
                    match b {
                        b'"' => f.write_str("\\\"")?,
                        b'\\' => f.write_str("\\\\")?,
                        b'\n' => f.write_str("\\n")?,
                        b'\t' => f.write_str("\\t")?,
                        b'\r' => f.write_str("\\r")?,
                        0x20..=0x7e => write!(f, "{}", b as char)?,
                        _ => write!(f, "\\x{b:02x}")?,
                    }
                }
                f.write_str("\"")
            }
        }
    }
}
