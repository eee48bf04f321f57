//! Operator registry.
//!
//! Every call in a rule other than the fixed-width extracts (`Byte`,
//! `Short`, `Long`, `Quad`, `String`, `StringZ`) dispatches to an
//! [`Operator`] looked up by name. The parser consults the registry to
//! reject unknown names and wrong arities while loading rules; the
//! evaluator consults it again to invoke the operator with evaluated
//! arguments.
//!
//! Format decoders and analyzers plug in here. The crate ships a handful
//! of built-ins (see [`OperatorRegistry::with_builtins`]) that cover
//! logging and carving byte ranges into new files.

mod builtins;

use crate::env::Environment;
use crate::error::{Error, Result};
use crate::register::Register;
use crate::value::{Kind, Primitive};
use indexmap::IndexMap;
use std::fmt;

pub use builtins::{Carve, Len, Log, Warn, Write};

/// Call names compiled into extract nodes; they can't be registered
pub const RESERVED_NAMES: [&str; 6] = ["Byte", "Short", "Long", "Quad", "String", "StringZ"];

/// Parameter kinds accepted by an operator
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Signature {
    params: Vec<Kind>,
    variadic: Option<Kind>,
}

impl Signature {
    /// Fixed parameter list
    pub fn new(params: impl Into<Vec<Kind>>) -> Self {
        Self {
            params: params.into(),
            variadic: None,
        }
    }

    /// Accepts any number of trailing arguments of `kind`
    pub fn variadic(mut self, kind: Kind) -> Self {
        self.variadic = Some(kind);
        self
    }

    /// Fixed parameters
    pub fn params(&self) -> &[Kind] {
        &self.params
    }

    /// Whether `count` arguments is a valid call
    pub fn accepts_arity(&self, count: usize) -> bool {
        if self.variadic.is_some() {
            count >= self.params.len()
        } else {
            count == self.params.len()
        }
    }

    /// Verifies the argument count and kinds for a call of `name`
    pub fn check(&self, name: &str, args: &[Primitive]) -> Result<()> {
        if !self.accepts_arity(args.len()) {
            return Err(Error::operator(
                name,
                format!("expected {self} arguments, got {}", args.len()),
            ));
        }
        for (i, arg) in args.iter().enumerate() {
            let expected = self
                .params
                .get(i)
                .copied()
                .or(self.variadic)
                .unwrap_or(Kind::Any);
            if !expected.accepts(arg.kind()) {
                return Err(Error::type_mismatch(format!(
                    "{name}: argument {} expects {expected}, found {}",
                    i + 1,
                    arg.kind()
                )));
            }
        }
        Ok(())
    }
}

impl fmt::Display for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "(")?;
        for (i, kind) in self.params.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{kind}")?;
        }
        if let Some(kind) = self.variadic {
            if !self.params.is_empty() {
                write!(f, ", ")?;
            }
            write!(f, "{kind}...")?;
        }
        write!(f, ")")
    }
}

/// A callable invocable from rule expressions and actions.
///
/// # Example
///
/// ```
/// use sift_core::{Environment, Kind, Operator, Primitive, Register, Result, Signature};
///
/// struct IsEmpty;
///
/// impl Operator for IsEmpty {
///     fn signature(&self) -> Signature {
///         Signature::new([Kind::Bytes])
///     }
///
///     fn call(
///         &self,
///         _env: &mut Environment<'_>,
///         args: &[Primitive],
///         _meta: &Register,
///     ) -> Result<Primitive> {
///         Ok(Primitive::Bool(args[0].as_bytes()?.is_empty()))
///     }
/// }
/// ```
pub trait Operator: Send + Sync {
    /// Accepted arguments; checked before every call
    fn signature(&self) -> Signature;

    /// Runs the operator against the current file
    fn call(&self, env: &mut Environment<'_>, args: &[Primitive], meta: &Register)
        -> Result<Primitive>;
}

/// Adapts a closure into an [`Operator`]
pub struct FnOperator<F> {
    signature: Signature,
    func: F,
}

impl<F> Operator for FnOperator<F>
where
    F: Fn(&mut Environment<'_>, &[Primitive], &Register) -> Result<Primitive> + Send + Sync,
{
    fn signature(&self) -> Signature {
        self.signature.clone()
    }

    fn call(
        &self,
        env: &mut Environment<'_>,
        args: &[Primitive],
        meta: &Register,
    ) -> Result<Primitive> {
        (self.func)(env, args, meta)
    }
}

/// Name to operator table
#[derive(Default)]
pub struct OperatorRegistry {
    ops: IndexMap<String, Box<dyn Operator>>,
}

impl OperatorRegistry {
    /// Creates an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a registry holding the built-in operators
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        builtins::register(&mut registry);
        registry
    }

    /// Registers an operator under `name`.
    ///
    /// Fails if the name is not an identifier, is one of the reserved
    /// extract names, or is already taken.
    pub fn register(&mut self, name: &str, op: impl Operator + 'static) -> Result<()> {
        let valid = name
            .chars()
            .next()
            .map_or(false, |c| c.is_ascii_alphabetic() || c == '_')
            && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
        if !valid {
            return Err(Error::operator(name, "not a valid operator name"));
        }
        if RESERVED_NAMES.contains(&name) {
            return Err(Error::operator(name, "name is reserved for extracts"));
        }
        if self.ops.contains_key(name) {
            return Err(Error::operator(name, "already registered"));
        }
        self.ops.insert(name.to_string(), Box::new(op));
        Ok(())
    }

    /// Registers a closure as an operator
    pub fn register_fn<F>(&mut self, name: &str, signature: Signature, func: F) -> Result<()>
    where
        F: Fn(&mut Environment<'_>, &[Primitive], &Register) -> Result<Primitive>
            + Send
            + Sync
            + 'static,
    {
        self.register(name, FnOperator { signature, func })
    }

    /// Looks an operator up
    pub fn get(&self, name: &str) -> Option<&dyn Operator> {
        self.ops.get(name).map(|op| op.as_ref())
    }

    /// Whether `name` is registered
    pub fn contains(&self, name: &str) -> bool {
        self.ops.contains_key(name)
    }

    /// Registered names in registration order
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.ops.keys().map(String::as_str)
    }

    /// Number of registered operators
    pub fn len(&self) -> usize {
        self.ops.len()
    }

    /// Whether nothing is registered
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

impl fmt::Debug for OperatorRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OperatorRegistry")
            .field("ops", &self.ops.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::Number;

    #[test]
    fn test_signature_arity() {
        let fixed = Signature::new([Kind::Bytes, Kind::Number]);
        assert!(fixed.accepts_arity(2));
        assert!(!fixed.accepts_arity(3));

        let variadic = Signature::new([Kind::Bytes]).variadic(Kind::Number);
        assert!(!variadic.accepts_arity(0));
        assert!(variadic.accepts_arity(1));
        assert!(variadic.accepts_arity(5));
        assert_eq!(variadic.to_string(), "(string, number...)");
    }

    #[test]
    fn test_signature_kinds() {
        let sig = Signature::new([Kind::Bytes]).variadic(Kind::Number);
        assert!(sig
            .check("Carve", &["x".into(), Number::literal(1).into()])
            .is_ok());
        let err = sig
            .check("Carve", &["x".into(), "y".into()])
            .unwrap_err();
        assert!(matches!(err, Error::TypeMismatch { .. }));
        assert!(matches!(
            sig.check("Carve", &[]),
            Err(Error::Operator { .. })
        ));
    }

    fn ok(_: &mut Environment<'_>, _: &[Primitive], _: &Register) -> Result<Primitive> {
        Ok(Primitive::Bool(true))
    }

    #[test]
    fn test_register_rejects_reserved_and_duplicates() {
        let mut registry = OperatorRegistry::new();
        assert!(registry.register_fn("Short", Signature::new([]), ok).is_err());
        assert!(registry.register_fn("9lives", Signature::new([]), ok).is_err());
        registry.register_fn("Check", Signature::new([]), ok).unwrap();
        assert!(registry.register_fn("Check", Signature::new([]), ok).is_err());
        assert!(registry.contains("Check"));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_builtins_registered() {
        let registry = OperatorRegistry::with_builtins();
        let names: Vec<_> = registry.names().collect();
        assert_eq!(names, vec!["Len", "Log", "Warn", "Carve", "Write"]);
    }
}
