//! Error types for the sift-core library.
//!
//! A single error enum covers rule loading, expression evaluation, file
//! I/O and internal invariant violations. The scan orchestrator uses
//! [`Error::is_internal`] to tell the unrecoverable kind apart from
//! ordinary per-file failures.

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for sift operations
pub type Result<T> = std::result::Result<T, Error>;

/// Comprehensive error type for all sift operations
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    /// Malformed rule source
    #[error("{source_name}:{line}:{column}: {message} (at '{token}')")]
    Parse {
        /// Name of the rule source (usually a file path)
        source_name: String,
        /// 1-based line of the offending token
        line: u32,
        /// 1-based column of the offending token
        column: u32,
        /// Text of the offending token
        token: String,
        /// What went wrong
        message: String,
    },

    /// A variable was declared twice in the same rule
    #[error("rule '{rule}' declares variable '{name}' more than once")]
    DuplicateVariable {
        /// Rule id
        rule: String,
        /// Variable name
        name: String,
    },

    /// A rule id was defined more than once
    #[error("rule '{id}' is defined more than once (first in {first}, again in {second})")]
    DuplicateRule {
        /// Rule id
        id: String,
        /// Source of the first definition
        first: String,
        /// Source of the redefinition
        second: String,
    },

    /// A rule names a parent rule that does not exist
    #[error("rule '{rule}' inherits from unknown rule '{parent}'")]
    UnknownParent {
        /// Rule id
        rule: String,
        /// Missing parent id
        parent: String,
    },

    /// Rules inherit from each other in a loop
    #[error("rule '{rule}' is part of an inheritance cycle")]
    InheritanceCycle {
        /// A rule on the cycle
        rule: String,
    },

    /// A call names a function that is not registered
    #[error("unknown function '{name}'")]
    UnknownFunction {
        /// Function name
        name: String,
    },

    /// A closed rule was modified
    #[error("rule '{rule}' is closed and can no longer be modified")]
    RuleClosed {
        /// Rule id
        rule: String,
    },

    /// Evaluation recursed deeper than the environment allows
    #[error("evaluation nested deeper than {limit} levels")]
    TooDeep {
        /// The nesting limit
        limit: usize,
    },

    /// Division or modulo by zero
    #[error("division by zero")]
    DivisionByZero,

    /// Slice index or file read outside the valid range
    #[error("out of range: {details}")]
    OutOfRange {
        /// Description of the violated bound
        details: String,
    },

    /// Operand kinds don't fit the operation
    #[error("type mismatch: {details}")]
    TypeMismatch {
        /// Description of the mismatch
        details: String,
    },

    /// A variable could not be found in any scope or register
    #[error("unresolved variable '{name}'")]
    UnresolvedVariable {
        /// Variable name
        name: String,
    },

    /// Numeric extract with a width other than 1, 2, 4 or 8 bytes
    #[error("unsupported numeric width {width}")]
    InvalidWidth {
        /// Requested width in bytes
        width: u64,
    },

    /// An operator rejected its arguments or failed
    #[error("{name}: {message}")]
    Operator {
        /// Operator name
        name: String,
        /// Failure description
        message: String,
    },

    /// Failed to read input file
    #[error("failed to read file '{path}': {source}")]
    FileRead {
        /// Path to the file that failed to read
        path: PathBuf,
        /// Underlying I/O error
        #[source]
        source: std::io::Error,
    },

    /// Failed to write output file
    #[error("failed to write file '{path}': {source}")]
    FileWrite {
        /// Path to the file that failed to write
        path: PathBuf,
        /// Underlying I/O error
        #[source]
        source: std::io::Error,
    },

    /// Failed to create output directory
    #[error("failed to create directory '{path}': {source}")]
    DirectoryCreate {
        /// Path to the directory that failed to create
        path: PathBuf,
        /// Underlying I/O error
        #[source]
        source: std::io::Error,
    },

    /// An action tried to create a file but no output directory is configured
    #[error("no output directory configured")]
    NoOutputDirectory,

    /// File nesting is deeper than the configured maximum
    #[error("depth {depth} exceeds maximum depth {max}")]
    DepthExceeded {
        /// Depth of the rejected file
        depth: usize,
        /// Configured maximum
        max: usize,
    },

    /// Symbolic links are not followed
    #[error("refusing to follow symlink '{path}'")]
    SymlinkRejected {
        /// The symlink
        path: PathBuf,
    },

    /// A variable's value depends on itself
    #[error("circular dependency while evaluating variable '{name}'")]
    CircularDependency {
        /// Variable that was re-entered
        name: String,
    },

    /// Evaluation needed a rule scope but none was active
    #[error("no active scope while resolving '{name}'")]
    MissingScope {
        /// Name being resolved
        name: String,
    },

    /// Generic internal error
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Creates a new parse error
    pub fn parse(
        source_name: impl Into<String>,
        line: u32,
        column: u32,
        token: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::Parse {
            source_name: source_name.into(),
            line,
            column,
            token: token.into(),
            message: message.into(),
        }
    }

    /// Creates a new out-of-range error
    pub fn out_of_range(details: impl Into<String>) -> Self {
        Self::OutOfRange {
            details: details.into(),
        }
    }

    /// Creates a new type mismatch error
    pub fn type_mismatch(details: impl Into<String>) -> Self {
        Self::TypeMismatch {
            details: details.into(),
        }
    }

    /// Creates a new operator error
    pub fn operator(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Operator {
            name: name.into(),
            message: message.into(),
        }
    }

    /// Creates a new file read error
    pub fn file_read(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::FileRead {
            path: path.into(),
            source,
        }
    }

    /// Creates a new file write error
    pub fn file_write(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::FileWrite {
            path: path.into(),
            source,
        }
    }

    /// Creates a new directory creation error
    pub fn directory_create(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::DirectoryCreate {
            path: path.into(),
            source,
        }
    }

    /// Creates a new internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Returns true for rule-loading failures
    pub fn is_load_error(&self) -> bool {
        matches!(
            self,
            Self::Parse { .. }
                | Self::DuplicateVariable { .. }
                | Self::DuplicateRule { .. }
                | Self::UnknownParent { .. }
                | Self::InheritanceCycle { .. }
                | Self::UnknownFunction { .. }
                | Self::RuleClosed { .. }
        )
    }

    /// Returns true if this error signals a broken engine invariant rather
    /// than a problem with one rule instance or one input file
    pub fn is_internal(&self) -> bool {
        matches!(
            self,
            Self::CircularDependency { .. }
                | Self::MissingScope { .. }
                | Self::InvalidWidth { .. }
                | Self::Internal(_)
        )
    }
}
