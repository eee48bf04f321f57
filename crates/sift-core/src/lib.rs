//! # sift-core
//!
//! A rule engine for identifying structure inside binary files, and a
//! recursive scanner that unpacks whatever the rules extract.
//!
//! This crate provides the core functionality for:
//! - Parsing rule sources into a linked, closed [`RuleSet`]
//! - Evaluating rules lazily against a file's bytes
//! - Scanning input trees recursively, including files created by rule
//!   actions, with duplicate detection and depth limiting
//!
//! ## Architecture
//!
//! The library is organized into several modules:
//!
//! - [`value`] and [`register`]: primitive values and chained key/value stores
//! - [`expr`], [`scope`] and [`env`]: expression trees and their evaluation
//! - [`rules`]: rule parsing, linking and evaluation
//! - [`operator`]: the registry of callable operators
//! - [`scanner`]: the recursive scan driver
//! - [`report`]: plain-text rendering of scan results
//! - [`error`]: error types and handling
//!
//! ## Example
//!
//! ```no_run
//! use sift_core::{OperatorRegistry, ReportRenderer, RuleSet, ScanConfig, Scanner};
//!
//! let operators = OperatorRegistry::with_builtins();
//! let rules = RuleSet::parse(
//!     "inline",
//!     r#"rule elf (tag="elf") { if String(0, 4) == "\x7fELF"; }"#,
//!     &operators,
//! )?;
//!
//! let config = ScanConfig::new().output_dir("./extracted");
//! let report = Scanner::with_config(&rules, &operators, config).scan(&["./firmware.bin"])?;
//! print!("{}", ReportRenderer::new(&report).render());
//! # Ok::<(), sift_core::Error>(())
//! ```
//!
//! ## Extensibility
//!
//! - [`Operator`]: add callables (format decoders, analyzers) to rules
//! - [`ScanObserver`]: receive match and tag events during a scan
//! - [`DataSource`]: evaluate rules against bytes that are not files

#![deny(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, unreachable_pub)]

pub mod env;
pub mod error;
pub mod expr;
pub mod operator;
pub mod register;
pub mod report;
pub mod rules;
pub mod scanner;
pub mod scope;
pub mod value;

// Re-export primary types for convenience
pub use env::{DataSource, Environment, SeekSource};
pub use error::{Error, Result};
pub use expr::{Expr, ExtractFormat};
pub use operator::{Operator, OperatorRegistry, Signature};
pub use register::Register;
pub use report::{ReportConfig, ReportRenderer};
pub use rules::{FailureMode, Match, Rule, RuleId, RuleParser, RuleSet};
pub use scanner::{
    FileEntry, FileId, NullObserver, ScanConfig, ScanObserver, ScanReport, Scanner, StatsObserver,
};
pub use value::{BinaryOp, Kind, Number, Primitive, UnaryOp, Width};

/// Crate version for programmatic access
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
