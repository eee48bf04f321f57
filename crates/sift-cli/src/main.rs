//! sift - Identify and recursively unpack structure inside binary files
//!
//! This tool evaluates a set of rule files against input files and
//! directories, recursing into every file the rules extract, and prints
//! the resulting match and extraction tree.

use anyhow::{bail, Context, Result};
use clap::Parser;
use sift_core::{
    Number, OperatorRegistry, Primitive, ReportConfig, ReportRenderer, RuleSet, ScanConfig,
    Scanner, StatsObserver,
};
use std::io::{self, Write};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{debug, info, Level};
use tracing_subscriber::EnvFilter;

/// Identify and recursively unpack structure inside binary files
#[derive(Parser, Debug)]
#[command(name = "sift")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Files or directories to scan
    inputs: Vec<PathBuf>,

    /// Rule file to load (repeatable)
    #[arg(short, long = "rules", required = true)]
    rules: Vec<PathBuf>,

    /// Directory receiving files extracted by rule actions
    #[arg(short, long, env = "SIFT_OUTPUT")]
    output: Option<PathBuf>,

    /// Maximum extraction depth; deeper files are recorded as errors
    #[arg(long, default_value = "16")]
    max_depth: usize,

    /// Follow symbolic links instead of skipping them
    #[arg(long)]
    follow_symlinks: bool,

    /// Stop the scan on the first internal error
    #[arg(long)]
    abort_on_internal: bool,

    /// Define a global visible to rules as `$key` (key=value)
    #[arg(short = 'D', long = "define", value_parser = parse_define)]
    defines: Vec<(String, Primitive)>,

    /// List the loaded rules per rule file and exit
    #[arg(long)]
    list_rules: bool,

    /// Only print `path: tags` lines for tagged files
    #[arg(long)]
    tags_only: bool,

    /// Also print child rules that did not match
    #[arg(long)]
    show_unmatched: bool,

    /// Verbosity level (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

/// Parses `key=value`; values are booleans, integers, or else strings
fn parse_define(s: &str) -> std::result::Result<(String, Primitive), String> {
    let (key, value) = s
        .split_once('=')
        .ok_or_else(|| format!("expected key=value, got '{s}'"))?;
    let key = key.trim();
    if key.is_empty() {
        return Err("empty key".to_string());
    }
    let value = match value {
        "true" => Primitive::Bool(true),
        "false" => Primitive::Bool(false),
        v => parse_number(v)
            .map(Primitive::from)
            .unwrap_or_else(|| Primitive::from(v)),
    };
    Ok((key.to_string(), value))
}

fn parse_number(s: &str) -> Option<Number> {
    let (negative, digits) = match s.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, s),
    };
    let magnitude = match digits.strip_prefix("0x").or_else(|| digits.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16).ok()?,
        None => digits.parse::<u64>().ok()?,
    };
    if negative {
        let value = i64::try_from(magnitude).ok()?.checked_neg()?;
        Some(Number::signed(value, sift_core::Width::W8))
    } else {
        Some(Number::literal(magnitude))
    }
}

fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    // Initialize tracing
    let level = match cli.verbose {
        0 => Level::WARN,
        1 => Level::INFO,
        2 => Level::DEBUG,
        _ => Level::TRACE,
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(level.into()))
        .with_target(false)
        .with_writer(io::stderr)
        .init();

    let operators = OperatorRegistry::with_builtins();
    let rules = RuleSet::load(&cli.rules, &operators).context("failed to load rules")?;
    info!("Loaded {} rules from {} files", rules.len(), cli.rules.len());

    if cli.list_rules {
        list_rules(&rules)?;
        return Ok(ExitCode::SUCCESS);
    }
    if cli.inputs.is_empty() {
        bail!("no input files given");
    }

    let mut config = ScanConfig::new()
        .max_depth(cli.max_depth)
        .follow_symlinks(cli.follow_symlinks)
        .abort_on_internal(cli.abort_on_internal);
    if let Some(ref output) = cli.output {
        config = config.output_dir(output);
    }
    for (key, value) in &cli.defines {
        debug!("Defining ${} = {}", key.trim_start_matches('$'), value);
        config = config.global(key, value.clone());
    }

    let mut stats = StatsObserver::default();
    let report = Scanner::with_config(&rules, &operators, config)
        .scan_with(&cli.inputs, &mut stats)
        .context("scan aborted")?;

    let renderer = ReportRenderer::with_config(
        &report,
        ReportConfig::new().show_unmatched(cli.show_unmatched),
    );
    let mut text = String::new();
    if cli.tags_only {
        renderer.write_tags(&mut text)?;
    } else {
        renderer.write_to(&mut text)?;
    }
    io::stdout()
        .lock()
        .write_all(text.as_bytes())
        .context("failed to write report")?;

    info!(
        "Summary: {} files evaluated, {} finished, {} leaf matches, {} with errors",
        stats.files_evaluated, stats.files_done, stats.rule_matches, stats.files_with_errors
    );

    if report.has_errors() {
        Ok(ExitCode::FAILURE)
    } else {
        Ok(ExitCode::SUCCESS)
    }
}

/// Prints every rule grouped by the file that declared it
fn list_rules(rules: &RuleSet) -> Result<()> {
    let mut out = io::stdout().lock();
    for (source, ids) in rules.iter_sources() {
        writeln!(out, "{source}")?;
        for &id in ids {
            let rule = rules.rule(id);
            write!(out, "  {}", rule.id())?;
            if let Some(parent) = rule.parent_name() {
                write!(out, " : {parent}")?;
            } else {
                write!(out, " (pass {})", rule.pass())?;
            }
            let tags = rule.tags();
            if !tags.is_empty() {
                write!(out, " [{}]", tags.join(","))?;
            }
            writeln!(out)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn verify_cli() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_define() {
        assert_eq!(
            parse_define("arch=arm").unwrap(),
            ("arch".to_string(), Primitive::from("arm"))
        );
        assert_eq!(
            parse_define("strict=true").unwrap().1,
            Primitive::Bool(true)
        );
        assert_eq!(
            parse_define("base=0x1000").unwrap().1,
            Primitive::from(Number::literal(0x1000))
        );
        assert_eq!(
            parse_define("delta=-4").unwrap().1,
            Primitive::from(Number::signed(-4, sift_core::Width::W8))
        );
        assert_eq!(parse_define("empty=").unwrap().1, Primitive::from(""));
        assert!(parse_define("novalue").is_err());
        assert!(parse_define("=1").is_err());
    }

    #[test]
    fn test_args() {
        let cli = Cli::try_parse_from([
            "sift", "-r", "a.sift", "-r", "b.sift", "-D", "x=1", "-vv", "in.bin",
        ])
        .unwrap();
        assert_eq!(cli.rules.len(), 2);
        assert_eq!(cli.inputs, vec![PathBuf::from("in.bin")]);
        assert_eq!(cli.defines.len(), 1);
        assert_eq!(cli.verbose, 2);
        assert_eq!(cli.max_depth, 16);

        assert!(Cli::try_parse_from(["sift", "in.bin"]).is_err());
    }

    #[test]
    fn test_load_and_list_rules() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("elf.sift");
        std::fs::write(&path, "rule elf (tag=\"elf\") { } rule elf64 : elf { }").unwrap();
        let operators = OperatorRegistry::with_builtins();
        let rules = RuleSet::load(&[&path], &operators).unwrap();
        assert_eq!(rules.len(), 2);
        list_rules(&rules).unwrap();
    }
}
