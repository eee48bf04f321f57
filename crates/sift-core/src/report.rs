//! Plain-text scan reports.
//!
//! Files are printed as a tree following extraction provenance: each
//! user input first, then, indented below it, every file its rules
//! created. Under each file come its tags, the match tree with extracted
//! variables, rule logs, warnings and errors.

use crate::rules::Match;
use crate::scanner::{FileEntry, ScanReport};
use std::fmt::Write as FmtWrite;

/// Configuration for report rendering
#[derive(Debug, Clone)]
pub struct ReportConfig {
    /// Indentation string (default: 2 spaces)
    pub indent_str: String,
    /// Print extracted variables under each match
    pub show_vars: bool,
    /// Print child rules that did not match
    pub show_unmatched: bool,
}

impl Default for ReportConfig {
    fn default() -> Self {
        Self {
            indent_str: "  ".to_string(),
            show_vars: true,
            show_unmatched: false,
        }
    }
}

impl ReportConfig {
    /// Creates a new config with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the indentation string
    pub fn indent_str(mut self, s: impl Into<String>) -> Self {
        self.indent_str = s.into();
        self
    }

    /// Sets whether variables are printed
    pub fn show_vars(mut self, show: bool) -> Self {
        self.show_vars = show;
        self
    }

    /// Sets whether unmatched child rules are printed
    pub fn show_unmatched(mut self, show: bool) -> Self {
        self.show_unmatched = show;
        self
    }
}

/// Renders a [`ScanReport`] as text
pub struct ReportRenderer<'a> {
    report: &'a ScanReport,
    config: ReportConfig,
}

impl<'a> ReportRenderer<'a> {
    /// Creates a renderer with default configuration
    pub fn new(report: &'a ScanReport) -> Self {
        Self::with_config(report, ReportConfig::default())
    }

    /// Creates a renderer with custom configuration
    pub fn with_config(report: &'a ScanReport, config: ReportConfig) -> Self {
        Self { report, config }
    }

    /// Renders the full report as a string
    pub fn render(&self) -> String {
        let mut output = String::new();
        self.write_to(&mut output).expect("String write cannot fail");
        output
    }

    /// Writes the full report
    pub fn write_to(&self, w: &mut impl FmtWrite) -> std::fmt::Result {
        let mut writer = TextWriter {
            writer: w,
            config: &self.config,
            report: self.report,
            indent_level: 0,
        };
        for entry in self.report.roots() {
            writer.write_file(entry)?;
        }
        for warning in &self.report.warnings {
            writeln!(writer.writer, "warning: {warning}")?;
        }
        Ok(())
    }

    /// Writes one `path: tag,tag` line per tagged file
    pub fn write_tags(&self, w: &mut impl FmtWrite) -> std::fmt::Result {
        for entry in self.report.files.iter().filter(|f| !f.tags.is_empty()) {
            writeln!(w, "{}: {}", entry.path.display(), entry.tags.join(","))?;
        }
        Ok(())
    }
}

struct TextWriter<'a, W: FmtWrite> {
    writer: &'a mut W,
    config: &'a ReportConfig,
    report: &'a ScanReport,
    indent_level: usize,
}

impl<'a, W: FmtWrite> TextWriter<'a, W> {
    fn indent(&mut self) {
        self.indent_level += 1;
    }

    fn dedent(&mut self) {
        self.indent_level = self.indent_level.saturating_sub(1);
    }

    fn write_indent(&mut self) -> std::fmt::Result {
        for _ in 0..self.indent_level {
            write!(self.writer, "{}", self.config.indent_str)?;
        }
        Ok(())
    }

    fn writeln(&mut self, s: &str) -> std::fmt::Result {
        self.write_indent()?;
        writeln!(self.writer, "{}", s)
    }

    fn write_file(&mut self, entry: &FileEntry) -> std::fmt::Result {
        let mut header = format!("{} {} ({} bytes", entry.id, entry.path.display(), entry.size);
        if let Some(parent) = entry.parent {
            write!(header, ", from {parent}, depth {}", entry.depth)?;
        }
        header.push(')');
        self.writeln(&header)?;
        self.indent();

        if let Some(original) = entry.duplicate_of {
            let path = self.report.file(original).path.display().to_string();
            self.writeln(&format!("duplicate of {original} {path}"))?;
        }
        if !entry.tags.is_empty() {
            self.writeln(&format!("tags: {}", entry.tags.join(", ")))?;
        }
        for matched in &entry.matches {
            self.write_match(matched)?;
        }
        for log in &entry.logs {
            self.writeln(&format!("log: {log}"))?;
        }
        for warning in &entry.warnings {
            self.writeln(&format!("warning: {warning}"))?;
        }
        for error in &entry.errors {
            self.writeln(&format!("error: {error}"))?;
        }

        let report = self.report;
        for child in report.children(entry.id) {
            self.write_file(child)?;
        }
        self.dedent();
        Ok(())
    }

    fn write_match(&mut self, matched: &Match) -> std::fmt::Result {
        self.writeln(&format!("match {}", matched.id))?;
        self.indent();
        if self.config.show_vars {
            // Ancestor values are flattened in; show each name once.
            for (name, value) in &matched.vars {
                self.writeln(&format!("{name} = {value}"))?;
            }
        }
        for child in &matched.children {
            self.write_match(child)?;
        }
        if self.config.show_unmatched && !matched.unmatched.is_empty() {
            self.writeln(&format!("unmatched: {}", matched.unmatched.join(", ")))?;
        }
        self.dedent();
        Ok(())
    }
}
