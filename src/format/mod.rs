//! Export formatters for the analysis tables.

mod csv;
mod json;

pub use self::csv::CsvFormatter;
pub use self::json::JsonFormatter;

use std::collections::BTreeMap;
use std::fmt;
use std::fmt::Write as _;
use std::str::FromStr;

use clap::ValueEnum;

use crate::functions::Function;
use crate::strings::StringEntry;
use crate::xref::XRef;
use crate::{Address, AnalyzerError};

/// Supported export formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ExportFormat {
    /// Plain text dump (default)
    Text,
    /// Comma-separated values
    Csv,
    /// Hierarchical JSON
    Json,
}

impl fmt::Display for ExportFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExportFormat::Text => write!(f, "text"),
            ExportFormat::Csv => write!(f, "csv"),
            ExportFormat::Json => write!(f, "json"),
        }
    }
}

impl FromStr for ExportFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "text" | "txt" => Ok(ExportFormat::Text),
            "csv" => Ok(ExportFormat::Csv),
            "json" => Ok(ExportFormat::Json),
            _ => Err(format!("Unknown export format: {}", s)),
        }
    }
}

impl ExportFormat {
    /// Get a formatter for this format.
    pub fn formatter(&self) -> Box<dyn TableFormatter> {
        match self {
            ExportFormat::Text => Box::new(TextFormatter),
            ExportFormat::Csv => Box::new(CsvFormatter),
            ExportFormat::Json => Box::new(JsonFormatter),
        }
    }
}

/// Borrowed view over everything an export needs.
pub struct AnalysisReport<'a> {
    pub build_id: String,
    pub functions: &'a BTreeMap<Address, Function>,
    pub strings: &'a [StringEntry],
    pub xrefs: &'a [XRef],
}

/// Formatter trait: render a full analysis report to a string.
pub trait TableFormatter {
    fn format(&self, report: &AnalysisReport<'_>) -> Result<String, AnalyzerError>;
}

/// The classic plain-text dump.
pub struct TextFormatter;

impl TableFormatter for TextFormatter {
    fn format(&self, report: &AnalysisReport<'_>) -> Result<String, AnalyzerError> {
        let mut out = String::new();

        out.push_str("KILOADER ANALYSIS DUMP\n");
        out.push_str("======================\n\n");
        let _ = writeln!(out, "Build ID: {}\n", report.build_id);

        out.push_str("STRINGS\n");
        out.push_str("-------\n");
        for s in report.strings {
            let _ = writeln!(out, "0x{:x}: {}", s.address, s.value);
        }
        out.push('\n');

        out.push_str("FUNCTIONS\n");
        out.push_str("---------\n");
        for (addr, func) in report.functions {
            let _ = writeln!(out, "0x{:x}: {} (size: {})", addr, func.name, func.size);
        }
        out.push('\n');

        out.push_str("CROSS-REFERENCES\n");
        out.push_str("----------------\n");
        for xref in report.xrefs {
            let _ = writeln!(
                out,
                "0x{:x} -> 0x{:x} ({})",
                xref.from_address, xref.to_address, xref.description
            );
        }

        Ok(out)
    }
}
