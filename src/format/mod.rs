//! Output formats for analysis reports

mod json;
mod csv;

pub use self::json::*;
pub use self::csv::*;

use std::fmt;
use std::fmt::Write as _;
use std::str::FromStr;
use clap::ValueEnum;

use crate::driver::AnalysisReport;
use crate::{Address, AnalysisError, BasicBlock};

/// Supported output formats for analysis results
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum OutputFormat {
    /// Plain text output (default)
    #[default]
    Text,
    /// JSON format (hierarchical)
    Json,
    /// JSON Lines format (one JSON object per line)
    JsonLines,
    /// CSV format (comma-separated values)
    Csv,
}

impl fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OutputFormat::Text => write!(f, "text"),
            OutputFormat::Json => write!(f, "json"),
            OutputFormat::JsonLines => write!(f, "jsonl"),
            OutputFormat::Csv => write!(f, "csv"),
        }
    }
}

impl FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "text" => Ok(OutputFormat::Text),
            "json" => Ok(OutputFormat::Json),
            "jsonl" | "jsonlines" => Ok(OutputFormat::JsonLines),
            "csv" => Ok(OutputFormat::Csv),
            _ => Err(format!("Unknown output format: {}", s)),
        }
    }
}

impl OutputFormat {
    /// Get all available output formats
    pub fn available_formats() -> &'static [Self] {
        &[
            OutputFormat::Text,
            OutputFormat::Json,
            OutputFormat::JsonLines,
            OutputFormat::Csv,
        ]
    }

    /// Get a formatter for this output format
    pub fn get_formatter(&self) -> Box<dyn ReportFormatter> {
        match self {
            OutputFormat::Text => Box::new(TextFormatter),
            OutputFormat::Json => Box::new(JsonFormatter),
            OutputFormat::JsonLines => Box::new(JsonLinesFormatter),
            OutputFormat::Csv => Box::new(CsvFormatter),
        }
    }
}

/// Formatter trait for analysis output
pub trait ReportFormatter {
    /// Render one report per analysed range; blocks are listed only on request.
    fn format(&self, reports: &[AnalysisReport], include_blocks: bool) -> Result<String, AnalysisError>;
}

/// Format reports in plain text
pub struct TextFormatter;

/// Format reports in JSON
pub struct JsonFormatter;

/// Format reports in JSON Lines
pub struct JsonLinesFormatter;

/// Format reports in CSV
pub struct CsvFormatter;

fn hex(addr: Address) -> String {
    format!("0x{:x}", addr)
}

fn block_target(block: &BasicBlock) -> String {
    block.target.map(hex).unwrap_or_default()
}

impl ReportFormatter for TextFormatter {
    fn format(&self, reports: &[AnalysisReport], include_blocks: bool) -> Result<String, AnalysisError> {
        let mut output = String::new();

        for report in reports {
            // Writing to a String cannot fail
            let _ = writeln!(
                output,
                "Range 0x{:08x}-0x{:08x}: {} blocks, {} functions\n",
                report.base,
                report.end(),
                report.blocks.len(),
                report.functions.len()
            );

            for function in &report.functions {
                let _ = writeln!(
                    output,
                    "  0x{:08x}-0x{:08x}  {:>6} insns  {:>4} blocks",
                    function.start,
                    function.end,
                    function.instruction_count,
                    function.block_count()
                );
            }

            if include_blocks {
                output.push_str("\n  Blocks:\n");
                for block in &report.blocks {
                    let _ = writeln!(
                        output,
                        "  0x{:08x}-0x{:08x}  {:>4}  {:<28} {}",
                        block.start,
                        block.end,
                        block.instruction_count,
                        block.flags.to_string(),
                        block_target(block)
                    );
                }
            }

            output.push('\n');
        }

        Ok(output)
    }
}
