//! JSON and JSON Lines output formatters

use serde::Serialize;
use serde_json::json;

use crate::driver::AnalysisReport;
use crate::{AnalysisError, BasicBlock, FunctionDef};
use super::{block_target, hex, ReportFormatter};

/// Serializable function for JSON output
#[derive(Serialize)]
struct FunctionJson {
    /// Entry address
    start: String,
    /// Exclusive end address
    end: String,
    instructions: usize,
    blocks: usize,
}

/// Serializable basic block for JSON output
#[derive(Serialize)]
struct BlockJson {
    start: String,
    end: String,
    instructions: usize,
    /// Flag names, e.g. `["CALL", "FUNCTION"]`
    flags: Vec<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    target: Option<String>,
}

/// Serializable analysed range for JSON output
#[derive(Serialize)]
struct RangeJson {
    base_address: String,
    end_address: String,
    functions: Vec<FunctionJson>,
    #[serde(skip_serializing_if = "Option::is_none")]
    blocks: Option<Vec<BlockJson>>,
}

/// Serializable analysis result for JSON output
#[derive(Serialize)]
struct AnalysisJson {
    ranges: Vec<RangeJson>,
}

fn json_error(e: serde_json::Error) -> AnalysisError {
    AnalysisError::Generic(format!("JSON serialization error: {}", e))
}

impl ReportFormatter for super::JsonFormatter {
    fn format(&self, reports: &[AnalysisReport], include_blocks: bool) -> Result<String, AnalysisError> {
        let ranges = reports
            .iter()
            .map(|report| RangeJson {
                base_address: hex(report.base),
                end_address: hex(report.end()),
                functions: report.functions.iter().map(function_to_json).collect(),
                blocks: include_blocks.then(|| report.blocks.iter().map(block_to_json).collect()),
            })
            .collect();

        serde_json::to_string_pretty(&AnalysisJson { ranges }).map_err(json_error)
    }
}

impl ReportFormatter for super::JsonLinesFormatter {
    fn format(&self, reports: &[AnalysisReport], include_blocks: bool) -> Result<String, AnalysisError> {
        let mut output = String::new();

        for report in reports {
            let base_address = hex(report.base);

            for function in &report.functions {
                let line = json!({
                    "type": "function",
                    "base_address": base_address,
                    "start": hex(function.start),
                    "end": hex(function.end),
                    "instructions": function.instruction_count,
                    "blocks": function.block_count(),
                });
                output.push_str(&serde_json::to_string(&line).map_err(json_error)?);
                output.push('\n');
            }

            if include_blocks {
                for block in &report.blocks {
                    let line = json!({
                        "type": "block",
                        "base_address": base_address,
                        "start": hex(block.start),
                        "end": hex(block.end),
                        "instructions": block.instruction_count,
                        "flags": flag_names(block),
                        "target": block_target(block),
                    });
                    output.push_str(&serde_json::to_string(&line).map_err(json_error)?);
                    output.push('\n');
                }
            }
        }

        Ok(output)
    }
}

fn flag_names(block: &BasicBlock) -> Vec<&'static str> {
    block.flags.iter_names().map(|(name, _)| name).collect()
}

/// Convert a function to JSON format
fn function_to_json(function: &FunctionDef) -> FunctionJson {
    FunctionJson {
        start: hex(function.start),
        end: hex(function.end),
        instructions: function.instruction_count,
        blocks: function.block_count(),
    }
}

/// Convert a basic block to JSON format
fn block_to_json(block: &BasicBlock) -> BlockJson {
    BlockJson {
        start: hex(block.start),
        end: hex(block.end),
        instructions: block.instruction_count,
        flags: flag_names(block),
        target: block.target.map(hex),
    }
}
