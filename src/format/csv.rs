//! CSV output formatter

use crate::driver::AnalysisReport;
use crate::AnalysisError;
use super::{block_target, hex, ReportFormatter};

const HEADER: [&str; 8] = [
    "base_address",
    "kind",
    "start",
    "end",
    "instructions",
    "blocks",
    "flags",
    "target",
];

fn csv_error(e: impl std::fmt::Display) -> AnalysisError {
    AnalysisError::Generic(format!("CSV serialization error: {}", e))
}

impl ReportFormatter for super::CsvFormatter {
    fn format(&self, reports: &[AnalysisReport], include_blocks: bool) -> Result<String, AnalysisError> {
        let mut writer = csv::Writer::from_writer(Vec::new());
        writer.write_record(HEADER).map_err(csv_error)?;

        for report in reports {
            let base_address = hex(report.base);

            for function in &report.functions {
                writer
                    .write_record(&[
                        base_address.clone(),
                        "function".to_string(),
                        hex(function.start),
                        hex(function.end),
                        function.instruction_count.to_string(),
                        function.block_count().to_string(),
                        String::new(),
                        String::new(),
                    ])
                    .map_err(csv_error)?;
            }

            if include_blocks {
                for block in &report.blocks {
                    writer
                        .write_record(&[
                            base_address.clone(),
                            "block".to_string(),
                            hex(block.start),
                            hex(block.end),
                            block.instruction_count.to_string(),
                            "1".to_string(),
                            block.flags.to_string(),
                            block_target(block),
                        ])
                        .map_err(csv_error)?;
                }
            }
        }

        let bytes = writer.into_inner().map_err(csv_error)?;
        String::from_utf8(bytes).map_err(csv_error)
    }
}
