//! Runs the passes over a range and publishes the result.

use std::time::Instant;

use crate::config::AnalysisConfig;
use crate::database::FunctionSink;
use crate::memory::MemoryReader;
use crate::metadata::ModuleMetadata;
use crate::pass::{AnalysisPass, FunctionPass, LinearPass};
use crate::{Address, AnalysisError, BasicBlock, Decoder, FunctionDef};

/// Everything one run produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnalysisReport {
    pub base: Address,
    pub size: usize,
    /// Sorted, non-overlapping blocks
    pub blocks: Vec<BasicBlock>,
    /// Functions sorted by start, unique per start
    pub functions: Vec<FunctionDef>,
}

impl AnalysisReport {
    pub fn end(&self) -> Address {
        self.base + self.size as Address
    }

    /// Total instructions attributed to functions
    pub fn instruction_count(&self) -> usize {
        self.functions.iter().map(|f| f.instruction_count).sum()
    }
}

/// Analysis entry point bound to a memory image and a decoder.
pub struct Analyzer<'a> {
    memory: &'a dyn MemoryReader,
    decoder: &'a dyn Decoder,
    metadata: Option<&'a dyn ModuleMetadata>,
    config: AnalysisConfig,
}

impl<'a> Analyzer<'a> {
    pub fn new(memory: &'a dyn MemoryReader, decoder: &'a dyn Decoder, config: AnalysisConfig) -> Self {
        Self { memory, decoder, metadata: None, config }
    }

    /// Module tables to seed function starts from (ignored unless `use_metadata`)
    pub fn with_metadata(mut self, metadata: &'a dyn ModuleMetadata) -> Self {
        self.metadata = Some(metadata);
        self
    }

    pub fn config(&self) -> &AnalysisConfig {
        &self.config
    }

    /// Analyse `[base, base + size)` and publish its functions into `sink`.
    ///
    /// Blocks until both passes finish. Functions previously recorded in the
    /// range are replaced.
    pub fn analyze_range(
        &self,
        base: Address,
        size: usize,
        sink: &mut dyn FunctionSink,
    ) -> Result<AnalysisReport, AnalysisError> {
        let end = base
            .checked_add(size as Address)
            .filter(|end| *end > base)
            .ok_or(AnalysisError::InvalidRange { start: base, end: base.wrapping_add(size as Address) })?;

        let timer = Instant::now();
        log::info!("Starting analysis of 0x{:x}..0x{:x} ({} bytes)", base, end, size);

        let mut blocks = Vec::new();
        LinearPass::new(self.memory, self.decoder, base, end, &mut blocks, &self.config)?.analyse();

        let mut pass = FunctionPass::new(self.memory, base, end, &mut blocks, &self.config)?
            .with_pointer_size(self.decoder.architecture().pointer_size());
        if self.config.use_metadata {
            if let Some(metadata) = self.metadata {
                pass = pass.with_metadata(metadata);
            }
        }
        pass.analyse();
        let functions = pass.into_functions();

        log::info!("{} functions", functions.len());

        sink.clear_functions(base, end);
        for function in &functions {
            sink.add_function(function.start, function.end, function.instruction_count);
        }
        sink.refresh();

        log::info!(
            "Analysis finished in {} ms ({} blocks)",
            timer.elapsed().as_millis(),
            blocks.len()
        );

        Ok(AnalysisReport { base, size, blocks, functions })
    }
}
