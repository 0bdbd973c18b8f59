use std::fs;
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::Parser;

use scandown::config::AnalysisConfig;
use scandown::database::FunctionTable;
use scandown::decoder::CapstoneDecoder;
use scandown::driver::Analyzer;
use scandown::format::OutputFormat;
use scandown::memory::ImageMemory;
use scandown::parser::GoblinParser;
use scandown::{Address, BinaryParser};

/// Recover basic blocks and function boundaries from executable code.
#[derive(Parser, Debug)]
#[command(name = "scandown", version, about, long_about = None)]
struct Cli {
    /// ELF, PE or Mach-O file to analyse
    path: PathBuf,

    /// Start of an explicit range (hex) instead of every executable section
    #[arg(long, value_parser = parse_hex, requires = "size")]
    base: Option<Address>,

    /// Size of the explicit range (hex)
    #[arg(long, value_parser = parse_hex, requires = "base")]
    size: Option<u64>,

    /// Output format
    #[arg(short, long, value_enum, default_value_t = OutputFormat::Text)]
    format: OutputFormat,

    /// Worker threads per pass (default: logical cores - 1)
    #[arg(short = 'j', long)]
    threads: Option<usize>,

    /// JSON file with analysis settings
    #[arg(long)]
    config: Option<PathBuf>,

    /// Ignore unwind tables, exports and symbols
    #[arg(long)]
    no_metadata: bool,

    /// Follow calls through fixed pointer slots
    #[arg(long)]
    indirect_pointers: bool,

    /// List basic blocks as well as functions
    #[arg(long)]
    blocks: bool,

    /// Debug logging (RUST_LOG overrides)
    #[arg(short, long)]
    verbose: bool,
}

fn parse_hex(s: &str) -> Result<u64, String> {
    let digits = s.trim_start_matches("0x").trim_start_matches("0X");
    u64::from_str_radix(digits, 16).map_err(|e| format!("invalid hex value '{}': {}", s, e))
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose {
        log::LevelFilter::Debug
    } else {
        log::LevelFilter::Info
    };
    env_logger::Builder::new()
        .filter_module("scandown", level)
        .parse_default_env()
        .target(env_logger::Target::Stderr)
        .format_timestamp(None)
        .init();

    let mut config = match &cli.config {
        Some(path) => AnalysisConfig::load(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => AnalysisConfig::default(),
    };
    if let Some(threads) = cli.threads {
        config = config.with_threads(threads);
    }
    if cli.no_metadata {
        config.use_metadata = false;
    }
    if cli.indirect_pointers {
        config.indirect_pointers = true;
    }

    let data = fs::read(&cli.path).with_context(|| format!("reading {}", cli.path.display()))?;
    let metadata = GoblinParser::new()
        .parse(&data)
        .with_context(|| format!("parsing {}", cli.path.display()))?;
    log::debug!(
        "{}: {} sections, {} known functions",
        metadata.architecture,
        metadata.sections.len(),
        metadata.known_functions.len()
    );

    let decoder = CapstoneDecoder::for_architecture(metadata.architecture)?;
    let memory = ImageMemory::from_sections(&metadata.sections, &data);
    let analyzer = Analyzer::new(&memory, &decoder, config).with_metadata(&metadata);

    let mut table = FunctionTable::new();
    let mut reports = Vec::new();

    if let (Some(base), Some(size)) = (cli.base, cli.size) {
        reports.push(analyzer.analyze_range(base, size as usize, &mut table)?);
    } else {
        let sections = metadata.executable_sections();
        if sections.is_empty() {
            bail!("no executable sections in {}", cli.path.display());
        }
        for section in sections {
            match analyzer.analyze_range(section.address, section.size, &mut table) {
                Ok(report) => reports.push(report),
                Err(e) => log::warn!("Skipping {}: {}", section.name, e),
            }
        }
    }

    let output = cli.format.get_formatter().format(&reports, cli.blocks)?;
    print!("{}", output);

    log::info!("{} functions recorded", table.len());
    Ok(())
}
