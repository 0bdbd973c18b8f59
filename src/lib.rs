//! Core IR, traits, and pass plumbing for the Scandown code-region analyser.
//!
//! This library reconstructs basic blocks and function boundaries for a
//! contiguous region of executable memory. Analysis runs in two passes: a
//! parallel linear sweep that partitions the region into basic blocks, followed
//! by a function pass that groups those blocks into functions.
//!
//! # Basic Usage
//!
//! ```rust,no_run
//! use std::fs;
//! use scandown::{
//!     config::AnalysisConfig,
//!     database::FunctionTable,
//!     decoder::CapstoneDecoder,
//!     driver::Analyzer,
//!     memory::ImageMemory,
//!     parser::GoblinParser,
//!     BinaryParser, // Import the trait to bring parse() method into scope
//! };
//!
//! let binary_data = fs::read("path/to/binary").unwrap();
//!
//! let metadata = GoblinParser::new().parse(&binary_data).unwrap();
//! let decoder = CapstoneDecoder::for_architecture(metadata.architecture).unwrap();
//! let memory = ImageMemory::from_sections(&metadata.sections, &binary_data);
//!
//! let analyzer = Analyzer::new(&memory, &decoder, AnalysisConfig::default())
//!     .with_metadata(&metadata);
//!
//! let mut table = FunctionTable::new();
//! for section in metadata.executable_sections() {
//!     let report = analyzer
//!         .analyze_range(section.address, section.size, &mut table)
//!         .unwrap();
//!     println!("{} functions", report.functions.len());
//! }
//! ```

pub mod config;
pub mod database;
pub mod decoder;
pub mod driver;
pub mod format;
pub mod memory;
pub mod metadata;
pub mod parser;
pub mod pass;
#[cfg(test)]
pub(crate) mod testing;

/// Represents an address in memory
pub type Address = u64;

use std::fmt;

/// Maximum instruction size in bytes
pub const MAX_INSTRUCTION_SIZE: usize = 16;

/// How control leaves an instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FlowKind {
    /// Falls through to the next instruction
    Sequential,
    /// Call (direct or indirect)
    Call,
    /// Conditional or unconditional jump
    Jump,
    /// Return
    Return,
    /// Single-purpose alignment filler (`nop`, `int3`)
    Filler,
}

/// The first operand of a branch, reduced to what the passes care about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BranchOperand {
    /// No operand
    None,
    /// Immediate destination
    Immediate(Address),
    /// Register destination
    Register,
    /// Memory-sourced destination
    Memory {
        /// Displacement is relative to the next instruction pointer
        rip_relative: bool,
        /// A base register other than RIP participates in the address
        based: bool,
        /// An index register participates in the address
        indexed: bool,
        /// Raw displacement
        disp: i64,
    },
}

/// One decoded instruction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Insn {
    /// Address of the instruction
    pub addr: Address,
    /// Size of the instruction in bytes
    pub size: u8,
    /// Instruction mnemonic (e.g., "mov", "jmp")
    pub mnemonic: String,
    /// Instruction operands as string representation
    pub operands: String,
    /// Raw bytes of the instruction (up to MAX_INSTRUCTION_SIZE)
    pub bytes: [u8; MAX_INSTRUCTION_SIZE],
    /// Control-flow class
    pub flow: FlowKind,
    /// First operand, for calls and jumps
    pub operand: BranchOperand,
}

impl Insn {
    /// Returns the instruction bytes, up to the actual instruction size.
    pub fn bytes(&self) -> &[u8] {
        &self.bytes[..self.size as usize]
    }

    /// Address right after this instruction
    pub fn end(&self) -> Address {
        self.addr + self.size as Address
    }

    pub fn is_call(&self) -> bool {
        self.flow == FlowKind::Call
    }

    pub fn is_jump(&self) -> bool {
        self.flow == FlowKind::Jump
    }

    pub fn is_return(&self) -> bool {
        self.flow == FlowKind::Return
    }

    pub fn is_padding(&self) -> bool {
        self.flow == FlowKind::Filler
    }

    /// True for the plain `jmp` mnemonic, regardless of operand kind.
    pub fn is_absolute_jump(&self) -> bool {
        self.is_jump() && self.mnemonic.eq_ignore_ascii_case("jmp")
    }

    /// Immediate branch destination, if the operand carries one
    pub fn branch_target(&self) -> Option<Address> {
        match self.operand {
            BranchOperand::Immediate(target) => Some(target),
            _ => None,
        }
    }

    /// Address of the pointer slot an indirect branch reads its destination
    /// from, when that slot is fixed (`[rip + disp]` or `[disp]`).
    pub fn pointer_slot(&self) -> Option<Address> {
        match self.operand {
            BranchOperand::Memory { rip_relative: true, indexed: false, disp, .. } => {
                Some(self.end().wrapping_add(disp as Address))
            }
            BranchOperand::Memory { rip_relative: false, based: false, indexed: false, disp } => {
                Some(disp as Address)
            }
            _ => None,
        }
    }
}

impl fmt::Display for Insn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}\t{}", self.mnemonic, self.operands)
    }
}

/// Decoder trait: architecture-specific disassembler.
pub trait Decoder: Send + Sync {
    /// Decode a single instruction from the start of `bytes`.
    ///
    /// # Arguments
    /// * `bytes` - Window beginning at the instruction; its length bounds the decode
    /// * `address` - Virtual address of the first byte in `bytes`
    ///
    /// # Returns
    /// Some(Insn) if an instruction was successfully decoded, None otherwise
    fn decode(&self, bytes: &[u8], address: Address) -> Option<Insn>;

    /// Architecture this decoder handles
    fn architecture(&self) -> Architecture;
}

bitflags::bitflags! {
    /// Independent facts about a basic block.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct BlockFlags: u32 {
        /// Claimed by a function
        const FUNCTION    = 1 << 0;
        /// Truncated because another block branches into its middle
        const CUTOFF      = 1 << 1;
        /// Pending removal; never visible once a pass returns
        const DELETE      = 1 << 2;
        /// Ends in a call
        const CALL        = 1 << 3;
        /// Ends in a return
        const RET         = 1 << 4;
        /// Ends in a plain `jmp`
        const ABSJMP      = 1 << 5;
        /// Ends in a computed branch
        const INDIRECT    = 1 << 6;
        /// Ends in a branch through a fixed pointer slot; `target` is the slot
        const INDIRPTR    = 1 << 7;
        /// Start of this block is called from somewhere
        const CALL_TARGET = 1 << 8;
        /// Directly precedes a padding run
        const PREPAD      = 1 << 9;
        /// Padding run
        const PAD         = 1 << 10;
    }
}

impl fmt::Display for BlockFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = self.iter_names().map(|(name, _)| name).collect();
        write!(f, "{}", names.join("|"))
    }
}

/// One basic block over the half-open range `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BasicBlock {
    /// First byte of the block
    pub start: Address,
    /// One past the last byte of the block
    pub end: Address,
    pub flags: BlockFlags,
    /// Branch destination (or pointer slot when `INDIRPTR` is set)
    pub target: Option<Address>,
    /// Number of instructions in the block
    pub instruction_count: usize,
}

impl BasicBlock {
    /// Create an unflagged basic block
    pub fn new(start: Address, end: Address) -> Self {
        Self {
            start,
            end,
            flags: BlockFlags::empty(),
            target: None,
            instruction_count: 0,
        }
    }

    /// Get the size of the block in bytes
    pub fn size(&self) -> Address {
        self.end - self.start
    }

    pub fn contains(&self, addr: Address) -> bool {
        self.start <= addr && addr < self.end
    }

    pub fn overlaps(&self, other: &BasicBlock) -> bool {
        self.start.max(other.start) < self.end.min(other.end)
    }

    pub fn has(&self, flag: BlockFlags) -> bool {
        self.flags.contains(flag)
    }

    pub fn set_flag(&mut self, flag: BlockFlags) {
        self.flags.insert(flag);
    }
}

/// A resolved function.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FunctionDef {
    /// Entry address
    pub start: Address,
    /// One past the last byte of the final block
    pub end: Address,
    /// Index of the first block in the block sequence
    pub block_start: usize,
    /// Index of the last block in the block sequence (inclusive)
    pub block_end: usize,
    /// Sum of the instruction counts of the spanned blocks
    pub instruction_count: usize,
}

impl FunctionDef {
    pub fn size(&self) -> Address {
        self.end - self.start
    }

    /// Number of blocks spanned by the function
    pub fn block_count(&self) -> usize {
        self.block_end - self.block_start + 1
    }
}

/// Supported architectures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum Architecture {
    /// 32-bit x86
    X86_32,
    /// 64-bit x86
    X86_64,
    /// ARM (32-bit)
    Arm,
    /// AArch64 (ARM 64-bit)
    AArch64,
    /// Unknown architecture
    Unknown,
}

impl Architecture {
    /// Size of a code pointer in bytes
    pub fn pointer_size(&self) -> usize {
        match self {
            Architecture::X86_64 | Architecture::AArch64 => 8,
            _ => 4,
        }
    }
}

impl fmt::Display for Architecture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Architecture::X86_32 => write!(f, "x86-32"),
            Architecture::X86_64 => write!(f, "x86-64"),
            Architecture::Arm => write!(f, "ARM"),
            Architecture::AArch64 => write!(f, "AArch64"),
            Architecture::Unknown => write!(f, "Unknown"),
        }
    }
}

/// A section in the binary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Section {
    /// Section name
    pub name: String,
    /// Virtual address of the section
    pub address: Address,
    /// Size of the section in memory
    pub size: usize,
    /// Offset of the section's raw data in the file
    pub file_offset: usize,
    /// Number of bytes backed by the file
    pub file_size: usize,
    /// Whether this section contains executable code
    pub executable: bool,
}

impl Section {
    /// Create a new section
    pub fn new(
        name: String,
        address: Address,
        size: usize,
        file_offset: usize,
        file_size: usize,
        executable: bool,
    ) -> Self {
        Self {
            name,
            address,
            size,
            file_offset,
            file_size,
            executable,
        }
    }

    /// Get the end address of this section
    pub fn end_address(&self) -> Address {
        self.address + self.size as Address
    }
}

/// Metadata describing a parsed binary.
#[derive(Debug, Clone)]
pub struct BinaryMetadata {
    /// Detected architecture
    pub architecture: Architecture,
    /// Entry point address, if available
    pub entry_point: Option<Address>,
    /// Load address of the image
    pub image_base: Address,
    /// List of sections found in the binary
    pub sections: Vec<Section>,
    /// Functions described by unwind tables, exports or symbols
    pub known_functions: Vec<metadata::KnownFunction>,
}

impl BinaryMetadata {
    /// Fallback metadata when no headers could be parsed.
    pub fn default_raw() -> Self {
        Self {
            architecture: Architecture::Unknown,
            entry_point: None,
            image_base: 0,
            sections: Vec::new(),
            known_functions: Vec::new(),
        }
    }

    /// Find a section by name
    pub fn find_section(&self, name: &str) -> Option<&Section> {
        self.sections.iter().find(|s| s.name == name)
    }

    /// Get all non-empty executable sections
    pub fn executable_sections(&self) -> Vec<&Section> {
        self.sections
            .iter()
            .filter(|s| s.executable && s.size > 0)
            .collect()
    }

    /// Find the section containing `addr`
    pub fn section_containing(&self, addr: Address) -> Option<&Section> {
        self.sections
            .iter()
            .find(|s| s.address <= addr && addr < s.end_address())
    }
}

/// Parser trait: turn raw bytes into `BinaryMetadata`.
pub trait BinaryParser: Send + Sync {
    /// Parse binary data into metadata
    ///
    /// # Arguments
    /// * `data` - The binary data to parse
    ///
    /// # Returns
    /// Result containing BinaryMetadata if parsing was successful
    fn parse(&self, data: &[u8]) -> Result<BinaryMetadata, AnalysisError>;
}

/// Error type for analysis operations
#[derive(Debug, thiserror::Error)]
pub enum AnalysisError {
    /// Failed to parse binary format
    #[error("Failed to parse binary format: {0}")]
    ParsingError(String),

    /// Decoder error
    #[error("Decoder error: {0}")]
    DecoderError(#[from] decoder::DecoderError),

    /// The analysis range is empty or inverted
    #[error("Invalid analysis range 0x{start:x}..0x{end:x}")]
    InvalidRange { start: Address, end: Address },

    /// The range snapshot could not be read
    #[error("Failed to read {len} bytes at 0x{address:x}")]
    MemoryRead { address: Address, len: usize },

    /// Configuration could not be loaded
    #[error("Invalid configuration: {0}")]
    ConfigError(String),

    /// I/O error
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// Generic error
    #[error("{0}")]
    Generic(String),
}
