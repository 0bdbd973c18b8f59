//! Goblin-based multi-format binary parser.
//!
//! Besides the section layout needed to map an image into memory, the parser
//! collects every function the file describes on its own: PE unwind entries and
//! exports, and ELF function symbols.

use std::fmt;
use goblin::{elf, pe, Object};
use goblin::mach::{Mach, MachO, constants::cputype};

use crate::metadata::{FunctionSource, KnownFunction};
use crate::{Address, AnalysisError, Architecture, BinaryMetadata, BinaryParser, Section};

/// A parser that handles ELF, PE, and Mach-O via Goblin.
#[derive(Debug, Default)]
pub struct GoblinParser;

impl GoblinParser {
    /// Construct a new GoblinParser.
    pub fn new() -> Self {
        GoblinParser
    }

    /// Parse an ELF image.
    fn parse_elf(&self, elf: elf::Elf) -> Result<BinaryMetadata, AnalysisError> {
        let arch = match elf.header.e_machine {
            elf::header::EM_386     => Architecture::X86_32,
            elf::header::EM_X86_64  => Architecture::X86_64,
            elf::header::EM_ARM     => Architecture::Arm,
            elf::header::EM_AARCH64 => Architecture::AArch64,
            _                       => Architecture::Unknown,
        };

        let mut sections = Vec::new();
        for sh in &elf.section_headers {
            if sh.sh_addr == 0 {
                continue;
            }
            let name = elf.shdr_strtab.get_at(sh.sh_name).unwrap_or("").to_string();
            let file_size = if sh.sh_type == elf::section_header::SHT_NOBITS {
                0
            } else {
                sh.sh_size as usize
            };
            sections.push(Section::new(
                name,
                sh.sh_addr,
                sh.sh_size as usize,
                sh.sh_offset as usize,
                file_size,
                sh.is_executable(),
            ));
        }

        let mut known_functions = Vec::new();
        for sym in elf.syms.iter() {
            if !sym.is_function() || sym.st_value == 0 || sym.st_shndx == elf::section_header::SHN_UNDEF as usize {
                continue;
            }
            let name = elf.strtab.get_at(sym.st_name).filter(|n| !n.is_empty());
            known_functions.push(KnownFunction {
                name: name.map(str::to_string),
                start: sym.st_value,
                end: (sym.st_size > 0).then(|| sym.st_value + sym.st_size),
                source: FunctionSource::Symbol,
            });
        }

        Ok(BinaryMetadata {
            architecture: arch,
            entry_point:  Some(elf.entry),
            image_base:   0,
            sections,
            known_functions,
        })
    }

    /// Parse a PE image.
    fn parse_pe(&self, pe: pe::PE<'_>) -> Result<BinaryMetadata, AnalysisError> {
        let arch = match pe.header.coff_header.machine {
            pe::header::COFF_MACHINE_X86    => Architecture::X86_32,
            pe::header::COFF_MACHINE_X86_64 => Architecture::X86_64,
            pe::header::COFF_MACHINE_ARM    => Architecture::Arm,
            pe::header::COFF_MACHINE_ARM64  => Architecture::AArch64,
            _                               => Architecture::Unknown,
        };
        let image_base = pe.image_base as Address;

        let mut sections = Vec::new();
        for sect in &pe.sections {
            let name = sect.name().unwrap_or("").to_string();
            let executable = (sect.characteristics & pe::section_table::IMAGE_SCN_MEM_EXECUTE) != 0;
            let size = if sect.virtual_size == 0 {
                sect.size_of_raw_data
            } else {
                sect.virtual_size
            };
            sections.push(Section::new(
                name,
                image_base + sect.virtual_address as Address,
                size as usize,
                sect.pointer_to_raw_data as usize,
                sect.size_of_raw_data as usize,
                executable,
            ));
        }

        let mut known_functions = Vec::new();

        // RUNTIME_FUNCTION entries carry both ends
        if let Some(exceptions) = &pe.exception_data {
            for function in exceptions.functions().flatten() {
                if function.end_address <= function.begin_address {
                    continue;
                }
                known_functions.push(KnownFunction {
                    name: None,
                    start: image_base + function.begin_address as Address,
                    end: Some(image_base + function.end_address as Address),
                    source: FunctionSource::ExceptionTable,
                });
            }
        }

        for export in &pe.exports {
            if export.rva == 0 {
                continue;
            }
            known_functions.push(KnownFunction {
                name: export.name.map(str::to_string),
                start: image_base + export.rva as Address,
                end: None,
                source: FunctionSource::Export,
            });
        }

        Ok(BinaryMetadata {
            architecture: arch,
            entry_point:  Some(image_base + pe.entry as Address),
            image_base,
            sections,
            known_functions,
        })
    }

    /// Parse a Mach-O binary
    fn parse_macho(&self, macho: &MachO) -> Result<BinaryMetadata, AnalysisError> {
        let arch = match macho.header.cputype {
            cputype::CPU_TYPE_I386   => Architecture::X86_32,
            cputype::CPU_TYPE_X86_64 => Architecture::X86_64,
            cputype::CPU_TYPE_ARM    => Architecture::Arm,
            cputype::CPU_TYPE_ARM64  => Architecture::AArch64,
            _                        => Architecture::Unknown,
        };

        // Segments are mapped whole; section granularity isn't needed for analysis
        let mut sections = Vec::new();
        for segment in &macho.segments {
            // VM_PROT_EXECUTE
            let is_executable = (segment.maxprot & 0x4) != 0;
            sections.push(Section::new(
                segment.name().unwrap_or("").to_string(),
                segment.vmaddr as Address,
                segment.vmsize as usize,
                segment.fileoff as usize,
                segment.filesize as usize,
                is_executable,
            ));
        }

        Ok(BinaryMetadata {
            architecture: arch,
            entry_point:  Some(macho.entry as Address),
            image_base:   0,
            sections,
            known_functions: Vec::new(),
        })
    }

    /// Parse a Mach-O image.
    fn parse_mach(&self, m: Mach<'_>) -> Result<BinaryMetadata, AnalysisError> {
        match m {
            Mach::Binary(binary) => self.parse_macho(&binary),
            Mach::Fat(_) => Err(AnalysisError::ParsingError(
                "Fat Mach-O archives must be thinned first".into(),
            )),
        }
    }
}

impl fmt::Display for GoblinParser {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "GoblinParser")
    }
}

impl BinaryParser for GoblinParser {
    fn parse(&self, data: &[u8]) -> Result<BinaryMetadata, AnalysisError> {
        match Object::parse(data) {
            Ok(Object::Elf(elf)) => self.parse_elf(elf),
            Ok(Object::PE(pe)) => self.parse_pe(pe),
            Ok(Object::Mach(m)) => self.parse_mach(m),
            Ok(_) => Err(AnalysisError::ParsingError("Unsupported file format".into())),
            Err(e) => Err(AnalysisError::ParsingError(e.to_string())),
        }
    }
}
