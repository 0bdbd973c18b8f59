//! Capstone-based instruction decoder for x86 code.

use std::cell::RefCell;
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::fmt;

use capstone::arch::x86::{ArchMode as X86Mode, X86OperandType, X86Reg};
use capstone::prelude::*;
use capstone::{Capstone, InsnGroupId, InsnGroupType};

use crate::{Address, Architecture, BranchOperand, Decoder, FlowKind, Insn, MAX_INSTRUCTION_SIZE};

/// Errors that can occur while setting up a decoder
#[derive(Debug, thiserror::Error)]
pub enum DecoderError {
    /// Capstone error
    #[error("Capstone error: {0}")]
    CapstoneError(#[from] capstone::Error),

    /// Unsupported architecture
    #[error("Unsupported architecture: {0}")]
    UnsupportedArchitecture(Architecture),
}

thread_local! {
    // Capstone handles are not shareable across threads; each worker builds its own.
    static CS_POOL: RefCell<HashMap<Architecture, Capstone>> = RefCell::new(HashMap::new());
}

/// A Capstone-backed decoder with operand detail enabled.
///
/// The decoder itself only carries the architecture. The native handles live in a
/// per-thread pool, so one `CapstoneDecoder` can be shared by every pass worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CapstoneDecoder {
    arch: Architecture,
}

impl CapstoneDecoder {
    /// Create a decoder for a specific architecture
    pub fn for_architecture(arch: Architecture) -> Result<Self, DecoderError> {
        // Fail early on this thread rather than silently on every decode later.
        build_capstone(arch)?;
        Ok(Self { arch })
    }

    fn classify(cs: &Capstone, insn: &capstone::Insn, arch: Architecture) -> Option<(FlowKind, BranchOperand)> {
        let mnemonic = insn.mnemonic().unwrap_or("");
        if mnemonic == "nop" || mnemonic == "int3" {
            return Some((FlowKind::Filler, BranchOperand::None));
        }

        let detail = cs.insn_detail(insn).ok()?;
        let in_group = |group: u8| detail.groups().iter().any(|g| *g == InsnGroupId(group));

        let flow = if in_group(InsnGroupType::CS_GRP_CALL as u8) {
            FlowKind::Call
        } else if in_group(InsnGroupType::CS_GRP_JUMP as u8) {
            FlowKind::Jump
        } else if in_group(InsnGroupType::CS_GRP_RET as u8) {
            FlowKind::Return
        } else {
            return Some((FlowKind::Sequential, BranchOperand::None));
        };

        if flow == FlowKind::Return {
            return Some((flow, BranchOperand::None));
        }

        let arch_detail = detail.arch_detail();
        let operand = match arch_detail.x86().and_then(|x86| x86.operands().next()) {
            None => BranchOperand::None,
            Some(op) => match op.op_type {
                X86OperandType::Imm(imm) => BranchOperand::Immediate(truncate(arch, imm as u64)),
                X86OperandType::Reg(_) => BranchOperand::Register,
                X86OperandType::Mem(mem) => {
                    let base = mem.base().0;
                    let rip_relative = base == X86Reg::X86_REG_RIP as u16;
                    let disp = match arch {
                        // Capstone sign-extends 32-bit displacements
                        Architecture::X86_32 => mem.disp() as u32 as i64,
                        _ => mem.disp(),
                    };
                    BranchOperand::Memory {
                        rip_relative,
                        based: base != 0 && !rip_relative,
                        indexed: mem.index().0 != 0,
                        disp,
                    }
                }
                _ => BranchOperand::Register,
            },
        };

        Some((flow, operand))
    }
}

fn truncate(arch: Architecture, value: Address) -> Address {
    match arch {
        Architecture::X86_32 => value & 0xffff_ffff,
        _ => value,
    }
}

/// Build a detail-enabled Capstone handle
fn build_capstone(arch: Architecture) -> Result<Capstone, DecoderError> {
    let mode = match arch {
        Architecture::X86_32 => X86Mode::Mode32,
        Architecture::X86_64 => X86Mode::Mode64,
        other => return Err(DecoderError::UnsupportedArchitecture(other)),
    };

    Ok(Capstone::new()
        .x86()
        .mode(mode)
        .detail(true)
        .build()?)
}

impl fmt::Display for CapstoneDecoder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CapstoneDecoder::{}", self.arch)
    }
}

impl Decoder for CapstoneDecoder {
    fn decode(&self, bytes: &[u8], address: Address) -> Option<Insn> {
        if bytes.is_empty() {
            return None;
        }
        let window = &bytes[..bytes.len().min(MAX_INSTRUCTION_SIZE)];

        CS_POOL.with(|cell| {
            let mut pool = cell.borrow_mut();
            let cs: &Capstone = match pool.entry(self.arch) {
                Entry::Occupied(e) => e.into_mut(),
                Entry::Vacant(e) => e.insert(build_capstone(self.arch).ok()?),
            };

            let insns = cs.disasm_count(window, address, 1).ok()?;
            let i = insns.iter().next()?;
            if i.address() != address || i.bytes().is_empty() {
                return None;
            }

            let (flow, operand) = Self::classify(cs, &i, self.arch)?;

            let mut raw = [0u8; MAX_INSTRUCTION_SIZE];
            for (j, b) in i.bytes().iter().enumerate().take(MAX_INSTRUCTION_SIZE) {
                raw[j] = *b;
            }

            Some(Insn {
                addr: i.address(),
                size: i.bytes().len() as u8,
                mnemonic: i.mnemonic().unwrap_or("").to_string(),
                operands: i.op_str().unwrap_or("").to_string(),
                bytes: raw,
                flow,
                operand,
            })
        })
    }

    fn architecture(&self) -> Architecture {
        self.arch
    }
}
