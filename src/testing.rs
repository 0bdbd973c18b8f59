//! Test-only helpers: a scripted x86 subset decoder and a tiny assembler for it.

use crate::config::AnalysisConfig;
use crate::memory::ImageMemory;
use crate::pass::{AnalysisPass, FunctionPass, LinearPass};
use crate::{
    Address, Architecture, BasicBlock, BranchOperand, Decoder, FlowKind, FunctionDef, Insn,
    MAX_INSTRUCTION_SIZE,
};

/// Decodes a handful of x86 opcodes, enough to lay out realistic functions.
///
/// | bytes          | instruction        |
/// |----------------|--------------------|
/// | `90`           | nop                |
/// | `cc`           | int3               |
/// | `c3`           | ret                |
/// | `55` `5d` `40` | push/pop ebp, inc  |
/// | `89 e5`        | mov ebp, esp       |
/// | `e8 rel32`     | call               |
/// | `e9 rel32`     | jmp                |
/// | `eb rel8`      | jmp short          |
/// | `74 rel8`      | je                 |
/// | `ff d0`        | call eax           |
/// | `ff 15 abs32`  | call [abs32]       |
/// | `ff 25 abs32`  | jmp [abs32]        |
///
/// Everything else fails to decode.
#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct MiniX86;

fn rel8(bytes: &[u8], next: Address) -> Option<Address> {
    Some(next.wrapping_add(*bytes.get(1)? as i8 as i64 as Address) & 0xffff_ffff)
}

fn imm32(bytes: &[u8], at: usize) -> Option<u32> {
    Some(u32::from_le_bytes(bytes.get(at..at + 4)?.try_into().ok()?))
}

fn rel32(bytes: &[u8], next: Address) -> Option<Address> {
    let disp = imm32(bytes, 1)? as i32 as i64;
    Some(next.wrapping_add(disp as Address) & 0xffff_ffff)
}

impl Decoder for MiniX86 {
    fn decode(&self, bytes: &[u8], address: Address) -> Option<Insn> {
        let op = *bytes.first()?;
        let (size, mnemonic, flow, operand) = match op {
            0x90 => (1, "nop", FlowKind::Filler, BranchOperand::None),
            0xcc => (1, "int3", FlowKind::Filler, BranchOperand::None),
            0xc3 => (1, "ret", FlowKind::Return, BranchOperand::None),
            0x55 => (1, "push", FlowKind::Sequential, BranchOperand::None),
            0x5d => (1, "pop", FlowKind::Sequential, BranchOperand::None),
            0x40 => (1, "inc", FlowKind::Sequential, BranchOperand::None),
            0x89 if bytes.get(1) == Some(&0xe5) => (2, "mov", FlowKind::Sequential, BranchOperand::None),
            0xe8 => (5, "call", FlowKind::Call, BranchOperand::Immediate(rel32(bytes, address + 5)?)),
            0xe9 => (5, "jmp", FlowKind::Jump, BranchOperand::Immediate(rel32(bytes, address + 5)?)),
            0xeb => (2, "jmp", FlowKind::Jump, BranchOperand::Immediate(rel8(bytes, address + 2)?)),
            0x74 => (2, "je", FlowKind::Jump, BranchOperand::Immediate(rel8(bytes, address + 2)?)),
            0xff => match *bytes.get(1)? {
                0xd0 => (2, "call", FlowKind::Call, BranchOperand::Register),
                modrm @ (0x15 | 0x25) => {
                    let slot = BranchOperand::Memory {
                        rip_relative: false,
                        based: false,
                        indexed: false,
                        disp: imm32(bytes, 2)? as i64,
                    };
                    if modrm == 0x15 {
                        (6, "call", FlowKind::Call, slot)
                    } else {
                        (6, "jmp", FlowKind::Jump, slot)
                    }
                }
                _ => return None,
            },
            _ => return None,
        };

        let size: usize = size;
        let raw = bytes.get(..size)?;
        let mut buf = [0u8; MAX_INSTRUCTION_SIZE];
        buf[..size].copy_from_slice(raw);

        Some(Insn {
            addr: address,
            size: size as u8,
            mnemonic: mnemonic.to_string(),
            operands: String::new(),
            bytes: buf,
            flow,
            operand,
        })
    }

    fn architecture(&self) -> Architecture {
        Architecture::X86_32
    }
}

/// Assembler for [`MiniX86`] code placed at a fixed base.
#[derive(Debug, Clone)]
pub(crate) struct Asm {
    base: Address,
    code: Vec<u8>,
}

impl Asm {
    pub fn new(base: Address) -> Self {
        Self { base, code: Vec::new() }
    }

    /// Address of the next emitted byte
    pub fn here(&self) -> Address {
        self.base + self.code.len() as Address
    }

    pub fn raw(&mut self, bytes: &[u8]) -> &mut Self {
        self.code.extend_from_slice(bytes);
        self
    }

    pub fn nop(&mut self) -> &mut Self {
        self.raw(&[0x90])
    }

    pub fn int3(&mut self, count: usize) -> &mut Self {
        self.code.extend(std::iter::repeat(0xcc).take(count));
        self
    }

    pub fn ret(&mut self) -> &mut Self {
        self.raw(&[0xc3])
    }

    pub fn push_ebp(&mut self) -> &mut Self {
        self.raw(&[0x55])
    }

    pub fn pop_ebp(&mut self) -> &mut Self {
        self.raw(&[0x5d])
    }

    pub fn inc(&mut self) -> &mut Self {
        self.raw(&[0x40])
    }

    pub fn mov_ebp_esp(&mut self) -> &mut Self {
        self.raw(&[0x89, 0xe5])
    }

    /// `push ebp; mov ebp, esp`
    pub fn prologue(&mut self) -> &mut Self {
        self.push_ebp().mov_ebp_esp()
    }

    pub fn call(&mut self, target: Address) -> &mut Self {
        let disp = target.wrapping_sub(self.here() + 5) as u32;
        self.raw(&[0xe8]).raw(&disp.to_le_bytes())
    }

    pub fn jmp(&mut self, target: Address) -> &mut Self {
        let disp = target.wrapping_sub(self.here() + 5) as u32;
        self.raw(&[0xe9]).raw(&disp.to_le_bytes())
    }

    pub fn jmp_short(&mut self, target: Address) -> &mut Self {
        let disp = target.wrapping_sub(self.here() + 2) as i8;
        self.raw(&[0xeb, disp as u8])
    }

    pub fn je(&mut self, target: Address) -> &mut Self {
        let disp = target.wrapping_sub(self.here() + 2) as i8;
        self.raw(&[0x74, disp as u8])
    }

    pub fn call_eax(&mut self) -> &mut Self {
        self.raw(&[0xff, 0xd0])
    }

    pub fn call_ptr(&mut self, slot: u32) -> &mut Self {
        self.raw(&[0xff, 0x15]).raw(&slot.to_le_bytes())
    }

    pub fn jmp_ptr(&mut self, slot: u32) -> &mut Self {
        self.raw(&[0xff, 0x25]).raw(&slot.to_le_bytes())
    }

    /// Emit `int3` until `addr`
    pub fn pad_to(&mut self, addr: Address) -> &mut Self {
        assert!(addr >= self.here(), "cannot pad backwards to 0x{:x}", addr);
        let count = (addr - self.here()) as usize;
        self.int3(count)
    }

    pub fn base(&self) -> Address {
        self.base
    }

    pub fn end(&self) -> Address {
        self.here()
    }

    pub fn bytes(&self) -> &[u8] {
        &self.code
    }

    pub fn memory(&self) -> ImageMemory {
        ImageMemory::flat(self.base, self.code.clone())
    }
}

/// Run the linear pass alone over the whole of `asm`.
pub(crate) fn linear_blocks(asm: &Asm, config: &AnalysisConfig) -> Vec<BasicBlock> {
    let memory = asm.memory();
    let mut blocks = Vec::new();
    LinearPass::new(&memory, &MiniX86, asm.base(), asm.end(), &mut blocks, config)
        .expect("linear pass")
        .analyse();
    blocks
}

/// Run both passes over `memory[start..end)` without module metadata.
pub(crate) fn analyse_memory(
    memory: &ImageMemory,
    start: Address,
    end: Address,
    config: &AnalysisConfig,
) -> (Vec<BasicBlock>, Vec<FunctionDef>) {
    let mut blocks = Vec::new();
    LinearPass::new(memory, &MiniX86, start, end, &mut blocks, config)
        .expect("linear pass")
        .analyse();

    let mut pass = FunctionPass::new(memory, start, end, &mut blocks, config)
        .expect("function pass")
        .with_pointer_size(MiniX86.architecture().pointer_size());
    pass.analyse();
    let functions = pass.into_functions();

    (blocks, functions)
}

/// Run both passes over all of `asm`.
pub(crate) fn analyse(asm: &Asm, config: &AnalysisConfig) -> (Vec<BasicBlock>, Vec<FunctionDef>) {
    analyse_memory(&asm.memory(), asm.base(), asm.end(), config)
}

/// Single-threaded configuration
pub(crate) fn serial() -> AnalysisConfig {
    AnalysisConfig::default().with_threads(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mini_decoder_targets() {
        let mut asm = Asm::new(0x1000);
        asm.call(0x1020).jmp_short(0x1000).je(0x1010);

        let code = asm.bytes();
        let call = MiniX86.decode(code, 0x1000).unwrap();
        assert_eq!(call.branch_target(), Some(0x1020));

        let jmp = MiniX86.decode(&code[5..], 0x1005).unwrap();
        assert!(jmp.is_absolute_jump());
        assert_eq!(jmp.branch_target(), Some(0x1000));

        let je = MiniX86.decode(&code[7..], 0x1007).unwrap();
        assert!(!je.is_absolute_jump());
        assert_eq!(je.branch_target(), Some(0x1010));
    }

    #[test]
    fn test_mini_decoder_rejects_unknown() {
        assert!(MiniX86.decode(&[0x0f, 0x0b], 0).is_none());
        assert!(MiniX86.decode(&[0xff, 0x00], 0).is_none());
        assert!(MiniX86.decode(&[0xe8, 0x00, 0x00], 0).is_none());
        assert!(MiniX86.decode(&[], 0).is_none());
    }

    #[test]
    fn test_pointer_slot_operand() {
        let insn = MiniX86.decode(&[0xff, 0x15, 0x00, 0x20, 0x00, 0x00], 0x1000).unwrap();
        assert!(insn.is_call());
        assert_eq!(insn.pointer_slot(), Some(0x2000));
    }
}
