//! Function boundary pass.
//!
//! Function starts come from call targets and, when available, from module
//! metadata. Each start is closed off by walking the sorted block sequence
//! forward until the code provably leaves the function. Blocks nobody claimed
//! are swept up afterwards as functions of their own.

use std::time::Instant;

use rayon::prelude::*;

use super::{find_block_in_range, find_block_index, index_slices, AnalysisPass, PassBase};
use crate::config::AnalysisConfig;
use crate::memory::MemoryReader;
use crate::metadata::ModuleMetadata;
use crate::{Address, AnalysisError, BasicBlock, BlockFlags, FunctionDef};

/// Function discovery over the output of the linear pass.
pub struct FunctionPass<'a> {
    base: PassBase,
    blocks: &'a mut Vec<BasicBlock>,
    memory: &'a dyn MemoryReader,
    metadata: Option<&'a dyn ModuleMetadata>,
    pointer_size: usize,
    functions: Vec<FunctionDef>,
}

/// A function start waiting for its end.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Candidate {
    start: Address,
    known_end: Option<Address>,
}

/// Read-only state shared by the workers of one phase.
struct Scope<'s> {
    base: &'s PassBase,
    blocks: &'s [BasicBlock],
    memory: &'s dyn MemoryReader,
    pointer_size: usize,
}

impl<'a> FunctionPass<'a> {
    pub fn new(
        memory: &'a dyn MemoryReader,
        start: Address,
        end: Address,
        blocks: &'a mut Vec<BasicBlock>,
        config: &AnalysisConfig,
    ) -> Result<Self, AnalysisError> {
        let mut base = PassBase::new(memory, start, end)?;
        if let Some(threads) = config.threads {
            base.set_ideal_thread_count(threads);
        }

        Ok(Self {
            base,
            blocks,
            memory,
            metadata: None,
            pointer_size: std::mem::size_of::<usize>(),
            functions: Vec::new(),
        })
    }

    /// Seed starts (and known ends) from module tables as well
    pub fn with_metadata(mut self, metadata: &'a dyn ModuleMetadata) -> Self {
        self.metadata = Some(metadata);
        self
    }

    /// Width of the pointers read through `INDIRPTR` slots
    pub fn with_pointer_size(mut self, size: usize) -> Self {
        self.pointer_size = size;
        self
    }

    /// Functions found by the last run, sorted by start
    pub fn functions(&self) -> &[FunctionDef] {
        &self.functions
    }

    pub fn into_functions(self) -> Vec<FunctionDef> {
        self.functions
    }

    pub fn find_block_in_range(&self, addr: Address) -> Option<&BasicBlock> {
        find_block_in_range(&self.blocks[..], addr)
    }

    /// Starts the module itself describes, in table order
    fn known_candidates(&self) -> Vec<Candidate> {
        let Some(metadata) = self.metadata else {
            return Vec::new();
        };

        let mut known: Vec<Candidate> = metadata
            .exception_entries()
            .into_iter()
            .chain(metadata.sized_symbols())
            .map(|(start, end)| Candidate { start, known_end: Some(end) })
            .collect();
        known.extend(
            metadata
                .exports()
                .into_iter()
                .map(|(_, start)| Candidate { start, known_end: None }),
        );

        known
    }

    /// Fork over block slices, join, and flag every claimed block.
    fn run_phase<F>(&mut self, worker: F) -> Vec<FunctionDef>
    where
        F: Fn(&Scope<'_>, usize, usize) -> Vec<FunctionDef> + Sync,
    {
        let threads = self.base.ideal_thread_count();
        let found: Vec<FunctionDef> = {
            let scope = Scope {
                base: &self.base,
                blocks: &self.blocks[..],
                memory: self.memory,
                pointer_size: self.pointer_size,
            };
            index_slices(scope.blocks.len(), threads)
                .into_par_iter()
                .map(|(begin, stop)| worker(&scope, begin, stop))
                .flatten()
                .collect()
        };

        for function in &found {
            for block in &mut self.blocks[function.block_start..=function.block_end] {
                block.set_flag(BlockFlags::FUNCTION);
            }
        }

        found
    }
}

impl AnalysisPass for FunctionPass<'_> {
    fn name(&self) -> &'static str {
        "Function Analysis"
    }

    fn analyse(&mut self) {
        let timer = Instant::now();
        self.functions.clear();
        if self.blocks.is_empty() {
            return;
        }

        let known = self.known_candidates();
        let mut functions = self.run_phase(|scope, begin, stop| scope.seed_worker(begin, stop, &known));
        let seeded = functions.len();

        // Needs every FUNCTION flag from the seeding phase
        functions.extend(self.run_phase(|scope, begin, stop| scope.orphan_worker(begin, stop)));

        functions.sort_by(|a, b| a.start.cmp(&b.start).then(b.end.cmp(&a.end)));
        functions.dedup_by_key(|f| f.start);

        log::debug!(
            "{}: {} seeded, {} orphaned, {} unique in {} ms",
            self.name(),
            seeded,
            functions.len().saturating_sub(seeded),
            functions.len(),
            timer.elapsed().as_millis()
        );

        self.functions = functions;
    }
}

impl Scope<'_> {
    /// Candidate starts for blocks `[begin, stop)`, sorted and unique.
    fn candidates(&self, begin: usize, stop: usize, known: &[Candidate]) -> Vec<Candidate> {
        if begin >= stop {
            return Vec::new();
        }

        let min_func = self.blocks[begin].start;
        let max_func = self.blocks[stop - 1].end;
        let mut candidates: Vec<Candidate> = known
            .iter()
            .filter(|c| c.start >= min_func && c.start < max_func)
            .copied()
            .collect();

        for block in &self.blocks[begin..stop] {
            if !block.has(BlockFlags::CALL) {
                continue;
            }
            let Some(mut destination) = block.target else {
                continue;
            };

            if block.has(BlockFlags::INDIRPTR) {
                match self.memory.read_pointer(destination, self.pointer_size) {
                    Some(pointer) if self.memory.is_valid_read_ptr(pointer) => {
                        log::trace!("Indirect pointer: 0x{:x} -> 0x{:x}", destination, pointer);
                        destination = pointer;
                    }
                    _ => continue,
                }
            }

            if !self.base.validate_address(destination) {
                continue;
            }

            candidates.push(Candidate { start: destination, known_end: None });
        }

        // A known end beats a guessed one for the same start
        candidates.sort_by(|a, b| a.start.cmp(&b.start).then(b.known_end.cmp(&a.known_end)));
        candidates.dedup_by_key(|c| c.start);
        candidates
    }

    fn seed_worker(&self, begin: usize, stop: usize, known: &[Candidate]) -> Vec<FunctionDef> {
        self.candidates(begin, stop, known)
            .into_iter()
            .filter_map(|candidate| {
                candidate
                    .known_end
                    .and_then(|end| resolve_known_function_end(self.blocks, candidate.start, end))
                    .or_else(|| resolve_function_end(self.blocks, candidate.start))
            })
            .collect()
    }

    /// Define functions for unclaimed, non-padding blocks in `[begin, stop)`.
    fn orphan_worker(&self, begin: usize, stop: usize) -> Vec<FunctionDef> {
        let mut functions = Vec::new();
        let mut virt_end: Address = 0;

        for block in &self.blocks[begin..stop] {
            if block.start < virt_end
                || block.has(BlockFlags::PAD)
                || block.has(BlockFlags::FUNCTION)
            {
                continue;
            }

            if let Some(function) = resolve_function_end(self.blocks, block.start) {
                virt_end = function.end;
                functions.push(function);
            }
        }

        functions
    }
}

/// Close a function whose end is already known from a module table.
///
/// Returns `None` when either end does not land in a block.
pub fn resolve_known_function_end(
    blocks: &[BasicBlock],
    start: Address,
    end: Address,
) -> Option<FunctionDef> {
    if end <= start {
        return None;
    }
    let first = find_block_index(blocks, start)?;
    let last = find_block_index(blocks, end - 1)?;

    Some(FunctionDef {
        start,
        end,
        block_start: first,
        block_end: last,
        instruction_count: blocks[first..=last].iter().map(|b| b.instruction_count).sum(),
    })
}

/// Find where the function entered at `start` ends.
///
/// Walks forward from the block containing `start`, tracking the furthest
/// address the function is known to reach. The walk stops at a return, a tail
/// jump, a trailing loop, the next called block, or the last block.
pub fn resolve_function_end(blocks: &[BasicBlock], start: Address) -> Option<FunctionDef> {
    let Some(first) = find_block_index(blocks, start) else {
        log::debug!("No block at function start 0x{:x}", start);
        return None;
    };
    let last = blocks.len() - 1;

    let mut idx = first;
    let mut maximum: Address = 0;
    let mut instruction_count = 0;

    loop {
        let block = &blocks[idx];

        // Someone else's entry point
        if idx > first && block.has(BlockFlags::CALL_TARGET) && block.start != start {
            idx -= 1;
            break;
        }

        instruction_count += block.instruction_count;
        maximum = maximum.max(block.end);

        if !block.has(BlockFlags::CALL) && !block.has(BlockFlags::INDIRECT) {
            let forward = block.target.filter(|t| *t >= maximum);
            let target_block = forward
                .and_then(|t| find_block_in_range(blocks, t))
                .filter(|b| !b.has(BlockFlags::CALL_TARGET));

            if let Some(target_block) = target_block {
                let mut reach = target_block.end;

                // pop ebp; jmp other; int3... where the padding only aligns `other`
                if let Some(next) = blocks.get(idx + 1) {
                    if next.has(BlockFlags::PAD) && next.end % 4 == 0 {
                        reach = block.end;
                    }
                }

                maximum = maximum.max(reach);
            }
        }

        debug_assert!(
            maximum >= block.start,
            "maximum 0x{:x} behind block 0x{:x}",
            maximum,
            block.start
        );

        if maximum <= block.end {
            if block.has(BlockFlags::RET) {
                break;
            }

            if let Some(target) = block.target {
                if block.has(BlockFlags::ABSJMP) {
                    // Tail call
                    if block.end == maximum {
                        break;
                    }
                    // Trailing loop
                    if target >= start && target < block.end {
                        break;
                    }
                }
            }
        }

        if idx == last {
            break;
        }
        idx += 1;
    }

    let end = blocks[idx].end;
    Some(FunctionDef {
        start,
        end,
        block_start: first,
        block_end: idx,
        instruction_count,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::ImageMemory;
    use crate::metadata::NoMetadata;
    use crate::testing::{analyse_memory, serial, Asm};

    fn block(start: Address, end: Address, flags: BlockFlags, target: Option<Address>, count: usize) -> BasicBlock {
        BasicBlock { start, end, flags, target, instruction_count: count }
    }

    fn plain(start: Address, end: Address) -> BasicBlock {
        block(start, end, BlockFlags::empty(), None, 1)
    }

    #[test]
    fn test_straight_line_ends_at_ret() {
        let blocks = vec![
            block(0x10, 0x14, BlockFlags::empty(), None, 2),
            block(0x14, 0x18, BlockFlags::CALL, Some(0x100), 1),
            block(0x18, 0x1c, BlockFlags::RET, None, 3),
            plain(0x1c, 0x20),
        ];

        let f = resolve_function_end(&blocks, 0x10).unwrap();
        assert_eq!((f.start, f.end), (0x10, 0x1c));
        assert_eq!((f.block_start, f.block_end), (0, 2));
        assert_eq!(f.instruction_count, 6);
    }

    #[test]
    fn test_forward_branch_extends_past_return() {
        let blocks = vec![
            block(0x10, 0x12, BlockFlags::empty(), Some(0x18), 1),
            block(0x12, 0x14, BlockFlags::RET, None, 1),
            plain(0x14, 0x18),
            block(0x18, 0x1a, BlockFlags::RET, None, 1),
            plain(0x1a, 0x20),
        ];

        let f = resolve_function_end(&blocks, 0x10).unwrap();
        assert_eq!(f.end, 0x1a);
        assert_eq!(f.block_end, 3);
    }

    #[test]
    fn test_jump_to_called_block_is_tail_call() {
        let blocks = vec![
            block(0x10, 0x15, BlockFlags::ABSJMP, Some(0x20), 2),
            block(0x15, 0x20, BlockFlags::RET, None, 1),
            block(0x20, 0x24, BlockFlags::RET | BlockFlags::CALL_TARGET, None, 1),
        ];

        let f = resolve_function_end(&blocks, 0x10).unwrap();
        assert_eq!(f.end, 0x15);
        assert_eq!(f.instruction_count, 2);
    }

    #[test]
    fn test_walk_stops_before_next_entry() {
        let blocks = vec![
            plain(0x10, 0x14),
            block(0x14, 0x18, BlockFlags::RET | BlockFlags::CALL_TARGET, None, 4),
        ];

        let f = resolve_function_end(&blocks, 0x10).unwrap();
        assert_eq!((f.end, f.block_end, f.instruction_count), (0x14, 0, 1));

        // Its own entry block being called doesn't stop it
        let f = resolve_function_end(&blocks, 0x14).unwrap();
        assert_eq!((f.end, f.block_end), (0x18, 1));
    }

    #[test]
    fn test_aligned_padding_closes_at_jump() {
        let aligned = vec![
            block(0x10, 0x16, BlockFlags::ABSJMP, Some(0x18), 2),
            block(0x16, 0x18, BlockFlags::PAD, None, 2),
            block(0x18, 0x20, BlockFlags::RET, None, 3),
        ];
        assert_eq!(resolve_function_end(&aligned, 0x10).unwrap().end, 0x16);

        let unaligned = vec![
            block(0x10, 0x16, BlockFlags::ABSJMP, Some(0x17), 2),
            block(0x16, 0x17, BlockFlags::PAD, None, 1),
            block(0x17, 0x20, BlockFlags::RET, None, 3),
        ];
        assert_eq!(resolve_function_end(&unaligned, 0x10).unwrap().end, 0x20);
    }

    #[test]
    fn test_backward_jump_closes_loop() {
        let blocks = vec![
            plain(0x10, 0x14),
            block(0x14, 0x18, BlockFlags::ABSJMP, Some(0x10), 1),
            plain(0x18, 0x20),
        ];
        assert_eq!(resolve_function_end(&blocks, 0x10).unwrap().end, 0x18);
    }

    #[test]
    fn test_walk_bounded_by_last_block() {
        let blocks = vec![plain(0x10, 0x14), plain(0x14, 0x18)];
        let f = resolve_function_end(&blocks, 0x10).unwrap();
        assert_eq!((f.end, f.block_end), (0x18, 1));

        assert!(resolve_function_end(&blocks, 0x18).is_none());
        assert!(resolve_function_end(&blocks, 0x8).is_none());
    }

    #[test]
    fn test_known_end() {
        let blocks = vec![plain(0x10, 0x14), plain(0x14, 0x18), plain(0x20, 0x24)];

        let f = resolve_known_function_end(&blocks, 0x10, 0x18).unwrap();
        assert_eq!((f.start, f.end, f.block_start, f.block_end), (0x10, 0x18, 0, 1));
        assert_eq!(f.instruction_count, 2);

        // end lands in a gap
        assert!(resolve_known_function_end(&blocks, 0x10, 0x1c).is_none());
        assert!(resolve_known_function_end(&blocks, 0x14, 0x14).is_none());
    }

    fn pointer_fixture() -> (Asm, ImageMemory) {
        let mut asm = Asm::new(0x1000);
        asm.call_ptr(0x2000).call_ptr(0x2004).call_ptr(0x3000).ret(); // 0x1000..0x1013
        asm.pad_to(0x1014);
        asm.push_ebp().pop_ebp().ret(); // 0x1014..0x1017

        let mut memory = asm.memory();
        let mut slots = Vec::new();
        slots.extend_from_slice(&0x1014u32.to_le_bytes());
        // readable, but nothing is mapped there
        slots.extend_from_slice(&0x9000u32.to_le_bytes());
        memory.map(0x2000, slots);

        (asm, memory)
    }

    #[test]
    fn test_indirect_pointer_candidates() {
        let (asm, memory) = pointer_fixture();
        let config = AnalysisConfig { indirect_pointers: true, ..serial() };
        let (blocks, _) = analyse_memory(&memory, asm.base(), asm.end(), &config);

        let base = PassBase::new(&memory, asm.base(), asm.end()).unwrap();
        let scope = Scope { base: &base, blocks: &blocks, memory: &memory, pointer_size: 4 };

        let candidates = scope.candidates(0, blocks.len(), &[]);
        assert_eq!(candidates, vec![Candidate { start: 0x1014, known_end: None }]);
    }

    #[test]
    fn test_seeded_and_orphan_functions() {
        let mut asm = Asm::new(0x1000);
        asm.call(0x100c).ret(); // 0x1000..0x1006
        asm.pad_to(0x1008);
        asm.push_ebp().inc().inc().ret(); // 0x1008..0x100c, never called
        asm.push_ebp().pop_ebp().ret(); // 0x100c..0x100f

        let (blocks, functions) = analyse_memory(&asm.memory(), asm.base(), asm.end(), &serial());
        let spans: Vec<_> = functions.iter().map(|f| (f.start, f.end)).collect();
        assert_eq!(spans, vec![(0x1000, 0x1006), (0x1008, 0x100c), (0x100c, 0x100f)]);

        for b in &blocks {
            assert_eq!(b.has(BlockFlags::FUNCTION), !b.has(BlockFlags::PAD), "{:x?}", b);
        }
    }

    struct Table {
        exceptions: Vec<(Address, Address)>,
        exports: Vec<(String, Address)>,
    }

    impl ModuleMetadata for Table {
        fn exception_entries(&self) -> Vec<(Address, Address)> {
            self.exceptions.clone()
        }

        fn exports(&self) -> Vec<(String, Address)> {
            self.exports.clone()
        }
    }

    fn run_with(asm: &Asm, metadata: &dyn ModuleMetadata) -> Vec<(Address, Address)> {
        let memory = asm.memory();
        let config = serial();
        let mut blocks = Vec::new();
        crate::pass::LinearPass::new(&memory, &crate::testing::MiniX86, asm.base(), asm.end(), &mut blocks, &config)
            .unwrap()
            .analyse();

        let mut pass = FunctionPass::new(&memory, asm.base(), asm.end(), &mut blocks, &config)
            .unwrap()
            .with_metadata(metadata)
            .with_pointer_size(4);
        pass.analyse();
        pass.functions().iter().map(|f| (f.start, f.end)).collect()
    }

    #[test]
    fn test_metadata_seeding() {
        let mut asm = Asm::new(0x1000);
        asm.push_ebp().inc().ret(); // 0x1000..0x1003
        asm.push_ebp().inc().ret(); // 0x1003..0x1006

        assert_eq!(run_with(&asm, &NoMetadata), vec![(0x1000, 0x1003), (0x1003, 0x1006)]);

        let table = Table { exceptions: vec![(0x1000, 0x1006), (0x5000, 0x5010)], exports: Vec::new() };
        assert_eq!(run_with(&asm, &table), vec![(0x1000, 0x1006)]);

        // The export claims the first block, so no orphan starts at 0x1000
        let table = Table { exceptions: Vec::new(), exports: vec![("mid".into(), 0x1001)] };
        assert_eq!(run_with(&asm, &table), vec![(0x1001, 0x1003), (0x1003, 0x1006)]);
    }

    #[test]
    fn test_merge_keeps_wider_function() {
        let mut asm = Asm::new(0x1000);
        asm.call(0x1010).ret(); // 0x1000..0x1006
        asm.pad_to(0x1010);
        asm.push_ebp().ret(); // 0x1010..0x1012
        asm.push_ebp().ret(); // 0x1012..0x1014

        let memory = asm.memory();
        let config = AnalysisConfig::default().with_threads(2);
        let mut blocks = Vec::new();
        crate::pass::LinearPass::new(&memory, &crate::testing::MiniX86, asm.base(), asm.end(), &mut blocks, &config)
            .unwrap()
            .analyse();
        assert_eq!(blocks.len(), 5);

        // The call in the first slice walks 0x1010 to its ret; the table entry
        // for the same start sits in the second slice with a wider end
        let table = Table { exceptions: vec![(0x1010, 0x1014)], exports: Vec::new() };
        let mut pass = FunctionPass::new(&memory, asm.base(), asm.end(), &mut blocks, &config)
            .unwrap()
            .with_metadata(&table)
            .with_pointer_size(4);
        pass.analyse();

        let spans: Vec<_> = pass.functions().iter().map(|f| (f.start, f.end)).collect();
        assert_eq!(spans, vec![(0x1000, 0x1006), (0x1010, 0x1014)]);
        assert_eq!(pass.functions()[1].block_end, 4);
    }

    #[test]
    fn test_empty_block_sequence() {
        let memory = ImageMemory::flat(0x1000, vec![0; 4]);
        let mut blocks = Vec::new();
        let mut pass = FunctionPass::new(&memory, 0x1000, 0x1004, &mut blocks, &serial()).unwrap();
        pass.analyse();
        assert!(pass.functions().is_empty());
    }
}
