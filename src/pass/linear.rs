//! Parallel linear sweep that partitions a region into basic blocks.
//!
//! The region is cut into one byte slice per worker. Each worker decodes its
//! slice front to back and closes a block on every call, jump, return or
//! padding run. Slice seams can fall inside instructions, so workers scan a
//! little past their borders and the merged result goes through a repair step
//! that removes overlaps and splits blocks at branch targets.

use std::collections::BTreeMap;
use std::time::Instant;

use rayon::prelude::*;

use super::{find_block_index, index_slices, AnalysisPass, PassBase};
use crate::config::AnalysisConfig;
use crate::memory::MemoryReader;
use crate::{Address, AnalysisError, BasicBlock, BlockFlags, Decoder, Insn};

/// Linear disassembly pass.
pub struct LinearPass<'a> {
    base: PassBase,
    blocks: &'a mut Vec<BasicBlock>,
    decoder: &'a dyn Decoder,
    scan_variance: u64,
    indirect_pointers: bool,
}

/// A branch target that lands inside an existing block
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct SplitPoint {
    at: Address,
    from_call: bool,
}

/// Changes one repair worker wants made, applied after every worker returns.
#[derive(Debug, Default)]
struct RepairEdits {
    flags: Vec<(usize, BlockFlags)>,
    splits: Vec<(usize, SplitPoint)>,
}

impl<'a> LinearPass<'a> {
    /// Snapshot `[start, end)` and prepare to fill `blocks`.
    ///
    /// Small regions are forced onto a single worker.
    pub fn new(
        memory: &dyn MemoryReader,
        decoder: &'a dyn Decoder,
        start: Address,
        end: Address,
        blocks: &'a mut Vec<BasicBlock>,
        config: &AnalysisConfig,
    ) -> Result<Self, AnalysisError> {
        let mut base = PassBase::new(memory, start, end)?;
        if let Some(threads) = config.threads {
            base.set_ideal_thread_count(threads);
        }
        if config.min_bytes_per_thread.saturating_mul(base.ideal_thread_count()) >= base.data_size() {
            base.set_ideal_thread_count(1);
        }

        Ok(Self {
            base,
            blocks,
            decoder,
            scan_variance: config.scan_variance,
            indirect_pointers: config.indirect_pointers,
        })
    }

    /// Number of workers this pass will use
    pub fn thread_count(&self) -> usize {
        self.base.ideal_thread_count()
    }

    /// Block containing `addr` in the current sequence
    pub fn find_block_in_range(&self, addr: Address) -> Option<&BasicBlock> {
        super::find_block_in_range(&self.blocks[..], addr)
    }

    /// Byte slice `[begin, stop)` scanned by worker `index` of `threads`.
    fn worker_range(&self, index: usize, threads: usize) -> (Address, Address) {
        let start = self.base.virtual_start();
        let end = self.base.virtual_end();
        let work = self.base.data_size() as Address / threads as Address;

        let mut begin = start + work * index as Address;
        let mut stop = if index + 1 == threads { end } else { begin + work };

        if index > 0 {
            begin = begin.saturating_sub(self.scan_variance).max(start);
        }
        if index + 1 < threads {
            stop = stop.saturating_add(self.scan_variance).min(end);
        }

        (begin, stop)
    }

    /// Decode `[begin, stop)` into blocks.
    fn scan(&self, begin: Address, stop: Address) -> Vec<BasicBlock> {
        let mut blocks: Vec<BasicBlock> = Vec::new();
        let mut block_begin = begin;
        let mut block_end = begin;
        let mut prev_pad = false;
        let mut count = 0usize;
        let mut at = begin;

        while at < stop {
            let insn = match self.decoder.decode(self.base.translate_address(at), at) {
                Some(insn) if insn.size > 0 => insn,
                _ => {
                    // resync
                    at += 1;
                    continue;
                }
            };

            at = insn.end();
            block_end = at;
            count += 1;
            let follows_pad = std::mem::replace(&mut prev_pad, insn.is_padding());

            if insn.is_padding() {
                if follows_pad {
                    // Coalesce the run into the open pad block
                    if let Some(last) = blocks.last_mut() {
                        last.end = block_end;
                        last.instruction_count += 1;
                    }
                    block_begin = at;
                    count = 0;
                    continue;
                }

                if insn.addr > block_begin {
                    let mut prepad = BasicBlock::new(block_begin, insn.addr);
                    prepad.set_flag(BlockFlags::PREPAD);
                    prepad.instruction_count = count - 1;
                    blocks.push(prepad);
                    count = 1;
                }

                let mut pad = BasicBlock::new(insn.addr, block_end);
                pad.set_flag(BlockFlags::PAD);
                pad.instruction_count = count;
                blocks.push(pad);
            } else if insn.is_call() || insn.is_jump() || insn.is_return() {
                blocks.push(self.close_block(block_begin, &insn, count));
            } else {
                continue;
            }

            block_begin = at;
            count = 0;
        }

        // Only the worker owning the end of the region may keep a trailing run;
        // everyone else leaves it to the neighbour that scans it in full.
        if stop == self.base.virtual_end() && count > 0 && block_end > block_begin {
            let mut tail = BasicBlock::new(block_begin, block_end);
            tail.instruction_count = count;
            blocks.push(tail);
        }

        blocks
    }

    /// Build the block ended by a call, jump or return.
    fn close_block(&self, begin: Address, insn: &Insn, count: usize) -> BasicBlock {
        let mut block = BasicBlock::new(begin, insn.end());
        block.instruction_count = count;

        if insn.is_return() {
            block.set_flag(BlockFlags::RET);
            return block;
        }

        if insn.is_call() {
            block.set_flag(BlockFlags::CALL);
        }
        if insn.is_absolute_jump() {
            block.set_flag(BlockFlags::ABSJMP);
        }

        match insn.branch_target() {
            Some(target) => block.target = Some(target),
            None => {
                block.set_flag(BlockFlags::INDIRECT);
                if self.indirect_pointers {
                    if let Some(slot) = insn.pointer_slot() {
                        block.set_flag(BlockFlags::INDIRPTR);
                        block.target = Some(slot);
                    }
                }
            }
        }

        block
    }

    /// Remove blocks produced twice across slice seams, then split blocks
    /// entered in the middle by a branch.
    ///
    /// Targets are only resolved once the sequence is overlap-free, so every
    /// split lands on a block that survives.
    fn analyse_overlaps(&mut self) {
        let threads = self.base.ideal_thread_count();
        let total = self.blocks.len();

        let victims: Vec<usize> = {
            let blocks: &[BasicBlock] = &self.blocks[..];
            index_slices(total, threads)
                .into_par_iter()
                .map(|(begin, stop)| overlap_worker(blocks, begin, stop))
                .flatten()
                .collect()
        };
        for idx in victims {
            self.blocks[idx].set_flag(BlockFlags::DELETE);
        }
        self.blocks.retain(|b| !b.has(BlockFlags::DELETE));
        remove_residual_overlaps(self.blocks);
        let deduped = self.blocks.len();

        let edits: Vec<RepairEdits> = {
            let blocks: &[BasicBlock] = &self.blocks[..];
            let base = &self.base;
            index_slices(deduped, threads)
                .into_par_iter()
                .map(|(begin, stop)| target_worker(base, blocks, begin, stop))
                .collect()
        };

        let mut splits: BTreeMap<usize, Vec<SplitPoint>> = BTreeMap::new();
        for edit in edits {
            for (idx, flag) in edit.flags {
                self.blocks[idx].set_flag(flag);
            }
            for (idx, point) in edit.splits {
                splits.entry(idx).or_default().push(point);
            }
        }

        let mut inserts = Vec::new();
        for (idx, mut points) in splits {
            points.sort_unstable();
            points.dedup_by(|later, kept| {
                if later.at == kept.at {
                    kept.from_call |= later.from_call;
                    true
                } else {
                    false
                }
            });

            // Flags from this phase (CALL_TARGET) are already on the block
            inserts.extend(split_block(&self.blocks[idx], &points));
            self.blocks[idx].set_flag(BlockFlags::DELETE);
        }

        log::debug!(
            "Overlap repair: {} blocks, {} after dedup, {} split pieces",
            total,
            deduped,
            inserts.len()
        );

        self.blocks.retain(|b| !b.has(BlockFlags::DELETE));
        self.blocks.extend(inserts);
        sort_blocks(self.blocks);
    }
}

impl AnalysisPass for LinearPass<'_> {
    fn name(&self) -> &'static str {
        "Linear Scandown"
    }

    fn analyse(&mut self) {
        let timer = Instant::now();
        let threads = self.base.ideal_thread_count();

        log::debug!(
            "{}: 0x{:x}..0x{:x} on {} worker(s)",
            self.name(),
            self.base.virtual_start(),
            self.base.virtual_end(),
            threads
        );

        let per_worker: Vec<Vec<BasicBlock>> = (0..threads)
            .into_par_iter()
            .map(|i| {
                let (begin, stop) = self.worker_range(i, threads);
                self.scan(begin, stop)
            })
            .collect();

        self.blocks.clear();
        self.blocks.reserve(per_worker.iter().map(Vec::len).sum());
        for blocks in per_worker {
            self.blocks.extend(blocks);
        }
        sort_blocks(self.blocks);

        self.analyse_overlaps();

        log::debug!(
            "{}: {} blocks in {} ms",
            self.name(),
            self.blocks.len(),
            timer.elapsed().as_millis()
        );
    }
}

/// Sort by start then end and drop exact duplicates
fn sort_blocks(blocks: &mut Vec<BasicBlock>) {
    blocks.sort_by_key(|b| (b.start, b.end));
    blocks.dedup();
}

/// Indices of blocks losing an overlap with their successor, for the pairs
/// starting in `[begin, stop)`.
fn overlap_worker(blocks: &[BasicBlock], begin: usize, stop: usize) -> Vec<usize> {
    let mut victims = Vec::new();

    for i in begin..stop {
        let (curr, Some(next)) = (&blocks[i], blocks.get(i + 1)) else {
            continue;
        };
        if curr.overlaps(next) {
            // Keep the larger block; equal sizes keep the lower start
            victims.push(if curr.size() >= next.size() { i + 1 } else { i });
        }
    }

    victims
}

/// Resolve the branch targets of blocks `[begin, stop)` against the whole,
/// overlap-free sequence.
fn target_worker(base: &PassBase, blocks: &[BasicBlock], begin: usize, stop: usize) -> RepairEdits {
    let mut edits = RepairEdits::default();

    for curr in &blocks[begin..stop] {
        // A slot address says nothing about code layout
        if curr.has(BlockFlags::INDIRPTR) {
            continue;
        }
        let Some(target) = curr.target.filter(|t| base.validate_address(*t)) else {
            continue;
        };
        let Some(j) = find_block_index(blocks, target) else {
            continue;
        };

        let from_call = curr.has(BlockFlags::CALL);
        if target == blocks[j].start {
            if from_call {
                edits.flags.push((j, BlockFlags::CALL_TARGET));
            }
        } else {
            edits.splits.push((j, SplitPoint { at: target, from_call }));
        }
    }

    edits
}

/// Cut `original` at every point (sorted, unique, strictly inside).
///
/// Every piece but the last is a `CUTOFF` fragment. The last one keeps the
/// original's exit flags and target. Instruction counts are inherited as is.
fn split_block(original: &BasicBlock, points: &[SplitPoint]) -> Vec<BasicBlock> {
    let mut pieces = Vec::with_capacity(points.len() + 1);
    let mut begin = original.start;
    let mut called = original.has(BlockFlags::CALL_TARGET);

    for point in points {
        let mut piece = BasicBlock::new(begin, point.at);
        piece.flags = BlockFlags::CUTOFF;
        if called {
            piece.set_flag(BlockFlags::CALL_TARGET);
        }
        piece.instruction_count = original.instruction_count;
        pieces.push(piece);

        begin = point.at;
        called = point.from_call;
    }

    let mut tail = *original;
    tail.start = begin;
    tail.flags.remove(BlockFlags::CALL_TARGET | BlockFlags::DELETE);
    if called {
        tail.set_flag(BlockFlags::CALL_TARGET);
    }
    pieces.push(tail);

    pieces
}

/// Drop anything still overlapping its predecessor, keeping the larger block.
fn remove_residual_overlaps(blocks: &mut Vec<BasicBlock>) {
    let mut kept: Vec<BasicBlock> = Vec::with_capacity(blocks.len());

    for block in blocks.drain(..) {
        match kept.last_mut() {
            Some(prev) if prev.overlaps(&block) => {
                if block.size() > prev.size() {
                    *prev = block;
                }
            }
            _ => kept.push(block),
        }
    }

    *blocks = kept;
}
