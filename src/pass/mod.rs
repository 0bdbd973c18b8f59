//! Analysis passes over a code region.
//!
//! Every pass owns a [`PassBase`]: a private snapshot of the region's bytes plus
//! the worker-count policy. Passes borrow the shared basic-block sequence for
//! their lifetime and refer to blocks by index only.

use once_cell::sync::OnceCell;

use crate::memory::MemoryReader;
use crate::{Address, AnalysisError, BasicBlock};

pub mod function;
pub mod linear;

pub use function::FunctionPass;
pub use linear::LinearPass;

/// Upper bound on workers per pass
pub const MAX_THREADS: usize = 255;

/// A single analysis pass.
pub trait AnalysisPass {
    /// Short human-readable name (for logs)
    fn name(&self) -> &'static str;

    /// Run the pass to completion
    fn analyse(&mut self);
}

/// State common to all passes.
#[derive(Debug)]
pub struct PassBase {
    virtual_start: Address,
    virtual_end: Address,
    data: Vec<u8>,
    thread_count: OnceCell<usize>,
}

impl PassBase {
    /// Snapshot `[virtual_start, virtual_end)` from `memory`.
    ///
    /// Callers are expected to have validated the range; an empty range or a
    /// failed read is reported as an error and nothing is analysed.
    pub fn new(
        memory: &dyn MemoryReader,
        virtual_start: Address,
        virtual_end: Address,
    ) -> Result<Self, AnalysisError> {
        if virtual_end <= virtual_start {
            return Err(AnalysisError::InvalidRange { start: virtual_start, end: virtual_end });
        }

        let len = (virtual_end - virtual_start) as usize;
        let data = memory
            .read_bytes(virtual_start, len)
            .filter(|d| d.len() == len)
            .ok_or(AnalysisError::MemoryRead { address: virtual_start, len })?;

        Ok(Self {
            virtual_start,
            virtual_end,
            data,
            thread_count: OnceCell::new(),
        })
    }

    pub fn virtual_start(&self) -> Address {
        self.virtual_start
    }

    pub fn virtual_end(&self) -> Address {
        self.virtual_end
    }

    /// Number of bytes in the snapshot
    pub fn data_size(&self) -> usize {
        self.data.len()
    }

    /// True iff `addr` lies inside the analysed range
    pub fn validate_address(&self, addr: Address) -> bool {
        addr >= self.virtual_start && addr < self.virtual_end
    }

    /// Snapshot bytes from `addr` to the end of the range.
    ///
    /// # Panics
    /// If `addr` is outside the analysed range.
    pub fn translate_address(&self, addr: Address) -> &[u8] {
        assert!(
            self.validate_address(addr),
            "address 0x{:x} outside 0x{:x}..0x{:x}",
            addr,
            self.virtual_start,
            self.virtual_end
        );
        &self.data[(addr - self.virtual_start) as usize..]
    }

    /// Worker count for this pass: one less than the logical cores, at least one.
    pub fn ideal_thread_count(&self) -> usize {
        *self
            .thread_count
            .get_or_init(|| num_cpus::get().saturating_sub(1).clamp(1, MAX_THREADS))
    }

    /// Override the worker count (clamped to `1..=MAX_THREADS`)
    pub fn set_ideal_thread_count(&mut self, count: usize) {
        self.thread_count = OnceCell::with_value(count.clamp(1, MAX_THREADS));
    }
}

/// Index of the block whose `[start, end)` contains `addr`.
///
/// `blocks` must be sorted by start address.
pub fn find_block_index(blocks: &[BasicBlock], addr: Address) -> Option<usize> {
    let idx = blocks.partition_point(|b| b.start <= addr).checked_sub(1)?;
    blocks[idx].contains(addr).then_some(idx)
}

/// The block containing `addr`, if any
pub fn find_block_in_range(blocks: &[BasicBlock], addr: Address) -> Option<&BasicBlock> {
    find_block_index(blocks, addr).map(|idx| &blocks[idx])
}

/// Split `0..total` into `workers` contiguous slices of `ceil(total / workers)`.
///
/// Trailing slices may be empty when there are fewer items than workers.
pub(crate) fn index_slices(total: usize, workers: usize) -> Vec<(usize, usize)> {
    let workers = workers.max(1);
    let amount = total.div_ceil(workers);
    (0..workers)
        .map(|i| {
            let start = (amount * i).min(total);
            (start, (start + amount).min(total))
        })
        .collect()
}
