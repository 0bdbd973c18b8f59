//! Function database the analysis publishes into.

use std::collections::BTreeMap;

use serde::Serialize;

use crate::Address;

/// Receiver for analysis results.
///
/// A run clears its range, adds every function it found, then asks for a
/// refresh so views can pick up the change.
pub trait FunctionSink {
    /// Forget every function starting in `[start, end)`
    fn clear_functions(&mut self, start: Address, end: Address);

    /// Record a function over `[start, end)`
    fn add_function(&mut self, start: Address, end: Address, instruction_count: usize);

    /// Notify observers; fire-and-forget
    fn refresh(&mut self) {}
}

/// A recorded function.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct FunctionEntry {
    pub start: Address,
    pub end: Address,
    pub instruction_count: usize,
}

impl FunctionEntry {
    pub fn contains(&self, addr: Address) -> bool {
        self.start <= addr && addr < self.end
    }
}

/// In-memory function table keyed by start address.
#[derive(Debug, Default, Clone)]
pub struct FunctionTable {
    entries: BTreeMap<Address, FunctionEntry>,
    revision: u64,
}

impl FunctionTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries in start order
    pub fn iter(&self) -> impl Iterator<Item = &FunctionEntry> {
        self.entries.values()
    }

    /// Function starting exactly at `start`
    pub fn get(&self, start: Address) -> Option<&FunctionEntry> {
        self.entries.get(&start)
    }

    /// Closest function at or before `addr` that still covers it
    pub fn function_containing(&self, addr: Address) -> Option<&FunctionEntry> {
        self.entries
            .range(..=addr)
            .next_back()
            .map(|(_, entry)| entry)
            .filter(|entry| entry.contains(addr))
    }

    /// Number of refreshes requested so far
    pub fn revision(&self) -> u64 {
        self.revision
    }
}

impl FunctionSink for FunctionTable {
    fn clear_functions(&mut self, start: Address, end: Address) {
        if end <= start {
            return;
        }
        let doomed: Vec<Address> = self.entries.range(start..end).map(|(k, _)| *k).collect();
        for key in doomed {
            self.entries.remove(&key);
        }
    }

    fn add_function(&mut self, start: Address, end: Address, instruction_count: usize) {
        self.entries.insert(start, FunctionEntry { start, end, instruction_count });
    }

    fn refresh(&mut self) {
        self.revision += 1;
    }
}
