//! Target memory access.
//!
//! The passes never touch process memory directly; they go through
//! [`MemoryReader`]. [`ImageMemory`] backs it with the sections of a binary
//! mapped at their virtual addresses, which is what the CLI and tests use.

use crate::{Address, Section};

/// Read access to the memory of the analysed target.
pub trait MemoryReader: Send + Sync {
    /// Read exactly `len` bytes starting at `address`.
    fn read_bytes(&self, address: Address, len: usize) -> Option<Vec<u8>>;

    /// True if `address` points at readable memory.
    fn is_valid_read_ptr(&self, address: Address) -> bool;

    /// Read a little-endian pointer of `size` bytes (4 or 8).
    fn read_pointer(&self, address: Address, size: usize) -> Option<Address> {
        let bytes = self.read_bytes(address, size)?;
        match size {
            4 => Some(u32::from_le_bytes(bytes.try_into().ok()?) as Address),
            8 => Some(u64::from_le_bytes(bytes.try_into().ok()?)),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
struct Region {
    start: Address,
    data: Vec<u8>,
}

impl Region {
    fn end(&self) -> Address {
        self.start + self.data.len() as Address
    }
}

/// Sparse memory image made of non-overlapping regions.
#[derive(Debug, Clone, Default)]
pub struct ImageMemory {
    regions: Vec<Region>,
}

impl ImageMemory {
    /// Create an empty image
    pub fn new() -> Self {
        Self::default()
    }

    /// One region holding `bytes` at `base`
    pub fn flat(base: Address, bytes: Vec<u8>) -> Self {
        let mut image = Self::new();
        image.map(base, bytes);
        image
    }

    /// Map every section at its virtual address.
    ///
    /// Bytes past the file-backed part of a section (bss-style tails) read as zero.
    pub fn from_sections(sections: &[Section], file: &[u8]) -> Self {
        let mut image = Self::new();
        for section in sections.iter().filter(|s| s.size > 0) {
            let mut data = vec![0u8; section.size];
            let start = section.file_offset.min(file.len());
            let end = section
                .file_offset
                .saturating_add(section.file_size.min(section.size))
                .min(file.len());
            data[..end - start].copy_from_slice(&file[start..end]);
            image.map(section.address, data);
        }
        image
    }

    /// Map `data` at `start`. Regions overlapping an existing one are ignored.
    pub fn map(&mut self, start: Address, data: Vec<u8>) -> bool {
        if data.is_empty() {
            return false;
        }
        let region = Region { start, data };
        let idx = self.regions.partition_point(|r| r.start < start);

        let clashes_prev = idx > 0 && self.regions[idx - 1].end() > region.start;
        let clashes_next = idx < self.regions.len() && self.regions[idx].start < region.end();
        if clashes_prev || clashes_next {
            log::debug!("Ignoring overlapping region at 0x{:x}", start);
            return false;
        }

        self.regions.insert(idx, region);
        true
    }

    /// Total number of mapped bytes
    pub fn mapped_size(&self) -> usize {
        self.regions.iter().map(|r| r.data.len()).sum()
    }

    fn region_containing(&self, address: Address) -> Option<&Region> {
        let idx = self.regions.partition_point(|r| r.start <= address);
        let region = self.regions.get(idx.checked_sub(1)?)?;
        (address < region.end()).then_some(region)
    }
}

impl MemoryReader for ImageMemory {
    fn read_bytes(&self, address: Address, len: usize) -> Option<Vec<u8>> {
        let mut out = Vec::with_capacity(len);
        let mut at = address;

        // Reads may span adjacent regions as long as there is no hole.
        while out.len() < len {
            let region = self.region_containing(at)?;
            let offset = (at - region.start) as usize;
            let take = (len - out.len()).min(region.data.len() - offset);
            out.extend_from_slice(&region.data[offset..offset + take]);
            at += take as Address;
        }

        Some(out)
    }

    fn is_valid_read_ptr(&self, address: Address) -> bool {
        self.region_containing(address).is_some()
    }
}
