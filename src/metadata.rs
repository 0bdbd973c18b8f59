//! Module metadata used to seed function starts.

use crate::{Address, BinaryMetadata};

/// Where a known function came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FunctionSource {
    /// Unwind/exception directory entry
    ExceptionTable,
    /// Export directory entry
    Export,
    /// Symbol table entry
    Symbol,
}

/// A function described by the module rather than discovered by analysis.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KnownFunction {
    pub name: Option<String>,
    pub start: Address,
    /// Exclusive end, when the table provides one
    pub end: Option<Address>,
    pub source: FunctionSource,
}

/// Module metadata collaborator.
///
/// Implementations are best-effort: returning nothing only makes the function
/// pass rely entirely on call targets.
pub trait ModuleMetadata: Send + Sync {
    /// `(start, end)` pairs from the exception directory
    fn exception_entries(&self) -> Vec<(Address, Address)>;

    /// `(name, address)` pairs from the export directory or symbol table
    fn exports(&self) -> Vec<(String, Address)>;

    /// Ranges with a known end, for symbol tables that carry sizes
    fn sized_symbols(&self) -> Vec<(Address, Address)> {
        Vec::new()
    }
}

/// Metadata source that knows nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoMetadata;

impl ModuleMetadata for NoMetadata {
    fn exception_entries(&self) -> Vec<(Address, Address)> {
        Vec::new()
    }

    fn exports(&self) -> Vec<(String, Address)> {
        Vec::new()
    }
}

impl ModuleMetadata for BinaryMetadata {
    fn exception_entries(&self) -> Vec<(Address, Address)> {
        self.known_functions
            .iter()
            .filter(|f| f.source == FunctionSource::ExceptionTable)
            .filter_map(|f| f.end.map(|end| (f.start, end)))
            .collect()
    }

    fn exports(&self) -> Vec<(String, Address)> {
        self.known_functions
            .iter()
            .filter(|f| f.source != FunctionSource::ExceptionTable && f.end.is_none())
            .map(|f| (f.name.clone().unwrap_or_default(), f.start))
            .collect()
    }

    fn sized_symbols(&self) -> Vec<(Address, Address)> {
        self.known_functions
            .iter()
            .filter(|f| f.source == FunctionSource::Symbol)
            .filter_map(|f| f.end.map(|end| (f.start, end)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn known(start: Address, end: Option<Address>, source: FunctionSource) -> KnownFunction {
        KnownFunction { name: Some(format!("f_{:x}", start)), start, end, source }
    }

    #[test]
    fn test_binary_metadata_split_by_source() {
        let mut meta = BinaryMetadata::default_raw();
        meta.known_functions = vec![
            known(0x1000, Some(0x1040), FunctionSource::ExceptionTable),
            known(0x2000, None, FunctionSource::Export),
            known(0x3000, Some(0x3010), FunctionSource::Symbol),
            known(0x4000, None, FunctionSource::Symbol),
        ];

        assert_eq!(meta.exception_entries(), vec![(0x1000, 0x1040)]);
        assert_eq!(
            meta.exports(),
            vec![("f_2000".to_string(), 0x2000), ("f_4000".to_string(), 0x4000)]
        );
        assert_eq!(meta.sized_symbols(), vec![(0x3000, 0x3010)]);
    }

    #[test]
    fn test_no_metadata() {
        assert!(NoMetadata.exception_entries().is_empty());
        assert!(NoMetadata.exports().is_empty());
        assert!(NoMetadata.sized_symbols().is_empty());
    }
}
