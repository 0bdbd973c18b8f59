//! Analysis settings.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::AnalysisError;

/// Knobs shared by the driver and both passes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalysisConfig {
    /// Worker count override; `None` uses one less than the logical core count
    pub threads: Option<usize>,
    /// Below `threads * min_bytes_per_thread` bytes the linear pass runs single-threaded
    pub min_bytes_per_thread: usize,
    /// Bytes each linear worker scans before and after its slice to resynchronise
    pub scan_variance: u64,
    /// Seed function starts from unwind tables, exports and symbols
    pub use_metadata: bool,
    /// Flag branches through fixed pointer slots as `INDIRPTR`
    pub indirect_pointers: bool,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            threads: None,
            min_bytes_per_thread: 512,
            scan_variance: 256,
            use_metadata: true,
            indirect_pointers: false,
        }
    }
}

impl AnalysisConfig {
    /// Parse a JSON document; missing fields keep their defaults.
    pub fn from_json(text: &str) -> Result<Self, AnalysisError> {
        serde_json::from_str(text).map_err(|e| AnalysisError::ConfigError(e.to_string()))
    }

    /// Load a JSON config file
    pub fn load(path: impl AsRef<Path>) -> Result<Self, AnalysisError> {
        let text = fs::read_to_string(path)?;
        Self::from_json(&text)
    }

    pub fn with_threads(mut self, threads: usize) -> Self {
        self.threads = Some(threads);
        self
    }
}
