//! Load result structures for the rule loader.

use std::path::PathBuf;

/// Outcome of loading a single rule group file.
#[derive(Debug)]
pub struct LoadResult {
    pub path: PathBuf,
    pub status: LoadStatus,
}

#[derive(Debug)]
pub enum LoadStatus {
    /// Group was loaded with this many rules.
    Loaded { group: String, rules: usize },
    /// File was skipped (dotfile, non-YAML, etc.).
    Skipped { reason: String },
    /// Parse or validation error occurred.
    Failed { error: String },
}
