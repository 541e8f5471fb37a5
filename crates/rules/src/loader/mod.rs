//! YAML directory rule source.
//!
//! Each file under the rules directory describes one rule group. The
//! directory is rescanned on every request.

mod core;
mod error;
mod file;


pub use self::core::{LoadReport, RuleLoader};
pub use self::error::{LoadResult, LoadStatus};
pub use self::file::{RuleEntry, RuleGroupFile};
