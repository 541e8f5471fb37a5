//! Rule group scheduling: caches, jitter, groups and the manager that
//! reconciles them with the rule source.

pub mod cache;
pub mod group;
pub mod jitter;
pub mod manager;


pub use cache::{FolderCache, GroupCache, RuleCache, SnapshotMap};
pub use group::{Group, GroupFactory};
pub use jitter::jitter_offset_in_ticks;
pub use manager::{Manager, ManagerBuilder, ManagerHandle, UpdateOutcome, UpdateSummary};
