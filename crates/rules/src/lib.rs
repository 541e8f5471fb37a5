//! Alert rule group scheduler.
//!
//! This crate provides:
//! - A [`Manager`] that reconciles the scheduled rule groups with a
//!   [`RuleSource`] on every base interval tick
//! - Per-group tick loops with deterministic jitter and optional sequential
//!   evaluation within a group
//! - Alerting and recording rule runtimes with retry and backoff
//! - A YAML directory rule source and a snapshotting background fetcher
//! - An in-memory alert state manager

pub mod cancel;
pub mod clock;
pub mod error;
pub mod fetcher;
pub mod loader;
pub mod memory;
pub mod metrics;
pub mod retry;
pub mod rule;
pub mod scheduler;
pub mod sequence;
pub mod traits;

pub use cancel::{CauseToken, StopReason};
pub use clock::{Clock, MockClock, SystemClock};
pub use error::{EvalError, SchedulerError, SinkError, SourceError};
pub use fetcher::BackgroundFetcher;
pub use loader::RuleLoader;
pub use memory::MemoryStateManager;
pub use metrics::SchedulerMetrics;
pub use rule::{Collaborators, EvalHooks, Health, Rule, RuleStatus};
pub use scheduler::{Group, Manager, ManagerHandle, UpdateOutcome, UpdateSummary};
pub use traits::{
    Alert, AlertState, AlertStateKind, Condition, EvalResult, EvalState, Evaluator, Notifier, RecordingWriter,
    RuleSource, Sample, ScheduleData, ScheduleDataOptions, StateManager, StateTransition,
};
