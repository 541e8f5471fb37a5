pub mod config;
pub mod error;
pub mod fingerprint;
pub mod labels;
pub mod model;

pub use config::{JitterStrategy, RetryConfig, SchedulerConfig};
pub use error::*;
pub use fingerprint::{Fingerprint, FingerprintWriter};
pub use labels::Labels;
pub use model::*;
