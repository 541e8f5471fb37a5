use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::traits::{EvalResult, EvalState};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Health {
    /// Never evaluated.
    #[default]
    Unknown,
    Ok,
    NoData,
    Error,
}

/// Outcome of the latest evaluation of a rule.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RuleStatus {
    pub health: Health,
    pub last_error: Option<String>,
    pub last_evaluation: Option<DateTime<Utc>>,
    pub evaluation_duration: Duration,
}

impl RuleStatus {
    /// Error wins over no-data, no-data only if every series had none.
    pub fn from_results(results: &[EvalResult], at: DateTime<Utc>, duration: Duration) -> Self {
        let error = results.iter().find(|r| r.state == EvalState::Error);
        let health = if error.is_some() {
            Health::Error
        } else if !results.is_empty() && results.iter().all(|r| r.state == EvalState::NoData) {
            Health::NoData
        } else {
            Health::Ok
        };
        Self {
            health,
            last_error: error.and_then(|r| r.error.clone()),
            last_evaluation: Some(at),
            evaluation_duration: duration,
        }
    }
}
