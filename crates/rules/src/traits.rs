//! Collaborator contracts consumed by rules and the scheduler.
//!
//! The scheduler owns timing and lifecycle only. Evaluating queries,
//! computing alert state, delivering notifications and persisting recorded
//! series are delegated to implementations of the traits below.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use async_trait::async_trait;
use cadence_core::{AlertQuery, AlertRule, AlertRuleKey, FolderKey, Labels};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::cancel::StopReason;
use crate::clock::to_chrono;
use crate::error::{EvalError, SinkError, SourceError};

// ── Evaluation ────────────────────────────────────────────────

/// What an evaluator runs: a condition ref over a set of queries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Condition {
    pub condition: String,
    pub data: Vec<AlertQuery>,
}

impl Condition {
    /// Alerting rules evaluate their condition. Recording rules evaluate the
    /// query named by `record.from`.
    pub fn from_rule(rule: &AlertRule) -> Self {
        let condition = match &rule.record {
            Some(record) => record.from.clone(),
            None => rule.condition.clone(),
        };
        Self {
            condition,
            data: rule.data.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvalState {
    Normal,
    Alerting,
    NoData,
    Error,
}

/// One series produced by an evaluation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvalResult {
    pub instance: Labels,
    pub state: EvalState,
    pub evaluated_at: DateTime<Utc>,
    #[serde(default)]
    pub values: BTreeMap<String, f64>,
    #[serde(default)]
    pub error: Option<String>,
}

impl EvalResult {
    pub fn new(state: EvalState, evaluated_at: DateTime<Utc>) -> Self {
        Self {
            instance: Labels::new(),
            state,
            evaluated_at,
            values: BTreeMap::new(),
            error: None,
        }
    }

    /// A single error result standing in for a failed evaluation.
    pub fn from_error(err: &EvalError, evaluated_at: DateTime<Utc>) -> Self {
        Self {
            error: Some(err.to_string()),
            ..Self::new(EvalState::Error, evaluated_at)
        }
    }
}

#[async_trait]
pub trait Evaluator: Send + Sync {
    async fn evaluate(
        &self,
        condition: &Condition,
        at: DateTime<Utc>,
    ) -> Result<Vec<EvalResult>, EvalError>;
}

// ── State ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertStateKind {
    Normal,
    Pending,
    Alerting,
    NoData,
    Error,
}

/// Tracked state of one alert instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertState {
    pub rule_key: AlertRuleKey,
    pub labels: Labels,
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
    pub state: AlertStateKind,
    pub starts_at: DateTime<Utc>,
    pub last_evaluated_at: DateTime<Utc>,
    #[serde(default)]
    pub resolved_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub error: Option<String>,
}

/// A state change produced by the state manager.
#[derive(Debug, Clone, PartialEq)]
pub struct StateTransition {
    pub previous: AlertStateKind,
    pub current: AlertState,
}

impl StateTransition {
    pub fn is_firing(&self) -> bool {
        self.current.state == AlertStateKind::Alerting
    }

    pub fn is_resolved(&self) -> bool {
        self.previous == AlertStateKind::Alerting && self.current.state != AlertStateKind::Alerting
    }

    /// Firing alerts are re-sent every evaluation; resolutions once.
    pub fn needs_sending(&self) -> bool {
        self.is_firing() || self.is_resolved()
    }

    /// Render as a notification. Firing alerts stay valid for a few
    /// evaluation intervals so a missed evaluation does not resolve them.
    pub fn to_alert(&self, interval: Duration) -> Alert {
        let s = &self.current;
        let ends_at = match s.resolved_at {
            Some(at) if self.is_resolved() => at,
            _ if self.is_resolved() => s.last_evaluated_at,
            _ => s.last_evaluated_at + to_chrono(interval * 4),
        };
        Alert {
            rule_key: s.rule_key.clone(),
            labels: s.labels.clone(),
            annotations: s.annotations.clone(),
            starts_at: s.starts_at,
            ends_at,
        }
    }
}

#[async_trait]
pub trait StateManager: Send + Sync {
    /// Fold a batch of results into tracked state and return what changed.
    async fn process_eval_results(
        &self,
        rule: &AlertRule,
        evaluated_at: DateTime<Utc>,
        results: &[EvalResult],
        extra_labels: &Labels,
    ) -> Vec<StateTransition>;

    fn get_states_for_rule_uid(&self, org_id: i64, uid: &str) -> Vec<AlertState>;

    /// Drop all state for a rule. Returns transitions for instances that
    /// were resolved by the removal.
    async fn delete_states(&self, key: &AlertRuleKey, reason: StopReason) -> Vec<StateTransition>;
}

// ── Sinks ─────────────────────────────────────────────────────

/// A notification ready for delivery.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Alert {
    pub rule_key: AlertRuleKey,
    pub labels: Labels,
    pub annotations: BTreeMap<String, String>,
    pub starts_at: DateTime<Utc>,
    pub ends_at: DateTime<Utc>,
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, key: &AlertRuleKey, alerts: &[Alert]) -> Result<(), SinkError>;
}

/// One sample written by a recording rule.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Sample {
    pub metric: String,
    pub labels: Labels,
    pub value: f64,
    pub timestamp: DateTime<Utc>,
}

#[async_trait]
pub trait RecordingWriter: Send + Sync {
    async fn write(&self, target_datasource_uid: Option<&str>, samples: &[Sample]) -> Result<(), SinkError>;
}

// ── Rule source ───────────────────────────────────────────────

/// Rules plus the titles of every folder they live in.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ScheduleData {
    pub rules: Vec<AlertRule>,
    pub folders: HashMap<FolderKey, String>,
}

#[derive(Debug, Clone, Default)]
pub struct ScheduleDataOptions {
    pub disabled_orgs: Vec<i64>,
}

#[async_trait]
pub trait RuleSource: Send + Sync {
    /// Cheap listing of (rule, version) pairs used for change detection.
    async fn get_alert_rule_schedule_keys(&self) -> Result<Vec<cadence_core::ScheduleKey>, SourceError>;

    /// Full rule definitions and folder titles.
    async fn get_schedule_data(&self, opts: &ScheduleDataOptions) -> Result<ScheduleData, SourceError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state(kind: AlertStateKind, at: DateTime<Utc>) -> AlertState {
        AlertState {
            rule_key: AlertRuleKey { org_id: 1, uid: "r1".into() },
            labels: Labels::new(),
            annotations: BTreeMap::new(),
            state: kind,
            starts_at: at,
            last_evaluated_at: at,
            resolved_at: None,
            error: None,
        }
    }

    #[test]
    fn firing_alert_expires_after_four_intervals() {
        let now = Utc::now();
        let t = StateTransition {
            previous: AlertStateKind::Pending,
            current: state(AlertStateKind::Alerting, now),
        };
        assert!(t.needs_sending());
        let alert = t.to_alert(Duration::from_secs(10));
        assert_eq!(alert.ends_at, now + chrono::Duration::seconds(40));
    }

    #[test]
    fn resolved_alert_ends_at_resolution() {
        let now = Utc::now();
        let mut current = state(AlertStateKind::Normal, now);
        current.resolved_at = Some(now);
        let t = StateTransition { previous: AlertStateKind::Alerting, current };
        assert!(t.is_resolved());
        assert_eq!(t.to_alert(Duration::from_secs(10)).ends_at, now);
    }

    #[test]
    fn pending_is_not_sent() {
        let t = StateTransition {
            previous: AlertStateKind::Normal,
            current: state(AlertStateKind::Pending, Utc::now()),
        };
        assert!(!t.needs_sending());
    }

    #[test]
    fn recording_rules_evaluate_their_source_query() {
        let group = cadence_core::AlertRuleGroupKey {
            org_id: 1,
            namespace_uid: "f".into(),
            rule_group: "g".into(),
        };
        let mut rule = AlertRule::new("r1", &group, 10);
        rule.condition = "C".into();
        assert_eq!(Condition::from_rule(&rule).condition, "C");
        rule.record = Some(cadence_core::RecordSettings {
            metric: "m".into(),
            from: "A".into(),
            target_datasource_uid: None,
        });
        assert_eq!(Condition::from_rule(&rule).condition, "A");
    }
}
