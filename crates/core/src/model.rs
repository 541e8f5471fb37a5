//! Alert rule data model as seen by the scheduler.
//!
//! Rules are read-only here: storage and provisioning own them, the scheduler
//! only groups, fingerprints and evaluates them.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::fingerprint::{Fingerprint, FingerprintWriter};
use crate::labels::Labels;

// ── Keys ──────────────────────────────────────────────────────

/// Identity of a single rule.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AlertRuleKey {
    pub org_id: i64,
    pub uid: String,
}

impl fmt::Display for AlertRuleKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "org_id={}, rule_uid={}", self.org_id, self.uid)
    }
}

/// Identity of a rule group: one folder, one group name, one interval.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AlertRuleGroupKey {
    pub org_id: i64,
    pub namespace_uid: String,
    pub rule_group: String,
}

impl fmt::Display for AlertRuleGroupKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "org_id={}, folder={}, group={}",
            self.org_id, self.namespace_uid, self.rule_group
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FolderKey {
    pub org_id: i64,
    pub uid: String,
}

impl fmt::Display for FolderKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "org_id={}, folder_uid={}", self.org_id, self.uid)
    }
}

/// Cheap change-detection token. Any edit to a rule bumps its version, so
/// the key changes whenever the rule body would.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ScheduleKey {
    pub key: AlertRuleKey,
    pub version: i64,
}

// ── Policies ──────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum NoDataState {
    Alerting,
    #[default]
    NoData,
    Ok,
    KeepLast,
}

impl NoDataState {
    fn as_str(self) -> &'static str {
        match self {
            NoDataState::Alerting => "Alerting",
            NoDataState::NoData => "NoData",
            NoDataState::Ok => "OK",
            NoDataState::KeepLast => "KeepLast",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ExecErrState {
    Alerting,
    #[default]
    Error,
    Ok,
    KeepLast,
}

impl ExecErrState {
    fn as_str(self) -> &'static str {
        match self {
            ExecErrState::Alerting => "Alerting",
            ExecErrState::Error => "Error",
            ExecErrState::Ok => "OK",
            ExecErrState::KeepLast => "KeepLast",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RuleType {
    Alerting,
    Recording,
}

impl fmt::Display for RuleType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RuleType::Alerting => write!(f, "alerting"),
            RuleType::Recording => write!(f, "recording"),
        }
    }
}

// ── Queries and settings ──────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct RelativeTimeRange {
    pub from_seconds: i64,
    pub to_seconds: i64,
}

/// One query of a rule. A rule's queries form an unordered set keyed by
/// `ref_id`; the condition refers to one of them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertQuery {
    pub ref_id: String,
    #[serde(default)]
    pub query_type: String,
    #[serde(default)]
    pub datasource_uid: String,
    #[serde(default)]
    pub relative_time_range: RelativeTimeRange,
    /// Datasource-specific query body.
    #[serde(default)]
    pub model: serde_json::Value,
}

impl AlertQuery {
    fn content_hash(&self) -> u64 {
        let mut w = FingerprintWriter::new();
        w.write_str(&self.ref_id)
            .write_str(&self.query_type)
            .write_str(&self.datasource_uid)
            .write_i64(self.relative_time_range.from_seconds)
            .write_i64(self.relative_time_range.to_seconds)
            .write_str(&self.model.to_string());
        w.finish().as_u64()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct NotificationSettings {
    pub receiver: String,
    #[serde(default)]
    pub group_by: Vec<String>,
    #[serde(default)]
    pub group_wait_seconds: Option<i64>,
    #[serde(default)]
    pub group_interval_seconds: Option<i64>,
    #[serde(default)]
    pub repeat_interval_seconds: Option<i64>,
    #[serde(default)]
    pub mute_time_intervals: Vec<String>,
}

/// Present only on recording rules: where the computed value goes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordSettings {
    /// Name of the written metric.
    pub metric: String,
    /// Ref id of the query whose value is recorded.
    pub from: String,
    #[serde(default)]
    pub target_datasource_uid: Option<String>,
}

// ── AlertRule ─────────────────────────────────────────────────

fn default_updated() -> DateTime<Utc> {
    Utc::now()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertRule {
    /// Storage row id. Not part of the rule's content.
    #[serde(default)]
    pub id: i64,
    pub org_id: i64,
    pub uid: String,
    pub title: String,
    /// Ref id of the query that decides firing.
    #[serde(default)]
    pub condition: String,
    #[serde(default)]
    pub data: Vec<AlertQuery>,
    #[serde(default = "default_updated")]
    pub updated: DateTime<Utc>,
    pub interval_seconds: i64,
    #[serde(default)]
    pub version: i64,
    pub namespace_uid: String,
    pub rule_group: String,
    #[serde(default)]
    pub rule_group_index: i32,
    #[serde(default)]
    pub no_data_state: NoDataState,
    #[serde(default)]
    pub exec_err_state: ExecErrState,
    #[serde(default)]
    pub for_seconds: i64,
    #[serde(default)]
    pub keep_firing_for_seconds: i64,
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
    #[serde(default)]
    pub labels: Labels,
    #[serde(default)]
    pub is_paused: bool,
    #[serde(default)]
    pub notification_settings: Option<NotificationSettings>,
    #[serde(default)]
    pub record: Option<RecordSettings>,
    #[serde(default)]
    pub missing_series_evals_to_resolve: Option<i64>,
}

impl AlertRule {
    /// Minimal rule in `group`: titled after its uid, no queries, default
    /// policies.
    pub fn new(uid: impl Into<String>, group: &AlertRuleGroupKey, interval_seconds: i64) -> Self {
        let uid = uid.into();
        Self {
            id: 0,
            org_id: group.org_id,
            title: uid.clone(),
            uid,
            condition: "A".to_string(),
            data: Vec::new(),
            updated: Utc::now(),
            interval_seconds,
            version: 1,
            namespace_uid: group.namespace_uid.clone(),
            rule_group: group.rule_group.clone(),
            rule_group_index: 0,
            no_data_state: NoDataState::default(),
            exec_err_state: ExecErrState::default(),
            for_seconds: 0,
            keep_firing_for_seconds: 0,
            annotations: BTreeMap::new(),
            labels: Labels::new(),
            is_paused: false,
            notification_settings: None,
            record: None,
            missing_series_evals_to_resolve: None,
        }
    }

    pub fn key(&self) -> AlertRuleKey {
        AlertRuleKey {
            org_id: self.org_id,
            uid: self.uid.clone(),
        }
    }

    pub fn group_key(&self) -> AlertRuleGroupKey {
        AlertRuleGroupKey {
            org_id: self.org_id,
            namespace_uid: self.namespace_uid.clone(),
            rule_group: self.rule_group.clone(),
        }
    }

    pub fn folder_key(&self) -> FolderKey {
        FolderKey {
            org_id: self.org_id,
            uid: self.namespace_uid.clone(),
        }
    }

    pub fn schedule_key(&self) -> ScheduleKey {
        ScheduleKey {
            key: self.key(),
            version: self.version,
        }
    }

    pub fn rule_type(&self) -> RuleType {
        if self.record.is_some() {
            RuleType::Recording
        } else {
            RuleType::Alerting
        }
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_seconds.max(0) as u64)
    }

    /// Check that the interval is a positive multiple of the base interval.
    pub fn validate_interval(&self, base_interval: Duration) -> Result<(), CoreError> {
        let base = base_interval.as_secs() as i64;
        if base <= 0 || self.interval_seconds <= 0 || self.interval_seconds % base != 0 {
            return Err(CoreError::InvalidInterval {
                rule: self.key().to_string(),
                interval_seconds: self.interval_seconds,
                base_seconds: base,
            });
        }
        Ok(())
    }

    /// Number of base ticks per evaluation of this rule.
    pub fn frequency_in_ticks(&self, base_interval: Duration) -> i64 {
        let base = base_interval.as_secs() as i64;
        if base <= 0 {
            return 0;
        }
        self.interval_seconds / base
    }

    fn write_content(&self, w: &mut FingerprintWriter) {
        // id, org_id, version, updated and annotations are not part of the content.
        w.write_str(&self.uid)
            .write_str(&self.title)
            .write_str(&self.condition);
        w.write_unordered(self.data.iter().map(AlertQuery::content_hash).collect());
        w.write_i64(self.interval_seconds)
            .write_str(&self.namespace_uid)
            .write_str(&self.rule_group)
            .write_i64(i64::from(self.rule_group_index))
            .write_str(self.no_data_state.as_str())
            .write_str(self.exec_err_state.as_str())
            .write_i64(self.for_seconds)
            .write_i64(self.keep_firing_for_seconds);
        self.labels.write_to(w);
        w.write_bool(self.is_paused);

        match &self.notification_settings {
            Some(ns) => {
                w.write_bool(true).write_str(&ns.receiver);
                w.write_u64(ns.group_by.len() as u64);
                for g in &ns.group_by {
                    w.write_str(g);
                }
                for d in [
                    ns.group_wait_seconds,
                    ns.group_interval_seconds,
                    ns.repeat_interval_seconds,
                ] {
                    w.write_i64(d.unwrap_or(-1));
                }
                w.write_u64(ns.mute_time_intervals.len() as u64);
                for m in &ns.mute_time_intervals {
                    w.write_str(m);
                }
            }
            None => {
                w.write_bool(false);
            }
        }

        match &self.record {
            Some(r) => {
                w.write_bool(true)
                    .write_str(&r.metric)
                    .write_str(&r.from)
                    .write_opt_str(r.target_datasource_uid.as_deref());
            }
            None => {
                w.write_bool(false);
            }
        }

        w.write_i64(self.missing_series_evals_to_resolve.unwrap_or(-1));
    }

    /// Content fingerprint of the rule alone.
    pub fn fingerprint(&self) -> Fingerprint {
        let mut w = FingerprintWriter::new();
        self.write_content(&mut w);
        w.finish()
    }

    /// Fingerprint of the rule together with the title of its folder, so a
    /// folder rename is seen as a change.
    pub fn fingerprint_with_folder(&self, folder_title: &str) -> Fingerprint {
        let mut w = FingerprintWriter::new();
        self.write_content(&mut w);
        w.write_str(folder_title);
        w.finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_rule() -> AlertRule {
        AlertRule {
            id: 1,
            org_id: 1,
            uid: "rule-a".to_string(),
            title: "CPU high".to_string(),
            condition: "B".to_string(),
            data: vec![
                AlertQuery {
                    ref_id: "A".to_string(),
                    query_type: String::new(),
                    datasource_uid: "prom".to_string(),
                    relative_time_range: RelativeTimeRange { from_seconds: 600, to_seconds: 0 },
                    model: serde_json::json!({"expr": "cpu"}),
                },
                AlertQuery {
                    ref_id: "B".to_string(),
                    query_type: "threshold".to_string(),
                    datasource_uid: "__expr__".to_string(),
                    relative_time_range: RelativeTimeRange::default(),
                    model: serde_json::json!({"gt": 0.9}),
                },
            ],
            updated: Utc::now(),
            interval_seconds: 60,
            version: 3,
            namespace_uid: "folder-1".to_string(),
            rule_group: "infra".to_string(),
            rule_group_index: 1,
            no_data_state: NoDataState::NoData,
            exec_err_state: ExecErrState::Error,
            for_seconds: 300,
            keep_firing_for_seconds: 0,
            annotations: BTreeMap::from([("summary".to_string(), "cpu".to_string())]),
            labels: [("team", "core")].into_iter().collect(),
            is_paused: false,
            notification_settings: None,
            record: None,
            missing_series_evals_to_resolve: None,
        }
    }

    #[test]
    fn excluded_fields_do_not_change_fingerprint() {
        let base = base_rule();
        let fp = base.fingerprint();

        let mut r = base.clone();
        r.id = 99;
        r.org_id = 42;
        r.version = 100;
        r.updated = Utc::now() + chrono::Duration::hours(1);
        r.annotations.insert("runbook".to_string(), "http://x".to_string());
        assert_eq!(r.fingerprint(), fp);
    }

    fn assert_changes(base: &AlertRule, name: &str, mutate: impl FnOnce(&mut AlertRule)) {
        let mut r = base.clone();
        mutate(&mut r);
        assert_ne!(
            r.fingerprint(),
            base.fingerprint(),
            "changing {name} should change the fingerprint"
        );
    }

    #[test]
    fn every_semantic_field_changes_fingerprint() {
        let base = base_rule();

        assert_changes(&base, "uid", |r| r.uid = "other".into());
        assert_changes(&base, "title", |r| r.title = "CPU very high".into());
        assert_changes(&base, "condition", |r| r.condition = "A".into());
        assert_changes(&base, "query model", |r| {
            r.data[0].model = serde_json::json!({"expr": "mem"})
        });
        assert_changes(&base, "query range", |r| {
            r.data[0].relative_time_range.from_seconds = 300
        });
        assert_changes(&base, "query removed", |r| {
            r.data.pop();
        });
        assert_changes(&base, "interval", |r| r.interval_seconds = 120);
        assert_changes(&base, "namespace", |r| r.namespace_uid = "folder-2".into());
        assert_changes(&base, "group", |r| r.rule_group = "apps".into());
        assert_changes(&base, "group index", |r| r.rule_group_index = 2);
        assert_changes(&base, "no data", |r| r.no_data_state = NoDataState::Alerting);
        assert_changes(&base, "exec err", |r| r.exec_err_state = ExecErrState::Ok);
        assert_changes(&base, "for", |r| r.for_seconds = 60);
        assert_changes(&base, "keep firing", |r| r.keep_firing_for_seconds = 60);
        assert_changes(&base, "labels", |r| {
            r.labels.insert("env", "prod");
        });
        assert_changes(&base, "paused", |r| r.is_paused = true);
        assert_changes(&base, "notification settings", |r| {
            r.notification_settings = Some(NotificationSettings {
                receiver: "ops".into(),
                ..Default::default()
            })
        });
        assert_changes(&base, "record", |r| {
            r.record = Some(RecordSettings {
                metric: "cpu:rate".into(),
                from: "A".into(),
                target_datasource_uid: None,
            })
        });
        assert_changes(&base, "missing series", |r| {
            r.missing_series_evals_to_resolve = Some(2)
        });
    }

    #[test]
    fn query_order_does_not_change_fingerprint() {
        let base = base_rule();
        let mut r = base.clone();
        r.data.reverse();
        assert_eq!(r.fingerprint(), base.fingerprint());
    }

    #[test]
    fn folder_title_is_part_of_folder_fingerprint() {
        let r = base_rule();
        assert_ne!(
            r.fingerprint_with_folder("Infra"),
            r.fingerprint_with_folder("Infrastructure")
        );
        assert_eq!(
            r.fingerprint_with_folder("Infra"),
            r.fingerprint_with_folder("Infra")
        );
    }

    #[test]
    fn interval_must_be_multiple_of_base() {
        let mut r = base_rule();
        let base = Duration::from_secs(10);
        assert!(r.validate_interval(base).is_ok());
        assert_eq!(r.frequency_in_ticks(base), 6);

        r.interval_seconds = 15;
        assert!(r.validate_interval(base).is_err());

        r.interval_seconds = 0;
        assert!(r.validate_interval(base).is_err());
    }

    #[test]
    fn rule_type_follows_record_settings() {
        let mut r = base_rule();
        assert_eq!(r.rule_type(), RuleType::Alerting);
        r.record = Some(RecordSettings {
            metric: "m".into(),
            from: "A".into(),
            target_datasource_uid: None,
        });
        assert_eq!(r.rule_type(), RuleType::Recording);
    }
}
