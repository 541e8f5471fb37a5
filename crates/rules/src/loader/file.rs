//! On-disk format: one YAML file per rule group.
//!
//! ```yaml
//! org_id: 1
//! folder_uid: infra
//! folder_title: Infrastructure
//! group: cpu
//! interval_seconds: 60
//! rules:
//!   - uid: cpu-high
//!     title: CPU high
//!     condition: B
//!     data: [...]
//! ```

use std::collections::{BTreeMap, HashSet};

use cadence_core::{
    AlertQuery, AlertRule, AlertRuleGroupKey, ExecErrState, Labels, NoDataState,
    NotificationSettings, RecordSettings,
};
use chrono::{DateTime, Utc};
use serde::Deserialize;

use crate::error::SourceError;

fn default_org() -> i64 {
    1
}

fn default_condition() -> String {
    "A".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct RuleGroupFile {
    #[serde(default = "default_org")]
    pub org_id: i64,
    pub folder_uid: String,
    pub folder_title: String,
    pub group: String,
    pub interval_seconds: i64,
    #[serde(default)]
    pub rules: Vec<RuleEntry>,
}

/// One rule inside a group file. Group-level fields are filled in from the
/// enclosing file.
#[derive(Debug, Clone, Deserialize)]
pub struct RuleEntry {
    pub uid: String,
    pub title: String,
    #[serde(default = "default_condition")]
    pub condition: String,
    #[serde(default)]
    pub data: Vec<AlertQuery>,
    /// Explicit version. Derived from the rule content when absent.
    #[serde(default)]
    pub version: Option<i64>,
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

impl RuleGroupFile {
    pub fn key(&self) -> AlertRuleGroupKey {
        AlertRuleGroupKey {
            org_id: self.org_id,
            namespace_uid: self.folder_uid.clone(),
            rule_group: self.group.clone(),
        }
    }

    pub fn validate(&self) -> Result<(), SourceError> {
        if self.folder_uid.trim().is_empty() {
            return Err(SourceError::Validation("folder_uid must not be empty".to_string()));
        }
        if self.group.trim().is_empty() {
            return Err(SourceError::Validation("group must not be empty".to_string()));
        }
        if self.interval_seconds <= 0 {
            return Err(SourceError::Validation(format!(
                "group '{}' has non-positive interval {}",
                self.group, self.interval_seconds
            )));
        }
        let mut seen = HashSet::new();
        for rule in &self.rules {
            if rule.uid.trim().is_empty() {
                return Err(SourceError::Validation(format!(
                    "rule in group '{}' has an empty uid",
                    self.group
                )));
            }
            if !seen.insert(rule.uid.as_str()) {
                return Err(SourceError::Validation(format!(
                    "duplicate rule uid '{}' in group '{}'",
                    rule.uid, self.group
                )));
            }
        }
        Ok(())
    }

    /// Expand into full rule definitions. Group index follows file order.
    pub fn into_rules(self, updated: DateTime<Utc>) -> Vec<AlertRule> {
        let key = self.key();
        let folder_title = self.folder_title;
        self.rules
            .into_iter()
            .enumerate()
            .map(|(index, entry)| {
                let mut rule = AlertRule::new(entry.uid, &key, self.interval_seconds);
                rule.title = entry.title;
                rule.condition = entry.condition;
                rule.data = entry.data;
                rule.updated = updated;
                rule.rule_group_index = index as i32 + 1;
                rule.no_data_state = entry.no_data_state;
                rule.exec_err_state = entry.exec_err_state;
                rule.for_seconds = entry.for_seconds;
                rule.keep_firing_for_seconds = entry.keep_firing_for_seconds;
                rule.annotations = entry.annotations;
                rule.labels = entry.labels;
                rule.is_paused = entry.is_paused;
                rule.notification_settings = entry.notification_settings;
                rule.record = entry.record;
                rule.missing_series_evals_to_resolve = entry.missing_series_evals_to_resolve;
                // Content-derived versions change exactly when the rule or
                // its folder title does.
                rule.version = entry
                    .version
                    .unwrap_or_else(|| (rule.fingerprint_with_folder(&folder_title).as_u64() >> 1) as i64);
                rule
            })
            .collect()
    }
}
