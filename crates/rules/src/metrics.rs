use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::time::Duration;

use cadence_core::{AlertRule, AlertRuleKey, RuleType};
use chrono::{DateTime, Utc};
use serde::{Serialize, Serializer};

/// One finished evaluation, as reported by a rule.
#[derive(Debug, Clone)]
pub struct EvaluationRecord<'a> {
    pub rule: &'a AlertRuleKey,
    pub attempts: u32,
    pub failed_attempts: u32,
    /// The evaluation ended in an error after all retries.
    pub failed: bool,
    pub duration: Duration,
    pub at: DateTime<Utc>,
}

/// Scheduled rules of one group, by type and state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RuleCounts {
    pub alerting_active: usize,
    pub alerting_paused: usize,
    pub recording_active: usize,
    pub recording_paused: usize,
}

impl RuleCounts {
    fn add(&mut self, rule_type: RuleType, paused: bool) {
        let slot = match (rule_type, paused) {
            (RuleType::Alerting, false) => &mut self.alerting_active,
            (RuleType::Alerting, true) => &mut self.alerting_paused,
            (RuleType::Recording, false) => &mut self.recording_active,
            (RuleType::Recording, true) => &mut self.recording_paused,
        };
        *slot += 1;
    }
}

/// Scheduler operational counters. Shared behind `Arc<RwLock<_>>`.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SchedulerMetrics {
    /// Evaluations run, per org.
    pub evaluations: HashMap<i64, u64>,
    pub evaluation_failures: HashMap<i64, u64>,
    /// Individual evaluation attempts, per org.
    pub attempts: HashMap<i64, u64>,
    pub attempt_failures: HashMap<i64, u64>,
    #[serde(serialize_with = "keyed_by_display")]
    pub rule_evaluations: HashMap<AlertRuleKey, u64>,
    #[serde(serialize_with = "keyed_by_display")]
    pub avg_evaluation_duration: HashMap<AlertRuleKey, Duration>,
    #[serde(serialize_with = "keyed_by_display")]
    pub last_evaluation: HashMap<AlertRuleKey, DateTime<Utc>>,
    /// Rule groups currently scheduled.
    pub groups: usize,
    /// Rules currently scheduled.
    pub rules: usize,
    /// Scheduled rules per org, keyed by `"{folder title};{group}"`.
    pub rule_group_rules: HashMap<i64, BTreeMap<String, RuleCounts>>,
    /// Scheduled rule groups per org.
    pub rule_groups: HashMap<i64, usize>,
    /// Rules per org that route notifications through their own settings.
    pub simple_routing_rules: HashMap<i64, usize>,
    /// Last time the manager swapped its registry.
    pub last_reschedule: Option<DateTime<Utc>>,
}

fn keyed_by_display<S, K, V>(map: &HashMap<K, V>, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
    K: fmt::Display,
    V: Serialize,
{
    serializer.collect_map(map.iter().map(|(k, v)| (k.to_string(), v)))
}

impl SchedulerMetrics {
    pub fn record_evaluation(&mut self, rec: &EvaluationRecord<'_>) {
        let org_id = rec.rule.org_id;
        *self.evaluations.entry(org_id).or_default() += 1;
        *self.attempts.entry(org_id).or_default() += u64::from(rec.attempts);
        *self.attempt_failures.entry(org_id).or_default() += u64::from(rec.failed_attempts);
        if rec.failed {
            *self.evaluation_failures.entry(org_id).or_default() += 1;
        }
        self.last_evaluation.insert(rec.rule.clone(), rec.at);

        let count = {
            let c = self.rule_evaluations.entry(rec.rule.clone()).or_default();
            *c += 1;
            *c
        };
        let prev_avg = self
            .avg_evaluation_duration
            .get(rec.rule)
            .copied()
            .unwrap_or_default();

        // Incremental mean: new_avg = prev_avg + (duration - prev_avg) / count
        let new_avg = if count == 1 {
            rec.duration
        } else {
            let prev_nanos = prev_avg.as_nanos() as f64;
            let cur_nanos = rec.duration.as_nanos() as f64;
            let avg_nanos = prev_nanos + (cur_nanos - prev_nanos) / count as f64;
            Duration::from_nanos(avg_nanos as u64)
        };
        self.avg_evaluation_duration.insert(rec.rule.clone(), new_avg);
    }

    /// Replace the schedule gauges with the rules now running. Each rule
    /// comes with the title of its folder.
    pub fn record_reschedule<'a, I>(&mut self, scheduled: I, at: DateTime<Utc>)
    where
        I: IntoIterator<Item = (&'a str, &'a AlertRule)>,
    {
        self.rule_group_rules.clear();
        self.rule_groups.clear();
        self.simple_routing_rules.clear();

        let mut groups = HashSet::new();
        let mut rules = 0;
        for (folder_title, rule) in scheduled {
            rules += 1;
            if groups.insert(rule.group_key()) {
                *self.rule_groups.entry(rule.org_id).or_default() += 1;
            }
            self.rule_group_rules
                .entry(rule.org_id)
                .or_default()
                .entry(format!("{folder_title};{}", rule.rule_group))
                .or_default()
                .add(rule.rule_type(), rule.is_paused);
            if rule.notification_settings.is_some() {
                *self.simple_routing_rules.entry(rule.org_id).or_default() += 1;
            }
        }

        self.groups = groups.len();
        self.rules = rules;
        self.last_reschedule = Some(at);
    }

    /// Drop per-rule series of a rule that is no longer scheduled.
    pub fn forget_rule(&mut self, rule: &AlertRuleKey) {
        self.rule_evaluations.remove(rule);
        self.avg_evaluation_duration.remove(rule);
        self.last_evaluation.remove(rule);
    }

    pub fn evaluations_total(&self) -> u64 {
        self.evaluations.values().sum()
    }
}

#[cfg(test)]
mod tests {
    use cadence_core::{AlertRuleGroupKey, NotificationSettings, RecordSettings};

    use super::*;

    fn key(org_id: i64, uid: &str) -> AlertRuleKey {
        AlertRuleKey { org_id, uid: uid.into() }
    }

    fn record(rule: &AlertRuleKey, failed: bool, attempts: u32, ms: u64) -> EvaluationRecord<'_> {
        EvaluationRecord {
            rule,
            attempts,
            failed_attempts: if failed { attempts } else { attempts - 1 },
            failed,
            duration: Duration::from_millis(ms),
            at: Utc::now(),
        }
    }

    fn alert_rule(org_id: i64, folder: &str, group: &str, uid: &str) -> AlertRule {
        let group = AlertRuleGroupKey {
            org_id,
            namespace_uid: folder.into(),
            rule_group: group.into(),
        };
        AlertRule::new(uid, &group, 10)
    }

    #[test]
    fn record_single_evaluation() {
        let mut m = SchedulerMetrics::default();
        let r1 = key(1, "r1");
        m.record_evaluation(&record(&r1, false, 1, 100));

        assert_eq!(m.evaluations[&1], 1);
        assert_eq!(m.attempts[&1], 1);
        assert_eq!(m.attempt_failures[&1], 0);
        assert!(!m.evaluation_failures.contains_key(&1));
        assert!(m.last_evaluation.contains_key(&r1));
        assert_eq!(m.avg_evaluation_duration[&r1], Duration::from_millis(100));
    }

    #[test]
    fn failed_evaluation_counts_every_attempt() {
        let mut m = SchedulerMetrics::default();
        m.record_evaluation(&record(&key(1, "r1"), true, 3, 10));

        assert_eq!(m.evaluations[&1], 1);
        assert_eq!(m.evaluation_failures[&1], 1);
        assert_eq!(m.attempts[&1], 3);
        assert_eq!(m.attempt_failures[&1], 3);
    }

    #[test]
    fn durations_average_per_rule() {
        let mut m = SchedulerMetrics::default();
        let r1 = key(1, "r1");
        m.record_evaluation(&record(&r1, false, 1, 100));
        m.record_evaluation(&record(&r1, false, 1, 200));
        m.record_evaluation(&record(&key(1, "r2"), false, 1, 999));

        assert_eq!(m.rule_evaluations[&r1], 2);
        let avg = m.avg_evaluation_duration[&r1].as_millis();
        assert!((140..=160).contains(&avg), "expected ~150ms, got {}ms", avg);
        assert_eq!(m.evaluations_total(), 3);
    }

    #[test]
    fn forget_rule_drops_series() {
        let mut m = SchedulerMetrics::default();
        let r1 = key(1, "r1");
        m.record_evaluation(&record(&r1, false, 1, 100));
        m.forget_rule(&r1);
        assert!(m.avg_evaluation_duration.is_empty());
        assert!(m.last_evaluation.is_empty());
        // Org totals survive.
        assert_eq!(m.evaluations_total(), 1);
    }

    #[test]
    fn same_uid_in_two_orgs_keeps_two_series() {
        let mut m = SchedulerMetrics::default();
        let one = key(1, "shared");
        let two = key(2, "shared");
        m.record_evaluation(&record(&one, false, 1, 100));
        m.record_evaluation(&record(&two, false, 1, 300));
        assert_eq!(m.avg_evaluation_duration[&one], Duration::from_millis(100));
        assert_eq!(m.avg_evaluation_duration[&two], Duration::from_millis(300));

        m.forget_rule(&one);
        assert!(!m.rule_evaluations.contains_key(&one));
        assert_eq!(m.rule_evaluations[&two], 1);
    }

    #[test]
    fn serializes_rule_series_by_display_key() {
        let mut m = SchedulerMetrics::default();
        m.record_evaluation(&record(&key(1, "r1"), false, 1, 100));
        let json = serde_json::to_value(&m).unwrap();
        assert_eq!(json["rule_evaluations"]["org_id=1, rule_uid=r1"], 1);
    }

    #[test]
    fn reschedule_gauges_follow_the_scheduled_rules() {
        let mut m = SchedulerMetrics::default();
        let now = Utc::now();

        m.record_reschedule(std::iter::empty(), now);
        assert!(m.rule_group_rules.is_empty());
        assert!(m.rule_groups.is_empty());

        // One rule.
        let first = alert_rule(1, "infra", "cpu", "a");
        m.record_reschedule([("Infra", &first)], now);
        assert_eq!(
            m.rule_group_rules[&1]["Infra;cpu"],
            RuleCounts {
                alerting_active: 1,
                ..RuleCounts::default()
            }
        );
        assert_eq!(m.rule_groups[&1], 1);

        // A second rule in another group and org, with its own routing.
        let mut second = alert_rule(2, "apps", "latency", "b");
        second.notification_settings = Some(NotificationSettings::default());
        m.record_reschedule([("Infra", &first), ("Apps", &second)], now);
        assert_eq!(m.rule_groups[&1], 1);
        assert_eq!(m.rule_groups[&2], 1);
        assert_eq!(m.simple_routing_rules.get(&1), None);
        assert_eq!(m.simple_routing_rules[&2], 1);
        assert_eq!((m.groups, m.rules), (2, 2));

        // Pause one, add a recording rule next to it.
        let mut paused = first.clone();
        paused.is_paused = true;
        let mut recording = alert_rule(1, "infra", "cpu", "c");
        recording.record = Some(RecordSettings {
            metric: "cpu:avg".into(),
            from: "A".into(),
            target_datasource_uid: None,
        });
        m.record_reschedule([("Infra", &paused), ("Infra", &recording), ("Apps", &second)], now);
        assert_eq!(
            m.rule_group_rules[&1]["Infra;cpu"],
            RuleCounts {
                alerting_paused: 1,
                recording_active: 1,
                ..RuleCounts::default()
            }
        );
        assert_eq!(m.rule_groups[&1], 1);

        // Remove the second org's rule.
        m.record_reschedule([("Infra", &paused), ("Infra", &recording)], now);
        assert!(!m.rule_group_rules.contains_key(&2));
        assert!(!m.rule_groups.contains_key(&2));
        assert!(m.simple_routing_rules.is_empty());
        assert_eq!((m.groups, m.rules), (1, 2));
    }
}
