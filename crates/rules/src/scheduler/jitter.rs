//! Deterministic phase offsets that spread evaluations across base ticks.

use std::time::Duration;

use cadence_core::{AlertRule, JitterStrategy, Labels};

/// Offset, in base ticks, at which `rule` becomes ready within its interval.
/// Always in `[0, interval / base)`. Stable across restarts: it only depends
/// on the rule's group identity (and uid for [`JitterStrategy::ByRule`]).
pub fn jitter_offset_in_ticks(rule: &AlertRule, base_interval: Duration, strategy: JitterStrategy) -> i64 {
    if strategy == JitterStrategy::Never {
        return 0;
    }
    let frequency = rule.frequency_in_ticks(base_interval);
    if frequency <= 0 {
        return 0;
    }
    let offset = jitter_hash(rule, strategy) % frequency as u64;
    (offset as i64).abs()
}

fn jitter_hash(rule: &AlertRule, strategy: JitterStrategy) -> u64 {
    let mut labels = Labels::new();
    labels.insert("name", rule.rule_group.clone());
    labels.insert("file", rule.namespace_uid.clone());
    labels.insert("orgId", rule.org_id.to_string());
    if strategy == JitterStrategy::ByRule {
        labels.insert("uid", rule.uid.clone());
    }
    labels.fingerprint().as_u64()
}
