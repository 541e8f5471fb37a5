//! In-memory [`StateManager`].
//!
//! Tracks one [`AlertState`] per (rule, label set) and applies the rule's
//! pending period and no-data / error policies. State is lost on restart.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use cadence_core::{AlertRule, AlertRuleKey, ExecErrState, Fingerprint, Labels, NoDataState};
use chrono::{DateTime, Utc};

use crate::cancel::StopReason;
use crate::clock::Clock;
use crate::traits::{AlertState, AlertStateKind, EvalResult, EvalState, StateManager, StateTransition};

type InstanceKey = (AlertRuleKey, Fingerprint);

pub struct MemoryStateManager {
    clock: Arc<dyn Clock>,
    states: Mutex<HashMap<InstanceKey, AlertState>>,
}

impl MemoryStateManager {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            states: Mutex::new(HashMap::new()),
        }
    }

    pub fn len(&self) -> usize {
        self.states.lock().expect("state lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// What a result asks for before the pending period is applied.
enum Target {
    Firing,
    Kind(AlertStateKind),
    Keep,
}

fn target(rule: &AlertRule, result: &EvalResult) -> Target {
    match result.state {
        EvalState::Normal => Target::Kind(AlertStateKind::Normal),
        EvalState::Alerting => Target::Firing,
        EvalState::NoData => match rule.no_data_state {
            NoDataState::Alerting => Target::Firing,
            NoDataState::NoData => Target::Kind(AlertStateKind::NoData),
            NoDataState::Ok => Target::Kind(AlertStateKind::Normal),
            NoDataState::KeepLast => Target::Keep,
        },
        EvalState::Error => match rule.exec_err_state {
            ExecErrState::Alerting => Target::Firing,
            ExecErrState::Error => Target::Kind(AlertStateKind::Error),
            ExecErrState::Ok => Target::Kind(AlertStateKind::Normal),
            ExecErrState::KeepLast => Target::Keep,
        },
    }
}

fn next_kind(rule: &AlertRule, previous: Option<&AlertState>, target: Target, at: DateTime<Utc>) -> AlertStateKind {
    let prev_kind = previous.map(|s| s.state).unwrap_or(AlertStateKind::Normal);
    match target {
        Target::Kind(kind) => kind,
        Target::Keep => prev_kind,
        Target::Firing => match prev_kind {
            AlertStateKind::Alerting => AlertStateKind::Alerting,
            _ if rule.for_seconds <= 0 => AlertStateKind::Alerting,
            AlertStateKind::Pending => {
                let since = previous.map(|s| s.starts_at).unwrap_or(at);
                if (at - since).num_seconds() >= rule.for_seconds {
                    AlertStateKind::Alerting
                } else {
                    AlertStateKind::Pending
                }
            }
            _ => AlertStateKind::Pending,
        },
    }
}

#[async_trait]
impl StateManager for MemoryStateManager {
    async fn process_eval_results(
        &self,
        rule: &AlertRule,
        evaluated_at: DateTime<Utc>,
        results: &[EvalResult],
        extra_labels: &Labels,
    ) -> Vec<StateTransition> {
        let rule_key = rule.key();
        let mut states = self.states.lock().expect("state lock poisoned");
        let mut transitions = Vec::with_capacity(results.len());
        let mut seen = Vec::with_capacity(results.len());

        for result in results {
            let mut labels = result.instance.clone();
            labels.merge_missing(extra_labels);
            labels.merge_missing(&rule.labels);
            let key = (rule_key.clone(), labels.fingerprint());
            seen.push(key.1);

            let previous = states.get(&key);
            let prev_kind = previous.map(|s| s.state).unwrap_or(AlertStateKind::Normal);
            let kind = next_kind(rule, previous, target(rule, result), evaluated_at);

            let starts_at = match previous {
                Some(p) if p.state == kind => p.starts_at,
                _ => evaluated_at,
            };
            let resolved_at = (prev_kind == AlertStateKind::Alerting && kind != AlertStateKind::Alerting)
                .then_some(evaluated_at);

            let state = AlertState {
                rule_key: rule_key.clone(),
                labels,
                annotations: rule.annotations.clone(),
                state: kind,
                starts_at,
                last_evaluated_at: evaluated_at,
                resolved_at,
                error: result.error.clone(),
            };
            transitions.push(StateTransition {
                previous: prev_kind,
                current: state.clone(),
            });
            states.insert(key, state);
        }

        // Instances that disappeared from the results are resolved and dropped.
        let stale: Vec<InstanceKey> = states
            .keys()
            .filter(|(k, fp)| *k == rule_key && !seen.contains(fp))
            .cloned()
            .collect();
        for key in stale {
            if let Some(mut state) = states.remove(&key) {
                let previous = state.state;
                state.state = AlertStateKind::Normal;
                state.resolved_at = Some(evaluated_at);
                state.last_evaluated_at = evaluated_at;
                transitions.push(StateTransition { previous, current: state });
            }
        }

        transitions
    }

    fn get_states_for_rule_uid(&self, org_id: i64, uid: &str) -> Vec<AlertState> {
        self.states
            .lock()
            .expect("state lock poisoned")
            .iter()
            .filter(|((k, _), _)| k.org_id == org_id && k.uid == uid)
            .map(|(_, s)| s.clone())
            .collect()
    }

    async fn delete_states(&self, key: &AlertRuleKey, reason: StopReason) -> Vec<StateTransition> {
        let now = self.clock.now();
        let mut states = self.states.lock().expect("state lock poisoned");
        let doomed: Vec<InstanceKey> = states.keys().filter(|(k, _)| k == key).cloned().collect();

        let mut transitions = Vec::with_capacity(doomed.len());
        for k in doomed {
            if let Some(mut state) = states.remove(&k) {
                let previous = state.state;
                state.state = AlertStateKind::Normal;
                state.resolved_at = Some(now);
                state.last_evaluated_at = now;
                transitions.push(StateTransition { previous, current: state });
            }
        }
        tracing::debug!(rule = %key, %reason, removed = transitions.len(), "Deleted alert state");
        transitions
    }
}

#[cfg(test)]
mod tests {
    use cadence_core::AlertRuleGroupKey;

    use super::*;
    use crate::clock::MockClock;

    fn rule(for_seconds: i64) -> AlertRule {
        let group = AlertRuleGroupKey {
            org_id: 1,
            namespace_uid: "f".into(),
            rule_group: "g".into(),
        };
        let mut r = AlertRule::new("r1", &group, 10);
        r.for_seconds = for_seconds;
        r
    }

    fn manager() -> MemoryStateManager {
        MemoryStateManager::new(Arc::new(MockClock::new(Utc::now())))
    }

    fn at(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000 + secs, 0).unwrap()
    }

    #[tokio::test]
    async fn firing_goes_through_pending() {
        let m = manager();
        let r = rule(20);
        let extra = Labels::new();

        let t = m
            .process_eval_results(&r, at(0), &[EvalResult::new(EvalState::Alerting, at(0))], &extra)
            .await;
        assert_eq!(t[0].current.state, AlertStateKind::Pending);

        let t = m
            .process_eval_results(&r, at(10), &[EvalResult::new(EvalState::Alerting, at(10))], &extra)
            .await;
        assert_eq!(t[0].current.state, AlertStateKind::Pending);

        let t = m
            .process_eval_results(&r, at(20), &[EvalResult::new(EvalState::Alerting, at(20))], &extra)
            .await;
        assert_eq!(t[0].current.state, AlertStateKind::Alerting);
        assert!(t[0].needs_sending());
    }

    #[tokio::test]
    async fn recovery_resolves() {
        let m = manager();
        let r = rule(0);
        let extra = Labels::new();

        m.process_eval_results(&r, at(0), &[EvalResult::new(EvalState::Alerting, at(0))], &extra)
            .await;
        let t = m
            .process_eval_results(&r, at(10), &[EvalResult::new(EvalState::Normal, at(10))], &extra)
            .await;
        assert!(t[0].is_resolved());
        assert_eq!(t[0].current.resolved_at, Some(at(10)));
    }

    #[tokio::test]
    async fn error_policy_applies() {
        let m = manager();
        let mut r = rule(0);
        r.exec_err_state = ExecErrState::Alerting;

        let t = m
            .process_eval_results(&r, at(0), &[EvalResult::new(EvalState::Error, at(0))], &Labels::new())
            .await;
        assert_eq!(t[0].current.state, AlertStateKind::Alerting);
    }

    #[tokio::test]
    async fn extra_labels_reach_state() {
        let m = manager();
        let r = rule(0);
        let mut extra = Labels::new();
        extra.insert("alertname", "r1");

        m.process_eval_results(&r, at(0), &[EvalResult::new(EvalState::Normal, at(0))], &extra)
            .await;
        let states = m.get_states_for_rule_uid(1, "r1");
        assert_eq!(states.len(), 1);
        assert_eq!(states[0].labels.get("alertname"), Some("r1"));
    }

    #[tokio::test]
    async fn delete_resolves_firing_instances() {
        let m = manager();
        let r = rule(0);
        m.process_eval_results(&r, at(0), &[EvalResult::new(EvalState::Alerting, at(0))], &Labels::new())
            .await;

        let t = m.delete_states(&r.key(), StopReason::RuleDeleted).await;
        assert_eq!(t.len(), 1);
        assert!(t[0].is_resolved());
        assert!(m.is_empty());
    }
}
