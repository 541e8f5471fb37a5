//! Sequential evaluation chains.
//!
//! When sequential evaluation is on, the rules of a group are evaluated one
//! after another in group order. Each rule's evaluation carries a
//! continuation that starts the next one, so a sequence is a single chain
//! of futures rather than a loop.

use std::collections::BTreeMap;
use std::sync::Arc;

use cadence_core::AlertRuleGroupKey;
use chrono::{DateTime, Utc};
use futures::FutureExt;

use crate::cancel::CauseToken;
use crate::rule::{run_evaluation, AfterEval, Evaluation, Rule};

/// Rules of one group in evaluation order.
#[derive(Clone)]
pub struct Sequence {
    rules: Vec<Arc<dyn Rule>>,
}

impl Sequence {
    pub fn head(&self) -> &Arc<dyn Rule> {
        &self.rules[0]
    }

    pub fn rules(&self) -> &[Arc<dyn Rule>] {
        &self.rules
    }

    /// Evaluate every rule in order. After a stop the remaining rules return
    /// immediately and after a timeout they report it, so the chain always
    /// completes.
    pub async fn run(&self, cancel: &CauseToken, scheduled_at: DateTime<Utc>, folder_title: &str) {
        if let Some(start) = chain(&self.rules, cancel, scheduled_at, folder_title) {
            start().await;
        }
    }
}

/// Build the continuation chain back to front: each link evaluates one rule
/// and then calls the link after it.
fn chain(
    rules: &[Arc<dyn Rule>],
    cancel: &CauseToken,
    scheduled_at: DateTime<Utc>,
    folder_title: &str,
) -> Option<AfterEval> {
    let mut next: Option<AfterEval> = None;
    for rule in rules.iter().rev() {
        let rule = rule.clone();
        let cancel = cancel.clone();
        let folder_title = folder_title.to_string();
        let after_eval = next.take();
        next = Some(Box::new(move || {
            async move {
                let evaluation = Evaluation {
                    scheduled_at,
                    folder_title,
                    after_eval,
                };
                run_evaluation(rule.as_ref(), &cancel, evaluation).await;
            }
            .boxed()
        }));
    }
    next
}

/// Split `rules` into one sequence per group. Within a sequence rules are
/// ordered by group index, then uid. Sequences are ordered by the uid of
/// their first rule.
pub fn build_sequences(rules: &[Arc<dyn Rule>]) -> Vec<Sequence> {
    let mut by_group: BTreeMap<AlertRuleGroupKey, Vec<Arc<dyn Rule>>> = BTreeMap::new();
    for rule in rules {
        by_group
            .entry(rule.definition().group_key())
            .or_default()
            .push(rule.clone());
    }

    let mut sequences: Vec<Sequence> = by_group
        .into_values()
        .map(|mut rules| {
            rules.sort_by(|a, b| {
                let (a, b) = (a.definition(), b.definition());
                a.rule_group_index
                    .cmp(&b.rule_group_index)
                    .then_with(|| a.uid.cmp(&b.uid))
            });
            Sequence { rules }
        })
        .collect();
    sequences.sort_by(|a, b| a.head().definition().uid.cmp(&b.head().definition().uid));
    sequences
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use async_trait::async_trait;
    use cadence_core::{AlertRule, Fingerprint};

    use super::*;
    use crate::cancel::StopReason;
    use crate::rule::RuleStatus;

    struct Recorded {
        definition: AlertRule,
        log: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl Rule for Recorded {
        fn definition(&self) -> &AlertRule {
            &self.definition
        }

        fn fingerprint(&self) -> Fingerprint {
            self.definition.fingerprint()
        }

        fn status(&self) -> RuleStatus {
            RuleStatus::default()
        }

        async fn do_eval(&self, _cancel: &CauseToken, _scheduled_at: DateTime<Utc>, _folder_title: &str) {
            self.log.lock().unwrap().push(self.definition.uid.clone());
        }

        async fn on_stop(&self, _reason: StopReason) {}
    }

    fn rule(log: &Arc<Mutex<Vec<String>>>, group: &str, uid: &str, index: i32) -> Arc<dyn Rule> {
        let key = AlertRuleGroupKey {
            org_id: 1,
            namespace_uid: "f".into(),
            rule_group: group.into(),
        };
        let mut definition = AlertRule::new(uid, &key, 10);
        definition.rule_group_index = index;
        Arc::new(Recorded {
            definition,
            log: log.clone(),
        })
    }

    fn uids(sequence: &Sequence) -> Vec<&str> {
        sequence.rules().iter().map(|r| r.definition().uid.as_str()).collect()
    }

    #[test]
    fn one_sequence_per_group_in_index_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let rules = vec![
            rule(&log, "g2", "c", 1),
            rule(&log, "g1", "a", 2),
            rule(&log, "g1", "b", 1),
            rule(&log, "g1", "d", 2),
        ];

        let sequences = build_sequences(&rules);
        assert_eq!(sequences.len(), 2);
        assert_eq!(uids(&sequences[0]), vec!["b", "a", "d"]);
        assert_eq!(uids(&sequences[1]), vec!["c"]);
    }

    #[tokio::test]
    async fn chain_evaluates_each_rule_once_in_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let rules = vec![rule(&log, "g", "a", 3), rule(&log, "g", "b", 1), rule(&log, "g", "c", 2)];

        let sequences = build_sequences(&rules);
        sequences[0].run(&CauseToken::new(), Utc::now(), "Folder").await;

        assert_eq!(*log.lock().unwrap(), vec!["b", "c", "a"]);
    }

    #[test]
    fn empty_input_has_no_sequences() {
        assert!(build_sequences(&[]).is_empty());
    }
}
