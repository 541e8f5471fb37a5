use std::sync::Arc;

use async_trait::async_trait;
use cadence_core::{AlertRule, Fingerprint};
use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use super::{Rule, RuleContext, RuleCore, RuleStatus};
use crate::cancel::{CauseToken, StopReason};
use crate::traits::{Alert, Condition, EvalResult, StateTransition};

/// Evaluates a condition, feeds the state manager and notifies on firing
/// or resolved instances.
pub struct AlertingRule {
    core: RuleCore,
}

impl AlertingRule {
    pub(crate) fn new(definition: AlertRule, fingerprint: Fingerprint, ctx: Arc<RuleContext>) -> Self {
        Self {
            core: RuleCore::new(definition, fingerprint, ctx),
        }
    }

    async fn send(&self, transitions: &[StateTransition]) -> usize {
        let interval = self.core.definition.interval();
        let alerts: Vec<Alert> = transitions
            .iter()
            .filter(|t| t.needs_sending())
            .map(|t| t.to_alert(interval))
            .collect();
        if alerts.is_empty() {
            return 0;
        }
        if let Err(e) = self.core.ctx.collaborators.notifier.send(&self.core.key, &alerts).await {
            warn!(rule = %self.core.key, error = %e, alerts = alerts.len(), "Failed to send alerts");
        }
        alerts.len()
    }
}

#[async_trait]
impl Rule for AlertingRule {
    fn definition(&self) -> &AlertRule {
        &self.core.definition
    }

    fn fingerprint(&self) -> Fingerprint {
        self.core.fingerprint
    }

    fn status(&self) -> RuleStatus {
        self.core.status()
    }

    async fn do_eval(&self, cancel: &CauseToken, scheduled_at: DateTime<Utc>, folder_title: &str) {
        let core = &self.core;
        if RuleCore::stopping(cancel) {
            return;
        }
        if core.definition.is_paused {
            debug!(rule = %core.key, "Rule is paused, skipping evaluation");
            core.eval_applied(scheduled_at);
            return;
        }

        let condition = Condition::from_rule(&core.definition);
        let evaluator = &core.ctx.collaborators.evaluator;
        let cond = &condition;
        let (outcome, duration) = core
            .attempt(cancel, move |_| evaluator.evaluate(cond, scheduled_at))
            .await;
        core.record(&outcome, duration, scheduled_at);

        let results = match outcome.result {
            Ok(results) => results,
            Err(e) if e.is_stop() => {
                debug!(rule = %core.key, error = %e, "Evaluation cancelled");
                return;
            }
            Err(e) => {
                warn!(
                    rule = %core.key,
                    attempts = outcome.attempts,
                    error = %e,
                    "Rule evaluation failed",
                );
                vec![EvalResult::from_error(&e, scheduled_at)]
            }
        };
        core.record_results(&results, scheduled_at, duration);

        // A stop that raced the evaluation wins: nothing reaches state.
        if RuleCore::stopping(cancel) {
            return;
        }

        let transitions = core
            .ctx
            .collaborators
            .state_manager
            .process_eval_results(&core.definition, scheduled_at, &results, &core.extra_labels(folder_title))
            .await;
        let sent = self.send(&transitions).await;

        debug!(
            rule = %core.key,
            results = results.len(),
            transitions = transitions.len(),
            sent,
            duration_ms = duration.as_millis() as u64,
            "Rule evaluated",
        );
        core.eval_applied(scheduled_at);
    }

    async fn on_stop(&self, reason: StopReason) {
        let core = &self.core;
        match reason {
            StopReason::RuleDeleted | StopReason::RuleRestarted => {
                let transitions = core
                    .ctx
                    .collaborators
                    .state_manager
                    .delete_states(&core.key, reason)
                    .await;
                let resolved = self.send(&transitions).await;
                info!(rule = %core.key, %reason, resolved, "Rule state cleared");
            }
            _ => {
                debug!(rule = %core.key, %reason, "Rule stopped, state kept");
            }
        }
        core.stop_applied(reason);
    }
}
