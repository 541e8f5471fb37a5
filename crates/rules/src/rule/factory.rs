use std::sync::{Arc, RwLock};

use cadence_core::{AlertRule, RuleType, SchedulerConfig};

use super::{AlertingRule, Collaborators, EvalHooks, RecordingRule, Rule, RuleContext};
use crate::clock::Clock;
use crate::metrics::SchedulerMetrics;

/// Builds the right [`Rule`] variant for a definition, sharing one set of
/// collaborators across all of them.
#[derive(Clone)]
pub struct RuleFactory {
    ctx: Arc<RuleContext>,
}

impl RuleFactory {
    pub fn new(
        config: &SchedulerConfig,
        collaborators: Collaborators,
        clock: Arc<dyn Clock>,
        metrics: Arc<RwLock<SchedulerMetrics>>,
        hooks: EvalHooks,
    ) -> Self {
        Self {
            ctx: Arc::new(RuleContext {
                collaborators,
                clock,
                retry: config.retry.clone(),
                disable_folder_label: config.disable_folder_label,
                metrics,
                hooks,
            }),
        }
    }

    /// The rule's fingerprint covers `folder_title`, so a renamed folder
    /// yields a different rule.
    pub fn create(&self, definition: AlertRule, folder_title: &str) -> Arc<dyn Rule> {
        let fingerprint = definition.fingerprint_with_folder(folder_title);
        match definition.rule_type() {
            RuleType::Alerting => Arc::new(AlertingRule::new(definition, fingerprint, self.ctx.clone())),
            RuleType::Recording => Arc::new(RecordingRule::new(definition, fingerprint, self.ctx.clone())),
        }
    }
}
