use std::sync::Arc;

use async_trait::async_trait;
use cadence_core::{AlertRule, Fingerprint, Labels, RecordSettings};
use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use super::{Health, Rule, RuleContext, RuleCore, RuleStatus, METRIC_NAME_LABEL};
use crate::cancel::{CauseToken, StopReason};
use crate::error::EvalError;
use crate::traits::{Condition, EvalResult, EvalState, Sample};

/// Evaluates a query and writes each resulting series as a sample of
/// `record.metric`. Keeps no alert state.
pub struct RecordingRule {
    core: RuleCore,
}

impl RecordingRule {
    pub(crate) fn new(definition: AlertRule, fingerprint: Fingerprint, ctx: Arc<RuleContext>) -> Self {
        Self {
            core: RuleCore::new(definition, fingerprint, ctx),
        }
    }
}

/// Turn evaluation results into samples. An error result fails the whole
/// batch so it is retried.
fn to_samples(
    rule: &AlertRule,
    record: &RecordSettings,
    results: &[EvalResult],
    at: DateTime<Utc>,
) -> Result<Vec<Sample>, EvalError> {
    if let Some(failed) = results.iter().find(|r| r.state == EvalState::Error) {
        return Err(EvalError::Transient(
            failed.error.clone().unwrap_or_else(|| "query returned an error".to_string()),
        ));
    }

    Ok(results
        .iter()
        .filter_map(|r| {
            let value = *r.values.get(&record.from)?;
            let mut labels: Labels = r.instance.clone();
            labels.merge_missing(&rule.labels);
            labels.insert(METRIC_NAME_LABEL, record.metric.clone());
            Some(Sample {
                metric: record.metric.clone(),
                labels,
                value,
                timestamp: at,
            })
        })
        .collect())
}

#[async_trait]
impl Rule for RecordingRule {
    fn definition(&self) -> &AlertRule {
        &self.core.definition
    }

    fn fingerprint(&self) -> Fingerprint {
        self.core.fingerprint
    }

    fn status(&self) -> RuleStatus {
        self.core.status()
    }

    async fn do_eval(&self, cancel: &CauseToken, scheduled_at: DateTime<Utc>, _folder_title: &str) {
        let core = &self.core;
        if RuleCore::stopping(cancel) {
            return;
        }
        let Some(record) = core.definition.record.as_ref() else {
            warn!(rule = %core.key, "Recording rule has no record settings");
            return;
        };
        if core.definition.is_paused {
            debug!(rule = %core.key, "Rule is paused, skipping evaluation");
            core.eval_applied(scheduled_at);
            return;
        }

        let condition = Condition::from_rule(&core.definition);
        let evaluator = &core.ctx.collaborators.evaluator;
        let writer = &core.ctx.collaborators.writer;
        let definition = &core.definition;
        let cond = &condition;
        let (outcome, duration) = core
            .attempt(cancel, move |_| async move {
                let results = evaluator.evaluate(cond, scheduled_at).await?;
                let samples = to_samples(definition, record, &results, scheduled_at)?;
                if samples.is_empty() {
                    return Ok(0);
                }
                writer
                    .write(record.target_datasource_uid.as_deref(), &samples)
                    .await
                    .map_err(|e| EvalError::Transient(e.to_string()))?;
                Ok::<_, EvalError>(samples.len())
            })
            .await;
        core.record(&outcome, duration, scheduled_at);

        let status = match outcome.result {
            Ok(written) => {
                debug!(rule = %core.key, metric = %record.metric, written, "Recorded series");
                RuleStatus {
                    health: if written == 0 { Health::NoData } else { Health::Ok },
                    last_error: None,
                    last_evaluation: Some(scheduled_at),
                    evaluation_duration: duration,
                }
            }
            Err(e) if e.is_stop() => {
                debug!(rule = %core.key, error = %e, "Evaluation cancelled");
                return;
            }
            Err(e) => {
                warn!(
                    rule = %core.key,
                    attempts = outcome.attempts,
                    error = %e,
                    "Recording rule evaluation failed",
                );
                RuleStatus {
                    health: Health::Error,
                    last_error: Some(e.to_string()),
                    last_evaluation: Some(scheduled_at),
                    evaluation_duration: duration,
                }
            }
        };
        core.set_status(status);
        core.eval_applied(scheduled_at);
    }

    async fn on_stop(&self, reason: StopReason) {
        debug!(rule = %self.core.key, %reason, "Recording rule stopped");
        self.core.stop_applied(reason);
    }
}
