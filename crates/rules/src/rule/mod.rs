//! Per-rule evaluation runtime.
//!
//! A [`Rule`] wraps one rule definition plus the collaborators it needs to
//! evaluate. Rules have no loop of their own: the owning group calls
//! [`run_evaluation`] on each ready tick and [`Rule::on_stop`] when the rule
//! leaves the schedule.

mod alerting;
mod factory;
mod recording;
mod status;

use std::future::Future;
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use cadence_core::{AlertRule, AlertRuleKey, Fingerprint, Labels, RetryConfig};
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;

use crate::cancel::{CauseToken, StopReason};
use crate::clock::Clock;
use crate::error::EvalError;
use crate::metrics::{EvaluationRecord, SchedulerMetrics};
use crate::retry::{retry_with_backoff, RetryOutcome};
use crate::traits::{EvalResult, Evaluator, Notifier, RecordingWriter, StateManager};

pub use alerting::AlertingRule;
pub use factory::RuleFactory;
pub use recording::RecordingRule;
pub use status::{Health, RuleStatus};

pub const RULE_UID_LABEL: &str = "__alert_rule_uid__";
pub const NAMESPACE_UID_LABEL: &str = "__alert_rule_namespace_uid__";
pub const FOLDER_TITLE_LABEL: &str = "grafana_folder";
pub const ALERT_NAME_LABEL: &str = "alertname";
pub const METRIC_NAME_LABEL: &str = "__name__";

/// Continuation fired after a rule finishes evaluating.
pub type AfterEval = Box<dyn FnOnce() -> BoxFuture<'static, ()> + Send>;

/// Callback fired after a rule's evaluation took effect.
pub type EvalAppliedFn = Arc<dyn Fn(&AlertRuleKey, DateTime<Utc>) + Send + Sync>;
/// Callback fired after a rule finished stopping.
pub type StopAppliedFn = Arc<dyn Fn(&AlertRuleKey) + Send + Sync>;

/// Observation hooks, mostly for tests.
#[derive(Clone, Default)]
pub struct EvalHooks {
    pub eval_applied: Option<EvalAppliedFn>,
    pub stop_applied: Option<StopAppliedFn>,
}

/// Everything a rule talks to besides its own definition.
#[derive(Clone)]
pub struct Collaborators {
    pub evaluator: Arc<dyn Evaluator>,
    pub state_manager: Arc<dyn StateManager>,
    pub notifier: Arc<dyn Notifier>,
    pub writer: Arc<dyn RecordingWriter>,
}

pub(crate) struct RuleContext {
    pub collaborators: Collaborators,
    pub clock: Arc<dyn Clock>,
    pub retry: RetryConfig,
    pub disable_folder_label: bool,
    pub metrics: Arc<RwLock<SchedulerMetrics>>,
    pub hooks: EvalHooks,
}

/// One scheduled evaluation.
pub struct Evaluation {
    pub scheduled_at: DateTime<Utc>,
    pub folder_title: String,
    pub after_eval: Option<AfterEval>,
}

#[async_trait]
pub trait Rule: Send + Sync {
    fn definition(&self) -> &AlertRule;

    fn key(&self) -> AlertRuleKey {
        self.definition().key()
    }

    /// Content fingerprint including the folder title the rule was built with.
    fn fingerprint(&self) -> Fingerprint;

    fn status(&self) -> RuleStatus;

    /// Evaluate once for `scheduled_at`. Failures end up in the rule's state
    /// and status, never in the caller.
    async fn do_eval(&self, cancel: &CauseToken, scheduled_at: DateTime<Utc>, folder_title: &str);

    /// Release the rule. `reason` decides what happens to its alert state.
    async fn on_stop(&self, reason: StopReason);
}

/// Evaluate `rule`, then hand off to the continuation if there is one.
pub async fn run_evaluation(rule: &dyn Rule, cancel: &CauseToken, evaluation: Evaluation) {
    rule.do_eval(cancel, evaluation.scheduled_at, &evaluation.folder_title)
        .await;
    if let Some(next) = evaluation.after_eval {
        next().await;
    }
}

// ── Shared plumbing ───────────────────────────────────────────

/// State common to alerting and recording rules.
pub(crate) struct RuleCore {
    pub definition: AlertRule,
    pub key: AlertRuleKey,
    pub fingerprint: Fingerprint,
    pub ctx: Arc<RuleContext>,
    status: Mutex<RuleStatus>,
}

impl RuleCore {
    pub fn new(definition: AlertRule, fingerprint: Fingerprint, ctx: Arc<RuleContext>) -> Self {
        Self {
            key: definition.key(),
            definition,
            fingerprint,
            ctx,
            status: Mutex::new(RuleStatus::default()),
        }
    }

    pub fn status(&self) -> RuleStatus {
        self.status.lock().expect("rule status lock poisoned").clone()
    }

    pub fn set_status(&self, status: RuleStatus) {
        *self.status.lock().expect("rule status lock poisoned") = status;
    }

    /// Labels the scheduler attaches to every alert of this rule.
    pub fn extra_labels(&self, folder_title: &str) -> Labels {
        let mut labels = Labels::new();
        labels.insert(RULE_UID_LABEL, self.definition.uid.clone());
        labels.insert(NAMESPACE_UID_LABEL, self.definition.namespace_uid.clone());
        if !self.ctx.disable_folder_label {
            labels.insert(FOLDER_TITLE_LABEL, folder_title);
        }
        labels.insert(ALERT_NAME_LABEL, self.definition.title.clone());
        labels
    }

    /// Run `op` under the configured retry policy, timing it.
    pub async fn attempt<T, F, Fut>(&self, cancel: &CauseToken, op: F) -> (RetryOutcome<T>, Duration)
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, EvalError>>,
    {
        let started = Instant::now();
        let outcome = retry_with_backoff(&self.ctx.retry, &self.ctx.clock, cancel, op).await;
        (outcome, started.elapsed())
    }

    pub fn record<T>(&self, outcome: &RetryOutcome<T>, duration: Duration, at: DateTime<Utc>) {
        let failed = matches!(&outcome.result, Err(e) if !e.is_stop());
        let mut metrics = self.ctx.metrics.write().expect("metrics lock poisoned");
        metrics.record_evaluation(&EvaluationRecord {
            rule: &self.key,
            attempts: outcome.attempts,
            failed_attempts: outcome.failed_attempts(),
            failed,
            duration,
            at,
        });
    }

    pub fn record_results(&self, results: &[EvalResult], at: DateTime<Utc>, duration: Duration) {
        self.set_status(RuleStatus::from_results(results, at, duration));
    }

    /// The rule is being stopped. A tick deadline does not count.
    pub fn stopping(cancel: &CauseToken) -> bool {
        cancel.is_cancelled() && cancel.reason() != Some(StopReason::Timeout)
    }

    pub fn eval_applied(&self, at: DateTime<Utc>) {
        if let Some(hook) = &self.ctx.hooks.eval_applied {
            hook(&self.key, at);
        }
    }

    pub fn stop_applied(&self, reason: StopReason) {
        if matches!(reason, StopReason::RuleDeleted) {
            self.ctx
                .metrics
                .write()
                .expect("metrics lock poisoned")
                .forget_rule(&self.key);
        }
        if let Some(hook) = &self.ctx.hooks.stop_applied {
            hook(&self.key);
        }
    }
}
