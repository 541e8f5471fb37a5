//! Shared fakes for scheduler integration tests.
#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use cadence_core::{
    AlertRule, AlertRuleGroupKey, AlertRuleKey, FolderKey, Labels, RetryConfig, ScheduleKey, SchedulerConfig,
};
use cadence_rules::{
    Alert, AlertState, Clock, Collaborators, Condition, EvalError, EvalHooks, EvalResult, EvalState, Evaluator,
    Manager, MemoryStateManager, MockClock, Notifier, RecordingWriter, RuleSource, Sample, ScheduleData,
    ScheduleDataOptions, SchedulerError, SinkError, SourceError, StateManager, StateTransition, StopReason,
    UpdateOutcome,
};
use chrono::{DateTime, Utc};
use tokio::sync::mpsc;

pub const START: i64 = 1_700_000_000;

pub fn start_time() -> DateTime<Utc> {
    DateTime::from_timestamp(START, 0).unwrap()
}

/// Default config with instant retries.
pub fn test_config() -> SchedulerConfig {
    SchedulerConfig {
        retry: RetryConfig {
            max_attempts: 3,
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            randomization_factor: 0.0,
        },
        ..SchedulerConfig::default()
    }
}

pub fn group_key(org_id: i64, folder: &str, group: &str) -> AlertRuleGroupKey {
    AlertRuleGroupKey {
        org_id,
        namespace_uid: folder.into(),
        rule_group: group.into(),
    }
}

/// A rule whose condition is its own uid, so evaluator calls can be told
/// apart.
pub fn rule(group: &AlertRuleGroupKey, uid: &str, interval_seconds: i64) -> AlertRule {
    let mut r = AlertRule::new(uid, group, interval_seconds);
    r.condition = uid.to_string();
    r
}

/// Schedule data with a folder title for every folder the rules use.
pub fn schedule_data(rules: Vec<AlertRule>) -> ScheduleData {
    let folders = rules
        .iter()
        .map(|r| (r.folder_key(), format!("Folder {}", r.namespace_uid)))
        .collect();
    ScheduleData { rules, folders }
}

// ── Source ────────────────────────────────────────────────────

#[derive(Default)]
pub struct StaticSource {
    data: Mutex<ScheduleData>,
    fail: Mutex<bool>,
}

impl StaticSource {
    pub fn set(&self, data: ScheduleData) {
        *self.data.lock().unwrap() = data;
    }

    pub fn set_failing(&self, fail: bool) {
        *self.fail.lock().unwrap() = fail;
    }

    pub fn remove_folder(&self, key: &FolderKey) {
        self.data.lock().unwrap().folders.remove(key);
    }
}

#[async_trait]
impl RuleSource for StaticSource {
    async fn get_alert_rule_schedule_keys(&self) -> Result<Vec<ScheduleKey>, SourceError> {
        Ok(self.data.lock().unwrap().rules.iter().map(AlertRule::schedule_key).collect())
    }

    async fn get_schedule_data(&self, _opts: &ScheduleDataOptions) -> Result<ScheduleData, SourceError> {
        if *self.fail.lock().unwrap() {
            return Err(SourceError::Unavailable("store offline".into()));
        }
        Ok(self.data.lock().unwrap().clone())
    }
}

// ── Evaluator ─────────────────────────────────────────────────

/// Evaluator keyed by condition ref. Records every call.
#[derive(Default)]
pub struct FakeEvaluator {
    calls: Mutex<Vec<(String, DateTime<Utc>)>>,
    states: Mutex<HashMap<String, EvalState>>,
    values: Mutex<HashMap<String, BTreeMap<String, f64>>>,
    failures: Mutex<HashMap<String, u32>>,
    hangs: Mutex<HashMap<String, u32>>,
}

impl FakeEvaluator {
    pub fn set_state(&self, condition: &str, state: EvalState) {
        self.states.lock().unwrap().insert(condition.into(), state);
    }

    pub fn set_value(&self, condition: &str, value: f64) {
        self.values
            .lock()
            .unwrap()
            .insert(condition.into(), BTreeMap::from([(condition.to_string(), value)]));
    }

    /// Fail the next `n` evaluations of `condition` with a transient error.
    pub fn fail(&self, condition: &str, n: u32) {
        self.failures.lock().unwrap().insert(condition.into(), n);
    }

    /// Make the next `n` evaluations of `condition` never return.
    pub fn hang(&self, condition: &str, n: u32) {
        self.hangs.lock().unwrap().insert(condition.into(), n);
    }

    pub fn calls(&self) -> Vec<(String, DateTime<Utc>)> {
        self.calls.lock().unwrap().clone()
    }

    pub fn call_count(&self, condition: &str) -> usize {
        self.calls.lock().unwrap().iter().filter(|(c, _)| c == condition).count()
    }
}

#[async_trait]
impl Evaluator for FakeEvaluator {
    async fn evaluate(&self, condition: &Condition, at: DateTime<Utc>) -> Result<Vec<EvalResult>, EvalError> {
        let name = condition.condition.clone();
        self.calls.lock().unwrap().push((name.clone(), at));

        let hang = match self.hangs.lock().unwrap().get_mut(&name) {
            Some(left) if *left > 0 => {
                *left -= 1;
                true
            }
            _ => false,
        };
        if hang {
            std::future::pending::<()>().await;
        }

        if let Some(left) = self.failures.lock().unwrap().get_mut(&name) {
            if *left > 0 {
                *left -= 1;
                return Err(EvalError::Transient(format!("{name} unavailable")));
            }
        }

        let state = self.states.lock().unwrap().get(&name).copied().unwrap_or(EvalState::Normal);
        let values = self.values.lock().unwrap().get(&name).cloned().unwrap_or_default();
        Ok(vec![EvalResult {
            values,
            ..EvalResult::new(state, at)
        }])
    }
}

// ── State ─────────────────────────────────────────────────────

/// In-memory state manager that also records what it was asked to do.
pub struct RecordingStateManager {
    inner: MemoryStateManager,
    processed: Mutex<Vec<(AlertRuleKey, DateTime<Utc>)>>,
    deleted: Mutex<Vec<(AlertRuleKey, StopReason)>>,
}

impl RecordingStateManager {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            inner: MemoryStateManager::new(clock),
            processed: Mutex::new(Vec::new()),
            deleted: Mutex::new(Vec::new()),
        }
    }

    pub fn processed(&self) -> Vec<(AlertRuleKey, DateTime<Utc>)> {
        self.processed.lock().unwrap().clone()
    }

    pub fn deleted(&self) -> Vec<(AlertRuleKey, StopReason)> {
        self.deleted.lock().unwrap().clone()
    }
}

#[async_trait]
impl StateManager for RecordingStateManager {
    async fn process_eval_results(
        &self,
        rule: &AlertRule,
        evaluated_at: DateTime<Utc>,
        results: &[EvalResult],
        extra_labels: &Labels,
    ) -> Vec<StateTransition> {
        self.processed.lock().unwrap().push((rule.key(), evaluated_at));
        self.inner
            .process_eval_results(rule, evaluated_at, results, extra_labels)
            .await
    }

    fn get_states_for_rule_uid(&self, org_id: i64, uid: &str) -> Vec<AlertState> {
        self.inner.get_states_for_rule_uid(org_id, uid)
    }

    async fn delete_states(&self, key: &AlertRuleKey, reason: StopReason) -> Vec<StateTransition> {
        self.deleted.lock().unwrap().push((key.clone(), reason));
        self.inner.delete_states(key, reason).await
    }
}

// ── Sinks ─────────────────────────────────────────────────────

#[derive(Default)]
pub struct FakeNotifier {
    sent: Mutex<Vec<Alert>>,
}

impl FakeNotifier {
    pub fn sent(&self) -> Vec<Alert> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl Notifier for FakeNotifier {
    async fn send(&self, _key: &AlertRuleKey, alerts: &[Alert]) -> Result<(), SinkError> {
        self.sent.lock().unwrap().extend_from_slice(alerts);
        Ok(())
    }
}

#[derive(Default)]
pub struct FakeWriter {
    written: Mutex<Vec<(Option<String>, Sample)>>,
}

impl FakeWriter {
    pub fn written(&self) -> Vec<(Option<String>, Sample)> {
        self.written.lock().unwrap().clone()
    }
}

#[async_trait]
impl RecordingWriter for FakeWriter {
    async fn write(&self, target: Option<&str>, samples: &[Sample]) -> Result<(), SinkError> {
        let mut written = self.written.lock().unwrap();
        for s in samples {
            written.push((target.map(str::to_string), s.clone()));
        }
        Ok(())
    }
}

// ── Harness ───────────────────────────────────────────────────

/// A manager wired to fakes and a mock clock. Evaluation and stop hooks
/// are captured so tests can wait on them.
pub struct Harness {
    pub base: Duration,
    pub clock: Arc<MockClock>,
    pub source: Arc<StaticSource>,
    pub evaluator: Arc<FakeEvaluator>,
    pub states: Arc<RecordingStateManager>,
    pub notifier: Arc<FakeNotifier>,
    pub writer: Arc<FakeWriter>,
    pub stopped: Arc<Mutex<Vec<AlertRuleKey>>>,
    pub manager: Manager,
    evals: mpsc::UnboundedReceiver<(AlertRuleKey, DateTime<Utc>)>,
}

impl Harness {
    pub fn new(config: SchedulerConfig) -> Self {
        let base = config.base_interval;
        let clock = Arc::new(MockClock::new(start_time()));
        let source = Arc::new(StaticSource::default());
        let evaluator = Arc::new(FakeEvaluator::default());
        let states = Arc::new(RecordingStateManager::new(clock.clone()));
        let notifier = Arc::new(FakeNotifier::default());
        let writer = Arc::new(FakeWriter::default());
        let stopped = Arc::new(Mutex::new(Vec::new()));

        let (tx, evals) = mpsc::unbounded_channel();
        let stops = stopped.clone();
        let hooks = EvalHooks {
            eval_applied: Some(Arc::new(move |key: &AlertRuleKey, at: DateTime<Utc>| {
                let _ = tx.send((key.clone(), at));
            })),
            stop_applied: Some(Arc::new(move |key: &AlertRuleKey| {
                stops.lock().unwrap().push(key.clone());
            })),
        };

        let collaborators = Collaborators {
            evaluator: evaluator.clone(),
            state_manager: states.clone(),
            notifier: notifier.clone(),
            writer: writer.clone(),
        };
        let manager = Manager::builder(config, source.clone(), collaborators)
            .clock(clock.clone())
            .hooks(hooks)
            .build()
            .expect("valid config");

        Self {
            base,
            clock,
            source,
            evaluator,
            states,
            notifier,
            writer,
            stopped,
            manager,
            evals,
        }
    }

    /// Reconcile once, failing the test if it hangs.
    pub async fn update(&mut self) -> Result<UpdateOutcome, SchedulerError> {
        tokio::time::timeout(Duration::from_secs(5), self.manager.update())
            .await
            .expect("update should not hang")
    }

    /// Advance the clock one base tick at a time until some rule reports an
    /// applied evaluation.
    pub async fn next_eval(&mut self) -> (AlertRuleKey, DateTime<Utc>) {
        for _ in 0..50 {
            if let Ok(eval) = self.evals.try_recv() {
                return eval;
            }
            self.clock.advance(self.base);
            if let Ok(Some(eval)) = tokio::time::timeout(Duration::from_millis(100), self.evals.recv()).await {
                return eval;
            }
        }
        panic!("no evaluation was applied");
    }

    /// Collect `n` applied evaluations.
    pub async fn evals(&mut self, n: usize) -> Vec<(AlertRuleKey, DateTime<Utc>)> {
        let mut out = Vec::with_capacity(n);
        while out.len() < n {
            out.push(self.next_eval().await);
        }
        out
    }

    /// Drain applied evaluations already reported, without advancing time.
    pub fn drain_evals(&mut self) -> usize {
        let mut n = 0;
        while self.evals.try_recv().is_ok() {
            n += 1;
        }
        n
    }

    pub fn stopped(&self) -> Vec<AlertRuleKey> {
        self.stopped.lock().unwrap().clone()
    }
}
