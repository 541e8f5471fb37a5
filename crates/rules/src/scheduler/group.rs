//! A rule group: the unit of scheduling.
//!
//! Each running group owns one tokio task that wakes on every base tick,
//! works out which of its rules are due, evaluates them (in parallel or as
//! one sequence) under a per-tick deadline, and exits when its
//! [`CauseToken`] is cancelled.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use cadence_core::{
    AlertRule, AlertRuleGroupKey, AlertRuleKey, Fingerprint, FingerprintWriter, FolderKey,
    JitterStrategy, SchedulerConfig,
};
use chrono::{DateTime, Utc};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::cache::FolderCache;
use super::jitter::jitter_offset_in_ticks;
use crate::cancel::{CauseToken, StopReason};
use crate::clock::{to_chrono, Clock};
use crate::rule::{run_evaluation, Evaluation, Rule, RuleFactory};
use crate::sequence::build_sequences;

fn nanos(t: DateTime<Utc>) -> i64 {
    t.timestamp_nanos_opt().unwrap_or(i64::MAX)
}

fn from_nanos(n: i64) -> DateTime<Utc> {
    const NANOS_PER_SEC: i64 = 1_000_000_000;
    DateTime::from_timestamp(n.div_euclid(NANOS_PER_SEC), n.rem_euclid(NANOS_PER_SEC) as u32)
        .unwrap_or_default()
}

fn duration_nanos(d: Duration) -> i64 {
    i64::try_from(d.as_nanos()).unwrap_or(i64::MAX)
}

/// A rule plus the tick offset it becomes ready at.
#[derive(Clone)]
struct ScheduledRule {
    rule: Arc<dyn Rule>,
    offset: i64,
}

/// Builds groups that share scheduling settings and collaborators.
#[derive(Clone)]
pub struct GroupFactory {
    base_interval: Duration,
    jitter: JitterStrategy,
    sequential: bool,
    clock: Arc<dyn Clock>,
    folders: Arc<FolderCache>,
    rules: RuleFactory,
}

impl GroupFactory {
    pub fn new(
        config: &SchedulerConfig,
        clock: Arc<dyn Clock>,
        folders: Arc<FolderCache>,
        rules: RuleFactory,
    ) -> Self {
        Self {
            base_interval: config.base_interval,
            jitter: config.jitter,
            sequential: config.sequential_evaluation,
            clock,
            folders,
            rules,
        }
    }

    /// Build a group from rules that all belong to `key`. Rules are ordered
    /// by group index, then uid.
    pub fn create(&self, key: AlertRuleGroupKey, mut definitions: Vec<AlertRule>, folder_title: &str) -> Arc<Group> {
        definitions.sort_by(|a, b| {
            a.rule_group_index
                .cmp(&b.rule_group_index)
                .then_with(|| a.uid.cmp(&b.uid))
        });

        let interval = definitions
            .first()
            .map(AlertRule::interval)
            .unwrap_or(self.base_interval);
        let frequency = definitions
            .first()
            .map(|r| r.frequency_in_ticks(self.base_interval))
            .unwrap_or(1);
        let offset = definitions
            .first()
            .map(|r| jitter_offset_in_ticks(r, self.base_interval, self.jitter))
            .unwrap_or(0);

        let rules: Vec<ScheduledRule> = definitions
            .into_iter()
            .map(|definition| {
                let offset = jitter_offset_in_ticks(&definition, self.base_interval, self.jitter);
                ScheduledRule {
                    rule: self.rules.create(definition, folder_title),
                    offset,
                }
            })
            .collect();

        let mut w = FingerprintWriter::new();
        w.write_i64(key.org_id)
            .write_str(&key.namespace_uid)
            .write_str(&key.rule_group)
            .write_u64(interval.as_secs())
            .write_u64(rules.len() as u64);
        for r in &rules {
            w.write_u64(r.rule.fingerprint().as_u64());
        }

        Arc::new(Group {
            folder_key: FolderKey {
                org_id: key.org_id,
                uid: key.namespace_uid.clone(),
            },
            key,
            interval,
            base_interval: self.base_interval,
            frequency,
            offset,
            jitter: self.jitter,
            sequential: self.sequential,
            fingerprint: w.finish(),
            rules,
            clock: self.clock.clone(),
            folders: self.folders.clone(),
            cancel: CauseToken::new(),
            terminated: CancellationToken::new(),
            started: AtomicBool::new(false),
        })
    }
}

pub struct Group {
    key: AlertRuleGroupKey,
    folder_key: FolderKey,
    interval: Duration,
    base_interval: Duration,
    /// Base ticks per evaluation.
    frequency: i64,
    /// Tick offset of the group as a whole.
    offset: i64,
    jitter: JitterStrategy,
    sequential: bool,
    fingerprint: Fingerprint,
    rules: Vec<ScheduledRule>,
    clock: Arc<dyn Clock>,
    folders: Arc<FolderCache>,
    cancel: CauseToken,
    /// Cancelled when the run loop has exited.
    terminated: CancellationToken,
    started: AtomicBool,
}

impl fmt::Debug for Group {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Group")
            .field("key", &self.key)
            .field("interval", &self.interval)
            .field("rules", &self.rules.len())
            .field("fingerprint", &self.fingerprint)
            .finish()
    }
}

impl Group {
    pub fn key(&self) -> &AlertRuleGroupKey {
        &self.key
    }

    pub fn folder_key(&self) -> &FolderKey {
        &self.folder_key
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn fingerprint(&self) -> Fingerprint {
        self.fingerprint
    }

    pub fn offset(&self) -> i64 {
        self.offset
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn rules(&self) -> Vec<Arc<dyn Rule>> {
        self.rules.iter().map(|r| r.rule.clone()).collect()
    }

    pub fn rule(&self, key: &AlertRuleKey) -> Option<Arc<dyn Rule>> {
        self.rules
            .iter()
            .find(|r| r.rule.definition().uid == key.uid && r.rule.definition().org_id == key.org_id)
            .map(|r| r.rule.clone())
    }

    pub fn is_running(&self) -> bool {
        self.started.load(Ordering::SeqCst) && !self.terminated.is_cancelled()
    }

    /// Same key, same rules in the same order with the same fingerprints.
    pub fn equals(&self, other: &Group) -> bool {
        self.key == other.key
            && self.rules.len() == other.rules.len()
            && self
                .rules
                .iter()
                .zip(&other.rules)
                .all(|(a, b)| a.rule.fingerprint() == b.rule.fingerprint())
    }

    // ── Timing ────────────────────────────────────────────────

    /// Phase of this group's evaluations within an interval, in nanoseconds.
    fn phase_nanos(&self) -> i64 {
        let interval = duration_nanos(self.interval);
        if interval <= 0 {
            return 0;
        }
        (self.fingerprint.as_u64() % interval as u64) as i64
    }

    /// Latest evaluation slot at or before `t`. Slots are one interval apart
    /// and shifted by a phase derived from the group fingerprint, so
    /// restarts land on the same slots.
    pub fn eval_timestamp(&self, t: DateTime<Utc>) -> DateTime<Utc> {
        let interval = duration_nanos(self.interval);
        if interval <= 0 {
            return t;
        }
        let phase = self.phase_nanos();
        let adjusted = nanos(t) - phase;
        let slot = adjusted - adjusted.rem_euclid(interval);
        from_nanos(slot + phase)
    }

    /// Index of the base tick at `t`. Tick 0 is an evaluation slot.
    fn tick_number(&self, t: DateTime<Utc>) -> i64 {
        let base = duration_nanos(self.base_interval).max(1);
        (nanos(t) - self.phase_nanos()).div_euclid(base)
    }

    /// First base tick strictly after `t`.
    fn next_tick_after(&self, t: DateTime<Utc>) -> DateTime<Utc> {
        let base = duration_nanos(self.base_interval).max(1);
        let phase = self.phase_nanos();
        let k = (nanos(t) - phase).div_euclid(base) + 1;
        from_nanos(phase + k * base)
    }

    /// Whether the group as a whole is due on `tick`.
    pub fn check_ready(&self, tick: i64) -> bool {
        self.frequency > 0 && tick.rem_euclid(self.frequency) - self.offset == 0
    }

    /// Rules due on `tick`. With per-rule jitter each rule has its own phase.
    pub fn ready_rules(&self, tick: i64) -> Vec<Arc<dyn Rule>> {
        if self.frequency <= 0 {
            return Vec::new();
        }
        match self.jitter {
            JitterStrategy::ByRule => self
                .rules
                .iter()
                .filter(|r| tick.rem_euclid(self.frequency) - r.offset == 0)
                .map(|r| r.rule.clone())
                .collect(),
            _ if self.check_ready(tick) => self.rules(),
            _ => Vec::new(),
        }
    }

    // ── Lifecycle ─────────────────────────────────────────────

    /// Start the tick loop on a new task. Does nothing if the group was
    /// already started or has been stopped.
    pub fn run(self: &Arc<Self>) {
        if self.cancel.is_cancelled() || self.started.swap(true, Ordering::SeqCst) {
            debug!(group = %self.key, "Rule group already started or stopped, not starting");
            return;
        }
        let group = self.clone();
        tokio::spawn(async move { group.run_loop().await });
    }

    /// Stop the tick loop and wait until it has exited, including any
    /// in-flight evaluation. Idempotent. Returns at once for a group that
    /// never ran.
    pub async fn stop(&self, reason: StopReason) {
        self.cancel.cancel(reason);
        if self.started.load(Ordering::SeqCst) {
            self.terminated.cancelled().await;
        }
    }

    /// Hand each rule its stop disposition. Rules that live on unchanged in
    /// `successors` are left alone, changed ones are restarted and the rest
    /// get `absent`.
    pub async fn release_rules(&self, successors: &HashMap<AlertRuleKey, Fingerprint>, absent: StopReason) {
        for scheduled in &self.rules {
            let rule = &scheduled.rule;
            let reason = match successors.get(&rule.key()) {
                Some(fp) if *fp == rule.fingerprint() => continue,
                Some(_) => StopReason::RuleRestarted,
                None => absent,
            };
            rule.on_stop(reason).await;
        }
    }

    async fn run_loop(self: Arc<Self>) {
        let _terminated = self.terminated.clone().drop_guard();
        let base = to_chrono(self.base_interval);
        let mut next = self.next_tick_after(self.clock.now());

        info!(
            group = %self.key,
            interval_secs = self.interval.as_secs(),
            rules = self.rules.len(),
            first_tick = %next,
            "Rule group started",
        );

        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                _ = self.clock.sleep_until(next) => {}
            }

            let tick = self.tick_number(next);
            self.process_tick(tick, next).await;
            if self.cancel.is_cancelled() {
                break;
            }

            next += base;
            let now = self.clock.now();
            if now >= next + base {
                let behind = (now - next).num_nanoseconds().unwrap_or(i64::MAX);
                let skipped = behind / duration_nanos(self.base_interval).max(1);
                next = self.next_tick_after(now - base);
                warn!(group = %self.key, skipped, resume_at = %next, "Rule group fell behind, skipping ticks");
            }
        }

        info!(
            group = %self.key,
            reason = %self.cancel.reason().unwrap_or(StopReason::Shutdown),
            "Rule group stopped",
        );
    }

    async fn process_tick(&self, tick: i64, tick_time: DateTime<Utc>) {
        let ready = self.ready_rules(tick);
        if ready.is_empty() {
            return;
        }

        let Some(folder_title) = self.folders.get(&self.folder_key) else {
            error!(
                group = %self.key,
                folder = %self.folder_key,
                "Folder title not found, skipping evaluation",
            );
            return;
        };

        debug!(group = %self.key, tick, rules = ready.len(), "Evaluating rule group");

        let batch_cancel = self.cancel.child_token();
        let batch = self.evaluate_batch(ready, &batch_cancel, tick_time, &folder_title);
        tokio::pin!(batch);

        tokio::select! {
            _ = &mut batch => {}
            _ = self.clock.sleep(self.interval) => {
                warn!(
                    group = %self.key,
                    interval_secs = self.interval.as_secs(),
                    "Evaluation exceeded the group interval, cancelling",
                );
                batch_cancel.cancel(StopReason::Timeout);
                batch.await;
            }
        }
    }

    async fn evaluate_batch(
        &self,
        ready: Vec<Arc<dyn Rule>>,
        cancel: &CauseToken,
        scheduled_at: DateTime<Utc>,
        folder_title: &str,
    ) {
        if self.sequential {
            for sequence in build_sequences(&ready) {
                sequence.run(cancel, scheduled_at, folder_title).await;
            }
            return;
        }

        let mut set = JoinSet::new();
        for rule in ready {
            let cancel = cancel.clone();
            let evaluation = Evaluation {
                scheduled_at,
                folder_title: folder_title.to_string(),
                after_eval: None,
            };
            set.spawn(async move { run_evaluation(rule.as_ref(), &cancel, evaluation).await });
        }
        while let Some(joined) = set.join_next().await {
            if let Err(e) = joined {
                error!(group = %self.key, error = %e, "Rule evaluation task failed");
            }
        }
    }
}
