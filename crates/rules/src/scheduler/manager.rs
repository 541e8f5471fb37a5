//! The top-level scheduler.
//!
//! [`Manager`] polls the rule source on every base tick, rebuilds the group
//! set when the source changed, and reconciles it with the running groups:
//! unchanged groups keep running, changed ones are swapped (old stopped,
//! rules released, new started), missing ones are stopped.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock};

use cadence_core::{AlertRule, AlertRuleGroupKey, AlertRuleKey, Fingerprint, SchedulerConfig};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::cache::{FolderCache, GroupCache, RuleCache};
use super::group::{Group, GroupFactory};
use crate::cancel::StopReason;
use crate::clock::{to_chrono, Clock, SystemClock};
use crate::error::{Result, SchedulerError};
use crate::metrics::SchedulerMetrics;
use crate::rule::{Collaborators, EvalHooks, Rule, RuleFactory, RuleStatus};
use crate::traits::{RuleSource, ScheduleDataOptions};

/// Counts from one reconciliation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct UpdateSummary {
    pub started: usize,
    pub updated: usize,
    pub stopped: usize,
    pub unchanged: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOutcome {
    /// Schedule keys did not change, nothing was fetched.
    Unchanged,
    Rescheduled(UpdateSummary),
}

/// Builder for [`Manager`].
pub struct ManagerBuilder {
    config: SchedulerConfig,
    source: Arc<dyn RuleSource>,
    collaborators: Collaborators,
    clock: Arc<dyn Clock>,
    hooks: EvalHooks,
}

impl ManagerBuilder {
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn hooks(mut self, hooks: EvalHooks) -> Self {
        self.hooks = hooks;
        self
    }

    pub fn build(self) -> Result<Manager> {
        self.config.validate()?;

        let metrics = Arc::new(RwLock::new(SchedulerMetrics::default()));
        let folders = Arc::new(FolderCache::new());
        let rules = RuleFactory::new(
            &self.config,
            self.collaborators,
            self.clock.clone(),
            metrics.clone(),
            self.hooks,
        );
        let groups = GroupFactory::new(&self.config, self.clock.clone(), folders.clone(), rules);

        Ok(Manager {
            config: self.config,
            source: self.source,
            clock: self.clock,
            group_factory: groups,
            folders,
            rule_cache: RuleCache::new(),
            published: Arc::new(GroupCache::new()),
            registry: HashMap::new(),
            metrics,
        })
    }
}

pub struct Manager {
    config: SchedulerConfig,
    source: Arc<dyn RuleSource>,
    clock: Arc<dyn Clock>,
    group_factory: GroupFactory,
    folders: Arc<FolderCache>,
    rule_cache: RuleCache,
    /// Copy of `registry` readable from other tasks.
    published: Arc<GroupCache>,
    /// Running groups. Only the manager's own task touches this.
    registry: HashMap<AlertRuleGroupKey, Arc<Group>>,
    metrics: Arc<RwLock<SchedulerMetrics>>,
}

impl Manager {
    pub fn builder(
        config: SchedulerConfig,
        source: Arc<dyn RuleSource>,
        collaborators: Collaborators,
    ) -> ManagerBuilder {
        ManagerBuilder {
            config,
            source,
            collaborators,
            clock: Arc::new(SystemClock),
            hooks: EvalHooks::default(),
        }
    }

    /// Read-only view for status queries from other tasks.
    pub fn handle(&self) -> ManagerHandle {
        ManagerHandle {
            groups: self.published.clone(),
            metrics: self.metrics.clone(),
        }
    }

    pub fn group_count(&self) -> usize {
        self.registry.len()
    }

    pub fn group(&self, key: &AlertRuleGroupKey) -> Option<Arc<Group>> {
        self.registry.get(key).cloned()
    }

    pub fn status(&self, key: &AlertRuleKey) -> Option<RuleStatus> {
        self.registry.values().find_map(|g| g.rule(key)).map(|r| r.status())
    }

    pub fn metrics(&self) -> SchedulerMetrics {
        self.metrics.read().expect("metrics lock poisoned").clone()
    }

    /// Poll on every base tick until `cancel` fires, then stop every group.
    pub async fn run(mut self, cancel: CancellationToken) {
        let base = to_chrono(self.config.base_interval);
        let mut next = self.clock.now();

        info!(
            profile = self.config.profile_label(),
            base_interval_secs = self.config.base_interval.as_secs(),
            "Rule scheduler started",
        );

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = self.clock.sleep_until(next) => {}
            }

            match self.update().await {
                Ok(UpdateOutcome::Unchanged) => debug!("Rules unchanged"),
                Ok(UpdateOutcome::Rescheduled(summary)) => debug!(?summary, "Rules rescheduled"),
                Err(e) => error!(error = %e, "Failed to update rule schedule"),
            }
            next += base;
        }

        self.stop_all(StopReason::Shutdown).await;
        info!("Rule scheduler stopped");
    }

    /// Refresh the schedule gauges from the registry.
    fn record_metrics(&self) {
        let scheduled: Vec<(String, Vec<Arc<dyn Rule>>)> = self
            .registry
            .values()
            .map(|g| (self.folders.get(g.folder_key()).unwrap_or_default(), g.rules()))
            .collect();
        self.metrics.write().expect("metrics lock poisoned").record_reschedule(
            scheduled
                .iter()
                .flat_map(|(title, rules)| rules.iter().map(move |r| (title.as_str(), r.definition()))),
            self.clock.now(),
        );
    }

    /// Run one reconciliation against the rule source.
    pub async fn update(&mut self) -> Result<UpdateOutcome> {
        let Some(desired) = self.load_groups().await? else {
            return Ok(UpdateOutcome::Unchanged);
        };

        let successors: Arc<HashMap<AlertRuleKey, Fingerprint>> = Arc::new(
            desired
                .values()
                .flat_map(|g| g.rules())
                .map(|r| (r.key(), r.fingerprint()))
                .collect(),
        );

        let mut previous = std::mem::take(&mut self.registry);
        let mut next = HashMap::with_capacity(desired.len());
        let mut summary = UpdateSummary::default();
        let mut tasks = JoinSet::new();

        for (key, group) in desired {
            match previous.remove(&key) {
                Some(existing) if existing.equals(&group) => {
                    summary.unchanged += 1;
                    next.insert(key, existing);
                }
                Some(existing) => {
                    summary.updated += 1;
                    info!(group = %key, rules = group.len(), "Rule group changed, restarting");
                    let successors = successors.clone();
                    let replacement = group.clone();
                    tasks.spawn(async move {
                        existing.stop(StopReason::GroupUpdated).await;
                        existing.release_rules(&successors, StopReason::RuleDeleted).await;
                        replacement.run();
                    });
                    next.insert(key, group);
                }
                None => {
                    summary.started += 1;
                    info!(group = %key, rules = group.len(), "Rule group added");
                    group.run();
                    next.insert(key, group);
                }
            }
        }

        for (key, stale) in previous {
            summary.stopped += 1;
            info!(group = %key, "Rule group removed");
            let successors = successors.clone();
            tasks.spawn(async move {
                stale.stop(StopReason::GroupDeleted).await;
                stale.release_rules(&successors, StopReason::RuleDeleted).await;
            });
        }

        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "Rule group transition failed");
            }
        }

        self.registry = next;
        self.published.replace(self.registry.clone());

        let rules: usize = self.registry.values().map(|g| g.len()).sum();
        self.record_metrics();

        if summary.started + summary.updated + summary.stopped > 0 {
            info!(
                groups = self.registry.len(),
                rules,
                started = summary.started,
                updated = summary.updated,
                stopped = summary.stopped,
                unchanged = summary.unchanged,
                "Rule schedule updated",
            );
        }
        Ok(UpdateOutcome::Rescheduled(summary))
    }

    /// Fetch and group rules if anything changed. `None` means the cheap key
    /// listing matched the last one and a registry already exists.
    async fn load_groups(&mut self) -> Result<Option<BTreeMap<AlertRuleGroupKey, Arc<Group>>>> {
        let keys = self.source.get_alert_rule_schedule_keys().await?;
        let changed = self.rule_cache.update(&keys);
        if !changed && !self.registry.is_empty() {
            return Ok(None);
        }

        let opts = ScheduleDataOptions {
            disabled_orgs: self.config.disabled_orgs.clone(),
        };
        let data = match self.source.get_schedule_data(&opts).await {
            Ok(data) => data,
            Err(e) => {
                // Retry the full fetch next tick even if the keys stay put.
                self.rule_cache.invalidate();
                return Err(e.into());
            }
        };

        let mut by_group: BTreeMap<AlertRuleGroupKey, Vec<AlertRule>> = BTreeMap::new();
        for rule in data.rules {
            if self.config.disabled_orgs.contains(&rule.org_id) {
                continue;
            }
            if let Err(e) = rule.validate_interval(self.config.base_interval) {
                warn!(rule = %rule.key(), error = %e, "Skipping rule with invalid interval");
                continue;
            }
            if !data.folders.contains_key(&rule.folder_key()) {
                self.rule_cache.invalidate();
                return Err(SchedulerError::MissingFolder {
                    rule: rule.key().to_string(),
                    folder: rule.namespace_uid.clone(),
                });
            }
            by_group.entry(rule.group_key()).or_default().push(rule);
        }

        let groups = by_group
            .into_iter()
            .map(|(key, rules)| {
                let title = data
                    .folders
                    .get(&rules[0].folder_key())
                    .cloned()
                    .unwrap_or_default();
                let group = self.group_factory.create(key.clone(), rules, &title);
                (key, group)
            })
            .collect();

        self.folders.replace(data.folders);
        Ok(Some(groups))
    }

    /// Stop every group and release all rules with `reason`.
    pub async fn stop_all(&mut self, reason: StopReason) {
        let groups: Vec<Arc<Group>> = self.registry.drain().map(|(_, g)| g).collect();
        let count = groups.len();
        let none: Arc<HashMap<AlertRuleKey, Fingerprint>> = Arc::new(HashMap::new());

        let mut tasks = JoinSet::new();
        for group in groups {
            let none = none.clone();
            tasks.spawn(async move {
                group.stop(reason).await;
                group.release_rules(&none, reason).await;
            });
        }
        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "Failed to stop rule group");
            }
        }

        self.published.replace(HashMap::new());
        self.record_metrics();
        self.rule_cache.invalidate();
        info!(groups = count, %reason, "All rule groups stopped");
    }
}

/// Cloneable read side of a [`Manager`].
#[derive(Clone)]
pub struct ManagerHandle {
    groups: Arc<GroupCache>,
    metrics: Arc<RwLock<SchedulerMetrics>>,
}

impl ManagerHandle {
    pub fn groups(&self) -> HashMap<AlertRuleGroupKey, Arc<Group>> {
        self.groups.snapshot()
    }

    pub fn group(&self, key: &AlertRuleGroupKey) -> Option<Arc<Group>> {
        self.groups.get(key)
    }

    /// Latest evaluation status of a scheduled rule.
    pub fn status(&self, key: &AlertRuleKey) -> Option<RuleStatus> {
        self.groups
            .snapshot()
            .values()
            .find_map(|g| g.rule(key))
            .map(|r| r.status())
    }

    pub fn metrics(&self) -> SchedulerMetrics {
        self.metrics.read().expect("metrics lock poisoned").clone()
    }
}
