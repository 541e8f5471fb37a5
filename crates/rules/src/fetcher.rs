//! Periodic snapshot of a slow rule source.
//!
//! [`BackgroundFetcher`] pulls full schedule data from an upstream
//! [`RuleSource`] every `fetch_interval` and serves the manager from that
//! snapshot, so manager ticks never hit the upstream store directly.

use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use cadence_core::{AlertRule, ScheduleKey};
use tokio_util::sync::CancellationToken;

use crate::clock::Clock;
use crate::error::SourceError;
use crate::traits::{RuleSource, ScheduleData, ScheduleDataOptions};

#[derive(Default)]
struct Snapshot {
    data: Option<ScheduleData>,
    last_error: Option<String>,
}

pub struct BackgroundFetcher {
    upstream: Arc<dyn RuleSource>,
    clock: Arc<dyn Clock>,
    fetch_interval: Duration,
    opts: ScheduleDataOptions,
    snapshot: RwLock<Snapshot>,
}

impl BackgroundFetcher {
    pub fn new(
        upstream: Arc<dyn RuleSource>,
        clock: Arc<dyn Clock>,
        fetch_interval: Duration,
        opts: ScheduleDataOptions,
    ) -> Self {
        Self {
            upstream,
            clock,
            fetch_interval,
            opts,
            snapshot: RwLock::new(Snapshot::default()),
        }
    }

    /// Fetch once. On failure the previous snapshot is kept and the error
    /// is remembered.
    pub async fn refresh(&self) -> Result<usize, SourceError> {
        match self.upstream.get_schedule_data(&self.opts).await {
            Ok(data) => {
                let count = data.rules.len();
                let mut snap = self.snapshot.write().expect("snapshot lock poisoned");
                snap.data = Some(data);
                snap.last_error = None;
                Ok(count)
            }
            Err(e) => {
                self.snapshot.write().expect("snapshot lock poisoned").last_error = Some(e.to_string());
                Err(e)
            }
        }
    }

    /// Latest rules and the error of the last failed refresh, if any.
    pub fn rules(&self) -> (Vec<AlertRule>, Option<String>) {
        let snap = self.snapshot.read().expect("snapshot lock poisoned");
        let rules = snap.data.as_ref().map(|d| d.rules.clone()).unwrap_or_default();
        (rules, snap.last_error.clone())
    }

    /// Refresh immediately, then every `fetch_interval`, until `cancel`.
    pub async fn run(&self, cancel: CancellationToken) {
        tracing::info!(interval_secs = self.fetch_interval.as_secs(), "Rule fetcher started");

        loop {
            match self.refresh().await {
                Ok(rules) => tracing::debug!(rules, "Rule snapshot refreshed"),
                Err(e) => tracing::error!(error = %e, "Rule fetch failed, keeping previous snapshot"),
            }

            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::info!("Rule fetcher stopping");
                    break;
                }
                _ = self.clock.sleep(self.fetch_interval) => {}
            }
        }
    }

    fn data(&self) -> Result<ScheduleData, SourceError> {
        let snap = self.snapshot.read().expect("snapshot lock poisoned");
        match (&snap.data, &snap.last_error) {
            (Some(data), _) => Ok(data.clone()),
            (None, Some(e)) => Err(SourceError::Unavailable(e.clone())),
            (None, None) => Err(SourceError::Unavailable("no rules fetched yet".to_string())),
        }
    }
}

#[async_trait]
impl RuleSource for BackgroundFetcher {
    async fn get_alert_rule_schedule_keys(&self) -> Result<Vec<ScheduleKey>, SourceError> {
        Ok(self.data()?.rules.iter().map(AlertRule::schedule_key).collect())
    }

    async fn get_schedule_data(&self, opts: &ScheduleDataOptions) -> Result<ScheduleData, SourceError> {
        let mut data = self.data()?;
        data.rules.retain(|r| !opts.disabled_orgs.contains(&r.org_id));
        Ok(data)
    }
}
