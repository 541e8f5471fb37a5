//! scheduler-worker: runs the rule scheduler over a YAML rules directory.
//!
//! Queries are not sent anywhere: each query's `model.value` is taken as
//! its result, and a rule fires when its condition query is non-zero.
//! Notifications and recorded samples are written to the log.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use cadence_core::{config::load_dotenv, AlertRuleKey, SchedulerConfig};
use cadence_rules::{
    Alert, BackgroundFetcher, Clock, Collaborators, Condition, EvalError, EvalResult, EvalState, Evaluator,
    Manager, MemoryStateManager, Notifier, RecordingWriter, RuleLoader, RuleSource, Sample, ScheduleDataOptions,
    SinkError, SystemClock,
};
use chrono::{DateTime, Utc};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

// ── CLI ─────────────────────────────────────────────────────────────

/// Alert rule scheduler worker.
#[derive(Parser, Debug)]
#[command(name = "scheduler-worker", version, about)]
struct Cli {
    /// Directory of rule group YAML files.
    #[arg(long, env = "RULES_DIR", default_value = "data/rules")]
    rules_dir: PathBuf,

    /// Serve the scheduler from a periodically refreshed snapshot instead
    /// of rescanning the directory on every tick.
    #[arg(long, env = "RULES_BACKGROUND_FETCH", default_value_t = false)]
    background_fetch: bool,

    /// Shutdown timeout in seconds.
    #[arg(long, env = "RULES_SHUTDOWN_TIMEOUT", default_value_t = 10)]
    shutdown_timeout: u64,
}

// ── Collaborators ───────────────────────────────────────────────────

/// Reads static values out of the query models.
struct StaticEvaluator;

#[async_trait]
impl Evaluator for StaticEvaluator {
    async fn evaluate(&self, condition: &Condition, at: DateTime<Utc>) -> Result<Vec<EvalResult>, EvalError> {
        let values: BTreeMap<String, f64> = condition
            .data
            .iter()
            .map(|q| (q.ref_id.clone(), q.model.get("value").and_then(|v| v.as_f64()).unwrap_or(0.0)))
            .collect();

        let Some(value) = values.get(&condition.condition).copied() else {
            return Err(EvalError::Definition(format!(
                "condition '{}' does not name a query",
                condition.condition
            )));
        };

        let state = if value != 0.0 { EvalState::Alerting } else { EvalState::Normal };
        Ok(vec![EvalResult {
            values,
            ..EvalResult::new(state, at)
        }])
    }
}

struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn send(&self, key: &AlertRuleKey, alerts: &[Alert]) -> Result<(), SinkError> {
        for alert in alerts {
            info!(
                rule = %key,
                labels = ?alert.labels,
                starts_at = %alert.starts_at,
                ends_at = %alert.ends_at,
                "Alert",
            );
        }
        Ok(())
    }
}

struct LogWriter;

#[async_trait]
impl RecordingWriter for LogWriter {
    async fn write(&self, target: Option<&str>, samples: &[Sample]) -> Result<(), SinkError> {
        for sample in samples {
            info!(
                target_datasource = target.unwrap_or("default"),
                metric = %sample.metric,
                value = sample.value,
                timestamp = %sample.timestamp,
                "Recorded sample",
            );
        }
        Ok(())
    }
}

// ── main ────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    load_dotenv();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = SchedulerConfig::from_env()?;
    config.log_summary();

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let cancel = CancellationToken::new();

    let loader: Arc<dyn RuleSource> = Arc::new(RuleLoader::new(cli.rules_dir.clone()));
    let source: Arc<dyn RuleSource> = if cli.background_fetch {
        let fetcher = Arc::new(BackgroundFetcher::new(
            loader,
            clock.clone(),
            config.fetch_interval,
            ScheduleDataOptions {
                disabled_orgs: config.disabled_orgs.clone(),
            },
        ));
        let runner = fetcher.clone();
        let token = cancel.clone();
        tokio::spawn(async move { runner.run(token).await });
        fetcher as Arc<dyn RuleSource>
    } else {
        loader
    };

    let collaborators = Collaborators {
        evaluator: Arc::new(StaticEvaluator),
        state_manager: Arc::new(MemoryStateManager::new(clock.clone())),
        notifier: Arc::new(LogNotifier),
        writer: Arc::new(LogWriter),
    };

    let manager = Manager::builder(config, source, collaborators)
        .clock(clock)
        .build()?;

    let handle = manager.handle();
    info!(rules_dir = %cli.rules_dir.display(), "scheduler-worker starting");
    let scheduler = tokio::spawn(manager.run(cancel.clone()));

    tokio::signal::ctrl_c().await?;
    info!("Shutdown requested");
    cancel.cancel();

    match tokio::time::timeout(Duration::from_secs(cli.shutdown_timeout), scheduler).await {
        Ok(Ok(())) => info!("scheduler-worker exited cleanly"),
        Ok(Err(e)) => warn!(error = %e, "Scheduler task failed"),
        Err(_) => warn!(timeout_secs = cli.shutdown_timeout, "Scheduler did not stop in time"),
    }

    let metrics = handle.metrics();
    let summary = serde_json::to_string(&metrics)?;
    info!(
        evaluations = metrics.evaluations_total(),
        metrics = %summary,
        "Final scheduler metrics",
    );
    Ok(())
}
