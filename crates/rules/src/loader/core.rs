//! Core [`RuleLoader`] struct: a read-only rule source over a YAML directory.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use cadence_core::{AlertRuleKey, FolderKey, ScheduleKey};
use chrono::{DateTime, Utc};
use tracing::{info, warn};

use super::error::{LoadResult, LoadStatus};
use super::file::RuleGroupFile;
use crate::error::SourceError;
use crate::traits::{RuleSource, ScheduleData, ScheduleDataOptions};

/// Everything found in one scan of the rules directory.
#[derive(Debug, Default)]
pub struct LoadReport {
    pub results: Vec<LoadResult>,
    pub data: ScheduleData,
}

/// Filesystem-backed rule source.
///
/// Scans a directory (recursively) for `*.yml` / `*.yaml` group files on
/// every request, so edits are picked up on the next manager tick.
pub struct RuleLoader {
    rules_dir: PathBuf,
}

impl RuleLoader {
    /// Create a new loader for the given directory.
    ///
    /// Creates the directory (and parents) if it does not exist.
    pub fn new(rules_dir: PathBuf) -> Self {
        if !rules_dir.exists() {
            if let Err(e) = fs::create_dir_all(&rules_dir) {
                warn!(path = %rules_dir.display(), error = %e, "failed to create rules directory");
            }
        }
        Self { rules_dir }
    }

    pub fn rules_dir(&self) -> &Path {
        &self.rules_dir
    }

    /// Scan the rules directory and load every group file.
    ///
    /// Dotfiles and non-YAML files are skipped. Parse errors are reported
    /// per file but do not abort the scan. A rule uid already loaded from
    /// another file fails the later file.
    pub fn load_all(&self) -> Result<LoadReport, SourceError> {
        let mut report = LoadReport::default();
        let mut seen = HashSet::new();
        self.scan_dir_recursive(&self.rules_dir, &mut report, &mut seen)?;
        Ok(report)
    }

    fn scan_dir_recursive(
        &self,
        dir: &Path,
        report: &mut LoadReport,
        seen: &mut HashSet<AlertRuleKey>,
    ) -> Result<(), SourceError> {
        let mut paths = Vec::new();
        for entry in fs::read_dir(dir)? {
            paths.push(entry?.path());
        }
        // Stable order so duplicate detection does not depend on the fs.
        paths.sort();

        for path in paths {
            if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
                if name.starts_with('.') {
                    if path.is_file() {
                        report.results.push(LoadResult {
                            path,
                            status: LoadStatus::Skipped {
                                reason: "dotfile".to_string(),
                            },
                        });
                    }
                    continue;
                }
            }

            if path.is_dir() {
                self.scan_dir_recursive(&path, report, seen)?;
                continue;
            }

            let is_yaml = path
                .extension()
                .and_then(|e| e.to_str())
                .map(|e| e == "yml" || e == "yaml")
                .unwrap_or(false);
            if !is_yaml {
                report.results.push(LoadResult {
                    path,
                    status: LoadStatus::Skipped {
                        reason: "not a YAML file".to_string(),
                    },
                });
                continue;
            }

            let status = match self.load_into(&path, &mut report.data, seen) {
                Ok((group, rules)) => {
                    info!(group = %group, rules, path = %path.display(), "loaded rule group");
                    LoadStatus::Loaded { group, rules }
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "failed to load rule group file");
                    LoadStatus::Failed { error: e.to_string() }
                }
            };
            report.results.push(LoadResult { path, status });
        }
        Ok(())
    }

    fn load_into(
        &self,
        path: &Path,
        data: &mut ScheduleData,
        seen: &mut HashSet<AlertRuleKey>,
    ) -> Result<(String, usize), SourceError> {
        let file = self.load_file(path)?;
        let key = file.key();

        for entry in &file.rules {
            let rule_key = AlertRuleKey {
                org_id: file.org_id,
                uid: entry.uid.clone(),
            };
            if seen.contains(&rule_key) {
                return Err(SourceError::Validation(format!(
                    "rule uid '{}' is already defined in another file",
                    entry.uid
                )));
            }
        }

        let updated: DateTime<Utc> = fs::metadata(path)
            .and_then(|m| m.modified())
            .map(DateTime::<Utc>::from)
            .unwrap_or_else(|_| Utc::now());

        let folder = FolderKey {
            org_id: file.org_id,
            uid: file.folder_uid.clone(),
        };
        data.folders.insert(folder, file.folder_title.clone());
        let rules = file.into_rules(updated);
        let count = rules.len();
        for rule in rules {
            seen.insert(rule.key());
            data.rules.push(rule);
        }
        Ok((key.rule_group, count))
    }

    /// Parse and validate a single group file.
    pub fn load_file(&self, path: &Path) -> Result<RuleGroupFile, SourceError> {
        let contents = fs::read_to_string(path)?;
        let file: RuleGroupFile = serde_yaml::from_str(&contents)?;
        file.validate()?;
        Ok(file)
    }
}

#[async_trait]
impl RuleSource for RuleLoader {
    async fn get_alert_rule_schedule_keys(&self) -> Result<Vec<ScheduleKey>, SourceError> {
        let report = self.load_all()?;
        Ok(report.data.rules.iter().map(|r| r.schedule_key()).collect())
    }

    async fn get_schedule_data(&self, opts: &ScheduleDataOptions) -> Result<ScheduleData, SourceError> {
        let mut data = self.load_all()?.data;
        data.rules.retain(|r| !opts.disabled_orgs.contains(&r.org_id));
        let used: HashSet<_> = data.rules.iter().map(|r| r.folder_key()).collect();
        let folders: HashMap<_, _> = data
            .folders
            .into_iter()
            .filter(|(k, _)| used.contains(k))
            .collect();
        Ok(ScheduleData {
            rules: data.rules,
            folders,
        })
    }
}
