use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;
use tokio::time::interval;
use tracing::{debug, info, warn};

use super::loader::{LoadError, RuleSetLoader};
use super::validate::content_hash;
use crate::domain::OrgId;
use crate::error::EngineError;
use crate::runs::RunManager;

/// Result of one pass over the rule set directory.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SyncReport {
    pub published: usize,
    pub unchanged: usize,
    pub rejected: usize,
}

/// Polls a directory of rule set documents and publishes what changed.
///
/// Published versions are immutable, so editing a file without bumping its
/// version is reported as a conflict and the stored version stays in force.
pub struct RuleSetWatcher {
    loader: RuleSetLoader,
    manager: RunManager,
    check_interval: Duration,
    /// Last settled (org, content hash) per file
    seen: HashMap<PathBuf, (OrgId, String)>,
}

impl RuleSetWatcher {
    pub fn new(loader: RuleSetLoader, manager: RunManager, check_interval: Duration) -> Self {
        RuleSetWatcher {
            loader,
            manager,
            check_interval,
            seen: HashMap::new(),
        }
    }

    /// Publish every new or changed document once.
    pub async fn sync_once(&mut self) -> Result<SyncReport, LoadError> {
        let mut report = SyncReport::default();

        for (path, loaded) in self.loader.load_all()? {
            let document = match loaded {
                Ok(document) => document,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "skipping rule set file");
                    report.rejected += 1;
                    continue;
                }
            };

            let hash = match content_hash(&document.rule_set) {
                Ok(hash) => hash,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "skipping rule set file");
                    report.rejected += 1;
                    continue;
                }
            };

            let key = (document.org_id.clone(), hash);
            if self.seen.get(&path) == Some(&key) {
                report.unchanged += 1;
                continue;
            }

            let org = document.org_id;
            let version = document.rule_set.version.clone();

            match self.manager.publish_rule_set(&org, document.rule_set).await {
                Ok(_) => {
                    info!(path = %path.display(), org_id = %org, version = %version, "rule set loaded");
                    report.published += 1;
                    self.seen.insert(path, key);
                }
                Err(e @ EngineError::Validation(_)) => {
                    // Settled until the file changes again
                    warn!(path = %path.display(), org_id = %org, version = %version, error = %e, "rule set rejected");
                    report.rejected += 1;
                    self.seen.insert(path, key);
                }
                Err(e) => {
                    warn!(path = %path.display(), org_id = %org, version = %version, error = %e, "rule set not published, will retry");
                    report.rejected += 1;
                }
            }
        }

        Ok(report)
    }

    /// Sync once, then keep polling in the background.
    pub async fn start(mut self) -> (SyncReport, tokio::task::JoinHandle<()>) {
        let initial = match self.sync_once().await {
            Ok(report) => {
                info!(
                    dir = %self.loader.dir().display(),
                    published = report.published,
                    rejected = report.rejected,
                    "initial rule set sync"
                );
                report
            }
            Err(e) => {
                warn!(dir = %self.loader.dir().display(), error = %e, "initial rule set sync failed");
                SyncReport::default()
            }
        };

        let handle = tokio::spawn(async move {
            let mut interval = interval(self.check_interval);
            // The first tick completes immediately
            interval.tick().await;

            loop {
                interval.tick().await;

                match self.sync_once().await {
                    Ok(report) if report.published > 0 => {
                        info!(published = report.published, "rule sets reloaded")
                    }
                    Ok(_) => debug!("no rule set changes"),
                    Err(e) => warn!(error = %e, "error scanning rule set directory"),
                }
            }
        });

        (initial, handle)
    }
}
