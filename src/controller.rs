//! The controller object shared by every request task
//!
//! Owns the change cache, the scanner, the restart policy and the backend
//! supervisor. Built once at start-up and handed to the gateway behind an
//! `Arc`, so tests can run isolated instances side by side.

use crate::cache::{checksum_bytes, ChangeCache, DirectoryScanner, FileRecord};
use crate::config::Config;
use crate::policy::RestartPolicy;
use crate::supervisor::{Status, Supervisor, SupervisorConfig, SupervisorError};
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// One file of an upload batch
#[derive(Debug, Clone)]
pub struct UploadItem {
    pub path: String,
    pub content: Vec<u8>,
}

impl UploadItem {
    pub fn new(path: impl Into<String>, content: impl Into<Vec<u8>>) -> Self {
        Self {
            path: path.into(),
            content: content.into(),
        }
    }
}

/// What happened to the backend after an upload batch
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RestartOutcome {
    NotNeeded,
    Triggered,
    Failed(String),
}

/// Result of an upload batch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadReport {
    pub updated: usize,
    pub failed: usize,
    pub restart: RestartOutcome,
}

impl UploadReport {
    /// Health message for the response. Reports failures and a triggered
    /// restart together when both happened.
    pub fn summary(&self) -> String {
        let written = if self.failed > 0 {
            format!("Failed to update {}", files(self.failed))
        } else {
            format!("Updated {}", files(self.updated))
        };

        match (&self.restart, self.failed) {
            (RestartOutcome::NotNeeded, _) => written,
            (RestartOutcome::Triggered, 0) => {
                format!("Restarting after updating {}", files(self.updated))
            }
            (RestartOutcome::Triggered, _) => {
                format!("{}, restarting after updating {}", written, files(self.updated))
            }
            (RestartOutcome::Failed(reason), _) => format!("{}, restart failed: {}", written, reason),
        }
    }
}

impl fmt::Display for UploadReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.summary())
    }
}

impl From<UploadReport> for Status {
    fn from(report: UploadReport) -> Self {
        Status::new(report.summary())
    }
}

fn files(n: usize) -> String {
    if n == 1 {
        "1 file".to_string()
    } else {
        format!("{} files", n)
    }
}

pub struct Controller {
    cache: ChangeCache,
    scanner: DirectoryScanner,
    policy: RestartPolicy,
    supervisor: Arc<Supervisor>,
}

impl Controller {
    pub fn new(
        scanner: DirectoryScanner,
        policy: RestartPolicy,
        supervisor: Arc<Supervisor>,
    ) -> Arc<Self> {
        debug!(roots = ?scanner.roots(), "Controller created");
        Arc::new(Self {
            cache: ChangeCache::new(),
            scanner,
            policy,
            supervisor,
        })
    }

    pub fn from_config(config: &Config) -> Arc<Self> {
        let backend = &config.backend;
        Self::new(
            DirectoryScanner::new(backend.app_dirs()),
            RestartPolicy::new(backend.ignore_pattern(), backend.restart_pattern()),
            Supervisor::new(SupervisorConfig::from(backend)),
        )
    }

    pub fn cache(&self) -> &ChangeCache {
        &self.cache
    }

    pub fn supervisor(&self) -> &Arc<Supervisor> {
        &self.supervisor
    }

    /// Scan the app directories and return the whole cache. Blocking.
    pub fn list_files(&self) -> BTreeMap<String, FileRecord> {
        self.scanner.scan(&self.cache)
    }

    /// Write every item, then restart the backend once if any successfully
    /// written path requires it. Individual write failures are counted and
    /// do not stop the batch.
    pub async fn upload(&self, items: Vec<UploadItem>) -> UploadReport {
        let mut updated = 0;
        let mut failed = 0;
        let mut restart = false;

        for item in items {
            debug!(path = %item.path, bytes = item.content.len(), "Updating file");
            match self.write_item(&item).await {
                Ok(()) => {
                    updated += 1;
                    if self.policy.needs_restart(&item.path) {
                        restart = true;
                    }
                }
                Err(e) => {
                    warn!(path = %item.path, error = %e, "Failed to update file");
                    failed += 1;
                }
            }
        }

        let restart = if restart {
            match self.supervisor.restart(None).await {
                Ok(_) => RestartOutcome::Triggered,
                Err(e) => {
                    warn!(error = %e, "Restart after upload failed");
                    RestartOutcome::Failed(e.to_string())
                }
            }
        } else {
            RestartOutcome::NotNeeded
        };

        let report = UploadReport {
            updated,
            failed,
            restart,
        };
        info!(updated, failed, restart = ?report.restart, "Upload processed");
        report
    }

    /// Manual restart with the most recent command
    pub async fn restart(&self) -> Result<Status, SupervisorError> {
        self.supervisor.restart(None).await
    }

    pub fn status(&self) -> Status {
        self.supervisor.status()
    }

    async fn write_item(&self, item: &UploadItem) -> std::io::Result<()> {
        let path = Path::new(&item.path);
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(path, &item.content).await?;

        // Keep the cache in step so the next listing does not rehash the file
        let modified = tokio::fs::metadata(path).await?.modified()?;
        self.cache.record(
            self.scanner.key_for(path),
            FileRecord {
                checksum: checksum_bytes(&item.content),
                last_modified: DateTime::<Utc>::from(modified),
            },
        );
        Ok(())
    }
}
