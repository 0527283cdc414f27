use crate::cache::disk::is_partial_file;
use crate::cache::is_derivative_file;
use crate::{ImageServerError, METRICS};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering;
use std::time::{Duration, SystemTime};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

/// Counts from one sweep over the image root.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SweepReport {
    pub folders: usize,
    /// Derivatives and leftover partial writes, both subject to retention.
    pub scanned: usize,
    pub removed: usize,
    pub retained: usize,
    /// Originals, stray files and derivatives that vanished mid-sweep.
    pub skipped: usize,
    pub failed: usize,
}

enum Outcome {
    Removed,
    Retained,
    Vanished,
}

/// Removes every derivative under `root` older than `retention`.
pub fn sweep(root: &Path, retention: Duration) -> SweepReport {
    sweep_at(root, retention, SystemTime::now())
}

/// [`sweep`] with an explicit clock.
///
/// A derivative's age is taken from its modification time: derivatives are
/// renamed into place complete and never written again, so that is their
/// creation time. Failures on one file are logged and the sweep moves on.
pub fn sweep_at(root: &Path, retention: Duration, now: SystemTime) -> SweepReport {
    let mut report = SweepReport::default();

    let folders = match fs::read_dir(root) {
        Ok(f) => f,
        Err(e) => {
            tracing::warn!(root = %root.display(), error = %e, "Cannot read image root, skipping sweep");
            return report;
        }
    };

    for folder in folders.flatten() {
        if !folder.file_type().map(|t| t.is_dir()).unwrap_or(false) {
            continue;
        }
        let Ok(image) = folder.file_name().into_string() else {
            continue;
        };
        report.folders += 1;

        let files = match fs::read_dir(folder.path()) {
            Ok(f) => f,
            Err(e) => {
                tracing::warn!(image = %image, error = %e, "Cannot read image folder");
                report.failed += 1;
                continue;
            }
        };

        for file in files.flatten() {
            let name = file.file_name();
            // An interrupted write leaves a temp file that would otherwise never go away.
            let evictable = name
                .to_str()
                .is_some_and(|n| is_derivative_file(n, &image) || is_partial_file(n));
            if !evictable {
                report.skipped += 1;
                continue;
            }

            report.scanned += 1;
            match evict_if_expired(&file.path(), retention, now) {
                Ok(Outcome::Removed) => report.removed += 1,
                Ok(Outcome::Retained) => report.retained += 1,
                Ok(Outcome::Vanished) => report.skipped += 1,
                Err(e) => {
                    tracing::warn!(image = %image, file = ?name, error = %e, "Eviction failed, continuing");
                    report.failed += 1;
                }
            }
        }
    }

    report
}

fn evict_if_expired(path: &Path, retention: Duration, now: SystemTime) -> Result<Outcome, ImageServerError> {
    let meta = match fs::symlink_metadata(path) {
        Ok(m) => m,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Outcome::Vanished),
        Err(e) => return Err(ImageServerError::EvictionError(format!("stat {}: {}", path.display(), e))),
    };
    if !meta.is_file() {
        return Ok(Outcome::Retained);
    }
    let created = meta
        .modified()
        .map_err(|e| ImageServerError::EvictionError(format!("mtime {}: {}", path.display(), e)))?;

    // Timestamps in the future count as brand new.
    let age = now.duration_since(created).unwrap_or_default();
    if age <= retention {
        return Ok(Outcome::Retained);
    }

    match fs::remove_file(path) {
        Ok(()) => {
            tracing::debug!(path = %path.display(), age_secs = age.as_secs(), "Evicted derivative");
            Ok(Outcome::Removed)
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Outcome::Vanished),
        Err(e) => Err(ImageServerError::EvictionError(format!("remove {}: {}", path.display(), e))),
    }
}

/// Periodic background sweep of the image root.
#[derive(Debug, Clone)]
pub struct Janitor {
    root: PathBuf,
    retention: Duration,
    interval: Duration,
}

/// Running janitor; dropping it leaves the task running until the runtime stops.
pub struct JanitorHandle {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl Janitor {
    pub fn new(root: PathBuf, retention: Duration, interval: Duration) -> Self {
        Self { root, retention, interval }
    }

    /// Starts sweeping now and then every `interval`.
    pub fn spawn(self) -> JanitorHandle {
        let cancel = CancellationToken::new();
        let token = cancel.clone();

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            tracing::info!(
                root = %self.root.display(),
                retention_secs = self.retention.as_secs(),
                interval_secs = self.interval.as_secs(),
                "Janitor started"
            );

            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        let root = self.root.clone();
                        let retention = self.retention;
                        match tokio::task::spawn_blocking(move || sweep(&root, retention)).await {
                            Ok(report) => {
                                METRICS.evictions.fetch_add(report.removed as u64, Ordering::Relaxed);
                                tracing::info!(
                                    folders = report.folders,
                                    removed = report.removed,
                                    retained = report.retained,
                                    failed = report.failed,
                                    "Sweep finished"
                                );
                            }
                            Err(e) => tracing::error!(error = %e, "Sweep task panicked"),
                        }
                    }
                }
            }

            tracing::info!("Janitor stopped");
        });

        JanitorHandle { cancel, task }
    }
}

impl JanitorHandle {
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Stops the ticker and waits for an in-progress sweep to finish.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        if let Err(e) = self.task.await {
            tracing::error!(error = %e, "Janitor task failed");
        }
    }
}
