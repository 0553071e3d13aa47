//! Download completion polling
//!
//! The browser gives no completion signal we can rely on, so completion is
//! decided from the working directory alone: in-progress files carry a marker
//! suffix, finished files carry their final extension.

use crate::error::{PpmiError, Result};
use crate::logging::Logger;
use crate::task::{DownloadTask, ExtensionSet};
use std::path::{Path, PathBuf};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

pub const DEFAULT_IN_PROGRESS_MARKERS: &[&str] = &[".crdownload", ".part", ".download"];

/// Scratch files Chrome creates before the `.crdownload` file appears
const CHROME_SCRATCH_PREFIXES: &[&str] = &[".com.google.Chrome.", ".org.chromium.Chromium."];

/// Contents of the working directory at one tick.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DirSnapshot {
    /// Finished file names, sorted
    pub finished: Vec<String>,
    /// In-progress file names with their size in bytes, sorted by name
    pub in_progress: Vec<(String, u64)>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollStatus {
    /// Enough finished files and nothing in progress
    Complete(Vec<String>),
    /// At least one file is still being written
    InProgress,
    /// Nothing in progress, but not enough accepted files yet
    Waiting { accepted: usize },
}

impl DirSnapshot {
    pub fn take(dir: &Path, markers: &[String]) -> Result<Self> {
        let mut snapshot = DirSnapshot::default();

        for entry in std::fs::read_dir(dir)? {
            let entry = entry?;
            let metadata = match entry.metadata() {
                Ok(m) => m,
                // Renamed away between listing and stat
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };
            if !metadata.is_file() {
                continue;
            }

            let name = entry.file_name().to_string_lossy().to_string();
            if is_in_progress(&name, markers) {
                snapshot.in_progress.push((name, metadata.len()));
            } else {
                snapshot.finished.push(name);
            }
        }

        snapshot.finished.sort();
        snapshot.in_progress.sort();
        Ok(snapshot)
    }

    pub fn status(&self, accepted: &ExtensionSet, expected: usize) -> PollStatus {
        if !self.in_progress.is_empty() {
            return PollStatus::InProgress;
        }
        let count = self.finished.iter().filter(|n| accepted.matches(n)).count();
        if count >= expected.max(1) {
            PollStatus::Complete(self.finished.clone())
        } else {
            PollStatus::Waiting { accepted: count }
        }
    }

    fn in_progress_names(&self) -> Vec<String> {
        self.in_progress.iter().map(|(name, _)| name.clone()).collect()
    }
}

fn is_in_progress(name: &str, markers: &[String]) -> bool {
    markers.iter().any(|m| name.ends_with(m.as_str()))
        || CHROME_SCRATCH_PREFIXES.iter().any(|p| name.starts_with(p))
}

/// Polls a directory until a download completes, times out or is cancelled.
#[derive(Debug, Clone)]
pub struct CompletionPoller {
    markers: Vec<String>,
    logger: Logger,
}

impl CompletionPoller {
    pub fn new(logger: Logger) -> Self {
        Self::with_markers(
            DEFAULT_IN_PROGRESS_MARKERS.iter().map(|m| m.to_string()).collect(),
            logger,
        )
    }

    pub fn with_markers(markers: Vec<String>, logger: Logger) -> Self {
        Self { markers, logger }
    }

    pub fn markers(&self) -> &[String] {
        &self.markers
    }

    /// Wait for `task` to finish downloading into `dir`.
    ///
    /// Returns the sorted finished names. The timeout is only reported after
    /// a check made at or past the deadline, never earlier.
    pub async fn wait(
        &self,
        dir: &Path,
        task: &DownloadTask,
        cancel: &CancellationToken,
    ) -> Result<Vec<String>> {
        let start = Instant::now();
        let deadline = start + task.timeout;

        self.logger.debug(format_args!(
            "Waiting up to {:?} for {} file(s) in {}",
            task.timeout,
            task.expected,
            dir.display()
        ));

        loop {
            if cancel.is_cancelled() {
                return Err(PpmiError::Cancelled);
            }

            let snapshot = DirSnapshot::take(dir, &self.markers)?;
            match snapshot.status(&task.accepted, task.expected) {
                PollStatus::Complete(names) => {
                    self.logger.info(format_args!(
                        "Download complete after {:?}: {}",
                        start.elapsed(),
                        names.join(", ")
                    ));
                    return Ok(names);
                }
                PollStatus::InProgress => {
                    for (name, size) in &snapshot.in_progress {
                        self.logger.debug(format_args!("{}: {} bytes", name, size));
                    }
                }
                PollStatus::Waiting { accepted } => {
                    self.logger.debug(format_args!(
                        "{}/{} file(s) finished",
                        accepted, task.expected
                    ));
                }
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(PpmiError::DownloadTimeout {
                    dir: PathBuf::from(dir),
                    waited: now - start,
                    in_progress: snapshot.in_progress_names(),
                    finished: snapshot.finished,
                });
            }

            let pause = task.poll_interval.min(deadline - now);
            tokio::select! {
                _ = cancel.cancelled() => return Err(PpmiError::Cancelled),
                _ = tokio::time::sleep(pause) => {}
            }
        }
    }
}
