//! Runs the external review generator and tracks its liveness.
//!
//! Each generation task is one subprocess invocation:
//! `<generator> review --repo-name=<owner>/<repo> -n 3 -p <number>
//! --output=<absolute path>`. Live tasks are tracked in an identity -> task
//! table so the reconciler can cancel work whose inputs changed, and a
//! watchdog terminates anything that outlives the hard timeout.
//!
//! The store writes on completion implement the stale-head-sha rules: a
//! finished artifact is only recorded if the row still carries the commit the
//! task was spawned with, and a failure never overwrites a row the reconciler
//! already re-queued.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use tokio::process::Command;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::db::{Db, PrId};

/// Tasks running longer than this are logged by the watchdog.
pub const SOFT_TIMEOUT: Duration = Duration::from_secs(2 * 60);

/// Tasks running longer than this are killed by the watchdog.
pub const HARD_TIMEOUT: Duration = Duration::from_secs(5 * 60);

const WATCHDOG_INTERVAL: Duration = Duration::from_secs(30);

/// What became of one generation task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// Artifact produced and recorded.
    Completed,
    /// The generator succeeded but a newer commit arrived mid-generation;
    /// the artifact was discarded and the row left for the reconciler.
    StaleDiscarded,
    /// The generator failed (or was killed); the row was marked ERROR.
    Failed,
    /// The generator failed but the reconciler had already invalidated the
    /// work; the row was left alone.
    Superseded,
}

struct LiveTask {
    pid: Option<u32>,
    started_at: Instant,
    cancel: Arc<Notify>,
}

pub struct ReviewExecutor {
    generator_path: String,
    reviews_dir: PathBuf,
    db: Arc<Db>,
    live: Mutex<HashMap<PrId, LiveTask>>,
}

/// Artifact filename for a PR: `<owner>_<repo>_<number>.html`.
pub fn artifact_filename(id: &PrId) -> String {
    format!("{}_{}_{}.html", id.repo_owner, id.repo_name, id.pr_number)
}

impl ReviewExecutor {
    pub fn new(generator_path: String, reviews_dir: PathBuf, db: Arc<Db>) -> Self {
        Self {
            generator_path,
            reviews_dir,
            db,
            live: Mutex::new(HashMap::new()),
        }
    }

    /// Generate the review artifact for one PR and record the result.
    ///
    /// `head_sha` is the commit the row carried when the task was selected;
    /// every store write on exit is conditioned on it (see module docs).
    pub async fn run(&self, id: &PrId, head_sha: &str) -> Result<RunOutcome> {
        let reviews_dir = absolute(&self.reviews_dir)?;
        tokio::fs::create_dir_all(&reviews_dir)
            .await
            .with_context(|| format!("Failed to create reviews directory {:?}", reviews_dir))?;

        let filename = artifact_filename(id);
        let output_path = reviews_dir.join(&filename);

        let mut command = Command::new(&self.generator_path);
        command
            .arg("review")
            .arg(format!("--repo-name={}", id.repo_slug()))
            .arg("-n")
            .arg("3")
            .arg("-p")
            .arg(id.pr_number.to_string())
            .arg(format!("--output={}", output_path.display()));

        info!(
            "Running generator for {}: {} review --repo-name={} -n 3 -p {} --output={}",
            id,
            self.generator_path,
            id.repo_slug(),
            id.pr_number,
            output_path.display()
        );

        let started_at = Instant::now();
        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(err) => {
                error!("Failed to start generator for {}: {}", id, err);
                let marked = self.db.mark_error_unless_invalidated(id, head_sha)?;
                return Ok(if marked {
                    RunOutcome::Failed
                } else {
                    RunOutcome::Superseded
                });
            }
        };

        let cancel = Arc::new(Notify::new());
        {
            let mut live = self.live.lock().expect("mutex poisoned");
            live.insert(
                id.clone(),
                LiveTask {
                    pid: child.id(),
                    started_at,
                    cancel: cancel.clone(),
                },
            );
        }
        info!("Generator for {} started with pid {:?}", id, child.id());

        let exit = tokio::select! {
            status = child.wait() => Some(status),
            _ = cancel.notified() => {
                warn!("Terminating generator for {} after {:?}", id, started_at.elapsed());
                let _ = child.start_kill();
                let _ = child.wait().await;
                None
            }
        };

        let outcome = self.record_exit(id, head_sha, &filename, &output_path, exit, started_at);

        // The identity leaves the live table only after the store write, so
        // a concurrent pass cannot double-schedule this PR in the window.
        self.untrack(id);

        outcome
    }

    fn record_exit(
        &self,
        id: &PrId,
        head_sha: &str,
        filename: &str,
        output_path: &Path,
        exit: Option<std::io::Result<std::process::ExitStatus>>,
        started_at: Instant,
    ) -> Result<RunOutcome> {
        let elapsed = started_at.elapsed();

        let succeeded = match &exit {
            Some(Ok(status)) if status.success() => true,
            Some(Ok(status)) => {
                warn!("Generator for {} exited with {} after {:?}", id, status, elapsed);
                false
            }
            Some(Err(err)) => {
                error!("Failed to wait for generator for {}: {}", id, err);
                false
            }
            None => false, // killed
        };

        if succeeded {
            if output_path.exists() {
                let committed = self.db.mark_completed(id, head_sha, filename)?;
                if committed {
                    info!("Generator for {} completed in {:?}", id, elapsed);
                    return Ok(RunOutcome::Completed);
                }
                // A newer commit was stored while we were generating: the
                // artifact describes a superseded state of the PR.
                info!(
                    "Commit for {} changed during generation, discarding stale artifact",
                    id
                );
                if let Err(err) = std::fs::remove_file(output_path) {
                    if err.kind() != std::io::ErrorKind::NotFound {
                        warn!("Failed to delete stale artifact {:?}: {}", output_path, err);
                    }
                }
                return Ok(RunOutcome::StaleDiscarded);
            }
            warn!(
                "Generator for {} exited cleanly but produced no file at {:?}",
                id, output_path
            );
        }

        let marked = self.db.mark_error_unless_invalidated(id, head_sha)?;
        if marked {
            Ok(RunOutcome::Failed)
        } else {
            info!(
                "Review for {} was invalidated while in flight; leaving row re-queued",
                id
            );
            Ok(RunOutcome::Superseded)
        }
    }

    /// Terminate the live task for an identity, if any. Idempotent; returns
    /// whether a task existed. The entry leaves the live table once the task
    /// observes the kill and finishes its store write.
    pub fn cancel(&self, id: &PrId) -> bool {
        let live = self.live.lock().expect("mutex poisoned");
        match live.get(id) {
            Some(task) => {
                info!("Cancelling generator for {} (pid {:?})", id, task.pid);
                task.cancel.notify_one();
                true
            }
            None => false,
        }
    }

    /// Terminate every live task (process shutdown).
    pub fn cancel_all(&self) {
        let live = self.live.lock().expect("mutex poisoned");
        for (id, task) in live.iter() {
            info!("Cancelling generator for {} (pid {:?})", id, task.pid);
            task.cancel.notify_one();
        }
    }

    fn untrack(&self, id: &PrId) {
        let mut live = self.live.lock().expect("mutex poisoned");
        live.remove(id);
    }

    pub fn is_live(&self, id: &PrId) -> bool {
        self.live.lock().expect("mutex poisoned").contains_key(id)
    }

    /// Elapsed time of the longest-running live task, if any. Drives the
    /// "generator running" indicator on the status endpoint.
    pub fn running_elapsed(&self) -> Option<Duration> {
        let live = self.live.lock().expect("mutex poisoned");
        live.values().map(|task| task.started_at.elapsed()).max()
    }

    /// Watchdog loop: every 30 seconds, log tasks past the soft threshold and
    /// kill tasks past the hard threshold.
    pub fn spawn_watchdog(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(WATCHDOG_INTERVAL);
            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = ticker.tick() => self.check_live_tasks(),
                }
            }
        })
    }

    fn check_live_tasks(&self) {
        let live = self.live.lock().expect("mutex poisoned");
        for (id, task) in live.iter() {
            let elapsed = task.started_at.elapsed();
            if elapsed > HARD_TIMEOUT {
                warn!(
                    "Generator for {} (pid {:?}) has run for {:?}, killing it",
                    id, task.pid, elapsed
                );
                task.cancel.notify_one();
            } else if elapsed > SOFT_TIMEOUT {
                warn!(
                    "Generator for {} (pid {:?}) has run for {:?} (threshold {:?})",
                    id, task.pid, elapsed, SOFT_TIMEOUT
                );
            }
        }
    }
}

fn absolute(path: &Path) -> Result<PathBuf> {
    if path.is_absolute() {
        Ok(path.to_path_buf())
    } else {
        Ok(std::env::current_dir()
            .context("Failed to resolve current directory")?
            .join(path))
    }
}
