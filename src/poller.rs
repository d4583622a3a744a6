//! The reconciliation loop.
//!
//! A single long-running task drives one pass per polling interval,
//! reconciling the remote view (GitHub searches and per-PR lookups) with the
//! local store and scheduling generator work for PRs that still need a fresh
//! artifact. A manual trigger mailbox (capacity one, overflow collapses) lets
//! user mutations request an extra pass; an exclusivity flag guarantees that
//! passes never overlap, whatever their origin.
//!
//! Every pipeline step tolerates its own failure: a failed search or a
//! failed per-row lookup is logged and the pass continues on the store's
//! view of the world.
//!
//! Process shutdown is a watch signal plumbed into every blocking point:
//! each remote future is raced against it and aborts when it fires, and an
//! in-flight pass abandons its remaining steps instead of starting new
//! generator work.

use std::collections::{BTreeMap, HashSet};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, watch, RwLock};
use tracing::{error, info, warn};

use crate::db::{Db, DiscoveredPr, PrId, PrStatus, TrackedPr};
use crate::executor::ReviewExecutor;
use crate::github::{GitHubError, PrSource, PullRequestSummary};
use crate::notify::Notifier;

/// Rows stuck in GENERATING longer than this are healed back to PENDING.
/// Well above the generator's expected runtime, well under the executor's
/// hard watchdog timeout.
pub const STALE_GENERATING_TIMEOUT: Duration = Duration::from_secs(2 * 60);

/// ERROR rows older than this re-enter the pipeline.
pub const ERROR_RETRY_AGE: Duration = Duration::from_secs(5 * 60);

/// Generation tasks are submitted in repository-grouped sub-batches of this
/// size, executed sequentially within a batch.
const REVIEW_BATCH_SIZE: usize = 5;

#[derive(Default)]
struct Timing {
    ticker_epoch: Option<Instant>,
    last_poll: Option<Instant>,
}

pub struct Poller {
    interval: Duration,
    reviews_dir: PathBuf,
    db: Arc<Db>,
    source: Arc<dyn PrSource>,
    executor: Arc<ReviewExecutor>,
    notifier: Arc<Notifier>,
    pr_cache: Arc<RwLock<Vec<PullRequestSummary>>>,
    trigger_tx: mpsc::Sender<()>,
    trigger_rx: Mutex<Option<mpsc::Receiver<()>>>,
    polling: Mutex<bool>,
    timing: Mutex<Timing>,
    shutdown: watch::Receiver<bool>,
}

impl Poller {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        interval: Duration,
        reviews_dir: PathBuf,
        db: Arc<Db>,
        source: Arc<dyn PrSource>,
        executor: Arc<ReviewExecutor>,
        notifier: Arc<Notifier>,
        pr_cache: Arc<RwLock<Vec<PullRequestSummary>>>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        let (trigger_tx, trigger_rx) = mpsc::channel(1);
        Self {
            interval,
            reviews_dir,
            db,
            source,
            executor,
            notifier,
            pr_cache,
            trigger_tx,
            trigger_rx: Mutex::new(Some(trigger_rx)),
            polling: Mutex::new(false),
            timing: Mutex::new(Timing::default()),
            shutdown,
        }
    }

    fn shutting_down(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Race a remote call against process shutdown. `None` means the call
    /// was aborted because the shutdown signal fired first; the pass must
    /// stop advancing.
    async fn remote<T>(&self, call: impl std::future::Future<Output = T>) -> Option<T> {
        let mut shutdown = self.shutdown.clone();
        tokio::select! {
            biased;
            _ = async move {
                if shutdown.wait_for(|stop| *stop).await.is_err() {
                    std::future::pending::<()>().await;
                }
            } => None,
            result = call => Some(result),
        }
    }

    /// Request an extra pass. At most one trigger is ever pending; requests
    /// arriving while one is queued collapse into it.
    pub fn trigger(&self) {
        match self.trigger_tx.try_send(()) {
            Ok(()) => info!("Manual poll trigger requested"),
            Err(mpsc::error::TrySendError::Full(())) => {} // already queued
            Err(mpsc::error::TrySendError::Closed(())) => warn!("Poller is not running"),
        }
    }

    pub fn last_poll_time(&self) -> Option<Instant> {
        self.timing.lock().expect("mutex poisoned").last_poll
    }

    pub fn polling_interval(&self) -> Duration {
        self.interval
    }

    /// Deterministic countdown to the next ticker fire, from the recorded
    /// ticker epoch.
    pub fn seconds_until_next_poll(&self) -> u64 {
        let epoch = self.timing.lock().expect("mutex poisoned").ticker_epoch;
        match epoch {
            Some(epoch) => countdown(epoch.elapsed(), self.interval),
            None => 0,
        }
    }

    /// Drive the loop until shutdown. The interval's first tick fires
    /// immediately, which is the initial pass.
    pub async fn run(self: Arc<Self>) {
        let mut shutdown = self.shutdown.clone();
        let mut trigger_rx = self
            .trigger_rx
            .lock()
            .expect("mutex poisoned")
            .take()
            .expect("poller already running");

        {
            let mut timing = self.timing.lock().expect("mutex poisoned");
            timing.ticker_epoch = Some(Instant::now());
        }

        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        info!("Starting poller (interval {:?})", self.interval);
        let mut first = true;

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    info!("Poller stopped");
                    break;
                }
                _ = ticker.tick() => {
                    let origin = if first { "initial" } else { "scheduled" };
                    first = false;
                    self.start_poll(origin);
                }
                received = trigger_rx.recv() => match received {
                    Some(()) => self.start_poll("manual"),
                    None => break,
                },
            }
        }
    }

    /// The single entry point for every pass origin (ticker, manual,
    /// startup). Skips when a pass is already in flight.
    fn start_poll(self: &Arc<Self>, origin: &'static str) {
        {
            let mut polling = self.polling.lock().expect("mutex poisoned");
            if *polling {
                info!("Poll already in progress, skipping {} trigger", origin);
                return;
            }
            *polling = true;
        }

        info!("Starting {} poll", origin);
        let poller = self.clone();
        tokio::spawn(async move {
            poller.poll().await;
            *poller.polling.lock().expect("mutex poisoned") = false;
            info!("Completed {} poll", origin);
        });
    }

    /// One reconciliation pass.
    pub async fn poll(&self) {
        let start = Instant::now();
        {
            let mut timing = self.timing.lock().expect("mutex poisoned");
            timing.last_poll = Some(start);
        }

        // Heal rows stuck in GENERATING (crashed process, unclean shutdown).
        match self.db.reset_stale_generating(STALE_GENERATING_TIMEOUT) {
            Ok(0) => {}
            Ok(count) => info!("Reset {} stale PRs from generating to pending", count),
            Err(err) => error!("Failed to reset stale PRs: {}", err),
        }

        // Re-queue old failures for retry.
        match self.db.reset_error(ERROR_RETRY_AGE) {
            Ok(0) => {}
            Ok(count) => info!("Reset {} errored PRs to pending for retry", count),
            Err(err) => error!("Failed to reset errored PRs: {}", err),
        }

        // Remove PRs that were closed or merged on the remote.
        match self.cleanup_closed().await {
            Ok(0) => {}
            Ok(count) => info!("Removed {} closed PRs", count),
            Err(err) => error!("Failed to clean up closed PRs: {}", err),
        }

        // Fill in metadata for rows discovered before we had it.
        match self.backfill_metadata().await {
            Ok(0) => {}
            Ok(count) => info!("Backfilled metadata for {} PRs", count),
            Err(err) => error!("Failed to backfill metadata: {}", err),
        }
        if let Err(err) = self.backfill_created_at().await {
            error!("Failed to backfill creation times: {}", err);
        }

        // Invalidate artifacts whose PR has new commits.
        match self.check_outdated().await {
            Ok(0) => {}
            Ok(count) => info!("Reset {} PRs with new commits to pending", count),
            Err(err) => error!("Failed to check for outdated reviews: {}", err),
        }

        // Completed rows whose artifact file vanished from disk regenerate.
        if let Err(err) = self.heal_missing_artifacts() {
            error!("Failed to check artifact files: {}", err);
        }

        if self.shutting_down() {
            info!("Shutdown requested, abandoning reconciliation pass");
            return;
        }

        // Remote fan-out. Either search may fail without aborting the pass;
        // the remaining steps still operate on the store's view.
        let review_prs = match self.remote(self.source.search_review_requested()).await {
            Some(Ok(prs)) => {
                info!("Found {} PRs requesting review", prs.len());
                prs
            }
            Some(Err(err)) => {
                error!("Failed to fetch PRs requesting review: {}", err);
                Vec::new()
            }
            None => {
                info!("Shutdown requested, abandoning reconciliation pass");
                return;
            }
        };
        let my_prs = match self.remote(self.source.search_mine()).await {
            Some(Ok(prs)) => {
                info!("Found {} of my own open PRs", prs.len());
                prs
            }
            Some(Err(err)) => {
                error!("Failed to fetch my open PRs: {}", err);
                Vec::new()
            }
            None => {
                info!("Shutdown requested, abandoning reconciliation pass");
                return;
            }
        };

        // Snapshot the store before recording discoveries: this is both the
        // union source and the set of identities eligible for generation in
        // this pass (a PR discovered just now waits for the next pass).
        let tracked_before = match self.db.list_all() {
            Ok(rows) => rows,
            Err(err) => {
                error!("Failed to list tracked PRs: {}", err);
                Vec::new()
            }
        };
        let known: HashSet<PrId> = tracked_before.iter().map(|row| row.id.clone()).collect();

        let mut summaries: Vec<(PullRequestSummary, bool)> = Vec::new();
        summaries.extend(review_prs.iter().cloned().map(|pr| (pr, false)));
        summaries.extend(my_prs.iter().cloned().map(|pr| (pr, true)));

        // Replace the dashboard cache wholesale.
        {
            let mut cache = self.pr_cache.write().await;
            *cache = summaries.iter().map(|(pr, _)| pr.clone()).collect();
        }

        // Announce brand-new review requests.
        for pr in &review_prs {
            if !known.contains(&pr.id) {
                self.notifier.speak(&format!(
                    "Your review is newly requested on PR number {}",
                    pr.id.pr_number
                ));
            }
        }

        // Record discoveries; new identities enter as PENDING.
        for (pr, is_mine) in &summaries {
            let discovered = DiscoveredPr {
                id: pr.id.clone(),
                head_sha: pr.head_sha.clone(),
                title: pr.title.clone(),
                author: pr.author.clone(),
                created_at: pr.created_at,
                draft: pr.draft,
                is_mine: *is_mine,
            };
            if let Err(err) = self.db.upsert(&discovered) {
                error!("Failed to upsert {}: {}", pr.id, err);
            }
        }

        // Union the summaries with every tracked row, so PRs the searches no
        // longer surface (already reviewed, for instance) still get fresh
        // review data.
        let mut union: Vec<PullRequestSummary> =
            summaries.iter().map(|(pr, _)| pr.clone()).collect();
        let surfaced: HashSet<PrId> = union.iter().map(|pr| pr.id.clone()).collect();
        for row in &tracked_before {
            if !surfaced.contains(&row.id) {
                union.push(summary_from_row(row));
            }
        }

        // Batched review data. Identities in a rate-limited or failed
        // repository are absent from the map and keep their stored values.
        if !union.is_empty() {
            let review_data = match self.remote(self.source.batch_review_data(&union)).await {
                Some(data) => data,
                None => {
                    info!("Shutdown requested, abandoning reconciliation pass");
                    return;
                }
            };
            let mut updated = 0;
            for (id, data) in &review_data {
                let checks = serde_json::to_string(&data.ci_failed_checks)
                    .unwrap_or_else(|_| "[]".to_string());
                match self.db.update_review_data(
                    id,
                    data.approval_count,
                    &data.my_review_status,
                    data.draft,
                    &data.ci_state,
                    &checks,
                ) {
                    Ok(true) => updated += 1,
                    Ok(false) => {}
                    Err(err) => error!("Failed to update review data for {}: {}", id, err),
                }
            }
            info!("Updated review data for {}/{} PRs", updated, union.len());
        }

        // Schedule generation for pending rows that were already tracked
        // when this pass began.
        self.process_pending(&known).await;

        info!("Poll completed in {:?}", start.elapsed());
    }

    /// Delete rows (and artifacts) for PRs the remote reports closed, merged,
    /// or gone. Per-row errors are logged and skipped.
    pub(crate) async fn cleanup_closed(&self) -> anyhow::Result<usize> {
        let rows = self.db.list_all()?;
        let mut removed = 0;

        for row in rows {
            let open = match self.remote(self.source.is_open(&row.id)).await {
                Some(Ok(open)) => open,
                Some(Err(GitHubError::NotFound)) => false,
                Some(Err(err)) => {
                    warn!("Could not check status of {}: {}", row.id, err);
                    continue;
                }
                None => break, // shutdown: abandon the sweep
            };
            if open {
                continue;
            }

            info!("{} is closed, removing from system", row.id);
            self.remove_artifact(&row);
            if let Err(err) = self.db.delete(&row.id) {
                error!("Failed to delete {}: {}", row.id, err);
                continue;
            }
            removed += 1;
        }
        Ok(removed)
    }

    pub(crate) async fn backfill_metadata(&self) -> anyhow::Result<usize> {
        let ids = self.db.missing_metadata()?;
        let mut updated = 0;
        for id in ids {
            let metadata = match self.remote(self.source.details(&id)).await {
                Some(Ok(metadata)) => metadata,
                Some(Err(err)) => {
                    warn!("Could not fetch details for {}: {}", id, err);
                    continue;
                }
                None => break, // shutdown
            };
            if let Err(err) = self
                .db
                .update_metadata(&id, &metadata.title, &metadata.author)
            {
                error!("Failed to update metadata for {}: {}", id, err);
                continue;
            }
            info!(
                "Backfilled metadata for {}: {} by {}",
                id, metadata.title, metadata.author
            );
            updated += 1;
        }
        Ok(updated)
    }

    pub(crate) async fn backfill_created_at(&self) -> anyhow::Result<usize> {
        let ids = self.db.missing_created_at()?;
        let mut updated = 0;
        for id in ids {
            let metadata = match self.remote(self.source.details(&id)).await {
                Some(Ok(metadata)) => metadata,
                Some(Err(err)) => {
                    warn!("Could not fetch creation time for {}: {}", id, err);
                    continue;
                }
                None => break, // shutdown
            };
            let Some(created_at) = metadata.created_at else {
                continue;
            };
            if let Err(err) = self.db.update_created_at(&id, created_at) {
                error!("Failed to update creation time for {}: {}", id, err);
                continue;
            }
            updated += 1;
        }
        Ok(updated)
    }

    /// For every COMPLETED or GENERATING row, compare the stored head sha
    /// against the remote. A mismatch cancels any live task, deletes the
    /// stale artifact, and re-queues the row with the new commit.
    pub(crate) async fn check_outdated(&self) -> anyhow::Result<usize> {
        let rows = self.db.list_all()?;
        let mut outdated = 0;

        for row in rows {
            if row.status != PrStatus::Completed && row.status != PrStatus::Generating {
                continue;
            }

            let current = match self.remote(self.source.head_sha(&row.id)).await {
                Some(Ok(sha)) => sha,
                Some(Err(GitHubError::NotFound)) => continue, // closure sweep owns this
                Some(Err(err)) => {
                    warn!("Could not fetch current head for {}: {}", row.id, err);
                    continue;
                }
                None => break, // shutdown
            };
            if current == row.head_sha {
                continue;
            }

            let was_generating = row.status == PrStatus::Generating;
            info!(
                "{} has new commits (old {}, new {}), resetting to pending",
                row.id,
                short_sha(&row.head_sha),
                short_sha(&current)
            );

            if was_generating && self.executor.cancel(&row.id) {
                info!("Cancelled in-flight review for {}", row.id);
            }
            self.remove_artifact(&row);
            if let Err(err) = self.db.reset_to_outdated(&row.id, &current) {
                error!("Failed to reset {}: {}", row.id, err);
                continue;
            }

            let message = if was_generating {
                format!(
                    "PR number {} has a new commit while generating. Cancelling old review and starting fresh.",
                    row.id.pr_number
                )
            } else {
                format!(
                    "PR number {} has a new commit. Removing stale review and generating a new one.",
                    row.id.pr_number
                )
            };
            self.notifier.speak(&message);
            outdated += 1;
        }
        Ok(outdated)
    }

    /// A COMPLETED row whose artifact file is missing from disk regenerates
    /// rather than crashing anything: back to PENDING, same head sha.
    pub(crate) fn heal_missing_artifacts(&self) -> anyhow::Result<usize> {
        let rows = self.db.list_all()?;
        let mut healed = 0;
        for row in rows {
            if row.status != PrStatus::Completed {
                continue;
            }
            let missing = match &row.artifact_path {
                None => true,
                Some(path) => !self.reviews_dir.join(path).exists(),
            };
            if !missing {
                continue;
            }
            warn!(
                "{} marked completed but artifact is missing, will regenerate",
                row.id
            );
            if self.db.reset_missing_artifact(&row.id)? {
                healed += 1;
            }
        }
        Ok(healed)
    }

    /// Schedule generation for PENDING rows tracked since before this pass,
    /// grouped by repository, in sequential sub-batches.
    async fn process_pending(&self, known: &HashSet<PrId>) {
        let rows = match self.db.list_all() {
            Ok(rows) => rows,
            Err(err) => {
                error!("Failed to list PRs for processing: {}", err);
                return;
            }
        };

        let mut by_repo: BTreeMap<String, Vec<TrackedPr>> = BTreeMap::new();
        for row in rows {
            if row.status == PrStatus::Pending && known.contains(&row.id) {
                by_repo.entry(row.id.repo_slug()).or_default().push(row);
            }
        }

        for (repo, prs) in by_repo {
            info!("Processing {} pending PRs in {}", prs.len(), repo);
            for batch in prs.chunks(REVIEW_BATCH_SIZE) {
                if self.shutting_down() {
                    info!("Shutdown requested, not scheduling further reviews");
                    return;
                }
                self.process_batch(batch).await;
            }
        }
    }

    async fn process_batch(&self, batch: &[TrackedPr]) {
        for pr in batch {
            if self.shutting_down() {
                return;
            }
            if let Err(err) = self.db.set_generating(
                &pr.id,
                &pr.head_sha,
                &pr.title,
                &pr.author,
                pr.is_mine,
                pr.created_at,
                pr.draft,
            ) {
                error!("Failed to mark {} as generating: {}", pr.id, err);
            }
        }

        for pr in batch {
            if self.shutting_down() {
                // Rows just marked GENERATING are healed by the next start.
                return;
            }
            match self.executor.run(&pr.id, &pr.head_sha).await {
                Ok(outcome) => info!("Review for {} finished: {:?}", pr.id, outcome),
                Err(err) => error!("Review for {} failed: {}", pr.id, err),
            }
        }
    }

    /// Best-effort removal of a row's artifact file.
    fn remove_artifact(&self, row: &TrackedPr) {
        let Some(path) = &row.artifact_path else {
            return;
        };
        let full = self.reviews_dir.join(path);
        match std::fs::remove_file(&full) {
            Ok(()) => info!("Deleted artifact {:?}", full),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => warn!("Failed to delete artifact {:?}: {}", full, err),
        }
    }
}

/// Seconds until the tick after `elapsed` time past the ticker epoch:
/// the next multiple of `interval`, clamped at zero.
fn countdown(elapsed: Duration, interval: Duration) -> u64 {
    if interval.is_zero() {
        return 0;
    }
    let ticks_done = elapsed.as_nanos() / interval.as_nanos();
    let next_tick = interval.as_nanos() * (ticks_done + 1);
    let remaining = next_tick.saturating_sub(elapsed.as_nanos());
    (remaining / 1_000_000_000) as u64
}

fn short_sha(sha: &str) -> &str {
    &sha[..sha.len().min(7)]
}

/// Rebuild a summary from a store row, for PRs the searches no longer
/// surface.
fn summary_from_row(row: &TrackedPr) -> PullRequestSummary {
    PullRequestSummary {
        id: row.id.clone(),
        head_sha: row.head_sha.clone(),
        title: row.title.clone(),
        author: row.author.clone(),
        url: row.id.github_url(),
        created_at: row.created_at,
        draft: row.draft,
    }
}
