//! Priority scoring for PRs awaiting the user's review.
//!
//! A background task recomputes the ranking at startup and every 30 minutes;
//! the result is replaced wholesale under the shared lock and served from
//! `/api/priorities`. Scoring is a pure function over a store row plus the
//! batched remote details, so it is cheap to test in isolation.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::db::{Db, TrackedPr};
use crate::github::{PrDetails, PrSource};
use crate::AppState;

/// How often the ranking is recomputed.
pub const RECOMPUTE_INTERVAL: Duration = Duration::from_secs(30 * 60);

#[derive(Debug, Clone, Serialize)]
pub struct PrioritizedPr {
    pub owner: String,
    pub repo: String,
    pub number: u64,
    pub title: String,
    pub author: String,
    pub score: i64,
    /// "HIGH", "MEDIUM", "LOW", or "SKIP".
    pub priority: String,
    pub reasons: Vec<String>,
    pub age_days: i64,
    pub additions: i64,
    pub deletions: i64,
    pub changed_files: i64,
    pub review_count: i64,
    pub approval_count: i64,
    pub my_review_status: String,
    pub github_url: String,
    pub review_url: String,
    pub created_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PriorityResult {
    pub timestamp: DateTime<Utc>,
    pub top_prs: Vec<PrioritizedPr>,
    pub total_prs_scored: usize,
    pub high_priority_count: usize,
    pub medium_priority_count: usize,
    pub low_priority_count: usize,
}

impl PriorityResult {
    /// Served before the first recompute has finished.
    pub fn empty() -> Self {
        Self {
            timestamp: Utc::now(),
            top_prs: Vec::new(),
            total_prs_scored: 0,
            high_priority_count: 0,
            medium_priority_count: 0,
            low_priority_count: 0,
        }
    }
}

pub struct Prioritizer {
    db: Arc<Db>,
    source: Arc<dyn PrSource>,
}

impl Prioritizer {
    pub fn new(db: Arc<Db>, source: Arc<dyn PrSource>) -> Self {
        Self { db, source }
    }

    pub async fn calculate(&self) -> Result<PriorityResult> {
        info!("Starting PR prioritization calculation");

        let rows = self.db.list_all().context("Failed to list PRs")?;
        let candidates: Vec<&TrackedPr> = rows
            .iter()
            .filter(|row| !row.is_mine && !row.draft)
            .collect();

        if candidates.is_empty() {
            info!("No PRs to prioritize (all are mine or drafts)");
            return Ok(PriorityResult::empty());
        }

        let ids: Vec<_> = candidates.iter().map(|row| row.id.clone()).collect();
        let details = self.source.batch_details(&ids).await;

        let mut scored: Vec<PrioritizedPr> = candidates
            .iter()
            .copied()
            .filter_map(|row| details.get(&row.id).map(|details| score_pr(row, details)))
            .collect();
        scored.sort_by(|a, b| b.score.cmp(&a.score));

        let high_priority_count = scored.iter().filter(|p| p.priority == "HIGH").count();
        let medium_priority_count = scored.iter().filter(|p| p.priority == "MEDIUM").count();
        let low_priority_count = scored.iter().filter(|p| p.priority == "LOW").count();

        info!(
            "Prioritization complete: {} PRs scored ({} HIGH, {} MEDIUM, {} LOW)",
            scored.len(),
            high_priority_count,
            medium_priority_count,
            low_priority_count
        );

        Ok(PriorityResult {
            timestamp: Utc::now(),
            total_prs_scored: scored.len(),
            top_prs: scored,
            high_priority_count,
            medium_priority_count,
            low_priority_count,
        })
    }
}

/// Score one PR. Positive signals: age, reviews without approvals, size with
/// little attention, an explicit review request, sheer size. Negative:
/// already well-covered, already reviewed by the user.
pub(crate) fn score_pr(row: &TrackedPr, details: &PrDetails) -> PrioritizedPr {
    let mut score: i64 = 0;
    let mut reasons = Vec::new();

    let created_at = details.created_at.or(row.created_at);
    let age_days = created_at
        .map(|created| (Utc::now() - created).num_days())
        .unwrap_or(0);

    if age_days >= 4 {
        score += 50;
        reasons.push(format!("Very old ({}d)", age_days));
    } else if age_days >= 3 {
        score += 30;
        reasons.push(format!("Old ({}d)", age_days));
    } else if age_days >= 2 {
        score += 20;
        reasons.push(format!("Aging ({}d)", age_days));
    } else if age_days >= 1 {
        score += 10;
        reasons.push(format!("Recent ({}d)", age_days));
    }

    if details.review_count >= 3 && row.approval_count == 0 {
        score += 40;
        reasons.push(format!(
            "{} reviews but no approvals",
            details.review_count
        ));
    }

    if details.additions >= 500 && details.review_count < 2 {
        score += 30;
        reasons.push(format!(
            "Large PR ({}+ lines) with few reviews",
            details.additions
        ));
    }

    if details.requested_me {
        score += 25;
        reasons.push("You are explicitly requested".to_string());
    }

    if details.additions >= 1000 {
        score += 20;
        reasons.push(format!("Very large ({}+ lines)", details.additions));
    } else if details.additions >= 500 {
        score += 10;
        reasons.push(format!("Large ({}+ lines)", details.additions));
    }

    if row.approval_count >= 1 && details.review_count >= 5 {
        score -= 30;
        reasons.push(format!(
            "Well-covered ({} approvals, {} reviews)",
            row.approval_count, details.review_count
        ));
    }

    if row.my_review_status == "APPROVED" || row.my_review_status == "COMMENTED" {
        score -= 40;
        reasons.push(format!("You already reviewed ({})", row.my_review_status));
    }

    let priority = if score >= 60 {
        "HIGH"
    } else if score >= 30 {
        "MEDIUM"
    } else if score >= 0 {
        "LOW"
    } else {
        "SKIP"
    };

    PrioritizedPr {
        owner: row.id.repo_owner.clone(),
        repo: row.id.repo_name.clone(),
        number: row.id.pr_number,
        title: row.display_title(),
        author: row.display_author(),
        score,
        priority: priority.to_string(),
        reasons,
        age_days,
        additions: details.additions,
        deletions: details.deletions,
        changed_files: details.changed_files,
        review_count: details.review_count,
        approval_count: row.approval_count,
        my_review_status: row.my_review_status.clone(),
        github_url: row.id.github_url(),
        review_url: row
            .artifact_path
            .as_deref()
            .map(|path| format!("/reviews/{}", path))
            .unwrap_or_default(),
        created_at,
    }
}

/// Recompute once at startup and then on every interval tick, replacing the
/// shared snapshot wholesale.
pub fn spawn_prioritizer(
    state: Arc<AppState>,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        recompute(&state).await;

        let mut ticker = tokio::time::interval(RECOMPUTE_INTERVAL);
        ticker.tick().await; // the immediate first tick; startup run is above
        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    info!("Stopping prioritization service");
                    break;
                }
                _ = ticker.tick() => recompute(&state).await,
            }
        }
    })
}

async fn recompute(state: &Arc<AppState>) {
    let prioritizer = Prioritizer::new(state.db.clone(), state.source.clone());
    match prioritizer.calculate().await {
        Ok(result) => {
            let mut slot = state.priority_result.write().await;
            *slot = Some(result);
        }
        Err(err) => error!("Error calculating priorities: {}", err),
    }
}
