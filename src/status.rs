//! Payload for the `/api/status` endpoint.

use std::time::Duration;

use chrono::{SecondsFormat, Utc};
use serde::Serialize;

use crate::db::{PrStatus, TrackedPr};
use crate::github::RateLimitInfo;

/// The rate limit is reported as "limited" below this many remaining calls.
const RATE_LIMIT_LOW_WATER: i64 = 10;

/// How many recent completions the status payload carries.
const RECENT_COMPLETIONS: usize = 3;

#[derive(Debug, Default, Serialize)]
pub struct StatusCounts {
    pub pending: usize,
    pub generating: usize,
    pub completed: usize,
    pub error: usize,
}

#[derive(Debug, Serialize)]
pub struct RecentCompletion {
    pub number: u64,
    pub repo: String,
    pub reviewed_at: String,
}

#[derive(Debug, Serialize)]
pub struct RateLimitStatus {
    pub remaining: i64,
    pub limit: i64,
    pub reset_at: String,
    pub is_limited: bool,
}

impl Default for RateLimitStatus {
    /// Reported when no rate-limit probe has succeeded yet: assume limited.
    fn default() -> Self {
        Self {
            remaining: 0,
            limit: 5000,
            reset_at: String::new(),
            is_limited: true,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub uptime_seconds: u64,
    pub generator_running: bool,
    pub generator_duration_seconds: u64,
    pub counts: StatusCounts,
    pub recent_completions: Vec<RecentCompletion>,
    pub missing_metadata_count: usize,
    pub timestamp: i64,
    pub seconds_until_next_poll: u64,
    pub rate_limit: RateLimitStatus,
}

pub fn build_status(
    rows: &[TrackedPr],
    uptime: Duration,
    generator_elapsed: Option<Duration>,
    seconds_until_next_poll: u64,
    rate_limit: Option<&RateLimitInfo>,
) -> StatusResponse {
    let mut counts = StatusCounts::default();
    for row in rows {
        match row.status {
            PrStatus::Pending => counts.pending += 1,
            PrStatus::Generating => counts.generating += 1,
            PrStatus::Completed => counts.completed += 1,
            PrStatus::Error => counts.error += 1,
        }
    }

    let recent_completions = rows
        .iter()
        .rev()
        .filter(|row| row.status == PrStatus::Completed)
        .filter_map(|row| {
            row.last_reviewed_at.map(|at| RecentCompletion {
                number: row.id.pr_number,
                repo: row.id.repo_slug(),
                reviewed_at: at.to_rfc3339_opts(SecondsFormat::Secs, true),
            })
        })
        .take(RECENT_COMPLETIONS)
        .collect();

    let missing_metadata_count = rows
        .iter()
        .filter(|row| row.title.is_empty() || row.author.is_empty())
        .count();

    let rate_limit = match rate_limit {
        Some(info) => RateLimitStatus {
            remaining: info.remaining,
            limit: info.limit,
            reset_at: info.reset_at.to_rfc3339_opts(SecondsFormat::Secs, true),
            is_limited: info.remaining < RATE_LIMIT_LOW_WATER,
        },
        None => RateLimitStatus::default(),
    };

    StatusResponse {
        uptime_seconds: uptime.as_secs(),
        generator_running: generator_elapsed.is_some(),
        generator_duration_seconds: generator_elapsed.map(|d| d.as_secs()).unwrap_or(0),
        counts,
        recent_completions,
        missing_metadata_count,
        timestamp: Utc::now().timestamp(),
        seconds_until_next_poll,
        rate_limit,
    }
}
