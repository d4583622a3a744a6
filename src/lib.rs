pub mod assets;
pub mod config;
pub mod db;
pub mod executor;
pub mod github;
pub mod notify;
pub mod poller;
pub mod prioritization;
pub mod server;
pub mod status;

use std::sync::Arc;
use std::time::Instant;

use tokio::sync::RwLock;

use crate::config::Config;
use crate::db::Db;
use crate::executor::ReviewExecutor;
use crate::github::{PrSource, PullRequestSummary, RateLimitInfo};
use crate::poller::Poller;
use crate::prioritization::PriorityResult;

/// Rate-limit info as last fetched for the status endpoint, with the fetch
/// time so callers can decide staleness.
#[derive(Default, Clone)]
pub struct RateLimitCache {
    pub info: Option<RateLimitInfo>,
    pub fetched_at: Option<Instant>,
}

/// Shared state for the HTTP surface and the background services.
///
/// All cross-component coupling goes through the store or through one of the
/// replaced-wholesale snapshots below; nothing here holds a lock across a
/// remote call or subprocess wait.
pub struct AppState {
    pub config: Config,
    pub db: Arc<Db>,
    pub source: Arc<dyn PrSource>,
    pub executor: Arc<ReviewExecutor>,
    pub poller: Arc<Poller>,
    /// Most recent remote search results, for fast dashboard reads.
    pub pr_cache: Arc<RwLock<Vec<PullRequestSummary>>>,
    pub rate_limit_cache: RwLock<RateLimitCache>,
    pub priority_result: RwLock<Option<PriorityResult>>,
    pub started_at: Instant,
}
