//! The HTTP query/mutation surface.
//!
//! Read endpoints serve consistent snapshots of the store; the two mutations
//! (delete, notes) validate their bodies and never block on remote work.
//! Deleting a PR enqueues one manual reconciler tick so the dashboard
//! converges quickly. All API responses are cache-disabled.

use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::State;
use axum::http::{header, HeaderName, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tower::ServiceBuilder;
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::assets;
use crate::db::{NOTES_MAX_CHARS, PrId, TrackedPr};
use crate::prioritization::PriorityResult;
use crate::status::build_status;
use crate::AppState;

/// How long a rate-limit probe is served from cache before the status
/// endpoint refreshes it (the dashboard polls status every second).
const RATE_LIMIT_CACHE_TTL: Duration = Duration::from_secs(30);

pub fn router(state: Arc<AppState>) -> Router {
    let mut router = Router::new()
        .route("/api/prs", get(get_prs))
        .route("/api/prs/delete", post(delete_pr).delete(delete_pr))
        .route("/api/prs/notes", post(update_notes).patch(update_notes))
        .route("/api/status", get(get_status))
        .route("/api/priorities", get(get_priorities))
        .nest_service("/reviews", ServeDir::new(&state.config.reviews_dir));

    if !state.config.dev_mode {
        router = router.fallback(serve_app);
    }

    router
        .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()))
        .with_state(state)
}

async fn serve_app(uri: Uri) -> Response {
    assets::serve(uri.path())
}

fn no_store() -> [(HeaderName, &'static str); 3] {
    [
        (header::CACHE_CONTROL, "no-cache, no-store, must-revalidate"),
        (header::PRAGMA, "no-cache"),
        (header::EXPIRES, "0"),
    ]
}

#[derive(Debug, Serialize)]
struct PrResponse {
    owner: String,
    repo: String,
    number: u64,
    commit_sha: String,
    last_reviewed_at: Option<String>,
    review_html_path: String,
    github_url: String,
    review_url: String,
    status: &'static str,
    title: String,
    author: String,
    generating_since: Option<String>,
    is_mine: bool,
    my_review_status: String,
    approval_count: i64,
    draft: bool,
    notes: String,
    ci_state: String,
    ci_failed_checks: Vec<String>,
}

fn format_instant(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Secs, true)
}

fn pr_response(row: TrackedPr, cached_url: Option<&str>) -> PrResponse {
    let github_url = cached_url
        .map(|url| url.to_string())
        .unwrap_or_else(|| row.id.github_url());

    let review_html_path = row.artifact_path.clone().unwrap_or_default();
    let review_url = if review_html_path.is_empty() {
        String::new()
    } else {
        format!("/reviews/{}", review_html_path)
    };

    let ci_failed_checks: Vec<String> =
        serde_json::from_str(&row.ci_failed_checks).unwrap_or_default();

    PrResponse {
        owner: row.id.repo_owner.clone(),
        repo: row.id.repo_name.clone(),
        number: row.id.pr_number,
        commit_sha: row.head_sha.clone(),
        last_reviewed_at: row.last_reviewed_at.map(format_instant),
        review_html_path,
        github_url,
        review_url,
        status: row.status.as_str(),
        title: row.display_title(),
        author: row.display_author(),
        generating_since: row.generating_since.map(format_instant),
        is_mine: row.is_mine,
        my_review_status: row.my_review_status.clone(),
        approval_count: row.approval_count,
        draft: row.draft,
        notes: row.notes.clone(),
        ci_state: row.ci_state.clone(),
        ci_failed_checks,
    }
}

async fn get_prs(State(state): State<Arc<AppState>>) -> Response {
    let rows = match state.db.list_all() {
        Ok(rows) => rows,
        Err(err) => {
            warn!("Failed to fetch PRs from database: {}", err);
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Failed to fetch PRs from database",
            )
                .into_response();
        }
    };

    // The remote cache carries the canonical html_url for PRs the searches
    // surfaced; everything else gets a constructed URL.
    let cache = state.pr_cache.read().await;
    let response: Vec<PrResponse> = rows
        .into_iter()
        .map(|row| {
            let cached_url = cache
                .iter()
                .find(|pr| pr.id == row.id)
                .map(|pr| pr.url.as_str());
            pr_response(row, cached_url)
        })
        .collect();

    (no_store(), Json(response)).into_response()
}

#[derive(Debug, Deserialize)]
struct IdentityRequest {
    owner: String,
    repo: String,
    number: u64,
}

impl IdentityRequest {
    fn id(&self) -> PrId {
        PrId::new(&self.owner, &self.repo, self.number)
    }
}

async fn delete_pr(
    State(state): State<Arc<AppState>>,
    Json(request): Json<IdentityRequest>,
) -> Response {
    let id = request.id();

    // Remove the artifact first; the row knows its filename.
    match state.db.get(&id) {
        Ok(Some(row)) => {
            if let Some(path) = &row.artifact_path {
                let full = state.config.reviews_dir.join(path);
                if let Err(err) = std::fs::remove_file(&full) {
                    if err.kind() != std::io::ErrorKind::NotFound {
                        warn!("Failed to delete artifact {:?}: {}", full, err);
                    }
                }
            }
        }
        Ok(None) => {} // deleting an unknown identity still succeeds
        Err(err) => {
            warn!("Failed to look up {}: {}", id, err);
            return (StatusCode::INTERNAL_SERVER_ERROR, "Failed to get PR").into_response();
        }
    }

    if let Err(err) = state.db.delete(&id) {
        warn!("Failed to delete {}: {}", id, err);
        return (StatusCode::INTERNAL_SERVER_ERROR, "Failed to delete PR").into_response();
    }

    info!("Deleted tracked PR {}", id);

    // Converge quickly: if the PR is still open it will be re-discovered and
    // regenerated by the next pass.
    state.poller.trigger();

    (no_store(), Json(json!({ "status": "success" }))).into_response()
}

#[derive(Debug, Deserialize)]
struct NotesRequest {
    owner: String,
    repo: String,
    number: u64,
    notes: String,
}

async fn update_notes(
    State(state): State<Arc<AppState>>,
    Json(request): Json<NotesRequest>,
) -> Response {
    if request.notes.chars().count() > NOTES_MAX_CHARS {
        return (
            StatusCode::BAD_REQUEST,
            format!("Notes must be {} characters or less", NOTES_MAX_CHARS),
        )
            .into_response();
    }

    let id = PrId::new(&request.owner, &request.repo, request.number);
    if let Err(err) = state.db.update_notes(&id, &request.notes) {
        warn!("Failed to update notes for {}: {}", id, err);
        return (StatusCode::INTERNAL_SERVER_ERROR, "Failed to update notes").into_response();
    }

    info!("Updated notes for {}: {:?}", id, request.notes);
    (
        no_store(),
        Json(json!({ "status": "success", "notes": request.notes })),
    )
        .into_response()
}

async fn get_status(State(state): State<Arc<AppState>>) -> Response {
    let rows = match state.db.list_all() {
        Ok(rows) => rows,
        Err(err) => {
            warn!("Failed to fetch PRs for status: {}", err);
            return (StatusCode::INTERNAL_SERVER_ERROR, "Failed to get PRs").into_response();
        }
    };

    let rate_limit = cached_rate_limit(&state).await;
    let response = build_status(
        &rows,
        state.started_at.elapsed(),
        state.executor.running_elapsed(),
        state.poller.seconds_until_next_poll(),
        rate_limit.as_ref(),
    );

    (no_store(), Json(response)).into_response()
}

/// Rate-limit info for the status payload, refreshed from the remote at most
/// once per [`RATE_LIMIT_CACHE_TTL`]. A failed refresh keeps serving the old
/// value.
async fn cached_rate_limit(state: &Arc<AppState>) -> Option<crate::github::RateLimitInfo> {
    let cached = { state.rate_limit_cache.read().await.clone() };
    let fresh_needed = match cached.fetched_at {
        Some(at) => at.elapsed() > RATE_LIMIT_CACHE_TTL,
        None => true,
    };
    if !fresh_needed {
        return cached.info;
    }

    match state.source.rate_limit().await {
        Ok(fresh) => {
            let mut slot = state.rate_limit_cache.write().await;
            slot.info = Some(fresh.clone());
            slot.fetched_at = Some(Instant::now());
            Some(fresh)
        }
        Err(err) => {
            warn!("Failed to refresh rate limit info: {}", err);
            cached.info
        }
    }
}

async fn get_priorities(State(state): State<Arc<AppState>>) -> Response {
    let result = { state.priority_result.read().await.clone() };
    let result = result.unwrap_or_else(PriorityResult::empty);
    (no_store(), Json(result)).into_response()
}
