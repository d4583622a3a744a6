//! SQLite persistence for tracked pull requests.
//!
//! The store is the sole owner of durability. One `prs` table holds every
//! tracked PR keyed by `(repo_owner, repo_name, pr_number)`; the schema is
//! evolved by forward-only column additions that are safe to re-run
//! (a "duplicate column" error is the structured no-op signal).
//!
//! Besides row-level primitives this module exposes the invariant-carrying
//! transitions (`set_generating`, `reset_to_outdated`, `mark_completed`) and
//! the self-healing queries used at the start of every reconciliation pass.

use std::fmt;
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::Serialize;

/// Identity of a tracked pull request. Unique per row.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PrId {
    pub repo_owner: String,
    pub repo_name: String,
    pub pr_number: u64,
}

impl PrId {
    pub fn new(repo_owner: &str, repo_name: &str, pr_number: u64) -> Self {
        Self {
            repo_owner: repo_owner.to_string(),
            repo_name: repo_name.to_string(),
            pr_number,
        }
    }

    /// `owner/repo`, the form the generator and the GitHub API expect.
    pub fn repo_slug(&self) -> String {
        format!("{}/{}", self.repo_owner, self.repo_name)
    }

    pub fn github_url(&self) -> String {
        format!(
            "https://github.com/{}/{}/pull/{}",
            self.repo_owner, self.repo_name, self.pr_number
        )
    }
}

impl fmt::Display for PrId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}#{}", self.repo_owner, self.repo_name, self.pr_number)
    }
}

/// Review lifecycle of a tracked PR.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PrStatus {
    Pending,
    Generating,
    Completed,
    Error,
}

impl PrStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PrStatus::Pending => "pending",
            PrStatus::Generating => "generating",
            PrStatus::Completed => "completed",
            PrStatus::Error => "error",
        }
    }

    fn from_db(value: &str) -> Self {
        match value {
            "generating" => PrStatus::Generating,
            "completed" => PrStatus::Completed,
            "error" => PrStatus::Error,
            _ => PrStatus::Pending,
        }
    }
}

/// A full row from the `prs` table.
#[derive(Debug, Clone)]
pub struct TrackedPr {
    pub id: PrId,
    pub head_sha: String,
    pub last_reviewed_at: Option<DateTime<Utc>>,
    /// Artifact filename relative to the reviews directory, when completed.
    pub artifact_path: Option<String>,
    pub status: PrStatus,
    pub generating_since: Option<DateTime<Utc>>,
    pub is_mine: bool,
    pub title: String,
    pub author: String,
    pub approval_count: i64,
    /// "APPROVED", "CHANGES_REQUESTED", "COMMENTED", or "" when the user has
    /// no live review on this PR.
    pub my_review_status: String,
    pub created_at: Option<DateTime<Utc>>,
    pub draft: bool,
    pub notes: String,
    pub ci_state: String,
    /// JSON array of failed check names, "[]" unless ci_state is "failure".
    pub ci_failed_checks: String,
}

impl TrackedPr {
    /// Title for display; remote metadata may not have been backfilled yet.
    pub fn display_title(&self) -> String {
        if self.title.is_empty() {
            format!("PR #{}", self.id.pr_number)
        } else {
            self.title.clone()
        }
    }

    pub fn display_author(&self) -> String {
        if self.author.is_empty() {
            "Unknown".to_string()
        } else {
            self.author.clone()
        }
    }
}

/// A PR as first surfaced by a remote search; `upsert` records it as PENDING.
#[derive(Debug, Clone)]
pub struct DiscoveredPr {
    pub id: PrId,
    pub head_sha: String,
    pub title: String,
    pub author: String,
    pub created_at: Option<DateTime<Utc>>,
    pub draft: bool,
    pub is_mine: bool,
}

/// SQLite store for tracked PRs.
///
/// `rusqlite::Connection` is not `Sync`, so all access goes through a Mutex.
/// Every statement is a single atomic write; the only multi-statement unit is
/// the migration transaction at startup.
pub struct Db {
    conn: Mutex<Connection>,
}

const BASE_SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS prs (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        repo_owner TEXT NOT NULL,
        repo_name TEXT NOT NULL,
        pr_number INTEGER NOT NULL,
        last_commit_sha TEXT NOT NULL,
        last_reviewed_at TIMESTAMP,
        review_html_path TEXT,
        status TEXT DEFAULT 'pending',
        UNIQUE(repo_owner, repo_name, pr_number)
    )";

/// Forward-only column additions. Each is idempotent: re-running against a
/// database that already has the column yields a "duplicate column" error,
/// which is the expected no-op signal.
const MIGRATIONS: &[&str] = &[
    "ALTER TABLE prs ADD COLUMN status TEXT DEFAULT 'pending'",
    "ALTER TABLE prs ADD COLUMN generating_since TIMESTAMP",
    "ALTER TABLE prs ADD COLUMN is_mine INTEGER DEFAULT 0",
    "ALTER TABLE prs ADD COLUMN title TEXT DEFAULT ''",
    "ALTER TABLE prs ADD COLUMN author TEXT DEFAULT ''",
    "ALTER TABLE prs ADD COLUMN approval_count INTEGER DEFAULT 0",
    "ALTER TABLE prs ADD COLUMN my_review_status TEXT DEFAULT ''",
    "ALTER TABLE prs ADD COLUMN created_at TIMESTAMP",
    "ALTER TABLE prs ADD COLUMN draft INTEGER DEFAULT 0",
    "ALTER TABLE prs ADD COLUMN notes TEXT DEFAULT ''",
    "ALTER TABLE prs ADD COLUMN ci_state TEXT DEFAULT 'unknown'",
    "ALTER TABLE prs ADD COLUMN ci_failed_checks TEXT DEFAULT '[]'",
];

const PR_COLUMNS: &str = "repo_owner, repo_name, pr_number, last_commit_sha, \
     last_reviewed_at, review_html_path, COALESCE(status, 'pending'), \
     generating_since, COALESCE(is_mine, 0), COALESCE(title, ''), \
     COALESCE(author, ''), COALESCE(approval_count, 0), \
     COALESCE(my_review_status, ''), created_at, COALESCE(draft, 0), \
     COALESCE(notes, ''), COALESCE(ci_state, 'unknown'), \
     COALESCE(ci_failed_checks, '[]')";

/// User notes are capped at this many characters (enforced at the HTTP layer,
/// truncated defensively here).
pub const NOTES_MAX_CHARS: usize = 15;

impl Db {
    /// Open or create the database file and bring the schema up to date.
    pub fn new(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open SQLite database at {:?}", path))?;
        let db = Self {
            conn: Mutex::new(conn),
        };
        db.init_schema()?;
        Ok(db)
    }

    /// In-memory database for tests.
    pub fn new_in_memory() -> Result<Self> {
        let conn =
            Connection::open_in_memory().context("Failed to open in-memory SQLite database")?;
        let db = Self {
            conn: Mutex::new(conn),
        };
        db.init_schema()?;
        Ok(db)
    }

    /// Create the base table and apply the additive migrations in a single
    /// transaction. Any non-"duplicate column" failure rolls everything back
    /// and aborts startup.
    fn init_schema(&self) -> Result<()> {
        let mut conn = self.conn.lock().expect("mutex poisoned");

        conn.execute(BASE_SCHEMA, [])
            .context("Failed to create prs table")?;

        let tx = conn
            .transaction()
            .context("Failed to begin migration transaction")?;
        for migration in MIGRATIONS {
            match tx.execute(migration, []) {
                Ok(_) => {}
                Err(err) if is_duplicate_column(&err) => continue,
                Err(err) => {
                    return Err(err)
                        .with_context(|| format!("Migration failed: {}", migration));
                }
            }
        }
        tx.commit().context("Failed to commit migrations")?;

        Ok(())
    }

    pub fn get(&self, id: &PrId) -> Result<Option<TrackedPr>> {
        let conn = self.conn.lock().expect("mutex poisoned");
        let query = format!(
            "SELECT {} FROM prs WHERE repo_owner = ?1 AND repo_name = ?2 AND pr_number = ?3",
            PR_COLUMNS
        );
        conn.query_row(
            &query,
            params![id.repo_owner, id.repo_name, id.pr_number as i64],
            map_row,
        )
        .optional()
        .context("Failed to get PR")
    }

    /// All tracked PRs in the dashboard order: other people's PRs before the
    /// user's own, newest first with unknown creation times last, then a
    /// fixed status tie-break.
    pub fn list_all(&self) -> Result<Vec<TrackedPr>> {
        let conn = self.conn.lock().expect("mutex poisoned");
        let query = format!(
            "SELECT {} FROM prs
             ORDER BY
                 is_mine ASC,
                 created_at DESC NULLS LAST,
                 CASE status
                     WHEN 'generating' THEN 1
                     WHEN 'pending' THEN 2
                     WHEN 'completed' THEN 3
                     ELSE 4
                 END",
            PR_COLUMNS
        );
        let mut stmt = conn.prepare(&query).context("Failed to prepare list_all")?;
        let rows = stmt
            .query_map([], map_row)
            .context("Failed to query PRs")?;

        let mut prs = Vec::new();
        for row in rows {
            prs.push(row.context("Failed to read PR row")?);
        }
        Ok(prs)
    }

    /// Record a PR surfaced by a remote search. New identities are inserted
    /// as PENDING; existing rows only have their metadata refreshed — status
    /// is never touched, and `last_commit_sha` is updated only while the row
    /// is still PENDING (outdated-artifact detection owns sha changes for
    /// COMPLETED and GENERATING rows).
    pub fn upsert(&self, pr: &DiscoveredPr) -> Result<()> {
        let conn = self.conn.lock().expect("mutex poisoned");
        conn.execute(
            "INSERT INTO prs (repo_owner, repo_name, pr_number, last_commit_sha,
                              status, is_mine, title, author, created_at, draft)
             VALUES (?1, ?2, ?3, ?4, 'pending', ?5, ?6, ?7, ?8, ?9)
             ON CONFLICT(repo_owner, repo_name, pr_number) DO UPDATE SET
                 title = excluded.title,
                 author = excluded.author,
                 is_mine = excluded.is_mine,
                 draft = excluded.draft,
                 created_at = COALESCE(excluded.created_at, prs.created_at),
                 last_commit_sha = CASE WHEN prs.status = 'pending'
                                        THEN excluded.last_commit_sha
                                        ELSE prs.last_commit_sha END",
            params![
                pr.id.repo_owner,
                pr.id.repo_name,
                pr.id.pr_number as i64,
                pr.head_sha,
                pr.is_mine,
                pr.title,
                pr.author,
                pr.created_at,
                pr.draft,
            ],
        )
        .context("Failed to upsert PR")?;
        Ok(())
    }

    /// Delete a tracked PR. Returns whether a row existed (deleting an
    /// unknown identity is a successful no-op).
    pub fn delete(&self, id: &PrId) -> Result<bool> {
        let conn = self.conn.lock().expect("mutex poisoned");
        let affected = conn
            .execute(
                "DELETE FROM prs WHERE repo_owner = ?1 AND repo_name = ?2 AND pr_number = ?3",
                params![id.repo_owner, id.repo_name, id.pr_number as i64],
            )
            .context("Failed to delete PR")?;
        Ok(affected > 0)
    }

    /// Atomic INSERT-or-UPDATE that moves a PR into GENERATING: stamps
    /// `generating_since`, clears any previous artifact path.
    #[allow(clippy::too_many_arguments)]
    pub fn set_generating(
        &self,
        id: &PrId,
        head_sha: &str,
        title: &str,
        author: &str,
        is_mine: bool,
        created_at: Option<DateTime<Utc>>,
        draft: bool,
    ) -> Result<()> {
        let now = Utc::now();
        let conn = self.conn.lock().expect("mutex poisoned");
        conn.execute(
            "INSERT INTO prs (repo_owner, repo_name, pr_number, last_commit_sha,
                              status, generating_since, is_mine, title, author,
                              review_html_path, created_at, draft)
             VALUES (?1, ?2, ?3, ?4, 'generating', ?5, ?6, ?7, ?8, NULL, ?9, ?10)
             ON CONFLICT(repo_owner, repo_name, pr_number) DO UPDATE SET
                 last_commit_sha = excluded.last_commit_sha,
                 status = 'generating',
                 generating_since = excluded.generating_since,
                 is_mine = excluded.is_mine,
                 title = excluded.title,
                 author = excluded.author,
                 review_html_path = NULL,
                 created_at = COALESCE(excluded.created_at, prs.created_at),
                 draft = excluded.draft",
            params![
                id.repo_owner,
                id.repo_name,
                id.pr_number as i64,
                head_sha,
                now,
                is_mine,
                title,
                author,
                created_at,
                draft,
            ],
        )
        .context("Failed to set PR generating")?;
        Ok(())
    }

    /// A new commit invalidated the tracked artifact: back to PENDING with
    /// the new head sha, all review-output columns cleared.
    pub fn reset_to_outdated(&self, id: &PrId, new_head_sha: &str) -> Result<()> {
        let conn = self.conn.lock().expect("mutex poisoned");
        conn.execute(
            "UPDATE prs
             SET status = 'pending',
                 last_commit_sha = ?4,
                 review_html_path = NULL,
                 last_reviewed_at = NULL,
                 generating_since = NULL
             WHERE repo_owner = ?1 AND repo_name = ?2 AND pr_number = ?3",
            params![id.repo_owner, id.repo_name, id.pr_number as i64, new_head_sha],
        )
        .context("Failed to reset PR to outdated")?;
        Ok(())
    }

    /// A COMPLETED row whose artifact file is gone from disk: back to
    /// PENDING, keeping the head sha so the next pass regenerates in place.
    pub fn reset_missing_artifact(&self, id: &PrId) -> Result<bool> {
        let conn = self.conn.lock().expect("mutex poisoned");
        let affected = conn
            .execute(
                "UPDATE prs
                 SET status = 'pending', review_html_path = NULL, last_reviewed_at = NULL
                 WHERE repo_owner = ?1 AND repo_name = ?2 AND pr_number = ?3
                   AND status = 'completed'",
                params![id.repo_owner, id.repo_name, id.pr_number as i64],
            )
            .context("Failed to reset PR with missing artifact")?;
        Ok(affected > 0)
    }

    /// Record a finished generation. The write is guarded on the row still
    /// carrying the head sha the generator was spawned with: if a new commit
    /// arrived mid-generation the guard fails, nothing is written, and the
    /// caller must discard the stale artifact.
    pub fn mark_completed(&self, id: &PrId, spawned_sha: &str, artifact: &str) -> Result<bool> {
        let now = Utc::now();
        let conn = self.conn.lock().expect("mutex poisoned");
        let affected = conn
            .execute(
                "UPDATE prs
                 SET status = 'completed',
                     review_html_path = ?4,
                     last_reviewed_at = ?5,
                     generating_since = NULL
                 WHERE repo_owner = ?1 AND repo_name = ?2 AND pr_number = ?3
                   AND last_commit_sha = ?6",
                params![
                    id.repo_owner,
                    id.repo_name,
                    id.pr_number as i64,
                    artifact,
                    now,
                    spawned_sha,
                ],
            )
            .context("Failed to mark PR completed")?;
        Ok(affected > 0)
    }

    /// Record a failed generation, unless the reconciler already invalidated
    /// the work (row back to PENDING with a different sha) — in that case the
    /// row is left alone and the next pass regenerates.
    pub fn mark_error_unless_invalidated(&self, id: &PrId, spawned_sha: &str) -> Result<bool> {
        let conn = self.conn.lock().expect("mutex poisoned");
        let affected = conn
            .execute(
                "UPDATE prs
                 SET status = 'error', generating_since = NULL
                 WHERE repo_owner = ?1 AND repo_name = ?2 AND pr_number = ?3
                   AND NOT (status = 'pending' AND last_commit_sha <> ?4)",
                params![id.repo_owner, id.repo_name, id.pr_number as i64, spawned_sha],
            )
            .context("Failed to mark PR errored")?;
        Ok(affected > 0)
    }

    /// Heal rows stuck in GENERATING (unclean shutdown, crashed generator).
    /// Rows whose `generating_since` is older than `timeout` — or missing
    /// entirely — go back to PENDING. Returns the number of rows healed.
    pub fn reset_stale_generating(&self, timeout: Duration) -> Result<usize> {
        let cutoff = Utc::now() - chrono::Duration::from_std(timeout)?;
        let conn = self.conn.lock().expect("mutex poisoned");
        let affected = conn
            .execute(
                "UPDATE prs
                 SET status = 'pending', generating_since = NULL
                 WHERE status = 'generating'
                   AND (generating_since IS NULL OR generating_since < ?1)",
                params![cutoff],
            )
            .context("Failed to reset stale generating PRs")?;
        Ok(affected)
    }

    /// Re-queue ERROR rows for retry. Age is measured against
    /// `last_reviewed_at`; a NULL (the row never completed) counts as old, so
    /// a fresh failure is retried on the next pass.
    pub fn reset_error(&self, max_age: Duration) -> Result<usize> {
        let cutoff = Utc::now() - chrono::Duration::from_std(max_age)?;
        let conn = self.conn.lock().expect("mutex poisoned");
        let affected = conn
            .execute(
                "UPDATE prs
                 SET status = 'pending'
                 WHERE status = 'error'
                   AND (last_reviewed_at IS NULL OR last_reviewed_at < ?1)",
                params![cutoff],
            )
            .context("Failed to reset error PRs")?;
        Ok(affected)
    }

    /// Identities whose title or author has never been filled in.
    pub fn missing_metadata(&self) -> Result<Vec<PrId>> {
        self.select_ids(
            "SELECT repo_owner, repo_name, pr_number FROM prs
             WHERE (title IS NULL OR title = '') OR (author IS NULL OR author = '')",
        )
    }

    /// Identities with no recorded creation time.
    pub fn missing_created_at(&self) -> Result<Vec<PrId>> {
        self.select_ids(
            "SELECT repo_owner, repo_name, pr_number FROM prs WHERE created_at IS NULL",
        )
    }

    fn select_ids(&self, query: &str) -> Result<Vec<PrId>> {
        let conn = self.conn.lock().expect("mutex poisoned");
        let mut stmt = conn.prepare(query).context("Failed to prepare id query")?;
        let rows = stmt
            .query_map([], |row| {
                Ok(PrId {
                    repo_owner: row.get(0)?,
                    repo_name: row.get(1)?,
                    pr_number: row.get::<_, i64>(2)? as u64,
                })
            })
            .context("Failed to query ids")?;

        let mut ids = Vec::new();
        for row in rows {
            ids.push(row.context("Failed to read id row")?);
        }
        Ok(ids)
    }

    pub fn update_metadata(&self, id: &PrId, title: &str, author: &str) -> Result<()> {
        let conn = self.conn.lock().expect("mutex poisoned");
        conn.execute(
            "UPDATE prs SET title = ?4, author = ?5
             WHERE repo_owner = ?1 AND repo_name = ?2 AND pr_number = ?3",
            params![id.repo_owner, id.repo_name, id.pr_number as i64, title, author],
        )
        .context("Failed to update PR metadata")?;
        Ok(())
    }

    pub fn update_created_at(&self, id: &PrId, created_at: DateTime<Utc>) -> Result<()> {
        let conn = self.conn.lock().expect("mutex poisoned");
        conn.execute(
            "UPDATE prs SET created_at = ?4
             WHERE repo_owner = ?1 AND repo_name = ?2 AND pr_number = ?3",
            params![id.repo_owner, id.repo_name, id.pr_number as i64, created_at],
        )
        .context("Failed to update PR created_at")?;
        Ok(())
    }

    /// Update only the user-editable notes column. Truncated to
    /// [`NOTES_MAX_CHARS`] as a defensive measure; the HTTP layer rejects
    /// longer inputs before they get here.
    pub fn update_notes(&self, id: &PrId, notes: &str) -> Result<()> {
        let notes: String = notes.chars().take(NOTES_MAX_CHARS).collect();
        let conn = self.conn.lock().expect("mutex poisoned");
        conn.execute(
            "UPDATE prs SET notes = ?4
             WHERE repo_owner = ?1 AND repo_name = ?2 AND pr_number = ?3",
            params![id.repo_owner, id.repo_name, id.pr_number as i64, notes],
        )
        .context("Failed to update PR notes")?;
        Ok(())
    }

    /// Refresh the remote-derived review columns for an existing row.
    /// Draft is always written from the fresh remote value. Returns false
    /// when the identity is not tracked (the update is skipped, not an error).
    #[allow(clippy::too_many_arguments)]
    pub fn update_review_data(
        &self,
        id: &PrId,
        approval_count: i64,
        my_review_status: &str,
        draft: bool,
        ci_state: &str,
        ci_failed_checks: &str,
    ) -> Result<bool> {
        let conn = self.conn.lock().expect("mutex poisoned");
        let affected = conn
            .execute(
                "UPDATE prs
                 SET approval_count = ?4,
                     my_review_status = ?5,
                     draft = ?6,
                     ci_state = ?7,
                     ci_failed_checks = ?8
                 WHERE repo_owner = ?1 AND repo_name = ?2 AND pr_number = ?3",
                params![
                    id.repo_owner,
                    id.repo_name,
                    id.pr_number as i64,
                    approval_count,
                    my_review_status,
                    draft,
                    ci_state,
                    ci_failed_checks,
                ],
            )
            .context("Failed to update PR review data")?;
        Ok(affected > 0)
    }

    #[cfg(test)]
    pub(crate) fn raw_execute(&self, sql: &str, params: &[&dyn rusqlite::ToSql]) -> Result<usize> {
        let conn = self.conn.lock().expect("mutex poisoned");
        conn.execute(sql, params).context("raw execute failed")
    }
}

fn is_duplicate_column(err: &rusqlite::Error) -> bool {
    err.to_string().contains("duplicate column")
}

fn map_row(row: &Row<'_>) -> rusqlite::Result<TrackedPr> {
    Ok(TrackedPr {
        id: PrId {
            repo_owner: row.get(0)?,
            repo_name: row.get(1)?,
            pr_number: row.get::<_, i64>(2)? as u64,
        },
        head_sha: row.get(3)?,
        last_reviewed_at: row.get(4)?,
        artifact_path: row.get::<_, Option<String>>(5)?.filter(|p| !p.is_empty()),
        status: PrStatus::from_db(&row.get::<_, String>(6)?),
        generating_since: row.get(7)?,
        is_mine: row.get::<_, i64>(8)? != 0,
        title: row.get(9)?,
        author: row.get(10)?,
        approval_count: row.get(11)?,
        my_review_status: row.get(12)?,
        created_at: row.get(13)?,
        draft: row.get::<_, i64>(14)? != 0,
        notes: row.get(15)?,
        ci_state: row.get(16)?,
        ci_failed_checks: row.get(17)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn discovered(owner: &str, repo: &str, number: u64, sha: &str) -> DiscoveredPr {
        DiscoveredPr {
            id: PrId::new(owner, repo, number),
            head_sha: sha.to_string(),
            title: format!("PR #{}", number),
            author: "alice".to_string(),
            created_at: Some(Utc::now()),
            draft: false,
            is_mine: false,
        }
    }

    #[test]
    fn test_new_in_memory_starts_empty() {
        let db = Db::new_in_memory().expect("should create db");
        assert!(db.list_all().expect("should list").is_empty());
    }

    #[test]
    fn test_migrations_are_idempotent() {
        let dir = tempfile::tempdir().expect("should create temp dir");
        let path = dir.path().join("prs.db");
        {
            let _db = Db::new(&path).expect("first open should succeed");
        }
        {
            let _db = Db::new(&path).expect("second open should succeed");
        }
    }

    #[test]
    fn test_upsert_inserts_pending() {
        let db = Db::new_in_memory().expect("should create db");
        let pr = discovered("acme", "foo", 7, "sha-a");
        db.upsert(&pr).expect("should upsert");

        let row = db.get(&pr.id).expect("should get").expect("row exists");
        assert_eq!(row.status, PrStatus::Pending);
        assert_eq!(row.head_sha, "sha-a");
        assert_eq!(row.title, "PR #7");
        assert_eq!(row.author, "alice");
        assert!(row.artifact_path.is_none());
    }

    #[test]
    fn test_upsert_does_not_clobber_completed_sha_or_status() {
        let db = Db::new_in_memory().expect("should create db");
        let pr = discovered("acme", "foo", 7, "sha-a");
        db.upsert(&pr).expect("should upsert");
        db.set_generating(&pr.id, "sha-a", "PR #7", "alice", false, None, false)
            .expect("should set generating");
        assert!(db
            .mark_completed(&pr.id, "sha-a", "acme_foo_7.html")
            .expect("should complete"));

        // A second discovery with a newer sha must not touch status or sha:
        // outdated-artifact detection owns that transition.
        let newer = discovered("acme", "foo", 7, "sha-b");
        db.upsert(&newer).expect("should upsert");

        let row = db.get(&pr.id).expect("should get").expect("row exists");
        assert_eq!(row.status, PrStatus::Completed);
        assert_eq!(row.head_sha, "sha-a");
    }

    #[test]
    fn test_upsert_refreshes_sha_while_pending() {
        let db = Db::new_in_memory().expect("should create db");
        db.upsert(&discovered("acme", "foo", 7, "sha-a"))
            .expect("should upsert");
        db.upsert(&discovered("acme", "foo", 7, "sha-b"))
            .expect("should upsert");

        let row = db
            .get(&PrId::new("acme", "foo", 7))
            .expect("should get")
            .expect("row exists");
        assert_eq!(row.head_sha, "sha-b");
        assert_eq!(row.status, PrStatus::Pending);
    }

    #[test]
    fn test_set_generating_stamps_generating_since() {
        let db = Db::new_in_memory().expect("should create db");
        let id = PrId::new("acme", "foo", 7);
        db.set_generating(&id, "sha-a", "Add X", "alice", false, Some(Utc::now()), false)
            .expect("should set generating");

        let row = db.get(&id).expect("should get").expect("row exists");
        assert_eq!(row.status, PrStatus::Generating);
        assert!(row.generating_since.is_some());
        assert!(row.artifact_path.is_none());
    }

    #[test]
    fn test_mark_completed_guards_on_head_sha() {
        let db = Db::new_in_memory().expect("should create db");
        let id = PrId::new("acme", "foo", 7);
        db.set_generating(&id, "sha-a", "Add X", "alice", false, None, false)
            .expect("should set generating");

        // Reconciler invalidated the work mid-flight.
        db.reset_to_outdated(&id, "sha-b").expect("should reset");

        // Completion spawned against sha-a must be rejected.
        let accepted = db
            .mark_completed(&id, "sha-a", "acme_foo_7.html")
            .expect("should run update");
        assert!(!accepted);

        let row = db.get(&id).expect("should get").expect("row exists");
        assert_eq!(row.status, PrStatus::Pending);
        assert_eq!(row.head_sha, "sha-b");
        assert!(row.artifact_path.is_none());
        assert!(row.last_reviewed_at.is_none());
    }

    #[test]
    fn test_mark_completed_sets_artifact_and_timestamp() {
        let db = Db::new_in_memory().expect("should create db");
        let id = PrId::new("acme", "foo", 7);
        db.set_generating(&id, "sha-a", "Add X", "alice", false, None, false)
            .expect("should set generating");

        let accepted = db
            .mark_completed(&id, "sha-a", "acme_foo_7.html")
            .expect("should complete");
        assert!(accepted);

        let row = db.get(&id).expect("should get").expect("row exists");
        assert_eq!(row.status, PrStatus::Completed);
        assert_eq!(row.artifact_path.as_deref(), Some("acme_foo_7.html"));
        assert!(row.last_reviewed_at.is_some());
        assert!(row.generating_since.is_none());
    }

    #[test]
    fn test_mark_error_respects_invalidation_carve_out() {
        let db = Db::new_in_memory().expect("should create db");
        let id = PrId::new("acme", "foo", 7);
        db.set_generating(&id, "sha-a", "Add X", "alice", false, None, false)
            .expect("should set generating");
        db.reset_to_outdated(&id, "sha-b").expect("should reset");

        // The generator (spawned against sha-a) failed, but the row was
        // already re-queued with sha-b: leave it alone.
        let marked = db
            .mark_error_unless_invalidated(&id, "sha-a")
            .expect("should run update");
        assert!(!marked);
        let row = db.get(&id).expect("should get").expect("row exists");
        assert_eq!(row.status, PrStatus::Pending);

        // A genuine failure with the sha unchanged does mark the row.
        db.set_generating(&id, "sha-b", "Add X", "alice", false, None, false)
            .expect("should set generating");
        let marked = db
            .mark_error_unless_invalidated(&id, "sha-b")
            .expect("should run update");
        assert!(marked);
        let row = db.get(&id).expect("should get").expect("row exists");
        assert_eq!(row.status, PrStatus::Error);
    }

    #[test]
    fn test_reset_stale_generating() {
        let db = Db::new_in_memory().expect("should create db");
        let id = PrId::new("acme", "foo", 7);
        db.set_generating(&id, "sha-a", "Add X", "alice", false, None, false)
            .expect("should set generating");

        // A fresh task is not stale.
        let healed = db
            .reset_stale_generating(Duration::from_secs(120))
            .expect("should run heal");
        assert_eq!(healed, 0);

        // Backdate the row to simulate a crash three minutes ago.
        let old = Utc::now() - chrono::Duration::minutes(3);
        db.raw_execute(
            "UPDATE prs SET generating_since = ?1 WHERE pr_number = 7",
            &[&old],
        )
        .expect("should backdate");

        let healed = db
            .reset_stale_generating(Duration::from_secs(120))
            .expect("should run heal");
        assert_eq!(healed, 1);
        let row = db.get(&id).expect("should get").expect("row exists");
        assert_eq!(row.status, PrStatus::Pending);
        assert!(row.generating_since.is_none());
    }

    #[test]
    fn test_reset_stale_generating_heals_null_timestamp() {
        let db = Db::new_in_memory().expect("should create db");
        let id = PrId::new("acme", "foo", 7);
        db.set_generating(&id, "sha-a", "Add X", "alice", false, None, false)
            .expect("should set generating");
        db.raw_execute(
            "UPDATE prs SET generating_since = NULL WHERE pr_number = 7",
            &[],
        )
        .expect("should clear timestamp");

        let healed = db
            .reset_stale_generating(Duration::from_secs(120))
            .expect("should run heal");
        assert_eq!(healed, 1);
        assert_eq!(
            db.get(&id).unwrap().unwrap().status,
            PrStatus::Pending
        );
    }

    #[test]
    fn test_reset_error_treats_null_reviewed_at_as_old() {
        let db = Db::new_in_memory().expect("should create db");
        let id = PrId::new("acme", "foo", 7);
        db.set_generating(&id, "sha-a", "Add X", "alice", false, None, false)
            .expect("should set generating");
        db.mark_error_unless_invalidated(&id, "sha-a")
            .expect("should mark error");

        let reset = db
            .reset_error(Duration::from_secs(300))
            .expect("should run reset");
        assert_eq!(reset, 1);
        assert_eq!(db.get(&id).unwrap().unwrap().status, PrStatus::Pending);
    }

    #[test]
    fn test_reset_error_keeps_recent_completions() {
        let db = Db::new_in_memory().expect("should create db");
        let id = PrId::new("acme", "foo", 7);
        db.set_generating(&id, "sha-a", "Add X", "alice", false, None, false)
            .expect("should set generating");
        db.mark_completed(&id, "sha-a", "acme_foo_7.html")
            .expect("should complete");
        db.raw_execute("UPDATE prs SET status = 'error' WHERE pr_number = 7", &[])
            .expect("should force error");

        // last_reviewed_at was stamped moments ago, so the row is too young.
        let reset = db
            .reset_error(Duration::from_secs(300))
            .expect("should run reset");
        assert_eq!(reset, 0);
    }

    #[test]
    fn test_reset_missing_artifact_only_touches_completed() {
        let db = Db::new_in_memory().expect("should create db");
        let id = PrId::new("acme", "foo", 7);
        db.set_generating(&id, "sha-a", "Add X", "alice", false, None, false)
            .expect("should set generating");

        assert!(!db.reset_missing_artifact(&id).expect("should run"));

        db.mark_completed(&id, "sha-a", "acme_foo_7.html")
            .expect("should complete");
        assert!(db.reset_missing_artifact(&id).expect("should run"));

        let row = db.get(&id).expect("should get").expect("row exists");
        assert_eq!(row.status, PrStatus::Pending);
        assert_eq!(row.head_sha, "sha-a");
        assert!(row.artifact_path.is_none());
    }

    #[test]
    fn test_delete_is_idempotent() {
        let db = Db::new_in_memory().expect("should create db");
        let id = PrId::new("acme", "foo", 7);
        db.upsert(&discovered("acme", "foo", 7, "sha-a"))
            .expect("should upsert");

        assert!(db.delete(&id).expect("should delete"));
        assert!(!db.delete(&id).expect("should delete again"));
        assert!(db.get(&id).expect("should get").is_none());
    }

    #[test]
    fn test_list_all_ordering() {
        let db = Db::new_in_memory().expect("should create db");
        let now = Utc::now();

        // Mine, newest — sorts after all non-mine rows.
        let mut mine = discovered("acme", "foo", 1, "s1");
        mine.is_mine = true;
        mine.created_at = Some(now);
        db.upsert(&mine).expect("should upsert");

        // Not mine, older.
        let mut old = discovered("acme", "foo", 2, "s2");
        old.created_at = Some(now - chrono::Duration::days(2));
        db.upsert(&old).expect("should upsert");

        // Not mine, newest.
        let mut new = discovered("acme", "foo", 3, "s3");
        new.created_at = Some(now - chrono::Duration::hours(1));
        db.upsert(&new).expect("should upsert");

        // Not mine, no created_at — sorts last among non-mine.
        let mut unknown = discovered("acme", "foo", 4, "s4");
        unknown.created_at = None;
        db.upsert(&unknown).expect("should upsert");

        let rows = db.list_all().expect("should list");
        let numbers: Vec<u64> = rows.iter().map(|r| r.id.pr_number).collect();
        assert_eq!(numbers, vec![3, 2, 4, 1]);
    }

    #[test]
    fn test_list_all_status_tie_break() {
        let db = Db::new_in_memory().expect("should create db");
        let created = Some(Utc::now());

        for (number, status) in [(1, "completed"), (2, "generating"), (3, "pending")] {
            let mut pr = discovered("acme", "foo", number, "s");
            pr.created_at = created;
            db.upsert(&pr).expect("should upsert");
            db.raw_execute(
                "UPDATE prs SET status = ?1 WHERE pr_number = ?2",
                &[&status, &(number as i64)],
            )
            .expect("should set status");
        }

        let rows = db.list_all().expect("should list");
        let numbers: Vec<u64> = rows.iter().map(|r| r.id.pr_number).collect();
        assert_eq!(numbers, vec![2, 3, 1]);
    }

    #[test]
    fn test_missing_metadata_projection() {
        let db = Db::new_in_memory().expect("should create db");
        let mut no_title = discovered("acme", "foo", 1, "s1");
        no_title.title = String::new();
        db.upsert(&no_title).expect("should upsert");
        db.upsert(&discovered("acme", "foo", 2, "s2"))
            .expect("should upsert");

        let ids = db.missing_metadata().expect("should project");
        assert_eq!(ids, vec![PrId::new("acme", "foo", 1)]);

        db.update_metadata(&ids[0], "Add X", "alice")
            .expect("should update");
        assert!(db.missing_metadata().expect("should project").is_empty());
    }

    #[test]
    fn test_missing_created_at_projection() {
        let db = Db::new_in_memory().expect("should create db");
        let mut pr = discovered("acme", "foo", 1, "s1");
        pr.created_at = None;
        db.upsert(&pr).expect("should upsert");

        let ids = db.missing_created_at().expect("should project");
        assert_eq!(ids, vec![PrId::new("acme", "foo", 1)]);

        db.update_created_at(&ids[0], Utc::now())
            .expect("should update");
        assert!(db.missing_created_at().expect("should project").is_empty());
    }

    #[test]
    fn test_update_notes_truncates_defensively() {
        let db = Db::new_in_memory().expect("should create db");
        let id = PrId::new("acme", "foo", 7);
        db.upsert(&discovered("acme", "foo", 7, "s"))
            .expect("should upsert");

        db.update_notes(&id, "hello world!!").expect("should update");
        assert_eq!(db.get(&id).unwrap().unwrap().notes, "hello world!!");

        db.update_notes(&id, "exactly-fifteen-and-then-some")
            .expect("should update");
        assert_eq!(db.get(&id).unwrap().unwrap().notes.chars().count(), 15);
    }

    #[test]
    fn test_update_review_data_requires_existing_row() {
        let db = Db::new_in_memory().expect("should create db");
        let id = PrId::new("acme", "foo", 7);

        let updated = db
            .update_review_data(&id, 2, "APPROVED", false, "success", "[]")
            .expect("should run update");
        assert!(!updated);

        db.upsert(&discovered("acme", "foo", 7, "s"))
            .expect("should upsert");
        let updated = db
            .update_review_data(&id, 2, "APPROVED", true, "failure", "[\"build\"]")
            .expect("should run update");
        assert!(updated);

        let row = db.get(&id).expect("should get").expect("row exists");
        assert_eq!(row.approval_count, 2);
        assert_eq!(row.my_review_status, "APPROVED");
        assert!(row.draft);
        assert_eq!(row.ci_state, "failure");
        assert_eq!(row.ci_failed_checks, "[\"build\"]");
    }
}
