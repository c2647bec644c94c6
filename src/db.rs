use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use crate::github::RepoData;

/// Where a repo stands in the collection lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CollectionStatus {
    Active,
    /// Failed transiently; eligible again after `next_retry_at`
    Retrying,
    /// No longer resolves upstream; excluded until reset
    NotFound,
    /// Too many consecutive failures; excluded until reset
    Unreachable,
}

impl CollectionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CollectionStatus::Active => "active",
            CollectionStatus::Retrying => "retrying",
            CollectionStatus::NotFound => "not_found",
            CollectionStatus::Unreachable => "unreachable",
        }
    }

    fn parse(s: &str) -> Self {
        match s {
            "retrying" => CollectionStatus::Retrying,
            "not_found" => CollectionStatus::NotFound,
            "unreachable" => CollectionStatus::Unreachable,
            _ => CollectionStatus::Active,
        }
    }
}

/// Stub until the first successful lookup assigns the GitHub id
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RepoLifecycle {
    Stub,
    Complete,
}

/// Stored repository
#[allow(dead_code)]
#[derive(Debug, Clone, PartialEq)]
pub struct TrackedRepo {
    pub github_id: Option<i64>,
    pub full_name: String,
    pub description: Option<String>,
    pub homepage: Option<String>,
    pub language: Option<String>,
    pub topics: Vec<String>,
    pub license: Option<String>,
    pub default_branch: Option<String>,
    pub stars: u64,
    pub forks: u64,
    pub watchers: u64,
    pub open_issues: u64,
    pub size: u64,
    pub is_fork: bool,
    pub is_archived: bool,
    pub is_disabled: bool,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
    pub pushed_at: Option<DateTime<Utc>>,
    pub discovered_at: DateTime<Utc>,
    pub last_snapshot_at: Option<DateTime<Utc>>,
    /// How the repo was found; stored and returned untouched
    pub discovery_context: Option<serde_json::Value>,
    pub status: CollectionStatus,
    pub consecutive_failures: u32,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub failure_reason: Option<String>,
}

impl TrackedRepo {
    /// An unresolved repo known only by name
    pub fn stub(full_name: &str, discovered_at: DateTime<Utc>) -> Self {
        Self {
            github_id: None,
            full_name: full_name.to_string(),
            description: None,
            homepage: None,
            language: None,
            topics: Vec::new(),
            license: None,
            default_branch: None,
            stars: 0,
            forks: 0,
            watchers: 0,
            open_issues: 0,
            size: 0,
            is_fork: false,
            is_archived: false,
            is_disabled: false,
            created_at: None,
            updated_at: None,
            pushed_at: None,
            discovered_at,
            last_snapshot_at: None,
            discovery_context: None,
            status: CollectionStatus::Active,
            consecutive_failures: 0,
            next_retry_at: None,
            failure_reason: None,
        }
    }

    pub fn lifecycle(&self) -> RepoLifecycle {
        match self.github_id {
            Some(_) => RepoLifecycle::Complete,
            None => RepoLifecycle::Stub,
        }
    }
}

/// One immutable observation
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct Snapshot {
    pub github_id: i64,
    pub stars: u64,
    pub forks: u64,
    pub watchers: u64,
    pub open_issues: u64,
    pub size: u64,
    pub recorded_at: DateTime<Utc>,
}

/// Result of writing fetched data into the repos table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    /// A stub received its id (or a brand-new row was written)
    Promoted,
    /// An existing complete row was updated
    Refreshed,
    /// The looked-up name belongs to a different, already-complete repo
    NameConflict,
}

#[derive(Debug, Default, Clone, PartialEq, Eq, serde::Serialize)]
pub struct StoreStats {
    pub tracked: usize,
    pub stubs: usize,
    pub retrying: usize,
    pub excluded: usize,
    pub snapshots: usize,
}

const REPO_COLUMNS: &str = "github_id, full_name, description, homepage, language, topics,
    license, default_branch, stars, forks, watchers, open_issues, size,
    is_fork, is_archived, is_disabled, created_at, updated_at, pushed_at,
    discovered_at, last_snapshot_at, discovery_context,
    status, consecutive_failures, next_retry_at, failure_reason";

/// Matches a row by GitHub id when known, else by name (?1 = id, ?2 = name)
const KEY_CLAUSE: &str = "((?1 IS NOT NULL AND github_id = ?1) OR (?1 IS NULL AND full_name = ?2))";

fn row_to_repo(row: &Row) -> rusqlite::Result<TrackedRepo> {
    let topics: Option<String> = row.get(5)?;
    let context: Option<String> = row.get(21)?;
    let status: String = row.get(22)?;
    Ok(TrackedRepo {
        github_id: row.get(0)?,
        full_name: row.get(1)?,
        description: row.get(2)?,
        homepage: row.get(3)?,
        language: row.get(4)?,
        topics: topics
            .and_then(|t| serde_json::from_str(&t).ok())
            .unwrap_or_default(),
        license: row.get(6)?,
        default_branch: row.get(7)?,
        stars: row.get::<_, i64>(8)?.max(0) as u64,
        forks: row.get::<_, i64>(9)?.max(0) as u64,
        watchers: row.get::<_, i64>(10)?.max(0) as u64,
        open_issues: row.get::<_, i64>(11)?.max(0) as u64,
        size: row.get::<_, i64>(12)?.max(0) as u64,
        is_fork: row.get(13)?,
        is_archived: row.get(14)?,
        is_disabled: row.get(15)?,
        created_at: row.get(16)?,
        updated_at: row.get(17)?,
        pushed_at: row.get(18)?,
        discovered_at: row.get(19)?,
        last_snapshot_at: row.get(20)?,
        discovery_context: context.and_then(|c| serde_json::from_str(&c).ok()),
        status: CollectionStatus::parse(&status),
        consecutive_failures: row.get::<_, i64>(23)?.max(0) as u32,
        next_retry_at: row.get(24)?,
        failure_reason: row.get(25)?,
    })
}

/// SQLite-backed entity and snapshot store.
///
/// Every method takes the connection lock for its own statements only, so the
/// store can be shared between a running collection and HTTP handlers.
pub struct Database {
    conn: Mutex<Connection>,
    path: PathBuf,
}

impl Database {
    pub fn open(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).with_context(|| {
                    format!("Failed to create data directory: {}", parent.display())
                })?;
            }
        }

        let conn = Connection::open(db_path)
            .with_context(|| format!("Failed to open database: {}", db_path.display()))?;

        // Overlapping runs (CLI + server) write to the same file
        conn.busy_timeout(std::time::Duration::from_secs(30))?;

        let db = Self {
            conn: Mutex::new(conn),
            path: db_path.to_path_buf(),
        };
        db.init()?;
        Ok(db)
    }

    /// Open an in-memory database for testing
    #[cfg(test)]
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory database")?;
        let db = Self {
            conn: Mutex::new(conn),
            path: PathBuf::from(":memory:"),
        };
        db.init()?;
        Ok(db)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        // A panic mid-statement leaves SQLite itself consistent
        self.conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn init(&self) -> Result<()> {
        self.conn().execute_batch(
            "
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            PRAGMA temp_store = MEMORY;

            CREATE TABLE IF NOT EXISTS repos (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                github_id INTEGER UNIQUE,
                full_name TEXT NOT NULL UNIQUE COLLATE NOCASE,
                description TEXT,
                homepage TEXT,
                language TEXT,
                topics TEXT,
                license TEXT,
                default_branch TEXT,
                stars INTEGER NOT NULL DEFAULT 0,
                forks INTEGER NOT NULL DEFAULT 0,
                watchers INTEGER NOT NULL DEFAULT 0,
                open_issues INTEGER NOT NULL DEFAULT 0,
                size INTEGER NOT NULL DEFAULT 0,
                is_fork INTEGER NOT NULL DEFAULT 0,
                is_archived INTEGER NOT NULL DEFAULT 0,
                is_disabled INTEGER NOT NULL DEFAULT 0,
                created_at TEXT,
                updated_at TEXT,
                pushed_at TEXT,
                discovered_at TEXT NOT NULL,
                last_snapshot_at TEXT,
                discovery_context TEXT,
                status TEXT NOT NULL DEFAULT 'active',
                consecutive_failures INTEGER NOT NULL DEFAULT 0,
                next_retry_at TEXT,
                failure_reason TEXT
            );

            CREATE INDEX IF NOT EXISTS idx_repos_status ON repos(status);
            CREATE INDEX IF NOT EXISTS idx_repos_stars ON repos(stars DESC);

            -- Append-only; overlapping runs may legitimately write duplicates
            CREATE TABLE IF NOT EXISTS snapshots (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                github_id INTEGER NOT NULL,
                stars INTEGER NOT NULL,
                forks INTEGER NOT NULL,
                watchers INTEGER NOT NULL,
                open_issues INTEGER NOT NULL,
                size INTEGER NOT NULL,
                recorded_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_snapshots_repo_time ON snapshots(github_id, recorded_at);
            ",
        )?;
        Ok(())
    }

    /// Add a repo stub (just the name), case-insensitive dedup.
    /// Returns true if inserted, false if the name was already tracked.
    pub fn add_repo_stub(&self, full_name: &str, context: Option<&serde_json::Value>) -> Result<bool> {
        let context_json = context.map(|c| c.to_string());
        let inserted = self.conn().execute(
            "INSERT OR IGNORE INTO repos (full_name, discovered_at, discovery_context)
             VALUES (?1, ?2, ?3)",
            params![full_name, Utc::now(), context_json],
        )?;
        Ok(inserted > 0)
    }

    /// Bulk add repo stubs in one transaction. Returns (inserted, skipped).
    pub fn add_repo_stubs_bulk(
        &self,
        names: &[String],
        context: Option<&serde_json::Value>,
    ) -> Result<(usize, usize)> {
        if names.is_empty() {
            return Ok((0, 0));
        }

        let now = Utc::now();
        let context_json = context.map(|c| c.to_string());
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        let mut inserted = 0;
        {
            let mut stmt = tx.prepare(
                "INSERT OR IGNORE INTO repos (full_name, discovered_at, discovery_context)
                 VALUES (?1, ?2, ?3)",
            )?;
            for name in names {
                inserted += stmt.execute(params![name, now, context_json])?;
            }
        }
        tx.commit()?;
        Ok((inserted, names.len() - inserted))
    }

    /// Every tracked repo (the selector does the filtering)
    pub fn load_tracked(&self) -> Result<Vec<TrackedRepo>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!("SELECT {} FROM repos ORDER BY id", REPO_COLUMNS))?;
        let results = stmt.query_map([], row_to_repo)?;
        results.collect::<Result<Vec<_>, _>>().map_err(Into::into)
    }

    pub fn get_repo(&self, full_name: &str) -> Result<Option<TrackedRepo>> {
        let conn = self.conn();
        let repo = conn
            .query_row(
                &format!("SELECT {} FROM repos WHERE full_name = ?1", REPO_COLUMNS),
                params![full_name],
                row_to_repo,
            )
            .optional()?;
        Ok(repo)
    }

    /// Write freshly fetched data for the repo that was looked up as `lookup_name`.
    ///
    /// Rows are keyed by GitHub id once known. A stub is promoted through the
    /// name uniqueness constraint; the id of a complete row is never replaced.
    /// Clears any failure state.
    pub fn upsert_resolved(&self, lookup_name: &str, repo: &RepoData) -> Result<UpsertOutcome> {
        let topics_json = serde_json::to_string(&repo.topics)?;
        let now = Utc::now();
        let mut conn = self.conn();
        let tx = conn.transaction()?;

        let existing: Option<i64> = tx
            .query_row(
                "SELECT id FROM repos WHERE github_id = ?1",
                params![repo.github_id],
                |row| row.get(0),
            )
            .optional()?;

        let counters = [
            repo.stars as i64,
            repo.forks as i64,
            repo.watchers as i64,
            repo.open_issues as i64,
            repo.size as i64,
        ];
        // ?20 (discovered_at) is only bound for inserts
        let data = params![
            repo.github_id,
            lookup_name,
            repo.description,
            repo.homepage,
            repo.language,
            topics_json,
            repo.license,
            repo.default_branch,
            counters[0],
            counters[1],
            counters[2],
            counters[3],
            counters[4],
            repo.is_fork,
            repo.is_archived,
            repo.is_disabled,
            repo.created_at,
            repo.updated_at,
            repo.pushed_at,
            now,
        ];

        let (row_id, outcome) = match existing {
            Some(row_id) => {
                tx.execute(
                    "UPDATE repos SET
                        description = ?3, homepage = ?4, language = ?5, topics = ?6,
                        license = ?7, default_branch = ?8,
                        stars = ?9, forks = ?10, watchers = ?11, open_issues = ?12, size = ?13,
                        is_fork = ?14, is_archived = ?15, is_disabled = ?16,
                        created_at = ?17, updated_at = ?18, pushed_at = ?19,
                        status = 'active', consecutive_failures = 0,
                        next_retry_at = NULL, failure_reason = NULL
                     WHERE github_id = ?1",
                    &data[..19],
                )?;
                // A second stub for a name we already track under its id
                tx.execute(
                    "DELETE FROM repos WHERE full_name = ?1 AND github_id IS NULL",
                    params![lookup_name],
                )?;
                (row_id, UpsertOutcome::Refreshed)
            }
            None => {
                let written = tx.execute(
                    "INSERT INTO repos (
                        github_id, full_name, description, homepage, language, topics,
                        license, default_branch, stars, forks, watchers, open_issues, size,
                        is_fork, is_archived, is_disabled, created_at, updated_at, pushed_at,
                        discovered_at
                     ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19, ?20)
                     ON CONFLICT(full_name) DO UPDATE SET
                        github_id = excluded.github_id,
                        description = excluded.description,
                        homepage = excluded.homepage,
                        language = excluded.language,
                        topics = excluded.topics,
                        license = excluded.license,
                        default_branch = excluded.default_branch,
                        stars = excluded.stars,
                        forks = excluded.forks,
                        watchers = excluded.watchers,
                        open_issues = excluded.open_issues,
                        size = excluded.size,
                        is_fork = excluded.is_fork,
                        is_archived = excluded.is_archived,
                        is_disabled = excluded.is_disabled,
                        created_at = excluded.created_at,
                        updated_at = excluded.updated_at,
                        pushed_at = excluded.pushed_at,
                        status = 'active',
                        consecutive_failures = 0,
                        next_retry_at = NULL,
                        failure_reason = NULL
                     WHERE repos.github_id IS NULL",
                    data,
                )?;
                if written == 0 {
                    tx.commit()?;
                    return Ok(UpsertOutcome::NameConflict);
                }
                let row_id: i64 = tx.query_row(
                    "SELECT id FROM repos WHERE github_id = ?1",
                    params![repo.github_id],
                    |row| row.get(0),
                )?;
                (row_id, UpsertOutcome::Promoted)
            }
        };

        // Follow renames (and upstream capitalisation) when the name is free
        let current: String =
            tx.query_row("SELECT full_name FROM repos WHERE id = ?1", params![row_id], |row| {
                row.get(0)
            })?;
        if current != repo.full_name {
            let holder: Option<(i64, Option<i64>)> = tx
                .query_row(
                    "SELECT id, github_id FROM repos WHERE full_name = ?1 AND id != ?2",
                    params![repo.full_name, row_id],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()?;
            let free = match holder {
                None => true,
                Some((stub_id, None)) => {
                    tx.execute("DELETE FROM repos WHERE id = ?1", params![stub_id])?;
                    true
                }
                Some((_, Some(other))) => {
                    tracing::warn!(
                        "{} is now {}, but that name is held by repo id {}; keeping old name",
                        current,
                        repo.full_name,
                        other
                    );
                    false
                }
            };
            if free {
                tx.execute(
                    "UPDATE repos SET full_name = ?1 WHERE id = ?2",
                    params![repo.full_name, row_id],
                )?;
            }
        }

        tx.commit()?;
        Ok(outcome)
    }

    /// Append one snapshot and mark the repo as freshly measured
    pub fn append_snapshot(&self, snapshot: &Snapshot) -> Result<()> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO snapshots (github_id, stars, forks, watchers, open_issues, size, recorded_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                snapshot.github_id,
                snapshot.stars as i64,
                snapshot.forks as i64,
                snapshot.watchers as i64,
                snapshot.open_issues as i64,
                snapshot.size as i64,
                snapshot.recorded_at,
            ],
        )?;
        tx.execute(
            "UPDATE repos SET last_snapshot_at = ?2 WHERE github_id = ?1",
            params![snapshot.github_id, snapshot.recorded_at],
        )?;
        tx.commit()?;
        Ok(())
    }

    /// Permanently exclude a repo that no longer resolves
    pub fn mark_not_found(&self, github_id: Option<i64>, full_name: &str, reason: &str) -> Result<bool> {
        let rows = self.conn().execute(
            &format!(
                "UPDATE repos SET status = 'not_found', next_retry_at = NULL, failure_reason = ?3
                 WHERE {}",
                KEY_CLAUSE
            ),
            params![github_id, full_name, reason],
        )?;
        Ok(rows > 0)
    }

    /// Bump the consecutive failure counter, returning the new value
    pub fn increment_failures(&self, github_id: Option<i64>, full_name: &str) -> Result<Option<u32>> {
        let count: Option<i64> = self
            .conn()
            .query_row(
                &format!(
                    "UPDATE repos SET consecutive_failures = consecutive_failures + 1
                     WHERE {} RETURNING consecutive_failures",
                    KEY_CLAUSE
                ),
                params![github_id, full_name],
                |row| row.get(0),
            )
            .optional()?;
        Ok(count.map(|c| c.max(0) as u32))
    }

    pub fn set_failure_state(
        &self,
        github_id: Option<i64>,
        full_name: &str,
        status: CollectionStatus,
        next_retry_at: Option<DateTime<Utc>>,
        reason: &str,
    ) -> Result<()> {
        self.conn().execute(
            &format!(
                "UPDATE repos SET status = ?3, next_retry_at = ?4, failure_reason = ?5 WHERE {}",
                KEY_CLAUSE
            ),
            params![github_id, full_name, status.as_str(), next_retry_at, reason],
        )?;
        Ok(())
    }

    /// Operator reset: make a failed repo selectable again
    pub fn reset_failures(&self, full_name: &str) -> Result<bool> {
        let rows = self.conn().execute(
            "UPDATE repos SET status = 'active', consecutive_failures = 0,
                next_retry_at = NULL, failure_reason = NULL
             WHERE full_name = ?1",
            params![full_name],
        )?;
        Ok(rows > 0)
    }

    /// Most recent snapshots first
    pub fn snapshots_for(&self, github_id: i64, limit: usize) -> Result<Vec<Snapshot>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT github_id, stars, forks, watchers, open_issues, size, recorded_at
             FROM snapshots WHERE github_id = ?1
             ORDER BY recorded_at DESC, id DESC LIMIT ?2",
        )?;
        let results = stmt.query_map(params![github_id, limit as i64], |row| {
            Ok(Snapshot {
                github_id: row.get(0)?,
                stars: row.get::<_, i64>(1)?.max(0) as u64,
                forks: row.get::<_, i64>(2)?.max(0) as u64,
                watchers: row.get::<_, i64>(3)?.max(0) as u64,
                open_issues: row.get::<_, i64>(4)?.max(0) as u64,
                size: row.get::<_, i64>(5)?.max(0) as u64,
                recorded_at: row.get(6)?,
            })
        })?;
        results.collect::<Result<Vec<_>, _>>().map_err(Into::into)
    }

    pub fn stats(&self) -> Result<StoreStats> {
        let conn = self.conn();
        let (tracked, stubs, retrying, excluded): (i64, i64, i64, i64) = conn.query_row(
            "SELECT COUNT(*),
                    COALESCE(SUM(github_id IS NULL), 0),
                    COALESCE(SUM(status = 'retrying'), 0),
                    COALESCE(SUM(status IN ('not_found', 'unreachable') OR is_archived = 1 OR is_disabled = 1), 0)
             FROM repos",
            [],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
        )?;
        let snapshots: i64 = conn.query_row("SELECT COUNT(*) FROM snapshots", [], |row| row.get(0))?;
        Ok(StoreStats {
            tracked: tracked as usize,
            stubs: stubs as usize,
            retrying: retrying as usize,
            excluded: excluded as usize,
            snapshots: snapshots as usize,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::github::tests::repo_json;
    use serde_json::json;

    // Helper to create a test database
    fn test_db() -> Database {
        Database::open_in_memory().expect("Failed to create test database")
    }

    fn data(id: i64, full_name: &str, stars: u64) -> RepoData {
        RepoData::from_json(&repo_json(id, full_name, stars)).unwrap()
    }

    fn snapshot_of(repo: &RepoData) -> Snapshot {
        Snapshot {
            github_id: repo.github_id,
            stars: repo.stars,
            forks: repo.forks,
            watchers: repo.watchers,
            open_issues: repo.open_issues,
            size: repo.size,
            recorded_at: Utc::now(),
        }
    }

    // === Stubs ===

    #[test]
    fn test_add_repo_stub() {
        let db = test_db();
        assert!(db.add_repo_stub("owner/repo", None).unwrap());
        assert!(!db.add_repo_stub("owner/repo", None).unwrap());
    }

    #[test]
    fn test_add_repo_stub_case_insensitive() {
        let db = test_db();
        assert!(db.add_repo_stub("Owner/Repo", None).unwrap());
        assert!(!db.add_repo_stub("owner/repo", None).unwrap());
        assert!(!db.add_repo_stub("OWNER/REPO", None).unwrap());

        // Original case is kept for API calls
        let repo = db.get_repo("owner/repo").unwrap().unwrap();
        assert_eq!(repo.full_name, "Owner/Repo");
        assert_eq!(repo.lifecycle(), RepoLifecycle::Stub);
    }

    #[test]
    fn test_add_repo_stubs_bulk() {
        let db = test_db();
        let names = vec![
            "owner1/repo1".to_string(),
            "owner2/repo2".to_string(),
            "owner3/repo3".to_string(),
        ];

        assert_eq!(db.add_repo_stubs_bulk(&names, None).unwrap(), (3, 0));
        assert_eq!(db.add_repo_stubs_bulk(&names, None).unwrap(), (0, 3));
        assert_eq!(db.stats().unwrap().stubs, 3);
    }

    #[test]
    fn test_discovery_context_is_carried_through() {
        let db = test_db();
        let context = json!({ "source": "trending", "page": 2 });
        db.add_repo_stub("a/b", Some(&context)).unwrap();
        db.upsert_resolved("a/b", &data(1, "a/b", 5)).unwrap();

        let repo = db.get_repo("a/b").unwrap().unwrap();
        assert_eq!(repo.discovery_context, Some(context));
    }

    // === Promotion and upsert ===

    #[test]
    fn test_stub_promotion_keeps_single_row() {
        let db = test_db();
        db.add_repo_stub("a/b", None).unwrap();
        let discovered = db.get_repo("a/b").unwrap().unwrap().discovered_at;

        let outcome = db.upsert_resolved("a/b", &data(77, "a/b", 50)).unwrap();
        assert_eq!(outcome, UpsertOutcome::Promoted);

        let stats = db.stats().unwrap();
        assert_eq!(stats.tracked, 1);
        assert_eq!(stats.stubs, 0);

        let repo = db.get_repo("a/b").unwrap().unwrap();
        assert_eq!(repo.github_id, Some(77));
        assert_eq!(repo.stars, 50);
        assert_eq!(repo.language.as_deref(), Some("Rust"));
        assert_eq!(repo.topics, vec!["cli", "sqlite"]);
        assert_eq!(repo.discovered_at, discovered);
        assert_eq!(repo.lifecycle(), RepoLifecycle::Complete);
    }

    #[test]
    fn test_upsert_is_idempotent_but_snapshots_accumulate() {
        let db = test_db();
        db.add_repo_stub("a/b", None).unwrap();
        let fetched = data(5, "a/b", 10);

        db.upsert_resolved("a/b", &fetched).unwrap();
        db.append_snapshot(&snapshot_of(&fetched)).unwrap();
        let second = db.upsert_resolved("a/b", &fetched).unwrap();
        db.append_snapshot(&snapshot_of(&fetched)).unwrap();

        assert_eq!(second, UpsertOutcome::Refreshed);
        let stats = db.stats().unwrap();
        assert_eq!(stats.tracked, 1);
        assert_eq!(stats.snapshots, 2);
    }

    #[test]
    fn test_refresh_updates_metadata() {
        let db = test_db();
        db.upsert_resolved("a/b", &data(5, "a/b", 10)).unwrap();

        let mut fetched = data(5, "a/b", 99);
        fetched.description = Some("Now with a description".into());
        fetched.is_archived = true;
        db.upsert_resolved("a/b", &fetched).unwrap();

        let repo = db.get_repo("a/b").unwrap().unwrap();
        assert_eq!(repo.stars, 99);
        assert_eq!(repo.description.as_deref(), Some("Now with a description"));
        assert!(repo.is_archived);
    }

    #[test]
    fn test_rename_follows_upstream_name() {
        let db = test_db();
        db.add_repo_stub("old/name", None).unwrap();
        db.upsert_resolved("old/name", &data(3, "new/name", 1)).unwrap();

        assert!(db.get_repo("old/name").unwrap().is_none());
        let repo = db.get_repo("new/name").unwrap().unwrap();
        assert_eq!(repo.github_id, Some(3));
    }

    #[test]
    fn test_rename_absorbs_stub_holding_new_name() {
        let db = test_db();
        db.add_repo_stub("old/name", None).unwrap();
        db.add_repo_stub("new/name", None).unwrap();
        db.upsert_resolved("old/name", &data(3, "new/name", 1)).unwrap();

        let stats = db.stats().unwrap();
        assert_eq!(stats.tracked, 1);
        assert_eq!(db.get_repo("new/name").unwrap().unwrap().github_id, Some(3));
    }

    #[test]
    fn test_duplicate_stub_is_merged_into_complete_row() {
        let db = test_db();
        db.upsert_resolved("a/b", &data(3, "a/b", 1)).unwrap();
        db.add_repo_stub("old/alias", None).unwrap();

        // The alias redirects to the repo we already track
        let outcome = db.upsert_resolved("old/alias", &data(3, "a/b", 2)).unwrap();
        assert_eq!(outcome, UpsertOutcome::Refreshed);
        assert_eq!(db.stats().unwrap().tracked, 1);
        assert!(db.get_repo("old/alias").unwrap().is_none());
    }

    #[test]
    fn test_name_reused_by_other_repo_is_conflict() {
        let db = test_db();
        db.upsert_resolved("a/b", &data(1, "a/b", 1)).unwrap();

        let outcome = db.upsert_resolved("a/b", &data(2, "a/b", 1)).unwrap();
        assert_eq!(outcome, UpsertOutcome::NameConflict);
        // The first repo keeps its id
        assert_eq!(db.get_repo("a/b").unwrap().unwrap().github_id, Some(1));
        assert_eq!(db.stats().unwrap().tracked, 1);
    }

    // === Snapshots ===

    #[test]
    fn test_append_snapshot_sets_last_snapshot_at() {
        let db = test_db();
        let fetched = data(9, "a/b", 10);
        db.upsert_resolved("a/b", &fetched).unwrap();
        assert!(db.get_repo("a/b").unwrap().unwrap().last_snapshot_at.is_none());

        let snapshot = snapshot_of(&fetched);
        db.append_snapshot(&snapshot).unwrap();
        let repo = db.get_repo("a/b").unwrap().unwrap();
        assert_eq!(repo.last_snapshot_at, Some(snapshot.recorded_at));
    }

    #[test]
    fn test_snapshots_newest_first() {
        let db = test_db();
        let fetched = data(9, "a/b", 10);
        db.upsert_resolved("a/b", &fetched).unwrap();

        let mut older = snapshot_of(&fetched);
        older.recorded_at = Utc::now() - chrono::Duration::days(1);
        older.stars = 5;
        db.append_snapshot(&older).unwrap();
        db.append_snapshot(&snapshot_of(&fetched)).unwrap();

        let history = db.snapshots_for(9, 10).unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].stars, 10);
        assert_eq!(history[1].stars, 5);
        assert_eq!(db.snapshots_for(9, 1).unwrap().len(), 1);
    }

    // === Failure bookkeeping ===

    #[test]
    fn test_failure_counter_and_reset() {
        let db = test_db();
        db.add_repo_stub("a/b", None).unwrap();

        assert_eq!(db.increment_failures(None, "a/b").unwrap(), Some(1));
        assert_eq!(db.increment_failures(None, "a/b").unwrap(), Some(2));
        assert_eq!(db.increment_failures(None, "missing/repo").unwrap(), None);

        db.set_failure_state(None, "a/b", CollectionStatus::Unreachable, None, "timeouts")
            .unwrap();
        let repo = db.get_repo("a/b").unwrap().unwrap();
        assert_eq!(repo.status, CollectionStatus::Unreachable);
        assert_eq!(repo.failure_reason.as_deref(), Some("timeouts"));
        assert_eq!(db.stats().unwrap().excluded, 1);

        assert!(db.reset_failures("a/b").unwrap());
        let repo = db.get_repo("a/b").unwrap().unwrap();
        assert_eq!(repo.status, CollectionStatus::Active);
        assert_eq!(repo.consecutive_failures, 0);
    }

    #[test]
    fn test_failure_key_prefers_github_id() {
        let db = test_db();
        db.upsert_resolved("a/b", &data(4, "a/b", 1)).unwrap();

        // A stale name still reaches the row through its id
        assert_eq!(db.increment_failures(Some(4), "stale/name").unwrap(), Some(1));
        assert!(db.mark_not_found(Some(4), "stale/name", "gone").unwrap());
        assert_eq!(
            db.get_repo("a/b").unwrap().unwrap().status,
            CollectionStatus::NotFound
        );
    }

    #[test]
    fn test_successful_upsert_clears_failures() {
        let db = test_db();
        db.add_repo_stub("a/b", None).unwrap();
        db.increment_failures(None, "a/b").unwrap();
        db.set_failure_state(
            None,
            "a/b",
            CollectionStatus::Retrying,
            Some(Utc::now()),
            "502",
        )
        .unwrap();

        db.upsert_resolved("a/b", &data(1, "a/b", 1)).unwrap();
        let repo = db.get_repo("a/b").unwrap().unwrap();
        assert_eq!(repo.status, CollectionStatus::Active);
        assert_eq!(repo.consecutive_failures, 0);
        assert!(repo.next_retry_at.is_none());
    }

    #[test]
    fn test_open_creates_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("starwatch.db");
        let db = Database::open(&path).unwrap();
        db.add_repo_stub("a/b", None).unwrap();
        assert!(path.exists());
        assert_eq!(db.path(), path.as_path());
    }
}
