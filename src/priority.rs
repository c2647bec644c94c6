//! Which repos are due for a new snapshot, and in what order.

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::cmp::Reverse;

use crate::db::{CollectionStatus, RepoLifecycle, TrackedRepo};

/// Due-now classification, best first.
///
/// The derived `Ord` follows declaration order, which is the scheduling order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PriorityTier {
    /// Known only by name, never resolved
    Stub,
    /// Discovered inside the fresh window
    Fresh,
    /// Resolved but no snapshot recorded yet
    NeverSnapshotted,
    Stars10k,
    Stars1k,
    Stars100,
    Stars10,
    StarsUnder10,
}

/// Re-snapshot intervals per tier
#[derive(Debug, Clone)]
pub struct PriorityPolicy {
    pub fresh_window: Duration,
    pub interval_10k: Duration,
    pub interval_1k: Duration,
    pub interval_100: Duration,
    pub interval_10: Duration,
    pub interval_under_10: Duration,
}

impl Default for PriorityPolicy {
    fn default() -> Self {
        Self {
            fresh_window: Duration::hours(48),
            interval_10k: Duration::hours(20),
            interval_1k: Duration::hours(22),
            interval_100: Duration::hours(44),
            interval_10: Duration::hours(68),
            interval_under_10: Duration::days(7),
        }
    }
}

impl PriorityPolicy {
    /// Minimum time between snapshots; `None` means always due
    pub fn interval(&self, tier: PriorityTier) -> Option<Duration> {
        match tier {
            PriorityTier::Stub | PriorityTier::Fresh | PriorityTier::NeverSnapshotted => None,
            PriorityTier::Stars10k => Some(self.interval_10k),
            PriorityTier::Stars1k => Some(self.interval_1k),
            PriorityTier::Stars100 => Some(self.interval_100),
            PriorityTier::Stars10 => Some(self.interval_10),
            PriorityTier::StarsUnder10 => Some(self.interval_under_10),
        }
    }

    pub fn classify(&self, repo: &TrackedRepo, now: DateTime<Utc>) -> PriorityTier {
        if repo.lifecycle() == RepoLifecycle::Stub {
            return PriorityTier::Stub;
        }
        if now - repo.discovered_at < self.fresh_window {
            return PriorityTier::Fresh;
        }
        if repo.last_snapshot_at.is_none() {
            return PriorityTier::NeverSnapshotted;
        }
        match repo.stars {
            s if s >= 10_000 => PriorityTier::Stars10k,
            s if s >= 1_000 => PriorityTier::Stars1k,
            s if s >= 100 => PriorityTier::Stars100,
            s if s >= 10 => PriorityTier::Stars10,
            _ => PriorityTier::StarsUnder10,
        }
    }
}

/// A repo selected for this run
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Candidate {
    pub github_id: Option<i64>,
    pub full_name: String,
    pub stars: u64,
    pub tier: PriorityTier,
    /// Time since the last snapshot, or since discovery if there is none
    #[serde(skip)]
    pub staleness: Duration,
}

impl Candidate {
    pub fn is_stub(&self) -> bool {
        self.github_id.is_none()
    }

    pub fn hours_since_snapshot(&self) -> f64 {
        self.staleness.num_seconds() as f64 / 3600.0
    }
}

/// Whether the store's failure bookkeeping keeps this repo out of the run
fn is_blocked(repo: &TrackedRepo, now: DateTime<Utc>) -> bool {
    if repo.is_archived || repo.is_disabled {
        return true;
    }
    match repo.status {
        CollectionStatus::NotFound | CollectionStatus::Unreachable => true,
        CollectionStatus::Retrying => repo.next_retry_at.is_some_and(|at| at > now),
        CollectionStatus::Active => false,
    }
}

/// Turn stored repos into the due population: filtered, tiered, and ordered
/// by tier then by descending staleness
pub fn build_population(
    repos: Vec<TrackedRepo>,
    now: DateTime<Utc>,
    policy: &PriorityPolicy,
) -> Vec<Candidate> {
    let mut population: Vec<Candidate> = repos
        .into_iter()
        .filter(|repo| !is_blocked(repo, now))
        .filter_map(|repo| {
            let tier = policy.classify(&repo, now);
            let staleness = now - repo.last_snapshot_at.unwrap_or(repo.discovered_at);
            let due = policy
                .interval(tier)
                .map_or(true, |interval| staleness >= interval);
            due.then(|| Candidate {
                github_id: repo.github_id,
                full_name: repo.full_name,
                stars: repo.stars,
                tier,
                staleness,
            })
        })
        .collect();

    population.sort_by_key(|c| (c.tier, Reverse(c.staleness)));
    population
}

/// Bound an ordered population by the caller's limit and the available budget
pub fn select_candidates(
    mut population: Vec<Candidate>,
    requested_limit: usize,
    available_budget: u32,
    chunk_size: usize,
) -> Vec<Candidate> {
    let budget_cap = (available_budget as usize).saturating_mul(chunk_size);
    let effective = population.len().min(requested_limit).min(budget_cap);
    population.truncate(effective);
    population
}
