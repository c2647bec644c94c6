//! Applying fetch outcomes to the store.

use anyhow::Result;
use chrono::{DateTime, Duration, Utc};

use crate::batch::FetchOutcome;
use crate::db::{CollectionStatus, Database, Snapshot, UpsertOutcome};
use crate::priority::Candidate;

/// Wait before the n-th consecutive transient failure is retried
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    pub waits: Vec<Duration>,
    /// Failure count at which a repo is given up on
    pub unreachable_after: u32,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            waits: vec![
                Duration::hours(1),
                Duration::hours(6),
                Duration::hours(24),
                Duration::days(7),
            ],
            unreachable_after: 5,
        }
    }
}

impl BackoffPolicy {
    /// `None` once the repo should be marked unreachable
    pub fn wait_for(&self, failures: u32) -> Option<Duration> {
        if failures >= self.unreachable_after {
            return None;
        }
        let idx = failures.saturating_sub(1) as usize;
        self.waits
            .get(idx)
            .or_else(|| self.waits.last())
            .copied()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ReconcileEffect {
    /// First successful lookup of a stub; a snapshot was written
    Promoted,
    /// Known repo re-measured; a snapshot was written
    Refreshed,
    NotFound,
    Retrying {
        failures: u32,
        next_retry_at: DateTime<Utc>,
    },
    Unreachable {
        failures: u32,
    },
}

impl ReconcileEffect {
    pub fn wrote_snapshot(&self) -> bool {
        matches!(self, ReconcileEffect::Promoted | ReconcileEffect::Refreshed)
    }
}

/// Write one candidate's outcome. Each call stands alone; a failure here
/// affects no other candidate.
pub fn reconcile(
    db: &Database,
    candidate: &Candidate,
    outcome: &FetchOutcome,
    now: DateTime<Utc>,
    backoff: &BackoffPolicy,
) -> Result<ReconcileEffect> {
    match outcome {
        FetchOutcome::Resolved(repo) => {
            let upserted = db.upsert_resolved(&candidate.full_name, repo)?;
            let effect = match upserted {
                UpsertOutcome::Promoted => ReconcileEffect::Promoted,
                UpsertOutcome::Refreshed => ReconcileEffect::Refreshed,
                UpsertOutcome::NameConflict => {
                    let reason = format!(
                        "{} now resolves to a different repository (id {})",
                        candidate.full_name, repo.github_id
                    );
                    tracing::warn!("{}", reason);
                    db.mark_not_found(candidate.github_id, &candidate.full_name, &reason)?;
                    return Ok(ReconcileEffect::NotFound);
                }
            };

            db.append_snapshot(&Snapshot {
                github_id: repo.github_id,
                stars: repo.stars,
                forks: repo.forks,
                watchers: repo.watchers,
                open_issues: repo.open_issues,
                size: repo.size,
                recorded_at: now,
            })?;
            if effect == ReconcileEffect::Promoted {
                tracing::debug!("promoted {} (id {})", candidate.full_name, repo.github_id);
            }
            Ok(effect)
        }
        FetchOutcome::NotFound(reason) => {
            db.mark_not_found(candidate.github_id, &candidate.full_name, reason)?;
            tracing::debug!("{} not found: {}", candidate.full_name, reason);
            Ok(ReconcileEffect::NotFound)
        }
        FetchOutcome::TransientFailure(reason) => {
            let reason = reason.to_string();
            let Some(failures) = db.increment_failures(candidate.github_id, &candidate.full_name)?
            else {
                anyhow::bail!("{} is no longer in the store", candidate.full_name);
            };

            match backoff.wait_for(failures) {
                Some(wait) => {
                    let next_retry_at = now + wait;
                    db.set_failure_state(
                        candidate.github_id,
                        &candidate.full_name,
                        CollectionStatus::Retrying,
                        Some(next_retry_at),
                        &reason,
                    )?;
                    Ok(ReconcileEffect::Retrying {
                        failures,
                        next_retry_at,
                    })
                }
                None => {
                    db.set_failure_state(
                        candidate.github_id,
                        &candidate.full_name,
                        CollectionStatus::Unreachable,
                        None,
                        &reason,
                    )?;
                    tracing::warn!(
                        "{} unreachable after {} consecutive failures: {}",
                        candidate.full_name,
                        failures,
                        reason
                    );
                    Ok(ReconcileEffect::Unreachable { failures })
                }
            }
        }
    }
}
