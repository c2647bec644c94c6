//! One collection run: quota probe, selection, batched fetch, reconciliation.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::time::Instant;

use crate::batch::{fetch_batched, FetchOutcome};
use crate::config::CollectorConfig;
use crate::db::Database;
use crate::error::CollectError;
use crate::github::GitHubApi;
use crate::priority::{build_population, select_candidates, Candidate};
use crate::quota::{check_budget, Budget};
use crate::reconcile::{reconcile, BackoffPolicy, ReconcileEffect};

/// How a run ended. All three are normal outcomes.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RunOutcome {
    Completed,
    NothingDue,
    /// Stopped after the quota probe; no lookups were made
    LowBudget {
        remaining: u32,
        floor: u32,
        retry_after_secs: u64,
    },
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    #[serde(flatten)]
    pub outcome: RunOutcome,
    pub started_at: DateTime<Utc>,
    pub budget: Budget,
    pub requested_limit: usize,
    /// Repos due before any bounding
    pub due: usize,
    pub selected: usize,
    pub resolved: usize,
    pub not_found: usize,
    pub transient_failed: usize,
    /// Repos that hit the failure limit this run
    pub unreachable: usize,
    pub snapshots_written: usize,
    pub promoted: usize,
    pub write_errors: usize,
    pub requests: u32,
    pub budget_consumed: u32,
    pub budget_remaining: u32,
    pub duration_ms: u64,
}

impl RunSummary {
    fn new(started_at: DateTime<Utc>, budget: Budget, requested_limit: usize) -> Self {
        let budget_remaining = budget.remaining;
        Self {
            outcome: RunOutcome::Completed,
            started_at,
            budget,
            requested_limit,
            due: 0,
            selected: 0,
            resolved: 0,
            not_found: 0,
            transient_failed: 0,
            unreachable: 0,
            snapshots_written: 0,
            promoted: 0,
            write_errors: 0,
            requests: 0,
            budget_consumed: 0,
            budget_remaining,
            duration_ms: 0,
        }
    }
}

/// Apply every outcome independently, tallying into `summary`
fn reconcile_all(
    db: &Database,
    candidates: &[Candidate],
    outcomes: &[FetchOutcome],
    now: DateTime<Utc>,
    backoff: &BackoffPolicy,
    summary: &mut RunSummary,
) {
    for (candidate, outcome) in candidates.iter().zip(outcomes) {
        match outcome {
            FetchOutcome::Resolved(_) => summary.resolved += 1,
            FetchOutcome::NotFound(_) => summary.not_found += 1,
            FetchOutcome::TransientFailure(_) => summary.transient_failed += 1,
        }

        match reconcile(db, candidate, outcome, now, backoff) {
            Ok(effect) => {
                if effect.wrote_snapshot() {
                    summary.snapshots_written += 1;
                }
                match effect {
                    ReconcileEffect::Promoted => summary.promoted += 1,
                    ReconcileEffect::Retrying {
                        failures,
                        next_retry_at,
                    } => tracing::debug!(
                        "{} failed {} time(s), next try after {}",
                        candidate.full_name,
                        failures,
                        next_retry_at
                    ),
                    ReconcileEffect::Unreachable { failures } => {
                        summary.unreachable += 1;
                        tracing::debug!("{} gave up after {} failures", candidate.full_name, failures);
                    }
                    ReconcileEffect::Refreshed | ReconcileEffect::NotFound => {}
                }
            }
            Err(e) => {
                summary.write_errors += 1;
                tracing::error!("failed to record {}: {:#}", candidate.full_name, e);
            }
        }
    }
}

/// Run one collection. `requested_limit` falls back to the configured default.
pub async fn run_collection<A: GitHubApi>(
    api: &A,
    db: &Database,
    config: &CollectorConfig,
    requested_limit: Option<usize>,
) -> Result<RunSummary, CollectError> {
    if !api.is_authenticated() {
        return Err(CollectError::MissingToken);
    }

    let clock = Instant::now();
    let started_at = Utc::now();
    let limit = requested_limit.unwrap_or(config.default_limit);

    let budget = check_budget(api).await;
    let mut summary = RunSummary::new(started_at, budget.clone(), limit);

    if budget.remaining < config.min_budget_floor {
        let retry_after_secs = budget.seconds_until_reset(Utc::now());
        tracing::warn!(
            "budget too low ({} < {}), skipping run; resets in {}s",
            budget.remaining,
            config.min_budget_floor,
            retry_after_secs
        );
        summary.outcome = RunOutcome::LowBudget {
            remaining: budget.remaining,
            floor: config.min_budget_floor,
            retry_after_secs,
        };
        summary.duration_ms = clock.elapsed().as_millis() as u64;
        return Ok(summary);
    }

    let tracked = db.load_tracked()?;
    let population = build_population(tracked, started_at, &config.priority);
    summary.due = population.len();

    let candidates = select_candidates(
        population,
        limit,
        budget.available(config.budget_reserve),
        config.fetch.chunk_size,
    );
    summary.selected = candidates.len();

    if candidates.is_empty() {
        tracing::info!("nothing due ({} repos due, limit {})", summary.due, limit);
        summary.outcome = RunOutcome::NothingDue;
        summary.duration_ms = clock.elapsed().as_millis() as u64;
        return Ok(summary);
    }

    tracing::info!(
        "collecting {} of {} due repos, {} unresolved (budget {}/{})",
        candidates.len(),
        summary.due,
        candidates.iter().filter(|c| c.is_stub()).count(),
        budget.remaining,
        budget.total
    );
    if let Some(first) = candidates.first() {
        tracing::debug!(
            "first up: {} ({:?}, {:.1}h since last snapshot)",
            first.full_name,
            first.tier,
            first.hours_since_snapshot()
        );
    }

    let names: Vec<String> = candidates.iter().map(|c| c.full_name.clone()).collect();
    let report = fetch_batched(api, &names, &config.fetch).await;
    summary.requests = report.requests;
    summary.budget_consumed = report.cost;
    summary.budget_remaining = budget.remaining.saturating_sub(report.cost);

    reconcile_all(
        db,
        &candidates,
        &report.outcomes,
        Utc::now(),
        &config.backoff,
        &mut summary,
    );

    summary.duration_ms = clock.elapsed().as_millis() as u64;
    tracing::info!(
        "run complete: {} resolved ({} promoted), {} not found, {} failed, {} snapshots, {} write errors, {} budget used in {}ms",
        summary.resolved,
        summary.promoted,
        summary.not_found,
        summary.transient_failed,
        summary.snapshots_written,
        summary.write_errors,
        summary.budget_consumed,
        summary.duration_ms
    );

    Ok(summary)
}
