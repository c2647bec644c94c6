//! Batched repository lookups over GraphQL.
//!
//! Names are split into chunks; each chunk becomes one query with one aliased
//! `repository` lookup per member (`r0`, `r1`, ...). Results come back in the
//! caller's order, one per input name, whatever happened to the chunk.

use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::time::Duration;
use thiserror::Error;

use crate::github::{GitHubApi, GraphqlReply, RepoData, TransportError, REPO_FIELDS};

/// GitHub refuses documents with more aliased lookups than this
pub const MAX_CHUNK_SIZE: usize = 100;

#[derive(Debug, Clone)]
pub struct FetchConfig {
    pub chunk_size: usize,
    /// Pause between consecutive chunk requests
    pub inter_chunk_delay: Duration,
    /// Retries after the first attempt, for transient failures only
    pub max_retries: u32,
    /// First retry delay; doubles on each further retry
    pub retry_base_delay: Duration,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            chunk_size: MAX_CHUNK_SIZE,
            inter_chunk_delay: Duration::from_millis(1100),
            max_retries: 3,
            retry_base_delay: Duration::from_secs(1),
        }
    }
}

/// Outcome of one lookup
#[derive(Debug, Clone, PartialEq)]
pub enum FetchOutcome {
    Resolved(Box<RepoData>),
    /// The repository no longer resolves (deleted, renamed away, private)
    NotFound(String),
    TransientFailure(FailureReason),
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum FailureReason {
    #[error("network error: {0}")]
    Network(String),
    #[error("server error {0} after retries")]
    ServerError(u16),
    #[error("unexpected HTTP status {0}")]
    HttpStatus(u16),
    #[error("unexpected content type: {0}")]
    UnexpectedContentType(String),
    #[error("malformed response body: {0}")]
    MalformedBody(String),
    #[error("lookup returned no data: {0}")]
    Unresolved(String),
    #[error("repository payload could not be decoded: {0}")]
    Undecodable(String),
}

/// Everything one `fetch_batched` call produced
#[derive(Debug, Default)]
pub struct BatchReport {
    /// One outcome per input name, same order
    pub outcomes: Vec<FetchOutcome>,
    /// HTTP requests issued, retries included
    pub requests: u32,
    /// Rate limit points spent (reported cost, or 1 per request without one)
    pub cost: u32,
}

#[derive(Debug, Deserialize)]
struct ChunkResponse {
    data: Option<Map<String, Value>>,
    #[serde(default)]
    errors: Vec<GraphqlError>,
}

#[derive(Debug, Deserialize)]
struct GraphqlError {
    message: String,
    #[serde(rename = "type")]
    kind: Option<String>,
    #[serde(default)]
    path: Vec<Value>,
}

impl GraphqlError {
    fn targets(&self, alias: &str) -> bool {
        self.path.first().and_then(|p| p.as_str()) == Some(alias)
    }

    fn is_not_found(&self) -> bool {
        self.kind.as_deref() == Some("NOT_FOUND") || self.message.contains("Could not resolve")
    }
}

/// Split "owner/name", rejecting anything GitHub could never resolve
pub fn split_full_name(full_name: &str) -> Option<(&str, &str)> {
    let (owner, name) = full_name.split_once('/')?;
    let valid = |part: &str| {
        !part.is_empty() && !part.contains('/') && !part.chars().any(char::is_whitespace)
    };
    if valid(owner) && valid(name) {
        Some((owner, name))
    } else {
        None
    }
}

/// Build the request body for one chunk.
///
/// `lookups` holds `(position in chunk, owner, name)`; the position becomes the alias.
fn build_chunk_request(lookups: &[(usize, &str, &str)]) -> Value {
    let mut params = Vec::with_capacity(lookups.len());
    let mut selections = Vec::with_capacity(lookups.len());
    let mut variables = Map::new();

    for (i, owner, name) in lookups {
        params.push(format!("$o{i}: String!, $n{i}: String!"));
        selections.push(format!(
            "r{i}: repository(owner: $o{i}, name: $n{i}) {{ ...RepoFields }}"
        ));
        variables.insert(format!("o{i}"), Value::String(owner.to_string()));
        variables.insert(format!("n{i}"), Value::String(name.to_string()));
    }

    let query = format!(
        "query Chunk({}) {{\n  rateLimit {{ cost remaining resetAt }}\n  {}\n}}\nfragment RepoFields on Repository {{{}}}",
        params.join(", "),
        selections.join("\n  "),
        REPO_FIELDS
    );

    json!({ "query": query, "variables": variables })
}

fn is_transient_status(status: u16) -> bool {
    matches!(status, 502..=504)
}

/// Send one chunk request, retrying transient failures with exponential backoff.
///
/// Returns the final reply (or reason) and how many requests were made.
async fn send_with_retry<A: GitHubApi>(
    api: &A,
    body: &Value,
    config: &FetchConfig,
) -> (Result<GraphqlReply, FailureReason>, u32) {
    let mut delay = config.retry_base_delay;
    let mut attempts = 0;
    let mut last_error = FailureReason::Network("no attempt made".to_string());

    for attempt in 0..=config.max_retries {
        if attempt > 0 {
            tracing::warn!(
                "chunk request failed ({}), retry {}/{} in {:?}",
                last_error,
                attempt,
                config.max_retries,
                delay
            );
            tokio::time::sleep(delay).await;
            delay *= 2;
        }

        attempts += 1;
        match api.graphql(body).await {
            Err(TransportError::Network(msg)) => {
                last_error = FailureReason::Network(msg);
            }
            Ok(reply) if is_transient_status(reply.status) => {
                last_error = FailureReason::ServerError(reply.status);
            }
            Ok(reply) => return (Ok(reply), attempts),
        }
    }

    (Err(last_error), attempts)
}

/// Validate a reply's envelope and decode it
fn parse_reply(reply: &GraphqlReply) -> Result<ChunkResponse, FailureReason> {
    if !(200..300).contains(&reply.status) {
        return Err(FailureReason::HttpStatus(reply.status));
    }

    let content_type = reply.content_type.as_deref().unwrap_or("");
    if !content_type.trim_start().starts_with("application/json") {
        return Err(FailureReason::UnexpectedContentType(content_type.to_string()));
    }

    serde_json::from_str(&reply.body).map_err(|e| FailureReason::MalformedBody(e.to_string()))
}

/// Read one alias out of a parsed chunk
fn outcome_for_alias(response: &ChunkResponse, alias: &str) -> FetchOutcome {
    let value = response.data.as_ref().and_then(|d| d.get(alias));

    match value {
        Some(v) if !v.is_null() => match RepoData::from_json(v) {
            Ok(repo) => FetchOutcome::Resolved(Box::new(repo)),
            Err(e) => FetchOutcome::TransientFailure(FailureReason::Undecodable(e.to_string())),
        },
        _ => {
            let alias_error = response.errors.iter().find(|e| e.targets(alias));
            match alias_error {
                Some(e) if e.is_not_found() => FetchOutcome::NotFound(e.message.clone()),
                Some(e) => FetchOutcome::TransientFailure(FailureReason::Unresolved(e.message.clone())),
                None => {
                    let message = response
                        .errors
                        .first()
                        .map(|e| e.message.clone())
                        .unwrap_or_else(|| "null without error".to_string());
                    FetchOutcome::TransientFailure(FailureReason::Unresolved(message))
                }
            }
        }
    }
}

fn reported_cost(response: &ChunkResponse) -> Option<u32> {
    response
        .data
        .as_ref()?
        .get("rateLimit")?
        .get("cost")?
        .as_u64()
        .map(|c| c as u32)
}

/// Fetch one chunk. Returns exactly `chunk.len()` outcomes, and whether a request went out.
async fn fetch_chunk<A: GitHubApi>(
    api: &A,
    chunk: &[String],
    config: &FetchConfig,
    report: &mut BatchReport,
) -> (Vec<FetchOutcome>, bool) {
    let mut outcomes: Vec<Option<FetchOutcome>> = vec![None; chunk.len()];
    let mut lookups = Vec::with_capacity(chunk.len());

    for (i, full_name) in chunk.iter().enumerate() {
        match split_full_name(full_name) {
            Some((owner, name)) => lookups.push((i, owner, name)),
            None => {
                outcomes[i] = Some(FetchOutcome::NotFound(format!(
                    "'{}' is not an owner/name pair",
                    full_name
                )))
            }
        }
    }

    if lookups.is_empty() {
        return (outcomes.into_iter().flatten().collect(), false);
    }

    let body = build_chunk_request(&lookups);
    let (reply, attempts) = send_with_retry(api, &body, config).await;
    report.requests += attempts;

    let parsed = reply.and_then(|r| parse_reply(&r));
    match parsed {
        Ok(response) => {
            report.cost += attempts - 1 + reported_cost(&response).unwrap_or(1);
            for (i, _, _) in &lookups {
                outcomes[*i] = Some(outcome_for_alias(&response, &format!("r{i}")));
            }
        }
        Err(reason) => {
            report.cost += attempts;
            tracing::warn!("chunk of {} failed: {}", lookups.len(), reason);
            for (i, _, _) in &lookups {
                outcomes[*i] = Some(FetchOutcome::TransientFailure(reason.clone()));
            }
        }
    }

    (outcomes.into_iter().flatten().collect(), true)
}

/// Fetch all `names`, one GraphQL request per chunk, strictly sequentially
pub async fn fetch_batched<A: GitHubApi>(
    api: &A,
    names: &[String],
    config: &FetchConfig,
) -> BatchReport {
    let mut report = BatchReport {
        outcomes: Vec::with_capacity(names.len()),
        ..Default::default()
    };
    if names.is_empty() {
        return report;
    }

    let chunk_size = config.chunk_size.clamp(1, MAX_CHUNK_SIZE);
    let total_chunks = names.len().div_ceil(chunk_size);
    let mut previous_sent = false;

    for (chunk_idx, chunk) in names.chunks(chunk_size).enumerate() {
        if previous_sent && !config.inter_chunk_delay.is_zero() {
            tokio::time::sleep(config.inter_chunk_delay).await;
        }

        let start = tokio::time::Instant::now();
        let (outcomes, sent) = fetch_chunk(api, chunk, config, &mut report).await;
        previous_sent = sent;

        let resolved = outcomes
            .iter()
            .filter(|o| matches!(o, FetchOutcome::Resolved(_)))
            .count();
        let not_found = outcomes
            .iter()
            .filter(|o| matches!(o, FetchOutcome::NotFound(_)))
            .count();
        tracing::info!(
            "chunk {}/{}: {} resolved, {} not found, {} failed ({}ms)",
            chunk_idx + 1,
            total_chunks,
            resolved,
            not_found,
            outcomes.len() - resolved - not_found,
            start.elapsed().as_millis()
        );

        report.outcomes.extend(outcomes);
    }

    report
}
