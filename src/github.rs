use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;

const DEFAULT_API_BASE: &str = "https://api.github.com";
const USER_AGENT: &str = "starwatch/0.1.0";

/// The two GitHub calls a collection run makes.
///
/// `GitHubClient` is the production implementation; tests script their own.
pub trait GitHubApi {
    /// Whether requests carry a token (GraphQL refuses anonymous callers)
    fn is_authenticated(&self) -> bool;

    /// Current GraphQL allowance from the rate limit endpoint
    fn rate_limit(&self) -> impl Future<Output = Result<RateLimit>> + Send;

    /// POST one GraphQL document and hand back the raw reply.
    ///
    /// Only failures below HTTP (DNS, connect, reset, timeout) are errors;
    /// every status code comes back as a `GraphqlReply` for the caller to classify.
    fn graphql(
        &self,
        body: &serde_json::Value,
    ) -> impl Future<Output = std::result::Result<GraphqlReply, TransportError>> + Send;
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("network error: {0}")]
    Network(String),
}

/// Raw GraphQL reply, before any interpretation
#[derive(Debug, Clone)]
pub struct GraphqlReply {
    pub status: u16,
    pub content_type: Option<String>,
    pub body: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RateLimit {
    pub limit: u32,
    pub remaining: u32,
    /// Unix timestamp of the next reset
    pub reset: i64,
}

#[derive(Debug, Deserialize)]
struct RateLimitResources {
    graphql: RateLimit,
}

#[derive(Debug, Deserialize)]
struct RateLimitResponse {
    resources: RateLimitResources,
}

/// GitHub API client
#[derive(Clone)]
pub struct GitHubClient {
    client: reqwest::Client,
    token: Option<String>,
    api_base: String,
}

impl GitHubClient {
    pub fn new(token: Option<String>) -> Result<Self> {
        Self::with_base_url(token, DEFAULT_API_BASE)
    }

    /// Client against a different API root (GitHub Enterprise)
    pub fn with_base_url(token: Option<String>, api_base: &str) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(Duration::from_secs(60))
            .connect_timeout(Duration::from_secs(10))
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            client,
            token,
            api_base: api_base.trim_end_matches('/').to_string(),
        })
    }

    fn authorized(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => req.header("Authorization", format!("Bearer {}", token)),
            None => req,
        }
    }
}

impl GitHubApi for GitHubClient {
    fn is_authenticated(&self) -> bool {
        self.token.is_some()
    }

    async fn rate_limit(&self) -> Result<RateLimit> {
        let url = format!("{}/rate_limit", self.api_base);
        let response = self
            .authorized(self.client.get(&url))
            .header("Accept", "application/vnd.github+json")
            .header("X-GitHub-Api-Version", "2022-11-28")
            .send()
            .await
            .context("Failed to check rate limit")?;

        let status = response.status();
        if !status.is_success() {
            anyhow::bail!("GitHub API error {} on rate limit probe", status);
        }

        let data: RateLimitResponse = response
            .json()
            .await
            .context("Failed to parse rate limit response")?;
        Ok(data.resources.graphql)
    }

    async fn graphql(
        &self,
        body: &serde_json::Value,
    ) -> std::result::Result<GraphqlReply, TransportError> {
        let url = format!("{}/graphql", self.api_base);
        let start = std::time::Instant::now();

        let response = self
            .authorized(self.client.post(&url))
            .json(body)
            .send()
            .await
            .map_err(|e| TransportError::Network(describe_reqwest_error(&e)))?;

        let status = response.status().as_u16();
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(String::from);

        let body = response
            .text()
            .await
            .map_err(|e| TransportError::Network(describe_reqwest_error(&e)))?;

        tracing::debug!(
            status,
            bytes = body.len(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "POST {}",
            url
        );

        Ok(GraphqlReply {
            status,
            content_type,
            body,
        })
    }
}

fn describe_reqwest_error(e: &reqwest::Error) -> String {
    use std::error::Error;
    let mut details = e.to_string();
    if e.is_timeout() {
        details.push_str(" [TIMEOUT]");
    } else if e.is_connect() {
        details.push_str(" [CONNECT]");
    }
    if let Some(source) = e.source() {
        details.push_str(&format!(" <- {}", source));
    }
    details
}

// === GraphQL Types ===

/// Fields requested for every aliased repository lookup
pub const REPO_FIELDS: &str = r#"
    databaseId
    nameWithOwner
    owner { login }
    name
    description
    homepageUrl
    primaryLanguage { name }
    repositoryTopics(first: 20) { nodes { topic { name } } }
    stargazerCount
    forkCount
    watchers { totalCount }
    issues(states: OPEN) { totalCount }
    diskUsage
    isFork
    isArchived
    isDisabled
    licenseInfo { name }
    defaultBranchRef { name }
    createdAt
    updatedAt
    pushedAt
"#;

#[derive(Debug, Deserialize)]
struct NamedNode {
    name: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TotalCount {
    total_count: u64,
}

#[derive(Debug, Deserialize)]
struct TopicNode {
    topic: NamedNode,
}

#[derive(Debug, Default, Deserialize)]
struct TopicConnection {
    #[serde(default)]
    nodes: Vec<TopicNode>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RepoNode {
    database_id: i64,
    name_with_owner: String,
    description: Option<String>,
    homepage_url: Option<String>,
    primary_language: Option<NamedNode>,
    #[serde(default)]
    repository_topics: TopicConnection,
    stargazer_count: u64,
    fork_count: u64,
    watchers: TotalCount,
    issues: TotalCount,
    disk_usage: Option<u64>,
    #[serde(default)]
    is_fork: bool,
    #[serde(default)]
    is_archived: bool,
    #[serde(default)]
    is_disabled: bool,
    license_info: Option<NamedNode>,
    default_branch_ref: Option<NamedNode>,
    created_at: Option<DateTime<Utc>>,
    updated_at: Option<DateTime<Utc>>,
    pushed_at: Option<DateTime<Utc>>,
}

/// Fully resolved repository state from one lookup
#[derive(Debug, Clone, PartialEq)]
pub struct RepoData {
    pub github_id: i64,
    pub full_name: String,
    pub description: Option<String>,
    pub homepage: Option<String>,
    pub language: Option<String>,
    pub topics: Vec<String>,
    pub stars: u64,
    pub forks: u64,
    pub watchers: u64,
    pub open_issues: u64,
    pub size: u64,
    pub is_fork: bool,
    pub is_archived: bool,
    pub is_disabled: bool,
    pub license: Option<String>,
    pub default_branch: Option<String>,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
    pub pushed_at: Option<DateTime<Utc>>,
}

impl RepoData {
    /// Decode one aliased `repository` object
    pub fn from_json(value: &serde_json::Value) -> std::result::Result<Self, serde_json::Error> {
        let node = RepoNode::deserialize(value)?;
        Ok(node.into())
    }
}

impl From<RepoNode> for RepoData {
    fn from(node: RepoNode) -> Self {
        Self {
            github_id: node.database_id,
            full_name: node.name_with_owner,
            description: node.description.filter(|d| !d.is_empty()),
            homepage: node.homepage_url.filter(|h| !h.is_empty()),
            language: node.primary_language.map(|l| l.name),
            topics: node
                .repository_topics
                .nodes
                .into_iter()
                .map(|n| n.topic.name)
                .collect(),
            stars: node.stargazer_count,
            forks: node.fork_count,
            watchers: node.watchers.total_count,
            open_issues: node.issues.total_count,
            size: node.disk_usage.unwrap_or(0),
            is_fork: node.is_fork,
            is_archived: node.is_archived,
            is_disabled: node.is_disabled,
            license: node.license_info.map(|l| l.name),
            default_branch: node.default_branch_ref.map(|b| b.name),
            created_at: node.created_at,
            updated_at: node.updated_at,
            pushed_at: node.pushed_at,
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use serde_json::json;

    /// A complete `repository` object as GitHub returns it
    pub(crate) fn repo_json(id: i64, full_name: &str, stars: u64) -> serde_json::Value {
        let (owner, name) = full_name.split_once('/').unwrap();
        json!({
            "databaseId": id,
            "nameWithOwner": full_name,
            "owner": { "login": owner },
            "name": name,
            "description": "A test repository",
            "homepageUrl": "",
            "primaryLanguage": { "name": "Rust" },
            "repositoryTopics": { "nodes": [
                { "topic": { "name": "cli" } },
                { "topic": { "name": "sqlite" } }
            ] },
            "stargazerCount": stars,
            "forkCount": 3,
            "watchers": { "totalCount": 4 },
            "issues": { "totalCount": 5 },
            "diskUsage": 1024,
            "isFork": false,
            "isArchived": false,
            "isDisabled": false,
            "licenseInfo": { "name": "MIT License" },
            "defaultBranchRef": { "name": "main" },
            "createdAt": "2020-01-01T00:00:00Z",
            "updatedAt": "2024-06-01T12:00:00Z",
            "pushedAt": null
        })
    }

    #[test]
    fn test_repo_data_from_json() {
        let repo = RepoData::from_json(&repo_json(42, "rust-lang/rust", 90000)).unwrap();
        assert_eq!(repo.github_id, 42);
        assert_eq!(repo.full_name, "rust-lang/rust");
        assert_eq!(repo.stars, 90000);
        assert_eq!(repo.watchers, 4);
        assert_eq!(repo.open_issues, 5);
        assert_eq!(repo.size, 1024);
        assert_eq!(repo.topics, vec!["cli", "sqlite"]);
        assert_eq!(repo.license.as_deref(), Some("MIT License"));
        assert_eq!(repo.default_branch.as_deref(), Some("main"));
        assert!(repo.pushed_at.is_none());
    }

    #[test]
    fn test_empty_homepage_is_none() {
        let repo = RepoData::from_json(&repo_json(1, "a/b", 0)).unwrap();
        assert!(repo.homepage.is_none());
    }

    #[test]
    fn test_missing_required_field_fails() {
        let mut value = repo_json(1, "a/b", 0);
        value.as_object_mut().unwrap().remove("stargazerCount");
        assert!(RepoData::from_json(&value).is_err());
    }

    #[test]
    fn test_client_authentication_flag() {
        assert!(GitHubClient::new(Some("t".into())).unwrap().is_authenticated());
        assert!(!GitHubClient::new(None).unwrap().is_authenticated());
    }
}
