//! Scripted `GitHubApi` for tests.

use serde_json::{json, Map, Value};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;

use crate::github::{GitHubApi, GraphqlReply, RateLimit, TransportError};

enum Scripted {
    Reply(GraphqlReply),
    Network(String),
}

/// Answers queued replies first; once the queue is empty it resolves lookups
/// from the registered repositories and reports everything else as not found.
pub struct FakeGitHub {
    authenticated: bool,
    rate_limit: Option<RateLimit>,
    repos: HashMap<String, Value>,
    script: Mutex<VecDeque<Scripted>>,
    requests: Mutex<Vec<(Instant, Value)>>,
    rate_limit_calls: AtomicUsize,
}

pub fn json_reply(body: Value) -> GraphqlReply {
    GraphqlReply {
        status: 200,
        content_type: Some("application/json; charset=utf-8".to_string()),
        body: body.to_string(),
    }
}

impl FakeGitHub {
    pub fn new() -> Self {
        Self {
            authenticated: true,
            rate_limit: Some(RateLimit {
                limit: 5000,
                remaining: 5000,
                reset: chrono::Utc::now().timestamp() + 3600,
            }),
            repos: HashMap::new(),
            script: Mutex::new(VecDeque::new()),
            requests: Mutex::new(Vec::new()),
            rate_limit_calls: AtomicUsize::new(0),
        }
    }

    pub fn unauthenticated(mut self) -> Self {
        self.authenticated = false;
        self
    }

    pub fn with_rate_limit(mut self, remaining: u32, limit: u32) -> Self {
        self.rate_limit = Some(RateLimit {
            limit,
            remaining,
            reset: chrono::Utc::now().timestamp() + 3600,
        });
        self
    }

    pub fn with_failing_rate_limit(mut self) -> Self {
        self.rate_limit = None;
        self
    }

    pub fn with_repo(mut self, full_name: &str, repo: Value) -> Self {
        self.repos.insert(full_name.to_lowercase(), repo);
        self
    }

    pub fn push_reply(self, reply: GraphqlReply) -> Self {
        self.script.lock().unwrap().push_back(Scripted::Reply(reply));
        self
    }

    pub fn push_status(self, status: u16) -> Self {
        self.push_reply(GraphqlReply {
            status,
            content_type: Some("text/plain".to_string()),
            body: format!("status {}", status),
        })
    }

    pub fn push_network_error(self, message: &str) -> Self {
        self.script
            .lock()
            .unwrap()
            .push_back(Scripted::Network(message.to_string()));
        self
    }

    pub fn graphql_calls(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    pub fn rate_limit_calls(&self) -> usize {
        self.rate_limit_calls.load(Ordering::SeqCst)
    }

    /// Every `owner/name` pair looked up, in request order
    pub fn requested_names(&self) -> Vec<String> {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .flat_map(|(_, body)| lookups(body))
            .map(|(_, full_name)| full_name)
            .collect()
    }

    /// Time between consecutive requests
    pub fn request_gaps(&self) -> Vec<Duration> {
        let requests = self.requests.lock().unwrap();
        requests
            .windows(2)
            .map(|pair| pair[1].0.duration_since(pair[0].0))
            .collect()
    }

    fn auto_reply(&self, body: &Value) -> GraphqlReply {
        let mut data = Map::new();
        let mut errors = Vec::new();
        data.insert(
            "rateLimit".to_string(),
            json!({ "cost": 1, "remaining": 4999, "resetAt": "2030-01-01T00:00:00Z" }),
        );

        for (i, full_name) in lookups(body) {
            let alias = format!("r{i}");
            match self.repos.get(&full_name.to_lowercase()) {
                Some(repo) => {
                    data.insert(alias, repo.clone());
                }
                None => {
                    data.insert(alias.clone(), Value::Null);
                    errors.push(json!({
                        "type": "NOT_FOUND",
                        "path": [alias],
                        "message": format!(
                            "Could not resolve to a Repository with the name '{}'.",
                            full_name
                        )
                    }));
                }
            }
        }

        let mut response = json!({ "data": data });
        if !errors.is_empty() {
            response["errors"] = Value::Array(errors);
        }
        json_reply(response)
    }
}

/// `(alias index, owner/name)` for each lookup in a request body
fn lookups(body: &Value) -> Vec<(usize, String)> {
    let Some(vars) = body.get("variables").and_then(|v| v.as_object()) else {
        return Vec::new();
    };
    let mut found: Vec<(usize, String)> = vars
        .iter()
        .filter_map(|(key, owner)| {
            let i: usize = key.strip_prefix('o')?.parse().ok()?;
            let name = vars.get(&format!("n{i}"))?.as_str()?;
            Some((i, format!("{}/{}", owner.as_str()?, name)))
        })
        .collect();
    found.sort_by_key(|(i, _)| *i);
    found
}

impl GitHubApi for FakeGitHub {
    fn is_authenticated(&self) -> bool {
        self.authenticated
    }

    async fn rate_limit(&self) -> anyhow::Result<RateLimit> {
        self.rate_limit_calls.fetch_add(1, Ordering::SeqCst);
        self.rate_limit
            .clone()
            .ok_or_else(|| anyhow::anyhow!("rate limit endpoint unavailable"))
    }

    async fn graphql(&self, body: &Value) -> Result<GraphqlReply, TransportError> {
        self.requests
            .lock()
            .unwrap()
            .push((Instant::now(), body.clone()));

        let next = self.script.lock().unwrap().pop_front();
        match next {
            Some(Scripted::Reply(reply)) => Ok(reply),
            Some(Scripted::Network(message)) => Err(TransportError::Network(message)),
            None => Ok(self.auto_reply(body)),
        }
    }
}
