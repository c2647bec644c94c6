//! HTTP trigger surface: an external scheduler hits `/collect`

use anyhow::Result;
use axum::{
    extract::{Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::collect::run_collection;
use crate::config::CollectorConfig;
use crate::db::Database;
use crate::error::{ApiError, ApiResult};
use crate::github::GitHubApi;

/// Shared state for the HTTP server
pub struct AppState<A> {
    pub api: Arc<A>,
    pub db: Arc<Database>,
    pub config: Arc<CollectorConfig>,
}

impl<A> Clone for AppState<A> {
    fn clone(&self) -> Self {
        Self {
            api: Arc::clone(&self.api),
            db: Arc::clone(&self.db),
            config: Arc::clone(&self.config),
        }
    }
}

/// Query string for `/collect`; the limit is parsed by hand to keep errors JSON
#[derive(Deserialize)]
struct CollectParams {
    limit: Option<String>,
}

pub fn build_router<A>(state: AppState<A>) -> Router
where
    A: GitHubApi + Send + Sync + 'static,
{
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health_handler::<A>))
        .route(
            "/collect",
            get(collect_handler::<A>).post(collect_handler::<A>),
        )
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// Start the HTTP server
pub async fn start_server<A>(state: AppState<A>, bind: &str, port: u16) -> Result<()>
where
    A: GitHubApi + Send + Sync + 'static,
{
    let app = build_router(state);

    let addr = format!("{}:{}", bind, port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    eprintln!("\x1b[32mok\x1b[0m Collector listening on http://{}", addr);
    eprintln!("    POST /collect?limit=N to trigger a run");
    eprintln!("    Press Ctrl+C to stop");

    axum::serve(listener, app).await?;

    Ok(())
}

async fn health_handler<A>(State(state): State<AppState<A>>) -> ApiResult<Json<serde_json::Value>> {
    let stats = state.db.stats()?;
    Ok(Json(json!({
        "status": "ok",
        "tracked": stats.tracked,
        "stubs": stats.stubs,
        "snapshots": stats.snapshots,
    })))
}

/// Run one collection and report its summary
async fn collect_handler<A>(
    State(state): State<AppState<A>>,
    Query(params): Query<CollectParams>,
) -> ApiResult<Response>
where
    A: GitHubApi + Send + Sync + 'static,
{
    let limit = match params.limit.as_deref().map(str::trim) {
        None | Some("") => None,
        Some(raw) => Some(
            raw.parse::<usize>()
                .map_err(|_| ApiError::BadRequest(format!("limit must be a non-negative integer, got {:?}", raw)))?,
        ),
    };

    let summary = run_collection(state.api.as_ref(), &state.db, &state.config, limit).await?;

    if let crate::collect::RunOutcome::LowBudget { retry_after_secs, .. } = summary.outcome {
        let retry_after = retry_after_secs.max(1).to_string();
        return Ok((
            StatusCode::TOO_MANY_REQUESTS,
            [(header::RETRY_AFTER, retry_after)],
            Json(summary),
        )
            .into_response());
    }

    Ok((StatusCode::OK, Json(summary)).into_response())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::github::tests::repo_json;
    use crate::testing::FakeGitHub;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use tower::util::ServiceExt;

    fn app(api: FakeGitHub, db: Arc<Database>) -> Router {
        build_router(AppState {
            api: Arc::new(api),
            db,
            config: Arc::new(CollectorConfig::with_overrides(None, None, Some(0))),
        })
    }

    fn request(method: &str, uri: &str) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .body(Body::empty())
            .unwrap()
    }

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_health_reports_counts() {
        let db = Arc::new(Database::open_in_memory().unwrap());
        db.add_repo_stub("a/b", None).unwrap();

        let response = app(FakeGitHub::new(), db)
            .oneshot(request("GET", "/health"))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["status"], "ok");
        assert_eq!(body["tracked"], 1);
        assert_eq!(body["stubs"], 1);
        assert_eq!(body["snapshots"], 0);
    }

    #[tokio::test]
    async fn test_collect_returns_summary() {
        let db = Arc::new(Database::open_in_memory().unwrap());
        db.add_repo_stub("a/b", None).unwrap();
        let api = FakeGitHub::new().with_repo("a/b", repo_json(11, "a/b", 50));

        let response = app(api, Arc::clone(&db))
            .oneshot(request("POST", "/collect?limit=10"))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["status"], "completed");
        assert_eq!(body["requested_limit"], 10);
        assert_eq!(body["resolved"], 1);
        assert_eq!(body["snapshots_written"], 1);
        assert_eq!(body["budget_remaining"], 4999);
        assert_eq!(db.stats().unwrap().snapshots, 1);
    }

    #[tokio::test]
    async fn test_collect_via_get_with_nothing_due() {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let response = app(FakeGitHub::new(), db)
            .oneshot(request("GET", "/collect"))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["status"], "nothing_due");
    }

    #[tokio::test]
    async fn test_low_budget_is_429_with_retry_after() {
        let db = Arc::new(Database::open_in_memory().unwrap());
        db.add_repo_stub("a/b", None).unwrap();
        let api = FakeGitHub::new().with_rate_limit(10, 5000);

        let response = app(api, db)
            .oneshot(request("POST", "/collect"))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        let retry_after: u64 = response
            .headers()
            .get(header::RETRY_AFTER)
            .unwrap()
            .to_str()
            .unwrap()
            .parse()
            .unwrap();
        assert!((1..=3600).contains(&retry_after));
        let body = body_json(response).await;
        assert_eq!(body["status"], "low_budget");
        assert_eq!(body["remaining"], 10);
        assert_eq!(body["selected"], 0);
    }

    #[tokio::test]
    async fn test_bad_limit_is_400() {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let api = FakeGitHub::new();

        let response = app(api, db)
            .oneshot(request("POST", "/collect?limit=lots"))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_json(response).await["error"]["code"], "BAD_REQUEST");
    }

    #[tokio::test]
    async fn test_missing_token_is_500() {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let response = app(FakeGitHub::new().unauthenticated(), db)
            .oneshot(request("POST", "/collect"))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body_json(response).await["error"]["code"], "MISSING_TOKEN");
    }
}
