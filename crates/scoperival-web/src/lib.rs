//! Axum JSON API over the competitor store and the change checker.

use std::convert::Infallible;
use std::sync::Arc;

use anyhow::Context;
use axum::{
    extract::{Path, State},
    http::{header, HeaderMap, StatusCode},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{delete, get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use jsonwebtoken::{decode, DecodingKey, Validation};
use scoperival_core::{DashboardSummary, NewCompetitor, Session, ValidationError};
use scoperival_storage::{Store, StoreError};
use scoperival_sync::{build_checker_from_env, maybe_build_scheduler, ChangeChecker, CheckError, CheckOutcome, SyncConfig};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "scoperival-web";

pub struct AppState {
    pub store: Arc<dyn Store>,
    pub checker: Arc<ChangeChecker>,
    pub jwt_secret: String,
}

impl AppState {
    pub fn new(checker: Arc<ChangeChecker>, jwt_secret: impl Into<String>) -> Self {
        Self {
            store: checker.store().clone(),
            checker,
            jwt_secret: jwt_secret.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: Uuid,
    pub exp: usize,
    #[serde(default)]
    pub email: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CreateCompetitorRequest {
    name: String,
    url: String,
}

#[derive(Debug, Serialize)]
struct CheckResponse {
    message: String,
    #[serde(flatten)]
    outcome: CheckOutcome,
}

#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn unauthorized() -> Self {
        Self {
            status: StatusCode::UNAUTHORIZED,
            message: "missing or invalid bearer token".into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(serde_json::json!({ "error": self.message })),
        )
            .into_response()
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        let status = match &err {
            StoreError::NotFound { .. } => StatusCode::NOT_FOUND,
            StoreError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            StoreError::Timeout(_) | StoreError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            StoreError::Backend(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self {
            status,
            message: err.to_string(),
        }
    }
}

impl From<CheckError> for ApiError {
    fn from(err: CheckError) -> Self {
        let status = match &err {
            CheckError::NotFound { .. } => StatusCode::NOT_FOUND,
            CheckError::SourceUnavailable { .. } => StatusCode::BAD_GATEWAY,
            CheckError::NetworkError { .. } => StatusCode::GATEWAY_TIMEOUT,
            CheckError::StoreReadFailed { .. }
            | CheckError::StoreWriteFailed { .. }
            | CheckError::Cancelled => StatusCode::SERVICE_UNAVAILABLE,
            CheckError::Unauthorized { .. } => StatusCode::UNAUTHORIZED,
        };
        Self {
            status,
            message: err.to_string(),
        }
    }
}

impl From<ValidationError> for ApiError {
    fn from(err: ValidationError) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: err.to_string(),
        }
    }
}

/// Verify the bearer token and turn its claims into a [`Session`].
pub fn session_from_headers(headers: &HeaderMap, jwt_secret: &str) -> Result<Session, ApiError> {
    let token = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.strip_prefix("Bearer "))
        .ok_or_else(ApiError::unauthorized)?;

    let token_data = decode::<Claims>(
        token,
        &DecodingKey::from_secret(jwt_secret.as_bytes()),
        &Validation::default(),
    )
    .map_err(|_| ApiError::unauthorized())?;

    let claims = token_data.claims;
    let expires_at = i64::try_from(claims.exp)
        .ok()
        .and_then(|exp| DateTime::<Utc>::from_timestamp(exp, 0));
    Ok(Session::authenticated(claims.sub, claims.email, expires_at))
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz_handler))
        .route(
            "/api/competitors",
            get(list_competitors_handler).post(create_competitor_handler),
        )
        .route("/api/competitors/{id}", delete(delete_competitor_handler))
        .route("/api/competitors/{id}/check", post(check_competitor_handler))
        .route("/api/changes", get(list_changes_handler))
        .route("/api/changes/stream", get(change_stream_handler))
        .route("/api/summary", get(summary_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(Arc::new(state))
}

pub async fn serve_from_env() -> anyhow::Result<()> {
    let config = SyncConfig::from_env();
    let port: u16 = std::env::var("SCOPERIVAL_WEB_PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(8000);
    let jwt_secret = std::env::var("SCOPERIVAL_JWT_SECRET").unwrap_or_else(|_| {
        warn!("SCOPERIVAL_JWT_SECRET not set; using development secret");
        "dev-secret-change-me".into()
    });

    let checker = Arc::new(build_checker_from_env(&config).await?);
    let scheduler = maybe_build_scheduler(&config, checker.clone()).await?;
    if let Some(sched) = &scheduler {
        sched.start().await.context("starting scheduler")?;
        info!(cron = %config.check_cron, "scheduled checks enabled");
    }

    let listener = TcpListener::bind(("0.0.0.0", port))
        .await
        .with_context(|| format!("binding port {port}"))?;
    info!(port, "listening");
    axum::serve(listener, app(AppState::new(checker, jwt_secret))).await?;
    Ok(())
}

async fn healthz_handler() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok", "service": CRATE_NAME }))
}

async fn list_competitors_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let session = session_from_headers(&headers, &state.jwt_secret)?;
    let competitors = state.store.list_competitors(&session).await?;
    Ok(Json(competitors).into_response())
}

async fn create_competitor_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<CreateCompetitorRequest>,
) -> Result<Response, ApiError> {
    let session = session_from_headers(&headers, &state.jwt_secret)?;
    let new = NewCompetitor::new(&req.name, &req.url)?;
    let competitor = state.store.create_competitor(&session, new).await?;
    Ok((StatusCode::CREATED, Json(competitor)).into_response())
}

async fn delete_competitor_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> Result<Response, ApiError> {
    let session = session_from_headers(&headers, &state.jwt_secret)?;
    state.store.delete_competitor(&session, id).await?;
    Ok(StatusCode::NO_CONTENT.into_response())
}

async fn check_competitor_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> Result<Response, ApiError> {
    let session = session_from_headers(&headers, &state.jwt_secret)?;
    let outcome = state.checker.check_by_id(&session, id).await?;
    Ok(Json(CheckResponse {
        message: outcome.message(),
        outcome,
    })
    .into_response())
}

async fn list_changes_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let session = session_from_headers(&headers, &state.jwt_secret)?;
    let records = state.store.list_change_records(&session).await?;
    Ok(Json(records).into_response())
}

async fn summary_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let session = session_from_headers(&headers, &state.jwt_secret)?;
    let competitors = state.store.list_competitors(&session).await?;
    let changes = state.store.list_change_records(&session).await?;
    Ok(Json(DashboardSummary::from_rows(&competitors, &changes, Utc::now())).into_response())
}

async fn change_stream_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let session = session_from_headers(&headers, &state.jwt_secret)?;
    let owner_id = session.user_id();
    let mut rx = state.store.change_feed().receiver();

    let stream = async_stream::stream! {
        loop {
            match rx.recv().await {
                Ok(notification) if notification.owner_id == owner_id => {
                    match Event::default().event("change").json_data(&notification.record) {
                        Ok(event) => yield Ok::<Event, Infallible>(event),
                        Err(err) => warn!(error = %err, "could not encode change event"),
                    }
                }
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(%owner_id, skipped, "change stream lagged");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    };

    Ok(Sse::new(stream)
        .keep_alive(KeepAlive::default())
        .into_response())
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use jsonwebtoken::{encode, EncodingKey, Header};
    use std::time::Duration;

    use scoperival_adapters::{Fingerprint, FingerprintError, FingerprintSource};
    use scoperival_core::NewChangeRecord;
    use scoperival_storage::MemoryStore;
    use scoperival_sync::CheckerConfig;
    use tower::ServiceExt;

    const SECRET: &str = "test-secret";

    /// Hashes to the url, except for hosts containing "down".
    struct UrlSource;

    #[async_trait]
    impl FingerprintSource for UrlSource {
        fn name(&self) -> &'static str {
            "url"
        }

        async fn fingerprint(&self, url: &str) -> Result<Fingerprint, FingerprintError> {
            if url.contains("down") {
                return Err(FingerprintError::Unavailable("Failed to scrape website".into()));
            }
            Ok(Fingerprint {
                hash: format!("hash-of-{url}"),
            })
        }
    }

    fn test_state() -> (Router, Arc<dyn Store>) {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let checker = ChangeChecker::new(store.clone(), Arc::new(UrlSource), CheckerConfig::default());
        (app(AppState::new(Arc::new(checker), SECRET)), store)
    }

    fn test_app() -> Router {
        test_state().0
    }

    fn token_for(user: Uuid) -> String {
        let claims = Claims {
            sub: user,
            exp: (Utc::now() + chrono::Duration::hours(1)).timestamp() as usize,
            email: Some("owner@example.com".into()),
        };
        encode(&Header::default(), &claims, &EncodingKey::from_secret(SECRET.as_bytes())).unwrap()
    }

    fn authed(method: &str, uri: &str, user: Uuid, body: Option<serde_json::Value>) -> Request<Body> {
        let builder = Request::builder()
            .method(method)
            .uri(uri)
            .header(header::AUTHORIZATION, format!("Bearer {}", token_for(user)));
        match body {
            Some(json) => builder
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(json.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        }
    }

    async fn json_body(resp: Response) -> serde_json::Value {
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    async fn add_competitor(app: &Router, user: Uuid, name: &str, url: &str) -> serde_json::Value {
        let resp = app
            .clone()
            .oneshot(authed(
                "POST",
                "/api/competitors",
                user,
                Some(serde_json::json!({ "name": name, "url": url })),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::CREATED);
        json_body(resp).await
    }

    #[tokio::test]
    async fn healthz_needs_no_token() {
        let resp = test_app()
            .oneshot(Request::builder().uri("/healthz").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(json_body(resp).await["status"], "ok");
    }

    #[tokio::test]
    async fn api_rejects_missing_or_forged_tokens() {
        let app = test_app();
        let missing = app
            .clone()
            .oneshot(Request::builder().uri("/api/competitors").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(missing.status(), StatusCode::UNAUTHORIZED);

        let forged = app
            .oneshot(
                Request::builder()
                    .uri("/api/competitors")
                    .header(header::AUTHORIZATION, "Bearer not-a-jwt")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(forged.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn added_competitors_are_listed_for_their_owner_only() {
        let app = test_app();
        let alice = Uuid::new_v4();
        let created = add_competitor(&app, alice, "Acme", "acme.com").await;
        assert_eq!(created["url"], "https://acme.com");
        assert_eq!(created["status"], "active");

        let mine = app
            .clone()
            .oneshot(authed("GET", "/api/competitors", alice, None))
            .await
            .unwrap();
        assert_eq!(json_body(mine).await.as_array().unwrap().len(), 1);

        let theirs = app
            .oneshot(authed("GET", "/api/competitors", Uuid::new_v4(), None))
            .await
            .unwrap();
        assert!(json_body(theirs).await.as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn invalid_competitor_is_a_bad_request() {
        let resp = test_app()
            .oneshot(authed(
                "POST",
                "/api/competitors",
                Uuid::new_v4(),
                Some(serde_json::json!({ "name": "  ", "url": "acme.com" })),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn check_reports_outcome_and_message() {
        let app = test_app();
        let user = Uuid::new_v4();
        let created = add_competitor(&app, user, "Acme", "acme.com").await;
        let id = created["id"].as_str().unwrap().to_string();

        let resp = app
            .oneshot(authed("POST", &format!("/api/competitors/{id}/check"), user, None))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = json_body(resp).await;
        assert_eq!(body["outcome"], "no_changes");
        assert_eq!(body["baseline_seeded"], true);
        assert_eq!(body["message"], "No changes found. Acme appears unchanged.");
    }

    #[tokio::test]
    async fn check_errors_map_to_status_codes() {
        let app = test_app();
        let user = Uuid::new_v4();
        let broken = add_competitor(&app, user, "Down Inc", "down.example").await;
        let id = broken["id"].as_str().unwrap().to_string();

        let unavailable = app
            .clone()
            .oneshot(authed("POST", &format!("/api/competitors/{id}/check"), user, None))
            .await
            .unwrap();
        assert_eq!(unavailable.status(), StatusCode::BAD_GATEWAY);
        assert!(json_body(unavailable).await["error"]
            .as_str()
            .unwrap()
            .contains("Failed to scrape website"));

        let stranger = app
            .clone()
            .oneshot(authed("POST", &format!("/api/competitors/{id}/check"), Uuid::new_v4(), None))
            .await
            .unwrap();
        assert_eq!(stranger.status(), StatusCode::NOT_FOUND);

        let missing = app
            .oneshot(authed(
                "POST",
                &format!("/api/competitors/{}/check", Uuid::new_v4()),
                user,
                None,
            ))
            .await
            .unwrap();
        assert_eq!(missing.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn delete_removes_competitor() {
        let app = test_app();
        let user = Uuid::new_v4();
        let created = add_competitor(&app, user, "Acme", "acme.com").await;
        let id = created["id"].as_str().unwrap().to_string();

        let resp = app
            .clone()
            .oneshot(authed("DELETE", &format!("/api/competitors/{id}"), user, None))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NO_CONTENT);

        let again = app
            .clone()
            .oneshot(authed("DELETE", &format!("/api/competitors/{id}"), user, None))
            .await
            .unwrap();
        assert_eq!(again.status(), StatusCode::NOT_FOUND);

        let list = app
            .oneshot(authed("GET", "/api/competitors", user, None))
            .await
            .unwrap();
        assert!(json_body(list).await.as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn change_stream_only_delivers_the_callers_changes() {
        let (app, store) = test_state();
        let alice = Session::service(Uuid::new_v4());
        let bob = Session::service(Uuid::new_v4());
        let mine = store
            .create_competitor(&alice, NewCompetitor::new("Acme", "acme.com").unwrap())
            .await
            .unwrap();
        let theirs = store
            .create_competitor(&bob, NewCompetitor::new("Globex", "globex.com").unwrap())
            .await
            .unwrap();

        let resp = app
            .oneshot(authed("GET", "/api/changes/stream", alice.user_id(), None))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(
            resp.headers()[header::CONTENT_TYPE].to_str().unwrap(),
            "text/event-stream"
        );
        let mut body = resp.into_body();

        store
            .insert_change_record(&bob, NewChangeRecord::content_updated(&theirs, Utc::now()))
            .await
            .unwrap();
        store
            .insert_change_record(&alice, NewChangeRecord::content_updated(&mine, Utc::now()))
            .await
            .unwrap();

        let frame = tokio::time::timeout(Duration::from_secs(1), body.frame())
            .await
            .expect("change event")
            .unwrap()
            .unwrap();
        let text = String::from_utf8(frame.into_data().unwrap().to_vec()).unwrap();
        assert!(text.starts_with("event: change"));
        assert!(text.contains(&mine.id.to_string()));
        assert!(!text.contains(&theirs.id.to_string()));

        assert!(tokio::time::timeout(Duration::from_millis(50), body.frame())
            .await
            .is_err());
    }

    #[tokio::test]
    async fn summary_reports_dashboard_figures() {
        let (app, store) = test_state();
        let owner = Session::service(Uuid::new_v4());
        let acme = add_competitor(&app, owner.user_id(), "Acme", "acme.com").await;
        add_competitor(&app, owner.user_id(), "Globex", "globex.com").await;
        let acme = store
            .get_competitor(&owner, acme["id"].as_str().unwrap().parse().unwrap())
            .await
            .unwrap()
            .unwrap();
        store
            .insert_change_record(&owner, NewChangeRecord::content_updated(&acme, Utc::now()))
            .await
            .unwrap();

        let resp = app
            .oneshot(authed("GET", "/api/summary", owner.user_id(), None))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = json_body(resp).await;
        assert_eq!(body["total_competitors"], 2);
        assert_eq!(body["checks_in_progress"], 0);
        assert_eq!(body["changes_last_24h"], 1);
    }

    #[tokio::test]
    async fn change_history_starts_empty() {
        let resp = test_app()
            .oneshot(authed("GET", "/api/changes", Uuid::new_v4(), None))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert!(json_body(resp).await.as_array().unwrap().is_empty());
    }
}
