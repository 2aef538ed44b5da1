//! REST backend.
//!
//! Serves accounts, shelves, shared memos and cached catalog search over a
//! JSON HTTP API. State lives in the [`DocumentStore`] documents.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `GET`  | `/api/health` | Liveness probe (returns version) |
//! | `POST` | `/api/auth/register` | Create an account and open a session |
//! | `POST` | `/api/auth/login` | Open a session |
//! | `GET` `PUT` `DELETE` | `/api/auth/session` | Read, bind or close the bearer token's session |
//! | `GET` `PUT` | `/api/auth/users` | Read or replace every account |
//! | `GET` `PUT` `DELETE` | `/api/library/{userId}` | One user's shelf |
//! | `GET` `PUT` | `/api/public-memos` | The shared-memo index |
//! | `GET`  | `/api/public-memos/{bookId}` | One page of a book's shared memos |
//! | `PUT` `DELETE` | `/api/public-memos/{bookId}/{memoId}` | Share or withdraw one memo |
//! | `GET`  | `/api/search` | Cached catalog search |
//! | `DELETE` | `/api/search/cache` | Invalidate cached searches |
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "bad_request", "message": "Query parameter \"q\" is required" } }
//! ```
//!
//! Error codes: `bad_request` (400), `unauthorized` (401), `not_found` (404),
//! `conflict` (409), `internal` (500), `upstream` (502), `unavailable` (503).
//! Internal errors are logged and answered with a generic message.
//!
//! # Simulation
//!
//! Every request honours `?delay=<ms>` (falling back to
//! `[simulation].latency_ms`) and fails with 503 when `?fail=true` is given
//! or a random draw falls below `[simulation].failure_rate`.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use axum::{
    extract::{rejection::JsonRejection, Path, Query, Request, State},
    http::{header, HeaderMap, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{delete, get, post, put},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tower_http::cors::{Any, CorsLayer};

use crate::auth::{self, LoginRequest, RegisterRequest};
use crate::catalog::{CatalogProvider, GoogleBooksProvider};
use crate::config::Config;
use crate::error::{Error, UPSTREAM_MESSAGE};
use crate::models::{
    Account, AuthDocument, Memo, MemoAuthor, PublicMemoIndex, SessionUser, UserLibrary,
};
use crate::public_memos::{
    normalize_store, paginate, publish_memo, unpublish_memo, DEFAULT_PAGE_LIMIT,
};
use crate::search::{SearchRequest, SearchService};
use crate::storage::{DocumentKind, DocumentStore};

#[derive(Clone)]
struct AppState {
    config: Arc<Config>,
    store: Arc<DocumentStore>,
    search: Arc<SearchService>,
}

/// Starts the server against the Google Books catalog.
///
/// Binds to `[server].bind`, creates missing documents under `[data].dir`,
/// and serves until the process is terminated.
pub async fn run_server(config: &Config) -> anyhow::Result<()> {
    let provider = Arc::new(GoogleBooksProvider::new(&config.catalog)?);
    run_server_with_provider(config, provider).await
}

/// Like [`run_server`], but searches through `provider`.
pub async fn run_server_with_provider(
    config: &Config,
    provider: Arc<dyn CatalogProvider>,
) -> anyhow::Result<()> {
    let store = Arc::new(DocumentStore::open(&config.data.dir));
    let created = store.init().await?;
    if created > 0 {
        tracing::info!(dir = %config.data.dir.display(), created, "initialized data documents");
    }

    let app = router(config, store, provider);

    let listener = tokio::net::TcpListener::bind(&config.server.bind)
        .await
        .with_context(|| format!("Failed to bind {}", config.server.bind))?;
    tracing::info!(addr = %listener.local_addr()?, "bookmemo server listening");

    axum::serve(listener, app).await?;
    Ok(())
}

/// Builds the application router over an existing store.
pub fn router(
    config: &Config,
    store: Arc<DocumentStore>,
    provider: Arc<dyn CatalogProvider>,
) -> Router {
    let state = AppState {
        config: Arc::new(config.clone()),
        search: Arc::new(SearchService::new(
            store.clone(),
            provider,
            config.catalog.max_results,
        )),
        store,
    };

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let api = Router::new()
        .route("/health", get(handle_health))
        .route("/auth/register", post(handle_register))
        .route("/auth/login", post(handle_login))
        .route(
            "/auth/session",
            get(handle_get_session)
                .put(handle_put_session)
                .delete(handle_delete_session),
        )
        .route("/auth/users", get(handle_get_users).put(handle_put_users))
        .route(
            "/library/{user_id}",
            get(handle_get_library)
                .put(handle_put_library)
                .delete(handle_delete_library),
        )
        .route(
            "/public-memos",
            get(handle_get_public_memos).put(handle_put_public_memos),
        )
        .route("/public-memos/{book_id}", get(handle_public_memos_for_book))
        .route(
            "/public-memos/{book_id}/{memo_id}",
            put(handle_share_memo).delete(handle_withdraw_memo),
        )
        .route("/search", get(handle_search))
        .route("/search/cache", delete(handle_clear_search_cache));

    Router::new()
        .nest("/api", api)
        .layer(middleware::from_fn_with_state(state.clone(), simulate))
        .layer(cors)
        .with_state(state)
}

// ============ Error response ============

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: String,
    message: String,
}

struct AppError {
    status: StatusCode,
    code: String,
    message: String,
}

impl AppError {
    fn new(status: StatusCode, code: &str, message: impl Into<String>) -> Self {
        Self {
            status,
            code: code.to_string(),
            message: message.into(),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code,
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

fn bad_request(message: impl Into<String>) -> AppError {
    AppError::new(StatusCode::BAD_REQUEST, "bad_request", message)
}

impl From<Error> for AppError {
    fn from(err: Error) -> Self {
        match err {
            Error::Validation(msg) => bad_request(msg),
            Error::Unauthorized(msg) => AppError::new(StatusCode::UNAUTHORIZED, "unauthorized", msg),
            Error::NotFound(msg) => AppError::new(StatusCode::NOT_FOUND, "not_found", msg),
            Error::Conflict(msg) => AppError::new(StatusCode::CONFLICT, "conflict", msg),
            Error::Upstream(source) => {
                tracing::warn!(error = %source, "upstream failure");
                AppError::new(StatusCode::BAD_GATEWAY, "upstream", UPSTREAM_MESSAGE)
            }
            Error::Internal(source) => {
                tracing::error!(error = ?source, "internal error");
                AppError::new(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal",
                    "Internal server error",
                )
            }
        }
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        Error::Internal(err).into()
    }
}

/// Unwraps a JSON body, turning extractor rejections into the error contract.
fn body<T>(payload: Result<Json<T>, JsonRejection>) -> Result<T, AppError> {
    payload
        .map(|Json(value)| value)
        .map_err(|rejection| bad_request(rejection.body_text()))
}

fn bearer_token(headers: &HeaderMap) -> Option<String> {
    let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    let (scheme, token) = value.trim().split_once(' ')?;
    let token = token.trim();
    (scheme.eq_ignore_ascii_case("bearer") && !token.is_empty()).then(|| token.to_string())
}

fn positive(value: Option<&str>) -> Option<usize> {
    value
        .and_then(|v| v.trim().parse::<usize>().ok())
        .filter(|n| *n > 0)
}

// ============ Simulation middleware ============

#[derive(Deserialize)]
struct SimulationParams {
    delay: Option<String>,
    fail: Option<String>,
}

async fn simulate(
    State(state): State<AppState>,
    Query(params): Query<SimulationParams>,
    request: Request,
    next: Next,
) -> Response {
    let delay_ms = params
        .delay
        .as_deref()
        .and_then(|d| d.trim().parse::<u64>().ok())
        .unwrap_or(state.config.simulation.latency_ms);
    if delay_ms > 0 {
        tokio::time::sleep(Duration::from_millis(delay_ms)).await;
    }

    let forced = params.fail.as_deref() == Some("true");
    let rate = state.config.simulation.failure_rate;
    if forced || (rate > 0.0 && rand::random::<f64>() < rate) {
        tracing::debug!(path = %request.uri().path(), "simulated failure");
        return AppError::new(
            StatusCode::SERVICE_UNAVAILABLE,
            "unavailable",
            "Simulated failure",
        )
        .into_response();
    }

    next.run(request).await
}

// ============ GET /api/health ============

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

async fn handle_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

// ============ /api/auth ============

#[derive(Serialize)]
struct SessionResponse {
    user: SessionUser,
    token: String,
}

#[derive(Serialize)]
struct UserResponse {
    user: Option<SessionUser>,
}

async fn handle_register(
    State(state): State<AppState>,
    headers: HeaderMap,
    payload: Result<Json<RegisterRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<SessionResponse>), AppError> {
    let req = body(payload)?;
    let presented = bearer_token(&headers);
    let (user, token) = state
        .store
        .update(DocumentKind::Auth, |doc: &mut AuthDocument| {
            let user = auth::register(doc, &req)?;
            let token = auth::open_session(doc, user.clone(), presented.as_deref());
            Ok::<_, Error>((user, token))
        })
        .await?;

    tracing::info!(user = %user.id, "registered account");
    Ok((StatusCode::CREATED, Json(SessionResponse { user, token })))
}

async fn handle_login(
    State(state): State<AppState>,
    headers: HeaderMap,
    payload: Result<Json<LoginRequest>, JsonRejection>,
) -> Result<Json<SessionResponse>, AppError> {
    let req = body(payload)?;
    let presented = bearer_token(&headers);
    let (user, token) = state
        .store
        .update(DocumentKind::Auth, |doc: &mut AuthDocument| {
            let user = auth::authenticate(doc, &req)?;
            let token = auth::open_session(doc, user.clone(), presented.as_deref());
            Ok::<_, Error>((user, token))
        })
        .await?;

    Ok(Json(SessionResponse { user, token }))
}

async fn handle_get_session(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<UserResponse>, AppError> {
    let user = match bearer_token(&headers) {
        Some(token) => {
            let doc: AuthDocument = state.store.read(DocumentKind::Auth).await?;
            auth::session_user(&doc, &token)
        }
        None => None,
    };
    Ok(Json(UserResponse { user }))
}

#[derive(Deserialize)]
struct PutSessionRequest {
    #[serde(default)]
    user: Option<UserRef>,
}

#[derive(Deserialize)]
struct UserRef {
    #[serde(default)]
    id: Option<String>,
}

async fn handle_put_session(
    State(state): State<AppState>,
    headers: HeaderMap,
    payload: Result<Json<PutSessionRequest>, JsonRejection>,
) -> Result<Response, AppError> {
    let req = body(payload)?;
    let token = bearer_token(&headers);

    let Some(user_ref) = req.user else {
        close_session(&state, token).await?;
        return Ok(StatusCode::NO_CONTENT.into_response());
    };
    let user_id = user_ref
        .id
        .map(|id| id.trim().to_string())
        .filter(|id| !id.is_empty())
        .ok_or_else(|| bad_request("user.id is required"))?;

    let (user, token) = state
        .store
        .update(DocumentKind::Auth, |doc: &mut AuthDocument| {
            auth::bind_session(doc, &user_id, token.as_deref())
        })
        .await?;

    Ok(Json(SessionResponse { user, token }).into_response())
}

async fn handle_delete_session(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<StatusCode, AppError> {
    close_session(&state, bearer_token(&headers)).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn close_session(state: &AppState, token: Option<String>) -> Result<(), AppError> {
    if let Some(token) = token {
        state
            .store
            .update(DocumentKind::Auth, |doc: &mut AuthDocument| {
                auth::close_session(doc, &token);
                Ok::<_, Error>(())
            })
            .await?;
    }
    Ok(())
}

#[derive(Serialize, Deserialize)]
struct UsersPayload {
    #[serde(default)]
    users: Vec<Account>,
}

async fn handle_get_users(State(state): State<AppState>) -> Result<Json<UsersPayload>, AppError> {
    let doc: AuthDocument = state.store.read(DocumentKind::Auth).await?;
    Ok(Json(UsersPayload { users: doc.users }))
}

async fn handle_put_users(
    State(state): State<AppState>,
    payload: Result<Json<UsersPayload>, JsonRejection>,
) -> Result<Json<UsersPayload>, AppError> {
    let req = body(payload)?;
    let users = state
        .store
        .update(DocumentKind::Auth, |doc: &mut AuthDocument| {
            auth::replace_users(doc, req.users)?;
            Ok::<_, Error>(doc.users.clone())
        })
        .await?;
    Ok(Json(UsersPayload { users }))
}

// ============ /api/library/{userId} ============

// Shelves are handled as raw records keyed by user id, so a record that no
// longer parses only affects its owner.
type RawLibraries = BTreeMap<String, Value>;

#[derive(Serialize, Deserialize)]
struct LibraryPayload {
    #[serde(default)]
    library: Option<UserLibrary>,
}

async fn handle_get_library(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
) -> Result<Json<LibraryPayload>, AppError> {
    let doc: RawLibraries = state.store.read(DocumentKind::Library).await?;
    let library = match doc.get(&user_id) {
        None | Some(Value::Null) => UserLibrary::new(),
        Some(raw) => serde_json::from_value(raw.clone())
            .with_context(|| format!("Malformed library for user {}", user_id))?,
    };
    Ok(Json(LibraryPayload {
        library: Some(library),
    }))
}

async fn handle_put_library(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
    payload: Result<Json<LibraryPayload>, JsonRejection>,
) -> Result<Json<LibraryPayload>, AppError> {
    let library = body(payload)?.library.unwrap_or_default();
    let stored = serde_json::to_value(&library).context("Failed to encode library")?;
    state
        .store
        .update(DocumentKind::Library, |doc: &mut RawLibraries| {
            doc.insert(user_id, stored);
            Ok::<_, Error>(())
        })
        .await?;
    Ok(Json(LibraryPayload {
        library: Some(library),
    }))
}

async fn handle_delete_library(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
) -> Result<StatusCode, AppError> {
    state
        .store
        .update(DocumentKind::Library, |doc: &mut RawLibraries| {
            doc.remove(&user_id);
            Ok::<_, Error>(())
        })
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

// ============ /api/public-memos ============

#[derive(Serialize)]
struct StoreResponse {
    store: PublicMemoIndex,
}

#[derive(Deserialize)]
struct StoreRequest {
    #[serde(default)]
    store: Value,
}

async fn handle_get_public_memos(
    State(state): State<AppState>,
) -> Result<Json<StoreResponse>, AppError> {
    let raw: Value = state.store.read(DocumentKind::PublicMemos).await?;
    Ok(Json(StoreResponse {
        store: normalize_store(&raw),
    }))
}

async fn handle_put_public_memos(
    State(state): State<AppState>,
    payload: Result<Json<StoreRequest>, JsonRejection>,
) -> Result<Json<StoreResponse>, AppError> {
    let normalized = normalize_store(&body(payload)?.store);
    let stored = serde_json::to_value(&normalized).context("Failed to encode shared memos")?;
    state
        .store
        .update(DocumentKind::PublicMemos, |doc: &mut Value| {
            *doc = stored;
            Ok::<_, Error>(())
        })
        .await?;
    Ok(Json(StoreResponse { store: normalized }))
}

#[derive(Deserialize)]
struct ShareRequest {
    memo: Memo,
    #[serde(default)]
    author: Option<MemoAuthor>,
}

/// Applies `change` to the normalized index and writes back only the
/// book's entry, leaving other books' stored records as they were.
fn change_book<F>(doc: &mut Value, book_id: &str, change: F) -> Result<PublicMemoIndex, Error>
where
    F: FnOnce(&mut PublicMemoIndex) -> bool,
{
    let mut index = normalize_store(doc);
    if !change(&mut index) {
        return Ok(index);
    }

    if !doc.is_object() {
        *doc = Value::Object(serde_json::Map::new());
    }
    if let Some(books) = doc.as_object_mut() {
        match index.get(book_id) {
            Some(list) => {
                let list = serde_json::to_value(list).context("Failed to encode shared memos")?;
                books.insert(book_id.to_string(), list);
            }
            None => {
                books.remove(book_id);
            }
        }
    }
    Ok(index)
}

async fn handle_share_memo(
    State(state): State<AppState>,
    Path((book_id, memo_id)): Path<(String, String)>,
    payload: Result<Json<ShareRequest>, JsonRejection>,
) -> Result<Json<StoreResponse>, AppError> {
    let req = body(payload)?;
    let memo = Memo {
        id: memo_id,
        ..req.memo
    };
    let author = req.author.unwrap_or_else(MemoAuthor::anonymous);

    let store = state
        .store
        .update(DocumentKind::PublicMemos, |doc: &mut Value| {
            change_book(doc, &book_id, |index| {
                publish_memo(index, &book_id, &memo, &author)
            })
        })
        .await?;
    Ok(Json(StoreResponse { store }))
}

async fn handle_withdraw_memo(
    State(state): State<AppState>,
    Path((book_id, memo_id)): Path<(String, String)>,
) -> Result<Json<StoreResponse>, AppError> {
    let store = state
        .store
        .update(DocumentKind::PublicMemos, |doc: &mut Value| {
            change_book(doc, &book_id, |index| {
                unpublish_memo(index, &book_id, &memo_id)
            })
        })
        .await?;
    Ok(Json(StoreResponse { store }))
}

#[derive(Deserialize)]
struct PageParams {
    page: Option<String>,
    limit: Option<String>,
}

async fn handle_public_memos_for_book(
    State(state): State<AppState>,
    Path(book_id): Path<String>,
    Query(params): Query<PageParams>,
) -> Result<Response, AppError> {
    let raw: Value = state.store.read(DocumentKind::PublicMemos).await?;
    let index = normalize_store(&raw);
    let list = index
        .get(&book_id)
        .filter(|list| !list.is_empty())
        .ok_or_else(|| Error::not_found(format!("No public memos for book {}", book_id)))?;

    let page = positive(params.page.as_deref()).unwrap_or(1);
    let limit = positive(params.limit.as_deref()).unwrap_or(DEFAULT_PAGE_LIMIT);
    Ok(Json(paginate(list, page, limit)).into_response())
}

// ============ /api/search ============

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SearchParams {
    q: Option<String>,
    user_id: Option<String>,
    skip_cache: Option<String>,
    max_results: Option<String>,
}

async fn handle_search(
    State(state): State<AppState>,
    Query(params): Query<SearchParams>,
) -> Result<Response, AppError> {
    let req = SearchRequest {
        query: params.q.unwrap_or_default(),
        user_id: params.user_id,
        skip_cache: params.skip_cache.as_deref() == Some("true"),
        max_results: positive(params.max_results.as_deref()),
    };
    let response = state.search.search(&req).await?;
    Ok(Json(response).into_response())
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ClearCacheParams {
    user_id: Option<String>,
    query: Option<String>,
}

async fn handle_clear_search_cache(
    State(state): State<AppState>,
    Query(params): Query<ClearCacheParams>,
) -> Result<StatusCode, AppError> {
    state
        .search
        .clear_cache(params.user_id.as_deref(), params.query.as_deref())
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn test_bearer_token() {
        let mut headers = HeaderMap::new();
        assert_eq!(bearer_token(&headers), None);

        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer abc-123"));
        assert_eq!(bearer_token(&headers).as_deref(), Some("abc-123"));

        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Basic abc"));
        assert_eq!(bearer_token(&headers), None);

        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer   "));
        assert_eq!(bearer_token(&headers), None);
    }

    #[test]
    fn test_positive() {
        assert_eq!(positive(Some("5")), Some(5));
        assert_eq!(positive(Some("0")), None);
        assert_eq!(positive(Some("-3")), None);
        assert_eq!(positive(Some("abc")), None);
        assert_eq!(positive(None), None);
    }

    #[test]
    fn test_error_mapping() {
        let err: AppError = Error::Conflict("taken".into()).into();
        assert_eq!(err.status, StatusCode::CONFLICT);
        assert_eq!(err.code, "conflict");

        let err: AppError = Error::Upstream(anyhow::anyhow!("503 from provider")).into();
        assert_eq!(err.status, StatusCode::BAD_GATEWAY);
        assert_eq!(err.message, UPSTREAM_MESSAGE);

        let err: AppError = anyhow::anyhow!("disk on fire").into();
        assert_eq!(err.status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(err.message, "Internal server error");
    }

    #[test]
    fn test_change_book_touches_only_that_book() {
        let mut doc = serde_json::json!({
            "b2": [{ "id": "x", "body": "kept as stored", "createdAt": "t", "extra": 1 }]
        });
        let memo = Memo {
            id: "m1".into(),
            body: "note".into(),
            created_at: "2024-01-01T00:00:00.000Z".into(),
            is_public: Some(true),
        };
        let author = MemoAuthor::anonymous();

        let index = change_book(&mut doc, "b1", |index| {
            publish_memo(index, "b1", &memo, &author)
        })
        .unwrap();
        assert_eq!(index["b1"][0].id, "m1");
        assert_eq!(doc["b1"][0]["body"], "note");
        assert_eq!(doc["b2"][0]["extra"], 1);

        change_book(&mut doc, "b1", |index| unpublish_memo(index, "b1", "m1")).unwrap();
        assert!(doc.get("b1").is_none());
        assert!(doc.get("b2").is_some());
    }

    #[test]
    fn test_change_book_on_empty_document() {
        let mut doc = Value::Null;
        let unchanged = change_book(&mut doc, "b1", |_| false).unwrap();
        assert!(unchanged.is_empty());
        assert!(doc.is_null());
    }
}
