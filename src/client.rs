//! Typed HTTP client for the REST API.
//!
//! Every call returns [`ClientError`]. Non-2xx answers become
//! [`ClientError::Api`] carrying the message from the server's
//! `{ "error": { "code", "message" } }` body when there is one.

use reqwest::{Response, StatusCode, Url};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::auth::{LoginRequest, RegisterRequest};
use crate::models::{
    Account, Memo, MemoAuthor, PublicMemoIndex, PublicMemoPage, SearchResponse, SessionUser,
    UserLibrary,
};

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// The server answered with a non-success status.
    #[error("{message}")]
    Api { status: u16, message: String },

    /// The request never produced a response.
    #[error("request failed: {0}")]
    Transport(#[from] reqwest::Error),

    /// The request was aborted because a newer one replaced it.
    #[error("request cancelled")]
    Cancelled,
}

impl ClientError {
    /// True for failures that mean the backend is unreachable rather than
    /// that it refused the request.
    pub fn is_unreachable(&self) -> bool {
        matches!(self, ClientError::Transport(e) if e.is_connect() || e.is_timeout())
    }
}

pub type ClientResult<T> = std::result::Result<T, ClientError>;

/// `{user, token}` returned when a session is opened.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthSession {
    pub user: SessionUser,
    pub token: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Health {
    pub status: String,
    #[serde(default)]
    pub version: String,
}

#[derive(Deserialize)]
struct UserEnvelope {
    user: Option<SessionUser>,
}

#[derive(Deserialize)]
struct UsersEnvelope {
    #[serde(default)]
    users: Vec<Account>,
}

#[derive(Serialize, Deserialize)]
struct LibraryEnvelope {
    #[serde(default)]
    library: UserLibrary,
}

#[derive(Serialize, Deserialize)]
struct StoreEnvelope {
    #[serde(default)]
    store: PublicMemoIndex,
}

#[derive(Serialize)]
struct ShareBody<'a> {
    memo: &'a Memo,
    author: &'a MemoAuthor,
}

#[derive(Serialize)]
struct SessionBody<'a> {
    user: Option<SessionRef<'a>>,
}

#[derive(Serialize)]
struct SessionRef<'a> {
    id: &'a str,
}

#[derive(Clone)]
pub struct ApiClient {
    http: reqwest::Client,
    base: Url,
}

impl ApiClient {
    /// `base_url` is the API root, e.g. `http://localhost:3001/api`.
    pub fn new(base_url: &str) -> anyhow::Result<Self> {
        let trimmed = base_url.trim().trim_end_matches('/');
        let base = Url::parse(trimmed)
            .map_err(|e| anyhow::anyhow!("Invalid API base URL '{}': {}", base_url, e))?;
        if base.cannot_be_a_base() {
            anyhow::bail!("Invalid API base URL '{}'", base_url);
        }
        let http = reqwest::Client::builder().build()?;
        Ok(Self { http, base })
    }

    pub fn base_url(&self) -> &str {
        self.base.as_str()
    }

    /// Appends percent-encoded path segments to the base URL.
    fn url(&self, segments: &[&str]) -> Url {
        let mut url = self.base.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }
        url
    }

    pub async fn health(&self) -> ClientResult<Health> {
        let resp = self.http.get(self.url(&["health"])).send().await?;
        json(resp).await
    }

    pub async fn search(
        &self,
        query: &str,
        user_id: Option<&str>,
        skip_cache: bool,
        max_results: Option<usize>,
    ) -> ClientResult<SearchResponse> {
        let mut params: Vec<(&str, String)> = vec![("q", query.to_string())];
        if let Some(user_id) = user_id {
            params.push(("userId", user_id.to_string()));
        }
        if skip_cache {
            params.push(("skipCache", "true".to_string()));
        }
        if let Some(max) = max_results {
            params.push(("maxResults", max.to_string()));
        }

        let resp = self
            .http
            .get(self.url(&["search"]))
            .query(&params)
            .send()
            .await?;
        json(resp).await
    }

    pub async fn clear_search_cache(
        &self,
        user_id: Option<&str>,
        query: Option<&str>,
    ) -> ClientResult<()> {
        let mut params: Vec<(&str, &str)> = Vec::new();
        if let Some(user_id) = user_id {
            params.push(("userId", user_id));
        }
        if let Some(query) = query {
            params.push(("query", query));
        }

        let resp = self
            .http
            .delete(self.url(&["search", "cache"]))
            .query(&params)
            .send()
            .await?;
        empty(resp).await
    }

    pub async fn register(&self, req: &RegisterRequest) -> ClientResult<AuthSession> {
        let resp = self
            .http
            .post(self.url(&["auth", "register"]))
            .json(req)
            .send()
            .await?;
        json(resp).await
    }

    pub async fn login(&self, req: &LoginRequest) -> ClientResult<AuthSession> {
        let resp = self
            .http
            .post(self.url(&["auth", "login"]))
            .json(req)
            .send()
            .await?;
        json(resp).await
    }

    /// The user bound to `token`, if any.
    pub async fn session(&self, token: &str) -> ClientResult<Option<SessionUser>> {
        let resp = self
            .http
            .get(self.url(&["auth", "session"]))
            .bearer_auth(token)
            .send()
            .await?;
        let envelope: UserEnvelope = json(resp).await?;
        Ok(envelope.user)
    }

    /// Binds a session to an existing account, reusing `token` when given.
    pub async fn set_session(&self, token: Option<&str>, user_id: &str) -> ClientResult<AuthSession> {
        let mut req = self
            .http
            .put(self.url(&["auth", "session"]))
            .json(&SessionBody {
                user: Some(SessionRef { id: user_id }),
            });
        if let Some(token) = token {
            req = req.bearer_auth(token);
        }
        json(req.send().await?).await
    }

    pub async fn logout(&self, token: &str) -> ClientResult<()> {
        let resp = self
            .http
            .delete(self.url(&["auth", "session"]))
            .bearer_auth(token)
            .send()
            .await?;
        empty(resp).await
    }

    pub async fn users(&self) -> ClientResult<Vec<Account>> {
        let resp = self.http.get(self.url(&["auth", "users"])).send().await?;
        let envelope: UsersEnvelope = json(resp).await?;
        Ok(envelope.users)
    }

    pub async fn get_library(&self, user_id: &str) -> ClientResult<UserLibrary> {
        let resp = self
            .http
            .get(self.url(&["library", user_id]))
            .send()
            .await?;
        let envelope: LibraryEnvelope = json(resp).await?;
        Ok(envelope.library)
    }

    pub async fn put_library(&self, user_id: &str, library: &UserLibrary) -> ClientResult<()> {
        let resp = self
            .http
            .put(self.url(&["library", user_id]))
            .json(&serde_json::json!({ "library": library }))
            .send()
            .await?;
        empty(resp).await
    }

    pub async fn delete_library(&self, user_id: &str) -> ClientResult<()> {
        let resp = self
            .http
            .delete(self.url(&["library", user_id]))
            .send()
            .await?;
        empty(resp).await
    }

    pub async fn get_public_memos(&self) -> ClientResult<PublicMemoIndex> {
        let resp = self.http.get(self.url(&["public-memos"])).send().await?;
        let envelope: StoreEnvelope = json(resp).await?;
        Ok(envelope.store)
    }

    /// Replaces the whole shared-memo index.
    pub async fn put_public_memos(&self, store: &PublicMemoIndex) -> ClientResult<PublicMemoIndex> {
        let resp = self
            .http
            .put(self.url(&["public-memos"]))
            .json(&serde_json::json!({ "store": store }))
            .send()
            .await?;
        let envelope: StoreEnvelope = json(resp).await?;
        Ok(envelope.store)
    }

    /// Shares one memo. The server applies it to the stored index, so
    /// concurrent shares by other readers are kept.
    pub async fn publish_memo(
        &self,
        book_id: &str,
        memo: &Memo,
        author: &MemoAuthor,
    ) -> ClientResult<PublicMemoIndex> {
        let resp = self
            .http
            .put(self.url(&["public-memos", book_id, &memo.id]))
            .json(&ShareBody { memo, author })
            .send()
            .await?;
        let envelope: StoreEnvelope = json(resp).await?;
        Ok(envelope.store)
    }

    pub async fn unpublish_memo(&self, book_id: &str, memo_id: &str) -> ClientResult<PublicMemoIndex> {
        let resp = self
            .http
            .delete(self.url(&["public-memos", book_id, memo_id]))
            .send()
            .await?;
        let envelope: StoreEnvelope = json(resp).await?;
        Ok(envelope.store)
    }

    pub async fn public_memos_for_book(
        &self,
        book_id: &str,
        page: usize,
        limit: usize,
    ) -> ClientResult<PublicMemoPage> {
        let resp = self
            .http
            .get(self.url(&["public-memos", book_id]))
            .query(&[("page", page), ("limit", limit)])
            .send()
            .await?;
        json(resp).await
    }
}

async fn json<T: DeserializeOwned>(resp: Response) -> ClientResult<T> {
    let resp = check(resp).await?;
    Ok(resp.json().await?)
}

async fn empty(resp: Response) -> ClientResult<()> {
    check(resp).await?;
    Ok(())
}

async fn check(resp: Response) -> ClientResult<Response> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }

    let body = resp.text().await.unwrap_or_default();
    Err(ClientError::Api {
        status: status.as_u16(),
        message: error_message(status, &body),
    })
}

/// Extracts `error.message` from an error body, falling back to the
/// status reason.
fn error_message(status: StatusCode, body: &str) -> String {
    serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .and_then(|v| {
            v.get("error")
                .and_then(|e| e.get("message"))
                .and_then(|m| m.as_str())
                .map(str::to_string)
        })
        .unwrap_or_else(|| {
            status
                .canonical_reason()
                .unwrap_or("Request failed")
                .to_string()
        })
}
