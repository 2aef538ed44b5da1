//! Client-side session for one reader.
//!
//! [`Reader`] wires the client stores together: who is signed in, their
//! [`ShelfStore`], the shared [`PublicMemoBoard`], and a [`SearchSession`].
//! It runs in one of two modes:
//!
//! - **remote**: everything goes through the REST API
//! - **local**: the backend was unreachable, so accounts, shelves and shared
//!   memos live in [`LocalStorage`] and searches hit the catalog directly
//!
//! [`SearchSession`] enforces last-request-wins: starting a search aborts
//! the one in flight, and a superseded search resolves to `Ok(None)`
//! without touching state.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::RwLock;
use tokio::task::AbortHandle;

use crate::auth::{LoginRequest, RegisterRequest};
use crate::catalog::{CatalogProvider, GoogleBooksProvider};
use crate::client::{ApiClient, ClientError};
use crate::config::Config;
use crate::error::UPSTREAM_MESSAGE;
use crate::gateway::{HttpGateway, LibraryGateway};
use crate::local::{LocalAccounts, LocalGateway, LocalSearchCache, LocalStorage};
use crate::models::{
    now_iso, Book, BookSearchResult, Memo, MemoAuthor, PublicMemo, SearchResponse, SessionUser,
};
use crate::normalize::BookInput;
use crate::public_memos::PublicMemoBoard;
use crate::search::normalize_query;
use crate::shelf::ShelfStore;

/// Result bound the client asks the backend for.
pub const CLIENT_MAX_RESULTS: usize = 7;

/// `<millis>-<6 hex>`.
pub fn generate_memo_id() -> String {
    format!(
        "{}-{:06x}",
        chrono::Utc::now().timestamp_millis(),
        rand::random::<u32>() & 0x00ff_ffff
    )
}

/// Where search results come from.
#[async_trait]
pub trait SearchBackend: Send + Sync {
    async fn fetch(
        &self,
        query: &str,
        user_id: Option<&str>,
        skip_cache: bool,
    ) -> Result<SearchResponse, ClientError>;

    /// Drops whatever the backend caches for `user_id`.
    async fn clear(&self, user_id: Option<&str>) -> Result<(), ClientError>;
}

/// Searches through the backend's cached search endpoint.
pub struct RemoteSearch {
    api: ApiClient,
}

impl RemoteSearch {
    pub fn new(api: ApiClient) -> Self {
        Self { api }
    }
}

#[async_trait]
impl SearchBackend for RemoteSearch {
    async fn fetch(
        &self,
        query: &str,
        user_id: Option<&str>,
        skip_cache: bool,
    ) -> Result<SearchResponse, ClientError> {
        self.api
            .search(query, user_id, skip_cache, Some(CLIENT_MAX_RESULTS))
            .await
    }

    async fn clear(&self, user_id: Option<&str>) -> Result<(), ClientError> {
        self.api.clear_search_cache(user_id, None).await
    }
}

/// Searches the catalog directly. Used in local mode.
pub struct CatalogSearch {
    provider: Arc<dyn CatalogProvider>,
    max_results: usize,
}

impl CatalogSearch {
    pub fn new(provider: Arc<dyn CatalogProvider>, max_results: usize) -> Self {
        Self {
            provider,
            max_results,
        }
    }
}

#[async_trait]
impl SearchBackend for CatalogSearch {
    async fn fetch(
        &self,
        query: &str,
        _user_id: Option<&str>,
        _skip_cache: bool,
    ) -> Result<SearchResponse, ClientError> {
        let results = self
            .provider
            .search(query.trim(), self.max_results)
            .await
            .map_err(|e| {
                tracing::warn!(provider = self.provider.name(), error = %e, "catalog lookup failed");
                ClientError::Api {
                    status: 502,
                    message: UPSTREAM_MESSAGE.to_string(),
                }
            })?;

        Ok(SearchResponse {
            query: query.trim().to_string(),
            results,
            from_cache: false,
            cached_at: None,
        })
    }

    async fn clear(&self, _user_id: Option<&str>) -> Result<(), ClientError> {
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SearchStatus {
    #[default]
    Idle,
    Loading,
    Success,
    Error,
}

#[derive(Debug, Clone, Default)]
pub struct SearchState {
    pub term: String,
    pub status: SearchStatus,
    pub results: Vec<BookSearchResult>,
    pub error: Option<String>,
    pub last_query: String,
    /// Normalized query → results seen this session.
    pub cache: LocalSearchCache,
    pub last_result_from_cache: bool,
    pub current_user_id: Option<String>,
}

/// Search state with last-request-wins semantics.
pub struct SearchSession {
    backend: Arc<dyn SearchBackend>,
    /// Persists the per-user cache (local mode only).
    storage: Option<LocalStorage>,
    state: Mutex<SearchState>,
    inflight: Mutex<Option<AbortHandle>>,
    generation: AtomicU64,
}

impl SearchSession {
    pub fn new(backend: Arc<dyn SearchBackend>, storage: Option<LocalStorage>) -> Self {
        Self {
            backend,
            storage,
            state: Mutex::new(SearchState::default()),
            inflight: Mutex::new(None),
            generation: AtomicU64::new(0),
        }
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, SearchState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn snapshot(&self) -> SearchState {
        self.lock_state().clone()
    }

    pub fn set_term(&self, term: &str) {
        self.lock_state().term = term.to_string();
    }

    /// Resets the visible search, keeping the cache.
    pub fn clear_search(&self) {
        let mut state = self.lock_state();
        state.term.clear();
        state.status = SearchStatus::Idle;
        state.results.clear();
        state.error = None;
        state.last_query.clear();
        state.last_result_from_cache = false;
    }

    /// Switches the user the cache belongs to. The in-memory cache is
    /// always dropped; in local mode the new user's cache is loaded.
    pub fn set_user(&self, user_id: Option<&str>) {
        let cache = self
            .storage
            .as_ref()
            .map(|s| s.load_search_cache(user_id))
            .unwrap_or_default();
        let mut state = self.lock_state();
        state.current_user_id = user_id.map(str::to_string);
        state.cache = cache;
    }

    /// Runs a search.
    ///
    /// Returns `Ok(None)` when a newer search superseded this one. A cached
    /// answer is returned without touching the backend unless `skip_cache`
    /// is set.
    pub async fn search(
        &self,
        query: &str,
        skip_cache: bool,
    ) -> Result<Option<SearchResponse>, ClientError> {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        self.abort_inflight();

        let normalized = normalize_query(query);
        let user_id = {
            let mut state = self.lock_state();
            let cached = if skip_cache {
                None
            } else {
                state.cache.get(&normalized).cloned()
            };

            state.error = None;
            state.last_query = query.to_string();

            if let Some(results) = cached {
                state.status = SearchStatus::Success;
                state.results = results.clone();
                state.last_result_from_cache = true;
                return Ok(Some(SearchResponse {
                    query: query.trim().to_string(),
                    results,
                    from_cache: true,
                    cached_at: None,
                }));
            }

            state.status = SearchStatus::Loading;
            state.results.clear();
            state.current_user_id.clone()
        };

        let backend = self.backend.clone();
        let owned_query = query.to_string();
        let task = tokio::spawn(async move {
            backend
                .fetch(&owned_query, user_id.as_deref(), skip_cache)
                .await
        });
        self.set_inflight(Some(task.abort_handle()));

        let outcome = match task.await {
            Ok(outcome) => outcome,
            Err(e) if e.is_cancelled() => Err(ClientError::Cancelled),
            Err(e) => std::panic::resume_unwind(e.into_panic()),
        };

        if let Err(ClientError::Cancelled) = outcome {
            tracing::debug!(query, "search cancelled");
            if self.generation.load(Ordering::SeqCst) == generation {
                self.set_inflight(None);
                self.lock_state().status = SearchStatus::Idle;
            }
            return Ok(None);
        }
        if self.generation.load(Ordering::SeqCst) != generation {
            tracing::debug!(query, "discarding stale search result");
            return Ok(None);
        }
        self.set_inflight(None);

        let mut state = self.lock_state();
        match outcome {
            Ok(response) => {
                state.status = SearchStatus::Success;
                state.results = response.results.clone();
                state.last_result_from_cache = response.from_cache;
                if !response.from_cache {
                    state.cache.insert(normalized, response.results.clone());
                    if let Some(storage) = &self.storage {
                        storage.save_search_cache(state.current_user_id.as_deref(), &state.cache);
                    }
                }
                Ok(Some(response))
            }
            Err(e) => {
                state.status = SearchStatus::Error;
                state.error = Some(e.to_string());
                state.last_result_from_cache = false;
                Err(e)
            }
        }
    }

    /// Clears the backend cache and the session cache for the current user.
    pub async fn clear_cache(&self) -> Result<(), ClientError> {
        let user_id = self.lock_state().current_user_id.clone();
        self.backend.clear(user_id.as_deref()).await?;
        if let Some(storage) = &self.storage {
            storage.clear_search_cache(user_id.as_deref());
        }

        let mut state = self.lock_state();
        state.cache.clear();
        state.last_result_from_cache = false;
        Ok(())
    }

    fn abort_inflight(&self) {
        let previous = self
            .inflight
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(handle) = previous {
            handle.abort();
        }
    }

    fn set_inflight(&self, handle: Option<AbortHandle>) {
        *self
            .inflight
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = handle;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Remote,
    Local,
}

#[derive(Debug, Clone)]
struct SignedIn {
    user: SessionUser,
    /// Session token; `None` in local mode.
    token: Option<String>,
}

enum Accounts {
    Remote(ApiClient),
    Local(LocalAccounts),
}

/// One reader's view of the application.
pub struct Reader {
    accounts: Accounts,
    shelf: ShelfStore,
    board: PublicMemoBoard,
    search: SearchSession,
    session: RwLock<Option<SignedIn>>,
}

impl Reader {
    /// Reader backed by the REST API.
    pub fn remote(api: ApiClient) -> Self {
        let gateway: Arc<dyn LibraryGateway> = Arc::new(HttpGateway::new(api.clone()));
        Self {
            shelf: ShelfStore::new(gateway.clone()),
            board: PublicMemoBoard::new(gateway),
            search: SearchSession::new(Arc::new(RemoteSearch::new(api.clone())), None),
            accounts: Accounts::Remote(api),
            session: RwLock::new(None),
        }
    }

    /// Reader backed by on-device storage and a direct catalog provider.
    pub fn local(
        storage: LocalStorage,
        provider: Arc<dyn CatalogProvider>,
        max_results: usize,
    ) -> Self {
        let gateway: Arc<dyn LibraryGateway> = Arc::new(LocalGateway::new(storage.clone()));
        Self {
            shelf: ShelfStore::new(gateway.clone()),
            board: PublicMemoBoard::new(gateway),
            search: SearchSession::new(
                Arc::new(CatalogSearch::new(provider, max_results)),
                Some(storage.clone()),
            ),
            accounts: Accounts::Local(LocalAccounts::new(storage)),
            session: RwLock::new(None),
        }
    }

    /// Probes the configured backend and falls back to local mode when it
    /// cannot be reached. A backend that answers with an error is reported,
    /// not replaced.
    pub async fn connect(config: &Config) -> Result<Self> {
        let api = ApiClient::new(&config.api_base_url())?;
        let reader = match api.health().await {
            Ok(_) => {
                tracing::info!(api = api.base_url(), "using remote backend");
                Reader::remote(api)
            }
            Err(e) if !e.is_unreachable() => {
                return Err(anyhow::Error::new(e)
                    .context(format!("Backend at {} failed its health check", api.base_url())));
            }
            Err(e) => {
                tracing::warn!(api = api.base_url(), error = %e, "backend unreachable, using local storage");
                let provider = Arc::new(GoogleBooksProvider::new(&config.catalog)?);
                Reader::local(
                    LocalStorage::new(&config.client.local_dir),
                    provider,
                    config.catalog.max_results,
                )
            }
        };
        reader.restore().await;
        reader.board.load().await;
        Ok(reader)
    }

    pub fn mode(&self) -> Mode {
        match self.accounts {
            Accounts::Remote(_) => Mode::Remote,
            Accounts::Local(_) => Mode::Local,
        }
    }

    pub fn shelf(&self) -> &ShelfStore {
        &self.shelf
    }

    pub fn board(&self) -> &PublicMemoBoard {
        &self.board
    }

    pub fn search_session(&self) -> &SearchSession {
        &self.search
    }

    pub async fn current_user(&self) -> Option<SessionUser> {
        self.session.read().await.as_ref().map(|s| s.user.clone())
    }

    /// Session token, in remote mode.
    pub async fn token(&self) -> Option<String> {
        self.session.read().await.as_ref().and_then(|s| s.token.clone())
    }

    /// Picks up a user left signed in on this device (local mode).
    async fn restore(&self) {
        if let Accounts::Local(accounts) = &self.accounts {
            if let Some(user) = accounts.current_user() {
                self.sign_in(user, None).await;
            }
        }
    }

    pub async fn register(&self, name: &str, email: &str, password: &str) -> Result<SessionUser> {
        let req = RegisterRequest {
            name: Some(name.to_string()),
            email: Some(email.to_string()),
            password: Some(password.to_string()),
        };
        let (user, token) = match &self.accounts {
            Accounts::Remote(api) => {
                let session = api.register(&req).await?;
                (session.user, Some(session.token))
            }
            Accounts::Local(accounts) => (accounts.register(&req)?, None),
        };
        self.sign_in(user.clone(), token).await;
        Ok(user)
    }

    pub async fn login(&self, email: &str, password: &str) -> Result<SessionUser> {
        let req = LoginRequest {
            email: Some(email.to_string()),
            password: Some(password.to_string()),
        };
        let (user, token) = match &self.accounts {
            Accounts::Remote(api) => {
                let session = api.login(&req).await?;
                (session.user, Some(session.token))
            }
            Accounts::Local(accounts) => (accounts.login(&req)?, None),
        };
        self.sign_in(user.clone(), token).await;
        Ok(user)
    }

    pub async fn logout(&self) {
        let previous = self.session.write().await.take();
        match (&self.accounts, previous) {
            (Accounts::Remote(api), Some(SignedIn { token: Some(token), .. })) => {
                if let Err(e) = api.logout(&token).await {
                    tracing::warn!(error = %e, "failed to close remote session");
                }
            }
            (Accounts::Local(accounts), _) => accounts.logout(),
            _ => {}
        }
        self.shelf.clear().await;
        self.search.set_user(None);
    }

    async fn sign_in(&self, user: SessionUser, token: Option<String>) {
        self.shelf.load(&user.id).await;
        self.search.set_user(Some(&user.id));
        *self.session.write().await = Some(SignedIn { user, token });
    }

    /// Searches the catalog for the signed-in user (or as a guest).
    pub async fn search(
        &self,
        query: &str,
        skip_cache: bool,
    ) -> Result<Option<SearchResponse>, ClientError> {
        self.search.search(query, skip_cache).await
    }

    /// Puts a book on the signed-in user's shelf.
    pub async fn add_book(&self, book: impl Into<BookInput>) -> Option<Book> {
        self.shelf.ensure_book_in_library(book).await
    }

    /// Writes a memo on a book, sharing it when `share` is set.
    ///
    /// Returns `None` when nobody is signed in, the body is blank, or the
    /// book has no usable id.
    pub async fn write_memo(
        &self,
        book: impl Into<BookInput>,
        body: &str,
        share: bool,
    ) -> Option<Memo> {
        let user = self.current_user().await?;
        let body = body.trim();
        if body.is_empty() {
            return None;
        }

        let input = book.into();
        let book_id = input.id()?;
        let memo = Memo {
            id: generate_memo_id(),
            body: body.to_string(),
            created_at: now_iso(),
            is_public: Some(share),
        };

        if !self.shelf.add_memo(input, memo.clone()).await {
            return None;
        }
        if share {
            self.board
                .publish(&book_id, &memo, &MemoAuthor::from(&user))
                .await;
        }
        Some(memo)
    }

    /// Shares or withdraws one of the signed-in user's memos. Returns
    /// whether the memo exists.
    pub async fn set_memo_visibility(&self, book_id: &str, memo_id: &str, public: bool) -> bool {
        let Some(user) = self.current_user().await else {
            return false;
        };
        let Some(mut memo) = self
            .shelf
            .entry(book_id)
            .await
            .and_then(|entry| entry.memos.into_iter().find(|m| m.id == memo_id))
        else {
            return false;
        };

        memo.is_public = Some(public);
        if !self.shelf.update_memo(book_id, memo_id, memo.clone()).await {
            return false;
        }
        if public {
            self.board
                .publish(book_id, &memo, &MemoAuthor::from(&user))
                .await;
        } else {
            self.board.unpublish(book_id, memo_id).await;
        }
        true
    }

    /// The signed-in user's memos on a book, public or not.
    pub async fn own_memos(&self, book_id: &str) -> Vec<Memo> {
        self.shelf
            .entry(book_id)
            .await
            .map(|entry| entry.memos)
            .unwrap_or_default()
    }

    /// Shared memos on a book written by other readers.
    pub async fn community_memos(&self, book_id: &str) -> Vec<PublicMemo> {
        let viewer = self.current_user().await.map(|u| u.id);
        self.board.community_memos(book_id, viewer.as_deref()).await
    }

    /// Loads the next page of a book's shared memos and returns the memos
    /// from other readers that it added.
    pub async fn load_more_community_memos(&self, book_id: &str) -> Result<Vec<PublicMemo>> {
        let viewer = self.current_user().await.map(|u| u.id);
        let added = self.board.load_more(book_id).await?;
        Ok(crate::public_memos::community_memos(&added, viewer.as_deref()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize};
    use std::time::Duration;

    fn result(id: &str) -> BookSearchResult {
        BookSearchResult {
            id: id.into(),
            title: id.into(),
            authors: vec![],
            description: String::new(),
            thumbnail: None,
            info_link: None,
            published_date: String::new(),
            source: "test".into(),
        }
    }

    /// Answers after a per-query delay.
    struct SlowBackend {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl SearchBackend for SlowBackend {
        async fn fetch(
            &self,
            query: &str,
            _user_id: Option<&str>,
            _skip_cache: bool,
        ) -> Result<SearchResponse, ClientError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let delay = if query.starts_with("slow") { 300 } else { 10 };
            tokio::time::sleep(Duration::from_millis(delay)).await;
            if query == "broken" {
                return Err(ClientError::Api {
                    status: 502,
                    message: UPSTREAM_MESSAGE.into(),
                });
            }
            Ok(SearchResponse {
                query: query.into(),
                results: vec![result(query)],
                from_cache: false,
                cached_at: None,
            })
        }

        async fn clear(&self, _user_id: Option<&str>) -> Result<(), ClientError> {
            Ok(())
        }
    }

    fn session() -> (Arc<SlowBackend>, Arc<SearchSession>) {
        let backend = Arc::new(SlowBackend {
            calls: AtomicUsize::new(0),
        });
        let session = Arc::new(SearchSession::new(backend.clone(), None));
        (backend, session)
    }

    #[test]
    fn test_memo_id_format() {
        let id = generate_memo_id();
        let (millis, suffix) = id.split_once('-').unwrap();
        assert!(millis.parse::<i64>().is_ok());
        assert_eq!(suffix.len(), 6);
        assert!(suffix.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[tokio::test]
    async fn test_last_request_wins() {
        let (_backend, session) = session();

        let first = {
            let session = session.clone();
            tokio::spawn(async move { session.search("slow first", false).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        let second = session.search("fast", false).await.unwrap();

        assert!(first.await.unwrap().unwrap().is_none());
        assert_eq!(second.unwrap().results[0].id, "fast");

        let state = session.snapshot();
        assert_eq!(state.status, SearchStatus::Success);
        assert_eq!(state.results[0].id, "fast");
        assert_eq!(state.last_query, "fast");
        assert!(!state.cache.contains_key("slow first"));
    }

    #[tokio::test]
    async fn test_session_cache_avoids_backend() {
        let (backend, session) = session();

        session.search("Dune", false).await.unwrap();
        let again = session.search(" dune ", false).await.unwrap().unwrap();
        assert!(again.from_cache);
        assert_eq!(backend.calls.load(Ordering::SeqCst), 1);
        assert!(session.snapshot().last_result_from_cache);

        session.search("dune", true).await.unwrap();
        assert_eq!(backend.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_failure_sets_error_state() {
        let (_backend, session) = session();
        let err = session.search("broken", false).await.unwrap_err();
        assert_eq!(err.to_string(), UPSTREAM_MESSAGE);

        let state = session.snapshot();
        assert_eq!(state.status, SearchStatus::Error);
        assert_eq!(state.error.as_deref(), Some(UPSTREAM_MESSAGE));
    }

    #[tokio::test]
    async fn test_user_change_drops_cache() {
        let (backend, session) = session();
        session.set_user(Some("u1"));
        session.search("dune", false).await.unwrap();

        session.set_user(Some("u2"));
        assert!(session.snapshot().cache.is_empty());
        session.search("dune", false).await.unwrap();
        assert_eq!(backend.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_local_cache_survives_sessions() {
        let tmp = tempfile::TempDir::new().unwrap();
        let storage = LocalStorage::new(tmp.path());
        let backend = Arc::new(SlowBackend {
            calls: AtomicUsize::new(0),
        });

        let first = SearchSession::new(backend.clone(), Some(storage.clone()));
        first.set_user(Some("u1"));
        first.search("dune", false).await.unwrap();

        let second = SearchSession::new(backend.clone(), Some(storage));
        second.set_user(Some("u1"));
        let resp = second.search("Dune", false).await.unwrap().unwrap();
        assert!(resp.from_cache);
        assert_eq!(backend.calls.load(Ordering::SeqCst), 1);

        second.clear_cache().await.unwrap();
        assert!(second.snapshot().cache.is_empty());
    }

    #[tokio::test]
    async fn test_backend_cancellation_is_silent() {
        struct Cancelling;

        #[async_trait]
        impl SearchBackend for Cancelling {
            async fn fetch(
                &self,
                _query: &str,
                _user_id: Option<&str>,
                _skip_cache: bool,
            ) -> Result<SearchResponse, ClientError> {
                Err(ClientError::Cancelled)
            }

            async fn clear(&self, _user_id: Option<&str>) -> Result<(), ClientError> {
                Ok(())
            }
        }

        let session = SearchSession::new(Arc::new(Cancelling), None);
        assert!(session.search("dune", false).await.unwrap().is_none());
        let state = session.snapshot();
        assert_eq!(state.status, SearchStatus::Idle);
        assert!(state.error.is_none());
    }

    #[derive(Default)]
    struct StubCatalog {
        calls: AtomicUsize,
        fail: AtomicBool,
    }

    #[async_trait]
    impl CatalogProvider for StubCatalog {
        fn name(&self) -> &str {
            "stub"
        }

        async fn search(&self, query: &str, _max_results: usize) -> Result<Vec<BookSearchResult>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail.load(Ordering::SeqCst) {
                anyhow::bail!("catalog returned 503");
            }
            Ok(vec![result(query)])
        }
    }

    #[tokio::test]
    async fn test_local_reader_flow() {
        let tmp = tempfile::TempDir::new().unwrap();
        let storage = LocalStorage::new(tmp.path().join("local"));
        let catalog = Arc::new(StubCatalog::default());

        let ada = Reader::local(storage.clone(), catalog.clone(), 5);
        assert_eq!(ada.mode(), Mode::Local);
        let ada_user = ada.register("Ada", "ada@example.com", "pw").await.unwrap();
        assert!(ada.token().await.is_none());

        let found = ada.search("dune", false).await.unwrap().unwrap();
        assert!(!found.from_cache);
        let book = found.results[0].clone();
        assert!(ada.add_book(book.clone()).await.is_some());
        ada.write_memo(book.clone(), "Spice everywhere", true).await.unwrap();
        ada.write_memo(book.clone(), "Just for me", false).await.unwrap();
        assert_eq!(ada.own_memos("dune").await.len(), 2);

        // A second reader on the same device sees the shared memo only.
        let bob = Reader::local(storage.clone(), catalog.clone(), 5);
        bob.register("Bob", "bob@example.com", "pw").await.unwrap();
        bob.board().load().await;
        let community = bob.community_memos("dune").await;
        assert_eq!(community.len(), 1);
        assert_eq!(community[0].body, "Spice everywhere");
        assert_eq!(community[0].author.name, "Ada");
        assert!(bob.own_memos("dune").await.is_empty());

        // The last user signed in on the device is picked up again.
        let again = Reader::local(storage.clone(), catalog.clone(), 5);
        again.restore().await;
        assert_eq!(again.current_user().await.map(|u| u.name), Some("Bob".to_string()));

        again.logout().await;
        assert!(again.current_user().await.is_none());
        let back = again.login("ada@example.com", "pw").await.unwrap();
        assert_eq!(back, ada_user);
        assert_eq!(again.own_memos("dune").await.len(), 2);

        // Ada's persisted search cache answers without the catalog.
        let cached = again.search(" Dune ", false).await.unwrap().unwrap();
        assert!(cached.from_cache);
        assert_eq!(catalog.calls.load(Ordering::SeqCst), 1);

        catalog.fail.store(true, Ordering::SeqCst);
        match again.search("dune", true).await {
            Err(ClientError::Api { status, message }) => {
                assert_eq!(status, 502);
                assert_eq!(message, UPSTREAM_MESSAGE);
            }
            other => panic!("expected upstream error, got {:?}", other.map(|r| r.is_some())),
        }
        assert_eq!(again.search_session().snapshot().status, SearchStatus::Error);
    }

    #[tokio::test]
    async fn test_connect_falls_back_when_backend_is_down() {
        let tmp = tempfile::TempDir::new().unwrap();
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };

        let mut config = Config::minimal();
        config.client.api_base_url = format!("http://127.0.0.1:{}/api", port);
        config.client.local_dir = tmp.path().join("local");

        let storage = LocalStorage::new(&config.client.local_dir);
        let user = LocalAccounts::new(storage.clone())
            .register(&RegisterRequest {
                name: Some("Ada".into()),
                email: Some("ada@example.com".into()),
                password: Some("pw".into()),
            })
            .unwrap();
        let seeded = Reader::local(storage, Arc::new(StubCatalog::default()), 5);
        seeded.restore().await;
        seeded.write_memo(result("dune"), "Shared note", true).await.unwrap();

        let reader = Reader::connect(&config).await.unwrap();
        assert_eq!(reader.mode(), Mode::Local);
        assert_eq!(reader.current_user().await, Some(user));
        assert_eq!(reader.own_memos("dune").await.len(), 1);
        assert_eq!(reader.board().memos_for_book("dune").await.len(), 1);
    }
}
