//! Cached catalog search.
//!
//! Results are cached per scope (`guest`, or `user:<id>`) under the
//! normalized query (trimmed, lowercased), so `"Dune"` and `" dune "` share
//! an entry. A cached entry is returned until it is bypassed with
//! `skip_cache` or removed with [`SearchService::clear_cache`]; there is no
//! expiry.
//!
//! Used by both the `bookmemo search` CLI command and `GET /api/search`.

use std::sync::Arc;

use anyhow::Result;

use crate::catalog::{CatalogProvider, GoogleBooksProvider};
use crate::config::{Config, MAX_PROVIDER_RESULTS};
use crate::error::Error;
use crate::models::{now_iso, SearchCacheDocument, SearchCacheEntry, SearchResponse};
use crate::storage::{DocumentKind, DocumentStore};

/// Scope used when no user is given.
pub const GUEST_SCOPE: &str = "guest";

pub fn normalize_query(query: &str) -> String {
    query.trim().to_lowercase()
}

/// Resolves the cache scope for an optional user id.
pub fn resolve_scope(user_id: Option<&str>) -> String {
    match user_id.map(str::trim).filter(|id| !id.is_empty()) {
        Some(id) => format!("user:{}", id),
        None => GUEST_SCOPE.to_string(),
    }
}

/// Parameters of one search call.
#[derive(Debug, Clone, Default)]
pub struct SearchRequest {
    pub query: String,
    pub user_id: Option<String>,
    pub skip_cache: bool,
    /// Upper bound on provider results; the configured default when `None`.
    pub max_results: Option<usize>,
}

pub struct SearchService {
    store: Arc<DocumentStore>,
    provider: Arc<dyn CatalogProvider>,
    default_max_results: usize,
}

impl SearchService {
    pub fn new(
        store: Arc<DocumentStore>,
        provider: Arc<dyn CatalogProvider>,
        default_max_results: usize,
    ) -> Self {
        Self {
            store,
            provider,
            default_max_results,
        }
    }

    /// Answers from the cache when possible, otherwise asks the provider
    /// and caches the results under a fresh timestamp.
    pub async fn search(&self, req: &SearchRequest) -> Result<SearchResponse, Error> {
        let query = req.query.trim();
        if query.is_empty() {
            return Err(Error::validation("Query parameter \"q\" is required"));
        }

        let normalized = normalize_query(query);
        let scope = resolve_scope(req.user_id.as_deref());

        if !req.skip_cache {
            let cache: SearchCacheDocument = self.store.read(DocumentKind::SearchCache).await?;
            if let Some(entry) = cache.get(&scope).and_then(|s| s.get(&normalized)) {
                tracing::debug!(scope = %scope, query = %normalized, "search cache hit");
                return Ok(SearchResponse {
                    query: query.to_string(),
                    results: entry.results.clone(),
                    from_cache: true,
                    cached_at: Some(entry.cached_at.clone()),
                });
            }
        }

        let max_results = req
            .max_results
            .filter(|n| *n > 0)
            .unwrap_or(self.default_max_results)
            .min(MAX_PROVIDER_RESULTS);

        let results = self
            .provider
            .search(query, max_results)
            .await
            .map_err(|e| {
                tracing::warn!(provider = self.provider.name(), error = %e, "catalog lookup failed");
                Error::Upstream(e)
            })?;

        let entry = SearchCacheEntry {
            results: results.clone(),
            cached_at: now_iso(),
        };
        let cached = self
            .store
            .update(DocumentKind::SearchCache, |cache: &mut SearchCacheDocument| {
                cache
                    .entry(scope.clone())
                    .or_default()
                    .insert(normalized.clone(), entry);
                Ok::<_, anyhow::Error>(())
            })
            .await;
        // Fresh results are still answered when they cannot be cached.
        if let Err(e) = cached {
            tracing::warn!(scope = %scope, error = %e, "failed to cache search results");
        }

        Ok(SearchResponse {
            query: query.to_string(),
            results,
            from_cache: false,
            cached_at: None,
        })
    }

    /// Invalidates cached entries.
    ///
    /// | user | query | effect |
    /// |------|-------|--------|
    /// | yes  | yes   | remove that query from the user's scope |
    /// | yes  | no    | empty the user's scope |
    /// | no   | yes   | remove that query from every scope |
    /// | no   | no    | empty every scope |
    pub async fn clear_cache(&self, user_id: Option<&str>, query: Option<&str>) -> Result<()> {
        let has_user = user_id.map(|u| !u.trim().is_empty()).unwrap_or(false);
        let scope = resolve_scope(user_id);
        let normalized = query.map(normalize_query).filter(|q| !q.is_empty());

        self.store
            .update(DocumentKind::SearchCache, |cache: &mut SearchCacheDocument| {
                match (has_user, normalized.as_deref()) {
                    (true, Some(q)) => {
                        if let Some(entries) = cache.get_mut(&scope) {
                            entries.remove(q);
                        }
                    }
                    (true, None) => {
                        if let Some(entries) = cache.get_mut(&scope) {
                            entries.clear();
                        }
                    }
                    (false, Some(q)) => {
                        for entries in cache.values_mut() {
                            entries.remove(q);
                        }
                    }
                    (false, None) => {
                        for entries in cache.values_mut() {
                            entries.clear();
                        }
                    }
                }
                Ok::<_, anyhow::Error>(())
            })
            .await
    }
}

/// CLI entry point for `bookmemo search`.
pub async fn run_search(
    config: &Config,
    query: &str,
    user_id: Option<String>,
    skip_cache: bool,
    limit: Option<usize>,
) -> Result<()> {
    if query.trim().is_empty() {
        println!("No results.");
        return Ok(());
    }

    let store = Arc::new(DocumentStore::open(&config.data.dir));
    let provider = Arc::new(GoogleBooksProvider::new(&config.catalog)?);
    let service = SearchService::new(store, provider, config.catalog.max_results);

    let response = service
        .search(&SearchRequest {
            query: query.to_string(),
            user_id,
            skip_cache,
            max_results: limit,
        })
        .await
        .map_err(|e| anyhow::anyhow!("{}", e))?;

    if response.results.is_empty() {
        println!("No results.");
        return Ok(());
    }

    match &response.cached_at {
        Some(at) => println!("{} results (cached {})", response.results.len(), at),
        None => println!("{} results", response.results.len()),
    }
    println!();
    for (i, r) in response.results.iter().enumerate() {
        let authors = if r.authors.is_empty() {
            "(unknown author)".to_string()
        } else {
            r.authors.join(", ")
        };
        println!("{}. {} by {}", i + 1, r.title, authors);
        println!("    id: {}", r.id);
        if !r.published_date.is_empty() {
            println!("    published: {}", r.published_date);
        }
        if let Some(ref link) = r.info_link {
            println!("    {}", link);
        }
    }

    Ok(())
}

/// CLI entry point for `bookmemo cache clear`.
pub async fn run_clear_cache(
    config: &Config,
    user_id: Option<&str>,
    query: Option<&str>,
) -> Result<()> {
    let store = Arc::new(DocumentStore::open(&config.data.dir));
    let provider = Arc::new(GoogleBooksProvider::new(&config.catalog)?);
    let service = SearchService::new(store, provider, config.catalog.max_results);
    service.clear_cache(user_id, query).await?;
    println!("Search cache cleared.");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::BookSearchResult;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingCatalog {
        calls: AtomicUsize,
        fail: bool,
    }

    impl CountingCatalog {
        fn new() -> Self {
            Self {
                calls: AtomicUsize::new(0),
                fail: false,
            }
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl CatalogProvider for CountingCatalog {
        fn name(&self) -> &str {
            "counting"
        }

        async fn search(&self, query: &str, max_results: usize) -> Result<Vec<BookSearchResult>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                anyhow::bail!("catalog returned 500 Internal Server Error");
            }
            Ok((0..max_results.min(2))
                .map(|i| BookSearchResult {
                    id: format!("{}-{}", query, i),
                    title: query.to_string(),
                    authors: vec![],
                    description: String::new(),
                    thumbnail: None,
                    info_link: None,
                    published_date: String::new(),
                    source: "test".into(),
                })
                .collect())
        }
    }

    fn service(catalog: Arc<CountingCatalog>) -> SearchService {
        SearchService::new(Arc::new(DocumentStore::in_memory()), catalog, 7)
    }

    fn req(query: &str, user: Option<&str>) -> SearchRequest {
        SearchRequest {
            query: query.to_string(),
            user_id: user.map(str::to_string),
            ..Default::default()
        }
    }

    #[test]
    fn test_normalize_query() {
        assert_eq!(normalize_query("  DuNe "), "dune");
        assert_eq!(normalize_query(""), "");
    }

    #[test]
    fn test_resolve_scope() {
        assert_eq!(resolve_scope(None), GUEST_SCOPE);
        assert_eq!(resolve_scope(Some("   ")), GUEST_SCOPE);
        assert_eq!(resolve_scope(Some(" u1 ")), "user:u1");
    }

    #[tokio::test]
    async fn test_second_search_hits_cache() {
        let catalog = Arc::new(CountingCatalog::new());
        let svc = service(catalog.clone());

        let first = svc.search(&req("Dune", Some("u1"))).await.unwrap();
        assert!(!first.from_cache);
        assert!(first.cached_at.is_none());

        let second = svc.search(&req("  dune ", Some("u1"))).await.unwrap();
        assert!(second.from_cache);
        assert!(second.cached_at.is_some());
        assert_eq!(second.results, first.results);
        assert_eq!(second.query, "dune");
        assert_eq!(catalog.calls(), 1);
    }

    #[tokio::test]
    async fn test_scopes_are_separate() {
        let catalog = Arc::new(CountingCatalog::new());
        let svc = service(catalog.clone());

        svc.search(&req("Dune", Some("u1"))).await.unwrap();
        let guest = svc.search(&req("Dune", None)).await.unwrap();
        assert!(!guest.from_cache);
        assert_eq!(catalog.calls(), 2);
    }

    #[tokio::test]
    async fn test_skip_cache_refreshes() {
        let catalog = Arc::new(CountingCatalog::new());
        let svc = service(catalog.clone());

        svc.search(&req("Dune", None)).await.unwrap();
        let mut bypass = req("Dune", None);
        bypass.skip_cache = true;
        let resp = svc.search(&bypass).await.unwrap();
        assert!(!resp.from_cache);
        assert_eq!(catalog.calls(), 2);
    }

    #[tokio::test]
    async fn test_empty_query_is_rejected() {
        let catalog = Arc::new(CountingCatalog::new());
        let svc = service(catalog.clone());
        let err = svc.search(&req("   ", None)).await.unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
        assert_eq!(catalog.calls(), 0);
    }

    #[tokio::test]
    async fn test_provider_failure_is_upstream() {
        let catalog = Arc::new(CountingCatalog {
            calls: AtomicUsize::new(0),
            fail: true,
        });
        let svc = service(catalog);
        let err = svc.search(&req("Dune", None)).await.unwrap_err();
        assert!(matches!(err, Error::Upstream(_)));
        assert_eq!(err.to_string(), crate::error::UPSTREAM_MESSAGE);
    }

    #[tokio::test]
    async fn test_clear_scope_forces_refetch() {
        let catalog = Arc::new(CountingCatalog::new());
        let svc = service(catalog.clone());

        svc.search(&req("Dune", Some("u1"))).await.unwrap();
        svc.search(&req("Emma", Some("u1"))).await.unwrap();
        svc.clear_cache(Some("u1"), None).await.unwrap();

        let resp = svc.search(&req("Dune", Some("u1"))).await.unwrap();
        assert!(!resp.from_cache);
        assert_eq!(catalog.calls(), 3);
    }

    #[tokio::test]
    async fn test_clear_query_everywhere() {
        let catalog = Arc::new(CountingCatalog::new());
        let svc = service(catalog.clone());

        svc.search(&req("Dune", Some("u1"))).await.unwrap();
        svc.search(&req("Dune", None)).await.unwrap();
        svc.search(&req("Emma", None)).await.unwrap();
        svc.clear_cache(None, Some(" DUNE")).await.unwrap();

        assert!(!svc.search(&req("dune", Some("u1"))).await.unwrap().from_cache);
        assert!(!svc.search(&req("dune", None)).await.unwrap().from_cache);
        assert!(svc.search(&req("emma", None)).await.unwrap().from_cache);
    }

    #[tokio::test]
    async fn test_clear_one_query_for_user() {
        let catalog = Arc::new(CountingCatalog::new());
        let svc = service(catalog.clone());

        svc.search(&req("Dune", Some("u1"))).await.unwrap();
        svc.search(&req("Dune", Some("u2"))).await.unwrap();
        svc.clear_cache(Some("u1"), Some("dune")).await.unwrap();

        assert!(!svc.search(&req("dune", Some("u1"))).await.unwrap().from_cache);
        assert!(svc.search(&req("dune", Some("u2"))).await.unwrap().from_cache);
    }

    #[tokio::test]
    async fn test_max_results_is_capped() {
        struct Recording(std::sync::Mutex<Vec<usize>>);

        #[async_trait]
        impl CatalogProvider for Recording {
            fn name(&self) -> &str {
                "recording"
            }
            async fn search(&self, _q: &str, max: usize) -> Result<Vec<BookSearchResult>> {
                self.0.lock().unwrap().push(max);
                Ok(vec![])
            }
        }

        let catalog = Arc::new(Recording(std::sync::Mutex::new(vec![])));
        let svc = SearchService::new(Arc::new(DocumentStore::in_memory()), catalog.clone(), 7);

        let mut r = req("a", None);
        r.max_results = Some(500);
        svc.search(&r).await.unwrap();
        let mut r = req("b", None);
        r.max_results = Some(0);
        svc.search(&r).await.unwrap();

        assert_eq!(*catalog.0.lock().unwrap(), vec![40, 7]);
    }

    #[tokio::test]
    async fn test_malformed_cache_still_answers() {
        let tmp = tempfile::TempDir::new().unwrap();
        let original = r#"{"guest": {"dune": {"results": "bad"}}}"#;
        std::fs::write(tmp.path().join("searchCache.json"), original).unwrap();

        let catalog = Arc::new(CountingCatalog::new());
        let svc = SearchService::new(Arc::new(DocumentStore::open(tmp.path())), catalog.clone(), 7);
        let resp = svc.search(&req("Dune", None)).await.unwrap();
        assert!(!resp.from_cache);
        assert_eq!(resp.results.len(), 2);

        let on_disk = std::fs::read_to_string(tmp.path().join("searchCache.json")).unwrap();
        assert_eq!(on_disk, original);
    }
}
