//! The signed-in user's shelf.
//!
//! [`ShelfStore`] holds one user's books and memos in memory and writes the
//! whole shelf through a [`LibraryGateway`] after every mutation that
//! changed something. Mutations without a loaded user are silent no-ops.

use std::sync::Arc;

use tokio::sync::Mutex;

use crate::gateway::LibraryGateway;
use crate::models::{Book, LibraryEntry, LoadStatus, Memo, UserLibrary};
use crate::normalize::{merge_book, normalize_book, BookInput};

#[derive(Debug, Clone, Default)]
pub struct ShelfState {
    pub user_id: Option<String>,
    pub items: UserLibrary,
    pub status: LoadStatus,
    pub error: Option<String>,
}

pub struct ShelfStore {
    gateway: Arc<dyn LibraryGateway>,
    state: Mutex<ShelfState>,
}

impl ShelfStore {
    pub fn new(gateway: Arc<dyn LibraryGateway>) -> Self {
        Self {
            gateway,
            state: Mutex::new(ShelfState::default()),
        }
    }

    /// Loads `user_id`'s shelf, replacing whatever was held before. A failed
    /// load leaves an empty shelf bound to the user.
    pub async fn load(&self, user_id: &str) {
        let mut state = self.state.lock().await;
        state.user_id = Some(user_id.to_string());
        state.status = LoadStatus::Loading;
        state.error = None;

        match self.gateway.load_library(user_id).await {
            Ok(items) => {
                state.items = items;
                state.status = LoadStatus::Succeeded;
            }
            Err(e) => {
                tracing::warn!(user = user_id, error = %e, "failed to load shelf");
                state.items = UserLibrary::new();
                state.status = LoadStatus::Failed;
                state.error = Some(e.to_string());
            }
        }
    }

    /// Forgets the user and their shelf.
    pub async fn clear(&self) {
        *self.state.lock().await = ShelfState::default();
    }

    pub async fn snapshot(&self) -> ShelfState {
        self.state.lock().await.clone()
    }

    pub async fn entry(&self, book_id: &str) -> Option<LibraryEntry> {
        self.state.lock().await.items.get(book_id).cloned()
    }

    /// Puts a book on the shelf or refreshes its metadata.
    ///
    /// Nothing happens when the input has no usable id or the shelf already
    /// holds an identical book. Existing memos are kept. Returns the
    /// canonical book when the input was usable.
    pub async fn ensure_book_in_library(&self, input: impl Into<BookInput>) -> Option<Book> {
        let book = normalize_book(input)?;

        let mut state = self.state.lock().await;
        let user_id = state.user_id.clone()?;

        let next = match state.items.get(&book.id) {
            Some(existing) if existing.book == book => return Some(book),
            Some(existing) => LibraryEntry {
                book: merge_book(&existing.book, book.clone()),
                memos: existing.memos.clone(),
            },
            None => LibraryEntry {
                book: book.clone(),
                memos: Vec::new(),
            },
        };
        state.items.insert(book.id.clone(), next);
        self.persist(&user_id, &state.items).await;
        Some(book)
    }

    /// Appends a memo to a book, putting the book on the shelf first if
    /// needed. Returns whether the memo was stored.
    pub async fn add_memo(&self, input: impl Into<BookInput>, memo: Memo) -> bool {
        let Some(book) = normalize_book(input) else {
            return false;
        };

        let mut state = self.state.lock().await;
        let Some(user_id) = state.user_id.clone() else {
            return false;
        };

        state
            .items
            .entry(book.id.clone())
            .or_insert_with(|| LibraryEntry {
                book,
                memos: Vec::new(),
            })
            .memos
            .push(memo);
        self.persist(&user_id, &state.items).await;
        true
    }

    /// Replaces the memo with id `memo_id` in place. Returns whether a memo
    /// was replaced.
    pub async fn update_memo(&self, book_id: &str, memo_id: &str, updated: Memo) -> bool {
        let mut state = self.state.lock().await;
        let Some(user_id) = state.user_id.clone() else {
            return false;
        };
        let Some(slot) = state
            .items
            .get_mut(book_id)
            .and_then(|entry| entry.memos.iter_mut().find(|m| m.id == memo_id))
        else {
            return false;
        };

        *slot = updated;
        self.persist(&user_id, &state.items).await;
        true
    }

    async fn persist(&self, user_id: &str, items: &UserLibrary) {
        if let Err(e) = self.gateway.save_library(user_id, items).await {
            tracing::warn!(user = user_id, error = %e, "failed to persist shelf");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::empty_page;
    use crate::models::{MemoAuthor, PublicMemoIndex, PublicMemoPage};
    use crate::normalize::BookForm;
    use async_trait::async_trait;
    use serde_json::json;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingGateway {
        writes: AtomicUsize,
        shelves: std::sync::Mutex<HashMap<String, UserLibrary>>,
    }

    impl CountingGateway {
        fn writes(&self) -> usize {
            self.writes.load(Ordering::SeqCst)
        }

        fn stored(&self, user_id: &str) -> UserLibrary {
            self.shelves.lock().unwrap().get(user_id).cloned().unwrap_or_default()
        }
    }

    #[async_trait]
    impl LibraryGateway for CountingGateway {
        async fn load_library(&self, user_id: &str) -> anyhow::Result<UserLibrary> {
            Ok(self.stored(user_id))
        }
        async fn save_library(&self, user_id: &str, library: &UserLibrary) -> anyhow::Result<()> {
            self.writes.fetch_add(1, Ordering::SeqCst);
            self.shelves
                .lock()
                .unwrap()
                .insert(user_id.to_string(), library.clone());
            Ok(())
        }
        async fn load_public_memos(&self) -> anyhow::Result<PublicMemoIndex> {
            Ok(PublicMemoIndex::new())
        }
        async fn publish_memo(
            &self,
            _book_id: &str,
            _memo: &Memo,
            _author: &MemoAuthor,
        ) -> anyhow::Result<PublicMemoIndex> {
            Ok(PublicMemoIndex::new())
        }
        async fn unpublish_memo(
            &self,
            _book_id: &str,
            _memo_id: &str,
        ) -> anyhow::Result<PublicMemoIndex> {
            Ok(PublicMemoIndex::new())
        }
        async fn public_memos_for_book(
            &self,
            _book_id: &str,
            page: usize,
            limit: usize,
        ) -> anyhow::Result<PublicMemoPage> {
            Ok(empty_page(page, limit))
        }
    }

    fn dune() -> BookForm {
        serde_json::from_value(json!({
            "id": "dune",
            "title": "Dune",
            "authors": ["Frank Herbert"],
            "description": "Spice"
        }))
        .unwrap()
    }

    fn memo(id: &str, body: &str) -> Memo {
        Memo {
            id: id.into(),
            body: body.into(),
            created_at: "2024-01-01T00:00:00.000Z".into(),
            is_public: None,
        }
    }

    async fn signed_in(gateway: Arc<CountingGateway>) -> ShelfStore {
        let store = ShelfStore::new(gateway);
        store.load("u1").await;
        store
    }

    #[tokio::test]
    async fn test_ensure_twice_writes_once() {
        let gateway = Arc::new(CountingGateway::default());
        let store = signed_in(gateway.clone()).await;

        assert!(store.ensure_book_in_library(dune()).await.is_some());
        assert!(store.ensure_book_in_library(dune()).await.is_some());
        assert_eq!(gateway.writes(), 1);
        assert!(gateway.stored("u1").contains_key("dune"));
    }

    #[tokio::test]
    async fn test_ensure_merges_and_keeps_memos() {
        let gateway = Arc::new(CountingGateway::default());
        let store = signed_in(gateway.clone()).await;

        store.add_memo(dune(), memo("m1", "note")).await;
        let mut updated = dune();
        updated.title = Some(json!("Dune (Deluxe)"));
        store.ensure_book_in_library(updated).await;

        let entry = store.entry("dune").await.unwrap();
        assert_eq!(entry.book.title, "Dune (Deluxe)");
        assert_eq!(entry.memos.len(), 1);
        assert_eq!(gateway.writes(), 2);
    }

    #[tokio::test]
    async fn test_unusable_book_is_ignored() {
        let gateway = Arc::new(CountingGateway::default());
        let store = signed_in(gateway.clone()).await;

        let no_id: BookForm = serde_json::from_value(json!({ "title": "Nameless" })).unwrap();
        assert!(store.ensure_book_in_library(no_id).await.is_none());
        assert_eq!(gateway.writes(), 0);
    }

    #[tokio::test]
    async fn test_mutations_without_user_are_noops() {
        let gateway = Arc::new(CountingGateway::default());
        let store = ShelfStore::new(gateway.clone());

        assert!(store.ensure_book_in_library(dune()).await.is_none());
        assert!(!store.add_memo(dune(), memo("m1", "x")).await);
        assert!(!store.update_memo("dune", "m1", memo("m1", "y")).await);
        assert_eq!(gateway.writes(), 0);
        assert!(store.snapshot().await.items.is_empty());
    }

    #[tokio::test]
    async fn test_add_memo_appends_in_order() {
        let gateway = Arc::new(CountingGateway::default());
        let store = signed_in(gateway.clone()).await;

        store.add_memo(dune(), memo("m1", "first")).await;
        store.add_memo(dune(), memo("m2", "second")).await;

        let ids: Vec<_> = gateway.stored("u1")["dune"]
            .memos
            .iter()
            .map(|m| m.id.clone())
            .collect();
        assert_eq!(ids, vec!["m1", "m2"]);
    }

    #[tokio::test]
    async fn test_update_memo_in_place() {
        let gateway = Arc::new(CountingGateway::default());
        let store = signed_in(gateway.clone()).await;
        store.add_memo(dune(), memo("m1", "first")).await;
        store.add_memo(dune(), memo("m2", "second")).await;

        let mut shared = memo("m1", "first");
        shared.is_public = Some(true);
        assert!(store.update_memo("dune", "m1", shared).await);
        assert!(!store.update_memo("dune", "missing", memo("x", "x")).await);
        assert!(!store.update_memo("other", "m1", memo("m1", "x")).await);

        let entry = store.entry("dune").await.unwrap();
        assert!(entry.memos[0].is_public());
        assert_eq!(entry.memos[1].id, "m2");
        assert_eq!(gateway.writes(), 3);
    }

    #[tokio::test]
    async fn test_load_replaces_previous_user() {
        let gateway = Arc::new(CountingGateway::default());
        let store = signed_in(gateway.clone()).await;
        store.add_memo(dune(), memo("m1", "first")).await;

        store.load("u2").await;
        let state = store.snapshot().await;
        assert_eq!(state.user_id.as_deref(), Some("u2"));
        assert!(state.items.is_empty());
        assert_eq!(state.status, LoadStatus::Succeeded);

        store.clear().await;
        assert!(store.snapshot().await.user_id.is_none());
    }
}
