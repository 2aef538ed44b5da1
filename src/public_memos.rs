//! Shared memos.
//!
//! A memo its owner marks public is copied into a global index keyed by
//! book id. The copy keeps the memo's id, so republishing updates the entry
//! in place and unpublishing removes exactly that entry. The index never
//! holds an empty list for a book.
//!
//! The free functions operate on a [`PublicMemoIndex`] and are shared by
//! the server and the client. [`PublicMemoBoard`] is the client-side store
//! that holds the index in memory and tracks per-book pagination of
//! community memos. It sends each share or withdrawal to the
//! [`LibraryGateway`] as a single change, never the whole index, so readers
//! working at the same time do not overwrite each other.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::Mutex;

use crate::gateway::LibraryGateway;
use crate::models::{
    now_iso, LoadStatus, Memo, MemoAuthor, Pagination, PublicMemo, PublicMemoIndex,
    PublicMemoPage, ANONYMOUS_READER,
};

/// Page size the server uses when none is requested.
pub const DEFAULT_PAGE_LIMIT: usize = 100;

/// Page size used when loading community memos incrementally.
pub const MEMOS_PER_PAGE: usize = 10;

fn non_blank(value: &str) -> Option<&str> {
    let trimmed = value.trim();
    (!trimmed.is_empty()).then_some(trimmed)
}

/// Trims the author fields; a blank name becomes `"Anonymous reader"`.
pub fn normalize_author(author: &MemoAuthor) -> MemoAuthor {
    MemoAuthor {
        id: author.id.as_deref().and_then(non_blank).map(str::to_string),
        name: non_blank(&author.name)
            .unwrap_or(ANONYMOUS_READER)
            .to_string(),
    }
}

/// Builds the shared projection of a memo. Returns `None` for a memo with
/// a blank id or body.
pub fn create_public_memo_entry(memo: &Memo, author: &MemoAuthor) -> Option<PublicMemo> {
    let id = non_blank(&memo.id)?;
    let body = non_blank(&memo.body)?;
    let created_at = match non_blank(&memo.created_at) {
        Some(_) => memo.created_at.clone(),
        None => now_iso(),
    };

    Some(PublicMemo {
        id: id.to_string(),
        body: body.to_string(),
        created_at,
        author: normalize_author(author),
        shared_at: now_iso(),
    })
}

fn normalize_entry(entry: PublicMemo) -> Option<PublicMemo> {
    let id = non_blank(&entry.id)?.to_string();
    let body = non_blank(&entry.body)?.to_string();
    non_blank(&entry.created_at)?;

    let shared_at = if non_blank(&entry.shared_at).is_some() {
        entry.shared_at
    } else {
        entry.created_at.clone()
    };

    Some(PublicMemo {
        id,
        body,
        author: normalize_author(&entry.author),
        created_at: entry.created_at,
        shared_at,
    })
}

/// Applies the entry rules to a typed index and drops books left empty.
pub fn normalize_index(index: PublicMemoIndex) -> PublicMemoIndex {
    index
        .into_iter()
        .filter(|(book_id, _)| !book_id.is_empty())
        .filter_map(|(book_id, entries)| {
            let entries: Vec<PublicMemo> = entries.into_iter().filter_map(normalize_entry).collect();
            (!entries.is_empty()).then_some((book_id, entries))
        })
        .collect()
}

/// Parses an untrusted JSON store.
///
/// Entries without a usable id, body, or `createdAt` are dropped. An author
/// that is not an object carrying both `id` and `name` becomes anonymous,
/// and a missing `sharedAt` falls back to `createdAt`.
pub fn normalize_store(value: &Value) -> PublicMemoIndex {
    let Some(books) = value.as_object() else {
        return PublicMemoIndex::new();
    };

    let index = books
        .iter()
        .filter_map(|(book_id, entries)| {
            let entries = entries.as_array()?;
            let parsed = entries.iter().filter_map(entry_from_value).collect();
            Some((book_id.clone(), parsed))
        })
        .collect();

    normalize_index(index)
}

fn entry_from_value(value: &Value) -> Option<PublicMemo> {
    let obj = value.as_object()?;
    let text = |key: &str| obj.get(key).and_then(Value::as_str).unwrap_or_default().to_string();

    let author = match obj.get("author").and_then(Value::as_object) {
        Some(a) if a.contains_key("id") && a.contains_key("name") => MemoAuthor {
            id: a.get("id").and_then(Value::as_str).map(str::to_string),
            name: a.get("name").and_then(Value::as_str).unwrap_or_default().to_string(),
        },
        _ => MemoAuthor::anonymous(),
    };

    Some(PublicMemo {
        id: text("id"),
        body: text("body"),
        created_at: text("createdAt"),
        author,
        shared_at: text("sharedAt"),
    })
}

/// Shares `memo` under `book_id`, or refreshes an earlier share of it.
///
/// A refreshed entry keeps its original `shared_at`. Returns whether the
/// index changed.
pub fn publish_memo(
    index: &mut PublicMemoIndex,
    book_id: &str,
    memo: &Memo,
    author: &MemoAuthor,
) -> bool {
    if book_id.is_empty() {
        return false;
    }
    let Some(candidate) = create_public_memo_entry(memo, author) else {
        return false;
    };

    let mut next = index.clone();
    let list = next.entry(book_id.to_string()).or_default();
    match list.iter_mut().find(|e| e.id == candidate.id) {
        Some(existing) => {
            *existing = PublicMemo {
                shared_at: existing.shared_at.clone(),
                ..candidate
            };
        }
        None => list.push(candidate),
    }

    replace_if_changed(index, normalize_index(next))
}

/// Withdraws a shared memo. Returns whether the index changed.
pub fn unpublish_memo(index: &mut PublicMemoIndex, book_id: &str, memo_id: &str) -> bool {
    if book_id.is_empty() || memo_id.is_empty() {
        return false;
    }
    let Some(list) = index.get(book_id) else {
        return false;
    };
    if !list.iter().any(|e| e.id == memo_id) {
        return false;
    }

    let mut next = index.clone();
    if let Some(list) = next.get_mut(book_id) {
        list.retain(|e| e.id != memo_id);
        if list.is_empty() {
            next.remove(book_id);
        }
    }

    replace_if_changed(index, normalize_index(next))
}

fn replace_if_changed(index: &mut PublicMemoIndex, next: PublicMemoIndex) -> bool {
    if *index == next {
        return false;
    }
    *index = next;
    true
}

/// Slices one page (1-based) out of a book's memo list.
pub fn paginate(list: &[PublicMemo], page: usize, limit: usize) -> PublicMemoPage {
    let page = page.max(1);
    let limit = limit.max(1);
    let start = (page - 1).saturating_mul(limit).min(list.len());
    let end = start.saturating_add(limit).min(list.len());

    PublicMemoPage {
        memos: list[start..end].to_vec(),
        pagination: Pagination {
            page,
            limit,
            total_count: list.len(),
            has_more: end < list.len(),
        },
    }
}

/// Shared memos written by someone other than `viewer_id`.
pub fn community_memos(list: &[PublicMemo], viewer_id: Option<&str>) -> Vec<PublicMemo> {
    list.iter()
        .filter(|m| viewer_id.is_none() || m.author.id.as_deref() != viewer_id)
        .cloned()
        .collect()
}

/// Incremental-loading state of one book's community memos.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BookPageState {
    pub page: usize,
    pub limit: usize,
    pub total_count: usize,
    pub has_more: bool,
    pub loading: bool,
}

#[derive(Default)]
struct BoardState {
    store: PublicMemoIndex,
    status: LoadStatus,
    error: Option<String>,
    pages: HashMap<String, BookPageState>,
}

/// Client-side public-memo store.
pub struct PublicMemoBoard {
    gateway: Arc<dyn LibraryGateway>,
    state: Mutex<BoardState>,
}

impl PublicMemoBoard {
    pub fn new(gateway: Arc<dyn LibraryGateway>) -> Self {
        Self {
            gateway,
            state: Mutex::new(BoardState::default()),
        }
    }

    /// Fetches the whole index. On failure the board is emptied and the
    /// error kept for display.
    pub async fn load(&self) {
        let mut state = self.state.lock().await;
        state.status = LoadStatus::Loading;
        state.error = None;

        match self.gateway.load_public_memos().await {
            Ok(store) => {
                state.store = normalize_index(store);
                state.status = LoadStatus::Succeeded;
            }
            Err(e) => {
                tracing::warn!(error = %e, "failed to load public memos");
                state.store = PublicMemoIndex::new();
                state.status = LoadStatus::Failed;
                state.error = Some(e.to_string());
            }
        }
    }

    pub async fn status(&self) -> (LoadStatus, Option<String>) {
        let state = self.state.lock().await;
        (state.status, state.error.clone())
    }

    pub async fn snapshot(&self) -> PublicMemoIndex {
        self.state.lock().await.store.clone()
    }

    pub async fn memos_for_book(&self, book_id: &str) -> Vec<PublicMemo> {
        let state = self.state.lock().await;
        state.store.get(book_id).cloned().unwrap_or_default()
    }

    pub async fn community_memos(&self, book_id: &str, viewer_id: Option<&str>) -> Vec<PublicMemo> {
        let state = self.state.lock().await;
        state
            .store
            .get(book_id)
            .map(|list| community_memos(list, viewer_id))
            .unwrap_or_default()
    }

    /// Shares a memo. When the local index changed, the share is sent to
    /// the gateway and the board adopts the index it returns.
    pub async fn publish(&self, book_id: &str, memo: &Memo, author: &MemoAuthor) -> bool {
        let mut state = self.state.lock().await;
        let changed = publish_memo(&mut state.store, book_id, memo, author);
        if changed {
            let result = self.gateway.publish_memo(book_id, memo, author).await;
            adopt(&mut state.store, result, "publish");
        }
        changed
    }

    /// Withdraws a memo, sending the change to the gateway when the local
    /// index had it.
    pub async fn unpublish(&self, book_id: &str, memo_id: &str) -> bool {
        let mut state = self.state.lock().await;
        let changed = unpublish_memo(&mut state.store, book_id, memo_id);
        if changed {
            let result = self.gateway.unpublish_memo(book_id, memo_id).await;
            adopt(&mut state.store, result, "unpublish");
        }
        changed
    }

    pub async fn page_state(&self, book_id: &str) -> Option<BookPageState> {
        self.state.lock().await.pages.get(book_id).copied()
    }

    /// Fetches the next page of a book's shared memos.
    ///
    /// The first page replaces what the board holds for the book; later
    /// pages append memos not seen yet. Returns the memos added. Once the
    /// last page is loaded this is a no-op.
    pub async fn load_more(&self, book_id: &str) -> anyhow::Result<Vec<PublicMemo>> {
        let page = {
            let mut state = self.state.lock().await;
            let next = match state.pages.get(book_id) {
                Some(p) if p.loading || !p.has_more => return Ok(Vec::new()),
                Some(p) => p.page + 1,
                None => 1,
            };
            let entry = state.pages.entry(book_id.to_string()).or_insert(BookPageState {
                page: 0,
                limit: MEMOS_PER_PAGE,
                total_count: 0,
                has_more: true,
                loading: false,
            });
            entry.loading = true;
            next
        };

        let result = self
            .gateway
            .public_memos_for_book(book_id, page, MEMOS_PER_PAGE)
            .await;

        let mut state = self.state.lock().await;
        let fetched = match result {
            Ok(fetched) => fetched,
            Err(e) => {
                if let Some(p) = state.pages.get_mut(book_id) {
                    p.loading = false;
                }
                return Err(e);
            }
        };

        let added = if page == 1 {
            fetched.memos.clone()
        } else {
            let seen: HashSet<String> = state
                .store
                .get(book_id)
                .map(|list| list.iter().map(|m| m.id.clone()).collect())
                .unwrap_or_default();
            fetched
                .memos
                .iter()
                .filter(|m| !seen.contains(&m.id))
                .cloned()
                .collect()
        };

        if page == 1 {
            state.store.insert(book_id.to_string(), added.clone());
        } else {
            state
                .store
                .entry(book_id.to_string())
                .or_default()
                .extend(added.iter().cloned());
        }
        if state.store.get(book_id).is_some_and(Vec::is_empty) {
            state.store.remove(book_id);
        }

        state.pages.insert(
            book_id.to_string(),
            BookPageState {
                page: fetched.pagination.page,
                limit: fetched.pagination.limit,
                total_count: fetched.pagination.total_count,
                has_more: fetched.pagination.has_more,
                loading: false,
            },
        );

        Ok(added)
    }

}

/// Takes the persisted index after a change. On failure the optimistic
/// local change stays.
fn adopt(store: &mut PublicMemoIndex, result: anyhow::Result<PublicMemoIndex>, action: &str) {
    match result {
        Ok(persisted) => *store = normalize_index(persisted),
        Err(e) => tracing::warn!(action, error = %e, "failed to persist public memo change"),
    }
}

/// CLI entry point for `bookmemo memos`.
pub async fn run_show_memos(config: &crate::config::Config, book_id: &str) -> anyhow::Result<()> {
    let store = crate::storage::DocumentStore::open(&config.data.dir);
    let raw: Value = store
        .read(crate::storage::DocumentKind::PublicMemos)
        .await?;
    let index = normalize_store(&raw);
    let Some(list) = index.get(book_id).filter(|l| !l.is_empty()) else {
        println!("No public memos for {}.", book_id);
        return Ok(());
    };

    println!("{} public memos for {}", list.len(), book_id);
    for memo in list {
        println!();
        println!("{} (shared {})", memo.author.name, memo.shared_at);
        println!("    {}", memo.body);
    }
    Ok(())
}
