//! Core data models shared by the server, the stores, and the client.
//!
//! All types serialize with camelCase keys so the persisted JSON documents
//! and the HTTP payloads keep the same shape.

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeMap;

/// Display name used for shared memos whose author has no usable name.
pub const ANONYMOUS_READER: &str = "Anonymous reader";

/// Title used when a book arrives without one.
pub const UNTITLED: &str = "Untitled";

/// Canonical book record. `id` never changes once assigned.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Book {
    pub id: String,
    pub title: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub description: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub authors: Vec<String>,
    #[serde(default)]
    pub thumbnail: Option<String>,
    #[serde(default)]
    pub info_link: Option<String>,
    #[serde(default)]
    pub published_date: Option<String>,
    #[serde(default)]
    pub source: Option<String>,
}

/// A free-text note attached to a book on a user's shelf.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Memo {
    pub id: String,
    pub body: String,
    pub created_at: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_public: Option<bool>,
}

impl Memo {
    pub fn is_public(&self) -> bool {
        self.is_public.unwrap_or(false)
    }
}

/// A book on a shelf together with its memos, in insertion order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LibraryEntry {
    pub book: Book,
    #[serde(default, deserialize_with = "null_as_default")]
    pub memos: Vec<Memo>,
}

/// One user's shelf, keyed by book id.
pub type UserLibrary = BTreeMap<String, LibraryEntry>;

/// Every shelf, keyed by user id.
pub type LibraryDocument = BTreeMap<String, UserLibrary>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoAuthor {
    pub id: Option<String>,
    pub name: String,
}

impl MemoAuthor {
    pub fn anonymous() -> Self {
        Self {
            id: None,
            name: ANONYMOUS_READER.to_string(),
        }
    }
}

impl From<&SessionUser> for MemoAuthor {
    fn from(user: &SessionUser) -> Self {
        Self {
            id: Some(user.id.clone()),
            name: user.name.clone(),
        }
    }
}

/// Projection of a memo its owner chose to share.
///
/// `id` matches the originating [`Memo`]; `shared_at` is set on first
/// publish and kept across republishes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublicMemo {
    pub id: String,
    pub body: String,
    pub created_at: String,
    pub author: MemoAuthor,
    pub shared_at: String,
}

/// Shared memos keyed by book id. Never holds an empty list.
pub type PublicMemoIndex = BTreeMap<String, Vec<PublicMemo>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Pagination {
    pub page: usize,
    pub limit: usize,
    pub total_count: usize,
    pub has_more: bool,
}

/// One page of a book's shared memos.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublicMemoPage {
    pub memos: Vec<PublicMemo>,
    pub pagination: Pagination,
}

/// Stored account. `password` holds an Argon2 PHC string.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    pub id: String,
    pub name: String,
    pub email: String,
    pub password: String,
}

/// The public view of an account, bound to a session token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionUser {
    pub id: String,
    pub name: String,
    pub email: String,
}

impl From<&Account> for SessionUser {
    fn from(account: &Account) -> Self {
        Self {
            id: account.id.clone(),
            name: account.name.clone(),
            email: account.email.clone(),
        }
    }
}

/// A signed-in user plus when the token was issued.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionRecord {
    #[serde(flatten)]
    pub user: SessionUser,
    #[serde(default)]
    pub issued_at: String,
}

/// Accounts plus the token → session map.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthDocument {
    #[serde(default)]
    pub users: Vec<Account>,
    #[serde(default)]
    pub sessions: BTreeMap<String, SessionRecord>,
}

/// Catalog search result in canonical shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BookSearchResult {
    pub id: String,
    pub title: String,
    pub authors: Vec<String>,
    pub description: String,
    pub thumbnail: Option<String>,
    pub info_link: Option<String>,
    pub published_date: String,
    pub source: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchCacheEntry {
    pub results: Vec<BookSearchResult>,
    pub cached_at: String,
}

/// Scope (`guest` or `user:<id>`) → normalized query → cached results.
pub type SearchCacheDocument = BTreeMap<String, BTreeMap<String, SearchCacheEntry>>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchResponse {
    pub query: String,
    pub results: Vec<BookSearchResult>,
    pub from_cache: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cached_at: Option<String>,
}

/// Progress of a client store's initial load.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LoadStatus {
    #[default]
    Idle,
    Loading,
    Succeeded,
    Failed,
}

/// Reads `null` as the type's default.
fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de> + Default,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

/// Current time as an RFC 3339 UTC timestamp with millisecond precision.
pub fn now_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}
