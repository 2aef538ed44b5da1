//! On-device fallback storage.
//!
//! When the backend cannot be reached, the client keeps working against a
//! directory of small JSON files, one per key. Reads that fail for any
//! reason return the caller's fallback; failed writes and removals are
//! logged and otherwise ignored, so the client always has something to
//! show.
//!
//! | Key | Contents |
//! |-----|----------|
//! | `bookMemo_library_<userId>` | one user's shelf |
//! | `bookMemo_publicMemos` | the shared-memo index |
//! | `bookMemo_users` | accounts |
//! | `bookMemo_currentUser` | the signed-in user |
//! | `bookMemo_searchCache_user_<userId>` / `_guest` | normalized query → results |
//!
//! Each key maps to its own file: ASCII letters, digits, `_` and `-` are
//! kept and every other byte is written as `~XX` (uppercase hex).

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::Result;
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::auth::{self, LoginRequest, RegisterRequest};
use crate::error;
use crate::gateway::{empty_page, LibraryGateway};
use crate::models::{
    Account, AuthDocument, BookSearchResult, Memo, MemoAuthor, PublicMemoIndex, PublicMemoPage,
    SessionUser, UserLibrary,
};
use crate::public_memos::{self, normalize_store, paginate};

const KEY_PREFIX: &str = "bookMemo";
pub const PUBLIC_MEMOS_KEY: &str = "bookMemo_publicMemos";
pub const USERS_KEY: &str = "bookMemo_users";
pub const CURRENT_USER_KEY: &str = "bookMemo_currentUser";

pub fn library_key(user_id: &str) -> String {
    format!("{}_library_{}", KEY_PREFIX, user_id)
}

pub fn search_cache_key(user_id: Option<&str>) -> String {
    match user_id.filter(|id| !id.is_empty()) {
        Some(id) => format!("{}_searchCache_user_{}", KEY_PREFIX, id),
        None => format!("{}_searchCache_guest", KEY_PREFIX),
    }
}

fn file_stem(key: &str) -> String {
    let mut stem = String::with_capacity(key.len());
    for byte in key.bytes() {
        if byte.is_ascii_alphanumeric() || byte == b'_' || byte == b'-' {
            stem.push(char::from(byte));
        } else {
            stem.push_str(&format!("~{:02X}", byte));
        }
    }
    stem
}

/// Normalized query → results, as kept on-device.
pub type LocalSearchCache = BTreeMap<String, Vec<BookSearchResult>>;

/// Key/value JSON storage in a directory.
#[derive(Debug, Clone)]
pub struct LocalStorage {
    dir: PathBuf,
}

impl LocalStorage {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{}.json", file_stem(key)))
    }

    /// Reads `key`, returning `fallback` when it is missing, unreadable, or
    /// of the wrong shape.
    pub fn safe_read<T: DeserializeOwned>(&self, key: &str, fallback: T) -> T {
        let path = self.path_for(key);
        let raw = match std::fs::read_to_string(&path) {
            Ok(raw) if !raw.trim().is_empty() => raw,
            _ => return fallback,
        };
        match serde_json::from_str(&raw) {
            Ok(value) => value,
            Err(e) => {
                tracing::warn!(key, error = %e, "ignoring unreadable local entry");
                fallback
            }
        }
    }

    pub fn safe_write<T: Serialize>(&self, key: &str, value: &T) {
        if let Err(e) = self.write(key, value) {
            tracing::warn!(key, error = %e, "local write failed");
        }
    }

    pub fn safe_remove(&self, key: &str) {
        match std::fs::remove_file(self.path_for(key)) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => tracing::warn!(key, error = %e, "local remove failed"),
        }
    }

    fn write<T: Serialize>(&self, key: &str, value: &T) -> Result<()> {
        std::fs::create_dir_all(&self.dir)?;
        let text = serde_json::to_string(value)?;
        std::fs::write(self.path_for(key), text)?;
        Ok(())
    }

    pub fn load_search_cache(&self, user_id: Option<&str>) -> LocalSearchCache {
        self.safe_read(&search_cache_key(user_id), LocalSearchCache::new())
    }

    pub fn save_search_cache(&self, user_id: Option<&str>, cache: &LocalSearchCache) {
        self.safe_write(&search_cache_key(user_id), cache);
    }

    pub fn clear_search_cache(&self, user_id: Option<&str>) {
        self.safe_remove(&search_cache_key(user_id));
    }
}

/// [`LibraryGateway`] over [`LocalStorage`]. Never fails.
#[derive(Debug, Clone)]
pub struct LocalGateway {
    storage: LocalStorage,
}

impl LocalGateway {
    pub fn new(storage: LocalStorage) -> Self {
        Self { storage }
    }

    fn public_memos(&self) -> PublicMemoIndex {
        let raw: serde_json::Value = self.storage.safe_read(PUBLIC_MEMOS_KEY, serde_json::Value::Null);
        normalize_store(&raw)
    }
}

#[async_trait]
impl LibraryGateway for LocalGateway {
    async fn load_library(&self, user_id: &str) -> Result<UserLibrary> {
        Ok(self.storage.safe_read(&library_key(user_id), UserLibrary::new()))
    }

    async fn save_library(&self, user_id: &str, library: &UserLibrary) -> Result<()> {
        if library.is_empty() {
            self.storage.safe_remove(&library_key(user_id));
        } else {
            self.storage.safe_write(&library_key(user_id), library);
        }
        Ok(())
    }

    async fn load_public_memos(&self) -> Result<PublicMemoIndex> {
        Ok(self.public_memos())
    }

    async fn publish_memo(
        &self,
        book_id: &str,
        memo: &Memo,
        author: &MemoAuthor,
    ) -> Result<PublicMemoIndex> {
        let mut index = self.public_memos();
        if public_memos::publish_memo(&mut index, book_id, memo, author) {
            self.storage.safe_write(PUBLIC_MEMOS_KEY, &index);
        }
        Ok(index)
    }

    async fn unpublish_memo(&self, book_id: &str, memo_id: &str) -> Result<PublicMemoIndex> {
        let mut index = self.public_memos();
        if public_memos::unpublish_memo(&mut index, book_id, memo_id) {
            self.storage.safe_write(PUBLIC_MEMOS_KEY, &index);
        }
        Ok(index)
    }

    async fn public_memos_for_book(
        &self,
        book_id: &str,
        page: usize,
        limit: usize,
    ) -> Result<PublicMemoPage> {
        Ok(match self.public_memos().get(book_id) {
            Some(list) => paginate(list, page, limit),
            None => empty_page(page, limit),
        })
    }
}

/// Accounts and the current user, kept on-device.
#[derive(Debug, Clone)]
pub struct LocalAccounts {
    storage: LocalStorage,
}

impl LocalAccounts {
    pub fn new(storage: LocalStorage) -> Self {
        Self { storage }
    }

    fn document(&self) -> AuthDocument {
        AuthDocument {
            users: self.storage.safe_read(USERS_KEY, Vec::<Account>::new()),
            ..Default::default()
        }
    }

    pub fn register(&self, req: &RegisterRequest) -> error::Result<SessionUser> {
        let mut doc = self.document();
        let user = auth::register(&mut doc, req)?;
        self.storage.safe_write(USERS_KEY, &doc.users);
        self.storage.safe_write(CURRENT_USER_KEY, &user);
        Ok(user)
    }

    pub fn login(&self, req: &LoginRequest) -> error::Result<SessionUser> {
        let user = auth::authenticate(&self.document(), req)?;
        self.storage.safe_write(CURRENT_USER_KEY, &user);
        Ok(user)
    }

    pub fn logout(&self) {
        self.storage.safe_remove(CURRENT_USER_KEY);
    }

    pub fn current_user(&self) -> Option<SessionUser> {
        self.storage.safe_read(CURRENT_USER_KEY, None)
    }
}
