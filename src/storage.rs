//! Document storage for the backend.
//!
//! State lives in four independent JSON documents (see [`DocumentKind`]).
//! A [`DocumentBackend`] moves raw document text in and out of a medium
//! (a data directory, or memory for tests); [`DocumentStore`] layers typed
//! access on top and serializes every read-modify-write of a document
//! behind that document's own lock, so concurrent requests cannot lose
//! each other's updates.
//!
//! A document that is missing, is not JSON, or is not a JSON object reads
//! as its default value and the next successful write replaces it. An
//! object whose records do not fit the document type is different: reads
//! still fall back to the default, but [`DocumentStore::update`] refuses to
//! write over it so that one bad record cannot wipe everyone else's data.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::Mutex;

use crate::models::{AuthDocument, LibraryDocument, PublicMemoIndex, SearchCacheDocument};

/// The persisted documents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DocumentKind {
    /// Shelves keyed by user id.
    Library,
    /// Accounts and sessions.
    Auth,
    /// Shared memos keyed by book id.
    PublicMemos,
    /// Search results keyed by scope, then normalized query.
    SearchCache,
}

impl DocumentKind {
    pub const ALL: [DocumentKind; 4] = [
        DocumentKind::Library,
        DocumentKind::Auth,
        DocumentKind::PublicMemos,
        DocumentKind::SearchCache,
    ];

    pub fn file_name(self) -> &'static str {
        match self {
            DocumentKind::Library => "library.json",
            DocumentKind::Auth => "auth.json",
            DocumentKind::PublicMemos => "publicMemos.json",
            DocumentKind::SearchCache => "searchCache.json",
        }
    }

    /// Serialized empty document.
    fn default_contents(self) -> Result<String> {
        let text = match self {
            DocumentKind::Library => serde_json::to_string_pretty(&LibraryDocument::new())?,
            DocumentKind::Auth => serde_json::to_string_pretty(&AuthDocument::default())?,
            DocumentKind::PublicMemos => serde_json::to_string_pretty(&PublicMemoIndex::new())?,
            DocumentKind::SearchCache => {
                serde_json::to_string_pretty(&SearchCacheDocument::new())?
            }
        };
        Ok(text)
    }
}

/// Raw storage medium for whole documents.
#[async_trait]
pub trait DocumentBackend: Send + Sync {
    /// Returns the document text, or `None` if it has never been written.
    async fn read(&self, kind: DocumentKind) -> Result<Option<String>>;

    /// Replaces the document text.
    async fn write(&self, kind: DocumentKind, contents: &str) -> Result<()>;
}

/// Stores each document as a file in a data directory.
///
/// Writes go to a temporary sibling file which is then renamed over the
/// target, so a crash mid-write never leaves a truncated document.
pub struct FileBackend {
    dir: PathBuf,
}

impl FileBackend {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, kind: DocumentKind) -> PathBuf {
        self.dir.join(kind.file_name())
    }
}

#[async_trait]
impl DocumentBackend for FileBackend {
    async fn read(&self, kind: DocumentKind) -> Result<Option<String>> {
        let path = self.path_for(kind);
        match tokio::fs::read_to_string(&path).await {
            Ok(text) => Ok(Some(text)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e).with_context(|| format!("Failed to read {}", path.display())),
        }
    }

    async fn write(&self, kind: DocumentKind, contents: &str) -> Result<()> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .with_context(|| format!("Failed to create data dir {}", self.dir.display()))?;

        let path = self.path_for(kind);
        let tmp = self.dir.join(format!(".{}.tmp", kind.file_name()));
        tokio::fs::write(&tmp, contents)
            .await
            .with_context(|| format!("Failed to write {}", tmp.display()))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .with_context(|| format!("Failed to replace {}", path.display()))?;
        Ok(())
    }
}

/// Keeps documents in memory. Used by tests and throwaway servers.
#[derive(Default)]
pub struct MemoryBackend {
    docs: RwLock<HashMap<DocumentKind, String>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DocumentBackend for MemoryBackend {
    async fn read(&self, kind: DocumentKind) -> Result<Option<String>> {
        let docs = self
            .docs
            .read()
            .map_err(|_| anyhow::anyhow!("memory backend lock poisoned"))?;
        Ok(docs.get(&kind).cloned())
    }

    async fn write(&self, kind: DocumentKind, contents: &str) -> Result<()> {
        let mut docs = self
            .docs
            .write()
            .map_err(|_| anyhow::anyhow!("memory backend lock poisoned"))?;
        docs.insert(kind, contents.to_string());
        Ok(())
    }
}

struct DocumentLocks {
    library: Mutex<()>,
    auth: Mutex<()>,
    public_memos: Mutex<()>,
    search_cache: Mutex<()>,
}

impl DocumentLocks {
    fn new() -> Self {
        Self {
            library: Mutex::new(()),
            auth: Mutex::new(()),
            public_memos: Mutex::new(()),
            search_cache: Mutex::new(()),
        }
    }

    fn get(&self, kind: DocumentKind) -> &Mutex<()> {
        match kind {
            DocumentKind::Library => &self.library,
            DocumentKind::Auth => &self.auth,
            DocumentKind::PublicMemos => &self.public_memos,
            DocumentKind::SearchCache => &self.search_cache,
        }
    }
}

/// Typed, lock-guarded access to the persisted documents.
pub struct DocumentStore {
    backend: Box<dyn DocumentBackend>,
    locks: DocumentLocks,
}

impl DocumentStore {
    pub fn new(backend: Box<dyn DocumentBackend>) -> Self {
        Self {
            backend,
            locks: DocumentLocks::new(),
        }
    }

    /// Store backed by files under `dir`.
    pub fn open(dir: impl Into<PathBuf>) -> Self {
        Self::new(Box::new(FileBackend::new(dir)))
    }

    /// Store backed by memory.
    pub fn in_memory() -> Self {
        Self::new(Box::new(MemoryBackend::new()))
    }

    /// Writes an empty document for every kind that does not exist yet.
    ///
    /// Returns the number of documents created.
    pub async fn init(&self) -> Result<usize> {
        let mut created = 0;
        for kind in DocumentKind::ALL {
            let _guard = self.locks.get(kind).lock().await;
            if self.backend.read(kind).await?.is_none() {
                self.backend.write(kind, &kind.default_contents()?).await?;
                created += 1;
            }
        }
        Ok(created)
    }

    /// Reads a document, falling back to its default.
    pub async fn read<T>(&self, kind: DocumentKind) -> Result<T>
    where
        T: DeserializeOwned + Default,
    {
        let _guard = self.locks.get(kind).lock().await;
        let doc = self.load(kind).await?.unwrap_or_else(|e| {
            tracing::warn!(
                document = kind.file_name(),
                error = %e,
                "malformed records, reading empty default"
            );
            T::default()
        });
        Ok(doc)
    }

    /// Runs `f` against the current document under the document's lock and
    /// writes the result back. Nothing is written when `f` fails or when the
    /// stored document holds records that do not parse.
    pub async fn update<T, R, E, F>(&self, kind: DocumentKind, f: F) -> Result<R, E>
    where
        T: Serialize + DeserializeOwned + Default + Send,
        R: Send,
        E: From<anyhow::Error>,
        F: FnOnce(&mut T) -> Result<R, E> + Send,
    {
        let _guard = self.locks.get(kind).lock().await;
        let mut doc: T = self.load(kind).await?.with_context(|| {
            format!(
                "Refusing to overwrite {}: it holds malformed records",
                kind.file_name()
            )
        })?;
        let out = f(&mut doc)?;
        let text = serde_json::to_string_pretty(&doc)
            .with_context(|| format!("Failed to serialize {}", kind.file_name()))?;
        self.backend.write(kind, &text).await?;
        Ok(out)
    }

    /// Loads the stored document. The outer error is an I/O failure; the
    /// inner one is a JSON object whose records do not fit `T`.
    async fn load<T>(&self, kind: DocumentKind) -> Result<Result<T, serde_json::Error>>
    where
        T: DeserializeOwned + Default,
    {
        let Some(raw) = self.backend.read(kind).await? else {
            return Ok(Ok(T::default()));
        };

        match serde_json::from_str::<serde_json::Value>(&raw) {
            Ok(value) if value.is_object() => Ok(serde_json::from_value(value)),
            Ok(_) => {
                tracing::warn!(
                    document = kind.file_name(),
                    "document is not an object, using empty default"
                );
                Ok(Ok(T::default()))
            }
            Err(e) => {
                tracing::warn!(
                    document = kind.file_name(),
                    error = %e,
                    "unreadable document, using empty default"
                );
                Ok(Ok(T::default()))
            }
        }
    }
}

/// CLI entry point for `bookmemo init`.
pub async fn run_init(config: &crate::config::Config) -> Result<()> {
    let store = DocumentStore::open(&config.data.dir);
    let created = store.init().await?;
    println!(
        "Data directory ready at {} ({} documents created).",
        config.data.dir.display(),
        created
    );
    Ok(())
}
