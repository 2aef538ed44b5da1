//! Persistence gateway used by the client-side stores.
//!
//! The stores in [`crate::shelf`] and [`crate::public_memos`] never talk to
//! storage directly. They go through a [`LibraryGateway`], which is either
//! the REST backend ([`HttpGateway`]) or on-device storage
//! ([`LocalGateway`](crate::local::LocalGateway)).

use anyhow::Result;
use async_trait::async_trait;

use crate::client::{ApiClient, ClientError};
use crate::models::{Memo, MemoAuthor, Pagination, PublicMemoIndex, PublicMemoPage, UserLibrary};

#[async_trait]
pub trait LibraryGateway: Send + Sync {
    /// Loads a user's shelf; an unknown user has an empty shelf.
    async fn load_library(&self, user_id: &str) -> Result<UserLibrary>;

    /// Replaces a user's shelf.
    async fn save_library(&self, user_id: &str, library: &UserLibrary) -> Result<()>;

    async fn load_public_memos(&self) -> Result<PublicMemoIndex>;

    /// Shares one memo under `book_id` against the current stored index
    /// and returns the index after the change.
    async fn publish_memo(
        &self,
        book_id: &str,
        memo: &Memo,
        author: &MemoAuthor,
    ) -> Result<PublicMemoIndex>;

    /// Withdraws one shared memo and returns the index after the change.
    async fn unpublish_memo(&self, book_id: &str, memo_id: &str) -> Result<PublicMemoIndex>;

    /// One page of shared memos for a book. A book without shared memos
    /// yields an empty page.
    async fn public_memos_for_book(
        &self,
        book_id: &str,
        page: usize,
        limit: usize,
    ) -> Result<PublicMemoPage>;
}

/// An empty page answering `page`/`limit`.
pub fn empty_page(page: usize, limit: usize) -> PublicMemoPage {
    PublicMemoPage {
        memos: Vec::new(),
        pagination: Pagination {
            page,
            limit,
            total_count: 0,
            has_more: false,
        },
    }
}

/// Gateway backed by the REST API.
#[derive(Clone)]
pub struct HttpGateway {
    client: ApiClient,
}

impl HttpGateway {
    pub fn new(client: ApiClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl LibraryGateway for HttpGateway {
    async fn load_library(&self, user_id: &str) -> Result<UserLibrary> {
        Ok(self.client.get_library(user_id).await?)
    }

    async fn save_library(&self, user_id: &str, library: &UserLibrary) -> Result<()> {
        // The backend keeps no empty shelves.
        if library.is_empty() {
            self.client.delete_library(user_id).await?;
        } else {
            self.client.put_library(user_id, library).await?;
        }
        Ok(())
    }

    async fn load_public_memos(&self) -> Result<PublicMemoIndex> {
        Ok(self.client.get_public_memos().await?)
    }

    async fn publish_memo(
        &self,
        book_id: &str,
        memo: &Memo,
        author: &MemoAuthor,
    ) -> Result<PublicMemoIndex> {
        Ok(self.client.publish_memo(book_id, memo, author).await?)
    }

    async fn unpublish_memo(&self, book_id: &str, memo_id: &str) -> Result<PublicMemoIndex> {
        Ok(self.client.unpublish_memo(book_id, memo_id).await?)
    }

    async fn public_memos_for_book(
        &self,
        book_id: &str,
        page: usize,
        limit: usize,
    ) -> Result<PublicMemoPage> {
        match self.client.public_memos_for_book(book_id, page, limit).await {
            Ok(page) => Ok(page),
            Err(ClientError::Api { status: 404, .. }) => Ok(empty_page(page, limit)),
            Err(e) => Err(e.into()),
        }
    }
}
