//! Parsing boundary for book-like input.
//!
//! Books reach the shelf from three places: catalog search results, records
//! already stored on a shelf, and loosely-typed form or API payloads. Each
//! shape is a [`BookInput`] variant and all of them converge on the
//! canonical [`Book`] through [`normalize_book`].

use serde::Deserialize;
use serde_json::Value;

use crate::models::{Book, BookSearchResult, UNTITLED};

/// A book-like value tagged with where it came from.
#[derive(Debug, Clone)]
pub enum BookInput {
    /// A result returned by the catalog search.
    Catalog(BookSearchResult),
    /// A record read back from a shelf.
    Shelf(Book),
    /// Loosely-typed input (forms, hand-written JSON).
    Form(BookForm),
}

/// Loosely-typed book payload. Every field is optional and may hold any
/// JSON type; only usable values survive normalization.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BookForm {
    #[serde(default)]
    pub id: Option<Value>,
    #[serde(default)]
    pub title: Option<Value>,
    #[serde(default)]
    pub description: Option<Value>,
    #[serde(default)]
    pub authors: Option<Value>,
    /// Single-author alias accepted when `authors` is absent.
    #[serde(default)]
    pub author: Option<Value>,
    #[serde(default)]
    pub thumbnail: Option<Value>,
    /// Thumbnail alias.
    #[serde(default)]
    pub image: Option<Value>,
    #[serde(default)]
    pub info_link: Option<Value>,
    #[serde(default)]
    pub published_date: Option<Value>,
    #[serde(default)]
    pub source: Option<Value>,
}

impl From<Book> for BookInput {
    fn from(book: Book) -> Self {
        BookInput::Shelf(book)
    }
}

impl From<BookSearchResult> for BookInput {
    fn from(result: BookSearchResult) -> Self {
        BookInput::Catalog(result)
    }
}

impl From<BookForm> for BookInput {
    fn from(form: BookForm) -> Self {
        BookInput::Form(form)
    }
}

impl BookInput {
    /// The id this input would normalize to, if any.
    pub fn id(&self) -> Option<String> {
        match self {
            BookInput::Catalog(r) => non_blank(&r.id),
            BookInput::Shelf(b) => non_blank(&b.id),
            BookInput::Form(f) => f.id.as_ref().and_then(id_from_value),
        }
    }
}

/// Produces the canonical book, or `None` when no usable id is present.
///
/// Titles are trimmed and default to `"Untitled"`; authors are trimmed with
/// blanks dropped, order and duplicates kept. Normalizing an already
/// normalized book returns an equal book.
pub fn normalize_book(input: impl Into<BookInput>) -> Option<Book> {
    match input.into() {
        BookInput::Catalog(r) => Some(Book {
            id: non_blank(&r.id)?,
            title: title_or_default(Some(r.title.as_str())),
            description: r.description,
            authors: clean_authors(r.authors.iter().map(String::as_str)),
            thumbnail: r.thumbnail,
            info_link: r.info_link,
            published_date: Some(r.published_date),
            source: Some(r.source),
        }),
        BookInput::Shelf(b) => Some(Book {
            id: non_blank(&b.id)?,
            title: title_or_default(Some(b.title.as_str())),
            description: b.description,
            authors: clean_authors(b.authors.iter().map(String::as_str)),
            thumbnail: b.thumbnail,
            info_link: b.info_link,
            published_date: b.published_date,
            source: b.source,
        }),
        BookInput::Form(f) => {
            let id = f.id.as_ref().and_then(id_from_value)?;
            let authors = f
                .authors
                .as_ref()
                .or(f.author.as_ref())
                .map(normalize_authors)
                .unwrap_or_default();
            Some(Book {
                id,
                title: title_or_default(f.title.as_ref().and_then(Value::as_str)),
                description: string_field(&f.description).unwrap_or_default(),
                authors,
                thumbnail: string_field(&f.thumbnail).or_else(|| string_field(&f.image)),
                info_link: string_field(&f.info_link),
                published_date: string_field(&f.published_date),
                source: string_field(&f.source),
            })
        }
    }
}

/// Coerces a scalar or list author value into trimmed, non-empty names.
pub fn normalize_authors(value: &Value) -> Vec<String> {
    match value {
        Value::Array(items) => items
            .iter()
            .map(|item| match item {
                Value::String(s) => s.trim().to_string(),
                Value::Null => String::new(),
                other => other.to_string().trim().to_string(),
            })
            .filter(|s| !s.is_empty())
            .collect(),
        Value::String(s) => {
            let trimmed = s.trim();
            if trimmed.is_empty() {
                Vec::new()
            } else {
                vec![trimmed.to_string()]
            }
        }
        _ => Vec::new(),
    }
}

/// Merges fresh metadata over an existing shelf book. The id is kept.
pub fn merge_book(existing: &Book, incoming: Book) -> Book {
    Book {
        id: existing.id.clone(),
        ..incoming
    }
}

fn clean_authors<'a>(names: impl Iterator<Item = &'a str>) -> Vec<String> {
    names
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

fn title_or_default(title: Option<&str>) -> String {
    title
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .unwrap_or(UNTITLED)
        .to_string()
}

fn non_blank(value: &str) -> Option<String> {
    let trimmed = value.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

fn id_from_value(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => non_blank(s),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn string_field(value: &Option<Value>) -> Option<String> {
    value.as_ref().and_then(Value::as_str).map(str::to_string)
}
