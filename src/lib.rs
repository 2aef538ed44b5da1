//! # Book Memo
//!
//! A reading-notes backend and client data layer.
//!
//! Readers search an external book catalog, keep the books they care about
//! on a personal shelf, and write short memos about each book. A memo can
//! be shared, after which it shows up for every other reader of that book.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   ┌────────────────┐   ┌─────────────┐
//! │   Reader     │──▶│ LibraryGateway │──▶│ REST server │──▶ JSON documents
//! │ shelf/board/ │   │  HTTP | local  │   │   (axum)    │
//! │   search     │   └────────────────┘   └──────┬──────┘
//! └──────────────┘                               ▼
//!                                      Google Books (cached)
//! ```
//!
//! When the server cannot be reached the reader falls back to on-device
//! storage and queries the catalog directly.
//!
//! ## Quick Start
//!
//! ```bash
//! bookmemo init                 # create the data documents
//! bookmemo serve                # start the REST server
//! bookmemo search "dune"        # cached catalog search
//! bookmemo cache clear --user u1
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`error`] | Domain error taxonomy |
//! | [`models`] | Core data types |
//! | [`normalize`] | Book input normalization |
//! | [`storage`] | Locked JSON document store |
//! | [`catalog`] | External catalog provider |
//! | [`search`] | Cached catalog search |
//! | [`auth`] | Accounts and token sessions |
//! | [`shelf`] | Personal shelf store |
//! | [`public_memos`] | Shared-memo index and community feed |
//! | [`gateway`] | Client persistence gateway |
//! | [`local`] | On-device fallback storage |
//! | [`client`] | Typed REST client |
//! | [`reader`] | Client session tying the stores together |
//! | [`server`] | REST server |

pub mod auth;
pub mod catalog;
pub mod client;
pub mod config;
pub mod error;
pub mod gateway;
pub mod local;
pub mod models;
pub mod normalize;
pub mod public_memos;
pub mod reader;
pub mod search;
pub mod server;
pub mod shelf;
pub mod storage;
