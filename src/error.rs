//! Domain error taxonomy.
//!
//! Each variant corresponds to one HTTP status in the server's error
//! contract. Plumbing code keeps using `anyhow`; anything that is not a
//! recognised client-facing condition becomes [`Error::Internal`].

/// User-facing message for any catalog provider failure.
pub const UPSTREAM_MESSAGE: &str = "Unable to fetch books right now.";

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Missing or malformed input (400).
    #[error("{0}")]
    Validation(String),

    /// Bad credentials (401).
    #[error("{0}")]
    Unauthorized(String),

    /// The requested resource does not exist (404).
    #[error("{0}")]
    NotFound(String),

    /// The request collides with existing state (409).
    #[error("{0}")]
    Conflict(String),

    /// The catalog provider was unreachable or answered non-OK (502).
    #[error("Unable to fetch books right now.")]
    Upstream(#[source] anyhow::Error),

    /// Anything else (500). The source is logged, never returned to clients.
    #[error("Internal server error")]
    Internal(#[from] anyhow::Error),
}

impl Error {
    pub fn validation(message: impl Into<String>) -> Self {
        Error::Validation(message.into())
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Error::NotFound(message.into())
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
