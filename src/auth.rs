//! Accounts and token sessions.
//!
//! Everything here operates on an [`AuthDocument`] in memory; callers wrap
//! the calls in [`DocumentStore::update`](crate::storage::DocumentStore::update)
//! on the server, or in local storage reads and writes in offline mode.
//!
//! Sessions are opaque UUID tokens mapped to the signed-in user. Each user
//! keeps at most [`MAX_SESSIONS_PER_USER`] open; opening another closes the
//! oldest.

use argon2::{
    password_hash::{rand_core::OsRng, PasswordHash, PasswordHasher, PasswordVerifier, SaltString},
    Argon2,
};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::models::{now_iso, Account, AuthDocument, SessionRecord, SessionUser};

/// Open sessions kept per user.
pub const MAX_SESSIONS_PER_USER: usize = 10;

const MISSING_LOGIN_FIELDS: &str = "Email and password are required.";
const BAD_CREDENTIALS: &str = "Invalid email or password.";
const MISSING_REGISTER_FIELDS: &str = "Name, email, and password are required.";
const DUPLICATE_EMAIL: &str = "An account with that email already exists.";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RegisterRequest {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoginRequest {
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
}

/// Hashes a password into an Argon2id PHC string.
pub fn hash_password(password: &str) -> Result<String> {
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|e| Error::Internal(anyhow::anyhow!("Failed to hash password: {e}")))
}

/// Checks a password against a stored value.
///
/// Values that are not PHC strings are legacy plaintext and compared
/// directly.
pub fn verify_password(password: &str, stored: &str) -> bool {
    match PasswordHash::new(stored) {
        Ok(parsed) => Argon2::default()
            .verify_password(password.as_bytes(), &parsed)
            .is_ok(),
        Err(_) => !is_phc(stored) && password == stored,
    }
}

fn is_phc(value: &str) -> bool {
    value.starts_with('$')
}

pub fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

/// `user-<millis>-<8 hex>`.
pub fn generate_user_id() -> String {
    format!(
        "user-{}-{:08x}",
        chrono::Utc::now().timestamp_millis(),
        rand::random::<u32>()
    )
}

fn required(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|v| !v.is_empty())
}

/// Creates an account and returns its public view.
pub fn register(doc: &mut AuthDocument, req: &RegisterRequest) -> Result<SessionUser> {
    let (Some(name), Some(email), Some(password)) = (
        required(&req.name),
        required(&req.email),
        req.password.as_deref().filter(|p| !p.is_empty()),
    ) else {
        return Err(Error::validation(MISSING_REGISTER_FIELDS));
    };

    let email = normalize_email(email);
    if doc.users.iter().any(|u| normalize_email(&u.email) == email) {
        return Err(Error::Conflict(DUPLICATE_EMAIL.to_string()));
    }

    let account = Account {
        id: generate_user_id(),
        name: name.to_string(),
        email,
        password: hash_password(password)?,
    };
    let user = SessionUser::from(&account);
    doc.users.push(account);
    Ok(user)
}

/// Checks an email/password pair.
pub fn authenticate(doc: &AuthDocument, req: &LoginRequest) -> Result<SessionUser> {
    let (Some(email), Some(password)) = (
        required(&req.email),
        req.password.as_deref().filter(|p| !p.is_empty()),
    ) else {
        return Err(Error::validation(MISSING_LOGIN_FIELDS));
    };

    let email = normalize_email(email);
    doc.users
        .iter()
        .find(|u| normalize_email(&u.email) == email && verify_password(password, &u.password))
        .map(SessionUser::from)
        .ok_or_else(|| Error::Unauthorized(BAD_CREDENTIALS.to_string()))
}

/// Binds `user` to a session and returns the token. An existing token is
/// reused; otherwise a fresh one is issued. The user's oldest sessions are
/// closed beyond [`MAX_SESSIONS_PER_USER`].
pub fn open_session(doc: &mut AuthDocument, user: SessionUser, token: Option<&str>) -> String {
    let token = token
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

    let user_id = user.id.clone();
    doc.sessions.insert(
        token.clone(),
        SessionRecord {
            user,
            issued_at: now_iso(),
        },
    );
    prune_sessions(doc, &user_id, &token);
    token
}

fn prune_sessions(doc: &mut AuthDocument, user_id: &str, keep: &str) {
    let mut older: Vec<(String, String)> = doc
        .sessions
        .iter()
        .filter(|(token, s)| s.user.id == user_id && token.as_str() != keep)
        .map(|(token, s)| (s.issued_at.clone(), token.clone()))
        .collect();
    if older.len() < MAX_SESSIONS_PER_USER {
        return;
    }

    older.sort();
    let excess = older.len() + 1 - MAX_SESSIONS_PER_USER;
    for (_, token) in older.into_iter().take(excess) {
        doc.sessions.remove(&token);
    }
}

/// Opens a session for an existing account id.
pub fn bind_session(
    doc: &mut AuthDocument,
    user_id: &str,
    token: Option<&str>,
) -> Result<(SessionUser, String)> {
    let user = doc
        .users
        .iter()
        .find(|u| u.id == user_id)
        .map(SessionUser::from)
        .ok_or_else(|| Error::not_found(format!("Unknown user: {}", user_id)))?;
    let token = open_session(doc, user.clone(), token);
    Ok((user, token))
}

pub fn session_user(doc: &AuthDocument, token: &str) -> Option<SessionUser> {
    doc.sessions.get(token.trim()).map(|s| s.user.clone())
}

/// Removes a session. Returns whether it existed.
pub fn close_session(doc: &mut AuthDocument, token: &str) -> bool {
    doc.sessions.remove(token.trim()).is_some()
}

/// Account list without password material.
pub fn list_users(doc: &AuthDocument) -> Vec<SessionUser> {
    doc.users.iter().map(SessionUser::from).collect()
}

/// Replaces every account.
///
/// Emails are normalized and plaintext passwords hashed. Sessions whose
/// account disappeared are dropped.
pub fn replace_users(doc: &mut AuthDocument, users: Vec<Account>) -> Result<()> {
    let mut accounts = Vec::with_capacity(users.len());
    for mut account in users {
        account.email = normalize_email(&account.email);
        account.name = account.name.trim().to_string();
        if !is_phc(&account.password) {
            account.password = hash_password(&account.password)?;
        }
        accounts.push(account);
    }

    doc.sessions
        .retain(|_, s| accounts.iter().any(|a| a.id == s.user.id));
    doc.users = accounts;
    Ok(())
}

/// CLI entry point for `bookmemo users`.
pub async fn run_list_users(config: &crate::config::Config) -> anyhow::Result<()> {
    let store = crate::storage::DocumentStore::open(&config.data.dir);
    let doc: AuthDocument = store.read(crate::storage::DocumentKind::Auth).await?;
    let users = list_users(&doc);
    if users.is_empty() {
        println!("No users.");
        return Ok(());
    }
    for user in users {
        println!("{}  {} <{}>", user.id, user.name, user.email);
    }
    Ok(())
}
