//! Caller identity checks
//!
//! Token verification happens upstream; the manager only sees the verified
//! identity and its expiry, and refuses to act for expired or foreign callers.

use crate::application::Application;
use crate::errors::{CradleError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

const MAX_USER_ID_LEN: usize = 64;

/// User ids become the first segment of storage prefixes: ASCII letters,
/// digits, `-`, `_` and `.`, not starting with a dot
fn user_id_problem(user_id: &str) -> Option<&'static str> {
    if user_id.is_empty() {
        return Some("identity has no user id");
    }
    if user_id.len() > MAX_USER_ID_LEN {
        return Some("user id is too long");
    }
    if user_id.starts_with('.') {
        return Some("user id must not start with a dot");
    }
    if !user_id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
    {
        return Some("user id contains unsupported characters");
    }
    None
}

/// Verified caller identity
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub user_id: String,
    /// Token expiry; `None` for local, non-expiring identities
    pub expires_at: Option<DateTime<Utc>>,
}

impl Identity {
    pub fn new(user_id: &str, expires_at: DateTime<Utc>) -> Self {
        Self {
            user_id: user_id.to_string(),
            expires_at: Some(expires_at),
        }
    }

    /// Identity of a local operator (CLI use)
    pub fn local(user_id: &str) -> Self {
        Self {
            user_id: user_id.to_string(),
            expires_at: None,
        }
    }

    /// Fail with `Unauthorized` when the user id is malformed or the token
    /// has expired at `now`
    pub fn ensure_valid_at(&self, now: DateTime<Utc>) -> Result<()> {
        if let Some(problem) = user_id_problem(&self.user_id) {
            return Err(CradleError::Unauthorized {
                message: format!("{}: {:?}", problem, self.user_id),
            });
        }
        match self.expires_at {
            Some(expiry) if expiry <= now => Err(CradleError::Unauthorized {
                message: format!("token for {} expired at {}", self.user_id, expiry),
            }),
            _ => Ok(()),
        }
    }

    pub fn ensure_valid(&self) -> Result<()> {
        self.ensure_valid_at(Utc::now())
    }

    /// Valid and owner of `app`
    pub fn ensure_owner(&self, app: &Application) -> Result<()> {
        self.ensure_valid()?;
        if app.user_id != self.user_id {
            return Err(CradleError::Unauthorized {
                message: format!("{} does not own application {}", self.user_id, app.app_id),
            });
        }
        Ok(())
    }
}
