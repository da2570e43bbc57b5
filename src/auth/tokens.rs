//! Opaque bearer tokens

use crate::auth::users::UserStore;
use crate::domain::ports::{IdentityResolver, User};
use crate::error::{Error, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;

/// A token handed to a client
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct IssuedToken {
    pub access_token: String,
    pub token_type: String,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
struct Session {
    username: String,
    expires_at: DateTime<Utc>,
}

/// Issues tokens and resolves them back to users
pub struct TokenAuthority {
    users: Arc<UserStore>,
    ttl: Duration,
    sessions: DashMap<String, Session>,
}

impl TokenAuthority {
    pub fn new(users: Arc<UserStore>, ttl: std::time::Duration) -> Self {
        Self {
            users,
            ttl: Duration::from_std(ttl).unwrap_or_else(|_| Duration::hours(1)),
            sessions: DashMap::new(),
        }
    }

    pub fn users(&self) -> &Arc<UserStore> {
        &self.users
    }

    /// Authenticate a username/password pair
    pub fn login(&self, username: &str, password: &str) -> Result<Arc<User>> {
        self.users.authenticate(username, password)
    }

    /// Start a session for `user`
    pub fn issue(&self, user: &User) -> IssuedToken {
        let access_token = format!(
            "{}.{}",
            uuid::Uuid::new_v4().simple(),
            uuid::Uuid::new_v4().simple()
        );
        let expires_at = Utc::now() + self.ttl;
        self.sessions.insert(
            access_token.clone(),
            Session {
                username: user.username.clone(),
                expires_at,
            },
        );
        debug!(username = %user.username, %expires_at, "Token issued");
        IssuedToken {
            access_token,
            token_type: "Bearer".to_string(),
            expires_at,
        }
    }

    /// End a session; false when the token was not live
    pub fn revoke(&self, token: &str) -> bool {
        self.sessions.remove(token).is_some()
    }

    /// Drop expired sessions, returning how many were removed
    pub fn purge_expired(&self) -> usize {
        let now = Utc::now();
        let before = self.sessions.len();
        self.sessions.retain(|_, session| session.expires_at > now);
        before.saturating_sub(self.sessions.len())
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }
}

/// `<32 hex>.<32 hex>`
fn is_well_formed(token: &str) -> bool {
    match token.split_once('.') {
        Some((a, b)) => [a, b]
            .iter()
            .all(|part| part.len() == 32 && part.bytes().all(|c| c.is_ascii_hexdigit())),
        None => false,
    }
}

#[async_trait]
impl IdentityResolver for TokenAuthority {
    async fn resolve(&self, credential: &str) -> Result<Arc<User>> {
        if credential.is_empty() {
            return Err(Error::Unauthenticated);
        }
        if !is_well_formed(credential) {
            return Err(Error::InvalidToken("malformed token".into()));
        }
        let session = self
            .sessions
            .get(credential)
            .map(|s| s.value().clone())
            .ok_or_else(|| Error::InvalidToken("unknown or revoked token".into()))?;
        if session.expires_at <= Utc::now() {
            self.sessions.remove(credential);
            return Err(Error::InvalidToken("token expired".into()));
        }
        self.users.get(&session.username)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::users::UserRecord;
    use crate::error::ErrorCode;

    fn authority(ttl: std::time::Duration) -> TokenAuthority {
        let users = UserStore::from_records(&[UserRecord {
            username: "alice".into(),
            password: "pw".into(),
            email: String::new(),
            display_name: String::new(),
        }]);
        TokenAuthority::new(Arc::new(users), ttl)
    }

    #[tokio::test]
    async fn test_issue_and_resolve() {
        let auth = authority(std::time::Duration::from_secs(60));
        let user = auth.login("alice", "pw").unwrap();
        let token = auth.issue(&user);
        assert_eq!(token.token_type, "Bearer");
        assert_eq!(auth.resolve(&token.access_token).await.unwrap().username, "alice");
    }

    #[tokio::test]
    async fn test_resolution_errors() {
        let auth = authority(std::time::Duration::from_secs(60));
        assert_eq!(auth.resolve("").await.unwrap_err().code(), ErrorCode::Unauthenticated);
        assert_eq!(
            auth.resolve("not-a-token").await.unwrap_err().code(),
            ErrorCode::InvalidToken
        );
        let unknown = format!("{}.{}", "a".repeat(32), "b".repeat(32));
        assert_eq!(auth.resolve(&unknown).await.unwrap_err().code(), ErrorCode::InvalidToken);

        let user = auth.login("alice", "pw").unwrap();
        let token = auth.issue(&user);
        auth.users().remove("alice");
        assert_eq!(
            auth.resolve(&token.access_token).await.unwrap_err().code(),
            ErrorCode::UserNotFound
        );
    }

    #[tokio::test]
    async fn test_expiry_and_revocation() {
        let auth = authority(std::time::Duration::ZERO);
        let user = auth.login("alice", "pw").unwrap();
        let expired = auth.issue(&user);
        assert_eq!(
            auth.resolve(&expired.access_token).await.unwrap_err().code(),
            ErrorCode::InvalidToken
        );

        let stale = auth.issue(&user);
        assert_eq!(auth.purge_expired(), 1);
        assert!(!auth.revoke(&stale.access_token));
        assert_eq!(auth.session_count(), 0);
    }
}
