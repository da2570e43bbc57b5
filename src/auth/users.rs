//! In-memory user store

use crate::domain::ports::User;
use crate::error::{Error, Result};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// A configured account
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct UserRecord {
    pub username: String,
    /// `sha256:<hex>` digest, or a plaintext password for development setups
    pub password: String,
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub display_name: String,
}

/// Stored credential.
///
/// `Sha256` digests are unsalted: they keep plaintext out of config files but
/// do not resist offline guessing if the file leaks, so the config must stay
/// as private as the passwords themselves. Deployments that need a slow,
/// salted hash should put an identity provider in front of the gateway.
#[derive(Debug, Clone)]
enum Secret {
    Sha256(String),
    Plain(String),
}

impl Secret {
    fn parse(raw: &str) -> Self {
        match raw.strip_prefix("sha256:") {
            Some(hex) => Secret::Sha256(hex.to_ascii_lowercase()),
            None => Secret::Plain(raw.to_string()),
        }
    }

    fn verify(&self, password: &str) -> bool {
        match self {
            Secret::Sha256(expected) => {
                let computed = hex::encode(Sha256::digest(password.as_bytes()));
                constant_time_eq(expected.as_bytes(), computed.as_bytes())
            }
            Secret::Plain(expected) => constant_time_eq(expected.as_bytes(), password.as_bytes()),
        }
    }
}

/// Compares without an early exit on the first differing byte, so response
/// timing does not reveal how much of a guess matched. Length is not hidden;
/// digests all share one length and plaintext secrets are development-only.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

#[derive(Debug)]
struct Account {
    user: Arc<User>,
    secret: Secret,
}

/// Accounts keyed by username
#[derive(Debug, Default)]
pub struct UserStore {
    accounts: RwLock<HashMap<String, Account>>,
}

impl UserStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_records(records: &[UserRecord]) -> Self {
        let store = Self::new();
        for record in records {
            store.upsert(record);
        }
        store
    }

    /// Add or replace an account
    pub fn upsert(&self, record: &UserRecord) {
        let mut user = User::new(&record.username);
        user.email = record.email.clone();
        if !record.display_name.is_empty() {
            user.display_name = record.display_name.clone();
        }
        let account = Account {
            user: Arc::new(user),
            secret: Secret::parse(&record.password),
        };
        self.accounts.write().insert(record.username.clone(), account);
        debug!(username = %record.username, "User account loaded");
    }

    pub fn remove(&self, username: &str) -> bool {
        self.accounts.write().remove(username).is_some()
    }

    pub fn len(&self) -> usize {
        self.accounts.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Look up a user by name
    pub fn get(&self, username: &str) -> Result<Arc<User>> {
        self.accounts
            .read()
            .get(username)
            .map(|account| account.user.clone())
            .ok_or_else(|| Error::UserNotFound {
                username: username.to_string(),
            })
    }

    /// Check a username/password pair
    pub fn authenticate(&self, username: &str, password: &str) -> Result<Arc<User>> {
        let accounts = self.accounts.read();
        match accounts.get(username) {
            Some(account) if account.secret.verify(password) => Ok(account.user.clone()),
            _ => Err(Error::BadAuthenticationData(
                "invalid username or password".into(),
            )),
        }
    }
}
