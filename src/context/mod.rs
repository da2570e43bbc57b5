//! Identity Context
//!
//! Per-request carrier for the acting identity, the access credential, a
//! correlation id and a tracing span. Built by the HTTP layer for exactly one
//! inbound operation and passed by reference through every call below it.

mod redact;

pub use redact::{redact, sanitize_query};

use crate::domain::ports::User;
use crate::error::{Error, Result};
use std::fmt;
use std::sync::Arc;
use tracing::{field, info_span, Span};

/// Request-scoped identity and diagnostics.
///
/// Populated by the authentication step through the consuming `with_*`
/// builders, read-only afterwards.
pub struct IdentityContext {
    user: Option<Arc<User>>,
    access_token: Option<String>,
    correlation_id: String,
    span: Span,
}

impl IdentityContext {
    /// Start a context for a new inbound operation
    pub fn new(correlation_id: impl Into<String>) -> Self {
        let correlation_id = correlation_id.into();
        let span = info_span!("op", tid = %correlation_id, user = field::Empty);
        Self {
            user: None,
            access_token: None,
            correlation_id,
            span,
        }
    }

    /// Start a context with a freshly generated correlation id
    pub fn generate() -> Self {
        Self::new(uuid::Uuid::new_v4().to_string())
    }

    /// Convenience for internal callers and tests acting as `user`
    pub fn for_user(user: User) -> Self {
        Self::generate().with_user(Arc::new(user))
    }

    /// Attach the resolved identity
    pub fn with_user(mut self, user: Arc<User>) -> Self {
        self.span.record("user", user.username.as_str());
        self.user = Some(user);
        self
    }

    /// Attach the bearer credential the identity was resolved from
    pub fn with_access_token(mut self, token: impl Into<String>) -> Self {
        self.access_token = Some(token.into());
        self
    }

    /// Resolved identity, if authentication has happened
    pub fn user(&self) -> Option<&Arc<User>> {
        self.user.as_ref()
    }

    /// Resolved identity, or `Unauthenticated`
    pub fn require_user(&self) -> Result<&Arc<User>> {
        self.user.as_ref().ok_or(Error::Unauthenticated)
    }

    pub fn access_token(&self) -> Option<&str> {
        self.access_token.as_deref()
    }

    pub fn correlation_id(&self) -> &str {
        &self.correlation_id
    }

    /// Span every log record of this operation should be emitted in
    pub fn span(&self) -> &Span {
        &self.span
    }
}

impl fmt::Debug for IdentityContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IdentityContext")
            .field("user", &self.user.as_ref().map(|u| u.username.as_str()))
            .field("access_token", &self.access_token.as_deref().map(redact))
            .field("correlation_id", &self.correlation_id)
            .finish()
    }
}
