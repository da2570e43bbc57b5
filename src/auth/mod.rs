//! Authentication
//!
//! Username/password accounts loaded from configuration and the opaque
//! bearer tokens issued for them. [`TokenAuthority`] is the
//! [`IdentityResolver`](crate::domain::ports::IdentityResolver) the HTTP
//! layer uses to turn a bearer credential into an identity.

mod tokens;
mod users;

pub use tokens::{IssuedToken, TokenAuthority};
pub use users::{UserRecord, UserStore};
