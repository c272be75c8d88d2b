//! The authenticator contract.

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::AuthError;
use crate::user::User;

/// A set of users keyed by password hash.
///
/// Implementations must be safe for concurrent use; every accepted
/// connection queries the authenticator from its own task. The server
/// receives one authenticator at construction and calls [`close`] at
/// shutdown.
///
/// [`close`]: Authenticator::close
#[async_trait]
pub trait Authenticator: Send + Sync {
    /// Look up a user by the 56-character hex hash.
    async fn auth_user(&self, hash: &str) -> Result<Arc<User>, AuthError>;

    /// Register a new user under the given hash.
    async fn add_user(&self, hash: &str) -> Result<(), AuthError>;

    /// Remove a user. Existing connections keep their `Arc<User>` until
    /// they close.
    async fn del_user(&self, hash: &str) -> Result<(), AuthError>;

    /// Snapshot of all users.
    async fn list_users(&self) -> Vec<Arc<User>>;

    /// Release backend resources. The default is a no-op.
    fn close(&self) {}
}

#[async_trait]
impl<A: Authenticator + ?Sized> Authenticator for Arc<A> {
    async fn auth_user(&self, hash: &str) -> Result<Arc<User>, AuthError> {
        (**self).auth_user(hash).await
    }

    async fn add_user(&self, hash: &str) -> Result<(), AuthError> {
        (**self).add_user(hash).await
    }

    async fn del_user(&self, hash: &str) -> Result<(), AuthError> {
        (**self).del_user(hash).await
    }

    async fn list_users(&self) -> Vec<Arc<User>> {
        (**self).list_users().await
    }

    fn close(&self) {
        (**self).close();
    }
}
