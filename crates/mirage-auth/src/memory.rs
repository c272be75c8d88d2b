//! In-memory authentication backend.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use tracing::debug;

use crate::error::AuthError;
use crate::hash::sha224_hex;
use crate::traits::Authenticator;
use crate::user::User;

/// Authenticator backed by a process-local user table.
///
/// Suitable for deployments where the user set comes from the config file;
/// larger installations plug in a database-backed implementation of the
/// same trait.
#[derive(Debug, Default)]
pub struct MemoryAuthenticator {
    users: RwLock<HashMap<String, Arc<User>>>,
}

impl MemoryAuthenticator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from plaintext passwords, hashing each once.
    pub fn from_passwords<I, S>(passwords: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let users = passwords
            .into_iter()
            .map(|p| {
                let hash = sha224_hex(p.as_ref());
                let user = Arc::new(User::new(hash.clone()));
                (hash, user)
            })
            .collect();
        Self {
            users: RwLock::new(users),
        }
    }

    pub fn len(&self) -> usize {
        self.users.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.users.read().is_empty()
    }
}

#[async_trait]
impl Authenticator for MemoryAuthenticator {
    async fn auth_user(&self, hash: &str) -> Result<Arc<User>, AuthError> {
        self.users
            .read()
            .get(hash)
            .cloned()
            .ok_or(AuthError::Invalid)
    }

    async fn add_user(&self, hash: &str) -> Result<(), AuthError> {
        let mut users = self.users.write();
        if users.contains_key(hash) {
            return Err(AuthError::Duplicate);
        }
        users.insert(hash.to_string(), Arc::new(User::new(hash)));
        debug!(users = users.len(), "user added");
        Ok(())
    }

    async fn del_user(&self, hash: &str) -> Result<(), AuthError> {
        match self.users.write().remove(hash) {
            Some(_) => Ok(()),
            None => Err(AuthError::Invalid),
        }
    }

    async fn list_users(&self) -> Vec<Arc<User>> {
        self.users.read().values().cloned().collect()
    }
}
