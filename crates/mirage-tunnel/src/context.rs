//! Explicit scope object threaded through the pipeline.

use std::sync::Arc;

use mirage_auth::Authenticator;
use mirage_config::Config;
use tokio_util::sync::CancellationToken;

/// Cancellation, configuration and the authenticator for one subtree of
/// the pipeline.
///
/// Child scopes derive child tokens: cancelling a parent cancels every
/// descendant, never the other way around. There is no ambient global
/// state; every layer receives its scope at construction.
#[derive(Clone)]
pub struct Scope {
    config: Arc<Config>,
    auth: Arc<dyn Authenticator>,
    token: CancellationToken,
}

impl Scope {
    pub fn new(config: Arc<Config>, auth: Arc<dyn Authenticator>) -> Self {
        Self {
            config,
            auth,
            token: CancellationToken::new(),
        }
    }

    /// Derive a child scope whose token is cancelled with this one.
    pub fn child(&self) -> Self {
        Self {
            config: self.config.clone(),
            auth: self.auth.clone(),
            token: self.token.child_token(),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn auth(&self) -> Arc<dyn Authenticator> {
        self.auth.clone()
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    pub async fn cancelled(&self) {
        self.token.cancelled().await
    }
}
