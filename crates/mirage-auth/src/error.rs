//! Authentication error types.

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("unknown password hash")]
    Invalid,
    #[error("user already exists")]
    Duplicate,
    #[error("backend: {0}")]
    Backend(String),
}
