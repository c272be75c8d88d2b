//! User authentication and per-user accounting.
//!
//! The server authenticates connections by the SHA-224 hex digest of the
//! user's password and tracks traffic totals and concurrent client IPs per
//! user. Backends implement [`Authenticator`]; this crate ships the
//! in-memory one. Database-backed implementations share the same contract
//! and plug in at server construction.

mod error;
mod hash;
mod memory;
mod traits;
mod user;

pub use error::AuthError;
pub use hash::sha224_hex;
pub use memory::MemoryAuthenticator;
pub use traits::Authenticator;
pub use user::User;
