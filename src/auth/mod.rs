// Authentication module
// Session lifecycle, token renewal and credential persistence

pub mod claims;
mod client;
mod listeners;
mod manager;
mod store;
mod types;

pub use client::AuthClient;
pub use listeners::{Listener, Subscription};
pub use manager::{SessionManager, SESSION_EXPIRED_MESSAGE};
pub use store::{CredentialStore, SqliteCredentialStore};
pub use types::{
    Credential, LoginRequest, RegisterRequest, SessionPhase, SessionState, TokenResponse, User,
};
