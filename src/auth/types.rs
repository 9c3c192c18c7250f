// Authentication types

use serde::{Deserialize, Serialize};

use super::claims::Claims;

/// Access + refresh token pair. Either both are present or neither.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential {
    pub access_token: String,
    pub refresh_token: String,
}

impl Credential {
    /// Build a credential, refusing half pairs
    pub fn new(access_token: String, refresh_token: String) -> Option<Self> {
        if access_token.is_empty() || refresh_token.is_empty() {
            return None;
        }
        Some(Self {
            access_token,
            refresh_token,
        })
    }
}

// Tokens stay out of debug output
impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credential")
            .field("access_token", &token_preview(&self.access_token))
            .field("refresh_token", &"<redacted>")
            .finish()
    }
}

/// Short prefix of a token for log lines
pub fn token_preview(token: &str) -> String {
    let prefix: String = token.chars().take(12).collect();
    format!("{}...", prefix)
}

/// Authenticated user derived from access token claims
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct User {
    pub id: String,
    pub email: String,
    pub name: Option<String>,
    pub is_active: bool,
}

impl From<Claims> for User {
    fn from(claims: Claims) -> Self {
        Self {
            id: claims.subject_id,
            email: claims.email,
            name: claims.name,
            is_active: claims.is_active.unwrap_or(true),
        }
    }
}

/// Lifecycle phase of the session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SessionPhase {
    /// Rest state: nobody is logged in
    Unauthenticated,
    /// Valid credential held
    Authenticated,
    /// A renewal is in flight
    Refreshing,
    /// The refresh token was refused; the user must log in again.
    /// Behaves like `Unauthenticated` apart from the phase itself.
    Expired,
}

/// Snapshot of the session, handed to subscribers and callers
#[derive(Debug, Clone, PartialEq)]
pub struct SessionState {
    pub phase: SessionPhase,
    pub is_authenticated: bool,
    pub user: Option<User>,
    pub credential: Option<Credential>,
    pub is_loading: bool,
    pub last_error: Option<String>,
}

impl SessionState {
    pub fn unauthenticated() -> Self {
        Self {
            phase: SessionPhase::Unauthenticated,
            is_authenticated: false,
            user: None,
            credential: None,
            is_loading: false,
            last_error: None,
        }
    }

    pub fn authenticated(user: User, credential: Credential) -> Self {
        Self {
            phase: SessionPhase::Authenticated,
            is_authenticated: true,
            user: Some(user),
            credential: Some(credential),
            is_loading: false,
            last_error: None,
        }
    }

    pub fn expired(message: String) -> Self {
        Self {
            phase: SessionPhase::Expired,
            last_error: Some(message),
            ..Self::unauthenticated()
        }
    }
}

impl Default for SessionState {
    fn default() -> Self {
        Self::unauthenticated()
    }
}

/// Login request body
#[derive(Debug, Clone, Serialize)]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
}

/// Registration request body
#[derive(Debug, Clone, Serialize)]
pub struct RegisterRequest {
    pub email: String,
    pub password: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

/// Refresh request body
#[derive(Serialize)]
pub struct RefreshRequest<'a> {
    pub refresh_token: &'a str,
}

/// Token response shared by login, register and refresh.
/// Registration may omit the tokens entirely.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TokenResponse {
    #[serde(default)]
    pub access_token: Option<String>,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub token_type: Option<String>,
    #[serde(default)]
    pub expires_in: Option<u64>,
}

impl TokenResponse {
    /// Pair the returned tokens, falling back to `previous_refresh` when the
    /// server did not rotate the refresh token
    pub fn into_credential(self, previous_refresh: Option<&str>) -> Option<Credential> {
        let refresh = self
            .refresh_token
            .filter(|t| !t.is_empty())
            .or_else(|| previous_refresh.map(str::to_string))?;
        Credential::new(self.access_token?, refresh)
    }
}
