// Error handling module
// Defines the error taxonomy and server message extraction

use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::Value;
use std::time::Duration;
use thiserror::Error;

/// Maximum length of a raw response body echoed back in an error message
const MAX_RAW_MESSAGE_CHARS: usize = 200;

/// Failure talking to one of the auth endpoints
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EndpointError {
    /// The server answered with a non-success status
    #[error("{message} (HTTP {status})")]
    Rejected { status: u16, message: String },

    /// The request did not complete within the configured timeout
    #[error("Request timed out after {0:?}")]
    Timeout(Duration),

    /// Connection-level failure
    #[error("Network error: {0}")]
    Network(String),

    /// The server answered 2xx with a body we cannot use
    #[error("Malformed response: {0}")]
    Malformed(String),
}

impl EndpointError {
    /// Categorize a reqwest error, keeping timeouts distinct from network failures
    pub fn from_reqwest(err: reqwest::Error, timeout: Duration) -> Self {
        if err.is_timeout() {
            EndpointError::Timeout(timeout)
        } else if err.is_decode() {
            EndpointError::Malformed(err.to_string())
        } else {
            EndpointError::Network(err.to_string())
        }
    }

    /// True when the refresh endpoint explicitly refused the refresh token
    /// (expired, invalid or revoked). Everything else is transient.
    pub fn rejects_refresh_token(&self) -> bool {
        matches!(
            self,
            EndpointError::Rejected {
                status: 400 | 401 | 403,
                ..
            }
        )
    }

    /// Message suitable for `SessionState::last_error`
    pub fn user_message(&self) -> String {
        match self {
            EndpointError::Rejected { message, .. } => message.clone(),
            other => other.to_string(),
        }
    }
}

/// Errors returned by `SessionManager` operations
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AuthError {
    /// The server returned a token we cannot decode
    #[error("Invalid token received")]
    InvalidToken,

    /// The auth server refused the request
    #[error("{message}")]
    Rejected { status: u16, message: String },

    /// Network failure or timeout reaching the auth server
    #[error("Authentication service unreachable: {0}")]
    Transport(String),

    /// The refresh token is no longer accepted
    #[error("Session expired, please log in again")]
    SessionExpired,

    /// Renewal failed for a transient reason
    #[error("Token refresh failed: {0}")]
    RefreshFailed(String),
}

impl From<EndpointError> for AuthError {
    fn from(err: EndpointError) -> Self {
        match err {
            EndpointError::Rejected { status, message } => AuthError::Rejected { status, message },
            EndpointError::Malformed(_) => AuthError::InvalidToken,
            other => AuthError::Transport(other.to_string()),
        }
    }
}

impl From<RefreshError> for AuthError {
    fn from(err: RefreshError) -> Self {
        match err {
            RefreshError::SessionExpired(_) => AuthError::SessionExpired,
            RefreshError::Transient(msg) => AuthError::RefreshFailed(msg),
        }
    }
}

/// Outcome of a failed renewal, shared by every caller waiting on it
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RefreshError {
    /// Hard failure: the session is over and has been cleared
    #[error("Session expired: {0}")]
    SessionExpired(String),

    /// Soft failure: tokens are left in place so a later call can retry
    #[error("Token refresh failed: {0}")]
    Transient(String),
}

impl RefreshError {
    pub fn is_session_expired(&self) -> bool {
        matches!(self, RefreshError::SessionExpired(_))
    }
}

/// Errors surfaced by `RequestGate`
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GateError {
    /// Renewal was refused; the user has to log in again
    #[error("Session expired, please log in again")]
    SessionExpired,

    /// Renewal failed for a transient reason; the call may be retried later
    #[error("Authentication failed, try again: {0}")]
    AuthenticationFailed(String),

    /// The call exceeded its timeout
    #[error("Request timed out after {0:?}")]
    Timeout(Duration),

    /// Connection-level failure
    #[error("Network error: {0}")]
    Network(String),

    /// Non-success response from the API
    #[error("API error: {status} - {message}")]
    Api { status: u16, message: String },

    /// The request could not be built
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// The response body did not match the expected shape
    #[error("Failed to decode response: {0}")]
    Decode(String),
}

impl GateError {
    /// HTTP status carried by the error, if any
    pub fn status(&self) -> Option<u16> {
        match self {
            GateError::Api { status, .. } => Some(*status),
            _ => None,
        }
    }

    pub fn is_session_expired(&self) -> bool {
        matches!(self, GateError::SessionExpired)
    }
}

impl From<RefreshError> for GateError {
    fn from(err: RefreshError) -> Self {
        match err {
            RefreshError::SessionExpired(_) => GateError::SessionExpired,
            RefreshError::Transient(msg) => GateError::AuthenticationFailed(msg),
        }
    }
}

/// Result type alias for gated API calls
pub type GateResult<T> = std::result::Result<T, GateError>;

// ==================================================================================================
// Server message extraction
// ==================================================================================================

/// Error payload shapes seen from the API and auth servers
#[derive(Deserialize, Default)]
struct ErrorPayload {
    #[serde(default)]
    detail: Option<Detail>,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    error: Option<ErrorField>,
    #[serde(default)]
    error_description: Option<String>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum Detail {
    Text(String),
    Items(Vec<DetailItem>),
    Other(Value),
}

#[derive(Deserialize)]
struct DetailItem {
    #[serde(default)]
    msg: Option<String>,
    #[serde(default)]
    loc: Vec<Value>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum ErrorField {
    Text(String),
    Object {
        #[serde(default)]
        message: Option<String>,
    },
    Other(Value),
}

/// Extract a human readable message from an error response body.
///
/// Rules are tried in order:
/// 1. `{"detail": "..."}`
/// 2. `{"detail": [{"loc": [...], "msg": "..."}]}` joined with `; `
/// 3. `{"message": "..."}`
/// 4. `{"error": "..."}`
/// 5. `{"error": {"message": "..."}}`
/// 6. `{"error_description": "..."}`
/// 7. the raw body, trimmed and truncated
/// 8. the canonical reason for the status code
pub fn extract_error_message(status: u16, body: &str) -> String {
    let payload: ErrorPayload = serde_json::from_str(body).unwrap_or_default();

    if let Some(message) = message_from_payload(payload) {
        return message;
    }

    let trimmed = body.trim();
    if !trimmed.is_empty() {
        return trimmed.chars().take(MAX_RAW_MESSAGE_CHARS).collect();
    }

    match StatusCode::from_u16(status)
        .ok()
        .and_then(|s| s.canonical_reason())
    {
        Some(reason) => format!("HTTP {} {}", status, reason),
        None => format!("HTTP {}", status),
    }
}

fn message_from_payload(payload: ErrorPayload) -> Option<String> {
    match payload.detail {
        Some(Detail::Text(text)) if !text.is_empty() => return Some(text),
        Some(Detail::Items(items)) => {
            let joined = items
                .iter()
                .filter_map(format_detail_item)
                .collect::<Vec<_>>()
                .join("; ");
            if !joined.is_empty() {
                return Some(joined);
            }
        }
        _ => {}
    }

    if let Some(message) = payload.message.filter(|m| !m.is_empty()) {
        return Some(message);
    }

    match payload.error {
        Some(ErrorField::Text(text)) if !text.is_empty() => return Some(text),
        Some(ErrorField::Object {
            message: Some(message),
        }) if !message.is_empty() => return Some(message),
        _ => {}
    }

    payload.error_description.filter(|d| !d.is_empty())
}

fn format_detail_item(item: &DetailItem) -> Option<String> {
    let msg = item.msg.as_deref().filter(|m| !m.is_empty())?;
    let field = item.loc.last().and_then(|loc| match loc {
        Value::String(s) if s != "body" => Some(s.clone()),
        _ => None,
    });
    Some(match field {
        Some(field) => format!("{}: {}", field, msg),
        None => msg.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        let err = GateError::SessionExpired;
        assert_eq!(err.to_string(), "Session expired, please log in again");

        let err = GateError::AuthenticationFailed("upstream 503".to_string());
        assert_eq!(
            err.to_string(),
            "Authentication failed, try again: upstream 503"
        );

        let err = GateError::Api {
            status: 404,
            message: "Pipeline not found".to_string(),
        };
        assert_eq!(err.to_string(), "API error: 404 - Pipeline not found");
        assert_eq!(err.status(), Some(404));

        assert_eq!(AuthError::InvalidToken.to_string(), "Invalid token received");
    }

    #[test]
    fn test_refresh_error_classification() {
        let hard = RefreshError::SessionExpired("revoked".to_string());
        let soft = RefreshError::Transient("HTTP 502".to_string());

        assert!(hard.is_session_expired());
        assert!(!soft.is_session_expired());

        assert_eq!(GateError::from(hard.clone()), GateError::SessionExpired);
        assert_eq!(
            GateError::from(soft.clone()),
            GateError::AuthenticationFailed("HTTP 502".to_string())
        );
        assert_eq!(AuthError::from(hard), AuthError::SessionExpired);
        assert_eq!(
            AuthError::from(soft),
            AuthError::RefreshFailed("HTTP 502".to_string())
        );
    }

    #[test]
    fn test_rejects_refresh_token() {
        for status in [400, 401, 403] {
            let err = EndpointError::Rejected {
                status,
                message: "invalid_grant".to_string(),
            };
            assert!(err.rejects_refresh_token(), "status {}", status);
        }

        let server_error = EndpointError::Rejected {
            status: 503,
            message: "down".to_string(),
        };
        assert!(!server_error.rejects_refresh_token());
        assert!(!EndpointError::Timeout(Duration::from_secs(5)).rejects_refresh_token());
        assert!(!EndpointError::Network("refused".to_string()).rejects_refresh_token());
        assert!(!EndpointError::Malformed("not json".to_string()).rejects_refresh_token());
    }

    #[test]
    fn test_endpoint_error_into_auth_error() {
        let err = EndpointError::Rejected {
            status: 401,
            message: "Incorrect email or password".to_string(),
        };
        let auth: AuthError = err.into();
        assert_eq!(auth.to_string(), "Incorrect email or password");

        let auth: AuthError = EndpointError::Malformed("missing field".to_string()).into();
        assert_eq!(auth, AuthError::InvalidToken);

        let auth: AuthError = EndpointError::Timeout(Duration::from_secs(3)).into();
        assert!(matches!(auth, AuthError::Transport(_)));
    }

    #[test]
    fn test_extract_detail_string() {
        let body = r#"{"detail": "Incorrect email or password"}"#;
        assert_eq!(extract_error_message(401, body), "Incorrect email or password");
    }

    #[test]
    fn test_extract_detail_list() {
        let body = r#"{"detail": [
            {"loc": ["body", "email"], "msg": "value is not a valid email address", "type": "value_error"},
            {"loc": ["body"], "msg": "field required"}
        ]}"#;
        assert_eq!(
            extract_error_message(422, body),
            "email: value is not a valid email address; field required"
        );
    }

    #[test]
    fn test_extract_message_and_error_shapes() {
        assert_eq!(
            extract_error_message(400, r#"{"message": "Name already taken"}"#),
            "Name already taken"
        );
        assert_eq!(
            extract_error_message(400, r#"{"error": "invalid_grant"}"#),
            "invalid_grant"
        );
        assert_eq!(
            extract_error_message(500, r#"{"error": {"message": "database offline"}}"#),
            "database offline"
        );
        assert_eq!(
            extract_error_message(400, r#"{"error": {"code": 7}, "error_description": "refresh token revoked"}"#),
            "refresh token revoked"
        );
    }

    #[test]
    fn test_extract_rule_order() {
        // detail wins over message
        let body = r#"{"message": "generic", "detail": "specific"}"#;
        assert_eq!(extract_error_message(400, body), "specific");

        // empty detail falls through to message
        let body = r#"{"detail": "", "message": "fallback"}"#;
        assert_eq!(extract_error_message(400, body), "fallback");
    }

    #[test]
    fn test_extract_raw_body_and_status_fallback() {
        assert_eq!(
            extract_error_message(502, "  Bad Gateway from proxy \n"),
            "Bad Gateway from proxy"
        );

        let long = "x".repeat(500);
        assert_eq!(extract_error_message(500, &long).len(), MAX_RAW_MESSAGE_CHARS);

        assert_eq!(extract_error_message(404, ""), "HTTP 404 Not Found");
        assert_eq!(extract_error_message(599, "   "), "HTTP 599");
    }

    #[test]
    fn test_extract_unexpected_detail_type() {
        // A numeric detail does not match any rule; the raw body is used instead
        let body = r#"{"detail": 42}"#;
        assert_eq!(extract_error_message(400, body), body);
    }
}
