// Shared helpers for integration tests
//
// `FakeApi` is a tiny HTTP/1.1 server playing both the API and the auth
// server. Unlike mockito it can hold responses back, which the in-flight
// renewal scenarios need.

#![allow(dead_code)]

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};

use session_gate::auth::{
    AuthClient, Credential, CredentialStore, SessionManager, SqliteCredentialStore,
};
use session_gate::config::SessionConfig;
use session_gate::gate::RequestGate;

/// Unsigned `header.payload.signature` token expiring `offset_secs` from now
pub fn token(label: &str, offset_secs: i64) -> String {
    let now = chrono::Utc::now().timestamp();
    let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"HS256","typ":"JWT"}"#);
    let payload = URL_SAFE_NO_PAD.encode(
        json!({
            "sub": "42",
            "email": "ada@example.com",
            "exp": now + offset_secs,
            "jti": label,
        })
        .to_string(),
    );
    format!("{}.{}.signature", header, payload)
}

/// How the fake auth server answers `/auth/refresh`
#[derive(Clone)]
pub enum RefreshBehavior {
    /// Issue `access_token` after `delay`
    Renew { access_token: String, delay: Duration },
    /// Answer `status` after `delay`
    Fail { status: u16, delay: Duration },
}

pub struct FakeApi {
    pub url: String,
    state: Arc<ServerState>,
}

struct ServerState {
    accepted_token: Mutex<String>,
    refresh: RefreshBehavior,
    slow_delay: Duration,
    refresh_calls: AtomicUsize,
    api_calls: AtomicUsize,
}

impl FakeApi {
    /// Start a server that accepts only `accepted_token` on API paths
    pub async fn start(accepted_token: &str, refresh: RefreshBehavior) -> Self {
        Self::start_with_slow_delay(accepted_token, refresh, Duration::from_secs(2)).await
    }

    pub async fn start_with_slow_delay(
        accepted_token: &str,
        refresh: RefreshBehavior,
        slow_delay: Duration,
    ) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}", listener.local_addr().unwrap());
        let state = Arc::new(ServerState {
            accepted_token: Mutex::new(accepted_token.to_string()),
            refresh,
            slow_delay,
            refresh_calls: AtomicUsize::new(0),
            api_calls: AtomicUsize::new(0),
        });

        let server_state = state.clone();
        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    break;
                };
                let state = server_state.clone();
                tokio::spawn(async move {
                    let _ = handle(stream, state).await;
                });
            }
        });

        Self { url, state }
    }

    pub fn refresh_calls(&self) -> usize {
        self.state.refresh_calls.load(Ordering::SeqCst)
    }

    pub fn api_calls(&self) -> usize {
        self.state.api_calls.load(Ordering::SeqCst)
    }
}

async fn handle(stream: TcpStream, state: Arc<ServerState>) -> std::io::Result<()> {
    let mut reader = BufReader::new(stream);

    let mut request_line = String::new();
    reader.read_line(&mut request_line).await?;
    let mut parts = request_line.split_whitespace();
    let method = parts.next().unwrap_or_default().to_string();
    let path = parts.next().unwrap_or_default().to_string();

    let mut content_length = 0usize;
    let mut bearer = None;
    loop {
        let mut line = String::new();
        if reader.read_line(&mut line).await? == 0 || line == "\r\n" {
            break;
        }
        let Some((name, value)) = line.trim_end().split_once(':') else {
            continue;
        };
        let value = value.trim();
        match name.to_ascii_lowercase().as_str() {
            "content-length" => content_length = value.parse().unwrap_or(0),
            "authorization" => bearer = value.strip_prefix("Bearer ").map(str::to_string),
            _ => {}
        }
    }
    let mut body = vec![0u8; content_length];
    reader.read_exact(&mut body).await?;

    let (status, payload) = route(&state, &method, &path, bearer.as_deref()).await;

    let body = payload.map(|v| v.to_string()).unwrap_or_default();
    let response = format!(
        "HTTP/1.1 {} {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        status,
        reason(status),
        body.len(),
        body
    );
    let mut stream = reader.into_inner();
    stream.write_all(response.as_bytes()).await?;
    stream.shutdown().await
}

async fn route(
    state: &ServerState,
    method: &str,
    path: &str,
    bearer: Option<&str>,
) -> (u16, Option<Value>) {
    match (method, path) {
        ("POST", "/auth/refresh") => {
            state.refresh_calls.fetch_add(1, Ordering::SeqCst);
            match &state.refresh {
                RefreshBehavior::Renew {
                    access_token,
                    delay,
                } => {
                    tokio::time::sleep(*delay).await;
                    *state.accepted_token.lock() = access_token.clone();
                    (
                        200,
                        Some(json!({
                            "access_token": access_token,
                            "refresh_token": "refresh-2",
                            "token_type": "bearer"
                        })),
                    )
                }
                RefreshBehavior::Fail { status, delay } => {
                    tokio::time::sleep(*delay).await;
                    (*status, Some(json!({"detail": "Refresh token expired"})))
                }
            }
        }
        ("POST", "/auth/logout") => (204, None),
        (_, "/missing") => {
            state.api_calls.fetch_add(1, Ordering::SeqCst);
            (404, Some(json!({"detail": "Not found"})))
        }
        (_, "/slow") => {
            state.api_calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(state.slow_delay).await;
            (200, Some(json!({"slow": true})))
        }
        (_, path) => {
            state.api_calls.fetch_add(1, Ordering::SeqCst);
            let accepted = state.accepted_token.lock().clone();
            match bearer {
                Some(token) if token == accepted => {
                    (200, Some(json!({"path": path, "token": token})))
                }
                _ => (401, Some(json!({"detail": "Not authenticated"}))),
            }
        }
    }
}

fn reason(status: u16) -> &'static str {
    match status {
        200 => "OK",
        204 => "No Content",
        401 => "Unauthorized",
        403 => "Forbidden",
        404 => "Not Found",
        _ => "Error",
    }
}

/// A restored session against `server`
pub struct Session {
    pub manager: SessionManager,
    pub gate: RequestGate,
    pub store: Arc<SqliteCredentialStore>,
}

pub async fn session(server: &FakeApi, access_token: &str, request_timeout: Duration) -> Session {
    let api = AuthClient::new(&server.url, Duration::from_secs(2), Duration::from_secs(5))
        .expect("Failed to create auth client");
    let store = Arc::new(SqliteCredentialStore::in_memory().expect("Failed to open store"));
    store
        .save(&Credential::new(access_token.to_string(), "refresh-1".to_string()).unwrap())
        .expect("Failed to seed store");

    let manager = SessionManager::new(api, store.clone(), SessionConfig::default());
    manager.restore().await;

    let gate = RequestGate::new(
        &server.url,
        manager.clone(),
        Duration::from_secs(2),
        request_timeout,
    )
    .expect("Failed to create gate");

    Session {
        manager,
        gate,
        store,
    }
}
