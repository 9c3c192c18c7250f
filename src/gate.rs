use anyhow::{Context, Result};
use bytes::Bytes;
use parking_lot::Mutex;
use reqwest::header::CONTENT_TYPE;
use reqwest::{Client, Method, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use uuid::Uuid;

use crate::auth::claims::{self, now_ms};
use crate::auth::{SessionManager, SessionPhase};
use crate::error::{extract_error_message, GateError, GateResult};

/// A call to the API, relative to the gate's base URL.
/// Kept whole so it can be replayed after a token renewal.
#[derive(Debug, Clone)]
pub struct ApiRequest {
    pub method: Method,
    pub path: String,
    pub query: Vec<(String, String)>,
    pub body: Option<Bytes>,
    pub content_type: Option<&'static str>,
}

impl ApiRequest {
    pub fn new(method: Method, path: &str) -> Self {
        let path = if path.starts_with('/') {
            path.to_string()
        } else {
            format!("/{}", path)
        };
        Self {
            method,
            path,
            query: Vec::new(),
            body: None,
            content_type: None,
        }
    }

    pub fn get(path: &str) -> Self {
        Self::new(Method::GET, path)
    }

    pub fn delete(path: &str) -> Self {
        Self::new(Method::DELETE, path)
    }

    pub fn post_json<B: Serialize>(path: &str, body: &B) -> GateResult<Self> {
        let body = serde_json::to_vec(body).map_err(|e| GateError::InvalidRequest(e.to_string()))?;
        Ok(Self {
            body: Some(Bytes::from(body)),
            content_type: Some("application/json"),
            ..Self::new(Method::POST, path)
        })
    }

    pub fn with_query(mut self, key: &str, value: &str) -> Self {
        self.query.push((key.to_string(), value.to_string()));
        self
    }

    fn describe(&self) -> String {
        format!("{} {}", self.method, self.path)
    }
}

/// A call suspended until the running renewal settles
struct QueuedCall {
    id: Uuid,
    description: String,
    tx: oneshot::Sender<GateResult<String>>,
}

#[derive(Default)]
struct GateQueue {
    refreshing: bool,
    calls: Vec<QueuedCall>,
}

enum Role {
    /// Another call is renewing; wait for its outcome
    Waiter(oneshot::Receiver<GateResult<String>>),
    /// This call starts the renewal that settles the queue
    Trigger,
}

/// HTTP client for the API that renews the session on 401.
///
/// Attaches the bearer token to every call. The first call to hit a 401
/// starts one renewal; calls that hit 401 meanwhile are queued and replayed
/// with the renewed token once it lands. The renewal runs in its own task,
/// so a trigger that times out or is dropped leaves the queue waiting on
/// the renewal's real outcome.
pub struct RequestGate {
    client: Client,
    manager: SessionManager,
    base_url: String,
    timeout: Duration,
    queue: Arc<Mutex<GateQueue>>,
}

impl RequestGate {
    pub fn new(
        base_url: &str,
        manager: SessionManager,
        connect_timeout: Duration,
        request_timeout: Duration,
    ) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(connect_timeout)
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            client,
            manager,
            base_url: base_url.trim_end_matches('/').to_string(),
            timeout: request_timeout,
            queue: Arc::new(Mutex::new(GateQueue::default())),
        })
    }

    pub fn manager(&self) -> &SessionManager {
        &self.manager
    }

    /// Number of calls waiting on a renewal
    pub fn queued_calls(&self) -> usize {
        self.queue.lock().calls.len()
    }

    /// Send `request`, renewing the session once if the API answers 401.
    /// Non-401 failures are returned as is, never retried.
    pub async fn send(&self, request: ApiRequest) -> GateResult<Response> {
        // an expired token that cannot be renewed right now fails here
        // rather than going out unauthenticated
        let token = self.manager.request_token().await?;
        let response = self.execute(&request, token.as_deref()).await?;

        if response.status() != StatusCode::UNAUTHORIZED {
            return check_status(response).await;
        }

        tracing::debug!(call = %request.describe(), "Unauthorized, renewing session");
        let renewed = self.await_renewal(&request, token.as_deref()).await?;

        tracing::debug!(call = %request.describe(), "Replaying with renewed token");
        let replay = self.execute(&request, Some(&renewed)).await?;
        check_status(replay).await
    }

    pub async fn get_json<T: DeserializeOwned>(&self, path: &str) -> GateResult<T> {
        let response = self.send(ApiRequest::get(path)).await?;
        decode_json(response).await
    }

    pub async fn post_json<B: Serialize, T: DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
    ) -> GateResult<T> {
        let response = self.send(ApiRequest::post_json(path, body)?).await?;
        decode_json(response).await
    }

    pub async fn delete(&self, path: &str) -> GateResult<()> {
        self.send(ApiRequest::delete(path)).await?;
        Ok(())
    }

    /// Token to replay with after `used` was rejected
    async fn await_renewal(&self, request: &ApiRequest, used: Option<&str>) -> GateResult<String> {
        let role = {
            let mut queue = self.queue.lock();
            if queue.refreshing {
                let (tx, rx) = oneshot::channel();
                let id = Uuid::new_v4();
                tracing::debug!(call = %id, request = %request.describe(), "Queued behind token renewal");
                queue.calls.push(QueuedCall {
                    id,
                    description: request.describe(),
                    tx,
                });
                Role::Waiter(rx)
            } else {
                queue.refreshing = true;
                Role::Trigger
            }
        };

        match role {
            Role::Waiter(rx) => rx.await.unwrap_or_else(|_| {
                Err(GateError::AuthenticationFailed(
                    "token renewal was abandoned".to_string(),
                ))
            }),
            Role::Trigger => {
                let queue = self.queue.clone();
                let manager = self.manager.clone();
                let used = used.map(str::to_string);
                let renewal = tokio::spawn(async move {
                    let drain = DrainGuard::new(queue);
                    let outcome = renew(&manager, used.as_deref()).await;
                    drain.settle(&outcome);
                    outcome
                });
                renewal.await.unwrap_or_else(|e| {
                    tracing::error!(error = %e, "Token renewal task failed");
                    Err(GateError::AuthenticationFailed(
                        "token renewal was interrupted".to_string(),
                    ))
                })
            }
        }
    }

    async fn execute(&self, request: &ApiRequest, token: Option<&str>) -> GateResult<Response> {
        let url = format!("{}{}", self.base_url, request.path);
        let mut builder = self.client.request(request.method.clone(), &url);
        if !request.query.is_empty() {
            builder = builder.query(&request.query);
        }
        if let Some(token) = token {
            builder = builder.bearer_auth(token);
        }
        if let Some(body) = &request.body {
            builder = builder
                .header(CONTENT_TYPE, request.content_type.unwrap_or("application/json"))
                .body(body.clone());
        }

        tracing::debug!(
            method = %request.method,
            url = %url,
            authenticated = token.is_some(),
            "Sending API request"
        );

        match tokio::time::timeout(self.timeout, builder.send()).await {
            Ok(Ok(response)) => {
                tracing::debug!(status = %response.status(), "Received API response");
                Ok(response)
            }
            Ok(Err(e)) if e.is_timeout() => Err(GateError::Timeout(self.timeout)),
            Ok(Err(e)) if e.is_builder() => Err(GateError::InvalidRequest(e.to_string())),
            Ok(Err(e)) => {
                tracing::warn!(url = %url, error = %e, "API request failed");
                Err(GateError::Network(e.to_string()))
            }
            Err(_) => {
                tracing::warn!(url = %url, timeout = ?self.timeout, "API request timed out");
                Err(GateError::Timeout(self.timeout))
            }
        }
    }
}

/// Token to replay with after `used` was rejected
async fn renew(manager: &SessionManager, used: Option<&str>) -> GateResult<String> {
    match manager.access_token() {
        // renewed (or logged in) since this call read its token
        Some(current)
            if Some(current.as_str()) != used && !claims::is_expired(&current, now_ms()) =>
        {
            Ok(current)
        }
        Some(current) => manager
            .refresh_after_rejection(&current)
            .await
            .map(|credential| credential.access_token)
            .map_err(GateError::from),
        None if manager.phase() == SessionPhase::Expired => Err(GateError::SessionExpired),
        None => Err(GateError::Api {
            status: StatusCode::UNAUTHORIZED.as_u16(),
            message: "Not authenticated".to_string(),
        }),
    }
}

/// Settles every queued call and clears the renewing flag in one step.
/// If dropped unsettled (the renewal task panicked or was aborted) the
/// queue is rejected.
struct DrainGuard {
    queue: Arc<Mutex<GateQueue>>,
    settled: bool,
}

impl DrainGuard {
    fn new(queue: Arc<Mutex<GateQueue>>) -> Self {
        Self {
            queue,
            settled: false,
        }
    }

    fn settle(mut self, outcome: &GateResult<String>) {
        self.settled = true;
        drain(&self.queue, outcome);
    }
}

impl Drop for DrainGuard {
    fn drop(&mut self) {
        if !self.settled {
            drain(
                &self.queue,
                &Err(GateError::AuthenticationFailed(
                    "token renewal was interrupted".to_string(),
                )),
            );
        }
    }
}

fn drain(queue: &Mutex<GateQueue>, outcome: &GateResult<String>) {
    let calls = {
        let mut queue = queue.lock();
        queue.refreshing = false;
        std::mem::take(&mut queue.calls)
    };

    if !calls.is_empty() {
        tracing::debug!(count = calls.len(), ok = outcome.is_ok(), "Settling queued calls");
    }
    for call in calls {
        tracing::trace!(call = %call.id, request = %call.description, "Resuming queued call");
        // the waiter may have gone away
        let _ = call.tx.send(outcome.clone());
    }
}

async fn check_status(response: Response) -> GateResult<Response> {
    let status = response.status();
    if status.is_success() || status.is_redirection() {
        return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    let message = extract_error_message(status.as_u16(), &body);
    tracing::debug!(status = status.as_u16(), message = %message, "API error");
    Err(GateError::Api {
        status: status.as_u16(),
        message,
    })
}

async fn decode_json<T: DeserializeOwned>(response: Response) -> GateResult<T> {
    let bytes = response
        .bytes()
        .await
        .map_err(|e| GateError::Network(e.to_string()))?;
    serde_json::from_slice(&bytes).map_err(|e| GateError::Decode(e.to_string()))
}
