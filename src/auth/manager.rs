use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use super::claims::{self, now_ms};
use super::client::AuthClient;
use super::listeners::{ListenerRegistry, Subscription};
use super::store::CredentialStore;
use super::types::{
    token_preview, Credential, LoginRequest, RegisterRequest, SessionPhase, SessionState,
    TokenResponse, User,
};
use crate::config::SessionConfig;
use crate::error::{AuthError, RefreshError};

/// Message shown to subscribers when the refresh token is no longer accepted
pub const SESSION_EXPIRED_MESSAGE: &str = "Session expired, please log in again";

/// Shortest wait before a pre-emptive renewal
const MIN_TIMER_DELAY: Duration = Duration::from_secs(1);

type RefreshFuture = Shared<BoxFuture<'static, Result<Credential, RefreshError>>>;

/// The at-most-one outstanding renewal
struct RefreshCycle {
    id: u64,
    epoch: u64,
    result: RefreshFuture,
}

struct RefreshTimer {
    id: u64,
    handle: JoinHandle<()>,
}

/// Session manager
/// Owns the session state, renews tokens single-flight and keeps
/// subscribers and the credential store in sync
#[derive(Clone)]
pub struct SessionManager {
    inner: Arc<Inner>,
}

struct Inner {
    api: AuthClient,
    store: Arc<dyn CredentialStore>,
    config: SessionConfig,

    /// Authoritative state; every change goes through `update`
    state: RwLock<SessionState>,
    listeners: Arc<ListenerRegistry>,

    inflight: Mutex<Option<RefreshCycle>>,
    timer: Mutex<Option<RefreshTimer>>,
    next_id: AtomicU64,

    /// Bumped on login, logout and expiry so late renewals are discarded
    epoch: AtomicU64,
    /// Consecutive transient renewal failures
    soft_failures: AtomicU32,
}

impl SessionManager {
    pub fn new(api: AuthClient, store: Arc<dyn CredentialStore>, config: SessionConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                api,
                store,
                config,
                state: RwLock::new(SessionState::unauthenticated()),
                listeners: ListenerRegistry::new(),
                inflight: Mutex::new(None),
                timer: Mutex::new(None),
                next_id: AtomicU64::new(1),
                epoch: AtomicU64::new(0),
                soft_failures: AtomicU32::new(0),
            }),
        }
    }

    /// Snapshot of the current session
    pub fn state(&self) -> SessionState {
        self.inner.state.read().clone()
    }

    pub fn phase(&self) -> SessionPhase {
        self.inner.state.read().phase
    }

    pub fn is_authenticated(&self) -> bool {
        self.inner.state.read().is_authenticated
    }

    pub fn current_user(&self) -> Option<User> {
        self.inner.state.read().user.clone()
    }

    /// Current access token, without checking expiry
    pub fn access_token(&self) -> Option<String> {
        self.inner
            .state
            .read()
            .credential
            .as_ref()
            .map(|c| c.access_token.clone())
    }

    /// True while a renewal for the current session is outstanding
    pub fn is_refreshing(&self) -> bool {
        let epoch = self.inner.epoch.load(Ordering::SeqCst);
        self.inner
            .inflight
            .lock()
            .as_ref()
            .is_some_and(|cycle| cycle.epoch == epoch)
    }

    /// Register a listener. It is called right away with the current state
    /// and then after every change, until the subscription is dropped via
    /// `Subscription::unsubscribe`.
    pub fn subscribe<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&SessionState) + Send + Sync + 'static,
    {
        self.inner
            .listeners
            .add(Arc::new(listener), || self.inner.state.read().clone())
    }

    /// Rebuild the session from the credential store at startup
    pub async fn restore(&self) -> SessionState {
        self.inner.restore()
    }

    pub async fn login(&self, request: LoginRequest) -> Result<SessionState, AuthError> {
        tracing::info!(email = %request.email, "Logging in");
        self.inner.begin_loading();

        let result = match self.inner.api.login(&request).await {
            Ok(response) => self.inner.establish(response),
            Err(e) => Err(e.into()),
        };

        if let Err(ref err) = result {
            tracing::warn!(error = %err, "Login failed");
            self.inner.fail_loading(err);
        }
        result
    }

    /// Create an account. Logs in only when the server returns both tokens.
    pub async fn register(&self, request: RegisterRequest) -> Result<SessionState, AuthError> {
        tracing::info!(email = %request.email, "Registering");
        self.inner.begin_loading();

        let result = match self.inner.api.register(&request).await {
            Ok(response) if carries_both_tokens(&response) => self.inner.establish(response),
            Ok(_) => {
                tracing::info!("Account created, no tokens returned");
                Ok(self.inner.update(|_, state| state.is_loading = false))
            }
            Err(e) => Err(e.into()),
        };

        if let Err(ref err) = result {
            tracing::warn!(error = %err, "Registration failed");
            self.inner.fail_loading(err);
        }
        result
    }

    /// Renew the access token. Concurrent callers share one request and
    /// all observe the same outcome.
    pub async fn refresh_access_token(&self) -> Result<Credential, RefreshError> {
        self.inner.refresh_access_token().await
    }

    /// Renewal after the API rejected `rejected_token`. If a renewal already
    /// replaced that token, the current credential is returned without a
    /// new request.
    pub async fn refresh_after_rejection(
        &self,
        rejected_token: &str,
    ) -> Result<Credential, RefreshError> {
        if !self.is_refreshing() {
            let current = self.inner.state.read().credential.clone();
            if let Some(credential) = current.filter(|c| c.access_token != rejected_token) {
                tracing::debug!("Token already renewed, reusing it");
                return Ok(credential);
            }
        }
        self.inner.refresh_access_token().await
    }

    /// Access token that is not about to expire, renewing it first when it
    /// is inside the refresh window. `None` means the caller has no session.
    pub async fn get_valid_access_token(&self) -> Option<String> {
        self.request_token().await.ok().flatten()
    }

    /// Token to authenticate a request with. Unlike `get_valid_access_token`
    /// this tells "no session" (`Ok(None)`) apart from a session whose token
    /// has expired and could not be renewed right now (`Err(Transient)`).
    pub async fn request_token(&self) -> Result<Option<String>, RefreshError> {
        let Some(token) = self.access_token() else {
            return Ok(None);
        };
        if !claims::is_expiring_within(&token, self.inner.config.refresh_window, now_ms()) {
            return Ok(Some(token));
        }

        match self.inner.refresh_access_token().await {
            Ok(credential) => Ok(Some(credential.access_token)),
            Err(RefreshError::SessionExpired(_)) => Ok(None),
            Err(RefreshError::Transient(message)) => {
                // Graceful degradation: if token isn't actually expired yet, use it
                if !claims::is_expired(&token, now_ms()) {
                    tracing::warn!(
                        error = %message,
                        "Using existing token despite refresh failure (not yet expired)"
                    );
                    Ok(Some(token))
                } else {
                    Err(RefreshError::Transient(message))
                }
            }
        }
    }

    /// End the session locally and tell the server in the background.
    /// The returned handle lets short-lived callers wait for the server
    /// notification; dropping it detaches the task.
    pub fn logout(&self) -> Option<JoinHandle<()>> {
        let mut previous = None;
        self.inner.update(|inner, state| {
            previous = state.credential.take();
            inner.end_session(state, SessionState::unauthenticated());
        });
        tracing::info!("Logged out");

        let credential = previous?;
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let api = self.inner.api.clone();
                Some(handle.spawn(async move {
                    if let Err(e) = api.logout(&credential.access_token).await {
                        tracing::debug!(error = %e, "Server logout failed");
                    }
                }))
            }
            Err(_) => {
                tracing::debug!("No async runtime, skipping server logout");
                None
            }
        }
    }

    #[cfg(test)]
    fn timer_armed(&self) -> bool {
        self.inner.timer.lock().is_some()
    }
}

fn carries_both_tokens(response: &TokenResponse) -> bool {
    let present = |t: &Option<String>| t.as_deref().is_some_and(|t| !t.is_empty());
    present(&response.access_token) && present(&response.refresh_token)
}

impl Inner {
    /// Apply `update` under the state lock, then notify listeners outside it.
    /// The snapshot is queued before the lock is released, so concurrent
    /// changes reach listeners in the order they were made.
    fn update<F>(self: &Arc<Self>, update: F) -> SessionState
    where
        F: FnOnce(&Arc<Self>, &mut SessionState),
    {
        let snapshot = {
            let mut state = self.state.write();
            update(self, &mut state);
            self.listeners.enqueue(state.clone());
            state.clone()
        };
        self.listeners.flush();
        snapshot
    }

    /// Like `update`, but only if the session epoch is still `epoch`
    fn update_if_current<F>(self: &Arc<Self>, epoch: u64, update: F) -> Option<SessionState>
    where
        F: FnOnce(&Arc<Self>, &mut SessionState),
    {
        let snapshot = {
            let mut state = self.state.write();
            if self.epoch.load(Ordering::SeqCst) != epoch {
                return None;
            }
            update(self, &mut state);
            self.listeners.enqueue(state.clone());
            state.clone()
        };
        self.listeners.flush();
        Some(snapshot)
    }

    fn begin_loading(self: &Arc<Self>) {
        self.update(|_, state| {
            state.is_loading = true;
            state.last_error = None;
        });
    }

    fn fail_loading(self: &Arc<Self>, err: &AuthError) {
        self.update(|_, state| {
            state.is_loading = false;
            state.last_error = Some(err.to_string());
        });
    }

    /// Start a new session from a login or registration response
    fn establish(self: &Arc<Self>, response: TokenResponse) -> Result<SessionState, AuthError> {
        let credential = response.into_credential(None).ok_or(AuthError::InvalidToken)?;
        let claims = claims::decode(&credential.access_token).ok_or(AuthError::InvalidToken)?;
        let delay = self.timer_delay(&credential.access_token);

        let state = self.update(|inner, state| {
            inner.epoch.fetch_add(1, Ordering::SeqCst);
            inner.soft_failures.store(0, Ordering::SeqCst);
            inner.persist(&credential);
            inner.arm_timer(delay);
            *state = SessionState::authenticated(User::from(claims), credential.clone());
        });

        tracing::info!(
            user = ?state.user.as_ref().map(|u| &u.email),
            token = %token_preview(&credential.access_token),
            "Session established"
        );
        Ok(state)
    }

    fn restore(self: &Arc<Self>) -> SessionState {
        let stored = match self.store.load() {
            Ok(stored) => stored,
            Err(e) => {
                tracing::warn!(error = ?e, "Failed to load stored credential");
                None
            }
        };
        let Some(credential) = stored else {
            tracing::debug!("No stored session");
            return self.state.read().clone();
        };

        let now = now_ms();
        let decoded = claims::decode(&credential.access_token);

        if let Some(valid) = decoded.clone().filter(|c| c.expires_at_ms > now) {
            tracing::info!(email = %valid.email, "Restored session");
            let delay = self.timer_delay(&credential.access_token);
            return self.update(|inner, state| {
                inner.epoch.fetch_add(1, Ordering::SeqCst);
                inner.arm_timer(delay);
                *state = SessionState::authenticated(User::from(valid), credential);
            });
        }

        let refresh_usable = match claims::expiry_ms(&credential.refresh_token) {
            Some(expires_at_ms) => expires_at_ms > now,
            // opaque refresh tokens are only judged by the server
            None => true,
        };
        if !refresh_usable {
            tracing::info!("Stored session has expired");
            return self.update(|inner, state| {
                inner.end_session(state, SessionState::expired(SESSION_EXPIRED_MESSAGE.to_string()));
            });
        }

        tracing::info!("Stored access token expired, renewing");
        let state = self.update(|inner, state| {
            inner.epoch.fetch_add(1, Ordering::SeqCst);
            *state = SessionState {
                phase: SessionPhase::Refreshing,
                is_authenticated: true,
                user: decoded.map(User::from),
                credential: Some(credential),
                is_loading: true,
                last_error: None,
            };
        });
        if let Err(e) = self.start_refresh() {
            tracing::warn!(error = %e, "Could not start renewal");
        }
        state
    }

    async fn refresh_access_token(self: &Arc<Self>) -> Result<Credential, RefreshError> {
        let cycle = self.start_refresh()?;
        cycle.await
    }

    /// Join the outstanding renewal for this session, or spawn one
    fn start_refresh(self: &Arc<Self>) -> Result<RefreshFuture, RefreshError> {
        let mut slot = self.inflight.lock();

        let (credential, epoch) = {
            let state = self.state.read();
            (state.credential.clone(), self.epoch.load(Ordering::SeqCst))
        };

        if let Some(cycle) = slot.as_ref().filter(|cycle| cycle.epoch == epoch) {
            tracing::debug!(cycle = cycle.id, "Joining in-flight refresh");
            return Ok(cycle.result.clone());
        }

        let credential = credential
            .ok_or_else(|| RefreshError::SessionExpired("no active session".to_string()))?;

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        let inner = self.clone();
        tokio::spawn(async move {
            let guard = InflightGuard {
                inner: inner.clone(),
                id,
            };
            let result = inner.run_refresh(credential, epoch).await;
            // clear the slot before waking waiters so a retry starts a new cycle
            drop(guard);
            let _ = tx.send(result);
        });

        let result: RefreshFuture = async move {
            rx.await.unwrap_or_else(|_| {
                Err(RefreshError::Transient("refresh task was cancelled".to_string()))
            })
        }
        .boxed()
        .shared();

        *slot = Some(RefreshCycle {
            id,
            epoch,
            result: result.clone(),
        });
        Ok(result)
    }

    async fn run_refresh(
        self: &Arc<Self>,
        credential: Credential,
        epoch: u64,
    ) -> Result<Credential, RefreshError> {
        if self.state.read().phase != SessionPhase::Refreshing {
            self.update_if_current(epoch, |_, state| state.phase = SessionPhase::Refreshing);
        }

        let response = self.api.refresh(&credential.refresh_token).await;

        if self.epoch.load(Ordering::SeqCst) != epoch {
            tracing::debug!("Session changed during refresh, discarding result");
            return Err(ended_during_refresh());
        }

        let renewed = match response {
            Ok(response) => response.into_credential(Some(&credential.refresh_token)),
            Err(e) if e.rejects_refresh_token() => {
                tracing::warn!(error = %e, "Refresh token rejected, ending session");
                self.update_if_current(epoch, |inner, state| {
                    inner.end_session(state, SessionState::expired(SESSION_EXPIRED_MESSAGE.to_string()));
                });
                return Err(RefreshError::SessionExpired(e.user_message()));
            }
            Err(e) => return self.soft_failure(epoch, e.user_message()),
        };

        let Some((renewed, decoded)) =
            renewed.and_then(|c| claims::decode(&c.access_token).map(|decoded| (c, decoded)))
        else {
            return self.soft_failure(epoch, "Invalid token received".to_string());
        };

        let delay = self.timer_delay(&renewed.access_token);
        let applied = self.update_if_current(epoch, |inner, state| {
            inner.soft_failures.store(0, Ordering::SeqCst);
            inner.persist(&renewed);
            inner.arm_timer(delay);
            *state = SessionState::authenticated(User::from(decoded), renewed.clone());
        });
        if applied.is_none() {
            return Err(ended_during_refresh());
        }

        tracing::info!(
            token = %token_preview(&renewed.access_token),
            next_refresh_in = ?delay,
            "Access token refreshed"
        );
        Ok(renewed)
    }

    /// Keep the tokens and retry later, unless the failure budget is spent
    fn soft_failure(
        self: &Arc<Self>,
        epoch: u64,
        message: String,
    ) -> Result<Credential, RefreshError> {
        let mut escalated = false;
        let applied = self.update_if_current(epoch, |inner, state| {
            let failures = inner.soft_failures.fetch_add(1, Ordering::SeqCst) + 1;
            let max = inner.config.max_soft_refresh_failures;

            if max > 0 && failures >= max {
                tracing::warn!(failures, error = %message, "Token refresh keeps failing, ending session");
                escalated = true;
                inner.end_session(state, SessionState::expired(SESSION_EXPIRED_MESSAGE.to_string()));
            } else {
                tracing::warn!(
                    failures,
                    error = %message,
                    retry_in = ?inner.config.refresh_retry_delay,
                    "Token refresh failed, will retry"
                );
                inner.arm_timer(inner.config.refresh_retry_delay);
                state.phase = SessionPhase::Authenticated;
                state.is_loading = false;
                state.last_error = Some(message.clone());
            }
        });

        if applied.is_none() {
            Err(ended_during_refresh())
        } else if escalated {
            Err(RefreshError::SessionExpired(message))
        } else {
            Err(RefreshError::Transient(message))
        }
    }

    /// Reset to `next`, dropping the stored credential and the timer.
    /// Runs under the state lock.
    fn end_session(&self, state: &mut SessionState, next: SessionState) {
        self.epoch.fetch_add(1, Ordering::SeqCst);
        self.soft_failures.store(0, Ordering::SeqCst);
        self.cancel_timer();
        if let Err(e) = self.store.clear() {
            tracing::error!(error = ?e, "Failed to clear stored credential");
        }
        *state = next;
    }

    fn persist(&self, credential: &Credential) {
        // the in-memory session stays valid even if the disk write fails
        if let Err(e) = self.store.save(credential) {
            tracing::error!(error = ?e, "Failed to persist credential");
        }
    }

    /// `time_remaining - refresh_window`, but never below a floor. Tokens
    /// that live no longer than the window would otherwise be renewed back to
    /// back; those wait half their remaining life, at most
    /// `refresh_retry_delay`, and at least `MIN_TIMER_DELAY`.
    fn timer_delay(&self, access_token: &str) -> Duration {
        let remaining = claims::time_remaining(access_token, now_ms());
        let delay = remaining.saturating_sub(self.config.refresh_window);
        if !delay.is_zero() {
            return delay;
        }
        (remaining / 2)
            .min(self.config.refresh_retry_delay)
            .max(MIN_TIMER_DELAY)
    }

    /// Schedule a renewal after `delay`, replacing any pending one
    fn arm_timer(self: &Arc<Self>, delay: Duration) {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            tracing::warn!("No async runtime, pre-emptive refresh disabled");
            return;
        };

        let mut slot = self.timer.lock();
        if let Some(previous) = slot.take() {
            previous.handle.abort();
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let weak: Weak<Self> = Arc::downgrade(self);
        let handle = handle.spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(inner) = weak.upgrade() {
                inner.on_timer_fired(id).await;
            }
        });

        tracing::debug!(timer = id, delay = ?delay, "Refresh timer armed");
        *slot = Some(RefreshTimer { id, handle });
    }

    fn cancel_timer(&self) {
        if let Some(timer) = self.timer.lock().take() {
            timer.handle.abort();
            tracing::debug!(timer = timer.id, "Refresh timer cancelled");
        }
    }

    async fn on_timer_fired(self: Arc<Self>, id: u64) {
        {
            let mut slot = self.timer.lock();
            match slot.as_ref() {
                Some(timer) if timer.id == id => {
                    slot.take();
                }
                _ => return,
            }
        }

        if !self.state.read().is_authenticated {
            return;
        }

        tracing::debug!(timer = id, "Pre-emptive refresh");
        if let Err(e) = self.refresh_access_token().await {
            tracing::debug!(error = %e, "Pre-emptive refresh did not succeed");
        }
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        if let Some(timer) = self.timer.get_mut().take() {
            timer.handle.abort();
        }
    }
}

/// Clears the in-flight slot when the renewal task finishes or unwinds
struct InflightGuard {
    inner: Arc<Inner>,
    id: u64,
}

impl Drop for InflightGuard {
    fn drop(&mut self) {
        let mut slot = self.inner.inflight.lock();
        if slot.as_ref().is_some_and(|cycle| cycle.id == self.id) {
            *slot = None;
        }
    }
}

fn ended_during_refresh() -> RefreshError {
    RefreshError::SessionExpired("session ended during refresh".to_string())
}
