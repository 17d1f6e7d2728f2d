//! Client session state machine.
//!
//! [`SessionReconciler`] owns the token cache and decides when to talk to the
//! server. It guarantees at most one refresh request in flight; concurrent
//! callers needing a token share its outcome.
//!
//! Login and logout bump an epoch. A refresh that settles under an older epoch
//! is discarded, so a late refresh can never resurrect a session the user
//! ended or replace the token a fresh login produced.

use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::cache::TokenCache;
use super::token::{Clock, SystemClock, is_locally_valid, peek_claims};
use super::transport::{AuthTransport, Credentials, PasswordChange, Registration};
use super::ClientError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// No decision made yet.
    Uninitialized,
    /// No valid token and no refresh in progress.
    Anonymous,
    /// A login request is in flight.
    Authenticating,
    /// The cached token is valid.
    Authenticated,
    /// A refresh request is in flight.
    Refreshing,
}

type RefreshResult = Result<Option<String>, ClientError>;
type SharedRefresh = Shared<BoxFuture<'static, RefreshResult>>;

struct Inner {
    epoch: u64,
    in_flight: Option<SharedRefresh>,
}

struct Core {
    transport: Arc<dyn AuthTransport>,
    cache: Arc<dyn TokenCache>,
    clock: Arc<dyn Clock>,
    inner: Mutex<Inner>,
    state: watch::Sender<SessionState>,
}

/// Cloneable handle to one client session.
#[derive(Clone)]
pub struct SessionReconciler {
    core: Arc<Core>,
}

impl SessionReconciler {
    pub fn new(transport: Arc<dyn AuthTransport>, cache: Arc<dyn TokenCache>) -> Self {
        Self::with_clock(transport, cache, Arc::new(SystemClock))
    }

    pub fn with_clock(
        transport: Arc<dyn AuthTransport>,
        cache: Arc<dyn TokenCache>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let (state, _) = watch::channel(SessionState::Uninitialized);
        Self {
            core: Arc::new(Core {
                transport,
                cache,
                clock,
                inner: Mutex::new(Inner {
                    epoch: 0,
                    in_flight: None,
                }),
                state,
            }),
        }
    }

    pub fn state(&self) -> SessionState {
        *self.core.state.borrow()
    }

    /// Observe state transitions.
    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.core.state.subscribe()
    }

    /// Resolve the startup state from the cache, refreshing if the cached
    /// token has expired.
    pub async fn init(&self) -> Result<SessionState, ClientError> {
        self.get_token().await?;
        Ok(self.state())
    }

    /// A token valid right now, or `None` when there is no session.
    ///
    /// Only touches the network when the cached token has expired.
    pub async fn get_token(&self) -> Result<Option<String>, ClientError> {
        let refresh = {
            let mut inner = self.core.lock();
            match self.core.cache.get() {
                None => {
                    self.core.observe(SessionState::Anonymous);
                    return Ok(None);
                }
                Some(token) if is_locally_valid(&token, self.core.clock.now()) => {
                    self.core.observe(SessionState::Authenticated);
                    return Ok(Some(token));
                }
                Some(_) => {
                    let epoch = inner.epoch;
                    inner
                        .in_flight
                        .get_or_insert_with(|| {
                            self.core.observe(SessionState::Refreshing);
                            self.core.start_refresh(epoch)
                        })
                        .clone()
                }
            }
        };

        refresh.await
    }

    /// Subject of the current token, if it is still valid.
    pub fn current_subject(&self) -> Option<String> {
        let token = self.core.cache.get()?;
        let claims = peek_claims(&token)?;
        (!claims.is_expired(self.core.clock.now())).then_some(claims.sub)
    }

    /// Log in. On success the new token supersedes any refresh in flight.
    pub async fn login(&self, credentials: &Credentials) -> Result<(), ClientError> {
        {
            let _inner = self.core.lock();
            self.core.set_state(SessionState::Authenticating);
        }

        match self.core.transport.login(credentials).await {
            Ok(token) => {
                self.core.replace_session(Some(&token));
                info!("Logged in");
                Ok(())
            }
            Err(e) => {
                let inner = self.core.lock();
                if self.state() == SessionState::Authenticating {
                    self.core.set_state(self.core.resting_state(&inner));
                }
                debug!(error = %e, "Login failed");
                Err(e)
            }
        }
    }

    /// Create an account, then log in with the same credentials.
    pub async fn register(&self, registration: &Registration) -> Result<(), ClientError> {
        self.core.transport.register(registration).await?;
        self.login(&registration.credentials()).await
    }

    /// End the session. Local state is cleared before the server is told, and
    /// a failed revoke request does not bring the session back.
    pub async fn logout(&self) {
        self.core.replace_session(None);

        if let Err(e) = self.core.transport.logout().await {
            warn!(error = %e, "Failed to revoke session on server");
        }
    }

    /// Change the password. The server ends every session of the account,
    /// this one included, and the token it hands back starts a new one here.
    pub async fn change_password(&self, change: &PasswordChange) -> Result<(), ClientError> {
        let token = self.get_token().await?.ok_or(ClientError::NotAuthenticated)?;
        let fresh = self.core.transport.change_password(&token, change).await?;
        self.core.replace_session(Some(&fresh));
        info!("Password changed");
        Ok(())
    }

    /// Delete the account, then drop the local session.
    /// On failure the session is left as it was.
    pub async fn delete_account(&self) -> Result<(), ClientError> {
        let token = self.get_token().await?.ok_or(ClientError::NotAuthenticated)?;
        self.core.transport.delete_account(&token).await?;
        self.core.replace_session(None);
        info!("Account deleted");
        Ok(())
    }
}

impl Core {
    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn set_state(&self, next: SessionState) {
        self.state.send_if_modified(|state| {
            if *state == next {
                return false;
            }
            debug!(from = ?state, to = ?next, "Session state");
            *state = next;
            true
        });
    }

    /// Set the state unless a login is in flight; the login settles it.
    fn observe(&self, next: SessionState) {
        let logging_in = *self.state.borrow() == SessionState::Authenticating;
        if !logging_in {
            self.set_state(next);
        }
    }

    /// State to fall back to when a login fails. Anything observed while the
    /// login was in flight is re-derived from the cache.
    fn resting_state(&self, inner: &Inner) -> SessionState {
        if inner.in_flight.is_some() {
            return SessionState::Refreshing;
        }
        match self.cache.get() {
            Some(token) if is_locally_valid(&token, self.clock.now()) => {
                SessionState::Authenticated
            }
            _ => SessionState::Anonymous,
        }
    }

    /// Start over with `token` (or none), superseding any refresh in flight.
    fn replace_session(&self, token: Option<&str>) {
        let mut inner = self.lock();
        inner.epoch += 1;
        inner.in_flight = None;
        self.store(token);
        self.set_state(match token {
            Some(_) => SessionState::Authenticated,
            None => SessionState::Anonymous,
        });
    }

    fn store(&self, token: Option<&str>) {
        if let Err(e) = self.cache.set(token) {
            warn!(error = %e, "Failed to persist token cache");
        }
    }

    fn start_refresh(self: &Arc<Self>, epoch: u64) -> SharedRefresh {
        let transport = Arc::clone(&self.transport);
        let core: Weak<Core> = Arc::downgrade(self);

        async move {
            let result = transport.refresh().await;
            match core.upgrade() {
                Some(core) => core.settle_refresh(epoch, result),
                None => Err(ClientError::TransientFailure("session closed".into())),
            }
        }
        .boxed()
        .shared()
    }

    fn settle_refresh(&self, epoch: u64, result: Result<String, ClientError>) -> RefreshResult {
        let mut inner = self.lock();

        if inner.epoch != epoch {
            debug!("Discarding refresh result from a superseded session");
            return Ok(self
                .cache
                .get()
                .filter(|token| is_locally_valid(token, self.clock.now())));
        }
        inner.in_flight = None;

        match result {
            Ok(token) => {
                self.store(Some(&token));
                self.observe(SessionState::Authenticated);
                Ok(Some(token))
            }
            Err(ClientError::SessionRevoked) => {
                info!("Session revoked by server");
                self.store(None);
                self.observe(SessionState::Anonymous);
                Err(ClientError::SessionRevoked)
            }
            Err(e) => {
                warn!(error = %e, "Refresh failed, keeping cached token");
                self.observe(SessionState::Anonymous);
                Err(e)
            }
        }
    }
}
