//! Credential state and single-flight refresh
//!
//! `AuthStrategy` is the per-backend piece: how to present the credential,
//! how to recognize an auth failure, and how to exchange a refresh token.
//! `RefreshCoordinator` wraps one strategy and one credential and guarantees
//! at most one token exchange per credential generation, whatever the number
//! of requests that fail concurrently.
//!
//! ```text
//! unauthenticated ──sign in──▶ authenticated ──auth failure──▶ refreshing
//!                                   ▲                              │
//!                                   └──────────ok──────────────────┤
//!                                                                  ▼
//!                                                               expired
//! ```

use async_trait::async_trait;
use futures_util::future::{BoxFuture, FutureExt, Shared};
use reqwest::header::HeaderValue;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{info, warn};

use super::credential::{AuthScheme, Credential};
use super::http::{HttpResponse, HttpTransport};
use super::ProviderError;

/// Per-backend authentication behavior
#[async_trait]
pub trait AuthStrategy: Send + Sync {
    /// `Authorization` header for `credential`
    fn authorize(&self, credential: &Credential) -> Result<HeaderValue, ProviderError> {
        credential.authorization()
    }

    /// Whether `response` means the credential was rejected
    fn is_auth_failure(&self, _credential: &Credential, response: &HttpResponse) -> bool {
        response.status == 401
    }

    /// Exchange the refresh token for a new credential
    async fn refresh(
        &self,
        transport: Arc<dyn HttpTransport>,
        credential: &Credential,
    ) -> Result<Credential, ProviderError>;
}

/// Username/password credentials; nothing to refresh
pub struct StaticAuth;

#[async_trait]
impl AuthStrategy for StaticAuth {
    async fn refresh(&self, _: Arc<dyn HttpTransport>, _: &Credential) -> Result<Credential, ProviderError> {
        Err(ProviderError::Auth("The server rejected the saved credentials".to_string()))
    }
}

/// Portal session tokens.
///
/// Older deployments report an expired session as an error envelope
/// rather than a bare 401. There is no refresh endpoint.
pub struct PortalAuth;

const LEGACY_AUTH_MESSAGES: &[&str] = &["unauthorized", "access denied", "user authentication failed"];

fn is_legacy_auth_message(body: &[u8]) -> bool {
    let Ok(json) = serde_json::from_slice::<serde_json::Value>(body) else {
        return false;
    };
    json.pointer("/error/message")
        .and_then(|m| m.as_str())
        .map(|m| m.trim().to_lowercase())
        .is_some_and(|m| LEGACY_AUTH_MESSAGES.iter().any(|known| m == *known))
}

#[async_trait]
impl AuthStrategy for PortalAuth {
    fn is_auth_failure(&self, credential: &Credential, response: &HttpResponse) -> bool {
        response.status == 401
            || (credential.scheme == AuthScheme::LegacyRaw && is_legacy_auth_message(&response.body))
    }

    async fn refresh(&self, _: Arc<dyn HttpTransport>, _: &Credential) -> Result<Credential, ProviderError> {
        Err(ProviderError::Auth("Your session has expired. Please sign in again.".to_string()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialState {
    Unauthenticated,
    Authenticated,
    Refreshing,
    Expired,
}

pub type RefreshListener = Arc<dyn Fn(&Credential) + Send + Sync>;

type SharedRefresh = Shared<BoxFuture<'static, Result<(), ProviderError>>>;

struct Slot {
    credential: Option<Credential>,
    /// Bumped whenever the credential changes
    generation: u64,
    /// Unix time the current credential was installed
    issued_at: i64,
    state: CredentialState,
    in_flight: Option<SharedRefresh>,
    expired_error: Option<ProviderError>,
}

struct CoordinatorInner {
    label: String,
    strategy: Arc<dyn AuthStrategy>,
    transport: Arc<dyn HttpTransport>,
    refresh_timeout: Duration,
    slot: Mutex<Slot>,
    listener: Mutex<Option<RefreshListener>>,
    exchanges: AtomicU64,
}

impl CoordinatorInner {
    fn slot(&self) -> std::sync::MutexGuard<'_, Slot> {
        self.slot.lock().unwrap_or_else(|e| e.into_inner())
    }

    async fn perform_refresh(&self, generation: u64, credential: Credential) -> Result<(), ProviderError> {
        self.exchanges.fetch_add(1, Ordering::SeqCst);
        info!("[{}] refreshing access token", self.label);

        let exchange = self.strategy.refresh(self.transport.clone(), &credential);
        let result = match tokio::time::timeout(self.refresh_timeout, exchange).await {
            Ok(result) => result,
            Err(_) => Err(ProviderError::Transport("Token refresh timed out".to_string())),
        };

        let mut slot = self.slot();
        slot.in_flight = None;
        if slot.generation != generation {
            // Credential was replaced while we were refreshing; keep the newer one
            if slot.state == CredentialState::Refreshing {
                slot.state = CredentialState::Authenticated;
            }
            return Ok(());
        }

        match result {
            Ok(fresh) => {
                slot.credential = Some(fresh.clone());
                slot.generation += 1;
                slot.issued_at = chrono::Utc::now().timestamp();
                slot.state = CredentialState::Authenticated;
                slot.expired_error = None;
                drop(slot);
                info!("[{}] access token refreshed", self.label);
                let listener = self.listener.lock().unwrap_or_else(|e| e.into_inner()).clone();
                if let Some(listener) = listener {
                    listener(&fresh);
                }
                Ok(())
            }
            Err(err) => {
                warn!("[{}] token refresh failed: {}", self.label, err);
                slot.state = CredentialState::Expired;
                slot.expired_error = Some(err.clone());
                Err(err)
            }
        }
    }
}

/// Result of `RefreshCoordinator::authorize`
#[derive(Debug, Clone)]
pub struct Authorization {
    /// Credential generation the header was built from
    pub generation: u64,
    pub header: HeaderValue,
}

enum Next {
    Wait(SharedRefresh),
    Refresh(u64),
}

/// Owns one credential and serializes its refreshes
#[derive(Clone)]
pub struct RefreshCoordinator {
    inner: Arc<CoordinatorInner>,
}

impl RefreshCoordinator {
    pub fn new(
        label: &str,
        strategy: Arc<dyn AuthStrategy>,
        transport: Arc<dyn HttpTransport>,
        credential: Option<Credential>,
        refresh_timeout: Duration,
    ) -> Self {
        let state = if credential.is_some() {
            CredentialState::Authenticated
        } else {
            CredentialState::Unauthenticated
        };
        Self {
            inner: Arc::new(CoordinatorInner {
                label: label.to_string(),
                strategy,
                transport,
                refresh_timeout,
                slot: Mutex::new(Slot {
                    credential,
                    generation: 0,
                    issued_at: chrono::Utc::now().timestamp(),
                    state,
                    in_flight: None,
                    expired_error: None,
                }),
                listener: Mutex::new(None),
                exchanges: AtomicU64::new(0),
            }),
        }
    }

    pub fn state(&self) -> CredentialState {
        self.inner.slot().state
    }

    pub fn credential(&self) -> Option<Credential> {
        self.inner.slot().credential.clone()
    }

    pub fn generation(&self) -> u64 {
        self.inner.slot().generation
    }

    /// Number of token exchanges performed so far
    pub fn exchanges(&self) -> u64 {
        self.inner.exchanges.load(Ordering::SeqCst)
    }

    /// Called with the new credential after every successful refresh
    pub fn on_refresh(&self, listener: RefreshListener) {
        *self.inner.listener.lock().unwrap_or_else(|e| e.into_inner()) = Some(listener);
    }

    /// Install a credential from sign-in; leaves `Expired`
    pub fn set_credential(&self, credential: Credential) {
        let mut slot = self.inner.slot();
        slot.credential = Some(credential);
        slot.generation += 1;
        slot.issued_at = chrono::Utc::now().timestamp();
        slot.state = CredentialState::Authenticated;
        slot.expired_error = None;
    }

    /// Switch the header scheme, e.g. once the server version is known
    pub fn set_scheme(&self, scheme: AuthScheme) {
        let mut slot = self.inner.slot();
        let changed = match slot.credential.as_mut() {
            Some(credential) if credential.scheme != scheme => {
                credential.scheme = scheme;
                true
            }
            _ => false,
        };
        if changed {
            slot.generation += 1;
        }
    }

    pub fn sign_out(&self) {
        let mut slot = self.inner.slot();
        slot.credential = None;
        slot.generation += 1;
        slot.state = CredentialState::Unauthenticated;
        slot.expired_error = None;
    }

    pub fn is_auth_failure(&self, response: &HttpResponse) -> bool {
        match self.inner.slot().credential.as_ref() {
            Some(credential) => self.inner.strategy.is_auth_failure(credential, response),
            None => response.status == 401,
        }
    }

    /// Header for the next request.
    ///
    /// Waits out a refresh in progress, refreshes ahead of a known expiry
    /// once, and fails fast without network once the credential is expired.
    pub async fn authorize(&self) -> Result<Authorization, ProviderError> {
        let mut refreshed_ahead = false;
        loop {
            let next = {
                let slot = self.inner.slot();
                match slot.state {
                    CredentialState::Unauthenticated => {
                        return Err(ProviderError::Auth("Not signed in".to_string()));
                    }
                    CredentialState::Expired => {
                        return Err(slot
                            .expired_error
                            .clone()
                            .unwrap_or_else(|| ProviderError::Auth("Session expired".to_string())));
                    }
                    CredentialState::Refreshing => match slot.in_flight.clone() {
                        Some(pending) => Next::Wait(pending),
                        None => Next::Refresh(slot.generation),
                    },
                    CredentialState::Authenticated => {
                        let Some(credential) = slot.credential.as_ref() else {
                            return Err(ProviderError::Auth("Not signed in".to_string()));
                        };
                        let now = chrono::Utc::now().timestamp();
                        if !refreshed_ahead
                            && credential.can_refresh()
                            && credential.needs_refresh_at(now, slot.issued_at)
                        {
                            Next::Refresh(slot.generation)
                        } else {
                            return Ok(Authorization {
                                generation: slot.generation,
                                header: self.inner.strategy.authorize(credential)?,
                            });
                        }
                    }
                }
            };
            match next {
                Next::Wait(pending) => {
                    let _ = pending.await;
                }
                Next::Refresh(generation) => {
                    refreshed_ahead = true;
                    self.recover(generation).await?;
                }
            }
        }
    }

    /// Handle an auth failure seen with credential `failed_generation`.
    ///
    /// Returns `Ok` when the caller should retry: either this call refreshed
    /// the credential, or another caller already had. Concurrent callers for
    /// the same generation share one exchange and its outcome.
    pub async fn recover(&self, failed_generation: u64) -> Result<(), ProviderError> {
        let pending = {
            let mut slot = self.inner.slot();
            if slot.generation != failed_generation {
                return Ok(());
            }
            match slot.state {
                CredentialState::Unauthenticated => {
                    return Err(ProviderError::Auth("Not signed in".to_string()));
                }
                CredentialState::Expired => {
                    return Err(slot
                        .expired_error
                        .clone()
                        .unwrap_or_else(|| ProviderError::Auth("Session expired".to_string())));
                }
                CredentialState::Refreshing if slot.in_flight.is_some() => slot.in_flight.clone(),
                _ => None,
            }
            .unwrap_or_else(|| self.start_refresh(&mut slot, failed_generation))
        };
        pending.await
    }

    /// Explicit refresh requested by the host, also allowed from `Expired`
    pub async fn refresh_now(&self) -> Result<(), ProviderError> {
        let generation = {
            let mut slot = self.inner.slot();
            if slot.state == CredentialState::Expired {
                slot.state = CredentialState::Authenticated;
                slot.expired_error = None;
            }
            slot.generation
        };
        self.recover(generation).await
    }

    fn start_refresh(&self, slot: &mut Slot, generation: u64) -> SharedRefresh {
        let Some(credential) = slot.credential.clone() else {
            return futures_util::future::ready(Err(ProviderError::Auth("Not signed in".to_string())))
                .boxed()
                .shared();
        };
        let inner = self.inner.clone();
        let task = tokio::spawn(async move { inner.perform_refresh(generation, credential).await });

        let inner = self.inner.clone();
        let pending = async move {
            match task.await {
                Ok(result) => result,
                Err(join_error) => {
                    let err = ProviderError::Auth(format!("Token refresh aborted: {}", join_error));
                    let mut slot = inner.slot();
                    slot.in_flight = None;
                    if slot.generation == generation {
                        slot.state = CredentialState::Expired;
                        slot.expired_error = Some(err.clone());
                    }
                    Err(err)
                }
            }
        }
        .boxed()
        .shared();

        slot.state = CredentialState::Refreshing;
        slot.in_flight = Some(pending.clone());
        pending
    }
}
