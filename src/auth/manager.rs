use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::future::BoxFuture;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::{Mutex, RwLock};

use super::provider::IdentityProvider;
use super::scheduler::RefreshScheduler;
use super::store::CredentialStore;
use super::types::{
    Credential, FetchMode, IdentityEvent, RefreshPolicy, TokenGrant, TokenState, User,
};
use crate::clock::Clock;
use crate::error::BridgeError;

/// What asked for the credential
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Trigger {
    /// A privileged call needs a token now
    Call,
    /// The deferred renewal fired
    Scheduled,
}

struct Inner {
    store: Arc<dyn CredentialStore>,
    provider: Arc<dyn IdentityProvider>,
    scheduler: RefreshScheduler,
    clock: Arc<dyn Clock>,
    policy: RefreshPolicy,

    /// Currently signed-in identity
    identity: RwLock<Option<User>>,

    /// Bumped on every sign-out and identity switch, under the `identity` write lock
    epoch: AtomicU64,

    /// Per-identity single-flight guards around path selection
    flights: DashMap<String, Arc<Mutex<()>>>,
}

/// Credential lifecycle manager.
///
/// Decides for every privileged call whether the cached credential is reused,
/// silently renewed, or fully re-validated, and keeps one deferred renewal armed
/// per signed-in identity. Cloning is cheap and shares state.
#[derive(Clone)]
pub struct CredentialManager {
    inner: Arc<Inner>,
}

impl CredentialManager {
    pub fn new(
        store: Arc<dyn CredentialStore>,
        provider: Arc<dyn IdentityProvider>,
        clock: Arc<dyn Clock>,
        policy: RefreshPolicy,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                store,
                provider,
                scheduler: RefreshScheduler::new(clock.clone()),
                clock,
                policy,
                identity: RwLock::new(None),
                epoch: AtomicU64::new(0),
                flights: DashMap::new(),
            }),
        }
    }

    pub fn policy(&self) -> RefreshPolicy {
        self.inner.policy
    }

    /// Currently signed-in user
    pub async fn current_user(&self) -> Option<User> {
        self.inner.identity.read().await.clone()
    }

    /// Fire time of the armed silent renewal for the signed-in identity
    pub async fn scheduled_refresh_at(&self) -> Option<DateTime<Utc>> {
        let identity = self.current_user().await?;
        self.inner.scheduler.scheduled_at(&identity.id)
    }

    /// React to an identity-state transition
    pub async fn on_identity_change(&self, event: IdentityEvent) -> Result<(), BridgeError> {
        match event {
            IdentityEvent::SignedOut => {
                self.sign_out().await;
                Ok(())
            }
            IdentityEvent::SignedIn(user) => {
                let previous = self.replace_identity(Some(user.clone())).await;

                if let Some(previous) = previous.filter(|p| p.id != user.id) {
                    tracing::info!("Identity changed from {} to {}", previous.id, user.id);
                    self.retire(&previous).await.map_err(store_error)?;
                }

                tracing::info!("Signed in as {}", user.id);
                self.inner
                    .store
                    .set_user(Some(&user))
                    .map_err(store_error)?;

                let credential = self.ensure_credential(&user.id, Trigger::Call).await?;

                // Restored credentials carry no armed renewal yet
                if !self.inner.scheduler.is_armed(&user.id) {
                    if let Some(validated_at) = credential.last_validated_at() {
                        self.schedule_next(&user.id, validated_at);
                    }
                }
                Ok(())
            }
        }
    }

    /// Sign in through the identity provider.
    ///
    /// A new refresh token is handed to the provider first; the validated
    /// account becomes the signed-in identity, replacing any other one.
    pub async fn sign_in(&self, refresh_token: Option<String>) -> Result<User, BridgeError> {
        if let Some(refresh_token) = refresh_token.filter(|t| !t.is_empty()) {
            self.inner.provider.set_refresh_token(refresh_token).await;
        }

        let grant = self
            .inner
            .provider
            .fetch_token(FetchMode::Validate)
            .await
            .map_err(|e| {
                tracing::error!("Sign-in validation failed: {}", e);
                BridgeError::AuthExpired(format!("Sign-in failed: {}", e))
            })?;

        self.sign_in_with(grant).await
    }

    /// Adopt a freshly validated grant as a sign-in.
    ///
    /// The grant must carry the user it was validated for.
    pub async fn sign_in_with(&self, grant: TokenGrant) -> Result<User, BridgeError> {
        let user = grant.user.clone().ok_or_else(|| {
            BridgeError::AuthExpired("Validated grant does not identify a user".to_string())
        })?;

        let now = self.inner.clock.now();
        let credential = Credential::new(grant.token, grant.expires_at, Some(now))
            .map_err(|e| BridgeError::AuthExpired(e.to_string()))?;

        let previous = self.replace_identity(Some(user.clone())).await;
        if let Some(previous) = previous.filter(|p| p.id != user.id) {
            self.retire(&previous).await.map_err(store_error)?;
        }

        // Serialize with any renewal already running for this identity
        let guard = self.flow_guard(&user.id);
        let _flight = guard.lock().await;
        self.session_epoch(&user.id).await?;

        self.inner.store.set(&credential).map_err(store_error)?;
        self.inner
            .store
            .set_user(Some(&user))
            .map_err(store_error)?;
        self.schedule_next(&user.id, now);

        tracing::info!("Signed in as {} with a validated token", user.id);
        Ok(user)
    }

    /// Forget the signed-in identity, its credential and its armed renewal
    pub async fn sign_out(&self) {
        let previous = self.replace_identity(None).await;

        let cleared = match &previous {
            Some(previous) => self.retire(previous).await,
            None => self.inner.store.clear(),
        };
        if let Err(e) = cleared {
            tracing::error!("Failed to clear credential store on sign-out: {}", e);
        }

        tracing::info!(
            "Signed out{}",
            previous
                .map(|u| format!(" ({})", u.id))
                .unwrap_or_default()
        );
    }

    /// Swap the signed-in identity. Any change of identity starts a new epoch,
    /// which invalidates renewals still in flight for the old one.
    async fn replace_identity(&self, next: Option<User>) -> Option<User> {
        let mut identity = self.inner.identity.write().await;
        let changed = match (identity.as_ref(), next.as_ref()) {
            (Some(current), Some(next)) => current.id != next.id,
            (None, None) => false,
            _ => true,
        };
        if changed {
            self.inner.epoch.fetch_add(1, Ordering::SeqCst);
        }
        std::mem::replace(&mut *identity, next)
    }

    /// Tear down the state of an identity that is no longer signed in.
    ///
    /// Waits for its in-flight renewal so nothing is written back after the clear.
    async fn retire(&self, previous: &User) -> Result<(), super::store::StoreError> {
        let guard = self.flow_guard(&previous.id);
        let _flight = guard.lock().await;

        self.inner.scheduler.cancel(&previous.id);
        self.inner.flights.remove(&previous.id);
        self.inner.store.clear()
    }

    /// Epoch of `identity` if it is still the signed-in identity
    async fn session_epoch(&self, identity: &str) -> Result<u64, BridgeError> {
        let current = self.inner.identity.read().await;
        match current.as_ref() {
            Some(user) if user.id == identity => Ok(self.inner.epoch.load(Ordering::SeqCst)),
            _ => Err(BridgeError::AuthRequired),
        }
    }

    /// Fails with `AuthRequired` once `identity` was signed out or replaced
    async fn ensure_session(&self, identity: &str, epoch: u64) -> Result<(), BridgeError> {
        if self.session_epoch(identity).await? == epoch {
            Ok(())
        } else {
            Err(BridgeError::AuthRequired)
        }
    }

    /// Get a usable bearer token for the signed-in identity
    pub async fn resolve_token(&self) -> Result<String, BridgeError> {
        let identity = self.current_user().await.ok_or(BridgeError::AuthRequired)?;
        let credential = self.ensure_credential(&identity.id, Trigger::Call).await?;
        Ok(credential.token().to_string())
    }

    /// Drop trust in the cached credential and validate again.
    ///
    /// Used when the remote store rejects a token that looked fresh.
    pub async fn force_revalidate(&self) -> Result<String, BridgeError> {
        let identity = self.current_user().await.ok_or(BridgeError::AuthRequired)?;
        let guard = self.flow_guard(&identity.id);
        let _flight = guard.lock().await;

        let epoch = self.session_epoch(&identity.id).await?;
        let cached = self.inner.store.get().map_err(store_error)?;
        let credential = self.validate(&identity.id, epoch, cached, false).await?;
        Ok(credential.token().to_string())
    }

    fn flow_guard(&self, identity: &str) -> Arc<Mutex<()>> {
        self.inner
            .flights
            .entry(identity.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Choose and run one of the renewal paths for `identity`
    async fn ensure_credential(
        &self,
        identity: &str,
        trigger: Trigger,
    ) -> Result<Credential, BridgeError> {
        let guard = self.flow_guard(identity);
        let _flight = guard.lock().await;

        // Sign-out or an identity switch may have happened while waiting
        let epoch = self.session_epoch(identity).await?;

        let now = self.inner.clock.now();
        let cached = self.inner.store.get().map_err(store_error)?;
        let state = match trigger {
            Trigger::Call => self.inner.policy.classify(cached.as_ref(), now),
            Trigger::Scheduled => self.inner.policy.classify_scheduled(cached.as_ref(), now),
        };

        tracing::debug!("Credential state for {}: {:?} ({:?})", identity, state, trigger);

        match (state, cached) {
            (TokenState::Fresh, Some(credential)) => Ok(credential),
            (TokenState::ExpiredValidationFresh, Some(credential)) => {
                self.renew(identity, epoch, credential, trigger).await
            }
            (_, cached) => self.validate(identity, epoch, cached, true).await,
        }
    }

    /// Non-validating renewal: new token, same validation time
    async fn renew(
        &self,
        identity: &str,
        epoch: u64,
        cached: Credential,
        trigger: Trigger,
    ) -> Result<Credential, BridgeError> {
        tracing::debug!("Renewing token for {} without validation", identity);

        let grant = self
            .inner
            .provider
            .fetch_token(FetchMode::Renew)
            .await
            .map_err(|e| {
                tracing::error!("Silent token renewal failed: {}", e);
                BridgeError::AuthExpired(format!("Token renewal failed: {}", e))
            })?;
        self.ensure_session(identity, epoch).await?;

        let credential = cached
            .renewed(&grant)
            .map_err(|e| BridgeError::AuthExpired(e.to_string()))?;
        self.inner.store.set(&credential).map_err(store_error)?;

        if trigger == Trigger::Scheduled {
            if let Some(validated_at) = credential.last_validated_at() {
                self.schedule_next(identity, validated_at);
            }
        }

        Ok(credential)
    }

    /// Full validation round trip; starts a new validation window
    async fn validate(
        &self,
        identity: &str,
        epoch: u64,
        cached: Option<Credential>,
        allow_degraded: bool,
    ) -> Result<Credential, BridgeError> {
        tracing::info!("Validating session for {}", identity);

        let fetched = self.inner.provider.fetch_token(FetchMode::Validate).await;
        self.ensure_session(identity, epoch).await?;

        let grant = match fetched {
            Ok(grant) => grant,
            Err(e) => {
                tracing::error!("Session validation failed: {}", e);

                // Graceful degradation: the cached token still works until it expires
                if allow_degraded {
                    if let Some(cached) = cached {
                        if !cached.is_expired(self.inner.clock.now()) {
                            tracing::warn!(
                                "Using existing token despite validation failure (not yet expired)"
                            );
                            return Ok(cached);
                        }
                    }
                }

                return Err(BridgeError::AuthExpired(format!(
                    "Session validation failed: {}",
                    e
                )));
            }
        };

        if let Some(user) = &grant.user {
            if user.id != identity {
                tracing::warn!(
                    "Validated token belongs to {}, expected {}",
                    user.id,
                    identity
                );
                return Err(BridgeError::AuthExpired(
                    "Validated token belongs to a different identity".to_string(),
                ));
            }
            {
                let mut current = self.inner.identity.write().await;
                if self.inner.epoch.load(Ordering::SeqCst) != epoch {
                    return Err(BridgeError::AuthRequired);
                }
                *current = Some(user.clone());
            }
            self.inner.store.set_user(Some(user)).map_err(store_error)?;
        }

        let now = self.inner.clock.now();
        let credential = Credential::new(grant.token, grant.expires_at, Some(now))
            .map_err(|e| BridgeError::AuthExpired(e.to_string()))?;
        self.inner.store.set(&credential).map_err(store_error)?;
        self.schedule_next(identity, now);

        Ok(credential)
    }

    /// Arm the silent renewal for the window that started at `validated_at`
    fn schedule_next(&self, identity: &str, validated_at: DateTime<Utc>) {
        let fire_at = self.inner.policy.next_refresh_at(validated_at);
        let weak = Arc::downgrade(&self.inner);
        let key = identity.to_string();

        let armed = self
            .inner
            .scheduler
            .arm(identity, fire_at, move || scheduled_refresh(weak, key));

        if !armed {
            tracing::debug!("Refresh for {} already due, renewing now", identity);
            tokio::spawn(scheduled_refresh(
                Arc::downgrade(&self.inner),
                identity.to_string(),
            ));
        }
    }
}

/// Body of the deferred renewal. Failures are logged and left for the next
/// `resolve_token` to retry lazily.
fn scheduled_refresh(inner: Weak<Inner>, identity: String) -> BoxFuture<'static, ()> {
    Box::pin(async move {
        let Some(inner) = inner.upgrade() else {
            return;
        };
        let manager = CredentialManager { inner };

        match manager.ensure_credential(&identity, Trigger::Scheduled).await {
            Ok(credential) => tracing::info!(
                "Scheduled refresh for {} succeeded, token expires {}",
                identity,
                credential.expires_at().to_rfc3339()
            ),
            Err(BridgeError::AuthRequired) => {
                tracing::debug!("Scheduled refresh for {} skipped: signed out", identity)
            }
            Err(e) => tracing::warn!("Scheduled refresh for {} failed: {}", identity, e),
        }
    })
}

fn store_error(e: super::store::StoreError) -> BridgeError {
    BridgeError::Internal(anyhow::Error::new(e).context("Credential store failure"))
}
