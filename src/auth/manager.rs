use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, RwLock};

use super::clock::SessionClock;
use super::codec::{self, DecodedClaims};
use super::coordinator::ReauthCoordinator;
use super::exchange::{AuthExchange, ProfileLookup};
use super::store::{CredentialStore, PersistedStorage, StoreLifetimes};
use super::types::{
    AccessGrant, Credentials, Identity, RefreshGrant, Session, SessionPhase, SessionPolicy,
};
use crate::error::{AuthError, Result};
use crate::http_client::SessionAuthority;

/// Session lifecycle manager
///
/// Owns the session state machine:
///
/// ```text
/// SignedOut --login--> SignedIn --wake / 401--> Reauthenticating --ok--> SignedIn
///     ^                   |                          |
///     +------logout-------+------------fail----------+
/// ```
///
/// Cheap to clone; every clone drives the same session. Proactive wakes and
/// 401-driven re-authentication both go through [`SessionManager::force_reauth`],
/// so racing triggers collapse into one exchange.
#[derive(Clone)]
pub struct SessionManager {
    inner: Arc<Inner>,
}

struct Inner {
    /// Current session; token, expiry and identity change under one write
    session: RwLock<Session>,

    store: CredentialStore,
    exchange: Arc<dyn AuthExchange>,
    profiles: Option<Arc<dyn ProfileLookup>>,
    clock: SessionClock,
    coordinator: ReauthCoordinator<AccessGrant>,
    policy: SessionPolicy,
    phase_tx: watch::Sender<SessionPhase>,
}

/// How a re-authentication obtained its token
enum Renewal {
    Refreshed(RefreshGrant),
    /// Refresh unavailable or failed but the current token still validates
    Validated(String),
}

/// Builder for [`SessionManager`]
pub struct SessionManagerBuilder {
    exchange: Arc<dyn AuthExchange>,
    storage: Arc<dyn PersistedStorage>,
    profiles: Option<Arc<dyn ProfileLookup>>,
    policy: SessionPolicy,
    lifetimes: StoreLifetimes,
    namespace: String,
}

impl SessionManagerBuilder {
    pub fn profile_lookup(mut self, profiles: Arc<dyn ProfileLookup>) -> Self {
        self.profiles = Some(profiles);
        self
    }

    pub fn policy(mut self, policy: SessionPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn lifetimes(mut self, lifetimes: StoreLifetimes) -> Self {
        self.lifetimes = lifetimes;
        self
    }

    pub fn namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    pub fn build(self) -> SessionManager {
        let (phase_tx, _) = watch::channel(SessionPhase::SignedOut);
        SessionManager {
            inner: Arc::new(Inner {
                session: RwLock::new(Session::default()),
                store: CredentialStore::with_namespace(
                    self.storage,
                    self.lifetimes,
                    &self.namespace,
                ),
                exchange: self.exchange,
                profiles: self.profiles,
                clock: SessionClock::new(),
                coordinator: ReauthCoordinator::new(self.policy.exchange_timeout),
                policy: self.policy,
                phase_tx,
            }),
        }
    }
}

impl SessionManager {
    /// Start building a manager around its collaborators
    pub fn builder(
        exchange: Arc<dyn AuthExchange>,
        storage: Arc<dyn PersistedStorage>,
    ) -> SessionManagerBuilder {
        SessionManagerBuilder {
            exchange,
            storage,
            profiles: None,
            policy: SessionPolicy::default(),
            lifetimes: StoreLifetimes::default(),
            namespace: CredentialStore::DEFAULT_NAMESPACE.to_string(),
        }
    }

    /// Sign in with username and password
    ///
    /// Errors from the exchange are surfaced verbatim and leave the session untouched.
    pub async fn login(&self, credentials: &Credentials, remember_me: bool) -> Result<Identity> {
        tracing::info!(username = %credentials.username, "Signing in...");

        let grant = match self.inner.exchange.login(credentials).await {
            Ok(grant) => grant,
            Err(e) => {
                tracing::warn!(error = %e, "Sign-in failed");
                return Err(e);
            }
        };

        let claims = decode_logged(&grant.access_token);
        let expires_at = claims.as_ref().and_then(|c| c.expires_at);
        let mut identity = grant.identity;
        if identity.id.is_empty() {
            if let Some(subject) = claims.as_ref().and_then(|c| c.subject.clone()) {
                identity.id = subject;
            }
        }

        let generation = {
            let mut session = self.inner.session.write().await;
            let generation = session.generation + 1;
            *session = Session {
                access_token: Some(grant.access_token.clone()),
                refresh_token: grant.refresh_token.clone(),
                expires_at,
                identity: Some(identity),
                phase: SessionPhase::SignedIn,
                remember_me,
                generation,
            };

            self.inner.store.clear_all();
            self.inner
                .store
                .set_access_token(&grant.access_token, remember_me);
            if let Some(ref refresh_token) = grant.refresh_token {
                self.inner.store.set_refresh_token(refresh_token, remember_me);
            }
            self.schedule_renewal(expires_at, true);
            generation
        };
        self.publish(SessionPhase::SignedIn);

        self.refresh_identity(generation).await;

        tracing::info!(
            expires_at = ?expires_at.map(|t| t.to_rfc3339()),
            "✅ Signed in"
        );
        self.current_identity()
            .await
            .ok_or(AuthError::NotSignedIn)
    }

    /// Clear the session, stored credentials and pending wake
    ///
    /// Always succeeds; calling it twice is the same as calling it once.
    pub async fn logout(&self) {
        let was = {
            let mut session = self.inner.session.write().await;
            let was = session.phase;
            self.reset_locked(&mut session);
            was
        };
        self.publish(SessionPhase::SignedOut);

        if was != SessionPhase::SignedOut {
            tracing::info!("Signed out");
        }
    }

    /// Restore a persisted session at startup
    ///
    /// A stored token that validates, or whose validation fails for a
    /// tolerated network reason, keeps the user signed in. Only an explicit
    /// rejection (or an expired token with no way to refresh) signs out.
    pub async fn load_stored_auth(&self) -> SessionPhase {
        let Some(access_token) = self.inner.store.access_token() else {
            tracing::debug!("No stored session");
            return SessionPhase::SignedOut;
        };

        let claims = match codec::decode(&access_token) {
            Ok(claims) => claims,
            Err(e) => {
                tracing::warn!(error = %e, "Stored access token is malformed, discarding");
                self.logout().await;
                return SessionPhase::SignedOut;
            }
        };

        let refresh_token = self.inner.store.refresh_token();
        let has_refresh_token = refresh_token.is_some();
        let generation = {
            let mut session = self.inner.session.write().await;
            let generation = session.generation + 1;
            *session = Session {
                access_token: Some(access_token.clone()),
                refresh_token,
                expires_at: claims.expires_at,
                identity: claims.identity(),
                phase: SessionPhase::SignedIn,
                remember_me: self.inner.store.remember_me(),
                generation,
            };
            generation
        };

        if claims.is_expired_at(Utc::now()) {
            if !has_refresh_token {
                tracing::info!("Stored session has expired");
                self.logout().await;
                return SessionPhase::SignedOut;
            }

            tracing::info!("Stored access token has expired, refreshing...");
            return match self.force_reauth().await {
                Ok(_) => {
                    self.refresh_identity(generation).await;
                    self.phase().await
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Could not renew stored session");
                    self.phase().await
                }
            };
        }

        match self.inner.exchange.validate(&access_token).await {
            Ok(true) => tracing::info!("Restored stored session"),
            Ok(false) => {
                tracing::info!("Stored access token was rejected by the server");
                self.sign_out_generation(generation).await;
                return SessionPhase::SignedOut;
            }
            Err(AuthError::Unreachable { kind, message })
                if self.inner.policy.network_errors.tolerates(kind) =>
            {
                tracing::warn!(
                    error_kind = %kind,
                    error = %message,
                    "Could not validate stored session, continuing with stored token"
                );
            }
            Err(e) => {
                tracing::warn!(error = %e, "Stored session validation failed");
                self.sign_out_generation(generation).await;
                return SessionPhase::SignedOut;
            }
        }

        {
            let session = self.inner.session.read().await;
            if session.generation != generation {
                return session.phase;
            }
            self.schedule_renewal(claims.expires_at, true);
        }
        self.publish(SessionPhase::SignedIn);
        self.refresh_identity(generation).await;

        self.phase().await
    }

    /// Renew now if the token is inside the refresh margin or already expired
    pub async fn ensure_fresh(&self) -> Result<()> {
        let expires_at = {
            let session = self.inner.session.read().await;
            if session.phase == SessionPhase::SignedOut {
                return Err(AuthError::NotSignedIn);
            }
            session.expires_at
        };

        let Some(expires_at) = expires_at else {
            return Ok(());
        };
        if Utc::now() + to_chrono(self.inner.policy.refresh_margin) < expires_at {
            return Ok(());
        }

        tracing::debug!("Access token inside refresh margin, renewing");
        self.force_reauth().await.map(|_| ())
    }

    /// Re-authenticate, joining any exchange already in flight
    ///
    /// On total failure the session is signed out and the error returned.
    pub async fn force_reauth(&self) -> Result<AccessGrant> {
        let generation = {
            let session = self.inner.session.read().await;
            if session.phase == SessionPhase::SignedOut {
                return Err(AuthError::NotSignedIn);
            }
            session.generation
        };

        let manager = self.clone();
        let expiring = self.clone();
        self.inner
            .coordinator
            .reauthenticate_scoped(
                generation,
                move || manager.run_exchange(generation),
                move |timeout| expiring.expire_exchange(generation, timeout),
            )
            .await
    }

    pub async fn is_signed_in(&self) -> bool {
        self.phase().await != SessionPhase::SignedOut
    }

    pub async fn phase(&self) -> SessionPhase {
        self.inner.session.read().await.phase
    }

    pub async fn current_identity(&self) -> Option<Identity> {
        self.inner.session.read().await.identity.clone()
    }

    pub async fn access_token(&self) -> Option<String> {
        self.inner.session.read().await.access_token.clone()
    }

    /// Whether the signed-in identity carries `role`
    pub async fn has_role(&self, role: &str) -> bool {
        self.inner
            .session
            .read()
            .await
            .identity
            .as_ref()
            .map_or(false, |identity| identity.roles.contains(role))
    }

    /// Consistent copy of the whole session
    pub async fn snapshot(&self) -> Session {
        self.inner.session.read().await.clone()
    }

    /// Observe phase transitions
    pub fn watch_phase(&self) -> watch::Receiver<SessionPhase> {
        self.inner.phase_tx.subscribe()
    }

    /// Instant of the pending proactive refresh, if armed
    pub fn next_wake(&self) -> Option<DateTime<Utc>> {
        self.inner.clock.deadline()
    }

    /// Number of re-authentication exchanges started so far
    pub fn exchanges_started(&self) -> u64 {
        self.inner.coordinator.exchanges_started()
    }

    /// The exchange run under the coordinator; resolves only after the
    /// session, the store and the clock reflect its outcome
    async fn run_exchange(self, generation: u64) -> Result<AccessGrant> {
        let (access_token, refresh_token) = {
            let mut session = self.inner.session.write().await;
            if session.generation != generation || session.phase == SessionPhase::SignedOut {
                return Err(AuthError::NotSignedIn);
            }
            session.phase = SessionPhase::Reauthenticating;
            (session.access_token.clone(), session.refresh_token.clone())
        };
        self.publish(SessionPhase::Reauthenticating);

        match self.renew(access_token, refresh_token).await {
            Ok(renewal) => self.apply_renewal(generation, renewal).await,
            Err(e) => {
                tracing::error!(error = %e, "Re-authentication failed, signing out");
                self.sign_out_generation(generation).await;
                Err(e)
            }
        }
    }

    /// Outcome of an exchange that ran past its deadline: the session it was
    /// renewing is signed out like any other failed renewal
    async fn expire_exchange(self, generation: u64, timeout: Duration) -> Result<AccessGrant> {
        let err = AuthError::TimedOut(timeout);
        tracing::error!(error = %err, "Re-authentication failed, signing out");
        self.sign_out_generation(generation).await;
        Err(err)
    }

    /// Refresh if possible, otherwise fall back to validating the current token
    async fn renew(
        &self,
        access_token: Option<String>,
        refresh_token: Option<String>,
    ) -> Result<Renewal> {
        if let Some(refresh_token) = refresh_token {
            match self.inner.exchange.refresh(&refresh_token).await {
                Ok(grant) => {
                    tracing::info!("Access token refreshed");
                    return Ok(Renewal::Refreshed(grant));
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Token refresh failed, validating current token");
                }
            }
        }

        let access_token = access_token.ok_or(AuthError::NotSignedIn)?;
        match self.inner.exchange.validate(&access_token).await {
            Ok(true) => Ok(Renewal::Validated(access_token)),
            Ok(false) => Err(AuthError::SessionRejected(
                "access token is no longer valid".to_string(),
            )),
            Err(AuthError::Unreachable { kind, message })
                if self.inner.policy.network_errors.tolerates(kind) =>
            {
                tracing::warn!(
                    error_kind = %kind,
                    error = %message,
                    "Token validation unreachable, keeping current token"
                );
                Ok(Renewal::Validated(access_token))
            }
            Err(e) => Err(e),
        }
    }

    async fn apply_renewal(&self, generation: u64, renewal: Renewal) -> Result<AccessGrant> {
        let (access_token, rotated_refresh_token, validated) = match renewal {
            Renewal::Refreshed(grant) => (grant.access_token, grant.refresh_token, false),
            Renewal::Validated(token) => (token, None, true),
        };
        let claims = decode_logged(&access_token);
        let expires_at = claims.as_ref().and_then(|c| c.expires_at);

        {
            let mut session = self.inner.session.write().await;
            if session.generation != generation || session.phase == SessionPhase::SignedOut {
                tracing::debug!("Session changed during re-authentication, discarding result");
                return Err(AuthError::NotSignedIn);
            }

            session.access_token = Some(access_token.clone());
            session.expires_at = expires_at;
            if let Some(ref refresh_token) = rotated_refresh_token {
                session.refresh_token = Some(refresh_token.clone());
            }
            if validated {
                if let Some(derived) = claims.as_ref().and_then(DecodedClaims::identity) {
                    let known = session.identity.as_ref().map(|i| i.id.as_str());
                    if known != Some(derived.id.as_str()) {
                        session.identity = Some(derived);
                    }
                }
            }
            session.phase = SessionPhase::SignedIn;

            // Persist, then reschedule, before any waiter sees the outcome
            let remember_me = session.remember_me;
            self.inner.store.set_access_token(&access_token, remember_me);
            if let Some(ref refresh_token) = rotated_refresh_token {
                self.inner.store.set_refresh_token(refresh_token, remember_me);
            }
            self.schedule_renewal(expires_at, !validated);
        }
        self.publish(SessionPhase::SignedIn);

        Ok(AccessGrant {
            access_token,
            expires_at,
        })
    }

    /// Arm the proactive wake at `expires_at - margin`
    ///
    /// With `allow_due` false a wake that would already be due is not armed,
    /// so a token that merely validated cannot drive a wake loop.
    fn schedule_renewal(&self, expires_at: Option<DateTime<Utc>>, allow_due: bool) {
        let Some(expires_at) = expires_at else {
            tracing::debug!("Access token has no expiry, proactive refresh disabled");
            self.inner.clock.cancel();
            return;
        };

        let now = Utc::now();
        let due = expires_at - to_chrono(self.inner.policy.refresh_margin);
        if due <= now && !allow_due {
            tracing::debug!("Validated token is inside the refresh margin, not arming wake");
            self.inner.clock.cancel();
            return;
        }

        let wake = due.max(now + to_chrono(self.inner.policy.min_wake_delay));
        let weak = Arc::downgrade(&self.inner);
        self.inner.clock.schedule_at(wake, move || async move {
            if let Some(inner) = weak.upgrade() {
                SessionManager { inner }.on_wake().await;
            }
        });
    }

    async fn on_wake(&self) {
        if self.phase().await == SessionPhase::SignedOut {
            tracing::debug!("Session wake after sign-out ignored");
            return;
        }

        tracing::info!("Proactively renewing access token");
        if let Err(e) = self.force_reauth().await {
            tracing::warn!(error = %e, "Proactive renewal failed");
        }
    }

    /// Best-effort profile lookup; keeps the current identity on failure
    async fn refresh_identity(&self, generation: u64) {
        let Some(profiles) = self.inner.profiles.as_ref() else {
            return;
        };
        let Some(access_token) = self.access_token().await else {
            return;
        };

        match profiles.fetch_identity(&access_token).await {
            Ok(identity) => {
                let mut session = self.inner.session.write().await;
                if session.generation == generation && session.phase != SessionPhase::SignedOut {
                    session.identity = Some(identity);
                }
            }
            Err(e) => tracing::warn!(error = %e, "Profile lookup failed"),
        }
    }

    /// Sign out unless the session has moved on to a newer generation
    async fn sign_out_generation(&self, generation: u64) {
        {
            let mut session = self.inner.session.write().await;
            if session.generation != generation {
                return;
            }
            self.reset_locked(&mut session);
        }
        self.publish(SessionPhase::SignedOut);
    }

    fn reset_locked(&self, session: &mut Session) {
        *session = Session {
            generation: session.generation + 1,
            ..Session::default()
        };
        self.inner.store.clear_all();
        self.inner.clock.cancel();
    }

    fn publish(&self, phase: SessionPhase) {
        self.inner.phase_tx.send_replace(phase);
    }
}

#[async_trait]
impl SessionAuthority for SessionManager {
    async fn bearer_token(&self) -> Option<String> {
        self.access_token().await
    }

    async fn force_reauth(&self) -> Result<String> {
        SessionManager::force_reauth(self)
            .await
            .map(|grant| grant.access_token)
    }
}

fn decode_logged(token: &str) -> Option<DecodedClaims> {
    codec::decode(token)
        .map_err(|e| {
            tracing::warn!(error = %e, "Could not decode access token, expiry unknown");
        })
        .ok()
}

fn to_chrono(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::zero())
}
