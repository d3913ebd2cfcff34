// Credential persistence
// Lifetime policy and key namespace over a pluggable key/value medium

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use anyhow::Result;

/// Durable key/value storage with per-entry lifetime (cookies in a browser)
pub trait PersistedStorage: Send + Sync {
    fn set(&self, key: &str, value: &str, lifetime: Duration) -> Result<()>;
    fn get(&self, key: &str) -> Result<Option<String>>;
    fn remove(&self, key: &str) -> Result<()>;
}

/// In-process storage; entries vanish after their lifetime or with the process
#[derive(Default)]
pub struct MemoryStorage {
    /// Value and expiry; `None` when the lifetime runs past what `Instant` can hold
    entries: Mutex<HashMap<String, (String, Option<Instant>)>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

impl PersistedStorage for MemoryStorage {
    fn set(&self, key: &str, value: &str, lifetime: Duration) -> Result<()> {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        let expires = Instant::now().checked_add(lifetime);
        entries.insert(key.to_string(), (value.to_string(), expires));
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Option<String>> {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        let expired = matches!(entries.get(key), Some((_, Some(expires))) if *expires <= Instant::now());
        if expired {
            entries.remove(key);
            return Ok(None);
        }
        Ok(entries.get(key).map(|(value, _)| value.clone()))
    }

    fn remove(&self, key: &str) -> Result<()> {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.remove(key);
        Ok(())
    }
}

/// Persisted lifetime tiers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreLifetimes {
    /// Used when "remember me" is off
    pub session: Duration,
    /// Used when "remember me" is on
    pub remembered: Duration,
}

impl Default for StoreLifetimes {
    fn default() -> Self {
        Self {
            session: Duration::from_secs(24 * 60 * 60),
            remembered: Duration::from_secs(30 * 24 * 60 * 60),
        }
    }
}

impl StoreLifetimes {
    pub fn for_remember_me(&self, remember_me: bool) -> Duration {
        if remember_me {
            self.remembered
        } else {
            self.session
        }
    }
}

/// Stores the access/refresh token pair
///
/// Never fails: storage errors are logged and reads degrade to `None`, since
/// the medium (cookies, a disk file) is not guaranteed to be available.
pub struct CredentialStore {
    storage: Arc<dyn PersistedStorage>,
    lifetimes: StoreLifetimes,
    access_key: String,
    refresh_key: String,
    remember_key: String,
}

impl CredentialStore {
    pub const DEFAULT_NAMESPACE: &'static str = "catalog.auth";

    pub fn new(storage: Arc<dyn PersistedStorage>, lifetimes: StoreLifetimes) -> Self {
        Self::with_namespace(storage, lifetimes, Self::DEFAULT_NAMESPACE)
    }

    pub fn with_namespace(
        storage: Arc<dyn PersistedStorage>,
        lifetimes: StoreLifetimes,
        namespace: &str,
    ) -> Self {
        Self {
            storage,
            lifetimes,
            access_key: format!("{}.access_token", namespace),
            refresh_key: format!("{}.refresh_token", namespace),
            remember_key: format!("{}.remember_me", namespace),
        }
    }

    pub fn set_access_token(&self, token: &str, remember_me: bool) {
        self.write(&self.access_key, token, remember_me);
        self.write(
            &self.remember_key,
            if remember_me { "1" } else { "0" },
            remember_me,
        );
    }

    pub fn access_token(&self) -> Option<String> {
        self.read(&self.access_key)
    }

    pub fn set_refresh_token(&self, token: &str, remember_me: bool) {
        self.write(&self.refresh_key, token, remember_me);
    }

    pub fn refresh_token(&self) -> Option<String> {
        self.read(&self.refresh_key)
    }

    /// Remember-me choice recorded with the last access token write
    pub fn remember_me(&self) -> bool {
        self.read(&self.remember_key).as_deref() == Some("1")
    }

    /// Remove every stored credential; safe to call repeatedly
    pub fn clear_all(&self) {
        for key in [&self.access_key, &self.refresh_key, &self.remember_key] {
            if let Err(e) = self.storage.remove(key) {
                tracing::warn!(key = %key, error = %e, "Failed to remove stored credential");
            }
        }
    }

    fn write(&self, key: &str, value: &str, remember_me: bool) {
        let lifetime = self.lifetimes.for_remember_me(remember_me);
        if let Err(e) = self.storage.set(key, value, lifetime) {
            tracing::warn!(key = %key, error = %e, "Failed to persist credential");
        }
    }

    fn read(&self, key: &str) -> Option<String> {
        match self.storage.get(key) {
            Ok(value) => value.filter(|v| !v.is_empty()),
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "Failed to read stored credential");
                None
            }
        }
    }
}
