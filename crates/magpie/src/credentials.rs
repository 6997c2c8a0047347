//! Credential providers.
//!
//! The core never stores secrets itself; it asks the active provider.
//! `noop` refuses to store anything (for deployments where every
//! secret is typed at connect time), `internal` keeps secrets in
//! process memory only. The `libsecret` and `kwallet` ids are reserved
//! for external keyring plugins that register themselves at startup.
//! The active provider is selected by the
//! `/purple/credentials/active-provider` preference.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use tracing::warn;

use crate::account::AccountId;
use crate::error::{Error, Result};

/// A pluggable secret store.
#[async_trait]
pub trait CredentialProvider: Send + Sync {
    /// Stable provider id.
    fn id(&self) -> &'static str;

    /// Human-readable name.
    fn name(&self) -> &'static str;

    /// Fetch the secret for an account.
    async fn lookup(&self, account: &AccountId) -> Result<Option<String>>;

    /// Store a secret for an account.
    async fn store(&self, account: &AccountId, secret: &str) -> Result<()>;

    /// Forget the secret for an account.
    async fn clear(&self, account: &AccountId) -> Result<()>;
}

/// Provider that stores nothing and returns nothing.
#[derive(Debug, Default)]
pub struct NoopProvider;

#[async_trait]
impl CredentialProvider for NoopProvider {
    fn id(&self) -> &'static str {
        "noop"
    }

    fn name(&self) -> &'static str {
        "None"
    }

    async fn lookup(&self, _account: &AccountId) -> Result<Option<String>> {
        Ok(None)
    }

    async fn store(&self, _account: &AccountId, _secret: &str) -> Result<()> {
        Err(Error::InvalidSettings(
            "the noop credential provider does not store secrets".into(),
        ))
    }

    async fn clear(&self, _account: &AccountId) -> Result<()> {
        Ok(())
    }
}

/// Provider that keeps secrets in process memory, lost at exit.
#[derive(Debug, Default)]
pub struct InternalProvider {
    secrets: Mutex<HashMap<AccountId, String>>,
}

#[async_trait]
impl CredentialProvider for InternalProvider {
    fn id(&self) -> &'static str {
        "internal"
    }

    fn name(&self) -> &'static str {
        "In-memory only"
    }

    async fn lookup(&self, account: &AccountId) -> Result<Option<String>> {
        Ok(self.secrets.lock().unwrap().get(account).cloned())
    }

    async fn store(&self, account: &AccountId, secret: &str) -> Result<()> {
        self.secrets
            .lock()
            .unwrap()
            .insert(account.clone(), secret.to_owned());
        Ok(())
    }

    async fn clear(&self, account: &AccountId) -> Result<()> {
        self.secrets.lock().unwrap().remove(account);
        Ok(())
    }
}

/// Registry of credential providers plus the active selection.
pub struct CredentialManager {
    providers: Mutex<HashMap<&'static str, std::sync::Arc<dyn CredentialProvider>>>,
    active: Mutex<String>,
}

impl CredentialManager {
    /// A manager with the built-in providers registered and `active`
    /// selected (falling back to `internal` for unknown ids).
    pub fn new(active: &str) -> Self {
        let manager = Self {
            providers: Mutex::new(HashMap::new()),
            active: Mutex::new(String::new()),
        };
        manager.register(std::sync::Arc::new(NoopProvider));
        manager.register(std::sync::Arc::new(InternalProvider::default()));
        manager.set_active(active);
        manager
    }

    /// Register a provider. Registering an id twice is a no-op.
    pub fn register(&self, provider: std::sync::Arc<dyn CredentialProvider>) {
        let mut providers = self.providers.lock().unwrap();
        providers.entry(provider.id()).or_insert(provider);
    }

    /// Select the active provider by id.
    pub fn set_active(&self, id: &str) {
        let providers = self.providers.lock().unwrap();
        let resolved = if providers.contains_key(id) {
            id
        } else {
            warn!(id, "unknown credential provider, falling back to internal");
            "internal"
        };
        *self.active.lock().unwrap() = resolved.to_owned();
    }

    /// Id of the active provider.
    pub fn active_id(&self) -> String {
        self.active.lock().unwrap().clone()
    }

    /// The active provider.
    pub fn active(&self) -> std::sync::Arc<dyn CredentialProvider> {
        let active = self.active.lock().unwrap().clone();
        self.providers
            .lock()
            .unwrap()
            .get(active.as_str())
            .cloned()
            .expect("active provider always registered")
    }

    /// Look up the secret for an account through the active provider.
    pub async fn lookup(&self, account: &AccountId) -> Result<Option<String>> {
        self.active().lookup(account).await
    }

    /// Store a secret through the active provider.
    pub async fn store(&self, account: &AccountId, secret: &str) -> Result<()> {
        self.active().store(account, secret).await
    }

    /// Clear an account's secret through the active provider.
    pub async fn clear(&self, account: &AccountId) -> Result<()> {
        self.active().clear(account).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn account() -> AccountId {
        AccountId::new("alice@ex", "simple")
    }

    #[tokio::test]
    async fn test_internal_round_trip() {
        let manager = CredentialManager::new("internal");
        manager.store(&account(), "hunter2").await.unwrap();
        assert_eq!(manager.lookup(&account()).await.unwrap().as_deref(), Some("hunter2"));

        manager.clear(&account()).await.unwrap();
        assert_eq!(manager.lookup(&account()).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_noop_refuses_store() {
        let manager = CredentialManager::new("noop");
        assert!(manager.store(&account(), "pw").await.is_err());
        assert_eq!(manager.lookup(&account()).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_unknown_provider_falls_back() {
        let manager = CredentialManager::new("kwallet");
        assert_eq!(manager.active_id(), "internal");
    }

    #[test]
    fn test_register_is_idempotent() {
        let manager = CredentialManager::new("internal");
        let replacement = std::sync::Arc::new(NoopProvider);
        manager.register(replacement);
        // Still exactly one noop provider, the original.
        assert_eq!(manager.active_id(), "internal");
        manager.set_active("noop");
        assert_eq!(manager.active_id(), "noop");
    }
}
