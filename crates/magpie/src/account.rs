//! Accounts, typed per-account settings, and the account manager.

use std::collections::HashMap;
use std::sync::Mutex;

use crate::proxy::ProxyInfo;

/// Unique account identity: a username on a protocol.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "output", derive(serde::Serialize))]
pub struct AccountId {
    /// The account's username, including any server part
    /// (e.g. `alice@irc.example`).
    pub username: String,
    /// Protocol id (e.g. `ircv3`, `simple`, `raw`).
    pub protocol_id: String,
}

impl AccountId {
    /// Build an account id.
    pub fn new(username: impl Into<String>, protocol_id: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            protocol_id: protocol_id.into(),
        }
    }
}

impl std::fmt::Display for AccountId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.username, self.protocol_id)
    }
}

/// A typed account setting value.
#[derive(Debug, Clone, PartialEq)]
pub enum SettingValue {
    /// Boolean setting.
    Bool(bool),
    /// Integer setting.
    Int(i64),
    /// Free-form string setting.
    Str(String),
    /// String constrained to a protocol-provided choice list.
    StrFromList(String),
}

/// A protocol's description of one account setting, used by frontends
/// to render an account editor. Mirrors the typed option descriptors
/// protocols register with the plugin host.
#[derive(Debug, Clone)]
pub struct AccountOption {
    /// Setting key in the account's settings map.
    pub key: &'static str,
    /// Human-readable label.
    pub label: &'static str,
    /// Default value; also fixes the setting's type.
    pub default: SettingValue,
    /// For `StrFromList` settings, the allowed values.
    pub choices: Vec<&'static str>,
}

impl AccountOption {
    /// A boolean option.
    pub fn bool(key: &'static str, label: &'static str, default: bool) -> Self {
        Self {
            key,
            label,
            default: SettingValue::Bool(default),
            choices: Vec::new(),
        }
    }

    /// An integer option.
    pub fn int(key: &'static str, label: &'static str, default: i64) -> Self {
        Self {
            key,
            label,
            default: SettingValue::Int(default),
            choices: Vec::new(),
        }
    }

    /// A string option.
    pub fn string(key: &'static str, label: &'static str, default: &str) -> Self {
        Self {
            key,
            label,
            default: SettingValue::Str(default.to_owned()),
            choices: Vec::new(),
        }
    }

    /// A string option restricted to `choices`.
    pub fn string_from_list(
        key: &'static str,
        label: &'static str,
        default: &str,
        choices: Vec<&'static str>,
    ) -> Self {
        Self {
            key,
            label,
            default: SettingValue::StrFromList(default.to_owned()),
            choices,
        }
    }
}

/// One configured account.
#[derive(Debug, Clone)]
pub struct Account {
    /// Identity, unique within the manager.
    pub id: AccountId,
    /// Optional private alias shown instead of the username.
    pub alias: Option<String>,
    /// Optional avatar reference (an image cache id).
    pub avatar: Option<String>,
    /// Proxy configuration for this account.
    pub proxy: ProxyInfo,
    /// Whether the account should be brought online.
    pub enabled: bool,
    settings: HashMap<String, SettingValue>,
}

impl Account {
    /// Create an account with empty settings.
    pub fn new(id: AccountId) -> Self {
        Self {
            id,
            alias: None,
            avatar: None,
            proxy: ProxyInfo::default(),
            enabled: false,
            settings: HashMap::new(),
        }
    }

    /// Set a typed setting.
    pub fn set(&mut self, key: impl Into<String>, value: SettingValue) {
        self.settings.insert(key.into(), value);
    }

    /// Read a boolean setting with a fallback.
    pub fn get_bool(&self, key: &str, default: bool) -> bool {
        match self.settings.get(key) {
            Some(SettingValue::Bool(v)) => *v,
            _ => default,
        }
    }

    /// Read an integer setting with a fallback.
    pub fn get_int(&self, key: &str, default: i64) -> i64 {
        match self.settings.get(key) {
            Some(SettingValue::Int(v)) => *v,
            _ => default,
        }
    }

    /// Read a string setting with a fallback.
    pub fn get_string(&self, key: &str, default: &str) -> String {
        match self.settings.get(key) {
            Some(SettingValue::Str(v)) | Some(SettingValue::StrFromList(v)) => v.clone(),
            _ => default.to_owned(),
        }
    }

    /// Username split at the first `@` into `(user, server)`.
    ///
    /// Protocols that carry the server in the username (IRC, SIMPLE)
    /// use this; [`None`] when there is no server part.
    pub fn split_username(&self) -> Option<(&str, &str)> {
        self.id.username.split_once('@')
    }
}

/// The process-wide set of known accounts.
///
/// Accounts are keyed by `(username, protocol_id)`; the manager is the
/// model only, connection lifecycles are driven by the runtime.
#[derive(Debug, Default)]
pub struct AccountManager {
    accounts: Mutex<Vec<Account>>,
}

impl AccountManager {
    /// An empty manager.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an account. Returns `false` without touching anything if the
    /// identity is already known.
    pub fn add(&self, account: Account) -> bool {
        let mut accounts = self.accounts.lock().unwrap();
        if accounts.iter().any(|a| a.id == account.id) {
            return false;
        }
        accounts.push(account);
        true
    }

    /// Remove an account by id. Returns the removed account.
    pub fn remove(&self, id: &AccountId) -> Option<Account> {
        let mut accounts = self.accounts.lock().unwrap();
        let pos = accounts.iter().position(|a| &a.id == id)?;
        Some(accounts.remove(pos))
    }

    /// Clone of the account with this id.
    pub fn get(&self, id: &AccountId) -> Option<Account> {
        self.accounts.lock().unwrap().iter().find(|a| &a.id == id).cloned()
    }

    /// Run a closure over the stored account, mutating it in place.
    pub fn update(&self, id: &AccountId, f: impl FnOnce(&mut Account)) -> bool {
        let mut accounts = self.accounts.lock().unwrap();
        match accounts.iter_mut().find(|a| &a.id == id) {
            Some(account) => {
                f(account);
                true
            }
            None => false,
        }
    }

    /// Ids of every enabled account.
    pub fn enabled(&self) -> Vec<AccountId> {
        self.accounts
            .lock()
            .unwrap()
            .iter()
            .filter(|a| a.enabled)
            .map(|a| a.id.clone())
            .collect()
    }

    /// Ids of every known account.
    pub fn all(&self) -> Vec<AccountId> {
        self.accounts.lock().unwrap().iter().map(|a| a.id.clone()).collect()
    }

    /// Mark an account disabled (fatal error path).
    pub fn set_enabled(&self, id: &AccountId, enabled: bool) {
        self.update(id, |a| a.enabled = enabled);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn account(name: &str) -> Account {
        Account::new(AccountId::new(name, "ircv3"))
    }

    #[test]
    fn test_duplicate_identity_rejected() {
        let manager = AccountManager::new();
        assert!(manager.add(account("alice@irc.example")));
        assert!(!manager.add(account("alice@irc.example")));
        assert!(manager.add(Account::new(AccountId::new("alice@irc.example", "simple"))));
        assert_eq!(manager.all().len(), 2);
    }

    #[test]
    fn test_typed_settings() {
        let mut acct = account("alice@irc.example");
        acct.set("use-tls", SettingValue::Bool(false));
        acct.set("port", SettingValue::Int(6667));
        acct.set("ident", SettingValue::Str("ali".into()));

        assert!(!acct.get_bool("use-tls", true));
        assert_eq!(acct.get_int("port", 6697), 6667);
        assert_eq!(acct.get_string("ident", ""), "ali");
        // Missing key falls back.
        assert_eq!(acct.get_string("real-name", "fallback"), "fallback");
        // Type mismatch falls back.
        assert!(acct.get_bool("port", true));
    }

    #[test]
    fn test_split_username() {
        let acct = account("alice@irc.example");
        assert_eq!(acct.split_username(), Some(("alice", "irc.example")));
        let bare = account("alice");
        assert_eq!(bare.split_username(), None);
    }

    #[test]
    fn test_enabled_listing() {
        let manager = AccountManager::new();
        manager.add(account("a@x"));
        manager.add(account("b@x"));
        manager.set_enabled(&AccountId::new("b@x", "ircv3"), true);
        assert_eq!(manager.enabled(), vec![AccountId::new("b@x", "ircv3")]);
    }
}
