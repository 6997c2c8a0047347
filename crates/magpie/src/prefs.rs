//! In-memory preference tree.
//!
//! Preferences are typed values at `/`-separated paths. The core
//! registers its defaults at startup; an embedder layers persistence on
//! top (loading values over the defaults and saving on change).
//! Watchers fire on every set, keyed by path prefix.

use std::collections::HashMap;
use std::sync::Mutex;

use tracing::warn;

/// A typed preference value.
#[derive(Debug, Clone, PartialEq)]
pub enum PrefValue {
    /// Boolean toggle.
    Bool(bool),
    /// Integer value.
    Int(i64),
    /// Free-form string.
    Str(String),
    /// An ordered list of strings.
    StrList(Vec<String>),
}

type WatchFn = Box<dyn Fn(&str, &PrefValue) + Send + Sync>;

/// The process-wide preference tree.
pub struct Preferences {
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    values: HashMap<String, PrefValue>,
    watchers: Vec<(String, WatchFn)>,
}

impl Preferences {
    /// An empty tree with no registered paths.
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
        }
    }

    /// A tree with every preference the core recognizes registered at
    /// its default value.
    pub fn with_defaults() -> Self {
        let prefs = Self::new();
        prefs.add_bool("/purple/debug", false);
        prefs.add_string("/purple/sound/mute_until", "");

        prefs.add_string("/purple/network/stun_server", "");
        prefs.add_bool("/purple/network/auto_ip", true);
        prefs.add_string("/purple/network/public_ip", "");
        prefs.add_bool("/purple/network/map_ports", true);
        prefs.add_bool("/purple/network/ports_range_use", false);
        prefs.add_int("/purple/network/ports_range_start", 1024);
        prefs.add_int("/purple/network/ports_range_end", 2048);
        prefs.add_string("/purple/network/turn_server", "");
        prefs.add_int("/purple/network/turn_port", 3478);
        prefs.add_int("/purple/network/turn_port_tcp", 3478);
        prefs.add_string("/purple/network/turn_username", "");
        prefs.add_string("/purple/network/turn_password", "");

        prefs.add_string("/purple/proxy/type", "none");
        prefs.add_string("/purple/proxy/host", "");
        prefs.add_int("/purple/proxy/port", 0);
        prefs.add_string("/purple/proxy/username", "");
        prefs.add_string("/purple/proxy/password", "");

        prefs.add_string("/purple/credentials/active-provider", "internal");
        prefs
    }

    /// Register a boolean preference with its default.
    pub fn add_bool(&self, path: &str, default: bool) {
        self.add(path, PrefValue::Bool(default));
    }

    /// Register an integer preference with its default.
    pub fn add_int(&self, path: &str, default: i64) {
        self.add(path, PrefValue::Int(default));
    }

    /// Register a string preference with its default.
    pub fn add_string(&self, path: &str, default: &str) {
        self.add(path, PrefValue::Str(default.to_owned()));
    }

    /// Register a string-list preference with its default.
    pub fn add_string_list(&self, path: &str, default: Vec<String>) {
        self.add(path, PrefValue::StrList(default));
    }

    fn add(&self, path: &str, value: PrefValue) {
        let mut inner = self.inner.lock().unwrap();
        inner.values.entry(path.to_owned()).or_insert(value);
    }

    /// Read a boolean. `None` when unregistered or a different type.
    pub fn get_bool(&self, path: &str) -> Option<bool> {
        match self.inner.lock().unwrap().values.get(path) {
            Some(PrefValue::Bool(v)) => Some(*v),
            _ => None,
        }
    }

    /// Read an integer.
    pub fn get_int(&self, path: &str) -> Option<i64> {
        match self.inner.lock().unwrap().values.get(path) {
            Some(PrefValue::Int(v)) => Some(*v),
            _ => None,
        }
    }

    /// Read a string.
    pub fn get_string(&self, path: &str) -> Option<String> {
        match self.inner.lock().unwrap().values.get(path) {
            Some(PrefValue::Str(v)) => Some(v.clone()),
            _ => None,
        }
    }

    /// Read a string list.
    pub fn get_string_list(&self, path: &str) -> Option<Vec<String>> {
        match self.inner.lock().unwrap().values.get(path) {
            Some(PrefValue::StrList(v)) => Some(v.clone()),
            _ => None,
        }
    }

    /// Set a boolean, firing watchers. Ignored with a warning when the
    /// path is unregistered or typed differently.
    pub fn set_bool(&self, path: &str, value: bool) {
        self.set(path, PrefValue::Bool(value));
    }

    /// Set an integer, firing watchers.
    pub fn set_int(&self, path: &str, value: i64) {
        self.set(path, PrefValue::Int(value));
    }

    /// Set a string, firing watchers.
    pub fn set_string(&self, path: &str, value: &str) {
        self.set(path, PrefValue::Str(value.to_owned()));
    }

    /// Set a string list, firing watchers.
    pub fn set_string_list(&self, path: &str, value: Vec<String>) {
        self.set(path, PrefValue::StrList(value));
    }

    fn set(&self, path: &str, value: PrefValue) {
        let mut inner = self.inner.lock().unwrap();
        match inner.values.get_mut(path) {
            Some(slot) if std::mem::discriminant(slot) == std::mem::discriminant(&value) => {
                *slot = value.clone();
            }
            Some(_) => {
                warn!(path, "preference set with mismatched type, ignored");
                return;
            }
            None => {
                warn!(path, "set on unregistered preference, ignored");
                return;
            }
        }
        // Fire watchers outside the value lookup but under the lock;
        // watchers must not call back into the tree.
        for (prefix, callback) in &inner.watchers {
            if path.starts_with(prefix.as_str()) {
                callback(path, &value);
            }
        }
    }

    /// Watch every change under a path prefix.
    pub fn watch(&self, prefix: &str, callback: impl Fn(&str, &PrefValue) + Send + Sync + 'static) {
        self.inner
            .lock()
            .unwrap()
            .watchers
            .push((prefix.to_owned(), Box::new(callback)));
    }
}

impl Default for Preferences {
    fn default() -> Self {
        Self::with_defaults()
    }
}

impl std::fmt::Debug for Preferences {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock().unwrap();
        f.debug_struct("Preferences")
            .field("values", &inner.values)
            .field("watchers", &inner.watchers.len())
            .finish()
    }
}
