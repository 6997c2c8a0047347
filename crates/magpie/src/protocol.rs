//! Protocol back-end registration and session plumbing.
//!
//! A protocol registers a [`ProtocolFactory`] under its id. Enabling an
//! account looks the factory up, validates settings, and spawns a
//! session task that owns the transport, router, and protocol state.
//! The runtime talks to a live session only through its
//! [`SessionHandle`]: typed commands in, lifecycle events out.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::account::{Account, AccountId, AccountOption};
use crate::conversation::ConversationRegistry;
use crate::error::{Error, Result};
use crate::ui::UiOps;

/// Commands a frontend or the runtime sends into a session.
#[derive(Debug, Clone)]
pub enum SessionCommand {
    /// Send an instant message to a peer or room.
    SendIm {
        /// Target peer or room.
        peer: String,
        /// Message body.
        body: String,
    },
    /// Tell the peer we started or stopped composing.
    SendTyping {
        /// Target peer.
        peer: String,
        /// Whether we are actively typing.
        typing: bool,
    },
    /// Change our published status.
    SetStatus {
        /// Protocol-level status token (e.g. `available`, `busy`).
        status: String,
    },
    /// Start tracking a buddy's presence.
    AddBuddy {
        /// Buddy name.
        name: String,
    },
    /// Stop tracking a buddy.
    RemoveBuddy {
        /// Buddy name.
        name: String,
    },
}

/// Lifecycle events a session reports back to the runtime.
#[derive(Debug)]
pub enum SessionEvent {
    /// The session finished signing on.
    Connected(AccountId),
    /// The session ended. `error` is `None` for a requested teardown.
    Disconnected {
        /// The account whose session ended.
        account: AccountId,
        /// What ended it, if anything did.
        error: Option<Error>,
    },
}

/// Everything a factory needs to spawn a session.
pub struct SessionContext {
    /// Snapshot of the account at enable time.
    pub account: Account,
    /// Secret from the credential provider, when one exists.
    pub secret: Option<String>,
    /// Public IP from the NAT controller, when discovered.
    pub public_ip: Option<String>,
    /// UI to notify.
    pub ui: Arc<dyn UiOps>,
    /// Conversation registry shared across the process.
    pub conversations: Arc<ConversationRegistry>,
    /// Where lifecycle events go.
    pub events: mpsc::UnboundedSender<SessionEvent>,
}

/// Handle to a live session task.
pub struct SessionHandle {
    /// Command channel into the session.
    pub commands: mpsc::UnboundedSender<SessionCommand>,
    /// Cancels the session's I/O and timers.
    pub cancel: CancellationToken,
    /// The session task itself.
    pub task: JoinHandle<()>,
}

impl SessionHandle {
    /// Send a command, ignoring a session that is already gone.
    pub fn send(&self, command: SessionCommand) {
        let _ = self.commands.send(command);
    }

    /// Graceful teardown: the session flushes a best-effort goodbye
    /// (QUIT, unregister with `Expires: 0`) without waiting for a
    /// response, then cancels its own I/O. Returns the task so callers
    /// can await completion.
    pub fn close(self) -> JoinHandle<()> {
        drop(self.commands);
        self.task
    }

    /// Hard teardown: aborts reads, pending writes, and timers
    /// immediately. No goodbye is sent and the queue is discarded.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }
}

/// A protocol back-end.
pub trait ProtocolFactory: Send + Sync {
    /// Stable protocol id (`ircv3`, `simple`, `raw`).
    fn id(&self) -> &'static str;

    /// Human-readable protocol name.
    fn name(&self) -> &'static str;

    /// Account options this protocol understands.
    fn options(&self) -> Vec<AccountOption>;

    /// Check settings before any dialing happens.
    fn validate(&self, account: &Account) -> Result<()> {
        let _ = account;
        Ok(())
    }

    /// Spawn the session task for an enabled account.
    fn spawn_session(&self, ctx: SessionContext) -> SessionHandle;
}

/// The process-wide table of registered protocols.
#[derive(Default)]
pub struct ProtocolRegistry {
    factories: Mutex<HashMap<&'static str, Arc<dyn ProtocolFactory>>>,
}

impl ProtocolRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a protocol. Registering an id twice is a no-op; the
    /// first registration wins.
    pub fn register(&self, factory: Arc<dyn ProtocolFactory>) {
        let mut factories = self.factories.lock().unwrap();
        let id = factory.id();
        if factories.contains_key(id) {
            debug!(id, "protocol already registered, ignoring");
            return;
        }
        factories.insert(id, factory);
    }

    /// Look a protocol up by id.
    pub fn get(&self, id: &str) -> Option<Arc<dyn ProtocolFactory>> {
        self.factories.lock().unwrap().get(id).map(Arc::clone)
    }

    /// Registered protocol ids, sorted.
    pub fn ids(&self) -> Vec<&'static str> {
        let mut ids: Vec<_> = self.factories.lock().unwrap().keys().copied().collect();
        ids.sort_unstable();
        ids
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FakeFactory(&'static str);

    impl ProtocolFactory for FakeFactory {
        fn id(&self) -> &'static str {
            self.0
        }
        fn name(&self) -> &'static str {
            "Fake"
        }
        fn options(&self) -> Vec<AccountOption> {
            Vec::new()
        }
        fn spawn_session(&self, _ctx: SessionContext) -> SessionHandle {
            unimplemented!("never spawned in tests")
        }
    }

    #[test]
    fn test_double_registration_is_noop() {
        let registry = ProtocolRegistry::new();
        let first = Arc::new(FakeFactory("fake"));
        registry.register(first.clone());
        registry.register(Arc::new(FakeFactory("fake")));

        assert_eq!(registry.ids(), vec!["fake"]);
        // The original registration is still the one served.
        let served = registry.get("fake").unwrap();
        let first: Arc<dyn ProtocolFactory> = first;
        assert!(Arc::ptr_eq(&served, &first));
    }

    #[test]
    fn test_lookup_unknown_protocol() {
        let registry = ProtocolRegistry::new();
        assert!(registry.get("nope").is_none());
    }
}
