//! Process-wide runtime: owns the managers, drives session lifecycles,
//! and reacts to network-monitor events.
//!
//! The embedder builds one [`Runtime`] at startup, registers any extra
//! protocols or credential providers, and feeds it network-up/down
//! notifications from the OS monitor. Connecting enabled accounts,
//! reconnect backoff, and NAT discovery all happen in here.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::account::{AccountId, AccountManager};
use crate::conversation::ConversationRegistry;
use crate::credentials::CredentialManager;
use crate::error::Error;
use crate::image::ImageStore;
use crate::irc::IrcFactory;
use crate::nat::{NatController, NetworkDiscoverer, stun::STUN_PORT};
use crate::prefs::Preferences;
use crate::protocol::{ProtocolRegistry, SessionContext, SessionEvent, SessionHandle};
use crate::raw::RawFactory;
use crate::reconnect::ReconnectController;
use crate::simple::SimpleFactory;
use crate::status::SavedStatuses;
use crate::ui::UiOps;

/// The assembled core. One per process.
pub struct Runtime {
    inner: Arc<RuntimeInner>,
}

struct RuntimeInner {
    prefs: Arc<Preferences>,
    accounts: Arc<AccountManager>,
    conversations: Arc<ConversationRegistry>,
    credentials: Arc<CredentialManager>,
    statuses: Arc<SavedStatuses>,
    images: Arc<ImageStore>,
    protocols: Arc<ProtocolRegistry>,
    nat: Arc<NatController>,
    reconnect: Arc<ReconnectController>,
    ui: Arc<dyn UiOps>,
    sessions: Mutex<HashMap<AccountId, SessionHandle>>,
    events_tx: mpsc::UnboundedSender<SessionEvent>,
}

impl Runtime {
    /// Build the runtime: preferences at their defaults, the built-in
    /// protocols registered, the event loop running.
    pub fn new(ui: Arc<dyn UiOps>) -> Self {
        let prefs = Arc::new(Preferences::with_defaults());

        let stun_server = prefs
            .get_string("/purple/network/stun_server")
            .filter(|s| !s.is_empty())
            .map(|s| (s, STUN_PORT));
        let nat = Arc::new(NatController::new(Arc::new(NetworkDiscoverer {
            stun_server,
        })));

        let credentials = Arc::new(CredentialManager::new(
            &prefs
                .get_string("/purple/credentials/active-provider")
                .unwrap_or_else(|| "internal".to_owned()),
        ));

        let protocols = Arc::new(ProtocolRegistry::new());
        protocols.register(Arc::new(IrcFactory));
        protocols.register(Arc::new(SimpleFactory));
        protocols.register(Arc::new(RawFactory));

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (signon_tx, signon_rx) = mpsc::unbounded_channel::<AccountId>();
        let (disable_tx, disable_rx) = mpsc::unbounded_channel::<AccountId>();

        let reconnect = Arc::new(ReconnectController::new(
            {
                let signon_tx = signon_tx.clone();
                move |id| {
                    let _ = signon_tx.send(id);
                }
            },
            move |id| {
                let _ = disable_tx.send(id);
            },
        ));

        let inner = Arc::new(RuntimeInner {
            prefs: Arc::clone(&prefs),
            accounts: Arc::new(AccountManager::new()),
            conversations: Arc::new(ConversationRegistry::new(Arc::clone(&ui))),
            credentials: Arc::clone(&credentials),
            statuses: Arc::new(SavedStatuses::new()),
            images: Arc::new(ImageStore::new()),
            protocols,
            nat,
            reconnect,
            ui,
            sessions: Mutex::new(HashMap::new()),
            events_tx,
        });

        // Re-select the credential provider when the preference moves.
        prefs.watch("/purple/credentials/active-provider", {
            let credentials = Arc::clone(&credentials);
            move |_, value| {
                if let crate::prefs::PrefValue::Str(id) = value {
                    credentials.set_active(id);
                }
            }
        });

        tokio::spawn(event_loop(
            Arc::clone(&inner),
            events_rx,
            signon_rx,
            disable_rx,
        ));

        Self { inner }
    }

    /// The preference tree.
    pub fn prefs(&self) -> &Arc<Preferences> {
        &self.inner.prefs
    }

    /// The account manager.
    pub fn accounts(&self) -> &Arc<AccountManager> {
        &self.inner.accounts
    }

    /// The conversation registry.
    pub fn conversations(&self) -> &Arc<ConversationRegistry> {
        &self.inner.conversations
    }

    /// The credential manager.
    pub fn credentials(&self) -> &Arc<CredentialManager> {
        &self.inner.credentials
    }

    /// The saved status store.
    pub fn statuses(&self) -> &Arc<SavedStatuses> {
        &self.inner.statuses
    }

    /// The image cache.
    pub fn images(&self) -> &Arc<ImageStore> {
        &self.inner.images
    }

    /// The protocol registry.
    pub fn protocols(&self) -> &Arc<ProtocolRegistry> {
        &self.inner.protocols
    }

    /// The NAT controller.
    pub fn nat(&self) -> &Arc<NatController> {
        &self.inner.nat
    }

    /// The reconnect controller.
    pub fn reconnect(&self) -> &Arc<ReconnectController> {
        &self.inner.reconnect
    }

    /// Whether a live session exists for this account.
    pub fn is_connected(&self, id: &AccountId) -> bool {
        self.inner.sessions.lock().unwrap().contains_key(id)
    }

    /// Send a command into an account's live session.
    pub fn session_command(&self, id: &AccountId, command: crate::protocol::SessionCommand) {
        if let Some(handle) = self.inner.sessions.lock().unwrap().get(id) {
            handle.send(command);
        } else {
            debug!(account = %id, "no live session for command");
        }
    }

    /// Enable an account and bring it online.
    pub async fn enable_account(&self, id: &AccountId) {
        self.inner.accounts.set_enabled(id, true);
        self.inner.connect(id.clone()).await;
    }

    /// Disable an account and tear its session down gracefully.
    pub async fn disable_account(&self, id: &AccountId) {
        self.inner.accounts.set_enabled(id, false);
        self.inner.reconnect.account_removed(id);
        let handle = self.inner.sessions.lock().unwrap().remove(id);
        if let Some(handle) = handle {
            let _ = handle.close().await;
        }
    }

    /// The OS says the network came up: reconnect everything that
    /// should be online, and restart NAT discovery state.
    pub async fn network_connected(&self) {
        info!("network connected");
        self.inner.nat.network_changed();
        self.inner.ui.on_network_connected().await;

        let disconnected: Vec<AccountId> = {
            let sessions = self.inner.sessions.lock().unwrap();
            self.inner
                .accounts
                .enabled()
                .into_iter()
                .filter(|id| !sessions.contains_key(id))
                .collect()
        };
        self.inner.reconnect.network_connected(disconnected);
    }

    /// The OS says the network went away: suspend every connection.
    /// No reconnect timers are scheduled; network-up does that work.
    pub async fn network_disconnected(&self) {
        info!("network disconnected");
        self.inner.nat.network_changed();
        self.inner.ui.on_network_disconnected().await;

        let handles: Vec<SessionHandle> = {
            let mut sessions = self.inner.sessions.lock().unwrap();
            sessions.drain().map(|(_, handle)| handle).collect()
        };
        for handle in handles {
            let _ = handle.close().await;
        }
    }

    /// Tear everything down: every session closes gracefully (SIP
    /// unregisters with `Expires: 0`, IRC QUITs) and port mappings
    /// added through the NAT controller are removed.
    pub async fn shutdown(&self) {
        info!("runtime shutting down");
        let handles: Vec<SessionHandle> = {
            let mut sessions = self.inner.sessions.lock().unwrap();
            sessions.drain().map(|(_, handle)| handle).collect()
        };
        for handle in handles {
            let _ = handle.close().await;
        }
        self.inner.nat.remove_all_mappings().await;
    }
}

impl RuntimeInner {
    /// The address we advertise: the forced public IP when auto-ip is
    /// off, else whatever NAT discovery found.
    fn published_ip(&self) -> Option<String> {
        if !self.prefs.get_bool("/purple/network/auto_ip").unwrap_or(true) {
            return self
                .prefs
                .get_string("/purple/network/public_ip")
                .filter(|ip| !ip.is_empty());
        }
        self.nat.public_ip().map(|ip| ip.to_string())
    }

    /// Validate, fetch credentials, and spawn the session for an
    /// enabled account.
    async fn connect(self: &Arc<Self>, id: AccountId) {
        let Some(account) = self.accounts.get(&id) else {
            debug!(account = %id, "connect for unknown account");
            return;
        };
        if !account.enabled || self.sessions.lock().unwrap().contains_key(&id) {
            return;
        }

        let Some(factory) = self.protocols.get(&id.protocol_id) else {
            let err = Error::InvalidSettings(format!("unknown protocol '{}'", id.protocol_id));
            self.ui.on_error(&id, &err).await;
            return;
        };

        // Settings problems surface before any dialing.
        if let Err(err) = factory.validate(&account) {
            self.ui.on_error(&id, &err).await;
            self.accounts.set_enabled(&id, false);
            return;
        }

        let secret = match self.credentials.lookup(&id).await {
            Ok(secret) => secret,
            Err(err) => {
                warn!(account = %id, %err, "credential lookup failed");
                None
            }
        };

        info!(account = %id, "connecting");
        let handle = factory.spawn_session(SessionContext {
            account,
            secret,
            public_ip: self.published_ip(),
            ui: Arc::clone(&self.ui),
            conversations: Arc::clone(&self.conversations),
            events: self.events_tx.clone(),
        });
        self.sessions.lock().unwrap().insert(id, handle);
    }
}

/// Reacts to session lifecycle events and reconnect requests.
async fn event_loop(
    inner: Arc<RuntimeInner>,
    mut events: mpsc::UnboundedReceiver<SessionEvent>,
    mut signons: mpsc::UnboundedReceiver<AccountId>,
    mut disables: mpsc::UnboundedReceiver<AccountId>,
) {
    loop {
        tokio::select! {
            event = events.recv() => {
                let Some(event) = event else { break };
                match event {
                    SessionEvent::Connected(id) => {
                        inner.reconnect.connected(&id);
                    }
                    SessionEvent::Disconnected { account, error } => {
                        inner.sessions.lock().unwrap().remove(&account);
                        match error {
                            None => {
                                debug!(account = %account, "session ended on request");
                            }
                            Some(err) => {
                                debug!(account = %account, %err, "session lost");
                                inner
                                    .reconnect
                                    .report_disconnect(account, err.is_fatal());
                            }
                        }
                    }
                }
            }
            id = signons.recv() => {
                let Some(id) = id else { break };
                inner.connect(id).await;
            }
            id = disables.recv() => {
                let Some(id) = id else { break };
                info!(account = %id, "disabling account after fatal error");
                inner.accounts.set_enabled(&id, false);
            }
        }
    }
}
