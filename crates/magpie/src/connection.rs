//! Connection lifecycle shared by every protocol back-end.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::account::Account;
use crate::error::Error;
use crate::ui::UiOps;

/// Lifecycle states of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "output", derive(serde::Serialize))]
pub enum ConnectionState {
    /// No transport; the resting state.
    Disconnected,
    /// Dialing the server.
    Connecting,
    /// Transport up, authenticating or negotiating.
    Authenticating,
    /// Fully signed on.
    Connected,
    /// Tearing down.
    Disconnecting,
}

/// Per-connection bookkeeping every protocol session embeds: the
/// account snapshot, the lifecycle state, the cancellation handle, and
/// the UI to notify.
///
/// Cancelling the token aborts the session's reads, writes, and timers;
/// a cancelled connection stops invoking handlers and user callbacks.
pub struct Connection {
    account: Account,
    state: ConnectionState,
    cancel: CancellationToken,
    ui: Arc<dyn UiOps>,
}

impl Connection {
    /// A new connection in `Disconnected`.
    pub fn new(account: Account, ui: Arc<dyn UiOps>) -> Self {
        Self::with_token(account, ui, CancellationToken::new())
    }

    /// A new connection sharing an externally-held cancellation token.
    pub fn with_token(account: Account, ui: Arc<dyn UiOps>, cancel: CancellationToken) -> Self {
        Self {
            account,
            state: ConnectionState::Disconnected,
            cancel,
            ui,
        }
    }

    /// The account this connection serves.
    pub fn account(&self) -> &Account {
        &self.account
    }

    /// The UI this connection notifies.
    pub fn ui(&self) -> &Arc<dyn UiOps> {
        &self.ui
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// The cancellation handle. Clones observe the same token.
    pub fn token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Whether teardown has been requested.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Request teardown: pending I/O aborts, the output queue drains
    /// nothing further, and no user callbacks fire afterwards.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Move to a new lifecycle state, notifying the UI.
    ///
    /// After cancellation the state still updates (teardown walks
    /// through `Disconnecting` to `Disconnected`) but the UI callback
    /// is suppressed.
    pub async fn set_state(&mut self, new: ConnectionState) {
        if self.state == new {
            return;
        }
        let old = self.state;
        self.state = new;
        info!(account = %self.account.id, ?old, ?new, "connection state changed");
        if !self.is_cancelled() {
            self.ui
                .on_connection_state_changed(&self.account.id, old, new)
                .await;
        }
    }

    /// Report an error for this account. Cancelled connections stay
    /// silent, and `Cancelled` itself is never user-visible.
    pub async fn report_error(&self, error: &Error) {
        if self.is_cancelled() || !error.is_user_visible() {
            debug!(account = %self.account.id, %error, "suppressed error report");
            return;
        }
        self.ui.on_error(&self.account.id, error).await;
    }
}
