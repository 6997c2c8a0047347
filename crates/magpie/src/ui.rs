//! The interface the core calls into the frontend through.
//!
//! The runtime never draws anything; every user-visible effect goes
//! through [`UiOps`]. Frontends implement the subset they care about,
//! since every method has a no-op default.

use async_trait::async_trait;

use crate::account::AccountId;
use crate::connection::ConnectionState;
use crate::conversation::{ConversationKey, Message};
use crate::error::Error;

/// Operations implemented by the frontend, called by the core.
#[async_trait]
pub trait UiOps: Send + Sync {
    /// A connection moved between lifecycle states.
    async fn on_connection_state_changed(
        &self,
        account: &AccountId,
        old: ConnectionState,
        new: ConnectionState,
    ) {
        let _ = (account, old, new);
    }

    /// A message was written to a conversation.
    async fn on_message(&self, conv: &ConversationKey, msg: &Message) {
        let _ = (conv, msg);
    }

    /// A conversation was created.
    async fn on_conversation_opened(&self, conv: &ConversationKey) {
        let _ = conv;
    }

    /// A conversation was closed and removed from the registry.
    async fn on_conversation_closed(&self, conv: &ConversationKey) {
        let _ = conv;
    }

    /// An error should be shown for this account. `Network` errors are
    /// transient notices; fatal kinds deserve a modal-equivalent.
    async fn on_error(&self, account: &AccountId, error: &Error) {
        let _ = (account, error);
    }

    /// The core needs a line of input from the user (a one-time token,
    /// a join password). `None` means the user declined.
    async fn on_request_input(&self, account: &AccountId, prompt: &str) -> Option<String> {
        let _ = (account, prompt);
        None
    }

    /// A peer's presence changed.
    async fn on_presence(&self, account: &AccountId, peer: &str, available: bool) {
        let _ = (account, peer, available);
    }

    /// A peer started or stopped typing at us.
    async fn on_typing(&self, account: &AccountId, peer: &str, typing: bool) {
        let _ = (account, peer, typing);
    }

    /// The OS reports the network came up.
    async fn on_network_connected(&self) {}

    /// The OS reports the network went away.
    async fn on_network_disconnected(&self) {}
}

/// A [`UiOps`] that ignores everything. Useful headless and in tests.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullUiOps;

#[async_trait]
impl UiOps for NullUiOps {}
