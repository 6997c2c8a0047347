//! Shared helpers for session-level tests.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use magpie::account::AccountId;
use magpie::connection::ConnectionState;
use magpie::conversation::{ConversationKey, Message};
use magpie::ui::UiOps;

/// Records every UI callback for later assertions.
#[derive(Default)]
pub struct RecordingUi {
    pub states: Mutex<Vec<(ConnectionState, ConnectionState)>>,
    pub messages: Mutex<Vec<(ConversationKey, Message)>>,
    pub errors: Mutex<Vec<String>>,
    pub presence: Mutex<Vec<(String, bool)>>,
    pub typing: Mutex<Vec<(String, bool)>>,
}

impl RecordingUi {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Messages delivered so far for `peer`.
    pub fn messages_for(&self, peer: &str) -> Vec<Message> {
        self.messages
            .lock()
            .unwrap()
            .iter()
            .filter(|(key, _)| key.peer == peer)
            .map(|(_, msg)| msg.clone())
            .collect()
    }
}

#[async_trait]
impl UiOps for RecordingUi {
    async fn on_connection_state_changed(
        &self,
        _account: &AccountId,
        old: ConnectionState,
        new: ConnectionState,
    ) {
        self.states.lock().unwrap().push((old, new));
    }

    async fn on_message(&self, conv: &ConversationKey, msg: &Message) {
        self.messages.lock().unwrap().push((conv.clone(), msg.clone()));
    }

    async fn on_error(&self, _account: &AccountId, error: &magpie::Error) {
        self.errors.lock().unwrap().push(error.to_string());
    }

    async fn on_presence(&self, _account: &AccountId, peer: &str, available: bool) {
        self.presence.lock().unwrap().push((peer.to_owned(), available));
    }

    async fn on_typing(&self, _account: &AccountId, peer: &str, typing: bool) {
        self.typing.lock().unwrap().push((peer.to_owned(), typing));
    }
}

/// Poll `check` every few milliseconds until it passes or `secs`
/// elapse.
pub async fn wait_for(secs: u64, mut check: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(secs);
    while !check() {
        if tokio::time::Instant::now() > deadline {
            panic!("condition not reached within {secs}s");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
