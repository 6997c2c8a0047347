//! Conversations and the process-wide conversation registry.

use std::sync::{Arc, Mutex};

use tracing::debug;

use crate::account::AccountId;
use crate::ui::UiOps;

/// What kind of channel a conversation is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "output", derive(serde::Serialize))]
pub enum ConversationKind {
    /// One-to-one conversation.
    Im,
    /// Multi-party chat room.
    Chat,
}

/// Identity of a conversation: an account, a peer, and a kind.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "output", derive(serde::Serialize))]
pub struct ConversationKey {
    /// Owning account.
    pub account: AccountId,
    /// Remote peer or room name.
    pub peer: String,
    /// IM or chat.
    pub kind: ConversationKind,
}

/// One message in a conversation log.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "output", derive(serde::Serialize))]
pub struct Message {
    /// Who sent it.
    pub sender: String,
    /// Message body.
    pub body: String,
    /// Whether this arrived flagged as a notice.
    pub notify: bool,
    /// Whether this was received (as opposed to sent by us).
    pub incoming: bool,
}

impl Message {
    /// An incoming message.
    pub fn incoming(sender: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            sender: sender.into(),
            body: body.into(),
            notify: false,
            incoming: true,
        }
    }

    /// An outgoing message.
    pub fn outgoing(sender: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            sender: sender.into(),
            body: body.into(),
            notify: false,
            incoming: false,
        }
    }

    /// Mark this message as a notice.
    pub fn with_notify(mut self, notify: bool) -> Self {
        self.notify = notify;
        self
    }
}

/// A live conversation. Messages are append-only, in arrival order.
#[derive(Debug)]
pub struct Conversation {
    /// Identity of this conversation.
    pub key: ConversationKey,
    log: Mutex<Vec<Message>>,
}

impl Conversation {
    fn new(key: ConversationKey) -> Self {
        Self {
            key,
            log: Mutex::new(Vec::new()),
        }
    }

    /// Snapshot of the message log.
    pub fn messages(&self) -> Vec<Message> {
        self.log.lock().unwrap().clone()
    }

    /// Number of logged messages.
    pub fn len(&self) -> usize {
        self.log.lock().unwrap().len()
    }

    /// Whether the log is empty.
    pub fn is_empty(&self) -> bool {
        self.log.lock().unwrap().is_empty()
    }

    fn append(&self, msg: Message) {
        self.log.lock().unwrap().push(msg);
    }
}

/// Process-wide registry mapping `(account, peer, kind)` to live
/// conversations, created on demand from inbound messages.
pub struct ConversationRegistry {
    conversations: Mutex<Vec<Arc<Conversation>>>,
    ui: Arc<dyn UiOps>,
}

impl ConversationRegistry {
    /// A registry firing events at `ui`.
    pub fn new(ui: Arc<dyn UiOps>) -> Self {
        Self {
            conversations: Mutex::new(Vec::new()),
            ui,
        }
    }

    /// The conversation for this key, creating it if needed. Repeated
    /// calls with the same key return the same object.
    pub async fn find_or_create(
        &self,
        account: AccountId,
        peer: &str,
        kind: ConversationKind,
    ) -> Arc<Conversation> {
        let key = ConversationKey {
            account,
            peer: peer.to_owned(),
            kind,
        };

        let (conv, created) = {
            let mut conversations = self.conversations.lock().unwrap();
            match conversations.iter().find(|c| c.key == key) {
                Some(existing) => (Arc::clone(existing), false),
                None => {
                    debug!(peer, ?kind, "creating conversation");
                    let conv = Arc::new(Conversation::new(key));
                    conversations.push(Arc::clone(&conv));
                    (conv, true)
                }
            }
        };

        if created {
            self.ui.on_conversation_opened(&conv.key).await;
        }
        conv
    }

    /// Find without creating.
    pub fn find(
        &self,
        account: &AccountId,
        peer: &str,
        kind: ConversationKind,
    ) -> Option<Arc<Conversation>> {
        self.conversations
            .lock()
            .unwrap()
            .iter()
            .find(|c| {
                c.key.account == *account && c.key.peer == peer && c.key.kind == kind
            })
            .map(Arc::clone)
    }

    /// Append a message to the log and notify the UI.
    pub async fn write_message(&self, conv: &Arc<Conversation>, msg: Message) {
        conv.append(msg.clone());
        self.ui.on_message(&conv.key, &msg).await;
    }

    /// Drop a conversation (the UI closed it).
    pub async fn close(&self, conv: &Arc<Conversation>) {
        let removed = {
            let mut conversations = self.conversations.lock().unwrap();
            match conversations.iter().position(|c| Arc::ptr_eq(c, conv)) {
                Some(pos) => {
                    conversations.remove(pos);
                    true
                }
                None => false,
            }
        };
        if removed {
            self.ui.on_conversation_closed(&conv.key).await;
        }
    }

    /// Every live conversation, in creation order.
    pub fn all(&self) -> Vec<Arc<Conversation>> {
        self.conversations.lock().unwrap().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ui::NullUiOps;

    fn registry() -> ConversationRegistry {
        ConversationRegistry::new(Arc::new(NullUiOps))
    }

    #[tokio::test]
    async fn test_find_or_create_is_idempotent() {
        let reg = registry();
        let id = AccountId::new("alice@irc.example", "ircv3");

        let a = reg.find_or_create(id.clone(), "bob", ConversationKind::Im).await;
        let b = reg.find_or_create(id.clone(), "bob", ConversationKind::Im).await;
        assert!(Arc::ptr_eq(&a, &b));

        let chat = reg.find_or_create(id, "#rust", ConversationKind::Chat).await;
        assert!(!Arc::ptr_eq(&a, &chat));
    }

    #[tokio::test]
    async fn test_messages_append_in_order() {
        let reg = registry();
        let id = AccountId::new("alice@irc.example", "ircv3");
        let conv = reg.find_or_create(id, "bob", ConversationKind::Im).await;

        reg.write_message(&conv, Message::incoming("bob", "one")).await;
        reg.write_message(&conv, Message::incoming("bob", "two")).await;

        let log = conv.messages();
        assert_eq!(log.len(), 2);
        assert_eq!(log[0].body, "one");
        assert_eq!(log[1].body, "two");
    }

    #[tokio::test]
    async fn test_close_removes() {
        let reg = registry();
        let id = AccountId::new("alice@irc.example", "ircv3");
        let conv = reg.find_or_create(id.clone(), "bob", ConversationKind::Im).await;
        reg.close(&conv).await;
        assert!(reg.find(&id, "bob", ConversationKind::Im).is_none());
    }
}
