//! Async multi-protocol instant-messaging client runtime.
//!
//! This crate is the protocol-agnostic core of an IM client: per-account
//! connection state machines with auto-reconnect, the wire codecs text
//! protocols share, a per-connection message router with a queued
//! cancellable output stream, protocol back-ends for IRCv3 and
//! SIP/SIMPLE (plus a raw debug protocol), a conversation registry, and
//! a NAT traversal controller. Frontends sit behind [`ui::UiOps`];
//! secrets sit behind [`credentials::CredentialProvider`].
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use magpie::account::{Account, AccountId};
//! use magpie::runtime::Runtime;
//! use magpie::ui::NullUiOps;
//!
//! #[tokio::main(flavor = "current_thread")]
//! async fn main() {
//!     let runtime = Runtime::new(Arc::new(NullUiOps));
//!
//!     let id = AccountId::new("alice@irc.libera.chat", "ircv3");
//!     runtime.accounts().add(Account::new(id.clone()));
//!     runtime.credentials().store(&id, "hunter2").await.ok();
//!     runtime.enable_account(&id).await;
//!
//!     // ... feed network-monitor events, send commands ...
//!
//!     runtime.shutdown().await;
//! }
//! ```
//!
//! # Event monitoring
//!
//! Implement [`ui::UiOps`] and hand it to the runtime; every state
//! change, message, and error flows through it:
//!
//! ```ignore
//! #[async_trait::async_trait]
//! impl magpie::ui::UiOps for MyFrontend {
//!     async fn on_message(&self, conv: &ConversationKey, msg: &Message) {
//!         println!("<{}> {}", msg.sender, msg.body);
//!     }
//! }
//! ```

pub mod account;
pub mod codec;
pub mod connection;
pub mod conversation;
pub mod credentials;
mod error;
pub mod image;
pub mod irc;
pub mod nat;
pub mod output;
pub mod prefs;
pub mod protocol;
pub mod proxy;
pub mod raw;
pub mod reconnect;
pub mod router;
pub mod runtime;
pub mod simple;
pub mod status;
pub mod transport;
pub mod ui;

pub use account::{Account, AccountId, AccountManager};
pub use connection::{Connection, ConnectionState};
pub use conversation::{Conversation, ConversationKey, ConversationKind, ConversationRegistry, Message};
pub use error::{Error, Result};
pub use protocol::{ProtocolFactory, ProtocolRegistry, SessionCommand, SessionEvent};
pub use runtime::Runtime;
pub use ui::{NullUiOps, UiOps};
