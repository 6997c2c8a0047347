//! Interactive connect console.

use std::sync::Arc;

use async_trait::async_trait;
use clap::Args;
use magpie::account::{Account, AccountId, SettingValue};
use magpie::connection::ConnectionState;
use magpie::conversation::{ConversationKey, Message};
use magpie::protocol::SessionCommand;
use magpie::runtime::Runtime;
use magpie::ui::UiOps;
use magpie::{Error, Result};
use tokio::io::{AsyncBufReadExt, BufReader};

#[derive(Args)]
pub struct ConnectArgs {
    /// Account in user@server form
    pub account: String,

    /// Protocol id (ircv3, simple, raw)
    #[arg(short, long, default_value = "ircv3")]
    pub protocol: String,

    /// Password (stored in the in-memory credential provider)
    #[arg(short = 'P', long)]
    pub password: Option<String>,

    /// Server port override
    #[arg(long)]
    pub port: Option<u16>,

    /// Disable TLS
    #[arg(long)]
    pub no_tls: bool,

    /// SIMPLE: use UDP transport
    #[arg(long)]
    pub udp: bool,

    /// Peer every typed line is sent to (raw sends verbatim)
    #[arg(short, long)]
    pub to: Option<String>,
}

/// Prints every core event to stdout.
struct ConsoleUi {
    json: bool,
}

impl ConsoleUi {
    fn emit(&self, kind: &str, detail: String) {
        if self.json {
            println!(
                "{}",
                serde_json::json!({ "event": kind, "detail": detail })
            );
        } else {
            println!("[{kind}] {detail}");
        }
    }
}

#[async_trait]
impl UiOps for ConsoleUi {
    async fn on_connection_state_changed(
        &self,
        account: &AccountId,
        old: ConnectionState,
        new: ConnectionState,
    ) {
        self.emit("state", format!("{account}: {old:?} -> {new:?}"));
    }

    async fn on_message(&self, conv: &ConversationKey, msg: &Message) {
        let direction = if msg.incoming { "<-" } else { "->" };
        self.emit(
            "message",
            format!("{} {direction} <{}> {}", conv.peer, msg.sender, msg.body),
        );
    }

    async fn on_conversation_opened(&self, conv: &ConversationKey) {
        self.emit("conversation", format!("opened {}", conv.peer));
    }

    async fn on_error(&self, account: &AccountId, error: &Error) {
        self.emit("error", format!("{account}: {error}"));
    }

    async fn on_presence(&self, _account: &AccountId, peer: &str, available: bool) {
        self.emit(
            "presence",
            format!("{peer} is {}", if available { "available" } else { "offline" }),
        );
    }

    async fn on_typing(&self, _account: &AccountId, peer: &str, typing: bool) {
        self.emit(
            "typing",
            format!("{peer} {}", if typing { "is typing" } else { "stopped typing" }),
        );
    }
}

pub async fn run(args: ConnectArgs, json: bool) -> Result<()> {
    let runtime = Runtime::new(Arc::new(ConsoleUi { json }));

    let id = AccountId::new(args.account.clone(), args.protocol.clone());
    let mut account = Account::new(id.clone());
    if let Some(port) = args.port {
        account.set("port", SettingValue::Int(port as i64));
    }
    if args.no_tls {
        account.set("use-tls", SettingValue::Bool(false));
    }
    if args.udp {
        account.set("udp", SettingValue::Bool(true));
    }
    runtime.accounts().add(account);

    if let Some(password) = &args.password {
        runtime.credentials().store(&id, password).await?;
    }

    runtime.enable_account(&id).await;

    // Typed lines go to --to (or are dropped with a hint).
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                match line {
                    Ok(Some(line)) if line == "/quit" => break,
                    Ok(Some(line)) if !line.is_empty() => {
                        match &args.to {
                            Some(peer) => runtime.session_command(
                                &id,
                                SessionCommand::SendIm { peer: peer.clone(), body: line },
                            ),
                            None if args.protocol == "raw" => runtime.session_command(
                                &id,
                                SessionCommand::SendIm { peer: String::new(), body: line },
                            ),
                            None => eprintln!("no --to peer configured, dropping line"),
                        }
                    }
                    Ok(Some(_)) => {}
                    Ok(None) | Err(_) => break,
                }
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    runtime.shutdown().await;
    Ok(())
}
