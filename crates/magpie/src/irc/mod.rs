//! IRCv3 protocol back-end.
//!
//! After the transport comes up the session sends `CAP LS 302`,
//! `USER`, and `NICK`, collects capability tokens across every `CAP LS`
//! continuation, and closes negotiation with `CAP END`. `PING` is
//! answered inline; `PRIVMSG`/`NOTICE` feed the conversation registry.

mod handlers;
pub mod parser;

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_stream::StreamExt;
use tokio_util::codec::FramedRead;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::account::{Account, AccountOption};
use crate::codec::LineDecoder;
use crate::connection::{Connection, ConnectionState};
use crate::conversation::{ConversationKind, Message};
use crate::error::{Error, Result};
use crate::output::QueuedOutput;
use crate::protocol::{
    ProtocolFactory, SessionCommand, SessionContext, SessionEvent, SessionHandle,
};
use crate::transport::{DialOptions, StreamTransport};

pub use parser::IrcMessage;

/// Protocol id this back-end registers under.
pub const PROTOCOL_ID: &str = "ircv3";

/// Default port when TLS is on.
pub const DEFAULT_TLS_PORT: u16 = 6697;

/// Default port for plain-text connections.
pub const DEFAULT_PLAIN_PORT: u16 = 6667;

/// The capability-negotiation version we request.
const CAP_VERSION: &str = "302";

/// Factory registering the IRCv3 back-end.
#[derive(Debug, Default)]
pub struct IrcFactory;

impl ProtocolFactory for IrcFactory {
    fn id(&self) -> &'static str {
        PROTOCOL_ID
    }

    fn name(&self) -> &'static str {
        "IRCv3"
    }

    fn options(&self) -> Vec<AccountOption> {
        vec![
            AccountOption::bool("use-tls", "Use TLS", true),
            AccountOption::int("port", "Port", DEFAULT_TLS_PORT as i64),
            AccountOption::string("ident", "Ident name", ""),
            AccountOption::string("real-name", "Real name", ""),
        ]
    }

    fn validate(&self, account: &Account) -> Result<()> {
        // The username carries the server name; none of it may contain
        // whitespace.
        if account.id.username.contains(char::is_whitespace) {
            return Err(Error::InvalidSettings(
                "IRC nick and server may not contain whitespace".into(),
            ));
        }
        if account.split_username().is_none() {
            return Err(Error::InvalidSettings(
                "IRC usernames take the form nick@server".into(),
            ));
        }
        Ok(())
    }

    fn spawn_session(&self, ctx: SessionContext) -> SessionHandle {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let task = tokio::spawn(run(ctx, commands_rx, cancel.clone()));
        SessionHandle {
            commands: commands_tx,
            cancel,
            task,
        }
    }
}

/// Work a synchronous router handler queued for the async loop.
pub(crate) enum Pending {
    /// Deliver a message into the conversation registry.
    Deliver {
        peer: String,
        kind: ConversationKind,
        message: Message,
    },
    /// Capability negotiation finished; we are signed on.
    Registered,
}

/// Live IRCv3 session state; handlers mutate this through the router.
pub(crate) struct IrcSession {
    conn: Connection,
    output: QueuedOutput,
    nickname: String,
    capabilities: Option<String>,
    pending: Vec<Pending>,
}

impl IrcSession {
    /// Queue one line for the wire.
    fn writef(&mut self, line: &str) -> Result<()> {
        self.output.push_line(line)
    }

    /// Capability tokens collected so far.
    fn capabilities(&self) -> &str {
        self.capabilities.as_deref().unwrap_or("")
    }

    /// Append tokens from one `CAP LS`/`LIST` line.
    fn append_capabilities(&mut self, tokens: &str) {
        match &mut self.capabilities {
            Some(existing) => {
                existing.push(' ');
                existing.push_str(tokens);
            }
            None => self.capabilities = Some(tokens.to_owned()),
        }
    }
}

fn build_router() -> crate::router::Router<IrcSession, IrcMessage> {
    let mut router = crate::router::Router::new();
    router.add_handler("PING", handlers::ping);
    router.add_handler("CAP", handlers::cap);
    router.add_handler("PRIVMSG", handlers::privmsg);
    router.add_handler("NOTICE", handlers::privmsg);
    router.set_fallback(handlers::fallback);
    router
}

async fn run(
    ctx: SessionContext,
    mut commands: mpsc::UnboundedReceiver<SessionCommand>,
    cancel: CancellationToken,
) {
    let SessionContext {
        account,
        secret: _,
        public_ip: _,
        ui,
        conversations,
        events,
    } = ctx;
    let account_id = account.id.clone();

    let mut conn = Connection::with_token(account.clone(), ui, cancel);
    let Some((nick, server)) = account.split_username().map(|(n, s)| (n.to_owned(), s.to_owned()))
    else {
        let err = Error::InvalidSettings("IRC usernames take the form nick@server".into());
        conn.report_error(&err).await;
        let _ = events.send(SessionEvent::Disconnected {
            account: account_id,
            error: Some(err),
        });
        return;
    };

    conn.set_state(ConnectionState::Connecting).await;

    let use_tls = account.get_bool("use-tls", true);
    let default_port = if use_tls { DEFAULT_TLS_PORT } else { DEFAULT_PLAIN_PORT };
    let port = account.get_int("port", default_port as i64) as u16;
    let opts = DialOptions::new(server.clone(), port)
        .with_tls(use_tls)
        .with_proxy(account.proxy.clone());

    let cancel_token = conn.token();
    let dialed = tokio::select! {
        _ = cancel_token.cancelled() => Err(Error::Cancelled),
        dialed = StreamTransport::dial(&opts) => dialed,
    };
    let transport = match dialed {
        Ok(transport) => transport,
        Err(err) => {
            conn.report_error(&err).await;
            conn.set_state(ConnectionState::Disconnected).await;
            let _ = events.send(SessionEvent::Disconnected {
                account: account_id,
                error: Some(err),
            });
            return;
        }
    };
    info!(%server, port, "connected");
    conn.set_state(ConnectionState::Authenticating).await;

    let (write_errors_tx, mut write_errors) = mpsc::unbounded_channel();
    let (output, writer_task) =
        QueuedOutput::spawn(transport.writer, conn.token(), write_errors_tx);
    let mut lines = FramedRead::new(transport.reader, LineDecoder::new());

    let mut session = IrcSession {
        conn,
        output,
        nickname: nick.clone(),
        capabilities: None,
        pending: Vec::new(),
    };
    let router = build_router();

    // Registration burst. The stored ident/realname may be empty
    // strings, in which case the nick fills in.
    let ident = non_empty_or(account.get_string("ident", ""), &nick);
    let realname = non_empty_or(account.get_string("real-name", ""), &nick);
    let registration_failed = session.writef(&format!("CAP LS {CAP_VERSION}")).is_err()
        || session.writef(&format!("USER {ident} 0 * :{realname}")).is_err()
        || session.writef(&format!("NICK {nick}")).is_err();
    if registration_failed {
        let _ = events.send(SessionEvent::Disconnected {
            account: account_id,
            error: Some(Error::Network("connection lost during registration".into())),
        });
        return;
    }

    let mut close_error: Option<Error> = None;
    let mut graceful = false;

    loop {
        let cancel_token = session.conn.token();
        tokio::select! {
            _ = cancel_token.cancelled() => {
                break;
            }
            err = write_errors.recv() => {
                if let Some(err) = err {
                    session.conn.report_error(&err).await;
                    close_error = Some(err);
                }
                break;
            }
            command = commands.recv() => {
                match command {
                    Some(command) => handle_command(&mut session, &conversations, command).await,
                    None => {
                        // Every handle dropped: graceful teardown.
                        graceful = true;
                        break;
                    }
                }
            }
            line = lines.next() => {
                match line {
                    Some(Ok(line)) => {
                        dispatch_line(&mut session, &router, &line);
                        drain_pending(&mut session, &conversations, &events).await;
                    }
                    Some(Err(err)) => {
                        // Codec overflow closes the connection as a
                        // network failure; a bad frame was already
                        // dropped inside the parser path.
                        let err = match err {
                            Error::FrameOverflow { limit } => {
                                Error::Network(format!("oversized frame (limit {limit} bytes)"))
                            }
                            other => other,
                        };
                        session.conn.report_error(&err).await;
                        close_error = Some(err);
                        break;
                    }
                    None => {
                        let err = Error::Network("server closed the connection".into());
                        session.conn.report_error(&err).await;
                        close_error = Some(err);
                        break;
                    }
                }
            }
        }
    }

    session.conn.set_state(ConnectionState::Disconnecting).await;
    if graceful && !session.conn.is_cancelled() {
        // Best-effort goodbye; the writer drains the queue when the
        // last output handle drops, without waiting for a response.
        let _ = session.writef("QUIT :leaving");
    }
    session.conn.set_state(ConnectionState::Disconnected).await;

    let cancel_token = session.conn.token();
    drop(session);
    // Bounded drain: a stalled peer must not wedge teardown.
    let _ = tokio::time::timeout(std::time::Duration::from_secs(5), writer_task).await;
    cancel_token.cancel();

    let _ = events.send(SessionEvent::Disconnected {
        account: account_id,
        error: close_error,
    });
}

fn dispatch_line(
    session: &mut IrcSession,
    router: &crate::router::Router<IrcSession, IrcMessage>,
    line: &str,
) {
    match IrcMessage::parse(line) {
        Ok(msg) => {
            let verb = msg.command.clone();
            router.dispatch(session, &verb, &msg);
        }
        Err(err) => {
            // Drop the frame, keep the connection.
            debug!(%err, line, "dropping unparseable line");
        }
    }
}

async fn drain_pending(
    session: &mut IrcSession,
    conversations: &Arc<crate::conversation::ConversationRegistry>,
    events: &mpsc::UnboundedSender<SessionEvent>,
) {
    for pending in std::mem::take(&mut session.pending) {
        match pending {
            Pending::Deliver { peer, kind, message } => {
                let conv = conversations
                    .find_or_create(session.conn.account().id.clone(), &peer, kind)
                    .await;
                conversations.write_message(&conv, message).await;
            }
            Pending::Registered => {
                session.conn.set_state(ConnectionState::Connected).await;
                let _ = events.send(SessionEvent::Connected(session.conn.account().id.clone()));
            }
        }
    }
}

async fn handle_command(
    session: &mut IrcSession,
    conversations: &Arc<crate::conversation::ConversationRegistry>,
    command: SessionCommand,
) {
    match command {
        SessionCommand::SendIm { peer, body } => {
            if session.writef(&format!("PRIVMSG {peer} :{body}")).is_ok() {
                let kind = if peer.starts_with('#') {
                    ConversationKind::Chat
                } else {
                    ConversationKind::Im
                };
                let conv = conversations
                    .find_or_create(session.conn.account().id.clone(), &peer, kind)
                    .await;
                let msg = Message::outgoing(session.nickname.clone(), body);
                conversations.write_message(&conv, msg).await;
            }
        }
        SessionCommand::SetStatus { status } => {
            let _ = if status == "available" {
                session.writef("AWAY")
            } else {
                session.writef(&format!("AWAY :{status}"))
            };
        }
        SessionCommand::SendTyping { .. }
        | SessionCommand::AddBuddy { .. }
        | SessionCommand::RemoveBuddy { .. } => {
            debug!("command not applicable to IRC, ignoring");
        }
    }
}

fn non_empty_or(value: String, fallback: &str) -> String {
    if value.is_empty() { fallback.to_owned() } else { value }
}
