//! Raw debug protocol.
//!
//! Connects a TCP stream and passes lines through untouched: anything
//! typed is written verbatim to the server, anything received lands in
//! a single conversation. Useful for poking at line-based servers and
//! for exercising the runtime without a real protocol.

use tokio::sync::mpsc;
use tokio_stream::StreamExt;
use tokio_util::codec::FramedRead;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::account::{Account, AccountOption};
use crate::codec::LineDecoder;
use crate::connection::{Connection, ConnectionState};
use crate::conversation::{ConversationKind, Message};
use crate::error::Error;
use crate::output::QueuedOutput;
use crate::protocol::{
    ProtocolFactory, SessionCommand, SessionContext, SessionEvent, SessionHandle,
};
use crate::transport::{DialOptions, StreamTransport};

/// Protocol id this back-end registers under.
pub const PROTOCOL_ID: &str = "raw";

/// Peer name the single conversation is filed under.
const SERVER_PEER: &str = "server";

/// Factory registering the raw back-end.
#[derive(Debug, Default)]
pub struct RawFactory;

impl ProtocolFactory for RawFactory {
    fn id(&self) -> &'static str {
        PROTOCOL_ID
    }

    fn name(&self) -> &'static str {
        "Raw"
    }

    fn options(&self) -> Vec<AccountOption> {
        vec![
            AccountOption::int("port", "Port", 23),
            AccountOption::bool("use-tls", "Use TLS", false),
        ]
    }

    fn validate(&self, account: &Account) -> crate::error::Result<()> {
        if account.split_username().is_none() {
            return Err(Error::InvalidSettings(
                "raw accounts take the form name@host".into(),
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
    let server = account
        .split_username()
        .map(|(_, s)| s.to_owned())
        .unwrap_or_else(|| account.id.username.clone());

    conn.set_state(ConnectionState::Connecting).await;
    let opts = DialOptions::new(server, account.get_int("port", 23) as u16)
        .with_tls(account.get_bool("use-tls", false))
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

    let (write_errors_tx, mut write_errors) = mpsc::unbounded_channel();
    let (output, writer_task) =
        QueuedOutput::spawn(transport.writer, conn.token(), write_errors_tx);
    let mut lines = FramedRead::new(transport.reader, LineDecoder::new());

    // Nothing to negotiate; we are as signed on as we will ever be.
    conn.set_state(ConnectionState::Connected).await;
    let _ = events.send(SessionEvent::Connected(account_id.clone()));

    let mut close_error: Option<Error> = None;

    loop {
        let cancel_token = conn.token();
        tokio::select! {
            _ = cancel_token.cancelled() => break,
            err = write_errors.recv() => {
                if let Some(err) = err {
                    conn.report_error(&err).await;
                    close_error = Some(err);
                }
                break;
            }
            command = commands.recv() => {
                match command {
                    Some(SessionCommand::SendIm { body, .. }) => {
                        let _ = output.push_line(&body);
                    }
                    Some(_) => debug!("command not applicable to raw, ignoring"),
                    None => break,
                }
            }
            line = lines.next() => {
                match line {
                    Some(Ok(line)) => {
                        let conv = conversations
                            .find_or_create(account_id.clone(), SERVER_PEER, ConversationKind::Im)
                            .await;
                        let msg = Message::incoming(SERVER_PEER, line);
                        conversations.write_message(&conv, msg).await;
                    }
                    Some(Err(err)) => {
                        let err = match err {
                            Error::FrameOverflow { limit } => {
                                Error::Network(format!("oversized frame (limit {limit} bytes)"))
                            }
                            other => other,
                        };
                        conn.report_error(&err).await;
                        close_error = Some(err);
                        break;
                    }
                    None => {
                        let err = Error::Network("server closed the connection".into());
                        conn.report_error(&err).await;
                        close_error = Some(err);
                        break;
                    }
                }
            }
        }
    }

    conn.set_state(ConnectionState::Disconnecting).await;
    conn.set_state(ConnectionState::Disconnected).await;

    let cancel_token = conn.token();
    drop(output);
    // Bounded drain: a stalled peer must not wedge teardown.
    let _ = tokio::time::timeout(std::time::Duration::from_secs(5), writer_task).await;
    cancel_token.cancel();

    let _ = events.send(SessionEvent::Disconnected {
        account: account_id,
        error: close_error,
    });
}
