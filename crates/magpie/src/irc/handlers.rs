//! Message handlers for the IRCv3 session router.

use tracing::{debug, warn};

use super::parser::IrcMessage;
use super::{IrcSession, Pending};
use crate::conversation::{ConversationKind, Message};
use crate::error::{Error, Result};

/// Everything without a dedicated handler lands here.
pub(super) fn fallback(_session: &mut IrcSession, msg: &IrcMessage) -> Result<()> {
    debug!(
        source = msg.source.as_deref().unwrap_or(""),
        command = %msg.command,
        params = %msg.params.join(" "),
        "unhandled message"
    );
    Ok(())
}

/// `PING` is always answered, echoing the argument when there is one.
pub(super) fn ping(session: &mut IrcSession, msg: &IrcMessage) -> Result<()> {
    match msg.params.first() {
        Some(arg) => session.writef(&format!("PONG {arg}")),
        None => session.writef("PONG"),
    }
}

/// `CAP` subcommand dispatch. Only `LS`/`LIST` are interesting: collect
/// capability tokens across continuations, then end negotiation.
pub(super) fn cap(session: &mut IrcSession, msg: &IrcMessage) -> Result<()> {
    if msg.params.len() < 2 {
        return Err(Error::Protocol("CAP with too few parameters".into()));
    }

    // params[0] is our nick (or `*` before registration), params[1] the
    // subcommand, and the rest belongs to the subcommand.
    let subcommand = msg.params[1].as_str();
    let subparams = &msg.params[2..];

    if subcommand == "LS" || subcommand == "LIST" {
        return cap_list(session, subparams);
    }

    Err(Error::Protocol(format!("no handler for CAP subcommand {subcommand}")))
}

fn cap_list(session: &mut IrcSession, subparams: &[String]) -> Result<()> {
    // A `*` marker in front of the token list means more lines follow.
    if subparams.len() > 1 && subparams[0] == "*" {
        session.append_capabilities(&subparams[1]);
        return Ok(());
    }

    if let Some(tokens) = subparams.first() {
        session.append_capabilities(tokens);
    }
    debug!(capabilities = session.capabilities(), "capability negotiation done");
    session.writef("CAP END")?;
    session.pending.push(Pending::Registered);
    Ok(())
}

/// `PRIVMSG` and `NOTICE` delivery into the conversation registry.
pub(super) fn privmsg(session: &mut IrcSession, msg: &IrcMessage) -> Result<()> {
    if msg.params.len() != 2 {
        warn!(params = %msg.params.join(" "), "unknown privmsg message format");
        return Err(Error::Protocol("PRIVMSG/NOTICE without target and body".into()));
    }

    let target = msg.params[0].as_str();
    let sender = msg.source_nick().unwrap_or(target).to_owned();

    // Room messages live under the room name; direct messages under
    // the peer that sent them.
    let (kind, peer) = if target.starts_with('#') {
        (ConversationKind::Chat, target.to_owned())
    } else {
        (ConversationKind::Im, sender.clone())
    };

    let message =
        Message::incoming(sender, msg.params[1].clone()).with_notify(msg.command == "NOTICE");
    session.pending.push(Pending::Deliver { peer, kind, message });
    Ok(())
}
