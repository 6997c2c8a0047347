//! SIP/SIMPLE protocol back-end.
//!
//! Registration runs the HTTP-Digest loop (401 via `WWW-Authenticate`,
//! 407 via `Proxy-Authenticate`), every request is tracked as a
//! transaction with UDP retransmission, buddies are kept subscribed
//! with periodic SUBSCRIBEs, watchers of our presence get NOTIFYs with
//! a generated PIDF body, and our own presence is re-PUBLISHed on a
//! timer.

pub mod presence;

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use rand::rngs::StdRng;
use rand::{Rng, RngCore, SeedableRng};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio_stream::StreamExt;
use tokio_util::codec::FramedRead;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::account::{Account, AccountOption};
use crate::codec::digest::DigestCredentials;
use crate::codec::{SipDecoder, SipMessage};
use crate::connection::{Connection, ConnectionState};
use crate::conversation::{ConversationKind, Message};
use crate::error::{Error, Result};
use crate::output::QueuedOutput;
use crate::protocol::{
    ProtocolFactory, SessionCommand, SessionContext, SessionEvent, SessionHandle,
};
use crate::router::{Router, SWEEP_INTERVAL, Transaction, TransactionTable};
use crate::transport::{DatagramTransport, DialOptions, StreamTransport};

use presence::{BuddyTable, Dialog, WatcherTable, gen_iscomposing, gen_pidf, parse_iscomposing_active, parse_pidf_open};

/// Protocol id this back-end registers under.
pub const PROTOCOL_ID: &str = "simple";

/// Default SIP port for both transports.
pub const DEFAULT_PORT: u16 = 5060;

/// Registration lifetime we request.
const REGISTER_EXPIRE: u32 = 900;

/// Subscription lifetime we request for buddies.
const SUBSCRIBE_EXPIRE: u32 = 900;

/// Fallback watcher lifetime when a SUBSCRIBE has no `Expires`.
const WATCHER_EXPIRE_FALLBACK: u64 = 600;

/// How long after a PUBLISH the next one is due.
const PUBLISH_INTERVAL: Duration = Duration::from_secs(500);

/// Proxy-authentication attempts before giving up on one request.
const PROXY_AUTH_CAP: u32 = 4;

/// Base period of the housekeeping tick (renewal, reaping).
const TICK_INTERVAL: Duration = Duration::from_secs(10);

/// UDP keep-alive period: a single NUL byte to hold the NAT entry.
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);

/// Factory registering the SIMPLE back-end.
#[derive(Debug, Default)]
pub struct SimpleFactory;

impl ProtocolFactory for SimpleFactory {
    fn id(&self) -> &'static str {
        PROTOCOL_ID
    }

    fn name(&self) -> &'static str {
        "SIP/SIMPLE"
    }

    fn options(&self) -> Vec<AccountOption> {
        vec![
            AccountOption::bool("udp", "Use UDP", false),
            AccountOption::int("port", "Server port", DEFAULT_PORT as i64),
            AccountOption::bool("useproxy", "Use SIP proxy", false),
            AccountOption::string("proxy", "SIP proxy server", ""),
        ]
    }

    fn validate(&self, account: &Account) -> Result<()> {
        if account.id.username.contains(char::is_whitespace) {
            return Err(Error::InvalidSettings(
                "SIP usernames may not contain whitespace".into(),
            ));
        }
        if account.split_username().is_none() {
            return Err(Error::InvalidSettings(
                "SIP usernames take the form user@domain".into(),
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

/// Where we are in the REGISTER lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RegisterStatus {
    Unregistered,
    Registering,
    Registered,
}

/// Async work queued by the synchronous handlers.
enum Pending {
    Deliver { peer: String, message: Message },
    Presence { peer: String, available: bool },
    Typing { peer: String, active: bool },
    Registered,
    Fatal(Error),
}

/// Live SIMPLE session state.
pub(crate) struct SimpleSession {
    conn: Connection,
    output: QueuedOutput,
    username: String,
    servername: String,
    password: String,
    udp: bool,
    /// IP we advertise in Via and Contact headers.
    ip: String,
    listenport: u16,
    status: String,
    register_status: RegisterStatus,
    /// Whether this REGISTER cycle already retried with credentials.
    auth_retried: bool,
    registrar: Option<DigestCredentials>,
    proxy_creds: Option<DigestCredentials>,
    transactions: TransactionTable<SimpleSession>,
    buddies: BuddyTable,
    watchers: WatcherTable,
    reregister_at: tokio::time::Instant,
    republish_at: Option<tokio::time::Instant>,
    publish_disabled: bool,
    rng: StdRng,
    pending: Vec<Pending>,
}

impl SimpleSession {
    fn gentag(&mut self) -> String {
        format!("{:04x}{:04x}", self.rng.next_u32() & 0xFFFF, self.rng.next_u32() & 0xFFFF)
    }

    fn genbranch(&mut self) -> String {
        format!(
            "z9hG4bK{:04X}{:04X}{:04X}{:04X}{:04X}",
            self.rng.next_u32() & 0xFFFF,
            self.rng.next_u32() & 0xFFFF,
            self.rng.next_u32() & 0xFFFF,
            self.rng.next_u32() & 0xFFFF,
            self.rng.next_u32() & 0xFFFF
        )
    }

    fn gencallid(&mut self) -> String {
        format!(
            "{:04X}g{:04X}a{:04X}i{:04X}m{:04X}t{:04X}b{:04X}x{:04X}x",
            self.rng.next_u32() & 0xFFFF,
            self.rng.next_u32() & 0xFFFF,
            self.rng.next_u32() & 0xFFFF,
            self.rng.next_u32() & 0xFFFF,
            self.rng.next_u32() & 0xFFFF,
            self.rng.next_u32() & 0xFFFF,
            self.rng.next_u32() & 0xFFFF,
            self.rng.next_u32() & 0xFFFF
        )
    }

    fn aor(&self) -> String {
        format!("sip:{}@{}", self.username, self.servername)
    }

    /// Build, sign, track, and queue one request.
    fn send_request(
        &mut self,
        method: &str,
        target: &str,
        to: &str,
        extra_headers: Vec<(&'static str, String)>,
        body: &str,
        dialog: Option<Dialog>,
        on_response: Option<crate::router::ResponseHandler<SimpleSession>>,
    ) {
        let branch = self.genbranch();
        let from_tag = match &dialog {
            Some(d) => d.our_tag.clone(),
            None => self.gentag(),
        };
        let call_id = match &dialog {
            Some(d) => d.call_id.clone(),
            None => self.gencallid(),
        };
        let cseq = self.transactions.next_cseq();

        let mut msg = SipMessage::request(method, target);
        msg.add_header(
            "Via",
            format!(
                "SIP/2.0/{} {}:{};branch={}",
                if self.udp { "UDP" } else { "TCP" },
                self.ip,
                self.listenport,
                branch
            ),
        )
        .add_header("From", format!("<{}>;tag={}", self.aor(), from_tag))
        .add_header(
            "To",
            match &dialog {
                Some(d) if !d.their_tag.is_empty() => format!("<{to}>;tag={}", d.their_tag),
                _ => format!("<{to}>"),
            },
        )
        .add_header("Max-Forwards", "10")
        .add_header("CSeq", format!("{cseq} {method}"))
        .add_header("User-Agent", "magpie SIP/SIMPLE")
        .add_header("Call-ID", call_id);

        // Registrar credentials sign REGISTERs; proxy credentials sign
        // everything else.
        if method == "REGISTER" {
            if let Some(registrar) = &mut self.registrar {
                let value = registrar.authorization(&self.username, method, target);
                msg.add_header("Authorization", value);
            }
        } else if let Some(proxy) = &mut self.proxy_creds {
            let value = proxy.authorization(&self.username, method, target);
            msg.add_header("Proxy-Authorization", value);
        }

        for (name, value) in extra_headers {
            msg.add_header(name, value);
        }
        msg.set_body(body.as_bytes());

        let bytes = Bytes::from(msg.to_bytes());
        self.transactions.add(cseq, method, bytes.clone(), on_response);
        if self.output.push(bytes).is_err() {
            debug!(method, "output gone, dropping request");
        }
    }

    /// Echo a response to an inbound request, reusing its headers.
    fn send_response(&mut self, req: &SipMessage, code: u16, reason: &str, body: Option<&str>) {
        let mut msg = SipMessage::response(code, reason);
        msg.headers = req
            .headers
            .iter()
            .filter(|(n, _)| !n.eq_ignore_ascii_case("Content-Length"))
            .cloned()
            .collect();
        msg.set_body(body.unwrap_or_default().as_bytes());
        if self.output.push(Bytes::from(msg.to_bytes())).is_err() {
            debug!(code, "output gone, dropping response");
        }
    }

    /// Fresh REGISTER cycle: one auth retry allowed per cycle.
    fn do_register(&mut self) {
        self.auth_retried = false;
        self.send_register(REGISTER_EXPIRE);
    }

    fn send_register(&mut self, expire: u32) {
        self.register_status = RegisterStatus::Registering;
        schedule_reregister(self, tokio::time::Instant::now(), expire);

        let contact = format!(
            "<sip:{}@{}:{};transport={}>;methods=\"MESSAGE, SUBSCRIBE, NOTIFY\"",
            self.username,
            self.ip,
            self.listenport,
            if self.udp { "udp" } else { "tcp" }
        );
        let target = format!("sip:{}", self.servername);
        let to = self.aor();
        self.send_request(
            "REGISTER",
            &target,
            &to,
            vec![("Contact", contact), ("Expires", expire.to_string())],
            "",
            None,
            Some(on_register_response),
        );
    }

    /// SUBSCRIBE to one buddy and schedule the renewal with jitter.
    fn subscribe_buddy(&mut self, name: &str) {
        let to = if name.starts_with("sip:") {
            name.to_owned()
        } else {
            format!("sip:{name}")
        };
        self.send_request(
            "SUBSCRIBE",
            &to,
            &to,
            vec![
                ("Expires", SUBSCRIBE_EXPIRE.to_string()),
                ("Accept", "application/pidf+xml".to_owned()),
                ("Event", "presence".to_owned()),
            ],
            "",
            None,
            Some(on_subscribe_response),
        );

        let renewal = tokio::time::Instant::now() + resubscribe_delay(&mut self.rng);
        self.buddies.set_resubscribe(name, renewal);
    }

    fn send_message(&mut self, to: &str, body: &str, content_type: Option<&str>) {
        let to = if to.starts_with("sip:") {
            to.to_owned()
        } else {
            format!("sip:{to}")
        };
        let content_type = content_type.unwrap_or("text/plain").to_owned();
        self.send_request(
            "MESSAGE",
            &to,
            &to,
            vec![("Content-Type", content_type)],
            body,
            None,
            None,
        );
    }

    fn send_notify(&mut self, watcher: &presence::Watcher) {
        let doc = gen_pidf(&self.username, &self.servername, &self.status);
        self.send_request(
            "NOTIFY",
            &watcher.name,
            &watcher.name,
            vec![
                ("Event", "presence".to_owned()),
                ("Content-Type", "application/pidf+xml".to_owned()),
            ],
            &doc,
            Some(watcher.dialog.clone()),
            None,
        );
    }

    fn send_publish(&mut self) {
        let uri = self.aor();
        let doc = gen_pidf(&self.username, &self.servername, &self.status);
        self.send_request(
            "PUBLISH",
            &uri,
            &uri,
            vec![
                ("Expires", "600".to_owned()),
                ("Event", "presence".to_owned()),
                ("Content-Type", "application/pidf+xml".to_owned()),
                ("Accept", "application/pidf+xml".to_owned()),
            ],
            &doc,
            None,
            Some(on_publish_response),
        );
        self.republish_at = Some(tokio::time::Instant::now() + PUBLISH_INTERVAL);
    }

    /// Re-publish and notify every watcher, in table order.
    fn do_notifies(&mut self) {
        if !self.publish_disabled {
            self.send_publish();
        }
        for watcher in self.watchers.all() {
            debug!(watcher = %watcher.name, "notifying");
            self.send_notify(&watcher);
        }
    }

    /// Housekeeping: re-register, renew subscriptions, reap watchers,
    /// re-publish.
    fn on_tick(&mut self) {
        let now = tokio::time::Instant::now();

        // Register again when the current registration (or a stalled
        // attempt) runs out.
        if self.reregister_at <= now {
            self.do_register();
        }

        for name in self.buddies.due(now) {
            debug!(buddy = %name, "subscription renewal due");
            self.subscribe_buddy(&name);
        }

        self.watchers.reap(now);

        if self.register_status == RegisterStatus::Registered
            && !self.publish_disabled
            && self.republish_at.is_some_and(|at| at <= now)
        {
            self.send_publish();
        }
    }
}

// ============================================================================
// Response callbacks
// ============================================================================

fn on_register_response(
    session: &mut SimpleSession,
    msg: &SipMessage,
    _trans: &Transaction<SimpleSession>,
) -> Result<()> {
    let code = msg.code().unwrap_or(0);
    debug!(code, "register response");
    match code {
        200 => {
            let expires: u32 = msg
                .header("Expires")
                .and_then(|v| v.trim().parse().ok())
                .unwrap_or(0);
            schedule_reregister(session, tokio::time::Instant::now(), expires);

            let first = session.register_status != RegisterStatus::Registered;
            session.register_status = RegisterStatus::Registered;
            if first {
                session.send_publish();
                session.pending.push(Pending::Registered);
            }
        }
        401 => {
            if session.auth_retried {
                session.pending.push(Pending::Fatal(Error::AuthFailed(
                    "registrar rejected our credentials".into(),
                )));
                return Ok(());
            }
            let challenge = msg
                .header("WWW-Authenticate")
                .ok_or_else(|| Error::Protocol("401 without WWW-Authenticate".into()))?;
            session.registrar = Some(DigestCredentials::from_challenge(
                challenge,
                &session.username,
                &session.password,
            )?);
            session.auth_retried = true;
            session.send_register(REGISTER_EXPIRE);
        }
        _ => {
            warn!(code, "unexpected register response");
        }
    }
    Ok(())
}

/// Next re-register is due 50 seconds before the registration lapses,
/// or in 600 seconds when no lifetime was granted.
fn reregister_delay(expires: u32) -> Duration {
    Duration::from_secs(if expires > 0 {
        u64::from(expires.saturating_sub(50).max(1))
    } else {
        600
    })
}

fn schedule_reregister(session: &mut SimpleSession, now: tokio::time::Instant, expires: u32) {
    session.reregister_at = now + reregister_delay(expires);
}

fn on_subscribe_response(
    session: &mut SimpleSession,
    msg: &SipMessage,
    trans: &Transaction<SimpleSession>,
) -> Result<()> {
    let code = msg.code().unwrap_or(0);
    if code == 200 || code == 202 {
        return Ok(());
    }

    // We cannot subscribe, so the buddy is offline as far as we know.
    let request = SipMessage::parse(&trans.last_sent)
        .map_err(|_| Error::Protocol("unparseable stored request".into()))?;
    let to = request
        .header("To")
        .and_then(parse_from)
        .ok_or_else(|| Error::Protocol("stored SUBSCRIBE without To".into()))?;
    session.pending.push(Pending::Presence {
        peer: to,
        available: false,
    });
    Ok(())
}

fn on_publish_response(
    session: &mut SimpleSession,
    msg: &SipMessage,
    _trans: &Transaction<SimpleSession>,
) -> Result<()> {
    if msg.code() != Some(200) {
        // Stop publishing until the next local status change.
        debug!(code = msg.code().unwrap_or(0), "publish rejected, pausing");
        session.publish_disabled = true;
        session.republish_at = None;
    }
    Ok(())
}

// ============================================================================
// Inbound request handlers
// ============================================================================

fn handler_message(session: &mut SimpleSession, msg: &SipMessage) -> Result<()> {
    let Some(from) = msg.header("From").and_then(parse_from) else {
        return Err(Error::Protocol("MESSAGE without a parseable From".into()));
    };
    let body = String::from_utf8_lossy(&msg.body).into_owned();
    let content_type = msg.header("Content-Type").unwrap_or("text/plain").to_owned();

    if content_type.starts_with("text/plain") || content_type.starts_with("text/html") {
        debug!(%from, "got message");
        session.pending.push(Pending::Deliver {
            peer: from.clone(),
            message: Message::incoming(from, body),
        });
        session.send_response(msg, 200, "OK", None);
    } else if content_type.starts_with("application/im-iscomposing+xml") {
        let Some(active) = parse_iscomposing_active(&body) else {
            return Err(Error::Protocol("cannot parse iscomposing".into()));
        };
        session.pending.push(Pending::Typing { peer: from, active });
        session.send_response(msg, 200, "OK", None);
    } else {
        debug!(%content_type, "unknown mime type");
        session.send_response(msg, 415, "Unsupported media type", None);
    }
    Ok(())
}

fn handler_notify(session: &mut SimpleSession, msg: &SipMessage) -> Result<()> {
    let Some(from) = msg.header("From").and_then(parse_from) else {
        return Err(Error::Protocol("NOTIFY without a parseable From".into()));
    };
    let body = String::from_utf8_lossy(&msg.body);
    let Some(open) = parse_pidf_open(&body) else {
        return Err(Error::Protocol("NOTIFY without parseable PIDF".into()));
    };

    session.pending.push(Pending::Presence {
        peer: from,
        available: open,
    });
    session.send_response(msg, 200, "OK", None);
    Ok(())
}

fn handler_subscribe(session: &mut SimpleSession, msg: &SipMessage) -> Result<()> {
    let from_header = msg
        .header("From")
        .ok_or_else(|| Error::Protocol("SUBSCRIBE without From".into()))?
        .to_owned();
    let from = parse_from(&from_header)
        .ok_or_else(|| Error::Protocol("SUBSCRIBE without a parseable From".into()))?;
    let their_tag = find_tag(&from_header).unwrap_or_default();
    let to_header = msg.header("To").unwrap_or_default().to_owned();
    let existing_tag = find_tag(&to_header);
    let tag_added = existing_tag.is_none();
    let our_tag = match existing_tag {
        Some(tag) => tag,
        None => session.gentag(),
    };
    let call_id = match msg.header("Call-ID") {
        Some(id) => id.to_owned(),
        None => session.gencallid(),
    };

    let expires_secs = msg
        .header("Expires")
        .and_then(|v| v.trim().parse::<u64>().ok())
        .unwrap_or(WATCHER_EXPIRE_FALLBACK);
    let expires_at = tokio::time::Instant::now() + Duration::from_secs(expires_secs);

    if !session.watchers.refresh(&from, expires_at) {
        let dialog = Dialog {
            call_id,
            our_tag: our_tag.clone(),
            their_tag,
        };
        session.watchers.create(&from, dialog, expires_at);
    }

    // Echo the request back as 200, tagging To if the subscriber did
    // not, and replacing Contact with our own address.
    let mut reply_source = msg.clone();
    if tag_added {
        reply_source.remove_header("To");
        reply_source.add_header("To", format!("{to_header};tag={our_tag}"));
    }
    reply_source.remove_header("Contact");
    reply_source.add_header("Contact", format!("<{}>", session.aor()));

    let watcher = session
        .watchers
        .find(&from)
        .expect("watcher just inserted")
        .clone();
    debug!(
        watcher = %watcher.name,
        our_tag = %watcher.dialog.our_tag,
        their_tag = %watcher.dialog.their_tag,
        call_id = %watcher.dialog.call_id,
        "got subscribe"
    );
    session.send_response(&reply_source, 200, "Ok", None);
    session.send_notify(&watcher);
    Ok(())
}

fn handler_unknown_request(session: &mut SimpleSession, msg: &SipMessage) -> Result<()> {
    session.send_response(msg, 501, "Not implemented", None);
    Ok(())
}

// ============================================================================
// Response routing (transaction matching, auth retries)
// ============================================================================

fn handle_response(session: &mut SimpleSession, msg: &SipMessage) {
    let code = msg.code().unwrap_or(0);

    if code == 407 {
        if let Err(err) = handle_proxy_challenge(session, msg) {
            warn!(%err, "proxy authentication failed");
        }
        return;
    }

    let Some(trans) = session.transactions.take(msg) else {
        debug!(code, "response to unknown transaction");
        return;
    };

    if let Some(callback) = trans.on_response {
        if let Err(err) = callback(session, msg, &trans) {
            warn!(method = %trans.method, %err, "response callback failed");
        }
    }
}

/// 407: recompute `Proxy-Authorization` from the challenge and resend
/// the stored request, keeping its transaction alive. Capped at
/// [`PROXY_AUTH_CAP`] attempts per transaction, counted on the
/// transaction itself so responses to concurrent requests cannot mask
/// a proxy that keeps challenging this one.
fn handle_proxy_challenge(session: &mut SimpleSession, msg: &SipMessage) -> Result<()> {
    let Some(trans) = session.transactions.find(msg) else {
        return Err(Error::Protocol("407 for unknown transaction".into()));
    };
    if trans.proxy_attempts >= PROXY_AUTH_CAP {
        session.transactions.take(msg);
        session.pending.push(Pending::Fatal(Error::AuthFailed(
            "proxy rejected our credentials".into(),
        )));
        return Ok(());
    }

    let challenge = msg
        .header("Proxy-Authenticate")
        .ok_or_else(|| Error::Protocol("407 without Proxy-Authenticate".into()))?;
    let mut creds =
        DigestCredentials::from_challenge(challenge, &session.username, &session.password)?;

    let Some(trans) = session.transactions.find(msg) else {
        return Err(Error::Protocol("407 for unknown transaction".into()));
    };
    let mut request = SipMessage::parse(&trans.last_sent)
        .map_err(|_| Error::Protocol("unparseable stored request".into()))?;
    let target = request
        .target()
        .ok_or_else(|| Error::Protocol("stored transaction is not a request".into()))?
        .to_owned();
    let method = trans.method.clone();

    let authorization = creds.authorization(&session.username, &method, &target);
    request.remove_header("Proxy-Authorization");
    request.add_header("Proxy-Authorization", authorization);

    let bytes = Bytes::from(request.to_bytes());
    // Refresh the stored copy so a retransmit carries the credentials,
    // and charge the retry to this transaction.
    if let Some(trans) = session.transactions.find(msg) {
        trans.last_sent = bytes.clone();
        trans.proxy_attempts += 1;
    }
    session.proxy_creds = Some(creds);

    if session.output.push(bytes).is_err() {
        debug!("output gone, dropping proxy retry");
    }
    Ok(())
}

/// Renewal lands a jittered 550..600 seconds out, well before the
/// 900-second subscription lapses.
fn resubscribe_delay(rng: &mut impl Rng) -> Duration {
    Duration::from_secs(550 + rng.gen_range(0..50))
}

/// Extract the bare URI out of a `From`/`To` header value.
fn parse_from(header: &str) -> Option<String> {
    if let Some(start) = header.find('<') {
        let rest = &header[start + 1..];
        let end = rest.find('>')?;
        return Some(rest[..end].to_owned());
    }
    match header.find(';') {
        Some(pos) => Some(header[..pos].to_owned()),
        None => Some(header.to_owned()),
    }
}

/// Extract a `;tag=` parameter value.
fn find_tag(header: &str) -> Option<String> {
    let idx = header.find(";tag=")?;
    let rest = &header[idx + 5..];
    Some(rest.split(';').next().unwrap_or(rest).to_owned())
}

fn build_request_router() -> Router<SimpleSession, SipMessage> {
    let mut router = Router::new();
    router.add_handler("MESSAGE", handler_message);
    router.add_handler("NOTIFY", handler_notify);
    router.add_handler("SUBSCRIBE", handler_subscribe);
    router.set_fallback(handler_unknown_request);
    router
}

// ============================================================================
// Session task
// ============================================================================

async fn run(
    ctx: SessionContext,
    mut commands: mpsc::UnboundedReceiver<SessionCommand>,
    cancel: CancellationToken,
) {
    let SessionContext {
        account,
        secret,
        public_ip,
        ui,
        conversations,
        events,
    } = ctx;
    let account_id = account.id.clone();

    let mut conn = Connection::with_token(account.clone(), ui, cancel);
    let Some((user, server)) = account.split_username().map(|(u, s)| (u.to_owned(), s.to_owned()))
    else {
        let err = Error::InvalidSettings("SIP usernames take the form user@domain".into());
        conn.report_error(&err).await;
        let _ = events.send(SessionEvent::Disconnected {
            account: account_id,
            error: Some(err),
        });
        return;
    };

    conn.set_state(ConnectionState::Connecting).await;

    let udp = account.get_bool("udp", false);
    let port = account.get_int("port", DEFAULT_PORT as i64) as u16;
    let host = if account.get_bool("useproxy", false) {
        let proxy = account.get_string("proxy", "");
        if proxy.is_empty() { server.clone() } else { proxy }
    } else {
        server.clone()
    };

    let (write_errors_tx, mut write_errors) = mpsc::unbounded_channel();
    let (inbound_tx, mut inbound) = mpsc::unbounded_channel::<Result<SipMessage>>();

    // Bring the transport up. Both paths leave an `output` handle, a
    // writer task, a reader task feeding `inbound`, and the advertised
    // ip/port.
    let setup = async {
        if udp {
            let transport = DatagramTransport::bind(&host, port).await?;
            let listenport = transport.local_port;
            let ip = match &public_ip {
                Some(ip) => ip.clone(),
                None => local_ip_for(transport.peer).await.unwrap_or_else(|| "0.0.0.0".to_owned()),
            };
            let peer = transport.peer;
            let socket = Arc::new(transport.socket);

            let (output, writer) = QueuedOutput::spawn_datagram(
                Arc::clone(&socket),
                peer,
                conn.token(),
                write_errors_tx.clone(),
            );

            let reader_cancel = conn.token();
            let reader_tx = inbound_tx.clone();
            let reader = tokio::spawn(async move {
                let mut buf = vec![0u8; 65536];
                loop {
                    let received = tokio::select! {
                        _ = reader_cancel.cancelled() => break,
                        received = socket.recv_from(&mut buf) => received,
                    };
                    match received {
                        Ok((len, _from)) => match SipMessage::parse(&buf[..len]) {
                            Ok(msg) => {
                                if reader_tx.send(Ok(msg)).is_err() {
                                    break;
                                }
                            }
                            Err(err) => debug!(%err, "dropping unparseable datagram"),
                        },
                        Err(err) => {
                            let _ = reader_tx.send(Err(Error::network(err)));
                            break;
                        }
                    }
                }
            });
            Ok::<_, Error>((output, writer, reader, ip, listenport))
        } else {
            let opts = DialOptions::new(host.clone(), port).with_proxy(account.proxy.clone());
            let transport = StreamTransport::dial(&opts).await?;
            let local = transport.local_addr;
            let ip = match &public_ip {
                Some(ip) => ip.clone(),
                None => local
                    .map(|a| a.ip().to_string())
                    .unwrap_or_else(|| "0.0.0.0".to_owned()),
            };
            let listenport = local.map(|a| a.port()).unwrap_or(DEFAULT_PORT);

            let (output, writer) =
                QueuedOutput::spawn(transport.writer, conn.token(), write_errors_tx.clone());

            let reader_cancel = conn.token();
            let reader_tx = inbound_tx.clone();
            let mut frames = FramedRead::new(transport.reader, SipDecoder);
            let reader = tokio::spawn(async move {
                loop {
                    let frame = tokio::select! {
                        _ = reader_cancel.cancelled() => break,
                        frame = frames.next() => frame,
                    };
                    match frame {
                        Some(item) => {
                            if reader_tx.send(item).is_err() {
                                break;
                            }
                        }
                        None => {
                            let _ = reader_tx
                                .send(Err(Error::Network("server closed the connection".into())));
                            break;
                        }
                    }
                }
            });
            Ok((output, writer, reader, ip, listenport))
        }
    };

    let cancel_token = conn.token();
    let setup = tokio::select! {
        _ = cancel_token.cancelled() => Err(Error::Cancelled),
        setup = setup => setup,
    };
    let (output, writer_task, reader_task, ip, listenport) = match setup {
        Ok(parts) => parts,
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
    drop(inbound_tx);
    info!(%host, udp, %ip, listenport, "SIP transport up");
    conn.set_state(ConnectionState::Authenticating).await;

    let mut session = SimpleSession {
        conn,
        output,
        username: user,
        servername: server,
        password: secret.unwrap_or_default(),
        udp,
        ip,
        listenport,
        status: "available".to_owned(),
        register_status: RegisterStatus::Unregistered,
        auth_retried: false,
        registrar: None,
        proxy_creds: None,
        transactions: TransactionTable::new(),
        buddies: BuddyTable::default(),
        watchers: WatcherTable::default(),
        reregister_at: tokio::time::Instant::now() + Duration::from_secs(600),
        republish_at: None,
        publish_disabled: false,
        rng: StdRng::from_entropy(),
        pending: Vec::new(),
    };
    let router = build_request_router();

    session.do_register();

    // Housekeeping tick with a little jitter so a fleet of clients does
    // not renew in lockstep.
    let jitter = Duration::from_millis(session.rng.gen_range(0..100));
    let mut tick = tokio::time::interval(TICK_INTERVAL + jitter);
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut sweep = tokio::time::interval(SWEEP_INTERVAL);
    sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut keepalive = tokio::time::interval_at(
        tokio::time::Instant::now() + KEEPALIVE_INTERVAL,
        KEEPALIVE_INTERVAL,
    );
    keepalive.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

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
                        graceful = true;
                        break;
                    }
                }
            }
            item = inbound.recv() => {
                match item {
                    Some(Ok(msg)) => {
                        if msg.code().is_none() {
                            let method = msg.method().unwrap_or_default().to_owned();
                            router.dispatch(&mut session, &method, &msg);
                        } else {
                            handle_response(&mut session, &msg);
                        }
                        if drain_pending(&mut session, &conversations, &events).await {
                            close_error = session_fatal_error(&mut session);
                            break;
                        }
                    }
                    Some(Err(err)) => {
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
                        let err = Error::Network("transport reader stopped".into());
                        session.conn.report_error(&err).await;
                        close_error = Some(err);
                        break;
                    }
                }
            }
            _ = tick.tick() => {
                session.on_tick();
                if drain_pending(&mut session, &conversations, &events).await {
                    close_error = session_fatal_error(&mut session);
                    break;
                }
            }
            _ = sweep.tick() => {
                let outcome = session.transactions.sweep(session.udp);
                for bytes in outcome.resend {
                    debug!("retransmitting request");
                    let _ = session.output.push(bytes);
                }
                for trans in outcome.timed_out {
                    let err = trans.timeout_error();
                    session.conn.report_error(&err).await;
                }
            }
            _ = keepalive.tick() => {
                if session.udp {
                    debug!("sending keep alive");
                    let _ = session.output.push(Bytes::from_static(&[0]));
                }
            }
        }
    }

    session.conn.set_state(ConnectionState::Disconnecting).await;
    if graceful && !session.conn.is_cancelled() {
        // Unregister with Expires: 0, best effort, no waiting.
        session.send_register(0);
    }
    session.transactions.clear();
    session.conn.set_state(ConnectionState::Disconnected).await;

    let cancel_token = session.conn.token();
    drop(session);
    // Bounded drain: a stalled peer must not wedge teardown.
    let _ = tokio::time::timeout(Duration::from_secs(5), writer_task).await;
    cancel_token.cancel();
    let _ = reader_task.await;

    let _ = events.send(SessionEvent::Disconnected {
        account: account_id,
        error: close_error,
    });
}

/// Pull the fatal error recorded by `drain_pending`, if any.
fn session_fatal_error(session: &mut SimpleSession) -> Option<Error> {
    match session.pending.drain(..).next() {
        Some(Pending::Fatal(err)) => Some(err),
        _ => None,
    }
}

/// Apply queued async work. Returns `true` when a fatal error was hit;
/// the error is left at the front of the queue for the caller.
async fn drain_pending(
    session: &mut SimpleSession,
    conversations: &Arc<crate::conversation::ConversationRegistry>,
    events: &mpsc::UnboundedSender<SessionEvent>,
) -> bool {
    let pending = std::mem::take(&mut session.pending);
    for item in pending {
        match item {
            Pending::Deliver { peer, message } => {
                let conv = conversations
                    .find_or_create(session.conn.account().id.clone(), &peer, ConversationKind::Im)
                    .await;
                conversations.write_message(&conv, message).await;
            }
            Pending::Presence { peer, available } => {
                if !session.conn.is_cancelled() {
                    session
                        .conn
                        .ui()
                        .on_presence(&session.conn.account().id, &peer, available)
                        .await;
                }
            }
            Pending::Typing { peer, active } => {
                if !session.conn.is_cancelled() {
                    session
                        .conn
                        .ui()
                        .on_typing(&session.conn.account().id, &peer, active)
                        .await;
                }
            }
            Pending::Registered => {
                session.conn.set_state(ConnectionState::Connected).await;
                let _ = events.send(SessionEvent::Connected(session.conn.account().id.clone()));
            }
            Pending::Fatal(err) => {
                session.conn.report_error(&err).await;
                session.pending.insert(0, Pending::Fatal(err));
                return true;
            }
        }
    }
    false
}

async fn handle_command(
    session: &mut SimpleSession,
    conversations: &Arc<crate::conversation::ConversationRegistry>,
    command: SessionCommand,
) {
    match command {
        SessionCommand::SendIm { peer, body } => {
            session.send_message(&peer, &body, None);
            let conv = conversations
                .find_or_create(session.conn.account().id.clone(), &peer, ConversationKind::Im)
                .await;
            let msg = Message::outgoing(session.aor(), body);
            conversations.write_message(&conv, msg).await;
        }
        SessionCommand::SendTyping { peer, typing } => {
            let body = gen_iscomposing(typing);
            session.send_message(&peer, &body, Some("application/im-iscomposing+xml"));
        }
        SessionCommand::SetStatus { status } => {
            session.status = if status == "available" {
                "available".to_owned()
            } else {
                "busy".to_owned()
            };
            session.publish_disabled = false;
            session.do_notifies();
        }
        SessionCommand::AddBuddy { name } => {
            if !name.starts_with("sip:") {
                let err = Error::InvalidSettings(format!(
                    "cannot add {name}: SIMPLE buddies must start with 'sip:'"
                ));
                session.conn.report_error(&err).await;
                return;
            }
            debug!(buddy = %name, "adding buddy");
            session.buddies.add(&name);
        }
        SessionCommand::RemoveBuddy { name } => {
            session.buddies.remove(&name);
        }
    }
}

/// Local address the OS would use to reach `peer`.
async fn local_ip_for(peer: std::net::SocketAddr) -> Option<String> {
    let socket = UdpSocket::bind(("0.0.0.0", 0)).await.ok()?;
    socket.connect(peer).await.ok()?;
    Some(socket.local_addr().ok()?.ip().to_string())
}
