//! Per-connection message routing and in-flight transaction tracking.
//!
//! A [`Router`] maps a command verb to a handler plus a fallback for
//! everything unhandled. A handler failure is logged and dropped; one
//! bad frame never takes the connection down.
//!
//! The [`TransactionTable`] tracks outbound requests that expect a
//! response, keyed by their `CSeq`, in insertion order. A periodic
//! sweep retransmits once over datagram transports and times out
//! abandoned requests.

use std::collections::HashMap;
use std::time::Duration;

use bytes::Bytes;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::codec::SipMessage;
use crate::error::{Error, Result};

/// A routed message handler. Plain function pointers keep the dispatch
/// table copyable and the borrow story simple: the connection is passed
/// in, never captured.
pub type Handler<C, M> = fn(&mut C, &M) -> Result<()>;

/// Dispatch table from command verb to handler.
pub struct Router<C, M> {
    handlers: HashMap<String, Handler<C, M>>,
    fallback: Handler<C, M>,
}

impl<C, M> Router<C, M> {
    /// A router whose fallback silently drops messages.
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
            fallback: |_, _| Ok(()),
        }
    }

    /// Register a handler for a verb, replacing any existing one.
    pub fn add_handler(&mut self, verb: impl Into<String>, handler: Handler<C, M>) {
        self.handlers.insert(verb.into(), handler);
    }

    /// Replace the fallback handler.
    pub fn set_fallback(&mut self, handler: Handler<C, M>) {
        self.fallback = handler;
    }

    /// Whether a verb has a dedicated handler.
    pub fn handles(&self, verb: &str) -> bool {
        self.handlers.contains_key(verb)
    }

    /// Dispatch one message. Handler errors are logged and swallowed;
    /// the connection keeps running.
    pub fn dispatch(&self, ctx: &mut C, verb: &str, msg: &M) {
        let handler = self.handlers.get(verb).unwrap_or(&self.fallback);
        if let Err(err) = handler(ctx, msg) {
            warn!(verb, %err, "handler failed, dropping message");
        }
    }
}

impl<C, M> Default for Router<C, M> {
    fn default() -> Self {
        Self::new()
    }
}

/// Age at which an unanswered request is retransmitted (datagram only).
const RETRANSMIT_AFTER: Duration = Duration::from_secs(2);

/// Age at which an unanswered, already-retransmitted request times out.
const TIMEOUT_AFTER: Duration = Duration::from_secs(5);

/// Interval between transaction sweeps.
pub const SWEEP_INTERVAL: Duration = Duration::from_millis(2500);

/// Invoked with the final response and the transaction it closes; the
/// transaction's `last_sent` still holds the original request.
pub type ResponseHandler<C> = fn(&mut C, &SipMessage, &Transaction<C>) -> Result<()>;

/// An outbound request awaiting its response.
pub struct Transaction<C> {
    /// Sequence number assigned at send time.
    pub cseq: u32,
    /// Request method.
    pub method: String,
    /// The `CSeq` header value responses will echo.
    pub cseq_header: String,
    /// Serialized request, kept for retransmission.
    pub last_sent: Bytes,
    /// When the request (or its retransmission) went out.
    pub sent_at: Instant,
    /// Retransmissions so far.
    pub retries: u32,
    /// Proxy-authentication retries answered for this request. Scoped
    /// here so challenges against one request cannot be masked by
    /// successful responses to concurrent transactions.
    pub proxy_attempts: u32,
    /// Invoked at most once, on the final response.
    pub on_response: Option<ResponseHandler<C>>,
}

/// What a sweep decided to do.
pub struct SweepOutcome<C> {
    /// Buffers to put back on the wire (datagram transports only).
    pub resend: Vec<Bytes>,
    /// Transactions that timed out; their issuers get [`Error::Timeout`].
    pub timed_out: Vec<Transaction<C>>,
}

/// Insertion-ordered table of in-flight transactions.
///
/// The table is small and walked linearly; entries keep stable order
/// so responses and NOTIFYs fire in the order requests were issued.
pub struct TransactionTable<C> {
    entries: Vec<Transaction<C>>,
    next_cseq: u32,
}

impl<C> TransactionTable<C> {
    /// An empty table starting at CSeq 1.
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
            next_cseq: 1,
        }
    }

    /// Allocate the next sequence number.
    pub fn next_cseq(&mut self) -> u32 {
        let cseq = self.next_cseq;
        self.next_cseq += 1;
        cseq
    }

    /// Track a sent request.
    pub fn add(
        &mut self,
        cseq: u32,
        method: impl Into<String>,
        last_sent: Bytes,
        on_response: Option<ResponseHandler<C>>,
    ) {
        let method = method.into();
        self.entries.push(Transaction {
            cseq,
            cseq_header: format!("{cseq} {method}"),
            method,
            last_sent,
            sent_at: Instant::now(),
            retries: 0,
            proxy_attempts: 0,
            on_response,
        });
    }

    /// Number of in-flight transactions.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the table is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Find the transaction a response belongs to by its `CSeq` header,
    /// without removing it.
    pub fn find(&mut self, response: &SipMessage) -> Option<&mut Transaction<C>> {
        let cseq = response.header("CSeq")?;
        self.entries.iter_mut().find(|t| t.cseq_header == cseq)
    }

    /// Remove and return the transaction a final response belongs to.
    pub fn take(&mut self, response: &SipMessage) -> Option<Transaction<C>> {
        let cseq = response.header("CSeq")?;
        let pos = self.entries.iter().position(|t| t.cseq_header == cseq)?;
        Some(self.entries.remove(pos))
    }

    /// Drop every transaction (connection teardown).
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Walk the table: retransmit what has been quiet for
    /// [`RETRANSMIT_AFTER`], time out what stayed quiet past
    /// [`TIMEOUT_AFTER`]. `datagram` gates actual retransmission; the
    /// age bookkeeping runs either way.
    pub fn sweep(&mut self, datagram: bool) -> SweepOutcome<C> {
        let now = Instant::now();
        let mut outcome = SweepOutcome {
            resend: Vec::new(),
            timed_out: Vec::new(),
        };

        let mut index = 0;
        while index < self.entries.len() {
            let age = now.duration_since(self.entries[index].sent_at);
            let entry = &mut self.entries[index];
            debug!(method = %entry.method, cseq = entry.cseq, ?age, "open transaction");

            if age > TIMEOUT_AFTER && entry.retries >= 1 {
                outcome.timed_out.push(self.entries.remove(index));
                continue;
            }
            if age > RETRANSMIT_AFTER && entry.retries == 0 {
                entry.retries += 1;
                if datagram {
                    outcome.resend.push(entry.last_sent.clone());
                }
            }
            index += 1;
        }

        outcome
    }
}

impl<C> Default for TransactionTable<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C> Transaction<C> {
    /// The timeout error reported for this transaction.
    pub fn timeout_error(&self) -> Error {
        Error::Timeout {
            method: self.method.clone(),
            cseq: self.cseq,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Ctx {
        seen: Vec<String>,
    }

    type Msg = Vec<String>;

    fn record(ctx: &mut Ctx, msg: &Msg) -> Result<()> {
        ctx.seen.push(msg.join(" "));
        Ok(())
    }

    fn explode(_ctx: &mut Ctx, _msg: &Msg) -> Result<()> {
        Err(Error::Protocol("boom".into()))
    }

    #[test]
    fn test_dispatch_prefers_exact_handler() {
        let mut router: Router<Ctx, Msg> = Router::new();
        router.add_handler("PING", record);
        router.set_fallback(|ctx, _| {
            ctx.seen.push("fallback".into());
            Ok(())
        });

        let mut ctx = Ctx { seen: Vec::new() };
        router.dispatch(&mut ctx, "PING", &vec!["x".into()]);
        router.dispatch(&mut ctx, "WHATEVER", &vec![]);
        assert_eq!(ctx.seen, vec!["x", "fallback"]);
    }

    #[test]
    fn test_handler_error_does_not_propagate() {
        let mut router: Router<Ctx, Msg> = Router::new();
        router.add_handler("BAD", explode);
        let mut ctx = Ctx { seen: Vec::new() };
        // No panic, no error: the message is just dropped.
        router.dispatch(&mut ctx, "BAD", &vec![]);
        assert!(ctx.seen.is_empty());
    }

    fn response_with_cseq(cseq: &str) -> SipMessage {
        let mut msg = SipMessage::response(200, "OK");
        msg.add_header("CSeq", cseq);
        msg
    }

    #[tokio::test]
    async fn test_take_matches_cseq() {
        let mut table: TransactionTable<Ctx> = TransactionTable::new();
        let cseq = table.next_cseq();
        table.add(cseq, "REGISTER", Bytes::from_static(b"..."), None);

        assert!(table.take(&response_with_cseq("9 REGISTER")).is_none());
        let t = table.take(&response_with_cseq("1 REGISTER")).unwrap();
        assert_eq!(t.method, "REGISTER");
        assert!(table.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_retransmits_once_then_times_out() {
        let mut table: TransactionTable<Ctx> = TransactionTable::new();
        let cseq = table.next_cseq();
        table.add(cseq, "MESSAGE", Bytes::from_static(b"req"), None);

        // Young transaction: nothing happens.
        let outcome = table.sweep(true);
        assert!(outcome.resend.is_empty() && outcome.timed_out.is_empty());

        // Past the retransmit age: exactly one resend of the same bytes.
        tokio::time::advance(Duration::from_millis(2100)).await;
        let outcome = table.sweep(true);
        assert_eq!(outcome.resend.len(), 1);
        assert_eq!(&outcome.resend[0][..], b"req");

        // Still no response: next sweep times the transaction out.
        tokio::time::advance(Duration::from_millis(3000)).await;
        let outcome = table.sweep(true);
        assert!(outcome.resend.is_empty());
        assert_eq!(outcome.timed_out.len(), 1);
        let err = outcome.timed_out[0].timeout_error();
        assert!(matches!(err, Error::Timeout { cseq: 1, .. }));
        assert!(table.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_stream_transport_never_resends() {
        let mut table: TransactionTable<Ctx> = TransactionTable::new();
        let cseq = table.next_cseq();
        table.add(cseq, "REGISTER", Bytes::from_static(b"req"), None);

        tokio::time::advance(Duration::from_millis(2100)).await;
        let outcome = table.sweep(false);
        assert!(outcome.resend.is_empty());

        tokio::time::advance(Duration::from_millis(3000)).await;
        let outcome = table.sweep(false);
        assert_eq!(outcome.timed_out.len(), 1);
    }
}
