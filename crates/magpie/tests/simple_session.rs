//! End-to-end SIP/SIMPLE tests against a scripted registrar on
//! loopback UDP.

mod common;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use common::{RecordingUi, wait_for};
use magpie::account::{Account, AccountId, SettingValue};
use magpie::codec::digest::{digest_ha1, digest_ha2, digest_response};
use magpie::codec::{SipMessage, StartLine};
use magpie::conversation::{ConversationKind, ConversationRegistry};
use magpie::protocol::{ProtocolFactory, SessionContext, SessionEvent, SessionHandle};
use magpie::simple::SimpleFactory;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;

struct Harness {
    ui: Arc<RecordingUi>,
    conversations: Arc<ConversationRegistry>,
    events: mpsc::UnboundedReceiver<SessionEvent>,
    handle: SessionHandle,
    account: AccountId,
    server: UdpSocket,
    client_addr: Option<SocketAddr>,
}

impl Harness {
    async fn start() -> Self {
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let port = server.local_addr().unwrap().port();

        let ui = RecordingUi::new();
        let conversations = Arc::new(ConversationRegistry::new(ui.clone()));
        let (events_tx, events) = mpsc::unbounded_channel();

        let id = AccountId::new("alice@127.0.0.1", "simple");
        let mut account = Account::new(id.clone());
        account.set("udp", SettingValue::Bool(true));
        account.set("port", SettingValue::Int(port as i64));

        let handle = SimpleFactory.spawn_session(SessionContext {
            account,
            secret: Some("secret".into()),
            public_ip: None,
            ui: ui.clone(),
            conversations: Arc::clone(&conversations),
            events: events_tx,
        });

        Self {
            ui,
            conversations,
            events,
            handle,
            account: id,
            server,
            client_addr: None,
        }
    }

    /// Receive one SIP message, remembering the client's address.
    async fn recv(&mut self) -> SipMessage {
        let mut buf = vec![0u8; 65536];
        loop {
            let (len, from) = self.server.recv_from(&mut buf).await.unwrap();
            self.client_addr = Some(from);
            // Skip UDP keep-alive noise.
            if buf[..len].iter().all(|b| *b == 0) {
                continue;
            }
            return SipMessage::parse(&buf[..len]).unwrap();
        }
    }

    async fn send(&mut self, msg: &SipMessage) {
        let addr = self.client_addr.expect("client address learned");
        self.server.send_to(&msg.to_bytes(), addr).await.unwrap();
    }

    /// A response echoing the request's `CSeq` so the client can match
    /// its transaction.
    fn response_to(req: &SipMessage, code: u16, reason: &str) -> SipMessage {
        let mut resp = SipMessage::response(code, reason);
        resp.add_header("CSeq", req.header("CSeq").unwrap().to_owned());
        resp.set_body(&b""[..]);
        resp
    }

    /// Drive the 401 digest dance to a completed registration.
    async fn register(&mut self) {
        let first = self.recv().await;
        assert_eq!(first.method(), Some("REGISTER"));
        assert_eq!(first.target(), Some("sip:127.0.0.1"));
        assert!(first.header("Authorization").is_none());
        assert!(first.header("Contact").is_some());

        let mut challenge = Self::response_to(&first, 401, "Unauthorized");
        challenge.add_header(
            "WWW-Authenticate",
            "Digest realm=\"ex\", nonce=\"n1\"".to_owned(),
        );
        self.send(&challenge).await;

        let second = self.recv().await;
        assert_eq!(second.method(), Some("REGISTER"));
        let auth = second.header("Authorization").expect("Authorization header");
        assert!(auth.contains("nc=\"00000001\""), "auth was: {auth}");
        assert!(auth.contains("username=\"alice\""));
        assert!(auth.contains("realm=\"ex\""));

        let ha1 = digest_ha1("alice", "ex", "secret");
        let ha2 = digest_ha2("REGISTER", "sip:127.0.0.1");
        let expected = digest_response(&ha1, "n1", "00000001", "", "", &ha2);
        assert!(
            auth.contains(&format!("response=\"{expected}\"")),
            "auth was: {auth}"
        );

        let mut ok = Self::response_to(&second, 200, "OK");
        ok.add_header("Expires", "900".to_owned());
        self.send(&ok).await;

        match self.events.recv().await {
            Some(SessionEvent::Connected(id)) => assert_eq!(id, self.account),
            other => panic!("expected Connected, got {other:?}"),
        }

        // Registration kicks off the first PUBLISH of our presence.
        let publish = self.recv().await;
        assert_eq!(publish.method(), Some("PUBLISH"));
        let body = String::from_utf8_lossy(&publish.body);
        assert!(body.contains("<basic>open</basic>"), "body was: {body}");
        let ok = Self::response_to(&publish, 200, "OK");
        self.send(&ok).await;
    }
}

/// Receive one non-keep-alive datagram as raw bytes.
async fn recv_raw(server: &UdpSocket, buf: &mut Vec<u8>) -> (Vec<u8>, SocketAddr) {
    loop {
        let (len, from) = server.recv_from(buf).await.unwrap();
        if buf[..len].iter().all(|b| *b == 0) {
            continue;
        }
        return (buf[..len].to_vec(), from);
    }
}

#[tokio::test]
async fn test_register_digest_dance_then_publish() {
    tokio::time::timeout(Duration::from_secs(15), async {
        let mut h = Harness::start().await;
        h.register().await;
    })
    .await
    .unwrap();
}

#[tokio::test]
async fn test_udp_register_retransmits_once() {
    tokio::time::timeout(Duration::from_secs(15), async {
        let mut h = Harness::start().await;

        let mut buf = vec![0u8; 65536];
        let (first, from) = recv_raw(&h.server, &mut buf).await;

        // Say nothing; the sweeper retransmits the same bytes once.
        let (second, from2) = recv_raw(&h.server, &mut buf).await;
        assert_eq!(from, from2);
        assert_eq!(first, second);
    })
    .await
    .unwrap();
}

#[tokio::test]
async fn test_inbound_subscribe_gets_200_and_notify() {
    tokio::time::timeout(Duration::from_secs(15), async {
        let mut h = Harness::start().await;
        h.register().await;

        let mut subscribe = SipMessage::request("SUBSCRIBE", "sip:alice@127.0.0.1");
        subscribe
            .add_header("Via", "SIP/2.0/UDP 127.0.0.1:5099;branch=z9hG4bKw1")
            .add_header("From", "<sip:watcher@ex>;tag=w1")
            .add_header("To", "<sip:alice@127.0.0.1>")
            .add_header("Call-ID", "c1")
            .add_header("CSeq", "1 SUBSCRIBE")
            .add_header("Expires", "120")
            .add_header("Event", "presence")
            .set_body(&b""[..]);
        h.send(&subscribe).await;

        // First the 200 echoing our headers with a To tag added.
        let ok = h.recv().await;
        match &ok.start {
            StartLine::Response { code: 200, .. } => {}
            other => panic!("expected 200, got {other:?}"),
        }
        assert!(ok.header("To").unwrap().contains(";tag="));
        assert_eq!(ok.header("Call-ID"), Some("c1"));

        // Then the NOTIFY carrying our PIDF, inside the same dialog.
        let notify = h.recv().await;
        assert_eq!(notify.method(), Some("NOTIFY"));
        assert_eq!(notify.target(), Some("sip:watcher@ex"));
        assert_eq!(notify.header("Call-ID"), Some("c1"));
        assert_eq!(notify.header("Event"), Some("presence"));
        let body = String::from_utf8_lossy(&notify.body);
        assert!(body.contains("<basic>open</basic>"));
    })
    .await
    .unwrap();
}

#[tokio::test]
async fn test_inbound_message_delivery_and_typing() {
    tokio::time::timeout(Duration::from_secs(15), async {
        let mut h = Harness::start().await;
        h.register().await;

        let mut message = SipMessage::request("MESSAGE", "sip:alice@127.0.0.1");
        message
            .add_header("From", "<sip:carol@ex>;tag=c9")
            .add_header("To", "<sip:alice@127.0.0.1>")
            .add_header("Call-ID", "m1")
            .add_header("CSeq", "1 MESSAGE")
            .add_header("Content-Type", "text/plain")
            .set_body(&b"hi alice"[..]);
        h.send(&message).await;

        let ok = h.recv().await;
        assert_eq!(ok.code(), Some(200));

        wait_for(5, || !h.ui.messages_for("sip:carol@ex").is_empty()).await;
        let conv = h
            .conversations
            .find(&h.account, "sip:carol@ex", ConversationKind::Im)
            .expect("conversation for carol");
        assert_eq!(conv.messages()[0].body, "hi alice");

        // Unsupported payloads are answered 415.
        let mut odd = SipMessage::request("MESSAGE", "sip:alice@127.0.0.1");
        odd.add_header("From", "<sip:carol@ex>;tag=c9")
            .add_header("CSeq", "2 MESSAGE")
            .add_header("Content-Type", "application/octet-stream")
            .set_body(&b"\x00\x01"[..]);
        h.send(&odd).await;
        let rejected = h.recv().await;
        assert_eq!(rejected.code(), Some(415));

        // Typing notifications reach the UI.
        let mut typing = SipMessage::request("MESSAGE", "sip:alice@127.0.0.1");
        typing
            .add_header("From", "<sip:carol@ex>;tag=c9")
            .add_header("CSeq", "3 MESSAGE")
            .add_header("Content-Type", "application/im-iscomposing+xml")
            .set_body(
                "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\
                 <isComposing xmlns='urn:ietf:params:xml:ns:im-iscomposing'>\
                 <state>active</state></isComposing>"
                    .as_bytes(),
            );
        h.send(&typing).await;
        let ok = h.recv().await;
        assert_eq!(ok.code(), Some(200));
        wait_for(5, || !h.ui.typing.lock().unwrap().is_empty()).await;
        assert_eq!(
            h.ui.typing.lock().unwrap()[0],
            ("sip:carol@ex".to_owned(), true)
        );
    })
    .await
    .unwrap();
}

#[tokio::test]
async fn test_unknown_request_answered_501() {
    tokio::time::timeout(Duration::from_secs(15), async {
        let mut h = Harness::start().await;
        h.register().await;

        let mut invite = SipMessage::request("INVITE", "sip:alice@127.0.0.1");
        invite
            .add_header("From", "<sip:carol@ex>;tag=c9")
            .add_header("CSeq", "1 INVITE")
            .set_body(&b""[..]);
        h.send(&invite).await;

        let rejected = h.recv().await;
        assert_eq!(rejected.code(), Some(501));
    })
    .await
    .unwrap();
}

#[tokio::test]
async fn test_inbound_notify_updates_presence() {
    tokio::time::timeout(Duration::from_secs(15), async {
        let mut h = Harness::start().await;
        h.register().await;

        let mut notify = SipMessage::request("NOTIFY", "sip:alice@127.0.0.1");
        notify
            .add_header("From", "<sip:bob@ex>;tag=b1")
            .add_header("CSeq", "1 NOTIFY")
            .add_header("Content-Type", "application/pidf+xml")
            .set_body(
                "<presence><tuple id='t'><status><basic>open</basic></status></tuple></presence>"
                    .as_bytes(),
            );
        h.send(&notify).await;

        let ok = h.recv().await;
        assert_eq!(ok.code(), Some(200));

        wait_for(5, || !h.ui.presence.lock().unwrap().is_empty()).await;
        assert_eq!(
            h.ui.presence.lock().unwrap()[0],
            ("sip:bob@ex".to_owned(), true)
        );
    })
    .await
    .unwrap();
}

#[tokio::test]
async fn test_second_401_is_fatal_auth_failure() {
    tokio::time::timeout(Duration::from_secs(15), async {
        let mut h = Harness::start().await;

        let first = h.recv().await;
        let mut challenge = Harness::response_to(&first, 401, "Unauthorized");
        challenge.add_header(
            "WWW-Authenticate",
            "Digest realm=\"ex\", nonce=\"n1\"".to_owned(),
        );
        h.send(&challenge).await;

        let second = h.recv().await;
        assert!(second.header("Authorization").is_some());
        let mut challenge = Harness::response_to(&second, 401, "Unauthorized");
        challenge.add_header(
            "WWW-Authenticate",
            "Digest realm=\"ex\", nonce=\"n2\"".to_owned(),
        );
        h.send(&challenge).await;

        loop {
            match h.events.recv().await {
                Some(SessionEvent::Disconnected {
                    error: Some(err), ..
                }) => {
                    assert!(err.is_fatal(), "expected fatal error, got {err}");
                    break;
                }
                Some(SessionEvent::Connected(_)) => panic!("should not connect"),
                Some(SessionEvent::Disconnected { error: None, .. }) => {
                    panic!("expected an error")
                }
                None => panic!("events channel closed early"),
            }
        }
    })
    .await
    .unwrap();
}

#[tokio::test]
async fn test_proxy_challenge_cap_is_per_transaction() {
    tokio::time::timeout(Duration::from_secs(15), async {
        let mut h = Harness::start().await;

        // Register without any challenge so a PUBLISH follows.
        let register = h.recv().await;
        assert_eq!(register.method(), Some("REGISTER"));
        let ok = Harness::response_to(&register, 200, "OK");
        h.send(&ok).await;
        match h.events.recv().await {
            Some(SessionEvent::Connected(_)) => {}
            other => panic!("expected Connected, got {other:?}"),
        }
        let publish = h.recv().await;
        assert_eq!(publish.method(), Some("PUBLISH"));
        let publish_cseq = publish.header("CSeq").unwrap().to_owned();

        let challenge = |cseq: &str| {
            let mut resp = SipMessage::response(407, "Proxy Authentication Required");
            resp.add_header("CSeq", cseq.to_owned());
            resp.add_header(
                "Proxy-Authenticate",
                "Digest realm=\"ex\", nonce=\"p1\"".to_owned(),
            );
            resp.set_body(&b""[..]);
            resp
        };

        // Challenge the PUBLISH four times; each retry carries fresh
        // proxy credentials.
        for round in 1..=4 {
            h.send(&challenge(&publish_cseq)).await;
            let retried = h.recv().await;
            assert_eq!(retried.method(), Some("PUBLISH"), "round {round}");
            assert_eq!(retried.header("CSeq"), Some(publish_cseq.as_str()));
            assert!(retried.header("Proxy-Authorization").is_some());

            // A concurrent transaction answered 200 must not reset the
            // challenge count for the PUBLISH.
            if round == 1 {
                h.handle.send(magpie::protocol::SessionCommand::SendIm {
                    peer: "sip:bob@ex".into(),
                    body: "hi".into(),
                });
                let message = h.recv().await;
                assert_eq!(message.method(), Some("MESSAGE"));
                let ok = Harness::response_to(&message, 200, "OK");
                h.send(&ok).await;
            }
        }

        // The fifth challenge exceeds the cap: no more retries, the
        // account fails authentication.
        h.send(&challenge(&publish_cseq)).await;
        match h.events.recv().await {
            Some(SessionEvent::Disconnected {
                error: Some(err), ..
            }) => {
                assert!(err.is_fatal(), "expected fatal error, got {err}");
            }
            other => panic!("expected fatal Disconnected, got {other:?}"),
        }
    })
    .await
    .unwrap();
}

#[tokio::test]
async fn test_graceful_close_unregisters() {
    tokio::time::timeout(Duration::from_secs(15), async {
        let mut h = Harness::start().await;
        h.register().await;

        let Harness {
            handle,
            mut events,
            server,
            client_addr,
            ..
        } = h;
        let task = handle.close();

        // The goodbye REGISTER carries a zero expiry.
        let mut buf = vec![0u8; 65536];
        let unregister = loop {
            let (len, from) = server.recv_from(&mut buf).await.unwrap();
            assert_eq!(Some(from), client_addr);
            if buf[..len].iter().all(|b| *b == 0) {
                continue;
            }
            break SipMessage::parse(&buf[..len]).unwrap();
        };
        assert_eq!(unregister.method(), Some("REGISTER"));
        assert_eq!(unregister.header("Expires"), Some("0"));

        task.await.unwrap();
        match events.recv().await {
            Some(SessionEvent::Disconnected { error: None, .. }) => {}
            other => panic!("expected clean Disconnected, got {other:?}"),
        }
    })
    .await
    .unwrap();
}
