//! SIP message parsing and serialization.
//!
//! A request line is `METHOD SP target SP SIP/2.0`; a status line is
//! `SIP/2.0 SP code SP reason`. Headers follow one per line until a
//! blank line; the body is exactly `Content-Length` bytes. Header order
//! is preserved on both paths, so a parsed message serializes back with
//! its headers in the original positions.

use bytes::{Buf, BytesMut};
use tokio_util::codec::Decoder;
use winnow::ascii::digit1;
use winnow::prelude::*;
use winnow::token::{rest, take_till};

use super::PResult;
use crate::error::Error;

const SIP_VERSION: &str = "SIP/2.0";

/// Maximum accepted header-section length before the decoder gives up.
const MAX_HEADER_LEN: usize = 64 * 1024;

/// First line of a SIP message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartLine {
    /// `METHOD target SIP/2.0`
    Request {
        /// Request method (REGISTER, MESSAGE, SUBSCRIBE, ...).
        method: String,
        /// Request target URI.
        target: String,
    },
    /// `SIP/2.0 code reason`
    Response {
        /// Numeric status code.
        code: u16,
        /// Reason phrase, verbatim.
        reason: String,
    },
}

/// A parsed or constructed SIP message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SipMessage {
    /// Request or status line.
    pub start: StartLine,
    /// Headers as an ordered multimap.
    pub headers: Vec<(String, String)>,
    /// Message body.
    pub body: Vec<u8>,
}

impl SipMessage {
    /// Create a request with an empty header set and body.
    pub fn request(method: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            start: StartLine::Request {
                method: method.into(),
                target: target.into(),
            },
            headers: Vec::new(),
            body: Vec::new(),
        }
    }

    /// Create a response with an empty header set and body.
    pub fn response(code: u16, reason: impl Into<String>) -> Self {
        Self {
            start: StartLine::Response {
                code,
                reason: reason.into(),
            },
            headers: Vec::new(),
            body: Vec::new(),
        }
    }

    /// The request method, if this is a request.
    pub fn method(&self) -> Option<&str> {
        match &self.start {
            StartLine::Request { method, .. } => Some(method),
            StartLine::Response { .. } => None,
        }
    }

    /// The request target, if this is a request.
    pub fn target(&self) -> Option<&str> {
        match &self.start {
            StartLine::Request { target, .. } => Some(target),
            StartLine::Response { .. } => None,
        }
    }

    /// The status code, if this is a response.
    pub fn code(&self) -> Option<u16> {
        match &self.start {
            StartLine::Request { .. } => None,
            StartLine::Response { code, .. } => Some(*code),
        }
    }

    /// First value of a header, matched case-insensitively.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Append a header, preserving insertion order.
    pub fn add_header(&mut self, name: impl Into<String>, value: impl Into<String>) -> &mut Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Remove every header with this name.
    pub fn remove_header(&mut self, name: &str) {
        self.headers.retain(|(n, _)| !n.eq_ignore_ascii_case(name));
    }

    /// Replace the body and update `Content-Length` to match.
    pub fn set_body(&mut self, body: impl Into<Vec<u8>>) -> &mut Self {
        self.body = body.into();
        self.remove_header("Content-Length");
        self.add_header("Content-Length", self.body.len().to_string());
        self
    }

    /// The declared body length, defaulting to zero.
    pub fn content_length(&self) -> usize {
        self.header("Content-Length")
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(0)
    }

    /// Serialize start line, headers, blank line, and body.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(256 + self.body.len());
        match &self.start {
            StartLine::Request { method, target } => {
                out.extend_from_slice(method.as_bytes());
                out.push(b' ');
                out.extend_from_slice(target.as_bytes());
                out.push(b' ');
                out.extend_from_slice(SIP_VERSION.as_bytes());
            }
            StartLine::Response { code, reason } => {
                out.extend_from_slice(SIP_VERSION.as_bytes());
                out.extend_from_slice(format!(" {code} {reason}").as_bytes());
            }
        }
        out.extend_from_slice(b"\r\n");
        for (name, value) in &self.headers {
            out.extend_from_slice(name.as_bytes());
            out.extend_from_slice(b": ");
            out.extend_from_slice(value.as_bytes());
            out.extend_from_slice(b"\r\n");
        }
        out.extend_from_slice(b"\r\n");
        out.extend_from_slice(&self.body);
        out
    }

    /// Parse a complete message from one buffer (the UDP path).
    ///
    /// The body is taken from the `Content-Length` header; trailing bytes
    /// beyond it are ignored, and a declared length longer than the
    /// datagram is a [`Error::Protocol`].
    pub fn parse(data: &[u8]) -> Result<Self, Error> {
        let mut data = data;
        while data.first().is_some_and(|b| *b == b'\r' || *b == b'\n') {
            data = &data[1..];
        }
        let header_end = find_header_end(data)
            .ok_or_else(|| Error::Protocol("SIP message missing blank line".into()))?;
        let head = std::str::from_utf8(&data[..header_end])
            .map_err(|_| Error::Protocol("SIP header section is not UTF-8".into()))?;
        let mut msg = parse_head
            .parse(head)
            .map_err(|e| Error::Protocol(format!("malformed SIP head: {e}")))?;
        let body = &data[header_end + 4..];
        let len = msg.content_length();
        if body.len() < len {
            return Err(Error::Protocol(format!(
                "SIP body truncated: declared {len}, got {}",
                body.len()
            )));
        }
        msg.body = body[..len].to_vec();
        Ok(msg)
    }
}

/// Locate the `\r\n\r\n` separating headers from body.
fn find_header_end(data: &[u8]) -> Option<usize> {
    data.windows(4).position(|w| w == b"\r\n\r\n")
}

fn token(input: &mut &str) -> PResult<String> {
    take_till(1.., |c| c == ' ').map(str::to_owned).parse_next(input)
}

fn start_line(input: &mut &str) -> PResult<StartLine> {
    if let Some(rest_of) = input.strip_prefix("SIP/2.0 ") {
        *input = rest_of;
        let code: u16 = digit1
            .parse_to()
            .parse_next(input)?;
        ' '.parse_next(input)?;
        let reason = take_till(0.., |c| c == '\r').map(str::to_owned).parse_next(input)?;
        Ok(StartLine::Response { code, reason })
    } else {
        let method = token.parse_next(input)?;
        ' '.parse_next(input)?;
        let target = token.parse_next(input)?;
        ' '.parse_next(input)?;
        SIP_VERSION.parse_next(input)?;
        Ok(StartLine::Request { method, target })
    }
}

fn header_line(input: &mut &str) -> PResult<(String, String)> {
    let name = take_till(1.., |c| c == ':' || c == '\r')
        .map(str::to_owned)
        .parse_next(input)?;
    ':'.parse_next(input)?;
    let value = take_till(0.., |c| c == '\r').parse_next(input)?;
    Ok((name, value.trim_start().to_owned()))
}

/// Parse the start line and headers (no trailing blank line, no body).
fn parse_head(input: &mut &str) -> PResult<SipMessage> {
    let start = start_line.parse_next(input)?;
    let mut headers = Vec::new();
    while input.starts_with("\r\n") {
        "\r\n".parse_next(input)?;
        if input.is_empty() {
            break;
        }
        headers.push(header_line.parse_next(input)?);
    }
    rest.parse_next(input)?;
    Ok(SipMessage {
        start,
        headers,
        body: Vec::new(),
    })
}

/// Streaming decoder for SIP over TCP.
///
/// Holds the buffer until the full header section and `Content-Length`
/// bytes of body have arrived; a message is never dispatched with a
/// partial body.
#[derive(Debug, Default)]
pub struct SipDecoder;

impl Decoder for SipDecoder {
    type Item = SipMessage;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<SipMessage>, Error> {
        // Leading CRLFs between messages are keep-alive noise.
        while src.first().is_some_and(|b| *b == b'\r' || *b == b'\n') {
            src.advance(1);
        }

        let Some(header_end) = find_header_end(src) else {
            if src.len() > MAX_HEADER_LEN {
                return Err(Error::FrameOverflow { limit: MAX_HEADER_LEN });
            }
            return Ok(None);
        };

        let head = std::str::from_utf8(&src[..header_end])
            .map_err(|_| Error::Protocol("SIP header section is not UTF-8".into()))?;
        let msg = parse_head
            .parse(head)
            .map_err(|e| Error::Protocol(format!("malformed SIP head: {e}")))?;

        let body_len = msg.content_length();
        let total = header_end + 4 + body_len;
        if src.len() < total {
            // Body not fully buffered yet; leave everything in place.
            return Ok(None);
        }

        let mut msg = msg;
        let frame = src.split_to(total);
        msg.body = frame[header_end + 4..].to_vec();
        Ok(Some(msg))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_request() -> SipMessage {
        let mut msg = SipMessage::request("MESSAGE", "sip:bob@ex");
        msg.add_header("Via", "SIP/2.0/TCP 10.0.0.1:5060;branch=z9hG4bKabc")
            .add_header("From", "<sip:alice@ex>;tag=1928")
            .add_header("To", "<sip:bob@ex>")
            .add_header("CSeq", "2 MESSAGE")
            .set_body(&b"hello"[..]);
        msg
    }

    #[test]
    fn test_request_round_trip() {
        let msg = sample_request();
        let parsed = SipMessage::parse(&msg.to_bytes()).unwrap();
        assert_eq!(parsed, msg);
    }

    #[test]
    fn test_response_round_trip() {
        let mut msg = SipMessage::response(401, "Unauthorized");
        msg.add_header("WWW-Authenticate", "Digest realm=\"ex\", nonce=\"n1\"")
            .add_header("Content-Length", "0");
        let parsed = SipMessage::parse(&msg.to_bytes()).unwrap();
        assert_eq!(parsed, msg);
    }

    #[test]
    fn test_header_lookup_is_case_insensitive() {
        let msg = sample_request();
        assert_eq!(msg.header("cseq"), Some("2 MESSAGE"));
        assert_eq!(msg.header("CSEQ"), Some("2 MESSAGE"));
        assert_eq!(msg.header("Expires"), None);
    }

    #[test]
    fn test_decoder_holds_partial_body() {
        let mut d = SipDecoder;
        let bytes = sample_request().to_bytes();
        let (head, tail) = bytes.split_at(bytes.len() - 3);

        let mut buf = BytesMut::from(head);
        assert!(d.decode(&mut buf).unwrap().is_none());
        assert!(!buf.is_empty());

        buf.extend_from_slice(tail);
        let msg = d.decode(&mut buf).unwrap().unwrap();
        assert_eq!(msg.body, b"hello");
        assert!(buf.is_empty());
    }

    #[test]
    fn test_decoder_strips_keepalive_crlf() {
        let mut d = SipDecoder;
        let mut bytes = b"\r\n\r\n".to_vec();
        bytes.extend_from_slice(&sample_request().to_bytes());
        let mut buf = BytesMut::from(bytes.as_slice());
        let msg = d.decode(&mut buf).unwrap().unwrap();
        assert_eq!(msg.method(), Some("MESSAGE"));
    }

    #[test]
    fn test_udp_parse_rejects_truncated_body() {
        let mut msg = SipMessage::request("MESSAGE", "sip:bob@ex");
        msg.add_header("Content-Length", "10");
        let err = SipMessage::parse(&msg.to_bytes()).unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
    }

    #[test]
    fn test_set_body_updates_content_length() {
        let mut msg = SipMessage::request("PUBLISH", "sip:alice@ex");
        msg.add_header("Content-Length", "999");
        msg.set_body(&b"<presence/>"[..]);
        assert_eq!(msg.content_length(), 11);
        assert_eq!(
            msg.headers.iter().filter(|(n, _)| n == "Content-Length").count(),
            1
        );
    }
}
