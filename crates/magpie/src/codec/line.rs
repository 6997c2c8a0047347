//! CRLF/LF line framing for text protocols.

use bytes::{Buf, BytesMut};
use tokio_util::codec::Decoder;

use crate::error::Error;

/// Maximum accepted frame length. Anything longer fails the connection
/// with [`Error::FrameOverflow`].
pub const MAX_FRAME_LEN: usize = 64 * 1024;

/// Decoder for CRLF- or LF-terminated lines.
///
/// Lines are returned without their terminator. Leading CRLF bytes on a
/// fresh stream are stripped before the first frame is produced; SIP
/// keep-alives are bare CRLF pairs and RFC 3261 requires ignoring them.
///
/// # Example
///
/// ```ignore
/// use tokio_util::codec::FramedRead;
/// use magpie::codec::LineDecoder;
///
/// let mut lines = FramedRead::new(reader, LineDecoder::new());
/// while let Some(line) = lines.next().await {
///     println!("<- {}", line?);
/// }
/// ```
#[derive(Debug, Default)]
pub struct LineDecoder {
    fresh: bool,
}

impl LineDecoder {
    /// Create a decoder for a fresh connection.
    pub fn new() -> Self {
        Self { fresh: true }
    }
}

impl Decoder for LineDecoder {
    type Item = String;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<String>, Error> {
        if self.fresh {
            while src.first().is_some_and(|b| *b == b'\r' || *b == b'\n') {
                src.advance(1);
            }
            if !src.is_empty() {
                self.fresh = false;
            }
        }

        let Some(pos) = src.iter().position(|b| *b == b'\n') else {
            if src.len() > MAX_FRAME_LEN {
                return Err(Error::FrameOverflow { limit: MAX_FRAME_LEN });
            }
            return Ok(None);
        };

        if pos > MAX_FRAME_LEN {
            return Err(Error::FrameOverflow { limit: MAX_FRAME_LEN });
        }

        let mut line = src.split_to(pos + 1);
        line.truncate(pos);
        if line.last() == Some(&b'\r') {
            line.truncate(pos - 1);
        }

        Ok(Some(String::from_utf8_lossy(&line).into_owned()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_all(decoder: &mut LineDecoder, input: &[u8]) -> Vec<String> {
        let mut buf = BytesMut::from(input);
        let mut out = Vec::new();
        while let Some(line) = decoder.decode(&mut buf).unwrap() {
            out.push(line);
        }
        out
    }

    #[test]
    fn test_crlf_lines() {
        let mut d = LineDecoder::new();
        let lines = decode_all(&mut d, b"PING :chat.example\r\nPONG x\r\n");
        assert_eq!(lines, vec!["PING :chat.example", "PONG x"]);
    }

    #[test]
    fn test_bare_lf_lines() {
        let mut d = LineDecoder::new();
        let lines = decode_all(&mut d, b"one\ntwo\n");
        assert_eq!(lines, vec!["one", "two"]);
    }

    #[test]
    fn test_leading_crlf_stripped_when_fresh() {
        let mut d = LineDecoder::new();
        let lines = decode_all(&mut d, b"\r\n\r\nREGISTER sip:ex SIP/2.0\r\n");
        assert_eq!(lines, vec!["REGISTER sip:ex SIP/2.0"]);
    }

    #[test]
    fn test_empty_line_mid_stream_survives() {
        let mut d = LineDecoder::new();
        let lines = decode_all(&mut d, b"a\r\n\r\nb\r\n");
        assert_eq!(lines, vec!["a", "", "b"]);
    }

    #[test]
    fn test_partial_line_waits() {
        let mut d = LineDecoder::new();
        let mut buf = BytesMut::from(&b"PRIVMSG bob :hel"[..]);
        assert!(d.decode(&mut buf).unwrap().is_none());
        buf.extend_from_slice(b"lo\r\n");
        assert_eq!(d.decode(&mut buf).unwrap().unwrap(), "PRIVMSG bob :hello");
    }

    #[test]
    fn test_oversized_frame_rejected() {
        let mut d = LineDecoder::new();
        let mut buf = BytesMut::from(vec![b'a'; MAX_FRAME_LEN + 1].as_slice());
        let err = d.decode(&mut buf).unwrap_err();
        assert!(matches!(err, Error::FrameOverflow { .. }));
    }
}
