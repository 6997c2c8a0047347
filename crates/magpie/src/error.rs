//! Error types for the messaging runtime.

use std::io;

/// Result type for runtime operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur during runtime operations.
///
/// Low-level failures are converted into one of these kinds at the
/// component boundary; no free-form error values cross the core.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// DNS, connect, or unexpected EOF. The reconnect controller handles
    /// these locally; they are shown to the user as a transient notice.
    #[error("network error: {0}")]
    Network(String),

    /// Certificate or TLS handshake failure. Reported, never auto-retried.
    #[error("TLS error: {0}")]
    Tls(String),

    /// Credentials rejected. Fatal: the account is disabled.
    #[error("authentication failed: {0}")]
    AuthFailed(String),

    /// Settings rejected before dialing (whitespace in a username,
    /// malformed URI, out-of-range port).
    #[error("invalid settings: {0}")]
    InvalidSettings(String),

    /// Unparseable frame or a message that is wrong for the current
    /// state. The offending frame is dropped; the connection continues.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// A tracked request got no response in time. Specific to one
    /// request; reported to that request's issuer only.
    #[error("request timed out: {method} (CSeq {cseq})")]
    Timeout {
        /// Method of the request that timed out.
        method: String,
        /// Sequence number of the request.
        cseq: u32,
    },

    /// A codec limit was exceeded. The connection is closed.
    #[error("frame exceeds {limit} bytes")]
    FrameOverflow {
        /// The configured frame limit.
        limit: usize,
    },

    /// The connection's cancellation handle fired. Never surfaced as a
    /// user-visible error.
    #[error("operation cancelled")]
    Cancelled,
}

impl Error {
    /// Create a `Network` error from an I/O error.
    pub fn network(err: io::Error) -> Self {
        Self::Network(err.to_string())
    }

    /// Whether this error disables the account instead of engaging the
    /// reconnect controller.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::AuthFailed(_) | Self::Tls(_) | Self::InvalidSettings(_))
    }

    /// Whether this error should be shown to the user at all.
    ///
    /// `Cancelled` is the normal result of tearing a connection down and
    /// is swallowed; everything else at least reaches the debug log.
    pub fn is_user_visible(&self) -> bool {
        !matches!(self, Self::Cancelled)
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Self::Network(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_kinds() {
        assert!(Error::AuthFailed("401".into()).is_fatal());
        assert!(Error::Tls("bad certificate".into()).is_fatal());
        assert!(Error::InvalidSettings("whitespace in nick".into()).is_fatal());
        assert!(!Error::Network("connection refused".into()).is_fatal());
        assert!(!Error::Protocol("bad frame".into()).is_fatal());
        assert!(
            !Error::Timeout {
                method: "REGISTER".into(),
                cseq: 1
            }
            .is_fatal()
        );
    }

    #[test]
    fn test_cancelled_is_invisible() {
        assert!(!Error::Cancelled.is_user_visible());
        assert!(Error::Network("eof".into()).is_user_visible());
    }

    #[test]
    fn test_error_messages() {
        let err = Error::FrameOverflow { limit: 65536 };
        assert_eq!(err.to_string(), "frame exceeds 65536 bytes");

        let err = Error::Timeout {
            method: "SUBSCRIBE".into(),
            cseq: 7,
        };
        assert_eq!(err.to_string(), "request timed out: SUBSCRIBE (CSeq 7)");
    }
}
