//! Wire codecs shared by the protocol back-ends.
//!
//! Text protocols read CRLF frames through [`LineDecoder`], SIP reads
//! framed messages through [`SipDecoder`] (TCP) or [`SipMessage::parse`]
//! (UDP datagrams), and stanza protocols build on [`XmlNode`], whose
//! parse/serialize pair is byte-exact for every accepted input.

pub mod digest;
pub mod line;
pub mod sip;
pub mod xml;

pub use digest::DigestCredentials;
pub use line::{LineDecoder, MAX_FRAME_LEN};
pub use sip::{SipDecoder, SipMessage, StartLine};
pub use xml::{XmlChild, XmlNode};

/// Result type for winnow parsers.
pub(crate) type PResult<T> =
    core::result::Result<T, winnow::error::ErrMode<winnow::error::ContextError>>;
