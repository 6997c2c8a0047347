//! IRCv3 line parsing.
//!
//! A line is `[@tags ]:[source ]COMMAND params[ :trailing]`. Message
//! tags are `key[=value]` pairs separated by `;`; the trailing
//! parameter starts at the first `:`-prefixed middle and may contain
//! spaces.

use std::collections::HashMap;

use winnow::ascii::space1;
use winnow::combinator::{opt, preceded, separated};
use winnow::prelude::*;
use winnow::token::{rest, take_till};

use crate::codec::PResult;
use crate::error::Error;

/// One parsed IRC line.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct IrcMessage {
    /// IRCv3 message tags.
    pub tags: HashMap<String, String>,
    /// Message source (nick!user@host or a server name), if present.
    pub source: Option<String>,
    /// Command word or numeric, uppercased as received.
    pub command: String,
    /// Positional parameters, trailing parameter last.
    pub params: Vec<String>,
}

impl IrcMessage {
    /// Parse a single line (without its CRLF).
    ///
    /// A line with no command is rejected with [`Error::Protocol`]; the
    /// connection stays up and simply drops the frame.
    pub fn parse(line: &str) -> Result<Self, Error> {
        message
            .parse(line)
            .map_err(|e| Error::Protocol(format!("malformed IRC line: {e}")))
    }

    /// The nick part of the source (everything before `!`).
    pub fn source_nick(&self) -> Option<&str> {
        let source = self.source.as_deref()?;
        Some(source.split('!').next().unwrap_or(source))
    }
}

fn tag(input: &mut &str) -> PResult<(String, String)> {
    let key = take_till(1.., |c| c == '=' || c == ';' || c == ' ')
        .map(str::to_owned)
        .parse_next(input)?;
    let value = opt(preceded('=', take_till(0.., |c| c == ';' || c == ' ')))
        .parse_next(input)?;
    Ok((key, value.unwrap_or_default().to_owned()))
}

fn tags(input: &mut &str) -> PResult<HashMap<String, String>> {
    let list: Vec<(String, String)> =
        preceded('@', separated(1.., tag, ';')).parse_next(input)?;
    space1.parse_next(input)?;
    Ok(list.into_iter().collect())
}

fn source(input: &mut &str) -> PResult<String> {
    let s = preceded(':', take_till(1.., |c| c == ' '))
        .map(str::to_owned)
        .parse_next(input)?;
    space1.parse_next(input)?;
    Ok(s)
}

fn message(input: &mut &str) -> PResult<IrcMessage> {
    let tags = opt(tags).parse_next(input)?.unwrap_or_default();
    let source = opt(source).parse_next(input)?;
    let command = take_till(1.., |c| c == ' ')
        .map(str::to_owned)
        .parse_next(input)?;

    let mut params = Vec::new();
    while opt(space1).parse_next(input)?.is_some() {
        if let Some(trailing) = opt(preceded(':', rest)).parse_next(input)? {
            params.push(trailing.to_owned());
            break;
        }
        let middle = take_till(1.., |c| c == ' ').parse_next(input)?;
        params.push(middle.to_owned());
    }

    Ok(IrcMessage {
        tags,
        source,
        command,
        params,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ping() {
        let msg = IrcMessage::parse("PING :chat.example").unwrap();
        assert_eq!(msg.command, "PING");
        assert_eq!(msg.params, vec!["chat.example"]);
        assert!(msg.source.is_none());
    }

    #[test]
    fn test_privmsg_with_source() {
        let msg = IrcMessage::parse(":alice!a@host PRIVMSG bob :hello there").unwrap();
        assert_eq!(msg.source.as_deref(), Some("alice!a@host"));
        assert_eq!(msg.source_nick(), Some("alice"));
        assert_eq!(msg.command, "PRIVMSG");
        assert_eq!(msg.params, vec!["bob", "hello there"]);
    }

    #[test]
    fn test_tags() {
        let msg =
            IrcMessage::parse("@time=2024-01-01T00:00:00Z;msgid=abc :src NOTICE #room :hi").unwrap();
        assert_eq!(msg.tags.get("time").map(String::as_str), Some("2024-01-01T00:00:00Z"));
        assert_eq!(msg.tags.get("msgid").map(String::as_str), Some("abc"));
        assert_eq!(msg.command, "NOTICE");
        assert_eq!(msg.params, vec!["#room", "hi"]);
    }

    #[test]
    fn test_valueless_tag() {
        let msg = IrcMessage::parse("@solo PING :x").unwrap();
        assert_eq!(msg.tags.get("solo").map(String::as_str), Some(""));
    }

    #[test]
    fn test_cap_ls_line() {
        let msg = IrcMessage::parse(":server CAP * LS :multi-prefix sasl").unwrap();
        assert_eq!(msg.command, "CAP");
        assert_eq!(msg.params, vec!["*", "LS", "multi-prefix sasl"]);
    }

    #[test]
    fn test_empty_line_rejected() {
        assert!(IrcMessage::parse("").is_err());
    }

    #[test]
    fn test_source_without_command_rejected() {
        assert!(IrcMessage::parse(":server.example ").is_err());
        assert!(IrcMessage::parse(":server.example").is_err());
    }

    #[test]
    fn test_numeric_command() {
        let msg = IrcMessage::parse(":server 001 nick :Welcome").unwrap();
        assert_eq!(msg.command, "001");
        assert_eq!(msg.params, vec!["nick", "Welcome"]);
    }
}
