//! HTTP Digest authentication primitives and checksum helpers.
//!
//! `HA1 = MD5(user:realm:password)`, `HA2 = MD5(method:uri)`, and the
//! response is `MD5(HA1:nonce:nc:cnonce:qop:HA2)`; the SIP stack runs
//! with empty `cnonce`/`qop` fields. SHA-1 is exposed for deterministic
//! image cache file names.

use md5::{Digest as _, Md5};
use sha1::Sha1;
use winnow::ascii::space0;
use winnow::combinator::{alt, delimited, opt, separated};
use winnow::prelude::*;
use winnow::token::take_till;

use super::PResult;
use crate::error::Error;

/// Lowercase MD5 hex digest of `data`.
pub fn md5_hex(data: &[u8]) -> String {
    let mut hasher = Md5::new();
    hasher.update(data);
    hex(&hasher.finalize())
}

/// Lowercase SHA-1 hex digest of `data`.
pub fn sha1_hex(data: &[u8]) -> String {
    let mut hasher = Sha1::new();
    hasher.update(data);
    hex(&hasher.finalize())
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

/// `HA1 = MD5(user:realm:password)`.
pub fn digest_ha1(user: &str, realm: &str, password: &str) -> String {
    md5_hex(format!("{user}:{realm}:{password}").as_bytes())
}

/// `HA2 = MD5(method:uri)`.
pub fn digest_ha2(method: &str, uri: &str) -> String {
    md5_hex(format!("{method}:{uri}").as_bytes())
}

/// The digest response with all six fields joined by colons.
pub fn digest_response(
    ha1: &str,
    nonce: &str,
    nc: &str,
    cnonce: &str,
    qop: &str,
    ha2: &str,
) -> String {
    md5_hex(format!("{ha1}:{nonce}:{nc}:{cnonce}:{qop}:{ha2}").as_bytes())
}

/// Cached credentials for one digest realm.
///
/// Built from a `WWW-Authenticate` or `Proxy-Authenticate` challenge;
/// issues `Authorization` header values with a per-realm nonce count.
#[derive(Debug, Clone)]
pub struct DigestCredentials {
    /// Realm from the challenge.
    pub realm: String,
    /// Server nonce from the challenge.
    pub nonce: String,
    /// Precomputed `HA1`.
    pub ha1: String,
    /// Nonce count for the next request.
    pub nc: u32,
}

impl DigestCredentials {
    /// Parse a `Digest` challenge and precompute `HA1`.
    pub fn from_challenge(header: &str, user: &str, password: &str) -> Result<Self, Error> {
        let params = challenge
            .parse(header.trim())
            .map_err(|e| Error::Protocol(format!("malformed digest challenge: {e}")))?;

        let find = |key: &str| {
            params
                .iter()
                .find(|(k, _)| k.eq_ignore_ascii_case(key))
                .map(|(_, v)| v.clone())
        };
        let realm = find("realm")
            .ok_or_else(|| Error::Protocol("digest challenge without realm".into()))?;
        let nonce = find("nonce")
            .ok_or_else(|| Error::Protocol("digest challenge without nonce".into()))?;

        let ha1 = digest_ha1(user, &realm, password);
        Ok(Self {
            realm,
            nonce,
            ha1,
            nc: 1,
        })
    }

    /// Produce the value of an `Authorization`/`Proxy-Authorization`
    /// header for `method` on `uri`, advancing the nonce count.
    pub fn authorization(&mut self, user: &str, method: &str, uri: &str) -> String {
        let nc = format!("{:08}", self.nc);
        self.nc += 1;
        let ha2 = digest_ha2(method, uri);
        let response = digest_response(&self.ha1, &self.nonce, &nc, "", "", &ha2);
        format!(
            "Digest username=\"{user}\", realm=\"{}\", nonce=\"{}\", uri=\"{uri}\", nc=\"{nc}\", response=\"{response}\"",
            self.realm, self.nonce
        )
    }
}

fn param_value(input: &mut &str) -> PResult<String> {
    alt((
        delimited('"', take_till(0.., |c| c == '"'), '"'),
        take_till(1.., |c: char| c == ',' || c.is_whitespace()),
    ))
    .map(str::to_owned)
    .parse_next(input)
}

fn param(input: &mut &str) -> PResult<(String, String)> {
    let key = take_till(1.., |c: char| c == '=' || c == ',' || c.is_whitespace())
        .map(str::to_owned)
        .parse_next(input)?;
    space0.parse_next(input)?;
    '='.parse_next(input)?;
    space0.parse_next(input)?;
    let value = param_value.parse_next(input)?;
    Ok((key, value))
}

fn challenge(input: &mut &str) -> PResult<Vec<(String, String)>> {
    opt("Digest").parse_next(input)?;
    space0.parse_next(input)?;
    separated(1.., param, (',', space0)).parse_next(input)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_md5_known_vector() {
        assert_eq!(md5_hex(b"abc"), "900150983cd24fb0d6963f7d28e17f72");
    }

    #[test]
    fn test_sha1_known_vector() {
        assert_eq!(sha1_hex(b"abc"), "a9993e364706816aba3e25717850c26c9cd0d89d");
    }

    #[test]
    fn test_challenge_parsing() {
        let creds =
            DigestCredentials::from_challenge("Digest realm=\"ex\", nonce=\"n1\"", "alice", "pw")
                .unwrap();
        assert_eq!(creds.realm, "ex");
        assert_eq!(creds.nonce, "n1");
        assert_eq!(creds.ha1, digest_ha1("alice", "ex", "pw"));
        assert_eq!(creds.nc, 1);
    }

    #[test]
    fn test_challenge_extra_params_ignored() {
        let creds = DigestCredentials::from_challenge(
            "Digest realm=\"ex\", nonce=\"n1\", algorithm=MD5, stale=false",
            "alice",
            "pw",
        )
        .unwrap();
        assert_eq!(creds.realm, "ex");
    }

    #[test]
    fn test_challenge_without_nonce_rejected() {
        let err = DigestCredentials::from_challenge("Digest realm=\"ex\"", "a", "b").unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
    }

    #[test]
    fn test_authorization_counts_nonces() {
        let mut creds =
            DigestCredentials::from_challenge("Digest realm=\"ex\", nonce=\"n1\"", "alice", "pw")
                .unwrap();

        let first = creds.authorization("alice", "REGISTER", "sip:ex");
        assert!(first.contains("nc=\"00000001\""));
        assert!(first.contains("username=\"alice\""));
        assert!(first.contains("realm=\"ex\""));

        let second = creds.authorization("alice", "REGISTER", "sip:ex");
        assert!(second.contains("nc=\"00000002\""));
    }

    #[test]
    fn test_response_matches_formula() {
        let mut creds =
            DigestCredentials::from_challenge("Digest realm=\"ex\", nonce=\"n1\"", "alice", "pw")
                .unwrap();
        let header = creds.authorization("alice", "REGISTER", "sip:ex");

        let ha1 = digest_ha1("alice", "ex", "pw");
        let ha2 = digest_ha2("REGISTER", "sip:ex");
        let expected = digest_response(&ha1, "n1", "00000001", "", "", &ha2);
        assert!(header.contains(&format!("response=\"{expected}\"")));
    }
}
