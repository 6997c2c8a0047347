//! NAT-PMP client: public address queries and port mappings against
//! the default gateway.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::UdpSocket;
use tracing::debug;

use super::igd::IgdGateway;
use super::PortProto;
use crate::error::{Error, Result};

/// NAT-PMP control port on the gateway.
const NATPMP_PORT: u16 = 5351;

const OP_PUBLIC_ADDRESS: u8 = 0;
const OP_MAP_UDP: u8 = 1;
const OP_MAP_TCP: u8 = 2;
const RESPONSE_OPCODE_BASE: u8 = 128;

/// Lease we request for mappings, in seconds.
const MAPPING_LIFETIME: u32 = 3600;

const RESPONSE_TIMEOUT: Duration = Duration::from_secs(2);

/// The IPv4 default gateway, read from `/proc/net/route`.
pub fn default_gateway() -> Option<Ipv4Addr> {
    let table = std::fs::read_to_string("/proc/net/route").ok()?;
    for line in table.lines().skip(1) {
        let fields: Vec<&str> = line.split_whitespace().collect();
        // Destination 00000000 marks the default route; the gateway
        // field is little-endian hex.
        if fields.len() >= 3 && fields[1] == "00000000" {
            let raw = u32::from_str_radix(fields[2], 16).ok()?;
            return Some(Ipv4Addr::from(raw.swap_bytes()));
        }
    }
    None
}

async fn transact(gateway: Ipv4Addr, request: &[u8], expect_opcode: u8) -> Result<Vec<u8>> {
    let socket = UdpSocket::bind(("0.0.0.0", 0)).await?;
    let target = SocketAddr::from((gateway, NATPMP_PORT));
    socket.send_to(request, target).await?;

    let mut buf = [0u8; 64];
    let (len, _from) = tokio::time::timeout(RESPONSE_TIMEOUT, socket.recv_from(&mut buf))
        .await
        .map_err(|_| Error::Network(format!("NAT-PMP gateway {gateway} did not answer")))??;
    let data = &buf[..len];

    if data.len() < 8 || data[1] != expect_opcode {
        return Err(Error::Protocol("unexpected NAT-PMP response".into()));
    }
    let result = u16::from_be_bytes([data[2], data[3]]);
    if result != 0 {
        return Err(Error::Network(format!("NAT-PMP request failed (result {result})")));
    }
    Ok(data.to_vec())
}

/// Ask the gateway for its public address.
pub async fn query_public_ip(gateway: Ipv4Addr) -> Result<IpAddr> {
    let response = transact(gateway, &[0, OP_PUBLIC_ADDRESS], RESPONSE_OPCODE_BASE).await?;
    if response.len() < 12 {
        return Err(Error::Protocol("short NAT-PMP address response".into()));
    }
    let ip = Ipv4Addr::new(response[8], response[9], response[10], response[11]);
    debug!(%ip, %gateway, "NAT-PMP reported public address");
    Ok(IpAddr::V4(ip))
}

fn mapping_request(proto: PortProto, internal_port: u16, external_port: u16, lifetime: u32) -> [u8; 12] {
    let opcode = match proto {
        PortProto::Udp => OP_MAP_UDP,
        PortProto::Tcp => OP_MAP_TCP,
    };
    let mut req = [0u8; 12];
    req[1] = opcode;
    req[4..6].copy_from_slice(&internal_port.to_be_bytes());
    req[6..8].copy_from_slice(&external_port.to_be_bytes());
    req[8..12].copy_from_slice(&lifetime.to_be_bytes());
    req
}

/// A NAT-PMP gateway behind the common port-mapping interface, used
/// when no UPnP IGD answers the SSDP search.
#[derive(Debug, Clone)]
pub struct NatPmpGateway {
    gateway: Ipv4Addr,
}

impl NatPmpGateway {
    /// Wrap a gateway address.
    pub fn new(gateway: Ipv4Addr) -> Self {
        Self { gateway }
    }
}

#[async_trait]
impl IgdGateway for NatPmpGateway {
    async fn add_port(
        &self,
        proto: PortProto,
        external_port: u16,
        _internal_ip: &str,
        internal_port: u16,
    ) -> Result<()> {
        let opcode = match proto {
            PortProto::Udp => OP_MAP_UDP,
            PortProto::Tcp => OP_MAP_TCP,
        };
        let request = mapping_request(proto, internal_port, external_port, MAPPING_LIFETIME);
        transact(self.gateway, &request, RESPONSE_OPCODE_BASE + opcode).await?;
        Ok(())
    }

    async fn remove_port(&self, proto: PortProto, external_port: u16) -> Result<()> {
        // Lifetime zero with matching internal port deletes the lease.
        let opcode = match proto {
            PortProto::Udp => OP_MAP_UDP,
            PortProto::Tcp => OP_MAP_TCP,
        };
        let request = mapping_request(proto, external_port, 0, 0);
        transact(self.gateway, &request, RESPONSE_OPCODE_BASE + opcode).await?;
        Ok(())
    }

    async fn external_ip(&self) -> Result<String> {
        Ok(query_public_ip(self.gateway).await?.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mapping_request_layout() {
        let req = mapping_request(PortProto::Udp, 5060, 5060, 3600);
        assert_eq!(req[0], 0); // version
        assert_eq!(req[1], OP_MAP_UDP);
        assert_eq!(u16::from_be_bytes([req[4], req[5]]), 5060);
        assert_eq!(u16::from_be_bytes([req[6], req[7]]), 5060);
        assert_eq!(u32::from_be_bytes([req[8], req[9], req[10], req[11]]), 3600);

        let req = mapping_request(PortProto::Tcp, 80, 8080, 0);
        assert_eq!(req[1], OP_MAP_TCP);
        assert_eq!(u32::from_be_bytes([req[8], req[9], req[10], req[11]]), 0);
    }
}
