//! UPnP Internet Gateway Device discovery and control.
//!
//! Discovery is an SSDP `M-SEARCH` for the WANIPConnection and
//! WANPPPConnection services; the answering device's description is
//! fetched over plain HTTP to find its control URL. Port mappings and
//! the external address go through small SOAP calls against that URL.

use std::net::Ipv4Addr;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tracing::debug;

use super::PortProto;
use crate::error::{Error, Result};

/// SSDP multicast endpoint.
const SSDP_ADDR: &str = "239.255.255.250:1900";

/// Service types an IGD exposes for port mapping.
const SERVICE_TYPES: [&str; 2] = [
    "urn:schemas-upnp-org:service:WANIPConnection:1",
    "urn:schemas-upnp-org:service:WANPPPConnection:1",
];

/// How long we listen for SSDP answers.
const SSDP_TIMEOUT: Duration = Duration::from_secs(2);

/// Mapping description advertised to the gateway.
const MAPPING_DESCRIPTION: &str = "MAGPIE_PORT_FORWARD";

/// Lease time for UPnP mappings; zero means indefinite.
const MAPPING_LEASE: u32 = 0;

/// The port-mapping surface of a gateway, UPnP or NAT-PMP.
#[async_trait]
pub trait IgdGateway: Send + Sync {
    /// Map `external_port` on the gateway to `internal_ip:internal_port`.
    async fn add_port(
        &self,
        proto: PortProto,
        external_port: u16,
        internal_ip: &str,
        internal_port: u16,
    ) -> Result<()>;

    /// Remove a mapping for `external_port`.
    async fn remove_port(&self, proto: PortProto, external_port: u16) -> Result<()>;

    /// The gateway's external address.
    async fn external_ip(&self) -> Result<String>;
}

/// What SSDP discovery found.
pub struct DiscoveredIgd {
    /// SOAP control URL.
    pub control_url: String,
    /// Service type the gateway answered for.
    pub service_type: String,
    /// Our address on the interface that reaches the gateway.
    pub internal_ip: String,
}

/// Search for an IGD and resolve its control URL.
pub async fn discover() -> Result<DiscoveredIgd> {
    let socket = UdpSocket::bind(("0.0.0.0", 0)).await?;

    for service_type in SERVICE_TYPES {
        let search = format!(
            "M-SEARCH * HTTP/1.1\r\n\
             HOST: {SSDP_ADDR}\r\n\
             MAN: \"ssdp:discover\"\r\n\
             MX: 2\r\n\
             ST: {service_type}\r\n\r\n"
        );
        socket.send_to(search.as_bytes(), SSDP_ADDR).await?;
    }

    let mut buf = [0u8; 2048];
    let deadline = tokio::time::Instant::now() + SSDP_TIMEOUT;
    loop {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        if remaining.is_zero() {
            return Err(Error::Network("no IGD answered the SSDP search".into()));
        }
        let Ok(received) = tokio::time::timeout(remaining, socket.recv_from(&mut buf)).await else {
            return Err(Error::Network("no IGD answered the SSDP search".into()));
        };
        let (len, _from) = received?;
        let response = String::from_utf8_lossy(&buf[..len]);

        let Some(location) = header_value(&response, "LOCATION") else {
            continue;
        };
        let service_type = header_value(&response, "ST")
            .unwrap_or_else(|| SERVICE_TYPES[0].to_owned());
        debug!(%location, %service_type, "IGD answered SSDP search");

        match resolve_control_url(&location, &service_type).await {
            Ok((control_url, internal_ip)) => {
                return Ok(DiscoveredIgd {
                    control_url,
                    service_type,
                    internal_ip,
                });
            }
            Err(err) => {
                debug!(%err, %location, "cannot resolve control URL, waiting for another answer");
            }
        }
    }
}

fn header_value(response: &str, name: &str) -> Option<String> {
    response.lines().find_map(|line| {
        let (key, value) = line.split_once(':')?;
        if key.trim().eq_ignore_ascii_case(name) {
            Some(value.trim().to_owned())
        } else {
            None
        }
    })
}

/// Split `http://host:port/path` into its parts.
fn split_http_url(url: &str) -> Result<(String, u16, String)> {
    let rest = url
        .strip_prefix("http://")
        .ok_or_else(|| Error::Protocol(format!("unsupported URL '{url}'")))?;
    let (authority, path) = match rest.find('/') {
        Some(pos) => (&rest[..pos], &rest[pos..]),
        None => (rest, "/"),
    };
    let (host, port) = match authority.rsplit_once(':') {
        Some((host, port)) => (
            host,
            port.parse()
                .map_err(|_| Error::Protocol(format!("bad port in URL '{url}'")))?,
        ),
        None => (authority, 80),
    };
    Ok((host.to_owned(), port, path.to_owned()))
}

/// Fetch the device description and pull out the control URL for the
/// service. Also reports our local address toward the gateway, which
/// is the internal IP mappings should target.
async fn resolve_control_url(location: &str, service_type: &str) -> Result<(String, String)> {
    let (host, port, path) = split_http_url(location)?;
    let mut stream = TcpStream::connect((host.as_str(), port)).await?;
    let internal_ip = stream
        .local_addr()
        .map(|a| a.ip().to_string())
        .unwrap_or_else(|_| Ipv4Addr::UNSPECIFIED.to_string());

    let request = format!(
        "GET {path} HTTP/1.1\r\nHost: {host}:{port}\r\nConnection: close\r\n\r\n"
    );
    stream.write_all(request.as_bytes()).await?;
    let mut body = Vec::new();
    stream.read_to_end(&mut body).await?;
    let description = String::from_utf8_lossy(&body).into_owned();

    // The description lists every service; take the controlURL that
    // follows our serviceType.
    let service_pos = description
        .find(service_type)
        .ok_or_else(|| Error::Protocol("description lacks the searched service".into()))?;
    let control = extract_tag(&description[service_pos..], "controlURL")
        .ok_or_else(|| Error::Protocol("description lacks a controlURL".into()))?;

    let control_url = if control.starts_with("http://") {
        control
    } else {
        format!("http://{host}:{port}{control}")
    };
    Ok((control_url, internal_ip))
}

/// First `<tag>value</tag>` occurrence in `xml`. Device descriptions
/// in the wild are too loose for the strict stanza codec, so this is a
/// plain scan.
fn extract_tag(xml: &str, tag: &str) -> Option<String> {
    let open = format!("<{tag}>");
    let close = format!("</{tag}>");
    let start = xml.find(&open)? + open.len();
    let end = xml[start..].find(&close)? + start;
    Some(xml[start..end].trim().to_owned())
}

/// An IGD driven over SOAP.
pub struct SoapGateway {
    control_url: String,
    service_type: String,
}

impl SoapGateway {
    /// Wrap a discovered gateway.
    pub fn new(discovered: &DiscoveredIgd) -> Self {
        Self {
            control_url: discovered.control_url.clone(),
            service_type: discovered.service_type.clone(),
        }
    }

    async fn call(&self, action: &str, arguments: &str) -> Result<String> {
        let (host, port, path) = split_http_url(&self.control_url)?;
        let body = format!(
            "<?xml version=\"1.0\"?>\r\n\
             <s:Envelope xmlns:s=\"http://schemas.xmlsoap.org/soap/envelope/\" \
             s:encodingStyle=\"http://schemas.xmlsoap.org/soap/encoding/\">\r\n\
             <s:Body>\r\n<u:{action} xmlns:u=\"{}\">\r\n{arguments}</u:{action}>\r\n\
             </s:Body>\r\n</s:Envelope>\r\n",
            self.service_type
        );
        let request = format!(
            "POST {path} HTTP/1.1\r\n\
             Host: {host}:{port}\r\n\
             SOAPACTION: \"{}#{action}\"\r\n\
             Content-Type: text/xml; charset=\"utf-8\"\r\n\
             Content-Length: {}\r\n\
             Connection: close\r\n\r\n{body}",
            self.service_type,
            body.len()
        );

        let mut stream = TcpStream::connect((host.as_str(), port)).await?;
        stream.write_all(request.as_bytes()).await?;
        let mut response = Vec::new();
        stream.read_to_end(&mut response).await?;
        let response = String::from_utf8_lossy(&response).into_owned();

        let ok = response
            .split_whitespace()
            .nth(1)
            .is_some_and(|code| code.starts_with('2'));
        if !ok {
            return Err(Error::Network(format!(
                "IGD refused {action}: {}",
                response.lines().next().unwrap_or_default()
            )));
        }
        Ok(response)
    }
}

#[async_trait]
impl IgdGateway for SoapGateway {
    async fn add_port(
        &self,
        proto: PortProto,
        external_port: u16,
        internal_ip: &str,
        internal_port: u16,
    ) -> Result<()> {
        let arguments = format!(
            "<NewRemoteHost></NewRemoteHost>\
             <NewExternalPort>{external_port}</NewExternalPort>\
             <NewProtocol>{}</NewProtocol>\
             <NewInternalPort>{internal_port}</NewInternalPort>\
             <NewInternalClient>{internal_ip}</NewInternalClient>\
             <NewEnabled>1</NewEnabled>\
             <NewPortMappingDescription>{MAPPING_DESCRIPTION}</NewPortMappingDescription>\
             <NewLeaseDuration>{MAPPING_LEASE}</NewLeaseDuration>",
            proto.as_str()
        );
        self.call("AddPortMapping", &arguments).await?;
        Ok(())
    }

    async fn remove_port(&self, proto: PortProto, external_port: u16) -> Result<()> {
        let arguments = format!(
            "<NewRemoteHost></NewRemoteHost>\
             <NewExternalPort>{external_port}</NewExternalPort>\
             <NewProtocol>{}</NewProtocol>",
            proto.as_str()
        );
        self.call("DeletePortMapping", &arguments).await?;
        Ok(())
    }

    async fn external_ip(&self) -> Result<String> {
        let response = self.call("GetExternalIPAddress", "").await?;
        extract_tag(&response, "NewExternalIPAddress")
            .filter(|ip| !ip.is_empty())
            .ok_or_else(|| Error::Protocol("IGD reported no external address".into()))
    }
}
