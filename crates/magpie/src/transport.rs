//! Connection transports: TCP with optional TLS and proxy, and UDP.
//!
//! A successful dial hands back split read/write halves; sessions wrap
//! the reader in a codec and feed the writer to the queued output
//! stream. Everything here converts failures into the `Network`/`Tls`
//! error kinds at the boundary.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket, lookup_host};
use tokio_rustls::TlsConnector;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::rustls::{ClientConfig, RootCertStore};
use tracing::debug;

use crate::error::{Error, Result};
use crate::proxy::ProxyInfo;

/// UDP local-port range for SIP; the first free port wins.
pub const UDP_PORT_RANGE: std::ops::Range<u16> = 5060..5160;

/// How to reach a server.
#[derive(Debug, Clone)]
pub struct DialOptions {
    /// Server host name or address.
    pub host: String,
    /// Server port.
    pub port: u16,
    /// Wrap the stream in TLS after connecting.
    pub tls: bool,
    /// Proxy to dial through.
    pub proxy: ProxyInfo,
}

impl DialOptions {
    /// Plain TCP options for `host:port`.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            tls: false,
            proxy: ProxyInfo::None,
        }
    }

    /// Enable TLS.
    pub fn with_tls(mut self, tls: bool) -> Self {
        self.tls = tls;
        self
    }

    /// Dial through a proxy.
    pub fn with_proxy(mut self, proxy: ProxyInfo) -> Self {
        self.proxy = proxy;
        self
    }
}

/// Split halves of an established stream transport.
pub struct StreamTransport {
    /// Read half.
    pub reader: Box<dyn AsyncRead + Unpin + Send>,
    /// Write half.
    pub writer: Box<dyn AsyncWrite + Unpin + Send>,
    /// Local endpoint, when known.
    pub local_addr: Option<SocketAddr>,
}

impl std::fmt::Debug for StreamTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamTransport")
            .field("local_addr", &self.local_addr)
            .finish_non_exhaustive()
    }
}

impl StreamTransport {
    /// Dial per `opts`: resolve, connect (optionally through a proxy),
    /// then optionally wrap in TLS.
    pub async fn dial(opts: &DialOptions) -> Result<Self> {
        let stream = match &opts.proxy {
            ProxyInfo::None | ProxyInfo::UseGlobal | ProxyInfo::UseEnv => {
                connect_tcp(&opts.host, opts.port).await?
            }
            proxy => connect_via_proxy(proxy, &opts.host, opts.port).await?,
        };
        let local_addr = stream.local_addr().ok();

        if opts.tls {
            let tls = tls_handshake(stream, &opts.host).await?;
            let (reader, writer) = tokio::io::split(tls);
            Ok(Self {
                reader: Box::new(reader),
                writer: Box::new(writer),
                local_addr,
            })
        } else {
            let (reader, writer) = stream.into_split();
            Ok(Self {
                reader: Box::new(reader),
                writer: Box::new(writer),
                local_addr,
            })
        }
    }

    /// Build a transport from arbitrary halves. Used by tests to drive
    /// sessions over in-memory pipes.
    pub fn from_parts<R, W>(reader: R, writer: W) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        Self {
            reader: Box::new(reader),
            writer: Box::new(writer),
            local_addr: None,
        }
    }
}

/// A bound UDP transport for datagram SIP.
pub struct DatagramTransport {
    /// The bound socket.
    pub socket: UdpSocket,
    /// Resolved server address.
    pub peer: SocketAddr,
    /// The local port the socket is bound to.
    pub local_port: u16,
}

impl DatagramTransport {
    /// Resolve the server and bind a local port in [`UDP_PORT_RANGE`].
    pub async fn bind(host: &str, port: u16) -> Result<Self> {
        let peer = resolve(host, port).await?;

        for local_port in UDP_PORT_RANGE {
            match UdpSocket::bind(("0.0.0.0", local_port)).await {
                Ok(socket) => {
                    debug!(local_port, %peer, "bound UDP transport");
                    return Ok(Self {
                        socket,
                        peer,
                        local_port,
                    });
                }
                Err(_) => continue,
            }
        }
        Err(Error::Network(format!(
            "no free UDP port in {}..{}",
            UDP_PORT_RANGE.start, UDP_PORT_RANGE.end
        )))
    }

    /// Send one datagram to the server.
    pub async fn send(&self, buf: &[u8]) -> Result<()> {
        self.socket.send_to(buf, self.peer).await?;
        Ok(())
    }

    /// Receive one datagram from anyone.
    pub async fn recv(&self, buf: &mut [u8]) -> Result<(usize, SocketAddr)> {
        let got = self.socket.recv_from(buf).await?;
        Ok(got)
    }
}

async fn resolve(host: &str, port: u16) -> Result<SocketAddr> {
    lookup_host((host, port))
        .await
        .map_err(|e| Error::Network(format!("cannot resolve {host}: {e}")))?
        .next()
        .ok_or_else(|| Error::Network(format!("no addresses for {host}")))
}

async fn connect_tcp(host: &str, port: u16) -> Result<TcpStream> {
    TcpStream::connect((host, port))
        .await
        .map_err(|e| Error::Network(format!("cannot connect to {host}:{port}: {e}")))
}

async fn tls_handshake(
    stream: TcpStream,
    host: &str,
) -> Result<tokio_rustls::client::TlsStream<TcpStream>> {
    let mut roots = RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    let config = ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    let server_name = ServerName::try_from(host.to_owned())
        .map_err(|_| Error::Tls(format!("invalid TLS server name '{host}'")))?;

    TlsConnector::from(Arc::new(config))
        .connect(server_name, stream)
        .await
        .map_err(|e| Error::Tls(format!("handshake with {host} failed: {e}")))
}

// ============================================================================
// Proxy handshakes
// ============================================================================

async fn connect_via_proxy(proxy: &ProxyInfo, host: &str, port: u16) -> Result<TcpStream> {
    match proxy {
        ProxyInfo::Http { host: ph, port: pp, .. } => {
            let mut stream = connect_tcp(ph, *pp).await?;
            http_connect(&mut stream, host, port).await?;
            Ok(stream)
        }
        ProxyInfo::Socks4 { host: ph, port: pp, .. } => {
            let mut stream = connect_tcp(ph, *pp).await?;
            socks4_connect(&mut stream, host, port).await?;
            Ok(stream)
        }
        ProxyInfo::Socks5 {
            host: ph,
            port: pp,
            username,
            password,
        } => {
            let mut stream = connect_tcp(ph, *pp).await?;
            socks5_connect(&mut stream, host, port, username.as_deref(), password.as_deref())
                .await?;
            Ok(stream)
        }
        ProxyInfo::Tor { host: ph, port: pp } => {
            let mut stream = connect_tcp(ph, *pp).await?;
            socks5_connect(&mut stream, host, port, None, None).await?;
            Ok(stream)
        }
        ProxyInfo::None | ProxyInfo::UseGlobal | ProxyInfo::UseEnv => {
            connect_tcp(host, port).await
        }
    }
}

async fn http_connect(stream: &mut TcpStream, host: &str, port: u16) -> Result<()> {
    let request = format!("CONNECT {host}:{port} HTTP/1.1\r\nHost: {host}:{port}\r\n\r\n");
    stream.write_all(request.as_bytes()).await?;

    // Read up to the end of the response headers.
    let mut response = Vec::new();
    let mut byte = [0u8; 1];
    while !response.ends_with(b"\r\n\r\n") {
        let n = stream.read(&mut byte).await?;
        if n == 0 {
            return Err(Error::Network("proxy closed during CONNECT".into()));
        }
        response.push(byte[0]);
        if response.len() > 8192 {
            return Err(Error::Network("oversized proxy response".into()));
        }
    }

    let head = String::from_utf8_lossy(&response);
    let status_ok = head
        .split_whitespace()
        .nth(1)
        .is_some_and(|code| code.starts_with('2'));
    if !status_ok {
        return Err(Error::Network(format!(
            "proxy refused CONNECT: {}",
            head.lines().next().unwrap_or_default()
        )));
    }
    Ok(())
}

async fn socks4_connect(stream: &mut TcpStream, host: &str, port: u16) -> Result<()> {
    let addr = resolve(host, port).await?;
    let SocketAddr::V4(v4) = addr else {
        return Err(Error::Network("SOCKS4 requires an IPv4 destination".into()));
    };

    let mut request = vec![4u8, 1];
    request.extend_from_slice(&port.to_be_bytes());
    request.extend_from_slice(&v4.ip().octets());
    request.push(0); // empty user id

    stream.write_all(&request).await?;

    let mut reply = [0u8; 8];
    stream.read_exact(&mut reply).await?;
    if reply[1] != 0x5a {
        return Err(Error::Network(format!(
            "SOCKS4 request rejected (code {:#04x})",
            reply[1]
        )));
    }
    Ok(())
}

async fn socks5_connect(
    stream: &mut TcpStream,
    host: &str,
    port: u16,
    username: Option<&str>,
    password: Option<&str>,
) -> Result<()> {
    let want_auth = username.is_some();
    let methods: &[u8] = if want_auth { &[0x00, 0x02] } else { &[0x00] };

    let mut greeting = vec![5u8, methods.len() as u8];
    greeting.extend_from_slice(methods);
    stream.write_all(&greeting).await?;

    let mut choice = [0u8; 2];
    stream.read_exact(&mut choice).await?;
    match choice[1] {
        0x00 => {}
        0x02 => {
            let user = username.unwrap_or_default().as_bytes();
            let pass = password.unwrap_or_default().as_bytes();
            let mut auth = vec![1u8, user.len() as u8];
            auth.extend_from_slice(user);
            auth.push(pass.len() as u8);
            auth.extend_from_slice(pass);
            stream.write_all(&auth).await?;

            let mut status = [0u8; 2];
            stream.read_exact(&mut status).await?;
            if status[1] != 0 {
                return Err(Error::Network("SOCKS5 authentication rejected".into()));
            }
        }
        _ => return Err(Error::Network("SOCKS5 proxy offered no usable auth".into())),
    }

    let host_bytes = host.as_bytes();
    if host_bytes.len() > 255 {
        return Err(Error::InvalidSettings("host name longer than 255 bytes".into()));
    }
    let mut request = vec![5u8, 1, 0, 3, host_bytes.len() as u8];
    request.extend_from_slice(host_bytes);
    request.extend_from_slice(&port.to_be_bytes());
    stream.write_all(&request).await?;

    let mut reply = [0u8; 4];
    stream.read_exact(&mut reply).await?;
    if reply[1] != 0 {
        return Err(Error::Network(format!(
            "SOCKS5 connect rejected (code {:#04x})",
            reply[1]
        )));
    }
    // Skip the bound address the proxy reports.
    let skip = match reply[3] {
        1 => 4 + 2,
        3 => {
            let mut len = [0u8; 1];
            stream.read_exact(&mut len).await?;
            len[0] as usize + 2
        }
        4 => 16 + 2,
        other => {
            return Err(Error::Network(format!(
                "SOCKS5 reply with unknown address type {other}"
            )));
        }
    };
    let mut scratch = vec![0u8; skip];
    stream.read_exact(&mut scratch).await?;
    Ok(())
}
