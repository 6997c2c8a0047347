//! Proxy configuration.

use crate::prefs::Preferences;

/// Default Tor SOCKS endpoint.
const TOR_DEFAULT_HOST: &str = "127.0.0.1";
const TOR_DEFAULT_PORT: u16 = 9050;

/// How a connection reaches the network.
///
/// `UseGlobal` defers to the global preference tree; `UseEnv` defers to
/// the process environment and is resolved by the embedder.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ProxyInfo {
    /// Use the global proxy preferences.
    UseGlobal,
    /// Direct connection.
    #[default]
    None,
    /// SOCKS4 proxy.
    Socks4 {
        /// Proxy host.
        host: String,
        /// Proxy port.
        port: u16,
        /// User id sent in the SOCKS4 request.
        username: Option<String>,
    },
    /// SOCKS5 proxy.
    Socks5 {
        /// Proxy host.
        host: String,
        /// Proxy port.
        port: u16,
        /// Username for username/password auth.
        username: Option<String>,
        /// Password for username/password auth.
        password: Option<String>,
    },
    /// Tor, spoken as SOCKS5 without credentials.
    Tor {
        /// SOCKS endpoint host.
        host: String,
        /// SOCKS endpoint port.
        port: u16,
    },
    /// HTTP CONNECT proxy.
    Http {
        /// Proxy host.
        host: String,
        /// Proxy port.
        port: u16,
        /// Username, currently unused by the CONNECT handshake.
        username: Option<String>,
        /// Password, currently unused by the CONNECT handshake.
        password: Option<String>,
    },
    /// Resolve from environment variables.
    UseEnv,
}

impl ProxyInfo {
    /// Resolve the effective proxy from the global preference tree.
    ///
    /// Host, port, and credentials are only consulted when the type is
    /// one that uses them.
    pub fn from_prefs(prefs: &Preferences) -> Self {
        let kind = prefs.get_string("/purple/proxy/type").unwrap_or_default();
        match kind.as_str() {
            "socks4" => Self::Socks4 {
                host: prefs.get_string("/purple/proxy/host").unwrap_or_default(),
                port: prefs.get_int("/purple/proxy/port").unwrap_or(0) as u16,
                username: non_empty(prefs.get_string("/purple/proxy/username")),
            },
            "socks5" => Self::Socks5 {
                host: prefs.get_string("/purple/proxy/host").unwrap_or_default(),
                port: prefs.get_int("/purple/proxy/port").unwrap_or(0) as u16,
                username: non_empty(prefs.get_string("/purple/proxy/username")),
                password: non_empty(prefs.get_string("/purple/proxy/password")),
            },
            "tor" => Self::Tor {
                host: {
                    let host = prefs.get_string("/purple/proxy/host").unwrap_or_default();
                    if host.is_empty() {
                        TOR_DEFAULT_HOST.to_owned()
                    } else {
                        host
                    }
                },
                port: match prefs.get_int("/purple/proxy/port").unwrap_or(0) {
                    0 => TOR_DEFAULT_PORT,
                    port => port as u16,
                },
            },
            "http" => Self::Http {
                host: prefs.get_string("/purple/proxy/host").unwrap_or_default(),
                port: prefs.get_int("/purple/proxy/port").unwrap_or(0) as u16,
                username: non_empty(prefs.get_string("/purple/proxy/username")),
                password: non_empty(prefs.get_string("/purple/proxy/password")),
            },
            "envvar" => Self::UseEnv,
            "global" => Self::UseGlobal,
            _ => Self::None,
        }
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::prefs::Preferences;

    #[test]
    fn test_default_is_direct() {
        let prefs = Preferences::with_defaults();
        assert_eq!(ProxyInfo::from_prefs(&prefs), ProxyInfo::None);
    }

    #[test]
    fn test_socks5_reads_credentials() {
        let prefs = Preferences::with_defaults();
        prefs.set_string("/purple/proxy/type", "socks5");
        prefs.set_string("/purple/proxy/host", "proxy.example");
        prefs.set_int("/purple/proxy/port", 1080);
        prefs.set_string("/purple/proxy/username", "u");
        prefs.set_string("/purple/proxy/password", "p");

        let proxy = ProxyInfo::from_prefs(&prefs);
        assert_eq!(
            proxy,
            ProxyInfo::Socks5 {
                host: "proxy.example".into(),
                port: 1080,
                username: Some("u".into()),
                password: Some("p".into()),
            }
        );
    }

    #[test]
    fn test_tor_defaults_to_local_socks() {
        let prefs = Preferences::with_defaults();
        prefs.set_string("/purple/proxy/type", "tor");
        assert_eq!(
            ProxyInfo::from_prefs(&prefs),
            ProxyInfo::Tor {
                host: "127.0.0.1".into(),
                port: 9050
            }
        );
    }
}
