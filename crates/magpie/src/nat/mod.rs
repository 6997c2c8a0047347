//! NAT traversal: coalesced gateway discovery and port mappings.
//!
//! One process-wide controller drives UPnP (SSDP + SOAP), NAT-PMP, and
//! STUN. Discovery runs at most once at a time; port-mapping requests
//! arriving meanwhile are queued on its completion. A failed discovery
//! sticks as `Unable` and is only retried after five minutes, and any
//! network change resets everything to `Undiscovered`.

pub mod igd;
pub mod natpmp;
pub mod stun;

use std::net::IpAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
pub use igd::IgdGateway;

/// How long a failed discovery sticks before another attempt.
const UNABLE_RETRY_AFTER: Duration = Duration::from_secs(300);

/// Transport protocol of a port mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortProto {
    /// UDP mapping.
    Udp,
    /// TCP mapping.
    Tcp,
}

impl PortProto {
    /// The token gateways expect.
    pub fn as_str(self) -> &'static str {
        match self {
            PortProto::Udp => "UDP",
            PortProto::Tcp => "TCP",
        }
    }
}

/// Where discovery currently stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "output", derive(serde::Serialize))]
pub enum NatStatus {
    /// Nothing attempted yet.
    Undiscovered,
    /// A discovery is in flight.
    Discovering,
    /// The last discovery failed.
    Unable,
    /// A gateway is known.
    Discovered,
}

/// What a successful discovery produced.
pub struct Discovery {
    /// Port-mapping control surface.
    pub gateway: Arc<dyn IgdGateway>,
    /// Control URL, when the gateway is a UPnP IGD.
    pub control_url: Option<String>,
    /// Our address on the interface facing the gateway.
    pub internal_ip: Option<String>,
    /// Public address, when STUN or the gateway reported one.
    pub public_ip: Option<IpAddr>,
}

/// Pluggable discovery strategy; tests substitute their own.
#[async_trait]
pub trait Discoverer: Send + Sync {
    /// Find a gateway and our addresses.
    async fn discover(&self) -> Result<Discovery>;
}

/// The production discoverer: SSDP and STUN in parallel, NAT-PMP as
/// the fallback mapping path.
pub struct NetworkDiscoverer {
    /// STUN server, when one is configured.
    pub stun_server: Option<(String, u16)>,
}

#[async_trait]
impl Discoverer for NetworkDiscoverer {
    async fn discover(&self) -> Result<Discovery> {
        let stun = async {
            match &self.stun_server {
                Some((host, port)) => stun::query_public_ip(host, *port).await.ok(),
                None => None,
            }
        };
        let (ssdp, stun_ip) = tokio::join!(igd::discover(), stun);

        match ssdp {
            Ok(discovered) => {
                let gateway = Arc::new(igd::SoapGateway::new(&discovered));
                let public_ip = match stun_ip {
                    Some(ip) => Some(ip),
                    None => gateway
                        .external_ip()
                        .await
                        .ok()
                        .and_then(|ip| ip.parse().ok()),
                };
                Ok(Discovery {
                    gateway,
                    control_url: Some(discovered.control_url),
                    internal_ip: Some(discovered.internal_ip),
                    public_ip,
                })
            }
            Err(ssdp_err) => {
                debug!(%ssdp_err, "no UPnP gateway, trying NAT-PMP");
                let gateway_ip = natpmp::default_gateway()
                    .ok_or_else(|| Error::Network("no default gateway".into()))?;
                // Prove the gateway speaks NAT-PMP before advertising it.
                let pmp_ip = natpmp::query_public_ip(gateway_ip).await?;
                Ok(Discovery {
                    gateway: Arc::new(natpmp::NatPmpGateway::new(gateway_ip)),
                    control_url: None,
                    internal_ip: None,
                    public_ip: stun_ip.or(Some(pmp_ip)),
                })
            }
        }
    }
}

/// Callback for a finished (or failed) mapping operation.
pub type MappingCallback = Box<dyn FnOnce(bool) + Send>;

struct PendingMapping {
    port: u16,
    proto: PortProto,
    add: bool,
    callback: Option<MappingCallback>,
}

struct NatState {
    status: NatStatus,
    control_url: Option<String>,
    public_ip: Option<IpAddr>,
    internal_ip: Option<String>,
    discovered_at: Option<tokio::time::Instant>,
}

/// The process-wide NAT controller.
pub struct NatController {
    discoverer: Arc<dyn Discoverer>,
    state: Mutex<NatState>,
    gateway: Mutex<Option<Arc<dyn IgdGateway>>>,
    queue: Mutex<Vec<PendingMapping>>,
    leases: Mutex<Vec<(u16, PortProto)>>,
}

impl NatController {
    /// A controller using `discoverer` to find gateways.
    pub fn new(discoverer: Arc<dyn Discoverer>) -> Self {
        Self {
            discoverer,
            state: Mutex::new(NatState {
                status: NatStatus::Undiscovered,
                control_url: None,
                public_ip: None,
                internal_ip: None,
                discovered_at: None,
            }),
            gateway: Mutex::new(None),
            queue: Mutex::new(Vec::new()),
            leases: Mutex::new(Vec::new()),
        }
    }

    /// Current discovery status.
    pub fn status(&self) -> NatStatus {
        self.state.lock().unwrap().status
    }

    /// Cached public address; only populated while `Discovered`.
    pub fn public_ip(&self) -> Option<IpAddr> {
        let state = self.state.lock().unwrap();
        match state.status {
            NatStatus::Discovered => state.public_ip,
            _ => None,
        }
    }

    /// Cached internal address toward the gateway.
    pub fn internal_ip(&self) -> Option<String> {
        self.state.lock().unwrap().internal_ip.clone()
    }

    /// Cached control URL, when the gateway is a UPnP IGD.
    pub fn control_url(&self) -> Option<String> {
        self.state.lock().unwrap().control_url.clone()
    }

    /// The OS reports a network change: forget everything.
    pub fn network_changed(self: &Arc<Self>) {
        info!("network changed, resetting NAT discovery state");
        {
            let mut state = self.state.lock().unwrap();
            state.status = NatStatus::Undiscovered;
            state.control_url = None;
            state.public_ip = None;
            state.internal_ip = None;
            state.discovered_at = None;
        }
        *self.gateway.lock().unwrap() = None;
        // Leases belonged to the old gateway.
        self.leases.lock().unwrap().clear();

        // Requests queued against the old network can never succeed.
        let stale = std::mem::take(&mut *self.queue.lock().unwrap());
        for pending in stale {
            fail_async(pending.callback);
        }
    }

    /// Kick off discovery if none is running and the `Unable` backoff
    /// allows it. Queued mappings run on completion either way.
    pub fn discover(self: &Arc<Self>) {
        {
            let mut state = self.state.lock().unwrap();
            match state.status {
                NatStatus::Discovering | NatStatus::Discovered => return,
                NatStatus::Unable => {
                    let recent = state
                        .discovered_at
                        .is_some_and(|at| at.elapsed() < UNABLE_RETRY_AFTER);
                    if recent {
                        return;
                    }
                    state.status = NatStatus::Discovering;
                }
                NatStatus::Undiscovered => state.status = NatStatus::Discovering,
            }
        }

        info!("starting NAT discovery");
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let result = this.discoverer.discover().await;
            let drained: Vec<PendingMapping>;
            let success;
            match result {
                Ok(discovery) => {
                    {
                        let mut state = this.state.lock().unwrap();
                        state.status = NatStatus::Discovered;
                        state.control_url = discovery.control_url.clone();
                        state.public_ip = discovery.public_ip;
                        state.internal_ip = discovery.internal_ip.clone();
                        state.discovered_at = Some(tokio::time::Instant::now());
                    }
                    *this.gateway.lock().unwrap() = Some(Arc::clone(&discovery.gateway));
                    success = true;
                    info!(public_ip = ?discovery.public_ip, "NAT discovery finished");
                }
                Err(err) => {
                    let mut state = this.state.lock().unwrap();
                    state.status = NatStatus::Unable;
                    state.discovered_at = Some(tokio::time::Instant::now());
                    success = false;
                    warn!(%err, "NAT discovery failed");
                }
            }

            drained = std::mem::take(&mut *this.queue.lock().unwrap());
            for pending in drained {
                if success {
                    this.execute_mapping(pending);
                } else {
                    fail_async(pending.callback);
                }
            }
        });
    }

    /// Map `port` on the gateway. The callback fires with the outcome;
    /// when discovery has not happened yet it is queued behind one.
    pub fn add_port_mapping(
        self: &Arc<Self>,
        port: u16,
        proto: PortProto,
        callback: Option<MappingCallback>,
    ) {
        self.mapping_request(PendingMapping {
            port,
            proto,
            add: true,
            callback,
        });
    }

    /// Remove the mapping for `port`.
    pub fn remove_port_mapping(
        self: &Arc<Self>,
        port: u16,
        proto: PortProto,
        callback: Option<MappingCallback>,
    ) {
        self.mapping_request(PendingMapping {
            port,
            proto,
            add: false,
            callback,
        });
    }

    fn mapping_request(self: &Arc<Self>, pending: PendingMapping) {
        let status = self.status();
        match status {
            NatStatus::Discovered => self.execute_mapping(pending),
            NatStatus::Undiscovered | NatStatus::Discovering => {
                self.queue.lock().unwrap().push(pending);
                self.discover();
            }
            NatStatus::Unable => {
                let stale = {
                    let state = self.state.lock().unwrap();
                    !state
                        .discovered_at
                        .is_some_and(|at| at.elapsed() < UNABLE_RETRY_AFTER)
                };
                if stale {
                    self.queue.lock().unwrap().push(pending);
                    self.discover();
                } else {
                    // Asynchronously report the failure so callers see
                    // consistent ordering.
                    fail_async(pending.callback);
                }
            }
        }
    }

    fn execute_mapping(self: &Arc<Self>, pending: PendingMapping) {
        let Some(gateway) = self.gateway.lock().unwrap().clone() else {
            fail_async(pending.callback);
            return;
        };
        let internal_ip = self
            .internal_ip()
            .unwrap_or_else(|| "0.0.0.0".to_owned());

        let this = Arc::clone(self);
        tokio::spawn(async move {
            let result = if pending.add {
                gateway
                    .add_port(pending.proto, pending.port, &internal_ip, pending.port)
                    .await
            } else {
                gateway.remove_port(pending.proto, pending.port).await
            };

            let success = match result {
                Ok(()) => {
                    debug!(
                        port = pending.port,
                        proto = pending.proto.as_str(),
                        add = pending.add,
                        "port mapping operation finished"
                    );
                    let mut leases = this.leases.lock().unwrap();
                    if pending.add {
                        leases.push((pending.port, pending.proto));
                    } else {
                        leases.retain(|l| *l != (pending.port, pending.proto));
                    }
                    true
                }
                Err(err) => {
                    warn!(%err, port = pending.port, "port mapping operation failed");
                    false
                }
            };
            if let Some(callback) = pending.callback {
                callback(success);
            }
        });
    }

    /// Ports currently leased through this controller.
    pub fn leases(&self) -> Vec<(u16, PortProto)> {
        self.leases.lock().unwrap().clone()
    }

    /// Remove every lease this controller added. Best effort, used at
    /// process teardown.
    pub async fn remove_all_mappings(self: &Arc<Self>) {
        let leases = std::mem::take(&mut *self.leases.lock().unwrap());
        let gateway = self.gateway.lock().unwrap().clone();
        let Some(gateway) = gateway else { return };
        for (port, proto) in leases {
            if let Err(err) = gateway.remove_port(proto, port).await {
                warn!(%err, port, "failed to remove port mapping at teardown");
            }
        }
    }
}

/// Fire a mapping callback with `success = false` from a 0-delay
/// timer, never synchronously.
fn fail_async(callback: Option<MappingCallback>) {
    if let Some(callback) = callback {
        tokio::spawn(async move {
            tokio::time::sleep(Duration::ZERO).await;
            callback(false);
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::mpsc;

    /// Discoverer whose outcome the test controls.
    struct MockDiscoverer {
        outcome: Mutex<Result<()>>,
        gateway: Arc<MockGateway>,
        calls: AtomicUsize,
    }

    impl MockDiscoverer {
        fn succeeding() -> Self {
            Self {
                outcome: Mutex::new(Ok(())),
                gateway: Arc::new(MockGateway::default()),
                calls: AtomicUsize::new(0),
            }
        }

        fn failing() -> Self {
            Self {
                outcome: Mutex::new(Err(Error::Network("no gateway".into()))),
                gateway: Arc::new(MockGateway::default()),
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl Discoverer for MockDiscoverer {
        async fn discover(&self) -> Result<Discovery> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match &*self.outcome.lock().unwrap() {
                Ok(()) => Ok(Discovery {
                    gateway: Arc::clone(&self.gateway) as Arc<dyn IgdGateway>,
                    control_url: Some("http://192.168.1.1:49152/ctl".into()),
                    internal_ip: Some("192.168.1.23".into()),
                    public_ip: Some("203.0.113.7".parse().unwrap()),
                }),
                Err(_) => Err(Error::Network("no gateway".into())),
            }
        }
    }

    /// Gateway that records its leases.
    #[derive(Default)]
    struct MockGateway {
        leases: Mutex<HashSet<(u16, &'static str)>>,
    }

    #[async_trait]
    impl IgdGateway for MockGateway {
        async fn add_port(
            &self,
            proto: PortProto,
            external_port: u16,
            _internal_ip: &str,
            _internal_port: u16,
        ) -> Result<()> {
            self.leases.lock().unwrap().insert((external_port, proto.as_str()));
            Ok(())
        }

        async fn remove_port(&self, proto: PortProto, external_port: u16) -> Result<()> {
            self.leases.lock().unwrap().remove(&(external_port, proto.as_str()));
            Ok(())
        }

        async fn external_ip(&self) -> Result<String> {
            Ok("203.0.113.7".into())
        }
    }

    async fn mapped(controller: &Arc<NatController>, port: u16, add: bool) -> bool {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let callback: MappingCallback = Box::new(move |ok| {
            let _ = tx.send(ok);
        });
        if add {
            controller.add_port_mapping(port, PortProto::Tcp, Some(callback));
        } else {
            controller.remove_port_mapping(port, PortProto::Tcp, Some(callback));
        }
        rx.recv().await.unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_status_lattice_on_success() {
        let discoverer = Arc::new(MockDiscoverer::succeeding());
        let controller = Arc::new(NatController::new(discoverer));
        assert_eq!(controller.status(), NatStatus::Undiscovered);
        assert_eq!(controller.public_ip(), None);

        controller.discover();
        assert_eq!(controller.status(), NatStatus::Discovering);

        tokio::task::yield_now().await;
        assert_eq!(controller.status(), NatStatus::Discovered);
        assert_eq!(controller.public_ip(), Some("203.0.113.7".parse().unwrap()));

        // Coalesced: another discover is a no-op.
        controller.discover();
        assert_eq!(controller.status(), NatStatus::Discovered);
    }

    #[tokio::test(start_paused = true)]
    async fn test_network_change_resets() {
        let discoverer = Arc::new(MockDiscoverer::succeeding());
        let controller = Arc::new(NatController::new(discoverer));
        controller.discover();
        tokio::task::yield_now().await;
        assert_eq!(controller.status(), NatStatus::Discovered);

        controller.network_changed();
        assert_eq!(controller.status(), NatStatus::Undiscovered);
        assert_eq!(controller.public_ip(), None);
        assert_eq!(controller.control_url(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_mapping_queued_behind_discovery() {
        let discoverer = Arc::new(MockDiscoverer::succeeding());
        let gateway = Arc::clone(&discoverer.gateway);
        let controller = Arc::new(NatController::new(discoverer));

        // Request before any discovery: it queues, discovery runs, and
        // the mapping lands on the gateway.
        assert!(mapped(&controller, 5060, true).await);
        assert!(gateway.leases.lock().unwrap().contains(&(5060, "TCP")));

        // Add followed by remove leaves no lease behind.
        assert!(mapped(&controller, 5060, false).await);
        assert!(gateway.leases.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_discovery_sticks_then_retries() {
        let discoverer = Arc::new(MockDiscoverer::failing());
        let controller = Arc::new(NatController::new(Arc::clone(&discoverer) as Arc<dyn Discoverer>));

        assert!(!mapped(&controller, 5060, true).await);
        assert_eq!(controller.status(), NatStatus::Unable);
        assert_eq!(discoverer.calls.load(Ordering::SeqCst), 1);

        // Within the backoff window failures are reported without a
        // new discovery attempt.
        assert!(!mapped(&controller, 5061, true).await);
        assert_eq!(discoverer.calls.load(Ordering::SeqCst), 1);

        // After the window a new attempt is allowed.
        tokio::time::advance(Duration::from_secs(301)).await;
        *discoverer.outcome.lock().unwrap() = Ok(());
        assert!(mapped(&controller, 5062, true).await);
        assert_eq!(discoverer.calls.load(Ordering::SeqCst), 2);
        assert_eq!(controller.status(), NatStatus::Discovered);
    }
}
