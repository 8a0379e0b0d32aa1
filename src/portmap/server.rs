//! Lifecycle owner of the in-tunnel NAT-PMP service.
//!
//! Binds the UDP socket on the tunnel-internal address, runs the request
//! loop and the expiry reaper, and tears everything down on stop. A failed
//! bind disables the feature without failing the process: the tunnel works,
//! clients simply get no port forwarding.

use crate::config::{PortForwardConfig, TunnelConfig};
use crate::portmap::effector::RuleEffector;
use crate::portmap::handler::PortMapService;
use crate::portmap::resolver::resolve_external_ip;
use crate::portmap::table::Mapping;
use crate::protocol::natpmp::{Request, MAX_DATAGRAM_SIZE, NATPMP_PORT};
use crate::protocol::Protocol;
use crate::telemetry::MetricsRegistry;
use crate::{Error, Result};
use chrono::Utc;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

/// How often the reaper looks for expired mappings.
const REAP_INTERVAL: Duration = Duration::from_secs(30);

/// The running (or disabled) port-forwarding server.
pub struct PortForwardServer {
    service: Option<Arc<PortMapService>>,
    local_addr: Option<SocketAddr>,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl PortForwardServer {
    /// Start the service as configured: resolve the public endpoint and
    /// bind (tunnel address, 5351). Any startup failure logs a warning and
    /// yields a disabled server; the process carries on.
    pub async fn start(
        tunnel: &TunnelConfig,
        config: PortForwardConfig,
        effector: Box<dyn RuleEffector>,
        metrics: Arc<MetricsRegistry>,
    ) -> Self {
        if !config.enabled {
            info!("port forwarding disabled in config");
            return Self::disabled();
        }

        let bind_ip = match tunnel.server_ip() {
            Ok(ip) => ip,
            Err(e) => {
                warn!("port forwarding disabled: bad tunnel address: {}", e);
                return Self::disabled();
            }
        };

        let external_ip = resolve_external_ip(&tunnel.endpoint);
        let addr = SocketAddrV4::new(bind_ip, NATPMP_PORT);
        match Self::bind(addr, config, effector, external_ip, metrics).await {
            Ok(server) => {
                info!("port forwarding enabled, NAT-PMP on {}", addr);
                server
            }
            Err(e) => {
                warn!("port forwarding disabled: cannot bind {}: {}", addr, e);
                Self::disabled()
            }
        }
    }

    /// Bind an explicit address and spawn the request loop and reaper.
    /// Integration tests use this with 127.0.0.1:0.
    pub async fn bind(
        addr: SocketAddrV4,
        config: PortForwardConfig,
        effector: Box<dyn RuleEffector>,
        external_ip: Ipv4Addr,
        metrics: Arc<MetricsRegistry>,
    ) -> Result<Self> {
        let socket = UdpSocket::bind(addr).await.map_err(Error::Io)?;
        let local_addr = socket.local_addr().map_err(Error::Io)?;

        let service = Arc::new(PortMapService::new(
            &config,
            effector,
            external_ip,
            metrics.clone(),
        ));
        debug!(
            "NAT-PMP bound on {}, public address {}",
            local_addr,
            service.external_ip()
        );
        let (shutdown, _) = watch::channel(false);

        let request_task = tokio::spawn(request_loop(
            Arc::new(socket),
            service.clone(),
            metrics,
            shutdown.subscribe(),
        ));
        let reaper_task = tokio::spawn(reaper_loop(service.clone(), shutdown.subscribe()));

        Ok(Self {
            service: Some(service),
            local_addr: Some(local_addr),
            shutdown,
            tasks: Mutex::new(vec![request_task, reaper_task]),
        })
    }

    fn disabled() -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            service: None,
            local_addr: None,
            shutdown,
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.service.is_some()
    }

    /// Address the NAT-PMP socket is bound to.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.local_addr.ok_or(Error::Disabled)
    }

    /// Snapshot of every active mapping. Empty when disabled.
    pub fn mappings(&self) -> Vec<Mapping> {
        self.service
            .as_ref()
            .map(|s| s.mappings())
            .unwrap_or_default()
    }

    /// Snapshot of the mappings owned by one client. Empty when disabled.
    pub fn client_mappings(&self, client_ip: Ipv4Addr) -> Vec<Mapping> {
        self.service
            .as_ref()
            .map(|s| s.client_mappings(client_ip))
            .unwrap_or_default()
    }

    /// Remove one mapping on behalf of the admin plane. Returns whether
    /// the mapping existed. Always false when disabled.
    pub fn remove_mapping(
        &self,
        client_ip: Ipv4Addr,
        external_port: u16,
        protocol: Protocol,
    ) -> bool {
        self.service
            .as_ref()
            .map(|s| s.remove_mapping(client_ip, external_port, protocol))
            .unwrap_or(false)
    }

    /// Revoke every mapping owned by `client_ip`. Called by the tunnel
    /// manager when it deletes a peer. Returns the number removed.
    pub fn revoke_client(&self, client_ip: Ipv4Addr) -> usize {
        self.service
            .as_ref()
            .map(|s| s.revoke_client(client_ip))
            .unwrap_or(0)
    }

    /// Stop the tasks and revoke every rule installed by this process.
    /// Safe to call twice, and on a server that never fully started.
    pub async fn stop(&self) {
        let _ = self.shutdown.send(true);

        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().unwrap().drain(..).collect();
        for task in tasks {
            let _ = task.await;
        }

        if let Some(service) = &self.service {
            service.revoke_all();
            info!("port forwarding stopped, all rules revoked");
        }
    }
}

/// Read datagrams and answer them inline. Requests from one client are
/// processed in arrival order; a socket error is terminal.
async fn request_loop(
    socket: Arc<UdpSocket>,
    service: Arc<PortMapService>,
    metrics: Arc<MetricsRegistry>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut buf = [0u8; MAX_DATAGRAM_SIZE];

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            result = socket.recv_from(&mut buf) => {
                let (len, src) = match result {
                    Ok(received) => received,
                    Err(e) => {
                        warn!("NAT-PMP socket read error: {}", e);
                        break;
                    }
                };
                metrics.requests_received.inc();

                let SocketAddr::V4(src_v4) = src else {
                    continue;
                };

                let Some(request) = Request::parse(&buf[..len]) else {
                    trace!("dropping malformed datagram from {}", src);
                    metrics.dropped_malformed.inc();
                    continue;
                };

                let response = service.handle(*src_v4.ip(), request);
                match socket.send_to(&response.encode(), src).await {
                    Ok(_) => metrics.responses_sent.inc(),
                    Err(e) => {
                        // No retry; the client retransmits.
                        warn!("failed to send response to {}: {}", src, e);
                        metrics.send_errors.inc();
                    }
                }
            }
        }
    }
    debug!("NAT-PMP request loop stopped");
}

/// Periodically remove expired mappings and revoke their rules.
async fn reaper_loop(service: Arc<PortMapService>, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(REAP_INTERVAL);
    // Consume the immediate first tick.
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = ticker.tick() => {
                let removed = service.sweep_expired(Utc::now());
                if removed > 0 {
                    debug!("reaped {} expired mappings", removed);
                }
            }
        }
    }
    debug!("mapping reaper stopped");
}
