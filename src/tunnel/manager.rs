//! Tunnel peer registry.
//!
//! Owns the set of cryptographic peers and their assigned tunnel
//! addresses, and drives the wg tooling to keep the kernel interface in
//! sync. Peer deletion notifies observers (the port-forwarding service)
//! before the peer's address could be handed out again, so a departing
//! peer's mappings are revoked while its address is still unambiguous.

use crate::config::{parse_cidr, TunnelConfig};
use crate::telemetry::MetricsRegistry;
use crate::tunnel::keys::{generate_keypair, Keypair};
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::process::Command;
use std::sync::{Arc, RwLock};
use tracing::{debug, info, warn};

/// A tunnel peer.
#[derive(Debug, Clone, Serialize)]
pub struct Peer {
    pub id: String,
    pub name: String,
    pub public_key: String,
    #[serde(skip_serializing)]
    pub private_key: String,
    /// The peer's /32 address inside the tunnel.
    pub address: Ipv4Addr,
    pub created_at: DateTime<Utc>,
    pub enabled: bool,
}

/// Observer invoked with a deleted peer's tunnel address. Observers must
/// not retain references into the registry; they get the address only.
pub type PeerRemovedHook = Box<dyn Fn(Ipv4Addr) + Send + Sync>;

/// Command surface to the wg tooling, separated out so tests can observe
/// peer operations without a kernel interface.
pub trait WgControl: Send + Sync {
    fn add_peer(&self, interface: &str, public_key: &str, allowed_ip: Ipv4Addr) -> Result<()>;
    fn remove_peer(&self, interface: &str, public_key: &str) -> Result<()>;
    fn server_public_key(&self, interface: &str) -> Result<String>;
    fn interface_exists(&self, interface: &str) -> bool;
    fn bring_up(&self, interface: &str, config: &str) -> Result<()>;
}

/// Production implementation driving `wg` and `wg-quick`.
#[derive(Debug, Default)]
pub struct WgCli;

impl WgCli {
    pub fn new() -> Self {
        Self
    }

    fn run(program: &str, args: &[&str]) -> Result<String> {
        let output = Command::new(program).args(args).output().map_err(Error::Io)?;
        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
        } else {
            Err(Error::Command {
                program: program.to_string(),
                message: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            })
        }
    }
}

impl WgControl for WgCli {
    fn add_peer(&self, interface: &str, public_key: &str, allowed_ip: Ipv4Addr) -> Result<()> {
        Self::run(
            "wg",
            &[
                "set",
                interface,
                "peer",
                public_key,
                "allowed-ips",
                &format!("{}/32", allowed_ip),
            ],
        )
        .map(|_| ())
    }

    fn remove_peer(&self, interface: &str, public_key: &str) -> Result<()> {
        Self::run("wg", &["set", interface, "peer", public_key, "remove"]).map(|_| ())
    }

    fn server_public_key(&self, interface: &str) -> Result<String> {
        Self::run("wg", &["show", interface, "public-key"])
    }

    fn interface_exists(&self, interface: &str) -> bool {
        std::path::Path::new("/sys/class/net").join(interface).exists()
    }

    fn bring_up(&self, interface: &str, config: &str) -> Result<()> {
        use std::io::Write as _;
        use std::os::unix::fs::OpenOptionsExt as _;

        let path = format!("/etc/wireguard/{}.conf", interface);
        let mut file = std::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(&path)
            .map_err(Error::Io)?;
        file.write_all(config.as_bytes()).map_err(Error::Io)?;

        Self::run("wg-quick", &["up", interface]).map(|_| ())
    }
}

struct PeerRegistry {
    peers: HashMap<String, Peer>,
    /// Host index of the next peer address. The server holds .1; peers
    /// start at .2. Indices are not recycled.
    next_host: u32,
}

/// The tunnel manager.
pub struct TunnelManager {
    config: TunnelConfig,
    wg: Box<dyn WgControl>,
    registry: RwLock<PeerRegistry>,
    hooks: RwLock<Vec<PeerRemovedHook>>,
    metrics: Arc<MetricsRegistry>,
}

impl TunnelManager {
    pub fn new(config: TunnelConfig, metrics: Arc<MetricsRegistry>) -> Self {
        Self::with_control(config, Box::new(WgCli::new()), metrics)
    }

    /// Construct with an explicit wg backend (tests).
    pub fn with_control(
        config: TunnelConfig,
        wg: Box<dyn WgControl>,
        metrics: Arc<MetricsRegistry>,
    ) -> Self {
        Self {
            config,
            wg,
            registry: RwLock::new(PeerRegistry {
                peers: HashMap::new(),
                next_host: 2,
            }),
            hooks: RwLock::new(Vec::new()),
            metrics,
        }
    }

    /// Register an observer for peer deletion. The hook runs inside
    /// `delete_peer`, before the record is dropped.
    pub fn on_peer_removed(&self, hook: PeerRemovedHook) {
        self.hooks.write().unwrap().push(hook);
    }

    /// Make sure the wg interface exists, creating and bringing it up if
    /// necessary.
    pub fn ensure_interface(&self) -> Result<()> {
        if self.wg.interface_exists(&self.config.interface) {
            debug!("interface {} already up", self.config.interface);
            return Ok(());
        }

        let keypair = generate_keypair();
        let config = render_interface_config(&self.config, &keypair);
        info!("creating tunnel interface {}", self.config.interface);
        self.wg.bring_up(&self.config.interface, &config)
    }

    /// Create a peer: generate a keypair, assign the next free tunnel
    /// address, and register it with the interface.
    pub fn create_peer(&self, name: &str) -> Result<Peer> {
        let keypair = generate_keypair();

        let mut registry = self.registry.write().unwrap();
        let (address, host) = self.allocate_address(registry.next_host)?;

        let peer = Peer {
            id: format!("peer-{}", host),
            name: name.to_string(),
            public_key: keypair.public.clone(),
            private_key: keypair.private,
            address,
            created_at: Utc::now(),
            enabled: true,
        };

        self.wg
            .add_peer(&self.config.interface, &peer.public_key, peer.address)?;

        registry.next_host = host + 1;
        registry.peers.insert(peer.id.clone(), peer.clone());
        self.metrics.set_peers_active(registry.peers.len());
        info!("created peer {} ({}) at {}", peer.id, peer.name, peer.address);

        Ok(peer)
    }

    /// Delete a peer: deregister it from the interface, notify observers
    /// with its address, then drop the record.
    pub fn delete_peer(&self, id: &str) -> Result<()> {
        let mut registry = self.registry.write().unwrap();
        let peer = registry
            .peers
            .get(id)
            .cloned()
            .ok_or_else(|| Error::PeerNotFound { id: id.to_string() })?;

        self.wg
            .remove_peer(&self.config.interface, &peer.public_key)?;

        // Observers run before the record goes away, so in-flight requests
        // from this address find their mappings already revoked.
        for hook in self.hooks.read().unwrap().iter() {
            hook(peer.address);
        }

        registry.peers.remove(id);
        self.metrics.set_peers_active(registry.peers.len());
        info!("deleted peer {} ({})", id, peer.address);

        Ok(())
    }

    /// All peers.
    pub fn peers(&self) -> Vec<Peer> {
        self.registry.read().unwrap().peers.values().cloned().collect()
    }

    /// One peer by id.
    pub fn peer(&self, id: &str) -> Option<Peer> {
        self.registry.read().unwrap().peers.get(id).cloned()
    }

    /// Render the config file a client imports to join the tunnel.
    pub fn client_config(&self, id: &str) -> Result<String> {
        let peer = self
            .peer(id)
            .ok_or_else(|| Error::PeerNotFound { id: id.to_string() })?;

        let server_public_key = match self.wg.server_public_key(&self.config.interface) {
            Ok(key) => key,
            Err(e) => {
                warn!("could not read server public key: {}", e);
                String::new()
            }
        };

        Ok(format!(
            "[Interface]\n\
             PrivateKey = {}\n\
             Address = {}/32\n\
             DNS = 1.1.1.1\n\
             \n\
             [Peer]\n\
             PublicKey = {}\n\
             Endpoint = {}\n\
             AllowedIPs = 0.0.0.0/0\n\
             PersistentKeepalive = 25\n",
            peer.private_key, peer.address, server_public_key, self.config.endpoint
        ))
    }

    /// Next free peer address in the tunnel subnet.
    fn allocate_address(&self, mut host: u32) -> Result<(Ipv4Addr, u32)> {
        let (server_ip, prefix) = parse_cidr(&self.config.address_v4)?;

        let mask = if prefix == 0 {
            0
        } else {
            !0u32 << (32 - prefix)
        };
        let network = u32::from(server_ip) & mask;
        let broadcast = network | !mask;

        loop {
            let candidate = network
                .checked_add(host)
                .ok_or_else(|| Error::Config("tunnel address pool exhausted".to_string()))?;
            if candidate >= broadcast {
                return Err(Error::Config("tunnel address pool exhausted".to_string()));
            }
            if candidate != u32::from(server_ip) {
                return Ok((Ipv4Addr::from(candidate), host));
            }
            host += 1;
        }
    }
}

fn render_interface_config(config: &TunnelConfig, keypair: &Keypair) -> String {
    format!(
        "[Interface]\n\
         PrivateKey = {}\n\
         Address = {}\n\
         ListenPort = {}\n\
         PostUp = iptables -A FORWARD -i %i -j ACCEPT; iptables -t nat -A POSTROUTING -o eth0 -j MASQUERADE\n\
         PostDown = iptables -D FORWARD -i %i -j ACCEPT; iptables -t nat -D POSTROUTING -o eth0 -j MASQUERADE\n",
        keypair.private, config.address_v4, config.listen_port
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct MockWg {
        added: Mutex<Vec<(String, Ipv4Addr)>>,
        removed: Mutex<Vec<String>>,
        exists: std::sync::atomic::AtomicBool,
        brought_up: Mutex<Vec<String>>,
    }

    impl WgControl for MockWg {
        fn add_peer(&self, _interface: &str, public_key: &str, allowed_ip: Ipv4Addr) -> Result<()> {
            self.added
                .lock()
                .unwrap()
                .push((public_key.to_string(), allowed_ip));
            Ok(())
        }

        fn remove_peer(&self, _interface: &str, public_key: &str) -> Result<()> {
            self.removed.lock().unwrap().push(public_key.to_string());
            Ok(())
        }

        fn server_public_key(&self, _interface: &str) -> Result<String> {
            Ok("SERVER_PUBLIC_KEY".to_string())
        }

        fn interface_exists(&self, _interface: &str) -> bool {
            self.exists.load(std::sync::atomic::Ordering::SeqCst)
        }

        fn bring_up(&self, interface: &str, _config: &str) -> Result<()> {
            self.brought_up.lock().unwrap().push(interface.to_string());
            Ok(())
        }
    }

    fn manager() -> (Arc<MockWg>, TunnelManager) {
        manager_with_subnet("10.8.0.1/24")
    }

    fn manager_with_subnet(address_v4: &str) -> (Arc<MockWg>, TunnelManager) {
        let wg = Arc::new(MockWg::default());

        struct Shared(Arc<MockWg>);
        impl WgControl for Shared {
            fn add_peer(&self, i: &str, k: &str, a: Ipv4Addr) -> Result<()> {
                self.0.add_peer(i, k, a)
            }
            fn remove_peer(&self, i: &str, k: &str) -> Result<()> {
                self.0.remove_peer(i, k)
            }
            fn server_public_key(&self, i: &str) -> Result<String> {
                self.0.server_public_key(i)
            }
            fn interface_exists(&self, i: &str) -> bool {
                self.0.interface_exists(i)
            }
            fn bring_up(&self, i: &str, c: &str) -> Result<()> {
                self.0.bring_up(i, c)
            }
        }

        let config = TunnelConfig {
            address_v4: address_v4.to_string(),
            endpoint: "vpn.example.com:51820".to_string(),
            ..TunnelConfig::default()
        };
        let manager = TunnelManager::with_control(
            config,
            Box::new(Shared(wg.clone())),
            Arc::new(MetricsRegistry::new()),
        );
        (wg, manager)
    }

    #[test]
    fn test_create_peer_allocates_sequential_addresses() {
        let (wg, manager) = manager();

        let first = manager.create_peer("laptop").unwrap();
        let second = manager.create_peer("phone").unwrap();

        assert_eq!(first.address, Ipv4Addr::new(10, 8, 0, 2));
        assert_eq!(second.address, Ipv4Addr::new(10, 8, 0, 3));
        assert_eq!(first.id, "peer-2");
        assert_eq!(second.id, "peer-3");
        assert_eq!(wg.added.lock().unwrap().len(), 2);
        assert_eq!(manager.peers().len(), 2);
    }

    #[test]
    fn test_address_pool_exhaustion() {
        // /30: network .0, server .1, one usable peer slot .2, broadcast .3
        let (_, manager) = manager_with_subnet("10.8.0.1/30");

        manager.create_peer("only").unwrap();
        assert!(manager.create_peer("one-too-many").is_err());
    }

    #[test]
    fn test_allocation_skips_server_address() {
        // Server sits mid-subnet; .2 must be skipped when it is the server.
        let (_, manager) = manager_with_subnet("10.8.0.2/29");
        let peer = manager.create_peer("p").unwrap();
        assert_eq!(peer.address, Ipv4Addr::new(10, 8, 0, 3));
    }

    #[test]
    fn test_delete_peer_fires_hook_before_removal() {
        let (wg, manager) = manager();
        let seen: Arc<Mutex<Vec<Ipv4Addr>>> = Arc::new(Mutex::new(Vec::new()));

        let seen_hook = seen.clone();
        manager.on_peer_removed(Box::new(move |addr| {
            seen_hook.lock().unwrap().push(addr);
        }));

        let peer = manager.create_peer("laptop").unwrap();
        manager.delete_peer(&peer.id).unwrap();

        assert_eq!(*seen.lock().unwrap(), vec![peer.address]);
        assert!(manager.peer(&peer.id).is_none());
        assert_eq!(*wg.removed.lock().unwrap(), vec![peer.public_key]);
    }

    #[test]
    fn test_delete_unknown_peer_errors() {
        let (_, manager) = manager();
        assert!(manager.delete_peer("peer-99").is_err());
    }

    #[test]
    fn test_client_config_render() {
        let (_, manager) = manager();
        let peer = manager.create_peer("laptop").unwrap();

        let rendered = manager.client_config(&peer.id).unwrap();
        assert!(rendered.contains(&format!("PrivateKey = {}", peer.private_key)));
        assert!(rendered.contains("Address = 10.8.0.2/32"));
        assert!(rendered.contains("PublicKey = SERVER_PUBLIC_KEY"));
        assert!(rendered.contains("Endpoint = vpn.example.com:51820"));
    }

    #[test]
    fn test_ensure_interface_brings_up_missing() {
        let (wg, manager) = manager();
        manager.ensure_interface().unwrap();
        assert_eq!(wg.brought_up.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_ensure_interface_skips_existing() {
        let (wg, manager) = manager();
        wg.exists.store(true, std::sync::atomic::Ordering::SeqCst);
        manager.ensure_interface().unwrap();
        assert!(wg.brought_up.lock().unwrap().is_empty());
    }
}
