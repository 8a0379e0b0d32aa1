//! NAT-PMP request handling against the mapping table and the effector.
//!
//! Every decoded request produces a response; errors surface to clients as
//! result codes, never as silence. The table's write lock is held across
//! effector calls so the table and the host rules cannot diverge.

use crate::config::PortForwardConfig;
use crate::portmap::effector::RuleEffector;
use crate::portmap::table::{Mapping, MappingKey, MappingTable, NATPMP_DESCRIPTION};
use crate::protocol::natpmp::{epoch_seconds, Request, Response, ResultCode};
use crate::protocol::Protocol;
use crate::telemetry::MetricsRegistry;
use chrono::{DateTime, Utc};
use std::net::Ipv4Addr;
use std::sync::{Arc, RwLock};
use tracing::{debug, info, warn};

/// Shared state of the port-forwarding service: the mapping table, the
/// rule effector, and the resolved public address.
pub struct PortMapService {
    table: RwLock<MappingTable>,
    effector: Box<dyn RuleEffector>,
    external_ip: Ipv4Addr,
    metrics: Arc<MetricsRegistry>,
}

impl PortMapService {
    pub fn new(
        config: &PortForwardConfig,
        effector: Box<dyn RuleEffector>,
        external_ip: Ipv4Addr,
        metrics: Arc<MetricsRegistry>,
    ) -> Self {
        Self {
            table: RwLock::new(MappingTable::new(
                config.min_port,
                config.max_port,
                config.max_per_client,
            )),
            effector,
            external_ip,
            metrics,
        }
    }

    /// The public IPv4 reported in public-address responses.
    pub fn external_ip(&self) -> Ipv4Addr {
        self.external_ip
    }

    /// Handle one decoded request from `client_ip`.
    pub fn handle(&self, client_ip: Ipv4Addr, request: Request) -> Response {
        match request {
            Request::PublicAddress => self.handle_public_address(client_ip),
            Request::Map {
                protocol,
                internal_port,
                suggested_external_port,
                lifetime: 0,
            } => self.handle_delete(client_ip, protocol, internal_port, suggested_external_port),
            Request::Map {
                protocol,
                internal_port,
                suggested_external_port,
                lifetime,
            } => self.handle_map(
                client_ip,
                protocol,
                internal_port,
                suggested_external_port,
                lifetime,
            ),
        }
    }

    fn handle_public_address(&self, client_ip: Ipv4Addr) -> Response {
        debug!("public address request from {}", client_ip);
        Response::PublicAddress {
            result: ResultCode::Success,
            epoch: epoch_seconds(),
            external_ip: self.external_ip,
        }
    }

    /// Zero-lifetime mapping request: delete. The protocol requires a
    /// success answer whether or not the mapping existed.
    fn handle_delete(
        &self,
        client_ip: Ipv4Addr,
        protocol: Protocol,
        internal_port: u16,
        external_port: u16,
    ) -> Response {
        let key = MappingKey {
            client_ip,
            external_port,
            protocol,
        };

        let mut table = self.table.write().unwrap();
        if let Some(mapping) = table.remove(&key) {
            self.effector.remove_mapping(
                mapping.client_ip,
                mapping.external_port,
                mapping.internal_port,
                mapping.protocol,
            );
            self.metrics.mappings_removed.inc();
            self.metrics.set_mappings_active(table.len());
            info!(
                "removed {} port {} for {}",
                protocol, external_port, client_ip
            );
        } else {
            debug!(
                "delete for unknown mapping {}:{} from {}",
                protocol, external_port, client_ip
            );
        }

        Response::Map {
            protocol,
            result: ResultCode::Success,
            epoch: epoch_seconds(),
            internal_port,
            external_port,
            lifetime: 0,
        }
    }

    fn handle_map(
        &self,
        client_ip: Ipv4Addr,
        protocol: Protocol,
        internal_port: u16,
        suggested_external_port: u16,
        lifetime: u32,
    ) -> Response {
        let refused = |result: ResultCode| Response::Map {
            protocol,
            result,
            epoch: epoch_seconds(),
            internal_port,
            external_port: 0,
            lifetime,
        };

        let mut table = self.table.write().unwrap();

        let external_port = if suggested_external_port != 0 {
            suggested_external_port
        } else {
            match table.allocate_port(protocol) {
                Some(port) => port,
                None => {
                    warn!("no free {} port for {}", protocol, client_ip);
                    return refused(ResultCode::OutOfResources);
                }
            }
        };

        let key = MappingKey {
            client_ip,
            external_port,
            protocol,
        };
        let renewing = table.contains(&key);

        if let Err(e) = table.insert_or_renew(key, internal_port, lifetime, NATPMP_DESCRIPTION) {
            debug!("refused mapping for {}: {}", client_ip, e);
            return refused(ResultCode::OutOfResources);
        }

        if let Err(e) = self
            .effector
            .add_mapping(client_ip, external_port, internal_port, protocol)
        {
            warn!(
                "rule apply failed for {}:{} -> {}:{}: {}",
                protocol, external_port, client_ip, internal_port, e
            );
            table.remove(&key);
            self.metrics.rule_failures.inc();
            self.metrics.set_mappings_active(table.len());
            return refused(ResultCode::NetworkFailure);
        }

        if renewing {
            self.metrics.mappings_renewed.inc();
        } else {
            self.metrics.mappings_created.inc();
        }
        self.metrics.set_mappings_active(table.len());
        info!(
            "{} {} port {} -> {}:{} (lifetime {}s)",
            if renewing { "renewed" } else { "added" },
            protocol,
            external_port,
            client_ip,
            internal_port,
            lifetime
        );

        Response::Map {
            protocol,
            result: ResultCode::Success,
            epoch: epoch_seconds(),
            internal_port,
            external_port,
            lifetime,
        }
    }

    /// Remove every mapping whose expiry is at or before `now`, revoking
    /// rules. Returns the number removed.
    pub fn sweep_expired(&self, now: DateTime<Utc>) -> usize {
        let mut table = self.table.write().unwrap();
        let expired = table.expired(now);
        for key in &expired {
            if let Some(mapping) = table.remove(key) {
                info!(
                    "expired mapping {}:{} for {}",
                    mapping.protocol, mapping.external_port, mapping.client_ip
                );
                self.effector.remove_mapping(
                    mapping.client_ip,
                    mapping.external_port,
                    mapping.internal_port,
                    mapping.protocol,
                );
                self.metrics.mappings_expired.inc();
            }
        }
        self.metrics.set_mappings_active(table.len());
        expired.len()
    }

    /// Remove one mapping on behalf of the admin plane, revoking its rules.
    /// Unlike the wire-protocol delete this reports whether the mapping
    /// existed.
    pub fn remove_mapping(
        &self,
        client_ip: Ipv4Addr,
        external_port: u16,
        protocol: Protocol,
    ) -> bool {
        let key = MappingKey {
            client_ip,
            external_port,
            protocol,
        };

        let mut table = self.table.write().unwrap();
        match table.remove(&key) {
            Some(mapping) => {
                self.effector.remove_mapping(
                    mapping.client_ip,
                    mapping.external_port,
                    mapping.internal_port,
                    mapping.protocol,
                );
                self.metrics.mappings_removed.inc();
                self.metrics.set_mappings_active(table.len());
                info!(
                    "removed {} port {} for {} (admin)",
                    protocol, external_port, client_ip
                );
                true
            }
            None => false,
        }
    }

    /// Revoke every mapping owned by `client_ip` (tunnel-peer deletion).
    /// Returns the number removed.
    pub fn revoke_client(&self, client_ip: Ipv4Addr) -> usize {
        let mut table = self.table.write().unwrap();
        let keys = table.client_keys(client_ip);
        for key in &keys {
            if let Some(mapping) = table.remove(key) {
                self.effector.remove_mapping(
                    mapping.client_ip,
                    mapping.external_port,
                    mapping.internal_port,
                    mapping.protocol,
                );
                self.metrics.mappings_removed.inc();
            }
        }
        if !keys.is_empty() {
            info!("revoked {} mappings for departed peer {}", keys.len(), client_ip);
        }
        self.metrics.set_mappings_active(table.len());
        keys.len()
    }

    /// Revoke every mapping and empty the table (shutdown teardown).
    pub fn revoke_all(&self) {
        let mut table = self.table.write().unwrap();
        for mapping in table.drain() {
            self.effector.remove_mapping(
                mapping.client_ip,
                mapping.external_port,
                mapping.internal_port,
                mapping.protocol,
            );
        }
        self.metrics.set_mappings_active(0);
    }

    /// Snapshot of every active mapping.
    pub fn mappings(&self) -> Vec<Mapping> {
        self.table.read().unwrap().snapshot()
    }

    /// Snapshot of the mappings owned by `client_ip`.
    pub fn client_mappings(&self, client_ip: Ipv4Addr) -> Vec<Mapping> {
        self.table.read().unwrap().client_mappings(client_ip)
    }
}
