//! In-memory index of active port mappings.
//!
//! The table is the single source of truth for which external ports are
//! forwarded where. External ports are a global resource: no two mappings
//! may share (external port, protocol), regardless of owner.

use crate::protocol::Protocol;
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::net::Ipv4Addr;

/// Description attached to mappings created over the wire protocol.
pub const NATPMP_DESCRIPTION: &str = "natpmp";

/// Unique identity of a mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MappingKey {
    pub client_ip: Ipv4Addr,
    pub external_port: u16,
    pub protocol: Protocol,
}

/// An active port mapping.
#[derive(Debug, Clone, Serialize)]
pub struct Mapping {
    pub client_ip: Ipv4Addr,
    pub external_port: u16,
    pub internal_port: u16,
    pub protocol: Protocol,
    pub description: String,
    /// Requested lifetime in seconds, as received.
    pub lifetime: u32,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl Mapping {
    /// The table key of this mapping.
    pub fn key(&self) -> MappingKey {
        MappingKey {
            client_ip: self.client_ip,
            external_port: self.external_port,
            protocol: self.protocol,
        }
    }
}

/// Why an insert-or-renew was rejected.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum InsertError {
    #[error("external port {port} outside allowed range {min}-{max}")]
    OutOfRange { port: u16, min: u16, max: u16 },

    #[error("external port {port}/{protocol} is held by {holder}")]
    Conflict {
        port: u16,
        protocol: Protocol,
        holder: Ipv4Addr,
    },

    #[error("client {client} reached the mapping quota of {quota}")]
    QuotaExceeded { client: Ipv4Addr, quota: usize },
}

/// Mapping table with the allowed port window and per-client quota baked in.
#[derive(Debug)]
pub struct MappingTable {
    entries: HashMap<MappingKey, Mapping>,
    min_port: u16,
    max_port: u16,
    max_per_client: usize,
}

impl MappingTable {
    pub fn new(min_port: u16, max_port: u16, max_per_client: usize) -> Self {
        Self {
            entries: HashMap::new(),
            min_port,
            max_port,
            max_per_client,
        }
    }

    /// Insert a new mapping or renew an existing one.
    ///
    /// Renewal (same key) refreshes `created_at`/`expires_at` and the
    /// internal port. A zero lifetime is a protocol-level deletion and must
    /// never reach this method.
    pub fn insert_or_renew(
        &mut self,
        key: MappingKey,
        internal_port: u16,
        lifetime: u32,
        description: &str,
    ) -> Result<&Mapping, InsertError> {
        if key.external_port < self.min_port || key.external_port > self.max_port {
            return Err(InsertError::OutOfRange {
                port: key.external_port,
                min: self.min_port,
                max: self.max_port,
            });
        }

        if let Some(holder) = self.port_holder(key.external_port, key.protocol) {
            if holder != key.client_ip {
                return Err(InsertError::Conflict {
                    port: key.external_port,
                    protocol: key.protocol,
                    holder,
                });
            }
        }

        // Renewals do not count against the quota.
        if !self.entries.contains_key(&key)
            && self.client_count(key.client_ip) >= self.max_per_client
        {
            return Err(InsertError::QuotaExceeded {
                client: key.client_ip,
                quota: self.max_per_client,
            });
        }

        let now = Utc::now();
        let mapping = Mapping {
            client_ip: key.client_ip,
            external_port: key.external_port,
            internal_port,
            protocol: key.protocol,
            description: description.to_string(),
            lifetime,
            created_at: now,
            expires_at: now + Duration::seconds(i64::from(lifetime)),
        };

        self.entries.insert(key, mapping);
        Ok(&self.entries[&key])
    }

    /// Remove a mapping, returning it if present.
    pub fn remove(&mut self, key: &MappingKey) -> Option<Mapping> {
        self.entries.remove(key)
    }

    pub fn get(&self, key: &MappingKey) -> Option<&Mapping> {
        self.entries.get(key)
    }

    pub fn contains(&self, key: &MappingKey) -> bool {
        self.entries.contains_key(key)
    }

    /// Lowest free external port in the allowed range for `protocol`, or
    /// `None` when the range is exhausted.
    pub fn allocate_port(&self, protocol: Protocol) -> Option<u16> {
        (self.min_port..=self.max_port).find(|&port| self.port_holder(port, protocol).is_none())
    }

    /// All mappings owned by `client_ip`.
    pub fn client_mappings(&self, client_ip: Ipv4Addr) -> Vec<Mapping> {
        self.entries
            .values()
            .filter(|m| m.client_ip == client_ip)
            .cloned()
            .collect()
    }

    /// Keys of all mappings owned by `client_ip`.
    pub fn client_keys(&self, client_ip: Ipv4Addr) -> Vec<MappingKey> {
        self.entries
            .values()
            .filter(|m| m.client_ip == client_ip)
            .map(Mapping::key)
            .collect()
    }

    /// Keys of every mapping with `expires_at <= now`.
    pub fn expired(&self, now: DateTime<Utc>) -> Vec<MappingKey> {
        self.entries
            .values()
            .filter(|m| m.expires_at <= now)
            .map(Mapping::key)
            .collect()
    }

    /// Snapshot of every mapping, for the admin plane.
    pub fn snapshot(&self) -> Vec<Mapping> {
        self.entries.values().cloned().collect()
    }

    /// Remove and return every mapping (shutdown teardown).
    pub fn drain(&mut self) -> Vec<Mapping> {
        self.entries.drain().map(|(_, m)| m).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Who currently holds (external port, protocol), if anyone.
    fn port_holder(&self, external_port: u16, protocol: Protocol) -> Option<Ipv4Addr> {
        self.entries
            .values()
            .find(|m| m.external_port == external_port && m.protocol == protocol)
            .map(|m| m.client_ip)
    }

    fn client_count(&self, client_ip: Ipv4Addr) -> usize {
        self.entries
            .values()
            .filter(|m| m.client_ip == client_ip)
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client(last: u8) -> Ipv4Addr {
        Ipv4Addr::new(10, 8, 0, last)
    }

    fn key(last: u8, port: u16, protocol: Protocol) -> MappingKey {
        MappingKey {
            client_ip: client(last),
            external_port: port,
            protocol,
        }
    }

    fn table() -> MappingTable {
        MappingTable::new(1024, 65535, 10)
    }

    #[test]
    fn test_insert_and_get() {
        let mut table = table();
        table
            .insert_or_renew(key(2, 8080, Protocol::Tcp), 80, 3600, NATPMP_DESCRIPTION)
            .unwrap();

        let mapping = table.get(&key(2, 8080, Protocol::Tcp)).unwrap();
        assert_eq!(mapping.internal_port, 80);
        assert_eq!(mapping.lifetime, 3600);
        assert!(mapping.expires_at > mapping.created_at);
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_out_of_range_rejected() {
        let mut table = MappingTable::new(20000, 30000, 10);

        let low = table.insert_or_renew(key(2, 19999, Protocol::Tcp), 80, 60, "x");
        assert!(matches!(low, Err(InsertError::OutOfRange { .. })));

        let high = table.insert_or_renew(key(2, 30001, Protocol::Tcp), 80, 60, "x");
        assert!(matches!(high, Err(InsertError::OutOfRange { .. })));

        assert!(table.is_empty());
    }

    #[test]
    fn test_conflict_with_other_client() {
        let mut table = table();
        table
            .insert_or_renew(key(2, 8080, Protocol::Tcp), 80, 3600, "x")
            .unwrap();

        let err = table
            .insert_or_renew(key(3, 8080, Protocol::Tcp), 80, 3600, "x")
            .unwrap_err();
        assert_eq!(
            err,
            InsertError::Conflict {
                port: 8080,
                protocol: Protocol::Tcp,
                holder: client(2),
            }
        );
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_same_port_different_protocol_no_conflict() {
        let mut table = table();
        table
            .insert_or_renew(key(2, 8080, Protocol::Tcp), 80, 60, "x")
            .unwrap();
        table
            .insert_or_renew(key(3, 8080, Protocol::Udp), 80, 60, "x")
            .unwrap();
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn test_renew_updates_expiry_not_count() {
        let mut table = table();
        let k = key(2, 8080, Protocol::Tcp);
        table.insert_or_renew(k, 80, 60, "x").unwrap();
        let first_expiry = table.get(&k).unwrap().expires_at;

        table.insert_or_renew(k, 80, 7200, "x").unwrap();
        let renewed = table.get(&k).unwrap();
        assert_eq!(table.len(), 1);
        assert_eq!(renewed.lifetime, 7200);
        assert!(renewed.expires_at > first_expiry);
    }

    #[test]
    fn test_quota_enforced_per_client() {
        let mut table = MappingTable::new(1024, 65535, 2);
        table
            .insert_or_renew(key(2, 2000, Protocol::Tcp), 80, 60, "x")
            .unwrap();
        table
            .insert_or_renew(key(2, 2001, Protocol::Tcp), 80, 60, "x")
            .unwrap();

        let err = table
            .insert_or_renew(key(2, 2002, Protocol::Tcp), 80, 60, "x")
            .unwrap_err();
        assert!(matches!(err, InsertError::QuotaExceeded { quota: 2, .. }));

        // Renewal of an existing mapping is still allowed at quota.
        table
            .insert_or_renew(key(2, 2000, Protocol::Tcp), 80, 120, "x")
            .unwrap();

        // Another client is unaffected.
        table
            .insert_or_renew(key(3, 2002, Protocol::Tcp), 80, 60, "x")
            .unwrap();
    }

    #[test]
    fn test_allocate_port_lowest_free() {
        let mut table = table();
        assert_eq!(table.allocate_port(Protocol::Tcp), Some(1024));

        table
            .insert_or_renew(key(2, 1024, Protocol::Tcp), 80, 60, "x")
            .unwrap();
        table
            .insert_or_renew(key(2, 1025, Protocol::Tcp), 80, 60, "x")
            .unwrap();
        assert_eq!(table.allocate_port(Protocol::Tcp), Some(1026));

        // The UDP space is untouched by TCP mappings.
        assert_eq!(table.allocate_port(Protocol::Udp), Some(1024));
    }

    #[test]
    fn test_allocate_port_exhausted() {
        let mut table = MappingTable::new(1024, 1025, 10);
        table
            .insert_or_renew(key(2, 1024, Protocol::Udp), 80, 60, "x")
            .unwrap();
        table
            .insert_or_renew(key(2, 1025, Protocol::Udp), 81, 60, "x")
            .unwrap();
        assert_eq!(table.allocate_port(Protocol::Udp), None);
        assert_eq!(table.allocate_port(Protocol::Tcp), Some(1024));
    }

    #[test]
    fn test_remove() {
        let mut table = table();
        let k = key(2, 8080, Protocol::Tcp);
        table.insert_or_renew(k, 80, 60, "x").unwrap();

        assert!(table.remove(&k).is_some());
        assert!(table.remove(&k).is_none());
        assert!(table.is_empty());
    }

    #[test]
    fn test_client_mappings_and_keys() {
        let mut table = table();
        table
            .insert_or_renew(key(2, 2000, Protocol::Tcp), 80, 60, "x")
            .unwrap();
        table
            .insert_or_renew(key(2, 2001, Protocol::Udp), 81, 60, "x")
            .unwrap();
        table
            .insert_or_renew(key(3, 2002, Protocol::Tcp), 82, 60, "x")
            .unwrap();

        assert_eq!(table.client_mappings(client(2)).len(), 2);
        assert_eq!(table.client_keys(client(3)).len(), 1);
        assert!(table.client_mappings(client(4)).is_empty());
    }

    #[test]
    fn test_expired_inclusive() {
        let mut table = table();
        table
            .insert_or_renew(key(2, 2000, Protocol::Tcp), 80, 1, "x")
            .unwrap();
        table
            .insert_or_renew(key(2, 2001, Protocol::Tcp), 80, 3600, "x")
            .unwrap();

        let now = Utc::now();
        assert!(table.expired(now).is_empty());

        // 31 seconds later the 1-second mapping is past expiry.
        let later = now + Duration::seconds(31);
        let expired = table.expired(later);
        assert_eq!(expired, vec![key(2, 2000, Protocol::Tcp)]);

        // expires_at == now counts as expired.
        let exact = table.get(&key(2, 2000, Protocol::Tcp)).unwrap().expires_at;
        assert!(table.expired(exact).contains(&key(2, 2000, Protocol::Tcp)));
    }

    #[test]
    fn test_drain_empties_table() {
        let mut table = table();
        table
            .insert_or_renew(key(2, 2000, Protocol::Tcp), 80, 60, "x")
            .unwrap();
        table
            .insert_or_renew(key(3, 2001, Protocol::Udp), 80, 60, "x")
            .unwrap();

        let drained = table.drain();
        assert_eq!(drained.len(), 2);
        assert!(table.is_empty());
    }
}
