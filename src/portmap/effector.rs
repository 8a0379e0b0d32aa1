//! Host packet-filter rules for port mappings.
//!
//! A live mapping needs two rules on the host: a DNAT rule in the nat
//! PREROUTING chain redirecting (protocol, external port) to the client,
//! and a FORWARD accept for the redirected flow. The mapping table is the
//! table of record; this layer only applies and reverts rules.

use crate::protocol::Protocol;
use crate::{Error, Result};
use std::net::Ipv4Addr;
use std::process::Command;
use tracing::{debug, warn};

/// Applies and reverts host forwarding rules for mappings.
///
/// `add_mapping` must be idempotent: a renewal re-applies the same rule
/// pair and must not accumulate duplicates. `remove_mapping` must tolerate
/// rules that are already gone.
pub trait RuleEffector: Send + Sync {
    /// Install the DNAT + FORWARD pair for a mapping. If only half of the
    /// pair can be applied, the applied half is rolled back.
    fn add_mapping(
        &self,
        client_ip: Ipv4Addr,
        external_port: u16,
        internal_port: u16,
        protocol: Protocol,
    ) -> Result<()>;

    /// Remove the rule pair. Rules that are already absent are logged and
    /// skipped; removal never fails.
    fn remove_mapping(
        &self,
        client_ip: Ipv4Addr,
        external_port: u16,
        internal_port: u16,
        protocol: Protocol,
    );
}

/// Production effector driving the iptables command line.
#[derive(Debug, Default)]
pub struct IptablesEffector;

impl IptablesEffector {
    pub fn new() -> Self {
        Self
    }

    /// Run `iptables [-t table] <action> <chain> <rule...>`.
    fn run(&self, table: Option<&str>, action: &str, chain: &str, rule: &[String]) -> Result<()> {
        let mut cmd = Command::new("iptables");
        if let Some(table) = table {
            cmd.args(["-t", table]);
        }
        cmd.arg(action).arg(chain).args(rule);

        let output = cmd.output().map_err(Error::Io)?;
        if output.status.success() {
            Ok(())
        } else {
            Err(Error::Command {
                program: "iptables".to_string(),
                message: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            })
        }
    }

    /// `iptables -C` probe: does the rule already exist?
    fn rule_exists(&self, table: Option<&str>, chain: &str, rule: &[String]) -> bool {
        self.run(table, "-C", chain, rule).is_ok()
    }
}

/// DNAT rule: redirect new inbound flows for (protocol, external port) to
/// the client's internal port.
fn dnat_rule(
    client_ip: Ipv4Addr,
    external_port: u16,
    internal_port: u16,
    protocol: Protocol,
) -> Vec<String> {
    vec![
        "-p".into(),
        protocol.as_str().into(),
        "--dport".into(),
        external_port.to_string(),
        "-j".into(),
        "DNAT".into(),
        "--to-destination".into(),
        format!("{}:{}", client_ip, internal_port),
    ]
}

/// FORWARD rule: permit the redirected flow to reach the client.
fn forward_rule(client_ip: Ipv4Addr, internal_port: u16, protocol: Protocol) -> Vec<String> {
    vec![
        "-p".into(),
        protocol.as_str().into(),
        "-d".into(),
        client_ip.to_string(),
        "--dport".into(),
        internal_port.to_string(),
        "-j".into(),
        "ACCEPT".into(),
    ]
}

impl RuleEffector for IptablesEffector {
    fn add_mapping(
        &self,
        client_ip: Ipv4Addr,
        external_port: u16,
        internal_port: u16,
        protocol: Protocol,
    ) -> Result<()> {
        let dnat = dnat_rule(client_ip, external_port, internal_port, protocol);
        let forward = forward_rule(client_ip, internal_port, protocol);

        debug!(
            "applying forward rules for {}:{} -> {}:{}",
            protocol, external_port, client_ip, internal_port
        );

        let dnat_added = if self.rule_exists(Some("nat"), "PREROUTING", &dnat) {
            false
        } else {
            self.run(Some("nat"), "-A", "PREROUTING", &dnat)?;
            true
        };

        if !self.rule_exists(None, "FORWARD", &forward) {
            if let Err(e) = self.run(None, "-A", "FORWARD", &forward) {
                // Do not leave a half-applied mapping behind.
                if dnat_added {
                    if let Err(rollback) = self.run(Some("nat"), "-D", "PREROUTING", &dnat) {
                        warn!("failed to roll back DNAT rule: {}", rollback);
                    }
                }
                return Err(e);
            }
        }

        Ok(())
    }

    fn remove_mapping(
        &self,
        client_ip: Ipv4Addr,
        external_port: u16,
        internal_port: u16,
        protocol: Protocol,
    ) {
        let dnat = dnat_rule(client_ip, external_port, internal_port, protocol);
        let forward = forward_rule(client_ip, internal_port, protocol);

        debug!(
            "removing forward rules for {}:{} -> {}:{}",
            protocol, external_port, client_ip, internal_port
        );

        if let Err(e) = self.run(Some("nat"), "-D", "PREROUTING", &dnat) {
            warn!("failed to remove DNAT rule: {}", e);
        }
        if let Err(e) = self.run(None, "-D", "FORWARD", &forward) {
            warn!("failed to remove FORWARD rule: {}", e);
        }
    }
}
