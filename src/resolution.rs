//! Intake units produced by the hostname resolver.
//!
//! A [`ResolutionUnit`] maps one FQDN to every address it answered with and
//! carries the destination filters the store query matches against.

use std::net::IpAddr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One address an FQDN resolved to, qualified by the network it lives in.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResolvedIp {
    pub ip: IpAddr,
    #[serde(default)]
    pub network_uuid: Uuid,
    #[serde(default)]
    pub network_name: String,
}

impl ResolvedIp {
    pub fn new(ip: IpAddr, network_uuid: Uuid, network_name: impl Into<String>) -> Self {
        Self {
            ip,
            network_uuid,
            network_name: network_name.into(),
        }
    }
}

/// A single term of the destination disjunction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DestinationFilter {
    pub dst: IpAddr,
    pub dst_network_uuid: Uuid,
}

impl DestinationFilter {
    pub fn matches(&self, dst: IpAddr, dst_network_uuid: Uuid) -> bool {
        self.dst == dst && self.dst_network_uuid == dst_network_uuid
    }
}

impl From<&ResolvedIp> for DestinationFilter {
    fn from(ip: &ResolvedIp) -> Self {
        Self {
            dst: ip.ip,
            dst_network_uuid: ip.network_uuid,
        }
    }
}

/// An FQDN and the addresses it resolved to, ready for dissection.
#[derive(Debug, Clone)]
pub struct ResolutionUnit {
    fqdn: String,
    resolved_ips: Vec<ResolvedIp>,
    filters: Vec<DestinationFilter>,
}

impl ResolutionUnit {
    /// Builds a unit, dropping repeated addresses while keeping first-seen order.
    pub fn new(fqdn: impl Into<String>, resolved_ips: impl IntoIterator<Item = ResolvedIp>) -> Self {
        let mut unique: Vec<ResolvedIp> = Vec::new();
        for ip in resolved_ips {
            if !unique.contains(&ip) {
                unique.push(ip);
            }
        }
        let filters = unique.iter().map(DestinationFilter::from).collect();

        Self {
            fqdn: fqdn.into(),
            resolved_ips: unique,
            filters,
        }
    }

    pub fn fqdn(&self) -> &str {
        &self.fqdn
    }

    pub fn resolved_ips(&self) -> &[ResolvedIp] {
        &self.resolved_ips
    }

    pub fn filters(&self) -> &[DestinationFilter] {
        &self.filters
    }

    /// Checks the unit carries enough to be worth a store query.
    pub fn validate(&self) -> std::result::Result<(), &'static str> {
        if self.fqdn.trim().is_empty() {
            return Err("empty FQDN");
        }
        if self.filters.is_empty() {
            return Err("no resolved IPs");
        }
        Ok(())
    }
}

/// Wire form of a resolution unit, one JSON object per intake line.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ResolutionInput {
    pub fqdn: String,
    #[serde(default)]
    pub resolved_ips: Vec<ResolvedIp>,
}

impl From<ResolutionInput> for ResolutionUnit {
    fn from(input: ResolutionInput) -> Self {
        ResolutionUnit::new(input.fqdn, input.resolved_ips)
    }
}
