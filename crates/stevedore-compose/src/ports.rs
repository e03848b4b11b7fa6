//! Host-port binding parsing and cross-service conflict detection.
//!
//! Compose port entries come as `[IP:]HOST[-HIGH]:CONTAINER[-HIGH][/proto]`
//! strings, bare container ports, or long-form mappings with `published` /
//! `protocol` keys. Only the host side matters here: a ranged declaration is
//! treated as the set of integers it spans, and any intersection between two
//! services on the same protocol is one conflict entry naming both.

use serde::{Deserialize, Serialize};

use crate::node::Node;

/// A host-side port claim: an inclusive port range on one protocol.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostBinding {
    /// Lowest claimed host port.
    pub low: u16,
    /// Highest claimed host port (equal to `low` for single ports).
    pub high: u16,
    /// Protocol, `tcp` unless declared otherwise.
    pub proto: String,
}

impl HostBinding {
    /// Returns the lowest port shared by both bindings, if they intersect
    /// on the same protocol.
    #[must_use]
    pub fn intersection(&self, other: &Self) -> Option<u16> {
        if self.proto != other.proto {
            return None;
        }
        let low = self.low.max(other.low);
        let high = self.high.min(other.high);
        (low <= high).then_some(low)
    }
}

/// Parses the host side of a short-syntax port entry.
///
/// Returns `None` for entries that claim no host port (bare container
/// ports) and for forms outside the supported syntax; the conflict scan is
/// advisory and never fails a merge.
#[must_use]
pub fn parse_host_binding(entry: &str) -> Option<HostBinding> {
    let (spec, proto) = entry
        .rsplit_once('/')
        .map_or((entry, "tcp"), |(spec, proto)| (spec, proto));

    let parts: Vec<&str> = spec.split(':').collect();
    let host = match parts.as_slice() {
        [_container] => return None,
        [host, _container] => host,
        [_ip, host, _container] => host,
        _ => return None,
    };
    if host.is_empty() {
        return None;
    }
    let (low, high) = parse_range(host)?;
    Some(HostBinding {
        low,
        high,
        proto: proto.to_string(),
    })
}

/// Extracts the host binding from any port entry node: scalar short syntax
/// or long-form mapping.
#[must_use]
pub fn binding_from_node(node: &Node) -> Option<HostBinding> {
    if let Some(entries) = node.as_mapping() {
        let published = entries
            .iter()
            .find(|(k, _)| k == "published")
            .and_then(|(_, v)| v.scalar_string())?;
        let proto = entries
            .iter()
            .find(|(k, _)| k == "protocol")
            .and_then(|(_, v)| v.scalar_string())
            .unwrap_or_else(|| "tcp".to_string());
        let (low, high) = parse_range(&published)?;
        return Some(HostBinding { low, high, proto });
    }
    parse_host_binding(&node.scalar_string()?)
}

fn parse_range(s: &str) -> Option<(u16, u16)> {
    if let Some((low, high)) = s.split_once('-') {
        let low: u16 = low.parse().ok()?;
        let high: u16 = high.parse().ok()?;
        (low <= high).then_some((low, high))
    } else {
        let port: u16 = s.parse().ok()?;
        Some((port, port))
    }
}

/// One host-port collision between two services.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortConflict {
    /// Lowest host port both services claim.
    pub port: u16,
    /// Protocol of the colliding bindings.
    pub proto: String,
    /// The two (namespaced) services claiming the port.
    pub services: Vec<String>,
}

/// Scans all services' host bindings and reports every conflicting pair.
#[must_use]
pub fn find_conflicts(claims: &[(String, HostBinding)]) -> Vec<PortConflict> {
    let mut conflicts: Vec<PortConflict> = Vec::new();
    for (i, (service_a, binding_a)) in claims.iter().enumerate() {
        for (service_b, binding_b) in claims.iter().skip(i + 1) {
            if service_a == service_b {
                continue;
            }
            if let Some(port) = binding_a.intersection(binding_b) {
                let conflict = PortConflict {
                    port,
                    proto: binding_a.proto.clone(),
                    services: vec![service_a.clone(), service_b.clone()],
                };
                if !conflicts.contains(&conflict) {
                    conflicts.push(conflict);
                }
            }
        }
    }
    conflicts
}
