//! Derive a routing entry from container metadata
//!
//! A container is routable when it has a name, a private address and at least
//! one declared TCP port. Anything missing makes it invisible to the proxy;
//! nothing here returns an error.

use crate::events::ContainerMetadata;
use crate::registry::RoutingEntry;

/// Derive the routing key from the runtime's primary name.
///
/// Docker reports names as `/web1`; a single leading separator is stripped.
pub fn routing_name(raw: &str) -> Option<String> {
    let name = raw.strip_prefix('/').unwrap_or(raw).trim();
    if name.is_empty() {
        None
    } else {
        Some(name.to_string())
    }
}

/// Parse one declared port (`"8080/tcp"`) and return it if it is TCP.
///
/// A port without a protocol suffix is TCP, matching the runtime's default.
pub fn tcp_port(declared: &str) -> Option<u16> {
    let (port, proto) = match declared.split_once('/') {
        Some((port, proto)) => (port, proto),
        None => (declared, "tcp"),
    };
    if !proto.eq_ignore_ascii_case("tcp") {
        return None;
    }
    port.trim().parse::<u16>().ok().filter(|p| *p > 0)
}

/// Default port rule: the first TCP port in the order the runtime declared them
pub fn default_port(declared_ports: &[String]) -> Option<u16> {
    declared_ports.iter().find_map(|p| tcp_port(p))
}

/// Resolve metadata into an entry, or `None` when the container is not routable
pub fn resolve(metadata: &ContainerMetadata) -> Option<RoutingEntry> {
    let name = metadata.name.as_deref().and_then(routing_name)?;
    let address = metadata
        .address
        .as_deref()
        .map(str::trim)
        .filter(|a| !a.is_empty())?;
    let port = default_port(&metadata.declared_ports)?;

    let mut entry = RoutingEntry::new(name, address, port);
    if !metadata.id.is_empty() {
        entry = entry.with_container_id(metadata.id.clone());
    }
    Some(entry)
}
