//! Subnet enumeration — which directed broadcasts to probe.

use std::io;
use std::net::{IpAddr, Ipv4Addr};

use xenon_core::wire::ICS_BRIDGE_BROADCAST;

/// A local interface paired with the /24 directed broadcast of one of its
/// addresses. Value snapshot — holds no handle to the interface itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubnetEntry {
    /// OS name of the interface the address lives on.
    pub interface: String,
    /// Directed broadcast address probes are sent to.
    pub broadcast: Ipv4Addr,
}

impl SubnetEntry {
    /// Whether this entry is the legacy ICS bridge subnet.
    pub fn is_ics_bridge(&self) -> bool {
        self.broadcast == ICS_BRIDGE_BROADCAST
    }

    /// Whether `peer` falls inside this entry's /24.
    pub fn contains(&self, peer: Ipv4Addr) -> bool {
        self.broadcast.octets()[..3] == peer.octets()[..3]
    }
}

/// Directed broadcast for the /24 around `addr`.
///
/// Fixed at /24 regardless of the interface netmask — the debug tooling
/// this interoperates with probes /24 subnets only.
pub fn directed_broadcast(addr: Ipv4Addr) -> Ipv4Addr {
    let [a, b, c, _] = addr.octets();
    Ipv4Addr::new(a, b, c, 255)
}

/// Enumerate non-loopback IPv4 interfaces as probe targets.
///
/// Identical broadcasts collapse into one entry — an interface can carry
/// several addresses in the same /24.
pub fn enumerate() -> io::Result<Vec<SubnetEntry>> {
    let mut entries: Vec<SubnetEntry> = Vec::new();
    for iface in if_addrs::get_if_addrs()? {
        if iface.is_loopback() {
            continue;
        }
        let IpAddr::V4(addr) = iface.ip() else {
            continue;
        };
        let broadcast = directed_broadcast(addr);
        if entries.iter().any(|e| e.broadcast == broadcast) {
            continue;
        }
        entries.push(SubnetEntry {
            interface: iface.name.clone(),
            broadcast,
        });
    }
    Ok(entries)
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn broadcast_sets_last_octet() {
        assert_eq!(
            directed_broadcast(Ipv4Addr::new(192, 168, 1, 10)),
            Ipv4Addr::new(192, 168, 1, 255)
        );
        assert_eq!(
            directed_broadcast(Ipv4Addr::new(10, 0, 7, 255)),
            Ipv4Addr::new(10, 0, 7, 255)
        );
    }

    #[test]
    fn contains_matches_the_slash24() {
        let entry = SubnetEntry {
            interface: "eth0".into(),
            broadcast: Ipv4Addr::new(192, 168, 1, 255),
        };
        assert!(entry.contains(Ipv4Addr::new(192, 168, 1, 10)));
        assert!(entry.contains(Ipv4Addr::new(192, 168, 1, 255)));
        assert!(!entry.contains(Ipv4Addr::new(192, 168, 2, 10)));
        assert!(!entry.contains(Ipv4Addr::new(10, 168, 1, 10)));
    }

    #[test]
    fn ics_bridge_is_recognized() {
        let entry = SubnetEntry {
            interface: "bridge".into(),
            broadcast: ICS_BRIDGE_BROADCAST,
        };
        assert!(entry.is_ics_bridge());
        assert!(entry.contains(Ipv4Addr::new(192, 168, 137, 42)));
    }

    #[test]
    fn enumeration_excludes_loopback_and_derives_broadcasts() {
        // Runs against whatever interfaces the host actually has; assert
        // the shape rather than specific addresses.
        let entries = enumerate().expect("enumeration should not fail");
        for entry in &entries {
            assert!(!entry.broadcast.is_loopback(), "loopback leaked: {entry:?}");
            assert_eq!(entry.broadcast.octets()[3], 255);
            assert!(!entry.interface.is_empty());
        }
        let mut broadcasts: Vec<_> = entries.iter().map(|e| e.broadcast).collect();
        let total = broadcasts.len();
        broadcasts.sort();
        broadcasts.dedup();
        assert_eq!(total, broadcasts.len(), "duplicate broadcasts");
    }
}
