//! Per-console connection record.

use std::net::{Ipv4Addr, SocketAddrV4};
use std::time::{Duration, Instant};

use xenon_core::CpuKey;

use crate::subnet::SubnetEntry;

/// Liveness of a discovered console.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Constructed but not yet registered. Transient.
    Unknown,
    /// Responded within the disconnect timeout.
    Online,
    /// Last response is older than the disconnect timeout.
    Offline,
}

/// A console observed on the local network.
///
/// Identity is the peer's IPv4 address; the source port of the last
/// response is retained for inspection only. Records are mutated only
/// inside the registry's critical section and handed out as clones.
#[derive(Debug, Clone)]
pub struct Connection {
    /// Address and source port of the most recent response.
    pub endpoint: SocketAddrV4,
    /// Local subnet whose directed broadcast covers the peer, if any.
    pub interface: Option<SubnetEntry>,
    /// ASCII name from the response payload, typically "jtag" or "XeDevkit".
    pub name: String,
    /// When the record was inserted.
    pub discovered: Instant,
    /// When the most recent response arrived. Never earlier than `discovered`.
    pub last_ack: Instant,
    pub state: ConnectionState,
    /// Set externally once retrieved from the console over xbdm;
    /// [`CpuKey::EMPTY`] until then.
    pub cpu_key: CpuKey,
}

impl Connection {
    /// Record for a first response, in the `Unknown` state.
    pub fn new(endpoint: SocketAddrV4, name: String, interface: Option<SubnetEntry>) -> Self {
        let now = Instant::now();
        Self {
            endpoint,
            interface,
            name,
            discovered: now,
            last_ack: now,
            state: ConnectionState::Unknown,
            cpu_key: CpuKey::EMPTY,
        }
    }

    /// Peer address — the record's identity.
    pub fn addr(&self) -> Ipv4Addr {
        *self.endpoint.ip()
    }

    /// Whether the peer lives on the enumerated ICS bridge subnet.
    pub fn is_bridged(&self) -> bool {
        self.interface
            .as_ref()
            .is_some_and(SubnetEntry::is_ics_bridge)
    }

    /// Age of the most recent response.
    pub fn last_ack_age(&self) -> Duration {
        self.last_ack.elapsed()
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
