//! Authoritative map of observed consoles.

use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::sync::broadcast;

use xenon_core::CpuKey;

use crate::bus::{Bus, ScanEvent};
use crate::connection::{Connection, ConnectionState};

/// Event bus capacity. Slow subscribers lag rather than block the scan tasks.
const BUS_CAPACITY: usize = 64;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    /// Insert for a peer that is already present. Callers branch to
    /// [`ConsoleRegistry::refresh`] instead.
    #[error("console {0} is already registered")]
    Duplicate(Ipv4Addr),
}

/// Map from peer address to connection record, plus the event bus.
///
/// One mutex guards the whole map. Events are published while the lock is
/// held — publishing only queues on the broadcast channel, so no observer
/// code runs under the lock, and events for a single peer are totally
/// ordered. The lock is never held across socket I/O.
pub struct ConsoleRegistry {
    inner: Mutex<HashMap<Ipv4Addr, Connection>>,
    bus: Bus,
}

impl ConsoleRegistry {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(HashMap::new()),
            bus: Bus::new(BUS_CAPACITY),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<Ipv4Addr, Connection>> {
        // No user code runs under the lock, so poisoning is unreachable;
        // recover the guard rather than propagate.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// New receiver for add/update/remove events.
    pub fn subscribe(&self) -> broadcast::Receiver<ScanEvent> {
        self.bus.subscribe()
    }

    /// Register a first response. The record transitions to `Online` and
    /// `Added` is emitted.
    pub fn insert(&self, mut conn: Connection) -> Result<(), RegistryError> {
        let mut map = self.lock();
        let ip = *conn.endpoint.ip();
        if map.contains_key(&ip) {
            return Err(RegistryError::Duplicate(ip));
        }
        conn.state = ConnectionState::Online;
        self.bus.publish(ScanEvent::Added(conn.clone()));
        map.insert(ip, conn);
        tracing::debug!(%ip, "console added");
        Ok(())
    }

    /// Record a response from a known peer. Bumps `last_ack` and the
    /// endpoint, moves the record `Online`, and emits `Updated` only when
    /// the state actually changed. Returns false for unknown peers.
    pub fn refresh(&self, ip: Ipv4Addr, endpoint: SocketAddrV4) -> bool {
        let mut map = self.lock();
        let Some(conn) = map.get_mut(&ip) else {
            return false;
        };
        conn.endpoint = endpoint;
        conn.last_ack = Instant::now();
        if conn.state != ConnectionState::Online {
            conn.state = ConnectionState::Online;
            self.bus.publish(ScanEvent::Updated(conn.clone()));
            tracing::debug!(%ip, "console back online");
        }
        true
    }

    /// Clone of the record for `ip`, if present.
    pub fn get(&self, ip: Ipv4Addr) -> Option<Connection> {
        self.lock().get(&ip).cloned()
    }

    /// Clones of all records. Iteration happens on the snapshot, not under
    /// the lock.
    pub fn snapshot(&self) -> Vec<Connection> {
        self.lock().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Drop the record for `ip`, emitting `Removed`.
    pub fn remove(&self, ip: Ipv4Addr) -> Option<Connection> {
        let mut map = self.lock();
        let conn = map.remove(&ip)?;
        self.bus.publish(ScanEvent::Removed(conn.clone()));
        tracing::debug!(%ip, "console removed");
        Some(conn)
    }

    /// Monitor sweep: demote `Online` records whose last response is older
    /// than `timeout` (emitting `Updated`), and evict records that were
    /// already `Offline` when `evict` is set (emitting `Removed`).
    pub fn sweep(&self, timeout: Duration, evict: bool) {
        self.sweep_at(Instant::now(), timeout, evict);
    }

    pub(crate) fn sweep_at(&self, now: Instant, timeout: Duration, evict: bool) {
        let mut map = self.lock();
        let mut evicted = Vec::new();
        for (ip, conn) in map.iter_mut() {
            match conn.state {
                ConnectionState::Offline => {
                    if evict {
                        evicted.push(*ip);
                    }
                }
                ConnectionState::Online => {
                    if now.saturating_duration_since(conn.last_ack) > timeout {
                        conn.state = ConnectionState::Offline;
                        self.bus.publish(ScanEvent::Updated(conn.clone()));
                        tracing::debug!(%ip, "console went offline");
                    }
                }
                ConnectionState::Unknown => {}
            }
        }
        for ip in evicted {
            if let Some(conn) = map.remove(&ip) {
                tracing::debug!(%ip, "offline console evicted");
                self.bus.publish(ScanEvent::Removed(conn));
            }
        }
    }

    /// Remove every currently-`Offline` record, emitting `Removed` for
    /// each. Returns how many were removed.
    pub fn purge(&self) -> usize {
        let mut map = self.lock();
        let offline: Vec<Ipv4Addr> = map
            .iter()
            .filter(|(_, c)| c.state == ConnectionState::Offline)
            .map(|(ip, _)| *ip)
            .collect();
        for ip in &offline {
            if let Some(conn) = map.remove(ip) {
                tracing::debug!(%ip, "offline console purged");
                self.bus.publish(ScanEvent::Removed(conn));
            }
        }
        offline.len()
    }

    /// Attach a CPUKey retrieved out-of-band. Returns false for unknown
    /// peers. No event is emitted; the key is opaque to the scanner.
    pub fn set_cpu_key(&self, ip: Ipv4Addr, key: CpuKey) -> bool {
        match self.lock().get_mut(&ip) {
            Some(conn) => {
                conn.cpu_key = key;
                true
            }
            None => false,
        }
    }
}

impl Default for ConsoleRegistry {
    fn default() -> Self {
        Self::new()
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::broadcast::error::TryRecvError;

    fn conn(ip: [u8; 4]) -> Connection {
        Connection::new(
            SocketAddrV4::new(Ipv4Addr::from(ip), 730),
            "jtag".into(),
            None,
        )
    }

    fn drain(rx: &mut broadcast::Receiver<ScanEvent>) -> Vec<ScanEvent> {
        let mut events = Vec::new();
        loop {
            match rx.try_recv() {
                Ok(ev) => events.push(ev),
                Err(TryRecvError::Empty) => return events,
                Err(e) => panic!("bus receiver broken: {e}"),
            }
        }
    }

    // ── Insert & refresh ──────────────────────────────────────────────────────

    #[test]
    fn insert_emits_added_online() {
        let registry = ConsoleRegistry::new();
        let mut rx = registry.subscribe();

        registry.insert(conn([192, 168, 1, 10])).unwrap();

        let events = drain(&mut rx);
        assert_eq!(events.len(), 1);
        match &events[0] {
            ScanEvent::Added(c) => {
                assert_eq!(c.addr(), Ipv4Addr::new(192, 168, 1, 10));
                assert_eq!(c.state, ConnectionState::Online);
                assert_eq!(c.name, "jtag");
                assert_eq!(c.endpoint.port(), 730);
            }
            other => panic!("expected Added, got {other:?}"),
        }
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn duplicate_insert_is_an_error() {
        let registry = ConsoleRegistry::new();
        registry.insert(conn([192, 168, 1, 10])).unwrap();
        assert_eq!(
            registry.insert(conn([192, 168, 1, 10])),
            Err(RegistryError::Duplicate(Ipv4Addr::new(192, 168, 1, 10)))
        );
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn refresh_bumps_last_ack_without_events_while_online() {
        let registry = ConsoleRegistry::new();
        registry.insert(conn([192, 168, 1, 10])).unwrap();
        let before = registry.get(Ipv4Addr::new(192, 168, 1, 10)).unwrap();

        let mut rx = registry.subscribe();
        std::thread::sleep(Duration::from_millis(5));
        let endpoint = SocketAddrV4::new(Ipv4Addr::new(192, 168, 1, 10), 730);
        assert!(registry.refresh(Ipv4Addr::new(192, 168, 1, 10), endpoint));

        let after = registry.get(Ipv4Addr::new(192, 168, 1, 10)).unwrap();
        assert!(after.last_ack > before.last_ack);
        assert!(after.last_ack >= after.discovered);
        assert!(drain(&mut rx).is_empty(), "no event while state unchanged");
    }

    #[test]
    fn refresh_of_offline_emits_updated_online() {
        let registry = ConsoleRegistry::new();
        let ip = Ipv4Addr::new(192, 168, 1, 10);
        registry.insert(conn([192, 168, 1, 10])).unwrap();
        registry.sweep_at(
            Instant::now() + Duration::from_secs(10),
            Duration::from_secs(4),
            false,
        );

        let mut rx = registry.subscribe();
        assert!(registry.refresh(ip, SocketAddrV4::new(ip, 730)));

        let events = drain(&mut rx);
        assert_eq!(events.len(), 1);
        match &events[0] {
            ScanEvent::Updated(c) => assert_eq!(c.state, ConnectionState::Online),
            other => panic!("expected Updated, got {other:?}"),
        }
    }

    #[test]
    fn refresh_of_unknown_peer_is_false() {
        let registry = ConsoleRegistry::new();
        let ip = Ipv4Addr::new(10, 0, 0, 1);
        assert!(!registry.refresh(ip, SocketAddrV4::new(ip, 730)));
    }

    // ── Sweep ─────────────────────────────────────────────────────────────────

    #[test]
    fn sweep_demotes_stale_online_records_once() {
        let registry = ConsoleRegistry::new();
        registry.insert(conn([192, 168, 1, 10])).unwrap();
        let mut rx = registry.subscribe();

        let timeout = Duration::from_secs(4);
        let later = Instant::now() + timeout + Duration::from_millis(1);
        registry.sweep_at(later, timeout, false);

        let events = drain(&mut rx);
        assert_eq!(events.len(), 1, "exactly one demotion event");
        match &events[0] {
            ScanEvent::Updated(c) => assert_eq!(c.state, ConnectionState::Offline),
            other => panic!("expected Updated, got {other:?}"),
        }

        // Already offline: a further sweep without eviction is silent.
        registry.sweep_at(later + timeout, timeout, false);
        assert!(drain(&mut rx).is_empty());
    }

    #[test]
    fn sweep_keeps_fresh_records_online() {
        let registry = ConsoleRegistry::new();
        registry.insert(conn([192, 168, 1, 10])).unwrap();
        let mut rx = registry.subscribe();

        registry.sweep_at(Instant::now(), Duration::from_secs(4), false);

        assert!(drain(&mut rx).is_empty());
        let c = registry.get(Ipv4Addr::new(192, 168, 1, 10)).unwrap();
        assert_eq!(c.state, ConnectionState::Online);
    }

    #[test]
    fn sweep_evicts_offline_records_when_enabled() {
        let registry = ConsoleRegistry::new();
        registry.insert(conn([192, 168, 1, 10])).unwrap();
        let mut rx = registry.subscribe();

        let timeout = Duration::from_secs(4);
        let later = Instant::now() + timeout + Duration::from_millis(1);
        // First sweep demotes; it does not evict the record it just demoted.
        registry.sweep_at(later, timeout, true);
        let events = drain(&mut rx);
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], ScanEvent::Updated(_)));
        assert_eq!(registry.len(), 1);

        // Next sweep evicts.
        registry.sweep_at(later + timeout, timeout, true);
        let events = drain(&mut rx);
        assert_eq!(events.len(), 1);
        match &events[0] {
            ScanEvent::Removed(c) => assert_eq!(c.state, ConnectionState::Offline),
            other => panic!("expected Removed, got {other:?}"),
        }
        assert!(registry.is_empty());
    }

    // ── Purge & remove ────────────────────────────────────────────────────────

    #[test]
    fn purge_removes_exactly_the_offline_records() {
        let registry = ConsoleRegistry::new();
        registry.insert(conn([192, 168, 1, 10])).unwrap();
        registry.insert(conn([192, 168, 1, 11])).unwrap();
        registry.insert(conn([192, 168, 1, 12])).unwrap();

        // Demote two of the three.
        let timeout = Duration::from_secs(4);
        let later = Instant::now() + timeout + Duration::from_millis(1);
        registry.sweep_at(later, timeout, false);
        registry.refresh(
            Ipv4Addr::new(192, 168, 1, 12),
            SocketAddrV4::new(Ipv4Addr::new(192, 168, 1, 12), 730),
        );

        let mut rx = registry.subscribe();
        assert_eq!(registry.purge(), 2);

        let events = drain(&mut rx);
        assert_eq!(events.len(), 2);
        let mut removed: Vec<Ipv4Addr> = events
            .iter()
            .map(|ev| match ev {
                ScanEvent::Removed(c) => c.addr(),
                other => panic!("expected Removed, got {other:?}"),
            })
            .collect();
        removed.sort();
        assert_eq!(
            removed,
            vec![Ipv4Addr::new(192, 168, 1, 10), Ipv4Addr::new(192, 168, 1, 11)]
        );
        assert_eq!(registry.len(), 1);
        assert!(registry.get(Ipv4Addr::new(192, 168, 1, 12)).is_some());
    }

    #[test]
    fn remove_emits_removed() {
        let registry = ConsoleRegistry::new();
        registry.insert(conn([192, 168, 1, 10])).unwrap();
        let mut rx = registry.subscribe();

        let removed = registry.remove(Ipv4Addr::new(192, 168, 1, 10)).unwrap();
        assert_eq!(removed.addr(), Ipv4Addr::new(192, 168, 1, 10));
        assert!(matches!(drain(&mut rx)[..], [ScanEvent::Removed(_)]));
        assert!(registry.remove(Ipv4Addr::new(192, 168, 1, 10)).is_none());
    }

    // ── Event ordering & cpu key ──────────────────────────────────────────────

    #[test]
    fn per_peer_event_order_is_add_update_remove() {
        let registry = ConsoleRegistry::new();
        let mut rx = registry.subscribe();
        let timeout = Duration::from_secs(4);

        registry.insert(conn([192, 168, 1, 10])).unwrap();
        let later = Instant::now() + timeout + Duration::from_millis(1);
        registry.sweep_at(later, timeout, false);
        registry.purge();

        let events = drain(&mut rx);
        assert!(matches!(
            events[..],
            [
                ScanEvent::Added(_),
                ScanEvent::Updated(_),
                ScanEvent::Removed(_)
            ]
        ));
    }

    #[test]
    fn set_cpu_key_updates_known_peers_only() {
        let registry = ConsoleRegistry::new();
        let ip = Ipv4Addr::new(192, 168, 1, 10);
        registry.insert(conn([192, 168, 1, 10])).unwrap();

        let key = xenon_core::CpuKey::from_hex("C0DE8DAAE05493BCB0F1664FB1751F00").unwrap();
        assert!(registry.set_cpu_key(ip, key));
        assert_eq!(registry.get(ip).unwrap().cpu_key, key);
        assert!(!registry.set_cpu_key(Ipv4Addr::new(10, 0, 0, 1), key));
    }
}
