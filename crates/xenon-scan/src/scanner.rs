//! Scanner engine — listener, broadcaster, and monitor tasks.
//!
//! One UDP socket bound to `0.0.0.0:<ephemeral>` with broadcast permission
//! is shared by the listener and broadcaster. The broadcaster probes every
//! known directed broadcast each period, the listener folds replies into
//! the registry, and the monitor demotes records that stop answering. All
//! three tasks run under one cancellation token; `stop` cancels and awaits
//! them.

use std::io;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::sync::broadcast;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use xenon_core::wire::{parse_reply, DEVKIT_PROBE, DISCOVERY_PORT, JTAG_PROBE};
use xenon_core::CpuKey;

use crate::bus::ScanEvent;
use crate::connection::Connection;
use crate::registry::{ConsoleRegistry, RegistryError};
use crate::subnet::{self, SubnetEntry};

/// Subnet snapshot shared between the scanner and its tasks.
/// Whole-pointer replacement — readers clone the inner Arc and iterate
/// without holding the lock.
type SharedSubnets = Arc<RwLock<Arc<Vec<SubnetEntry>>>>;

// ── Configuration ─────────────────────────────────────────────────────────────

/// Scanner configuration. `..Default::default()` fills the usual values.
#[derive(Debug, Clone)]
pub struct ScanConfig {
    /// Broadcast and monitor cadence.
    pub scan_frequency: Duration,
    /// Multiplied by `scan_frequency` when `disconnect_timeout` is unset.
    pub timeout_attempts: u32,
    /// Age past which an online record is demoted. `None` derives
    /// `scan_frequency × timeout_attempts`.
    pub disconnect_timeout: Option<Duration>,
    /// Evict offline records on the sweep after demotion.
    pub remove_on_disconnect: bool,
    /// Start scanning from [`ConsoleScanner::spawn`].
    pub auto_start: bool,
    /// Also emit the devkit probe each sweep.
    pub probe_devkit: bool,
    /// Probe the legacy ICS bridge subnet even when it is not enumerated.
    pub probe_ics_bridge: bool,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            scan_frequency: Duration::from_secs(3),
            timeout_attempts: 2,
            disconnect_timeout: None,
            remove_on_disconnect: false,
            auto_start: false,
            probe_devkit: false,
            probe_ics_bridge: false,
        }
    }
}

impl ScanConfig {
    /// Effective demotion threshold.
    pub fn disconnect_timeout(&self) -> Duration {
        self.disconnect_timeout
            .unwrap_or(self.scan_frequency * self.timeout_attempts)
    }
}

// ── Scanner ───────────────────────────────────────────────────────────────────

/// Discovers debug consoles by broadcasting the probe payload on every
/// local /24 and tracking responders in a [`ConsoleRegistry`].
///
/// `start` and `stop` are idempotent. Dropping a running scanner aborts
/// its tasks, which releases the socket.
pub struct ConsoleScanner {
    config: ScanConfig,
    registry: Arc<ConsoleRegistry>,
    subnets: SharedSubnets,
    scanning: AtomicBool,
    running: Mutex<Option<Running>>,
}

struct Running {
    cancel: CancellationToken,
    tasks: JoinSet<()>,
    local_addr: SocketAddr,
}

impl ConsoleScanner {
    pub fn new(config: ScanConfig) -> Self {
        Self {
            config,
            registry: Arc::new(ConsoleRegistry::new()),
            subnets: Arc::new(RwLock::new(Arc::new(Vec::new()))),
            scanning: AtomicBool::new(false),
            running: Mutex::new(None),
        }
    }

    /// Construct and, when `auto_start` is set, immediately start scanning.
    pub async fn spawn(config: ScanConfig) -> io::Result<Self> {
        let scanner = Self::new(config);
        if scanner.config.auto_start {
            scanner.start().await?;
        }
        Ok(scanner)
    }

    pub fn config(&self) -> &ScanConfig {
        &self.config
    }

    /// Start the listener, broadcaster, and monitor tasks. Idempotent.
    ///
    /// Binds the socket before anything is spawned, so a bind failure
    /// leaves the scanner fully stopped. A subnet enumeration failure is
    /// logged and the prior snapshot (possibly one set through
    /// [`ConsoleScanner::set_subnets`]) is retained.
    pub async fn start(&self) -> io::Result<()> {
        let mut running = lock(&self.running);
        if running.is_some() {
            return Ok(());
        }

        let socket = Arc::new(bind_broadcast_socket()?);
        let local_addr = socket.local_addr()?;

        if self.read_subnets().is_empty() {
            match subnet::enumerate() {
                Ok(entries) => self.store_subnets(entries),
                Err(e) => {
                    tracing::warn!(error = %e, "subnet enumeration failed, keeping prior snapshot")
                }
            }
        }

        let cancel = CancellationToken::new();
        let mut tasks = JoinSet::new();
        tasks.spawn(listener_loop(
            socket.clone(),
            self.registry.clone(),
            self.subnets.clone(),
            cancel.clone(),
        ));
        tasks.spawn(broadcaster_loop(
            socket.clone(),
            self.subnets.clone(),
            self.config.clone(),
            cancel.clone(),
        ));
        tasks.spawn(monitor_loop(
            self.registry.clone(),
            self.config.clone(),
            cancel.clone(),
        ));

        self.scanning.store(true, Ordering::SeqCst);
        *running = Some(Running {
            cancel,
            tasks,
            local_addr,
        });
        tracing::info!(
            addr = %local_addr,
            subnets = self.read_subnets().len(),
            "scanner started"
        );
        Ok(())
    }

    /// Stop scanning and wait for all tasks to exit. Idempotent.
    ///
    /// Cancellation unblocks the listener's receive; termination is
    /// bounded by one `scan_frequency` period.
    pub async fn stop(&self) {
        let running = lock(&self.running).take();
        let Some(mut running) = running else {
            return;
        };
        self.scanning.store(false, Ordering::SeqCst);
        running.cancel.cancel();
        while running.tasks.join_next().await.is_some() {}
        tracing::info!("scanner stopped");
    }

    pub fn is_scanning(&self) -> bool {
        self.scanning.load(Ordering::SeqCst)
    }

    /// Local address of the scan socket while running.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        lock(&self.running).as_ref().map(|r| r.local_addr)
    }

    /// Snapshot of all tracked consoles.
    pub fn connections(&self) -> Vec<Connection> {
        self.registry.snapshot()
    }

    /// New receiver for add/update/remove events.
    pub fn events(&self) -> broadcast::Receiver<ScanEvent> {
        self.registry.subscribe()
    }

    /// Remove every currently-offline record. Returns how many were removed.
    pub fn purge(&self) -> usize {
        self.registry.purge()
    }

    /// Attach a CPUKey retrieved out-of-band to a tracked console.
    pub fn set_cpu_key(&self, ip: Ipv4Addr, key: CpuKey) -> bool {
        self.registry.set_cpu_key(ip, key)
    }

    /// Current subnet snapshot.
    pub fn subnets(&self) -> Vec<SubnetEntry> {
        self.read_subnets().to_vec()
    }

    /// Topology-change entry point: re-enumerate interfaces and replace the
    /// subnet snapshot. On failure the prior snapshot is retained. Running
    /// tasks pick up the new snapshot on their next iteration; stale
    /// records on vanished subnets simply time out.
    pub fn refresh_subnets(&self) {
        match subnet::enumerate() {
            Ok(entries) => {
                self.store_subnets(entries);
                tracing::debug!(subnets = self.read_subnets().len(), "subnet snapshot refreshed");
            }
            Err(e) => {
                tracing::warn!(error = %e, "subnet enumeration failed, keeping prior snapshot")
            }
        }
    }

    /// Replace the subnet snapshot with caller-supplied entries, for hosts
    /// that wire their own topology notifications or probe fixed subnets.
    pub fn set_subnets(&self, entries: Vec<SubnetEntry>) {
        self.store_subnets(entries);
    }

    fn read_subnets(&self) -> Arc<Vec<SubnetEntry>> {
        self.subnets
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn store_subnets(&self, mut entries: Vec<SubnetEntry>) {
        if self.config.probe_ics_bridge && !entries.iter().any(|e| e.is_ics_bridge()) {
            entries.push(SubnetEntry {
                interface: String::from("ics-bridge"),
                broadcast: xenon_core::wire::ICS_BRIDGE_BROADCAST,
            });
        }
        *self.subnets.write().unwrap_or_else(|e| e.into_inner()) = Arc::new(entries);
    }
}

impl Drop for ConsoleScanner {
    fn drop(&mut self) {
        if let Some(mut running) = lock(&self.running).take() {
            self.scanning.store(false, Ordering::SeqCst);
            running.cancel.cancel();
            running.tasks.abort_all();
        }
    }
}

fn lock(running: &Mutex<Option<Running>>) -> std::sync::MutexGuard<'_, Option<Running>> {
    running.lock().unwrap_or_else(|e| e.into_inner())
}

/// Bind `0.0.0.0:<ephemeral>` with SO_BROADCAST as a tokio socket.
fn bind_broadcast_socket() -> io::Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_broadcast(true)?;
    socket.set_nonblocking(true)?;
    let bind_addr = SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0));
    socket.bind(&bind_addr.into())?;
    UdpSocket::from_std(socket.into())
}

// ── Tasks ─────────────────────────────────────────────────────────────────────

async fn listener_loop(
    socket: Arc<UdpSocket>,
    registry: Arc<ConsoleRegistry>,
    subnets: SharedSubnets,
    cancel: CancellationToken,
) {
    let mut buf = [0u8; 512];
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            result = socket.recv_from(&mut buf) => match result {
                Ok((len, src)) => {
                    let snapshot = subnets.read().unwrap_or_else(|e| e.into_inner()).clone();
                    ingest(&registry, &snapshot, src, &buf[..len]);
                }
                Err(e) => {
                    tracing::warn!(error = %e, "recv_from failed");
                }
            },
        }
    }
    tracing::debug!("listener stopped");
}

/// Fold one received datagram into the registry.
///
/// Non-IPv4 sources, sources not answering from the discovery port, and
/// payloads too short to carry a name are ignored without error. A first
/// response inserts; a duplicate insert branches to refresh.
fn ingest(registry: &ConsoleRegistry, subnets: &[SubnetEntry], src: SocketAddr, payload: &[u8]) {
    let SocketAddr::V4(endpoint) = src else {
        tracing::trace!(%src, "ignoring non-IPv4 response");
        return;
    };
    if endpoint.port() != DISCOVERY_PORT {
        tracing::trace!(%endpoint, "ignoring response from non-discovery port");
        return;
    }
    let Some(name) = parse_reply(payload) else {
        tracing::trace!(%endpoint, len = payload.len(), "ignoring malformed response");
        return;
    };

    let ip = *endpoint.ip();
    let interface = subnets.iter().find(|s| s.contains(ip)).cloned();
    let conn = Connection::new(endpoint, name.to_string(), interface);
    if let Err(RegistryError::Duplicate(_)) = registry.insert(conn) {
        registry.refresh(ip, endpoint);
    }
}

async fn broadcaster_loop(
    socket: Arc<UdpSocket>,
    subnets: SharedSubnets,
    config: ScanConfig,
    cancel: CancellationToken,
) {
    let mut interval = tokio::time::interval(config.scan_frequency);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = interval.tick() => {
                let snapshot = subnets.read().unwrap_or_else(|e| e.into_inner()).clone();
                for entry in snapshot.iter() {
                    let dest = SocketAddrV4::new(entry.broadcast, DISCOVERY_PORT);
                    if let Err(e) = socket.send_to(&JTAG_PROBE, dest).await {
                        tracing::warn!(%dest, error = %e, "probe send failed");
                        continue;
                    }
                    if config.probe_devkit {
                        if let Err(e) = socket.send_to(&DEVKIT_PROBE, dest).await {
                            tracing::warn!(%dest, error = %e, "devkit probe send failed");
                        }
                    }
                    tracing::trace!(%dest, interface = %entry.interface, "probe sent");
                }
            }
        }
    }
    tracing::debug!("broadcaster stopped");
}

async fn monitor_loop(registry: Arc<ConsoleRegistry>, config: ScanConfig, cancel: CancellationToken) {
    let timeout = config.disconnect_timeout();
    let mut interval = tokio::time::interval(config.scan_frequency);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = interval.tick() => {
                registry.sweep(timeout, config.remove_on_disconnect);
            }
        }
    }
    tracing::debug!("monitor stopped");
}

// ── Tests ─────────────────────────────────────────────────────────────────────
