//! Ports: the logical interfaces applications work with.
//!
//! A port is created idle, becomes *connecting* when it owns a control
//! channel, *connected* once the handshake finishes, and *disconnected*
//! on teardown. The client side allocates all shared memory; the
//! server side only mirrors what the client announces.

use std::any::Any;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use crossbeam_channel::{Receiver, Sender};
use parking_lot::Mutex;

use memif_core::control::{AddRegion, AddRing, Hello, ADD_RING_FLAG_S2M};
use memif_core::{Error, MemoryConfig, RingDirection, Secret};

use crate::control::ControlChannel;
use crate::error::{MemifError, Result};
use crate::queue::Queue;
use crate::region::Region;
use crate::ring::Ring;
use crate::socket::SocketShared;
use crate::sys;

/// Callbacks a port owner supplies for link-state changes.
///
/// Both hooks run on the socket's control thread. The connected hook
/// typically spawns per-queue worker threads; the disconnected hook is
/// responsible for waiting until those workers have observed the quit
/// channel before returning, so the teardown that follows it is safe.
pub trait PortEventHandler: Send + Sync {
    /// Called when the port reaches the connected state.
    ///
    /// # Errors
    /// Returning an error aborts the connection and tears the channel
    /// down again.
    fn on_connected(&self, port: &Port) -> Result<()>;

    /// Called when the port leaves the connected state.
    ///
    /// The port's quit channel is already closed when this runs.
    ///
    /// # Errors
    /// Errors are logged; teardown continues regardless.
    fn on_disconnected(&self, port: &Port) -> Result<()> {
        tracing::info!(port = %port.name(), "disconnected");
        Ok(())
    }
}

/// Wrapper to build a [`PortEventHandler`] from two closures.
pub struct FnPortHandler<C, D> {
    connected: C,
    disconnected: D,
}

impl<C, D> FnPortHandler<C, D>
where
    C: Fn(&Port) -> Result<()> + Send + Sync,
    D: Fn(&Port) -> Result<()> + Send + Sync,
{
    /// Creates a handler from connected and disconnected closures.
    pub fn new(connected: C, disconnected: D) -> Self {
        Self {
            connected,
            disconnected,
        }
    }
}

impl<C, D> PortEventHandler for FnPortHandler<C, D>
where
    C: Fn(&Port) -> Result<()> + Send + Sync,
    D: Fn(&Port) -> Result<()> + Send + Sync,
{
    fn on_connected(&self, port: &Port) -> Result<()> {
        (self.connected)(port)
    }

    fn on_disconnected(&self, port: &Port) -> Result<()> {
        (self.disconnected)(port)
    }
}

/// Returns "Server" or "Client".
#[must_use]
pub fn role_to_string(is_server: bool) -> &'static str {
    if is_server { "Server" } else { "Client" }
}

/// Port configuration.
pub struct PortConfig {
    /// Identifier, unique per (socket, role). The client's INIT names
    /// the server port it wants by this id.
    pub id: u32,
    /// Role: server owns the rendezvous endpoint, client owns memory.
    pub is_server: bool,
    /// Interface name exchanged in CONNECT/CONNECTED.
    pub name: String,
    /// Optional shared secret; both sides must match.
    pub secret: Secret,
    /// Requested memory parameters; clamped during negotiation.
    pub memory: MemoryConfig,
    /// Link-state callbacks.
    pub handler: Arc<dyn PortEventHandler>,
    /// Opaque per-port user payload.
    pub user_data: Option<Arc<dyn Any + Send + Sync>>,
}

impl PortConfig {
    /// Creates a client-role config with default memory parameters.
    pub fn new(id: u32, name: impl Into<String>, handler: Arc<dyn PortEventHandler>) -> Self {
        Self {
            id,
            is_server: false,
            name: name.into(),
            secret: Secret::default(),
            memory: MemoryConfig::default(),
            handler,
            user_data: None,
        }
    }

    /// Sets the role.
    #[must_use]
    pub fn server(mut self, is_server: bool) -> Self {
        self.is_server = is_server;
        self
    }

    /// Sets the shared secret.
    #[must_use]
    pub fn secret(mut self, secret: Secret) -> Self {
        self.secret = secret;
        self
    }

    /// Sets the requested memory parameters.
    #[must_use]
    pub fn memory(mut self, memory: MemoryConfig) -> Self {
        self.memory = memory;
        self
    }

    /// Attaches opaque user data.
    #[must_use]
    pub fn user_data(mut self, data: Arc<dyn Any + Send + Sync>) -> Self {
        self.user_data = Some(data);
        self
    }
}

pub(crate) struct PendingRing {
    pub(crate) ring: Ring,
    pub(crate) interrupt: OwnedFd,
    pub(crate) is_rx: bool,
}

#[derive(Default)]
struct PortState {
    run: MemoryConfig,
    regions: Vec<Region>,
    pending: Vec<PendingRing>,
    rx: Vec<Arc<Queue>>,
    tx: Vec<Arc<Queue>>,
    remote_name: String,
    peer_name: String,
}

struct QuitState {
    tx: Option<Sender<()>>,
    rx: Receiver<()>,
}

/// A region announcement ready for the wire.
pub(crate) struct RegionAnnounce {
    pub(crate) msg: AddRegion,
    pub(crate) fd: RawFd,
}

/// A ring announcement ready for the wire.
pub(crate) struct RingAnnounce {
    pub(crate) msg: AddRing,
    pub(crate) fd: RawFd,
}

/// A memif network port.
pub struct Port {
    cfg: PortConfig,
    socket: Weak<SocketShared>,
    channel: Mutex<Option<Arc<ControlChannel>>>,
    connected: AtomicBool,
    state: Mutex<PortState>,
    quit: Mutex<QuitState>,
}

impl Port {
    pub(crate) fn new(cfg: PortConfig, socket: Weak<SocketShared>) -> Self {
        let (tx, rx) = crossbeam_channel::unbounded();
        let run = cfg.memory;
        Self {
            cfg,
            socket,
            channel: Mutex::new(None),
            connected: AtomicBool::new(false),
            state: Mutex::new(PortState {
                run,
                ..PortState::default()
            }),
            quit: Mutex::new(QuitState { tx: Some(tx), rx }),
        }
    }

    /// Returns the port identifier.
    #[must_use]
    pub fn id(&self) -> u32 {
        self.cfg.id
    }

    /// Returns the interface name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.cfg.name
    }

    /// Returns true if this port plays the server role.
    #[must_use]
    pub fn is_server(&self) -> bool {
        self.cfg.is_server
    }

    /// Returns true if the port owns a control channel (connecting or
    /// connected).
    #[must_use]
    pub fn is_connecting(&self) -> bool {
        self.channel.lock().is_some()
    }

    /// Returns true if the handshake has reached the connected state.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    /// Returns the peer application name learned during the handshake.
    #[must_use]
    pub fn remote_name(&self) -> String {
        self.state.lock().remote_name.clone()
    }

    /// Returns the peer interface name learned during the handshake.
    #[must_use]
    pub fn peer_name(&self) -> String {
        self.state.lock().peer_name.clone()
    }

    /// Returns the active memory configuration.
    ///
    /// Only meaningful while the port is connected; before that it
    /// reflects the requested configuration.
    #[must_use]
    pub fn memory_config(&self) -> MemoryConfig {
        self.state.lock().run
    }

    /// Returns the opaque user data attached at configuration time.
    #[must_use]
    pub fn user_data(&self) -> Option<Arc<dyn Any + Send + Sync>> {
        self.cfg.user_data.clone()
    }

    /// Returns a receiver that disconnects when the port goes down.
    ///
    /// Worker threads poll this to learn when to exit; it is re-armed
    /// on every connect.
    #[must_use]
    pub fn quit_receiver(&self) -> Receiver<()> {
        self.quit.lock().rx.clone()
    }

    /// Returns the rx queue at `index`.
    ///
    /// # Errors
    /// [`MemifError::InvalidQueueIndex`] when the index is beyond the
    /// negotiated queue-pair count or the port is not connected.
    pub fn rx_queue(&self, index: usize) -> Result<Arc<Queue>> {
        self.state
            .lock()
            .rx
            .get(index)
            .cloned()
            .ok_or(MemifError::InvalidQueueIndex { index })
    }

    /// Returns the tx queue at `index`.
    ///
    /// # Errors
    /// [`MemifError::InvalidQueueIndex`] when the index is beyond the
    /// negotiated queue-pair count or the port is not connected.
    pub fn tx_queue(&self, index: usize) -> Result<Arc<Queue>> {
        self.state
            .lock()
            .tx
            .get(index)
            .cloned()
            .ok_or(MemifError::InvalidQueueIndex { index })
    }

    /// Connects to the rendezvous endpoint and creates a control
    /// channel (client only).
    ///
    /// Connection refused is expected while the server is not up yet;
    /// callers retry.
    ///
    /// # Errors
    /// Configuration error on a server port, IO errors from the
    /// connect.
    pub fn request_connection(self: &Arc<Self>) -> Result<()> {
        if self.is_server() {
            return Err(MemifError::config("only client can request connection"));
        }
        if self.is_connecting() {
            return Ok(());
        }
        let socket = self
            .socket
            .upgrade()
            .ok_or_else(|| MemifError::config("socket is gone"))?;
        let sock = sys::connect_seqpacket(socket.path())?;
        socket.add_channel(sock, Some(Arc::clone(self)))?;
        Ok(())
    }

    /// Disconnects the port, sending DISCONNECT to the peer.
    pub fn disconnect(self: &Arc<Self>) {
        let channel = self.channel.lock().clone();
        if let Some(channel) = channel {
            channel.close(Some("Port disconnected"));
        }
    }

    /// Disconnects and removes the port from its socket.
    pub fn delete(self: &Arc<Self>) {
        self.disconnect();
        if let Some(socket) = self.socket.upgrade() {
            socket.remove_port(self.id(), self.is_server());
        }
    }

    // --- control-channel plumbing -----------------------------------

    pub(crate) fn secret(&self) -> Secret {
        self.cfg.secret
    }

    pub(crate) fn set_channel(&self, channel: Arc<ControlChannel>) {
        *self.channel.lock() = Some(channel);
    }

    pub(crate) fn clear_channel(&self) {
        self.channel.lock().take();
    }

    pub(crate) fn runtime_config(&self) -> MemoryConfig {
        self.state.lock().run
    }

    pub(crate) fn set_remote_name(&self, name: &str) {
        self.state.lock().remote_name = name.to_string();
    }

    pub(crate) fn set_peer_name(&self, name: &str) {
        self.state.lock().peer_name = name.to_string();
    }

    /// Clamps the requested parameters against the server's HELLO
    /// advertisement and records the peer application name (client).
    pub(crate) fn negotiate(&self, hello: &Hello) {
        let mut state = self.state.lock();
        let mut run = self.cfg.memory;
        run.num_queue_pairs = run
            .num_queue_pairs
            .min(hello.max_ring_s2m)
            .min(hello.max_ring_m2s);
        run.log2_ring_size = run.log2_ring_size.min(hello.max_log2_ring_size);
        state.run = run;
        state.remote_name = hello.name.clone();
    }

    /// Adopts the configured parameters as runtime parameters (server,
    /// on INIT).
    pub(crate) fn adopt_configured_runtime(&self) {
        self.state.lock().run = self.cfg.memory;
    }

    /// Allocates the region and builds all rings in shared memory
    /// (client, on HELLO). S2M rings come first and are the client's
    /// tx side; M2S rings follow and are its rx side.
    pub(crate) fn initialize_client_memory(&self) -> Result<()> {
        let mut state = self.state.lock();
        state.regions.clear();
        state.pending.clear();
        let run = state.run;

        let region = Region::allocate(&run)?;
        for index in 0..run.num_queue_pairs {
            let ring = Ring::for_layout(&run, RingDirection::S2m, index);
            ring.initialize(&region, &run, index);
            state.pending.push(PendingRing {
                ring,
                interrupt: sys::eventfd()?,
                is_rx: false,
            });
        }
        for index in 0..run.num_queue_pairs {
            let ring = Ring::for_layout(&run, RingDirection::M2s, index);
            ring.initialize(&region, &run, index);
            state.pending.push(PendingRing {
                ring,
                interrupt: sys::eventfd()?,
                is_rx: true,
            });
        }
        state.regions.push(region);
        Ok(())
    }

    /// Region announcements for the outbound handshake (client).
    pub(crate) fn region_manifest(&self) -> Vec<RegionAnnounce> {
        let state = self.state.lock();
        state
            .regions
            .iter()
            .enumerate()
            .map(|(index, region)| RegionAnnounce {
                msg: AddRegion {
                    index: index as u16,
                    size: region.size(),
                },
                fd: region.raw_fd(),
            })
            .collect()
    }

    /// Ring announcements for the outbound handshake (client), S2M
    /// first, each with its queue's own interrupt descriptor.
    pub(crate) fn ring_manifest(&self) -> Vec<RingAnnounce> {
        let state = self.state.lock();
        let mut per_direction = [0u16; 2];
        state
            .pending
            .iter()
            .map(|pending| {
                let s2m = matches!(pending.ring.direction, RingDirection::S2m);
                let slot = &mut per_direction[usize::from(!s2m)];
                let index = *slot;
                *slot += 1;
                RingAnnounce {
                    msg: AddRing {
                        flags: if s2m { ADD_RING_FLAG_S2M } else { 0 },
                        index,
                        region: pending.ring.region,
                        offset: pending.ring.offset,
                        log2_ring_size: pending.ring.log2_size,
                        private_hdr_size: 0,
                    },
                    fd: pending.interrupt.as_raw_fd(),
                }
            })
            .collect()
    }

    /// Appends a region received from the peer (server).
    pub(crate) fn add_region(&self, region: Region) {
        self.state.lock().regions.push(region);
    }

    /// Appends a ring received from the peer (server).
    pub(crate) fn add_pending_ring(&self, ring: Ring, interrupt: OwnedFd, is_rx: bool) {
        self.state.lock().pending.push(PendingRing {
            ring,
            interrupt,
            is_rx,
        });
    }

    /// Finalizes the connection: maps unmapped regions, verifies every
    /// ring's cookie, builds the queues with zeroed cached indices,
    /// re-arms the quit channel, and fires the connected callback.
    pub(crate) fn connect_transition(self: &Arc<Self>) -> Result<()> {
        {
            let mut state = self.state.lock();
            for region in &mut state.regions {
                region.map()?;
            }
            let regions = Arc::new(std::mem::take(&mut state.regions));
            let run = state.run;
            let pending = std::mem::take(&mut state.pending);
            state.rx.clear();
            state.tx.clear();

            for p in pending {
                let region = regions
                    .get(p.ring.region as usize)
                    .ok_or(Error::InvalidRegionIndex)?;
                p.ring.attach(region)?;
                let queue = Arc::new(Queue::new(
                    p.ring,
                    Arc::clone(&regions),
                    self.is_server(),
                    run.packet_buffer_size,
                    p.interrupt,
                ));
                if p.is_rx {
                    state.rx.push(queue);
                } else {
                    state.tx.push(queue);
                }
            }
        }

        {
            let mut quit = self.quit.lock();
            let (tx, rx) = crossbeam_channel::unbounded();
            quit.tx = Some(tx);
            quit.rx = rx;
        }
        self.connected.store(true, Ordering::Release);

        self.cfg.handler.on_connected(self)
    }

    /// Tears the port down: closes the quit channel, runs the
    /// disconnected callback (which waits for workers), then drops
    /// queues, interrupt descriptors, and region mappings.
    pub(crate) fn disconnect_transition(self: &Arc<Self>) {
        self.connected.store(false, Ordering::Release);
        {
            self.quit.lock().tx.take();
        }
        if let Err(err) = self.cfg.handler.on_disconnected(self) {
            tracing::warn!(port = %self.name(), error = %err, "disconnected callback failed");
        }

        let mut state = self.state.lock();
        state.rx.clear();
        state.tx.clear();
        state.pending.clear();
        state.regions.clear();
        state.remote_name.clear();
        state.peer_name.clear();
        state.run = self.cfg.memory;
    }
}

impl std::fmt::Display for Port {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "{}:", self.name())?;
        writeln!(f, "\trole: {}", role_to_string(self.is_server()))?;
        writeln!(f, "\tid: {}", self.id())?;
        let link = if self.is_connected() { "up" } else { "down" };
        writeln!(f, "\tlink: {}", link)?;
        writeln!(f, "\tremote: {}", self.remote_name())?;
        write!(f, "\tpeer: {}", self.peer_name())?;
        if self.is_connected() {
            let mc = self.memory_config();
            write!(
                f,
                "\nqueue pairs: {}\nring size: {}\nbuffer size: {}",
                mc.num_queue_pairs,
                mc.ring_size(),
                mc.packet_buffer_size
            )?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for Port {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Port")
            .field("id", &self.id())
            .field("name", &self.name())
            .field("role", &role_to_string(self.is_server()))
            .field("connected", &self.is_connected())
            .finish()
    }
}
