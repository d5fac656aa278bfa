//! Control channel and listener.
//!
//! One control channel exists per (port, peer) pair and drives the
//! handshake over the sequenced-packet socket:
//!
//! ```text
//! server -> HELLO
//! client -> INIT, ADD_REGION x regions, ADD_RING x 2 x pairs, CONNECT
//! server -> CONNECTED     (each client message is ACKed)
//! ```
//!
//! After the connected state is reached the channel goes quiet; it only
//! carries DISCONNECT at teardown. All handlers run on the socket's
//! control thread.

use std::collections::VecDeque;
use std::os::fd::{AsFd, AsRawFd, OwnedFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use nix::sys::epoll::EpollFlags;
use parking_lot::Mutex;

use memif_core::control::{
    AddRegion, AddRing, Connect, Connected, ControlMsg, Disconnect, Hello, Init, MsgKind,
    ADD_RING_FLAG_S2M,
};
use memif_core::types::{MAX_LOG2_RING_SIZE, MAX_REGION, MAX_RING_COUNT};
use memif_core::{Error, PortMode, RingDirection, MSG_SIZE, VERSION};

use crate::error::{MemifError, Result};
use crate::port::Port;
use crate::region::Region;
use crate::ring::Ring;
use crate::socket::SocketShared;
use crate::sys;

/// One queued outbound control message.
///
/// The descriptor is borrowed from its owner (a region or a pending
/// ring held by the port) and stays valid until the message is sent:
/// the port cannot drop it while its control channel is live.
struct OutMsg {
    buf: [u8; MSG_SIZE],
    fd: Option<RawFd>,
}

struct CcState {
    port: Option<Arc<Port>>,
    queue: VecDeque<OutMsg>,
    closed: bool,
}

/// Control channel between two memif peers, backed by a connected
/// sequenced-packet socket.
pub(crate) struct ControlChannel {
    sock: socket2::Socket,
    socket: Weak<SocketShared>,
    state: Mutex<CcState>,
    connected: AtomicBool,
}

impl ControlChannel {
    pub(crate) fn new(
        sock: socket2::Socket,
        socket: Weak<SocketShared>,
        port: Option<Arc<Port>>,
    ) -> Self {
        Self {
            sock,
            socket,
            state: Mutex::new(CcState {
                port,
                queue: VecDeque::new(),
                closed: false,
            }),
            connected: AtomicBool::new(false),
        }
    }

    pub(crate) fn raw_fd(&self) -> RawFd {
        self.sock.as_raw_fd()
    }

    pub(crate) fn fd(&self) -> std::os::fd::BorrowedFd<'_> {
        self.sock.as_fd()
    }

    pub(crate) fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    fn port_name(&self) -> String {
        self.state
            .lock()
            .port
            .as_ref()
            .map_or_else(|| "<unbound>".to_string(), |p| p.name().to_string())
    }

    fn enqueue(state: &mut CcState, msg: &ControlMsg, fd: Option<RawFd>) {
        state.queue.push_back(OutMsg {
            buf: msg.encode(),
            fd,
        });
    }

    fn drain_queue(&self, state: &mut CcState) -> std::io::Result<()> {
        while let Some(msg) = state.queue.pop_front() {
            sys::send_control(self.sock.as_fd(), &msg.buf, msg.fd)?;
        }
        Ok(())
    }

    /// Enqueues HELLO with this socket's advertisement (server side,
    /// right after accept).
    pub(crate) fn greet(&self, app_name: &str) -> std::io::Result<()> {
        let mut state = self.state.lock();
        Self::enqueue(
            &mut state,
            &ControlMsg::Hello(Hello {
                name: app_name.to_string(),
                version_min: VERSION,
                version_max: VERSION,
                max_region: MAX_REGION,
                max_ring_m2s: MAX_RING_COUNT,
                max_ring_s2m: MAX_RING_COUNT,
                max_log2_ring_size: MAX_LOG2_RING_SIZE,
            }),
            None,
        );
        self.drain_queue(&mut state)
    }

    /// Handles one readiness event from the reactor.
    pub(crate) fn handle_event(self: &Arc<Self>, flags: EpollFlags) -> Result<()> {
        if flags.contains(EpollFlags::EPOLLHUP) {
            let name = self.port_name();
            self.close(None);
            return Err(MemifError::HangUp { name });
        }
        if flags.contains(EpollFlags::EPOLLERR) {
            let name = self.port_name();
            self.close(None);
            return Err(MemifError::HangUp { name });
        }
        if flags.contains(EpollFlags::EPOLLIN) {
            return self.handle_readable();
        }
        Ok(())
    }

    fn handle_readable(self: &Arc<Self>) -> Result<()> {
        let mut buf = [0u8; MSG_SIZE];
        let (size, fd) = match sys::recv_control(self.sock.as_fd(), &mut buf) {
            Ok(recv) => recv,
            Err(err) => {
                self.close(None);
                return Err(err.into());
            }
        };
        if size == 0 {
            // Orderly shutdown by the peer.
            let name = self.port_name();
            self.close(None);
            return Err(MemifError::HangUp { name });
        }
        if size != MSG_SIZE {
            let err = Error::InvalidMessageSize(size);
            self.close(Some(&err.to_string()));
            return Err(err.into());
        }

        let msg = match ControlMsg::decode(&buf) {
            Ok(msg) => msg,
            Err(err) => {
                self.close(Some(&err.to_string()));
                return Err(err.into());
            }
        };

        match self.on_msg(msg, fd) {
            Ok(()) => {
                let mut state = self.state.lock();
                if !state.closed {
                    if let Err(err) = self.drain_queue(&mut state) {
                        drop(state);
                        self.close(None);
                        return Err(err.into());
                    }
                }
                Ok(())
            }
            Err(err) => {
                // A peer-sent DISCONNECT already closed the channel; do
                // not answer it with another DISCONNECT.
                if !matches!(err, MemifError::Disconnected { .. }) {
                    tracing::error!(error = %err, "control message rejected");
                    self.close(Some(&err.wire_reason()));
                }
                Err(err)
            }
        }
    }

    fn on_msg(self: &Arc<Self>, msg: ControlMsg, fd: Option<OwnedFd>) -> Result<()> {
        match msg {
            ControlMsg::Ack => Ok(()),
            ControlMsg::Hello(hello) => self.on_hello(&hello),
            ControlMsg::Init(init) => self.on_init(&init),
            ControlMsg::AddRegion(msg) => self.on_add_region(&msg, fd),
            ControlMsg::AddRing(msg) => self.on_add_ring(&msg, fd),
            ControlMsg::Connect(msg) => self.on_connect(&msg),
            ControlMsg::Connected(msg) => self.on_connected(&msg),
            ControlMsg::Disconnect(msg) => {
                self.on_disconnect(&msg);
                Err(MemifError::Disconnected {
                    code: msg.code,
                    reason: msg.reason,
                })
            }
        }
    }

    /// Client side: negotiate parameters, build the region and rings,
    /// then pipeline the whole outbound handshake.
    fn on_hello(self: &Arc<Self>, hello: &Hello) -> Result<()> {
        if hello.version_min > VERSION || hello.version_max < VERSION {
            return Err(Error::IncompatibleVersion.into());
        }
        let port = self.bound_port(MsgKind::Hello)?;
        port.negotiate(hello);
        port.initialize_client_memory()?;

        let socket = self.socket.upgrade().ok_or(MemifError::HangUp {
            name: port.name().to_string(),
        })?;
        let mut state = self.state.lock();
        Self::enqueue(
            &mut state,
            &ControlMsg::Init(Init {
                version: VERSION,
                id: port.id(),
                mode: PortMode::Ethernet,
                secret: port.secret(),
                name: socket.app_name().to_string(),
            }),
            None,
        );
        for region in port.region_manifest() {
            Self::enqueue(&mut state, &ControlMsg::AddRegion(region.msg), Some(region.fd));
        }
        for ring in port.ring_manifest() {
            Self::enqueue(&mut state, &ControlMsg::AddRing(ring.msg), Some(ring.fd));
        }
        Self::enqueue(
            &mut state,
            &ControlMsg::Connect(Connect {
                name: port.name().to_string(),
            }),
            None,
        );
        Ok(())
    }

    /// Server side: match the INIT against a free server-role port.
    fn on_init(self: &Arc<Self>, init: &Init) -> Result<()> {
        if init.version != VERSION {
            return Err(Error::IncompatibleDriverVersion.into());
        }
        let socket = self.socket.upgrade().ok_or(MemifError::HangUp {
            name: "<unbound>".to_string(),
        })?;
        let port = socket
            .find_free_server_port(init.id)
            .ok_or(Error::InvalidInterfaceId)?;
        if port.secret() != init.secret {
            return Err(Error::InvalidSecret.into());
        }

        port.set_channel(Arc::clone(self));
        port.adopt_configured_runtime();
        port.set_remote_name(&init.name);

        let mut state = self.state.lock();
        state.port = Some(port);
        Self::enqueue(&mut state, &ControlMsg::Ack, None);
        Ok(())
    }

    fn on_add_region(&self, msg: &AddRegion, fd: Option<OwnedFd>) -> Result<()> {
        let port = self.bound_port(MsgKind::AddRegion)?;
        let fd = fd.ok_or(Error::MissingFd)?;
        if msg.index > MAX_REGION {
            return Err(Error::InvalidRegionIndex.into());
        }
        port.add_region(Region::from_fd(fd, msg.size));
        let mut state = self.state.lock();
        Self::enqueue(&mut state, &ControlMsg::Ack, None);
        Ok(())
    }

    fn on_add_ring(&self, msg: &AddRing, fd: Option<OwnedFd>) -> Result<()> {
        let port = self.bound_port(MsgKind::AddRing)?;
        let fd = fd.ok_or(Error::MissingFd)?;
        if msg.index >= port.runtime_config().num_queue_pairs {
            return Err(Error::InvalidRingIndex.into());
        }
        // An S2M ring is the server's rx side; M2S is its tx side.
        let (direction, is_rx) = if msg.flags & ADD_RING_FLAG_S2M != 0 {
            (RingDirection::S2m, true)
        } else {
            (RingDirection::M2s, false)
        };
        port.add_pending_ring(Ring::from_wire(msg, direction), fd, is_rx);
        let mut state = self.state.lock();
        Self::enqueue(&mut state, &ControlMsg::Ack, None);
        Ok(())
    }

    /// Server side: map, verify, fire the connected callback, confirm.
    fn on_connect(self: &Arc<Self>, msg: &Connect) -> Result<()> {
        let port = self.bound_port(MsgKind::Connect)?;
        port.set_peer_name(&msg.name);
        port.connect_transition()?;
        self.connected.store(true, Ordering::Release);

        let mut state = self.state.lock();
        Self::enqueue(
            &mut state,
            &ControlMsg::Connected(Connected {
                name: port.name().to_string(),
            }),
            None,
        );
        Ok(())
    }

    /// Client side: same transition upon the server's confirmation.
    fn on_connected(self: &Arc<Self>, msg: &Connected) -> Result<()> {
        let port = self.bound_port(MsgKind::Connected)?;
        port.set_peer_name(&msg.name);
        port.connect_transition()?;
        self.connected.store(true, Ordering::Release);
        Ok(())
    }

    fn on_disconnect(self: &Arc<Self>, msg: &Disconnect) {
        tracing::info!(
            port = %self.port_name(),
            code = msg.code,
            reason = %msg.reason,
            "peer disconnected"
        );
        self.close(None);
    }

    fn bound_port(&self, kind: MsgKind) -> Result<Arc<Port>> {
        self.state
            .lock()
            .port
            .clone()
            .ok_or_else(|| Error::UnexpectedMessage(kind as u16).into())
    }

    /// Closes the channel. With a reason, a DISCONNECT message is the
    /// last thing sent; without one the socket just goes away. If the
    /// channel is bound to a port, the port's disconnect transition
    /// runs after the channel is unhooked from the reactor.
    pub(crate) fn close(self: &Arc<Self>, reason: Option<&str>) {
        let port = {
            let mut state = self.state.lock();
            if state.closed {
                return;
            }
            state.closed = true;
            if let Some(reason) = reason {
                // The disconnect message must be the only one in queue.
                state.queue.clear();
                Self::enqueue(
                    &mut state,
                    &ControlMsg::Disconnect(Disconnect {
                        code: 0,
                        reason: reason.to_string(),
                    }),
                    None,
                );
                if let Err(err) = self.drain_queue(&mut state) {
                    tracing::debug!(error = %err, "disconnect send failed");
                }
            }
            state.queue.clear();
            state.port.take()
        };

        self.connected.store(false, Ordering::Release);
        if let Some(socket) = self.socket.upgrade() {
            socket.remove_channel(self.raw_fd());
        }
        if let Some(port) = port {
            port.clear_channel();
            port.disconnect_transition();
        }
    }
}

impl std::fmt::Debug for ControlChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControlChannel")
            .field("fd", &self.raw_fd())
            .field("connected", &self.is_connected())
            .finish()
    }
}

/// Accepts incoming connections on the rendezvous endpoint; one exists
/// per server-role socket.
pub(crate) struct Listener {
    sock: socket2::Socket,
    socket: Weak<SocketShared>,
}

impl Listener {
    /// Binds the rendezvous path and starts listening.
    pub(crate) fn bind(socket: &Arc<SocketShared>) -> Result<Self> {
        let sock = sys::listen_seqpacket(socket.path())?;
        Ok(Self {
            sock,
            socket: Arc::downgrade(socket),
        })
    }

    pub(crate) fn raw_fd(&self) -> RawFd {
        self.sock.as_raw_fd()
    }

    pub(crate) fn fd(&self) -> std::os::fd::BorrowedFd<'_> {
        self.sock.as_fd()
    }

    /// Handles one readiness event: accept a client, spin up its
    /// control channel, and greet it.
    pub(crate) fn handle_event(&self, flags: EpollFlags) -> Result<()> {
        let socket = match self.socket.upgrade() {
            Some(socket) => socket,
            None => return Ok(()),
        };

        if flags.intersects(EpollFlags::EPOLLHUP | EpollFlags::EPOLLERR) {
            socket.remove_listener(self.raw_fd());
            return Err(MemifError::HangUp {
                name: socket.path().display().to_string(),
            });
        }

        if flags.contains(EpollFlags::EPOLLIN) {
            let (stream, _addr) = self.sock.accept()?;
            let cc = socket.add_channel(stream, None)?;
            cc.greet(socket.app_name())?;
        }
        Ok(())
    }
}
