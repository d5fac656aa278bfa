//! The socket reactor.
//!
//! A [`Socket`] owns one rendezvous endpoint and everything attached to
//! it: the epoll instance, the listener (for server-role sockets), the
//! control channels, and the ports. A dedicated control thread waits
//! for readiness events one at a time and dispatches them to whoever
//! owns the ready descriptor; a wake eventfd unblocks the wait when
//! polling is stopped.
//!
//! Errors surfaced by handlers land on the socket's error channel and
//! do not stop the loop.

use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd, RawFd};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam_channel::{Receiver, Sender};
use nix::errno::Errno;
use nix::sys::epoll::{Epoll, EpollCreateFlags, EpollEvent, EpollFlags, EpollTimeout};
use parking_lot::Mutex;

use memif_core::types::DEFAULT_SOCKET_PATH;

use crate::control::{ControlChannel, Listener};
use crate::error::{MemifError, Result};
use crate::port::{role_to_string, Port, PortConfig};
use crate::sys;

const EVENT_INTEREST: EpollFlags = EpollFlags::EPOLLIN
    .union(EpollFlags::EPOLLERR)
    .union(EpollFlags::EPOLLHUP);

/// Shared body of a socket, referenced by ports and control channels.
pub(crate) struct SocketShared {
    app_name: String,
    path: PathBuf,
    epoll: Epoll,
    wake: OwnedFd,
    stop: AtomicBool,
    listener: Mutex<Option<Arc<Listener>>>,
    channels: Mutex<Vec<Arc<ControlChannel>>>,
    ports: Mutex<Vec<Arc<Port>>>,
    err_tx: Sender<MemifError>,
    err_rx: Receiver<MemifError>,
}

impl SocketShared {
    pub(crate) fn app_name(&self) -> &str {
        &self.app_name
    }

    pub(crate) fn path(&self) -> &Path {
        &self.path
    }

    fn register(&self, fd: BorrowedFd<'_>) -> std::io::Result<()> {
        self.epoll
            .add(fd, EpollEvent::new(EVENT_INTEREST, fd.as_raw_fd() as u64))
            .map_err(std::io::Error::from)
    }

    fn unregister(&self, fd: BorrowedFd<'_>) {
        let _ = self.epoll.delete(fd);
    }

    /// Creates a control channel for a connected stream, wires it to a
    /// port when one is given, and registers it with the reactor.
    pub(crate) fn add_channel(
        self: &Arc<Self>,
        sock: socket2::Socket,
        port: Option<Arc<Port>>,
    ) -> Result<Arc<ControlChannel>> {
        let channel = Arc::new(ControlChannel::new(
            sock,
            Arc::downgrade(self),
            port.clone(),
        ));
        if let Some(port) = port {
            port.set_channel(Arc::clone(&channel));
        }
        self.channels.lock().push(Arc::clone(&channel));
        self.register(channel.fd())?;
        Ok(channel)
    }

    /// Unhooks a control channel from the reactor and the channel list.
    pub(crate) fn remove_channel(&self, raw: RawFd) {
        let mut channels = self.channels.lock();
        if let Some(pos) = channels.iter().position(|c| c.raw_fd() == raw) {
            let channel = channels.swap_remove(pos);
            self.unregister(channel.fd());
        }
    }

    pub(crate) fn remove_listener(&self, raw: RawFd) {
        let mut listener = self.listener.lock();
        if listener.as_ref().is_some_and(|l| l.raw_fd() == raw) {
            if let Some(l) = listener.take() {
                self.unregister(l.fd());
            }
        }
    }

    /// Finds a server-role port with the given id that has no control
    /// channel yet.
    pub(crate) fn find_free_server_port(&self, id: u32) -> Option<Arc<Port>> {
        self.ports
            .lock()
            .iter()
            .find(|p| p.is_server() && p.id() == id && !p.is_connecting())
            .cloned()
    }

    pub(crate) fn remove_port(&self, id: u32, is_server: bool) {
        self.ports
            .lock()
            .retain(|p| !(p.id() == id && p.is_server() == is_server));
    }

    fn push_error(&self, err: MemifError) {
        tracing::debug!(error = %err, "socket error");
        let _ = self.err_tx.send(err);
    }

    fn dispatch(&self, fd: RawFd, flags: EpollFlags) -> Result<()> {
        let listener = self.listener.lock().clone();
        if let Some(listener) = listener {
            if listener.raw_fd() == fd {
                return listener.handle_event(flags);
            }
        }
        let channel = self
            .channels
            .lock()
            .iter()
            .find(|c| c.raw_fd() == fd)
            .cloned();
        if let Some(channel) = channel {
            return channel.handle_event(flags);
        }
        Err(MemifError::FdNotFound { fd })
    }

    fn poll_loop(self: Arc<Self>) {
        let mut events = [EpollEvent::empty(); 1];
        loop {
            if self.stop.load(Ordering::Acquire) {
                return;
            }
            let n = match self.epoll.wait(&mut events, EpollTimeout::NONE) {
                Ok(n) => n,
                Err(Errno::EINTR) => continue,
                Err(errno) => {
                    self.push_error(std::io::Error::from(errno).into());
                    return;
                }
            };
            for event in &events[..n] {
                let fd = event.data() as RawFd;
                if fd == self.wake.as_raw_fd() {
                    sys::eventfd_drain(self.wake.as_fd());
                    continue;
                }
                if let Err(err) = self.dispatch(fd, event.events()) {
                    self.push_error(err);
                }
            }
        }
    }
}

/// A rendezvous endpoint and its reactor.
///
/// Create one per application endpoint, add ports to it, then call
/// [`Socket::start_polling`] to run the control plane.
pub struct Socket {
    shared: Arc<SocketShared>,
    poll_thread: Mutex<Option<JoinHandle<()>>>,
}

impl Socket {
    /// Creates a socket for `app_name` at `path`, or at the default
    /// path (`/tmp/memif.sock`) when none is given.
    ///
    /// # Errors
    /// IO errors from creating the epoll instance or wake descriptor.
    pub fn new(app_name: impl Into<String>, path: Option<PathBuf>) -> Result<Self> {
        let epoll = Epoll::new(EpollCreateFlags::EPOLL_CLOEXEC).map_err(std::io::Error::from)?;
        let wake = sys::eventfd()?;
        let (err_tx, err_rx) = crossbeam_channel::unbounded();
        let shared = Arc::new(SocketShared {
            app_name: app_name.into(),
            path: path.unwrap_or_else(|| PathBuf::from(DEFAULT_SOCKET_PATH)),
            epoll,
            wake,
            stop: AtomicBool::new(false),
            listener: Mutex::new(None),
            channels: Mutex::new(Vec::new()),
            ports: Mutex::new(Vec::new()),
            err_tx,
            err_rx,
        });
        shared.register(shared.wake.as_fd())?;
        Ok(Self {
            shared,
            poll_thread: Mutex::new(None),
        })
    }

    /// Returns the rendezvous path.
    #[must_use]
    pub fn path(&self) -> &Path {
        self.shared.path()
    }

    /// Returns the application name sent in HELLO and INIT.
    #[must_use]
    pub fn app_name(&self) -> &str {
        self.shared.app_name()
    }

    /// Returns the error channel; handler errors from the control
    /// thread arrive here.
    #[must_use]
    pub fn errors(&self) -> Receiver<MemifError> {
        self.shared.err_rx.clone()
    }

    /// Creates a new port on this socket.
    ///
    /// The (id, role) pair must be unique per socket. The first
    /// server-role port binds the rendezvous endpoint and starts
    /// listening. Client ports connect via
    /// [`Port::request_connection`].
    ///
    /// # Errors
    /// Configuration error on a duplicate (id, role); IO errors from
    /// binding the listener.
    pub fn add_port(&self, mut cfg: PortConfig) -> Result<Arc<Port>> {
        if cfg.memory.num_queue_pairs == 0 {
            cfg.memory.num_queue_pairs = memif_core::MemoryConfig::default().num_queue_pairs;
        }
        if cfg.memory.log2_ring_size == 0 {
            cfg.memory.log2_ring_size = memif_core::MemoryConfig::default().log2_ring_size;
        }
        if cfg.memory.packet_buffer_size == 0 {
            cfg.memory.packet_buffer_size = memif_core::MemoryConfig::default().packet_buffer_size;
        }
        if cfg.memory.num_queue_pairs > 8 {
            tracing::warn!(
                "queue pairs number > 8 may cause race condition, please use multiple interfaces instead"
            );
        }

        let port = {
            let mut ports = self.shared.ports.lock();
            if ports
                .iter()
                .any(|p| p.id() == cfg.id && p.is_server() == cfg.is_server)
            {
                return Err(MemifError::config(format!(
                    "port with id {} role {} already exists on this socket",
                    cfg.id,
                    role_to_string(cfg.is_server)
                )));
            }
            let port = Arc::new(Port::new(cfg, Arc::downgrade(&self.shared)));
            ports.push(Arc::clone(&port));
            port
        };

        if port.is_server() {
            let mut listener = self.shared.listener.lock();
            if listener.is_none() {
                match Listener::bind(&self.shared) {
                    Ok(l) => {
                        let l = Arc::new(l);
                        if let Err(err) = self.shared.register(l.fd()) {
                            self.shared.remove_port(port.id(), port.is_server());
                            return Err(err.into());
                        }
                        *listener = Some(l);
                    }
                    Err(err) => {
                        self.shared.remove_port(port.id(), port.is_server());
                        return Err(err);
                    }
                }
            }
        }

        Ok(port)
    }

    /// Starts the control thread. Idempotent.
    pub fn start_polling(&self) {
        let mut guard = self.poll_thread.lock();
        if guard.is_some() {
            return;
        }
        self.shared.stop.store(false, Ordering::Release);
        let shared = Arc::clone(&self.shared);
        let handle = std::thread::Builder::new()
            .name("memif-control".to_string())
            .spawn(move || shared.poll_loop())
            .expect("failed to spawn control thread");
        *guard = Some(handle);
    }

    /// Stops the control thread and waits for it to exit.
    pub fn stop_polling(&self) {
        let handle = self.poll_thread.lock().take();
        if let Some(handle) = handle {
            self.shared.stop.store(true, Ordering::Release);
            let _ = sys::eventfd_write(self.shared.wake.as_fd());
            let _ = handle.join();
        }
    }

    /// Tears the whole socket down: every control channel is closed
    /// with a DISCONNECT, ports are dropped, the listener is closed and
    /// the rendezvous path unlinked.
    pub fn delete(&self) {
        self.stop_polling();

        let channels: Vec<_> = self.shared.channels.lock().clone();
        for channel in channels {
            channel.close(Some("Socket deleted"));
        }
        self.shared.ports.lock().clear();

        let listener = self.shared.listener.lock().take();
        if let Some(listener) = listener {
            self.shared.unregister(listener.fd());
            drop(listener);
            let _ = std::fs::remove_file(&self.shared.path);
        }
    }
}

impl Drop for Socket {
    fn drop(&mut self) {
        self.delete();
    }
}

impl std::fmt::Debug for Socket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Socket")
            .field("app_name", &self.shared.app_name)
            .field("path", &self.shared.path)
            .field("ports", &self.shared.ports.lock().len())
            .field("channels", &self.shared.channels.lock().len())
            .finish()
    }
}
