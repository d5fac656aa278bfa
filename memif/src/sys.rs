//! Thin shims over the handful of syscalls the transport needs:
//! sealed anonymous memory files, event descriptors, SCM_RIGHTS message
//! passing, and the sequenced-packet rendezvous socket.

use std::fs::File;
use std::io::{self, IoSlice, IoSliceMut};
use std::os::fd::{AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};
use std::path::Path;

use memfd::{FileSeal, MemfdOptions};
use nix::cmsg_space;
use nix::sys::socket::{
    recvmsg, sendmsg, ControlMessage, ControlMessageOwned, MsgFlags,
};
use socket2::{Domain, SockAddr, Socket, Type};

use memif_core::MSG_SIZE;

/// Creates a non-blocking event descriptor for cross-process wake-ups.
pub(crate) fn eventfd() -> io::Result<OwnedFd> {
    let fd = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

/// Adds 1 to an event descriptor.
///
/// `EAGAIN` means the counter is saturated and the peer is behind; the
/// wake-up is already pending, so that is not an error.
pub(crate) fn eventfd_write(fd: BorrowedFd<'_>) -> io::Result<()> {
    let value = 1u64.to_ne_bytes();
    let n = unsafe { libc::write(fd.as_raw_fd(), value.as_ptr().cast(), value.len()) };
    if n < 0 {
        let err = io::Error::last_os_error();
        if err.kind() == io::ErrorKind::WouldBlock {
            return Ok(());
        }
        return Err(err);
    }
    Ok(())
}

/// Drains an event descriptor's counter, ignoring an empty counter.
pub(crate) fn eventfd_drain(fd: BorrowedFd<'_>) {
    let mut value = [0u8; 8];
    unsafe { libc::read(fd.as_raw_fd(), value.as_mut_ptr().cast(), value.len()) };
}

/// Creates an anonymous memory file sealed against shrinking and grown
/// to `size` bytes.
///
/// The seal is applied before the truncate: `F_SEAL_SHRINK` forbids
/// shrinking only, so growing the fresh zero-length file is still
/// allowed, and the peer that later maps the descriptor can trust the
/// size it was told.
pub(crate) fn memfd_sealed(size: u64) -> io::Result<File> {
    let mfd = MemfdOptions::default()
        .allow_sealing(true)
        .close_on_exec(true)
        .create("memif_region_0")
        .map_err(io::Error::other)?;
    mfd.add_seal(FileSeal::SealShrink).map_err(io::Error::other)?;
    mfd.as_file().set_len(size)?;
    Ok(mfd.into_file())
}

/// Sends one 128-byte control message, attaching `fd` as a single
/// SCM_RIGHTS control message when present.
pub(crate) fn send_control(
    sock: BorrowedFd<'_>,
    buf: &[u8; MSG_SIZE],
    fd: Option<RawFd>,
) -> io::Result<()> {
    let iov = [IoSlice::new(buf)];
    let fds;
    let cmsgs: &[ControlMessage<'_>] = match fd {
        Some(raw) => {
            fds = [raw];
            &[ControlMessage::ScmRights(&fds)]
        }
        None => &[],
    };
    sendmsg::<()>(sock.as_raw_fd(), &iov, cmsgs, MsgFlags::empty(), None)
        .map_err(io::Error::from)?;
    Ok(())
}

/// Receives one control message plus up to one SCM_RIGHTS descriptor.
///
/// Returns the number of data bytes received (0 on orderly shutdown)
/// and the received descriptor, if any. The descriptor is owned by the
/// caller from here on.
pub(crate) fn recv_control(
    sock: BorrowedFd<'_>,
    buf: &mut [u8; MSG_SIZE],
) -> io::Result<(usize, Option<OwnedFd>)> {
    let mut cmsg_buf = cmsg_space!([RawFd; 1]);
    let mut iov = [IoSliceMut::new(buf)];
    let msg = recvmsg::<()>(
        sock.as_raw_fd(),
        &mut iov,
        Some(&mut cmsg_buf),
        MsgFlags::empty(),
    )
    .map_err(io::Error::from)?;

    let bytes = msg.bytes;
    let mut received = None;
    for cmsg in msg.cmsgs().map_err(io::Error::from)? {
        if let ControlMessageOwned::ScmRights(fds) = cmsg {
            for raw in fds {
                let fd = unsafe { OwnedFd::from_raw_fd(raw) };
                // Only one descriptor is ever expected; extra ones are
                // closed by dropping them here.
                if received.is_none() {
                    received = Some(fd);
                }
            }
        }
    }
    Ok((bytes, received))
}

/// Binds a sequenced-packet unix socket at `path` and marks it listening.
pub(crate) fn listen_seqpacket(path: &Path) -> io::Result<Socket> {
    let sock = Socket::new(Domain::UNIX, Type::SEQPACKET, None)?;
    sock.set_passcred(true)?;
    sock.bind(&SockAddr::unix(path)?)?;
    sock.listen(libc::SOMAXCONN)?;
    Ok(sock)
}

/// Connects a sequenced-packet unix socket to `path`.
///
/// `ECONNREFUSED` is expected while the server is not up yet; callers
/// retry.
pub(crate) fn connect_seqpacket(path: &Path) -> io::Result<Socket> {
    let sock = Socket::new(Domain::UNIX, Type::SEQPACKET, None)?;
    sock.connect(&SockAddr::unix(path)?)?;
    Ok(sock)
}
