//! Platform transport: connected `AF_UNIX` socket pairs and descriptor passing.

#![allow(unsafe_code)]

use std::io::{self, IoSlice, IoSliceMut};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::process::CommandExt;
use std::process::Command;

use nix::fcntl::{FcntlArg, FdFlag, fcntl};
use nix::sys::socket::{
    AddressFamily, ControlMessage, ControlMessageOwned, MsgFlags, SockFlag, SockType, recvmsg,
    sendmsg, socketpair,
};

use crate::error::{ChannelError, ChannelResult};
use crate::frame::MAX_FDS_PER_FRAME;

/// Command-line switch carrying the inherited descriptor number.
pub const PLATFORM_CHANNEL_FD_SWITCH: &str = "platform-channel-fd";

/// Two connected stream sockets. One end stays in this process, the other is
/// handed to a child.
#[derive(Debug)]
pub struct PlatformChannelPair {
    local: OwnedFd,
    remote: OwnedFd,
}

impl PlatformChannelPair {
    /// Create a close-on-exec socket pair.
    ///
    /// # Errors
    ///
    /// Returns [`ChannelError::Io`] if the sockets cannot be created.
    pub fn new() -> ChannelResult<Self> {
        let (local, remote) = socketpair(
            AddressFamily::Unix,
            SockType::Stream,
            None,
            SockFlag::SOCK_CLOEXEC,
        )?;
        Ok(Self { local, remote })
    }

    /// Arrange for the remote end to survive `exec` in `command` and return
    /// the argument that tells the child where to find it.
    ///
    /// The remote end must stay open until the child has been spawned; drop
    /// it afterwards with [`PlatformChannelPair::into_local`].
    pub fn prepare_to_pass(&self, command: &mut Command) -> String {
        let raw = self.remote.as_raw_fd();
        // SAFETY: the closure only calls fcntl, which is async-signal-safe,
        // and touches no memory shared with the parent.
        unsafe {
            command.pre_exec(move || {
                fcntl(raw, FcntlArg::F_SETFD(FdFlag::empty()))
                    .map(drop)
                    .map_err(io::Error::from)
            });
        }
        format!("--{PLATFORM_CHANNEL_FD_SWITCH}={raw}")
    }

    /// Keep the local end and close the remote one.
    #[must_use]
    pub fn into_local(self) -> OwnedFd {
        self.local
    }

    /// Split into `(local, remote)`.
    #[must_use]
    pub fn into_parts(self) -> (OwnedFd, OwnedFd) {
        (self.local, self.remote)
    }
}

/// Take ownership of a descriptor inherited from the parent process.
///
/// The descriptor is marked close-on-exec again so it does not leak into
/// grandchildren.
///
/// # Errors
///
/// Returns [`ChannelError::Io`] if `raw` is not an open descriptor.
pub fn take_inherited_fd(raw: RawFd) -> ChannelResult<OwnedFd> {
    if raw < 0 {
        return Err(ChannelError::Io(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("invalid descriptor {raw}"),
        )));
    }
    fcntl(raw, FcntlArg::F_GETFD)?;
    fcntl(raw, FcntlArg::F_SETFD(FdFlag::FD_CLOEXEC))?;
    // SAFETY: the descriptor was inherited from the parent, is open (checked
    // above) and nothing else in this process owns it.
    Ok(unsafe { OwnedFd::from_raw_fd(raw) })
}

#[cfg(any(target_os = "linux", target_os = "android"))]
fn send_flags() -> MsgFlags {
    MsgFlags::MSG_NOSIGNAL
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
fn send_flags() -> MsgFlags {
    MsgFlags::empty()
}

#[cfg(any(target_os = "linux", target_os = "android"))]
fn recv_flags() -> MsgFlags {
    MsgFlags::MSG_CMSG_CLOEXEC
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
fn recv_flags() -> MsgFlags {
    MsgFlags::empty()
}

/// Send `bytes` with `fds` attached as `SCM_RIGHTS`. Returns bytes written.
///
/// # Errors
///
/// Returns the OS error; `WouldBlock` on a full non-blocking socket.
pub(crate) fn send_with_fds(socket: RawFd, bytes: &[u8], fds: &[RawFd]) -> io::Result<usize> {
    let iov = [IoSlice::new(bytes)];
    let rights = [ControlMessage::ScmRights(fds)];
    let cmsgs: &[ControlMessage<'_>] = if fds.is_empty() { &[] } else { &rights };
    Ok(sendmsg::<()>(socket, &iov, cmsgs, send_flags(), None)?)
}

/// Receive into `buf`, collecting any descriptors that arrived with the bytes.
///
/// A zero byte count means the peer shut down.
///
/// # Errors
///
/// Returns the OS error; `WouldBlock` when nothing is available.
pub(crate) fn recv_with_fds(socket: RawFd, buf: &mut [u8]) -> io::Result<(usize, Vec<OwnedFd>)> {
    let mut cmsg_buf = nix::cmsg_space!([RawFd; MAX_FDS_PER_FRAME]);
    let mut iov = [IoSliceMut::new(buf)];
    let msg = recvmsg::<()>(socket, &mut iov, Some(&mut cmsg_buf), recv_flags())?;
    let mut fds = Vec::new();
    for cmsg in msg.cmsgs()? {
        if let ControlMessageOwned::ScmRights(raw_fds) = cmsg {
            for raw in raw_fds {
                // SAFETY: descriptors delivered by SCM_RIGHTS are freshly
                // installed in this process and owned by nobody else.
                fds.push(unsafe { OwnedFd::from_raw_fd(raw) });
            }
        }
    }
    Ok((msg.bytes, fds))
}
