//! Descriptor transfer over a Unix stream.
//!
//! Every message that may carry a descriptor is followed by a one-byte marker:
//! `1` means a descriptor rides along as SCM_RIGHTS ancillary data attached to
//! that very byte, `0` means nothing follows. The receiver reads exactly one
//! byte either way, so it never waits for a descriptor that was not sent.
//!
//! The marker must be the next thing written after its message, with no other
//! writer in between: the kernel ties ancillary data to the byte it was sent with.
//!
//! ## Ownership
//!
//! The kernel installs an independent duplicate in the receiving process. The
//! sender keeps its descriptor open and may close it at any time afterwards;
//! the receiver owns its copy as an [`OwnedFd`] and closes it on drop.

use std::io::{IoSlice, IoSliceMut, Write};
use std::os::fd::{AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::net::UnixStream;

use nix::errno::Errno;
use nix::sys::socket::{ControlMessage, ControlMessageOwned, MsgFlags, recvmsg, sendmsg};

use crate::error::BridgeError;

pub const NO_DESCRIPTOR: u8 = 0;
pub const HAS_DESCRIPTOR: u8 = 1;

#[cfg(any(target_os = "linux", target_os = "android"))]
const SEND_FLAGS: MsgFlags = MsgFlags::MSG_NOSIGNAL;
#[cfg(not(any(target_os = "linux", target_os = "android")))]
const SEND_FLAGS: MsgFlags = MsgFlags::empty();

#[cfg(any(target_os = "linux", target_os = "android"))]
const RECV_FLAGS: MsgFlags = MsgFlags::MSG_CMSG_CLOEXEC;
#[cfg(not(any(target_os = "linux", target_os = "android")))]
const RECV_FLAGS: MsgFlags = MsgFlags::empty();

/// Marker-based descriptor transfer keyed to one stream connection.
///
/// Kept as a trait so the platform mechanism can be swapped without touching
/// the envelope or correlation logic.
pub trait DescriptorTransfer {
    /// Send a `HasDescriptor` marker carrying a duplicate of `fd`.
    fn send_descriptor(&self, fd: BorrowedFd<'_>) -> Result<(), BridgeError>;

    /// Send a `NoDescriptor` marker.
    fn send_no_descriptor(&self) -> Result<(), BridgeError>;

    /// Read exactly one marker and, for `HasDescriptor`, the descriptor with it.
    fn receive_optional_descriptor(&self) -> Result<Option<OwnedFd>, BridgeError>;
}

impl DescriptorTransfer for UnixStream {
    fn send_descriptor(&self, fd: BorrowedFd<'_>) -> Result<(), BridgeError> {
        let marker = [HAS_DESCRIPTOR];
        let iov = [IoSlice::new(&marker)];
        let fds = [fd.as_raw_fd()];
        let cmsgs = [ControlMessage::ScmRights(&fds)];

        let sent = loop {
            match sendmsg::<()>(self.as_raw_fd(), &iov, &cmsgs, SEND_FLAGS, None) {
                Ok(n) => break n,
                Err(Errno::EINTR) => continue,
                Err(e) => return Err(e.into()),
            }
        };
        if sent == 0 {
            return Err(BridgeError::interrupted("sendmsg wrote zero bytes"));
        }

        tracing::trace!(fd = fd.as_raw_fd(), "Sent descriptor");
        Ok(())
    }

    fn send_no_descriptor(&self) -> Result<(), BridgeError> {
        let mut stream = self;
        stream.write_all(&[NO_DESCRIPTOR])?;
        Ok(())
    }

    fn receive_optional_descriptor(&self) -> Result<Option<OwnedFd>, BridgeError> {
        let mut marker = [0u8; 1];
        let mut cmsg_buffer = nix::cmsg_space!(RawFd);

        let (bytes, raw_fds, truncated) = loop {
            let mut iov = [IoSliceMut::new(&mut marker)];
            match recvmsg::<()>(self.as_raw_fd(), &mut iov, Some(&mut cmsg_buffer), RECV_FLAGS) {
                Ok(msg) => {
                    let mut raw_fds: Vec<RawFd> = Vec::new();
                    for cmsg in msg.cmsgs()? {
                        if let ControlMessageOwned::ScmRights(received) = cmsg {
                            raw_fds.extend(received);
                        }
                    }
                    break (
                        msg.bytes,
                        raw_fds,
                        msg.flags.contains(MsgFlags::MSG_CTRUNC),
                    );
                }
                Err(Errno::EINTR) => continue,
                Err(e) => return Err(e.into()),
            }
        };

        // Take ownership before validating so every error path closes what arrived.
        // SAFETY: the kernel just installed these descriptors for us and nothing else
        // refers to them.
        let mut fds: Vec<OwnedFd> = raw_fds
            .into_iter()
            .map(|fd| unsafe { OwnedFd::from_raw_fd(fd) })
            .collect();

        if truncated {
            return Err(BridgeError::malformed("descriptor ancillary data truncated"));
        }
        if bytes == 0 {
            return Err(BridgeError::ConnectionClosed);
        }

        match marker[0] {
            NO_DESCRIPTOR if fds.is_empty() => Ok(None),
            NO_DESCRIPTOR => Err(BridgeError::malformed(
                "descriptor arrived with a NoDescriptor marker",
            )),
            HAS_DESCRIPTOR if fds.len() == 1 => {
                let fd = fds.pop();
                tracing::trace!("Received descriptor");
                Ok(fd)
            }
            HAS_DESCRIPTOR => Err(BridgeError::malformed(format!(
                "expected one descriptor after marker, got {}",
                fds.len()
            ))),
            other => Err(BridgeError::malformed(format!(
                "unknown descriptor marker {other}"
            ))),
        }
    }
}
