//! Message transport over a unix stream socket.
//!
//! One wire record per send; file descriptors ride in ancillary data
//! (`SCM_RIGHTS`). Records can arrive in pieces on a stream socket, so the
//! receive path keeps reading until it has a whole one; a timeout with
//! nothing buffered surfaces as [`RecvOutcome::TimedOut`]. The wait is
//! bounded mid-record too: a peer that goes quiet after a partial record
//! surfaces as [`RecvError::Stalled`] once a grace period derived from the
//! socket's read timeout runs out. Framing is lost at that point, so the
//! connection is only good for tearing down.

use std::io::{self, IoSlice, IoSliceMut};
use std::os::unix::io::{AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::net::UnixStream;
use std::time::{Duration, Instant};

use nix::errno::Errno;
use nix::sys::socket::{self, ControlMessage, ControlMessageOwned, MsgFlags};
use tracing::warn;

use crate::wire::{Message, ProtocolError, RAW_MESSAGE_LEN, RawMessage};

/// Mid-record continuation budget for sockets without a read timeout.
const STALL_GRACE: Duration = Duration::from_secs(1);

/// Result of one receive attempt.
#[derive(Debug)]
pub enum RecvOutcome {
    /// A whole message, with its file descriptor if it carried one.
    Message {
        message: Message,
        fd: Option<OwnedFd>,
    },
    /// The read timed out with no partial record buffered. Transient;
    /// check for shutdown and try again.
    TimedOut,
    /// The peer closed the connection.
    Closed,
}

/// Errors from the receive path.
#[derive(Debug)]
pub enum RecvError {
    /// The socket failed underneath us.
    Io(io::Error),
    /// The peer sent something that is not the protocol.
    Protocol(ProtocolError),
    /// The peer went quiet mid-record and the continuation budget ran
    /// out. Framing is lost; drop the connection.
    Stalled { needed: usize, got: usize },
}

impl std::fmt::Display for RecvError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(e) => write!(f, "socket receive failed: {}", e),
            Self::Protocol(e) => write!(f, "protocol violation: {}", e),
            Self::Stalled { needed, got } => {
                write!(f, "peer stalled mid-record: {} of {} bytes", got, needed)
            }
        }
    }
}

impl std::error::Error for RecvError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            Self::Protocol(e) => Some(e),
            Self::Stalled { .. } => None,
        }
    }
}

/// Send one message, with `fd` attached as ancillary data if given.
///
/// Short sends are continued; the fd always travels with the first chunk.
pub fn send_message(
    socket: &UnixStream,
    message: &Message,
    fd: Option<BorrowedFd<'_>>,
) -> io::Result<()> {
    let raw = message.encode();
    let bytes = raw.as_bytes();
    let raw_fds: [RawFd; 1] = [fd.map(|fd| fd.as_raw_fd()).unwrap_or(-1)];

    let mut sent = 0usize;
    while sent < bytes.len() {
        let iov = [IoSlice::new(&bytes[sent..])];
        let cmsgs = [ControlMessage::ScmRights(&raw_fds)];
        let with_fd = fd.is_some() && sent == 0;
        match socket::sendmsg::<()>(
            socket.as_raw_fd(),
            &iov,
            if with_fd { &cmsgs } else { &[] },
            MsgFlags::empty(),
            None,
        ) {
            Ok(n) => sent += n,
            Err(Errno::EINTR) => continue,
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}

/// Receive one whole message.
///
/// The socket's receive timeout bounds how long this blocks when nothing
/// arrives at all. Once a record is partially read, the read continues
/// until the record completes, the connection dies, or the peer stays
/// quiet for a full grace period, which surfaces as
/// [`RecvError::Stalled`].
pub fn recv_message(socket: &UnixStream) -> Result<RecvOutcome, RecvError> {
    let mut buf = [0u8; RAW_MESSAGE_LEN];
    let mut filled = 0usize;
    let mut fds: Vec<OwnedFd> = Vec::new();
    let mut stall_deadline: Option<Instant> = None;

    while filled < RAW_MESSAGE_LEN {
        let mut iov = [IoSliceMut::new(&mut buf[filled..])];
        let mut cmsg = nix::cmsg_space!([RawFd; 2]);
        match socket::recvmsg::<socket::UnixAddr>(
            socket.as_raw_fd(),
            &mut iov,
            Some(&mut cmsg),
            MsgFlags::empty(),
        ) {
            Ok(resp) => {
                let bytes = resp.bytes;
                for msg in resp.cmsgs().map_err(|e| RecvError::Io(e.into()))? {
                    match msg {
                        ControlMessageOwned::ScmRights(received) => {
                            for raw_fd in received {
                                // SAFETY: the kernel just installed this fd
                                // for us; nothing else owns it.
                                fds.push(unsafe { OwnedFd::from_raw_fd(raw_fd) });
                            }
                        }
                        other => warn!("ignoring unexpected control message: {:?}", other),
                    }
                }
                if bytes == 0 {
                    if filled != 0 {
                        warn!(filled, "connection closed mid-message");
                    }
                    return Ok(RecvOutcome::Closed);
                }
                filled += bytes;
                stall_deadline = None;
            }
            Err(Errno::EINTR) => {
                if filled == 0 {
                    return Ok(RecvOutcome::TimedOut);
                }
                // Mid-record; retry the read.
            }
            Err(Errno::EAGAIN) => {
                if filled == 0 {
                    return Ok(RecvOutcome::TimedOut);
                }
                // Mid-record the read continues to preserve framing, but
                // a quiet peer must not pin the receiver forever.
                let now = Instant::now();
                match stall_deadline {
                    None => {
                        let grace = socket.read_timeout().ok().flatten().unwrap_or(STALL_GRACE);
                        stall_deadline = Some(now + grace);
                    }
                    Some(deadline) if now >= deadline => {
                        warn!(
                            got = filled,
                            needed = RAW_MESSAGE_LEN,
                            "peer stalled mid-record"
                        );
                        return Err(RecvError::Stalled {
                            needed: RAW_MESSAGE_LEN,
                            got: filled,
                        });
                    }
                    Some(_) => {}
                }
            }
            Err(Errno::ECONNRESET) => return Ok(RecvOutcome::Closed),
            Err(e) => return Err(RecvError::Io(e.into())),
        }
    }

    let raw = RawMessage::from_bytes(&buf).map_err(RecvError::Protocol)?;
    let message = Message::decode(&raw).map_err(RecvError::Protocol)?;

    let fd = if message.wants_fd() {
        if fds.is_empty() {
            return Err(RecvError::Protocol(ProtocolError::MissingFd));
        }
        if fds.len() > 1 {
            warn!(
                tag = message.tag(),
                extra = fds.len() - 1,
                "message carried extra fds, closing them"
            );
        }
        Some(fds.swap_remove(0))
    } else {
        if !fds.is_empty() {
            warn!(
                tag = message.tag(),
                count = fds.len(),
                "fd attached to a message that takes none, closing it"
            );
        }
        None
    };

    Ok(RecvOutcome::Message { message, fd })
}
