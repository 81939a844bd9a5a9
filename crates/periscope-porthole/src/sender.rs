//! The outbound side of the segment broker.
//!
//! This is what the guest agent drives: share descriptors, describe a
//! mapping segment by segment, seal it, and later withdraw it. The
//! state checks mirror the receiving side so a sender bug surfaces
//! here as a typed error instead of a dropped connection over there.

use std::collections::HashSet;
use std::io;
use std::os::unix::io::BorrowedFd;
use std::os::unix::net::UnixStream;
use std::path::Path;
use std::time::Duration;

use crate::socket::{self, RecvError, RecvOutcome};
use crate::wire::{Message, ProtocolError};

/// Errors from driving the outbound protocol.
#[derive(Debug)]
pub enum SendError {
    /// The socket failed.
    Io(io::Error),
    /// A segment or finish was pushed with no assembly open.
    NoAssembly,
    /// A segment referenced an fd id never shared on this connection.
    UnknownFd(u32),
    /// `begin` while the previous assembly is still open.
    AssemblyOpen,
    /// The unmap acknowledgement did not arrive in time.
    AckTimeout,
    /// The unmap acknowledgement named the wrong mapping.
    BadAck { expected: u32, got: u32 },
    /// The peer answered with something that is not the protocol.
    Protocol(ProtocolError),
    /// The peer hung up while an acknowledgement was pending.
    Closed,
}

impl std::fmt::Display for SendError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(e) => write!(f, "socket send failed: {}", e),
            Self::NoAssembly => write!(f, "no assembly is open"),
            Self::UnknownFd(id) => {
                write!(f, "fd {} was never shared on this connection", id)
            }
            Self::AssemblyOpen => write!(f, "an assembly is already open"),
            Self::AckTimeout => write!(f, "timed out waiting for the unmap acknowledgement"),
            Self::BadAck { expected, got } => {
                write!(f, "unmap acknowledged mapping {} instead of {}", got, expected)
            }
            Self::Protocol(e) => write!(f, "protocol violation: {}", e),
            Self::Closed => write!(f, "connection closed before the acknowledgement"),
        }
    }
}

impl std::error::Error for SendError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            Self::Protocol(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for SendError {
    fn from(e: io::Error) -> Self {
        Self::Io(e)
    }
}

/// A broker connection announcing mappings to the host side.
pub struct PortholeSender {
    stream: UnixStream,
    assembly_open: bool,
    shared: HashSet<u32>,
    ack_timeout: Duration,
}

impl PortholeSender {
    /// Connect to a broker socket.
    pub fn connect(path: impl AsRef<Path>) -> io::Result<Self> {
        Ok(Self::from_stream(UnixStream::connect(path)?))
    }

    /// Drive the outbound protocol over an already-connected stream.
    pub fn from_stream(stream: UnixStream) -> Self {
        Self {
            stream,
            assembly_open: false,
            shared: HashSet::new(),
            ack_timeout: Duration::from_secs(5),
        }
    }

    /// Bound how long [`unmap`](Self::unmap) waits for its reply.
    pub fn with_ack_timeout(mut self, ack_timeout: Duration) -> Self {
        self.ack_timeout = ack_timeout;
        self
    }

    /// Open a new assembly.
    pub fn begin(&mut self) -> Result<(), SendError> {
        if self.assembly_open {
            return Err(SendError::AssemblyOpen);
        }
        socket::send_message(&self.stream, &Message::Map, None)?;
        self.assembly_open = true;
        Ok(())
    }

    /// Share a descriptor under `id`. Allowed at any time, including
    /// outside an assembly; segments may then reference it.
    pub fn share_fd(&mut self, id: u32, fd: BorrowedFd<'_>) -> Result<(), SendError> {
        socket::send_message(&self.stream, &Message::Fd { id }, Some(fd))?;
        self.shared.insert(id);
        Ok(())
    }

    /// Append `size` bytes at offset `addr` of descriptor `fd_id` to the
    /// open assembly.
    pub fn push_segment(&mut self, fd_id: u32, size: u32, addr: u64) -> Result<(), SendError> {
        if !self.assembly_open {
            return Err(SendError::NoAssembly);
        }
        if !self.shared.contains(&fd_id) {
            return Err(SendError::UnknownFd(fd_id));
        }
        socket::send_message(&self.stream, &Message::Segment { fd_id, size, addr }, None)?;
        Ok(())
    }

    /// Seal the open assembly as mapping `id` of application kind `kind`.
    pub fn finish(&mut self, kind: u32, id: u32) -> Result<(), SendError> {
        if !self.assembly_open {
            return Err(SendError::NoAssembly);
        }
        socket::send_message(&self.stream, &Message::Finish { kind, id }, None)?;
        self.assembly_open = false;
        Ok(())
    }

    /// Withdraw mapping `id` and block until the host acknowledges.
    ///
    /// The ack is what makes teardown safe: once it arrives the host has
    /// stopped handing the mapping out, so the guest may release the
    /// memory behind it.
    pub fn unmap(&mut self, id: u32) -> Result<(), SendError> {
        socket::send_message(&self.stream, &Message::Unmap { id }, None)?;
        self.stream
            .set_read_timeout(Some(self.ack_timeout))
            .map_err(SendError::Io)?;
        match socket::recv_message(&self.stream) {
            Ok(RecvOutcome::TimedOut) => Err(SendError::AckTimeout),
            Ok(RecvOutcome::Closed) => Err(SendError::Closed),
            Ok(RecvOutcome::Message {
                message: Message::UnmapDone { id: got },
                ..
            }) => {
                if got == id {
                    Ok(())
                } else {
                    Err(SendError::BadAck { expected: id, got })
                }
            }
            Ok(RecvOutcome::Message { message, .. }) => Err(SendError::Protocol(
                ProtocolError::UnexpectedMessage(message.tag()),
            )),
            Err(RecvError::Io(e)) => Err(SendError::Io(e)),
            Err(RecvError::Protocol(e)) => Err(SendError::Protocol(e)),
            // A half-delivered ack that never completes is still no ack.
            Err(RecvError::Stalled { .. }) => Err(SendError::AckTimeout),
        }
    }
}
