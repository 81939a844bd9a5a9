//! Broker wire messages.
//!
//! Every message on a broker socket is one fixed 24-byte record; the only
//! variable part is an optional file descriptor in ancillary data, and
//! only `MSG_FD` carries one. A fixed size keeps framing trivial on a
//! stream socket: read 24 bytes, decode, repeat.

/// Open a new mapping assembly.
pub const MSG_MAP: u32 = 1;
/// Register a shared file descriptor under an id (fd in ancillary data).
pub const MSG_FD: u32 = 2;
/// Append a segment of a registered fd to the open assembly.
pub const MSG_SEGMENT: u32 = 3;
/// Seal the open assembly into a mapping.
pub const MSG_FINISH: u32 = 4;
/// Tear down a mapping; the receiver must reply.
pub const MSG_UNMAP: u32 = 5;
/// Reply confirming an unmap.
pub const MSG_UNMAP_DONE: u32 = 6;

/// Serialized size of [`RawMessage`].
pub const RAW_MESSAGE_LEN: usize = 24;

/// The fixed wire record (24 bytes, no padding holes).
///
/// Field use depends on `tag`; unused fields are sent as zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub struct RawMessage {
    /// Message tag (`MSG_*`).
    pub tag: u32,
    /// First argument (id, fd id, or kind depending on tag).
    pub a: u32,
    /// Second argument (size or id depending on tag).
    pub b: u32,
    /// Reserved, sent as zero.
    pub _pad: u32,
    /// Byte offset into the shared fd (`MSG_SEGMENT` only).
    pub addr: u64,
}

const _: () = assert!(core::mem::size_of::<RawMessage>() == RAW_MESSAGE_LEN);

impl RawMessage {
    /// View the record as its wire bytes.
    pub fn as_bytes(&self) -> &[u8] {
        // SAFETY: RawMessage is repr(C) with no padding bytes.
        unsafe {
            core::slice::from_raw_parts((self as *const RawMessage).cast::<u8>(), RAW_MESSAGE_LEN)
        }
    }

    /// Decode a record from wire bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ProtocolError> {
        if bytes.len() < RAW_MESSAGE_LEN {
            return Err(ProtocolError::Truncated {
                needed: RAW_MESSAGE_LEN,
                got: bytes.len(),
            });
        }
        // SAFETY: repr(C), no padding, every bit pattern valid; the tag is
        // checked by Message::decode.
        Ok(unsafe { core::ptr::read_unaligned(bytes.as_ptr().cast::<RawMessage>()) })
    }
}

/// A decoded broker message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Message {
    /// Open a new mapping assembly.
    Map,
    /// Register the accompanying fd under `id`.
    Fd { id: u32 },
    /// Append `size` bytes at offset `addr` of fd `fd_id`.
    Segment { fd_id: u32, size: u32, addr: u64 },
    /// Seal the assembly as mapping `id` of application-defined `kind`.
    Finish { kind: u32, id: u32 },
    /// Tear down mapping `id`.
    Unmap { id: u32 },
    /// Confirm the teardown of mapping `id`.
    UnmapDone { id: u32 },
}

impl Message {
    /// Encode to the wire record.
    pub fn encode(&self) -> RawMessage {
        let mut raw = RawMessage {
            tag: 0,
            a: 0,
            b: 0,
            _pad: 0,
            addr: 0,
        };
        match *self {
            Message::Map => raw.tag = MSG_MAP,
            Message::Fd { id } => {
                raw.tag = MSG_FD;
                raw.a = id;
            }
            Message::Segment { fd_id, size, addr } => {
                raw.tag = MSG_SEGMENT;
                raw.a = fd_id;
                raw.b = size;
                raw.addr = addr;
            }
            Message::Finish { kind, id } => {
                raw.tag = MSG_FINISH;
                raw.a = kind;
                raw.b = id;
            }
            Message::Unmap { id } => {
                raw.tag = MSG_UNMAP;
                raw.a = id;
            }
            Message::UnmapDone { id } => {
                raw.tag = MSG_UNMAP_DONE;
                raw.a = id;
            }
        }
        raw
    }

    /// Decode a wire record.
    pub fn decode(raw: &RawMessage) -> Result<Self, ProtocolError> {
        match raw.tag {
            MSG_MAP => Ok(Message::Map),
            MSG_FD => Ok(Message::Fd { id: raw.a }),
            MSG_SEGMENT => Ok(Message::Segment {
                fd_id: raw.a,
                size: raw.b,
                addr: raw.addr,
            }),
            MSG_FINISH => Ok(Message::Finish {
                kind: raw.a,
                id: raw.b,
            }),
            MSG_UNMAP => Ok(Message::Unmap { id: raw.a }),
            MSG_UNMAP_DONE => Ok(Message::UnmapDone { id: raw.a }),
            other => Err(ProtocolError::UnknownTag(other)),
        }
    }

    /// Whether this message must carry a file descriptor.
    pub fn wants_fd(&self) -> bool {
        matches!(self, Message::Fd { .. })
    }

    /// The wire tag of this message.
    pub fn tag(&self) -> u32 {
        self.encode().tag
    }
}

/// Violations of the broker protocol. Connection-fatal: the receiver
/// closes the connection and reports them as a structured disconnect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolError {
    /// Unknown message tag.
    UnknownTag(u32),
    /// Fewer bytes than a wire record.
    Truncated { needed: usize, got: usize },
    /// `MSG_FD` arrived without a file descriptor.
    MissingFd,
    /// The received fd under this id could not be inspected.
    FdUnusable { id: u32 },
    /// A segment or finish arrived with no assembly open.
    NoAssembly { tag: u32 },
    /// A segment referenced an unregistered fd id.
    UnknownFd(u32),
    /// A segment range does not fit inside its fd.
    SegmentOutOfRange {
        fd_id: u32,
        offset: u64,
        len: u32,
        fd_len: u64,
    },
    /// A message that has no business arriving in this direction.
    UnexpectedMessage(u32),
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UnknownTag(tag) => write!(f, "unknown message tag {}", tag),
            Self::Truncated { needed, got } => {
                write!(f, "truncated message: need {} bytes, got {}", needed, got)
            }
            Self::MissingFd => write!(f, "fd message without a file descriptor"),
            Self::FdUnusable { id } => write!(f, "shared fd {} is unusable", id),
            Self::NoAssembly { tag } => {
                write!(f, "message tag {} arrived with no assembly open", tag)
            }
            Self::UnknownFd(id) => write!(f, "segment references unregistered fd {}", id),
            Self::SegmentOutOfRange {
                fd_id,
                offset,
                len,
                fd_len,
            } => {
                write!(
                    f,
                    "segment out of range: offset {} + len {} vs fd {} length {}",
                    offset, len, fd_id, fd_len
                )
            }
            Self::UnexpectedMessage(tag) => write!(f, "unexpected message tag {}", tag),
        }
    }
}

impl std::error::Error for ProtocolError {}
