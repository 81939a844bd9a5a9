//! Guest-memory segment broker.
//!
//! A guest agent shares file descriptors and describes runs of guest
//! memory over a unix socket; the host side assembles them into logical
//! [`Mapping`]s it can read as one buffer. Teardown is acknowledged, so
//! the guest knows when memory is safe to reclaim.
//!
//! - [`wire`]: the 24-byte message records and their tags
//! - [`socket`]: message + fd transport over a unix stream
//! - [`shared_fd`]: reference-counted descriptors with lazy mappings
//! - [`mapping`]: [`Segment`] windows and assembled [`Mapping`]s
//! - [`client`]: the receiving state machine, [`PortholeClient`]
//! - [`sender`]: the announcing side, [`PortholeSender`]

#![forbid(unsafe_op_in_unsafe_fn)]

pub mod client;
pub mod mapping;
pub mod sender;
pub mod shared_fd;
pub mod socket;
pub mod wire;

pub use client::{Disconnect, PortholeClient, PortholeConfig, PortholeHandler};
pub use mapping::{Mapping, Segment};
pub use sender::{PortholeSender, SendError};
pub use shared_fd::{MapError, SharedFd};
pub use socket::{RecvError, RecvOutcome};
pub use wire::{Message, ProtocolError, RAW_MESSAGE_LEN, RawMessage};
