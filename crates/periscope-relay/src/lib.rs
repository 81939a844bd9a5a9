//! Shared-memory video frame relay.
//!
//! A relay region carries frames from one producing process to any number
//! of consuming ones: a fixed header, a cursor side channel, and a small
//! ring of frame slots, each a streaming buffer the consumer can read
//! while the producer is still writing.
//!
//! - [`header`]: the 48-byte frame header wire contract
//! - [`layout`]: the relay region layout and its validation
//! - [`relay`]: [`FrameProducer`] / [`FrameConsumer`] and frame streaming
//! - [`cursor`]: the seqlock cursor side channel
//!
//! The region itself can be any shared mapping; `periscope-region`
//! provides the file-backed device plus doorbell signaling used across a
//! VM boundary.

#![forbid(unsafe_op_in_unsafe_fn)]

pub mod cursor;
pub mod header;
pub mod layout;
pub mod relay;

pub use cursor::{CursorFlags, CursorHeader, CursorReader, CursorShape, CursorUpdate, CursorWriter};
pub use header::{
    FRAME_HEADER_LEN, FRAME_MAGIC, FRAME_VERSION, FrameHeader, FrameKind, HEADER_BLOCK_LEN,
    HeaderError,
};
pub use layout::{
    DEFAULT_CURSOR_CAPACITY, DEFAULT_SLOT_CAPACITY, DEFAULT_SLOT_COUNT, LayoutError, RELAY_MAGIC,
    RELAY_VERSION, RelayHeader, RelayLayout, RelayOffsets,
};
pub use relay::{FrameConsumer, FrameMeta, FrameProducer, FrameRx, FrameSignal, FrameTx, RelayError};

// The wait policy travels with every read; re-export it so callers do not
// need a direct frame-primitives dependency.
pub use frame_primitives::{WaitPolicy, WaitTimeout};
