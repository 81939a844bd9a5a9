//! Lock-free primitives for shared memory frame streaming.
//!
//! This crate provides `no_std`-compatible building blocks for moving video
//! frames through memory shared across a VM boundary, where one side holds a
//! raw pointer to a memory-mapped region the other side is still writing.
//!
//! # Primitives
//!
//! - [`StreamBuffer`]: a byte buffer published through a single monotonic
//!   atomic write offset, so a reader can stream a frame while the writer is
//!   still producing it
//! - [`Region`] / [`HeapRegion`]: raw views over mapped (or heap) memory that
//!   the primitives address by offset
//! - [`BulkCopy`]: pluggable copy strategy for the payload path
//!
//! # Loom Testing
//!
//! Enable the `loom` feature for concurrency verification of the publish /
//! consume protocol.
//!
//! ```text
//! cargo test -p frame-primitives --features loom
//! ```

#![no_std]

#[cfg(any(test, feature = "alloc"))]
extern crate alloc;
#[cfg(any(test, feature = "std"))]
extern crate std;

pub mod buffer;
pub mod copy;
pub mod region;
pub mod sync;

pub use buffer::{
    StreamBuffer, StreamHeader, StreamReader, StreamWriter, WaitPolicy, WaitTimeout, WriteError,
};
pub use copy::{BulkCopy, ByteCopy, CopyConfig, WideCopy};
#[cfg(any(test, feature = "alloc"))]
pub use region::HeapRegion;
pub use region::Region;

#[cfg(all(test, feature = "loom"))]
mod loom_tests;
