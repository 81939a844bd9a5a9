//! Shared-region provider: file-backed memory shared between a VM host and
//! guest agent, plus doorbell vectors for cross-peer wakeups.
//!
//! The provider is a platform facade. It knows nothing about frames or
//! protocols; it hands out a mapped [`frame_primitives::Region`] and routes
//! small interrupt-like signals ("doorbells") between peers. On real
//! hypervisor deployments the region is a shared-memory device; here it is a
//! file plus a set of datagram sockets, which keeps the semantics identical
//! across two local processes.
//!
//! - [`RegionDevice`]: open/create the region, query its size, claim a
//!   [`PeerId`], map the memory
//! - [`RegionDevice::ring_doorbell`]: fire-and-forget signal to another peer
//! - [`RegionDevice::register_vector_event`]: waitable handle for one
//!   incoming vector

#![forbid(unsafe_op_in_unsafe_fn)]

mod device;
mod doorbell;

pub use device::{DeviceError, PeerId, RegionConfig, RegionDevice, VectorId};
pub use doorbell::VectorEvent;
