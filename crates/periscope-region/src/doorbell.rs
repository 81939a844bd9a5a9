//! Doorbell receive path: one socket per device, one waitable event per
//! vector.
//!
//! Each doorbell datagram is a single byte naming a vector. A dedicated
//! receiver thread drains the device's socket and bumps the matching
//! vector's pending count; [`VectorEvent`] handles wait on that count.

use std::ffi::OsString;
use std::os::unix::net::UnixDatagram;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use crate::device::VectorId;

/// Doorbell socket path for a peer: `<region path>.db<peer>`.
pub(crate) fn bell_path(region_path: &Path, peer: u16) -> PathBuf {
    let mut os = OsString::from(region_path.as_os_str());
    os.push(format!(".db{peer}"));
    PathBuf::from(os)
}

struct VectorSlot {
    registered: AtomicBool,
    pending: Mutex<u32>,
    signaled: Condvar,
}

impl VectorSlot {
    fn new() -> Self {
        Self {
            registered: AtomicBool::new(false),
            pending: Mutex::new(0),
            signaled: Condvar::new(),
        }
    }
}

/// Routing table shared between the receiver thread and vector events.
pub(crate) struct VectorTable {
    slots: Vec<VectorSlot>,
}

impl VectorTable {
    pub(crate) fn new(vectors: u8) -> Self {
        Self {
            slots: (0..vectors).map(|_| VectorSlot::new()).collect(),
        }
    }

    pub(crate) fn vectors(&self) -> u8 {
        self.slots.len() as u8
    }

    /// Mark a vector as registered. Returns false if it already was.
    ///
    /// Registration starts clean: signals delivered while the vector had
    /// no event are discarded, not replayed to the new one.
    pub(crate) fn try_register(&self, vector: VectorId) -> bool {
        let Some(slot) = self.slots.get(vector.0 as usize) else {
            return false;
        };
        if slot.registered.swap(true, Ordering::AcqRel) {
            return false;
        }
        *slot.pending.lock() = 0;
        true
    }

    fn deliver(&self, vector: u8) {
        let Some(slot) = self.slots.get(vector as usize) else {
            tracing::warn!(vector, "doorbell for out-of-range vector dropped");
            return;
        };
        let mut pending = slot.pending.lock();
        *pending = pending.saturating_add(1);
        slot.signaled.notify_all();
    }
}

/// Receiver loop: drain the doorbell socket until shutdown.
///
/// The socket has a read timeout so the loop observes `shutdown` within one
/// quantum.
pub(crate) fn receive_loop(socket: UnixDatagram, table: Arc<VectorTable>, shutdown: Arc<AtomicBool>) {
    let mut buf = [0u8; 16];
    while !shutdown.load(Ordering::Acquire) {
        match socket.recv(&mut buf) {
            Ok(0) => {}
            Ok(n) => {
                // Well-formed doorbells are exactly one byte; tolerate more
                // and route each byte.
                for &vector in &buf[..n] {
                    table.deliver(vector);
                }
            }
            Err(e)
                if e.kind() == std::io::ErrorKind::WouldBlock
                    || e.kind() == std::io::ErrorKind::TimedOut => {}
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
            Err(e) => {
                tracing::warn!("doorbell receive failed: {e}");
                break;
            }
        }
    }
}

/// A waitable handle for one doorbell vector.
///
/// Signals are counted: every doorbell rung for the vector releases one
/// [`VectorEvent::wait`] (or one [`VectorEvent::try_take`]). Dropping the
/// event releases the vector for re-registration.
pub struct VectorEvent {
    pub(crate) table: Arc<VectorTable>,
    pub(crate) vector: VectorId,
}

impl VectorEvent {
    /// The vector this event is registered for.
    pub fn vector(&self) -> VectorId {
        self.vector
    }

    /// Consume one pending signal without blocking.
    pub fn try_take(&self) -> bool {
        let slot = &self.table.slots[self.vector.0 as usize];
        let mut pending = slot.pending.lock();
        if *pending > 0 {
            *pending -= 1;
            true
        } else {
            false
        }
    }

    /// Block until a signal arrives or `timeout` elapses.
    ///
    /// Returns true if a signal was consumed.
    pub fn wait(&self, timeout: Duration) -> bool {
        let deadline = std::time::Instant::now() + timeout;
        let slot = &self.table.slots[self.vector.0 as usize];
        let mut pending = slot.pending.lock();
        while *pending == 0 {
            if slot.signaled.wait_until(&mut pending, deadline).timed_out() && *pending == 0 {
                return false;
            }
        }
        *pending -= 1;
        true
    }
}

impl Drop for VectorEvent {
    fn drop(&mut self) {
        self.table.slots[self.vector.0 as usize]
            .registered
            .store(false, Ordering::Release);
    }
}
