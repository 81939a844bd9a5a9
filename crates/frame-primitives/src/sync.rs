#[cfg(not(feature = "loom"))]
pub use core::hint::spin_loop;
#[cfg(feature = "loom")]
pub use loom::hint::spin_loop;

#[cfg(not(feature = "loom"))]
pub use core::sync::atomic::{AtomicU32, AtomicU64, Ordering, fence};
#[cfg(feature = "loom")]
pub use loom::sync::atomic::{AtomicU32, AtomicU64, Ordering, fence};

#[cfg(feature = "loom")]
pub use loom::thread;
#[cfg(all(not(feature = "loom"), any(test, feature = "std")))]
pub use std::thread;

/// Park the caller for one wait quantum.
///
/// Under loom this yields so the model can explore interleavings; without
/// `std` it degrades to a spin hint.
#[cfg(all(not(feature = "loom"), any(test, feature = "std")))]
pub fn sleep(quantum: core::time::Duration) {
    std::thread::sleep(quantum);
}

#[cfg(feature = "loom")]
pub fn sleep(_quantum: core::time::Duration) {
    loom::thread::yield_now();
}

#[cfg(all(not(feature = "loom"), not(any(test, feature = "std"))))]
pub fn sleep(_quantum: core::time::Duration) {
    core::hint::spin_loop();
}
