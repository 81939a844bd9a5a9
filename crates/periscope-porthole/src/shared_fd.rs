//! Reference-counted shared file descriptors.
//!
//! A descriptor announced over the broker socket may back any number of
//! segments, across any number of mappings. It is mapped read-only the
//! first time a segment needs it and unmapped when the last segment
//! goes away; the descriptor itself stays open so a later mapping can
//! bring the memory back without a fresh `MSG_FD`.

use std::io;
use std::mem::MaybeUninit;
use std::os::unix::io::{AsRawFd, OwnedFd};
use std::sync::atomic::{AtomicU32, Ordering};

use parking_lot::Mutex;
use tracing::debug;

/// Errors from registering or mapping a shared descriptor.
#[derive(Debug)]
pub enum MapError {
    /// `fstat` on the descriptor failed.
    Stat(io::Error),
    /// `mmap` failed.
    Mmap(io::Error),
    /// The backing memory is not currently mapped.
    NotMapped,
    /// A read fell outside the descriptor's extent.
    OutOfRange { offset: u64, len: u64, size: u64 },
}

impl std::fmt::Display for MapError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Stat(e) => write!(f, "could not stat shared fd: {}", e),
            Self::Mmap(e) => write!(f, "could not map shared fd: {}", e),
            Self::NotMapped => write!(f, "shared fd is not mapped"),
            Self::OutOfRange { offset, len, size } => write!(
                f,
                "read of {} bytes at offset {} exceeds fd size {}",
                len, offset, size
            ),
        }
    }
}

impl std::error::Error for MapError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Stat(e) | Self::Mmap(e) => Some(e),
            _ => None,
        }
    }
}

/// A live read-only mapping of a shared descriptor.
struct FdMapping {
    base: *mut u8,
    len: usize,
}

unsafe impl Send for FdMapping {}
unsafe impl Sync for FdMapping {}

impl FdMapping {
    fn new(fd: &OwnedFd, len: u64) -> Result<Self, MapError> {
        // SAFETY: mapping a whole fd read-only has no preconditions
        // beyond the fd being valid, which OwnedFd guarantees.
        let base = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len as usize,
                libc::PROT_READ,
                libc::MAP_SHARED,
                fd.as_raw_fd(),
                0,
            )
        };
        if base == libc::MAP_FAILED {
            return Err(MapError::Mmap(io::Error::last_os_error()));
        }
        Ok(Self {
            base: base as *mut u8,
            len: len as usize,
        })
    }
}

impl Drop for FdMapping {
    fn drop(&mut self) {
        // SAFETY: base/len were returned by a successful mmap.
        unsafe {
            libc::munmap(self.base as *mut libc::c_void, self.len);
        }
    }
}

/// One descriptor received over the broker socket, shared by every
/// segment that references it.
pub struct SharedFd {
    id: u32,
    fd: OwnedFd,
    len: u64,
    refs: AtomicU32,
    map: Mutex<Option<FdMapping>>,
}

impl SharedFd {
    /// Take ownership of a received descriptor and record its size.
    pub fn register(id: u32, fd: OwnedFd) -> Result<Self, MapError> {
        let mut stat = MaybeUninit::<libc::stat>::uninit();
        // SAFETY: fd is valid and stat points at enough space.
        let rc = unsafe { libc::fstat(fd.as_raw_fd(), stat.as_mut_ptr()) };
        if rc != 0 {
            return Err(MapError::Stat(io::Error::last_os_error()));
        }
        // SAFETY: fstat succeeded, so the struct is initialized.
        let len = unsafe { stat.assume_init() }.st_size as u64;
        Ok(Self {
            id,
            fd,
            len,
            refs: AtomicU32::new(0),
            map: Mutex::new(None),
        })
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    /// Size of the backing file in bytes.
    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Segments currently holding this descriptor mapped.
    pub fn ref_count(&self) -> u32 {
        self.refs.load(Ordering::Acquire)
    }

    /// Whether the backing memory is mapped right now.
    pub fn is_mapped(&self) -> bool {
        self.map.lock().is_some()
    }

    /// Base address of the live mapping, if any. The pointer stays valid
    /// only while at least one reference is held.
    pub(crate) fn mapped_base(&self) -> Option<*const u8> {
        self.map.lock().as_ref().map(|m| m.base as *const u8)
    }

    /// Add a reference, mapping the memory on the first one.
    pub(crate) fn acquire(&self) -> Result<(), MapError> {
        let mut guard = self.map.lock();
        if guard.is_none() {
            *guard = Some(FdMapping::new(&self.fd, self.len)?);
            debug!(id = self.id, len = self.len, "mapped shared fd");
        }
        self.refs.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    /// Drop a reference, unmapping when the last one goes.
    pub(crate) fn release(&self) {
        let mut guard = self.map.lock();
        let prev = self.refs.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev != 0, "release without matching acquire");
        if prev == 1 && guard.take().is_some() {
            debug!(id = self.id, "unmapped shared fd");
        }
    }

    /// Copy `dst.len()` bytes out of the mapped memory at `offset`.
    ///
    /// The guest side may be writing this memory concurrently, so the
    /// copy goes through raw pointers and makes no tearing guarantees
    /// beyond what the producer's own publication protocol provides.
    pub(crate) fn copy_region(&self, offset: u64, dst: &mut [u8]) -> Result<(), MapError> {
        match offset.checked_add(dst.len() as u64) {
            Some(end) if end <= self.len => {}
            _ => {
                return Err(MapError::OutOfRange {
                    offset,
                    len: dst.len() as u64,
                    size: self.len,
                });
            }
        }
        let guard = self.map.lock();
        let mapping = guard.as_ref().ok_or(MapError::NotMapped)?;
        // SAFETY: offset + dst.len() <= self.len == mapping.len, and dst
        // cannot overlap a MAP_SHARED region we never hand out.
        unsafe {
            std::ptr::copy_nonoverlapping(
                mapping.base.add(offset as usize),
                dst.as_mut_ptr(),
                dst.len(),
            );
        }
        Ok(())
    }
}

impl std::fmt::Debug for SharedFd {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedFd")
            .field("id", &self.id)
            .field("len", &self.len)
            .field("refs", &self.ref_count())
            .field("mapped", &self.is_mapped())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use periscope_testkit::memfd_with;

    #[test]
    fn register_records_the_size() {
        let shared = SharedFd::register(1, memfd_with(&[0u8; 4096])).unwrap();
        assert_eq!(shared.len(), 4096);
        assert_eq!(shared.ref_count(), 0);
        assert!(!shared.is_mapped());
    }

    #[test]
    fn first_acquire_maps_last_release_unmaps() {
        let shared = SharedFd::register(1, memfd_with(&[7u8; 128])).unwrap();
        shared.acquire().unwrap();
        shared.acquire().unwrap();
        assert_eq!(shared.ref_count(), 2);
        assert!(shared.is_mapped());

        shared.release();
        assert!(shared.is_mapped());
        shared.release();
        assert_eq!(shared.ref_count(), 0);
        assert!(!shared.is_mapped());
    }

    #[test]
    fn copy_reads_what_the_file_holds() {
        let mut payload = vec![0u8; 512];
        for (i, byte) in payload.iter_mut().enumerate() {
            *byte = (i % 251) as u8;
        }
        let shared = SharedFd::register(3, memfd_with(&payload)).unwrap();
        shared.acquire().unwrap();

        let mut back = vec![0u8; 100];
        shared.copy_region(200, &mut back).unwrap();
        assert_eq!(&back[..], &payload[200..300]);
        shared.release();
    }

    #[test]
    fn copy_without_mapping_is_refused() {
        let shared = SharedFd::register(4, memfd_with(&[0u8; 64])).unwrap();
        let mut back = [0u8; 8];
        assert!(matches!(
            shared.copy_region(0, &mut back),
            Err(MapError::NotMapped)
        ));
    }

    #[test]
    fn copy_past_the_end_is_refused() {
        let shared = SharedFd::register(5, memfd_with(&[0u8; 64])).unwrap();
        shared.acquire().unwrap();
        let mut back = [0u8; 16];
        assert!(matches!(
            shared.copy_region(56, &mut back),
            Err(MapError::OutOfRange { .. })
        ));
        shared.release();
    }
}
