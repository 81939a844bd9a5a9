//! The file-backed shared region device.
//!
//! - `RegionDevice::create`: size a new backing file and claim peer id 0
//! - `RegionDevice::open`: attach to an existing file and claim a free id
//! - `memory()`: map the whole region once, hand out cached views
//! - `ring_doorbell` / `register_vector_event`: peer-addressed signaling
//!
//! Peer identity is claimed by binding a datagram socket at
//! `<path>.db<N>`; the OS arbitrates, so two processes can never claim the
//! same id. The bound socket doubles as the peer's doorbell inbox.

use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::io::AsRawFd;
use std::os::unix::net::UnixDatagram;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;

use frame_primitives::Region;
use parking_lot::Mutex;

use crate::doorbell::{VectorEvent, VectorTable, bell_path, receive_loop};

/// Identity of a peer attached to a shared region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PeerId(pub u16);

impl std::fmt::Display for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "peer{}", self.0)
    }
}

/// A doorbell vector number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VectorId(pub u8);

impl std::fmt::Display for VectorId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "vector{}", self.0)
    }
}

/// Configuration for creating or opening a region device.
#[derive(Debug, Clone)]
pub struct RegionConfig {
    /// Region size in bytes when creating.
    pub size: u64,
    /// Minimum acceptable size when opening an existing region.
    pub min_size: u64,
    /// How many peer slots (doorbell sockets) exist for this region.
    pub max_peers: u16,
    /// How many doorbell vectors are routable.
    pub vectors: u8,
    /// Receive timeout of the doorbell socket; bounds shutdown latency.
    pub read_timeout: Duration,
}

impl Default for RegionConfig {
    fn default() -> Self {
        Self {
            size: 32 << 20,
            min_size: 0,
            max_peers: 16,
            vectors: 16,
            read_timeout: Duration::from_millis(50),
        }
    }
}

/// The mapped region. Unmapped on drop.
struct RegionMapping {
    base: *mut u8,
    len: usize,
}

unsafe impl Send for RegionMapping {}
unsafe impl Sync for RegionMapping {}

impl Drop for RegionMapping {
    fn drop(&mut self) {
        // SAFETY: base/len were returned by a successful mmap.
        unsafe {
            libc::munmap(self.base as *mut libc::c_void, self.len);
        }
    }
}

/// A handle on a shared region: its memory, this process's peer identity,
/// and the doorbell plumbing.
///
/// Dropping the device unmaps the region; any [`Region`] views obtained from
/// [`RegionDevice::memory`] must not outlive it.
pub struct RegionDevice {
    path: PathBuf,
    file: File,
    size: u64,
    peer_id: PeerId,
    mapping: Mutex<Option<Arc<RegionMapping>>>,
    bell_tx: UnixDatagram,
    bell_path: PathBuf,
    vectors: Arc<VectorTable>,
    shutdown: Arc<AtomicBool>,
    receiver: Option<JoinHandle<()>>,
}

impl RegionDevice {
    /// Create a new region file of `config.size` bytes and claim a peer id.
    ///
    /// Stale doorbell sockets from an earlier incarnation are removed first,
    /// so the creator normally claims id 0.
    pub fn create(path: impl AsRef<Path>, config: &RegionConfig) -> Result<Self, DeviceError> {
        let path = path.as_ref();

        for peer in 0..config.max_peers {
            let _ = std::fs::remove_file(bell_path(path, peer));
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .map_err(DeviceError::Io)?;
        file.set_len(config.size).map_err(DeviceError::Io)?;

        Self::attach(path, file, config.size, config)
    }

    /// Open an existing region file and claim a peer id.
    pub fn open(path: impl AsRef<Path>, config: &RegionConfig) -> Result<Self, DeviceError> {
        let path = path.as_ref();

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|e| {
                if e.kind() == io::ErrorKind::NotFound {
                    DeviceError::NotPresent
                } else {
                    DeviceError::Io(e)
                }
            })?;

        let size = file.metadata().map_err(DeviceError::Io)?.len();
        if size < config.min_size {
            return Err(DeviceError::TooSmall {
                required: config.min_size,
                found: size,
            });
        }

        Self::attach(path, file, size, config)
    }

    fn attach(
        path: &Path,
        file: File,
        size: u64,
        config: &RegionConfig,
    ) -> Result<Self, DeviceError> {
        let (bell_rx, bell_sock_path, peer_id) = claim_peer_socket(path, config.max_peers)?;
        bell_rx
            .set_read_timeout(Some(config.read_timeout))
            .map_err(DeviceError::Io)?;

        let bell_tx = UnixDatagram::unbound().map_err(DeviceError::Io)?;
        bell_tx.set_nonblocking(true).map_err(DeviceError::Io)?;

        let vectors = Arc::new(VectorTable::new(config.vectors));
        let shutdown = Arc::new(AtomicBool::new(false));

        let receiver = {
            let table = vectors.clone();
            let shutdown = shutdown.clone();
            std::thread::Builder::new()
                .name(format!("doorbell-{}", peer_id.0))
                .spawn(move || receive_loop(bell_rx, table, shutdown))
                .map_err(DeviceError::Io)?
        };

        tracing::debug!(%peer_id, size, path = %path.display(), "region device attached");

        Ok(Self {
            path: path.to_path_buf(),
            file,
            size,
            peer_id,
            mapping: Mutex::new(None),
            bell_tx,
            bell_path: bell_sock_path,
            vectors,
            shutdown,
            receiver: Some(receiver),
        })
    }

    /// Path of the backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Size of the region in bytes.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// The peer identity claimed by this handle. Stable for its lifetime.
    pub fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    /// Map the region and return a view of the whole of it.
    ///
    /// The first call maps; later calls return the cached mapping.
    pub fn memory(&self) -> Result<Region, DeviceError> {
        let mut guard = self.mapping.lock();
        if guard.is_none() {
            let len = self.size as usize;
            // SAFETY: the file is open and at least `len` bytes long.
            let base = unsafe {
                libc::mmap(
                    std::ptr::null_mut(),
                    len,
                    libc::PROT_READ | libc::PROT_WRITE,
                    libc::MAP_SHARED,
                    self.file.as_raw_fd(),
                    0,
                )
            };
            if base == libc::MAP_FAILED {
                return Err(DeviceError::Map(io::Error::last_os_error()));
            }
            *guard = Some(Arc::new(RegionMapping {
                base: base as *mut u8,
                len,
            }));
        }

        let mapping = guard.as_ref().expect("mapping just cached");
        // SAFETY: the mapping lives until the device is dropped.
        Ok(unsafe { Region::from_raw(mapping.base, mapping.len) })
    }

    /// Ring doorbell `vector` at `peer`. Fire-and-forget.
    ///
    /// A full receive buffer on the peer side counts as success: the peer is
    /// already signaled. A peer with no bound doorbell socket is an error.
    pub fn ring_doorbell(&self, peer: PeerId, vector: VectorId) -> Result<(), DeviceError> {
        if vector.0 >= self.vectors.vectors() {
            return Err(DeviceError::VectorOutOfRange(vector));
        }

        let target = bell_path(&self.path, peer.0);
        match self.bell_tx.send_to(&[vector.0], &target) {
            Ok(_) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(()),
            Err(e)
                if e.kind() == io::ErrorKind::NotFound
                    || e.kind() == io::ErrorKind::ConnectionRefused =>
            {
                Err(DeviceError::PeerNotBound(peer))
            }
            Err(e) => {
                tracing::warn!(%peer, %vector, "doorbell ring failed: {e}");
                Err(DeviceError::Io(e))
            }
        }
    }

    /// Register a waitable event for incoming doorbells on `vector`.
    ///
    /// At most one event per vector may be live at a time; dropping the
    /// returned handle frees the vector.
    pub fn register_vector_event(&self, vector: VectorId) -> Result<VectorEvent, DeviceError> {
        if vector.0 >= self.vectors.vectors() {
            return Err(DeviceError::VectorOutOfRange(vector));
        }
        if !self.vectors.try_register(vector) {
            return Err(DeviceError::VectorBusy(vector));
        }
        Ok(VectorEvent {
            table: self.vectors.clone(),
            vector,
        })
    }
}

impl Drop for RegionDevice {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::Release);
        if let Some(receiver) = self.receiver.take() {
            let _ = receiver.join();
        }
        let _ = std::fs::remove_file(&self.bell_path);
    }
}

/// Bind the first free doorbell socket for this region; the bound index is
/// the claimed peer id.
fn claim_peer_socket(
    path: &Path,
    max_peers: u16,
) -> Result<(UnixDatagram, PathBuf, PeerId), DeviceError> {
    for peer in 0..max_peers {
        let sock_path = bell_path(path, peer);
        match UnixDatagram::bind(&sock_path) {
            Ok(sock) => return Ok((sock, sock_path, PeerId(peer))),
            Err(e) if e.kind() == io::ErrorKind::AddrInUse => continue,
            Err(e) => return Err(DeviceError::Io(e)),
        }
    }
    Err(DeviceError::TooManyPeers)
}

/// Errors from region device operations.
#[derive(Debug)]
pub enum DeviceError {
    /// The region file does not exist.
    NotPresent,
    /// The region file is smaller than the caller requires.
    TooSmall { required: u64, found: u64 },
    /// Mapping the region failed.
    Map(io::Error),
    /// Other I/O error.
    Io(io::Error),
    /// All peer slots are claimed.
    TooManyPeers,
    /// The target peer has no doorbell socket bound.
    PeerNotBound(PeerId),
    /// The vector already has a live event registered.
    VectorBusy(VectorId),
    /// The vector is outside the configured range.
    VectorOutOfRange(VectorId),
}

impl std::fmt::Display for DeviceError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotPresent => write!(f, "region not present"),
            Self::TooSmall { required, found } => {
                write!(f, "region too small: need {} bytes, got {}", required, found)
            }
            Self::Map(e) => write!(f, "mapping region failed: {}", e),
            Self::Io(e) => write!(f, "I/O error: {}", e),
            Self::TooManyPeers => write!(f, "all peer slots claimed"),
            Self::PeerNotBound(peer) => write!(f, "{} has no doorbell bound", peer),
            Self::VectorBusy(vector) => write!(f, "{} already has an event registered", vector),
            Self::VectorOutOfRange(vector) => write!(f, "{} out of range", vector),
        }
    }
}

impl std::error::Error for DeviceError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Map(e) | Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use periscope_testkit::{init_tracing, temp_path};

    fn small() -> RegionConfig {
        RegionConfig {
            size: 1 << 16,
            ..RegionConfig::default()
        }
    }

    #[test]
    fn create_then_open_claims_distinct_peers() {
        init_tracing();
        let path = temp_path("region_peers");
        let creator = RegionDevice::create(path.as_path(), &small()).unwrap();
        assert_eq!(creator.peer_id(), PeerId(0));
        assert_eq!(creator.size(), 1 << 16);

        let opener = RegionDevice::open(path.as_path(), &small()).unwrap();
        assert_eq!(opener.peer_id(), PeerId(1));
        assert_eq!(opener.size(), 1 << 16);
    }

    #[test]
    fn open_missing_region_is_not_present() {
        let path = temp_path("region_missing");
        match RegionDevice::open(path.as_path(), &RegionConfig::default()) {
            Err(DeviceError::NotPresent) => {}
            other => panic!("expected NotPresent, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn open_undersized_region_is_too_small() {
        let path = temp_path("region_small");
        let _creator = RegionDevice::create(path.as_path(), &small()).unwrap();

        let demanding = RegionConfig {
            min_size: 1 << 20,
            ..RegionConfig::default()
        };
        match RegionDevice::open(path.as_path(), &demanding) {
            Err(DeviceError::TooSmall { required, found }) => {
                assert_eq!(required, 1 << 20);
                assert_eq!(found, 1 << 16);
            }
            other => panic!("expected TooSmall, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn memory_is_mapped_once_and_shared() {
        let path = temp_path("region_map");
        let device = RegionDevice::create(path.as_path(), &small()).unwrap();

        let first = device.memory().unwrap();
        let second = device.memory().unwrap();
        assert_eq!(first.offset(0), second.offset(0));
        assert_eq!(first.len(), 1 << 16);

        // Bytes written through one view are visible through the other.
        unsafe {
            *first.get_mut::<u32>(128) = 0xFEED;
            assert_eq!(*second.get::<u32>(128), 0xFEED);
        }
    }

    #[test]
    fn two_devices_share_the_file_contents() {
        let path = temp_path("region_shared");
        let a = RegionDevice::create(path.as_path(), &small()).unwrap();
        let b = RegionDevice::open(path.as_path(), &small()).unwrap();

        let ma = a.memory().unwrap();
        let mb = b.memory().unwrap();
        unsafe {
            *ma.get_mut::<u64>(4096) = 0xABCD_EF01;
            assert_eq!(*mb.get::<u64>(4096), 0xABCD_EF01);
        }
    }

    #[test]
    fn doorbell_rings_registered_vector() {
        init_tracing();
        let path = temp_path("region_bell");
        let host = RegionDevice::create(path.as_path(), &small()).unwrap();
        let guest = RegionDevice::open(path.as_path(), &small()).unwrap();

        let event = host.register_vector_event(VectorId(3)).unwrap();
        guest
            .ring_doorbell(host.peer_id(), VectorId(3))
            .unwrap();
        assert!(event.wait(Duration::from_secs(2)));
        // One ring, one signal.
        assert!(!event.try_take());
    }

    #[test]
    fn doorbell_routes_by_vector() {
        let path = temp_path("region_route");
        let host = RegionDevice::create(path.as_path(), &small()).unwrap();
        let guest = RegionDevice::open(path.as_path(), &small()).unwrap();

        let frame_event = host.register_vector_event(VectorId(0)).unwrap();
        let cursor_event = host.register_vector_event(VectorId(1)).unwrap();

        guest.ring_doorbell(host.peer_id(), VectorId(1)).unwrap();
        assert!(cursor_event.wait(Duration::from_secs(2)));
        assert!(!frame_event.try_take());
    }

    #[test]
    fn vector_can_only_be_registered_once() {
        let path = temp_path("region_busy");
        let device = RegionDevice::create(path.as_path(), &small()).unwrap();

        let event = device.register_vector_event(VectorId(2)).unwrap();
        assert!(matches!(
            device.register_vector_event(VectorId(2)),
            Err(DeviceError::VectorBusy(VectorId(2)))
        ));

        // Dropping the event frees the vector.
        drop(event);
        assert!(device.register_vector_event(VectorId(2)).is_ok());
    }

    #[test]
    fn ring_to_unbound_peer_fails() {
        let path = temp_path("region_unbound");
        let device = RegionDevice::create(path.as_path(), &small()).unwrap();
        assert!(matches!(
            device.ring_doorbell(PeerId(9), VectorId(0)),
            Err(DeviceError::PeerNotBound(PeerId(9)))
        ));
    }

    #[test]
    fn out_of_range_vector_is_rejected_and_foreign_bytes_dropped() {
        init_tracing();
        let path = temp_path("region_range");
        let device = RegionDevice::create(path.as_path(), &small()).unwrap();

        assert!(matches!(
            device.ring_doorbell(PeerId(0), VectorId(200)),
            Err(DeviceError::VectorOutOfRange(VectorId(200)))
        ));
        assert!(matches!(
            device.register_vector_event(VectorId(200)),
            Err(DeviceError::VectorOutOfRange(VectorId(200)))
        ));

        // A malformed doorbell byte from outside the API is logged and
        // dropped without waking anyone.
        let event = device.register_vector_event(VectorId(0)).unwrap();
        let rogue = UnixDatagram::unbound().unwrap();
        rogue
            .send_to(&[200u8], crate::doorbell::bell_path(path.as_path(), 0))
            .unwrap();
        assert!(!event.wait(Duration::from_millis(200)));
    }

    #[test]
    fn doorbell_signals_are_counted() {
        let path = temp_path("region_count");
        let host = RegionDevice::create(path.as_path(), &small()).unwrap();
        let guest = RegionDevice::open(path.as_path(), &small()).unwrap();

        let event = host.register_vector_event(VectorId(5)).unwrap();
        for _ in 0..3 {
            guest.ring_doorbell(host.peer_id(), VectorId(5)).unwrap();
        }
        let mut seen = 0;
        while event.wait(Duration::from_secs(1)) {
            seen += 1;
            if seen == 3 {
                break;
            }
        }
        assert_eq!(seen, 3);
    }

    #[test]
    fn signals_before_registration_are_not_replayed() {
        init_tracing();
        let path = temp_path("region_stale");
        let host = RegionDevice::create(path.as_path(), &small()).unwrap();
        let guest = RegionDevice::open(path.as_path(), &small()).unwrap();

        // Vector 1 only proves the unowned rings were routed: doorbells
        // from one peer arrive in order.
        let flush = host.register_vector_event(VectorId(1)).unwrap();
        for _ in 0..3 {
            guest.ring_doorbell(host.peer_id(), VectorId(5)).unwrap();
        }
        guest.ring_doorbell(host.peer_id(), VectorId(1)).unwrap();
        assert!(flush.wait(Duration::from_secs(2)));

        // Registering does not inherit the three unowned signals.
        let event = host.register_vector_event(VectorId(5)).unwrap();
        assert!(!event.try_take());

        // A ring after registration is seen, exactly once.
        guest.ring_doorbell(host.peer_id(), VectorId(5)).unwrap();
        assert!(event.wait(Duration::from_secs(2)));
        assert!(!event.try_take());
    }
}
