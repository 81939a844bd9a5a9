//! The inbound side of the segment broker.
//!
//! One dedicated thread per connection owns every piece of broker state:
//! registered descriptors, the at-most-one open assembly, and the live
//! mappings. Handler callbacks run on that thread, so they must not
//! block for long or the remote side stalls waiting for unmap replies.

use std::collections::HashMap;
use std::io;
use std::os::unix::io::OwnedFd;
use std::os::unix::net::UnixStream;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::mapping::{Mapping, Segment, SegmentError};
use crate::shared_fd::{MapError, SharedFd};
use crate::socket::{self, RecvError, RecvOutcome};
use crate::wire::{MSG_FINISH, MSG_SEGMENT, MSG_UNMAP_DONE, Message, ProtocolError};

/// Why a broker connection ended.
#[derive(Debug)]
pub enum Disconnect {
    /// The remote side closed the socket.
    Closed,
    /// The remote side broke the protocol; the connection is dropped
    /// rather than guessing at its state.
    Protocol(ProtocolError),
    /// A received descriptor could not be mapped.
    Map(MapError),
    /// The socket failed underneath the session.
    Io(io::Error),
}

impl std::fmt::Display for Disconnect {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "connection closed by peer"),
            Self::Protocol(e) => write!(f, "protocol violation: {}", e),
            Self::Map(e) => write!(f, "mapping failed: {}", e),
            Self::Io(e) => write!(f, "i/o failure: {}", e),
        }
    }
}

impl std::error::Error for Disconnect {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Closed => None,
            Self::Protocol(e) => Some(e),
            Self::Map(e) => Some(e),
            Self::Io(e) => Some(e),
        }
    }
}

/// Callbacks for broker events.
///
/// All methods run on the connection's receiver thread. Blocking there
/// blocks the whole broker, including the unmap acknowledgement the
/// remote side waits for. Every method has a no-op default so consumers
/// implement only what they care about.
pub trait PortholeHandler: Send + 'static {
    /// A mapping was sealed and is now live.
    fn mapped(&mut self, kind: u32, mapping: &Arc<Mapping>) {
        let _ = (kind, mapping);
    }

    /// The remote side withdrew a mapping. The memory is released once
    /// every outstanding `Arc<Mapping>` clone is gone.
    fn unmapped(&mut self, id: u32) {
        let _ = id;
    }

    /// The connection ended. Called at most once, and not at all when
    /// the local side closes deliberately.
    fn disconnected(&mut self, reason: Disconnect) {
        let _ = reason;
    }
}

/// Connection tuning for [`PortholeClient`].
#[derive(Debug, Clone)]
pub struct PortholeConfig {
    /// Receive timeout; bounds how long shutdown takes to observe.
    pub read_timeout: Duration,
}

impl Default for PortholeConfig {
    fn default() -> Self {
        Self {
            read_timeout: Duration::from_millis(50),
        }
    }
}

#[derive(Default)]
struct Assembly {
    segments: Vec<Segment>,
}

/// Everything the receiver thread owns. Parked here when the loop ends
/// so mappings stay intact (stale) until [`PortholeClient::close`].
#[derive(Default)]
struct ReceiverState {
    fds: HashMap<u32, Arc<SharedFd>>,
    active: HashMap<u32, Arc<Mapping>>,
    pending: Option<Assembly>,
}

impl ReceiverState {
    fn handle<H: PortholeHandler>(
        &mut self,
        stream: &UnixStream,
        message: Message,
        fd: Option<OwnedFd>,
        handler: &mut H,
    ) -> Result<(), Disconnect> {
        match message {
            Message::Map => {
                if self.pending.take().is_some() {
                    warn!("new map while an assembly was open, discarding it");
                }
                self.pending = Some(Assembly::default());
            }
            Message::Fd { id } => {
                let fd = fd.ok_or(Disconnect::Protocol(ProtocolError::MissingFd))?;
                let shared = SharedFd::register(id, fd).map_err(|e| match e {
                    MapError::Stat(io) => {
                        warn!(id, error = %io, "received fd cannot be inspected");
                        Disconnect::Protocol(ProtocolError::FdUnusable { id })
                    }
                    other => Disconnect::Map(other),
                })?;
                if self.fds.insert(id, Arc::new(shared)).is_some() {
                    warn!(id, "fd id re-registered, replacing the previous descriptor");
                }
            }
            Message::Segment { fd_id, size, addr } => {
                let assembly = self
                    .pending
                    .as_mut()
                    .ok_or(Disconnect::Protocol(ProtocolError::NoAssembly {
                        tag: MSG_SEGMENT,
                    }))?;
                let shared = self
                    .fds
                    .get(&fd_id)
                    .cloned()
                    .ok_or(Disconnect::Protocol(ProtocolError::UnknownFd(fd_id)))?;
                let segment = Segment::new(shared, addr, size).map_err(|e| match e {
                    SegmentError::OutOfRange(p) => Disconnect::Protocol(p),
                    SegmentError::Map(m) => Disconnect::Map(m),
                })?;
                assembly.segments.push(segment);
            }
            Message::Finish { kind, id } => {
                let assembly =
                    self.pending
                        .take()
                        .ok_or(Disconnect::Protocol(ProtocolError::NoAssembly {
                            tag: MSG_FINISH,
                        }))?;
                let mapping = Arc::new(Mapping::seal(id, kind, assembly.segments));
                debug!(
                    id,
                    kind,
                    size = mapping.size(),
                    segments = mapping.segment_count(),
                    "mapping sealed"
                );
                if self.active.insert(id, mapping.clone()).is_some() {
                    warn!(id, "mapping id reused, replacing the previous mapping");
                }
                handler.mapped(kind, &mapping);
            }
            Message::Unmap { id } => {
                if self.active.contains_key(&id) {
                    handler.unmapped(id);
                    self.active.remove(&id);
                } else {
                    warn!(id, "unmap for unknown mapping id");
                }
                // Reply even for unknown ids so the remote never stalls.
                socket::send_message(stream, &Message::UnmapDone { id }, None)
                    .map_err(Disconnect::Io)?;
            }
            Message::UnmapDone { .. } => {
                return Err(Disconnect::Protocol(ProtocolError::UnexpectedMessage(
                    MSG_UNMAP_DONE,
                )));
            }
        }
        Ok(())
    }
}

#[derive(Default)]
struct ClientStats {
    mappings: usize,
    shared_fds: usize,
}

/// A broker connection receiving mappings from the guest side.
pub struct PortholeClient {
    shutdown: Arc<AtomicBool>,
    receiver: Option<JoinHandle<()>>,
    stats: Arc<Mutex<ClientStats>>,
    retained: Arc<Mutex<Option<ReceiverState>>>,
}

impl PortholeClient {
    /// Connect to a broker socket and start receiving.
    pub fn connect<H: PortholeHandler>(
        path: impl AsRef<Path>,
        handler: H,
        config: &PortholeConfig,
    ) -> io::Result<Self> {
        let stream = UnixStream::connect(path)?;
        Self::from_stream(stream, handler, config)
    }

    /// Run the broker over an already-connected stream.
    pub fn from_stream<H: PortholeHandler>(
        stream: UnixStream,
        handler: H,
        config: &PortholeConfig,
    ) -> io::Result<Self> {
        stream.set_read_timeout(Some(config.read_timeout))?;
        let shutdown = Arc::new(AtomicBool::new(false));
        let stats = Arc::new(Mutex::new(ClientStats::default()));
        let retained = Arc::new(Mutex::new(None));

        let receiver = {
            let shutdown = shutdown.clone();
            let stats = stats.clone();
            let retained = retained.clone();
            std::thread::Builder::new()
                .name("porthole-recv".into())
                .spawn(move || receive_loop(stream, handler, shutdown, stats, retained))?
        };

        Ok(Self {
            shutdown,
            receiver: Some(receiver),
            stats,
            retained,
        })
    }

    /// Live mappings, as of the last handled message.
    pub fn mapping_count(&self) -> usize {
        self.stats.lock().mappings
    }

    /// Registered shared descriptors, as of the last handled message.
    pub fn shared_fd_count(&self) -> usize {
        self.stats.lock().shared_fds
    }

    /// Stop the receiver and free every mapping and descriptor this
    /// connection still holds. Idempotent; also runs on drop.
    pub fn close(&mut self) {
        self.shutdown.store(true, Ordering::Release);
        if let Some(handle) = self.receiver.take() {
            if handle.join().is_err() {
                warn!("broker receiver thread panicked");
            }
        }
        // Dropping the retained state releases segments, unmaps shared
        // memory, and closes descriptors (modulo Arc clones still held
        // by the application).
        drop(self.retained.lock().take());
    }
}

impl Drop for PortholeClient {
    fn drop(&mut self) {
        self.close();
    }
}

fn receive_loop<H: PortholeHandler>(
    stream: UnixStream,
    mut handler: H,
    shutdown: Arc<AtomicBool>,
    stats: Arc<Mutex<ClientStats>>,
    retained: Arc<Mutex<Option<ReceiverState>>>,
) {
    let mut state = ReceiverState::default();
    let reason = loop {
        if shutdown.load(Ordering::Acquire) {
            break None;
        }
        match socket::recv_message(&stream) {
            Ok(RecvOutcome::TimedOut) => continue,
            Ok(RecvOutcome::Closed) => break Some(Disconnect::Closed),
            Ok(RecvOutcome::Message { message, fd }) => {
                if let Err(reason) = state.handle(&stream, message, fd, &mut handler) {
                    break Some(reason);
                }
                let mut snapshot = stats.lock();
                snapshot.mappings = state.active.len();
                snapshot.shared_fds = state.fds.len();
            }
            Err(RecvError::Io(e)) => break Some(Disconnect::Io(e)),
            Err(RecvError::Protocol(e)) => break Some(Disconnect::Protocol(e)),
            // Framing is gone; treat the truncated record as a violation.
            Err(RecvError::Stalled { needed, got }) => {
                break Some(Disconnect::Protocol(ProtocolError::Truncated { needed, got }));
            }
        }
    };
    if let Some(reason) = reason {
        debug!(%reason, "broker connection ended");
        handler.disconnected(reason);
    }
    // Mappings outlive the connection until close() sweeps them.
    *retained.lock() = Some(state);
}

#[cfg(test)]
mod tests {
    use super::*;
    use periscope_testkit::memfd_with;

    struct Quiet;
    impl PortholeHandler for Quiet {}

    fn state_with_fd(id: u32, len: usize) -> ReceiverState {
        let mut state = ReceiverState::default();
        let fd = memfd_with(&vec![0u8; len]);
        state
            .handle(
                &UnixStream::pair().unwrap().0,
                Message::Fd { id },
                Some(fd),
                &mut Quiet,
            )
            .unwrap();
        state
    }

    #[test]
    fn segment_without_a_map_is_a_violation() {
        let (stream, _peer) = UnixStream::pair().unwrap();
        let mut state = state_with_fd(1, 4096);
        let err = state
            .handle(
                &stream,
                Message::Segment {
                    fd_id: 1,
                    size: 4096,
                    addr: 0,
                },
                None,
                &mut Quiet,
            )
            .unwrap_err();
        assert!(matches!(
            err,
            Disconnect::Protocol(ProtocolError::NoAssembly { tag: MSG_SEGMENT })
        ));
    }

    #[test]
    fn finish_without_a_map_is_a_violation() {
        let (stream, _peer) = UnixStream::pair().unwrap();
        let mut state = ReceiverState::default();
        let err = state
            .handle(&stream, Message::Finish { kind: 0, id: 1 }, None, &mut Quiet)
            .unwrap_err();
        assert!(matches!(
            err,
            Disconnect::Protocol(ProtocolError::NoAssembly { tag: MSG_FINISH })
        ));
    }

    #[test]
    fn segment_for_an_unknown_fd_is_a_violation() {
        let (stream, _peer) = UnixStream::pair().unwrap();
        let mut state = ReceiverState::default();
        state.handle(&stream, Message::Map, None, &mut Quiet).unwrap();
        let err = state
            .handle(
                &stream,
                Message::Segment {
                    fd_id: 42,
                    size: 64,
                    addr: 0,
                },
                None,
                &mut Quiet,
            )
            .unwrap_err();
        assert!(matches!(
            err,
            Disconnect::Protocol(ProtocolError::UnknownFd(42))
        ));
    }

    #[test]
    fn inbound_unmap_done_is_a_violation() {
        let (stream, _peer) = UnixStream::pair().unwrap();
        let mut state = ReceiverState::default();
        let err = state
            .handle(&stream, Message::UnmapDone { id: 1 }, None, &mut Quiet)
            .unwrap_err();
        assert!(matches!(
            err,
            Disconnect::Protocol(ProtocolError::UnexpectedMessage(MSG_UNMAP_DONE))
        ));
    }

    #[test]
    fn map_discards_a_half_built_assembly() {
        let (stream, _peer) = UnixStream::pair().unwrap();
        let mut state = state_with_fd(1, 8192);
        state.handle(&stream, Message::Map, None, &mut Quiet).unwrap();
        state
            .handle(
                &stream,
                Message::Segment {
                    fd_id: 1,
                    size: 4096,
                    addr: 0,
                },
                None,
                &mut Quiet,
            )
            .unwrap();
        let shared = state.fds.get(&1).unwrap().clone();
        assert_eq!(shared.ref_count(), 1);

        // A second map abandons the half-built assembly and its segment.
        state.handle(&stream, Message::Map, None, &mut Quiet).unwrap();
        assert_eq!(shared.ref_count(), 0);
        state
            .handle(&stream, Message::Finish { kind: 7, id: 3 }, None, &mut Quiet)
            .unwrap();
        let mapping = state.active.get(&3).unwrap();
        assert_eq!(mapping.segment_count(), 0);
        assert_eq!(mapping.size(), 0);
    }
}
