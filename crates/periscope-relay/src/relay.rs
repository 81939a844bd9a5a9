//! Frame producer and consumer over a relay region.
//!
//! The producer rotates through the slot ring: each frame resets a slot's
//! stream, writes the 64-byte header block, and only then bumps the shared
//! frame counter. From that point the consumer may attach the slot and
//! stream the payload while it is still being written; the stream buffer
//! publishes after every copied chunk.
//!
//! The ring has no backpressure. A consumer that lags simply skips to the
//! newest frame, and a consumer that stalls mid-frame sees a recoverable
//! starvation error and drops the frame. A producer that wraps the ring
//! while a frame is still being read cannot go unnoticed either: every
//! slot carries its frame's serial as a generation stamp, and readers
//! re-check it after copying, so a reused slot surfaces as a recoverable
//! [`RelayError::Lapped`] instead of another frame's bytes.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use frame_primitives::{CopyConfig, Region, StreamBuffer, StreamReader, StreamWriter};
use frame_primitives::{WaitPolicy, WaitTimeout, WriteError};
use periscope_region::{PeerId, RegionDevice, VectorId};
use tracing::{debug, warn};

use crate::cursor::{CursorHeader, CursorReader, CursorWriter};
use crate::header::{FRAME_HEADER_LEN, FRAME_MAGIC, FRAME_VERSION, HEADER_BLOCK_LEN};
use crate::header::{FrameHeader, FrameKind, HeaderError};
use crate::layout::{LayoutError, RelayHeader, RelayLayout, RelayOffsets};

/// Everything a frame header needs besides the payload itself.
#[derive(Debug, Clone, Copy)]
pub struct FrameMeta {
    /// Pixel encoding of the payload.
    pub kind: FrameKind,
    /// Frame width in pixels.
    pub width: u32,
    /// Frame height in pixels.
    pub height: u32,
    /// Bytes per payload row, padding included.
    pub stride: u32,
    /// Cursor x position at capture time.
    pub cursor_x: i32,
    /// Cursor y position at capture time.
    pub cursor_y: i32,
    /// Payload length in bytes.
    pub payload_len: u32,
}

/// Doorbell to ring when a frame finishes.
pub struct FrameSignal {
    device: Arc<RegionDevice>,
    peer: PeerId,
    vector: VectorId,
}

/// Writes frames into a relay region.
pub struct FrameProducer {
    region: Region,
    offsets: RelayOffsets,
    slot_count: u32,
    slot_capacity: u32,
    cursor_capacity: u32,
    host_peer: PeerId,
    guest_peer: PeerId,
    slots: Vec<StreamBuffer>,
    counter: u32,
    signal: Option<FrameSignal>,
    copy: CopyConfig,
}

impl FrameProducer {
    /// Initialize `region` with `layout` and take the producer role.
    ///
    /// Overwrites whatever the region held before.
    pub fn create(
        region: Region,
        layout: &RelayLayout,
        host_peer: PeerId,
        guest_peer: PeerId,
    ) -> Result<Self, RelayError> {
        let offsets = RelayOffsets::calculate_checked(layout).map_err(LayoutError::InvalidConfig)?;
        if region.len() < offsets.total {
            return Err(RelayError::Layout(LayoutError::RegionTooSmall {
                required: offsets.total,
                found: region.len(),
            }));
        }

        // SAFETY: offsets are in bounds (checked above) and this producer
        // is the only initializer of the region.
        unsafe {
            let header = &mut *region.offset(offsets.header).cast::<RelayHeader>();
            header.init(layout, offsets.cursor as u32);
            header.validate()?;
            (&mut *region.offset(offsets.cursor).cast::<CursorHeader>()).init();
        }

        let slots = (0..layout.slot_count)
            .map(|i| {
                // SAFETY: each slot's header and data range lie within the
                // region per the offset calculation.
                unsafe { StreamBuffer::init(region, offsets.slot(i), layout.slot_capacity) }
            })
            .collect();

        debug!(
            slots = layout.slot_count,
            slot_capacity = layout.slot_capacity,
            total = offsets.total,
            "relay region initialized"
        );

        Ok(Self {
            region,
            offsets,
            slot_count: layout.slot_count,
            slot_capacity: layout.slot_capacity,
            cursor_capacity: layout.cursor_capacity,
            host_peer,
            guest_peer,
            slots,
            counter: 0,
            signal: None,
            copy: CopyConfig::default(),
        })
    }

    /// Ring a doorbell vector at `peer` every time a frame finishes.
    pub fn with_signal(mut self, device: Arc<RegionDevice>, peer: PeerId, vector: VectorId) -> Self {
        self.signal = Some(FrameSignal {
            device,
            peer,
            vector,
        });
        self
    }

    /// Use a non-default copy strategy and chunk size.
    pub fn with_copy(mut self, copy: CopyConfig) -> Self {
        self.copy = copy;
        self
    }

    /// The region geometry this producer writes into.
    pub fn layout(&self) -> RelayLayout {
        RelayLayout {
            slot_count: self.slot_count,
            slot_capacity: self.slot_capacity,
            cursor_capacity: self.cursor_capacity,
        }
    }

    /// Start a new frame: pick the next slot, stream the header block, and
    /// publish the frame counter so consumers can begin streaming.
    pub fn begin_frame(&mut self, meta: &FrameMeta) -> Result<FrameTx<'_>, RelayError> {
        let end = HEADER_BLOCK_LEN as u64 + meta.payload_len as u64;
        if end > self.slot_capacity as u64 {
            return Err(RelayError::Header(HeaderError::PayloadOutOfRange {
                offset: HEADER_BLOCK_LEN as u32,
                len: meta.payload_len,
                capacity: self.slot_capacity,
            }));
        }

        self.counter = self.counter.wrapping_add(1);
        let serial = self.counter;
        let slot = (serial.wrapping_sub(1) % self.slot_count) as usize;

        let (mut writer, _) = self.slots[slot].split_with_copy(self.copy);
        writer.prepare(serial);

        let header = FrameHeader {
            magic: FRAME_MAGIC,
            version: FRAME_VERSION,
            host_peer: self.host_peer.0,
            guest_peer: self.guest_peer.0,
            kind: meta.kind as u32,
            width: meta.width,
            height: meta.height,
            stride: meta.stride,
            cursor_x: meta.cursor_x,
            cursor_y: meta.cursor_y,
            payload_len: meta.payload_len,
            payload_offset: HEADER_BLOCK_LEN as u32,
        };
        let mut block = [0u8; HEADER_BLOCK_LEN];
        block[..FRAME_HEADER_LEN].copy_from_slice(header.as_bytes());
        writer.write(&block)?;

        // Header block is published; announce the frame.
        self.relay_header()
            .frame_counter
            .store(serial, Ordering::Release);

        Ok(FrameTx {
            writer,
            serial,
            declared: meta.payload_len,
            streamed: 0,
            signal: self.signal.as_ref(),
        })
    }

    /// Writer handle for the cursor area. Keep a single one live; the
    /// seqlock assumes one writer.
    pub fn cursor_writer(&self) -> CursorWriter {
        CursorWriter::new(self.region, self.offsets.cursor, self.cursor_capacity)
    }

    fn relay_header(&self) -> &RelayHeader {
        // SAFETY: the header was initialized in create() and stays in
        // bounds for the region's lifetime.
        unsafe { self.region.get::<RelayHeader>(self.offsets.header) }
    }
}

/// An in-flight frame transmission.
///
/// Dropping it without [`FrameTx::finish`] abandons the frame; consumers
/// stuck waiting for the payload time out and skip it.
pub struct FrameTx<'a> {
    writer: StreamWriter<'a>,
    serial: u32,
    declared: u32,
    streamed: u32,
    signal: Option<&'a FrameSignal>,
}

impl FrameTx<'_> {
    /// Serial number of this frame.
    pub fn serial(&self) -> u32 {
        self.serial
    }

    /// Append payload bytes. Published chunk by chunk; a concurrent
    /// consumer may already be streaming them.
    pub fn write(&mut self, bytes: &[u8]) -> Result<(), RelayError> {
        let streamed = self.streamed as u64 + bytes.len() as u64;
        if streamed > self.declared as u64 {
            return Err(RelayError::PayloadMismatch {
                streamed: streamed.min(u32::MAX as u64) as u32,
                declared: self.declared,
            });
        }
        self.writer.write(bytes)?;
        self.streamed = streamed as u32;
        Ok(())
    }

    /// Finish the frame: verify the streamed length matches the header and
    /// ring the completion doorbell if one is configured.
    pub fn finish(self) -> Result<(), RelayError> {
        if self.streamed != self.declared {
            return Err(RelayError::PayloadMismatch {
                streamed: self.streamed,
                declared: self.declared,
            });
        }
        if let Some(signal) = self.signal {
            // Fire-and-forget: a failed ring must not fail the frame.
            if let Err(e) = signal.device.ring_doorbell(signal.peer, signal.vector) {
                warn!(peer = %signal.peer, vector = %signal.vector, "frame doorbell failed: {e}");
            }
        }
        Ok(())
    }
}

/// Reads frames out of a relay region.
pub struct FrameConsumer {
    region: Region,
    offsets: RelayOffsets,
    slot_count: u32,
    slot_capacity: u32,
    cursor_capacity: u32,
    slots: Vec<StreamBuffer>,
    last_seen: u32,
    copy: CopyConfig,
}

impl FrameConsumer {
    /// Attach to an initialized relay region, discovering its geometry
    /// from the validated header. Frames published before the attach are
    /// not replayed.
    pub fn attach(region: Region) -> Result<Self, RelayError> {
        if region.len() < core::mem::size_of::<RelayHeader>() {
            return Err(RelayError::Layout(LayoutError::RegionTooSmall {
                required: core::mem::size_of::<RelayHeader>(),
                found: region.len(),
            }));
        }
        // SAFETY: the header range is in bounds (checked above); validation
        // gates every use of its fields.
        let header = unsafe { region.get::<RelayHeader>(0) };
        header.validate()?;

        let layout = header.layout();
        let offsets = RelayOffsets::calculate_checked(&layout).map_err(LayoutError::InvalidConfig)?;
        if offsets.cursor != header.cursor_offset as usize {
            return Err(RelayError::Layout(LayoutError::InvalidConfig(
                "cursor offset does not match the layout",
            )));
        }
        if region.len() < offsets.total {
            return Err(RelayError::Layout(LayoutError::RegionTooSmall {
                required: offsets.total,
                found: region.len(),
            }));
        }

        let slots = (0..layout.slot_count)
            .map(|i| {
                // SAFETY: slot offsets are in bounds per the checks above.
                unsafe { StreamBuffer::attach(region, offsets.slot(i)) }
                    .map_err(RelayError::Attach)
            })
            .collect::<Result<Vec<_>, _>>()?;

        let last_seen = header.frame_counter.load(Ordering::Acquire);
        debug!(slots = layout.slot_count, last_seen, "relay consumer attached");

        Ok(Self {
            region,
            offsets,
            slot_count: layout.slot_count,
            slot_capacity: layout.slot_capacity,
            cursor_capacity: layout.cursor_capacity,
            slots,
            last_seen,
            copy: CopyConfig::default(),
        })
    }

    /// Use a non-default copy strategy and chunk size.
    pub fn with_copy(mut self, copy: CopyConfig) -> Self {
        self.copy = copy;
        self
    }

    /// The region geometry discovered at attach.
    pub fn layout(&self) -> RelayLayout {
        RelayLayout {
            slot_count: self.slot_count,
            slot_capacity: self.slot_capacity,
            cursor_capacity: self.cursor_capacity,
        }
    }

    /// Wait for a frame newer than the last one seen and start streaming
    /// it. Always lands on the newest published frame, skipping any the
    /// consumer fell behind on.
    pub fn next_frame(&mut self, policy: &WaitPolicy) -> Result<FrameRx<'_>, RelayError> {
        let serial = wait_for_frame(&self.relay_header().frame_counter, self.last_seen, policy)
            .ok_or(RelayError::NoNewFrame)?;
        self.last_seen = serial;

        let slot = (serial.wrapping_sub(1) % self.slot_count) as usize;
        let (_, mut reader) = self.slots[slot].split_with_copy(self.copy);

        let mut block = [0u8; HEADER_BLOCK_LEN];
        reader.read(&mut block, policy)?;
        let generation = reader.generation();
        if generation != serial {
            // The producer wrapped the ring between the counter load and
            // the header copy; the block may mix two frames.
            return Err(RelayError::Lapped {
                serial,
                overwritten_by: generation,
            });
        }
        let header = FrameHeader::from_bytes(&block[..FRAME_HEADER_LEN])?;
        let kind = header.validate(self.slot_capacity)?;
        reader.seek(header.payload_offset);

        Ok(FrameRx {
            header,
            kind,
            serial,
            reader,
            remaining: header.payload_len,
        })
    }

    /// Reader handle for the cursor area.
    pub fn cursor_reader(&self) -> CursorReader {
        CursorReader::new(self.region, self.offsets.cursor, self.cursor_capacity)
    }

    fn relay_header(&self) -> &RelayHeader {
        // SAFETY: validated at attach; in bounds for the region's lifetime.
        unsafe { self.region.get::<RelayHeader>(self.offsets.header) }
    }
}

/// A frame being streamed out of a slot.
///
/// Dropping it skips the rest of the frame. After a starvation or lap
/// error the stream position is indeterminate; drop the frame and take
/// the next.
pub struct FrameRx<'a> {
    header: FrameHeader,
    kind: FrameKind,
    serial: u32,
    reader: StreamReader<'a>,
    remaining: u32,
}

impl FrameRx<'_> {
    /// The validated frame header.
    pub fn header(&self) -> &FrameHeader {
        &self.header
    }

    /// Decoded pixel encoding.
    pub fn kind(&self) -> FrameKind {
        self.kind
    }

    /// Serial number of this frame.
    pub fn serial(&self) -> u32 {
        self.serial
    }

    /// Payload bytes not yet read.
    pub fn remaining(&self) -> u32 {
        self.remaining
    }

    /// After copying, confirm the slot still holds this frame. A changed
    /// stamp means the producer wrapped the ring and the copied bytes may
    /// mix frames.
    fn still_current(&self) -> Result<(), RelayError> {
        let generation = self.reader.generation();
        if generation == self.serial {
            Ok(())
        } else {
            Err(RelayError::Lapped {
                serial: self.serial,
                overwritten_by: generation,
            })
        }
    }

    /// Read exactly `dst.len()` payload bytes, waiting for the producer
    /// chunk by chunk.
    pub fn read(&mut self, dst: &mut [u8], policy: &WaitPolicy) -> Result<(), RelayError> {
        if dst.len() as u64 > self.remaining as u64 {
            return Err(RelayError::PayloadExhausted {
                requested: dst.len(),
                remaining: self.remaining,
            });
        }
        self.reader.read(dst, policy)?;
        self.still_current()?;
        self.remaining -= dst.len() as u32;
        Ok(())
    }

    /// Copy the frame image into `dst` row by row, converting from the
    /// source stride to `dst_pitch`. Rows are waited for individually, so
    /// consumption overlaps production.
    pub fn read_image(
        &mut self,
        dst: &mut [u8],
        dst_pitch: usize,
        policy: &WaitPolicy,
    ) -> Result<(), RelayError> {
        let bpp = self
            .kind
            .bytes_per_pixel()
            .ok_or(RelayError::Planar(self.kind))?;
        let row_len = self.header.width as usize * bpp as usize;
        let src_pitch = self.header.stride as usize;
        if row_len > src_pitch {
            return Err(RelayError::Geometry { row_len, src_pitch });
        }
        let height = self.header.height as usize;
        if height > 1 && row_len > dst_pitch {
            return Err(RelayError::DestinationPitch { row_len, dst_pitch });
        }
        if height > 0 {
            let needed = (height - 1) * dst_pitch + row_len;
            if needed > dst.len() {
                return Err(RelayError::DestinationTooSmall {
                    needed,
                    got: dst.len(),
                });
            }
        }
        let extent = self.header.height as u64 * src_pitch as u64;
        if extent > self.remaining as u64 {
            return Err(RelayError::PayloadExhausted {
                requested: extent as usize,
                remaining: self.remaining,
            });
        }
        self.reader.read_image(
            dst,
            dst_pitch,
            self.header.height,
            row_len,
            src_pitch,
            policy,
        )?;
        self.still_current()?;
        self.remaining -= extent as u32;
        Ok(())
    }

    /// Stream `len` payload bytes through `f` in publish-sized chunks
    /// without copying them out of the region. `f` returning `false` stops
    /// early; the return value says whether the full length was delivered.
    ///
    /// On [`RelayError::Lapped`] the chunks already handed to `f` may mix
    /// frames; discard whatever `f` accumulated along with the frame.
    pub fn read_with(
        &mut self,
        len: u32,
        policy: &WaitPolicy,
        f: impl FnMut(&[u8]) -> bool,
    ) -> Result<bool, RelayError> {
        if len > self.remaining {
            return Err(RelayError::PayloadExhausted {
                requested: len as usize,
                remaining: self.remaining,
            });
        }
        let start = self.reader.position();
        let done = self.reader.read_with(len, policy, f)?;
        self.still_current()?;
        self.remaining -= self.reader.position() - start;
        Ok(done)
    }
}

/// Wait for the frame counter to move past `last_seen`.
fn wait_for_frame(counter: &AtomicU32, last_seen: u32, policy: &WaitPolicy) -> Option<u32> {
    let mut current = counter.load(Ordering::Acquire);
    if current != last_seen {
        return Some(current);
    }
    for _ in 0..policy.spin_limit {
        core::hint::spin_loop();
        current = counter.load(Ordering::Acquire);
        if current != last_seen {
            return Some(current);
        }
    }
    for _ in 0..policy.sleep_limit {
        std::thread::sleep(policy.sleep_quantum);
        current = counter.load(Ordering::Acquire);
        if current != last_seen {
            return Some(current);
        }
    }
    None
}

/// Errors from relay operations.
#[derive(Debug)]
pub enum RelayError {
    /// The region layout is unusable.
    Layout(LayoutError),
    /// The frame header failed validation.
    Header(HeaderError),
    /// A slot's stream buffer could not be attached.
    Attach(&'static str),
    /// A payload write overflowed the slot.
    Write(WriteError),
    /// No frame newer than the last seen one arrived within the wait
    /// budget. Recoverable; retry at will.
    NoNewFrame,
    /// The producer stalled mid-frame. Recoverable; skip the frame.
    Starved(WaitTimeout),
    /// The producer reused the slot while this frame was being read; the
    /// copied bytes may mix frames. Recoverable; skip to the next frame.
    Lapped { serial: u32, overwritten_by: u32 },
    /// The streamed payload length does not match the header.
    PayloadMismatch { streamed: u32, declared: u32 },
    /// A read asked for more payload than the frame has left.
    PayloadExhausted { requested: usize, remaining: u32 },
    /// Rows do not fit the declared stride.
    Geometry { row_len: usize, src_pitch: usize },
    /// Destination rows are closer together than a row is long.
    DestinationPitch { row_len: usize, dst_pitch: usize },
    /// The destination buffer cannot hold the last image row.
    DestinationTooSmall { needed: usize, got: usize },
    /// Row-wise reads are not defined for planar frame kinds.
    Planar(FrameKind),
}

impl std::fmt::Display for RelayError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Layout(e) => write!(f, "relay layout: {}", e),
            Self::Header(e) => write!(f, "frame header: {}", e),
            Self::Attach(msg) => write!(f, "slot attach failed: {}", msg),
            Self::Write(WriteError::Overflow {
                requested,
                capacity,
            }) => {
                write!(f, "slot overflow: {} bytes into capacity {}", requested, capacity)
            }
            Self::NoNewFrame => write!(f, "no new frame within the wait budget"),
            Self::Starved(t) => write!(
                f,
                "starved mid-frame: needed {} bytes, {} published",
                t.needed, t.available
            ),
            Self::Lapped {
                serial,
                overwritten_by,
            } => {
                write!(
                    f,
                    "frame {} was overwritten by frame {} mid-read",
                    serial, overwritten_by
                )
            }
            Self::PayloadMismatch { streamed, declared } => {
                write!(
                    f,
                    "payload length mismatch: streamed {} bytes, header declared {}",
                    streamed, declared
                )
            }
            Self::PayloadExhausted {
                requested,
                remaining,
            } => {
                write!(
                    f,
                    "read past payload end: asked for {} bytes, {} remain",
                    requested, remaining
                )
            }
            Self::Geometry { row_len, src_pitch } => {
                write!(
                    f,
                    "unusable geometry: row of {} bytes exceeds stride {}",
                    row_len, src_pitch
                )
            }
            Self::DestinationPitch { row_len, dst_pitch } => {
                write!(
                    f,
                    "destination pitch {} cannot hold rows of {} bytes",
                    dst_pitch, row_len
                )
            }
            Self::DestinationTooSmall { needed, got } => {
                write!(
                    f,
                    "destination too small for the image: need {} bytes, got {}",
                    needed, got
                )
            }
            Self::Planar(kind) => {
                write!(f, "frame kind {:?} is planar; stream it with read()", kind)
            }
        }
    }
}

impl std::error::Error for RelayError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Layout(e) => Some(e),
            Self::Header(e) => Some(e),
            _ => None,
        }
    }
}

impl From<LayoutError> for RelayError {
    fn from(e: LayoutError) -> Self {
        Self::Layout(e)
    }
}

impl From<HeaderError> for RelayError {
    fn from(e: HeaderError) -> Self {
        Self::Header(e)
    }
}

impl From<WaitTimeout> for RelayError {
    fn from(e: WaitTimeout) -> Self {
        Self::Starved(e)
    }
}

impl From<WriteError> for RelayError {
    fn from(e: WriteError) -> Self {
        Self::Write(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cursor::{CursorFlags, CursorUpdate};
    use frame_primitives::{ByteCopy, HeapRegion};
    use periscope_testkit::pattern_vec;

    fn small_layout() -> RelayLayout {
        RelayLayout {
            slot_count: 2,
            slot_capacity: 4096,
            cursor_capacity: 256,
        }
    }

    fn fresh_region(layout: &RelayLayout) -> HeapRegion {
        let offsets = RelayOffsets::calculate_checked(layout).unwrap();
        HeapRegion::new_zeroed(offsets.total)
    }

    fn meta(payload_len: u32) -> FrameMeta {
        FrameMeta {
            kind: FrameKind::Argb,
            width: payload_len / 4,
            height: 1,
            stride: payload_len,
            cursor_x: 0,
            cursor_y: 0,
            payload_len,
        }
    }

    #[test]
    fn create_then_attach_discovers_geometry() {
        let layout = small_layout();
        let owner = fresh_region(&layout);
        let producer =
            FrameProducer::create(owner.region(), &layout, PeerId(0), PeerId(1)).unwrap();
        let consumer = FrameConsumer::attach(owner.region()).unwrap();
        assert_eq!(producer.layout(), layout);
        assert_eq!(consumer.layout(), layout);
    }

    #[test]
    fn region_must_fit_the_layout() {
        let owner = HeapRegion::new_zeroed(256);
        assert!(matches!(
            FrameProducer::create(owner.region(), &small_layout(), PeerId(0), PeerId(1)),
            Err(RelayError::Layout(LayoutError::RegionTooSmall { .. }))
        ));
    }

    #[test]
    fn attach_rejects_uninitialized_region() {
        let owner = fresh_region(&small_layout());
        assert!(matches!(
            FrameConsumer::attach(owner.region()),
            Err(RelayError::Layout(LayoutError::InvalidMagic))
        ));
    }

    #[test]
    fn single_frame_roundtrip() {
        let layout = small_layout();
        let owner = fresh_region(&layout);
        let mut producer =
            FrameProducer::create(owner.region(), &layout, PeerId(0), PeerId(1)).unwrap();
        let mut consumer = FrameConsumer::attach(owner.region()).unwrap();

        let payload = pattern_vec(1024, 7);
        let mut tx = producer.begin_frame(&meta(1024)).unwrap();
        tx.write(&payload).unwrap();
        tx.finish().unwrap();

        let policy = WaitPolicy::immediate();
        let mut rx = consumer.next_frame(&policy).unwrap();
        assert_eq!(rx.serial(), 1);
        assert_eq!(rx.kind(), FrameKind::Argb);
        assert_eq!(rx.header().payload_len, 1024);
        assert_eq!(rx.header().host_peer, 0);
        assert_eq!(rx.header().guest_peer, 1);

        let mut out = vec![0u8; 1024];
        rx.read(&mut out, &policy).unwrap();
        assert_eq!(out, payload);
        assert_eq!(rx.remaining(), 0);
    }

    #[test]
    fn consumer_streams_while_frame_is_still_being_written() {
        let layout = small_layout();
        let owner = fresh_region(&layout);
        let mut producer =
            FrameProducer::create(owner.region(), &layout, PeerId(0), PeerId(1)).unwrap();
        let mut consumer = FrameConsumer::attach(owner.region()).unwrap();

        let payload = pattern_vec(800, 3);
        let mut tx = producer.begin_frame(&meta(800)).unwrap();
        tx.write(&payload[..300]).unwrap();

        // The frame is announced and its first bytes are readable before
        // the producer finishes.
        let policy = WaitPolicy::immediate();
        let mut rx = consumer.next_frame(&policy).unwrap();
        let mut head = vec![0u8; 300];
        rx.read(&mut head, &policy).unwrap();
        assert_eq!(head, &payload[..300]);

        tx.write(&payload[300..]).unwrap();
        tx.finish().unwrap();

        let mut tail = vec![0u8; 500];
        rx.read(&mut tail, &policy).unwrap();
        assert_eq!(tail, &payload[300..]);
    }

    #[test]
    fn lagging_consumer_skips_to_newest_frame() {
        let layout = small_layout();
        let owner = fresh_region(&layout);
        let mut producer =
            FrameProducer::create(owner.region(), &layout, PeerId(0), PeerId(1)).unwrap();
        let mut consumer = FrameConsumer::attach(owner.region()).unwrap();

        for seed in 1..=3u8 {
            let payload = pattern_vec(256, seed);
            let mut tx = producer.begin_frame(&meta(256)).unwrap();
            tx.write(&payload).unwrap();
            tx.finish().unwrap();
        }

        let policy = WaitPolicy::immediate();
        let mut rx = consumer.next_frame(&policy).unwrap();
        assert_eq!(rx.serial(), 3);
        let mut out = vec![0u8; 256];
        rx.read(&mut out, &policy).unwrap();
        assert_eq!(out, pattern_vec(256, 3));
    }

    #[test]
    fn frames_published_before_attach_are_not_replayed() {
        let layout = small_layout();
        let owner = fresh_region(&layout);
        let mut producer =
            FrameProducer::create(owner.region(), &layout, PeerId(0), PeerId(1)).unwrap();

        let mut tx = producer.begin_frame(&meta(64)).unwrap();
        tx.write(&[0u8; 64]).unwrap();
        tx.finish().unwrap();

        let mut consumer = FrameConsumer::attach(owner.region()).unwrap();
        assert!(matches!(
            consumer.next_frame(&WaitPolicy::immediate()),
            Err(RelayError::NoNewFrame)
        ));
    }

    #[test]
    fn oversized_payload_is_rejected_at_begin() {
        let layout = small_layout();
        let owner = fresh_region(&layout);
        let mut producer =
            FrameProducer::create(owner.region(), &layout, PeerId(0), PeerId(1)).unwrap();
        assert!(matches!(
            producer.begin_frame(&meta(layout.slot_capacity)),
            Err(RelayError::Header(HeaderError::PayloadOutOfRange { .. }))
        ));
    }

    #[test]
    fn short_payload_fails_finish() {
        let layout = small_layout();
        let owner = fresh_region(&layout);
        let mut producer =
            FrameProducer::create(owner.region(), &layout, PeerId(0), PeerId(1)).unwrap();

        let mut tx = producer.begin_frame(&meta(100)).unwrap();
        tx.write(&[0u8; 40]).unwrap();
        assert!(matches!(
            tx.finish(),
            Err(RelayError::PayloadMismatch {
                streamed: 40,
                declared: 100,
            })
        ));
    }

    #[test]
    fn overlong_payload_fails_at_write() {
        let layout = small_layout();
        let owner = fresh_region(&layout);
        let mut producer =
            FrameProducer::create(owner.region(), &layout, PeerId(0), PeerId(1)).unwrap();

        let mut tx = producer.begin_frame(&meta(10)).unwrap();
        assert!(matches!(
            tx.write(&[0u8; 20]),
            Err(RelayError::PayloadMismatch { .. })
        ));
    }

    #[test]
    fn reader_recovers_after_producer_stall() {
        let layout = small_layout();
        let owner = fresh_region(&layout);
        let mut producer =
            FrameProducer::create(owner.region(), &layout, PeerId(0), PeerId(1)).unwrap();
        let mut consumer = FrameConsumer::attach(owner.region()).unwrap();

        // Frame 1 is announced but its payload never arrives.
        let tx = producer.begin_frame(&meta(200)).unwrap();
        drop(tx);

        let policy = WaitPolicy::immediate();
        let mut rx = consumer.next_frame(&policy).unwrap();
        let mut out = vec![0u8; 200];
        assert!(matches!(
            rx.read(&mut out, &policy),
            Err(RelayError::Starved(_))
        ));
        drop(rx);

        // The next frame streams normally.
        let payload = pattern_vec(200, 9);
        let mut tx = producer.begin_frame(&meta(200)).unwrap();
        tx.write(&payload).unwrap();
        tx.finish().unwrap();

        let mut rx = consumer.next_frame(&policy).unwrap();
        rx.read(&mut out, &policy).unwrap();
        assert_eq!(out, payload);
    }

    #[test]
    fn lapped_reader_gets_an_error_not_the_new_frames_bytes() {
        let layout = small_layout();
        let owner = fresh_region(&layout);
        let mut producer =
            FrameProducer::create(owner.region(), &layout, PeerId(0), PeerId(1)).unwrap();
        let mut consumer = FrameConsumer::attach(owner.region()).unwrap();

        let first = pattern_vec(512, 1);
        let mut tx = producer.begin_frame(&meta(512)).unwrap();
        tx.write(&first).unwrap();
        tx.finish().unwrap();

        let policy = WaitPolicy::immediate();
        let mut rx = consumer.next_frame(&policy).unwrap();
        let mut head = vec![0u8; 256];
        rx.read(&mut head, &policy).unwrap();
        assert_eq!(head, &first[..256]);

        // Two more frames wrap the two-slot ring, so frame 3 reuses the
        // slot rx is still reading from.
        for seed in 2..=3u8 {
            let payload = pattern_vec(512, seed);
            let mut tx = producer.begin_frame(&meta(512)).unwrap();
            tx.write(&payload).unwrap();
            tx.finish().unwrap();
        }

        let mut tail = vec![0u8; 256];
        match rx.read(&mut tail, &policy) {
            Err(RelayError::Lapped {
                serial: 1,
                overwritten_by: 3,
            }) => {}
            other => panic!("expected lap detection, got {other:?}"),
        }
        drop(rx);

        // Catching up lands on the overwriting frame, intact.
        let mut rx = consumer.next_frame(&policy).unwrap();
        assert_eq!(rx.serial(), 3);
        let mut out = vec![0u8; 512];
        rx.read(&mut out, &policy).unwrap();
        assert_eq!(out, pattern_vec(512, 3));
    }

    #[test]
    fn read_image_converts_stride() {
        let layout = small_layout();
        let owner = fresh_region(&layout);
        let mut producer =
            FrameProducer::create(owner.region(), &layout, PeerId(0), PeerId(1)).unwrap();
        let mut consumer = FrameConsumer::attach(owner.region()).unwrap();

        // 4 rows of 3 ARGB pixels with 16 padding bytes per row.
        let width = 3u32;
        let height = 4u32;
        let stride = width * 4 + 16;
        let meta = FrameMeta {
            kind: FrameKind::Argb,
            width,
            height,
            stride,
            cursor_x: 0,
            cursor_y: 0,
            payload_len: height * stride,
        };
        let payload = pattern_vec((height * stride) as usize, 5);
        let mut tx = producer.begin_frame(&meta).unwrap();
        tx.write(&payload).unwrap();
        tx.finish().unwrap();

        let policy = WaitPolicy::immediate();
        let mut rx = consumer.next_frame(&policy).unwrap();
        let row_len = (width * 4) as usize;
        let mut out = vec![0u8; row_len * height as usize];
        rx.read_image(&mut out, row_len, &policy).unwrap();

        for row in 0..height as usize {
            assert_eq!(
                &out[row * row_len..(row + 1) * row_len],
                &payload[row * stride as usize..row * stride as usize + row_len],
                "row {row}"
            );
        }
    }

    #[test]
    fn read_image_rejects_planar_kinds() {
        let layout = small_layout();
        let owner = fresh_region(&layout);
        let mut producer =
            FrameProducer::create(owner.region(), &layout, PeerId(0), PeerId(1)).unwrap();
        let mut consumer = FrameConsumer::attach(owner.region()).unwrap();

        let meta = FrameMeta {
            kind: FrameKind::Yuv420,
            width: 16,
            height: 16,
            stride: 16,
            cursor_x: 0,
            cursor_y: 0,
            payload_len: 384,
        };
        let mut tx = producer.begin_frame(&meta).unwrap();
        tx.write(&[0u8; 384]).unwrap();
        tx.finish().unwrap();

        let policy = WaitPolicy::immediate();
        let mut rx = consumer.next_frame(&policy).unwrap();
        let mut out = vec![0u8; 1024];
        assert!(matches!(
            rx.read_image(&mut out, 64, &policy),
            Err(RelayError::Planar(FrameKind::Yuv420))
        ));

        // The payload is still streamable as raw bytes.
        let mut raw = vec![0u8; 384];
        rx.read(&mut raw, &policy).unwrap();
    }

    #[test]
    fn read_image_rejects_a_small_destination() {
        let layout = small_layout();
        let owner = fresh_region(&layout);
        let mut producer =
            FrameProducer::create(owner.region(), &layout, PeerId(0), PeerId(1)).unwrap();
        let mut consumer = FrameConsumer::attach(owner.region()).unwrap();

        // 4 rows of 8 ARGB pixels, tightly packed.
        let meta = FrameMeta {
            kind: FrameKind::Argb,
            width: 8,
            height: 4,
            stride: 32,
            cursor_x: 0,
            cursor_y: 0,
            payload_len: 128,
        };
        let mut tx = producer.begin_frame(&meta).unwrap();
        tx.write(&[7u8; 128]).unwrap();
        tx.finish().unwrap();

        let policy = WaitPolicy::immediate();
        let mut rx = consumer.next_frame(&policy).unwrap();

        // A destination pitch shorter than a row would overlap rows.
        let mut out = vec![0u8; 128];
        assert!(matches!(
            rx.read_image(&mut out, 16, &policy),
            Err(RelayError::DestinationPitch {
                row_len: 32,
                dst_pitch: 16,
            })
        ));

        // A buffer that cannot hold the last row is refused up front.
        let mut short = vec![0u8; 100];
        assert!(matches!(
            rx.read_image(&mut short, 32, &policy),
            Err(RelayError::DestinationTooSmall {
                needed: 128,
                got: 100,
            })
        ));

        // Failed validation consumes nothing; the frame still reads whole.
        rx.read_image(&mut out, 32, &policy).unwrap();
        assert_eq!(out, [7u8; 128]);
    }

    #[test]
    fn read_with_stops_early_and_tracks_remaining() {
        let layout = small_layout();
        let owner = fresh_region(&layout);
        let mut producer =
            FrameProducer::create(owner.region(), &layout, PeerId(0), PeerId(1)).unwrap();
        let mut consumer = FrameConsumer::attach(owner.region()).unwrap();

        let payload = pattern_vec(512, 2);
        let mut tx = producer.begin_frame(&meta(512)).unwrap();
        tx.write(&payload).unwrap();
        tx.finish().unwrap();

        // Small chunks so the early stop lands mid-payload.
        consumer = consumer.with_copy(CopyConfig {
            chunk_len: 64,
            copy: &ByteCopy,
        });

        let policy = WaitPolicy::immediate();
        let mut rx = consumer.next_frame(&policy).unwrap();
        let mut seen = Vec::new();
        let done = rx
            .read_with(512, &policy, |chunk| {
                seen.extend_from_slice(chunk);
                seen.len() < 128
            })
            .unwrap();
        assert!(!done);
        assert_eq!(seen.len(), 128);
        assert_eq!(rx.remaining(), 384);
        assert_eq!(&payload[..128], &seen[..]);
    }

    #[test]
    fn read_past_payload_end_is_rejected() {
        let layout = small_layout();
        let owner = fresh_region(&layout);
        let mut producer =
            FrameProducer::create(owner.region(), &layout, PeerId(0), PeerId(1)).unwrap();
        let mut consumer = FrameConsumer::attach(owner.region()).unwrap();

        let mut tx = producer.begin_frame(&meta(64)).unwrap();
        tx.write(&[1u8; 64]).unwrap();
        tx.finish().unwrap();

        let policy = WaitPolicy::immediate();
        let mut rx = consumer.next_frame(&policy).unwrap();
        let mut out = vec![0u8; 65];
        assert!(matches!(
            rx.read(&mut out, &policy),
            Err(RelayError::PayloadExhausted {
                requested: 65,
                remaining: 64,
            })
        ));
    }

    #[test]
    fn cursor_channel_flows_through_the_relay() {
        let layout = small_layout();
        let owner = fresh_region(&layout);
        let producer =
            FrameProducer::create(owner.region(), &layout, PeerId(0), PeerId(1)).unwrap();
        let consumer = FrameConsumer::attach(owner.region()).unwrap();

        let mut writer = producer.cursor_writer();
        let reader = consumer.cursor_reader();
        assert!(reader.read().is_none());

        let update = CursorUpdate {
            flags: CursorFlags::VISIBLE | CursorFlags::POSITION,
            x: 33,
            y: 44,
            shape: None,
        };
        assert!(writer.update(&update));
        assert_eq!(reader.read(), Some(update));
    }
}
