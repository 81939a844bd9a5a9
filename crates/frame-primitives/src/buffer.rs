//! Monotonic stream buffer: single writer, single reader, one atomic.
//!
//! The writer publishes a frame incrementally by storing an ever-growing
//! write offset; the reader consumes any published prefix while the rest of
//! the frame is still being produced. There is no backpressure channel: the
//! writer resets the offset with [`StreamWriter::prepare`] before each frame
//! and callers rotate between multiple buffers to spread resets out. A reset
//! can still land under a slow reader, so each prepare stamps the buffer
//! with a caller-chosen generation; a reader that re-checks the stamp after
//! copying ([`StreamReader::generation`]) knows whether its bytes belong to
//! the frame it asked for.
//!
//! # Memory Layout
//!
//! ```text
//! +--------------------------------------------------------------+
//! | StreamHeader (64 bytes)                                      |
//! |   write_offset (atomic), capacity, generation + padding      |
//! +--------------------------------------------------------------+
//! | Data (capacity bytes)                                        |
//! +--------------------------------------------------------------+
//! ```

use core::mem::size_of;
use core::time::Duration;

use crate::copy::CopyConfig;
use crate::region::Region;
use crate::sync::{AtomicU32, Ordering, fence, sleep, spin_loop};

/// Stream buffer header (64 bytes, one cache line).
#[repr(C)]
pub struct StreamHeader {
    /// Bytes of the current frame published so far (written by the producer,
    /// read by the consumer).
    pub write_offset: AtomicU32,
    /// Data capacity in bytes (immutable after init).
    pub capacity: u32,
    /// Stamp of the frame occupying the buffer, stored by
    /// [`StreamWriter::prepare`] before the offset reset.
    pub generation: AtomicU32,
    _pad: [u8; 52],
}

#[cfg(not(feature = "loom"))]
const _: () = assert!(core::mem::size_of::<StreamHeader>() == 64);

impl StreamHeader {
    /// Initialize a new stream header.
    pub fn init(&mut self, capacity: u32) {
        assert!(capacity > 0, "capacity must be > 0");
        self.write_offset = AtomicU32::new(0);
        self.capacity = capacity;
        self.generation = AtomicU32::new(0);
        self._pad = [0; 52];
    }
}

/// A byte stream in a shared memory region, published through a single
/// monotonic write offset.
pub struct StreamBuffer {
    region: Region,
    header_offset: usize,
    data_offset: usize,
}

unsafe impl Send for StreamBuffer {}
unsafe impl Sync for StreamBuffer {}

impl StreamBuffer {
    /// Initialize a new stream buffer in the region.
    ///
    /// # Safety
    ///
    /// The region must be writable and exclusively owned during
    /// initialization.
    pub unsafe fn init(region: Region, header_offset: usize, capacity: u32) -> Self {
        assert!(capacity > 0, "capacity must be > 0");
        assert!(
            header_offset.is_multiple_of(64),
            "header_offset must be 64-byte aligned"
        );

        let data_offset = header_offset + size_of::<StreamHeader>();
        let required = data_offset + capacity as usize;
        assert!(required <= region.len(), "region too small for stream");

        let header = unsafe { region.get_mut::<StreamHeader>(header_offset) };
        header.init(capacity);

        Self {
            region,
            header_offset,
            data_offset,
        }
    }

    /// Attach to an existing stream buffer in the region.
    ///
    /// # Safety
    ///
    /// The region must contain an initialized stream header at
    /// `header_offset`.
    pub unsafe fn attach(region: Region, header_offset: usize) -> Result<Self, &'static str> {
        assert!(
            header_offset.is_multiple_of(64),
            "header_offset must be 64-byte aligned"
        );

        let data_offset = header_offset + size_of::<StreamHeader>();
        let header = unsafe { region.get::<StreamHeader>(header_offset) };
        let capacity = header.capacity;

        if capacity == 0 {
            return Err("stream capacity must be > 0");
        }
        let required = data_offset + capacity as usize;
        if required > region.len() {
            return Err("region too small for stream");
        }

        Ok(Self {
            region,
            header_offset,
            data_offset,
        })
    }

    #[inline]
    fn header(&self) -> &StreamHeader {
        unsafe { self.region.get::<StreamHeader>(self.header_offset) }
    }

    /// Data capacity in bytes.
    #[inline]
    pub fn capacity(&self) -> u32 {
        self.header().capacity
    }

    /// Bytes published so far for the current frame.
    #[inline]
    pub fn published(&self) -> u32 {
        self.header().write_offset.load(Ordering::Acquire)
    }

    /// Generation stamp of the frame occupying the buffer.
    ///
    /// A reader that copied bytes for generation `g` and still observes `g`
    /// here afterwards is guaranteed the copy was not overwritten by a later
    /// [`StreamWriter::prepare`]; a different stamp means the bytes may mix
    /// frames and must be discarded.
    #[inline]
    pub fn generation(&self) -> u32 {
        // Order the caller's preceding data reads before this load.
        fence(Ordering::Acquire);
        self.header().generation.load(Ordering::Relaxed)
    }

    #[inline]
    unsafe fn data_ptr(&self, pos: u32) -> *mut u8 {
        self.region.offset(self.data_offset + pos as usize)
    }

    /// Split into writer and reader handles with the default copy config.
    pub fn split(&self) -> (StreamWriter<'_>, StreamReader<'_>) {
        self.split_with_copy(CopyConfig::default())
    }

    /// Split into writer and reader handles.
    pub fn split_with_copy(&self, copy: CopyConfig) -> (StreamWriter<'_>, StreamReader<'_>) {
        let written = self.header().write_offset.load(Ordering::Acquire);
        (
            StreamWriter {
                buffer: self,
                written,
                copy,
            },
            StreamReader {
                buffer: self,
                pos: 0,
                copy,
            },
        )
    }
}

/// Writer handle for a stream buffer.
pub struct StreamWriter<'a> {
    buffer: &'a StreamBuffer,
    written: u32,
    copy: CopyConfig,
}

impl<'a> StreamWriter<'a> {
    /// Reset the stream for a new frame stamped `generation`.
    ///
    /// This is the only operation that moves the write offset backwards and
    /// it is not synchronized with readers. Callers rotate between buffers
    /// to make the race rare, and readers re-check
    /// [`StreamReader::generation`] after copying to catch it when it does
    /// land.
    pub fn prepare(&mut self, generation: u32) {
        self.written = 0;
        let header = self.buffer.header();
        header.generation.store(generation, Ordering::Relaxed);
        // Stamp before reset: a reader that observes any post-reset byte
        // must also observe the new stamp.
        fence(Ordering::Release);
        header.write_offset.store(0, Ordering::Release);
    }

    /// Append `src` to the stream, publishing the write offset after every
    /// copied chunk so a concurrent reader always sees a consistent prefix.
    pub fn write(&mut self, src: &[u8]) -> Result<(), WriteError> {
        let capacity = self.buffer.capacity() as usize;
        let end = self.written as usize + src.len();
        if end > capacity {
            return Err(WriteError::Overflow {
                requested: end,
                capacity,
            });
        }

        let header = self.buffer.header();
        for chunk in src.chunks(self.copy.chunk_len.max(1)) {
            // SAFETY: bounds checked against capacity above; writer is the
            // only side storing to this range.
            unsafe {
                self.copy.copy.copy(
                    self.buffer.data_ptr(self.written),
                    chunk.as_ptr(),
                    chunk.len(),
                );
            }
            let next = self.written + chunk.len() as u32;
            debug_assert!(next >= self.written);
            self.written = next;
            header.write_offset.store(next, Ordering::Release);
        }
        Ok(())
    }

    /// Bytes written since the last [`StreamWriter::prepare`].
    #[inline]
    pub fn written(&self) -> u32 {
        self.written
    }
}

/// Reader handle for a stream buffer.
pub struct StreamReader<'a> {
    buffer: &'a StreamBuffer,
    pos: u32,
    copy: CopyConfig,
}

impl<'a> StreamReader<'a> {
    /// Bytes published so far.
    #[inline]
    pub fn available(&self) -> u32 {
        self.buffer.published()
    }

    /// Current read position.
    #[inline]
    pub fn position(&self) -> u32 {
        self.pos
    }

    /// Generation stamp of the frame occupying the buffer. See
    /// [`StreamBuffer::generation`].
    #[inline]
    pub fn generation(&self) -> u32 {
        self.buffer.generation()
    }

    /// Reset the read position to the start of the stream.
    pub fn rewind(&mut self) {
        self.pos = 0;
    }

    /// Move the read position to `pos`.
    pub fn seek(&mut self, pos: u32) {
        self.pos = pos;
    }

    /// Block until at least `target` bytes are published.
    ///
    /// Spins for `spin_limit` iterations, then sleeps in `sleep_quantum`
    /// steps up to `sleep_limit` rounds. A timeout means the producer
    /// stalled; the stream stays attached and the caller may retry or skip
    /// the frame.
    pub fn wait(&self, target: u32, policy: &WaitPolicy) -> Result<(), WaitTimeout> {
        let header = self.buffer.header();

        if target > self.buffer.capacity() {
            return Err(WaitTimeout {
                needed: target,
                available: header.write_offset.load(Ordering::Acquire),
            });
        }

        let mut available = header.write_offset.load(Ordering::Acquire);
        if available >= target {
            return Ok(());
        }

        for _ in 0..policy.spin_limit {
            spin_loop();
            available = header.write_offset.load(Ordering::Acquire);
            if available >= target {
                return Ok(());
            }
        }

        for _ in 0..policy.sleep_limit {
            sleep(policy.sleep_quantum);
            available = header.write_offset.load(Ordering::Acquire);
            if available >= target {
                return Ok(());
            }
        }

        Err(WaitTimeout {
            needed: target,
            available,
        })
    }

    /// Read exactly `dst.len()` bytes, waiting chunk by chunk as the
    /// producer publishes them. Advances the read position.
    pub fn read(&mut self, dst: &mut [u8], policy: &WaitPolicy) -> Result<(), WaitTimeout> {
        let chunk_len = self.copy.chunk_len.max(1);
        let mut copied = 0usize;
        while copied < dst.len() {
            let n = chunk_len.min(dst.len() - copied);
            let target = self.pos + n as u32;
            self.wait(target, policy)?;
            // SAFETY: wait() observed write_offset >= target, so the bytes
            // at [pos, target) are published and within capacity.
            unsafe {
                self.copy.copy.copy(
                    dst[copied..].as_mut_ptr(),
                    self.buffer.data_ptr(self.pos),
                    n,
                );
            }
            self.pos = target;
            copied += n;
        }
        Ok(())
    }

    /// Read `height` rows of `row_len` bytes each, where source rows are
    /// `src_pitch` bytes apart and destination rows `dst_pitch` bytes apart.
    /// Waits for each row before copying it. Advances the read position over
    /// the full pitched extent, trailing padding included.
    ///
    /// # Panics
    ///
    /// Panics when `row_len` exceeds `src_pitch`, when `row_len` exceeds
    /// `dst_pitch` for a multi-row image, or when `dst` cannot hold the
    /// last row. Callers handing through untrusted geometry must validate
    /// it first.
    pub fn read_image(
        &mut self,
        dst: &mut [u8],
        dst_pitch: usize,
        height: u32,
        row_len: usize,
        src_pitch: usize,
        policy: &WaitPolicy,
    ) -> Result<(), WaitTimeout> {
        if height == 0 {
            return Ok(());
        }
        assert!(row_len <= src_pitch, "row longer than source pitch");
        assert!(row_len <= dst_pitch || height == 1, "row longer than dest pitch");
        let dst_needed = (height as usize - 1) * dst_pitch + row_len;
        assert!(dst_needed <= dst.len(), "destination too small for image");

        let base = self.pos;
        for row in 0..height as usize {
            let src_start = base + (row * src_pitch) as u32;
            self.wait(src_start + row_len as u32, policy)?;
            // SAFETY: the row is published (wait above) and in capacity.
            unsafe {
                self.copy.copy.copy(
                    dst[row * dst_pitch..].as_mut_ptr(),
                    self.buffer.data_ptr(src_start),
                    row_len,
                );
            }
        }
        self.pos = base + (height as usize * src_pitch) as u32;
        Ok(())
    }

    /// Stream `len` bytes through `f` in publish-sized chunks.
    ///
    /// `f` returning `false` stops early; the return value says whether the
    /// full length was delivered. Advances the read position over the bytes
    /// actually delivered.
    pub fn read_with(
        &mut self,
        len: u32,
        policy: &WaitPolicy,
        mut f: impl FnMut(&[u8]) -> bool,
    ) -> Result<bool, WaitTimeout> {
        let chunk_len = self.copy.chunk_len.max(1) as u32;
        let end = self.pos + len;
        while self.pos < end {
            let n = chunk_len.min(end - self.pos);
            let target = self.pos + n;
            self.wait(target, policy)?;
            // SAFETY: published range per wait(); the slice is only alive for
            // the callback and the writer never mutates published bytes
            // before the next prepare().
            let chunk =
                unsafe { core::slice::from_raw_parts(self.buffer.data_ptr(self.pos), n as usize) };
            self.pos = target;
            if !f(chunk) {
                return Ok(false);
            }
        }
        Ok(true)
    }
}

/// How a reader waits for the producer: bounded spin, then bounded sleep.
#[derive(Debug, Clone, Copy)]
pub struct WaitPolicy {
    /// Busy-spin iterations before the first sleep.
    pub spin_limit: u32,
    /// Sleep length per round after spinning.
    pub sleep_quantum: Duration,
    /// Sleep rounds before giving up.
    pub sleep_limit: u32,
}

impl Default for WaitPolicy {
    fn default() -> Self {
        Self {
            spin_limit: 10_000,
            sleep_quantum: Duration::from_millis(1),
            sleep_limit: 2_000,
        }
    }
}

impl WaitPolicy {
    /// A policy that never sleeps and fails fast; for tests and polling loops.
    pub fn immediate() -> Self {
        Self {
            spin_limit: 0,
            sleep_quantum: Duration::ZERO,
            sleep_limit: 0,
        }
    }
}

/// Errors returned by stream writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteError {
    /// The frame would exceed the buffer capacity.
    Overflow { requested: usize, capacity: usize },
}

/// The producer did not publish enough bytes within the wait budget.
///
/// Recoverable: the stream stays attached and the reader may retry or skip
/// the frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitTimeout {
    /// Bytes the reader needed published.
    pub needed: u32,
    /// Bytes that were published when the budget ran out.
    pub available: u32,
}
