//! Cursor side channel.
//!
//! Cursor moves arrive far more often than frames and must not wait behind
//! them, so they travel through a fixed scratch area guarded by a seqlock:
//! the writer bumps the sequence odd, writes, bumps it even; readers retry
//! while the sequence is odd or changed under them. A reader never blocks a
//! writer and a torn read is always detected and retried.

use std::sync::atomic::{AtomicU32, Ordering, fence};

use frame_primitives::Region;
use tracing::warn;

use crate::header::FrameKind;

/// Size of [`CursorHeader`]; shape scratch starts right after it.
pub const CURSOR_HEADER_LEN: usize = 64;

/// Seqlock retries before a reader gives up on an unstable area.
const SEQ_RETRY_LIMIT: u32 = 10_000;

bitflags::bitflags! {
    /// What a cursor update carries.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct CursorFlags: u32 {
        /// The cursor is visible.
        const VISIBLE = 1 << 0;
        /// The x/y fields hold a new position.
        const POSITION = 1 << 1;
        /// The scratch area holds new shape pixels.
        const SHAPE = 1 << 2;
    }
}

/// Cursor area header (64 bytes). Fields other than `seq` are only read
/// under the seqlock protocol.
#[repr(C, align(64))]
pub struct CursorHeader {
    /// Seqlock word. Zero means nothing was published yet; odd means a
    /// write is in progress.
    pub seq: AtomicU32,
    /// Active [`CursorFlags`] bits.
    pub flags: u32,
    /// Cursor x position.
    pub x: i32,
    /// Cursor y position.
    pub y: i32,
    /// Shape width in pixels.
    pub width: u32,
    /// Shape height in pixels.
    pub height: u32,
    /// Shape bytes per row.
    pub pitch: u32,
    /// Shape pixel encoding ([`FrameKind`] as u32).
    pub kind: u32,
    /// Shape bytes in the scratch area.
    pub data_len: u32,
    /// Padding to 64 bytes.
    pub _pad: [u8; 28],
}

const _: () = assert!(core::mem::size_of::<CursorHeader>() == CURSOR_HEADER_LEN);

impl CursorHeader {
    /// Zero a fresh cursor area header.
    pub fn init(&mut self) {
        self.seq = AtomicU32::new(0);
        self.flags = 0;
        self.x = 0;
        self.y = 0;
        self.width = 0;
        self.height = 0;
        self.pitch = 0;
        self.kind = 0;
        self.data_len = 0;
        self._pad = [0; 28];
    }
}

/// A cursor shape: pixel data plus its geometry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CursorShape {
    /// Pixel encoding of the shape data.
    pub kind: FrameKind,
    /// Shape width in pixels.
    pub width: u32,
    /// Shape height in pixels.
    pub height: u32,
    /// Shape bytes per row.
    pub pitch: u32,
    /// Shape pixel bytes.
    pub data: Vec<u8>,
}

/// One cursor update, as published or observed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CursorUpdate {
    /// What this update carries.
    pub flags: CursorFlags,
    /// Cursor x position.
    pub x: i32,
    /// Cursor y position.
    pub y: i32,
    /// New shape, when [`CursorFlags::SHAPE`] is set.
    pub shape: Option<CursorShape>,
}

/// Writer handle for the cursor area. One per relay region.
pub struct CursorWriter {
    region: Region,
    offset: usize,
    capacity: u32,
}

impl CursorWriter {
    pub(crate) fn new(region: Region, offset: usize, capacity: u32) -> Self {
        Self {
            region,
            offset,
            capacity,
        }
    }

    /// Publish a cursor update.
    ///
    /// A shape larger than the scratch area cannot be represented; the
    /// whole update is logged and dropped (returns `false`) so the frame
    /// stream keeps flowing.
    pub fn update(&mut self, update: &CursorUpdate) -> bool {
        let scratch = self.capacity as usize - CURSOR_HEADER_LEN;
        let shape = match &update.shape {
            Some(shape) if update.flags.contains(CursorFlags::SHAPE) => {
                if shape.data.len() > scratch {
                    warn!(
                        len = shape.data.len(),
                        scratch, "cursor shape exceeds scratch area, update dropped"
                    );
                    return false;
                }
                Some(shape)
            }
            _ => None,
        };

        // Never publish the shape bit without shape bytes to back it.
        let flags = if shape.is_some() {
            update.flags
        } else {
            update.flags - CursorFlags::SHAPE
        };

        // SAFETY: this writer is the only mutator of the cursor area;
        // readers copy under the seqlock and retry on tearing.
        let header = unsafe { &mut *self.region.offset(self.offset).cast::<CursorHeader>() };

        let seq = header.seq.load(Ordering::Relaxed);
        header.seq.store(seq.wrapping_add(1), Ordering::Relaxed);
        fence(Ordering::Release);

        header.flags = flags.bits();
        header.x = update.x;
        header.y = update.y;
        if let Some(shape) = shape {
            header.width = shape.width;
            header.height = shape.height;
            header.pitch = shape.pitch;
            header.kind = shape.kind as u32;
            header.data_len = shape.data.len() as u32;
            // SAFETY: bounds checked against the scratch capacity above.
            unsafe {
                core::ptr::copy_nonoverlapping(
                    shape.data.as_ptr(),
                    self.region.offset(self.offset + CURSOR_HEADER_LEN),
                    shape.data.len(),
                );
            }
        }

        header.seq.store(seq.wrapping_add(2), Ordering::Release);
        true
    }
}

/// Reader handle for the cursor area. Any number may exist.
pub struct CursorReader {
    region: Region,
    offset: usize,
    capacity: u32,
}

impl CursorReader {
    pub(crate) fn new(region: Region, offset: usize, capacity: u32) -> Self {
        Self {
            region,
            offset,
            capacity,
        }
    }

    /// Snapshot the latest cursor update.
    ///
    /// Returns `None` when nothing was ever published, or when the area
    /// never stabilizes within the retry budget (a stalled writer).
    pub fn read(&self) -> Option<CursorUpdate> {
        let header = self.header();
        let scratch = self.capacity as usize - CURSOR_HEADER_LEN;

        let mut attempts = 0u32;
        loop {
            let s1 = header.seq.load(Ordering::Acquire);
            if s1 == 0 {
                return None;
            }
            if s1 & 1 != 0 {
                attempts += 1;
                if attempts > SEQ_RETRY_LIMIT {
                    warn!("cursor area never stabilized, giving up");
                    return None;
                }
                core::hint::spin_loop();
                continue;
            }

            let flags = CursorFlags::from_bits_truncate(header.flags);
            let x = header.x;
            let y = header.y;
            let width = header.width;
            let height = header.height;
            let pitch = header.pitch;
            let kind = header.kind;
            let data_len = header.data_len as usize;

            let shape_bytes = if flags.contains(CursorFlags::SHAPE) && data_len <= scratch {
                let mut data = vec![0u8; data_len];
                // SAFETY: data_len bounded by the scratch capacity; a torn
                // copy is caught by the sequence re-check below.
                unsafe {
                    core::ptr::copy_nonoverlapping(
                        self.region.offset(self.offset + CURSOR_HEADER_LEN),
                        data.as_mut_ptr(),
                        data_len,
                    );
                }
                Some(data)
            } else {
                None
            };

            fence(Ordering::Acquire);
            if header.seq.load(Ordering::Relaxed) != s1 {
                attempts += 1;
                if attempts > SEQ_RETRY_LIMIT {
                    warn!("cursor area never stabilized, giving up");
                    return None;
                }
                continue;
            }

            // Snapshot is stable from here on.
            let shape = match shape_bytes {
                Some(data) => match FrameKind::from_u32(kind) {
                    Some(kind) => Some(CursorShape {
                        kind,
                        width,
                        height,
                        pitch,
                        data,
                    }),
                    None => {
                        warn!(kind, "unknown cursor shape kind, shape dropped");
                        None
                    }
                },
                None if flags.contains(CursorFlags::SHAPE) => {
                    warn!(data_len, "cursor shape length out of range, shape dropped");
                    None
                }
                None => None,
            };
            let flags = if shape.is_none() {
                flags - CursorFlags::SHAPE
            } else {
                flags
            };
            return Some(CursorUpdate { flags, x, y, shape });
        }
    }

    fn header(&self) -> &CursorHeader {
        // SAFETY: the offset was validated against the region at attach.
        unsafe { &*self.region.offset(self.offset).cast::<CursorHeader>() }
    }
}
