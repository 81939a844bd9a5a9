//! Relay region layout.
//!
//! A relay region holds one control header, one cursor scratch area, and a
//! small ring of frame slots. Each slot is a stream buffer: a 64-byte
//! stream header followed by frame bytes.
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │  Relay Header (64 bytes: magic, version, geometry, frame counter)│
//! ├──────────────────────────────────────────────────────────────────┤
//! │  Cursor Area (cursor header 64 bytes + shape scratch)            │
//! ├──────────────────────────────────────────────────────────────────┤
//! │  Slot 0: stream header (64 bytes) + frame bytes                  │
//! ├──────────────────────────────────────────────────────────────────┤
//! │  Slot 1: stream header (64 bytes) + frame bytes                  │
//! ├──────────────────────────────────────────────────────────────────┤
//! │  ... (slot_count total)                                          │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The producer writes the header once at creation; consumers discover the
//! geometry from it after validating magic and version.

use std::sync::atomic::AtomicU32;

use crate::header::HEADER_BLOCK_LEN;

/// Magic bytes identifying a relay region.
pub const RELAY_MAGIC: [u8; 8] = *b"PSCRELAY";

/// Current relay layout version (major.minor packed into u32).
pub const RELAY_VERSION: u32 = 1 << 16; // v1.0

/// Default number of frame slots. Two is enough for one frame in flight
/// while the next is being written.
pub const DEFAULT_SLOT_COUNT: u32 = 2;

/// Default slot capacity (16MB holds a 1920x1080 ARGB frame twice over).
pub const DEFAULT_SLOT_CAPACITY: u32 = 16 << 20;

/// Default cursor area capacity (128KB of shape scratch).
pub const DEFAULT_CURSOR_CAPACITY: u32 = 128 << 10;

/// Relay header at the start of the region (64 bytes, cache-line aligned).
#[repr(C, align(64))]
pub struct RelayHeader {
    /// Magic bytes: "PSCRELAY".
    pub magic: [u8; 8],
    /// Layout version (major.minor packed).
    pub version: u32,

    // Geometry (so consumers can discover it from the region)
    /// Number of frame slots.
    pub slot_count: u32,
    /// Capacity of each slot's stream in bytes.
    pub slot_capacity: u32,
    /// Offset of the cursor area from the start of the region.
    pub cursor_offset: u32,
    /// Capacity of the cursor area in bytes, header included.
    pub cursor_capacity: u32,

    /// Count of frames published so far. The producer bumps it (release)
    /// once a frame's header block is streamed; consumers acquire-load it
    /// to spot new frames.
    pub frame_counter: AtomicU32,

    /// Padding to 64 bytes.
    pub _pad: [u8; 32],
}

const _: () = assert!(core::mem::size_of::<RelayHeader>() == 64);

impl RelayHeader {
    /// Initialize a fresh header for `layout`.
    pub fn init(&mut self, layout: &RelayLayout, cursor_offset: u32) {
        self.magic = RELAY_MAGIC;
        self.version = RELAY_VERSION;
        self.slot_count = layout.slot_count;
        self.slot_capacity = layout.slot_capacity;
        self.cursor_offset = cursor_offset;
        self.cursor_capacity = layout.cursor_capacity;
        self.frame_counter = AtomicU32::new(0);
        self._pad = [0; 32];
    }

    /// Validate the header. Magic and major version come first; the
    /// embedded geometry is only checked after they pass.
    pub fn validate(&self) -> Result<(), LayoutError> {
        if self.magic != RELAY_MAGIC {
            return Err(LayoutError::InvalidMagic);
        }
        let major = self.version >> 16;
        if major != RELAY_VERSION >> 16 {
            return Err(LayoutError::IncompatibleVersion {
                expected: RELAY_VERSION,
                found: self.version,
            });
        }
        if self.slot_count < 2 {
            return Err(LayoutError::InvalidConfig("slot_count must be at least 2"));
        }
        if self.slot_capacity as usize <= HEADER_BLOCK_LEN {
            return Err(LayoutError::InvalidConfig(
                "slot_capacity must exceed the frame header block",
            ));
        }
        if self.slot_capacity % 64 != 0 {
            return Err(LayoutError::InvalidConfig(
                "slot_capacity must be a multiple of 64",
            ));
        }
        if self.cursor_capacity < 64 || self.cursor_capacity % 64 != 0 {
            return Err(LayoutError::InvalidConfig(
                "cursor_capacity must be a non-zero multiple of 64",
            ));
        }
        if (self.cursor_offset as usize) < core::mem::size_of::<RelayHeader>() {
            return Err(LayoutError::InvalidConfig(
                "cursor area overlaps the relay header",
            ));
        }
        Ok(())
    }

    /// Extract the geometry from a validated header.
    pub fn layout(&self) -> RelayLayout {
        RelayLayout {
            slot_count: self.slot_count,
            slot_capacity: self.slot_capacity,
            cursor_capacity: self.cursor_capacity,
        }
    }
}

/// Relay region geometry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelayLayout {
    /// Number of frame slots (at least 2).
    pub slot_count: u32,
    /// Capacity of each slot's stream in bytes (multiple of 64).
    pub slot_capacity: u32,
    /// Capacity of the cursor area in bytes (multiple of 64, at least 64).
    pub cursor_capacity: u32,
}

impl Default for RelayLayout {
    fn default() -> Self {
        Self {
            slot_count: DEFAULT_SLOT_COUNT,
            slot_capacity: DEFAULT_SLOT_CAPACITY,
            cursor_capacity: DEFAULT_CURSOR_CAPACITY,
        }
    }
}

/// Byte offsets of the relay areas within the region.
#[derive(Debug, Clone, Copy)]
pub struct RelayOffsets {
    pub header: usize,
    pub cursor: usize,
    pub slots: usize,
    pub slot_stride: usize,
    pub total: usize,
}

impl RelayOffsets {
    /// Calculate offsets for `layout` (checked).
    ///
    /// Returns an error string describing where the overflow occurred.
    pub fn calculate_checked(layout: &RelayLayout) -> Result<Self, &'static str> {
        let header_size = core::mem::size_of::<RelayHeader>();
        let stream_header_size = 64usize;

        let header = 0usize;
        let cursor = header
            .checked_add(header_size)
            .ok_or("relay offset overflow (cursor)")?;
        let slots = cursor
            .checked_add(layout.cursor_capacity as usize)
            .ok_or("relay offset overflow (slots)")?;
        let slot_stride = stream_header_size
            .checked_add(layout.slot_capacity as usize)
            .ok_or("relay offset overflow (slot stride)")?;
        let slot_total = slot_stride
            .checked_mul(layout.slot_count as usize)
            .ok_or("relay offset overflow (slot area)")?;
        let total = slots
            .checked_add(slot_total)
            .ok_or("relay offset overflow (total)")?;

        Ok(Self {
            header,
            cursor,
            slots,
            slot_stride,
            total,
        })
    }

    /// Offset of slot `index`'s stream header.
    pub fn slot(&self, index: u32) -> usize {
        self.slots + index as usize * self.slot_stride
    }
}

/// Errors from relay layout validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LayoutError {
    /// Invalid magic bytes.
    InvalidMagic,
    /// Incompatible layout version.
    IncompatibleVersion { expected: u32, found: u32 },
    /// Region smaller than the layout needs.
    RegionTooSmall { required: usize, found: usize },
    /// Invalid geometry in header or layout.
    InvalidConfig(&'static str),
}

impl std::fmt::Display for LayoutError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidMagic => write!(f, "invalid relay magic"),
            Self::IncompatibleVersion { expected, found } => {
                write!(
                    f,
                    "incompatible relay version: expected {}.{}, found {}.{}",
                    expected >> 16,
                    expected & 0xFFFF,
                    found >> 16,
                    found & 0xFFFF
                )
            }
            Self::RegionTooSmall { required, found } => {
                write!(f, "region too small: need {} bytes, got {}", required, found)
            }
            Self::InvalidConfig(msg) => write!(f, "invalid relay config: {}", msg),
        }
    }
}

impl std::error::Error for LayoutError {}
