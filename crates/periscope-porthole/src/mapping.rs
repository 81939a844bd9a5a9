//! Assembled guest-memory mappings.
//!
//! A mapping is an ordered run of segments, each a window into some
//! shared descriptor, presented as one logical buffer. Guest physical
//! memory is rarely contiguous in the backing file, so a single mapping
//! routinely stitches together pieces of several descriptors.

use std::sync::Arc;

use crate::shared_fd::{MapError, SharedFd};
use crate::wire::ProtocolError;

/// Why a segment could not be attached to its descriptor.
#[derive(Debug)]
pub(crate) enum SegmentError {
    /// The declared range falls outside the descriptor.
    OutOfRange(ProtocolError),
    /// The descriptor could not be mapped.
    Map(MapError),
}

/// One contiguous window into a shared descriptor.
///
/// Holds a reference on the descriptor for its whole lifetime, which
/// keeps the backing memory mapped.
#[derive(Debug)]
pub struct Segment {
    shared: Arc<SharedFd>,
    offset: u64,
    len: u32,
}

impl Segment {
    pub(crate) fn new(shared: Arc<SharedFd>, offset: u64, len: u32) -> Result<Self, SegmentError> {
        match offset.checked_add(len as u64) {
            Some(end) if end <= shared.len() => {}
            _ => {
                return Err(SegmentError::OutOfRange(ProtocolError::SegmentOutOfRange {
                    fd_id: shared.id(),
                    offset,
                    len,
                    fd_len: shared.len(),
                }));
            }
        }
        shared.acquire().map_err(SegmentError::Map)?;
        Ok(Self {
            shared,
            offset,
            len,
        })
    }

    /// Length of this window in bytes.
    pub fn len(&self) -> u32 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Offset of this window within its descriptor.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Id of the descriptor backing this window.
    pub fn fd_id(&self) -> u32 {
        self.shared.id()
    }

    /// Raw pointer to the first byte of the window.
    ///
    /// Valid for [`len`](Self::len) bytes as long as this segment lives;
    /// the segment's descriptor reference keeps the mapping in place.
    /// The guest may write the memory concurrently.
    pub fn as_ptr(&self) -> *const u8 {
        let base = self
            .shared
            .mapped_base()
            .expect("live segment implies a live mapping");
        // SAFETY: offset + len was validated against the descriptor's
        // extent at construction.
        unsafe { base.add(self.offset as usize) }
    }

    /// Copy `dst.len()` bytes starting `offset` bytes into the window.
    pub fn copy_to_slice(&self, offset: u32, dst: &mut [u8]) -> Result<(), MapError> {
        match (offset as u64).checked_add(dst.len() as u64) {
            Some(end) if end <= self.len as u64 => {}
            _ => {
                return Err(MapError::OutOfRange {
                    offset: offset as u64,
                    len: dst.len() as u64,
                    size: self.len as u64,
                });
            }
        }
        self.shared.copy_region(self.offset + offset as u64, dst)
    }
}

impl Drop for Segment {
    fn drop(&mut self) {
        self.shared.release();
    }
}

/// A sealed run of segments announced under one id.
#[derive(Debug)]
pub struct Mapping {
    id: u32,
    kind: u32,
    size: u64,
    segments: Vec<Segment>,
}

impl Mapping {
    pub(crate) fn seal(id: u32, kind: u32, segments: Vec<Segment>) -> Self {
        let size = segments.iter().map(|s| s.len() as u64).sum();
        Self {
            id,
            kind,
            size,
            segments,
        }
    }

    /// Id the remote side announced this mapping under.
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Application-defined kind tag from the finish message.
    pub fn kind(&self) -> u32 {
        self.kind
    }

    /// Total length of the logical buffer in bytes.
    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn segment_count(&self) -> usize {
        self.segments.len()
    }

    /// The segments in announcement order.
    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    /// Copy `dst.len()` bytes starting at logical `offset`, walking
    /// segment boundaries as needed.
    pub fn read_at(&self, offset: u64, dst: &mut [u8]) -> Result<(), MapError> {
        match offset.checked_add(dst.len() as u64) {
            Some(end) if end <= self.size => {}
            _ => {
                return Err(MapError::OutOfRange {
                    offset,
                    len: dst.len() as u64,
                    size: self.size,
                });
            }
        }
        let total = dst.len();
        let mut skip = offset;
        let mut written = 0usize;
        for segment in &self.segments {
            if written == total {
                break;
            }
            let seg_len = segment.len() as u64;
            if skip >= seg_len {
                skip -= seg_len;
                continue;
            }
            let take = ((seg_len - skip) as usize).min(total - written);
            segment.copy_to_slice(skip as u32, &mut dst[written..written + take])?;
            written += take;
            skip = 0;
        }
        Ok(())
    }
}
