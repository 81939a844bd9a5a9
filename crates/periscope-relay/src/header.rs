//! The fixed frame header contract.
//!
//! Every frame starts with a 48-byte `repr(C)` header, padded to a 64-byte
//! block so the payload begins cache-line aligned. The header is the wire
//! contract between host and guest builds: field order and widths are
//! binding, and readers trust nothing before the magic and major version
//! have checked out.

/// Magic bytes identifying a frame header.
pub const FRAME_MAGIC: [u8; 8] = *b"PERISCOP";

/// Current frame protocol version (major.minor packed into u32).
/// Major = high 16 bits, minor = low 16 bits.
pub const FRAME_VERSION: u32 = 1 << 16; // v1.0

/// Serialized size of [`FrameHeader`].
pub const FRAME_HEADER_LEN: usize = 48;

/// Size of the header block at the start of a frame stream: the header
/// plus padding up to the payload start.
pub const HEADER_BLOCK_LEN: usize = 64;

/// Pixel encoding of a frame payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum FrameKind {
    /// 32-bit ARGB, 4 bytes per pixel.
    Argb = 0,
    /// 24-bit RGB, 3 bytes per pixel.
    Rgb = 1,
    /// XOR delta against the previous frame, ARGB layout.
    XorDelta = 2,
    /// Planar-free YUV 4:4:4, 3 bytes per pixel.
    Yuv444 = 3,
    /// Planar YUV 4:2:0; rows are not independently addressable.
    Yuv420 = 4,
    /// 10-bit channels packed into 32-bit words.
    Packed10 = 5,
}

impl FrameKind {
    /// Decode a raw header field.
    pub fn from_u32(raw: u32) -> Option<Self> {
        match raw {
            0 => Some(Self::Argb),
            1 => Some(Self::Rgb),
            2 => Some(Self::XorDelta),
            3 => Some(Self::Yuv444),
            4 => Some(Self::Yuv420),
            5 => Some(Self::Packed10),
            _ => None,
        }
    }

    /// Bytes per pixel for packed encodings; `None` for planar ones.
    pub fn bytes_per_pixel(self) -> Option<u32> {
        match self {
            Self::Argb | Self::XorDelta | Self::Packed10 => Some(4),
            Self::Rgb | Self::Yuv444 => Some(3),
            Self::Yuv420 => None,
        }
    }
}

/// Frame header (48 bytes, no padding).
///
/// Streamed as the first [`FRAME_HEADER_LEN`] bytes of every frame slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub struct FrameHeader {
    /// Magic bytes: "PERISCOP".
    pub magic: [u8; 8],
    /// Protocol version (major.minor packed).
    pub version: u32,
    /// Peer id of the producing host process.
    pub host_peer: u16,
    /// Peer id of the consuming guest process.
    pub guest_peer: u16,
    /// Pixel encoding ([`FrameKind`] as u32).
    pub kind: u32,
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
    /// Payload offset from the start of the frame stream.
    pub payload_offset: u32,
}

const _: () = assert!(core::mem::size_of::<FrameHeader>() == FRAME_HEADER_LEN);

impl FrameHeader {
    /// View the header as its wire bytes.
    pub fn as_bytes(&self) -> &[u8] {
        // SAFETY: FrameHeader is repr(C) with no padding bytes.
        unsafe {
            core::slice::from_raw_parts((self as *const FrameHeader).cast::<u8>(), FRAME_HEADER_LEN)
        }
    }

    /// Decode a header from wire bytes. No field is validated here; call
    /// [`FrameHeader::validate`] before trusting any of them.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, HeaderError> {
        if bytes.len() < FRAME_HEADER_LEN {
            return Err(HeaderError::Truncated {
                needed: FRAME_HEADER_LEN,
                got: bytes.len(),
            });
        }
        // SAFETY: repr(C), no padding, and every bit pattern is a valid
        // FrameHeader (kind stays raw until validate()).
        Ok(unsafe { core::ptr::read_unaligned(bytes.as_ptr().cast::<FrameHeader>()) })
    }

    /// Validate the header against a slot of `capacity` bytes.
    ///
    /// Magic and major version are checked before any other field is
    /// interpreted. Returns the decoded frame kind.
    pub fn validate(&self, capacity: u32) -> Result<FrameKind, HeaderError> {
        if self.magic != FRAME_MAGIC {
            return Err(HeaderError::BadMagic);
        }
        let major = self.version >> 16;
        if major != FRAME_VERSION >> 16 {
            return Err(HeaderError::VersionMismatch {
                expected: FRAME_VERSION,
                found: self.version,
            });
        }
        let kind = FrameKind::from_u32(self.kind).ok_or(HeaderError::BadKind(self.kind))?;

        let end = self.payload_offset as u64 + self.payload_len as u64;
        if self.payload_offset < HEADER_BLOCK_LEN as u32 || end > capacity as u64 {
            return Err(HeaderError::PayloadOutOfRange {
                offset: self.payload_offset,
                len: self.payload_len,
                capacity,
            });
        }
        Ok(kind)
    }
}

/// Errors from frame header decoding and validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaderError {
    /// Invalid magic bytes.
    BadMagic,
    /// Incompatible major version.
    VersionMismatch { expected: u32, found: u32 },
    /// Unknown frame kind value.
    BadKind(u32),
    /// Payload range exceeds the slot or overlaps the header block.
    PayloadOutOfRange { offset: u32, len: u32, capacity: u32 },
    /// Not enough bytes for a header.
    Truncated { needed: usize, got: usize },
}

impl std::fmt::Display for HeaderError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::BadMagic => write!(f, "invalid frame magic"),
            Self::VersionMismatch { expected, found } => {
                write!(
                    f,
                    "incompatible frame version: expected {}.{}, found {}.{}",
                    expected >> 16,
                    expected & 0xFFFF,
                    found >> 16,
                    found & 0xFFFF
                )
            }
            Self::BadKind(raw) => write!(f, "unknown frame kind {}", raw),
            Self::PayloadOutOfRange {
                offset,
                len,
                capacity,
            } => {
                write!(
                    f,
                    "payload out of range: offset {} + len {} vs slot capacity {}",
                    offset, len, capacity
                )
            }
            Self::Truncated { needed, got } => {
                write!(f, "truncated header: need {} bytes, got {}", needed, got)
            }
        }
    }
}

impl std::error::Error for HeaderError {}
