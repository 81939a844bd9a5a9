//! Bulk copy strategies for the frame payload path.
//!
//! Frame payloads are large (megabytes) and latency-sensitive, and some libc
//! `memcpy` implementations are slow for this pattern. The copy strategy is
//! therefore pluggable: [`WideCopy`] moves 64-byte chunks through aligned
//! destination writes, [`ByteCopy`] is the portable fallback.

use core::ptr;

/// Default publish granularity for streamed writes (1 MiB).
pub const DEFAULT_CHUNK_LEN: usize = 1 << 20;

/// A bulk memory copy strategy.
///
/// Implementations must not assume anything about alignment of `dst` or
/// `src`.
pub trait BulkCopy: Sync {
    /// Copy `len` bytes from `src` to `dst`.
    ///
    /// # Safety
    ///
    /// `src` must be valid for reads of `len` bytes, `dst` for writes of
    /// `len` bytes, and the two ranges must not overlap.
    unsafe fn copy(&self, dst: *mut u8, src: *const u8, len: usize);
}

/// Portable byte-wise copy via `ptr::copy_nonoverlapping`.
pub struct ByteCopy;

impl BulkCopy for ByteCopy {
    #[inline]
    unsafe fn copy(&self, dst: *mut u8, src: *const u8, len: usize) {
        unsafe { ptr::copy_nonoverlapping(src, dst, len) };
    }
}

/// Wide copy: 64-byte `[u128; 4]` chunks with 16-byte-aligned destination
/// writes and unaligned-tolerant head/tail. Short runs take the byte path.
pub struct WideCopy;

impl BulkCopy for WideCopy {
    unsafe fn copy(&self, dst: *mut u8, src: *const u8, len: usize) {
        unsafe {
            if len < 128 {
                ptr::copy_nonoverlapping(src, dst, len);
                return;
            }

            // Copy the first 16 bytes, then resume at the next address where
            // destination writes are 16-byte aligned.
            copy_one::<u128>(dst.cast(), src.cast());
            let offset = 16 - dst.addr() % 16;

            let mut i = offset;
            while i + 64 <= len {
                (dst.add(i) as *mut [u128; 4]).write(read_chunk(src.add(i)));
                i += 64;
            }

            if i < len {
                // Unaligned tail; may rewrite up to 63 bytes already copied,
                // which is fine since src and dst do not overlap.
                copy_one::<[u128; 4]>(dst.add(len - 64).cast(), src.add(len - 64).cast());
            }
        }
    }
}

/// Copies one element of size `T` from `src` to `dst`, alignment-free.
#[inline]
unsafe fn copy_one<T>(dst: *mut T, src: *const T) {
    unsafe { dst.write_unaligned(src.read_unaligned()) };
}

#[inline]
unsafe fn read_chunk(src: *const u8) -> [u128; 4] {
    unsafe { (src as *const [u128; 4]).read_unaligned() }
}

/// How streamed writes and reads move bytes: publish granularity plus the
/// copy strategy to use per chunk.
#[derive(Clone, Copy)]
pub struct CopyConfig {
    /// Bytes copied between publications of the write offset.
    pub chunk_len: usize,
    /// Copy strategy for each chunk.
    pub copy: &'static dyn BulkCopy,
}

impl Default for CopyConfig {
    fn default() -> Self {
        Self {
            chunk_len: DEFAULT_CHUNK_LEN,
            copy: &WideCopy,
        }
    }
}

impl core::fmt::Debug for CopyConfig {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("CopyConfig")
            .field("chunk_len", &self.chunk_len)
            .finish()
    }
}

#[cfg(all(test, not(feature = "loom")))]
mod tests {
    use super::*;
    use alloc::vec;
    use alloc::vec::Vec;

    fn check_strategy(copy: &dyn BulkCopy) {
        let max = 4000;
        let src = (0..max).map(|x| (x % 251) as u8).collect::<Vec<u8>>();
        for len in [0, 1, 7, 16, 63, 64, 65, 127, 128, 129, 1023, 2048, 3999] {
            // Shift the start around to exercise unaligned heads.
            for offset in 0..4 {
                if offset + len > max {
                    continue;
                }
                let mut dst = vec![0u8; len];
                unsafe {
                    copy.copy(dst.as_mut_ptr(), src[offset..].as_ptr(), len);
                }
                assert_eq!(&dst[..], &src[offset..offset + len], "len={len} off={offset}");
            }
        }
    }

    #[test]
    fn byte_copy_exact() {
        check_strategy(&ByteCopy);
    }

    #[test]
    fn wide_copy_exact() {
        check_strategy(&WideCopy);
    }

    #[test]
    fn wide_copy_unaligned_destination() {
        let src = (0u32..1000).map(|x| (x % 256) as u8).collect::<Vec<u8>>();
        let mut dst = vec![0u8; 1015];
        for shift in 1..16 {
            dst.fill(0);
            unsafe {
                WideCopy.copy(dst[shift..].as_mut_ptr(), src.as_ptr(), src.len());
            }
            assert_eq!(&dst[shift..shift + src.len()], &src[..]);
        }
    }

    #[test]
    fn default_config_uses_wide_chunks() {
        let config = CopyConfig::default();
        assert_eq!(config.chunk_len, DEFAULT_CHUNK_LEN);
    }
}
