//! Shared helpers for tests across the periscope crates: tracing setup,
//! self-cleaning temp paths, anonymous memory files, and deterministic
//! payload patterns.

use std::fs::File;
use std::io::Write;
use std::os::unix::io::{FromRawFd, OwnedFd};
use std::path::{Path, PathBuf};

/// Install the fmt tracing subscriber, honoring `RUST_LOG`. Safe to call
/// from every test; later calls are no-ops.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

/// A temp file path that sweeps itself (and any doorbell sockets derived
/// from it) when dropped.
pub struct TempPath {
    path: PathBuf,
}

impl TempPath {
    pub fn as_path(&self) -> &Path {
        &self.path
    }
}

impl Drop for TempPath {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
        for peer in 0..32u16 {
            let mut bell = self.path.clone().into_os_string();
            bell.push(format!(".db{peer}"));
            let _ = std::fs::remove_file(bell);
        }
    }
}

/// A per-process temp path for `name`. Unique across concurrently running
/// test binaries.
pub fn temp_path(name: &str) -> TempPath {
    TempPath {
        path: std::env::temp_dir().join(format!("periscope_{}_{}", name, std::process::id())),
    }
}

/// An anonymous memory file prefilled with `bytes`, for standing in as
/// guest memory.
pub fn memfd_with(bytes: &[u8]) -> OwnedFd {
    let raw = unsafe { libc::memfd_create(c"periscope-test".as_ptr(), libc::MFD_CLOEXEC) };
    assert!(raw >= 0, "memfd_create failed");
    // SAFETY: raw is a fresh fd owned by nobody else.
    let fd = unsafe { OwnedFd::from_raw_fd(raw) };
    let mut file = File::from(fd);
    file.write_all(bytes).expect("memfd write");
    file.into()
}

/// Fill `buf` with a deterministic byte pattern seeded by `seed`.
pub fn fill_pattern(buf: &mut [u8], seed: u8) {
    for (i, b) in buf.iter_mut().enumerate() {
        *b = seed.wrapping_add(i as u8).wrapping_mul(31);
    }
}

/// A freshly allocated patterned buffer of `len` bytes.
pub fn pattern_vec(len: usize, seed: u8) -> Vec<u8> {
    let mut buf = vec![0u8; len];
    fill_pattern(&mut buf, seed);
    buf
}
