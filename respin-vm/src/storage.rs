//! Writable + executable code arena.
//!
//! One page-aligned `mmap` region holds every function a rewriter generates.
//! The arena is bump-allocated with a reserve/commit split: `reserve`
//! returns a window at the current tip without claiming it, `commit`
//! advances the tip. Pages stay W+X for the lifetime of the rewriter, so
//! already-published functions remain callable while later ones are written.

use crate::error::{ErrorKind, ErrorModule, RewriteError, RwResult};

/// Bump-allocated W+X memory region.
#[derive(Debug)]
pub struct CodeStorage {
    base: *mut u8,
    cap: usize,
    used: usize,
}

// The arena is owned by exactly one rewriter; the raw pointer does not make
// it any more shared than a Vec would be.
unsafe impl Send for CodeStorage {}

impl CodeStorage {
    /// Map a fresh arena of at least `size` bytes, rounded up to whole
    /// pages.
    pub fn new(size: usize) -> RwResult<Self> {
        let page = page_size();
        let cap = size
            .checked_add(page - 1)
            .ok_or_else(|| {
                RewriteError::plain(
                    ErrorModule::Generator,
                    ErrorKind::InvalidRequest,
                    "arena size overflow",
                )
            })?
            / page
            * page;
        // Safety: anonymous private mapping, no fd, checked result below.
        let ptr = unsafe {
            libc::mmap(
                core::ptr::null_mut(),
                cap,
                libc::PROT_READ | libc::PROT_WRITE | libc::PROT_EXEC,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(RewriteError::plain(
                ErrorModule::Generator,
                ErrorKind::Unknown,
                "mmap of code arena failed",
            ));
        }
        Ok(Self {
            base: ptr.cast(),
            cap,
            used: 0,
        })
    }

    /// Address of the arena start.
    pub fn base(&self) -> u64 {
        self.base as u64
    }

    /// Bytes committed so far.
    pub fn used(&self) -> usize {
        self.used
    }

    /// Total mapped capacity.
    pub fn capacity(&self) -> usize {
        self.cap
    }

    /// Address of the current tip.
    pub fn tip(&self) -> u64 {
        self.base as u64 + self.used as u64
    }

    /// Reset the bump pointer; the mapping is reused, not freed.
    pub fn reset(&mut self) {
        self.used = 0;
    }

    /// Advance the tip to the next multiple of `align`.
    pub fn align_to(&mut self, align: usize) -> RwResult<()> {
        let misalign = (self.tip() as usize) % align;
        if misalign != 0 {
            self.commit_checked(align - misalign)?;
        }
        Ok(())
    }

    /// A writable view of the next `n` bytes, without claiming them.
    /// `reserve(0)` is the current tip.
    pub fn reserve(&mut self, n: usize) -> RwResult<&mut [u8]> {
        if self.used + n > self.cap {
            return Err(overflow());
        }
        // Safety: range checked against the mapping above.
        Ok(unsafe { core::slice::from_raw_parts_mut(self.base.add(self.used), n) })
    }

    /// Claim `n` bytes previously written through `reserve`.
    pub fn commit_checked(&mut self, n: usize) -> RwResult<()> {
        if self.used + n > self.cap {
            return Err(overflow());
        }
        self.used += n;
        Ok(())
    }

    /// Copy `bytes` to the tip and commit them, returning their address.
    pub fn push(&mut self, bytes: &[u8]) -> RwResult<u64> {
        let addr = self.tip();
        self.reserve(bytes.len())?.copy_from_slice(bytes);
        self.commit_checked(bytes.len())?;
        Ok(addr)
    }

    /// Write `bytes` at an absolute address inside the arena, without moving
    /// the tip. Layout passes use this to patch earlier output.
    pub fn write_at(&mut self, addr: u64, bytes: &[u8]) -> RwResult<()> {
        let start = addr
            .checked_sub(self.base as u64)
            .map(|o| o as usize)
            .filter(|&o| o + bytes.len() <= self.cap)
            .ok_or_else(overflow)?;
        // Safety: range checked against the mapping above.
        unsafe {
            core::slice::from_raw_parts_mut(self.base.add(start), bytes.len())
                .copy_from_slice(bytes);
        }
        Ok(())
    }

    /// Move `len` bytes from `src` to `dst` (both absolute, `dst <= src`),
    /// as the compaction pass does. A forward byte copy is safe exactly
    /// because the destination never overtakes the source.
    pub fn move_down(&mut self, dst: u64, src: u64, len: usize) -> RwResult<()> {
        debug_assert!(dst <= src);
        if dst == src || len == 0 {
            return Ok(());
        }
        let base = self.base as u64;
        let s = src.checked_sub(base).map(|o| o as usize).ok_or_else(overflow)?;
        let d = dst.checked_sub(base).map(|o| o as usize).ok_or_else(overflow)?;
        if s + len > self.cap {
            return Err(overflow());
        }
        // Safety: ranges checked; overlapping copy handled by copy (memmove).
        unsafe {
            core::ptr::copy(self.base.add(s), self.base.add(d), len);
        }
        Ok(())
    }

    /// Rewind the tip to an absolute address, reclaiming trailing hole
    /// space.
    pub fn truncate_to(&mut self, addr: u64) {
        let off = addr.saturating_sub(self.base as u64) as usize;
        debug_assert!(off <= self.used);
        self.used = off.min(self.used);
    }
}

impl Drop for CodeStorage {
    fn drop(&mut self) {
        // Safety: base/cap come from our own successful mmap.
        unsafe {
            libc::munmap(self.base.cast(), self.cap);
        }
    }
}

fn overflow() -> RewriteError {
    RewriteError::plain(
        ErrorModule::Generator,
        ErrorKind::BufferOverflow,
        "code arena exhausted",
    )
}

/// Platform page size.
pub fn page_size() -> usize {
    // Safety: sysconf is always callable; fall back to 4K on odd results.
    let n = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if n > 0 {
        n as usize
    } else {
        4096
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn arena_is_page_aligned_and_rounded() {
        let s = CodeStorage::new(100).unwrap();
        let page = page_size() as u64;
        assert_eq!(s.base() % page, 0);
        assert_eq!(s.capacity() % page_size(), 0);
        assert!(s.capacity() >= 100);
    }

    #[test]
    fn reserve_does_not_commit() {
        let mut s = CodeStorage::new(4096).unwrap();
        let tip = s.tip();
        {
            let w = s.reserve(16).unwrap();
            w.fill(0x90);
        }
        assert_eq!(s.used(), 0);
        assert_eq!(s.tip(), tip);
        s.commit_checked(16).unwrap();
        assert_eq!(s.used(), 16);
    }

    #[test]
    fn overflow_is_a_generator_error() {
        let mut s = CodeStorage::new(4096).unwrap();
        let cap = s.capacity();
        let err = s.reserve(cap + 1).unwrap_err();
        assert_eq!(err.module(), ErrorModule::Generator);
        assert_eq!(err.kind(), ErrorKind::BufferOverflow);
    }

    #[test]
    fn mapped_pages_are_executable() {
        // push a `mov eax, 42; ret` and call it
        let mut s = CodeStorage::new(4096).unwrap();
        let addr = s.push(&[0xb8, 0x2a, 0x00, 0x00, 0x00, 0xc3]).unwrap();
        let f: extern "C" fn() -> u32 = unsafe { core::mem::transmute(addr) };
        assert_eq!(f(), 42);
    }

    #[test]
    fn reset_reuses_the_mapping() {
        let mut s = CodeStorage::new(4096).unwrap();
        let base = s.base();
        s.push(&[0xc3]).unwrap();
        s.reset();
        assert_eq!(s.used(), 0);
        assert_eq!(s.base(), base);
    }
}
