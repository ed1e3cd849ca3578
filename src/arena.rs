//! Arena-growth collaborators.
//!
//! An arena is a contiguous byte range `[0, high)` addressed by offset. It only
//! grows, like `sbrk`. The heap never holds references into it; every access
//! goes through [`Arena::read`], [`Arena::write`] and [`Arena::copy`].

use crate::error::ArenaError;

/// Largest extent an arena may reach. Tags and links are 32-bit offsets.
pub const MAX_ARENA: usize = u32::MAX as usize;

/// Default limit for [`VecArena`], matching a 20 MiB trace-driver heap.
pub const DEFAULT_VEC_LIMIT: usize = 20 << 20;

pub trait Arena {
  /// Extend the arena by exactly `bytes`, returning the offset of the first new byte.
  fn grow(&mut self, bytes: usize) -> Result<usize, ArenaError>;

  /// Current extent as `(low, high)`; `low` is always 0.
  fn bounds(&self) -> (usize, usize);

  fn read(&self, offset: usize, buf: &mut [u8]);

  fn write(&mut self, offset: usize, data: &[u8]);

  /// Copy `len` bytes from `src` to `dst`. The ranges may overlap.
  fn copy(&mut self, src: usize, dst: usize, len: usize);
}

/// Checks that `[offset, offset + len)` lies below `high`.
#[inline(always)]
fn in_range(offset: usize, len: usize, high: usize) -> bool {
  offset.checked_add(len).is_some_and(|end| end <= high)
}

/// Growth request bookkeeping shared by both arenas.
fn reserve(high: usize, bytes: usize, limit: usize) -> Result<usize, ArenaError> {
  let new_high = high.checked_add(bytes).ok_or(ArenaError::OffsetRange)?;
  if new_high > MAX_ARENA {
    return Err(ArenaError::OffsetRange);
  }
  if new_high > limit {
    return Err(ArenaError::Exhausted {
      requested: bytes,
      remaining: limit - high,
    });
  }
  Ok(new_high)
}

// =============================================================================
// VecArena
// =============================================================================

/// Heap-backed arena with a hard byte limit.
#[derive(Debug)]
pub struct VecArena {
  bytes: Vec<u8>,
  limit: usize,
}

impl VecArena {
  pub fn new(limit: usize) -> Self {
    Self {
      bytes: Vec::new(),
      limit: limit.min(MAX_ARENA),
    }
  }

  pub fn limit(&self) -> usize {
    self.limit
  }
}

impl Default for VecArena {
  fn default() -> Self {
    Self::new(DEFAULT_VEC_LIMIT)
  }
}

impl Arena for VecArena {
  fn grow(&mut self, bytes: usize) -> Result<usize, ArenaError> {
    let old = self.bytes.len();
    let new_high = reserve(old, bytes, self.limit)?;
    self.bytes.resize(new_high, 0);
    Ok(old)
  }

  fn bounds(&self) -> (usize, usize) {
    (0, self.bytes.len())
  }

  fn read(&self, offset: usize, buf: &mut [u8]) {
    buf.copy_from_slice(&self.bytes[offset..offset + buf.len()]);
  }

  fn write(&mut self, offset: usize, data: &[u8]) {
    self.bytes[offset..offset + data.len()].copy_from_slice(data);
  }

  fn copy(&mut self, src: usize, dst: usize, len: usize) {
    self.bytes.copy_within(src..src + len, dst);
  }
}

// =============================================================================
// MmapArena
// =============================================================================

/// Arena over a fixed virtual reservation. The base never moves, so raw
/// pointers derived from offsets stay valid for the arena's lifetime.
#[cfg(unix)]
#[derive(Debug)]
pub struct MmapArena {
  base: *mut u8,
  reserved: usize,
  brk: usize,
}

#[cfg(unix)]
unsafe impl Send for MmapArena {}

#[cfg(unix)]
impl MmapArena {
  /// Reserve `reserved` bytes of address space. Pages are committed lazily.
  pub fn new(reserved: usize) -> Result<Self, ArenaError> {
    let reserved = reserved.min(MAX_ARENA);
    let base = unsafe { os_mmap(reserved) };
    if base.is_null() {
      return Err(ArenaError::MapFailed(reserved));
    }
    Ok(Self {
      base,
      reserved,
      brk: 0,
    })
  }

  pub fn base(&self) -> *mut u8 {
    self.base
  }

  pub fn reserved(&self) -> usize {
    self.reserved
  }

  /// Offset of `ptr` if it points inside the live range.
  pub fn offset_of(&self, ptr: *const u8) -> Option<usize> {
    let addr = ptr as usize;
    let base = self.base as usize;
    (addr >= base && addr < base + self.brk).then(|| addr - base)
  }
}

#[cfg(unix)]
impl Arena for MmapArena {
  fn grow(&mut self, bytes: usize) -> Result<usize, ArenaError> {
    let old = self.brk;
    self.brk = reserve(old, bytes, self.reserved)?;
    Ok(old)
  }

  fn bounds(&self) -> (usize, usize) {
    (0, self.brk)
  }

  fn read(&self, offset: usize, buf: &mut [u8]) {
    assert!(in_range(offset, buf.len(), self.brk), "read past arena break");
    unsafe { core::ptr::copy_nonoverlapping(self.base.add(offset), buf.as_mut_ptr(), buf.len()) };
  }

  fn write(&mut self, offset: usize, data: &[u8]) {
    assert!(in_range(offset, data.len(), self.brk), "write past arena break");
    unsafe { core::ptr::copy_nonoverlapping(data.as_ptr(), self.base.add(offset), data.len()) };
  }

  fn copy(&mut self, src: usize, dst: usize, len: usize) {
    assert!(
      in_range(src, len, self.brk) && in_range(dst, len, self.brk),
      "copy past arena break"
    );
    unsafe { core::ptr::copy(self.base.add(src), self.base.add(dst), len) };
  }
}

#[cfg(unix)]
impl Drop for MmapArena {
  fn drop(&mut self) {
    unsafe { os_munmap(self.base, self.reserved) };
  }
}

#[cfg(unix)]
unsafe fn os_mmap(size: usize) -> *mut u8 {
  let ptr = unsafe {
    libc::mmap(
      core::ptr::null_mut(),
      size,
      libc::PROT_READ | libc::PROT_WRITE,
      libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE,
      -1,
      0,
    )
  };

  if ptr == libc::MAP_FAILED {
    core::ptr::null_mut()
  } else {
    ptr as *mut u8
  }
}

#[cfg(unix)]
unsafe fn os_munmap(ptr: *mut u8, size: usize) {
  unsafe { libc::munmap(ptr.cast(), size) };
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn vec_arena_grows_like_sbrk() {
    let mut arena = VecArena::new(64);
    assert_eq!(arena.grow(24), Ok(0));
    assert_eq!(arena.grow(16), Ok(24));
    assert_eq!(arena.bounds(), (0, 40));
    assert_eq!(
      arena.grow(32),
      Err(ArenaError::Exhausted {
        requested: 32,
        remaining: 24
      })
    );
    assert_eq!(arena.bounds(), (0, 40));
  }

  #[test]
  fn vec_arena_copy_handles_overlap() {
    let mut arena = VecArena::new(16);
    arena.grow(16).unwrap();
    arena.write(0, &[1, 2, 3, 4, 5]);
    arena.copy(0, 2, 5);
    let mut buf = [0u8; 7];
    arena.read(0, &mut buf);
    assert_eq!(buf, [1, 2, 1, 2, 3, 4, 5]);
  }

  #[test]
  fn offset_range_is_enforced() {
    assert_eq!(reserve(MAX_ARENA - 8, 16, usize::MAX), Err(ArenaError::OffsetRange));
    assert_eq!(reserve(usize::MAX, 1, usize::MAX), Err(ArenaError::OffsetRange));
  }

  #[cfg(unix)]
  #[test]
  fn mmap_arena_round_trips_bytes() {
    let mut arena = MmapArena::new(1 << 20).unwrap();
    assert_eq!(arena.grow(4096), Ok(0));
    arena.write(100, b"segheap");
    let mut buf = [0u8; 7];
    arena.read(100, &mut buf);
    assert_eq!(&buf, b"segheap");
    assert_eq!(arena.offset_of(unsafe { arena.base().add(100) }), Some(100));
    assert_eq!(arena.offset_of(unsafe { arena.base().add(4096) }), None);
    assert!(arena.grow(1 << 20).is_err());
  }
}
