//! `GlobalAlloc` over a single [`Heap`] on an mmap reservation.
//!
//! The heap itself is single-threaded; every call here runs under a spin lock.

use core::{
  alloc::{GlobalAlloc, Layout},
  cell::{Cell, UnsafeCell},
  hint,
  ptr::{self, NonNull, null_mut},
  sync::atomic::{AtomicBool, Ordering},
};

use crate::{ALIGNMENT, Heap, HeapStats, MmapArena, Payload};

/// Address space reserved by each [`Allocator`]. Pages are committed on touch.
pub const GLOBAL_RESERVE: usize = 1 << 30; // 1GB

// =============================================================================
// SpinLock
// =============================================================================

struct SpinLock {
  locked: AtomicBool,
}

impl SpinLock {
  const fn new() -> Self {
    Self {
      locked: AtomicBool::new(false),
    }
  }

  #[inline]
  fn lock(&self) {
    while self
      .locked
      .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
      .is_err()
    {
      while self.locked.load(Ordering::Relaxed) {
        hint::spin_loop();
      }
    }
  }

  #[inline]
  fn unlock(&self) {
    self.locked.store(false, Ordering::Release);
  }
}

/// Held while a thread is inside the heap. Dropping it, including during an
/// unwind, releases the lock and clears `IN_ALLOC`.
struct HeapGuard<'a> {
  lock: &'a SpinLock,
}

impl Drop for HeapGuard<'_> {
  fn drop(&mut self) {
    self.lock.unlock();
    let _ = IN_ALLOC.try_with(|flag| flag.set(false));
  }
}

// =============================================================================
// Allocator
// =============================================================================

thread_local! {
  static IN_ALLOC: Cell<bool> = const { Cell::new(false) };
}

pub struct Allocator {
  lock: SpinLock,
  /// Created on first use.
  heap: UnsafeCell<Option<Heap<MmapArena>>>,
}

unsafe impl Sync for Allocator {}

impl Allocator {
  pub const fn new() -> Self {
    Self {
      lock: SpinLock::new(),
      heap: UnsafeCell::new(None),
    }
  }

  /// Runs `f` on the heap under the lock. Re-entrant calls (e.g. from a
  /// tracing subscriber that allocates) and calls during TLS teardown get `None`.
  fn with_heap<R, F: FnOnce(&mut Heap<MmapArena>) -> Option<R>>(&self, f: F) -> Option<R> {
    let Ok(in_alloc) = IN_ALLOC.try_with(|flag| flag.replace(true)) else {
      return None;
    };
    if in_alloc {
      return None;
    }

    self.lock.lock();
    let _guard = HeapGuard { lock: &self.lock };
    let slot = unsafe { &mut *self.heap.get() };
    if slot.is_none() {
      *slot = MmapArena::new(GLOBAL_RESERVE)
        .ok()
        .and_then(|arena| Heap::init(arena).ok());
    }
    slot.as_mut().and_then(f)
  }

  /// `realloc` with C semantics: null `ptr` allocates, zero `size` frees.
  pub unsafe fn resize(&self, ptr: *mut u8, size: usize) -> *mut u8 {
    self
      .with_heap(|heap| {
        let payload = if ptr.is_null() {
          None
        } else {
          Some(Payload::from_offset(heap.arena().offset_of(ptr)?)?)
        };
        let fresh = heap.resize(payload, size)?;
        NonNull::new(unsafe { heap.arena().base().add(fresh.offset()) })
      })
      .map_or(null_mut(), NonNull::as_ptr)
  }

  /// Usable bytes behind `ptr`, or 0 for pointers this allocator does not own.
  pub fn usable_size(&self, ptr: *const u8) -> usize {
    self
      .with_heap(|heap| heap.usable_size(Payload::from_offset(heap.arena().offset_of(ptr)?)?))
      .unwrap_or(0)
  }

  pub fn stats(&self) -> Option<HeapStats> {
    self.with_heap(|heap| Some(heap.stats()))
  }
}

impl Default for Allocator {
  fn default() -> Self {
    Self::new()
  }
}

unsafe impl GlobalAlloc for Allocator {
  unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
    if layout.align() > ALIGNMENT {
      return null_mut();
    }
    self
      .with_heap(|heap| {
        let payload = heap.allocate(layout.size().max(1))?;
        NonNull::new(unsafe { heap.arena().base().add(payload.offset()) })
      })
      .map_or(null_mut(), NonNull::as_ptr)
  }

  unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
    if ptr.is_null() {
      return;
    }
    self.with_heap(|heap| {
      let offset = heap.arena().offset_of(ptr)?;
      heap.free(Payload::from_offset(offset));
      Some(())
    });
  }

  unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
    if layout.align() > ALIGNMENT {
      return null_mut();
    }
    unsafe { self.resize(ptr, new_size.max(1)) }
  }

  unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
    let ptr = unsafe { self.alloc(layout) };
    if !ptr.is_null() {
      unsafe { ptr::write_bytes(ptr, 0, layout.size()) }
    }
    ptr
  }
}

// =============================================================================
// C API (enabled with --features c_api)
// =============================================================================

#[cfg(feature = "c_api")]
static GLOBAL: Allocator = Allocator::new();

#[cfg(feature = "c_api")]
#[unsafe(no_mangle)]
pub unsafe extern "C" fn malloc(size: usize) -> *mut u8 {
  if size == 0 {
    return null_mut();
  }
  unsafe { GLOBAL.alloc(Layout::from_size_align_unchecked(size, ALIGNMENT)) }
}

#[cfg(feature = "c_api")]
#[unsafe(no_mangle)]
pub unsafe extern "C" fn free(ptr: *mut u8) {
  unsafe { GLOBAL.dealloc(ptr, Layout::from_size_align_unchecked(1, 1)) }
}

#[cfg(feature = "c_api")]
#[unsafe(no_mangle)]
pub unsafe extern "C" fn calloc(nmemb: usize, size: usize) -> *mut u8 {
  let Some(total) = nmemb.checked_mul(size).filter(|&total| total != 0) else {
    return null_mut();
  };
  unsafe { GLOBAL.alloc_zeroed(Layout::from_size_align_unchecked(total, ALIGNMENT)) }
}

#[cfg(feature = "c_api")]
#[unsafe(no_mangle)]
pub unsafe extern "C" fn realloc(ptr: *mut u8, size: usize) -> *mut u8 {
  unsafe { GLOBAL.resize(ptr, size) }
}

#[cfg(feature = "c_api")]
#[unsafe(no_mangle)]
pub unsafe extern "C" fn malloc_usable_size(ptr: *mut u8) -> usize {
  if ptr.is_null() {
    return 0;
  }
  GLOBAL.usable_size(ptr)
}
