//! Segregated-fit heap over a growable arena.
//!
//! Blocks carry boundary tags (header and footer words packing size and an
//! allocated bit). Free blocks additionally carry two 32-bit free-list links in
//! their payload and live on exactly one of [`BUCKET_COUNT`] power-of-two size
//! classes. Every block is addressed by its payload offset into the arena.
//!
//! ```text
//! | prolog | hdr | payload ............ | ftr | hdr | next | prev | ... | ftr | epilog |
//!   (8,a)          allocated block                  free block                  (0,a)
//! ```

#![allow(clippy::missing_safety_doc)]

use core::num::NonZeroUsize;

use tracing::debug;

pub mod arena;
mod check;
pub mod error;
#[cfg(unix)]
pub mod global;

pub use arena::{Arena, VecArena};
#[cfg(unix)]
pub use arena::MmapArena;
pub use check::Finding;
pub use error::{ArenaError, ConfigError, HeapError};
#[cfg(unix)]
pub use global::Allocator;

// =============================================================================
// Constants
// =============================================================================

/// Boundary tag and free-list link width.
const WORD: usize = 4;
const DWORD: usize = 2 * WORD;

/// Payload alignment and block size granularity.
pub const ALIGNMENT: usize = 8;

/// Header, two links, footer.
pub const MIN_BLOCK: usize = 4 * WORD;

/// Per-block overhead of an allocated block (header + footer).
pub const BLOCK_OVERHEAD: usize = DWORD;

/// Prolog word plus epilog word. The prolog is one word, not two, so that
/// payloads following it stay 8-aligned.
pub const SENTINEL_OVERHEAD: usize = DWORD;

const ALLOC_BIT: u32 = 0x1;
const SIZE_MASK: u32 = !0x7;

/// Prolog, seed block, epilog.
const INIT_RESERVE: usize = 3 * DWORD;

/// Smallest class covers `[0, 2^6)`, the largest `[2^14, inf)`.
const FIRST_CLASS_SHIFT: usize = 6;
const TOP_CLASS_SHIFT: usize = 14;
pub const BUCKET_COUNT: usize = TOP_CLASS_SHIFT - FIRST_CLASS_SHIFT + 2;

pub const DEFAULT_FIT_CANDIDATES: usize = 8;
pub const DEFAULT_REALLOC_SLACK: usize = 1 << 8;
pub const DEFAULT_INITIAL_BUFFER: usize = 1 << 12;
pub const DEFAULT_GROW_GRANULARITY: usize = 1 << 12;
pub const DEFAULT_REALLOC_MIN_BLOCK: usize = 1 << 12;

// =============================================================================
// Compile-Time Assertions
// =============================================================================

const _: () = assert!(ALIGNMENT.is_power_of_two());
const _: () = assert!(MIN_BLOCK % ALIGNMENT == 0);
const _: () = assert!(INIT_RESERVE == WORD + MIN_BLOCK + WORD);
const _: () = assert!(SIZE_MASK as usize & (ALIGNMENT - 1) == 0);
const _: () = assert!(BUCKET_COUNT == 10);
const _: () = assert!(bucket_for(MIN_BLOCK) == 0);
const _: () = assert!(bucket_for((1 << TOP_CLASS_SHIFT) - 1) == BUCKET_COUNT - 2);
const _: () = assert!(bucket_for(1 << TOP_CLASS_SHIFT) == BUCKET_COUNT - 1);
const _: () = assert!(DEFAULT_REALLOC_SLACK % ALIGNMENT == 0);
const _: () = assert!(DEFAULT_INITIAL_BUFFER % ALIGNMENT == 0);
const _: () = assert!(DEFAULT_GROW_GRANULARITY.is_power_of_two());

// =============================================================================
// Configuration
// =============================================================================

/// Heuristic tuning values. The defaults favour utilization on trace-driven
/// workloads; none of them affect correctness.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Config {
  /// Candidates examined by the pseudo-best-fit search before it settles.
  pub fit_candidates: usize,
  /// Extra bytes reserved when a resize has to grow a block.
  pub realloc_slack: usize,
  /// Arena growth performed right after the sentinels are installed.
  pub initial_buffer: usize,
  /// Heap growth is rounded up to a multiple of this.
  pub grow_granularity: usize,
  /// Smallest request issued when a resize has to relocate.
  pub realloc_min_block: usize,
}

impl Config {
  pub const fn new() -> Self {
    Self {
      fit_candidates: DEFAULT_FIT_CANDIDATES,
      realloc_slack: DEFAULT_REALLOC_SLACK,
      initial_buffer: DEFAULT_INITIAL_BUFFER,
      grow_granularity: DEFAULT_GROW_GRANULARITY,
      realloc_min_block: DEFAULT_REALLOC_MIN_BLOCK,
    }
  }

  pub const fn fit_candidates(mut self, n: usize) -> Self {
    self.fit_candidates = n;
    self
  }

  pub const fn realloc_slack(mut self, bytes: usize) -> Self {
    self.realloc_slack = bytes;
    self
  }

  pub const fn initial_buffer(mut self, bytes: usize) -> Self {
    self.initial_buffer = bytes;
    self
  }

  pub const fn grow_granularity(mut self, bytes: usize) -> Self {
    self.grow_granularity = bytes;
    self
  }

  pub const fn realloc_min_block(mut self, bytes: usize) -> Self {
    self.realloc_min_block = bytes;
    self
  }

  pub fn validate(&self) -> Result<(), ConfigError> {
    if self.fit_candidates == 0 {
      return Err(ConfigError::FitCandidates);
    }
    if self.realloc_slack % ALIGNMENT != 0 {
      return Err(ConfigError::ReallocSlack(self.realloc_slack));
    }
    if self.initial_buffer == 0 || self.initial_buffer % ALIGNMENT != 0 {
      return Err(ConfigError::InitialBuffer(self.initial_buffer));
    }
    if !self.grow_granularity.is_power_of_two() || self.grow_granularity < ALIGNMENT {
      return Err(ConfigError::GrowGranularity(self.grow_granularity));
    }
    Ok(())
  }
}

impl Default for Config {
  fn default() -> Self {
    Self::new()
  }
}

// =============================================================================
// Types
// =============================================================================

/// Payload handle: the arena offset of the first payload byte. Offset 0 holds
/// the prolog at best, so it never names a payload and `Option<Payload>` is
/// one word.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct Payload(NonZeroUsize);

impl Payload {
  /// Wraps a raw offset, `None` for 0. The heap validates it before trusting it.
  pub const fn from_offset(offset: usize) -> Option<Self> {
    match NonZeroUsize::new(offset) {
      Some(offset) => Some(Self(offset)),
      None => None,
    }
  }

  /// Offsets produced by the heap lie past the prolog.
  const fn new(bp: usize) -> Self {
    match NonZeroUsize::new(bp) {
      Some(offset) => Self(offset),
      None => unreachable!(),
    }
  }

  pub const fn offset(self) -> usize {
    self.0.get()
  }
}

/// Free-list links, stored in the first two payload words of a free block.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
struct Links {
  next: Option<usize>,
  prev: Option<usize>,
}

/// Links are only reachable through `Free`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum BlockState {
  Allocated,
  Free(Links),
}

/// One block of the physical chain, as reported by [`Heap::blocks`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BlockInfo {
  pub payload: Payload,
  /// Block size including boundary tags.
  pub size: usize,
  pub allocated: bool,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct HeapStats {
  pub arena_bytes: usize,
  pub allocated_blocks: usize,
  pub allocated_bytes: usize,
  pub free_blocks: usize,
  pub free_bytes: usize,
}

#[derive(Debug)]
pub struct Heap<A: Arena = VecArena> {
  arena: A,
  /// Head of each size class list.
  buckets: [Option<usize>; BUCKET_COUNT],
  /// Offset of the prolog word.
  prolog: usize,
  config: Config,
}

// =============================================================================
// Utils
// =============================================================================

#[inline(always)]
const fn pack(size: usize, allocated: bool) -> u32 {
  size as u32 | allocated as u32
}

#[inline(always)]
const fn unpack_size(tag: u32) -> usize {
  (tag & SIZE_MASK) as usize
}

#[inline(always)]
const fn unpack_allocated(tag: u32) -> bool {
  tag & ALLOC_BIT != 0
}

#[inline(always)]
fn encode_link(link: Option<usize>) -> u32 {
  link.map_or(0, |bp| bp as u32)
}

#[inline(always)]
fn decode_link(word: u32) -> Option<usize> {
  (word != 0).then_some(word as usize)
}

/// Block size needed to serve a `size`-byte request, or `None` if it cannot
/// fit in a 32-bit arena.
#[inline]
fn block_size_for(size: usize) -> Option<usize> {
  size
    .checked_next_multiple_of(ALIGNMENT)?
    .checked_add(BLOCK_OVERHEAD)
    .filter(|&needed| needed <= arena::MAX_ARENA)
}

/// Size class of a block of `size` bytes. Each class covers `[2^n, 2^(n+1))`,
/// with everything under `2^6` in the first and everything from `2^14` in the last.
pub const fn bucket_for(size: usize) -> usize {
  if size < 1 << FIRST_CLASS_SHIFT {
    return 0;
  }
  let log2 = (usize::BITS - 1 - size.leading_zeros()) as usize;
  let bucket = log2 - FIRST_CLASS_SHIFT + 1;
  if bucket < BUCKET_COUNT {
    bucket
  } else {
    BUCKET_COUNT - 1
  }
}

// =============================================================================
// Block Layout
// =============================================================================

impl<A: Arena> Heap<A> {
  #[inline]
  fn get(&self, offset: usize) -> u32 {
    let mut word = [0u8; WORD];
    self.arena.read(offset, &mut word);
    u32::from_ne_bytes(word)
  }

  #[inline]
  fn put(&mut self, offset: usize, value: u32) {
    self.arena.write(offset, &value.to_ne_bytes());
  }

  /// Word read that refuses offsets outside the arena.
  fn try_get(&self, offset: usize) -> Option<u32> {
    let (low, high) = self.arena.bounds();
    (offset >= low && offset.checked_add(WORD)? <= high).then(|| self.get(offset))
  }

  #[inline]
  fn size(&self, bp: usize) -> usize {
    unpack_size(self.get(bp - WORD))
  }

  #[inline]
  fn allocated(&self, bp: usize) -> bool {
    unpack_allocated(self.get(bp - WORD))
  }

  /// Writes header and footer.
  #[inline]
  fn set_tags(&mut self, bp: usize, size: usize, allocated: bool) {
    debug_assert!(size % ALIGNMENT == 0 && size >= MIN_BLOCK);
    let tag = pack(size, allocated);
    self.put(bp - WORD, tag);
    self.put(bp + size - DWORD, tag);
  }

  /// Stamps the zero-size allocated header that terminates the chain.
  #[inline]
  fn set_epilog(&mut self, offset: usize) {
    self.put(offset, pack(0, true));
  }

  #[inline]
  fn next_block(&self, bp: usize) -> usize {
    bp + self.size(bp)
  }

  /// Reads the predecessor's footer. The prolog answers for the first block.
  #[inline]
  fn prev_allocated(&self, bp: usize) -> bool {
    unpack_allocated(self.get(bp - DWORD))
  }

  #[inline]
  fn prev_block(&self, bp: usize) -> usize {
    bp - unpack_size(self.get(bp - DWORD))
  }

  fn state(&self, bp: usize) -> BlockState {
    if self.allocated(bp) {
      BlockState::Allocated
    } else {
      BlockState::Free(Links {
        next: decode_link(self.get(bp)),
        prev: decode_link(self.get(bp + WORD)),
      })
    }
  }

  #[inline]
  fn set_next(&mut self, bp: usize, next: Option<usize>) {
    self.put(bp, encode_link(next));
  }

  #[inline]
  fn set_prev(&mut self, bp: usize, prev: Option<usize>) {
    self.put(bp + WORD, encode_link(prev));
  }

  #[inline]
  fn first_payload(&self) -> usize {
    self.prolog + DWORD
  }

  /// Best-effort check that `payload` names a live block: aligned, inside the
  /// arena, plausible size and matching tags.
  fn validate(&self, payload: Payload) -> Option<usize> {
    let bp = payload.offset();
    let (_, high) = self.arena.bounds();
    if bp % ALIGNMENT != 0 || bp < self.first_payload() || bp >= high {
      return None;
    }
    let header = self.get(bp - WORD);
    let size = unpack_size(header);
    if size < MIN_BLOCK || bp.checked_add(size)? > high {
      return None;
    }
    (self.get(bp + size - DWORD) == header).then_some(bp)
  }
}

// =============================================================================
// Size-Class Index
// =============================================================================

impl<A: Arena> Heap<A> {
  /// Pushes a free block onto the head of its class list.
  fn insert(&mut self, bp: usize) {
    let bucket = bucket_for(self.size(bp));
    let head = self.buckets[bucket];
    if let Some(old) = head {
      self.set_prev(old, Some(bp));
    }
    self.set_next(bp, head);
    self.set_prev(bp, None);
    self.buckets[bucket] = Some(bp);
  }

  /// Unlinks a free block using its own links. The block's size must still be
  /// the one it was inserted with.
  fn delete(&mut self, bp: usize) {
    let links = match self.state(bp) {
      BlockState::Free(links) => links,
      BlockState::Allocated => unreachable!("block {bp:#x} is not on a free list"),
    };
    match links.prev {
      Some(prev) => self.set_next(prev, links.next),
      None => self.buckets[bucket_for(self.size(bp))] = links.next,
    }
    if let Some(next) = links.next {
      self.set_prev(next, links.prev);
    }
  }

  /// Fuses two physically adjacent indexed free blocks and reindexes the result.
  fn splice(&mut self, lo: usize, hi: usize) -> usize {
    debug_assert_eq!(self.next_block(lo), hi);
    let size = self.size(lo) + self.size(hi);
    self.delete(lo);
    self.delete(hi);
    self.set_tags(lo, size, false);
    self.insert(lo);
    lo
  }

  /// Iterates one class list from its head.
  pub fn free_list(&self, bucket: usize) -> FreeList<'_, A> {
    FreeList {
      heap: self,
      cursor: self.buckets.get(bucket).copied().flatten(),
    }
  }
}

pub struct FreeList<'h, A: Arena> {
  heap: &'h Heap<A>,
  cursor: Option<usize>,
}

impl<A: Arena> Iterator for FreeList<'_, A> {
  type Item = Payload;

  fn next(&mut self) -> Option<Payload> {
    let bp = self.cursor?;
    self.cursor = match self.heap.state(bp) {
      BlockState::Free(links) => links.next,
      BlockState::Allocated => None,
    };
    Some(Payload::new(bp))
  }
}

// =============================================================================
// Placement
// =============================================================================

impl<A: Arena> Heap<A> {
  /// Pseudo-best-fit: the smallest of the first `fit_candidates` blocks that
  /// fit, scanning from the class covering `size` upwards.
  fn find_fit(&self, size: usize) -> Option<usize> {
    let mut remaining = self.config.fit_candidates;
    let mut best: Option<(usize, usize)> = None;

    for bucket in bucket_for(size)..BUCKET_COUNT {
      for bp in self.free_list(bucket).map(Payload::offset) {
        let block_size = self.size(bp);
        if block_size < size {
          continue;
        }
        if best.is_none_or(|(best_size, _)| block_size < best_size) {
          best = Some((block_size, bp));
        }
        remaining -= 1;
        if remaining == 0 {
          return best.map(|(_, bp)| bp);
        }
      }
    }

    best.map(|(_, bp)| bp)
  }

  /// Extends the arena by at least `size` bytes and returns the resulting free
  /// block, merged with a free block at the old top if there was one.
  fn grow_heap(&mut self, size: usize) -> Result<usize, HeapError> {
    let bytes = size
      .checked_next_multiple_of(self.config.grow_granularity)
      .ok_or(ArenaError::OffsetRange)?;
    // The old epilog becomes the new block's header.
    let bp = self.arena.grow(bytes)?;
    self.set_tags(bp, bytes, false);
    self.set_epilog(bp + bytes - WORD);
    self.insert(bp);
    Ok(self.coalesce(bp))
  }
}

// =============================================================================
// Split / Coalesce
// =============================================================================

impl<A: Arena> Heap<A> {
  /// Allocates `size` bytes out of the free block `bp`, splitting off the
  /// remainder when it can stand as a block of its own.
  fn place(&mut self, bp: usize, size: usize) {
    let block_size = self.size(bp);
    self.delete(bp);

    let remainder = block_size - size;
    if remainder >= MIN_BLOCK {
      self.set_tags(bp, size, true);
      let rest = bp + size;
      self.set_tags(rest, remainder, false);
      self.insert(rest);
    } else {
      self.set_tags(bp, block_size, true);
    }
  }

  /// Merges an indexed free block with its free neighbours. Returns the
  /// payload offset of the merged block.
  fn coalesce(&mut self, mut bp: usize) -> usize {
    if !self.prev_allocated(bp) {
      bp = self.splice(self.prev_block(bp), bp);
    }
    let next = self.next_block(bp);
    if !self.allocated(next) {
      bp = self.splice(bp, next);
    }
    bp
  }
}

// =============================================================================
// Heap
// =============================================================================

impl<A: Arena> Heap<A> {
  pub fn init(arena: A) -> Result<Self, HeapError> {
    Self::with_config(arena, Config::default())
  }

  /// Installs the sentinels and a minimum-size seed block, then grows the arena
  /// by `config.initial_buffer`. Only failure to reserve the sentinels is fatal.
  pub fn with_config(mut arena: A, config: Config) -> Result<Self, HeapError> {
    config.validate()?;

    let (_, high) = arena.bounds();
    let pad = high.next_multiple_of(ALIGNMENT) - high;
    let prolog = arena.grow(pad + INIT_RESERVE)? + pad;

    let mut heap = Self {
      arena,
      buckets: [None; BUCKET_COUNT],
      prolog,
      config,
    };

    heap.put(prolog, pack(DWORD, true));
    let seed = heap.first_payload();
    heap.set_tags(seed, MIN_BLOCK, false);
    heap.set_epilog(seed + MIN_BLOCK - WORD);
    heap.insert(seed);

    if let Err(err) = heap.grow_heap(config.initial_buffer) {
      debug!(%err, bytes = config.initial_buffer, "initial buffer unavailable");
    }

    debug!(prolog, high = heap.arena.bounds().1, ?config, "heap initialized");
    Ok(heap)
  }

  /// Returns `None` for zero-sized requests and when the arena cannot grow.
  pub fn allocate(&mut self, size: usize) -> Option<Payload> {
    self.try_allocate(size).ok()
  }

  pub fn try_allocate(&mut self, size: usize) -> Result<Payload, HeapError> {
    if size == 0 {
      return Err(HeapError::ZeroSize);
    }
    let needed = block_size_for(size).ok_or(ArenaError::OffsetRange)?;
    let bp = match self.find_fit(needed) {
      Some(bp) => bp,
      None => self.grow_heap(needed)?,
    };
    self.place(bp, needed);
    Ok(Payload::new(bp))
  }

  /// Releases a block. `None`, unrecognised payloads and already-free blocks
  /// are ignored.
  pub fn free(&mut self, payload: Option<Payload>) {
    let Some(bp) = payload.and_then(|p| self.validate(p)) else {
      return;
    };
    if !self.allocated(bp) {
      return;
    }
    let size = self.size(bp);
    self.set_tags(bp, size, false);
    self.insert(bp);
    self.coalesce(bp);
  }

  /// `realloc` semantics. A growing block is given `realloc_slack` extra bytes;
  /// it first tries to absorb a free successor, then to extend the arena when
  /// it is the last block, and only then relocates. Contents are preserved up
  /// to the smaller of the old payload and `size`.
  pub fn resize(&mut self, payload: Option<Payload>, size: usize) -> Option<Payload> {
    let Some(payload) = payload else {
      return self.allocate(size);
    };
    if size == 0 {
      self.free(Some(payload));
      return None;
    }
    let bp = self.validate(payload)?;
    if !self.allocated(bp) {
      return self.allocate(size);
    }

    let old = self.size(bp);
    let target = block_size_for(size)?.checked_add(self.config.realloc_slack)?;
    if old >= target {
      return Some(payload);
    }

    let next = self.next_block(bp);
    let next_size = self.size(next);
    if !self.allocated(next) && old + next_size >= target {
      self.delete(next);
      self.set_tags(bp, old + next_size, true);
      return Some(payload);
    }

    // Last block: the arena break sits right after it.
    if next_size == 0 && self.arena.grow(target - old).is_ok() {
      self.set_tags(bp, target, true);
      self.set_epilog(bp + target - WORD);
      return Some(payload);
    }

    let fresh = self.allocate(target.max(self.config.realloc_min_block))?;
    self.arena.copy(bp, fresh.offset(), (old - BLOCK_OVERHEAD).min(size));
    self.free(Some(payload));
    Some(fresh)
  }

  // ===========================================================================
  // Introspection
  // ===========================================================================

  pub fn config(&self) -> &Config {
    &self.config
  }

  pub fn arena(&self) -> &A {
    &self.arena
  }

  pub fn bounds(&self) -> (usize, usize) {
    self.arena.bounds()
  }

  /// Offset of the prolog word; the chain starts one word after it.
  pub fn prolog(&self) -> usize {
    self.prolog
  }

  /// Block size including tags, for any block `payload` names.
  pub fn block_size(&self, payload: Payload) -> Option<usize> {
    self.validate(payload).map(|bp| self.size(bp))
  }

  pub fn is_allocated(&self, payload: Payload) -> bool {
    self.validate(payload).is_some_and(|bp| self.allocated(bp))
  }

  /// Bytes the caller may use through an allocated payload.
  pub fn usable_size(&self, payload: Payload) -> Option<usize> {
    self
      .validate(payload)
      .filter(|&bp| self.allocated(bp))
      .map(|bp| self.size(bp) - BLOCK_OVERHEAD)
  }

  /// Copies from the start of an allocated payload. Returns the bytes copied.
  pub fn read_payload(&self, payload: Payload, buf: &mut [u8]) -> usize {
    let Some(usable) = self.usable_size(payload) else {
      return 0;
    };
    let len = buf.len().min(usable);
    self.arena.read(payload.offset(), &mut buf[..len]);
    len
  }

  /// Copies into the start of an allocated payload. Returns the bytes copied.
  pub fn write_payload(&mut self, payload: Payload, data: &[u8]) -> usize {
    let Some(usable) = self.usable_size(payload) else {
      return 0;
    };
    let len = data.len().min(usable);
    self.arena.write(payload.offset(), &data[..len]);
    len
  }

  /// Walks the physical chain from the first block to the epilog.
  pub fn blocks(&self) -> Blocks<'_, A> {
    Blocks {
      heap: self,
      cursor: self.first_payload(),
    }
  }

  pub fn stats(&self) -> HeapStats {
    let (low, high) = self.arena.bounds();
    let mut stats = HeapStats {
      arena_bytes: high - low,
      ..HeapStats::default()
    };
    for block in self.blocks() {
      if block.allocated {
        stats.allocated_blocks += 1;
        stats.allocated_bytes += block.size;
      } else {
        stats.free_blocks += 1;
        stats.free_bytes += block.size;
      }
    }
    stats
  }
}

pub struct Blocks<'h, A: Arena> {
  heap: &'h Heap<A>,
  cursor: usize,
}

impl<A: Arena> Iterator for Blocks<'_, A> {
  type Item = BlockInfo;

  fn next(&mut self) -> Option<BlockInfo> {
    let header = self.heap.try_get(self.cursor.checked_sub(WORD)?)?;
    let size = unpack_size(header);
    if size == 0 {
      return None;
    }
    let info = BlockInfo {
      payload: Payload::new(self.cursor),
      size,
      allocated: unpack_allocated(header),
    };
    self.cursor += size;
    Some(info)
  }
}
