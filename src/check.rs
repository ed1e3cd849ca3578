//! Heap consistency checker. Diagnostic only: nothing on the allocation paths
//! calls into it, and it never repairs what it finds.

use thiserror::Error;
use tracing::warn;

use crate::{
  ALIGNMENT, Arena, BlockState, DWORD, Heap, MIN_BLOCK, WORD, bucket_for,
  decode_link, unpack_allocated, unpack_size,
};

/// One inconsistency. Offsets are payload offsets unless named otherwise.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum Finding {
  #[error("block {block:#x} lies outside the arena [{low:#x}, {high:#x})")]
  OutOfBounds { block: usize, low: usize, high: usize },
  #[error("block {block:#x} is misaligned")]
  Misaligned { block: usize },
  #[error("block {block:#x} has invalid size {size}")]
  BadSize { block: usize, size: usize },
  #[error("block {block:#x} header {header:#x} disagrees with footer {footer:#x}")]
  TagMismatch { block: usize, header: u32, footer: u32 },
  #[error("adjacent free blocks {block:#x} and {next:#x} were not coalesced")]
  Uncoalesced { block: usize, next: usize },
  #[error("block chain ends at {end:#x}, epilog expected at {epilog:#x}")]
  Tiling { end: usize, epilog: usize },
  #[error("block {block:#x} on free list {bucket} is not marked free")]
  ListedAllocated { block: usize, bucket: usize },
  #[error("block {block:#x} of size {size} is on free list {bucket}, expected {expected}")]
  WrongBucket { block: usize, size: usize, bucket: usize, expected: usize },
  #[error("free list link broken between {prev:#x} and {block:#x}")]
  BrokenLink { prev: usize, block: usize },
  #[error("free list {bucket} does not terminate")]
  Cycle { bucket: usize },
  #[error("{chain} free blocks in the chain but {indexed} on free lists")]
  Unindexed { chain: usize, indexed: usize },
}

impl<A: Arena> Heap<A> {
  /// Walks the block chain and every free list, logging each finding.
  /// Returns `true` iff nothing was found.
  pub fn check(&self) -> bool {
    let mut clean = true;
    self.inspect(|finding| {
      clean = false;
      warn!(%finding, "heap inconsistency");
    });
    clean
  }

  /// Every finding, in discovery order.
  pub fn audit(&self) -> Vec<Finding> {
    let mut findings = Vec::new();
    self.inspect(|finding| findings.push(finding));
    findings
  }

  fn inspect(&self, mut emit: impl FnMut(Finding)) {
    let chain = self.inspect_chain(&mut emit);
    let indexed = self.inspect_lists(&mut emit);
    if chain != indexed {
      emit(Finding::Unindexed { chain, indexed });
    }
  }

  /// Returns the number of free blocks in the chain.
  fn inspect_chain(&self, emit: &mut impl FnMut(Finding)) -> usize {
    let (low, high) = self.arena.bounds();
    let mut free_blocks = 0;
    let mut prev_free: Option<usize> = None;
    let mut bp = self.first_payload();

    loop {
      let Some(header) = self.try_get(bp - WORD) else {
        emit(Finding::OutOfBounds { block: bp, low, high });
        break;
      };
      let size = unpack_size(header);
      // The epilog's payload would start at the arena break.
      if size == 0 {
        if bp != high {
          emit(Finding::Tiling {
            end: bp - WORD,
            epilog: high - WORD,
          });
        }
        break;
      }
      if bp < low || bp >= high {
        emit(Finding::OutOfBounds { block: bp, low, high });
        break;
      }
      if size < MIN_BLOCK || size % ALIGNMENT != 0 || bp + size > high {
        emit(Finding::BadSize { block: bp, size });
        break;
      }
      let footer = self.get(bp + size - DWORD);
      if footer != header {
        emit(Finding::TagMismatch { block: bp, header, footer });
      }

      if unpack_allocated(header) {
        prev_free = None;
      } else {
        free_blocks += 1;
        if let Some(block) = prev_free {
          emit(Finding::Uncoalesced { block, next: bp });
        }
        prev_free = Some(bp);
      }
      bp += size;
    }

    free_blocks
  }

  /// Returns the number of well-formed free blocks found on the lists.
  fn inspect_lists(&self, emit: &mut impl FnMut(Finding)) -> usize {
    let (low, high) = self.arena.bounds();
    // No list can hold more blocks than fit in the arena.
    let limit = high / MIN_BLOCK + 1;
    let mut indexed = 0;

    for (bucket, &head) in self.buckets.iter().enumerate() {
      let mut cursor = head;
      let mut steps = 0;

      while let Some(bp) = cursor {
        if steps == limit {
          emit(Finding::Cycle { bucket });
          break;
        }
        steps += 1;

        if !self.holds_links(bp) {
          emit(Finding::OutOfBounds { block: bp, low, high });
          break;
        }
        if bp % ALIGNMENT != 0 {
          emit(Finding::Misaligned { block: bp });
          break;
        }
        let size = self.size(bp);
        if size < MIN_BLOCK || size % ALIGNMENT != 0 || bp + size > high {
          emit(Finding::BadSize { block: bp, size });
          break;
        }
        let links = match self.state(bp) {
          BlockState::Free(links) => links,
          BlockState::Allocated => {
            emit(Finding::ListedAllocated { block: bp, bucket });
            break;
          }
        };
        indexed += 1;

        let expected = bucket_for(size);
        if expected != bucket {
          emit(Finding::WrongBucket { block: bp, size, bucket, expected });
        }

        if let Some(prev) = links.prev {
          let forward = self
            .holds_links(prev)
            .then(|| decode_link(self.get(prev)))
            .flatten();
          if forward != Some(bp) {
            emit(Finding::BrokenLink { prev, block: bp });
          }
        }
        cursor = links.next;
      }
    }

    indexed
  }

  /// Header and both link words of `bp` lie inside the arena.
  fn holds_links(&self, bp: usize) -> bool {
    let (_, high) = self.arena.bounds();
    bp >= self.first_payload() && bp.checked_add(DWORD).is_some_and(|end| end <= high)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::{Payload, VecArena, pack};

  fn heap() -> Heap {
    Heap::init(VecArena::default()).unwrap()
  }

  #[test]
  fn fresh_heap_is_consistent() {
    let heap = heap();
    assert!(heap.audit().is_empty());
    assert!(heap.check());
  }

  #[test]
  fn detects_uncoalesced_neighbours() {
    let mut heap = heap();
    let a = heap.allocate(16).unwrap().offset();
    let b = heap.allocate(16).unwrap().offset();
    heap.allocate(16).unwrap();
    // Free both without coalescing.
    for bp in [a, b] {
      heap.set_tags(bp, 24, false);
      heap.insert(bp);
    }
    assert_eq!(heap.audit(), vec![Finding::Uncoalesced { block: a, next: b }]);
    assert!(!heap.check());
  }

  #[test]
  fn detects_allocated_block_on_free_list() {
    let mut heap = heap();
    let a = heap.allocate(100).unwrap();
    heap.allocate(100).unwrap();
    heap.free(Some(a));
    heap.set_tags(a.offset(), 112, true);

    assert_eq!(
      heap.audit(),
      vec![Finding::ListedAllocated {
        block: a.offset(),
        bucket: 1
      }]
    );
    assert!(!heap.check());
  }

  #[test]
  fn detects_broken_back_link() {
    let mut heap = heap();
    let a = heap.allocate(100).unwrap();
    let fence = heap.allocate(100).unwrap();
    let b = heap.allocate(100).unwrap();
    heap.allocate(100).unwrap();
    heap.free(Some(a));
    heap.free(Some(b));
    // List 1 is [b, a]; point a's back link at the allocated fence instead.
    heap.write_payload(fence, &[0; 8]);
    heap.set_prev(a.offset(), Some(fence.offset()));

    assert_eq!(
      heap.audit(),
      vec![Finding::BrokenLink {
        prev: fence.offset(),
        block: a.offset()
      }]
    );
  }

  #[test]
  fn detects_block_in_wrong_bucket() {
    let mut heap = heap();
    let a = heap.allocate(100).unwrap();
    heap.allocate(100).unwrap();
    heap.free(Some(a));
    // Move a from list 1 to list 4 without resizing it.
    heap.delete(a.offset());
    let head = heap.buckets[4];
    heap.set_next(a.offset(), head);
    heap.set_prev(a.offset(), None);
    heap.buckets[4] = Some(a.offset());

    assert_eq!(
      heap.audit(),
      vec![Finding::WrongBucket {
        block: a.offset(),
        size: 112,
        bucket: 4,
        expected: 1
      }]
    );
  }

  #[test]
  fn detects_free_block_missing_from_index() {
    let mut heap = heap();
    let a = heap.allocate(100).unwrap();
    heap.allocate(100).unwrap();
    heap.set_tags(a.offset(), 112, false);

    assert_eq!(heap.audit(), vec![Finding::Unindexed { chain: 2, indexed: 1 }]);
  }

  #[test]
  fn detects_tag_mismatch_and_bad_size() {
    let mut heap = heap();
    let a = heap.allocate(100).unwrap();
    heap.allocate(100).unwrap();
    let footer = a.offset() + 112 - DWORD;
    heap.put(footer, pack(120, true));

    assert_eq!(
      heap.audit(),
      vec![Finding::TagMismatch {
        block: a.offset(),
        header: pack(112, true),
        footer: pack(120, true)
      }]
    );

    heap.put(a.offset() - WORD, pack(1 << 20, true));
    let findings = heap.audit();
    assert_eq!(
      findings.first(),
      Some(&Finding::BadSize {
        block: a.offset(),
        size: 1 << 20
      })
    );
  }

  #[test]
  fn detects_cyclic_free_list() {
    let mut heap = heap();
    let a = heap.allocate(100).unwrap();
    heap.allocate(100).unwrap();
    heap.free(Some(a));
    heap.set_next(a.offset(), Some(a.offset()));

    assert!(heap.audit().contains(&Finding::Cycle { bucket: 1 }));
  }

  #[test]
  fn detects_list_link_past_the_break() {
    let mut heap = heap();
    let a = heap.allocate(100).unwrap();
    heap.allocate(100).unwrap();
    heap.free(Some(a));
    let (low, high) = heap.bounds();
    heap.set_next(a.offset(), Some(high + 64));

    assert_eq!(
      heap.audit(),
      vec![Finding::OutOfBounds {
        block: high + 64,
        low,
        high
      }]
    );
  }

  #[test]
  fn misaligned_list_head_hides_the_real_block() {
    let mut heap = heap();
    let a = heap.allocate(100).unwrap();
    heap.allocate(100).unwrap();
    heap.free(Some(a));
    heap.buckets[1] = Some(a.offset() + 3);

    assert_eq!(
      heap.audit(),
      vec![
        Finding::Misaligned {
          block: a.offset() + 3
        },
        Finding::Unindexed { chain: 2, indexed: 1 },
      ]
    );
  }

  #[test]
  fn listed_block_with_bad_size_is_not_indexed() {
    let mut heap = heap();
    let a = heap.allocate(100).unwrap();
    heap.allocate(100).unwrap();
    heap.free(Some(a));
    heap.put(a.offset() - WORD, pack(8, false));

    assert_eq!(
      heap.audit(),
      vec![
        Finding::BadSize {
          block: a.offset(),
          size: 8
        },
        Finding::BadSize {
          block: a.offset(),
          size: 8
        },
        Finding::Unindexed { chain: 0, indexed: 1 },
      ]
    );
  }

  #[test]
  fn detects_chain_ending_before_the_break() {
    let mut heap = heap();
    heap.allocate(100).unwrap();
    let b = heap.allocate(100).unwrap();
    let (_, high) = heap.bounds();
    // A stray epilog where b's header was.
    heap.set_epilog(b.offset() - WORD);

    assert_eq!(
      heap.audit(),
      vec![
        Finding::Tiling {
          end: b.offset() - WORD,
          epilog: high - WORD
        },
        Finding::Unindexed { chain: 0, indexed: 1 },
      ]
    );
  }

  #[test]
  fn double_free_leaves_heap_consistent() {
    let mut heap = heap();
    let a = heap.allocate(48).unwrap();
    heap.allocate(48).unwrap();
    heap.free(Some(a));
    heap.free(Some(a));
    heap.free(Payload::from_offset(a.offset() + 3));
    assert!(heap.check());
  }
}
