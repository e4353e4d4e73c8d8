//! Fixed-size slabs carved out of single pages, and the per-size-class pools
//! that link the slabs with free slots.
//!
//! Pool links are `SubpageRef`s (chunk id + page index) stored inside the
//! subpages themselves, so the pools live next to the chunk slab instead of
//! holding references into it.

use crate::chunk::{ChunkId, Chunks};
use crate::error::{Result, Violation};
use crate::handle::Handle;
use crate::size_class::{Geometry, NUM_TINY_CLASSES, TINY_LIMIT};

/// Smallest element size; a page never needs more bitmap bits than `page_size / 16`.
const MIN_ELEM_SIZE: usize = 16;

// =============================================================================
// Subpage
// =============================================================================

/// Address of a subpage: the page index inside its chunk.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct SubpageRef {
  pub chunk: ChunkId,
  pub page: usize,
}

/// What a slot release did to its subpage.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) enum SlotRelease {
  /// Was full, has a free slot again: must rejoin its pool.
  Available,
  /// Still has live slots.
  InUse,
  /// Every slot is free.
  Empty,
}

pub(crate) struct Subpage {
  memory_map_idx: usize,
  run_offset: usize,
  page_size: usize,
  elem_size: usize,
  max_num_elems: usize,
  num_avail: usize,
  next_avail: Option<usize>,
  bitmap: Box<[u64]>,
  bitmap_len: usize,
  /// False once the page has been handed back to the chunk's tree.
  do_not_destroy: bool,
  in_pool: bool,
  prev: Option<SubpageRef>,
  next: Option<SubpageRef>,
}

impl Subpage {
  pub(crate) fn new(memory_map_idx: usize, run_offset: usize, page_size: usize, elem_size: usize) -> Self {
    let mut subpage = Self {
      memory_map_idx,
      run_offset,
      page_size,
      elem_size: 0,
      max_num_elems: 0,
      num_avail: 0,
      next_avail: None,
      bitmap: vec![0u64; page_size / MIN_ELEM_SIZE / 64].into_boxed_slice(),
      bitmap_len: 0,
      do_not_destroy: false,
      in_pool: false,
      prev: None,
      next: None,
    };
    subpage.init(elem_size);
    subpage
  }

  /// (Re)carves the page into `elem_size` slots, all free.
  pub(crate) fn init(&mut self, elem_size: usize) {
    debug_assert!(!self.in_pool, "reinitializing a pooled subpage");
    debug_assert!(elem_size >= MIN_ELEM_SIZE && elem_size < self.page_size);
    self.do_not_destroy = true;
    self.elem_size = elem_size;
    self.max_num_elems = self.page_size / elem_size;
    self.num_avail = self.max_num_elems;
    self.next_avail = Some(0);
    self.bitmap_len = self.max_num_elems.div_ceil(64);
    self.bitmap[..self.bitmap_len].fill(0);
    self.prev = None;
    self.next = None;
  }

  /// Takes one free slot. `None` when the page is exhausted or retired.
  pub(crate) fn allocate(&mut self) -> Option<usize> {
    if self.num_avail == 0 || !self.do_not_destroy {
      return None;
    }
    let bitmap_idx = match self.next_avail.take() {
      Some(idx) => idx,
      None => self.find_next_avail()?,
    };
    let (q, r) = (bitmap_idx >> 6, bitmap_idx & 63);
    debug_assert!(self.bitmap[q] >> r & 1 == 0);
    self.bitmap[q] |= 1 << r;
    self.num_avail -= 1;
    Some(bitmap_idx)
  }

  /// Releases slot `bitmap_idx`, checking it belongs to a live `elem_size` reservation.
  pub(crate) fn free(&mut self, bitmap_idx: usize, elem_size: usize) -> Result<SlotRelease> {
    let page = self.page_idx();
    if !self.do_not_destroy {
      return Err(Violation::SubpageInactive { page }.into());
    }
    if elem_size != self.elem_size {
      return Err(
        Violation::SizeMismatch {
          expected: self.elem_size,
          actual: elem_size,
        }
        .into(),
      );
    }
    let (q, r) = (bitmap_idx >> 6, bitmap_idx & 63);
    if bitmap_idx >= self.max_num_elems || self.bitmap[q] >> r & 1 == 0 {
      return Err(
        Violation::SlotNotAllocated {
          page,
          slot: bitmap_idx,
        }
        .into(),
      );
    }

    self.bitmap[q] ^= 1 << r;
    self.next_avail = Some(bitmap_idx);
    let was_full = self.num_avail == 0;
    self.num_avail += 1;

    Ok(if was_full {
      SlotRelease::Available
    } else if self.num_avail == self.max_num_elems {
      SlotRelease::Empty
    } else {
      SlotRelease::InUse
    })
  }

  /// Marks the page as handed back to the tree.
  pub(crate) fn retire(&mut self) {
    debug_assert!(!self.in_pool);
    self.do_not_destroy = false;
  }

  fn find_next_avail(&self) -> Option<usize> {
    self.bitmap[..self.bitmap_len]
      .iter()
      .enumerate()
      .find(|&(_, &bits)| !bits != 0)
      .map(|(i, &bits)| (i << 6) | (!bits).trailing_zeros() as usize)
      .filter(|&idx| idx < self.max_num_elems)
  }

  #[inline]
  pub(crate) fn handle(&self, bitmap_idx: usize) -> Handle {
    Handle::subpage(self.memory_map_idx, bitmap_idx)
  }

  #[inline]
  fn page_idx(&self) -> usize {
    self.run_offset / self.page_size
  }

  #[inline]
  pub(crate) fn elem_size(&self) -> usize {
    self.elem_size
  }

  #[inline]
  pub(crate) fn max_num_elems(&self) -> usize {
    self.max_num_elems
  }

  #[inline]
  pub(crate) fn num_avail(&self) -> usize {
    self.num_avail
  }

  #[inline]
  pub(crate) fn is_active(&self) -> bool {
    self.do_not_destroy
  }

  #[inline]
  pub(crate) fn in_pool(&self) -> bool {
    self.in_pool
  }

  #[inline]
  pub(crate) fn page_size(&self) -> usize {
    self.page_size
  }
}

// =============================================================================
// Pools
// =============================================================================

/// Head of one size class's list of subpages that still have free slots.
#[derive(Clone, Copy, Default, Debug)]
struct SubpagePool {
  head: Option<SubpageRef>,
  len: usize,
}

/// One pool per tiny and small size class.
pub(crate) struct SubpagePools {
  tiny: Box<[SubpagePool]>,
  small: Box<[SubpagePool]>,
}

impl SubpagePools {
  pub(crate) fn new(geometry: &Geometry) -> Self {
    Self {
      tiny: vec![SubpagePool::default(); NUM_TINY_CLASSES].into_boxed_slice(),
      small: vec![SubpagePool::default(); geometry.num_small_classes()].into_boxed_slice(),
    }
  }

  fn pool(&self, elem_size: usize) -> &SubpagePool {
    if elem_size < TINY_LIMIT {
      &self.tiny[Geometry::tiny_idx(elem_size)]
    } else {
      &self.small[Geometry::small_idx(elem_size)]
    }
  }

  fn pool_mut(&mut self, elem_size: usize) -> &mut SubpagePool {
    if elem_size < TINY_LIMIT {
      &mut self.tiny[Geometry::tiny_idx(elem_size)]
    } else {
      &mut self.small[Geometry::small_idx(elem_size)]
    }
  }

  /// First subpage of the class with a free slot.
  #[inline]
  pub(crate) fn head(&self, elem_size: usize) -> Option<SubpageRef> {
    self.pool(elem_size).head
  }

  /// True when `subpage` is the only member of its class's pool.
  ///
  /// The pools are only reachable through the arena state, which only exists
  /// behind the arena lock; the answer cannot change under the caller.
  pub(crate) fn is_sole(&self, subpage: SubpageRef, elem_size: usize) -> bool {
    let pool = self.pool(elem_size);
    pool.len == 1 && pool.head == Some(subpage)
  }

  /// Pushes `r` at the front of its class's pool.
  pub(crate) fn link(&mut self, chunks: &mut Chunks, r: SubpageRef) -> Result<()> {
    let elem_size = {
      let subpage = chunks.subpage_mut(r)?;
      if subpage.in_pool {
        return Err(Violation::Corrupted("subpage linked twice into its pool").into());
      }
      subpage.elem_size
    };
    let old_head = self.pool(elem_size).head;
    {
      let subpage = chunks.subpage_mut(r)?;
      subpage.in_pool = true;
      subpage.prev = None;
      subpage.next = old_head;
    }
    if let Some(old) = old_head {
      chunks.subpage_mut(old)?.prev = Some(r);
    }
    let pool = self.pool_mut(elem_size);
    pool.head = Some(r);
    pool.len += 1;
    Ok(())
  }

  /// Removes `r` from its class's pool.
  pub(crate) fn unlink(&mut self, chunks: &mut Chunks, r: SubpageRef) -> Result<()> {
    let (elem_size, prev, next) = {
      let subpage = chunks.subpage_mut(r)?;
      if !subpage.in_pool {
        return Err(Violation::Corrupted("unlinking a subpage that is not pooled").into());
      }
      subpage.in_pool = false;
      (
        subpage.elem_size,
        subpage.prev.take(),
        subpage.next.take(),
      )
    };
    match prev {
      Some(p) => chunks.subpage_mut(p)?.next = next,
      None => self.pool_mut(elem_size).head = next,
    }
    if let Some(n) = next {
      chunks.subpage_mut(n)?.prev = prev;
    }
    self.pool_mut(elem_size).len -= 1;
    Ok(())
  }

  /// Pool members of one class, head first.
  pub(crate) fn members(&self, chunks: &Chunks, elem_size: usize) -> Vec<SubpageRef> {
    let mut out = Vec::with_capacity(self.pool(elem_size).len);
    let mut cur = self.pool(elem_size).head;
    while let Some(r) = cur {
      out.push(r);
      cur = chunks.subpage(r).and_then(|s| s.next);
    }
    out
  }

  /// Element sizes of every class, tiny first.
  pub(crate) fn classes(&self) -> impl Iterator<Item = usize> + '_ {
    let tiny = (1..self.tiny.len()).map(|i| i * crate::size_class::TINY_QUANTUM);
    let small = (0..self.small.len()).map(|i| TINY_LIMIT << i);
    tiny.chain(small)
  }

  pub(crate) fn pooled_count(&self, elem_size: usize) -> usize {
    self.pool(elem_size).len
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::error::Error;

  const PAGE: usize = 8192;

  #[test]
  fn fresh_subpage_hands_out_every_slot_once() {
    let mut s = Subpage::new(2048, 0, PAGE, 1024);
    assert_eq!(s.max_num_elems(), 8);
    let mut seen = Vec::new();
    while let Some(idx) = s.allocate() {
      seen.push(idx);
    }
    seen.sort_unstable();
    assert_eq!(seen, (0..8).collect::<Vec<_>>());
    assert_eq!(s.num_avail(), 0);
  }

  #[test]
  fn exhausted_subpage_recovers_after_free() {
    let mut s = Subpage::new(2048, 0, PAGE, 16);
    for _ in 0..s.max_num_elems() {
      assert!(s.allocate().is_some());
    }
    assert_eq!(s.allocate(), None);
    assert_eq!(s.free(77, 16), Ok(SlotRelease::Available));
    assert_eq!(s.allocate(), Some(77));
    assert_eq!(s.allocate(), None);
  }

  #[test]
  fn free_reports_transitions() {
    let mut s = Subpage::new(2048, 0, PAGE, 2048);
    let a = s.allocate().unwrap();
    let b = s.allocate().unwrap();
    let c = s.allocate().unwrap();
    assert_eq!(s.free(b, 2048), Ok(SlotRelease::InUse));
    assert_eq!(s.free(a, 2048), Ok(SlotRelease::InUse));
    assert_eq!(s.free(c, 2048), Ok(SlotRelease::Empty));
  }

  #[test]
  fn bitmap_scan_finds_holes_past_first_word() {
    let mut s = Subpage::new(2048, 0, PAGE, 16);
    let all: Vec<_> = (0..s.max_num_elems()).map(|_| s.allocate().unwrap()).collect();
    assert_eq!(all.len(), 512);
    s.free(300, 16).unwrap();
    s.free(5, 16).unwrap();
    // hint holds 5, the scan must then find 300
    assert_eq!(s.allocate(), Some(5));
    assert_eq!(s.allocate(), Some(300));
  }

  #[test]
  fn double_free_and_size_mismatch_are_rejected() {
    let mut s = Subpage::new(2049, PAGE, PAGE, 64);
    let idx = s.allocate().unwrap();
    assert!(matches!(
      s.free(idx, 32),
      Err(Error::InvariantViolation(Violation::SizeMismatch {
        expected: 64,
        actual: 32
      }))
    ));
    s.free(idx, 64).unwrap();
    assert!(matches!(
      s.free(idx, 64),
      Err(Error::InvariantViolation(Violation::SlotNotAllocated { page: 1, slot: 0 }))
    ));
    assert!(matches!(
      s.free(500, 64),
      Err(Error::InvariantViolation(Violation::SlotNotAllocated { .. }))
    ));
  }

  #[test]
  fn retired_subpage_refuses_work_until_reinit() {
    let mut s = Subpage::new(2048, 0, PAGE, 512);
    s.retire();
    assert!(!s.is_active());
    assert_eq!(s.allocate(), None);
    s.init(256);
    assert!(s.is_active());
    assert_eq!(s.max_num_elems(), 32);
    assert_eq!(s.allocate(), Some(0));
  }

  #[test]
  fn handle_points_at_page_and_slot() {
    let mut s = Subpage::new(2050, 2 * PAGE, PAGE, 128);
    let idx = s.allocate().unwrap();
    let h = s.handle(idx);
    assert!(h.is_subpage());
    assert_eq!(h.memory_map_idx(), 2050);
    assert_eq!(h.bitmap_idx(), idx);
  }
}
