//! A chunk is one contiguous block managed as a complete binary (buddy) tree
//! over its pages.
//!
//! `memory_map[id]` holds the shallowest depth at which a free node can be
//! found in `id`'s subtree: equal to `depth(id)` when the whole subtree is
//! free, `max_order + 1` ("unusable") when nothing below is free. Allocation
//! walks down from the root towards the first node whose value matches the
//! wanted depth, frees walk back up merging fully free buddies.

use std::sync::Arc;

use crate::chunk_list::Band;
use crate::error::{Result, Violation};
use crate::handle::Handle;
use crate::memory::ChunkMemory;
use crate::size_class::Geometry;
use crate::subpage::{Subpage, SubpageRef};

// =============================================================================
// Chunk
// =============================================================================

pub(crate) struct Chunk {
  geometry: Geometry,
  memory: Arc<ChunkMemory>,
  memory_map: Box<[u8]>,
  depth_map: Box<[u8]>,
  /// Nodes handed out by `allocate_node`, to reject frees of anything else.
  allocated: Box<[u64]>,
  subpages: Box<[Option<Subpage>]>,
  unusable: u8,
  free_bytes: usize,

  // Band membership (index-linked list owned by `ChunkLists`).
  pub(crate) band: Band,
  pub(crate) prev: Option<ChunkId>,
  pub(crate) next: Option<ChunkId>,
}

impl Chunk {
  pub(crate) fn new(geometry: Geometry, memory: Arc<ChunkMemory>) -> Self {
    debug_assert_eq!(memory.len(), geometry.chunk_size());
    let max_order = geometry.max_order();
    let nodes = geometry.pages_per_chunk() << 1;

    let mut memory_map = vec![0u8; nodes].into_boxed_slice();
    let mut id = 1;
    for d in 0..=max_order {
      for _ in 0..(1usize << d) {
        memory_map[id] = d as u8;
        id += 1;
      }
    }

    Self {
      geometry,
      memory,
      depth_map: memory_map.clone(),
      memory_map,
      allocated: vec![0u64; nodes.div_ceil(64)].into_boxed_slice(),
      subpages: (0..geometry.pages_per_chunk()).map(|_| None).collect(),
      unusable: max_order as u8 + 1,
      free_bytes: geometry.chunk_size(),
      band: Band::Init,
      prev: None,
      next: None,
    }
  }

  #[inline]
  pub(crate) fn memory(&self) -> &Arc<ChunkMemory> {
    &self.memory
  }

  #[inline]
  pub(crate) fn free_bytes(&self) -> usize {
    self.free_bytes
  }

  #[inline]
  pub(crate) fn chunk_size(&self) -> usize {
    self.geometry.chunk_size()
  }

  /// Percentage of the chunk in use. Only a completely free chunk reports 0
  /// and only a completely full one reports 100.
  pub(crate) fn usage(&self) -> i32 {
    if self.free_bytes == 0 {
      return 100;
    }
    let free_percentage = (self.free_bytes as u128 * 100 / self.chunk_size() as u128) as i32;
    if free_percentage == 0 {
      return 99;
    }
    100 - free_percentage
  }

  /// Reserves a run of pages (`norm_capacity >= page_size`) or one slot of a
  /// subpage. `None` means "this chunk cannot serve it, try the next one".
  pub(crate) fn allocate(&mut self, norm_capacity: usize) -> Option<Handle> {
    let handle = if norm_capacity >= self.geometry.page_size() {
      self.allocate_run(norm_capacity)
    } else {
      self.allocate_subpage(norm_capacity)
    };
    self.check_tree();
    handle
  }

  fn allocate_run(&mut self, norm_capacity: usize) -> Option<Handle> {
    let d = self.geometry.run_depth(norm_capacity) as u8;
    let id = self.allocate_node(d)?;
    self.free_bytes -= self.geometry.run_length(id);
    Some(Handle::run(id))
  }

  fn allocate_subpage(&mut self, norm_capacity: usize) -> Option<Handle> {
    let id = self.allocate_node(self.geometry.max_order() as u8)?;
    let page_size = self.geometry.page_size();
    self.free_bytes -= page_size;

    let run_offset = self.geometry.run_offset(id);
    let subpage_idx = self.geometry.subpage_idx(id);
    let slot = &mut self.subpages[subpage_idx];
    match slot.as_mut() {
      Some(subpage) => subpage.init(norm_capacity),
      None => *slot = Some(Subpage::new(id, run_offset, page_size, norm_capacity)),
    }
    let subpage = slot.as_mut()?;
    let bitmap_idx = subpage.allocate()?;
    Some(subpage.handle(bitmap_idx))
  }

  /// Finds and reserves a free node at depth `d`.
  fn allocate_node(&mut self, d: u8) -> Option<usize> {
    let mut id = 1usize;
    // Zero in the low `d` bits: `id & initial == 0` exactly while depth(id) < d.
    let initial = !((1usize << d) - 1);
    let mut val = self.memory_map[id];
    if val > d {
      return None;
    }
    while val < d || id & initial == 0 {
      id <<= 1;
      val = self.memory_map[id];
      if val > d {
        id ^= 1;
        val = self.memory_map[id];
      }
    }
    debug_assert!(val == d && id & initial == 1 << d);

    self.memory_map[id] = self.unusable;
    self.set_allocated(id, true);
    self.update_parents_alloc(id);
    Some(id)
  }

  fn update_parents_alloc(&mut self, mut id: usize) {
    while id > 1 {
      let parent = id >> 1;
      let val = self.memory_map[id].min(self.memory_map[id ^ 1]);
      self.memory_map[parent] = val;
      id = parent;
    }
  }

  fn update_parents_free(&mut self, mut id: usize) {
    let mut log_child = self.depth_map[id] + 1;
    while id > 1 {
      let parent = id >> 1;
      let (val1, val2) = (self.memory_map[id], self.memory_map[id ^ 1]);
      // depth of `id` and its buddy
      log_child -= 1;
      self.memory_map[parent] = if val1 == log_child && val2 == log_child {
        log_child - 1
      } else {
        val1.min(val2)
      };
      id = parent;
    }
  }

  /// Releases the run `handle` points at. Slot handles are resolved by the
  /// arena first (pool bookkeeping), then land here via `release_page` once
  /// the subpage gives its page back.
  pub(crate) fn free_run(&mut self, id: ChunkId, handle: Handle, norm_capacity: usize) -> Result<()> {
    let node = self.checked_node(handle)?;
    if !self.is_allocated(node) {
      return Err(Violation::NotAllocated { chunk: id, node }.into());
    }
    if self.is_leaf(node) {
      let page = self.geometry.subpage_idx(node);
      if self.subpages[page].as_ref().is_some_and(Subpage::is_active) {
        return Err(Violation::NotAllocated { chunk: id, node }.into());
      }
    }
    let expected = self.geometry.run_length(node);
    if expected != norm_capacity {
      return Err(
        Violation::SizeMismatch {
          expected,
          actual: norm_capacity,
        }
        .into(),
      );
    }
    self.release_node(node);
    Ok(())
  }

  /// Gives a retired subpage's page back to the tree.
  pub(crate) fn release_page(&mut self, page: usize) {
    let node = page | self.geometry.pages_per_chunk();
    debug_assert!(self.subpages[page].as_ref().is_some_and(|s| !s.is_active()));
    self.release_node(node);
  }

  fn release_node(&mut self, node: usize) {
    debug_assert!(self.is_allocated(node));
    self.set_allocated(node, false);
    self.free_bytes += self.geometry.run_length(node);
    self.memory_map[node] = self.depth_map[node];
    self.update_parents_free(node);
    self.check_tree();
  }

  fn checked_node(&self, handle: Handle) -> Result<usize> {
    let node = handle.memory_map_idx();
    if node == 0 || node >= self.memory_map.len() {
      return Err(
        Violation::HandleOutOfRange {
          handle: handle.to_bits(),
        }
        .into(),
      );
    }
    Ok(node)
  }

  #[inline]
  fn is_leaf(&self, node: usize) -> bool {
    node >= self.geometry.pages_per_chunk()
  }

  #[inline]
  fn is_allocated(&self, node: usize) -> bool {
    self.allocated[node >> 6] >> (node & 63) & 1 != 0
  }

  #[inline]
  fn set_allocated(&mut self, node: usize, on: bool) {
    if on {
      self.allocated[node >> 6] |= 1 << (node & 63);
    } else {
      self.allocated[node >> 6] &= !(1 << (node & 63));
    }
  }

  /// Subpage living on the leaf a slot handle points at.
  pub(crate) fn subpage_for(&self, handle: Handle) -> Result<usize> {
    let node = self.checked_node(handle)?;
    if !self.is_leaf(node) {
      return Err(
        Violation::HandleOutOfRange {
          handle: handle.to_bits(),
        }
        .into(),
      );
    }
    Ok(self.geometry.subpage_idx(node))
  }

  #[inline]
  pub(crate) fn subpage(&self, page: usize) -> Option<&Subpage> {
    self.subpages.get(page)?.as_ref()
  }

  #[inline]
  pub(crate) fn subpage_mut(&mut self, page: usize) -> Option<&mut Subpage> {
    self.subpages.get_mut(page)?.as_mut()
  }

  /// Active subpages, by page index.
  pub(crate) fn active_subpages(&self) -> impl Iterator<Item = (usize, &Subpage)> {
    self
      .subpages
      .iter()
      .enumerate()
      .filter_map(|(page, s)| s.as_ref().filter(|s| s.is_active()).map(|s| (page, s)))
  }

  /// Verifies every node against its children and the allocation bitmap.
  pub(crate) fn verify_tree(&self) -> core::result::Result<(), String> {
    let leaves = self.geometry.pages_per_chunk();
    for id in 1..(leaves << 1) {
      let val = self.memory_map[id];
      let depth = self.depth_map[id];
      if self.is_allocated(id) {
        if val != self.unusable {
          return Err(format!("allocated node {id} has value {val}"));
        }
        continue;
      }
      if id >= leaves {
        if val != depth {
          return Err(format!("free leaf {id} has value {val}, depth {depth}"));
        }
        continue;
      }
      let (left, right) = (self.memory_map[id << 1], self.memory_map[(id << 1) | 1]);
      let expected = if left == depth + 1 && right == depth + 1 {
        depth
      } else {
        left.min(right)
      };
      if val != expected {
        return Err(format!(
          "node {id} has value {val}, children {left}/{right} imply {expected}"
        ));
      }
    }

    let used: usize = (1..(leaves << 1))
      .filter(|&id| self.is_allocated(id))
      .map(|id| self.geometry.run_length(id))
      .sum();
    if used + self.free_bytes != self.chunk_size() {
      return Err(format!(
        "free bytes {} + reserved {used} != chunk size {}",
        self.free_bytes,
        self.chunk_size()
      ));
    }
    Ok(())
  }

  #[cfg(feature = "tree-checks")]
  #[inline]
  fn check_tree(&self) {
    if let Err(msg) = self.verify_tree() {
      panic!("buddy tree corrupted: {msg}");
    }
  }

  #[cfg(not(feature = "tree-checks"))]
  #[inline(always)]
  fn check_tree(&self) {}
}

// =============================================================================
// Chunk slab
// =============================================================================

/// Stable address of a chunk inside its arena. The generation makes ids of
/// destroyed chunks unequal to ids of chunks later stored in the same slot.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct ChunkId {
  index: u32,
  generation: u32,
}

struct Slot {
  generation: u32,
  chunk: Option<Chunk>,
}

/// Index-addressed storage for an arena's chunks.
#[derive(Default)]
pub(crate) struct Chunks {
  slots: Vec<Slot>,
  vacant: Vec<u32>,
  live: usize,
}

impl Chunks {
  pub(crate) fn insert(&mut self, chunk: Chunk) -> ChunkId {
    self.live += 1;
    if let Some(index) = self.vacant.pop() {
      let slot = &mut self.slots[index as usize];
      slot.chunk = Some(chunk);
      return ChunkId {
        index,
        generation: slot.generation,
      };
    }
    let index = self.slots.len() as u32;
    self.slots.push(Slot {
      generation: 0,
      chunk: Some(chunk),
    });
    ChunkId {
      index,
      generation: 0,
    }
  }

  pub(crate) fn remove(&mut self, id: ChunkId) -> Option<Chunk> {
    let slot = self.slots.get_mut(id.index as usize)?;
    if slot.generation != id.generation {
      return None;
    }
    let chunk = slot.chunk.take()?;
    slot.generation = slot.generation.wrapping_add(1);
    self.vacant.push(id.index);
    self.live -= 1;
    Some(chunk)
  }

  #[inline]
  pub(crate) fn get(&self, id: ChunkId) -> Option<&Chunk> {
    let slot = self.slots.get(id.index as usize)?;
    if slot.generation != id.generation {
      return None;
    }
    slot.chunk.as_ref()
  }

  #[inline]
  pub(crate) fn get_mut(&mut self, id: ChunkId) -> Option<&mut Chunk> {
    let slot = self.slots.get_mut(id.index as usize)?;
    if slot.generation != id.generation {
      return None;
    }
    slot.chunk.as_mut()
  }

  /// Like `get_mut`, but an unknown id is an invariant violation.
  #[inline]
  pub(crate) fn expect_mut(&mut self, id: ChunkId) -> Result<&mut Chunk> {
    self
      .get_mut(id)
      .ok_or_else(|| Violation::UnknownChunk(id).into())
  }

  #[inline]
  pub(crate) fn subpage(&self, r: SubpageRef) -> Option<&Subpage> {
    self.get(r.chunk)?.subpage(r.page)
  }

  pub(crate) fn subpage_mut(&mut self, r: SubpageRef) -> Result<&mut Subpage> {
    self
      .get_mut(r.chunk)
      .ok_or(Violation::UnknownChunk(r.chunk))?
      .subpage_mut(r.page)
      .ok_or_else(|| Violation::SubpageInactive { page: r.page }.into())
  }

  #[inline]
  pub(crate) fn len(&self) -> usize {
    self.live
  }

  pub(crate) fn iter(&self) -> impl Iterator<Item = (ChunkId, &Chunk)> {
    self.slots.iter().enumerate().filter_map(|(index, slot)| {
      slot.chunk.as_ref().map(|chunk| {
        (
          ChunkId {
            index: index as u32,
            generation: slot.generation,
          },
          chunk,
        )
      })
    })
  }
}
