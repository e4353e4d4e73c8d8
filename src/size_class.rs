use crate::error::{Error, Result};
use crate::handle::Handle;

// =============================================================================
// Constants
// =============================================================================

/// Smallest page size the pool accepts.
pub const MIN_PAGE_SIZE: usize = 4096;

/// Deepest buddy tree: `1 << 14` pages per chunk.
pub const MAX_ORDER_LIMIT: u32 = 14;

/// Largest chunk (`page_size << max_order`) the pool accepts.
pub const MAX_CHUNK_SIZE: usize = 512 << 20;

/// Requests below this are "tiny" and rounded to `TINY_QUANTUM`.
pub const TINY_LIMIT: usize = 512;
pub const TINY_QUANTUM: usize = 16;

/// Number of tiny pools/caches (`TINY_LIMIT / TINY_QUANTUM`). Index 0 is the unused zero class.
pub const NUM_TINY_CLASSES: usize = TINY_LIMIT / TINY_QUANTUM;

const _: () = assert!(TINY_LIMIT.is_power_of_two());
const _: () = assert!(MIN_PAGE_SIZE > TINY_LIMIT);
const _: () = assert!(MAX_CHUNK_SIZE.is_power_of_two());

// =============================================================================
// Types
// =============================================================================

/// Size class of a normalized capacity.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum SizeClass {
  /// `< 512`, 16-byte quantum, served by subpages.
  Tiny,
  /// `512..page_size`, powers of two, served by subpages.
  Small,
  /// `page_size..=chunk_size`, powers of two, served by runs of pages.
  Normal,
  /// `> chunk_size`, unpooled.
  Huge,
}

impl SizeClass {
  pub const fn is_subpage(self) -> bool {
    matches!(self, SizeClass::Tiny | SizeClass::Small)
  }
}

/// Page/chunk shape shared by an arena, its chunks and thread caches.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct Geometry {
  page_size: usize,
  page_shifts: u32,
  max_order: u32,
  chunk_size: usize,
}

impl Geometry {
  pub fn new(page_size: usize, max_order: u32) -> Result<Self> {
    if !page_size.is_power_of_two() {
      return Err(Error::invalid(
        "page size",
        format!("{page_size} is not a power of two"),
      ));
    }
    if page_size < MIN_PAGE_SIZE {
      return Err(Error::invalid(
        "page size",
        format!("{page_size} is below the minimum of {MIN_PAGE_SIZE}"),
      ));
    }
    if max_order > MAX_ORDER_LIMIT {
      return Err(Error::invalid(
        "max order",
        format!("{max_order} is outside [0, {MAX_ORDER_LIMIT}]"),
      ));
    }
    if page_size > MAX_CHUNK_SIZE >> max_order {
      return Err(Error::invalid(
        "chunk size",
        format!("{page_size} << {max_order} exceeds {MAX_CHUNK_SIZE}"),
      ));
    }

    Ok(Self {
      page_size,
      page_shifts: page_size.trailing_zeros(),
      max_order,
      chunk_size: page_size << max_order,
    })
  }

  #[inline]
  pub const fn page_size(&self) -> usize {
    self.page_size
  }

  #[inline]
  pub const fn page_shifts(&self) -> u32 {
    self.page_shifts
  }

  #[inline]
  pub const fn max_order(&self) -> u32 {
    self.max_order
  }

  #[inline]
  pub const fn chunk_size(&self) -> usize {
    self.chunk_size
  }

  /// Pages (tree leaves) per chunk.
  #[inline]
  pub const fn pages_per_chunk(&self) -> usize {
    1 << self.max_order
  }

  /// Number of small pools/caches: one per power of two in `512..page_size`.
  #[inline]
  pub const fn num_small_classes(&self) -> usize {
    (self.page_shifts - TINY_LIMIT.trailing_zeros()) as usize
  }

  // ---------------------------------------------------------------------------
  // Normalization
  // ---------------------------------------------------------------------------

  /// Rounds a requested capacity up to its size class.
  ///
  /// Huge requests are returned as-is, tiny ones are rounded to the 16-byte
  /// quantum, everything else to the next power of two.
  pub const fn normalize(&self, req_capacity: usize) -> usize {
    if req_capacity >= self.chunk_size {
      return req_capacity;
    }
    if req_capacity >= TINY_LIMIT {
      return req_capacity.next_power_of_two();
    }
    align_up(req_capacity, TINY_QUANTUM)
  }

  /// Classifies an already normalized capacity.
  pub const fn classify(&self, norm_capacity: usize) -> SizeClass {
    if norm_capacity < TINY_LIMIT {
      SizeClass::Tiny
    } else if norm_capacity < self.page_size {
      SizeClass::Small
    } else if norm_capacity <= self.chunk_size {
      SizeClass::Normal
    } else {
      SizeClass::Huge
    }
  }

  /// Pool/cache index of a tiny class.
  #[inline]
  pub const fn tiny_idx(norm_capacity: usize) -> usize {
    norm_capacity >> TINY_QUANTUM.trailing_zeros()
  }

  /// Pool/cache index of a small class: 512 -> 0, 1024 -> 1, ...
  #[inline]
  pub const fn small_idx(norm_capacity: usize) -> usize {
    (norm_capacity.trailing_zeros() - TINY_LIMIT.trailing_zeros()) as usize
  }

  /// Cache index of a normal class: page -> 0, 2 pages -> 1, ...
  #[inline]
  pub const fn normal_idx(&self, norm_capacity: usize) -> usize {
    (norm_capacity.trailing_zeros() - self.page_shifts) as usize
  }

  /// Tree depth whose nodes span exactly `norm_capacity` bytes.
  #[inline]
  pub const fn run_depth(&self, norm_capacity: usize) -> u32 {
    self.max_order - (norm_capacity.trailing_zeros() - self.page_shifts)
  }

  // ---------------------------------------------------------------------------
  // Node geometry (pure bit arithmetic on the node id)
  // ---------------------------------------------------------------------------

  /// Depth of node `id` in the array-encoded tree (root = 1 at depth 0).
  #[inline]
  pub const fn depth(id: usize) -> u32 {
    usize::BITS - 1 - id.leading_zeros()
  }

  #[inline]
  pub const fn run_length(&self, id: usize) -> usize {
    self.chunk_size >> Self::depth(id)
  }

  #[inline]
  pub const fn run_offset(&self, id: usize) -> usize {
    let depth = Self::depth(id);
    (id ^ (1 << depth)) * (self.chunk_size >> depth)
  }

  /// Index of a leaf among the chunk's pages.
  #[inline]
  pub const fn subpage_idx(&self, id: usize) -> usize {
    id ^ self.pages_per_chunk()
  }

  /// Byte offset of a handle's region inside its chunk.
  pub const fn region_offset(&self, handle: Handle, norm_capacity: usize) -> usize {
    let offset = self.run_offset(handle.memory_map_idx());
    if handle.is_subpage() {
      offset + handle.bitmap_idx() * norm_capacity
    } else {
      offset
    }
  }
}

/// Rounds `x` up to the next multiple of alignment `align`. Alignment must be a power of 2.
#[inline(always)]
const fn align_up(x: usize, align: usize) -> usize {
  let mask = align - 1;
  (x + mask) & !mask
}
