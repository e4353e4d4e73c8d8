use core::fmt;

/// Marks a handle as a subpage slot rather than a whole run.
const SUBPAGE_FLAG: u64 = 1 << 62;
const BITMAP_IDX_MASK: u64 = 0x3FFF_FFFF;
const MEMORY_MAP_IDX_MASK: u64 = 0xFFFF_FFFF;

/// Opaque identifier of one live reservation inside a chunk.
///
/// Layout: `subpage flag (bit 62) | bitmap index (bits 32..62) | memory map index (bits 0..32)`.
/// Run handles carry only the tree node; slot handles also carry the bit in
/// the page's bitmap.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Handle(u64);

impl Handle {
  /// Handle for unpooled regions, which own their whole chunk.
  pub(crate) const UNPOOLED: Handle = Handle(0);

  #[inline]
  pub(crate) const fn run(memory_map_idx: usize) -> Self {
    Self(memory_map_idx as u64 & MEMORY_MAP_IDX_MASK)
  }

  #[inline]
  pub(crate) const fn subpage(memory_map_idx: usize, bitmap_idx: usize) -> Self {
    Self(
      SUBPAGE_FLAG
        | ((bitmap_idx as u64 & BITMAP_IDX_MASK) << 32)
        | (memory_map_idx as u64 & MEMORY_MAP_IDX_MASK),
    )
  }

  #[inline]
  pub const fn is_subpage(self) -> bool {
    self.0 & SUBPAGE_FLAG != 0
  }

  /// Tree node this handle lives under (the page itself for slots).
  #[inline]
  pub const fn memory_map_idx(self) -> usize {
    (self.0 & MEMORY_MAP_IDX_MASK) as usize
  }

  /// Slot within the page. Always 0 for run handles.
  #[inline]
  pub const fn bitmap_idx(self) -> usize {
    ((self.0 >> 32) & BITMAP_IDX_MASK) as usize
  }

  #[inline]
  pub const fn to_bits(self) -> u64 {
    self.0
  }
}

impl fmt::Debug for Handle {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    if self.is_subpage() {
      write!(f, "Handle(node={}, slot={})", self.memory_map_idx(), self.bitmap_idx())
    } else {
      write!(f, "Handle(node={})", self.memory_map_idx())
    }
  }
}
