//! Point-in-time snapshots of arena state.

use core::fmt;

use crate::chunk_list::Band;

/// One counter per size class.
#[derive(Clone, Copy, Default, PartialEq, Eq, Debug)]
pub struct SizeClassCounts {
  pub tiny: u64,
  pub small: u64,
  pub normal: u64,
  pub huge: u64,
}

impl SizeClassCounts {
  pub fn total(&self) -> u64 {
    self.tiny + self.small + self.normal + self.huge
  }
}

#[derive(Clone, Debug)]
pub struct SubpageMetrics {
  pub elem_size: usize,
  pub max_num_elems: usize,
  pub num_available: usize,
  pub page_size: usize,
}

#[derive(Clone, Debug)]
pub struct ChunkMetrics {
  /// Percentage in use, 0..=100.
  pub usage: i32,
  pub chunk_size: usize,
  pub free_bytes: usize,
}

#[derive(Clone, Debug)]
pub struct ChunkListMetrics {
  pub band: Band,
  pub min_usage: i32,
  pub max_usage: i32,
  pub chunks: Vec<ChunkMetrics>,
}

#[derive(Clone, Debug)]
pub struct ArenaMetrics {
  pub index: usize,
  pub num_thread_caches: usize,
  pub allocations: SizeClassCounts,
  pub deallocations: SizeClassCounts,
  pub huge_active_bytes: usize,
  pub num_chunks: usize,
  pub total_chunk_bytes: usize,
  pub free_chunk_bytes: usize,
  /// Pages held by empty subpages kept as the last of their class.
  pub retained_subpage_bytes: usize,
  pub chunk_lists: Vec<ChunkListMetrics>,
  /// Pooled subpages (those with a free slot), per tiny class.
  pub tiny_subpages: Vec<SubpageMetrics>,
  pub small_subpages: Vec<SubpageMetrics>,
}

/// Counters of the calling thread's cache.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct ThreadCacheMetrics {
  pub arena_index: usize,
  pub cached_regions: usize,
  pub hits: u64,
  pub misses: u64,
}

impl ArenaMetrics {
  /// Allocations not yet given back, counting regions parked in thread caches
  /// as given back.
  pub fn active_allocations(&self) -> u64 {
    self.allocations.total().saturating_sub(self.deallocations.total())
  }

  /// Pooled bytes neither free in a tree nor retained by an empty subpage.
  pub fn used_chunk_bytes(&self) -> usize {
    self.total_chunk_bytes - self.free_chunk_bytes - self.retained_subpage_bytes
  }
}

impl fmt::Display for SubpageMetrics {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(
      f,
      "{}: {}/{} in use, page {}",
      self.elem_size,
      self.max_num_elems - self.num_available,
      self.max_num_elems,
      self.page_size
    )
  }
}

impl fmt::Display for ArenaMetrics {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    writeln!(
      f,
      "arena {} ({} thread caches, {} chunks, {}/{} bytes free)",
      self.index,
      self.num_thread_caches,
      self.num_chunks,
      self.free_chunk_bytes,
      self.total_chunk_bytes
    )?;
    writeln!(
      f,
      "allocations: tiny {} small {} normal {} huge {} (active {}, huge bytes {})",
      self.allocations.tiny,
      self.allocations.small,
      self.allocations.normal,
      self.allocations.huge,
      self.active_allocations(),
      self.huge_active_bytes
    )?;
    for list in &self.chunk_lists {
      writeln!(f, "chunk(s) at {}:", list.band)?;
      if list.chunks.is_empty() {
        writeln!(f, "  none")?;
      }
      for chunk in &list.chunks {
        writeln!(
          f,
          "  {}%, {}/{} free",
          chunk.usage, chunk.free_bytes, chunk.chunk_size
        )?;
      }
    }
    for (name, subpages) in [("tiny", &self.tiny_subpages), ("small", &self.small_subpages)] {
      writeln!(f, "{name} subpages:")?;
      for s in subpages {
        writeln!(f, "  {s}")?;
      }
    }
    Ok(())
  }
}
