//! Per-thread front cache of released regions.
//!
//! Each size class gets a FIFO ring. A hit hands a cached region straight
//! back without taking the arena lock; the lock is only taken again to give
//! regions back, on overflow, on trim and when the cache is dropped.

use std::collections::VecDeque;
use std::sync::Arc;

use crate::arena::{Arena, Region};
use crate::config::CacheConfig;
use crate::error::Result;
use crate::size_class::{Geometry, NUM_TINY_CLASSES, SizeClass};

// =============================================================================
// RegionCache
// =============================================================================

/// Fixed-capacity ring of released regions of one size class.
struct RegionCache {
  queue: VecDeque<Region>,
  capacity: usize,
  /// Regions handed out since the last trim, minus regions given back.
  entries_in_use: usize,
  max_entries_in_use: usize,
}

impl RegionCache {
  fn new(capacity: usize) -> Self {
    Self {
      queue: VecDeque::with_capacity(capacity),
      capacity,
      entries_in_use: 0,
      max_entries_in_use: 0,
    }
  }

  fn add(&mut self, region: Region) -> core::result::Result<(), Region> {
    if self.queue.len() >= self.capacity {
      return Err(region);
    }
    self.queue.push_back(region);
    self.entries_in_use = self.entries_in_use.saturating_sub(1);
    Ok(())
  }

  fn allocate(&mut self) -> Option<Region> {
    let region = self.queue.pop_front()?;
    self.entries_in_use += 1;
    self.max_entries_in_use = self.max_entries_in_use.max(self.entries_in_use);
    Some(region)
  }

  /// Removes the oldest regions nobody asked for since the last trim.
  fn trim(&mut self, out: &mut Vec<Region>) {
    let unused = self.queue.len().saturating_sub(self.max_entries_in_use);
    self.entries_in_use = 0;
    self.max_entries_in_use = 0;
    out.extend(self.queue.drain(..unused));
  }

  fn drain(&mut self, out: &mut Vec<Region>) {
    out.extend(self.queue.drain(..));
  }
}

// =============================================================================
// ThreadCache
// =============================================================================

/// Cache of one thread, bound to one arena for its whole life.
pub struct ThreadCache {
  arena: Arc<Arena>,
  geometry: Geometry,
  tiny: Box<[RegionCache]>,
  small: Box<[RegionCache]>,
  normal: Box<[RegionCache]>,
  max_cached_capacity: usize,
  trim_interval: usize,
  allocations: usize,
  hits: u64,
  misses: u64,
}

impl ThreadCache {
  pub(crate) fn new(arena: Arc<Arena>, config: &CacheConfig) -> Self {
    let geometry = *arena.geometry();
    let max_cached_capacity = config.max_cached_buffer_capacity.min(geometry.chunk_size());
    let num_normal = if max_cached_capacity >= geometry.page_size() {
      (max_cached_capacity / geometry.page_size()).ilog2() as usize + 1
    } else {
      0
    };

    let rings = |count: usize, capacity: usize| -> Box<[RegionCache]> {
      (0..count).map(|_| RegionCache::new(capacity)).collect()
    };

    arena.thread_cache_bound();
    log::debug!(
      "thread {:?}: cache bound to arena {}",
      std::thread::current().id(),
      arena.index()
    );
    Self {
      tiny: rings(NUM_TINY_CLASSES, config.tiny_cache_size),
      small: rings(geometry.num_small_classes(), config.small_cache_size),
      normal: rings(num_normal, config.normal_cache_size),
      max_cached_capacity,
      trim_interval: config.trim_interval,
      allocations: 0,
      hits: 0,
      misses: 0,
      geometry,
      arena,
    }
  }

  #[inline]
  pub fn arena(&self) -> &Arc<Arena> {
    &self.arena
  }

  #[inline]
  pub(crate) fn arena_id(&self) -> u64 {
    self.arena.id()
  }

  pub fn hits(&self) -> u64 {
    self.hits
  }

  pub fn misses(&self) -> u64 {
    self.misses
  }

  /// Regions currently parked in the cache.
  pub fn cached_regions(&self) -> usize {
    self
      .tiny
      .iter()
      .chain(self.small.iter())
      .chain(self.normal.iter())
      .map(|c| c.queue.len())
      .sum()
  }

  fn cache_for(&mut self, norm_capacity: usize) -> Option<&mut RegionCache> {
    match self.geometry.classify(norm_capacity) {
      SizeClass::Tiny => self.tiny.get_mut(Geometry::tiny_idx(norm_capacity)),
      SizeClass::Small => self.small.get_mut(Geometry::small_idx(norm_capacity)),
      SizeClass::Normal if norm_capacity <= self.max_cached_capacity => {
        let idx = self.geometry.normal_idx(norm_capacity);
        self.normal.get_mut(idx)
      }
      SizeClass::Normal | SizeClass::Huge => None,
    }
  }

  /// Pops a cached region of exactly `norm_capacity`. Every lookup of a
  /// cacheable class counts towards the next automatic trim.
  pub(crate) fn allocate(&mut self, norm_capacity: usize) -> Option<Region> {
    let region = self.cache_for(norm_capacity)?.allocate();
    match region {
      Some(_) => self.hits += 1,
      None => self.misses += 1,
    }

    self.allocations += 1;
    if self.allocations >= self.trim_interval {
      self.allocations = 0;
      if let Err(e) = self.trim() {
        log::warn!("arena {}: cache trim failed: {e}", self.arena.index());
      }
    }
    region
  }

  /// Parks a released region. Hands it back when its class is not cached or
  /// its ring is full.
  pub(crate) fn add(&mut self, region: Region) -> core::result::Result<(), Region> {
    match self.cache_for(region.length()) {
      Some(cache) => cache.add(region),
      None => Err(region),
    }
  }

  /// Releases every region that sat unused since the previous trim.
  pub fn trim(&mut self) -> Result<()> {
    let mut released = Vec::new();
    for cache in self
      .tiny
      .iter_mut()
      .chain(self.small.iter_mut())
      .chain(self.normal.iter_mut())
    {
      cache.trim(&mut released);
    }
    if released.is_empty() {
      return Ok(());
    }
    log::trace!(
      "arena {}: trimmed {} cached region(s)",
      self.arena.index(),
      released.len()
    );
    self.arena.free_regions(released)
  }

  /// Releases everything the cache holds.
  pub fn drain(&mut self) -> Result<()> {
    let mut released = Vec::new();
    for cache in self
      .tiny
      .iter_mut()
      .chain(self.small.iter_mut())
      .chain(self.normal.iter_mut())
    {
      cache.drain(&mut released);
    }
    if released.is_empty() {
      return Ok(());
    }
    self.arena.free_regions(released)
  }
}

impl Drop for ThreadCache {
  fn drop(&mut self) {
    if let Err(e) = self.drain() {
      log::warn!(
        "arena {}: thread cache flush on drop failed: {e}",
        self.arena.index()
      );
    }
    self.arena.thread_cache_released();
  }
}

impl core::fmt::Debug for ThreadCache {
  fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
    f.debug_struct("ThreadCache")
      .field("arena", &self.arena.index())
      .field("cached_regions", &self.cached_regions())
      .field("hits", &self.hits)
      .field("misses", &self.misses)
      .finish()
  }
}
