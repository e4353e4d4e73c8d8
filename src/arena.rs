//! An arena owns a set of chunks, their usage bands and the subpage pools,
//! all behind one lock. Threads are spread over several arenas so the lock is
//! rarely contended; thread caches skip it entirely on hits.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use parking_lot::Mutex;

use crate::buf::PooledBuf;
use crate::chunk::{Chunk, ChunkId, Chunks};
use crate::chunk_list::{Band, ChunkLists, Settled};
use crate::config::MemoryMode;
use crate::error::{Error, Result, Violation};
use crate::handle::Handle;
use crate::memory::{self, ChunkMemory};
use crate::metrics::{ArenaMetrics, ChunkListMetrics, ChunkMetrics, SizeClassCounts, SubpageMetrics};
use crate::size_class::{Geometry, SizeClass};
use crate::subpage::{SlotRelease, SubpagePools, SubpageRef};
use crate::thread_cache::ThreadCache;

/// Process-wide arena ids, so a region can never be released into an arena
/// (of any allocator) that did not hand it out.
static NEXT_ARENA_ID: AtomicU64 = AtomicU64::new(1);

// =============================================================================
// Region
// =============================================================================

/// Which chunk a region lives in.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ChunkRef {
  Pooled(ChunkId),
  /// Dedicated block sized to a huge request; released when the region drops.
  Unpooled,
}

/// One live reservation: the byte range `offset..offset + length` of
/// `memory`, owned exclusively by whoever holds this value.
///
/// Not `Clone`: giving a region back to its arena consumes it, so the same
/// reservation cannot be released twice through safe code.
pub struct Region {
  arena_id: u64,
  arena_index: usize,
  chunk: ChunkRef,
  memory: Arc<ChunkMemory>,
  handle: Handle,
  offset: usize,
  length: usize,
}

impl Region {
  #[inline]
  pub fn chunk(&self) -> ChunkRef {
    self.chunk
  }

  #[inline]
  pub fn handle(&self) -> Handle {
    self.handle
  }

  #[inline]
  pub fn offset(&self) -> usize {
    self.offset
  }

  /// Normalized capacity; the size class the region is released under.
  #[inline]
  pub fn length(&self) -> usize {
    self.length
  }

  #[inline]
  pub fn memory(&self) -> &Arc<ChunkMemory> {
    &self.memory
  }

  #[inline]
  pub fn arena_index(&self) -> usize {
    self.arena_index
  }

  #[inline]
  pub(crate) fn arena_id(&self) -> u64 {
    self.arena_id
  }
}

impl core::fmt::Debug for Region {
  fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
    f.debug_struct("Region")
      .field("arena", &self.arena_index)
      .field("chunk", &self.chunk)
      .field("handle", &self.handle)
      .field("offset", &self.offset)
      .field("length", &self.length)
      .finish()
  }
}

// =============================================================================
// Counters
// =============================================================================

#[derive(Default)]
struct ClassCounters {
  tiny: AtomicU64,
  small: AtomicU64,
  normal: AtomicU64,
  huge: AtomicU64,
}

impl ClassCounters {
  #[inline]
  fn record(&self, class: SizeClass) {
    let counter = match class {
      SizeClass::Tiny => &self.tiny,
      SizeClass::Small => &self.small,
      SizeClass::Normal => &self.normal,
      SizeClass::Huge => &self.huge,
    };
    counter.fetch_add(1, Ordering::Relaxed);
  }

  fn snapshot(&self) -> SizeClassCounts {
    SizeClassCounts {
      tiny: self.tiny.load(Ordering::Relaxed),
      small: self.small.load(Ordering::Relaxed),
      normal: self.normal.load(Ordering::Relaxed),
      huge: self.huge.load(Ordering::Relaxed),
    }
  }
}

// =============================================================================
// Locked state
// =============================================================================

/// Everything the arena lock guards. Only reachable through the guard, so
/// every method here runs with the lock held.
pub(crate) struct ArenaState {
  chunks: Chunks,
  lists: ChunkLists,
  pools: SubpagePools,
}

impl ArenaState {
  fn new(geometry: &Geometry) -> Self {
    Self {
      chunks: Chunks::default(),
      lists: ChunkLists::default(),
      pools: SubpagePools::new(geometry),
    }
  }

  /// Takes a slot from the first pooled subpage of the class, if any.
  fn allocate_from_pool(&mut self, norm_capacity: usize) -> Result<Option<(ChunkId, Handle)>> {
    let Some(r) = self.pools.head(norm_capacity) else {
      return Ok(None);
    };
    let subpage = self.chunks.subpage_mut(r)?;
    let bitmap_idx = subpage
      .allocate()
      .ok_or(Violation::Corrupted("pooled subpage has no free slot"))?;
    let handle = subpage.handle(bitmap_idx);
    if subpage.num_avail() == 0 {
      self.pools.unlink(&mut self.chunks, r)?;
    }
    Ok(Some((r.chunk, handle)))
  }

  /// Carves `norm_capacity` bytes (a run, or a fresh page for a subpage) out
  /// of the banded chunks, creating a chunk when none has room.
  fn allocate_normal(
    &mut self,
    geometry: Geometry,
    mode: MemoryMode,
    norm_capacity: usize,
  ) -> Result<(ChunkId, Handle, bool)> {
    for band in Band::ALLOCATION_ORDER {
      if let Some((id, handle)) = self.lists.allocate(band, &mut self.chunks, norm_capacity) {
        self.pool_fresh_subpage(id, handle)?;
        return Ok((id, handle, false));
      }
    }

    let memory = ChunkMemory::allocate(mode, geometry.chunk_size())?;
    let mut chunk = Chunk::new(geometry, Arc::new(memory));
    let handle = chunk
      .allocate(norm_capacity)
      .ok_or(Violation::Corrupted("fresh chunk refused an allocation"))?;
    let id = self.chunks.insert(chunk);
    self.lists.add(&mut self.chunks, Band::Init, id);
    self.pool_fresh_subpage(id, handle)?;
    Ok((id, handle, true))
  }

  /// A page just turned into a subpage joins its class's pool while it has
  /// free slots left.
  fn pool_fresh_subpage(&mut self, id: ChunkId, handle: Handle) -> Result<()> {
    if !handle.is_subpage() {
      return Ok(());
    }
    let chunk = self.chunks.expect_mut(id)?;
    let page = chunk.subpage_for(handle)?;
    let has_room = chunk.subpage(page).is_some_and(|s| s.num_avail() > 0);
    if has_room {
      self.pools.link(&mut self.chunks, SubpageRef { chunk: id, page })?;
    }
    Ok(())
  }

  /// Releases one reservation. Returns the chunk when the free emptied it
  /// out of the lowest band; the caller drops it after unlocking.
  fn free(&mut self, id: ChunkId, handle: Handle, norm_capacity: usize) -> Result<Option<Chunk>> {
    let chunk = self.chunks.expect_mut(id)?;
    if handle.is_subpage() {
      let page = chunk.subpage_for(handle)?;
      let r = SubpageRef { chunk: id, page };
      let release = chunk
        .subpage_mut(page)
        .ok_or(Violation::SubpageInactive { page })?
        .free(handle.bitmap_idx(), norm_capacity)?;
      match release {
        SlotRelease::InUse => return Ok(None),
        SlotRelease::Available => {
          self.pools.link(&mut self.chunks, r)?;
          return Ok(None);
        }
        // Keep the last subpage of a class resident so alternating
        // alloc/free of one element does not re-carve a page every time.
        SlotRelease::Empty if self.pools.is_sole(r, norm_capacity) => return Ok(None),
        SlotRelease::Empty => {
          self.pools.unlink(&mut self.chunks, r)?;
          let chunk = self.chunks.expect_mut(id)?;
          if let Some(subpage) = chunk.subpage_mut(page) {
            subpage.retire();
          }
          chunk.release_page(page);
        }
      }
    } else {
      chunk.free_run(id, handle, norm_capacity)?;
    }

    match self.lists.settle_after_free(&mut self.chunks, id) {
      Settled::Evicted => Ok(self.chunks.remove(id)),
      Settled::Stayed | Settled::Moved(_) => Ok(None),
    }
  }
}

// =============================================================================
// Arena
// =============================================================================

pub struct Arena {
  id: u64,
  index: usize,
  geometry: Geometry,
  mode: MemoryMode,
  state: Mutex<ArenaState>,

  allocations: ClassCounters,
  deallocations: ClassCounters,
  huge_active_bytes: AtomicUsize,
  num_thread_caches: AtomicUsize,
}

impl Arena {
  pub(crate) fn new(index: usize, geometry: Geometry, mode: MemoryMode) -> Self {
    Self {
      id: NEXT_ARENA_ID.fetch_add(1, Ordering::Relaxed),
      index,
      geometry,
      mode,
      state: Mutex::new(ArenaState::new(&geometry)),
      allocations: ClassCounters::default(),
      deallocations: ClassCounters::default(),
      huge_active_bytes: AtomicUsize::new(0),
      num_thread_caches: AtomicUsize::new(0),
    }
  }

  #[inline]
  pub fn index(&self) -> usize {
    self.index
  }

  #[inline]
  pub(crate) fn id(&self) -> u64 {
    self.id
  }

  #[inline]
  pub fn geometry(&self) -> &Geometry {
    &self.geometry
  }

  #[inline]
  pub fn num_thread_caches(&self) -> usize {
    self.num_thread_caches.load(Ordering::Relaxed)
  }

  #[inline]
  pub(crate) fn thread_cache_bound(&self) {
    self.num_thread_caches.fetch_add(1, Ordering::Relaxed);
  }

  #[inline]
  pub(crate) fn thread_cache_released(&self) {
    self.num_thread_caches.fetch_sub(1, Ordering::Relaxed);
  }

  // ---------------------------------------------------------------------------
  // Allocation
  // ---------------------------------------------------------------------------

  /// Reserves a region for `req_capacity` bytes.
  ///
  /// `cache` is consulted only if it is bound to this arena. Huge requests
  /// get a dedicated block and never touch the pools.
  pub fn allocate(
    &self,
    cache: Option<&mut ThreadCache>,
    req_capacity: usize,
    max_capacity: usize,
  ) -> Result<Region> {
    if req_capacity == 0 {
      return Err(Error::invalid("capacity", "must be at least one byte"));
    }
    if req_capacity > max_capacity {
      return Err(Error::invalid(
        "capacity",
        format!("{req_capacity} exceeds the maximum capacity {max_capacity}"),
      ));
    }

    let norm_capacity = self.geometry.normalize(req_capacity);
    let class = self.geometry.classify(norm_capacity);
    if class == SizeClass::Huge {
      return self.allocate_huge(req_capacity);
    }

    if let Some(cache) = cache.filter(|c| c.arena_id() == self.id)
      && let Some(region) = cache.allocate(norm_capacity)
    {
      self.allocations.record(class);
      return Ok(region);
    }

    let (id, handle, memory) = {
      let mut state = self.state.lock();
      let pooled = if class.is_subpage() {
        state.allocate_from_pool(norm_capacity)?
      } else {
        None
      };
      let (id, handle) = match pooled {
        Some(found) => found,
        None => {
          let (id, handle, created) = state.allocate_normal(self.geometry, self.mode, norm_capacity)?;
          if created {
            log::debug!(
              "arena {}: created chunk {id:?} ({} chunks)",
              self.index,
              state.chunks.len()
            );
          }
          (id, handle)
        }
      };
      let memory = Arc::clone(state.chunks.expect_mut(id)?.memory());
      (id, handle, memory)
    };

    self.allocations.record(class);
    Ok(Region {
      arena_id: self.id,
      arena_index: self.index,
      chunk: ChunkRef::Pooled(id),
      memory,
      handle,
      offset: self.geometry.region_offset(handle, norm_capacity),
      length: norm_capacity,
    })
  }

  fn allocate_huge(&self, req_capacity: usize) -> Result<Region> {
    let memory = ChunkMemory::allocate(self.mode, req_capacity)?;
    self.huge_active_bytes.fetch_add(req_capacity, Ordering::Relaxed);
    self.allocations.record(SizeClass::Huge);
    log::trace!("arena {}: unpooled allocation of {req_capacity} bytes", self.index);
    Ok(Region {
      arena_id: self.id,
      arena_index: self.index,
      chunk: ChunkRef::Unpooled,
      memory: Arc::new(memory),
      handle: Handle::UNPOOLED,
      offset: 0,
      length: req_capacity,
    })
  }

  // ---------------------------------------------------------------------------
  // Release
  // ---------------------------------------------------------------------------

  /// Gives a region back. Pooled regions go to `cache` first when it is bound
  /// to this arena; the locked path only runs when the cache is full (or
  /// absent, e.g. for frees from another thread).
  pub fn free(&self, region: Region, cache: Option<&mut ThreadCache>) -> Result<()> {
    self.check_owner(&region)?;
    let class = self.geometry.classify(region.length);
    if region.chunk == ChunkRef::Unpooled {
      self.huge_active_bytes.fetch_sub(region.length, Ordering::Relaxed);
      self.deallocations.record(SizeClass::Huge);
      log::trace!("arena {}: released unpooled {} bytes", self.index, region.length);
      return Ok(());
    }

    let region = match cache.filter(|c| c.arena_id() == self.id) {
      Some(cache) => match cache.add(region) {
        Ok(()) => {
          self.deallocations.record(class);
          return Ok(());
        }
        Err(region) => region,
      },
      None => region,
    };
    self.free_regions(std::iter::once(region))?;
    self.deallocations.record(class);
    Ok(())
  }

  /// Releases regions to their chunks under a single lock acquisition. Chunks
  /// emptied along the way are dropped after the lock is released.
  ///
  /// Every region is attempted; the first failure is returned.
  pub(crate) fn free_regions<I>(&self, regions: I) -> Result<()>
  where
    I: IntoIterator<Item = Region>,
  {
    let mut destroyed = Vec::new();
    let mut first_err = None;
    {
      let mut state = self.state.lock();
      for region in regions {
        let outcome = match (self.check_owner(&region), region.chunk) {
          (Err(e), _) => Err(e),
          (Ok(()), ChunkRef::Unpooled) => Ok(None),
          (Ok(()), ChunkRef::Pooled(id)) => state.free(id, region.handle, region.length),
        };
        match outcome {
          Ok(Some(chunk)) => destroyed.push(chunk),
          Ok(None) => {}
          Err(e) => {
            first_err.get_or_insert(e);
          }
        }
      }
    }

    if !destroyed.is_empty() {
      log::debug!("arena {}: destroyed {} empty chunk(s)", self.index, destroyed.len());
    }
    drop(destroyed);
    first_err.map_or(Ok(()), Err)
  }

  fn check_owner(&self, region: &Region) -> Result<()> {
    if region.arena_id != self.id {
      return Err(
        Violation::ForeignRegion {
          owner: region.arena_id,
          arena: self.id,
        }
        .into(),
      );
    }
    Ok(())
  }

  // ---------------------------------------------------------------------------
  // Reallocation
  // ---------------------------------------------------------------------------

  /// Moves `buf` to a region of `new_capacity` bytes, keeping the readable
  /// bytes that still fit. Returns the old region when `free_old` is false.
  pub fn reallocate(
    &self,
    cache: Option<&mut ThreadCache>,
    buf: &mut PooledBuf,
    new_capacity: usize,
    free_old: bool,
  ) -> Result<Option<Region>> {
    self.check_owner(buf.region())?;
    if new_capacity == 0 || new_capacity > buf.max_capacity() {
      return Err(Error::invalid(
        "capacity",
        format!(
          "{new_capacity} is outside 1..={} for this buffer",
          buf.max_capacity()
        ),
      ));
    }
    let old_capacity = buf.capacity();
    if new_capacity == old_capacity {
      return Ok(None);
    }

    let mut cache = cache;
    let (mut reader_index, mut writer_index) = (buf.reader_index(), buf.writer_index());
    let region = self.allocate(cache.as_deref_mut(), new_capacity, buf.max_capacity())?;
    {
      let old = buf.region();
      if new_capacity > old_capacity {
        memory::copy(old.memory(), old.offset(), region.memory(), region.offset(), old_capacity);
      } else if reader_index < new_capacity {
        writer_index = writer_index.min(new_capacity);
        memory::copy(
          old.memory(),
          old.offset() + reader_index,
          region.memory(),
          region.offset() + reader_index,
          writer_index - reader_index,
        );
      } else {
        reader_index = new_capacity;
        writer_index = new_capacity;
      }
    }

    let old = buf.replace_region(region, new_capacity, reader_index, writer_index);
    if free_old {
      self.free(old, cache)?;
      Ok(None)
    } else {
      Ok(Some(old))
    }
  }

  // ---------------------------------------------------------------------------
  // Introspection
  // ---------------------------------------------------------------------------

  /// Locked snapshot of the arena's chunks and pools plus its counters.
  pub fn metrics(&self) -> ArenaMetrics {
    let state = self.state.lock();
    let chunk_lists = Band::ALL
      .iter()
      .map(|&band| ChunkListMetrics {
        band,
        min_usage: band.min_usage(),
        max_usage: band.max_usage(),
        chunks: state
          .lists
          .members(&state.chunks, band)
          .into_iter()
          .filter_map(|id| state.chunks.get(id))
          .map(|chunk| ChunkMetrics {
            usage: chunk.usage(),
            chunk_size: chunk.chunk_size(),
            free_bytes: chunk.free_bytes(),
          })
          .collect(),
      })
      .collect();

    let (mut tiny_subpages, mut small_subpages) = (Vec::new(), Vec::new());
    for elem_size in state.pools.classes() {
      let target = if elem_size < crate::size_class::TINY_LIMIT {
        &mut tiny_subpages
      } else {
        &mut small_subpages
      };
      for r in state.pools.members(&state.chunks, elem_size) {
        if let Some(s) = state.chunks.subpage(r) {
          target.push(SubpageMetrics {
            elem_size: s.elem_size(),
            max_num_elems: s.max_num_elems(),
            num_available: s.num_avail(),
            page_size: s.page_size(),
          });
        }
      }
    }

    let mut total_chunk_bytes = 0;
    let mut free_chunk_bytes = 0;
    let mut retained_subpage_bytes = 0;
    for (_, chunk) in state.chunks.iter() {
      total_chunk_bytes += chunk.chunk_size();
      free_chunk_bytes += chunk.free_bytes();
      retained_subpage_bytes += chunk
        .active_subpages()
        .filter(|(_, s)| s.num_avail() == s.max_num_elems())
        .map(|(_, s)| s.page_size())
        .sum::<usize>();
    }
    let num_chunks = state.chunks.len();
    drop(state);

    ArenaMetrics {
      index: self.index,
      num_thread_caches: self.num_thread_caches(),
      allocations: self.allocations.snapshot(),
      deallocations: self.deallocations.snapshot(),
      huge_active_bytes: self.huge_active_bytes.load(Ordering::Relaxed),
      num_chunks,
      total_chunk_bytes,
      free_chunk_bytes,
      retained_subpage_bytes,
      chunk_lists,
      tiny_subpages,
      small_subpages,
    }
  }

  /// Re-checks every chunk tree, band membership and subpage pool.
  pub fn verify(&self) -> Result<()> {
    let state = self.state.lock();
    for (id, chunk) in state.chunks.iter() {
      chunk
        .verify_tree()
        .map_err(|detail| Violation::TreeCorrupted { chunk: id, detail })?;
      let band = chunk.band;
      if !(band.min_usage()..band.max_usage()).contains(&chunk.usage()) {
        return Err(Violation::Corrupted("chunk filed in a band its usage does not match").into());
      }
    }
    let listed: usize = Band::ALL.iter().map(|&b| state.lists.len(b)).sum();
    if listed != state.chunks.len() {
      return Err(Violation::Corrupted("chunk missing from the usage bands").into());
    }

    for elem_size in state.pools.classes() {
      let members = state.pools.members(&state.chunks, elem_size);
      if members.len() != state.pools.pooled_count(elem_size) {
        return Err(Violation::Corrupted("subpage pool length disagrees with its links").into());
      }
      for r in members {
        let subpage = state
          .chunks
          .subpage(r)
          .ok_or(Violation::SubpageInactive { page: r.page })?;
        if !subpage.is_active()
          || !subpage.in_pool()
          || subpage.num_avail() == 0
          || subpage.elem_size() != elem_size
        {
          return Err(Violation::Corrupted("pooled subpage cannot serve its class").into());
        }
      }
    }
    Ok(())
  }
}

impl core::fmt::Debug for Arena {
  fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
    f.debug_struct("Arena")
      .field("index", &self.index)
      .field("geometry", &self.geometry)
      .field("mode", &self.mode)
      .finish_non_exhaustive()
  }
}
