//! Top-level pooled allocator: a fixed set of arenas plus one lazily created
//! thread cache per calling thread.

use std::cell::RefCell;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, ThreadId};

use parking_lot::Mutex;
use thread_local::ThreadLocal;

use crate::arena::{Arena, Region};
use crate::buf::PooledBuf;
use crate::config::PoolConfig;
use crate::error::{Error, Result, Violation};
use crate::metrics::{ArenaMetrics, ThreadCacheMetrics};
use crate::size_class::Geometry;
use crate::thread_cache::ThreadCache;

// =============================================================================
// Thread exit
// =============================================================================

/// A thread's cache inside one allocator. `thread_local` hands the slot of an
/// exited thread to the next new thread, so the slot remembers whose cache it
/// holds.
struct CacheSlot {
  owner: ThreadId,
  cache: Option<ThreadCache>,
}

type SharedSlot = Arc<Mutex<CacheSlot>>;

/// Flushes every cache the current thread created when the thread exits.
struct ExitFlush {
  owner: ThreadId,
  slots: RefCell<Vec<Weak<Mutex<CacheSlot>>>>,
}

impl Drop for ExitFlush {
  fn drop(&mut self) {
    for slot in self.slots.get_mut().drain(..) {
      let Some(slot) = slot.upgrade() else {
        continue;
      };
      let cache = {
        let mut slot = slot.lock();
        if slot.owner != self.owner {
          continue;
        }
        slot.cache.take()
      };
      // Dropping the cache drains it into its arena and unbinds it.
      drop(cache);
    }
  }
}

thread_local! {
  static EXIT_FLUSH: ExitFlush = ExitFlush {
    owner: thread::current().id(),
    slots: RefCell::new(Vec::new()),
  };
}

/// Arranges for `slot` to be flushed when the current thread exits. Fails
/// once the thread is already tearing down its locals.
fn flush_on_exit(slot: &SharedSlot) -> bool {
  EXIT_FLUSH
    .try_with(|flush| {
      let mut slots = flush.slots.borrow_mut();
      slots.retain(|s| s.strong_count() > 0);
      slots.push(Arc::downgrade(slot));
    })
    .is_ok()
}

// =============================================================================
// PooledAllocator
// =============================================================================

pub struct PooledAllocator {
  config: PoolConfig,
  geometry: Geometry,
  arenas: Box<[Arc<Arena>]>,
  /// Round-robin cursor for binding new thread caches.
  next_arena: AtomicUsize,
  /// Round-robin cursor for calls that run without a cache.
  next_uncached: AtomicUsize,
  caches: ThreadLocal<SharedSlot>,
}

impl PooledAllocator {
  /// Validates `config` and builds the arenas. Chunks are only created on
  /// first use.
  pub fn new(config: PoolConfig) -> Result<Self> {
    let geometry = config.validate()?;
    let arenas = (0..config.num_arenas)
      .map(|index| Arc::new(Arena::new(index, geometry, config.memory_mode)))
      .collect();
    log::debug!(
      "pool: {} {:?} arenas, page {} B, chunk {} B",
      config.num_arenas,
      config.memory_mode,
      geometry.page_size(),
      geometry.chunk_size()
    );
    Ok(Self {
      config,
      geometry,
      arenas,
      next_arena: AtomicUsize::new(0),
      next_uncached: AtomicUsize::new(0),
      caches: ThreadLocal::new(),
    })
  }

  #[inline]
  pub fn config(&self) -> &PoolConfig {
    &self.config
  }

  #[inline]
  pub fn geometry(&self) -> &Geometry {
    &self.geometry
  }

  #[inline]
  pub fn arenas(&self) -> &[Arc<Arena>] {
    &self.arenas
  }

  fn uncached_arena(&self) -> &Arena {
    let index = self.next_uncached.fetch_add(1, Ordering::Relaxed) % self.arenas.len();
    &self.arenas[index]
  }

  /// Runs `f` with the calling thread's cache and the arena it is bound to.
  /// The cache is created on first use, bound round-robin, and flushed when
  /// the thread exits.
  fn with_cache<R>(&self, f: impl FnOnce(&Arena, Option<&mut ThreadCache>) -> R) -> R {
    let me = thread::current().id();
    let slot = self.caches.get_or(|| {
      Arc::new(Mutex::new(CacheSlot {
        owner: me,
        cache: None,
      }))
    });
    // Re-entered on this thread: take the locked path.
    let Some(mut guard) = slot.try_lock() else {
      return f(self.uncached_arena(), None);
    };

    let mut stale = None;
    if guard.owner != me || guard.cache.is_none() {
      // Only a slot inherited from an exited thread can still hold a cache
      // here; that thread's flush has not run yet.
      stale = guard.cache.take();
      guard.owner = me;
      if flush_on_exit(slot) {
        let index = self.next_arena.fetch_add(1, Ordering::Relaxed) % self.arenas.len();
        guard.cache = Some(ThreadCache::new(
          Arc::clone(&self.arenas[index]),
          &self.config.cache,
        ));
      }
    }

    let result = match guard.cache.as_mut() {
      Some(cache) => {
        let arena = Arc::clone(cache.arena());
        f(&arena, Some(cache))
      }
      None => f(self.uncached_arena(), None),
    };
    drop(guard);
    drop(stale);
    result
  }

  fn arena_of(&self, region: &Region) -> Result<&Arena> {
    let arena: &Arena = self
      .arenas
      .get(region.arena_index())
      .ok_or(Violation::ForeignRegion {
        owner: region.arena_id(),
        arena: 0,
      })?;
    if arena.id() != region.arena_id() {
      return Err(
        Violation::ForeignRegion {
          owner: region.arena_id(),
          arena: arena.id(),
        }
        .into(),
      );
    }
    Ok(arena)
  }

  /// Allocates a buffer of `req_capacity` bytes that may later grow up to
  /// `max_capacity` through [`reallocate`](Self::reallocate).
  pub fn allocate(&self, req_capacity: usize, max_capacity: usize) -> Result<PooledBuf> {
    let region = self.with_cache(|arena, cache| arena.allocate(cache, req_capacity, max_capacity))?;
    Ok(PooledBuf::new(region, req_capacity, max_capacity))
  }

  /// Resizes `buf` within its arena, preserving readable bytes that fit.
  ///
  /// With `free_old == false` the previous region is returned instead of
  /// released; give it back with [`free_region`](Self::free_region).
  pub fn reallocate(
    &self,
    buf: &mut PooledBuf,
    new_capacity: usize,
    free_old: bool,
  ) -> Result<Option<Region>> {
    let arena = self.arena_of(buf.region())?;
    self.with_cache(|_, cache| arena.reallocate(cache, buf, new_capacity, free_old))
  }

  /// Releases `buf`. Frees from the allocating thread go through its cache;
  /// frees from any other thread take the arena lock.
  pub fn free(&self, buf: PooledBuf) -> Result<()> {
    let same_thread = buf.owner_thread() == thread::current().id();
    let region = buf.into_region();
    if same_thread {
      self.free_region(region)
    } else {
      self.arena_of(&region)?.free(region, None)
    }
  }

  /// Releases a bare region, e.g. one returned by [`reallocate`](Self::reallocate).
  pub fn free_region(&self, region: Region) -> Result<()> {
    let arena = self.arena_of(&region)?;
    self.with_cache(|_, cache| arena.free(region, cache))
  }

  /// Trims the calling thread's cache now instead of waiting for the
  /// allocation counter.
  pub fn trim_thread_cache(&self) -> Result<()> {
    let Some(slot) = self.caches.get() else {
      return Ok(());
    };
    let mut slot = slot
      .try_lock()
      .ok_or_else(|| Error::invalid("thread cache", "already in use on this thread"))?;
    if slot.owner != thread::current().id() {
      return Ok(());
    }
    match slot.cache.as_mut() {
      Some(cache) => cache.trim(),
      None => Ok(()),
    }
  }

  /// Empties every thread's cache back into the arenas. Needs exclusive
  /// access, so no thread can be using its cache meanwhile.
  pub fn free_thread_caches(&mut self) -> Result<()> {
    let mut first_err = None;
    for slot in self.caches.iter_mut() {
      if let Some(cache) = slot.lock().cache.as_mut()
        && let Err(e) = cache.drain()
      {
        first_err.get_or_insert(e);
      }
    }
    first_err.map_or(Ok(()), Err)
  }

  pub fn metrics(&self) -> Vec<ArenaMetrics> {
    self.arenas.iter().map(|arena| arena.metrics()).collect()
  }

  /// Counters of the calling thread's cache, if it has one.
  pub fn thread_cache_metrics(&self) -> Option<ThreadCacheMetrics> {
    let slot = self.caches.get()?.try_lock()?;
    if slot.owner != thread::current().id() {
      return None;
    }
    let cache = slot.cache.as_ref()?;
    Some(ThreadCacheMetrics {
      arena_index: cache.arena().index(),
      cached_regions: cache.cached_regions(),
      hits: cache.hits(),
      misses: cache.misses(),
    })
  }

  /// Checks every arena's trees, bands and pools.
  pub fn verify(&self) -> Result<()> {
    self.arenas.iter().try_for_each(|arena| arena.verify())
  }
}

impl core::fmt::Debug for PooledAllocator {
  fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
    f.debug_struct("PooledAllocator")
      .field("geometry", &self.geometry)
      .field("arenas", &self.arenas.len())
      .finish_non_exhaustive()
  }
}
