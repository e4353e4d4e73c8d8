//! Usage-banded chunk lists.
//!
//! Chunks climb to the next band when an allocation pushes their usage to the
//! band's ceiling and sink when a free drops them below its floor. Adjacent
//! bands overlap, so a chunk hovering around one threshold settles in one of
//! them instead of bouncing between lists on every alloc/free.

use core::fmt;

use crate::chunk::{ChunkId, Chunks};
use crate::handle::Handle;

/// One usage band.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum Band {
  /// Freshly created chunks; never destroys.
  Init,
  Q000,
  Q025,
  Q050,
  Q075,
  Q100,
}

impl Band {
  pub const ALL: [Band; 6] = [
    Band::Init,
    Band::Q000,
    Band::Q025,
    Band::Q050,
    Band::Q075,
    Band::Q100,
  ];

  /// Order in which normal allocations probe the bands: partially used chunks
  /// first, fresh ones next, nearly full ones last.
  pub const ALLOCATION_ORDER: [Band; 6] = [
    Band::Q050,
    Band::Q025,
    Band::Q000,
    Band::Init,
    Band::Q075,
    Band::Q100,
  ];

  #[inline]
  const fn index(self) -> usize {
    self as usize
  }

  /// Inclusive floor: a chunk below it sinks.
  pub const fn min_usage(self) -> i32 {
    match self {
      Band::Init => i32::MIN,
      Band::Q000 => 1,
      Band::Q025 => 25,
      Band::Q050 => 50,
      Band::Q075 => 75,
      Band::Q100 => 100,
    }
  }

  /// Exclusive ceiling: a chunk reaching it climbs.
  pub const fn max_usage(self) -> i32 {
    match self {
      Band::Init => 25,
      Band::Q000 => 50,
      Band::Q025 => 75,
      Band::Q050 => 100,
      Band::Q075 => 100,
      Band::Q100 => i32::MAX,
    }
  }

  pub const fn next(self) -> Option<Band> {
    match self {
      Band::Init => Some(Band::Q000),
      Band::Q000 => Some(Band::Q025),
      Band::Q025 => Some(Band::Q050),
      Band::Q050 => Some(Band::Q075),
      Band::Q075 => Some(Band::Q100),
      Band::Q100 => None,
    }
  }

  /// `None` for the bands whose empty chunks are destroyed (or never sink).
  pub const fn prev(self) -> Option<Band> {
    match self {
      Band::Init | Band::Q000 => None,
      Band::Q025 => Some(Band::Q000),
      Band::Q050 => Some(Band::Q025),
      Band::Q075 => Some(Band::Q050),
      Band::Q100 => Some(Band::Q075),
    }
  }
}

impl fmt::Display for Band {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Band::Init => f.write_str("init"),
      Band::Q100 => f.write_str("100%"),
      band => write!(f, "{}~{}%", band.min_usage(), band.max_usage()),
    }
  }
}

/// What a free did to the chunk's band membership.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) enum Settled {
  Stayed,
  Moved(Band),
  /// Usage hit 0 in a band without a predecessor: the caller destroys it.
  Evicted,
}

#[derive(Clone, Copy, Default)]
struct List {
  head: Option<ChunkId>,
  len: usize,
}

/// The six bands of one arena, linked through the chunks' `prev`/`next`.
#[derive(Default)]
pub(crate) struct ChunkLists {
  lists: [List; 6],
}

impl ChunkLists {
  /// Tries every chunk of `band`, head first. On success the chunk climbs if
  /// it reached the band's ceiling.
  pub(crate) fn allocate(
    &mut self,
    band: Band,
    chunks: &mut Chunks,
    norm_capacity: usize,
  ) -> Option<(ChunkId, Handle)> {
    let mut cur = self.lists[band.index()].head;
    while let Some(id) = cur {
      let chunk = chunks.get_mut(id)?;
      match chunk.allocate(norm_capacity) {
        Some(handle) => {
          if chunk.usage() >= band.max_usage() {
            self.remove(chunks, id);
            self.add(chunks, band.next().unwrap_or(band), id);
          }
          return Some((id, handle));
        }
        None => cur = chunk.next,
      }
    }
    None
  }

  /// Inserts `id` at the head of `band`, cascading upward while the chunk
  /// is at or above a band's ceiling.
  pub(crate) fn add(&mut self, chunks: &mut Chunks, mut band: Band, id: ChunkId) {
    let Some(usage) = chunks.get(id).map(|c| c.usage()) else {
      return;
    };
    while usage >= band.max_usage() {
      match band.next() {
        Some(next) => band = next,
        None => break,
      }
    }
    self.push_front(chunks, band, id);
  }

  /// Re-files `id` after a free. Sinks as many bands as the new usage requires.
  pub(crate) fn settle_after_free(&mut self, chunks: &mut Chunks, id: ChunkId) -> Settled {
    let Some(chunk) = chunks.get(id) else {
      return Settled::Stayed;
    };
    let (usage, start) = (chunk.usage(), chunk.band);
    if usage >= start.min_usage() {
      return Settled::Stayed;
    }

    let mut band = start;
    while usage < band.min_usage() {
      match band.prev() {
        Some(prev) => band = prev,
        None => {
          debug_assert_eq!(usage, 0);
          self.remove(chunks, id);
          return Settled::Evicted;
        }
      }
    }
    self.remove(chunks, id);
    self.push_front(chunks, band, id);
    Settled::Moved(band)
  }

  fn push_front(&mut self, chunks: &mut Chunks, band: Band, id: ChunkId) {
    let list = &mut self.lists[band.index()];
    let old_head = list.head.replace(id);
    list.len += 1;
    if let Some(chunk) = chunks.get_mut(id) {
      chunk.band = band;
      chunk.prev = None;
      chunk.next = old_head;
    }
    if let Some(old) = old_head.and_then(|old| chunks.get_mut(old)) {
      old.prev = Some(id);
    }
  }

  /// Unlinks `id` from whatever band it is in.
  pub(crate) fn remove(&mut self, chunks: &mut Chunks, id: ChunkId) {
    let Some(chunk) = chunks.get_mut(id) else {
      return;
    };
    let (band, prev, next) = (chunk.band, chunk.prev.take(), chunk.next.take());
    match prev {
      Some(p) => {
        if let Some(p) = chunks.get_mut(p) {
          p.next = next;
        }
      }
      None => self.lists[band.index()].head = next,
    }
    if let Some(n) = next.and_then(|n| chunks.get_mut(n)) {
      n.prev = prev;
    }
    self.lists[band.index()].len -= 1;
  }

  /// Chunk ids of one band, head first.
  pub(crate) fn members(&self, chunks: &Chunks, band: Band) -> Vec<ChunkId> {
    let mut out = Vec::with_capacity(self.lists[band.index()].len);
    let mut cur = self.lists[band.index()].head;
    while let Some(id) = cur {
      out.push(id);
      cur = chunks.get(id).and_then(|c| c.next);
    }
    out
  }

  pub(crate) fn len(&self, band: Band) -> usize {
    self.lists[band.index()].len
  }
}
