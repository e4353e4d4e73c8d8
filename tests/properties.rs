mod common;

use std::collections::HashMap;

use chunkpool::{CacheConfig, ChunkId, ChunkRef, Geometry, PooledBuf};
use common::{XorShift64, assert_no_leak, small_pool};

/// Byte ranges of live pooled buffers, per chunk.
fn ranges_by_chunk(live: &[PooledBuf]) -> HashMap<ChunkId, Vec<(usize, usize)>> {
  let mut by_chunk: HashMap<ChunkId, Vec<(usize, usize)>> = HashMap::new();
  for buf in live {
    if let ChunkRef::Pooled(id) = buf.region().chunk() {
      let r = buf.region();
      by_chunk.entry(id).or_default().push((r.offset(), r.offset() + r.length()));
    }
  }
  by_chunk
}

#[test]
fn run_bytes_are_conserved_per_arena() {
  let pool = small_pool(1, CacheConfig::disabled());
  let mut rng = XorShift64::new(0xB0DD_1E5);
  let mut live: Vec<PooledBuf> = Vec::new();

  for _ in 0..2000 {
    if live.len() < 24 && (live.is_empty() || rng.gen_range(0, 2) > 0) {
      let size = rng.gen_range(8192, 65536);
      live.push(pool.allocate(size, size).unwrap());
    } else {
      let idx = rng.gen_range(0, live.len() - 1);
      pool.free(live.swap_remove(idx)).unwrap();
    }

    let m = &pool.metrics()[0];
    let live_bytes: usize = live.iter().map(|b| b.region().length()).sum();
    assert_eq!(m.free_chunk_bytes + live_bytes, m.total_chunk_bytes);
    let per_list: usize = m
      .chunk_lists
      .iter()
      .flat_map(|l| l.chunks.iter())
      .map(|c| c.free_bytes)
      .sum();
    assert_eq!(per_list, m.free_chunk_bytes);
  }

  for buf in live {
    pool.free(buf).unwrap();
  }
  assert_no_leak(&pool.metrics());
}

#[test]
fn trees_stay_consistent_under_mixed_churn() {
  let pool = small_pool(1, CacheConfig::disabled());
  let mut rng = XorShift64::new(0x7EE5);
  let mut live: Vec<PooledBuf> = Vec::new();

  for step in 0..3000 {
    if live.len() < 48 && (live.is_empty() || rng.gen_bool()) {
      let size = match rng.gen_range(0, 3) {
        0 => rng.gen_range(1, 511),
        1 => rng.gen_range(512, 8191),
        _ => rng.gen_range(8192, 131072),
      };
      live.push(pool.allocate(size, size).unwrap());
    } else {
      let idx = rng.gen_range(0, live.len() - 1);
      pool.free(live.swap_remove(idx)).unwrap();
    }
    if step % 7 == 0 {
      pool.verify().unwrap();
    }
  }

  for buf in live {
    pool.free(buf).unwrap();
  }
  pool.verify().unwrap();
  assert_no_leak(&pool.metrics());
}

#[test]
fn live_regions_never_overlap() {
  let pool = small_pool(2, CacheConfig::default());
  let mut rng = XorShift64::new(0x0DD_BA11);
  let mut live: Vec<PooledBuf> = Vec::new();

  for _ in 0..1500 {
    if live.len() < 64 && (live.is_empty() || rng.gen_range(0, 3) > 0) {
      let size = rng.gen_range(1, 40_000);
      live.push(pool.allocate(size, size).unwrap());
    } else {
      let idx = rng.gen_range(0, live.len() - 1);
      pool.free(live.swap_remove(idx)).unwrap();
    }
  }

  for (chunk, mut ranges) in ranges_by_chunk(&live) {
    ranges.sort_unstable();
    for pair in ranges.windows(2) {
      assert!(
        pair[0].1 <= pair[1].0,
        "chunk {chunk:?}: {:?} overlaps {:?}",
        pair[0],
        pair[1]
      );
    }
  }
  for buf in live {
    pool.free(buf).unwrap();
  }
}

#[test]
fn normalization_is_monotone_and_idempotent() {
  let mut rng = XorShift64::new(0x4E0);
  for (page_size, max_order) in [(4096, 0), (8192, 4), (8192, 11), (65536, 13)] {
    let g = Geometry::new(page_size, max_order).unwrap();
    let edges = [
      0,
      1,
      15,
      16,
      17,
      496,
      497,
      511,
      512,
      513,
      page_size - 1,
      page_size,
      g.chunk_size() - 1,
      g.chunk_size(),
      g.chunk_size() + 1,
    ];
    let random = (0..2000).map(|_| rng.gen_range(0, 2 * g.chunk_size()));
    for x in edges.into_iter().chain(random) {
      let n = g.normalize(x);
      assert!(n >= x, "normalize({x}) = {n}");
      assert_eq!(g.normalize(n), n, "normalize not idempotent at {x}");
    }
  }
}

#[test]
fn subpage_refuses_slots_until_one_is_freed() {
  let pool = small_pool(1, CacheConfig::disabled());
  // 1 KiB slots: eight per 8 KiB page.
  let first: Vec<PooledBuf> = (0..8).map(|_| pool.allocate(1024, 1024).unwrap()).collect();
  let page = first[0].region().handle().memory_map_idx();
  assert!(first.iter().all(|b| b.region().handle().memory_map_idx() == page));
  let mut slots: Vec<_> = first.iter().map(|b| b.region().handle().bitmap_idx()).collect();
  slots.sort_unstable();
  assert_eq!(slots, (0..8).collect::<Vec<_>>());

  // Page exhausted: the ninth slot comes from another page.
  let ninth = pool.allocate(1024, 1024).unwrap();
  assert_ne!(ninth.region().handle().memory_map_idx(), page);

  let mut first = first;
  let freed = first.swap_remove(3);
  let freed_handle = freed.region().handle();
  pool.free(freed).unwrap();
  let again = pool.allocate(1024, 1024).unwrap();
  assert_eq!(again.region().handle(), freed_handle);

  for buf in first.into_iter().chain([ninth, again]) {
    pool.free(buf).unwrap();
  }
  pool.verify().unwrap();
  assert_no_leak(&pool.metrics());
}
