mod common;

use std::collections::VecDeque;
use std::sync::{Arc, Barrier};
use std::thread;

use chunkpool::{CacheConfig, ChunkRef, PoolConfig, PooledAllocator, PooledBuf};
use common::{XorShift64, assert_no_leak, small_pool};

#[test]
fn four_quarter_chunk_buffers_fill_one_chunk() {
  let pool = small_pool(1, CacheConfig::disabled());
  assert_eq!(pool.geometry().chunk_size(), 131072);
  assert_eq!(pool.geometry().normalize(32000), 32768);

  let mut bufs: Vec<PooledBuf> = (0..3).map(|_| pool.allocate(32000, 32000).unwrap()).collect();
  let m = &pool.metrics()[0];
  assert_eq!(m.num_chunks, 1);
  assert_eq!(m.free_chunk_bytes, 131072 - 3 * 32768);

  let chunk = bufs[0].region().chunk();
  bufs.push(pool.allocate(32000, 32000).unwrap());
  assert!(bufs.iter().all(|b| b.region().chunk() == chunk));
  let offsets: Vec<_> = bufs.iter().map(|b| b.region().offset()).collect();
  assert_eq!(offsets, vec![0, 32768, 65536, 98304]);
  assert_eq!(pool.metrics()[0].free_chunk_bytes, 0);

  // The chunk is full: the next one needs a fresh chunk.
  let fifth = pool.allocate(32000, 32000).unwrap();
  assert_ne!(fifth.region().chunk(), chunk);
  assert_eq!(pool.metrics()[0].num_chunks, 2);

  pool.free(fifth).unwrap();
  for buf in bufs {
    pool.free(buf).unwrap();
  }
  assert_no_leak(&pool.metrics());
  pool.verify().unwrap();
}

#[test]
fn fifo_tiny_churn_reuses_subpages() {
  let pool = PooledAllocator::new(PoolConfig {
    num_arenas: 1,
    cache: CacheConfig::disabled(),
    ..PoolConfig::default()
  })
  .unwrap();
  let page_size = pool.geometry().page_size();
  let mut rng = XorShift64::new(0x5EED_0001);
  let mut live = VecDeque::new();
  let mut max_pages = 0;

  for _ in 0..1000 {
    let size = rng.gen_range(16, 500);
    live.push_back(pool.allocate(size, size).unwrap());
    if live.len() > 32 {
      let oldest = live.pop_front().unwrap();
      pool.free(oldest).unwrap();
    }
    let m = &pool.metrics()[0];
    assert_eq!(m.num_chunks, 1);
    max_pages = max_pages.max((m.total_chunk_bytes - m.free_chunk_bytes) / page_size);
  }
  // At most one page per live buffer plus one retained page per class
  // (31 tiny classes, and 512 bytes rounds into the first small class).
  assert!(max_pages <= 32 + 32, "{max_pages} pages in use");

  for buf in live {
    pool.free(buf).unwrap();
  }
  assert_no_leak(&pool.metrics());
  pool.verify().unwrap();
}

#[test]
fn fifo_tiny_churn_through_thread_cache_stays_in_one_chunk() {
  let pool = PooledAllocator::new(PoolConfig {
    num_arenas: 1,
    ..PoolConfig::default()
  })
  .unwrap();
  let mut rng = XorShift64::new(0x5EED_0002);
  let mut live = VecDeque::new();
  for _ in 0..1000 {
    let size = rng.gen_range(16, 500);
    live.push_back(pool.allocate(size, size).unwrap());
    if live.len() > 32 {
      pool.free(live.pop_front().unwrap()).unwrap();
    }
  }
  assert_eq!(pool.metrics()[0].num_chunks, 1);
  let cache = pool.thread_cache_metrics().unwrap();
  assert!(cache.hits > 0);
  for buf in live {
    pool.free(buf).unwrap();
  }
}

fn size_for(rng: &mut XorShift64) -> usize {
  match rng.gen_range(0, 2) {
    0 => rng.gen_range(1, 511),
    1 => rng.gen_range(512, 8191),
    _ => rng.gen_range(8192, 131072),
  }
}

fn tag(buf: &mut PooledBuf, value: u8) {
  let slice = buf.as_mut_slice();
  let last = slice.len() - 1;
  slice[0] = value;
  slice[last] = value;
}

fn check_tag(buf: &PooledBuf, value: u8) {
  let slice = buf.as_slice();
  assert_eq!(slice[0], value);
  assert_eq!(slice[slice.len() - 1], value);
}

#[test]
fn two_threads_churn_without_leaks() {
  let pool = Arc::new(small_pool(2, CacheConfig::default()));
  let barrier = Arc::new(Barrier::new(2));

  let workers: Vec<_> = (0..2u64)
    .map(|t| {
      let (pool, barrier) = (Arc::clone(&pool), Arc::clone(&barrier));
      thread::spawn(move || {
        let mut rng = XorShift64::new(0xC0FF_EE00 + t);
        let mut live: Vec<(PooledBuf, u8)> = Vec::new();
        barrier.wait();
        for i in 0..10_000usize {
          if live.len() < 16 && (live.is_empty() || rng.gen_bool()) {
            let size = size_for(&mut rng);
            let mut buf = pool.allocate(size, 131072).unwrap();
            let value = (i % 251) as u8;
            tag(&mut buf, value);
            live.push((buf, value));
          } else {
            let idx = rng.gen_range(0, live.len() - 1);
            let (buf, value) = live.swap_remove(idx);
            check_tag(&buf, value);
            pool.free(buf).unwrap();
          }
        }
        // Leftovers are released by the main thread (cross-thread path).
        live
      })
    })
    .collect();

  for worker in workers {
    for (buf, value) in worker.join().unwrap() {
      check_tag(&buf, value);
      pool.free(buf).unwrap();
    }
  }

  let mut pool = Arc::try_unwrap(pool).unwrap();
  pool.free_thread_caches().unwrap();
  pool.verify().unwrap();
  let metrics = pool.metrics();
  assert_no_leak(&metrics);
  for m in &metrics {
    assert_eq!(m.active_allocations(), 0, "{m}");
  }
}

#[test]
fn huge_buffers_are_unpooled_and_released_immediately() {
  let pool = small_pool(1, CacheConfig::default());
  let mut buf = pool.allocate(300_000, 300_000).unwrap();
  assert_eq!(buf.region().chunk(), ChunkRef::Unpooled);
  buf.write_bytes(&[1u8; 1000]).unwrap();
  assert_eq!(pool.metrics()[0].huge_active_bytes, 300_000);
  pool.free(buf).unwrap();
  assert_eq!(pool.metrics()[0].huge_active_bytes, 0);
  assert_eq!(pool.thread_cache_metrics().unwrap().cached_regions, 0);
}

#[test]
fn reallocate_across_size_classes_preserves_data() {
  let pool = small_pool(1, CacheConfig::default());
  let mut buf = pool.allocate(8, 1 << 20).unwrap();
  buf.write_bytes(b"payload!").unwrap();
  for capacity in [100, 700, 9000, 200_000, 40, 8] {
    pool.reallocate(&mut buf, capacity, true).unwrap();
    assert_eq!(buf.capacity(), capacity);
    assert_eq!(&buf.as_slice()[..8], b"payload!");
  }
  pool.free(buf).unwrap();
}
