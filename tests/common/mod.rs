#![allow(dead_code)]

use chunkpool::{ArenaMetrics, CacheConfig, MemoryMode, PoolConfig, PooledAllocator};

#[derive(Clone, Copy, Debug)]
pub struct XorShift64 {
  state: u64,
}

impl XorShift64 {
  pub fn new(seed: u64) -> Self {
    Self { state: seed }
  }

  pub fn next_u64(&mut self) -> u64 {
    let mut x = self.state;
    x ^= x >> 12;
    x ^= x << 25;
    x ^= x >> 27;
    self.state = x;
    x.wrapping_mul(0x2545_F491_4F6C_DD1D)
  }

  pub fn gen_range(&mut self, low: usize, high_inclusive: usize) -> usize {
    assert!(low <= high_inclusive);
    let span = high_inclusive - low + 1;
    low + (self.next_u64() as usize % span)
  }

  pub fn gen_bool(&mut self) -> bool {
    self.next_u64() & 1 == 1
  }
}

/// 8 KiB pages, 16-page (128 KiB) chunks.
pub fn small_config(num_arenas: usize, cache: CacheConfig) -> PoolConfig {
  PoolConfig {
    page_size: 8192,
    max_order: 4,
    num_arenas,
    memory_mode: MemoryMode::Heap,
    cache,
  }
}

pub fn small_pool(num_arenas: usize, cache: CacheConfig) -> PooledAllocator {
  PooledAllocator::new(small_config(num_arenas, cache)).unwrap()
}

/// Every pooled byte is either free in its tree or held by an empty subpage
/// kept as the last of its class.
pub fn assert_no_leak(metrics: &[ArenaMetrics]) {
  for m in metrics {
    assert_eq!(
      m.free_chunk_bytes + m.retained_subpage_bytes,
      m.total_chunk_bytes,
      "arena {} leaked bytes:\n{m}",
      m.index
    );
    assert_eq!(m.huge_active_bytes, 0, "arena {} leaked huge bytes", m.index);
  }
}
