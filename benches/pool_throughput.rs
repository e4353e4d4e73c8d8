use chunkpool::{CacheConfig, PoolConfig, PooledAllocator};
use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use std::hint::black_box;

const OPS: u64 = 100_000;

fn pool(cache: CacheConfig) -> PooledAllocator {
  PooledAllocator::new(PoolConfig {
    num_arenas: 1,
    cache,
    ..PoolConfig::default()
  })
  .unwrap()
}

/// chunkpool allocate/free throughput.
fn pool_allocate_free(pool: &PooledAllocator, size: usize) {
  for _ in 0..OPS {
    let buf = pool.allocate(size, size).unwrap();
    black_box(&buf);
    pool.free(buf).unwrap();
  }
}

/// libc alloc/free throughput.
fn libc_malloc_free(size: usize) {
  for _ in 0..OPS {
    unsafe {
      let ptr = libc::malloc(size);
      black_box(ptr);
      libc::free(ptr);
    }
  }
}

fn benchmark_pool_throughput(c: &mut Criterion) {
  let mut group = c.benchmark_group("pool_throughput");
  let cached = pool(CacheConfig::default());
  let uncached = pool(CacheConfig::disabled());

  for size in [16, 256, 1024, 4096, 16384, 65536] {
    group.throughput(Throughput::Elements(OPS));

    group.bench_with_input(BenchmarkId::new("cached", size), &size, |b, &size| {
      b.iter(|| pool_allocate_free(&cached, size))
    });

    group.bench_with_input(BenchmarkId::new("locked", size), &size, |b, &size| {
      b.iter(|| pool_allocate_free(&uncached, size))
    });

    group.bench_with_input(BenchmarkId::new("libc", size), &size, |b, &size| {
      b.iter(|| libc_malloc_free(size))
    });
  }

  group.finish();
}

/// Buffers that grow by doubling, as a stream reader would.
fn benchmark_reallocate(c: &mut Criterion) {
  let pool = pool(CacheConfig::default());
  c.bench_function("reallocate_doubling_64_to_64k", |b| {
    b.iter(|| {
      let mut buf = pool.allocate(64, 1 << 16).unwrap();
      buf.write_bytes(&[0xAB; 64]).unwrap();
      let mut capacity = 64;
      while capacity < 1 << 16 {
        capacity <<= 1;
        pool.reallocate(&mut buf, capacity, true).unwrap();
      }
      black_box(&buf);
      pool.free(buf).unwrap();
    })
  });
}

criterion_group!(benches, benchmark_pool_throughput, benchmark_reallocate);
criterion_main!(benches);
