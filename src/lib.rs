//! Pooled, size-classed allocator for I/O buffer regions.
//!
//! Memory is reserved in large chunks, each managed as a buddy tree over its
//! pages. Requests below a page are served from single pages split into equal
//! slots (subpages). Chunks are grouped by usage so allocations prefer
//! partially used chunks, and every thread keeps a small cache of released
//! regions in front of its arena.
//!
//! ```no_run
//! use chunkpool::{PoolConfig, PooledAllocator};
//!
//! let pool = PooledAllocator::new(PoolConfig::default())?;
//! let mut buf = pool.allocate(300, 64 * 1024)?;
//! buf.write_bytes(b"hello")?;
//! pool.reallocate(&mut buf, 4096, true)?;
//! pool.free(buf)?;
//! # Ok::<(), chunkpool::Error>(())
//! ```

mod allocator;
mod arena;
mod buf;
mod chunk;
mod chunk_list;
mod config;
mod error;
mod handle;
mod memory;
mod metrics;
mod size_class;
mod subpage;
mod thread_cache;

pub use allocator::PooledAllocator;
pub use arena::{Arena, ChunkRef, Region};
pub use buf::PooledBuf;
pub use chunk::ChunkId;
pub use chunk_list::Band;
pub use config::{CacheConfig, MemoryMode, PoolConfig};
pub use error::{Error, Result, Violation};
pub use handle::Handle;
pub use memory::{ChunkMemory, copy};
pub use metrics::{
  ArenaMetrics, ChunkListMetrics, ChunkMetrics, SizeClassCounts, SubpageMetrics, ThreadCacheMetrics,
};
pub use size_class::{Geometry, MAX_CHUNK_SIZE, MAX_ORDER_LIMIT, MIN_PAGE_SIZE, SizeClass};
pub use thread_cache::ThreadCache;
