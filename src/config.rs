//! Construction-time configuration.
//!
//! Every parameter is fixed for the lifetime of the allocator; there is no
//! runtime reconfiguration. `from_env` only layers overrides on top of the
//! defaults, validation happens when the allocator is built.

use core::str::FromStr;

use crate::error::{Error, Result};
use crate::size_class::Geometry;

const ENV_PREFIX: &str = "CHUNKPOOL_";

/// Where chunk memory comes from.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub enum MemoryMode {
  /// Zeroed `Vec<u8>` blocks on the Rust heap.
  #[default]
  Heap,
  /// Anonymous private mappings, released to the OS on chunk destruction.
  Direct,
}

impl FromStr for MemoryMode {
  type Err = Error;

  fn from_str(s: &str) -> Result<Self> {
    match s.trim().to_ascii_lowercase().as_str() {
      "heap" => Ok(MemoryMode::Heap),
      "direct" => Ok(MemoryMode::Direct),
      other => Err(Error::invalid(
        "memory mode",
        format!("{other:?} is neither \"heap\" nor \"direct\""),
      )),
    }
  }
}

/// Per-thread cache sizing.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CacheConfig {
  /// Ring capacity for each tiny size class (0 disables).
  pub tiny_cache_size: usize,
  /// Ring capacity for each small size class (0 disables).
  pub small_cache_size: usize,
  /// Ring capacity for each cached normal size class (0 disables).
  pub normal_cache_size: usize,
  /// Largest normal region kept in a thread cache.
  pub max_cached_buffer_capacity: usize,
  /// Cache lookups between two automatic trims.
  pub trim_interval: usize,
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      tiny_cache_size: 512,
      small_cache_size: 256,
      normal_cache_size: 64,
      max_cached_buffer_capacity: 32 * 1024,
      trim_interval: 8192,
    }
  }
}

impl CacheConfig {
  /// A configuration that never caches anything.
  pub fn disabled() -> Self {
    Self {
      tiny_cache_size: 0,
      small_cache_size: 0,
      normal_cache_size: 0,
      max_cached_buffer_capacity: 0,
      trim_interval: 8192,
    }
  }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PoolConfig {
  pub page_size: usize,
  /// Tree depth; chunks are `page_size << max_order` bytes.
  pub max_order: u32,
  pub num_arenas: usize,
  pub memory_mode: MemoryMode,
  pub cache: CacheConfig,
}

impl Default for PoolConfig {
  fn default() -> Self {
    Self {
      page_size: 8192,
      max_order: 11,
      num_arenas: default_num_arenas(),
      memory_mode: MemoryMode::Heap,
      cache: CacheConfig::default(),
    }
  }
}

/// Two arenas per available core, so threads rarely share an arena lock.
fn default_num_arenas() -> usize {
  std::thread::available_parallelism()
    .map(|n| n.get() * 2)
    .unwrap_or(2)
}

impl PoolConfig {
  /// Defaults overridden by `CHUNKPOOL_*` environment variables.
  pub fn from_env() -> Self {
    Self::from_lookup(|key| std::env::var(key).ok())
  }

  /// Defaults overridden by whatever `lookup` returns for each `CHUNKPOOL_*` key.
  pub fn from_lookup<F>(lookup: F) -> Self
  where
    F: Fn(&str) -> Option<String>,
  {
    let mut config = Self::default();
    override_with(&lookup, "PAGE_SIZE", &mut config.page_size);
    override_with(&lookup, "MAX_ORDER", &mut config.max_order);
    override_with(&lookup, "NUM_ARENAS", &mut config.num_arenas);
    override_with(&lookup, "MEMORY_MODE", &mut config.memory_mode);
    override_with(&lookup, "TINY_CACHE_SIZE", &mut config.cache.tiny_cache_size);
    override_with(&lookup, "SMALL_CACHE_SIZE", &mut config.cache.small_cache_size);
    override_with(&lookup, "NORMAL_CACHE_SIZE", &mut config.cache.normal_cache_size);
    override_with(
      &lookup,
      "MAX_CACHED_BUFFER_CAPACITY",
      &mut config.cache.max_cached_buffer_capacity,
    );
    override_with(&lookup, "CACHE_TRIM_INTERVAL", &mut config.cache.trim_interval);
    config
  }

  /// `page_size << max_order`, or `None` when the shift overflows. Run
  /// [`validate`](Self::validate) for the full set of bounds.
  #[inline]
  pub fn chunk_size(&self) -> Option<usize> {
    let chunk_size = self.page_size.checked_shl(self.max_order)?;
    (chunk_size >> self.max_order == self.page_size).then_some(chunk_size)
  }

  /// Checks every bound and returns the resulting chunk geometry.
  pub fn validate(&self) -> Result<Geometry> {
    let geometry = Geometry::new(self.page_size, self.max_order)?;
    if self.num_arenas == 0 {
      return Err(Error::invalid("arena count", "at least one arena is required"));
    }
    if self.cache.trim_interval == 0 {
      return Err(Error::invalid(
        "cache trim interval",
        "must be at least one allocation",
      ));
    }
    Ok(geometry)
  }
}

fn override_with<F, T>(lookup: &F, key: &str, slot: &mut T)
where
  F: Fn(&str) -> Option<String>,
  T: FromStr,
{
  let name = format!("{ENV_PREFIX}{key}");
  let Some(raw) = lookup(&name) else {
    return;
  };
  match raw.trim().parse() {
    Ok(value) => *slot = value,
    Err(_) => log::warn!("ignoring {name}={raw:?}: not a valid value"),
  }
}
