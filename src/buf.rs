//! The minimal buffer built on top of a region: capacity bookkeeping and
//! reader/writer cursors, enough to move data across reallocations.

use std::thread::{self, ThreadId};

use crate::arena::Region;
use crate::error::{Error, Result};

/// A buffer backed by a pooled (or unpooled) region.
///
/// Dropping a `PooledBuf` without handing it back to its allocator leaks the
/// reservation in its chunk; the backing block itself stays alive as long as
/// anything references it.
pub struct PooledBuf {
  region: Region,
  capacity: usize,
  max_capacity: usize,
  reader_index: usize,
  writer_index: usize,
  thread: ThreadId,
}

impl PooledBuf {
  pub(crate) fn new(region: Region, capacity: usize, max_capacity: usize) -> Self {
    debug_assert!(capacity <= region.length() && capacity <= max_capacity);
    Self {
      region,
      capacity,
      max_capacity,
      reader_index: 0,
      writer_index: 0,
      thread: thread::current().id(),
    }
  }

  #[inline]
  pub fn capacity(&self) -> usize {
    self.capacity
  }

  #[inline]
  pub fn max_capacity(&self) -> usize {
    self.max_capacity
  }

  #[inline]
  pub fn reader_index(&self) -> usize {
    self.reader_index
  }

  #[inline]
  pub fn writer_index(&self) -> usize {
    self.writer_index
  }

  #[inline]
  pub fn readable_bytes(&self) -> usize {
    self.writer_index - self.reader_index
  }

  #[inline]
  pub fn writable_bytes(&self) -> usize {
    self.capacity - self.writer_index
  }

  #[inline]
  pub fn region(&self) -> &Region {
    &self.region
  }

  /// Thread that allocated the current region; frees from any other thread
  /// skip the thread cache.
  #[inline]
  pub fn owner_thread(&self) -> ThreadId {
    self.thread
  }

  /// Requires `reader_index <= writer_index <= capacity`.
  pub fn set_index(&mut self, reader_index: usize, writer_index: usize) -> Result<()> {
    if reader_index > writer_index || writer_index > self.capacity {
      return Err(Error::invalid(
        "buffer index",
        format!(
          "reader {reader_index} / writer {writer_index} outside capacity {}",
          self.capacity
        ),
      ));
    }
    self.reader_index = reader_index;
    self.writer_index = writer_index;
    Ok(())
  }

  pub fn as_slice(&self) -> &[u8] {
    // SAFETY: the region is owned by this buffer and lies inside its block.
    unsafe { self.region.memory().slice(self.region.offset(), self.capacity) }
  }

  pub fn as_mut_slice(&mut self) -> &mut [u8] {
    // SAFETY: as above; `&mut self` makes the borrow exclusive.
    unsafe { self.region.memory().slice_mut(self.region.offset(), self.capacity) }
  }

  /// Appends `src` at the writer index. Never grows the buffer.
  pub fn write_bytes(&mut self, src: &[u8]) -> Result<()> {
    if src.len() > self.writable_bytes() {
      return Err(Error::invalid(
        "write length",
        format!("{} bytes do not fit in {} writable", src.len(), self.writable_bytes()),
      ));
    }
    let start = self.writer_index;
    self.as_mut_slice()[start..start + src.len()].copy_from_slice(src);
    self.writer_index += src.len();
    Ok(())
  }

  /// Fills `dst` from the reader index.
  pub fn read_bytes(&mut self, dst: &mut [u8]) -> Result<()> {
    if dst.len() > self.readable_bytes() {
      return Err(Error::invalid(
        "read length",
        format!("{} bytes requested, {} readable", dst.len(), self.readable_bytes()),
      ));
    }
    let start = self.reader_index;
    dst.copy_from_slice(&self.as_slice()[start..start + dst.len()]);
    self.reader_index += dst.len();
    Ok(())
  }

  /// Swaps in a freshly allocated region and returns the previous one.
  pub(crate) fn replace_region(
    &mut self,
    region: Region,
    capacity: usize,
    reader_index: usize,
    writer_index: usize,
  ) -> Region {
    debug_assert!(reader_index <= writer_index && writer_index <= capacity);
    self.capacity = capacity;
    self.reader_index = reader_index;
    self.writer_index = writer_index;
    self.thread = thread::current().id();
    std::mem::replace(&mut self.region, region)
  }

  pub(crate) fn into_region(self) -> Region {
    self.region
  }
}

impl core::fmt::Debug for PooledBuf {
  fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
    f.debug_struct("PooledBuf")
      .field("capacity", &self.capacity)
      .field("max_capacity", &self.max_capacity)
      .field("reader_index", &self.reader_index)
      .field("writer_index", &self.writer_index)
      .field("region", &self.region)
      .finish()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::arena::Arena;
  use crate::config::MemoryMode;
  use crate::size_class::Geometry;

  fn buf(arena: &Arena, capacity: usize) -> PooledBuf {
    let region = arena.allocate(None, capacity, 1 << 20).unwrap();
    PooledBuf::new(region, capacity, 1 << 20)
  }

  fn arena() -> Arena {
    Arena::new(0, Geometry::new(8192, 4).unwrap(), MemoryMode::Heap)
  }

  #[test]
  fn write_then_read() {
    let a = arena();
    let mut b = buf(&a, 100);
    assert_eq!(b.as_slice().len(), 100);
    b.write_bytes(b"hello world").unwrap();
    assert_eq!(b.readable_bytes(), 11);
    let mut out = [0u8; 5];
    b.read_bytes(&mut out).unwrap();
    assert_eq!(&out, b"hello");
    assert_eq!(b.reader_index(), 5);
    assert_eq!(b.writable_bytes(), 89);
  }

  #[test]
  fn overlong_write_and_read_are_rejected() {
    let a = arena();
    let mut b = buf(&a, 16);
    assert!(b.write_bytes(&[1u8; 17]).is_err());
    assert_eq!(b.writer_index(), 0);
    let mut out = [0u8; 1];
    assert!(b.read_bytes(&mut out).is_err());
  }

  #[test]
  fn set_index_checks_ordering() {
    let a = arena();
    let mut b = buf(&a, 64);
    b.set_index(4, 10).unwrap();
    assert!(b.set_index(11, 10).is_err());
    assert!(b.set_index(0, 65).is_err());
    assert_eq!((b.reader_index(), b.writer_index()), (4, 10));
  }

  #[test]
  fn neighbouring_slots_do_not_alias() {
    let a = arena();
    let mut x = buf(&a, 32);
    let mut y = buf(&a, 32);
    x.as_mut_slice().fill(0xAA);
    y.as_mut_slice().fill(0x55);
    assert!(x.as_slice().iter().all(|&b| b == 0xAA));
    assert!(y.as_slice().iter().all(|&b| b == 0x55));
  }
}
