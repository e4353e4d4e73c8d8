//! Backing blocks handed out by the memory provider.

use core::ptr::{self, NonNull};
use std::alloc::Layout;

use crate::config::MemoryMode;
use crate::error::{Error, Result};

// =============================================================================
// Platform
// =============================================================================

#[cfg(unix)]
unsafe fn os_mmap(size: usize) -> *mut u8 {
  let ptr = unsafe {
    libc::mmap(
      ptr::null_mut(),
      size,
      libc::PROT_READ | libc::PROT_WRITE,
      libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
      -1,
      0,
    )
  };

  if ptr == libc::MAP_FAILED {
    ptr::null_mut()
  } else {
    ptr as *mut u8
  }
}

#[cfg(unix)]
unsafe fn os_munmap(ptr: *mut u8, size: usize) {
  unsafe { libc::munmap(ptr.cast(), size) };
}

#[cfg(not(unix))]
const DIRECT_ALIGN: usize = 4096;

#[cfg(not(unix))]
unsafe fn os_mmap(size: usize) -> *mut u8 {
  match std::alloc::Layout::from_size_align(size, DIRECT_ALIGN) {
    Ok(layout) => unsafe { std::alloc::alloc_zeroed(layout) },
    Err(_) => ptr::null_mut(),
  }
}

#[cfg(not(unix))]
unsafe fn os_munmap(ptr: *mut u8, size: usize) {
  let layout = unsafe { std::alloc::Layout::from_size_align_unchecked(size, DIRECT_ALIGN) };
  unsafe { std::alloc::dealloc(ptr, layout) };
}

// =============================================================================
// ChunkMemory
// =============================================================================

/// One zeroed block backing a chunk (or a single unpooled region).
///
/// The block is shared between its chunk and the buffers carved from it.
/// Buffers only ever touch the byte range their handle owns, and live handles
/// never overlap, so handing out disjoint slices from `&self` is sound.
pub struct ChunkMemory {
  ptr: NonNull<u8>,
  len: usize,
  mode: MemoryMode,
}

unsafe impl Send for ChunkMemory {}
unsafe impl Sync for ChunkMemory {}

impl ChunkMemory {
  /// Reserves `len` zeroed bytes. Fails with `AllocationExhausted` when the
  /// provider cannot satisfy the request; never retries.
  pub fn allocate(mode: MemoryMode, len: usize) -> Result<Self> {
    let exhausted = Error::AllocationExhausted { requested: len };
    if len == 0 {
      return Ok(Self {
        ptr: NonNull::dangling(),
        len: 0,
        mode: MemoryMode::Heap,
      });
    }

    let ptr = match mode {
      // Same layout as a `Box<[u8]>`, so `Drop` can hand it back as one.
      // Zeroed pages come from the OS lazily instead of being written here.
      MemoryMode::Heap => {
        let layout = Layout::array::<u8>(len).map_err(|_| exhausted.clone())?;
        NonNull::new(unsafe { std::alloc::alloc_zeroed(layout) }).ok_or(exhausted)?
      }
      MemoryMode::Direct => NonNull::new(unsafe { os_mmap(len) }).ok_or(exhausted)?,
    };

    Ok(Self { ptr, len, mode })
  }

  #[inline]
  pub fn len(&self) -> usize {
    self.len
  }

  #[inline]
  pub fn is_empty(&self) -> bool {
    self.len == 0
  }

  #[inline]
  pub fn mode(&self) -> MemoryMode {
    self.mode
  }

  #[inline]
  pub(crate) fn as_ptr(&self) -> *mut u8 {
    self.ptr.as_ptr()
  }

  /// # Safety
  ///
  /// `offset..offset + len` must lie inside the block and must not be
  /// mutably aliased for the lifetime of the returned slice.
  #[inline]
  pub(crate) unsafe fn slice(&self, offset: usize, len: usize) -> &[u8] {
    debug_assert!(offset + len <= self.len);
    unsafe { core::slice::from_raw_parts(self.ptr.as_ptr().add(offset), len) }
  }

  /// # Safety
  ///
  /// `offset..offset + len` must lie inside the block and must be owned
  /// exclusively by the caller for the lifetime of the returned slice.
  #[allow(clippy::mut_from_ref)]
  #[inline]
  pub(crate) unsafe fn slice_mut(&self, offset: usize, len: usize) -> &mut [u8] {
    debug_assert!(offset + len <= self.len);
    unsafe { core::slice::from_raw_parts_mut(self.ptr.as_ptr().add(offset), len) }
  }
}

impl Drop for ChunkMemory {
  fn drop(&mut self) {
    if self.len == 0 {
      return;
    }
    match self.mode {
      MemoryMode::Heap => unsafe {
        drop(Box::from_raw(ptr::slice_from_raw_parts_mut(
          self.ptr.as_ptr(),
          self.len,
        )));
      },
      MemoryMode::Direct => unsafe { os_munmap(self.ptr.as_ptr(), self.len) },
    }
  }
}

impl core::fmt::Debug for ChunkMemory {
  fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
    f.debug_struct("ChunkMemory")
      .field("ptr", &self.ptr)
      .field("len", &self.len)
      .field("mode", &self.mode)
      .finish()
  }
}

/// Copies `len` bytes between two blocks (which may be the same block).
///
/// Panics if either range falls outside its block.
pub fn copy(src: &ChunkMemory, src_offset: usize, dst: &ChunkMemory, dst_offset: usize, len: usize) {
  assert!(
    src_offset.checked_add(len).is_some_and(|end| end <= src.len),
    "copy: source range {src_offset}+{len} exceeds block of {}",
    src.len
  );
  assert!(
    dst_offset.checked_add(len).is_some_and(|end| end <= dst.len),
    "copy: destination range {dst_offset}+{len} exceeds block of {}",
    dst.len
  );
  if len == 0 {
    return;
  }
  unsafe { ptr::copy(src.as_ptr().add(src_offset), dst.as_ptr().add(dst_offset), len) };
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn heap_block_is_zeroed() {
    let mem = ChunkMemory::allocate(MemoryMode::Heap, 8192).unwrap();
    assert_eq!(mem.len(), 8192);
    assert!(unsafe { mem.slice(0, 8192) }.iter().all(|&b| b == 0));
  }

  #[test]
  fn chunk_sized_heap_block_is_zeroed_and_writable() {
    let len = 16 << 20;
    let mem = ChunkMemory::allocate(MemoryMode::Heap, len).unwrap();
    let all = unsafe { mem.slice(0, len) };
    assert!(all.iter().step_by(4096).all(|&b| b == 0));
    assert_eq!(all[len - 1], 0);
    unsafe { mem.slice_mut(len - 4, 4) }.copy_from_slice(b"tail");
    assert_eq!(unsafe { mem.slice(len - 4, 4) }, b"tail");
  }

  #[test]
  fn direct_block_is_zeroed_and_writable() {
    let mem = ChunkMemory::allocate(MemoryMode::Direct, 1 << 16).unwrap();
    assert_eq!(mem.mode(), MemoryMode::Direct);
    assert!(unsafe { mem.slice(0, 1 << 16) }.iter().all(|&b| b == 0));
    unsafe { mem.slice_mut(100, 4) }.copy_from_slice(b"pool");
    assert_eq!(unsafe { mem.slice(100, 4) }, b"pool");
  }

  #[test]
  fn copy_between_and_within_blocks() {
    let a = ChunkMemory::allocate(MemoryMode::Heap, 64).unwrap();
    let b = ChunkMemory::allocate(MemoryMode::Direct, 4096).unwrap();
    unsafe { a.slice_mut(0, 5) }.copy_from_slice(b"hello");
    copy(&a, 0, &b, 10, 5);
    assert_eq!(unsafe { b.slice(10, 5) }, b"hello");
    copy(&b, 10, &b, 12, 5);
    assert_eq!(unsafe { b.slice(12, 5) }, b"hello");
  }

  #[test]
  #[should_panic(expected = "exceeds block")]
  fn copy_out_of_bounds_panics() {
    let a = ChunkMemory::allocate(MemoryMode::Heap, 16).unwrap();
    let b = ChunkMemory::allocate(MemoryMode::Heap, 16).unwrap();
    copy(&a, 8, &b, 0, 16);
  }

  #[test]
  fn absurd_heap_request_is_exhausted() {
    let err = ChunkMemory::allocate(MemoryMode::Heap, usize::MAX).unwrap_err();
    assert_eq!(
      err,
      Error::AllocationExhausted {
        requested: usize::MAX
      }
    );
  }
}
