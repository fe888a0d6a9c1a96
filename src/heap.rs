//! Size-classed pooled heap.
//!
//! Small requests are rounded up to a size class and served from a free list
//! of equally sized blocks. Each class owns a pool of chunks taken from the
//! system allocator; a pool's chunks double in block count until they hit
//! [`HEAP_CHUNK_BLOCKS_MAX`]. Requests above [`HEAP_SIZE_CLASS_MAX`] go to the
//! system allocator directly.
//!
//! ```text
//!   Pool of the 32 byte class:
//!
//!   chunk 0 (32 blocks)               chunk 1 (64 blocks)
//!   ┌────┬────┬────┬────┬─────┐       ┌────┬────┬────┬─────┐
//!   │used│free│used│free│ ... │       │free│used│free│ ... │
//!   └────┴─┬──┴────┴─▲─┬┴─────┘       └─▲──┴────┴─▲──┴─────┘
//!          │         │ │                │         │
//!   free ──┘         │ └────────────────┘         │
//!   list ────────────┘ (next pointers live in the free blocks themselves)
//! ```
//!
//! In debug builds fresh blocks are filled with `'A'` and released ones with
//! `'F'`, so use of uninitialized or freed memory stands out.
//!
//! Not thread safe; a [`Heap`] has a single owner.

use std::{
  alloc::{self, Layout},
  ptr::{self, NonNull},
};

use tracing::trace;

use crate::{
  align::align_up,
  config::{
    HEAP_CHUNK_BLOCKS_MAX, HEAP_CHUNK_BLOCKS_MIN, HEAP_SIZE_CLASS_MAX, HEAP_SIZE_CLASS_MIN,
    HEAP_SIZE_CLASS_STEP,
  },
};

const CLASSES: usize = HEAP_SIZE_CLASS_MAX / HEAP_SIZE_CLASS_STEP + 1;

/// Alignment of blocks above the smallest class and of large requests.
const ALIGN: usize = 16;

const FILL_ALLOCATED: u8 = b'A';
const FILL_FREED: u8 = b'F';

/// Size class serving a request of `size` bytes, or `None` if the request is
/// too large for the pools.
pub const fn size_class(size: usize) -> Option<usize> {
  if size <= HEAP_SIZE_CLASS_MIN {
    Some(HEAP_SIZE_CLASS_MIN)
  } else if size > HEAP_SIZE_CLASS_MAX {
    None
  } else {
    Some(align_up(size, HEAP_SIZE_CLASS_STEP))
  }
}

const fn class_align(class: usize) -> usize {
  if class < ALIGN { class } else { ALIGN }
}

/// Link stored inside a free block.
struct FreeBlock {
  next: *mut FreeBlock,
}

struct Chunk {
  ptr: NonNull<u8>,
  layout: Layout,
}

struct Pool {
  class: usize,
  free: *mut FreeBlock,
  chunks: Vec<Chunk>,
  next_blocks: usize,
}

impl Pool {
  fn new(class: usize) -> Self {
    Self {
      class,
      free: ptr::null_mut(),
      chunks: Vec::new(),
      next_blocks: HEAP_CHUNK_BLOCKS_MIN,
    }
  }

  fn alloc(&mut self) -> Option<NonNull<u8>> {
    if self.free.is_null() {
      self.grow()?;
    }

    let block = self.free;
    // SAFETY: non-null free list entries are unused blocks of this pool.
    self.free = unsafe { (*block).next };
    NonNull::new(block.cast())
  }

  /// # Safety
  ///
  /// `block` must come from [`Pool::alloc`] of this pool and not be free.
  unsafe fn free(
    &mut self,
    block: NonNull<u8>,
  ) {
    let block = block.as_ptr().cast::<FreeBlock>();
    // SAFETY: the block is ours again and big enough for the link.
    unsafe { block.write(FreeBlock { next: self.free }) };
    self.free = block;
  }

  /// Adds a chunk and threads its blocks onto the free list, lowest first.
  fn grow(&mut self) -> Option<()> {
    let blocks = self.next_blocks;
    let layout = Layout::from_size_align(self.class * blocks, class_align(self.class)).ok()?;

    // SAFETY: the layout has a nonzero size.
    let ptr = NonNull::new(unsafe { alloc::alloc(layout) })?;

    for i in (0..blocks).rev() {
      // SAFETY: `i` indexes a block inside the fresh chunk.
      unsafe { self.free(ptr.add(i * self.class)) };
    }

    self.chunks.push(Chunk { ptr, layout });
    self.next_blocks = (blocks * 2).min(HEAP_CHUNK_BLOCKS_MAX);

    trace!(class = self.class, blocks, "heap pool grown");
    Some(())
  }

  fn reserved(&self) -> usize {
    self.chunks.iter().map(|chunk| chunk.layout.size()).sum()
  }
}

impl Drop for Pool {
  fn drop(&mut self) {
    for chunk in self.chunks.drain(..) {
      // SAFETY: allocated in `grow` with this layout.
      unsafe { alloc::dealloc(chunk.ptr.as_ptr(), chunk.layout) };
    }
  }
}

pub struct Heap {
  pools: Vec<Pool>,
}

impl Heap {
  pub fn new() -> Self {
    let pools = (0..CLASSES)
      .map(|i| Pool::new((i * HEAP_SIZE_CLASS_STEP).max(HEAP_SIZE_CLASS_MIN)))
      .collect();

    Self { pools }
  }

  /// Allocates at least `size` bytes, or returns `None` if the system
  /// allocator is out of memory.
  pub fn alloc(
    &mut self,
    size: usize,
  ) -> Option<NonNull<u8>> {
    let Some(class) = size_class(size) else {
      let layout = Layout::from_size_align(size, ALIGN).ok()?;
      // SAFETY: `size` is above the largest class, so nonzero.
      return NonNull::new(unsafe { alloc::alloc(layout) });
    };

    let block = self.pool(class).alloc()?;
    if cfg!(debug_assertions) {
      // SAFETY: the block spans `class` bytes.
      unsafe { ptr::write_bytes(block.as_ptr(), FILL_ALLOCATED, class) };
    }

    Some(block)
  }

  /// Returns memory obtained from [`Heap::alloc`].
  ///
  /// # Safety
  ///
  /// `ptr` must come from `alloc` on this heap with the same `size`, and must
  /// not be used afterwards.
  pub unsafe fn free(
    &mut self,
    ptr: NonNull<u8>,
    size: usize,
  ) {
    let Some(class) = size_class(size) else {
      // SAFETY: `alloc` used exactly this layout, which was valid then.
      unsafe { alloc::dealloc(ptr.as_ptr(), Layout::from_size_align_unchecked(size, ALIGN)) };
      return;
    };

    if cfg!(debug_assertions) {
      // SAFETY: the block spans `class` bytes.
      unsafe { ptr::write_bytes(ptr.as_ptr(), FILL_FREED, class) };
    }

    unsafe { self.pool(class).free(ptr) };
  }

  /// Allocates a block sized and aligned for one `T`.
  ///
  /// Blocks carry no header, so there is no `free` without a size; the type
  /// supplies it to [`Heap::free_for`].
  pub fn alloc_for<T>(&mut self) -> Option<NonNull<T>> {
    const { assert!(align_of::<T>() <= ALIGN) };
    self.alloc(size_of::<T>()).map(NonNull::cast)
  }

  /// Returns a block obtained from [`Heap::alloc_for`] with the same `T`.
  ///
  /// # Safety
  ///
  /// Same as [`Heap::free`]. Nothing is dropped in place.
  pub unsafe fn free_for<T>(
    &mut self,
    ptr: NonNull<T>,
  ) {
    unsafe { self.free(ptr.cast(), size_of::<T>()) };
  }

  /// Bytes taken from the system allocator by the pools.
  pub fn reserved(&self) -> usize {
    self.pools.iter().map(Pool::reserved).sum()
  }

  fn pool(
    &mut self,
    class: usize,
  ) -> &mut Pool {
    &mut self.pools[class / HEAP_SIZE_CLASS_STEP]
  }
}

impl Default for Heap {
  fn default() -> Self {
    Self::new()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_size_class() {
    assert_eq!(size_class(0), Some(8));
    assert_eq!(size_class(8), Some(8));
    assert_eq!(size_class(9), Some(16));
    assert_eq!(size_class(16), Some(16));
    assert_eq!(size_class(17), Some(32));
    assert_eq!(size_class(4095), Some(4096));
    assert_eq!(size_class(4096), Some(4096));
    assert_eq!(size_class(4097), None);
  }

  #[test]
  fn test_alloc() {
    let mut heap = Heap::new();

    unsafe {
      let first = heap.alloc(size_of::<u64>()).unwrap().cast::<u64>();
      first.write(3);

      let second = heap.alloc(6 * size_of::<u16>()).unwrap().cast::<u16>();
      for i in 0..6 {
        second.add(i).write(i as u16 + 1);
      }

      assert_eq!(first.read(), 3);
      for i in 0..6 {
        assert_eq!(second.add(i).read(), i as u16 + 1);
      }
      assert_eq!(second.as_ptr() as usize % 16, 0);

      heap.free(first.cast(), size_of::<u64>());

      let third = heap.alloc(size_of::<u32>()).unwrap();
      assert_eq!(third, first.cast());

      heap.free(third, size_of::<u32>());
      heap.free(second.cast(), 6 * size_of::<u16>());
    }
  }

  #[test]
  fn test_typed_blocks() {
    #[derive(Debug, Clone, Copy, PartialEq)]
    #[repr(align(16))]
    struct Node {
      key: u64,
      value: [u8; 20],
    }

    let mut heap = Heap::new();

    unsafe {
      let node = heap.alloc_for::<Node>().unwrap();
      assert_eq!(node.as_ptr() as usize % align_of::<Node>(), 0);
      node.write(Node { key: 9, value: [1; 20] });
      assert_eq!(node.read().key, 9);

      let word = heap.alloc_for::<u64>().unwrap();
      word.write(u64::MAX);

      heap.free_for(node);
      let reused = heap.alloc(size_of::<Node>()).unwrap();
      assert_eq!(reused, node.cast());
      heap.free(reused, size_of::<Node>());

      heap.free_for(word);
      assert_eq!(heap.alloc_for::<u32>().unwrap(), word.cast());
    }
  }

  #[test]
  fn test_blocks_are_distinct_and_ascending() {
    let mut heap = Heap::new();

    let blocks: Vec<_> = (0..10).map(|_| heap.alloc(100).unwrap()).collect();
    for pair in blocks.windows(2) {
      assert_eq!(pair[1].as_ptr() as usize - pair[0].as_ptr() as usize, 112);
    }

    for block in blocks {
      unsafe { heap.free(block, 100) };
    }
  }

  #[test]
  fn test_chunks_double_up_to_limit() {
    let mut heap = Heap::new();
    let class = 64;

    let mut blocks = Vec::new();
    for _ in 0..HEAP_CHUNK_BLOCKS_MIN {
      blocks.push(heap.alloc(class).unwrap());
    }
    assert_eq!(heap.reserved(), HEAP_CHUNK_BLOCKS_MIN * class);

    blocks.push(heap.alloc(class).unwrap());
    assert_eq!(heap.reserved(), 3 * HEAP_CHUNK_BLOCKS_MIN * class);

    let total = 3 * HEAP_CHUNK_BLOCKS_MAX;
    while blocks.len() < total {
      blocks.push(heap.alloc(class).unwrap());
    }

    let pool = &heap.pools[class / HEAP_SIZE_CLASS_STEP];
    assert!(pool.chunks.iter().all(|chunk| chunk.layout.size() <= HEAP_CHUNK_BLOCKS_MAX * class));
    assert_eq!(pool.next_blocks, HEAP_CHUNK_BLOCKS_MAX);

    for block in blocks {
      unsafe { heap.free(block, class) };
    }
  }

  #[test]
  fn test_large_requests_bypass_pools() {
    let mut heap = Heap::new();

    let size = 64 * 1024;
    let block = heap.alloc(size).unwrap();
    assert_eq!(heap.reserved(), 0);

    unsafe {
      ptr::write_bytes(block.as_ptr(), 0xab, size);
      assert_eq!(*block.as_ptr().add(size - 1), 0xab);
      heap.free(block, size);
    }
  }

  #[test]
  #[cfg(debug_assertions)]
  fn test_debug_fill() {
    let mut heap = Heap::new();

    unsafe {
      let block = heap.alloc(48).unwrap();
      let bytes = std::slice::from_raw_parts(block.as_ptr(), 48);
      assert!(bytes.iter().all(|&b| b == b'A'));

      heap.free(block, 48);
      let bytes = std::slice::from_raw_parts(block.as_ptr().add(size_of::<FreeBlock>()), 48 - size_of::<FreeBlock>());
      assert!(bytes.iter().all(|&b| b == b'F'));
    }
  }
}
