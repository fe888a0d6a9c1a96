//! Hierarchical bit index.
//!
//! Hands out integer addresses below a fixed capacity, always the lowest free
//! one. Leaves hold one bit per address; every inner node keeps one counter
//! per child with the number of allocated addresses below it, so full
//! subtrees are skipped without being visited.
//!
//! The index lives in reserved, initially inaccessible memory. Only the
//! prefix needed to reach the highest address ever allocated is made
//! accessible, so the resident footprint follows the high-water mark rather
//! than the capacity. The prefix is never shrunk.

mod level;

use std::ptr::NonNull;

use tracing::{error, trace};

pub use level::{LEAF_VOLUME, Level, Shape};
use level::{LEAF_WORDS, WORD_BITS};

use crate::{
  align::align_up,
  config::{CACHE_LINE_SIZE, PAGE_SIZE},
  error::{Result, fatal},
  vm::{self, Protection},
};

/// Slot number handed out by a [`BitIndex`].
pub type Address = usize;

pub struct BitIndex {
  storage: NonNull<u8>,
  shape: Shape,
  protected_size: usize,
  high_water: Option<Address>,
  allocated: usize,
}

impl BitIndex {
  /// Page aligned size of the storage an index of `capacity` needs.
  pub const fn storage_size(capacity: usize) -> usize {
    align_up(Shape::for_capacity(capacity).storage_size(), PAGE_SIZE)
  }

  /// Creates an empty index over `storage`.
  ///
  /// # Safety
  ///
  /// `storage` must be page aligned, point to [`BitIndex::storage_size`]
  /// bytes of reserved memory that is either inaccessible or zeroed, and be
  /// used by nothing else for the lifetime of the index.
  pub unsafe fn new(
    storage: NonNull<u8>,
    capacity: usize,
  ) -> Result<Self> {
    let mut index = Self {
      storage,
      shape: Shape::for_capacity(capacity),
      protected_size: 0,
      high_water: None,
      allocated: 0,
    };

    index.update_protection(0)?;

    Ok(index)
  }

  pub fn capacity(&self) -> usize {
    self.shape.capacity()
  }

  /// Number of addresses currently allocated.
  pub fn len(&self) -> usize {
    self.allocated
  }

  pub fn is_empty(&self) -> bool {
    self.allocated == 0
  }

  /// Greatest address ever allocated.
  pub fn high_water(&self) -> Option<Address> {
    self.high_water
  }

  /// Bytes of storage currently accessible.
  pub fn protected_size(&self) -> usize {
    self.protected_size
  }

  /// Allocates the lowest free address, or `None` if all are in use.
  pub fn allocate(&mut self) -> Option<Address> {
    if self.allocated == self.capacity() {
      return None;
    }

    let address = self.find_free();
    debug_assert!(address < self.capacity());

    if self.high_water.is_none_or(|high_water| address > high_water) {
      if let Err(err) = self.update_protection(address) {
        error!(error = %err, address, "unable to back bit index storage");
        fatal("unable to back bit index storage");
      }
      self.high_water = Some(address);
    }

    self.update_path(address, true);
    self.allocated += 1;

    Some(address)
  }

  pub fn is_allocated(
    &self,
    address: Address,
  ) -> bool {
    if address >= self.capacity() || self.high_water.is_none_or(|high_water| address > high_water) {
      return false;
    }

    let leaf = self.shape.leaf_offset(address);
    let bit = address % LEAF_VOLUME;

    self.word(leaf, bit / WORD_BITS) & (1 << (bit % WORD_BITS)) != 0
  }

  /// Returns `address` to the index.
  ///
  /// The address must be allocated; freeing a free address corrupts the
  /// counters and is only caught in debug builds.
  pub fn deallocate(
    &mut self,
    address: Address,
  ) {
    debug_assert!(self.is_allocated(address), "double free of bit index address {address}");

    self.update_path(address, false);
    self.allocated -= 1;
  }

  /// Top-down search for the lowest free address.
  ///
  /// Reads nothing below a child whose counter is zero: such a subtree may
  /// not be backed yet, and its lowest address is known anyway.
  fn find_free(&self) -> Address {
    let mut node = 0;
    let mut base = 0;

    for level in (1..=self.shape.depth()).rev() {
      let this = self.shape.level(level);
      let sub = self.shape.level(level - 1);

      let mut child = 0;
      loop {
        debug_assert!(child < this.fanout, "inner node is full but its parent is not");

        let count = self.counter(node, this.counter_width, child);
        if count == 0 {
          return base + child * sub.volume;
        }
        if count < sub.volume {
          break;
        }
        child += 1;
      }

      node += CACHE_LINE_SIZE + child * sub.node_size;
      base += child * sub.volume;
    }

    for word in 0..LEAF_WORDS {
      let bits = self.word(node, word);
      if bits != u64::MAX {
        return base + word * WORD_BITS + bits.trailing_ones() as usize;
      }
    }

    unreachable!("leaf is full but its parent is not")
  }

  /// Flips the bit of `address` and adjusts every counter on its path.
  fn update_path(
    &mut self,
    address: Address,
    allocate: bool,
  ) {
    let mut node = 0;
    let mut rest = address;

    for level in (1..=self.shape.depth()).rev() {
      let this = self.shape.level(level);
      let sub = self.shape.level(level - 1);
      let child = rest / sub.volume;

      let count = self.counter(node, this.counter_width, child);
      let count = if allocate { count + 1 } else { count - 1 };
      self.set_counter(node, this.counter_width, child, count);

      node += CACHE_LINE_SIZE + child * sub.node_size;
      rest %= sub.volume;
    }

    let word = self.word(node, rest / WORD_BITS);
    let mask = 1u64 << (rest % WORD_BITS);
    let word = if allocate { word | mask } else { word & !mask };
    self.set_word(node, rest / WORD_BITS, word);
  }

  /// Makes the storage needed to reach `address` accessible.
  fn update_protection(
    &mut self,
    address: Address,
  ) -> Result<()> {
    let required = align_up(self.shape.required_size(address), PAGE_SIZE);
    if required <= self.protected_size {
      return Ok(());
    }

    // SAFETY: the range lies inside the storage handed to `new`.
    unsafe {
      vm::protect(
        self.at(self.protected_size),
        required - self.protected_size,
        Protection::ReadWrite,
      )?;
    }

    trace!(from = self.protected_size, to = required, "bit index storage grown");
    self.protected_size = required;

    Ok(())
  }

  fn at(
    &self,
    offset: usize,
  ) -> *mut u8 {
    self.storage.as_ptr().wrapping_add(offset)
  }

  fn counter(
    &self,
    node: usize,
    width: usize,
    child: usize,
  ) -> usize {
    let ptr = self.at(node + child * width);

    // SAFETY: counters of visited nodes lie inside the protected prefix and
    // are naturally aligned, as every node starts on a line boundary.
    unsafe {
      match width {
        1 => ptr.read() as usize,
        2 => ptr.cast::<u16>().read() as usize,
        4 => ptr.cast::<u32>().read() as usize,
        _ => ptr.cast::<u64>().read() as usize,
      }
    }
  }

  fn set_counter(
    &mut self,
    node: usize,
    width: usize,
    child: usize,
    value: usize,
  ) {
    let ptr = self.at(node + child * width);

    // SAFETY: see `counter`; `value` never exceeds the child's volume, which
    // fits the counter width by construction.
    unsafe {
      match width {
        1 => ptr.write(value as u8),
        2 => ptr.cast::<u16>().write(value as u16),
        4 => ptr.cast::<u32>().write(value as u32),
        _ => ptr.cast::<u64>().write(value as u64),
      }
    }
  }

  fn word(
    &self,
    leaf: usize,
    word: usize,
  ) -> u64 {
    // SAFETY: visited leaves lie inside the protected prefix.
    unsafe { self.at(leaf).cast::<u64>().add(word).read() }
  }

  fn set_word(
    &mut self,
    leaf: usize,
    word: usize,
    value: u64,
  ) {
    // SAFETY: see `word`.
    unsafe { self.at(leaf).cast::<u64>().add(word).write(value) }
  }
}
