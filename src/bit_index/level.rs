//! Shape of the bit index tree.
//!
//! The tree is stored depth-first: a node is one line of child counters
//! followed by its children, one after another. A leaf is one line of
//! allocation bits. Low addresses therefore live at low byte offsets, and the
//! storage needed to reach an address only grows with the address.
//!
//! ```text
//!   level 1 node
//!   ┌──────────────┬──────────────┬──────────────┬─────┬──────────────┐
//!   │ counters     │ leaf 0       │ leaf 1       │ ... │ leaf n-1     │
//!   │ (one line)   │ (512 bits)   │ (512 bits)   │     │ (512 bits)   │
//!   └──────────────┴──────────────┴──────────────┴─────┴──────────────┘
//! ```

use crate::config::CACHE_LINE_SIZE;

const LINE: usize = CACHE_LINE_SIZE;

/// Upper bound on tree depth; enough for any capacity that fits in memory.
pub const MAX_LEVELS: usize = 8;

/// Slots tracked by one leaf.
pub const LEAF_VOLUME: usize = LINE * 8;

/// Bits per leaf word.
pub const WORD_BITS: usize = u64::BITS as usize;

/// Words per leaf.
pub const LEAF_WORDS: usize = LINE / size_of::<u64>();

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Level {
  /// Slots covered by one node of this level.
  pub volume: usize,
  /// Children per node. Zero for leaves.
  pub fanout: usize,
  /// Width of one child counter in bytes. Zero for leaves.
  pub counter_width: usize,
  /// Bytes taken by one node together with its subtree.
  pub node_size: usize,
}

impl Level {
  const EMPTY: Self = Self {
    volume: 0,
    fanout: 0,
    counter_width: 0,
    node_size: 0,
  };

  const LEAF: Self = Self {
    volume: LEAF_VOLUME,
    fanout: 0,
    counter_width: 0,
    node_size: LINE,
  };

  const fn above(sub: Level) -> Self {
    let counter_width = counter_width(sub.volume);
    let fanout = LINE / counter_width;

    Self {
      volume: fanout * sub.volume,
      fanout,
      counter_width,
      node_size: LINE + fanout * sub.node_size,
    }
  }
}

/// Narrowest unsigned integer able to count up to `volume`.
const fn counter_width(volume: usize) -> usize {
  let volume = volume as u64;

  if volume < 1 << 8 {
    1
  } else if volume < 1 << 16 {
    2
  } else if volume < 1 << 32 {
    4
  } else {
    8
  }
}

/// Tree shape derived from a capacity.
///
/// Level `0` is the leaf level, level [`Shape::depth`] is the root.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Shape {
  levels: [Level; MAX_LEVELS],
  depth: usize,
  capacity: usize,
}

impl Shape {
  pub const fn for_capacity(capacity: usize) -> Self {
    assert!(capacity > 0, "bit index capacity must be positive");

    let mut levels = [Level::EMPTY; MAX_LEVELS];
    levels[0] = Level::LEAF;

    let mut depth = 0;
    while levels[depth].volume < capacity {
      assert!(depth + 1 < MAX_LEVELS, "bit index capacity is too large");
      levels[depth + 1] = Level::above(levels[depth]);
      depth += 1;
    }

    Self {
      levels,
      depth,
      capacity,
    }
  }

  pub const fn capacity(&self) -> usize {
    self.capacity
  }

  pub const fn depth(&self) -> usize {
    self.depth
  }

  pub const fn level(
    &self,
    level: usize,
  ) -> Level {
    self.levels[level]
  }

  /// Byte offset of the leaf holding `address`.
  pub const fn leaf_offset(
    &self,
    address: usize,
  ) -> usize {
    let mut offset = 0;
    let mut rest = address;
    let mut level = self.depth;

    while level > 0 {
      let sub = self.levels[level - 1];
      offset += LINE + rest / sub.volume * sub.node_size;
      rest %= sub.volume;
      level -= 1;
    }

    offset
  }

  /// Bytes from the start of the storage that must be accessible to
  /// allocate, query or free `address`.
  pub const fn required_size(
    &self,
    address: usize,
  ) -> usize {
    self.leaf_offset(address) + LINE
  }

  /// Bytes needed to reach every address below the capacity.
  pub const fn storage_size(&self) -> usize {
    self.required_size(self.capacity - 1)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_single_leaf() {
    let shape = Shape::for_capacity(4);

    assert_eq!(shape.depth(), 0);
    assert_eq!(shape.leaf_offset(3), 0);
    assert_eq!(shape.storage_size(), LINE);
  }

  #[test]
  fn test_levels() {
    let shape = Shape::for_capacity(LEAF_VOLUME * 3);

    assert_eq!(shape.depth(), 1);

    let root = shape.level(1);
    assert_eq!(root.counter_width, 2);
    assert_eq!(root.fanout, LINE / 2);
    assert_eq!(root.volume, root.fanout * LEAF_VOLUME);
    assert_eq!(root.node_size, LINE + root.fanout * LINE);

    assert_eq!(shape.leaf_offset(0), LINE);
    assert_eq!(shape.leaf_offset(LEAF_VOLUME), 2 * LINE);
    assert_eq!(shape.storage_size(), 4 * LINE);
  }

  #[test]
  fn test_counter_width_grows() {
    let shape = Shape::for_capacity(10_000_000);

    assert!(shape.level(shape.depth()).volume >= 10_000_000);
    assert!(shape.level(shape.depth() - 1).volume < 10_000_000);

    for level in 1..=shape.depth() {
      let sub = shape.level(level - 1);
      let this = shape.level(level);
      assert!((sub.volume as u64) < 1u64 << (8 * this.counter_width));
      assert_eq!(this.fanout * this.counter_width, LINE);
    }
  }

  #[test]
  fn test_leaf_offset_is_monotonic() {
    let shape = Shape::for_capacity(100_000);

    let mut previous = 0;
    for address in (0..100_000).step_by(97) {
      let offset = shape.leaf_offset(address);
      assert!(offset >= previous);
      assert_eq!(offset % LINE, 0);
      previous = offset;
    }

    assert!(shape.storage_size() <= shape.level(shape.depth()).node_size);
  }
}
