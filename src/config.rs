//! Build-time configuration.
//!
//! Everything here is a constant: the reserved region, the bit index shape and
//! the stack layout are all derived from these values once.

/// Granularity of every protection change.
#[cfg(all(target_vendor = "apple", target_arch = "aarch64"))]
pub const PAGE_SIZE: usize = 16 * 1024;
#[cfg(not(all(target_vendor = "apple", target_arch = "aarch64")))]
pub const PAGE_SIZE: usize = 4 * 1024;

/// Storage width of one bit index level node.
pub const CACHE_LINE_SIZE: usize = 64;

/// Size of one stack slot, in pages.
pub const STACK_PAGES: usize = 512;

/// Size of one stack slot, in bytes.
pub const STACK_SIZE: usize = STACK_PAGES * PAGE_SIZE;

/// Number of stack slots in the reserved region.
pub const STACKS_AMOUNT: usize = 4096;

/// Bytes kept mapped past the header on construction and past the in-use
/// position on compaction.
pub const STACK_KEEP_PROTECTED_BYTES: usize = 4 * PAGE_SIZE;

/// Size of the alternate stack the fault handler runs on.
pub const ALT_STACK_SIZE: usize = 256 * 1024;

/// Growth direction of the build's stack layout.
pub const STACK_GROWS_DOWN: bool = !cfg!(feature = "grows-up");

/// Whether the build's stack layout carries a guard page.
pub const STACK_USE_GUARD_PAGE: bool = !cfg!(feature = "no-guard");

/// Smallest heap size class.
pub const HEAP_SIZE_CLASS_MIN: usize = 8;

/// Largest heap size class; bigger requests go to the system allocator.
pub const HEAP_SIZE_CLASS_MAX: usize = 4096;

/// Distance between two neighbouring heap size classes.
pub const HEAP_SIZE_CLASS_STEP: usize = 16;

/// Blocks carved out of the first chunk of a heap pool.
pub const HEAP_CHUNK_BLOCKS_MIN: usize = 32;

/// Upper bound on blocks per heap pool chunk.
pub const HEAP_CHUNK_BLOCKS_MAX: usize = 1024;

const _: () = {
  assert!(PAGE_SIZE.is_power_of_two());
  assert!(CACHE_LINE_SIZE % 8 == 0);
  assert!(STACK_KEEP_PROTECTED_BYTES % PAGE_SIZE == 0);
  assert!(STACK_SIZE > STACK_KEEP_PROTECTED_BYTES + 2 * PAGE_SIZE);
  assert!(HEAP_SIZE_CLASS_MAX % HEAP_SIZE_CLASS_STEP == 0);
};
