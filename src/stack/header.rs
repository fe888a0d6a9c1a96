use crate::align::align_up;

/// Bookkeeping stored inside the stack slot it describes.
///
/// Sits at the low end of upward growing stacks and at the high end of
/// downward growing ones, always on the side away from the guard page.
#[derive(Debug)]
#[repr(C)]
pub struct Header {
  /// First usable byte.
  pub userspace_begin: *mut u8,
  /// One past the last usable byte.
  pub userspace_end: *mut u8,
  /// Current mapped boundary: everything between it and the header is
  /// accessible.
  pub userspace_mapped: *mut u8,
  pub grows_down: bool,
  pub has_guard: bool,
  /// Unique per construction, for logs and debuggers.
  pub id: u64,
}

/// Bytes reserved for the header, keeping the usable area 16 byte aligned.
pub const HEADER_SIZE: usize = align_up(size_of::<Header>(), 16);

impl Header {
  pub fn size(&self) -> usize {
    self.userspace_end as usize - self.userspace_begin as usize
  }

  /// Bytes currently mapped for use, header excluded.
  pub fn mapped_size(&self) -> usize {
    if self.grows_down {
      self.userspace_end as usize - self.userspace_mapped as usize
    } else {
      self.userspace_mapped as usize - self.userspace_begin as usize
    }
  }

  pub fn contains(
    &self,
    addr: *const u8,
  ) -> bool {
    (self.userspace_begin as *const u8..self.userspace_end as *const u8).contains(&addr)
  }
}
