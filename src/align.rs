/// Rounds `value` down to a multiple of `alignment`.
///
/// `alignment` does not have to be a power of two: slots are aligned to their
/// own size, which is only a multiple of the page size.
pub const fn align_down(
  value: usize,
  alignment: usize,
) -> usize {
  value / alignment * alignment
}

/// Rounds `value` up to a multiple of `alignment`.
pub const fn align_up(
  value: usize,
  alignment: usize,
) -> usize {
  align_down(value + alignment - 1, alignment)
}

/// Rounds a value up to the given alignment.
///
/// # Examples
///
/// ```rust
/// use rstack::align_to;
///
/// assert_eq!(align_to!(1, 4096), 4096);
/// assert_eq!(align_to!(4096, 4096), 4096);
/// assert_eq!(align_to!(0, 64), 0);
/// ```
#[macro_export]
macro_rules! align_to {
  ($value:expr, $alignment:expr) => {
    $crate::align::align_up($value, $alignment)
  };
}

/// Rounds a pointer up to the given alignment.
pub fn align_ptr_up(
  ptr: *mut u8,
  alignment: usize,
) -> *mut u8 {
  let addr = ptr as usize;
  ptr.wrapping_add(align_up(addr, alignment) - addr)
}

/// Rounds a pointer down to the given alignment.
pub fn align_ptr_down(
  ptr: *mut u8,
  alignment: usize,
) -> *mut u8 {
  let addr = ptr as usize;
  ptr.wrapping_sub(addr - align_down(addr, alignment))
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_align() {
    let page = 4096;

    let mut alignments = Vec::new();

    for i in 0..10 {
      let sizes = (page * i + 1)..=(page * (i + 1));

      let expected_alignment = page * (i + 1);

      alignments.push((sizes, expected_alignment));
    }

    for (sizes, expected) in alignments {
      for size in sizes.step_by(511) {
        assert_eq!(expected, align_up(size, page));
        assert_eq!(expected, align_to!(size, page));
        assert_eq!(expected - page, align_down(size - 1, page));
      }
    }
  }

  #[test]
  fn test_align_non_power_of_two() {
    let slot = 3 * 4096;

    assert_eq!(align_up(1, slot), slot);
    assert_eq!(align_up(slot + 1, slot), 2 * slot);
    assert_eq!(align_down(2 * slot - 1, slot), slot);
  }

  #[test]
  fn test_align_ptr() {
    let base = 0x10_0000usize as *mut u8;

    assert_eq!(align_ptr_up(base.wrapping_add(1), 4096), base.wrapping_add(4096));
    assert_eq!(align_ptr_down(base.wrapping_add(4095), 4096), base);
    assert_eq!(align_ptr_up(base, 4096), base);
  }
}
