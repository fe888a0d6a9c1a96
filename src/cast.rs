use std::mem;

/// Reinterprets `from` as a value of the same size.
///
/// Used to keep function pointers in atomics and to move between addresses
/// and pointers. The size check happens at compile time.
///
/// ```rust
/// use rstack::cast::sized_cast;
///
/// let value = 0x1000usize;
/// let ptr: *mut u8 = unsafe { sized_cast(value) };
/// assert_eq!(ptr as usize, value);
/// ```
///
/// # Safety
///
/// The bits of `from` must be a valid value of `To`.
#[inline]
pub unsafe fn sized_cast<To: Copy, From: Copy>(from: From) -> To {
  const { assert!(mem::size_of::<From>() == mem::size_of::<To>()) };

  // SAFETY: same size, checked above; validity is up to the caller.
  unsafe { mem::transmute_copy(&from) }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_pointer_roundtrip() {
    let mut value = 7u64;
    let ptr = &raw mut value;

    let addr: usize = unsafe { sized_cast(ptr) };
    let back: *mut u64 = unsafe { sized_cast(addr) };

    assert_eq!(back, ptr);
    assert_eq!(unsafe { *back }, 7);
  }

  #[test]
  fn test_integer_reinterpretation() {
    let signed: isize = -1;
    let unsigned: usize = unsafe { sized_cast(signed) };

    assert_eq!(unsigned, usize::MAX);
  }

  #[test]
  fn test_function_pointer_roundtrip() {
    fn answer() -> u32 {
      42
    }

    let raw: usize = unsafe { sized_cast(answer as fn() -> u32) };
    assert_ne!(raw, 0);

    let back: fn() -> u32 = unsafe { sized_cast(raw) };
    assert_eq!(back(), 42);
  }
}
