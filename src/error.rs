//! Error type and fatal-path diagnostics.

use std::{io, process};

use thiserror::Error;

use crate::vm::Protection;

/// Errors reported by the virtual memory layer.
#[derive(Debug, Error)]
pub enum Error {
  #[error("unable to reserve {size} bytes of address space")]
  Reserve {
    size: usize,
    #[source]
    source: io::Error,
  },

  #[error("unable to release {size} bytes at {addr:#x}")]
  Release {
    addr: usize,
    size: usize,
    #[source]
    source: io::Error,
  },

  #[error("unable to change protection of {size} bytes at {addr:#x} to {protection:?}")]
  Protect {
    addr: usize,
    size: usize,
    protection: Protection,
    #[source]
    source: io::Error,
  },

  #[error("fault handler is already installed")]
  AlreadyInstalled,

  #[error("fault handler is not installed")]
  NotInstalled,

  #[error("fault handler was installed with a different callback")]
  HandlerMismatch,

  #[error("unable to set up the alternate signal stack")]
  AltStack(#[source] io::Error),

  #[error("unable to change the action of signal {signal}")]
  SignalAction {
    signal: i32,
    #[source]
    source: io::Error,
  },

  #[error("unable to register the vectored exception handler")]
  ExceptionHandler(#[source] io::Error),

  #[error("system page size {actual} does not divide the configured page size {expected}")]
  PageSize { expected: usize, actual: usize },
}

pub type Result<T> = std::result::Result<T, Error>;

/// Writes `parts` to stderr without allocating or locking.
///
/// Safe to call from the fault handler.
pub fn write_stderr(parts: &[&[u8]]) {
  for part in parts {
    let mut rest = *part;
    while !rest.is_empty() {
      // SAFETY: plain write(2) of a live byte slice.
      let written = unsafe { libc::write(2, rest.as_ptr().cast(), rest.len() as _) };
      if written <= 0 {
        return;
      }
      rest = &rest[written as usize..];
    }
  }
}

/// Formats `addr` as `0x...` into `buf` and returns the used tail.
pub fn format_addr(
  addr: usize,
  buf: &mut [u8; 18],
) -> &[u8] {
  const DIGITS: &[u8; 16] = b"0123456789abcdef";

  let mut pos = buf.len();
  let mut rest = addr;
  loop {
    pos -= 1;
    buf[pos] = DIGITS[rest & 0xf];
    rest >>= 4;
    if rest == 0 {
      break;
    }
  }
  pos -= 1;
  buf[pos] = b'x';
  pos -= 1;
  buf[pos] = b'0';

  &buf[pos..]
}

/// Prints `message` and aborts the process.
///
/// Used where a stack cannot continue without the resource, such as a free
/// slot or a protection change. Safe to call from the fault handler.
pub fn fatal(message: &str) -> ! {
  write_stderr(&[message.as_bytes(), b"\n"]);
  process::abort()
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_format_addr() {
    let mut buf = [0u8; 18];
    assert_eq!(format_addr(0, &mut buf), b"0x0");
    assert_eq!(format_addr(0xdead_beef, &mut buf), b"0xdeadbeef");
    assert_eq!(format_addr(usize::MAX, &mut buf).len(), 2 + 2 * std::mem::size_of::<usize>());
  }

  #[test]
  fn test_error_display() {
    let err = Error::Protect {
      addr: 0x1000,
      size: 4096,
      protection: Protection::ReadWrite,
      source: io::Error::from_raw_os_error(libc::ENOMEM),
    };

    assert_eq!(
      err.to_string(),
      "unable to change protection of 4096 bytes at 0x1000 to ReadWrite"
    );
  }
}
