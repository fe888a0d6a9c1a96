//! Virtual memory platform layer.
//!
//! Reserves address space without physical backing, switches page protection
//! and owns the single process-wide page fault interceptor. Two backends sit
//! behind the same interface:
//!
//! - **unix**: `mmap`/`mprotect`/`madvise` and a `SIGSEGV`/`SIGBUS` handler
//!   running on a dedicated alternate signal stack
//! - **windows**: `VirtualAlloc`/`VirtualFree` and a vectored exception handler
//!
//! Nothing outside this module knows which backend is active.
//!
//! # Safety
//!
//! `release` and `protect` operate on raw address ranges. Callers must only
//! pass ranges obtained from [`reserve`] and must not keep references into
//! memory they turn inaccessible.

use std::ptr::NonNull;

use tracing::debug;

use crate::error::{Error, Result, format_addr, write_stderr};

cfg_if::cfg_if! {
  if #[cfg(unix)] {
    mod unix;
    use unix as backend;
  } else if #[cfg(windows)] {
    mod windows;
    use windows as backend;
  } else {
    compile_error!("rstack supports unix and windows targets only");
  }
}

pub use backend::ensure_thread_alt_stack;

/// Page protection understood by [`protect`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protection {
  /// Inaccessible and excluded from core dumps.
  NoAccess,
  /// Readable, writable and included in core dumps.
  ReadWrite,
  /// One-shot trap page where the platform has one, otherwise `NoAccess`.
  Guard,
}

/// Whether [`Protection::Guard`] differs from [`Protection::NoAccess`].
pub const HAS_DISTINCT_GUARD: bool = cfg!(windows);

/// Called with the faulting address; returns `true` if the fault is resolved
/// and execution may resume.
pub type FaultCallback = fn(*mut u8) -> bool;

/// Called with the signal number when a fault cannot be resolved.
pub type PanicCallback = fn(i32);

/// Page size reported by the operating system.
pub fn page_size() -> usize {
  backend::page_size()
}

/// Reserves `size` bytes of inaccessible address space.
pub fn reserve(size: usize) -> Result<NonNull<u8>> {
  let addr = backend::reserve(size).map_err(|source| Error::Reserve { size, source })?;
  debug!(addr = ?addr, size, "reserved address space");
  Ok(addr)
}

/// Returns a range obtained from [`reserve`] to the operating system.
///
/// # Safety
///
/// `addr` and `size` must describe exactly one earlier reservation, and
/// nothing may touch the range afterwards.
pub unsafe fn release(
  addr: NonNull<u8>,
  size: usize,
) -> Result<()> {
  unsafe { backend::release(addr, size) }.map_err(|source| Error::Release {
    addr: addr.as_ptr() as usize,
    size,
    source,
  })?;
  debug!(addr = ?addr, size, "released address space");
  Ok(())
}

/// Changes the protection of `size` bytes starting at `addr`.
///
/// Called from the fault handler, so it does not log.
///
/// # Safety
///
/// The range must be page aligned and lie inside a live reservation. Turning
/// memory inaccessible invalidates every reference into it.
pub unsafe fn protect(
  addr: *mut u8,
  size: usize,
  protection: Protection,
) -> Result<()> {
  if size == 0 {
    return Ok(());
  }

  unsafe { backend::protect(addr, size, protection) }.map_err(|source| Error::Protect {
    addr: addr as usize,
    size,
    protection,
    source,
  })
}

/// Installs the process-wide fault interceptor.
///
/// Fails with [`Error::AlreadyInstalled`] and leaves everything untouched if
/// an interceptor is already active.
pub fn install(
  on_fault: FaultCallback,
  on_panic: PanicCallback,
) -> Result<()> {
  backend::install(on_fault, on_panic)?;
  debug!("fault handler installed");
  Ok(())
}

/// Removes the interceptor installed with the same `on_fault` callback.
pub fn uninstall(on_fault: FaultCallback) -> Result<()> {
  backend::uninstall(on_fault)?;
  debug!("fault handler uninstalled");
  Ok(())
}

/// Whether a fault interceptor is currently active.
pub fn is_installed() -> bool {
  backend::is_installed()
}

/// Scoped fault interceptor registration.
///
/// Uninstalls the interceptor when dropped.
#[derive(Debug)]
pub struct Registration {
  on_fault: FaultCallback,
}

impl Registration {
  pub fn new(
    on_fault: FaultCallback,
    on_panic: PanicCallback,
  ) -> Result<Self> {
    install(on_fault, on_panic)?;
    Ok(Self { on_fault })
  }

  /// Uninstalls explicitly, reporting failures.
  pub fn uninstall(self) -> Result<()> {
    let on_fault = self.on_fault;
    std::mem::forget(self);
    uninstall(on_fault)
  }
}

impl Drop for Registration {
  fn drop(&mut self) {
    if let Err(err) = uninstall(self.on_fault) {
      tracing::error!(error = %err, "unable to uninstall fault handler");
    }
  }
}

/// Shared reaction to a fault both backends run.
///
/// Returns `true` if the fault was resolved. Otherwise the panic callback has
/// run and the caller must hand the fault to the previous handler.
fn dispatch(
  on_fault: FaultCallback,
  on_panic: PanicCallback,
  addr: *mut u8,
  signal: i32,
  kind: &str,
) -> bool {
  if on_fault(addr) {
    return true;
  }

  let mut buf = [0u8; 18];
  let text = format_addr(addr as usize, &mut buf);

  write_stderr(&[b"unhandled ", kind.as_bytes(), b" for ", text, b", do panic\n"]);
  on_panic(signal);

  write_stderr(&[b"call ", kind.as_bytes(), b" default handler for ", text, b"\n"]);
  false
}

/// Serializes unit tests that install the process-wide interceptor.
#[cfg(test)]
pub(crate) fn test_lock() -> std::sync::MutexGuard<'static, ()> {
  static LOCK: std::sync::Mutex<()> = std::sync::Mutex::new(());
  LOCK.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::config::PAGE_SIZE;

  #[test]
  fn test_page_size_matches_config() {
    assert_eq!(PAGE_SIZE % page_size(), 0);
  }

  #[test]
  fn test_reserve_protect_release() {
    let size = 8 * PAGE_SIZE;
    let base = reserve(size).unwrap();

    unsafe {
      protect(base.as_ptr(), 2 * PAGE_SIZE, Protection::ReadWrite).unwrap();

      let slice = std::slice::from_raw_parts_mut(base.as_ptr(), 2 * PAGE_SIZE);
      assert!(slice.iter().all(|&b| b == 0));
      slice.fill(0x5a);
      assert_eq!(*base.as_ptr().add(2 * PAGE_SIZE - 1), 0x5a);

      protect(base.as_ptr(), 2 * PAGE_SIZE, Protection::NoAccess).unwrap();
      protect(base.as_ptr().add(PAGE_SIZE), PAGE_SIZE, Protection::Guard).unwrap();

      release(base, size).unwrap();
    }
  }

  #[test]
  fn test_protect_empty_range_is_noop() {
    unsafe {
      protect(std::ptr::null_mut(), 0, Protection::ReadWrite).unwrap();
    }
  }
}
