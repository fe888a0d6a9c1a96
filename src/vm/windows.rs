use std::{
  io, mem,
  ptr::{self, NonNull},
  sync::{
    Mutex,
    atomic::{AtomicPtr, Ordering},
  },
};

use winapi::{
  ctypes::c_void,
  shared::ntdef::LONG,
  um::{
    errhandlingapi::{AddVectoredExceptionHandler, RemoveVectoredExceptionHandler},
    memoryapi::{VirtualAlloc, VirtualFree},
    minwinbase::EXCEPTION_ACCESS_VIOLATION,
    sysinfoapi::{GetSystemInfo, SYSTEM_INFO},
    winnt::{
      EXCEPTION_NONCONTINUABLE, EXCEPTION_POINTERS, MEM_COMMIT, MEM_DECOMMIT, MEM_RELEASE,
      MEM_RESERVE, PAGE_GUARD, PAGE_NOACCESS, PAGE_READWRITE, STATUS_GUARD_PAGE_VIOLATION,
    },
  },
};

use super::{FaultCallback, PanicCallback, Protection, dispatch};
use crate::{
  config::PAGE_SIZE,
  error::{Error, Result, format_addr, write_stderr},
};

const EXCEPTION_CONTINUE_EXECUTION: LONG = -1;
const EXCEPTION_CONTINUE_SEARCH: LONG = 0;

/// Signal number reported to the panic callback, matching the POSIX backend.
const SIGSEGV: i32 = 11;

struct State {
  on_fault: FaultCallback,
  on_panic: PanicCallback,
  handle: *mut c_void,
}

static STATE: AtomicPtr<State> = AtomicPtr::new(ptr::null_mut());

static LIFECYCLE: Mutex<()> = Mutex::new(());

pub fn page_size() -> usize {
  // SAFETY: SYSTEM_INFO is plain old data filled by the call.
  let mut info: SYSTEM_INFO = unsafe { mem::zeroed() };
  unsafe { GetSystemInfo(&mut info) };
  if info.dwPageSize == 0 { PAGE_SIZE } else { info.dwPageSize as usize }
}

pub fn reserve(size: usize) -> io::Result<NonNull<u8>> {
  // SAFETY: reservation at an address of the system's choice.
  let addr = unsafe { VirtualAlloc(ptr::null_mut(), size, MEM_RESERVE, PAGE_NOACCESS) };
  NonNull::new(addr.cast()).ok_or_else(io::Error::last_os_error)
}

pub unsafe fn release(
  addr: NonNull<u8>,
  _size: usize,
) -> io::Result<()> {
  // SAFETY: caller guarantees `addr` starts a whole reservation.
  if unsafe { VirtualFree(addr.as_ptr().cast(), 0, MEM_RELEASE) } == 0 {
    return Err(io::Error::last_os_error());
  }
  Ok(())
}

pub unsafe fn protect(
  addr: *mut u8,
  size: usize,
  protection: Protection,
) -> io::Result<()> {
  match protection {
    Protection::NoAccess => {
      // SAFETY: caller guarantees the range lies inside a reservation.
      if unsafe { VirtualFree(addr.cast(), size, MEM_DECOMMIT) } == 0 {
        return Err(io::Error::last_os_error());
      }
    }
    Protection::ReadWrite | Protection::Guard => {
      let flags = match protection {
        Protection::Guard => PAGE_READWRITE | PAGE_GUARD,
        _ => PAGE_READWRITE,
      };
      // SAFETY: caller guarantees the range lies inside a reservation.
      let committed = unsafe { VirtualAlloc(addr.cast(), size, MEM_COMMIT, flags) };
      if committed.cast::<u8>() != addr {
        return Err(io::Error::last_os_error());
      }
    }
  }
  Ok(())
}

pub fn install(
  on_fault: FaultCallback,
  on_panic: PanicCallback,
) -> Result<()> {
  let _lifecycle = LIFECYCLE.lock().unwrap_or_else(|poisoned| poisoned.into_inner());

  if !STATE.load(Ordering::Acquire).is_null() {
    return Err(Error::AlreadyInstalled);
  }

  let state = Box::into_raw(Box::new(State {
    on_fault,
    on_panic,
    handle: ptr::null_mut(),
  }));
  STATE.store(state, Ordering::Release);

  // SAFETY: registers a handler with the expected signature, first in chain.
  let handle = unsafe { AddVectoredExceptionHandler(1, Some(vectored_handler)) };
  if handle.is_null() {
    let source = io::Error::last_os_error();
    STATE.store(ptr::null_mut(), Ordering::Release);
    // SAFETY: never published to a running handler.
    drop(unsafe { Box::from_raw(state) });
    return Err(Error::ExceptionHandler(source));
  }

  // SAFETY: `state` is live and only mutated under LIFECYCLE.
  unsafe { (*state).handle = handle };
  Ok(())
}

pub fn uninstall(on_fault: FaultCallback) -> Result<()> {
  let _lifecycle = LIFECYCLE.lock().unwrap_or_else(|poisoned| poisoned.into_inner());

  let current = STATE.load(Ordering::Acquire);
  if current.is_null() {
    return Err(Error::NotInstalled);
  }

  // SAFETY: non-null STATE always points to a leaked Box<State>.
  if !ptr::fn_addr_eq(unsafe { (*current).on_fault }, on_fault) {
    return Err(Error::HandlerMismatch);
  }

  // SAFETY: ownership returns here.
  let state = unsafe { Box::from_raw(current) };
  // SAFETY: handle came from AddVectoredExceptionHandler.
  unsafe { RemoveVectoredExceptionHandler(state.handle) };
  STATE.store(ptr::null_mut(), Ordering::Release);

  Ok(())
}

pub fn is_installed() -> bool {
  !STATE.load(Ordering::Acquire).is_null()
}

/// Exceptions already run on the faulting thread's own system stack.
pub fn ensure_thread_alt_stack() -> Result<()> {
  Ok(())
}

unsafe extern "system" fn vectored_handler(info: *mut EXCEPTION_POINTERS) -> LONG {
  // SAFETY: the system passes valid exception pointers.
  let record = unsafe { &*(*info).ExceptionRecord };

  if record.ExceptionFlags & EXCEPTION_NONCONTINUABLE != 0 {
    return EXCEPTION_CONTINUE_SEARCH;
  }

  let kind: &str = match record.ExceptionCode {
    EXCEPTION_ACCESS_VIOLATION => "access violation",
    STATUS_GUARD_PAGE_VIOLATION => "guard page violation",
    _ => return EXCEPTION_CONTINUE_SEARCH,
  };

  if record.NumberParameters < 2 {
    return EXCEPTION_CONTINUE_SEARCH;
  }
  let addr = record.ExceptionInformation[1] as *mut u8;

  let state = STATE.load(Ordering::Acquire);
  if state.is_null() {
    let mut buf = [0u8; 18];
    let text = format_addr(addr as usize, &mut buf);
    write_stderr(&[b"unable to handle ", kind.as_bytes(), b" for ", text, b"\n"]);
    return EXCEPTION_CONTINUE_SEARCH;
  }

  // SAFETY: non-null STATE stays valid until uninstall.
  let state = unsafe { &*state };

  if dispatch(state.on_fault, state.on_panic, addr, SIGSEGV, kind) {
    EXCEPTION_CONTINUE_EXECUTION
  } else {
    EXCEPTION_CONTINUE_SEARCH
  }
}
