use std::{
  cell::RefCell,
  io, mem,
  ptr::{self, NonNull},
  sync::{
    Mutex,
    atomic::{AtomicPtr, Ordering},
  },
};

use libc::{c_int, c_void, siginfo_t};

use super::{FaultCallback, PanicCallback, Protection, dispatch};
use crate::{
  config::{ALT_STACK_SIZE, PAGE_SIZE},
  error::{Error, Result, format_addr, write_stderr},
};

/// Signals a touch of an inaccessible page may arrive as.
const SIGNALS: [c_int; 2] = [libc::SIGSEGV, libc::SIGBUS];

struct State {
  on_fault: FaultCallback,
  on_panic: PanicCallback,
  old_actions: [libc::sigaction; SIGNALS.len()],
}

impl State {
  fn old_action(
    &self,
    signal: c_int,
  ) -> Option<&libc::sigaction> {
    SIGNALS
      .iter()
      .position(|&s| s == signal)
      .map(|i| &self.old_actions[i])
  }
}

static STATE: AtomicPtr<State> = AtomicPtr::new(ptr::null_mut());

/// Serializes install and uninstall; never taken by the signal handler.
static LIFECYCLE: Mutex<()> = Mutex::new(());

pub fn page_size() -> usize {
  // SAFETY: sysconf has no preconditions.
  let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
  if size <= 0 { PAGE_SIZE } else { size as usize }
}

pub fn reserve(size: usize) -> io::Result<NonNull<u8>> {
  // SAFETY: anonymous private mapping at an address of the kernel's choice.
  let addr = unsafe {
    libc::mmap(
      ptr::null_mut(),
      size,
      libc::PROT_NONE,
      libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | map_noreserve(),
      -1,
      0,
    )
  };

  if addr == libc::MAP_FAILED {
    return Err(io::Error::last_os_error());
  }

  if let Err(err) = dump_advice(addr, size, false) {
    // SAFETY: the mapping was created above and nothing refers to it yet.
    unsafe { libc::munmap(addr, size) };
    return Err(err);
  }

  NonNull::new(addr.cast()).ok_or_else(|| io::Error::from(io::ErrorKind::OutOfMemory))
}

pub unsafe fn release(
  addr: NonNull<u8>,
  size: usize,
) -> io::Result<()> {
  // SAFETY: caller guarantees the range is one whole reservation.
  if unsafe { libc::munmap(addr.as_ptr().cast(), size) } != 0 {
    return Err(io::Error::last_os_error());
  }
  Ok(())
}

pub unsafe fn protect(
  addr: *mut u8,
  size: usize,
  protection: Protection,
) -> io::Result<()> {
  let (prot, dump) = match protection {
    Protection::NoAccess | Protection::Guard => (libc::PROT_NONE, false),
    Protection::ReadWrite => (libc::PROT_READ | libc::PROT_WRITE, true),
  };

  // SAFETY: caller guarantees a page aligned range inside a reservation.
  if unsafe { libc::mprotect(addr.cast(), size, prot) } != 0 {
    return Err(io::Error::last_os_error());
  }

  dump_advice(addr.cast(), size, dump)
}

#[cfg(any(target_os = "linux", target_os = "android"))]
fn map_noreserve() -> c_int {
  libc::MAP_NORESERVE
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
fn map_noreserve() -> c_int {
  0
}

#[cfg(any(target_os = "linux", target_os = "android"))]
fn dump_advice(
  addr: *mut c_void,
  size: usize,
  include: bool,
) -> io::Result<()> {
  let advice = if include { libc::MADV_DODUMP } else { libc::MADV_DONTDUMP };

  // SAFETY: advice only; the range belongs to a live mapping.
  if unsafe { libc::madvise(addr, size, advice) } != 0 {
    return Err(io::Error::last_os_error());
  }
  Ok(())
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
fn dump_advice(
  _addr: *mut c_void,
  _size: usize,
  _include: bool,
) -> io::Result<()> {
  Ok(())
}

/// Alternate signal stack with an inaccessible page below it.
struct AltStack {
  base: NonNull<u8>,
}

impl AltStack {
  const MAPPED: usize = ALT_STACK_SIZE + PAGE_SIZE;

  fn new() -> io::Result<Self> {
    let base = reserve(Self::MAPPED)?;
    let stack = Self { base };

    // SAFETY: the usable part lies inside the reservation made above.
    unsafe { protect(stack.top_of_guard(), ALT_STACK_SIZE, Protection::ReadWrite)? };

    Ok(stack)
  }

  fn top_of_guard(&self) -> *mut u8 {
    self.base.as_ptr().wrapping_add(PAGE_SIZE)
  }

  fn is_active(&self) -> bool {
    current_alt_stack().is_ok_and(|current| current.ss_sp.cast::<u8>() == self.top_of_guard())
  }

  /// Makes this the calling thread's alternate stack.
  fn activate(&self) -> io::Result<()> {
    let new = libc::stack_t {
      ss_sp: self.top_of_guard().cast(),
      ss_flags: 0,
      ss_size: ALT_STACK_SIZE,
    };

    // SAFETY: `new` describes mapped read-write memory that stays alive as
    // long as the owning thread local.
    if unsafe { libc::sigaltstack(&new, ptr::null_mut()) } != 0 {
      return Err(io::Error::last_os_error());
    }
    Ok(())
  }
}

impl Drop for AltStack {
  fn drop(&mut self) {
    // SAFETY: the whole reservation is ours and no longer active.
    let _ = unsafe { release(self.base, Self::MAPPED) };
  }
}

fn current_alt_stack() -> io::Result<libc::stack_t> {
  // SAFETY: stack_t is plain old data.
  let mut current: libc::stack_t = unsafe { mem::zeroed() };
  // SAFETY: query only.
  if unsafe { libc::sigaltstack(ptr::null(), &mut current) } != 0 {
    return Err(io::Error::last_os_error());
  }
  Ok(current)
}

fn restore_action(
  signal: c_int,
  old: &libc::sigaction,
) {
  // SAFETY: `old` was reported by the kernel for `signal`.
  if unsafe { libc::sigaction(signal, old, ptr::null_mut()) } != 0 {
    tracing::error!(signal, error = %io::Error::last_os_error(), "unable to restore signal action");
  }
}

pub fn install(
  on_fault: FaultCallback,
  on_panic: PanicCallback,
) -> Result<()> {
  let _lifecycle = LIFECYCLE.lock().unwrap_or_else(|poisoned| poisoned.into_inner());

  if !STATE.load(Ordering::Acquire).is_null() {
    return Err(Error::AlreadyInstalled);
  }

  ensure_thread_alt_stack()?;

  // SAFETY: sigaction is plain old data.
  let mut action: libc::sigaction = unsafe { mem::zeroed() };
  action.sa_sigaction = fault_handler as *const () as usize;
  action.sa_flags = libc::SA_SIGINFO | libc::SA_ONSTACK;
  // SAFETY: sa_mask is a valid sigset_t.
  unsafe { libc::sigfillset(&mut action.sa_mask) };

  // SAFETY: sigaction is plain old data.
  let mut old_actions: [libc::sigaction; SIGNALS.len()] = unsafe { mem::zeroed() };
  for (i, &signal) in SIGNALS.iter().enumerate() {
    // SAFETY: both pointers refer to live sigaction values.
    if unsafe { libc::sigaction(signal, &action, &mut old_actions[i]) } != 0 {
      let source = io::Error::last_os_error();
      for (j, &installed) in SIGNALS[..i].iter().enumerate() {
        restore_action(installed, &old_actions[j]);
      }
      return Err(Error::SignalAction { signal, source });
    }
  }

  let state = Box::new(State {
    on_fault,
    on_panic,
    old_actions,
  });
  STATE.store(Box::into_raw(state), Ordering::Release);

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

  STATE.store(ptr::null_mut(), Ordering::Release);
  // SAFETY: ownership returns here; the handler no longer sees this state.
  let state = unsafe { Box::from_raw(current) };

  for (i, &signal) in SIGNALS.iter().enumerate() {
    restore_action(signal, &state.old_actions[i]);
  }
  drop(state);

  Ok(())
}

pub fn is_installed() -> bool {
  !STATE.load(Ordering::Acquire).is_null()
}

thread_local! {
  static THREAD_ALT_STACK: RefCell<Option<ThreadAltStack>> = const { RefCell::new(None) };
}

struct ThreadAltStack {
  stack: AltStack,
}

impl Drop for ThreadAltStack {
  fn drop(&mut self) {
    if !self.stack.is_active() {
      return;
    }

    let disable = libc::stack_t {
      ss_sp: ptr::null_mut(),
      ss_flags: libc::SS_DISABLE,
      ss_size: 0,
    };
    // SAFETY: disabling needs no memory.
    unsafe { libc::sigaltstack(&disable, ptr::null_mut()) };
  }
}

/// Gives the calling thread an alternate signal stack large enough for the
/// fault handler.
///
/// Threads whose current alternate stack is already big enough are left
/// alone. The stack is disabled and unmapped when the thread exits.
pub fn ensure_thread_alt_stack() -> Result<()> {
  let current = current_alt_stack().map_err(Error::AltStack)?;
  if current.ss_flags & libc::SS_DISABLE == 0 && current.ss_size >= ALT_STACK_SIZE {
    return Ok(());
  }

  let stack = AltStack::new().map_err(Error::AltStack)?;
  stack.activate().map_err(Error::AltStack)?;

  THREAD_ALT_STACK.with(|slot| {
    *slot.borrow_mut() = Some(ThreadAltStack { stack });
  });

  Ok(())
}

fn signal_name(signal: c_int) -> &'static str {
  if signal == libc::SIGBUS { "SIGBUS" } else { "SIGSEGV" }
}

#[cfg(any(target_os = "linux", target_os = "android"))]
unsafe fn fault_address(info: *const siginfo_t) -> *mut u8 {
  unsafe { (*info).si_addr().cast() }
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
unsafe fn fault_address(info: *const siginfo_t) -> *mut u8 {
  unsafe { (*info).si_addr.cast() }
}

extern "C" fn fault_handler(
  signal: c_int,
  info: *mut siginfo_t,
  context: *mut c_void,
) {
  // SAFETY: the kernel passes a valid siginfo for SA_SIGINFO handlers.
  let addr = unsafe { fault_address(info) };
  let state = STATE.load(Ordering::Acquire);

  if state.is_null() {
    let mut buf = [0u8; 18];
    let text = format_addr(addr as usize, &mut buf);
    write_stderr(&[b"unable to handle ", signal_name(signal).as_bytes(), b" for ", text, b"\n"]);
    // SAFETY: abort is async-signal-safe.
    unsafe { libc::abort() };
  }

  // SAFETY: non-null STATE stays valid until uninstall, which restores the
  // previous actions before freeing it.
  let state = unsafe { &*state };

  if dispatch(state.on_fault, state.on_panic, addr, signal, signal_name(signal)) {
    return;
  }

  match state.old_action(signal) {
    // SAFETY: forwarding the untouched kernel arguments.
    Some(old) => unsafe { chain(signal, old, info, context) },
    // SAFETY: abort is async-signal-safe.
    None => unsafe { libc::abort() },
  }
}

/// Hands a fault to the action that was installed before ours.
///
/// Default and ignore dispositions are restored instead of called: returning
/// re-executes the faulting access, which then takes the platform default.
unsafe fn chain(
  signal: c_int,
  old: &libc::sigaction,
  info: *mut siginfo_t,
  context: *mut c_void,
) {
  let handler = old.sa_sigaction;

  if handler == libc::SIG_DFL || handler == libc::SIG_IGN {
    unsafe { libc::sigaction(signal, old, ptr::null_mut()) };
    return;
  }

  if old.sa_flags & libc::SA_SIGINFO != 0 {
    // SAFETY: SA_SIGINFO handlers have this signature.
    let handler: extern "C" fn(c_int, *mut siginfo_t, *mut c_void) = unsafe { mem::transmute(handler) };
    handler(signal, info, context);
  } else {
    // SAFETY: plain handlers have this signature.
    let handler: extern "C" fn(c_int) = unsafe { mem::transmute(handler) };
    handler(signal);
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn never_resolves(_addr: *mut u8) -> bool {
    false
  }

  fn other_callback(_addr: *mut u8) -> bool {
    true
  }

  fn ignore_panic(_signal: i32) {}

  #[test]
  fn test_install_lifecycle() {
    let _lock = super::super::test_lock();

    install(never_resolves, ignore_panic).unwrap();
    assert!(is_installed());

    for signal in SIGNALS {
      let mut current: libc::sigaction = unsafe { mem::zeroed() };
      assert_eq!(unsafe { libc::sigaction(signal, ptr::null(), &mut current) }, 0);
      assert_eq!(current.sa_sigaction, fault_handler as *const () as usize);
      assert_ne!(current.sa_flags & libc::SA_ONSTACK, 0);
    }

    assert!(matches!(install(never_resolves, ignore_panic), Err(Error::AlreadyInstalled)));
    assert!(matches!(uninstall(other_callback), Err(Error::HandlerMismatch)));
    assert!(is_installed());

    uninstall(never_resolves).unwrap();
    assert!(!is_installed());
    assert!(matches!(uninstall(never_resolves), Err(Error::NotInstalled)));
  }

  #[test]
  fn test_thread_alt_stack() {
    std::thread::spawn(|| {
      ensure_thread_alt_stack().unwrap();

      let current = current_alt_stack().unwrap();
      assert_eq!(current.ss_flags & libc::SS_DISABLE, 0);
      assert!(current.ss_size >= ALT_STACK_SIZE);

      ensure_thread_alt_stack().unwrap();
      let again = current_alt_stack().unwrap();
      assert_eq!(again.ss_sp, current.ss_sp);
    })
    .join()
    .unwrap();
  }
}
