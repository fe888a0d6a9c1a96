//! Process-wide address space for stacks.
//!
//! ```text
//!   vm                                     stacks
//!   ┌─────────────┬──────────────────┬─────────┬─────────┬─────┬─────────┐
//!   │  bit index  │      padding     │ slot 0  │ slot 1  │ ... │ slot N-1│
//!   │  storage    │  (to slot size)  │         │         │     │         │
//!   └─────────────┴──────────────────┴─────────┴─────────┴─────┴─────────┘
//!                                    ▲
//!                                    └── aligned to STACK_SIZE
//! ```
//!
//! One reservation holds the index that hands out slots and the slots
//! themselves. Faults inside the slot range are routed to the owning stack
//! by dividing the offset by the slot size.

use std::{
  cell::UnsafeCell,
  ptr::{self, NonNull},
  sync::{
    Mutex,
    atomic::{AtomicPtr, AtomicUsize, Ordering},
  },
};

use tracing::{debug, error, trace, warn};

use crate::{
  align::align_ptr_up,
  bit_index::{Address, BitIndex},
  cast::sized_cast,
  config::{PAGE_SIZE, STACK_SIZE, STACKS_AMOUNT},
  error::{Error, Result, fatal},
  stack::Content,
  vm::{self, PanicCallback, Registration},
};

const INDEX_SIZE: usize = BitIndex::storage_size(STACKS_AMOUNT);

/// Index storage, alignment padding and every slot.
const VM_SIZE: usize = INDEX_SIZE + STACK_SIZE + STACKS_AMOUNT * STACK_SIZE;

static SPACE: AtomicPtr<VirtualSpace> = AtomicPtr::new(ptr::null_mut());

/// Serializes creation and teardown of the singleton.
static LIFECYCLE: Mutex<()> = Mutex::new(());

/// Manager of the stack slots.
///
/// Not internally synchronized: allocating, freeing and growing stacks from
/// several threads at once needs external mutual exclusion.
pub struct VirtualSpace {
  vm: NonNull<u8>,
  stacks: NonNull<u8>,
  index: UnsafeCell<BitIndex>,
  /// Stored as the raw bits of a [`PanicCallback`], zero when unset.
  panic_handler: AtomicUsize,
  registration: Option<Registration>,
}

// SAFETY: shared use follows the documented external serialization.
unsafe impl Sync for VirtualSpace {}
unsafe impl Send for VirtualSpace {}

fn handle_fault(addr: *mut u8) -> bool {
  VirtualSpace::current().is_some_and(|space| space.on_fault(addr))
}

fn handle_panic(signal: i32) {
  if let Some(handler) = VirtualSpace::current().and_then(VirtualSpace::panic_handler) {
    handler(signal);
  }
}

impl VirtualSpace {
  /// The process-wide instance, created on first use.
  ///
  /// Aborts the process if the address space cannot be set up.
  pub fn single() -> &'static Self {
    if let Some(space) = Self::current() {
      return space;
    }

    let _lifecycle = LIFECYCLE.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    if let Some(space) = Self::current() {
      return space;
    }

    match Self::new() {
      Ok(space) => {
        let space = Box::into_raw(Box::new(space));
        SPACE.store(space, Ordering::Release);
        // SAFETY: just published, freed only by `teardown`.
        unsafe { &*space }
      }
      Err(err) => {
        error!(error = %err, "unable to set up the stack address space");
        fatal("unable to set up the stack address space");
      }
    }
  }

  /// The instance, if one exists. Safe to call from the fault handler.
  pub fn current() -> Option<&'static Self> {
    let space = SPACE.load(Ordering::Acquire);
    // SAFETY: non-null SPACE points to a leaked Box until `teardown`.
    unsafe { space.as_ref() }
  }

  /// Destroys the instance, uninstalling the fault handler and releasing the
  /// reservation. The next [`VirtualSpace::single`] builds a new one.
  ///
  /// Returns `false` if there was nothing to tear down.
  ///
  /// # Safety
  ///
  /// No reference obtained from [`VirtualSpace::single`] or
  /// [`VirtualSpace::current`] may be used afterwards. Every stack must have
  /// been freed.
  pub unsafe fn teardown() -> Result<bool> {
    let _lifecycle = LIFECYCLE.lock().unwrap_or_else(|poisoned| poisoned.into_inner());

    let space = SPACE.swap(ptr::null_mut(), Ordering::AcqRel);
    if space.is_null() {
      return Ok(false);
    }

    // SAFETY: ownership returns here; SPACE no longer hands it out.
    let mut space = unsafe { Box::from_raw(space) };
    assert_eq!(space.live_stacks(), 0, "address space torn down with live stacks");

    if let Some(registration) = space.registration.take() {
      registration.uninstall()?;
    }
    // SAFETY: the whole reservation is ours and no stack refers to it.
    unsafe { vm::release(space.vm, VM_SIZE)? };

    debug!("stack address space torn down");
    Ok(true)
  }

  fn new() -> Result<Self> {
    let actual = vm::page_size();
    if PAGE_SIZE % actual != 0 {
      return Err(Error::PageSize {
        expected: PAGE_SIZE,
        actual,
      });
    }

    let vm = vm::reserve(VM_SIZE)?;

    // SAFETY: the index storage is the freshly reserved head of `vm`.
    let index = match unsafe { BitIndex::new(vm, STACKS_AMOUNT) } {
      Ok(index) => index,
      Err(err) => {
        // SAFETY: nothing refers to the reservation yet.
        let _ = unsafe { vm::release(vm, VM_SIZE) };
        return Err(err);
      }
    };

    let stacks = align_ptr_up(vm.as_ptr().wrapping_add(INDEX_SIZE), STACK_SIZE);
    // SAFETY: inside the reservation, which starts above zero.
    let stacks = unsafe { NonNull::new_unchecked(stacks) };

    let registration = match Registration::new(handle_fault, handle_panic) {
      Ok(registration) => registration,
      Err(err) => {
        // SAFETY: nothing refers to the reservation yet.
        let _ = unsafe { vm::release(vm, VM_SIZE) };
        return Err(err);
      }
    };

    debug!(
      vm = ?vm,
      stacks = ?stacks,
      slots = STACKS_AMOUNT,
      slot_size = STACK_SIZE,
      "stack address space ready"
    );

    Ok(Self {
      vm,
      stacks,
      index: UnsafeCell::new(index),
      panic_handler: AtomicUsize::new(0),
      registration: Some(registration),
    })
  }

  /// Takes a free slot and builds a stack in it.
  ///
  /// Running out of slots is fatal.
  pub fn allocate_stack_content(&self) -> Content {
    // SAFETY: callers serialize access to the manager.
    let index = unsafe { &mut *self.index.get() };

    let Some(address) = index.allocate() else {
      warn!(slots = STACKS_AMOUNT, "stack slots exhausted");
      fatal("unable to allocate new stack, no space available");
    };

    // SAFETY: the slot was free, so nothing lives there.
    match unsafe { Content::create(self.slot(address)) } {
      Ok(content) => {
        trace!(address, id = content.header().id, "stack allocated");
        content
      }
      Err(err) => {
        error!(error = %err, address, "unable to create stack");
        fatal("unable to create stack");
      }
    }
  }

  /// Destroys `content` and returns its slot.
  pub fn free_stack_content(
    &self,
    content: Content,
  ) {
    // SAFETY: callers serialize access to the manager.
    let index = unsafe { &mut *self.index.get() };

    let address = self
      .address_of(content.base().as_ptr())
      .filter(|&address| index.is_allocated(address));
    let Some(address) = address else {
      panic!("free of a stack not owned by this address space");
    };

    let id = content.header().id;
    // SAFETY: the handle owning the content gave it up.
    if let Err(err) = unsafe { content.destroy() } {
      error!(error = %err, address, id, "unable to destroy stack");
      fatal("unable to destroy stack");
    }

    index.deallocate(address);
    trace!(address, id, "stack freed");
  }

  /// Replaces the callback run for faults no stack can resolve.
  pub fn set_panic_handler(
    &self,
    handler: PanicCallback,
  ) {
    // SAFETY: function pointers are pointer sized.
    let raw: usize = unsafe { sized_cast(handler) };
    self.panic_handler.store(raw, Ordering::Release);
  }

  pub fn panic_handler(&self) -> Option<PanicCallback> {
    let raw = self.panic_handler.load(Ordering::Acquire);
    // SAFETY: nonzero values were stored by `set_panic_handler`.
    (raw != 0).then(|| unsafe { sized_cast(raw) })
  }

  /// Resolves a fault at `addr` if it belongs to a live stack.
  ///
  /// Runs inside the fault handler.
  pub fn on_fault(
    &self,
    addr: *mut u8,
  ) -> bool {
    let Some(address) = self.address_of(addr) else {
      return false;
    };

    // SAFETY: faults are delivered one at a time and the index is only
    // mutated under external serialization.
    let index = unsafe { &*self.index.get() };
    if !index.is_allocated(address) {
      return false;
    }

    let slot = self.slot(address);
    let offset = addr as usize - slot.as_ptr() as usize;

    // SAFETY: the slot is allocated, so it holds a live stack.
    let mut content = unsafe { Content::attach(slot) };
    content.on_fault(offset)
  }

  /// Bytes per slot.
  pub fn slot_size(&self) -> usize {
    STACK_SIZE
  }

  pub fn slot_count(&self) -> usize {
    STACKS_AMOUNT
  }

  /// Number of stacks currently allocated.
  pub fn live_stacks(&self) -> usize {
    // SAFETY: callers serialize access to the manager.
    unsafe { &*self.index.get() }.len()
  }

  /// Highest slot ever handed out.
  pub fn high_water(&self) -> Option<Address> {
    // SAFETY: callers serialize access to the manager.
    unsafe { &*self.index.get() }.high_water()
  }

  /// Whether `addr` lies inside the slot range.
  pub fn contains(
    &self,
    addr: *const u8,
  ) -> bool {
    self.address_of(addr).is_some()
  }

  fn slot(
    &self,
    address: Address,
  ) -> NonNull<u8> {
    // SAFETY: `address` is below the slot count, so the slot is inside the
    // reservation.
    unsafe { self.stacks.add(address * STACK_SIZE) }
  }

  fn address_of(
    &self,
    addr: *const u8,
  ) -> Option<Address> {
    let offset = (addr as usize).checked_sub(self.stacks.as_ptr() as usize)?;
    let address = offset / STACK_SIZE;
    (address < STACKS_AMOUNT).then_some(address)
  }
}
