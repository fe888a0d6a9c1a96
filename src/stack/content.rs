use std::{
  ptr::NonNull,
  sync::atomic::{AtomicU64, Ordering},
};

use tracing::trace;

use super::{
  header::Header,
  layout::{DefaultLayout, Layout},
};
use crate::{
  config::{STACK_GROWS_DOWN, STACK_SIZE, STACK_USE_GUARD_PAGE},
  error::Result,
};

const _: () = assert!(
  DefaultLayout::GROWS_DOWN == STACK_GROWS_DOWN && DefaultLayout::HAS_GUARD == STACK_USE_GUARD_PAGE
);

/// Serial handed to every constructed stack.
static NEXT_ID: AtomicU64 = AtomicU64::new(1);

/// One slot's worth of stack, laid out by [`DefaultLayout`].
#[derive(Debug)]
pub struct Content {
  layout: DefaultLayout,
}

impl Content {
  /// Builds a fresh stack in the slot starting at `slot`.
  ///
  /// # Safety
  ///
  /// `slot` must start a free, reserved and inaccessible slot of
  /// [`STACK_SIZE`] bytes.
  pub(crate) unsafe fn create(slot: NonNull<u8>) -> Result<Self> {
    let id = NEXT_ID.fetch_add(1, Ordering::Relaxed);
    let layout = unsafe { DefaultLayout::create(slot, STACK_SIZE, id)? };

    trace!(
      id,
      slot = ?slot,
      mapped = layout.header().mapped_size(),
      "stack created"
    );

    Ok(Self { layout })
  }

  /// Views a stack built earlier by [`Content::create`].
  ///
  /// # Safety
  ///
  /// `slot` must hold a live stack.
  pub(crate) unsafe fn attach(slot: NonNull<u8>) -> Self {
    Self {
      layout: unsafe { DefaultLayout::attach(slot, STACK_SIZE) },
    }
  }

  /// # Safety
  ///
  /// Nothing may run on or point into the stack anymore.
  pub(crate) unsafe fn destroy(self) -> Result<()> {
    let id = self.header().id;
    unsafe { self.layout.destroy()? };
    trace!(id, "stack destroyed");
    Ok(())
  }

  /// First byte of the slot.
  pub fn base(&self) -> NonNull<u8> {
    self.layout.area()
  }

  pub fn header(&self) -> &Header {
    self.layout.header()
  }

  pub fn compact(&mut self) -> Result<()> {
    self.layout.compact()
  }

  pub(crate) fn on_fault(
    &mut self,
    offset: usize,
  ) -> bool {
    self.layout.on_fault(offset)
  }
}
