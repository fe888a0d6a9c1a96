//! Growable stacks.
//!
//! A [`Stack`] owns one slot of the process-wide [`VirtualSpace`]. Only the
//! header and a small margin are mapped on creation; the rest is mapped page
//! by page as execution touches it and can be handed back with
//! [`Stack::compact`].
//!
//! ```text
//!   Stack::initialize()          touch below mapped          compact()
//!
//!   ┌──────────┐ end             ┌──────────┐                ┌──────────┐
//!   │ mapped   │                 │ mapped   │                │ mapped   │
//!   ├──────────┤ mapped          │          │                ├──────────┤
//!   │          │                 │          │                │          │
//!   │ unmapped │      ──────►    ├──────────┤    ──────►     │ unmapped │
//!   │          │                 │ unmapped │                │          │
//!   └──────────┘ begin           └──────────┘                └──────────┘
//! ```

mod content;
mod header;
mod layout;

use tracing::error;

pub use content::Content;
pub use header::{HEADER_SIZE, Header};
pub use layout::{DefaultLayout, Downward, Guarded, Layout, Upward};

use crate::{error::fatal, space::VirtualSpace};

/// Move-only handle to a growable stack.
///
/// A default handle is uninitialized; every accessor except
/// [`Stack::initialized`] panics on it. Dropping an initialized handle
/// returns its slot.
#[derive(Debug, Default)]
pub struct Stack {
  content: Option<Content>,
}

impl Stack {
  pub const fn new() -> Self {
    Self { content: None }
  }

  /// Allocates a slot for this handle.
  ///
  /// Aborts the process if no slot is left.
  pub fn initialize(&mut self) {
    assert!(self.content.is_none(), "stack is already initialized");
    self.content = Some(VirtualSpace::single().allocate_stack_content());
  }

  pub fn initialized(&self) -> bool {
    self.content.is_some()
  }

  pub fn grows_down(&self) -> bool {
    self.header().grows_down
  }

  pub fn has_guard(&self) -> bool {
    self.header().has_guard
  }

  /// Lowest usable address.
  pub fn begin(&self) -> *mut u8 {
    self.header().userspace_begin
  }

  /// One past the highest usable address.
  pub fn end(&self) -> *mut u8 {
    self.header().userspace_end
  }

  /// Usable bytes, mapped or not.
  pub fn size(&self) -> usize {
    self.header().size()
  }

  pub fn header(&self) -> &Header {
    self.content().header()
  }

  /// Unmaps pages past the in-use position of the running stack.
  ///
  /// Only has an effect when called while running on this stack.
  pub fn compact(&mut self) {
    let content = self.content.as_mut().expect("use of an uninitialized stack");
    if let Err(err) = content.compact() {
      error!(error = %err, id = content.header().id, "unable to compact stack");
      fatal("unable to compact stack");
    }
  }

  fn content(&self) -> &Content {
    self.content.as_ref().expect("use of an uninitialized stack")
  }
}

impl Drop for Stack {
  fn drop(&mut self) {
    if let Some(content) = self.content.take() {
      VirtualSpace::single().free_stack_content(content);
    }
  }
}
