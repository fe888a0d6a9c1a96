//! # rstack - Growable Stacks for Fibers
//!
//! This crate provides **growable, guard-protected stacks** for user-level
//! threads (fibers, coroutines). Every stack lives in a fixed-size slot of one
//! large reserved address range, and only the pages a stack actually touches
//! are backed by memory.
//!
//! ## Overview
//!
//! Reserving address space is cheap; backing it is not. A fiber stack is
//! reserved at its full size but mapped lazily:
//!
//! ```text
//!   One Stack Slot (growing down, with guard page):
//!
//!   ┌──────────────────────────────────────────────────────────────────────┐
//!   │                         STACK SLOT                                   │
//!   │                                                                      │
//!   │   ┌───────┬───────────────────────────────┬───────────────┬───────┐  │
//!   │   │ guard │          unmapped             │    mapped     │header │  │
//!   │   └───────┴───────────────────────────────┴───────────────┴───────┘  │
//!   │           ▲                               ▲               ▲          │
//!   │           │                               │               │          │
//!   │         begin                          mapped            end         │
//!   │                                      boundary                        │
//!   └──────────────────────────────────────────────────────────────────────┘
//!
//!   A touch below the mapped boundary faults. The fault handler maps the
//!   touched page and execution resumes as if nothing happened.
//!   A touch of the guard page is a stack overflow and stays fatal.
//! ```
//!
//! ## Crate Structure
//!
//! ```text
//!   rstack
//!   ├── align      - Alignment helpers (align_up, align_down, align_to!)
//!   ├── cast       - Same-size reinterpretation (sized_cast)
//!   ├── config     - Build-time constants
//!   ├── error      - Error type and fatal-path diagnostics
//!   ├── vm         - Reserve, protect, release and the fault handler
//!   ├── bit_index  - Hierarchical allocator of slot numbers
//!   ├── space      - VirtualSpace, the process-wide slot manager
//!   ├── stack      - Stack handle, header and layouts
//!   └── heap       - Size-classed pooled heap
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use rstack::Stack;
//!
//! let mut stack = Stack::new();
//! stack.initialize();
//!
//! println!(
//!   "usable {:?}..{:?}, {} bytes, grows down: {}",
//!   stack.begin(),
//!   stack.end(),
//!   stack.size(),
//!   stack.grows_down(),
//! );
//!
//! // Switch a fiber onto [begin, end) here.
//!
//! drop(stack);
//! ```
//!
//! ## How It Works
//!
//! The [`VirtualSpace`] reserves one range on first use:
//!
//! ```text
//!   Reserved Range:
//!
//!   Low Address                                               High Address
//!   ┌─────────────┬──────────┬─────────┬─────────┬─────────┬─────┬─────────┐
//!   │  bit index  │ padding  │ slot 0  │ slot 1  │ slot 2  │ ... │ slot N-1│
//!   └─────────────┴──────────┴─────────┴─────────┴─────────┴─────┴─────────┘
//!         │                       ▲
//!         │                       │
//!         └── hands out the lowest free slot number
//! ```
//!
//! and installs a process-wide fault handler. A fault address inside the slot
//! range is turned back into a slot number by dividing its offset by the slot
//! size; the slot's layout then decides whether the fault is growth (map the
//! page, resume) or an overflow (report, hand over to the previous handler).
//!
//! The bit index keeps one bit per slot at the bottom and small occupancy
//! counters above, so finding the lowest free slot skips full subtrees. Its own
//! storage is backed only up to the highest slot ever used.
//!
//! ## Features
//!
//! - **Lazy backing**: untouched stack pages cost no memory
//! - **Guard pages**: overflows trap instead of corrupting a neighbour
//! - **Compaction**: [`Stack::compact`] hands unused pages back
//! - **Both directions**: `grows-up` and `no-guard` Cargo features pick the layout
//! - **Unix and Windows**: signals with an alternate stack, or a vectored
//!   exception handler
//!
//! ## Limitations
//!
//! - **Not internally synchronized**: allocate and free stacks from one
//!   thread, or serialize access yourself
//! - **Fixed capacity**: slot size and slot count are compile-time constants
//! - **Fatal exhaustion**: running out of slots aborts the process
//!
//! ## Safety
//!
//! The crate maps and unmaps memory under running code and owns the
//! process-wide fault handler. Threads other than the first user that run on
//! these stacks should call [`vm::ensure_thread_alt_stack`] so the handler
//! has somewhere to run when their stack is exhausted.

pub mod align;
pub mod bit_index;
pub mod cast;
pub mod config;
pub mod error;
pub mod heap;
pub mod space;
pub mod stack;
pub mod vm;

pub use error::{Error, Result};
pub use heap::Heap;
pub use space::VirtualSpace;
pub use stack::Stack;
