//! Memory layouts of a growable stack slot.
//!
//! ```text
//!   Downward (optionally behind a guard page at the low end):
//!
//!   area                                                        area + size
//!   ┌────────┬──────────────────────────────┬──────────────────┬─────────┐
//!   │ guard  │        unmapped              │   mapped  ◄───── │ header  │
//!   └────────┴──────────────────────────────┴──────────────────┴─────────┘
//!            ▲                              ▲                  ▲
//!          begin                          mapped              end
//!
//!   Upward (optionally before a guard page at the high end):
//!
//!   ┌─────────┬──────────────────┬──────────────────────────────┬────────┐
//!   │ header  │ ─────► mapped    │        unmapped              │ guard  │
//!   └─────────┴──────────────────┴──────────────────────────────┴────────┘
//!             ▲                  ▲                              ▲
//!           begin              mapped                          end
//! ```
//!
//! The mapped part always starts at the header and reaches towards the far
//! end. Faults past the boundary move it further out, page by page;
//! compaction pulls it back towards the in-use position.

use std::{cmp, hint, ptr::NonNull};

use tracing::trace;

use super::header::{HEADER_SIZE, Header};
use crate::{
  align::{align_ptr_down, align_ptr_up},
  config::{PAGE_SIZE, STACK_KEEP_PROTECTED_BYTES},
  error::{Result, fatal, write_stderr},
  vm::{self, HAS_DISTINCT_GUARD, Protection},
};

/// A view over one stack slot whose header lives inside the slot.
pub trait Layout: Sized {
  const GROWS_DOWN: bool;
  const HAS_GUARD: bool;

  /// Maps the header plus the retained margin and writes a fresh header.
  ///
  /// # Safety
  ///
  /// `area` must be page aligned, span `size` bytes (a multiple of the page
  /// size) of reserved, inaccessible memory and not hold another stack.
  unsafe fn create(
    area: NonNull<u8>,
    size: usize,
    id: u64,
  ) -> Result<Self>;

  /// Views an area set up earlier by [`Layout::create`].
  ///
  /// # Safety
  ///
  /// `area` and `size` must match a live `create` call.
  unsafe fn attach(
    area: NonNull<u8>,
    size: usize,
  ) -> Self;

  /// Unmaps every page the stack still holds.
  ///
  /// # Safety
  ///
  /// Nothing may run on or point into the stack anymore.
  unsafe fn destroy(self) -> Result<()>;

  fn area(&self) -> NonNull<u8>;

  fn header(&self) -> &Header;

  fn header_mut(&mut self) -> &mut Header;

  /// Handles an access at `offset` bytes into the area.
  ///
  /// Returns `true` if the access may be retried. Runs inside the fault
  /// handler and so neither logs nor allocates.
  fn on_fault(
    &mut self,
    offset: usize,
  ) -> bool;

  /// Shrinks the mapping towards `probe`, the current in-use position.
  ///
  /// Keeps at least [`STACK_KEEP_PROTECTED_BYTES`] beyond the probe and never
  /// goes below the initial mapping. A probe outside the usable extent
  /// leaves the stack untouched.
  fn compact_at(
    &mut self,
    probe: *const u8,
  ) -> Result<()>;

  /// Shrinks the mapping towards the calling frame.
  ///
  /// Only meaningful while running on this stack.
  fn compact(&mut self) -> Result<()> {
    self.compact_at(stack_probe())
  }
}

/// Address inside the caller's frame.
#[inline(never)]
fn stack_probe() -> *const u8 {
  let marker = 0u8;
  hint::black_box(&raw const marker)
}

/// Growth from inside the fault handler; failure is fatal.
fn grown_or_abort(grown: Result<*mut u8>) -> *mut u8 {
  match grown {
    Ok(mapped) => mapped,
    Err(_) => fatal("unable to protect stack region"),
  }
}

fn mapped_margin(size: usize) -> usize {
  cmp::min(size, HEADER_SIZE + STACK_KEEP_PROTECTED_BYTES)
}

/// Stack growing from high to low addresses, header at the top.
#[derive(Debug)]
pub struct Downward {
  area: NonNull<u8>,
  size: usize,
}

impl Downward {
  fn highest(&self) -> *mut u8 {
    self.area.as_ptr().wrapping_add(self.size)
  }

  /// Boundary right after construction; compaction never goes above it.
  fn min_bound(&self) -> *mut u8 {
    align_ptr_down(self.highest().wrapping_sub(mapped_margin(self.size)), PAGE_SIZE)
  }

  /// Page right below `boundary`, unless the boundary reached the low end.
  fn rolling_guard(
    &self,
    boundary: *mut u8,
  ) -> Option<*mut u8> {
    (boundary > self.area.as_ptr()).then(|| boundary.wrapping_sub(PAGE_SIZE))
  }

  /// Arms the page past `boundary` with [`Protection::Guard`] where the
  /// platform has a distinct guard protection.
  unsafe fn place_guard(
    &self,
    boundary: *mut u8,
  ) -> Result<()> {
    if HAS_DISTINCT_GUARD && let Some(page) = self.rolling_guard(boundary) {
      unsafe { vm::protect(page, PAGE_SIZE, Protection::Guard)? };
    }
    Ok(())
  }

  unsafe fn extend(
    &self,
    old: *mut u8,
    target: *mut u8,
  ) -> Result<*mut u8> {
    let new = align_ptr_down(target, PAGE_SIZE);
    if new >= old {
      return Ok(old);
    }

    unsafe {
      vm::protect(new, old as usize - new as usize, Protection::ReadWrite)?;
      self.place_guard(new)?;
    }
    Ok(new)
  }

  /// Unmaps `[old, target)` together with the guard below `old`. The caller
  /// re-arms the guard if the stack stays in use.
  unsafe fn reduce(
    &self,
    old: *mut u8,
    target: *mut u8,
  ) -> Result<*mut u8> {
    let new = align_ptr_down(target, PAGE_SIZE);
    if new <= old {
      return Ok(old);
    }

    let from = match self.rolling_guard(old) {
      Some(page) if HAS_DISTINCT_GUARD => page,
      _ => old,
    };
    unsafe { vm::protect(from, new as usize - from as usize, Protection::NoAccess)? };
    Ok(new)
  }
}

impl Layout for Downward {
  const GROWS_DOWN: bool = true;
  const HAS_GUARD: bool = false;

  unsafe fn create(
    area: NonNull<u8>,
    size: usize,
    id: u64,
  ) -> Result<Self> {
    debug_assert_eq!(area.as_ptr() as usize % PAGE_SIZE, 0);
    debug_assert_eq!(size % PAGE_SIZE, 0);

    let layout = Self { area, size };
    let highest = layout.highest();
    let mapped = unsafe { layout.extend(highest, highest.wrapping_sub(mapped_margin(size)))? };

    let header = layout.highest().wrapping_sub(HEADER_SIZE);
    // SAFETY: the header lies inside the pages mapped above.
    unsafe {
      header.cast::<Header>().write(Header {
        userspace_begin: area.as_ptr(),
        userspace_end: header,
        userspace_mapped: mapped,
        grows_down: true,
        has_guard: false,
        id,
      });
    }

    Ok(layout)
  }

  unsafe fn attach(
    area: NonNull<u8>,
    size: usize,
  ) -> Self {
    Self { area, size }
  }

  unsafe fn destroy(self) -> Result<()> {
    let mapped = self.header().userspace_mapped;
    let highest = self.highest();
    unsafe { self.reduce(mapped, highest)? };
    Ok(())
  }

  fn area(&self) -> NonNull<u8> {
    self.area
  }

  fn header(&self) -> &Header {
    // SAFETY: written by `create` into memory that stays mapped until
    // `destroy` consumes the layout.
    unsafe { &*self.highest().wrapping_sub(HEADER_SIZE).cast::<Header>() }
  }

  fn header_mut(&mut self) -> &mut Header {
    // SAFETY: see `header`.
    unsafe { &mut *self.highest().wrapping_sub(HEADER_SIZE).cast::<Header>() }
  }

  fn on_fault(
    &mut self,
    offset: usize,
  ) -> bool {
    if offset >= self.size {
      return false;
    }

    let addr = self.area.as_ptr().wrapping_add(offset);
    let header = self.header();
    if addr >= header.userspace_end {
      return false;
    }

    let old = header.userspace_mapped;
    if addr < old {
      // SAFETY: the range between the fault and the boundary is in this slot.
      let new = grown_or_abort(unsafe { self.extend(old, addr) });
      self.header_mut().userspace_mapped = new;
    }

    true
  }

  fn compact_at(
    &mut self,
    probe: *const u8,
  ) -> Result<()> {
    let header = self.header();
    if !header.contains(probe) {
      return Ok(());
    }

    let target = cmp::max(
      probe.cast_mut().wrapping_sub(STACK_KEEP_PROTECTED_BYTES),
      self.area.as_ptr(),
    );
    let target = cmp::min(target, self.min_bound());
    let old = header.userspace_mapped;

    let new = unsafe { self.reduce(old, target)? };
    if new != old {
      unsafe { self.place_guard(new)? };
      trace!(id = self.header().id, released = new as usize - old as usize, "stack compacted");
      self.header_mut().userspace_mapped = new;
    }

    Ok(())
  }
}

/// Stack growing from low to high addresses, header at the bottom.
#[derive(Debug)]
pub struct Upward {
  area: NonNull<u8>,
  size: usize,
}

impl Upward {
  fn highest(&self) -> *mut u8 {
    self.area.as_ptr().wrapping_add(self.size)
  }

  /// Boundary right after construction; compaction never goes below it.
  fn min_bound(&self) -> *mut u8 {
    align_ptr_up(self.area.as_ptr().wrapping_add(mapped_margin(self.size)), PAGE_SIZE)
  }

  /// Page starting at `boundary`, unless the boundary reached the high end.
  fn rolling_guard(
    &self,
    boundary: *mut u8,
  ) -> Option<*mut u8> {
    (boundary < self.highest()).then_some(boundary)
  }

  unsafe fn place_guard(
    &self,
    boundary: *mut u8,
  ) -> Result<()> {
    if HAS_DISTINCT_GUARD && let Some(page) = self.rolling_guard(boundary) {
      unsafe { vm::protect(page, PAGE_SIZE, Protection::Guard)? };
    }
    Ok(())
  }

  unsafe fn extend(
    &self,
    old: *mut u8,
    target: *mut u8,
  ) -> Result<*mut u8> {
    let new = align_ptr_up(target, PAGE_SIZE);
    if new <= old {
      return Ok(old);
    }

    unsafe {
      vm::protect(old, new as usize - old as usize, Protection::ReadWrite)?;
      self.place_guard(new)?;
    }
    Ok(new)
  }

  unsafe fn reduce(
    &self,
    old: *mut u8,
    target: *mut u8,
  ) -> Result<*mut u8> {
    let new = align_ptr_up(target, PAGE_SIZE);
    if new >= old {
      return Ok(old);
    }

    let to = match self.rolling_guard(old) {
      Some(page) if HAS_DISTINCT_GUARD => page.wrapping_add(PAGE_SIZE),
      _ => old,
    };
    unsafe { vm::protect(new, to as usize - new as usize, Protection::NoAccess)? };
    Ok(new)
  }
}

impl Layout for Upward {
  const GROWS_DOWN: bool = false;
  const HAS_GUARD: bool = false;

  unsafe fn create(
    area: NonNull<u8>,
    size: usize,
    id: u64,
  ) -> Result<Self> {
    debug_assert_eq!(area.as_ptr() as usize % PAGE_SIZE, 0);
    debug_assert_eq!(size % PAGE_SIZE, 0);

    let layout = Self { area, size };
    let lowest = area.as_ptr();
    let mapped = unsafe { layout.extend(lowest, lowest.wrapping_add(mapped_margin(size)))? };

    // SAFETY: the header lies inside the pages mapped above.
    unsafe {
      lowest.cast::<Header>().write(Header {
        userspace_begin: lowest.wrapping_add(HEADER_SIZE),
        userspace_end: layout.highest(),
        userspace_mapped: mapped,
        grows_down: false,
        has_guard: false,
        id,
      });
    }

    Ok(layout)
  }

  unsafe fn attach(
    area: NonNull<u8>,
    size: usize,
  ) -> Self {
    Self { area, size }
  }

  unsafe fn destroy(self) -> Result<()> {
    let mapped = self.header().userspace_mapped;
    unsafe { self.reduce(mapped, self.area.as_ptr())? };
    Ok(())
  }

  fn area(&self) -> NonNull<u8> {
    self.area
  }

  fn header(&self) -> &Header {
    // SAFETY: written by `create` into memory that stays mapped until
    // `destroy` consumes the layout.
    unsafe { &*self.area.as_ptr().cast::<Header>() }
  }

  fn header_mut(&mut self) -> &mut Header {
    // SAFETY: see `header`.
    unsafe { &mut *self.area.as_ptr().cast::<Header>() }
  }

  fn on_fault(
    &mut self,
    offset: usize,
  ) -> bool {
    if offset >= self.size {
      return false;
    }

    let addr = self.area.as_ptr().wrapping_add(offset);
    let header = self.header();
    if addr < header.userspace_begin {
      return false;
    }

    let old = header.userspace_mapped;
    if addr >= old {
      // SAFETY: see `Downward::on_fault`.
      let new = grown_or_abort(unsafe { self.extend(old, addr.wrapping_add(1)) });
      self.header_mut().userspace_mapped = new;
    }

    true
  }

  fn compact_at(
    &mut self,
    probe: *const u8,
  ) -> Result<()> {
    let header = self.header();
    if !header.contains(probe) {
      return Ok(());
    }

    let target = cmp::min(
      probe.cast_mut().wrapping_add(STACK_KEEP_PROTECTED_BYTES),
      self.highest(),
    );
    let target = cmp::max(target, self.min_bound());
    let old = header.userspace_mapped;

    let new = unsafe { self.reduce(old, target)? };
    if new != old {
      unsafe { self.place_guard(new)? };
      trace!(id = self.header().id, released = old as usize - new as usize, "stack compacted");
      self.header_mut().userspace_mapped = new;
    }

    Ok(())
  }
}

/// Wraps a layout with one permanently inaccessible page on the side the
/// stack grows towards.
#[derive(Debug)]
pub struct Guarded<L> {
  area: NonNull<u8>,
  size: usize,
  inner: L,
}

impl<L: Layout> Guarded<L> {
  fn guard_page(
    area: NonNull<u8>,
    size: usize,
  ) -> *mut u8 {
    if L::GROWS_DOWN {
      area.as_ptr()
    } else {
      area.as_ptr().wrapping_add(size - PAGE_SIZE)
    }
  }

  fn inner_area(area: NonNull<u8>) -> NonNull<u8> {
    if L::GROWS_DOWN {
      // SAFETY: the area spans more than one page.
      unsafe { area.add(PAGE_SIZE) }
    } else {
      area
    }
  }
}

impl<L: Layout> Layout for Guarded<L> {
  const GROWS_DOWN: bool = L::GROWS_DOWN;
  const HAS_GUARD: bool = true;

  unsafe fn create(
    area: NonNull<u8>,
    size: usize,
    id: u64,
  ) -> Result<Self> {
    debug_assert!(size > PAGE_SIZE);

    let mut inner = unsafe { L::create(Self::inner_area(area), size - PAGE_SIZE, id)? };
    inner.header_mut().has_guard = true;

    if HAS_DISTINCT_GUARD {
      unsafe { vm::protect(Self::guard_page(area, size), PAGE_SIZE, Protection::Guard)? };
    }

    Ok(Self { area, size, inner })
  }

  unsafe fn attach(
    area: NonNull<u8>,
    size: usize,
  ) -> Self {
    let inner = unsafe { L::attach(Self::inner_area(area), size - PAGE_SIZE) };
    Self { area, size, inner }
  }

  unsafe fn destroy(self) -> Result<()> {
    unsafe { self.inner.destroy()? };

    if HAS_DISTINCT_GUARD {
      unsafe { vm::protect(Self::guard_page(self.area, self.size), PAGE_SIZE, Protection::NoAccess)? };
    }

    Ok(())
  }

  fn area(&self) -> NonNull<u8> {
    self.area
  }

  fn header(&self) -> &Header {
    self.inner.header()
  }

  fn header_mut(&mut self) -> &mut Header {
    self.inner.header_mut()
  }

  fn on_fault(
    &mut self,
    offset: usize,
  ) -> bool {
    if offset >= self.size {
      return false;
    }

    let in_guard = if L::GROWS_DOWN {
      offset < PAGE_SIZE
    } else {
      offset >= self.size - PAGE_SIZE
    };

    if in_guard {
      write_stderr(&[b"prevent access to stack guard page\n"]);
      return false;
    }

    let inner_offset = if L::GROWS_DOWN { offset - PAGE_SIZE } else { offset };
    self.inner.on_fault(inner_offset)
  }

  fn compact_at(
    &mut self,
    probe: *const u8,
  ) -> Result<()> {
    self.inner.compact_at(probe)
  }
}

cfg_if::cfg_if! {
  if #[cfg(all(feature = "grows-up", feature = "no-guard"))] {
    /// Layout chosen for this build.
    pub type DefaultLayout = Upward;
  } else if #[cfg(feature = "grows-up")] {
    /// Layout chosen for this build.
    pub type DefaultLayout = Guarded<Upward>;
  } else if #[cfg(feature = "no-guard")] {
    /// Layout chosen for this build.
    pub type DefaultLayout = Downward;
  } else {
    /// Layout chosen for this build.
    pub type DefaultLayout = Guarded<Downward>;
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  const SIZE: usize = 32 * PAGE_SIZE;

  /// A reserved area holding one layout, released on drop.
  struct Slot<L: Layout> {
    area: NonNull<u8>,
    layout: Option<L>,
  }

  impl<L: Layout> Slot<L> {
    fn new() -> Self {
      let area = vm::reserve(SIZE).unwrap();
      let layout = unsafe { L::create(area, SIZE, 7) }.unwrap();
      Self {
        area,
        layout: Some(layout),
      }
    }

    fn layout(&mut self) -> &mut L {
      self.layout.as_mut().unwrap()
    }

    fn offset_of(
      &self,
      addr: *const u8,
    ) -> usize {
      addr as usize - self.area.as_ptr() as usize
    }

    fn mapped(&mut self) -> *mut u8 {
      self.layout().header().userspace_mapped
    }
  }

  impl<L: Layout> Drop for Slot<L> {
    fn drop(&mut self) {
      if let Some(layout) = self.layout.take() {
        unsafe { layout.destroy() }.unwrap();
      }
      unsafe { vm::release(self.area, SIZE) }.unwrap();
    }
  }

  fn touch(addr: *mut u8) {
    unsafe {
      addr.write_volatile(0xa5);
      assert_eq!(addr.read_volatile(), 0xa5);
    }
  }

  #[test]
  fn test_downward_construction() {
    let mut slot = Slot::<Downward>::new();
    let area = slot.area.as_ptr();
    let header = slot.layout().header();

    assert!(header.grows_down);
    assert!(!header.has_guard);
    assert_eq!(header.id, 7);
    assert_eq!(header.userspace_begin, area);
    assert_eq!(header.userspace_end, area.wrapping_add(SIZE - HEADER_SIZE));
    assert_eq!(header.userspace_mapped as usize % PAGE_SIZE, 0);
    assert!(header.mapped_size() >= STACK_KEEP_PROTECTED_BYTES);

    touch(header.userspace_end.wrapping_sub(1));
    touch(header.userspace_mapped);
  }

  #[test]
  fn test_upward_construction() {
    let mut slot = Slot::<Upward>::new();
    let area = slot.area.as_ptr();
    let header = slot.layout().header();

    assert!(!header.grows_down);
    assert_eq!(header.userspace_begin, area.wrapping_add(HEADER_SIZE));
    assert_eq!(header.userspace_end, area.wrapping_add(SIZE));
    assert!(header.mapped_size() >= STACK_KEEP_PROTECTED_BYTES);

    touch(header.userspace_begin);
    touch(header.userspace_mapped.wrapping_sub(1));
  }

  #[test]
  fn test_downward_growth() {
    let mut slot = Slot::<Downward>::new();
    let old = slot.mapped();

    let target = old.wrapping_sub(3 * PAGE_SIZE + 10);
    let offset = slot.offset_of(target);
    assert!(slot.layout().on_fault(offset));

    let mapped = slot.mapped();
    assert_eq!(mapped, align_ptr_down(target, PAGE_SIZE));
    touch(target);
    touch(mapped);

    assert!(slot.layout().on_fault(offset));
    assert!(slot.layout().on_fault(offset + PAGE_SIZE));
    assert_eq!(slot.mapped(), mapped);
  }

  #[test]
  fn test_upward_growth_on_boundary() {
    let mut slot = Slot::<Upward>::new();
    let old = slot.mapped();

    let offset = slot.offset_of(old);
    assert!(slot.layout().on_fault(offset));
    assert_eq!(slot.mapped(), old.wrapping_add(PAGE_SIZE));
    touch(old);

    assert!(slot.layout().on_fault(offset));
    assert_eq!(slot.mapped(), old.wrapping_add(PAGE_SIZE));
  }

  #[test]
  fn test_fault_outside_usable_extent() {
    let mut down = Slot::<Downward>::new();
    let header_offset = SIZE - HEADER_SIZE;
    assert!(!down.layout().on_fault(header_offset));
    assert!(!down.layout().on_fault(SIZE));
    assert!(down.layout().on_fault(0));
    assert_eq!(down.mapped(), down.area.as_ptr());

    let mut up = Slot::<Upward>::new();
    assert!(!up.layout().on_fault(0));
    assert!(!up.layout().on_fault(SIZE));
    assert!(up.layout().on_fault(SIZE - 1));
    assert_eq!(up.mapped(), up.area.as_ptr().wrapping_add(SIZE));
  }

  #[test]
  fn test_guarded_downward() {
    let mut slot = Slot::<Guarded<Downward>>::new();
    let area = slot.area.as_ptr();
    let header = slot.layout().header();

    assert!(header.has_guard);
    assert!(header.grows_down);

    let begin = header.userspace_begin;
    assert_eq!(begin, area.wrapping_add(PAGE_SIZE));
    let offset = slot.offset_of(begin);

    assert!(!slot.layout().on_fault(offset - 1));
    assert!(!slot.layout().on_fault(0));

    assert!(slot.layout().on_fault(offset));
    assert_eq!(slot.mapped(), begin);
    touch(begin);
  }

  #[test]
  fn test_guarded_upward() {
    let mut slot = Slot::<Guarded<Upward>>::new();
    let header = slot.layout().header();

    assert!(header.has_guard);
    assert!(!header.grows_down);

    let end = header.userspace_end;
    assert_eq!(end, slot.area.as_ptr().wrapping_add(SIZE - PAGE_SIZE));
    let offset = slot.offset_of(end);

    assert!(!slot.layout().on_fault(offset));
    assert!(!slot.layout().on_fault(SIZE - 1));

    assert!(slot.layout().on_fault(offset - 1));
    assert_eq!(slot.mapped(), end);
    touch(end.wrapping_sub(1));
  }

  #[test]
  fn test_guard_offset_grows_unguarded_layout() {
    let mut guarded = Slot::<Guarded<Downward>>::new();
    let mut plain = Slot::<Downward>::new();

    let offset = PAGE_SIZE - 1;
    assert!(!guarded.layout().on_fault(offset));
    assert!(plain.layout().on_fault(offset));
    assert_eq!(plain.mapped(), plain.area.as_ptr());
  }

  #[test]
  fn test_rolling_guard_placement() {
    let mut down = Slot::<Downward>::new();
    let mapped = down.mapped();
    let lowest = down.area.as_ptr();
    assert_eq!(down.layout().rolling_guard(mapped), Some(mapped.wrapping_sub(PAGE_SIZE)));
    assert_eq!(down.layout().rolling_guard(lowest.wrapping_add(PAGE_SIZE)), Some(lowest));
    assert_eq!(down.layout().rolling_guard(lowest), None);

    let mut up = Slot::<Upward>::new();
    let mapped = up.mapped();
    let highest = up.area.as_ptr().wrapping_add(SIZE);
    assert_eq!(up.layout().rolling_guard(mapped), Some(mapped));
    assert_eq!(
      up.layout().rolling_guard(highest.wrapping_sub(PAGE_SIZE)),
      Some(highest.wrapping_sub(PAGE_SIZE))
    );
    assert_eq!(up.layout().rolling_guard(highest), None);
  }

  #[test]
  fn test_growth_to_the_edge_keeps_working() {
    let mut down = Slot::<Downward>::new();
    assert!(down.layout().on_fault(PAGE_SIZE));
    assert!(down.layout().on_fault(0));
    assert_eq!(down.mapped(), down.area.as_ptr());
    touch(down.area.as_ptr());

    let probe = down.layout().header().userspace_end.wrapping_sub(1);
    down.layout().compact_at(probe).unwrap();
    touch(down.mapped());

    let mut up = Slot::<Upward>::new();
    assert!(up.layout().on_fault(SIZE - PAGE_SIZE - 1));
    assert!(up.layout().on_fault(SIZE - 1));
    touch(up.area.as_ptr().wrapping_add(SIZE - 1));
  }

  #[cfg(windows)]
  fn query(addr: *mut u8) -> winapi::um::winnt::MEMORY_BASIC_INFORMATION {
    let mut info: winapi::um::winnt::MEMORY_BASIC_INFORMATION = unsafe { std::mem::zeroed() };
    let written =
      unsafe { winapi::um::memoryapi::VirtualQuery(addr.cast(), &mut info, std::mem::size_of_val(&info)) };
    assert_ne!(written, 0);
    info
  }

  #[cfg(windows)]
  #[test]
  fn test_rolling_guard_follows_boundary() {
    use winapi::um::winnt::{MEM_COMMIT, MEM_RESERVE, PAGE_GUARD};

    let mut slot = Slot::<Downward>::new();
    let initial = slot.mapped();
    let first_guard = query(initial.wrapping_sub(PAGE_SIZE));
    assert_eq!(first_guard.State, MEM_COMMIT);
    assert_eq!(first_guard.Protect & PAGE_GUARD, PAGE_GUARD);

    let offset = slot.offset_of(initial.wrapping_sub(5 * PAGE_SIZE));
    assert!(slot.layout().on_fault(offset));
    let grown = slot.mapped();
    assert_eq!(query(grown.wrapping_sub(PAGE_SIZE)).Protect & PAGE_GUARD, PAGE_GUARD);
    assert_eq!(query(initial.wrapping_sub(PAGE_SIZE)).Protect & PAGE_GUARD, 0);

    let probe = slot.layout().header().userspace_end.wrapping_sub(1);
    slot.layout().compact_at(probe).unwrap();
    assert_eq!(slot.mapped(), initial);
    assert_eq!(query(initial.wrapping_sub(PAGE_SIZE)).Protect & PAGE_GUARD, PAGE_GUARD);
    assert_eq!(query(grown.wrapping_sub(PAGE_SIZE)).State, MEM_RESERVE);
    assert_eq!(query(grown).State, MEM_RESERVE);
  }

  #[test]
  fn test_downward_compaction() {
    let mut slot = Slot::<Downward>::new();
    let initial = slot.mapped();

    assert!(slot.layout().on_fault(0));
    assert_eq!(slot.mapped(), slot.area.as_ptr());

    let probe = slot.area.as_ptr().wrapping_add(10 * PAGE_SIZE + 100);
    slot.layout().compact_at(probe).unwrap();

    let compacted = slot.mapped();
    assert_eq!(
      compacted,
      align_ptr_down(probe.wrapping_sub(STACK_KEEP_PROTECTED_BYTES), PAGE_SIZE)
    );
    assert!(probe as usize - compacted as usize >= STACK_KEEP_PROTECTED_BYTES);
    touch(compacted);

    slot.layout().compact_at(probe).unwrap();
    assert_eq!(slot.mapped(), compacted);

    let near_top = slot.layout().header().userspace_end.wrapping_sub(1);
    slot.layout().compact_at(near_top).unwrap();
    assert_eq!(slot.mapped(), initial);

    slot.layout().compact_at(near_top).unwrap();
    assert_eq!(slot.mapped(), initial);
  }

  #[test]
  fn test_upward_compaction() {
    let mut slot = Slot::<Upward>::new();
    let initial = slot.mapped();

    assert!(slot.layout().on_fault(SIZE - 1));

    let probe = slot.area.as_ptr().wrapping_add(12 * PAGE_SIZE + 1);
    slot.layout().compact_at(probe).unwrap();

    let compacted = slot.mapped();
    assert_eq!(
      compacted,
      align_ptr_up(probe.wrapping_add(STACK_KEEP_PROTECTED_BYTES), PAGE_SIZE)
    );
    touch(compacted.wrapping_sub(1));

    let begin = slot.layout().header().userspace_begin;
    slot.layout().compact_at(begin).unwrap();
    assert_eq!(slot.mapped(), initial);
  }

  #[test]
  fn test_compaction_ignores_foreign_position() {
    let mut slot = Slot::<Guarded<Downward>>::new();
    assert!(slot.layout().on_fault(PAGE_SIZE));
    let grown = slot.mapped();

    slot.layout().compact().unwrap();
    assert_eq!(slot.mapped(), grown);

    let before_area = slot.area.as_ptr().wrapping_sub(1);
    slot.layout().compact_at(before_area).unwrap();
    assert_eq!(slot.mapped(), grown);
  }
}
