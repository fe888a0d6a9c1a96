use std::io::Read;

use rstack::{Stack, VirtualSpace, config::PAGE_SIZE};

/// Waits until the user presses ENTER.
/// Useful when you want to inspect the process with tools like `pmap`,
/// `/proc/<pid>/smaps` or `gdb` and watch the mapping of a stack change.
fn block_until_enter_pressed() {
  println!("\n>>> Press ENTER to continue...");
  let _ = std::io::stdin().bytes().next();
}

/// Prints the bounds recorded in the stack header.
fn print_header(
  label: &str,
  stack: &Stack,
) {
  let header = stack.header();
  println!(
    "[{}] PID = {}, id = {}, begin = {:?}, end = {:?}, mapped = {:?} ({} bytes, {} pages)",
    label,
    std::process::id(),
    header.id,
    header.userspace_begin,
    header.userspace_end,
    header.userspace_mapped,
    header.mapped_size(),
    header.mapped_size().div_ceil(PAGE_SIZE),
  );
}

/// Address `depth` bytes into the stack, counted from where it starts
/// growing.
fn at_depth(
  stack: &Stack,
  depth: usize,
) -> *mut u8 {
  if stack.grows_down() {
    stack.end().wrapping_sub(depth + 1)
  } else {
    stack.begin().wrapping_add(depth)
  }
}

fn main() {
  let mut stack = Stack::new();

  // --------------------------------------------------------------------
  // 1) Allocate a stack. The first use also reserves the whole address
  //    range and installs the fault handler.
  // --------------------------------------------------------------------
  stack.initialize();
  println!("\n[1] Allocate a stack");
  println!(
    "[1] grows down = {}, guard page = {}, usable = {} bytes",
    stack.grows_down(),
    stack.has_guard(),
    stack.size()
  );
  print_header("1", &stack);

  block_until_enter_pressed();

  // --------------------------------------------------------------------
  // 2) Touch memory 64 KiB deep. The page is not mapped yet: the access
  //    faults, the handler maps it and the write goes through.
  // --------------------------------------------------------------------
  let deep = at_depth(&stack, 64 * 1024);
  unsafe { deep.write_volatile(0x5a) };
  println!("\n[2] Wrote 0x5A at {:?}", deep);
  print_header("2", &stack);

  block_until_enter_pressed();

  // --------------------------------------------------------------------
  // 3) Touch memory 1 MiB deep to grow further.
  // --------------------------------------------------------------------
  let deeper = at_depth(&stack, 1024 * 1024);
  unsafe { deeper.write_volatile(0xa5) };
  println!("\n[3] Wrote 0xA5 at {:?}", deeper);
  print_header("3", &stack);

  println!(
    "[3] Values read back: 0x{:X}, 0x{:X}",
    unsafe { deep.read_volatile() },
    unsafe { deeper.read_volatile() }
  );

  block_until_enter_pressed();

  // --------------------------------------------------------------------
  // 4) Compact. We are not running on this stack, so nothing can be
  //    released: compaction only unmaps past the in-use position of the
  //    stack it runs on.
  // --------------------------------------------------------------------
  stack.compact();
  println!("\n[4] Compact from outside the stack");
  print_header("4", &stack);

  block_until_enter_pressed();

  // --------------------------------------------------------------------
  // 5) A second stack takes the next slot.
  // --------------------------------------------------------------------
  let mut second = Stack::new();
  second.initialize();
  println!("\n[5] Allocate a second stack");
  print_header("5", &second);

  let space = VirtualSpace::single();
  println!(
    "[5] live stacks = {}, slots = {}, slot size = {} bytes, high water = {:?}",
    space.live_stacks(),
    space.slot_count(),
    space.slot_size(),
    space.high_water()
  );

  block_until_enter_pressed();

  // --------------------------------------------------------------------
  // 6) Free the first stack. Its slot becomes the lowest free one and is
  //    handed out again, starting from a minimal mapping.
  // --------------------------------------------------------------------
  drop(stack);
  println!("\n[6] Freed the first stack, live stacks = {}", space.live_stacks());

  let mut third = Stack::new();
  third.initialize();
  print_header("6", &third);

  block_until_enter_pressed();

  // --------------------------------------------------------------------
  // 7) End of demo.
  // --------------------------------------------------------------------
  drop(second);
  drop(third);
  println!("\n[7] End of example. live stacks = {}", space.live_stacks());
}
