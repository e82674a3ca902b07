//! Compile-time tunables for the kernel.
//!
//! Everything here is a constant; there is no runtime configuration store.
//! The values are grouped by the subsystem that consumes them.

/// Size of a page of virtual memory and of a physical frame (4 KiB).
pub const PAGE_SIZE: usize = 4096;

/// Entries per page table and page tables per directory.
pub const PAGE_ENTRIES: usize = 1024;

// ---------------------------------------------------------------------------
// Timer
// ---------------------------------------------------------------------------

/// Timer interrupt frequency in Hz.
pub const TICK_RATE: u32 = 1000;

/// Microseconds elapsed per timer tick.
pub const TICK_USEC: u64 = 1_000_000 / TICK_RATE as u64;

/// Input clock of the 8253-compatible interval timer, in Hz.
pub const PIT_BASE_HZ: u32 = 1_193_180;

// ---------------------------------------------------------------------------
// Kernel heap
// ---------------------------------------------------------------------------

/// Initial mapped size of the kernel heap.
pub const HEAP_INITIAL_SIZE: usize = 0x10_0000;

/// The heap never contracts below this.
pub const HEAP_MIN_SIZE: usize = 0x7_0000;

/// The heap never expands beyond this.
pub const HEAP_MAX_SIZE: usize = 0x100_0000;

/// Number of entries in the block index placed at the start of each heap.
///
/// Every live block (allocated or hole) has exactly one entry, so this bounds
/// the number of simultaneously live blocks. 0x4000 entries cost 64 KiB on a
/// 32-bit target, a small fraction of the smallest permitted heap.
pub const HEAP_INDEX_CAPACITY: usize = 0x4000;

// ---------------------------------------------------------------------------
// Scheduler
// ---------------------------------------------------------------------------

/// Number of process priority levels. Priorities run 0..=PRIORITY_MAX.
pub const PRIORITY_MAX: u8 = 15;

/// Stack size handed to processes that do not bring their own.
pub const DEFAULT_STACK_SIZE: usize = 16 * 1024;

// ---------------------------------------------------------------------------
// Boot
// ---------------------------------------------------------------------------

/// Path of the kernel symbol map inside the initial ramdisk.
pub const SYMBOL_MAP_PATH: &str = "boot/redshift.map";
