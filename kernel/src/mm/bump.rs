//! Static (pre-heap) bump allocator.
//!
//! Until the kernel heap is armed, every allocation comes from here: a
//! monotonic cursor starting just past the loaded kernel image and bounded by
//! the end of discovered memory. There is no free. Once the heap exists the
//! allocator is frozen and any further request is a bug.

use core::ptr::NonNull;

use spin::Mutex;

use super::{align_up, PhysicalAddress, TableSource, PAGE_SIZE};
use crate::error::{KernelError, KernelResult};

/// Cursor state of the static allocator.
pub struct StaticAllocator {
    cursor: usize,
    limit: usize,
    frozen: bool,
}

impl StaticAllocator {
    pub const fn new(start: usize, limit: usize) -> Self {
        Self {
            cursor: start,
            limit,
            frozen: false,
        }
    }

    /// Allocate `size` bytes. `page_align` first rounds the cursor up to a
    /// page boundary; `out_physical` receives the address of the allocation
    /// (virtual and physical coincide before paging diverges from identity).
    pub fn alloc_base(
        &mut self,
        size: usize,
        page_align: bool,
        out_physical: Option<&mut usize>,
    ) -> KernelResult<usize> {
        if self.frozen {
            return Err(KernelError::NotInitialized {
                subsystem: "static allocator (frozen)",
            });
        }
        if size == 0 {
            return Err(KernelError::InvalidArgument { name: "size" });
        }
        let base = if page_align {
            align_up(self.cursor, PAGE_SIZE)
        } else {
            self.cursor
        };
        let end = base.checked_add(size).ok_or(KernelError::OutOfStaticMemory {
            requested: size,
            remaining: self.limit.saturating_sub(self.cursor),
        })?;
        if end > self.limit {
            return Err(KernelError::OutOfStaticMemory {
                requested: size,
                remaining: self.limit.saturating_sub(self.cursor),
            });
        }
        if let Some(physical) = out_physical {
            *physical = base;
        }
        self.cursor = end;
        Ok(base)
    }

    /// Plain allocation, no alignment request.
    pub fn alloc(&mut self, size: usize) -> KernelResult<usize> {
        self.alloc_base(size, false, None)
    }

    /// Current cursor; the heap region must begin at or above this.
    pub fn cursor(&self) -> usize {
        self.cursor
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Freeze the allocator. Every allocation after the heap is armed must
    /// route to the heap; a frozen cursor turns violations into errors
    /// instead of silent corruption.
    pub fn freeze(&mut self) {
        self.frozen = true;
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen
    }
}

impl TableSource for StaticAllocator {
    fn alloc_table(&mut self, size: usize) -> KernelResult<(NonNull<u8>, PhysicalAddress)> {
        let mut physical = 0usize;
        let base = self.alloc_base(size, true, Some(&mut physical))?;
        let ptr = base as *mut u8;
        // SAFETY: the cursor only hands out addresses inside the usable
        // memory bound discovered at boot, and never the same byte twice;
        // page tables require zeroed storage.
        unsafe {
            core::ptr::write_bytes(ptr, 0, size);
        }
        Ok((
            NonNull::new(ptr).ok_or(KernelError::InvalidArgument { name: "base" })?,
            PhysicalAddress::new(physical),
        ))
    }
}

/// The boot-time allocator singleton. Seeded by `bootstrap` with the span
/// from the end of the kernel image to the end of usable memory.
pub static STATIC_ALLOCATOR: Mutex<Option<StaticAllocator>> = Mutex::new(None);

/// Install the singleton. Second calls are rejected.
pub fn init(start: usize, limit: usize) -> KernelResult<()> {
    let mut slot = STATIC_ALLOCATOR.lock();
    if slot.is_some() {
        return Err(KernelError::InvalidArgument { name: "static allocator reinit" });
    }
    *slot = Some(StaticAllocator::new(start, limit));
    Ok(())
}
