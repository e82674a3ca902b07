//! Kernel heap.
//!
//! First-fit variable-size allocation over a contiguous region. Every block
//! is bracketed by a header and a footer carrying magic numbers; the
//! size-ordered [`BlockIndex`] at the start of the region tracks every live
//! block. Freeing coalesces with both neighbours, contracts the region when
//! the tail comes free, and poisons the released bytes so stale pointers
//! cannot pass the magic check by accident. Growth and contraction go
//! through a [`PageSource`] so the same heap runs against the frame
//! allocator on metal and a pre-backed buffer in tests.

use core::ptr::NonNull;

use bitflags::bitflags;

use super::blocklist::BlockIndex;
use super::{align_up, PageSource, TableSource, PAGE_SIZE};
use crate::config::HEAP_INDEX_CAPACITY;
use crate::error::{KernelError, KernelResult};
use crate::interrupt::InterruptGuard;
use crate::sync::GlobalState;

/// Stamped into every live header and footer.
pub const BLOCK_MAGIC: usize = 0x600DB10C;

/// Overwrites the magic of headers and footers that stop being blocks.
const BLOCK_INVALID: usize = 0x0BADB10C;

/// Freed usable bytes are filled with this.
const POISON_BYTE: u8 = 0x5A;

const AVAILABLE: usize = 0x1;
const ALLOCATED: usize = 0x2;

bitflags! {
    /// Heap creation flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct HeapFlags: u32 {
        /// Ring-3 code may touch the heap's pages.
        const USER_MODE = 1 << 0;
        /// Pages are mapped writable.
        const WRITEABLE = 1 << 1;
    }
}

impl HeapFlags {
    /// Ring-0, read/write -- the kernel heap configuration.
    pub fn supervisor() -> Self {
        HeapFlags::WRITEABLE
    }
}

/// Requested placement of an allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocAlign {
    /// Anywhere inside a suitable hole.
    Natural,
    /// Usable address on a page boundary.
    Page,
}

#[repr(C)]
struct BlockHeader {
    magic: usize,
    flags: usize,
    /// Usable bytes between header and footer.
    size: usize,
}

#[repr(C)]
struct BlockFooter {
    magic: usize,
    /// Address of the owning header.
    header: usize,
}

const HEADER_SIZE: usize = core::mem::size_of::<BlockHeader>();
const FOOTER_SIZE: usize = core::mem::size_of::<BlockFooter>();

/// Smallest possible block: a header and footer with nothing between.
pub const MIN_BLOCK_SIZE: usize = HEADER_SIZE + FOOTER_SIZE;

/// Index entries are ordered by ascending usable size.
fn ascending_size(a: usize, b: usize) -> bool {
    // SAFETY: the heap only ever stores addresses of live headers in its
    // index, and removes them before the header is invalidated.
    unsafe { (*(a as *const BlockHeader)).size < (*(b as *const BlockHeader)).size }
}

/// Point-in-time heap counters.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct HeapStats {
    pub size: usize,
    pub min_size: usize,
    pub max_size: usize,
    pub alloc_count: u64,
    pub free_count: u64,
    pub bytes_allocated: usize,
    pub live_blocks: usize,
}

/// A first-fit heap over `[start, start + size)`.
pub struct Heap {
    start: usize,
    size: usize,
    min_size: usize,
    max_size: usize,
    flags: HeapFlags,
    index: BlockIndex,
    alloc_count: u64,
    free_count: u64,
    bytes_allocated: usize,
}

impl Heap {
    /// Create a heap with the default index capacity.
    ///
    /// # Safety
    ///
    /// See [`Heap::create_sized`].
    pub unsafe fn create(
        start: usize,
        init_size: usize,
        max_size: usize,
        min_size: usize,
        flags: HeapFlags,
    ) -> KernelResult<Self> {
        // SAFETY: forwarded contract.
        unsafe { Self::create_sized(start, init_size, max_size, min_size, flags, HEAP_INDEX_CAPACITY) }
    }

    /// Create a heap whose block index holds up to `index_capacity` entries.
    ///
    /// The index is placed at `start`; the remainder of the initial region
    /// becomes a single hole.
    ///
    /// # Safety
    ///
    /// `[start, start + init_size)` must be mapped, writable, exclusively
    /// owned by the new heap, with `start` page-aligned; the region up to
    /// `start + max_size` must stay reserved for the heap (committed on
    /// demand through the [`PageSource`] handed to the mutating calls).
    pub unsafe fn create_sized(
        start: usize,
        init_size: usize,
        max_size: usize,
        min_size: usize,
        flags: HeapFlags,
        index_capacity: usize,
    ) -> KernelResult<Self> {
        let index_bytes = BlockIndex::bytes_for(index_capacity);
        if init_size < index_bytes + MIN_BLOCK_SIZE
            || max_size < init_size
            || min_size > init_size
        {
            return Err(KernelError::InvalidArgument { name: "heap geometry" });
        }
        // SAFETY: the caller owns the region; the index takes the first
        // index_bytes of it.
        let index = unsafe { BlockIndex::place(start, index_capacity, ascending_size) };
        let mut heap = Self {
            start,
            size: init_size,
            min_size,
            max_size,
            flags,
            index,
            alloc_count: 0,
            free_count: 0,
            bytes_allocated: 0,
        };
        let first_block = start + index_bytes;
        let usable = init_size - index_bytes - MIN_BLOCK_SIZE;
        heap.place_block(first_block, usable, AVAILABLE);
        heap.index.insert(first_block);
        Ok(heap)
    }

    pub fn start(&self) -> usize {
        self.start
    }

    /// Current end of the mapped region.
    pub fn end(&self) -> usize {
        self.start + self.size
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn flags(&self) -> HeapFlags {
        self.flags
    }

    pub fn contains(&self, addr: usize) -> bool {
        addr >= self.start && addr < self.end()
    }

    pub fn stats(&self) -> HeapStats {
        HeapStats {
            size: self.size,
            min_size: self.min_size,
            max_size: self.max_size,
            alloc_count: self.alloc_count,
            free_count: self.free_count,
            bytes_allocated: self.bytes_allocated,
            live_blocks: self.index.len(),
        }
    }

    /// Address of the first byte after the block index.
    fn first_block_addr(&self) -> usize {
        self.start + BlockIndex::bytes_for(self.index.capacity())
    }

    // -- block projections ---------------------------------------------------

    fn header<'a>(&self, at: usize) -> &'a mut BlockHeader {
        debug_assert!(at >= self.first_block_addr() && at + HEADER_SIZE <= self.end());
        // SAFETY: `at` lies inside the mapped heap region (asserted above);
        // block metadata is only accessed under the heap's exclusive borrow.
        unsafe { &mut *(at as *mut BlockHeader) }
    }

    fn footer<'a>(&self, at: usize) -> &'a mut BlockFooter {
        debug_assert!(at >= self.first_block_addr() && at + FOOTER_SIZE <= self.end());
        // SAFETY: as for `header`.
        unsafe { &mut *(at as *mut BlockFooter) }
    }

    fn footer_addr(&self, block: usize) -> usize {
        block + HEADER_SIZE + self.header(block).size
    }

    fn place_block(&mut self, at: usize, usable: usize, flags: usize) {
        let header = self.header(at);
        header.magic = BLOCK_MAGIC;
        header.flags = flags;
        header.size = usable;
        let footer = self.footer(at + HEADER_SIZE + usable);
        footer.magic = BLOCK_MAGIC;
        footer.header = at;
    }

    /// Validate the block owning `ptr` and return its header address.
    /// Corruption and double frees are fatal, per the heap's contract.
    fn checked_block(&self, ptr: usize) -> usize {
        let at = ptr - HEADER_SIZE;
        let header = self.header(at);
        if header.magic != BLOCK_MAGIC {
            panic!("{}", KernelError::HeapCorruption { address: at });
        }
        let footer = self.footer(at + HEADER_SIZE + header.size);
        if footer.magic != BLOCK_MAGIC || footer.header != at {
            panic!("{}", KernelError::HeapCorruption { address: at });
        }
        at
    }

    // -- allocation ----------------------------------------------------------

    /// Service a request. Returns null only when the heap cannot grow past
    /// `max_size`; every other failure mode is fatal.
    pub fn allocate(
        &mut self,
        size: usize,
        align: AllocAlign,
        pages: &mut dyn PageSource,
    ) -> Option<NonNull<u8>> {
        if size == 0 {
            return None;
        }
        let _guard = InterruptGuard::disable();
        loop {
            if let Some(position) = self.smallest_hole(size, align) {
                let at = self.alloc_with_hole(position, size, align);
                let usable = self.header(at).size;
                self.alloc_count += 1;
                self.bytes_allocated += usable;
                return NonNull::new((at + HEADER_SIZE) as *mut u8);
            }
            // No hole fits: expand by the worst-case footprint and retry.
            let mut needed = HEADER_SIZE + size + FOOTER_SIZE;
            if align == AllocAlign::Page {
                // Worst-case front pad for the alignment carve.
                needed += PAGE_SIZE + MIN_BLOCK_SIZE;
            }
            let new_size = align_up(self.size + needed, PAGE_SIZE);
            if new_size > self.max_size {
                return None;
            }
            self.expand(new_size, pages);
        }
    }

    /// Index position of the smallest hole that can carry `size` bytes with
    /// the requested alignment.
    fn smallest_hole(&self, size: usize, align: AllocAlign) -> Option<usize> {
        for position in 0..self.index.len() {
            let at = self.index.get(position);
            let header = self.header(at);
            if header.magic != BLOCK_MAGIC {
                panic!("{}", KernelError::HeapCorruption { address: at });
            }
            if header.flags & AVAILABLE == 0 {
                continue;
            }
            match align {
                AllocAlign::Natural => {
                    if header.size >= size {
                        return Some(position);
                    }
                }
                AllocAlign::Page => {
                    let usable = at + HEADER_SIZE;
                    if usable % PAGE_SIZE == 0 {
                        if header.size >= size {
                            return Some(position);
                        }
                    } else {
                        let target = self.aligned_block_start(at);
                        let end = at + HEADER_SIZE + header.size + FOOTER_SIZE;
                        if target + HEADER_SIZE + size + FOOTER_SIZE <= end {
                            return Some(position);
                        }
                    }
                }
            }
        }
        None
    }

    /// Start address of the page-aligned block carved out of the hole at
    /// `at`, leaving room for a complete front-pad hole.
    fn aligned_block_start(&self, at: usize) -> usize {
        let mut target = align_up(at + HEADER_SIZE, PAGE_SIZE) - HEADER_SIZE;
        if target - at < MIN_BLOCK_SIZE {
            target += PAGE_SIZE;
        }
        target
    }

    /// Carve an allocation out of the hole at index position `position`.
    fn alloc_with_hole(&mut self, position: usize, size: usize, align: AllocAlign) -> usize {
        let original_at = self.index.get(position);
        let original_end = self.footer_addr(original_at) + FOOTER_SIZE;
        self.index.remove_at(position);

        let mut at = original_at;
        if align == AllocAlign::Page && (at + HEADER_SIZE) % PAGE_SIZE != 0 {
            // Page-align case: the front pad becomes a new hole.
            let target = self.aligned_block_start(at);
            let pad_usable = (target - at) - MIN_BLOCK_SIZE;
            self.place_block(at, pad_usable, AVAILABLE);
            self.index.insert(at);
            at = target;
        }

        let remaining = original_end - at;
        debug_assert!(remaining >= HEADER_SIZE + size + FOOTER_SIZE);
        let mut usable = size;
        let leftover = remaining - (HEADER_SIZE + size + FOOTER_SIZE);
        if leftover <= MIN_BLOCK_SIZE {
            // Too small to stand alone: absorb into the allocation.
            usable += leftover;
            self.place_block(at, usable, ALLOCATED);
            self.index.insert(at);
        } else {
            self.place_block(at, usable, ALLOCATED);
            self.index.insert(at);
            let hole = at + HEADER_SIZE + usable + FOOTER_SIZE;
            self.place_block(hole, leftover - MIN_BLOCK_SIZE, AVAILABLE);
            self.index.insert(hole);
        }
        at
    }

    /// Grow the mapped region to `new_size` (page-aligned, at most max_size),
    /// committing fresh pages and extending or creating the trailing hole.
    fn expand(&mut self, new_size: usize, pages: &mut dyn PageSource) {
        debug_assert!(new_size > self.size && new_size <= self.max_size);
        debug_assert!(new_size % PAGE_SIZE == 0);
        let old_end = self.end();
        if let Err(err) = pages.commit(old_end..self.start + new_size) {
            // Out of frames while growing is not a recoverable situation.
            panic!("heap expansion failed: {}", err);
        }
        log::debug!(
            "expanding heap: from={}K by={}K to={}K max={}K",
            self.size / 1024,
            (new_size - self.size) / 1024,
            new_size / 1024,
            self.max_size / 1024
        );
        let grown = new_size - self.size;
        self.size = new_size;

        // If the last block is a hole ending at the old end, stretch it over
        // the new space; otherwise the new space becomes its own hole.
        if let Some(last) = self.block_ending_at(old_end) {
            if self.header(last).flags & AVAILABLE != 0 {
                self.index.remove_value(last);
                let old_footer = self.footer_addr(last);
                self.footer(old_footer).magic = BLOCK_INVALID;
                let new_usable = self.header(last).size + grown;
                self.place_block(last, new_usable, AVAILABLE);
                self.index.insert(last);
                return;
            }
        }
        self.place_block(old_end, grown - MIN_BLOCK_SIZE, AVAILABLE);
        self.index.insert(old_end);
    }

    /// The block whose footer ends exactly at `end`, if any.
    fn block_ending_at(&self, end: usize) -> Option<usize> {
        self.index
            .iter()
            .find(|&at| self.footer_addr(at) + FOOTER_SIZE == end)
    }

    // -- free ----------------------------------------------------------------

    /// Return a block to the heap. `free(null)` is a no-op; freeing a block
    /// that is already available, or whose bracketing metadata is damaged,
    /// panics.
    pub fn free(&mut self, ptr: *mut u8, pages: &mut dyn PageSource) {
        if ptr.is_null() {
            return;
        }
        let _guard = InterruptGuard::disable();
        let mut at = self.checked_block(ptr as usize);
        {
            let header = self.header(at);
            if header.flags & AVAILABLE != 0 {
                panic!("{}", KernelError::DoubleFree { address: at });
            }
            header.flags = AVAILABLE;
        }
        let original_size = self.header(at).size;
        // The block re-enters the index as a hole once its final geometry is
        // known; its entry as an allocation goes now.
        self.index.remove_value(at);
        // Poison the released bytes so a stale pointer cannot read back a
        // convincing header later.
        // SAFETY: the usable range belongs to the block being freed and is
        // still mapped at this point.
        unsafe {
            core::ptr::write_bytes((at + HEADER_SIZE) as *mut u8, POISON_BYTE, original_size);
        }

        at = self.unify_left(at);
        self.unify_right(at);
        let at = self.contract_if_tail(at, pages);

        if let Some(at) = at {
            self.index.insert(at);
        }
        self.free_count += 1;
        self.bytes_allocated -= original_size;
        debug_assert!(self.free_count <= self.alloc_count);
        debug_assert!(self.bytes_allocated <= self.size);
    }

    /// Merge with an available left neighbour. Returns the address of the
    /// surviving block; its index entry (if merged) has been removed so the
    /// caller re-inserts once the final geometry is known.
    fn unify_left(&mut self, at: usize) -> usize {
        if at < self.first_block_addr() + FOOTER_SIZE {
            return at;
        }
        let left_footer_at = at - FOOTER_SIZE;
        let left_footer = self.footer(left_footer_at);
        if left_footer.magic != BLOCK_MAGIC {
            return at;
        }
        let left_at = left_footer.header;
        if left_at >= at || left_at < self.first_block_addr() {
            return at;
        }
        let left_header = self.header(left_at);
        if left_header.magic != BLOCK_MAGIC || left_header.flags & AVAILABLE == 0 {
            return at;
        }
        if left_at + HEADER_SIZE + left_header.size != left_footer_at {
            // A payload that happens to look like a footer; not a block.
            return at;
        }
        // Merge: the left block swallows this one, header and all.
        self.index.remove_value(left_at);
        let merged = left_header.size + MIN_BLOCK_SIZE + self.header(at).size;
        let footer_at = self.footer_addr(at);
        self.header(at).magic = BLOCK_INVALID;
        self.footer(left_footer_at).magic = BLOCK_INVALID;
        self.header(left_at).size = merged;
        let footer = self.footer(footer_at);
        footer.magic = BLOCK_MAGIC;
        footer.header = left_at;
        left_at
    }

    /// Absorb an available right neighbour into the block at `at`.
    fn unify_right(&mut self, at: usize) {
        let footer_at = self.footer_addr(at);
        let right_at = footer_at + FOOTER_SIZE;
        if right_at + HEADER_SIZE + FOOTER_SIZE > self.end() {
            return;
        }
        let right_header = self.header(right_at);
        if right_header.magic != BLOCK_MAGIC || right_header.flags & AVAILABLE == 0 {
            return;
        }
        self.index.remove_value(right_at);
        let right_size = right_header.size;
        let right_footer_at = right_at + HEADER_SIZE + right_size;
        right_header.magic = BLOCK_INVALID;
        self.footer(footer_at).magic = BLOCK_INVALID;
        self.header(at).size += MIN_BLOCK_SIZE + right_size;
        let footer = self.footer(right_footer_at);
        footer.magic = BLOCK_MAGIC;
        footer.header = at;
    }

    /// If the freed block reaches the heap end, contract down towards
    /// `min_size`, releasing whole pages. Returns the surviving block
    /// address, or `None` if contraction consumed it entirely.
    fn contract_if_tail(&mut self, at: usize, pages: &mut dyn PageSource) -> Option<usize> {
        let block_end = self.footer_addr(at) + FOOTER_SIZE;
        if block_end < self.end() {
            return Some(at);
        }
        let keep = at - self.start;
        // Keep room for at least a minimal block so no orphan slack is left
        // between the last footer and the heap end.
        let target = align_up(keep + MIN_BLOCK_SIZE, PAGE_SIZE).max(self.min_size);
        if target >= self.size {
            return Some(at);
        }
        log::debug!(
            "contracting heap: from={}K to={}K min={}K",
            self.size / 1024,
            target / 1024,
            self.min_size / 1024
        );
        pages.release(self.start + target..self.end());
        self.size = target;
        let new_usable = (self.start + target) - at - MIN_BLOCK_SIZE;
        self.place_block(at, new_usable, AVAILABLE);
        Some(at)
    }

    // -- resize --------------------------------------------------------------

    /// Shrink or grow an allocation in place where possible, falling back to
    /// allocate-copy-free. Returns the (possibly moved) pointer, or `None`
    /// when growth is impossible -- the original block is left untouched in
    /// that case.
    pub fn resize(
        &mut self,
        ptr: *mut u8,
        new_size: usize,
        pages: &mut dyn PageSource,
    ) -> Option<NonNull<u8>> {
        if ptr.is_null() || new_size == 0 {
            return None;
        }
        let _guard = InterruptGuard::disable();
        let at = self.checked_block(ptr as usize);
        let current = self.header(at).size;
        if new_size == current {
            return NonNull::new(ptr);
        }
        if new_size < current {
            let shrink = current - new_size;
            if shrink > MIN_BLOCK_SIZE {
                self.index.remove_value(at);
                self.place_block(at, new_size, ALLOCATED);
                self.index.insert(at);
                let hole = at + HEADER_SIZE + new_size + FOOTER_SIZE;
                self.place_block(hole, shrink - MIN_BLOCK_SIZE, AVAILABLE);
                // The trimmed tail may now touch a following hole.
                self.unify_right(hole);
                self.index.insert(hole);
                self.bytes_allocated -= shrink;
            }
            return NonNull::new(ptr);
        }
        // Growth: try the hole immediately to the right.
        let footer_at = self.footer_addr(at);
        let right_at = footer_at + FOOTER_SIZE;
        if right_at + HEADER_SIZE + FOOTER_SIZE <= self.end() {
            let right_header = self.header(right_at);
            if right_header.magic == BLOCK_MAGIC
                && right_header.flags & AVAILABLE != 0
                && current + MIN_BLOCK_SIZE + right_header.size >= new_size
            {
                let combined = current + MIN_BLOCK_SIZE + right_header.size;
                self.index.remove_value(right_at);
                self.index.remove_value(at);
                self.header(right_at).magic = BLOCK_INVALID;
                self.footer(footer_at).magic = BLOCK_INVALID;
                let leftover = combined - new_size;
                if leftover > MIN_BLOCK_SIZE {
                    self.place_block(at, new_size, ALLOCATED);
                    let hole = at + HEADER_SIZE + new_size + FOOTER_SIZE;
                    self.place_block(hole, leftover - MIN_BLOCK_SIZE, AVAILABLE);
                    self.index.insert(hole);
                } else {
                    self.place_block(at, combined, ALLOCATED);
                }
                self.index.insert(at);
                self.bytes_allocated += self.header(at).size - current;
                return NonNull::new(ptr);
            }
        }
        // Fall back to move-and-copy.
        let new_ptr = self.allocate(new_size, AllocAlign::Natural, pages)?;
        // SAFETY: both regions are live heap allocations of at least
        // `current` bytes and cannot overlap (the new block was just carved
        // from a different hole).
        unsafe {
            core::ptr::copy_nonoverlapping(ptr, new_ptr.as_ptr(), current);
        }
        self.free(ptr, pages);
        Some(new_ptr)
    }

    /// Walk all blocks and verify the bracketing invariants. Test and
    /// diagnostic aid; panics on the first violation.
    pub fn check_integrity(&self) {
        let mut cursor = self.first_block_addr();
        let mut previous_available = false;
        while cursor < self.end() {
            let header = self.header(cursor);
            assert_eq!(
                header.magic, BLOCK_MAGIC,
                "bad header magic at {:#X}",
                cursor
            );
            let footer_at = cursor + HEADER_SIZE + header.size;
            let footer = self.footer(footer_at);
            assert_eq!(footer.magic, BLOCK_MAGIC, "bad footer magic at {:#X}", footer_at);
            assert_eq!(footer.header, cursor, "footer back-pointer at {:#X}", footer_at);
            assert!(
                self.index.contains(cursor),
                "block at {:#X} missing from index",
                cursor
            );
            let available = header.flags & AVAILABLE != 0;
            assert!(
                !(available && previous_available),
                "adjacent holes at {:#X}",
                cursor
            );
            previous_available = available;
            cursor = footer_at + FOOTER_SIZE;
        }
        assert_eq!(cursor, self.end(), "blocks do not tile the heap");
    }
}

// ---------------------------------------------------------------------------
// Kernel heap singleton
// ---------------------------------------------------------------------------

/// The process-wide kernel heap.
pub static KERNEL_HEAP: GlobalState<Heap> = GlobalState::new();

/// Arm the kernel heap and freeze the static allocator.
///
/// # Safety
///
/// Same region contract as [`Heap::create`]; call once from the boot path
/// after the heap window has page tables.
pub unsafe fn init_kernel_heap(
    start: usize,
    init_size: usize,
    max_size: usize,
    min_size: usize,
) -> KernelResult<()> {
    // The initial window needs real frames before the heap writes its index.
    let mut pages = super::KernelPages;
    pages.commit(start..start + init_size)?;
    // SAFETY: forwarded contract.
    let heap = unsafe { Heap::create(start, init_size, max_size, min_size, HeapFlags::supervisor())? };
    KERNEL_HEAP
        .init(heap)
        .map_err(|_| KernelError::InvalidArgument { name: "kernel heap reinit" })?;
    if let Some(bump) = super::bump::STATIC_ALLOCATOR.lock().as_mut() {
        bump.freeze();
    }
    log::info!(
        "kernel heap armed: start={:#010X} initial={}K max={}K",
        start,
        init_size / 1024,
        max_size / 1024
    );
    Ok(())
}

/// Allocate from the kernel heap. Null when the heap is exhausted or not yet
/// armed.
pub fn kalloc(size: usize, align: AllocAlign) -> Option<NonNull<u8>> {
    KERNEL_HEAP
        .with_mut(|heap| heap.allocate(size, align, &mut super::KernelPages))
        .flatten()
}

/// Return a kernel-heap allocation.
pub fn kfree(ptr: *mut u8) {
    KERNEL_HEAP.with_mut(|heap| heap.free(ptr, &mut super::KernelPages));
}

/// Resize a kernel-heap allocation.
pub fn krealloc(ptr: *mut u8, new_size: usize) -> Option<NonNull<u8>> {
    KERNEL_HEAP
        .with_mut(|heap| heap.resize(ptr, new_size, &mut super::KernelPages))
        .flatten()
}

/// [`TableSource`] that draws page tables from the kernel heap. The heap
/// region is identity-mapped, so the physical address of a table equals its
/// virtual address.
pub struct HeapTables;

impl TableSource for HeapTables {
    fn alloc_table(
        &mut self,
        size: usize,
    ) -> KernelResult<(NonNull<u8>, super::PhysicalAddress)> {
        let ptr = kalloc(size, AllocAlign::Page).ok_or(KernelError::HeapExhausted {
            requested: size,
        })?;
        // SAFETY: a fresh allocation of `size` bytes; tables must start
        // zeroed.
        unsafe {
            core::ptr::write_bytes(ptr.as_ptr(), 0, size);
        }
        Ok((ptr, super::PhysicalAddress::new(ptr.as_ptr() as usize)))
    }
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use alloc::alloc::{alloc_zeroed, Layout};
    use core::ops::Range;

    use super::super::blocklist::BlockIndex;
    use super::super::{align_up, PageSource, PAGE_SIZE};
    use super::*;
    use crate::error::KernelResult;

    /// Pre-backed page source: the test region is fully allocated up front,
    /// so commit/release only count calls.
    pub struct TestPages {
        pub commits: usize,
        pub releases: usize,
        pub released: Option<Range<usize>>,
    }

    impl TestPages {
        pub fn new() -> Self {
            Self {
                commits: 0,
                releases: 0,
                released: None,
            }
        }
    }

    impl PageSource for TestPages {
        fn commit(&mut self, _range: Range<usize>) -> KernelResult<()> {
            self.commits += 1;
            Ok(())
        }

        fn release(&mut self, range: Range<usize>) {
            self.releases += 1;
            self.released = Some(range);
        }
    }

    const INDEX_CAPACITY: usize = 128;

    fn region(bytes: usize) -> usize {
        let layout = Layout::from_size_align(bytes, PAGE_SIZE).expect("valid layout");
        // SAFETY: non-zero size; leaked on purpose so heap memory lives for
        // the whole test run.
        let ptr = unsafe { alloc_zeroed(layout) };
        assert!(!ptr.is_null());
        ptr as usize
    }

    fn heap(init: usize, max: usize, min: usize) -> Heap {
        let start = region(max);
        // SAFETY: the region is fully backed and exclusively ours.
        unsafe {
            Heap::create_sized(start, init, max, min, HeapFlags::supervisor(), INDEX_CAPACITY)
                .expect("heap geometry is valid")
        }
    }

    fn overhead() -> usize {
        BlockIndex::bytes_for(INDEX_CAPACITY)
    }

    #[test]
    fn test_fresh_heap_is_one_hole() {
        let heap = heap(0x8000, 0x20000, 0x1000);
        let stats = heap.stats();
        assert_eq!(stats.live_blocks, 1);
        assert_eq!(stats.bytes_allocated, 0);
        heap.check_integrity();
    }

    #[test]
    fn test_allocate_and_free_round_trip() {
        let mut heap = heap(0x8000, 0x20000, 0x1000);
        let mut pages = TestPages::new();
        let before = heap.stats();
        let ptr = heap
            .allocate(100, AllocAlign::Natural, &mut pages)
            .expect("allocation fits in fresh heap");
        assert_eq!(heap.stats().bytes_allocated, 100);
        assert_eq!(heap.stats().alloc_count, 1);
        heap.check_integrity();
        heap.free(ptr.as_ptr(), &mut pages);
        let after = heap.stats();
        assert_eq!(after.bytes_allocated, before.bytes_allocated);
        assert_eq!(after.free_count, 1);
        heap.check_integrity();
    }

    #[test]
    fn test_same_address_reused_after_free() {
        let mut heap = heap(0x8000, 0x20000, 0x1000);
        let mut pages = TestPages::new();
        let first = heap
            .allocate(64, AllocAlign::Natural, &mut pages)
            .expect("fits");
        heap.free(first.as_ptr(), &mut pages);
        let second = heap
            .allocate(64, AllocAlign::Natural, &mut pages)
            .expect("fits");
        assert_eq!(first, second);
    }

    #[test]
    fn test_headers_bracket_allocations() {
        let mut heap = heap(0x8000, 0x20000, 0x1000);
        let mut pages = TestPages::new();
        let ptr = heap
            .allocate(48, AllocAlign::Natural, &mut pages)
            .expect("fits")
            .as_ptr() as usize;
        let header = heap.header(ptr - HEADER_SIZE);
        assert_eq!(header.magic, BLOCK_MAGIC);
        assert_eq!(header.flags & ALLOCATED, ALLOCATED);
        assert_eq!(header.size, 48);
        let footer = heap.footer(ptr + 48);
        assert_eq!(footer.magic, BLOCK_MAGIC);
        assert_eq!(footer.header, ptr - HEADER_SIZE);
    }

    #[test]
    fn test_page_aligned_allocation() {
        let mut heap = heap(0x10000, 0x20000, 0x1000);
        let mut pages = TestPages::new();
        let ptr = heap
            .allocate(256, AllocAlign::Page, &mut pages)
            .expect("aligned allocation fits");
        assert_eq!(ptr.as_ptr() as usize % PAGE_SIZE, 0);
        heap.check_integrity();
        heap.free(ptr.as_ptr(), &mut pages);
        heap.check_integrity();
    }

    #[test]
    fn test_coalescing_leaves_no_adjacent_holes() {
        let mut heap = heap(0x8000, 0x20000, 0x1000);
        let mut pages = TestPages::new();
        let a = heap.allocate(100, AllocAlign::Natural, &mut pages).expect("a");
        let b = heap.allocate(100, AllocAlign::Natural, &mut pages).expect("b");
        let c = heap.allocate(100, AllocAlign::Natural, &mut pages).expect("c");
        heap.free(a.as_ptr(), &mut pages);
        heap.free(c.as_ptr(), &mut pages);
        heap.check_integrity();
        heap.free(b.as_ptr(), &mut pages);
        // Everything merged back into a single hole.
        assert_eq!(heap.stats().live_blocks, 1);
        heap.check_integrity();
    }

    #[test]
    fn test_freed_bytes_are_poisoned() {
        let mut heap = heap(0x8000, 0x20000, 0x1000);
        let mut pages = TestPages::new();
        let ptr = heap
            .allocate(32, AllocAlign::Natural, &mut pages)
            .expect("fits");
        // SAFETY: writing inside our live allocation.
        unsafe {
            core::ptr::write_bytes(ptr.as_ptr(), 0xAB, 32);
        }
        let addr = ptr.as_ptr();
        heap.free(addr, &mut pages);
        // SAFETY: the memory stays mapped in the test region; we are
        // deliberately inspecting freed bytes.
        let first = unsafe { *addr };
        assert_eq!(first, 0x5A);
    }

    #[test]
    #[should_panic(expected = "double free")]
    fn test_double_free_is_fatal() {
        let mut heap = heap(0x8000, 0x20000, 0x1000);
        let mut pages = TestPages::new();
        let ptr = heap
            .allocate(40, AllocAlign::Natural, &mut pages)
            .expect("fits");
        heap.free(ptr.as_ptr(), &mut pages);
        heap.free(ptr.as_ptr(), &mut pages);
    }

    #[test]
    #[should_panic(expected = "corrupted heap block")]
    fn test_clobbered_header_is_fatal() {
        let mut heap = heap(0x8000, 0x20000, 0x1000);
        let mut pages = TestPages::new();
        let ptr = heap
            .allocate(40, AllocAlign::Natural, &mut pages)
            .expect("fits");
        let header_at = ptr.as_ptr() as usize - HEADER_SIZE;
        // SAFETY: deliberately corrupting the test heap's own region.
        unsafe {
            *(header_at as *mut usize) = 0;
        }
        heap.free(ptr.as_ptr(), &mut pages);
    }

    #[test]
    fn test_free_null_is_noop() {
        let mut heap = heap(0x8000, 0x20000, 0x1000);
        let mut pages = TestPages::new();
        heap.free(core::ptr::null_mut(), &mut pages);
        assert_eq!(heap.stats().free_count, 0);
    }

    #[test]
    fn test_expansion_commits_pages_and_retries() {
        let mut heap = heap(0x2000 + overhead(), 0x40000, 0x1000);
        let mut pages = TestPages::new();
        let big = 0x4000;
        let ptr = heap
            .allocate(big, AllocAlign::Natural, &mut pages)
            .expect("expansion covers the request");
        assert!(pages.commits >= 1);
        assert!(heap.size() > 0x2000 + overhead());
        heap.check_integrity();
        heap.free(ptr.as_ptr(), &mut pages);
        heap.check_integrity();
    }

    #[test]
    fn test_allocation_beyond_max_returns_null() {
        let mut heap = heap(0x4000 + overhead(), 0x8000 + overhead(), 0x1000);
        let mut pages = TestPages::new();
        let before = heap.stats();
        let result = heap.allocate(0x10000, AllocAlign::Natural, &mut pages);
        assert!(result.is_none());
        assert_eq!(heap.stats(), before, "failed allocation must not disturb the heap");
        heap.check_integrity();
    }

    #[test]
    fn test_tail_free_contracts_to_min_size() {
        let init = 0x4000 + overhead();
        let min = align_up(overhead() + 0x1000, PAGE_SIZE);
        let mut heap = heap(init, 0x80000, min);
        let mut pages = TestPages::new();
        // Force growth well past the minimum, then release it all.
        let ptr = heap
            .allocate(0x20000, AllocAlign::Natural, &mut pages)
            .expect("grows");
        heap.free(ptr.as_ptr(), &mut pages);
        assert!(pages.releases >= 1);
        assert_eq!(heap.size(), min.max(align_up(overhead() + MIN_BLOCK_SIZE, PAGE_SIZE)));
        heap.check_integrity();
    }

    #[test]
    fn test_resize_same_size_returns_same_pointer() {
        let mut heap = heap(0x8000, 0x20000, 0x1000);
        let mut pages = TestPages::new();
        let ptr = heap
            .allocate(128, AllocAlign::Natural, &mut pages)
            .expect("fits");
        let resized = heap
            .resize(ptr.as_ptr(), 128, &mut pages)
            .expect("no-op resize succeeds");
        assert_eq!(ptr, resized);
    }

    #[test]
    fn test_resize_shrink_creates_hole() {
        let mut heap = heap(0x8000, 0x20000, 0x1000);
        let mut pages = TestPages::new();
        let ptr = heap
            .allocate(512, AllocAlign::Natural, &mut pages)
            .expect("fits");
        let resized = heap
            .resize(ptr.as_ptr(), 64, &mut pages)
            .expect("shrink succeeds");
        assert_eq!(ptr, resized);
        assert_eq!(heap.stats().bytes_allocated, 64);
        heap.check_integrity();
    }

    #[test]
    fn test_resize_grows_into_right_hole() {
        let mut heap = heap(0x8000, 0x20000, 0x1000);
        let mut pages = TestPages::new();
        let ptr = heap
            .allocate(64, AllocAlign::Natural, &mut pages)
            .expect("fits");
        // The remainder hole sits immediately to the right.
        let grown = heap
            .resize(ptr.as_ptr(), 1024, &mut pages)
            .expect("in-place growth succeeds");
        assert_eq!(ptr, grown, "growth into the right hole must not move");
        assert_eq!(heap.stats().bytes_allocated, 1024);
        heap.check_integrity();
    }

    #[test]
    fn test_resize_moves_when_blocked() {
        let mut heap = heap(0x8000, 0x40000, 0x1000);
        let mut pages = TestPages::new();
        let a = heap.allocate(64, AllocAlign::Natural, &mut pages).expect("a");
        let _b = heap.allocate(64, AllocAlign::Natural, &mut pages).expect("b");
        // SAFETY: writing inside our live allocation.
        unsafe {
            core::ptr::write_bytes(a.as_ptr(), 0x77, 64);
        }
        let moved = heap
            .resize(a.as_ptr(), 4096, &mut pages)
            .expect("move-resize succeeds");
        assert_ne!(a, moved);
        // SAFETY: reading the moved allocation's first byte.
        let value = unsafe { *moved.as_ptr() };
        assert_eq!(value, 0x77, "contents must survive the move");
        heap.check_integrity();
    }
}
