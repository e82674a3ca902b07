//! Two-level 32-bit page tables.
//!
//! A [`PageDirectory`] holds the 1024 hardware-visible physical table
//! addresses (what CR3 points at) alongside the kernel-visible table
//! pointers. Table memory comes from an explicit [`TableSource`] handle --
//! the bump allocator for the kernel directory, the heap for user
//! directories, an arena in tests -- so the walking and mapping logic is the
//! same everywhere.

use core::ptr::NonNull;

use bitflags::bitflags;
use spin::Mutex;

use super::frame::FrameAllocator;
use super::{PhysicalAddress, TableSource, VirtualAddress, PAGE_ENTRIES, PAGE_SIZE};
use crate::arch;
use crate::error::{KernelError, KernelResult};
use crate::interrupt::{InterruptFrame, InterruptGuard};

bitflags! {
    /// Access bits of a page-table entry.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PageFlags: u32 {
        const PRESENT  = 1 << 0;
        const WRITABLE = 1 << 1;
        const USER     = 1 << 2;
        const ACCESSED = 1 << 3;
        const DIRTY    = 1 << 4;
    }
}

bitflags! {
    /// Decoded page-fault error code (low three bits).
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PageFaultCode: u32 {
        /// Fault on a present page (protection violation), not a miss.
        const PRESENT = 1 << 0;
        /// Faulting access was a write.
        const WRITE = 1 << 1;
        /// Faulting access came from ring 3.
        const USER = 1 << 2;
    }
}

/// Flags installed on page-directory entries for freshly created tables:
/// present | writable | user, matching the most permissive table-level
/// setting (the page level restricts).
const DIRECTORY_ENTRY_FLAGS: u32 = 0x07;

/// One 32-bit page-table entry: access bits low, 20-bit frame index high.
///
/// An entry with `present == 0` makes no commitment about its other fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub struct PageTableEntry(u32);

impl PageTableEntry {
    pub const fn empty() -> Self {
        Self(0)
    }

    pub fn is_present(&self) -> bool {
        self.0 & PageFlags::PRESENT.bits() != 0
    }

    pub fn is_writable(&self) -> bool {
        self.0 & PageFlags::WRITABLE.bits() != 0
    }

    pub fn is_user(&self) -> bool {
        self.0 & PageFlags::USER.bits() != 0
    }

    /// Frame index this entry references; 0 doubles as "no frame".
    pub fn frame(&self) -> usize {
        (self.0 >> 12) as usize
    }

    /// Point the entry at `frame` with the given access bits.
    pub fn assign(&mut self, frame: usize, flags: PageFlags) {
        self.0 = ((frame as u32) << 12) | flags.bits();
    }

    /// Drop the frame reference, keeping no other commitment.
    pub fn clear_frame(&mut self) {
        self.0 = 0;
    }

    pub fn raw(&self) -> u32 {
        self.0
    }
}

/// A page table: 1024 entries covering 4 MiB.
#[repr(C, align(4096))]
pub struct PageTable {
    pub entries: [PageTableEntry; PAGE_ENTRIES],
}

const _: () = assert!(core::mem::size_of::<PageTable>() == PAGE_SIZE);

/// Who a directory belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DirectoryKind {
    Kernel,
    User,
}

/// A two-level page directory.
///
/// `tables_physical` is the hardware view and must stay first so the
/// directory's physical address is also CR3's operand; `tables` is the
/// parallel array of kernel-visible pointers used for walking.
#[repr(C, align(4096))]
pub struct PageDirectory {
    tables_physical: [u32; PAGE_ENTRIES],
    tables: [*mut PageTable; PAGE_ENTRIES],
    physical_address: PhysicalAddress,
    kind: DirectoryKind,
}

const _: () = assert!(core::mem::offset_of!(PageDirectory, tables_physical) == 0);

impl PageDirectory {
    /// Allocate and zero a directory from `source`. A kernel directory is
    /// also registered as the global kernel directory.
    pub fn create(
        kind: DirectoryKind,
        source: &mut dyn TableSource,
    ) -> KernelResult<&'static mut PageDirectory> {
        let _guard = InterruptGuard::disable();
        let (ptr, physical) = source.alloc_table(core::mem::size_of::<PageDirectory>())?;
        // SAFETY: the source contract gives zeroed, aligned, permanently
        // live memory of the requested size; zeroed table pointers are null
        // and zeroed physical entries are non-present.
        let dir = unsafe { &mut *(ptr.as_ptr() as *mut PageDirectory) };
        dir.physical_address = physical;
        dir.kind = kind;
        if kind == DirectoryKind::Kernel {
            set_kernel_directory(dir);
        }
        Ok(dir)
    }

    pub fn kind(&self) -> DirectoryKind {
        self.kind
    }

    /// Physical address loaded into CR3 for this directory.
    pub fn physical_address(&self) -> PhysicalAddress {
        self.physical_address
    }

    /// Locate the PTE covering `addr`.
    ///
    /// Absent page table: with `create` a zeroed table is allocated from
    /// `source` and installed with present|rw|user at the directory level;
    /// otherwise `Ok(None)`.
    pub fn get_page(
        &mut self,
        addr: VirtualAddress,
        create: bool,
        source: &mut dyn TableSource,
    ) -> KernelResult<Option<&mut PageTableEntry>> {
        let page = addr.page_index();
        let table_index = page / PAGE_ENTRIES;
        let entry_index = page % PAGE_ENTRIES;
        if table_index >= PAGE_ENTRIES {
            return Err(KernelError::InvalidArgument { name: "addr" });
        }
        if self.tables[table_index].is_null() {
            if !create {
                return Ok(None);
            }
            let _guard = InterruptGuard::disable();
            let (ptr, physical) = source.alloc_table(core::mem::size_of::<PageTable>())?;
            self.tables[table_index] = ptr.as_ptr() as *mut PageTable;
            self.tables_physical[table_index] =
                (physical.as_usize() as u32) | DIRECTORY_ENTRY_FLAGS;
        }
        // SAFETY: non-null table pointers only ever come from a TableSource,
        // whose allocations are valid for the rest of the run; `self` is
        // borrowed mutably, so the entry reference cannot alias.
        let table = unsafe { &mut *self.tables[table_index] };
        Ok(Some(&mut table.entries[entry_index]))
    }

    /// Map the page range `[first, last)`.
    ///
    /// With `identity_map`, each page is backed by its own physical frame
    /// (virtual == physical). Returns the number of pages visited.
    pub fn map_pages(
        &mut self,
        first: usize,
        last: usize,
        create: bool,
        identity_map: bool,
        source: &mut dyn TableSource,
        frames: &mut FrameAllocator,
    ) -> KernelResult<usize> {
        for page in first..last {
            let addr = VirtualAddress::new(page * PAGE_SIZE);
            if let Some(entry) = self.get_page(addr, create, source)? {
                if identity_map {
                    frames.alloc_frame_at(
                        entry,
                        page,
                        PageFlags::PRESENT | PageFlags::WRITABLE,
                    )?;
                }
            }
        }
        Ok(last.saturating_sub(first))
    }

    /// Make this the current directory: record it and write CR3.
    pub fn load(&mut self) {
        let _guard = InterruptGuard::disable();
        CURRENT_DIRECTORY.lock().replace(DirectoryPtr(self));
        // SAFETY: `physical_address` is the page-aligned physical location
        // of `tables_physical`, established at creation; interrupts are
        // disabled by the guard above.
        unsafe {
            arch::write_cr3(self.physical_address.as_usize());
        }
    }
}

/// Set CR0 bit 31, leaving everything else untouched.
pub fn enable_paging() {
    let _guard = InterruptGuard::disable();
    // SAFETY: callers sequence this after a directory load; flipping only
    // bit 31 preserves the remaining control state.
    unsafe {
        arch::write_cr0(arch::read_cr0() | arch::CR0_PAGING);
    }
}

/// Clear CR0 bit 31, leaving everything else untouched.
pub fn disable_paging() {
    let _guard = InterruptGuard::disable();
    // SAFETY: as for `enable_paging`.
    unsafe {
        arch::write_cr0(arch::read_cr0() & !arch::CR0_PAGING);
    }
}

pub fn paging_enabled() -> bool {
    arch::read_cr0() & arch::CR0_PAGING != 0
}

struct DirectoryPtr(*mut PageDirectory);

// SAFETY: directory pointers originate from TableSource allocations that are
// never freed; all access is serialised by the mutexes below.
unsafe impl Send for DirectoryPtr {}

static KERNEL_DIRECTORY: Mutex<Option<DirectoryPtr>> = Mutex::new(None);
static CURRENT_DIRECTORY: Mutex<Option<DirectoryPtr>> = Mutex::new(None);

fn set_kernel_directory(dir: &mut PageDirectory) {
    KERNEL_DIRECTORY.lock().replace(DirectoryPtr(dir));
}

/// Forget the registered kernel directory. Test scaffolding.
pub fn clear_kernel_directory() {
    KERNEL_DIRECTORY.lock().take();
    CURRENT_DIRECTORY.lock().take();
}

/// Run `f` against the kernel directory. The directory lock is held for the
/// duration, so `f` must not re-enter paging globals.
pub fn with_kernel_directory<R>(f: impl FnOnce(&mut PageDirectory) -> R) -> Option<R> {
    let guard = KERNEL_DIRECTORY.lock();
    let ptr = guard.as_ref()?.0;
    // SAFETY: the pointer was registered from a live &mut and the backing
    // allocation is permanent; the held lock prevents concurrent access.
    Some(f(unsafe { &mut *ptr }))
}

/// CR3 contents of the currently loaded directory, if any.
pub fn current_directory_physical() -> Option<PhysicalAddress> {
    let guard = CURRENT_DIRECTORY.lock();
    let ptr = guard.as_ref()?.0;
    // SAFETY: as in with_kernel_directory; read-only access.
    Some(unsafe { (*ptr).physical_address })
}

// ---------------------------------------------------------------------------
// Page-fault handling
// ---------------------------------------------------------------------------

/// ISR 14. Logs the decoded fault; a fault taken in kernel mode is fatal, a
/// user-mode fault currently has no recovery path but does not bring the
/// kernel down.
pub fn page_fault_handler(frame: &mut InterruptFrame) {
    let address = arch::read_cr2();
    let code = PageFaultCode::from_bits_truncate(frame.err_code);
    let user = code.contains(PageFaultCode::USER);
    log::error!(
        "page fault at {:#010X} in {} mode when {} because {}",
        address,
        if user { "user" } else { "kernel" },
        if code.contains(PageFaultCode::WRITE) {
            "writing"
        } else {
            "reading"
        },
        if code.contains(PageFaultCode::PRESENT) {
            "of a protection violation"
        } else {
            "the page was not marked present"
        }
    );
    if !user {
        panic!("kernel triggered page fault at {:#010X}", address);
    }
}

/// Build the frame bitmap, the kernel directory and the identity map, then
/// switch paging on. Boot path only.
///
/// Page 0 is deliberately left unmapped so null dereferences fault. Pages
/// `[1, heap_start/PAGE_SIZE)` are identity-mapped with frames; the heap
/// window `[heap_start, heap_start + heap_window)` gets page tables but no
/// frames -- the heap commits those on demand.
///
/// # Safety
///
/// Must run exactly once, before interrupts are enabled, with the bump
/// allocator seeded and virtual == physical for all touched addresses.
pub unsafe fn init(total_kib: usize, heap_start: usize, heap_window: usize) -> KernelResult<()> {
    use super::bump::STATIC_ALLOCATOR;
    use super::frame::{FrameBitmap, FRAME_ALLOCATOR};

    let _guard = InterruptGuard::disable();
    let frames = total_kib * 1024 / PAGE_SIZE;
    {
        let mut slot = STATIC_ALLOCATOR.lock();
        let bump = slot.as_mut().ok_or(KernelError::NotInitialized {
            subsystem: "static allocator",
        })?;
        let words = FrameBitmap::words_for(frames);
        let storage = bump.alloc(words * core::mem::size_of::<u32>())? as *mut u32;
        // SAFETY: the storage was just allocated for exactly `words` words;
        // the bitmap requires it zeroed.
        unsafe {
            core::ptr::write_bytes(storage, 0, words);
        }
        // SAFETY: storage is zeroed, sized for `frames` bits, and bump
        // allocations live forever.
        let bitmap = unsafe { FrameBitmap::from_raw(storage, frames) };
        FRAME_ALLOCATOR.lock().init_with(bitmap)?;
    }

    let heap_page = heap_start / PAGE_SIZE;
    let heap_last = (heap_start + heap_window + PAGE_SIZE - 1) / PAGE_SIZE;
    {
        let mut slot = STATIC_ALLOCATOR.lock();
        let bump = slot.as_mut().ok_or(KernelError::NotInitialized {
            subsystem: "static allocator",
        })?;
        let dir = PageDirectory::create(DirectoryKind::Kernel, bump)?;
        let mut frame_allocator = FRAME_ALLOCATOR.lock();
        // Identity map everything below the heap, skipping page 0.
        dir.map_pages(1, heap_page, true, true, bump, &mut frame_allocator)?;
        // Pre-plumb page tables for the whole heap window, no frames yet.
        dir.map_pages(heap_page, heap_last, true, false, bump, &mut frame_allocator)?;
        dir.load();
    }

    crate::interrupt::set_interrupt_handler(crate::interrupt::ISR_PAGE_FAULT, page_fault_handler);
    enable_paging();
    log::info!(
        "paging enabled: identity map to {:#010X}, heap window {:#010X}..{:#010X}",
        heap_start,
        heap_start,
        heap_start + heap_window
    );
    Ok(())
}

// ---------------------------------------------------------------------------
// Host arena for tests
// ---------------------------------------------------------------------------

/// [`TableSource`] over leaked host allocations. Physical addresses are
/// synthetic (a page-aligned counter), which is exactly what the bitmap and
/// the hardware arrays want in a unit test.
#[cfg(not(target_os = "none"))]
pub struct TestArena {
    next_physical: usize,
}

#[cfg(not(target_os = "none"))]
impl TestArena {
    pub fn new() -> Self {
        Self {
            next_physical: 0x100_000,
        }
    }
}

#[cfg(not(target_os = "none"))]
impl Default for TestArena {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(not(target_os = "none"))]
impl TableSource for TestArena {
    fn alloc_table(&mut self, size: usize) -> KernelResult<(NonNull<u8>, PhysicalAddress)> {
        extern crate alloc;
        use alloc::alloc::{alloc_zeroed, Layout};
        let layout = Layout::from_size_align(size.max(1), PAGE_SIZE)
            .map_err(|_| KernelError::InvalidArgument { name: "size" })?;
        // SAFETY: layout has non-zero size; the allocation is intentionally
        // leaked to satisfy the permanently-live contract.
        let ptr = unsafe { alloc_zeroed(layout) };
        let ptr = NonNull::new(ptr).ok_or(KernelError::OutOfFrames)?;
        let physical = PhysicalAddress::new(self.next_physical);
        self.next_physical += super::align_up(size.max(1), PAGE_SIZE);
        Ok((ptr, physical))
    }
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::super::{VirtualAddress, PAGE_SIZE};
    use super::*;
    use crate::arch;
    use crate::interrupt::InterruptFrame;

    #[test]
    fn test_entry_packs_frame_and_flags() {
        let mut entry = PageTableEntry::empty();
        entry.assign(0xABCDE, PageFlags::PRESENT | PageFlags::USER);
        assert_eq!(entry.frame(), 0xABCDE);
        assert!(entry.is_present());
        assert!(entry.is_user());
        assert!(!entry.is_writable());
        assert_eq!(entry.raw(), (0xABCDE << 12) | 0b101);
    }

    #[test]
    fn test_get_page_without_create_reports_absent_table() {
        let mut arena = TestArena::new();
        let dir = PageDirectory::create(DirectoryKind::User, &mut arena)
            .expect("directory allocation succeeds");
        let result = dir
            .get_page(VirtualAddress::new(0x40_0000), false, &mut super::super::NoTables)
            .expect("lookup itself cannot fail");
        assert!(result.is_none());
    }

    #[test]
    fn test_get_page_create_installs_table() {
        let mut arena = TestArena::new();
        let dir = PageDirectory::create(DirectoryKind::User, &mut arena)
            .expect("directory allocation succeeds");
        let first = {
            let entry = dir
                .get_page(VirtualAddress::new(0x40_1000), true, &mut arena)
                .expect("table allocation succeeds")
                .expect("entry exists after create");
            assert!(!entry.is_present());
            entry as *mut PageTableEntry as usize
        };
        // Table 1 (addresses 4..8 MiB) must now be installed present|rw|user.
        assert_eq!(dir.tables_physical[1] & 0x7, 0x7);
        // A second walk hits the same entry.
        let again = dir
            .get_page(VirtualAddress::new(0x40_1000), false, &mut super::super::NoTables)
            .expect("lookup succeeds")
            .expect("entry still there");
        assert_eq!(again as *mut PageTableEntry as usize, first);
    }

    #[test]
    fn test_identity_map_is_identity() {
        use super::super::frame::{FrameAllocator, FrameBitmap};
        use alloc::{boxed::Box, vec};

        let mut arena = TestArena::new();
        let dir = PageDirectory::create(DirectoryKind::User, &mut arena)
            .expect("directory allocation succeeds");
        let mut frames = FrameAllocator::new();
        let words = vec![0u32; FrameBitmap::words_for(512)];
        let leaked: &'static mut [u32] = Box::leak(words.into_boxed_slice());
        // SAFETY: zeroed, correctly sized, leaked storage.
        frames
            .init_with(unsafe { FrameBitmap::from_raw(leaked.as_mut_ptr(), 512) })
            .expect("fresh init succeeds");

        dir.map_pages(0, 256, true, true, &mut arena, &mut frames)
            .expect("identity map succeeds");
        assert_eq!(frames.allocated_bits(), 256);
        for page in [0usize, 1, 7, 255] {
            let entry = dir
                .get_page(VirtualAddress::new(page * PAGE_SIZE), false, &mut super::super::NoTables)
                .expect("lookup succeeds")
                .expect("page mapped");
            assert_eq!(entry.frame() * PAGE_SIZE, page * PAGE_SIZE);
            assert!(entry.is_present());
        }
    }

    #[test]
    fn test_load_and_enable_round_trip() {
        let mut arena = TestArena::new();
        let dir = PageDirectory::create(DirectoryKind::User, &mut arena)
            .expect("directory allocation succeeds");
        dir.load();
        assert_eq!(
            arch::read_cr3(),
            dir.physical_address().as_usize(),
            "CR3 must hold the physical tables address"
        );
        let cr0_before = arch::read_cr0() & !arch::CR0_PAGING;
        enable_paging();
        assert!(paging_enabled());
        disable_paging();
        assert!(!paging_enabled());
        enable_paging();
        assert!(paging_enabled());
        // Only bit 31 moves.
        assert_eq!(arch::read_cr0() & !arch::CR0_PAGING, cr0_before);
        disable_paging();
    }

    #[test]
    #[should_panic(expected = "kernel triggered page fault")]
    fn test_kernel_mode_fault_is_fatal() {
        crate::arch::host::set_cr2_for_test(0);
        let mut frame = InterruptFrame::zeroed();
        frame.int_no = 14;
        frame.err_code = PageFaultCode::WRITE.bits();
        page_fault_handler(&mut frame);
    }

    #[test]
    fn test_user_mode_fault_is_survivable() {
        crate::arch::host::set_cr2_for_test(0xDEAD_0000);
        let mut frame = InterruptFrame::zeroed();
        frame.int_no = 14;
        frame.err_code = (PageFaultCode::USER | PageFaultCode::PRESENT).bits();
        page_fault_handler(&mut frame);
    }
}
