//! Kernel heap integration tests: the allocation scenarios and
//! accounting laws.

use std::alloc::{alloc_zeroed, Layout};
use std::ops::Range;

use redshift_kernel::error::KernelError;
use redshift_kernel::mm::heap::{AllocAlign, Heap, HeapFlags, MIN_BLOCK_SIZE};
use redshift_kernel::mm::{align_up, PageSource, PAGE_SIZE};

const INDEX_CAPACITY: usize = 256;

/// The whole test region is allocated up front, so commit/release just
/// record traffic.
struct PreBacked {
    commits: Vec<Range<usize>>,
    releases: Vec<Range<usize>>,
}

impl PreBacked {
    fn new() -> Self {
        Self {
            commits: Vec::new(),
            releases: Vec::new(),
        }
    }
}

impl PageSource for PreBacked {
    fn commit(&mut self, range: Range<usize>) -> Result<(), KernelError> {
        self.commits.push(range);
        Ok(())
    }

    fn release(&mut self, range: Range<usize>) {
        self.releases.push(range);
    }
}

fn region(bytes: usize) -> usize {
    let layout = Layout::from_size_align(bytes, PAGE_SIZE).expect("valid layout");
    // SAFETY: non-zero size; leaked so the heap region lives for the whole
    // test run.
    let ptr = unsafe { alloc_zeroed(layout) };
    assert!(!ptr.is_null());
    ptr as usize
}

fn fresh_heap(init: usize, max: usize, min: usize) -> Heap {
    let start = region(max);
    // SAFETY: region is fully backed and exclusively owned by this heap.
    unsafe {
        Heap::create_sized(start, init, max, min, HeapFlags::supervisor(), INDEX_CAPACITY)
            .expect("heap geometry is valid")
    }
}

fn index_overhead() -> usize {
    INDEX_CAPACITY * core::mem::size_of::<usize>()
}

// ===== Scenario: seventeen blocks, free the even ones, reuse the hole =====

#[test]
fn test_coalesced_hole_is_reused_before_fresh_space() {
    let mut heap = fresh_heap(0x10000, 0x40000, 0x1000);
    let mut pages = PreBacked::new();

    let blocks: Vec<*mut u8> = (0..17)
        .map(|i| {
            heap.allocate(100, AllocAlign::Natural, &mut pages)
                .unwrap_or_else(|| panic!("allocation {} fits", i))
                .as_ptr()
        })
        .collect();
    heap.check_integrity();

    // Free blocks 0, 2, 4, ..., 16.
    for i in (0..17).step_by(2) {
        heap.free(blocks[i], &mut pages);
    }
    heap.check_integrity();

    // Free 1 and 3 as well: blocks 0..=4 coalesce into one hole spanning
    // five former allocations.
    heap.free(blocks[1], &mut pages);
    heap.free(blocks[3], &mut pages);
    heap.check_integrity();

    // A 300-byte request reuses that coalesced hole, not the space past
    // block 16.
    let reused = heap
        .allocate(300, AllocAlign::Natural, &mut pages)
        .expect("reuse fits")
        .as_ptr() as usize;
    assert_eq!(
        reused,
        blocks[0] as usize,
        "the coalesced hole at the old block 0 must satisfy the request"
    );
    assert!(
        reused < blocks[16] as usize,
        "no fresh space past the last block may be used"
    );
    heap.check_integrity();
}

// ===== Round-trip laws =====

#[test]
fn test_alloc_free_preserves_bytes_allocated() {
    let mut heap = fresh_heap(0x10000, 0x40000, 0x1000);
    let mut pages = PreBacked::new();
    for size in [1usize, 7, 100, 1024, 4000] {
        let before = heap.stats();
        let ptr = heap
            .allocate(size, AllocAlign::Natural, &mut pages)
            .expect("fits");
        heap.free(ptr.as_ptr(), &mut pages);
        let after = heap.stats();
        assert_eq!(after.bytes_allocated, before.bytes_allocated, "size {}", size);
        assert_eq!(after.alloc_count, before.alloc_count + 1);
        assert_eq!(after.free_count, before.free_count + 1);
        assert!(after.free_count <= after.alloc_count);
    }
    heap.check_integrity();
}

#[test]
fn test_bytes_allocated_tracks_live_sum() {
    let mut heap = fresh_heap(0x10000, 0x40000, 0x1000);
    let mut pages = PreBacked::new();
    let a = heap.allocate(100, AllocAlign::Natural, &mut pages).expect("a");
    let b = heap.allocate(200, AllocAlign::Natural, &mut pages).expect("b");
    let c = heap.allocate(300, AllocAlign::Natural, &mut pages).expect("c");
    assert_eq!(heap.stats().bytes_allocated, 600);
    heap.free(b.as_ptr(), &mut pages);
    assert_eq!(heap.stats().bytes_allocated, 400);
    heap.free(a.as_ptr(), &mut pages);
    heap.free(c.as_ptr(), &mut pages);
    assert_eq!(heap.stats().bytes_allocated, 0);
    assert!(heap.stats().bytes_allocated <= heap.size());
}

#[test]
fn test_resize_identity_law() {
    let mut heap = fresh_heap(0x10000, 0x40000, 0x1000);
    let mut pages = PreBacked::new();
    let ptr = heap
        .allocate(256, AllocAlign::Natural, &mut pages)
        .expect("fits");
    let same = heap
        .resize(ptr.as_ptr(), 256, &mut pages)
        .expect("identity resize succeeds");
    assert_eq!(ptr, same);
}

// ===== Boundary behaviours =====

#[test]
fn test_over_max_request_leaves_heap_untouched() {
    let max = 0x8000 + index_overhead();
    let mut heap = fresh_heap(0x4000 + index_overhead(), max, 0x1000);
    let mut pages = PreBacked::new();
    let before = heap.stats();
    assert!(heap
        .allocate(max, AllocAlign::Natural, &mut pages)
        .is_none());
    assert_eq!(heap.stats(), before);
    assert!(pages.releases.is_empty());
    heap.check_integrity();
}

#[test]
fn test_exact_fit_leaves_no_holes() {
    let mut heap = fresh_heap(0x4000, 0x4000, 0x1000);
    let mut pages = PreBacked::new();
    // The fresh heap is one hole; take exactly all of it.
    let hole_size = 0x4000 - index_overhead() - MIN_BLOCK_SIZE;
    let ptr = heap
        .allocate(hole_size, AllocAlign::Natural, &mut pages)
        .expect("exact fit succeeds");
    let stats = heap.stats();
    assert_eq!(stats.bytes_allocated, hole_size);
    assert_eq!(stats.live_blocks, 1, "no hole survives an exact fit");
    heap.check_integrity();
    heap.free(ptr.as_ptr(), &mut pages);
    heap.check_integrity();
}

#[test]
fn test_contraction_stops_at_min_size() {
    let min = align_up(index_overhead() + 0x1000, PAGE_SIZE);
    let mut heap = fresh_heap(align_up(index_overhead() + 0x2000, PAGE_SIZE), 0x100000, min);
    let mut pages = PreBacked::new();
    let ptr = heap
        .allocate(0x40000, AllocAlign::Natural, &mut pages)
        .expect("grows");
    assert!(heap.size() > min);
    heap.free(ptr.as_ptr(), &mut pages);
    assert_eq!(heap.size(), min, "contraction must stop at min_size");
    assert!(!pages.releases.is_empty());
    // Released pages all lie beyond the surviving region.
    for range in &pages.releases {
        assert!(range.start >= heap.start() + min);
    }
    heap.check_integrity();
}

#[test]
fn test_growth_commits_only_new_pages() {
    let init = align_up(index_overhead() + 0x1000, PAGE_SIZE);
    let mut heap = fresh_heap(init, 0x100000, init);
    let mut pages = PreBacked::new();
    heap.allocate(0x8000, AllocAlign::Natural, &mut pages)
        .expect("grows");
    assert_eq!(pages.commits.len(), 1);
    let committed = pages.commits[0].clone();
    assert_eq!(committed.start, heap.start() + init);
    assert_eq!(committed.end, heap.start() + heap.size());
    assert_eq!(committed.start % PAGE_SIZE, 0);
    assert_eq!(committed.end % PAGE_SIZE, 0);
}

// ===== Fatal paths =====

#[test]
#[should_panic(expected = "double free")]
fn test_double_free_panics() {
    let mut heap = fresh_heap(0x10000, 0x40000, 0x1000);
    let mut pages = PreBacked::new();
    let ptr = heap
        .allocate(64, AllocAlign::Natural, &mut pages)
        .expect("fits");
    heap.free(ptr.as_ptr(), &mut pages);
    heap.free(ptr.as_ptr(), &mut pages);
}

// ===== Page-aligned allocation =====

#[test]
fn test_page_aligned_allocations_interleave_with_natural() {
    let mut heap = fresh_heap(0x20000, 0x80000, 0x1000);
    let mut pages = PreBacked::new();
    let a = heap.allocate(100, AllocAlign::Natural, &mut pages).expect("a");
    let b = heap.allocate(512, AllocAlign::Page, &mut pages).expect("b");
    let c = heap.allocate(100, AllocAlign::Natural, &mut pages).expect("c");
    assert_eq!(b.as_ptr() as usize % PAGE_SIZE, 0);
    heap.check_integrity();
    heap.free(b.as_ptr(), &mut pages);
    heap.check_integrity();
    heap.free(a.as_ptr(), &mut pages);
    heap.free(c.as_ptr(), &mut pages);
    heap.check_integrity();
    assert_eq!(heap.stats().bytes_allocated, 0);
}
