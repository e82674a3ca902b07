//! Physical frame allocator.
//!
//! One bit per 4 KiB frame, in 32-bit words. Allocation is a linear scan
//! that skips full words, then a bit scan inside the first word with room --
//! deliberately the simplest correct structure, not a buddy system.

use spin::Mutex;

use super::paging::{PageFlags, PageTableEntry};
use super::PAGE_SIZE;
use crate::error::{KernelError, KernelResult};

const BITS_PER_WORD: usize = 32;
const FULL_WORD: u32 = u32::MAX;

/// Dense bit vector over physical frames. Bit set = frame allocated.
///
/// The word storage is supplied by the caller (the bump allocator during
/// boot, a leaked buffer in tests) and must outlive the bitmap.
pub struct FrameBitmap {
    words: *mut u32,
    frames: usize,
}

// SAFETY: the bitmap is only reached through the FRAME_ALLOCATOR mutex (or
// exclusively-owned test instances), so the raw storage pointer is never
// aliased mutably.
unsafe impl Send for FrameBitmap {}

impl FrameBitmap {
    /// Number of `u32` words needed to track `frames` frames.
    pub const fn words_for(frames: usize) -> usize {
        (frames + BITS_PER_WORD - 1) / BITS_PER_WORD
    }

    /// Wrap caller-provided storage.
    ///
    /// # Safety
    ///
    /// `words` must point at `words_for(frames)` zeroed `u32`s that live at
    /// least as long as the bitmap and are not accessed through any other
    /// path.
    pub unsafe fn from_raw(words: *mut u32, frames: usize) -> Self {
        Self { words, frames }
    }

    pub fn frame_count(&self) -> usize {
        self.frames
    }

    fn word(&self, index: usize) -> u32 {
        debug_assert!(index < Self::words_for(self.frames));
        // SAFETY: index is within the storage per from_raw's contract.
        unsafe { *self.words.add(index) }
    }

    fn word_mut(&mut self, index: usize) -> &mut u32 {
        debug_assert!(index < Self::words_for(self.frames));
        // SAFETY: index is within the storage per from_raw's contract.
        unsafe { &mut *self.words.add(index) }
    }

    pub fn is_set(&self, frame: usize) -> bool {
        self.word(frame / BITS_PER_WORD) & (1 << (frame % BITS_PER_WORD)) != 0
    }

    pub fn set(&mut self, frame: usize) {
        *self.word_mut(frame / BITS_PER_WORD) |= 1 << (frame % BITS_PER_WORD);
    }

    pub fn clear(&mut self, frame: usize) {
        *self.word_mut(frame / BITS_PER_WORD) &= !(1 << (frame % BITS_PER_WORD));
    }

    /// First clear bit, skipping words that are all ones.
    pub fn first_free(&self) -> Option<usize> {
        let words = Self::words_for(self.frames);
        for i in 0..words {
            let word = self.word(i);
            if word == FULL_WORD {
                continue;
            }
            let bit = (!word).trailing_zeros() as usize;
            let frame = i * BITS_PER_WORD + bit;
            if frame < self.frames {
                return Some(frame);
            }
        }
        None
    }

    /// Count of set bits. O(words); used by diagnostics and tests.
    pub fn set_count(&self) -> usize {
        let words = Self::words_for(self.frames);
        (0..words).map(|i| self.word(i).count_ones() as usize).sum()
    }
}

/// The frame allocator proper: the bitmap plus usage counters.
pub struct FrameAllocator {
    bitmap: Option<FrameBitmap>,
    used: usize,
}

impl FrameAllocator {
    pub const fn new() -> Self {
        Self {
            bitmap: None,
            used: 0,
        }
    }

    /// Adopt the bitmap storage. Called once from `mm` init with storage
    /// sized for `total_kib * 1024 / 4096` frames.
    pub fn init_with(&mut self, bitmap: FrameBitmap) -> KernelResult<()> {
        if self.bitmap.is_some() {
            return Err(KernelError::InvalidArgument { name: "frame allocator reinit" });
        }
        log::info!(
            "tracking {} physical frames ({} KiB)",
            bitmap.frame_count(),
            bitmap.frame_count() * PAGE_SIZE / 1024
        );
        self.bitmap = Some(bitmap);
        self.used = 0;
        Ok(())
    }

    pub fn is_initialized(&self) -> bool {
        self.bitmap.is_some()
    }

    fn bitmap_mut(&mut self) -> KernelResult<&mut FrameBitmap> {
        self.bitmap.as_mut().ok_or(KernelError::NotInitialized {
            subsystem: "frame allocator",
        })
    }

    /// Back `entry` with the first free frame and fill its access bits from
    /// `flags`. A no-op when the entry already references a frame.
    pub fn alloc_frame(
        &mut self,
        entry: &mut PageTableEntry,
        flags: PageFlags,
    ) -> KernelResult<()> {
        if entry.frame() != 0 {
            return Ok(());
        }
        let bitmap = self.bitmap_mut()?;
        let frame = bitmap.first_free().ok_or(KernelError::OutOfFrames)?;
        bitmap.set(frame);
        self.used += 1;
        entry.assign(frame, flags);
        Ok(())
    }

    /// Back `entry` with the specific frame `frame` (identity mapping).
    pub fn alloc_frame_at(
        &mut self,
        entry: &mut PageTableEntry,
        frame: usize,
        flags: PageFlags,
    ) -> KernelResult<()> {
        if entry.frame() != 0 {
            return Ok(());
        }
        let bitmap = self.bitmap_mut()?;
        if frame >= bitmap.frame_count() {
            return Err(KernelError::InvalidArgument { name: "frame" });
        }
        if !bitmap.is_set(frame) {
            bitmap.set(frame);
            self.used += 1;
        }
        entry.assign(frame, flags);
        Ok(())
    }

    /// Release the frame behind `entry` and clear its frame field.
    /// Idempotent: an entry with no frame is left alone.
    pub fn free_frame(&mut self, entry: &mut PageTableEntry) {
        let frame = entry.frame();
        if frame == 0 {
            return;
        }
        if let Ok(bitmap) = self.bitmap_mut() {
            if bitmap.is_set(frame) {
                bitmap.clear(frame);
                self.used = self.used.saturating_sub(1);
            }
        }
        entry.clear_frame();
    }

    /// Frames currently marked allocated.
    pub fn used_frames(&self) -> usize {
        self.used
    }

    /// Set-bit population of the bitmap (equals `used_frames` unless a
    /// caller manipulated bits directly).
    pub fn allocated_bits(&self) -> usize {
        self.bitmap.as_ref().map_or(0, FrameBitmap::set_count)
    }

    pub fn total_frames(&self) -> usize {
        self.bitmap.as_ref().map_or(0, FrameBitmap::frame_count)
    }

    /// Tear down for tests that re-run init.
    pub fn reset(&mut self) -> Option<FrameBitmap> {
        self.used = 0;
        self.bitmap.take()
    }
}

impl Default for FrameAllocator {
    fn default() -> Self {
        Self::new()
    }
}

/// Global frame allocator instance.
pub static FRAME_ALLOCATOR: Mutex<FrameAllocator> = Mutex::new(FrameAllocator::new());
