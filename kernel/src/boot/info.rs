//! System information assembled from the bootloader's tags.

extern crate alloc;

use alloc::string::String;
use alloc::vec::Vec;

use super::multiboot::{
    read_u32, read_u64, Tags, MULTIBOOT2_BOOTLOADER_MAGIC, TAG_BASIC_MEMINFO, TAG_MMAP, TAG_MODULE,
};
use crate::error::{KernelError, KernelResult};
use crate::mm::{align_up, PAGE_SIZE};
use crate::sync::GlobalState;

/// Memory-map region classification, as reported by the bootloader.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegionType {
    Available,
    Reserved,
    Reclaimable,
    Nvs,
    Other(u32),
}

impl From<u32> for RegionType {
    fn from(raw: u32) -> Self {
        match raw {
            1 => RegionType::Available,
            2 => RegionType::Reserved,
            3 => RegionType::Reclaimable,
            4 => RegionType::Nvs,
            other => RegionType::Other(other),
        }
    }
}

/// One memory-map entry.
#[derive(Debug, Clone, Copy)]
pub struct MemoryRegion {
    pub start: u64,
    pub length: u64,
    pub region_type: RegionType,
}

impl MemoryRegion {
    /// First address past the region.
    pub fn end(&self) -> u64 {
        self.start + self.length
    }
}

/// One boot module, in place in memory where the loader put it.
#[derive(Debug, Clone)]
pub struct BootModule {
    pub start: usize,
    pub end: usize,
    pub cmdline: String,
}

impl BootModule {
    pub fn len(&self) -> usize {
        self.end.saturating_sub(self.start)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Everything the memory and boot paths need from the loader.
#[derive(Debug)]
pub struct BootInfo {
    /// Conventional memory below 1 MiB, in KiB.
    pub mem_lower: u32,
    /// Memory above 1 MiB, in KiB.
    pub mem_upper: u32,
    pub regions: Vec<MemoryRegion>,
    pub modules: Vec<BootModule>,
}

impl BootInfo {
    /// Validate the magic and digest the tag list.
    pub fn parse(magic: u32, data: &[u8]) -> KernelResult<Self> {
        if magic != MULTIBOOT2_BOOTLOADER_MAGIC {
            return Err(KernelError::BadBootMagic {
                expected: MULTIBOOT2_BOOTLOADER_MAGIC,
                actual: magic,
            });
        }
        let mut info = BootInfo {
            mem_lower: 0,
            mem_upper: 0,
            regions: Vec::new(),
            modules: Vec::new(),
        };
        for tag in Tags::new(data) {
            match tag.tag_type {
                TAG_BASIC_MEMINFO => {
                    info.mem_lower = read_u32(tag.payload, 0).unwrap_or(0);
                    info.mem_upper = read_u32(tag.payload, 4).unwrap_or(0);
                }
                TAG_MMAP => {
                    let entry_size = read_u32(tag.payload, 0).unwrap_or(24) as usize;
                    if entry_size < 20 {
                        continue;
                    }
                    let mut offset = 8;
                    while offset + entry_size <= tag.payload.len() {
                        let start = read_u64(tag.payload, offset).unwrap_or(0);
                        let length = read_u64(tag.payload, offset + 8).unwrap_or(0);
                        let raw_type = read_u32(tag.payload, offset + 16).unwrap_or(0);
                        info.regions.push(MemoryRegion {
                            start,
                            length,
                            region_type: RegionType::from(raw_type),
                        });
                        offset += entry_size;
                    }
                }
                TAG_MODULE => {
                    let start = read_u32(tag.payload, 0).unwrap_or(0) as usize;
                    let end = read_u32(tag.payload, 4).unwrap_or(0) as usize;
                    let cmdline_bytes = &tag.payload[8.min(tag.payload.len())..];
                    let cmdline = cmdline_bytes
                        .split(|&byte| byte == 0)
                        .next()
                        .and_then(|bytes| core::str::from_utf8(bytes).ok())
                        .unwrap_or("");
                    info.modules.push(BootModule {
                        start,
                        end,
                        cmdline: String::from(cmdline),
                    });
                }
                _ => {}
            }
        }
        Ok(info)
    }

    /// Total discovered memory in KiB.
    pub fn total_kib(&self) -> usize {
        (self.mem_lower + self.mem_upper) as usize
    }

    /// First address past the top of upper memory.
    pub fn memory_limit(&self) -> usize {
        0x10_0000 + self.mem_upper as usize * 1024
    }

    /// Pick the page-aligned start of a `size`-byte heap window: the first
    /// AVAILABLE region that can carry it, skipping ahead of `cursor` so the
    /// heap never overlaps statically allocated kernel memory.
    pub fn find_heap_region(&self, cursor: usize, size: usize) -> KernelResult<usize> {
        for region in &self.regions {
            if region.region_type != RegionType::Available {
                if region.region_type == RegionType::Reclaimable {
                    log::debug!(
                        "reclaimable memory: start={:#010X} end={:#010X}",
                        region.start,
                        region.end()
                    );
                }
                continue;
            }
            if (region.length as usize) < size {
                continue;
            }
            let mut start = region.start as usize;
            if (region.start as usize) < cursor && cursor as u64 <= region.end() {
                start = cursor;
            }
            start = align_up(start, PAGE_SIZE);
            if start + size <= region.end() as usize {
                return Ok(start);
            }
        }
        Err(KernelError::NoHeapRegion { requested: size })
    }
}

/// Boot information singleton, filled once during boot.
pub static BOOT_INFO: GlobalState<BootInfo> = GlobalState::new();

/// Parse the tag block the bootloader left at `addr` and store the result.
///
/// # Safety
///
/// `addr` must point at a complete, readable Multiboot2 information block
/// (the first word is its total size).
pub unsafe fn init_from_pointer(magic: u32, addr: usize) -> KernelResult<()> {
    if addr == 0 {
        return Err(KernelError::MissingBootInfo);
    }
    // SAFETY: caller contract; the prologue word bounds the block.
    let total_size = unsafe { *(addr as *const u32) } as usize;
    if total_size < super::multiboot::INFO_HEADER_BYTES {
        return Err(KernelError::MissingBootInfo);
    }
    // SAFETY: the loader's block is total_size bytes starting at addr.
    let data = unsafe { core::slice::from_raw_parts(addr as *const u8, total_size) };
    let info = BootInfo::parse(magic, data)?;
    log::info!(
        "system has {} KiB RAM, {} memory regions, {} boot modules",
        info.total_kib(),
        info.regions.len(),
        info.modules.len()
    );
    BOOT_INFO
        .init(info)
        .map_err(|_| KernelError::InvalidArgument { name: "boot info reinit" })
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::super::multiboot::testing::InfoBuilder;
    use super::super::multiboot::MULTIBOOT2_BOOTLOADER_MAGIC;
    use super::*;
    use crate::error::KernelError;

    fn sample() -> BootInfo {
        let data = InfoBuilder::new()
            .basic_meminfo(640, 65536)
            .mmap(&[
                (0, 0x9F000, 1),
                (0xF0000, 0x10000, 2),
                (0x100000, 64 * 1024 * 1024, 1),
            ])
            .module(0x30_0000, 0x30_8000, "initrd")
            .finish();
        BootInfo::parse(MULTIBOOT2_BOOTLOADER_MAGIC, &data).expect("valid block parses")
    }

    #[test]
    fn test_rejects_bad_magic() {
        let data = InfoBuilder::new().basic_meminfo(640, 65536).finish();
        let err = BootInfo::parse(0xCAFEBABE, &data).expect_err("wrong magic must fail");
        assert!(matches!(err, KernelError::BadBootMagic { .. }));
    }

    #[test]
    fn test_extracts_meminfo_and_regions() {
        let info = sample();
        assert_eq!(info.mem_lower, 640);
        assert_eq!(info.mem_upper, 65536);
        assert_eq!(info.total_kib(), 66176);
        assert_eq!(info.regions.len(), 3);
        assert_eq!(info.regions[0].region_type, RegionType::Available);
        assert_eq!(info.regions[1].region_type, RegionType::Reserved);
        assert_eq!(info.regions[2].end(), 0x100000 + 64 * 1024 * 1024);
    }

    #[test]
    fn test_extracts_modules() {
        let info = sample();
        assert_eq!(info.modules.len(), 1);
        let module = &info.modules[0];
        assert_eq!(module.start, 0x30_0000);
        assert_eq!(module.len(), 0x8000);
        assert_eq!(module.cmdline, "initrd");
    }

    #[test]
    fn test_heap_region_skips_static_cursor() {
        let info = sample();
        // Cursor inside the big region: the heap starts at the cursor,
        // page aligned.
        let start = info
            .find_heap_region(0x40_0123, 0x100_0000)
            .expect("big region fits");
        assert_eq!(start, 0x40_1000);
        // Cursor below all regions: first fitting region wins from its base.
        let start = info
            .find_heap_region(0, 0x100_0000)
            .expect("big region fits");
        assert_eq!(start, 0x100000);
    }

    #[test]
    fn test_heap_region_failure_when_nothing_fits() {
        let info = sample();
        let err = info
            .find_heap_region(0, 0x1000_0000)
            .expect_err("256 MiB cannot fit");
        assert!(matches!(err, KernelError::NoHeapRegion { .. }));
    }
}
