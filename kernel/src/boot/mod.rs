//! Bootloader handshake and boot-time system information.

pub mod info;
pub mod multiboot;

pub use info::{BootInfo, BootModule, MemoryRegion, RegionType, BOOT_INFO};
pub use multiboot::MULTIBOOT2_BOOTLOADER_MAGIC;
