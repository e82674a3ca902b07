//! Error types for the Redshift kernel
//!
//! Recoverable failures travel as [`KernelError`]; the fatal conditions of
//! the boot and memory paths panic at the call site that discovers them.

use core::fmt;

/// Result alias used throughout the kernel.
pub type KernelResult<T> = core::result::Result<T, KernelError>;

/// Main kernel error type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use = "kernel errors must be handled, not silently discarded"]
pub enum KernelError {
    /// The bootloader did not identify itself as Multiboot2.
    BadBootMagic {
        expected: u32,
        actual: u32,
    },
    /// The bootloader passed no tag list.
    MissingBootInfo,
    /// A required boot module (the initial ramdisk) was not supplied.
    MissingBootModule,
    /// The initial ramdisk does not contain the kernel symbol table.
    MissingSymbolTable {
        path: &'static str,
    },
    /// The static (pre-heap) allocator ran past the end of usable memory.
    OutOfStaticMemory {
        requested: usize,
        remaining: usize,
    },
    /// No clear bit left in the physical frame bitmap.
    OutOfFrames,
    /// The heap cannot satisfy a request and is already at `max_size`.
    HeapExhausted {
        requested: usize,
    },
    /// A heap block failed its magic or back-pointer validation.
    HeapCorruption {
        address: usize,
    },
    /// A block was freed while already marked available.
    DoubleFree {
        address: usize,
    },
    /// No memory-map region is large enough to host the kernel heap.
    NoHeapRegion {
        requested: usize,
    },
    /// A virtual address has no page table and creation was not requested.
    UnmappedAddress {
        addr: usize,
    },
    /// Subsystem used before its `init()` ran.
    NotInitialized {
        subsystem: &'static str,
    },
    /// An argument was outside its valid range.
    InvalidArgument {
        name: &'static str,
    },
    /// The process table has no slot with the given id.
    ProcessNotFound {
        pid: u32,
    },
    /// A malformed record was found while reading the initial ramdisk.
    BadArchive {
        offset: usize,
    },
    /// The symbol table text failed to parse.
    BadSymbolTable {
        line: usize,
    },
}

impl fmt::Display for KernelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KernelError::BadBootMagic { expected, actual } => write!(
                f,
                "unsupported bootloader: bad magic number (expected {:#010X}, got {:#010X})",
                expected, actual
            ),
            KernelError::MissingBootInfo => write!(f, "bootloader has not passed system info"),
            KernelError::MissingBootModule => {
                write!(f, "no initial ramdisk (must be passed as first boot module)")
            }
            KernelError::MissingSymbolTable { path } => {
                write!(f, "initial ramdisk does not contain the symbol table ({})", path)
            }
            KernelError::OutOfStaticMemory {
                requested,
                remaining,
            } => write!(
                f,
                "static allocator exhausted ({} bytes requested, {} remaining)",
                requested, remaining
            ),
            KernelError::OutOfFrames => write!(f, "out of physical frames"),
            KernelError::HeapExhausted { requested } => {
                write!(f, "heap exhausted ({} bytes requested at max size)", requested)
            }
            KernelError::HeapCorruption { address } => {
                write!(f, "corrupted heap block at {:#010X}", address)
            }
            KernelError::DoubleFree { address } => {
                write!(f, "double free of heap block at {:#010X}", address)
            }
            KernelError::NoHeapRegion { requested } => write!(
                f,
                "no memory region large enough for kernel heap ({}K)",
                requested / 1024
            ),
            KernelError::UnmappedAddress { addr } => {
                write!(f, "no page table covers {:#010X}", addr)
            }
            KernelError::NotInitialized { subsystem } => {
                write!(f, "{} used before initialisation", subsystem)
            }
            KernelError::InvalidArgument { name } => write!(f, "invalid argument: {}", name),
            KernelError::ProcessNotFound { pid } => write!(f, "no such process: {}", pid),
            KernelError::BadArchive { offset } => {
                write!(f, "malformed ramdisk record at offset {:#X}", offset)
            }
            KernelError::BadSymbolTable { line } => {
                write!(f, "syntax error in symbol table at line {}", line)
            }
        }
    }
}
