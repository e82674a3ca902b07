//! Staged boot sequence.
//!
//! `run` takes the machine from the Multiboot2 handoff to a running
//! scheduler, in the dependency order the memory subsystem dictates:
//! console, descriptor tables, boot info, bump allocator, paging, heap,
//! initrd, symbol table, timer, scheduler -- then interrupts on and the
//! first yield.

use crate::boot::{self, BootModule, BOOT_INFO};
use crate::config::{
    DEFAULT_STACK_SIZE, HEAP_INITIAL_SIZE, HEAP_MAX_SIZE, HEAP_MIN_SIZE, PAGE_SIZE,
    SYMBOL_MAP_PATH,
};
use crate::error::KernelError;
use crate::interrupt;
use crate::mm::{self, frame::FrameBitmap, paging, PhysicalAddress};
use crate::sched::{self, ProcessFlags};
use crate::{arch, initrd, ksyms, logger, println, timer};

extern "C" {
    /// End of the loaded kernel image, from the linker script.
    static __kernel_end: u8;
}

fn splash() {
    println!("                          _   __  _   _      ___  __ ___");
    println!("                         |_| |__ | \\ |_  |_|  |  |__  |");
    println!("                         | \\ |__ |_/  _| | | _|_ |    |");
    println!();
    println!("redshift {}", env!("CARGO_PKG_VERSION"));
}

/// Rough upper bound on the bump memory paging will consume, so the heap
/// window can be placed past it before the tables exist: frame bitmap,
/// directory, and two words of slack per page table for alignment padding.
fn paging_reservation(cursor: usize, total_kib: usize) -> usize {
    let frames = total_kib * 1024 / PAGE_SIZE;
    let bitmap = FrameBitmap::words_for(frames) * core::mem::size_of::<u32>();
    let directory = core::mem::size_of::<paging::PageDirectory>() + PAGE_SIZE;
    let identity_tables = cursor / PAGE_SIZE / 1024 + 1;
    let window_tables = HEAP_MAX_SIZE / PAGE_SIZE / 1024 + 1;
    let tables = (identity_tables + window_tables + 2) * 2 * PAGE_SIZE;
    bitmap + directory + tables
}

/// Bring the kernel up. Never returns; the tail of boot becomes the idle
/// context once the scheduler takes over.
pub fn run(magic: u32, info_addr: usize) -> ! {
    splash();
    logger::init(log::LevelFilter::Info);

    println!("checking boot environment");
    // SAFETY: the loader parked its information block at `info_addr` and it
    // stays untouched through boot.
    if let Err(err) = unsafe { boot::info::init_from_pointer(magic, info_addr) } {
        panic!("{}", err);
    }

    println!("initialising descriptor tables");
    // SAFETY: once, early, interrupts still disabled from the loader.
    unsafe {
        arch::x86::gdt::init();
    }
    interrupt::init();

    println!("initialising memory");
    // SAFETY: the linker symbol marks the first free byte past the image.
    let kernel_end = unsafe { &__kernel_end as *const u8 as usize };
    let (total_kib, memory_limit, modules_end) = BOOT_INFO
        .with(|info| {
            let modules_end = info
                .modules
                .iter()
                .map(|module| module.end)
                .max()
                .unwrap_or(0);
            (info.total_kib(), info.memory_limit(), modules_end)
        })
        .unwrap_or((0, 0, 0));
    if total_kib == 0 {
        panic!("{}", KernelError::MissingBootInfo);
    }
    // Static allocation starts past both the image and the boot modules.
    let bump_start = kernel_end.max(modules_end);
    if let Err(err) = mm::bump::init(bump_start, memory_limit) {
        panic!("{}", err);
    }

    let reserved = bump_start + paging_reservation(bump_start, total_kib);
    let heap_start = BOOT_INFO
        .with(|info| info.find_heap_region(reserved, HEAP_MAX_SIZE))
        .unwrap_or(Err(KernelError::MissingBootInfo))
        .unwrap_or_else(|err| panic!("{}", err));

    // SAFETY: single call, interrupts disabled, identity addressing still in
    // effect.
    if let Err(err) = unsafe { paging::init(total_kib, heap_start, HEAP_MAX_SIZE) } {
        panic!("{}", err);
    }

    println!("arming kernel heap");
    // SAFETY: the heap window was mapped by paging::init and belongs to the
    // heap alone.
    if let Err(err) =
        unsafe { mm::heap::init_kernel_heap(heap_start, HEAP_INITIAL_SIZE, HEAP_MAX_SIZE, HEAP_MIN_SIZE) }
    {
        panic!("{}", err);
    }

    println!("loading initial ramdisk");
    let module: Option<BootModule> = BOOT_INFO.with(|info| info.modules.first().cloned()).flatten();
    let module = match module {
        Some(module) if !module.is_empty() => module,
        _ => panic!("{}", KernelError::MissingBootModule),
    };
    // SAFETY: the module region lies below the heap window and is identity
    // mapped; nothing else claims it.
    if let Err(err) = unsafe { initrd::init(module.start, module.len()) } {
        panic!("{}", err);
    }

    println!("loading symbol table");
    let map = initrd::get_file_by_name(SYMBOL_MAP_PATH)
        .unwrap_or_else(|| panic!("{}", KernelError::MissingSymbolTable { path: SYMBOL_MAP_PATH }));
    let text = core::str::from_utf8(map.data)
        .unwrap_or_else(|_| panic!("{}", KernelError::BadSymbolTable { line: 0 }));
    if let Err(err) = ksyms::load(text) {
        panic!("{}", err);
    }

    println!("starting timer and scheduler");
    if let Err(err) = timer::init() {
        panic!("{}", err);
    }
    if let Err(err) = sched::init() {
        panic!("{}", err);
    }
    let kernel_directory = paging::current_directory_physical().unwrap_or(PhysicalAddress::new(0));
    if let Err(err) = sched::spawn(
        idle_main as usize,
        kernel_directory,
        0,
        0,
        DEFAULT_STACK_SIZE,
        ProcessFlags::SUPERVISOR,
    ) {
        panic!("{}", err);
    }

    println!("boot complete");
    arch::enable_interrupts();
    sched::process_yield()
}

/// Lowest-priority process: park the CPU until something becomes runnable.
fn idle_main() -> ! {
    loop {
        arch::wait_for_interrupt();
    }
}
