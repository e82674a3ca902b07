//! Panic reporting: message, register dump, symbolised backtrace, halt.
//!
//! Nothing here unwinds; on bare metal the handler masks interrupts, prints
//! everything it can and parks the CPU.

use crate::interrupt::InterruptFrame;
use crate::ksyms;
use crate::println;

/// Most stack frames a backtrace will walk.
const BACKTRACE_DEPTH: usize = 24;

/// Print the captured register state in the classic four-per-row layout.
pub fn dump_registers(frame: &InterruptFrame) {
    println!(
        "  eax={:08X} ebx={:08X} ecx={:08X} edx={:08X}",
        frame.eax, frame.ebx, frame.ecx, frame.edx
    );
    println!(
        "  esi={:08X} edi={:08X} ebp={:08X} esp={:08X}",
        frame.esi, frame.edi, frame.ebp, frame.useresp
    );
    println!(
        "  eip={:08X} eflags={:08X} cs={:04X} ds={:04X} ss={:04X}",
        frame.eip, frame.eflags, frame.cs, frame.ds, frame.ss
    );
    println!(
        "  cr0={:08X} cr2={:08X} cr3={:08X} cr4={:08X}",
        frame.cr0, frame.cr2, frame.cr3, frame.cr4
    );
}

/// Print one backtrace line for a return address.
pub fn print_frame(depth: usize, address: usize) {
    match ksyms::resolve(address) {
        Some((name, offset)) => {
            println!("  #{:02} {:#010X} {}+{:#X}", depth, address, name, offset)
        }
        None => println!("  #{:02} {:#010X} ?", depth, address),
    }
}

/// Walk the EBP chain from `frame_pointer` and symbolise each return
/// address. Each frame is `[saved ebp][return address]`; the walk stops on
/// a null, misaligned or non-ascending pointer.
///
/// # Safety
///
/// `frame_pointer` must be a live frame pointer of the current stack; only
/// meaningful on bare metal where the chain is mapped.
pub unsafe fn backtrace_from(frame_pointer: usize) {
    println!("backtrace:");
    let mut ebp = frame_pointer;
    for depth in 0..BACKTRACE_DEPTH {
        if ebp == 0 || ebp % core::mem::align_of::<usize>() != 0 {
            break;
        }
        // SAFETY: caller guarantees the chain is walkable; the monotonicity
        // check below stops runaway chains.
        let (next, ret) = unsafe { (*(ebp as *const usize), *((ebp + 4) as *const usize)) };
        if ret == 0 {
            break;
        }
        print_frame(depth, ret);
        if next <= ebp {
            break;
        }
        ebp = next;
    }
}

/// Terminal panic path for the bare-metal target.
#[cfg(all(target_arch = "x86", target_os = "none"))]
pub fn handle_panic(info: &core::panic::PanicInfo) -> ! {
    use crate::arch;

    arch::disable_interrupts();
    println!("\n*** kernel panic ***");
    println!("{}", info);
    let state = arch::capture_state();
    println!("CPU state at panic:");
    dump_registers(&state);
    // SAFETY: we are on the kernel stack; the frame chain is identity
    // mapped.
    unsafe {
        backtrace_from(arch::read_frame_pointer());
    }
    arch::halt()
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;
    use crate::interrupt::InterruptFrame;

    #[test]
    fn test_dump_and_print_frame_do_not_panic() {
        let frame = InterruptFrame::zeroed();
        dump_registers(&frame);
        print_frame(0, 0x10_0000);
    }
}
