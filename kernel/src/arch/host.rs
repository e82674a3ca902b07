//! Host stand-in for the x86 backend.
//!
//! The unit and integration tests build the kernel library for the host
//! target, where there is no CPU state to poke. This module models the
//! pieces of machine state the core mutates -- interrupt flag, CR0, CR2,
//! CR3, PIC acknowledgements, PIT programming -- per thread, so every test
//! thread behaves like its own single CPU and tests cannot interfere with
//! each other. The functions mirror the real backend's signatures exactly.

use core::cell::Cell;

use crate::interrupt::InterruptFrame;

std::thread_local! {
    static INTERRUPT_FLAG: Cell<bool> = const { Cell::new(true) };
    static CR0: Cell<usize> = const { Cell::new(0) };
    static CR2: Cell<usize> = const { Cell::new(0) };
    static CR3: Cell<usize> = const { Cell::new(0) };
    static IDT_BASE: Cell<usize> = const { Cell::new(0) };
    static PIT_DIVISOR: Cell<u32> = const { Cell::new(0) };
    static EOI_MASTER: Cell<u32> = const { Cell::new(0) };
    static EOI_SLAVE: Cell<u32> = const { Cell::new(0) };
}

pub fn interrupts_enabled() -> bool {
    INTERRUPT_FLAG.with(Cell::get)
}

pub fn enable_interrupts() {
    INTERRUPT_FLAG.with(|flag| flag.set(true));
}

pub fn disable_interrupts() {
    INTERRUPT_FLAG.with(|flag| flag.set(false));
}

pub fn halt() -> ! {
    panic!("halt() reached on the host target");
}

pub fn wait_for_interrupt() {
    core::hint::spin_loop();
}

pub fn read_cr0() -> usize {
    CR0.with(Cell::get)
}

/// # Safety
///
/// Matches the bare-metal signature; on the host this only updates the
/// model.
pub unsafe fn write_cr0(value: usize) {
    CR0.with(|register| register.set(value));
}

pub fn read_cr2() -> usize {
    CR2.with(Cell::get)
}

pub fn read_cr3() -> usize {
    CR3.with(Cell::get)
}

/// # Safety
///
/// Matches the bare-metal signature; on the host this only updates the
/// model.
pub unsafe fn write_cr3(value: usize) {
    CR3.with(|register| register.set(value));
}

pub fn read_frame_pointer() -> usize {
    0
}

/// # Safety
///
/// Matches the bare-metal signature; on the host this only records the
/// base.
pub unsafe fn load_idt(base: usize, _limit: u16) {
    IDT_BASE.with(|register| register.set(base));
}

/// Synthetic address of the exception stub for `vector`.
pub fn exception_stub(vector: u8) -> usize {
    0x0010_0000 + (vector as usize) * 16
}

/// Synthetic address of the hardware-interrupt stub for `line`.
pub fn irq_stub(line: u8) -> usize {
    0x0011_0000 + (line as usize) * 16
}

/// # Safety
///
/// Matches the bare-metal signature; remapping is a no-op on the host.
pub unsafe fn pic_remap() {}

pub fn pic_eoi_master() {
    EOI_MASTER.with(|count| count.set(count.get() + 1));
}

pub fn pic_eoi_slave() {
    EOI_SLAVE.with(|count| count.set(count.get() + 1));
}

/// # Safety
///
/// Matches the bare-metal signature; on the host this only records the
/// value.
pub unsafe fn program_interval_timer(divisor: u16) {
    PIT_DIVISOR.with(|register| register.set(divisor as u32));
}

pub fn set_state_and_jump(_frame: &InterruptFrame) -> ! {
    panic!("context resume is only possible on bare metal");
}

pub fn capture_state() -> InterruptFrame {
    let mut frame = InterruptFrame::zeroed();
    frame.cr0 = read_cr0() as u32;
    frame.cr2 = read_cr2() as u32;
    frame.cr3 = read_cr3() as u32;
    frame
}

// ---------------------------------------------------------------------------
// Test-only inspection hooks
// ---------------------------------------------------------------------------

/// Plant a faulting address for the page-fault handler to read.
pub fn set_cr2_for_test(addr: usize) {
    CR2.with(|register| register.set(addr));
}

/// Last divisor written to the interval timer on this thread.
pub fn interval_timer_divisor() -> u32 {
    PIT_DIVISOR.with(Cell::get)
}

/// Base address most recently handed to `load_idt` on this thread.
pub fn loaded_idt_base() -> usize {
    IDT_BASE.with(Cell::get)
}

/// End-of-interrupt counts sent to the (master, slave) controllers on this
/// thread.
pub fn eoi_counts() -> (u32, u32) {
    (EOI_MASTER.with(Cell::get), EOI_SLAVE.with(Cell::get))
}
