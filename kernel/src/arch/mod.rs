//! Architecture facade.
//!
//! Every instruction the kernel core needs from the CPU is funnelled through
//! the functions re-exported here: interrupt flag control, control registers,
//! IDT loading, PIC/PIT port programming, and the context-resume primitive.
//! On the bare-metal i686 target the [`x86`] backend supplies the real inline
//! assembly. On every other target the [`host`] backend models the same state
//! in memory so the logic core can run under the standard test harness.

#[cfg(all(target_arch = "x86", target_os = "none"))]
pub mod x86;
#[cfg(all(target_arch = "x86", target_os = "none"))]
pub use x86::{
    capture_state, disable_interrupts, enable_interrupts, exception_stub, halt, interrupts_enabled,
    irq_stub, load_idt, pic_eoi_master, pic_eoi_slave, pic_remap, program_interval_timer,
    read_cr0, read_cr2, read_cr3, read_frame_pointer, set_state_and_jump, wait_for_interrupt,
    write_cr0, write_cr3,
};

#[cfg(not(all(target_arch = "x86", target_os = "none")))]
pub mod host;
#[cfg(not(all(target_arch = "x86", target_os = "none")))]
pub use host::{
    capture_state, disable_interrupts, enable_interrupts, exception_stub, halt, interrupts_enabled,
    irq_stub, load_idt, pic_eoi_master, pic_eoi_slave, pic_remap, program_interval_timer,
    read_cr0, read_cr2, read_cr3, read_frame_pointer, set_state_and_jump, wait_for_interrupt,
    write_cr0, write_cr3,
};

/// CR0 bit that turns paging on.
pub const CR0_PAGING: usize = 1 << 31;
