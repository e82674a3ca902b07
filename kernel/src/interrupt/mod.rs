//! Interrupt dispatch core.
//!
//! Owns the IDT, the per-vector handler registry, and the demultiplexing of
//! CPU exceptions (vectors 0..32) versus hardware interrupts (32..48). The
//! assembly stubs land in [`isr_dispatch`]/[`irq_dispatch`]; everything after
//! that point is ordinary Rust running with interrupts disabled (interrupt
//! gates clear IF on entry).

pub mod frame;
pub mod idt;

pub use frame::InterruptFrame;

use spin::Mutex;

use crate::arch;

/// Vector of the page-fault exception.
pub const ISR_PAGE_FAULT: u8 = 14;

/// First vector the remapped master PIC delivers.
pub const IRQ_BASE: u8 = 32;

/// Timer interrupt vector (IRQ 0).
pub const IRQ_TIMER: u8 = IRQ_BASE;

/// A registered high-level handler for one vector.
pub type InterruptHandler = fn(&mut InterruptFrame);

static HANDLERS: Mutex<[Option<InterruptHandler>; 256]> = Mutex::new([None; 256]);

/// How a vector in the exception range behaves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExceptionClass {
    Abort,
    Fault,
    Interrupt,
    Reserved,
    Trap,
}

/// Static description of one exception vector.
#[derive(Debug, Clone, Copy)]
pub struct ExceptionInfo {
    pub class: ExceptionClass,
    pub has_error_code: bool,
    pub name: &'static str,
}

/// Descriptor table for vectors 0..32.
pub static EXCEPTIONS: [ExceptionInfo; 32] = {
    use ExceptionClass::*;
    macro_rules! exc {
        ($class:expr, $err:expr, $name:expr) => {
            ExceptionInfo {
                class: $class,
                has_error_code: $err,
                name: $name,
            }
        };
    }
    [
        exc!(Fault, false, "divide-by-zero"),
        exc!(Fault, false, "debug"),
        exc!(Interrupt, false, "non-maskable interrupt"),
        exc!(Trap, false, "breakpoint"),
        exc!(Trap, false, "overflow"),
        exc!(Fault, false, "bound-range exceeded"),
        exc!(Fault, false, "invalid opcode"),
        exc!(Fault, false, "device not available"),
        exc!(Abort, true, "double fault"),
        exc!(Fault, false, "coprocessor segment overrun"),
        exc!(Fault, true, "invalid TSS"),
        exc!(Fault, true, "segment not present"),
        exc!(Fault, true, "stack-segment fault"),
        exc!(Fault, true, "general protection fault"),
        exc!(Fault, true, "page fault"),
        exc!(Reserved, false, ""),
        exc!(Fault, false, "floating-point exception"),
        exc!(Fault, true, "alignment check"),
        exc!(Abort, false, "machine check"),
        exc!(Fault, false, "SIMD floating-point exception"),
        exc!(Fault, false, "virtualization exception"),
        exc!(Reserved, false, ""),
        exc!(Reserved, false, ""),
        exc!(Reserved, false, ""),
        exc!(Reserved, false, ""),
        exc!(Reserved, false, ""),
        exc!(Reserved, false, ""),
        exc!(Reserved, false, ""),
        exc!(Reserved, false, ""),
        exc!(Reserved, false, ""),
        exc!(Fault, true, "security exception"),
        exc!(Reserved, false, ""),
    ]
};

/// Install the IDT and remap the interrupt controllers.
///
/// Interrupts stay disabled; the boot path enables them only after the timer
/// and scheduler are ready.
pub fn init() {
    let _guard = InterruptGuard::with(InterruptState::Disable);
    idt::init();
    // SAFETY: runs once during boot with interrupts disabled and the IRQ
    // gates already installed by `idt::init` above.
    unsafe {
        arch::pic_remap();
    }
    log::info!("IDT loaded, PIC remapped to vectors 32..48");
}

/// Register the high-level handler for vector `n`, replacing any previous
/// registration.
pub fn set_interrupt_handler(n: u8, handler: InterruptHandler) {
    let _guard = InterruptGuard::with(InterruptState::Disable);
    HANDLERS.lock()[n as usize] = Some(handler);
}

/// Drop the handler for vector `n`.
pub fn clear_interrupt_handler(n: u8) {
    let _guard = InterruptGuard::with(InterruptState::Disable);
    HANDLERS.lock()[n as usize] = None;
}

fn registered_handler(n: u32) -> Option<InterruptHandler> {
    // Copy the pointer out so no lock is held while the handler runs: the
    // timer handler never returns when it switches process.
    HANDLERS.lock().get(n as usize).copied().flatten()
}

/// Exception path: a registered handler is authoritative (the page fault
/// handler is the canonical case); anything else is fatal.
pub fn handle_exception(frame: &mut InterruptFrame) {
    if frame.int_no >= 32 {
        // Stray vector routed through the exception stub table; treat it
        // like a spurious interrupt.
        if let Some(handler) = registered_handler(frame.int_no) {
            handler(frame);
        } else {
            log::debug!("no handler for interrupt {:#04X}", frame.int_no);
        }
        return;
    }
    if let Some(handler) = registered_handler(frame.int_no) {
        handler(frame);
        return;
    }
    let info = &EXCEPTIONS[frame.int_no as usize];
    let ext = frame.err_code & 0x1;
    let idt_bit = (frame.err_code >> 1) & 0x1;
    let ti = (frame.err_code >> 2) & 0x1;
    if info.has_error_code {
        panic!(
            "unhandled exception {:#04X} ({}) at {:#010X}: error code {:#010X} <EXT={},IDT={},TI={}>",
            frame.int_no, info.name, frame.eip, frame.err_code, ext, idt_bit, ti
        );
    }
    panic!(
        "unhandled exception {:#04X} ({}) at {:#010X}",
        frame.int_no, info.name, frame.eip
    );
}

/// Hardware-interrupt path: acknowledge the controller(s), then dispatch.
/// A line with no registered handler is logged and dropped.
pub fn handle_irq(frame: &mut InterruptFrame) {
    if frame.int_no >= 40 {
        arch::pic_eoi_slave();
    }
    arch::pic_eoi_master();
    if let Some(handler) = registered_handler(frame.int_no) {
        handler(frame);
    } else {
        log::debug!("no handler for interrupt {:#04X}", frame.int_no);
    }
}

/// Entry point for exception stubs.
///
/// # Safety
///
/// Only the assembly stubs call this, with `frame` pointing at the frame they
/// just pushed.
#[no_mangle]
pub unsafe extern "C" fn isr_dispatch(frame: *mut InterruptFrame) {
    // SAFETY: the stub contract above guarantees a valid, exclusive frame.
    handle_exception(unsafe { &mut *frame });
}

/// Entry point for hardware-interrupt stubs.
///
/// # Safety
///
/// Only the assembly stubs call this, with `frame` pointing at the frame they
/// just pushed.
#[no_mangle]
pub unsafe extern "C" fn irq_dispatch(frame: *mut InterruptFrame) {
    // SAFETY: the stub contract above guarantees a valid, exclusive frame.
    handle_irq(unsafe { &mut *frame });
}

// ---------------------------------------------------------------------------
// Interrupt-state guard
// ---------------------------------------------------------------------------

/// Requested interrupt-enable state for a guarded scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterruptState {
    Enable,
    Disable,
}

/// Scoped interrupt-flag override.
///
/// Construction records the current flag and forces the requested state;
/// drop restores the recorded state on every exit path. Every mutating
/// operation on shared kernel state runs under one of these.
#[must_use = "the guard restores the interrupt flag when dropped"]
pub struct InterruptGuard {
    was_enabled: bool,
}

impl InterruptGuard {
    pub fn with(state: InterruptState) -> Self {
        let was_enabled = arch::interrupts_enabled();
        match state {
            InterruptState::Enable => arch::enable_interrupts(),
            InterruptState::Disable => arch::disable_interrupts(),
        }
        Self { was_enabled }
    }

    /// Shorthand for the overwhelmingly common case.
    pub fn disable() -> Self {
        Self::with(InterruptState::Disable)
    }
}

impl Drop for InterruptGuard {
    fn drop(&mut self) {
        if self.was_enabled {
            arch::enable_interrupts();
        } else {
            arch::disable_interrupts();
        }
    }
}
