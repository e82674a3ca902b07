//! Assembly entry stubs for exceptions, hardware interrupts and context
//! resume.
//!
//! Every stub pushes the uniform [`InterruptFrame`] layout before entering
//! Rust: the CPU supplies SS/ESP (privilege change only), EFLAGS, CS, EIP and
//! an error code on the vectors that have one; the stub pushes a dummy error
//! code otherwise, then the vector number, `pusha`, the data segments and
//! CR0/CR2/CR3/CR4. The field offsets in [`InterruptFrame`] are therefore
//! load-bearing; `interrupt::frame` asserts them.
//!
//! [`InterruptFrame`]: crate::interrupt::InterruptFrame

use core::arch::global_asm;

use crate::interrupt::InterruptFrame;

// Common dispatch paths. Segment reload uses the kernel data selector so the
// Rust handlers run with flat kernel segments regardless of what was
// interrupted.
global_asm!(
    r#"
.section .text

.global isr_common_stub
isr_common_stub:
    pusha
    push ds
    push es
    push fs
    push gs
    mov eax, cr0
    push eax
    mov eax, cr2
    push eax
    mov eax, cr3
    push eax
    mov eax, cr4
    push eax
    mov ax, 0x10
    mov ds, ax
    mov es, ax
    mov fs, ax
    mov gs, ax
    mov eax, esp
    push eax
    cld
    call isr_dispatch
    add esp, 20
    pop gs
    pop fs
    pop es
    pop ds
    popa
    add esp, 8
    iretd

.global irq_common_stub
irq_common_stub:
    pusha
    push ds
    push es
    push fs
    push gs
    mov eax, cr0
    push eax
    mov eax, cr2
    push eax
    mov eax, cr3
    push eax
    mov eax, cr4
    push eax
    mov ax, 0x10
    mov ds, ax
    mov es, ax
    mov fs, ax
    mov gs, ax
    mov eax, esp
    push eax
    cld
    call irq_dispatch
    add esp, 20
    pop gs
    pop fs
    pop es
    pop ds
    popa
    add esp, 8
    iretd
"#
);

// Exception stubs. Vectors 8, 10-14, 17 and 30 get a CPU-pushed error code;
// the rest push a dummy zero so the frame layout stays uniform.
macro_rules! exception_stub_noerr {
    ($($name:ident = $vector:literal),+ $(,)?) => {
        global_asm!($(concat!(
            ".global ", stringify!($name), "\n",
            stringify!($name), ":\n",
            "    push 0\n",
            "    push ", $vector, "\n",
            "    jmp isr_common_stub\n",
        )),+);
    };
}

macro_rules! exception_stub_err {
    ($($name:ident = $vector:literal),+ $(,)?) => {
        global_asm!($(concat!(
            ".global ", stringify!($name), "\n",
            stringify!($name), ":\n",
            "    push ", $vector, "\n",
            "    jmp isr_common_stub\n",
        )),+);
    };
}

macro_rules! irq_line_stub {
    ($($name:ident = $vector:literal),+ $(,)?) => {
        global_asm!($(concat!(
            ".global ", stringify!($name), "\n",
            stringify!($name), ":\n",
            "    push 0\n",
            "    push ", $vector, "\n",
            "    jmp irq_common_stub\n",
        )),+);
    };
}

exception_stub_noerr!(
    isr0 = 0,
    isr1 = 1,
    isr2 = 2,
    isr3 = 3,
    isr4 = 4,
    isr5 = 5,
    isr6 = 6,
    isr7 = 7,
    isr9 = 9,
    isr15 = 15,
    isr16 = 16,
    isr18 = 18,
    isr19 = 19,
    isr20 = 20,
    isr21 = 21,
    isr22 = 22,
    isr23 = 23,
    isr24 = 24,
    isr25 = 25,
    isr26 = 26,
    isr27 = 27,
    isr28 = 28,
    isr29 = 29,
    isr31 = 31,
);

exception_stub_err!(
    isr8 = 8,
    isr10 = 10,
    isr11 = 11,
    isr12 = 12,
    isr13 = 13,
    isr14 = 14,
    isr17 = 17,
    isr30 = 30,
);

irq_line_stub!(
    irq0 = 32,
    irq1 = 33,
    irq2 = 34,
    irq3 = 35,
    irq4 = 36,
    irq5 = 37,
    irq6 = 38,
    irq7 = 39,
    irq8 = 40,
    irq9 = 41,
    irq10 = 42,
    irq11 = 43,
    irq12 = 44,
    irq13 = 45,
    irq14 = 46,
    irq15 = 47,
);

// Context resume. The frame pointer arrives cdecl at [esp + 4]; segment
// registers are loaded first (flat model, so the following reads still
// resolve), then the iret frame is built on the target stack. A ring-3
// target needs the five-word form with SS:ESP; a ring-0 target continues on
// the saved stack directly.
global_asm!(
    r#"
.global frame_restore_jump
frame_restore_jump:
    mov ebx, [esp + 4]
    mov eax, [ebx + 28]
    mov ds, ax
    mov eax, [ebx + 24]
    mov es, ax
    mov eax, [ebx + 20]
    mov fs, ax
    mov eax, [ebx + 16]
    mov gs, ax
    test dword ptr [ebx + 76], 3
    jz 2f
    push dword ptr [ebx + 88]
    push dword ptr [ebx + 84]
    jmp 3f
2:
    mov esp, [ebx + 84]
3:
    push dword ptr [ebx + 80]
    push dword ptr [ebx + 76]
    push dword ptr [ebx + 72]
    mov eax, [ebx + 60]
    mov ecx, [ebx + 56]
    mov edx, [ebx + 52]
    mov ebp, [ebx + 40]
    mov esi, [ebx + 36]
    mov edi, [ebx + 32]
    mov ebx, [ebx + 48]
    iretd
"#
);

extern "C" {
    fn isr0();
    fn isr1();
    fn isr2();
    fn isr3();
    fn isr4();
    fn isr5();
    fn isr6();
    fn isr7();
    fn isr8();
    fn isr9();
    fn isr10();
    fn isr11();
    fn isr12();
    fn isr13();
    fn isr14();
    fn isr15();
    fn isr16();
    fn isr17();
    fn isr18();
    fn isr19();
    fn isr20();
    fn isr21();
    fn isr22();
    fn isr23();
    fn isr24();
    fn isr25();
    fn isr26();
    fn isr27();
    fn isr28();
    fn isr29();
    fn isr30();
    fn isr31();
    fn irq0();
    fn irq1();
    fn irq2();
    fn irq3();
    fn irq4();
    fn irq5();
    fn irq6();
    fn irq7();
    fn irq8();
    fn irq9();
    fn irq10();
    fn irq11();
    fn irq12();
    fn irq13();
    fn irq14();
    fn irq15();
    fn frame_restore_jump(frame: *const InterruptFrame) -> !;
}

/// Entry addresses of the 32 exception stubs, indexed by vector.
pub static EXCEPTION_STUBS: [unsafe extern "C" fn(); 32] = [
    isr0, isr1, isr2, isr3, isr4, isr5, isr6, isr7, isr8, isr9, isr10, isr11, isr12, isr13, isr14,
    isr15, isr16, isr17, isr18, isr19, isr20, isr21, isr22, isr23, isr24, isr25, isr26, isr27,
    isr28, isr29, isr30, isr31,
];

/// Entry addresses of the 16 hardware-interrupt stubs, indexed by IRQ line.
pub static IRQ_STUBS: [unsafe extern "C" fn(); 16] = [
    irq0, irq1, irq2, irq3, irq4, irq5, irq6, irq7, irq8, irq9, irq10, irq11, irq12, irq13, irq14,
    irq15,
];

/// Load `frame` into the CPU and resume it with `iretd`. Does not return.
pub fn set_state_and_jump(frame: &InterruptFrame) -> ! {
    // SAFETY: the scheduler only passes frames it constructed in `spawn` or
    // captured from an interrupt, with selectors from the live GDT and an
    // instruction pointer inside mapped kernel text; interrupts are disabled
    // on this path (interrupt gate or explicit guard).
    unsafe { frame_restore_jump(frame) }
}
