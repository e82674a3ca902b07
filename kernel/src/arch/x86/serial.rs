//! COM1 serial mirror for kernel output.
//!
//! Everything printed to the VGA console is mirrored here so a headless run
//! (QEMU `-serial stdio`) still shows boot and panic output.

use core::fmt;

use lazy_static::lazy_static;
use spin::Mutex;

use super::io::{inb, outb};

const COM1: u16 = 0x3F8;

pub struct SerialPort {
    base: u16,
}

impl SerialPort {
    /// # Safety
    ///
    /// `base` must be the I/O base of a 16550-compatible UART.
    pub const unsafe fn new(base: u16) -> Self {
        Self { base }
    }

    /// 38400 baud, 8N1, FIFOs on.
    pub fn init(&mut self) {
        // SAFETY: standard 16550 register programming relative to the base
        // port the constructor's contract guarantees.
        unsafe {
            outb(self.base + 1, 0x00); // disable interrupts
            outb(self.base + 3, 0x80); // DLAB on
            outb(self.base, 0x03); // divisor low: 38400 baud
            outb(self.base + 1, 0x00); // divisor high
            outb(self.base + 3, 0x03); // 8 bits, no parity, one stop
            outb(self.base + 2, 0xC7); // FIFO, 14-byte threshold
            outb(self.base + 4, 0x0B); // RTS/DSR, OUT2
        }
    }

    fn transmit_ready(&self) -> bool {
        // SAFETY: reading the line status register is side-effect free.
        unsafe { inb(self.base + 5) & 0x20 != 0 }
    }

    pub fn send(&mut self, byte: u8) {
        while !self.transmit_ready() {
            core::hint::spin_loop();
        }
        // SAFETY: transmitter holding register is empty per the status poll.
        unsafe {
            outb(self.base, byte);
        }
    }
}

impl fmt::Write for SerialPort {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        for byte in s.bytes() {
            if byte == b'\n' {
                self.send(b'\r');
            }
            self.send(byte);
        }
        Ok(())
    }
}

lazy_static! {
    pub static ref SERIAL1: Mutex<SerialPort> = {
        // SAFETY: 0x3F8 is COM1 on every PC-compatible this kernel targets.
        let mut port = unsafe { SerialPort::new(COM1) };
        port.init();
        Mutex::new(port)
    };
}
