//! # x86 (32-bit protected mode) Backend
//!
//! The real-hardware implementations of the architecture hooks.

pub mod idt;
pub mod paging;
pub mod port;
pub mod serial;
pub mod task;
pub mod vga;

use core::arch::asm;

pub use idt::idt_init;
pub use paging::{enable_paging, load_page_directory};
pub use port::{inb, insw, outb};
pub use task::{kernel_registers, task_return, user_registers};
pub use vga::console_put_char;

/// Initializes the console and the serial port.
pub fn init() {
    serial::init();
    vga::init();
}

/// Halts the CPU until the next interrupt.
#[inline(always)]
pub fn halt() {
    unsafe {
        asm!("hlt", options(nomem, nostack));
    }
}

/// Enables interrupts.
#[inline(always)]
pub fn enable_interrupts() {
    unsafe {
        asm!("sti", options(nomem, nostack));
    }
}

/// Disables interrupts.
#[inline(always)]
pub fn disable_interrupts() {
    unsafe {
        asm!("cli", options(nomem, nostack));
    }
}

/// Checks the IF bit in EFLAGS.
#[inline(always)]
pub fn interrupts_enabled() -> bool {
    let flags: u32;
    unsafe {
        asm!("pushfd; pop {}", out(reg) flags, options(nomem));
    }
    (flags & 0x200) != 0
}

/// Writes formatted output to the serial port.
pub fn serial_write_fmt(args: core::fmt::Arguments) {
    use core::fmt::Write;
    let mut serial = serial::SERIAL.lock();
    let _ = serial.write_fmt(args);
}
