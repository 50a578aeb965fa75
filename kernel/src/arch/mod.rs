//! # Architecture Layer
//!
//! Everything that touches raw hardware lives behind this module: port
//! I/O, CR3 loads, the IDT, segment register reloads, and the `iret` into
//! user mode. The `x86` backend is the real machine; the `hosted` backend
//! provides inert shims so the rest of the kernel builds and its logic
//! runs under `cargo test` on a development host.

#[cfg(target_arch = "x86")]
pub mod x86;

#[cfg(not(target_arch = "x86"))]
pub mod hosted;

#[cfg(target_arch = "x86")]
pub use x86::{
    console_put_char, disable_interrupts, enable_interrupts, enable_paging, halt, idt_init, inb,
    insw, interrupts_enabled, kernel_registers, load_page_directory, outb, serial_write_fmt,
    task_return, user_registers,
};

#[cfg(not(target_arch = "x86"))]
pub use hosted::{
    console_put_char, disable_interrupts, enable_interrupts, enable_paging, halt, idt_init, inb,
    insw, interrupts_enabled, kernel_registers, load_page_directory, outb, serial_write_fmt,
    task_return, user_registers,
};

/// Runs a closure with interrupts disabled, restoring the previous state.
pub fn without_interrupts<F, R>(f: F) -> R
where
    F: FnOnce() -> R,
{
    let was_enabled = interrupts_enabled();
    disable_interrupts();
    let result = f();
    if was_enabled {
        enable_interrupts();
    }
    result
}

/// Writes a string to the console, byte by byte.
pub fn console_write_str(s: &str) {
    for byte in s.bytes() {
        console_put_char(byte);
    }
}

/// Architecture-specific early init (console, serial).
pub fn init() {
    #[cfg(target_arch = "x86")]
    x86::init();

    #[cfg(not(target_arch = "x86"))]
    hosted::init();
}
