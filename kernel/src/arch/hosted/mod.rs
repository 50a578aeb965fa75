//! # Hosted Backend
//!
//! Inert stand-ins for the hardware hooks, used when the kernel is built
//! for anything other than 32-bit x86. Port I/O and segment reloads do
//! nothing, CR3 loads are recorded, and console output is captured so
//! host-side tests can observe it.

use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use spin::Mutex;

static INTERRUPTS_ENABLED: AtomicBool = AtomicBool::new(true);
static PAGING_ENABLED: AtomicBool = AtomicBool::new(false);
static LOADED_DIRECTORY: AtomicU32 = AtomicU32::new(0);

const CONSOLE_CAPTURE: usize = 4096;

struct ConsoleBuffer {
    bytes: [u8; CONSOLE_CAPTURE],
    len: usize,
}

static CONSOLE: Mutex<ConsoleBuffer> = Mutex::new(ConsoleBuffer {
    bytes: [0; CONSOLE_CAPTURE],
    len: 0,
});

pub fn init() {}

/// Spins; there is no interrupt to wait for on the host.
pub fn halt() {
    core::hint::spin_loop();
}

pub fn enable_interrupts() {
    INTERRUPTS_ENABLED.store(true, Ordering::SeqCst);
}

pub fn disable_interrupts() {
    INTERRUPTS_ENABLED.store(false, Ordering::SeqCst);
}

pub fn interrupts_enabled() -> bool {
    INTERRUPTS_ENABLED.load(Ordering::SeqCst)
}

/// Records the directory that would have been loaded into CR3.
pub fn load_page_directory(directory_phys: u32) {
    LOADED_DIRECTORY.store(directory_phys, Ordering::SeqCst);
}

/// Returns the most recently "loaded" page directory.
pub fn loaded_page_directory() -> u32 {
    LOADED_DIRECTORY.load(Ordering::SeqCst)
}

pub fn enable_paging() {
    PAGING_ENABLED.store(true, Ordering::SeqCst);
}

pub fn user_registers() {}

pub fn kernel_registers() {}

pub fn task_return(_regs: &crate::sched::Registers) -> ! {
    panic!("cannot enter user mode on a hosted build");
}

pub fn idt_init() {}

pub fn outb(_port: u16, _value: u8) {}

pub fn inb(_port: u16) -> u8 {
    0
}

pub fn insw(_port: u16) -> u16 {
    0
}

pub fn console_put_char(chr: u8) {
    let mut console = CONSOLE.lock();
    if console.len < CONSOLE_CAPTURE {
        let at = console.len;
        console.bytes[at] = chr;
        console.len += 1;
    }
}

/// Drains the captured console output.
pub fn console_take() -> alloc::vec::Vec<u8> {
    let mut console = CONSOLE.lock();
    let out = console.bytes[..console.len].to_vec();
    console.len = 0;
    out
}

pub fn serial_write_fmt(_args: core::fmt::Arguments) {}
