//! # I/O Syscalls
//!
//! `print`, `getkey` and `putchar`. User pointers are never touched
//! with the kernel directory live; string arguments come across via
//! the scratch-page copy in `sched`.

use crate::arch;
use crate::interrupts::InterruptFrame;
use crate::sched;

/// Longest string `print` will copy out of a user program.
const PRINT_BUFFER_SIZE: usize = 1024;

/// Command 1: prints a nul-terminated user string to the console.
pub fn print(_frame: &mut InterruptFrame) -> u32 {
    let Some(task) = sched::current_task() else {
        return 0;
    };

    let user_ptr = match unsafe { sched::task_get_stack_item(task, 0) } {
        Ok(ptr) => ptr,
        Err(_) => return 0,
    };

    let mut message = [0u8; PRINT_BUFFER_SIZE];
    if unsafe { sched::copy_string_from_task(task, user_ptr, &mut message) }.is_err() {
        return 0;
    }

    for &byte in message.iter() {
        if byte == 0 {
            break;
        }
        arch::console_put_char(byte);
    }
    0
}

/// Command 2: pops one byte from the caller's keyboard ring.
pub fn getkey(_frame: &mut InterruptFrame) -> u32 {
    crate::keyboard::pop() as u32
}

/// Command 3: writes one character to the console.
pub fn putchar(_frame: &mut InterruptFrame) -> u32 {
    let Some(task) = sched::current_task() else {
        return 0;
    };
    let chr = match unsafe { sched::task_get_stack_item(task, 0) } {
        Ok(chr) => chr,
        Err(_) => return 0,
    };
    arch::console_put_char(chr as u8);
    chr
}
