//! # Syscall Dispatch
//!
//! User programs raise `int 0x80` with a command id in `eax` and
//! arguments on their stack. The wrapper saves the trap frame, runs the
//! command table entry with the kernel address space installed, and
//! stores the result into the `eax` of the restored frame.
//!
//! Registration conflicts are programming errors and halt the kernel;
//! dispatch of an unknown id just returns 0.

pub mod io;
pub mod misc;

use spin::Mutex;

use crate::config::MAX_SYSCALL_COMMANDS;
use crate::interrupts::InterruptFrame;
use crate::mm::paging;
use crate::sched;

/// Reserved command ids.
pub mod command {
    pub const SUM: usize = 0;
    pub const PRINT: usize = 1;
    pub const GETKEY: usize = 2;
    pub const PUTCHAR: usize = 3;
}

/// A syscall implementation. The return value lands in the caller's
/// `eax`.
pub type SyscallCommand = fn(&mut InterruptFrame) -> u32;

static COMMANDS: Mutex<[Option<SyscallCommand>; MAX_SYSCALL_COMMANDS]> =
    Mutex::new([None; MAX_SYSCALL_COMMANDS]);

/// Registers a command. Overwriting a live entry or registering out of
/// range is fatal.
pub fn register_command(id: usize, command: SyscallCommand) {
    if id >= MAX_SYSCALL_COMMANDS {
        panic!("syscall command {} is out of range", id);
    }
    let mut commands = COMMANDS.lock();
    if commands[id].is_some() {
        panic!("syscall command {} is already registered", id);
    }
    commands[id] = Some(command);
}

/// Runs a command. Unset or out-of-range ids return 0.
pub fn handle_command(id: usize, frame: &mut InterruptFrame) -> u32 {
    if id >= MAX_SYSCALL_COMMANDS {
        return 0;
    }
    let command = COMMANDS.lock()[id];
    match command {
        Some(command) => command(frame),
        None => 0,
    }
}

/// The `int 0x80` handler body, entered from the arch wrapper after
/// the frame is built.
pub fn isr80h_handler(id: usize, frame: &mut InterruptFrame) -> u32 {
    paging::kernel_page();
    sched::save_current_state(frame);

    let result = handle_command(id, frame);
    if let Some(task) = sched::current_task() {
        sched::with_task_mut(task, |t| t.registers.eax = result);
    }

    sched::task_page();
    result
}

/// Registers the kernel's built-in commands. Called once at boot.
pub fn register_all() {
    register_command(command::SUM, misc::sum);
    register_command(command::PRINT, io::print);
    register_command(command::GETKEY, io::getkey);
    register_command(command::PUTCHAR, io::putchar);
    log::info!("syscall commands registered");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame() -> InterruptFrame {
        InterruptFrame {
            edi: 0,
            esi: 0,
            ebp: 0,
            reserved: 0,
            ebx: 0,
            edx: 0,
            ecx: 0,
            eax: 0,
            ip: 0,
            cs: 0,
            flags: 0,
            esp: 0,
            ss: 0,
        }
    }

    fn double_ebx(frame: &mut InterruptFrame) -> u32 {
        frame.ebx * 2
    }

    #[test]
    fn test_dispatch_runs_registered_command() {
        register_command(900, double_ebx);
        let mut frame = frame();
        frame.ebx = 21;
        assert_eq!(handle_command(900, &mut frame), 42);
    }

    #[test]
    fn test_unset_and_out_of_range_ids_return_zero() {
        let mut f = frame();
        assert_eq!(handle_command(901, &mut f), 0);
        assert_eq!(handle_command(MAX_SYSCALL_COMMANDS, &mut f), 0);
        assert_eq!(handle_command(MAX_SYSCALL_COMMANDS + 5, &mut f), 0);
    }

    #[test]
    #[should_panic(expected = "already registered")]
    fn test_double_registration_panics() {
        register_command(902, double_ebx);
        register_command(902, double_ebx);
    }

    #[test]
    #[should_panic(expected = "out of range")]
    fn test_out_of_range_registration_panics() {
        register_command(MAX_SYSCALL_COMMANDS, double_ebx);
    }
}
