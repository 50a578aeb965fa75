//! # V-CORE: The Vanadium Kernel
//!
//! A small protected-mode kernel for 32-bit x86. The core is five
//! cooperating engines:
//!
//! 1. **Heap** (`mm::heap`): block-granularity first-fit allocator over
//!    a fixed 100 MiB physical region
//! 2. **Paging** (`mm::paging`): per-task 4 GiB address spaces,
//!    identity mapped by default
//! 3. **Filesystem** (`disk`, `fs`): read-only FAT16 behind a pluggable
//!    driver registry and a descriptor table
//! 4. **Loader** (`process::elf`): ELF32 validation and staging
//! 5. **Scheduler** (`sched`, `process`, `interrupts`, `syscall`):
//!    preemptive round-robin of user tasks driven by the timer tick,
//!    with `int 0x80` as the request gate
//!
//! ## Privilege model
//!
//! The kernel itself is never preempted. User mode is entered through
//! `iret` and exited through interrupts; every ISR installs the kernel
//! page directory before touching kernel state and restores the task's
//! directory before returning. Exceptions terminate the offending
//! process and the scheduler moves on.
//!
//! ## Hardware boundary
//!
//! The bootloader, GDT/TSS setup and the low-level entry stubs are
//! external; they land in `kernel_main` with protected mode on and
//! segments flat. Everything that touches raw hardware afterwards goes
//! through `arch`, which also provides a hosted backend so the logic
//! runs under `cargo test`.

#![no_std]
#![deny(unsafe_op_in_unsafe_fn)]

extern crate alloc;

pub mod arch;
pub mod config;
pub mod disk;
pub mod fs;
pub mod interrupts;
pub mod keyboard;
pub mod logger;
pub mod mm;
pub mod process;
pub mod sched;
pub mod status;
pub mod syscall;

/// Kernel version information.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const NAME: &str = "V-CORE";

/// Serializes tests that touch the process-wide singletons.
#[cfg(test)]
pub(crate) mod test_sync {
    pub static LOCK: spin::Mutex<()> = spin::Mutex::new(());
}

/// Kernel entry point.
///
/// Called by the boot shim with the GDT and TSS installed and
/// interrupts masked. Wires the subsystems in dependency order, loads
/// the initial program and drops to user mode; from then on the system
/// is interrupt driven.
#[no_mangle]
pub extern "C" fn kernel_main() -> ! {
    arch::init();
    logger::init();
    log::info!("{} v{} booting", NAME, VERSION);

    mm::kheap_init();
    fs::init();
    disk::search_and_init();
    interrupts::init();
    mm::paging::init_kernel_chunk();
    syscall::register_all();
    keyboard::init();

    let process = match process::load_switch("0:/init.elf") {
        Ok(process) => process,
        Err(err) => panic!("unable to load the initial process: {}", err),
    };
    if let Err(err) = process::inject_arguments(process, &["init"]) {
        log::warn!("argument injection failed: {}", err);
    }

    log::info!("entering user mode");
    sched::run_first_ever_task()
}

/// Panics are terminal: log what we know and halt.
#[cfg(not(test))]
#[panic_handler]
fn panic(info: &core::panic::PanicInfo) -> ! {
    arch::serial_write_fmt(format_args!("\n!!! KERNEL PANIC !!!\n{}\n", info));
    loop {
        arch::halt();
    }
}

// Memory intrinsics for the freestanding target; compiler_builtins
// expects them to exist.
#[cfg(target_arch = "x86")]
mod intrinsics {
    #[no_mangle]
    pub unsafe extern "C" fn memcpy(dest: *mut u8, src: *const u8, n: usize) -> *mut u8 {
        let mut i = 0;
        while i < n {
            unsafe { *dest.add(i) = *src.add(i) };
            i += 1;
        }
        dest
    }

    #[no_mangle]
    pub unsafe extern "C" fn memmove(dest: *mut u8, src: *const u8, n: usize) -> *mut u8 {
        if (src as usize) < dest as usize {
            let mut i = n;
            while i > 0 {
                i -= 1;
                unsafe { *dest.add(i) = *src.add(i) };
            }
        } else {
            let mut i = 0;
            while i < n {
                unsafe { *dest.add(i) = *src.add(i) };
                i += 1;
            }
        }
        dest
    }

    #[no_mangle]
    pub unsafe extern "C" fn memset(dest: *mut u8, c: i32, n: usize) -> *mut u8 {
        let mut i = 0;
        while i < n {
            unsafe { *dest.add(i) = c as u8 };
            i += 1;
        }
        dest
    }

    #[no_mangle]
    pub unsafe extern "C" fn memcmp(s1: *const u8, s2: *const u8, n: usize) -> i32 {
        let mut i = 0;
        while i < n {
            let a = unsafe { *s1.add(i) };
            let b = unsafe { *s2.add(i) };
            if a != b {
                return (a as i32) - (b as i32);
            }
            i += 1;
        }
        0
    }
}
