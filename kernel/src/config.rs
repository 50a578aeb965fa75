//! # Kernel Configuration
//!
//! Fixed constants for the Vanadium kernel: the physical memory map, GDT
//! selectors, and the sizes of the kernel's static tables. The boot shim
//! and linker script agree on these values.

/// Kernel code segment selector.
pub const KERNEL_CODE_SELECTOR: u16 = 0x08;

/// Kernel data segment selector.
pub const KERNEL_DATA_SELECTOR: u16 = 0x10;

/// User code segment selector (RPL 3).
pub const USER_CODE_SELECTOR: u16 = 0x1B;

/// User data segment selector (RPL 3).
pub const USER_DATA_SELECTOR: u16 = 0x23;

/// Number of interrupt vectors the kernel services.
pub const TOTAL_INTERRUPTS: usize = 512;

/// Kernel heap size (100 MiB).
pub const HEAP_SIZE_BYTES: usize = 100 * 1024 * 1024;

/// Heap allocation quantum.
pub const HEAP_BLOCK_SIZE: usize = 4096;

/// Physical address of the kernel heap data region.
pub const HEAP_ADDRESS: usize = 0x0100_0000;

/// Physical address of the heap block table (one byte per block).
pub const HEAP_TABLE_ADDRESS: usize = 0x0000_7E00;

/// Disk sector size in bytes.
pub const SECTOR_SIZE: usize = 512;

/// Maximum length of a path string, drive prefix included.
pub const MAX_PATH: usize = 108;

/// Maximum number of registered filesystem drivers.
pub const MAX_FILESYSTEMS: usize = 12;

/// Maximum number of open file descriptors (indices are 1-based).
pub const MAX_FILE_DESCRIPTORS: usize = 512;

/// Virtual address user program images are mapped at.
pub const PROGRAM_VIRTUAL_ADDRESS: u32 = 0x0040_0000;

/// Size of a user program stack (16 KiB).
pub const USER_PROGRAM_STACK_SIZE: usize = 16 * 1024;

/// Top of the user stack; the stack grows down from here.
pub const PROGRAM_VIRTUAL_STACK_ADDRESS_START: u32 = 0x003F_F000;

/// Bottom of the user stack region.
pub const PROGRAM_VIRTUAL_STACK_ADDRESS_END: u32 =
    PROGRAM_VIRTUAL_STACK_ADDRESS_START - USER_PROGRAM_STACK_SIZE as u32;

/// Maximum number of tracked allocations per process.
pub const MAX_PROGRAM_ALLOCATIONS: usize = 1024;

/// Maximum number of concurrently loaded processes.
pub const MAX_PROCESSES: usize = 12;

/// Number of slots in the syscall command table.
pub const MAX_SYSCALL_COMMANDS: usize = 1024;

/// Size of the per-process keyboard ring buffer.
pub const KEYBOARD_BUFFER_SIZE: usize = 1024;
