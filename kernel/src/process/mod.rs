//! # Process Management
//!
//! A process owns a program image, a 16 KiB user stack, a tracked
//! allocation table, a keyboard ring, and exactly one task. Processes
//! occupy fixed slots 0..11; `processes[id].id == id` always holds, and
//! the task points back at its owner by slot id only.
//!
//! Lifecycle is strictly nested: load data, allocate stack, create
//! task, map memory, register slot. Termination walks the same steps in
//! reverse.

pub mod elf;

use alloc::boxed::Box;
use alloc::string::{String, ToString};
use alloc::vec;

use spin::Mutex;

use crate::config::{
    MAX_PROCESSES, MAX_PROGRAM_ALLOCATIONS, PROGRAM_VIRTUAL_ADDRESS,
    PROGRAM_VIRTUAL_STACK_ADDRESS_END, USER_PROGRAM_STACK_SIZE,
};
use crate::fs;
use crate::keyboard::InputBuffer;
use crate::mm::paging::{self, PageFlags};
use crate::mm::{kfree, kzalloc, PageBuffer};
use crate::sched::{self, TaskId};
use crate::status::KernelError;

use elf::{ElfFile, PF_W, PT_LOAD};

/// Process identifier: the slot index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct ProcessId(pub usize);

/// The loaded program data.
pub enum ProcessImage {
    /// Flat binary mapped as-is at the program base.
    Binary(PageBuffer),
    /// Validated ELF image mapped per PT_LOAD segment.
    Elf(ElfFile),
}

/// One tracked user allocation. `ptr == 0` marks a free entry.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessAllocation {
    pub ptr: usize,
    pub size: usize,
}

/// Injected command arguments, living in process-owned user memory.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessArguments {
    pub argc: usize,
    pub argv: u32,
}

/// A loaded process.
pub struct Process {
    pub id: usize,
    pub filename: String,
    pub task: TaskId,
    pub image: ProcessImage,
    /// Size of the image data in bytes.
    pub size: usize,
    stack: PageBuffer,
    allocations: Box<[ProcessAllocation]>,
    pub keyboard: InputBuffer,
    pub arguments: ProcessArguments,
}

static PROCESSES: Mutex<[Option<Box<Process>>; MAX_PROCESSES]> =
    Mutex::new([const { None }; MAX_PROCESSES]);

static CURRENT_PROCESS: Mutex<Option<usize>> = Mutex::new(None);

/// The current process slot.
pub fn current() -> Option<usize> {
    *CURRENT_PROCESS.lock()
}

/// Whether a slot is occupied.
pub fn exists(id: usize) -> bool {
    id < MAX_PROCESSES && PROCESSES.lock()[id].is_some()
}

/// Makes `id` the current process.
pub fn switch(id: usize) -> Result<(), KernelError> {
    if !exists(id) {
        return Err(KernelError::InvalidArgument);
    }
    *CURRENT_PROCESS.lock() = Some(id);
    Ok(())
}

/// Runs a closure against a loaded process.
pub fn with<R>(id: usize, f: impl FnOnce(&mut Process) -> R) -> Option<R> {
    if id >= MAX_PROCESSES {
        return None;
    }
    let mut processes = PROCESSES.lock();
    processes[id].as_mut().map(|process| f(process))
}

fn load_binary(filename: &str) -> Result<(ProcessImage, usize), KernelError> {
    let fd = fs::fopen(filename, "r");
    if fd == 0 {
        return Err(KernelError::Io);
    }

    let result = (|| {
        let stat = fs::fstat(fd)?;
        let size = stat.filesize as usize;
        let mut buffer = PageBuffer::zeroed(size).ok_or(KernelError::NoMemory)?;
        fs::fread(buffer.as_mut_slice(), size, 1, fd)?;
        Ok((ProcessImage::Binary(buffer), size))
    })();

    let _ = fs::fclose(fd);
    result
}

/// Loads program data: ELF first, flat binary when the ELF validator
/// rejects the format.
fn load_data(filename: &str) -> Result<(ProcessImage, usize), KernelError> {
    match ElfFile::load(filename) {
        Ok(elf) => {
            let size = elf.size();
            Ok((ProcessImage::Elf(elf), size))
        }
        Err(KernelError::InvalidFormat) => load_binary(filename),
        Err(err) => Err(err),
    }
}

/// Maps the program image and the stack into the task's directory.
fn map_process_memory(
    task: TaskId,
    image: &ProcessImage,
    stack: &PageBuffer,
) -> Result<(), KernelError> {
    sched::with_task_mut(task, |t| -> Result<(), KernelError> {
        let directory = &mut t.page_directory;

        match image {
            ProcessImage::Binary(buffer) => {
                directory.map_to(
                    PROGRAM_VIRTUAL_ADDRESS,
                    buffer.phys(),
                    paging::align_up(buffer.phys().wrapping_add(buffer.len() as u32)),
                    PageFlags::PRESENT | PageFlags::USER | PageFlags::WRITEABLE,
                )?;
            }
            ProcessImage::Elf(elf) => {
                for phdr in elf.program_headers()? {
                    if phdr.p_type != PT_LOAD {
                        continue;
                    }
                    let mut flags = PageFlags::PRESENT | PageFlags::USER;
                    if phdr.p_flags & PF_W != 0 {
                        flags |= PageFlags::WRITEABLE;
                    }
                    let phys = elf.phdr_physical_address(&phdr);
                    directory.map_to(
                        paging::align_down(phdr.p_vaddr),
                        paging::align_down(phys),
                        paging::align_up(phys.wrapping_add(phdr.p_memsz)),
                        flags,
                    )?;
                }
            }
        }

        directory.map_to(
            PROGRAM_VIRTUAL_STACK_ADDRESS_END,
            stack.phys(),
            stack.phys().wrapping_add(USER_PROGRAM_STACK_SIZE as u32),
            PageFlags::PRESENT | PageFlags::USER | PageFlags::WRITEABLE,
        )?;

        Ok(())
    })
    .ok_or(KernelError::InvalidArgument)?
}

/// Loads a program into a specific slot.
pub fn load_for_slot(filename: &str, slot: usize) -> Result<usize, KernelError> {
    if slot >= MAX_PROCESSES {
        return Err(KernelError::InvalidArgument);
    }
    if exists(slot) {
        return Err(KernelError::Taken);
    }

    let (image, size) = load_data(filename)?;
    let stack = PageBuffer::zeroed(USER_PROGRAM_STACK_SIZE).ok_or(KernelError::NoMemory)?;

    let entry_point = match &image {
        ProcessImage::Elf(elf) => elf.entry(),
        ProcessImage::Binary(_) => PROGRAM_VIRTUAL_ADDRESS,
    };
    let task = sched::task_new(ProcessId(slot), entry_point)?;

    if let Err(err) = map_process_memory(task, &image, &stack) {
        sched::task_free(task);
        return Err(err);
    }

    let process = Box::new(Process {
        id: slot,
        filename: filename.to_string(),
        task,
        image,
        size,
        stack,
        allocations: vec![ProcessAllocation::default(); MAX_PROGRAM_ALLOCATIONS]
            .into_boxed_slice(),
        keyboard: InputBuffer::new(),
        arguments: ProcessArguments::default(),
    });

    PROCESSES.lock()[slot] = Some(process);
    log::info!("loaded {} into process slot {}", filename, slot);
    Ok(slot)
}

/// Loads a program into the first free slot.
pub fn load(filename: &str) -> Result<usize, KernelError> {
    let slot = {
        let processes = PROCESSES.lock();
        processes.iter().position(|slot| slot.is_none())
    };
    match slot {
        Some(slot) => load_for_slot(filename, slot),
        None => Err(KernelError::Taken),
    }
}

/// Loads a program and makes it the current process.
pub fn load_switch(filename: &str) -> Result<usize, KernelError> {
    let slot = load(filename)?;
    switch(slot)?;
    Ok(slot)
}

fn unmap_allocation(task: TaskId, ptr: usize, size: usize) -> Result<(), KernelError> {
    sched::with_task_mut(task, |t| {
        t.page_directory.map_to(
            ptr as u32,
            ptr as u32,
            paging::align_up((ptr as u32).wrapping_add(size as u32)),
            PageFlags::empty(),
        )
    })
    .ok_or(KernelError::InvalidArgument)?
}

/// Allocates kernel memory on behalf of a process and maps it into the
/// process's address space at its identity address. Returns null on any
/// failure.
pub fn process_malloc(id: usize, size: usize) -> *mut u8 {
    let ptr = kzalloc(size);
    if ptr.is_null() {
        return core::ptr::null_mut();
    }

    let mapped = with(id, |process| {
        let index = process
            .allocations
            .iter()
            .position(|allocation| allocation.ptr == 0)?;

        let result = sched::with_task_mut(process.task, |t| {
            t.page_directory.map_to(
                ptr as usize as u32,
                ptr as usize as u32,
                paging::align_up((ptr as usize as u32).wrapping_add(size as u32)),
                PageFlags::PRESENT | PageFlags::USER | PageFlags::WRITEABLE,
            )
        });
        match result {
            Some(Ok(())) => {
                process.allocations[index] = ProcessAllocation {
                    ptr: ptr as usize,
                    size,
                };
                Some(())
            }
            _ => None,
        }
    });

    match mapped {
        Some(Some(())) => ptr,
        _ => {
            unsafe { kfree(ptr) };
            core::ptr::null_mut()
        }
    }
}

/// Releases a process allocation: unmaps it from the task and returns
/// the memory to the kernel heap. Pointers the process does not own are
/// ignored.
pub fn process_free(id: usize, ptr: *mut u8) {
    let released = with(id, |process| {
        let index = process
            .allocations
            .iter()
            .position(|allocation| allocation.ptr == ptr as usize)?;
        let size = process.allocations[index].size;

        unmap_allocation(process.task, ptr as usize, size).ok()?;
        process.allocations[index] = ProcessAllocation::default();
        Some(())
    });

    if released == Some(Some(())) {
        unsafe { kfree(ptr) };
    }
}

/// Copies a command-argument list into process-owned user-visible
/// memory and records `{argc, argv}`.
pub fn inject_arguments(id: usize, args: &[&str]) -> Result<(), KernelError> {
    if args.is_empty() {
        return Err(KernelError::Io);
    }

    let argv = process_malloc(id, core::mem::size_of::<u32>() * args.len());
    if argv.is_null() {
        return Err(KernelError::NoMemory);
    }

    for (index, arg) in args.iter().enumerate() {
        let string = process_malloc(id, arg.len() + 1);
        if string.is_null() {
            return Err(KernelError::NoMemory);
        }
        unsafe {
            core::ptr::copy_nonoverlapping(arg.as_ptr(), string, arg.len());
            string.add(arg.len()).write(0);
            (argv as *mut u32).add(index).write(string as usize as u32);
        }
    }

    with(id, |process| {
        process.arguments = ProcessArguments {
            argc: args.len(),
            argv: argv as usize as u32,
        };
    })
    .ok_or(KernelError::InvalidArgument)
}

/// Reads back the injected arguments.
pub fn get_arguments(id: usize) -> Option<ProcessArguments> {
    with(id, |process| process.arguments)
}

fn switch_to_any() {
    let live = {
        let processes = PROCESSES.lock();
        processes
            .iter()
            .enumerate()
            .find_map(|(index, slot)| slot.as_ref().map(|_| index))
    };
    match live {
        Some(index) => *CURRENT_PROCESS.lock() = Some(index),
        None => panic!("no process to switch to"),
    }
}

/// Tears a process down: frees its tracked allocations, its program
/// data and stack, and its task (which drops the page directory and
/// unlinks it from the scheduler), then vacates the slot. If the
/// process was current, another live process takes over; with none
/// left the kernel panics.
pub fn terminate(id: usize) -> Result<(), KernelError> {
    if id >= MAX_PROCESSES {
        return Err(KernelError::InvalidArgument);
    }

    let allocations: alloc::vec::Vec<ProcessAllocation> = with(id, |process| {
        process
            .allocations
            .iter()
            .filter(|allocation| allocation.ptr != 0)
            .copied()
            .collect()
    })
    .ok_or(KernelError::InvalidArgument)?;

    for allocation in allocations {
        process_free(id, allocation.ptr as *mut u8);
    }

    let process = PROCESSES.lock()[id].take().ok_or(KernelError::InvalidArgument)?;
    sched::task_free(process.task);
    // Image and stack buffers are freed with the process.
    drop(process);

    if current() == Some(id) {
        switch_to_any();
    }

    log::info!("terminated process {}", id);
    Ok(())
}

#[cfg(test)]
pub(crate) fn reset_for_tests() {
    let mut processes = PROCESSES.lock();
    for slot in processes.iter_mut() {
        if let Some(process) = slot.take() {
            sched::task_free(process.task);
        }
    }
    *CURRENT_PROCESS.lock() = None;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{PROGRAM_VIRTUAL_STACK_ADDRESS_START, USER_CODE_SELECTOR};
    use crate::fs::fat16::tests::ImageBuilder;
    use crate::process::elf::tests::build_elf;
    use crate::test_sync;
    use alloc::sync::Arc;

    fn setup_disk() {
        crate::mm::kheap_init_for_tests();
        crate::fs::init();

        if crate::disk::get(0).is_some() {
            return;
        }

        // Entry and vaddr keep the standard file-offset congruence so
        // the page-granular mapping lands the segment bytes exactly.
        let elf_bytes = build_elf(2, 0x0040_0054, 0x0040_0054, b"\x90\x90\x90\x90");
        let mut builder = ImageBuilder::new();
        builder.root_entry(b"INIT    ELF", 0x20, 3, elf_bytes.len() as u32);
        builder.data(3, &elf_bytes);
        builder.root_entry(b"SHELL   BIN", 0x20, 4, 6);
        builder.data(4, b"\x90\x90\x90\x90\x90\x90");

        crate::disk::register(Arc::new(crate::disk::testing::RamDisk::new(builder.build())));
    }

    #[test]
    fn test_process_lifecycle_end_to_end() {
        let _guard = test_sync::LOCK.lock();
        sched::reset_for_tests();
        reset_for_tests();
        setup_disk();

        // ELF into slot 0, flat binary into slot 1.
        let a = load_switch("0:/init.elf").unwrap();
        let b = load("0:/shell.bin").unwrap();
        assert_eq!(a, 0);
        assert_eq!(b, 1);
        assert_eq!(current(), Some(a));
        assert_eq!(load_for_slot("0:/init.elf", 0).err(), Some(KernelError::Taken));

        // Slot and back-reference invariants.
        let (task_a, elf_checks) = with(a, |process| {
            assert_eq!(process.id, 0);
            let segment = match &process.image {
                ProcessImage::Elf(elf) => {
                    let phdr = elf.program_headers().unwrap()[0];
                    Some((elf.phdr_physical_address(&phdr), phdr.p_vaddr, phdr.p_filesz))
                }
                ProcessImage::Binary(_) => None,
            };
            (process.task, segment)
        })
        .unwrap();
        let task_b = with(b, |process| process.task).unwrap();

        sched::with_task(task_a, |task| {
            assert_eq!(task.process, ProcessId(a));
            assert_eq!(task.registers.ip, 0x0040_0054);
            assert_eq!(task.registers.cs, USER_CODE_SELECTOR as u32);
            assert_eq!(task.registers.esp, PROGRAM_VIRTUAL_STACK_ADDRESS_START);
        })
        .unwrap();
        sched::with_task(task_b, |task| {
            assert_eq!(task.registers.ip, PROGRAM_VIRTUAL_ADDRESS);
        })
        .unwrap();

        // Every file byte of the PT_LOAD segment translates to the
        // staged image.
        let (segment_phys, segment_vaddr, segment_filesz) = elf_checks.unwrap();
        for k in [0u32, 1, segment_filesz - 1] {
            assert_eq!(
                sched::task_virtual_to_physical(task_a, segment_vaddr + k).unwrap(),
                segment_phys + k
            );
        }

        // Round robin visits tasks in insertion order and wraps.
        assert_eq!(sched::current_task(), Some(task_a));
        assert_eq!(sched::schedule_next(), Some(task_b));
        assert_eq!(sched::schedule_next(), Some(task_a));

        // Keyboard ring of the current process.
        crate::keyboard::push(b'h');
        crate::keyboard::push(b'i');
        assert_eq!(crate::keyboard::pop(), b'h');
        assert_eq!(crate::keyboard::pop(), b'i');
        assert_eq!(crate::keyboard::pop(), 0);

        // Tracked allocations and argument injection.
        let ptr = process_malloc(b, 100);
        assert!(!ptr.is_null());
        inject_arguments(b, &["shell", "-v"]).unwrap();
        let arguments = get_arguments(b).unwrap();
        assert_eq!(arguments.argc, 2);
        assert_ne!(arguments.argv, 0);
        process_free(b, ptr);

        // Terminating the current process vacates its slot and hands
        // both the process and the task slot to the survivor.
        terminate(a).unwrap();
        assert!(!exists(a));
        assert_eq!(current(), Some(b));
        assert_eq!(sched::current_task(), Some(task_b));

        sched::reset_for_tests();
        reset_for_tests();
    }
}
