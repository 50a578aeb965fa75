//! # Tasks and the Round-Robin Scheduler
//!
//! A task is a saved ring-3 register set plus its own page directory.
//! Tasks are kept in insertion order; the timer advances `current` to
//! the next task in that order, wrapping to the head. The kernel never
//! preempts itself: every function here runs to completion inside one
//! ISR or one `kernel_main` call.
//!
//! Tasks reference their owning process by id only; the process owns
//! the task.

use alloc::collections::BTreeMap;
use alloc::vec::Vec;

use spin::Mutex;

use crate::arch;
use crate::config::{
    PROGRAM_VIRTUAL_STACK_ADDRESS_START, USER_CODE_SELECTOR, USER_DATA_SELECTOR,
};
use crate::interrupts::InterruptFrame;
use crate::mm::paging::{self, PageFlags, PagingChunk, PAGE_SIZE};
use crate::mm::{kfree, kzalloc};
use crate::process::ProcessId;
use crate::status::KernelError;

/// Task identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct TaskId(pub u32);

/// Saved CPU state of a task that is not running.
///
/// The layout is load-bearing: `arch::task_return` restores these
/// fields by offset.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct Registers {
    pub edi: u32,
    pub esi: u32,
    pub ebp: u32,
    pub ebx: u32,
    pub edx: u32,
    pub ecx: u32,
    pub eax: u32,
    pub ip: u32,
    pub cs: u32,
    pub flags: u32,
    pub esp: u32,
    pub ss: u32,
}

impl Registers {
    pub const fn zeroed() -> Self {
        Self {
            edi: 0,
            esi: 0,
            ebp: 0,
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
}

/// A schedulable context.
pub struct Task {
    pub id: TaskId,
    pub page_directory: PagingChunk,
    pub registers: Registers,
    pub process: ProcessId,
}

struct TaskList {
    tasks: BTreeMap<TaskId, Task>,
    order: Vec<TaskId>,
    current: Option<TaskId>,
    next_id: u32,
}

static TASKS: Mutex<TaskList> = Mutex::new(TaskList {
    tasks: BTreeMap::new(),
    order: Vec::new(),
    current: None,
    next_id: 1,
});

/// Creates a task for `process` entering at `entry_point` and links it
/// at the tail of the list. The first task ever becomes current.
pub fn task_new(process: ProcessId, entry_point: u32) -> Result<TaskId, KernelError> {
    let page_directory = PagingChunk::new(PageFlags::PRESENT | PageFlags::USER);

    let mut registers = Registers::zeroed();
    registers.ip = entry_point;
    registers.cs = USER_CODE_SELECTOR as u32;
    registers.ss = USER_DATA_SELECTOR as u32;
    registers.esp = PROGRAM_VIRTUAL_STACK_ADDRESS_START;

    let mut list = TASKS.lock();
    let id = TaskId(list.next_id);
    list.next_id += 1;
    list.tasks.insert(
        id,
        Task {
            id,
            page_directory,
            registers,
            process,
        },
    );
    list.order.push(id);
    if list.current.is_none() {
        list.current = Some(id);
    }
    Ok(id)
}

fn successor(order: &[TaskId], id: TaskId) -> Option<TaskId> {
    let position = order.iter().position(|&t| t == id)?;
    let next = order[(position + 1) % order.len()];
    if next == id {
        None
    } else {
        Some(next)
    }
}

/// Unlinks and destroys a task, dropping its page directory. If it was
/// current, current moves to the next task in order (or clears).
pub fn task_free(id: TaskId) {
    let mut list = TASKS.lock();
    if list.current == Some(id) {
        list.current = successor(&list.order, id);
    }
    list.order.retain(|&t| t != id);
    list.tasks.remove(&id);
}

/// The running (or about-to-run) task.
pub fn current_task() -> Option<TaskId> {
    TASKS.lock().current
}

/// The process owning the current task.
pub fn current_task_process() -> Option<ProcessId> {
    let list = TASKS.lock();
    let current = list.current?;
    list.tasks.get(&current).map(|task| task.process)
}

/// Runs a closure against a task.
pub fn with_task<R>(id: TaskId, f: impl FnOnce(&Task) -> R) -> Option<R> {
    let list = TASKS.lock();
    list.tasks.get(&id).map(f)
}

/// Runs a closure against a task, mutably.
pub fn with_task_mut<R>(id: TaskId, f: impl FnOnce(&mut Task) -> R) -> Option<R> {
    let mut list = TASKS.lock();
    list.tasks.get_mut(&id).map(f)
}

/// Advances `current` to the next task in insertion order, wrapping to
/// the head. Returns the new current task.
pub fn schedule_next() -> Option<TaskId> {
    let mut list = TASKS.lock();
    let current = list.current?;
    let next = successor(&list.order, current).unwrap_or(current);
    list.current = Some(next);
    Some(next)
}

/// Makes `id` current and installs its page directory.
pub fn switch_to(id: TaskId) {
    let directory = {
        let mut list = TASKS.lock();
        let directory = list
            .tasks
            .get(&id)
            .map(|task| task.page_directory.directory_address());
        if directory.is_some() {
            list.current = Some(id);
        }
        directory
    };
    if let Some(directory) = directory {
        paging::switch_directory(directory);
    }
}

/// Reloads user segments and the current task's page directory; the
/// tail end of every ISR.
pub fn task_page() {
    let directory = {
        let list = TASKS.lock();
        list.current
            .and_then(|id| list.tasks.get(&id))
            .map(|task| task.page_directory.directory_address())
    };
    if let Some(directory) = directory {
        arch::user_registers();
        paging::switch_directory(directory);
    }
}

/// Copies a trap frame into the current task's saved registers. Must
/// run with the kernel page directory installed.
pub fn save_current_state(frame: &InterruptFrame) {
    let mut list = TASKS.lock();
    let current = match list.current {
        Some(current) => current,
        None => panic!("no current task to save"),
    };
    if let Some(task) = list.tasks.get_mut(&current) {
        task.registers.ip = frame.ip;
        task.registers.cs = frame.cs;
        task.registers.flags = frame.flags;
        task.registers.esp = frame.esp;
        task.registers.ss = frame.ss;
        task.registers.eax = frame.eax;
        task.registers.ebp = frame.ebp;
        task.registers.ebx = frame.ebx;
        task.registers.ecx = frame.ecx;
        task.registers.edi = frame.edi;
        task.registers.edx = frame.edx;
        task.registers.esi = frame.esi;
    }
}

fn registers_of(id: TaskId) -> Option<Registers> {
    with_task(id, |task| task.registers)
}

/// Switches to the next task and `iret`s into it. The only preemption
/// point in the system; reached from the timer tick and from exception
/// teardown.
pub fn task_next() -> ! {
    let next = match schedule_next() {
        Some(next) => next,
        None => panic!("no more tasks to run"),
    };
    switch_to(next);
    let registers = registers_of(next).expect("next task vanished");
    arch::task_return(&registers)
}

/// Launches the head task with its synthesized initial frame.
pub fn run_first_ever_task() -> ! {
    let first = {
        let list = TASKS.lock();
        match list.order.first().copied() {
            Some(first) => first,
            None => panic!("no task to run"),
        }
    };
    switch_to(first);
    let registers = registers_of(first).expect("first task vanished");
    arch::task_return(&registers)
}

/// Copies a nul-terminated string out of a task's address space.
///
/// A kernel scratch page is temporarily identity-mapped into the task's
/// directory, the string is copied while that directory is live, and
/// the overwritten entry is restored afterwards.
///
/// # Safety
///
/// `virtual_addr` must be a readable address in the task's address
/// space; the caller must be in kernel mode with no other directory
/// switch in flight.
pub unsafe fn copy_string_from_task(
    id: TaskId,
    virtual_addr: u32,
    out: &mut [u8],
) -> Result<(), KernelError> {
    if out.len() >= PAGE_SIZE {
        return Err(KernelError::NoMemory);
    }

    let scratch = kzalloc(out.len());
    if scratch.is_null() {
        return Err(KernelError::NoMemory);
    }
    let scratch_addr = scratch as usize as u32;

    let result = (|| {
        let mut list = TASKS.lock();
        let task = list.tasks.get_mut(&id).ok_or(KernelError::InvalidArgument)?;

        let old_entry = task.page_directory.get(scratch_addr)?;
        task.page_directory.map(
            scratch_addr,
            scratch_addr,
            PageFlags::PRESENT | PageFlags::WRITEABLE | PageFlags::USER,
        )?;

        paging::switch(&task.page_directory);
        unsafe {
            let src = virtual_addr as *const u8;
            for index in 0..out.len() {
                let byte = src.add(index).read_volatile();
                scratch.add(index).write(byte);
                if byte == 0 {
                    break;
                }
            }
        }
        paging::kernel_page();

        task.page_directory.set(scratch_addr, old_entry)?;
        Ok(())
    })();

    if result.is_ok() {
        unsafe {
            core::ptr::copy_nonoverlapping(scratch, out.as_mut_ptr(), out.len());
        }
    }
    unsafe { kfree(scratch) };
    result
}

/// Reads the i-th 32-bit item on a task's user stack.
///
/// # Safety
///
/// The task's saved `esp` must point at a mapped user stack; runs a
/// transient switch into the task's address space.
pub unsafe fn task_get_stack_item(id: TaskId, index: usize) -> Result<u32, KernelError> {
    let list = TASKS.lock();
    let task = list.tasks.get(&id).ok_or(KernelError::InvalidArgument)?;
    let stack_pointer = task.registers.esp as *const u32;

    arch::user_registers();
    paging::switch(&task.page_directory);
    let value = unsafe { stack_pointer.add(index).read_volatile() };
    paging::kernel_page();

    Ok(value)
}

/// Translates a virtual address through a task's directory.
pub fn task_virtual_to_physical(id: TaskId, virtual_addr: u32) -> Result<u32, KernelError> {
    with_task(id, |task| task.page_directory.virtual_to_physical(virtual_addr))
        .ok_or(KernelError::InvalidArgument)?
}

#[cfg(test)]
pub(crate) fn reset_for_tests() {
    let mut list = TASKS.lock();
    list.tasks.clear();
    list.order.clear();
    list.current = None;
}
