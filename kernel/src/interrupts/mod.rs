//! # Interrupt Dispatch
//!
//! Every vector funnels into `dispatch` with the trap frame its stub
//! pushed. The ordering here is the contract the rest of the kernel
//! leans on: the kernel page directory goes in before any kernel state
//! is touched, the task's directory is restored before the stub
//! `iret`s, and the task's registers are saved before any callback
//! runs.

use spin::Mutex;

use crate::arch;
use crate::config::TOTAL_INTERRUPTS;
use crate::mm::paging;
use crate::sched;
use crate::status::KernelError;

/// Well-known vectors.
pub mod vector {
    /// PIT timer tick; the round-robin preemption point.
    pub const TIMER: usize = 0x20;
    /// PS/2 keyboard.
    pub const KEYBOARD: usize = 0x21;
    /// Syscall gate (DPL 3).
    pub const SYSCALL: usize = 0x80;
}

/// The register snapshot pushed by a vector stub: general purpose
/// registers below the CPU's `iret` frame. Layout is load-bearing.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct InterruptFrame {
    pub edi: u32,
    pub esi: u32,
    pub ebp: u32,
    pub reserved: u32,
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

/// A per-vector handler.
pub type InterruptCallback = fn(&InterruptFrame);

static CALLBACKS: Mutex<[Option<InterruptCallback>; TOTAL_INTERRUPTS]> =
    Mutex::new([None; TOTAL_INTERRUPTS]);

/// Registers a callback for a vector.
pub fn register_callback(
    vector: usize,
    callback: InterruptCallback,
) -> Result<(), KernelError> {
    if vector >= TOTAL_INTERRUPTS {
        return Err(KernelError::InvalidArgument);
    }
    CALLBACKS.lock()[vector] = Some(callback);
    Ok(())
}

const PIC1_COMMAND: u16 = 0x20;
const PIC_EOI: u8 = 0x20;

/// Signals end-of-interrupt to the PIC.
pub fn acknowledge() {
    arch::outb(PIC1_COMMAND, PIC_EOI);
}

/// Common dispatcher entered from every vector stub.
pub fn dispatch(vector: usize, frame: &mut InterruptFrame) {
    paging::kernel_page();

    let callback = if vector < TOTAL_INTERRUPTS {
        CALLBACKS.lock()[vector]
    } else {
        None
    };
    if let Some(callback) = callback {
        sched::save_current_state(frame);
        callback(frame);
    }

    sched::task_page();
    acknowledge();
}

/// Timer tick: acknowledge and hand the CPU to the next task.
fn timer_tick(_frame: &InterruptFrame) {
    acknowledge();
    sched::task_next();
}

/// Default policy for CPU exceptions: the faulting process dies and
/// the scheduler advances to the next live task.
fn handle_exception(_frame: &InterruptFrame) {
    if let Some(process) = sched::current_task_process() {
        let _ = crate::process::terminate(process.0);
    }
    sched::task_next();
}

/// Loads the IDT and installs the default exception and timer
/// handlers. The keyboard registers its own vector during
/// `keyboard::init`.
pub fn init() {
    arch::idt_init();

    for vector in 0..0x20 {
        let _ = register_callback(vector, handle_exception);
    }
    let _ = register_callback(vector::TIMER, timer_tick);

    log::info!("interrupt dispatch ready ({} vectors)", TOTAL_INTERRUPTS);
}
