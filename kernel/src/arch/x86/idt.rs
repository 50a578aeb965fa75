//! # IDT and Interrupt Stubs
//!
//! Builds the 512-entry interrupt descriptor table. Every vector gets a
//! generated stub that saves the general purpose registers, pushes the
//! vector number and enters the common dispatcher; vector 0x80 gets the
//! syscall wrapper, which routes the command id from `eax` and patches
//! the handler's return value back into the saved frame.

use core::arch::global_asm;
use core::cell::UnsafeCell;
use core::mem::size_of;

use crate::config::{KERNEL_CODE_SELECTOR, TOTAL_INTERRUPTS};
use crate::interrupts::InterruptFrame;

// Present, DPL=3, 32-bit interrupt gate. User mode may raise any vector;
// the dispatcher decides what it means.
const GATE_TYPE_ATTR: u8 = 0xEE;

/// One IDT gate descriptor.
#[repr(C, packed)]
#[derive(Clone, Copy)]
struct IdtDescriptor {
    offset_low: u16,
    selector: u16,
    zero: u8,
    type_attr: u8,
    offset_high: u16,
}

impl IdtDescriptor {
    const fn null() -> Self {
        Self {
            offset_low: 0,
            selector: 0,
            zero: 0,
            type_attr: 0,
            offset_high: 0,
        }
    }

    fn new(handler: u32) -> Self {
        Self {
            offset_low: handler as u16,
            selector: KERNEL_CODE_SELECTOR,
            zero: 0,
            type_attr: GATE_TYPE_ATTR,
            offset_high: (handler >> 16) as u16,
        }
    }
}

/// IDT register operand for `lidt`.
#[repr(C, packed)]
struct IdtPointer {
    limit: u16,
    base: u32,
}

struct IdtStorage(UnsafeCell<[IdtDescriptor; TOTAL_INTERRUPTS]>);

// Written once during init with interrupts masked, read only by the CPU.
unsafe impl Sync for IdtStorage {}

static IDT: IdtStorage = IdtStorage(UnsafeCell::new([IdtDescriptor::null(); TOTAL_INTERRUPTS]));

global_asm!(
    r#"
.altmacro

.macro vector_stub n
vanadium_vector_\n:
    pushad
    push esp
    push \n
    call vanadium_interrupt_entry
    add esp, 8
    popad
    iretd
.endm

.set i, 0
.rept 512
    vector_stub %i
    .set i, i + 1
.endr

vanadium_isr80h_wrapper:
    pushad
    push esp
    push eax
    call vanadium_isr80h_entry
    mov ecx, [esp + 4]
    mov [ecx + 28], eax
    add esp, 8
    popad
    iretd

.macro vector_ref n
    .long vanadium_vector_\n
.endm

.section .rodata
.global VANADIUM_VECTOR_TABLE
VANADIUM_VECTOR_TABLE:
.set i, 0
.rept 512
    vector_ref %i
    .set i, i + 1
.endr
.text
"#
);

extern "C" {
    static VANADIUM_VECTOR_TABLE: [u32; TOTAL_INTERRUPTS];
    fn vanadium_isr80h_wrapper();
}

#[no_mangle]
extern "C" fn vanadium_interrupt_entry(vector: u32, frame: *mut InterruptFrame) {
    let frame = unsafe { &mut *frame };
    crate::interrupts::dispatch(vector as usize, frame);
}

#[no_mangle]
extern "C" fn vanadium_isr80h_entry(command: u32, frame: *mut InterruptFrame) -> u32 {
    let frame = unsafe { &mut *frame };
    crate::syscall::isr80h_handler(command as usize, frame)
}

/// Fills the IDT and loads it. Interrupts stay masked throughout; the
/// first `iret` into user mode is what re-enables them.
pub fn idt_init() {
    super::disable_interrupts();

    let entries = unsafe { &mut *IDT.0.get() };
    for (vector, entry) in entries.iter_mut().enumerate() {
        let stub = unsafe { VANADIUM_VECTOR_TABLE[vector] };
        *entry = IdtDescriptor::new(stub);
    }
    entries[0x80] = IdtDescriptor::new(vanadium_isr80h_wrapper as usize as u32);

    let pointer = IdtPointer {
        limit: (size_of::<[IdtDescriptor; TOTAL_INTERRUPTS]>() - 1) as u16,
        base: IDT.0.get() as u32,
    };
    unsafe {
        core::arch::asm!(
            "lidt [{}]",
            in(reg) &pointer,
            options(readonly, nostack, preserves_flags)
        );
    }
}
