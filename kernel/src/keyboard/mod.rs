//! # Keyboard Layer
//!
//! Keyboard drivers present a small capability set (`name`, `init`) and
//! register in an ordered list; translated bytes land in the ring
//! buffer of whichever process is current. The ring is written by the
//! keyboard ISR and drained by the `getkey` syscall; both run on the
//! one CPU, so a byte is either visible or not yet written, never torn.

pub mod ps2;

use alloc::vec::Vec;

use spin::Mutex;

use crate::config::KEYBOARD_BUFFER_SIZE;
use crate::status::KernelError;

/// Per-process input ring. Zero bytes are never stored, which is what
/// lets a zero read mean "empty".
pub struct InputBuffer {
    buffer: [u8; KEYBOARD_BUFFER_SIZE],
    head: usize,
    tail: usize,
}

impl InputBuffer {
    pub const fn new() -> Self {
        Self {
            buffer: [0; KEYBOARD_BUFFER_SIZE],
            head: 0,
            tail: 0,
        }
    }

    /// Appends one byte at the tail.
    pub fn push(&mut self, chr: u8) {
        if chr == 0 {
            return;
        }
        let index = self.tail % KEYBOARD_BUFFER_SIZE;
        self.buffer[index] = chr;
        self.tail = self.tail.wrapping_add(1);
    }

    /// Takes the byte at the head, or 0 when the ring is empty.
    pub fn pop(&mut self) -> u8 {
        let index = self.head % KEYBOARD_BUFFER_SIZE;
        let chr = self.buffer[index];
        if chr == 0 {
            return 0;
        }
        self.buffer[index] = 0;
        self.head = self.head.wrapping_add(1);
        chr
    }

    /// Rewinds the tail, erasing the most recent byte.
    pub fn backspace(&mut self) {
        self.tail = self.tail.wrapping_sub(1);
        let index = self.tail % KEYBOARD_BUFFER_SIZE;
        self.buffer[index] = 0;
    }
}

impl Default for InputBuffer {
    fn default() -> Self {
        Self::new()
    }
}

/// A keyboard driver.
pub trait Keyboard: Send + Sync {
    fn name(&self) -> &'static str;

    /// One-time hardware and callback setup.
    fn init(&self) -> Result<(), KernelError>;
}

static KEYBOARDS: Mutex<Vec<&'static dyn Keyboard>> = Mutex::new(Vec::new());

/// Registers and initializes a keyboard driver.
pub fn insert(keyboard: &'static dyn Keyboard) -> Result<(), KernelError> {
    keyboard.init()?;
    KEYBOARDS.lock().push(keyboard);
    log::info!("keyboard {} registered", keyboard.name());
    Ok(())
}

/// Brings up the built-in keyboards.
pub fn init() {
    if let Err(err) = insert(&ps2::CLASSIC) {
        log::warn!("ps2 keyboard init failed: {}", err);
    }
}

/// Pushes a byte into the current process's ring. Dropped when no
/// process is current.
pub fn push(chr: u8) {
    let Some(id) = crate::process::current() else {
        return;
    };
    crate::process::with(id, |process| process.keyboard.push(chr));
}

/// Erases the most recent byte of the current process's ring.
pub fn backspace() {
    let Some(id) = crate::process::current() else {
        return;
    };
    crate::process::with(id, |process| process.keyboard.backspace());
}

/// Pops a byte from the ring of the current task's process; 0 when
/// empty or when nothing runs.
pub fn pop() -> u8 {
    let Some(process) = crate::sched::current_task_process() else {
        return 0;
    };
    crate::process::with(process.0, |process| process.keyboard.pop()).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ring_push_pop_order() {
        let mut ring = InputBuffer::new();
        ring.push(b'a');
        ring.push(b'b');
        ring.push(b'c');
        assert_eq!(ring.pop(), b'a');
        assert_eq!(ring.pop(), b'b');
        assert_eq!(ring.pop(), b'c');
        assert_eq!(ring.pop(), 0);
    }

    #[test]
    fn test_ring_ignores_nul_bytes() {
        let mut ring = InputBuffer::new();
        ring.push(0);
        assert_eq!(ring.pop(), 0);
    }

    #[test]
    fn test_ring_backspace_erases_last() {
        let mut ring = InputBuffer::new();
        ring.push(b'h');
        ring.push(b'x');
        ring.backspace();
        assert_eq!(ring.pop(), b'h');
        assert_eq!(ring.pop(), 0);
    }

    #[test]
    fn test_ring_wraps_around() {
        let mut ring = InputBuffer::new();
        for round in 0..3 {
            for i in 0..KEYBOARD_BUFFER_SIZE {
                ring.push((1 + ((round + i) % 250)) as u8);
            }
            for i in 0..KEYBOARD_BUFFER_SIZE {
                assert_eq!(ring.pop(), (1 + ((round + i) % 250)) as u8);
            }
        }
    }
}
