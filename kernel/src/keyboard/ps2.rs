//! # PS/2 Keyboard Driver
//!
//! Scancode set 1, caps-lock tracking, key releases ignored.

use core::sync::atomic::{AtomicBool, Ordering};

use crate::arch::{inb, outb};
use crate::interrupts::{self, InterruptFrame};
use crate::status::KernelError;

use super::Keyboard;

const PS2_COMMAND_PORT: u16 = 0x64;
const PS2_DATA_PORT: u16 = 0x60;
const PS2_ENABLE_FIRST_PORT: u8 = 0xAE;

const KEY_RELEASED: u8 = 0x80;
const SCANCODE_CAPSLOCK: u8 = 0x3A;

/// Scancode set 1 to ASCII, uppercase base.
static SCANCODE_SET_ONE: [u8; 82] = [
    0x00, 0x1B, b'1', b'2', b'3', b'4', b'5', b'6', b'7', b'8', b'9', b'0', b'-', b'=', 0x08,
    b'\t', b'Q', b'W', b'E', b'R', b'T', b'Y', b'U', b'I', b'O', b'P', b'[', b']', 0x0D, 0x00,
    b'A', b'S', b'D', b'F', b'G', b'H', b'J', b'K', b'L', b';', b'\'', b'`', 0x00, b'\\', b'Z',
    b'X', b'C', b'V', b'B', b'N', b'M', b',', b'.', b'/', 0x00, b'*', 0x00, b' ', 0x00, 0x00,
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, b'7', b'8', b'9', b'-', b'4', b'5',
    b'6', b'+', b'1', b'2', b'3', b'0', b'.',
];

/// The classic PS/2 keyboard.
pub struct Ps2Keyboard {
    caps_lock: AtomicBool,
}

impl Ps2Keyboard {
    const fn new() -> Self {
        Self {
            caps_lock: AtomicBool::new(false),
        }
    }

    fn scancode_to_char(&self, scancode: u8) -> u8 {
        if scancode as usize >= SCANCODE_SET_ONE.len() {
            return 0;
        }
        let mut chr = SCANCODE_SET_ONE[scancode as usize];
        if !self.caps_lock.load(Ordering::Relaxed) && chr.is_ascii_uppercase() {
            chr += 32;
        }
        chr
    }

    fn handle_scancode(&self, scancode: u8) {
        if scancode & KEY_RELEASED != 0 {
            return;
        }
        if scancode == SCANCODE_CAPSLOCK {
            self.caps_lock.fetch_xor(true, Ordering::Relaxed);
        }
        let chr = self.scancode_to_char(scancode);
        if chr != 0 {
            super::push(chr);
        }
    }
}

impl Keyboard for Ps2Keyboard {
    fn name(&self) -> &'static str {
        "PS/2 keyboard"
    }

    fn init(&self) -> Result<(), KernelError> {
        interrupts::register_callback(interrupts::vector::KEYBOARD, keyboard_interrupt)?;
        outb(PS2_COMMAND_PORT, PS2_ENABLE_FIRST_PORT);
        Ok(())
    }
}

/// The driver singleton.
pub static CLASSIC: Ps2Keyboard = Ps2Keyboard::new();

fn keyboard_interrupt(_frame: &InterruptFrame) {
    let scancode = inb(PS2_DATA_PORT);
    // Drain the controller's second byte.
    inb(PS2_DATA_PORT);
    CLASSIC.handle_scancode(scancode);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scancode_translation_respects_caps_lock() {
        let keyboard = Ps2Keyboard::new();
        // 0x10 is Q; lowercase while caps lock is off.
        assert_eq!(keyboard.scancode_to_char(0x10), b'q');
        keyboard.caps_lock.store(true, Ordering::Relaxed);
        assert_eq!(keyboard.scancode_to_char(0x10), b'Q');
        // Digits are unaffected.
        assert_eq!(keyboard.scancode_to_char(0x02), b'1');
    }

    #[test]
    fn test_out_of_range_scancode_maps_to_nothing() {
        let keyboard = Ps2Keyboard::new();
        assert_eq!(keyboard.scancode_to_char(0x70), 0);
    }
}
