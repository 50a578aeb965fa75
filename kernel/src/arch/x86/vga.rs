//! # VGA Text Console
//!
//! 80x25 text-mode writer backing the `print`/`putchar` syscalls. The
//! terminal proper (colors, scrolling policy) belongs to the display
//! service; the kernel only needs enough to echo user output.

use spin::Mutex;

const VGA_WIDTH: u16 = 80;
const VGA_HEIGHT: u16 = 25;
const VIDEO_MEMORY: usize = 0xB8000;

const WHITE_ON_BLACK: u8 = 0x0F;

/// Cursor state for the text console.
pub struct Console {
    row: u16,
    col: u16,
}

impl Console {
    const fn new() -> Self {
        Self { row: 0, col: 0 }
    }

    fn put_at(&self, x: u16, y: u16, chr: u8) {
        let cell = ((WHITE_ON_BLACK as u16) << 8) | chr as u16;
        let offset = (y * VGA_WIDTH + x) as usize;
        unsafe {
            core::ptr::write_volatile((VIDEO_MEMORY as *mut u16).add(offset), cell);
        }
    }

    fn backspace(&mut self) {
        if self.row == 0 && self.col == 0 {
            return;
        }
        if self.col == 0 {
            self.row -= 1;
            self.col = VGA_WIDTH;
        }
        self.col -= 1;
        self.put_at(self.col, self.row, b' ');
    }

    /// Writes one byte, handling newline and backspace.
    pub fn put_char(&mut self, chr: u8) {
        match chr {
            b'\n' => {
                self.col = 0;
                self.row += 1;
            }
            0x08 => self.backspace(),
            _ => {
                self.put_at(self.col, self.row, chr);
                self.col += 1;
                if self.col >= VGA_WIDTH {
                    self.col = 0;
                    self.row += 1;
                }
            }
        }
    }

    fn clear(&mut self) {
        for y in 0..VGA_HEIGHT {
            for x in 0..VGA_WIDTH {
                self.put_at(x, y, b' ');
            }
        }
        self.row = 0;
        self.col = 0;
    }
}

/// Global console instance.
static CONSOLE: Mutex<Console> = Mutex::new(Console::new());

/// Clears the screen and homes the cursor.
pub fn init() {
    CONSOLE.lock().clear();
}

/// Writes one byte to the console.
pub fn console_put_char(chr: u8) {
    CONSOLE.lock().put_char(chr);
}
