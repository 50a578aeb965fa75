//! # Kernel Logger
//!
//! Routes the `log` facade to the serial port. The VGA console stays
//! reserved for user-visible output; diagnostics go to COM1 where the
//! emulator or a serial cable can collect them.

use log::{LevelFilter, Log, Metadata, Record};

use crate::arch;

struct KernelLogger;

impl Log for KernelLogger {
    fn enabled(&self, _metadata: &Metadata) -> bool {
        true
    }

    fn log(&self, record: &Record) {
        arch::serial_write_fmt(format_args!(
            "[{:<5}] {}: {}\n",
            record.level(),
            record.target(),
            record.args()
        ));
    }

    fn flush(&self) {}
}

static LOGGER: KernelLogger = KernelLogger;

/// Installs the logger. Safe to call once, early.
pub fn init() {
    let _ = log::set_logger(&LOGGER);
    log::set_max_level(LevelFilter::Info);
}
