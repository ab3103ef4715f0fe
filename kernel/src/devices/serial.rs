//! COM1 output for the kernel logger.
//!
//! The page-fault path logs, so the port lock is only ever taken with
//! interrupts off; a fault taken while the lock is held would otherwise spin
//! forever on it.

use crate::{constants::ports::SERIAL_PORT, interrupts};
use core::fmt::{self, Write};
use lazy_static::lazy_static;
use spin::Mutex;
use uart_16550::SerialPort;

lazy_static! {
    /// The first serial port, initialised on first use
    pub static ref SERIAL1: Mutex<SerialPort> = {
        let mut port = unsafe { SerialPort::new(SERIAL_PORT) };
        port.init();
        Mutex::new(port)
    };
}

#[doc(hidden)]
pub fn _print(args: fmt::Arguments) {
    interrupts::without_interrupts(|| {
        // Nowhere left to report a failed log write
        let _ = SERIAL1.lock().write_fmt(args);
    });
}

/// Writes formatted text to COM1
#[macro_export]
macro_rules! serial_print {
    ($($arg:tt)*) => {
        $crate::serial::_print(format_args!($($arg)*))
    };
}

/// Writes formatted text to COM1 followed by a newline
#[macro_export]
macro_rules! serial_println {
    () => ($crate::serial_print!("\n"));
    ($($arg:tt)*) => ($crate::serial_print!("{}\n", format_args!($($arg)*)));
}
