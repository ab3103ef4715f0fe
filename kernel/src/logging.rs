//! Kernel logging facility
//!
//! Routes the `log` crate to the COM1 serial port. The VM system logs through
//! the `log` macros only, so it stays silent until [`init`] has run.

use log::{LevelFilter, Log, Metadata, Record};
use spin::Mutex;

/// Global logger instance available throughout the kernel
pub static LOGGER: Logger = Logger::new();

/// Serialises whole lines onto the serial port
pub struct Logger {
    inner: Mutex<()>,
}

impl Default for Logger {
    fn default() -> Self {
        Self::new()
    }
}

impl Logger {
    pub const fn new() -> Logger {
        Logger {
            inner: Mutex::new(()),
        }
    }
}

impl Log for Logger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    /// Formats messages as "[LEVEL] module: message"
    fn log(&self, record: &Record) {
        if self.enabled(record.metadata()) {
            let _guard = self.inner.lock();
            crate::serial_println!(
                "[{}] {}: {}",
                record.level(),
                record.target(),
                record.args()
            );
        }
    }

    fn flush(&self) {}
}

/// Default verbosity: Debug in debug builds, Info in release builds
pub const fn default_level() -> LevelFilter {
    if cfg!(debug_assertions) {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    }
}

/// Installs the serial logger at [`default_level`]
///
/// # Arguments
/// * `cpu_id` - CPU core identifier. Only core 0 installs the logger
pub fn init(cpu_id: u32) {
    init_with_level(cpu_id, default_level());
}

/// Installs the serial logger; a second call only changes the level
pub fn init_with_level(cpu_id: u32, level: LevelFilter) {
    if cpu_id == 0 {
        if log::set_logger(&LOGGER).is_err() {
            log::debug!("Logger already installed");
        }
        log::set_max_level(level);
    }
}
