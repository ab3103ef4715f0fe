//! Device access.
//!
//! Only the COM1 serial port is needed here: it carries kernel log output.

pub mod serial;
