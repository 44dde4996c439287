//! Scheduler logging backend
//!
//! Leveled logging for the scheduler subsystem. The embedding kernel installs
//! an output sink (serial console, ring buffer, ...) with [`set_sink`]; until
//! one is installed every record is dropped. The level filter is runtime
//! adjustable and checked before formatting.

use core::fmt;
use core::sync::atomic::{AtomicU8, AtomicUsize, Ordering};

static LOG_LEVEL: AtomicU8 = AtomicU8::new(LogLevel::INFO.priority());
static SINK: AtomicUsize = AtomicUsize::new(0);

/// Output sink for formatted log records.
pub type LogSink = fn(LogLevel, fmt::Arguments);

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    FATAL,
    ERROR,
    WARN,
    INFO,
    DEBUG,
    TRACE,
}

impl LogLevel {
    pub const fn as_str(self) -> &'static str {
        match self {
            LogLevel::FATAL => "FATAL",
            LogLevel::ERROR => "ERROR",
            LogLevel::WARN => "WARN",
            LogLevel::INFO => "INFO",
            LogLevel::DEBUG => "DEBUG",
            LogLevel::TRACE => "TRACE",
        }
    }

    pub const fn priority(self) -> u8 {
        match self {
            LogLevel::FATAL => 0,
            LogLevel::ERROR => 1,
            LogLevel::WARN => 2,
            LogLevel::INFO => 3,
            LogLevel::DEBUG => 4,
            LogLevel::TRACE => 5,
        }
    }
}

/// Install the output sink. Replaces any previous sink.
pub fn set_sink(sink: LogSink) {
    SINK.store(sink as usize, Ordering::Release);
}

/// Set the maximum level that will be emitted.
pub fn set_level(level: LogLevel) {
    LOG_LEVEL.store(level.priority(), Ordering::Relaxed);
}

/// Current maximum emitted level.
pub fn level() -> u8 {
    LOG_LEVEL.load(Ordering::Relaxed)
}

/// Emit one record. Called through the `klog!` macro family; not meant to be
/// used directly.
pub fn log(level: LogLevel, args: fmt::Arguments) {
    if level.priority() > LOG_LEVEL.load(Ordering::Relaxed) {
        return;
    }
    let raw = SINK.load(Ordering::Acquire);
    if raw == 0 {
        return;
    }
    // Stored from a valid fn pointer in set_sink; never unset once installed.
    let sink: LogSink = unsafe { core::mem::transmute(raw) };
    sink(level, args);
}
