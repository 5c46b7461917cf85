//! Monitor logging
//!
//! Routes the `log` facade to the platform debug console. Every line carries the originating
//! hart: the monitor runs on all of them and interleaved output is otherwise ambiguous.

use log::{LevelFilter, Metadata, Record};

use crate::arch::{Arch, Architecture};
use crate::config;
use crate::platform::{Plat, Platform};

struct SmLogger;

static LOGGER: SmLogger = SmLogger;

impl log::Log for SmLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        Plat::debug_print(core::format_args!(
            "[sm:{}] {:<5} {}: {}\n",
            Arch::hart_id(),
            record.level(),
            record.target(),
            record.args()
        ));
    }

    fn flush(&self) {}
}

/// The level filter selected at build time.
const fn max_level() -> LevelFilter {
    match config::LOG_LEVEL {
        Some(level) => match level.as_bytes() {
            b"off" => LevelFilter::Off,
            b"error" => LevelFilter::Error,
            b"warn" => LevelFilter::Warn,
            b"debug" => LevelFilter::Debug,
            b"trace" => LevelFilter::Trace,
            _ => LevelFilter::Info,
        },
        None => LevelFilter::Info,
    }
}

/// Installs the monitor logger.
///
/// Safe to call from every hart during early boot, only the first call takes effect.
pub fn init() {
    if log::set_logger(&LOGGER).is_ok() {
        log::set_max_level(max_level());
    }
}
