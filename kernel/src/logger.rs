//! Kernel logger behind the `log` facade.
//!
//! Subsystems log through `log::{debug, info, warn, error}` with their module
//! path as the target; records are rendered onto the console path. The
//! maximum level is set once at boot and never changes afterwards.

use log::{LevelFilter, Log, Metadata, Record};

use crate::println;

struct KernelLog;

static LOGGER: KernelLog = KernelLog;

impl Log for KernelLog {
    fn enabled(&self, _metadata: &Metadata) -> bool {
        true
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        println!(
            "[{:>5}] {}: {}",
            record.level(),
            record.target(),
            record.args()
        );
    }

    fn flush(&self) {}
}

/// Install the kernel logger. Safe to call more than once; only the first
/// call wins (relevant to tests that share one process).
pub fn init(level: LevelFilter) {
    if log::set_logger(&LOGGER).is_ok() {
        log::set_max_level(level);
    }
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;
    use log::LevelFilter;

    #[test]
    fn test_init_is_idempotent() {
        init(LevelFilter::Debug);
        init(LevelFilter::Info);
        log::debug!("logger smoke test");
    }
}
