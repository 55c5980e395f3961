//! # Boot Logger
//!
//! A [`log`] backend writing one `[LEVEL] message` line per record to the boot console.
//! Every processor logs through the same spinlock-guarded sink, so lines from different
//! processors never interleave mid-line.

use core::fmt::{self, Write};

use log::{LevelFilter, Log, Metadata, Record};
use spin::{Mutex, Once};

use crate::error::{BootError, BootResult};

/// Console sink shared by all processors
pub type Sink = Mutex<dyn Write + Send>;

/// `log` backend over a boot console
pub struct BootLogger {
    sink: &'static Sink,
    level: LevelFilter,
}

impl BootLogger {
    /// Logger writing records at or above `level` to `sink`
    pub const fn new(sink: &'static Sink, level: LevelFilter) -> Self {
        Self { sink, level }
    }
}

impl fmt::Debug for BootLogger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BootLogger")
            .field("level", &self.level)
            .finish_non_exhaustive()
    }
}

impl Log for BootLogger {
    fn enabled(&self, metadata: &Metadata<'_>) -> bool {
        metadata.level() <= self.level
    }

    fn log(&self, record: &Record<'_>) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let mut sink = self.sink.lock();
        let _ = writeln!(sink, "[{}] {}", record.level(), record.args());
    }

    fn flush(&self) {}
}

static LOGGER: Once<BootLogger> = Once::new();

/// Install the boot logger as the global `log` backend
pub fn init(sink: &'static Sink, level: LevelFilter) -> BootResult<()> {
    let logger = LOGGER.call_once(|| BootLogger::new(sink, level));
    log::set_logger(logger).map_err(|_| BootError::Misconfigured("logger already installed"))?;
    log::set_max_level(level);
    Ok(())
}
