use crate::port::DebugCon;
use core::fmt::{self, Write};
use log::{Level, LevelFilter, Log, Metadata, Record, SetLoggerError};

/// `log` backend writing to the QEMU debug console.
///
/// Filtering uses the global [`log::max_level`], so the level can be changed
/// after installation with [`log::set_max_level`].
pub struct QemuLogger;

static LOGGER: QemuLogger = QemuLogger;

impl QemuLogger {
    /// Install the logger, letting records up to `max_level` through. Call
    /// once during early init.
    ///
    /// # Errors
    /// If another logger is already installed.
    pub fn init(max_level: LevelFilter) -> Result<(), SetLoggerError> {
        log::set_logger(&LOGGER)?;
        log::set_max_level(max_level);
        Ok(())
    }
}

impl Log for QemuLogger {
    fn enabled(&self, metadata: &Metadata<'_>) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record<'_>) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let _ = format_record(&mut DebugCon, record.level(), record.target(), record.args());
    }

    fn flush(&self) {}
}

/// Render one record as `[LEVEL] target: message` plus a newline.
///
/// # Errors
/// Whatever `w` reports.
pub fn format_record<W: Write + ?Sized>(
    w: &mut W,
    level: Level,
    target: &str,
    args: &fmt::Arguments<'_>,
) -> fmt::Result {
    writeln!(w, "[{level}] {target}: {args}")
}
