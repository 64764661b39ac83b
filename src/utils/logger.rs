use log::{Record, Level, Metadata, LevelFilter};

/// Custom logger implementation for CxrLogger.
struct CxrLogger;

impl log::Log for CxrLogger {
    /// Checks if the given log level is enabled.
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= Level::Info
    }

    /// Logs the record by printing it to stderr.
    ///
    /// Never called from interrupt handlers: handler paths are restricted
    /// to atomics and per-unit data.
    fn log(&self, record: &Record) {
        if self.enabled(record.metadata()) {
            eprintln!("[{}] {}", record.level(), record.args());
        }
    }

    /// Flushes the logger (no-op in this case).
    fn flush(&self) {}
}

/// The CxrLogger instance used for logging.
static LOGGER: CxrLogger = CxrLogger;

/// Initializes the logger. Safe to call more than once; if an embedding
/// program has already installed a sink, that sink is kept.
pub fn init() {
    let result = log::set_logger(&LOGGER).map(|()| log::set_max_level(LevelFilter::Info));

    match result {
        Ok(()) => log::debug!("logger initialized"),
        Err(_) => (), // another sink was installed first
    }
}
