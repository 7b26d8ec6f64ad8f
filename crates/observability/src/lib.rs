//! Process-wide tracing setup for the job engine.

/// Tracing configuration (filters, output format).
pub mod tracing;

pub use self::tracing::LogFormat;

/// Initialize process-wide JSON logging.
///
/// This is safe to call multiple times; subsequent calls become no-ops.
pub fn init() {
    self::tracing::init(LogFormat::Json);
}

/// Initialize logging with an explicit output format.
pub fn init_with(format: LogFormat) {
    self::tracing::init(format);
}
