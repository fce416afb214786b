//! Tracing and logging setup shared by the `tally` binaries.

/// Install the global tracing subscriber for a `tally` process.
///
/// JSON unless `TALLY_LOG_FORMAT=pretty`. Safe to call multiple times;
/// subsequent calls become no-ops.
pub fn init() {
    tracing::init(LogFormat::from_env());
}

/// Subscriber construction and output formats.
pub mod tracing;

pub use tracing::LogFormat;
