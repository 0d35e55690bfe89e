//! Process-wide tracing/logging setup shared by the binaries.

pub mod tracing;

pub use self::tracing::LogFormat;

/// Initialize tracing with JSON output, filtered by `RUST_LOG` (default
/// `info`).
///
/// Safe to call multiple times; subsequent calls are no-ops.
pub fn init() {
    tracing::init(LogFormat::Json);
}

/// Like [`init`], with a chosen output format.
pub fn init_with(format: LogFormat) {
    tracing::init(format);
}
