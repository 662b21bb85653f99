//! Tracing and logging setup shared by every callpipe process.

/// Initialize process-wide observability (tracing/logging).
///
/// This is safe to call multiple times; subsequent calls become no-ops.
pub fn init(service_name: &str) {
    tracing::init(service_name, tracing::LogFormat::from_env());
}

/// Human-readable logs captured by the test harness.
pub fn init_for_tests() {
    tracing::init_test();
}

/// Tracing configuration (filters, layers).
pub mod tracing;
