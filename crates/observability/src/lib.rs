//! Process-wide logging setup shared by the operator and worker binaries.

/// Initialize tracing/logging for a binary.
///
/// Safe to call multiple times; subsequent calls become no-ops.
pub fn init(service: &'static str) {
    tracing::init();
    ::tracing::info!(service, "logging initialized");
}

/// Tracing subscriber configuration (filters, output format).
pub mod tracing;
