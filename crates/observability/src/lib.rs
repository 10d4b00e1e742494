//! Tracing and logging setup shared by Depot binaries.

/// Initialize process-wide observability with defaults (`info`, JSON).
///
/// This is safe to call multiple times; subsequent calls become no-ops.
pub fn init() {
    tracing::init(tracing::LogOptions::default());
}

/// Initialize with explicit options (typically taken from configuration).
pub fn init_with(options: tracing::LogOptions) {
    tracing::init(options);
}

/// Tracing configuration (filters, layers).
pub mod tracing;
