//! Tracing/logging setup shared by queue processes.

/// Initialize process-wide tracing with JSON output.
///
/// Safe to call multiple times; subsequent calls become no-ops.
pub fn init() {
    tracing::init("info");
}

/// Initialize with a default filter used when `RUST_LOG` is unset
/// (e.g. `"taskdrain_infra=debug,info"`).
pub fn init_with_default(directives: &str) {
    tracing::init(directives);
}

/// Test-harness friendly variant of [`init_with_default`].
pub fn init_for_tests(directives: &str) {
    tracing::init_for_tests(directives);
}

pub mod tracing;
