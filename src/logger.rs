//! Application-level `tracing` initialization.
//!
//! The library itself never installs a global subscriber (SPEC_FULL §1.1
//! "the library never installs a global subscriber — that is an
//! application concern"); this module is a convenience helper for the demo
//! binary and for embedding applications that want the teacher's
//! console-plus-rolling-file setup without hand-assembling it themselves.

use std::path::Path;

use tracing_subscriber::fmt::writer::MakeWriterExt;
use tracing_subscriber::EnvFilter;

/// Initializes a process-wide `tracing` subscriber: pretty-printed events on
/// stderr, plus a daily-rolling file under `logs/`. Log level is controlled
/// by `RUST_LOG`, defaulting to `info`.
///
/// Call this at most once, at the very start of `main`.
pub fn init() {
    init_with_log_dir("logs")
}

pub fn init_with_log_dir(log_dir: impl AsRef<Path>) {
    let file_appender = tracing_appender::rolling::daily(log_dir, "llm-admission-core.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
    // Leaking the guard is deliberate: it must outlive the subscriber, and
    // this helper is only ever called once for the lifetime of the process.
    std::mem::forget(guard);

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr.and(non_blocking))
        .init();

    tracing::info!("logger initialized");
}
